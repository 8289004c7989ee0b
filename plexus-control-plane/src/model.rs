// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

use plexus_common::model::{
    ComponentId, FunctionFingerprint, Language, ObjectRef, PeerId, ProviderId, ProviderKind,
    ReservationId, Resources, SessionId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentState {
    /// Provisioned on a provider, handshake not finished.
    Starting,
    Idle,
    Busy,
    /// No longer accepts work; evicted once the outstanding reply arrives
    /// or the transport closes.
    Draining,
    Dead,
}

impl Display for ComponentState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComponentState::Starting => "starting",
            ComponentState::Idle => "idle",
            ComponentState::Busy => "busy",
            ComponentState::Draining => "draining",
            ComponentState::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

/// Opaque handle to whatever the provider adapter created (container id,
/// pod name, task handle). The core never interprets `sandbox`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentDescriptor {
    pub provider_id: ProviderId,
    pub component_id: ComponentId,
    pub sandbox: String,
}

#[derive(Debug, Clone)]
pub struct ComponentEntry {
    pub id: ComponentId,
    pub provider_id: ProviderId,
    pub fingerprint: FunctionFingerprint,
    pub language: Language,
    pub state: ComponentState,
    pub reservation_id: ReservationId,
    pub descriptor: ComponentDescriptor,
    /// Session of the workflow currently invoking through this component.
    pub session: Option<SessionId>,
    pub started_at: Instant,
}

/// Read-only snapshot row used by the scheduler's reuse pass.
#[derive(Debug, Clone)]
pub struct ComponentView {
    pub id: ComponentId,
    pub provider_id: ProviderId,
    pub fingerprint: FunctionFingerprint,
    pub state: ComponentState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderOwner {
    Local,
    Remote(PeerId),
}

impl ProviderOwner {
    pub fn is_local(&self) -> bool {
        matches!(self, ProviderOwner::Local)
    }

    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            ProviderOwner::Local => None,
            ProviderOwner::Remote(peer) => Some(peer),
        }
    }
}

/// One provider as seen through a consistent ledger snapshot.
#[derive(Debug, Clone)]
pub struct ProviderView {
    pub id: ProviderId,
    pub kind: ProviderKind,
    pub owner: ProviderOwner,
    pub capacity: Resources,
    pub allocated: Resources,
    pub reachable: bool,
}

impl ProviderView {
    pub fn residual(&self) -> Resources {
        self.capacity.minus(&self.allocated)
    }

    pub fn headroom_ratio(&self) -> f64 {
        self.capacity.headroom_ratio(&self.allocated)
    }

    pub fn admits(&self, request: &Resources) -> bool {
        self.reachable && request.fits_within(&self.residual()) && self.capacity.covers_tags(request)
    }
}

#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    pub providers: Vec<ProviderView>,
}

impl LedgerSnapshot {
    pub fn provider(&self, id: &ProviderId) -> Option<&ProviderView> {
        self.providers.iter().find(|p| &p.id == id)
    }
}

/// Successful terminal outcome of one task attempt.
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub result: ObjectRef,
    pub calc_latency: Duration,
}

/// Everything a provider adapter needs to boot one component. The worker
/// runtime inside the sandbox reads these through injected environment
/// variables.
#[derive(Debug, Clone)]
pub struct ComponentLaunch {
    pub component_id: ComponentId,
    pub language: Language,
    pub resources: Resources,
    pub transport_addr: String,
    pub store_addr: String,
}

#[derive(Debug, Clone)]
pub struct CapacityReport {
    pub capacity: Resources,
}
