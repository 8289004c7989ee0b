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

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use plexus_common::model::{
    ComponentId, PeerId, ProviderId, ProviderKind, ReservationId, Resources,
};
use tracing::{debug, info, warn};

use crate::config::LedgerConfig;
use crate::model::{LedgerSnapshot, ProviderOwner, ProviderView};
use crate::repo::provider::{ProviderRecord, ProviderRepo};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("unknown provider: {0}")]
    ProviderNotFound(ProviderId),
    #[error("provider {0} is not owned by this peer")]
    NotOwned(ProviderId),
    #[error("provider {0} is unreachable")]
    ProviderUnreachable(ProviderId),
    #[error("insufficient capacity on provider {0}")]
    InsufficientCapacity(ProviderId),
    #[error("unknown reservation: {0}")]
    ReservationNotFound(ReservationId),
    #[error("internal ledger error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone)]
struct ProviderEntry {
    kind: ProviderKind,
    address: String,
    owner: ProviderOwner,
    capacity: Resources,
    /// Sum of live reservations for local providers; the gossiped number
    /// for remote ones.
    allocated: Resources,
    last_heartbeat: Option<Instant>,
    reachable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReservationState {
    Pending { expires_at: Instant },
    Committed(ComponentId),
}

#[derive(Debug, Clone)]
struct Reservation {
    provider_id: ProviderId,
    resources: Resources,
    state: ReservationState,
}

#[derive(Default)]
struct LedgerState {
    providers: HashMap<ProviderId, ProviderEntry>,
    reservations: HashMap<ReservationId, Reservation>,
}

#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub released_reservations: Vec<ReservationId>,
    /// Providers newly declared dead; the owner of their components must
    /// mark those components DEAD.
    pub dead_providers: Vec<ProviderId>,
    /// Components whose reservations were force-released with their
    /// provider.
    pub orphaned_components: Vec<ComponentId>,
}

/// The single writer for allocation numbers. `reserve` is linearisable per
/// provider: every mutation happens under one lock, and `allocated` can
/// never exceed `capacity`.
pub struct ResourceLedger {
    state: Mutex<LedgerState>,
    repo: Arc<dyn ProviderRepo>,
    config: LedgerConfig,
}

impl ResourceLedger {
    pub async fn new(
        config: LedgerConfig,
        repo: Arc<dyn ProviderRepo>,
    ) -> Result<Self, LedgerError> {
        let mut providers = HashMap::new();
        let records = repo
            .get_all()
            .await
            .map_err(|err| LedgerError::Internal(err.to_string()))?;
        for record in records {
            debug!(provider = %record.provider_id, "Recovered provider from catalog");
            providers.insert(
                record.provider_id.clone(),
                ProviderEntry {
                    kind: record.kind,
                    address: record.address,
                    owner: ProviderOwner::Local,
                    capacity: record.capacity,
                    allocated: Resources::default(),
                    last_heartbeat: None,
                    reachable: false,
                },
            );
        }

        Ok(Self {
            state: Mutex::new(LedgerState {
                providers,
                reservations: HashMap::new(),
            }),
            repo,
            config,
        })
    }

    /// Registers (or re-registers) a provider owned by this peer and
    /// persists it to the catalog.
    pub async fn register_local_provider(
        &self,
        provider_id: ProviderId,
        kind: ProviderKind,
        address: String,
        capacity: Resources,
    ) -> Result<(), LedgerError> {
        {
            let mut state = self.state.lock().unwrap();
            let entry = state
                .providers
                .entry(provider_id.clone())
                .or_insert_with(|| ProviderEntry {
                    kind,
                    address: address.clone(),
                    owner: ProviderOwner::Local,
                    capacity: capacity.clone(),
                    allocated: Resources::default(),
                    last_heartbeat: Some(Instant::now()),
                    reachable: true,
                });
            entry.kind = kind;
            entry.address = address.clone();
            entry.owner = ProviderOwner::Local;
            entry.capacity = capacity.clone();
            entry.last_heartbeat = Some(Instant::now());
            entry.reachable = true;
        }

        self.repo
            .upsert(&ProviderRecord {
                provider_id: provider_id.clone(),
                kind,
                address,
                capacity,
            })
            .await
            .map_err(|err| LedgerError::Internal(err.to_string()))?;

        info!(provider = %provider_id, "Registered local provider");
        Ok(())
    }

    /// Capacity report from a provider adapter heartbeat.
    pub fn report_capacity(&self, provider_id: &ProviderId, capacity: Resources) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.providers.get_mut(provider_id) {
            entry.capacity = capacity;
            entry.last_heartbeat = Some(Instant::now());
            entry.reachable = true;
        }
    }

    /// Replaces this peer's view of the providers owned by `peer`.
    /// Entries disappear when the sender stops listing them.
    pub fn merge_peer_catalog(
        &self,
        peer: &PeerId,
        providers: Vec<(ProviderId, ProviderKind, Resources, Resources)>,
    ) {
        let mut state = self.state.lock().unwrap();
        let owner = ProviderOwner::Remote(peer.clone());
        // Entries previously owned by this peer that are no longer
        // advertised disappear from the merged view.
        let advertised: Vec<ProviderId> = providers.iter().map(|(id, _, _, _)| id.clone()).collect();
        state
            .providers
            .retain(|id, entry| entry.owner != owner || advertised.contains(id));
        for (provider_id, kind, capacity, allocated) in providers {
            let entry = state
                .providers
                .entry(provider_id)
                .or_insert_with(|| ProviderEntry {
                    kind,
                    address: String::new(),
                    owner: owner.clone(),
                    capacity: capacity.clone(),
                    allocated: allocated.clone(),
                    last_heartbeat: Some(Instant::now()),
                    reachable: true,
                });
            entry.kind = kind;
            entry.owner = owner.clone();
            entry.capacity = capacity;
            entry.allocated = allocated;
            entry.last_heartbeat = Some(Instant::now());
            entry.reachable = true;
        }
    }

    /// Called when the peer layer declares a peer dead: its providers
    /// become unreachable in this ledger view.
    pub fn drop_peer(&self, peer: &PeerId) {
        let mut state = self.state.lock().unwrap();
        let owner = ProviderOwner::Remote(peer.clone());
        for entry in state.providers.values_mut() {
            if entry.owner == owner {
                entry.reachable = false;
            }
        }
    }

    /// Atomically increments `allocated` on a local provider; rejects any
    /// reservation that would push it past capacity.
    pub fn reserve(
        &self,
        provider_id: &ProviderId,
        request: &Resources,
    ) -> Result<ReservationId, LedgerError> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .providers
            .get_mut(provider_id)
            .ok_or_else(|| LedgerError::ProviderNotFound(provider_id.clone()))?;
        if !entry.owner.is_local() {
            return Err(LedgerError::NotOwned(provider_id.clone()));
        }
        if !entry.reachable {
            return Err(LedgerError::ProviderUnreachable(provider_id.clone()));
        }
        if !entry.capacity.covers_tags(request) {
            return Err(LedgerError::InsufficientCapacity(provider_id.clone()));
        }
        let after = entry.allocated.plus(request);
        if !after.fits_within(&entry.capacity) {
            return Err(LedgerError::InsufficientCapacity(provider_id.clone()));
        }
        entry.allocated = after;

        let reservation_id = ReservationId::new_v4();
        state.reservations.insert(
            reservation_id,
            Reservation {
                provider_id: provider_id.clone(),
                resources: request.clone(),
                state: ReservationState::Pending {
                    expires_at: Instant::now() + self.config.reservation_timeout,
                },
            },
        );
        debug!(provider = %provider_id, reservation = %reservation_id, "Reserved {request}");
        Ok(reservation_id)
    }

    /// Associates a reservation with a live component; no capacity change.
    pub fn commit(
        &self,
        reservation_id: ReservationId,
        component_id: ComponentId,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().unwrap();
        let reservation = state
            .reservations
            .get_mut(&reservation_id)
            .ok_or(LedgerError::ReservationNotFound(reservation_id))?;
        reservation.state = ReservationState::Committed(component_id);
        Ok(())
    }

    /// Decrements `allocated` by the reserved amount. Idempotent: releasing
    /// an unknown or already-released reservation is a no-op.
    pub fn release(&self, reservation_id: ReservationId) {
        let mut state = self.state.lock().unwrap();
        if let Some(reservation) = state.reservations.remove(&reservation_id) {
            if let Some(entry) = state.providers.get_mut(&reservation.provider_id) {
                entry.allocated = entry.allocated.minus(&reservation.resources);
            }
        }
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.lock().unwrap();
        let providers = state
            .providers
            .iter()
            .map(|(id, entry)| ProviderView {
                id: id.clone(),
                kind: entry.kind,
                owner: entry.owner.clone(),
                capacity: entry.capacity.clone(),
                allocated: entry.allocated.clone(),
                reachable: entry.reachable,
            })
            .collect();
        LedgerSnapshot { providers }
    }

    /// The providers this peer owns, as gossiped to siblings.
    pub fn local_catalog(&self) -> Vec<ProviderView> {
        self.snapshot()
            .providers
            .into_iter()
            .filter(|p| p.owner.is_local())
            .collect()
    }

    pub fn provider_address(&self, provider_id: &ProviderId) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.providers.get(provider_id).map(|e| e.address.clone())
    }

    /// Releases pending reservations past their timeout and declares
    /// providers dead after `dead_provider_timeout` without a heartbeat.
    /// Dead local providers have all their reservations force-released.
    pub fn sweep(&self) -> SweepOutcome {
        let now = Instant::now();
        let mut outcome = SweepOutcome::default();
        let mut state = self.state.lock().unwrap();

        let expired: Vec<ReservationId> = state
            .reservations
            .iter()
            .filter_map(|(id, r)| match r.state {
                ReservationState::Pending { expires_at } if expires_at <= now => Some(*id),
                _ => None,
            })
            .collect();
        for id in expired {
            if let Some(reservation) = state.reservations.remove(&id) {
                if let Some(entry) = state.providers.get_mut(&reservation.provider_id) {
                    entry.allocated = entry.allocated.minus(&reservation.resources);
                }
                warn!(reservation = %id, "Released expired reservation");
                outcome.released_reservations.push(id);
            }
        }

        let dead: Vec<ProviderId> = state
            .providers
            .iter()
            .filter(|(_, entry)| {
                entry.owner.is_local()
                    && entry.reachable
                    && entry
                        .last_heartbeat
                        .map(|t| now.duration_since(t) > self.config.dead_provider_timeout)
                        .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for provider_id in dead {
            warn!(provider = %provider_id, "Provider missed heartbeat budget, declaring dead");
            if let Some(entry) = state.providers.get_mut(&provider_id) {
                entry.reachable = false;
            }
            let doomed: Vec<ReservationId> = state
                .reservations
                .iter()
                .filter(|(_, r)| r.provider_id == provider_id)
                .map(|(id, _)| *id)
                .collect();
            for id in doomed {
                if let Some(reservation) = state.reservations.remove(&id) {
                    if let Some(entry) = state.providers.get_mut(&reservation.provider_id) {
                        entry.allocated = entry.allocated.minus(&reservation.resources);
                    }
                    if let ReservationState::Committed(component) = reservation.state {
                        outcome.orphaned_components.push(component);
                    }
                    outcome.released_reservations.push(id);
                }
            }
            outcome.dead_providers.push(provider_id);
        }

        outcome
    }

    pub fn sweep_interval(&self) -> Duration {
        self.config.sweep_interval
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::repo::provider::NoopProviderRepo;

    fn test_config() -> LedgerConfig {
        LedgerConfig {
            reservation_timeout: Duration::from_secs(30),
            dead_provider_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            db: crate::config::LedgerDbConfig::default(),
        }
    }

    async fn ledger_with_provider(capacity: Resources) -> ResourceLedger {
        let ledger = ResourceLedger::new(test_config(), Arc::new(NoopProviderRepo))
            .await
            .unwrap();
        ledger
            .register_local_provider(
                ProviderId::new("prov-1"),
                ProviderKind::ContainerHost,
                "127.0.0.1:0".to_string(),
                capacity,
            )
            .await
            .unwrap();
        ledger
    }

    #[test]
    async fn reserve_never_oversubscribes() {
        let ledger = ledger_with_provider(Resources::new(1000, 1024, 1)).await;
        let provider = ProviderId::new("prov-1");

        let first = ledger.reserve(&provider, &Resources::new(600, 512, 0)).unwrap();
        let second = ledger.reserve(&provider, &Resources::new(400, 512, 1)).unwrap();
        assert_ne!(first, second);

        let err = ledger
            .reserve(&provider, &Resources::new(1, 0, 0))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientCapacity(_)));

        let view = ledger.snapshot();
        let p = view.provider(&provider).unwrap();
        assert!(p.allocated.fits_within(&p.capacity));
    }

    #[test]
    async fn release_is_idempotent() {
        let ledger = ledger_with_provider(Resources::new(1000, 1024, 0)).await;
        let provider = ProviderId::new("prov-1");

        let reservation = ledger
            .reserve(&provider, &Resources::new(1000, 1024, 0))
            .unwrap();
        ledger.release(reservation);
        ledger.release(reservation);

        let view = ledger.snapshot();
        let p = view.provider(&provider).unwrap();
        assert_eq!(p.allocated.millicpu, 0);
        assert_eq!(p.allocated.memory_bytes, 0);
        assert!(ledger
            .reserve(&provider, &Resources::new(1000, 1024, 0))
            .is_ok());
    }

    #[test]
    async fn tag_mismatch_rejects_reservation() {
        let capacity = Resources::new(1000, 1024, 0).with_tags(vec!["x86".to_string()]);
        let ledger = ledger_with_provider(capacity).await;
        let provider = ProviderId::new("prov-1");

        let tagged = Resources::new(10, 10, 0).with_tags(vec!["arm64".to_string()]);
        assert!(matches!(
            ledger.reserve(&provider, &tagged),
            Err(LedgerError::InsufficientCapacity(_))
        ));
    }

    #[test]
    async fn remote_providers_cannot_be_reserved() {
        let ledger = ResourceLedger::new(test_config(), Arc::new(NoopProviderRepo))
            .await
            .unwrap();
        let peer = PeerId::new("peer-b");
        ledger.merge_peer_catalog(
            &peer,
            vec![(
                ProviderId::new("remote-1"),
                ProviderKind::Cluster,
                Resources::new(1000, 1024, 0),
                Resources::default(),
            )],
        );

        assert!(matches!(
            ledger.reserve(&ProviderId::new("remote-1"), &Resources::new(1, 1, 0)),
            Err(LedgerError::NotOwned(_))
        ));
    }
}
