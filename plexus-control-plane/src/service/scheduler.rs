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

use plexus_api_grpc::proto::plexus::actor;
use plexus_api_grpc::proto::plexus::peer::v1 as peer_proto;
use plexus_common::model::{
    ComponentId, ErrorKind, FunctionFingerprint, FunctionSpec, ObjectRef, PeerId, ProviderId,
    SessionId, TaskId, WorkflowId,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::metrics;
use crate::model::{
    ComponentDescriptor, ComponentEntry, ComponentLaunch, ComponentState, ComponentView,
    LedgerSnapshot, TaskCompletion,
};
use crate::service::ledger::{LedgerError, ResourceLedger};
use crate::service::peers::{PeerCallError, PeerLayer};
use crate::service::pool::ComponentPool;
use crate::service::provider::{ProviderError, ProviderRegistry};
use crate::service::router::{Router, RouterError};
use crate::service::store::ObjectStore;
use crate::Endpoints;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no provider admits the request")]
    NoCapacity,
    #[error("cold start failed: {0}")]
    ColdStartFailed(String),
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),
    #[error("invocation exceeded {0:?}")]
    InvocationTimeout(Duration),
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),
    #[error("cancelled")]
    Cancelled,
    #[error("function failed: {0}")]
    Application(String),
    #[error("internal scheduling error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::NoCapacity => ErrorKind::NoCapacity,
            DispatchError::ColdStartFailed(_) => ErrorKind::ColdStartFailed,
            DispatchError::WorkerCrashed(_) => ErrorKind::WorkerCrashed,
            DispatchError::InvocationTimeout(_) => ErrorKind::Timeout,
            DispatchError::PeerUnreachable(_) => ErrorKind::PeerUnreachable,
            DispatchError::Cancelled => ErrorKind::Cancelled,
            // A function-raised error travels as worker_crashed but is
            // never retried (see is_transient).
            DispatchError::Application(_) => ErrorKind::WorkerCrashed,
            DispatchError::Internal(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchError::NoCapacity
                | DispatchError::ColdStartFailed(_)
                | DispatchError::WorkerCrashed(_)
                | DispatchError::PeerUnreachable(_)
        )
    }

    pub fn from_kind(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::NoCapacity => DispatchError::NoCapacity,
            ErrorKind::ColdStartFailed => DispatchError::ColdStartFailed(message),
            ErrorKind::WorkerCrashed => DispatchError::WorkerCrashed(message),
            ErrorKind::Timeout => DispatchError::InvocationTimeout(Duration::ZERO),
            ErrorKind::PeerUnreachable => DispatchError::PeerUnreachable(message),
            ErrorKind::Cancelled => DispatchError::Cancelled,
            _ => DispatchError::Application(message),
        }
    }
}

/// One ready task as handed over by the workflow executor.
#[derive(Debug, Clone)]
pub struct TaskDispatch {
    pub workflow_id: WorkflowId,
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub function: Arc<FunctionSpec>,
    pub args: Vec<(String, ObjectRef)>,
    pub timeout: Duration,
}

/// A task arriving from a sibling peer through the Dispatch RPC.
#[derive(Debug, Clone)]
pub struct RemoteDispatch {
    pub session_id: SessionId,
    pub workflow_id: WorkflowId,
    pub task_id: TaskId,
    pub function: FunctionSpec,
    pub args: Vec<(String, ObjectRef)>,
    pub provider_hint: Option<ProviderId>,
    pub reply_to: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Placement {
    Reuse {
        component: ComponentId,
    },
    ColdStart {
        provider: ProviderId,
    },
    Remote {
        peer: PeerId,
        provider: ProviderId,
    },
    NoCapacity,
}

struct PlacementInputs<'a> {
    resources: &'a plexus_common::model::Resources,
    /// (source peer, byte size) per input; local objects carry the local
    /// peer id.
    input_sources: Vec<(PeerId, u64)>,
    local_peer: PeerId,
    allow_remote: bool,
}

/// Picks a component for one ready task: warm reuse first, then a scored
/// cold start, with cross-peer placement through the peer layer. All
/// decisions are deterministic given a ledger snapshot.
pub struct Scheduler {
    ledger: Arc<ResourceLedger>,
    pool: Arc<ComponentPool>,
    router: Arc<Router>,
    providers: Arc<ProviderRegistry>,
    peers: Arc<PeerLayer>,
    store: Arc<ObjectStore>,
    endpoints: Arc<Endpoints>,
    config: SchedulerConfig,
    /// Rolling cold-start latency per provider, seconds.
    cold_start_secs: Mutex<HashMap<ProviderId, f64>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<ResourceLedger>,
        pool: Arc<ComponentPool>,
        router: Arc<Router>,
        providers: Arc<ProviderRegistry>,
        peers: Arc<PeerLayer>,
        store: Arc<ObjectStore>,
        endpoints: Arc<Endpoints>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            ledger,
            pool,
            router,
            providers,
            peers,
            store,
            endpoints,
            config,
            cold_start_secs: Mutex::new(HashMap::new()),
        }
    }

    /// Dispatches one task to completion. Inside the configured polling
    /// window a capacity shortage is waited out (backpressure); after it,
    /// `no_capacity` goes back to the executor as a transient error.
    pub async fn dispatch(&self, ctx: &TaskDispatch) -> Result<TaskCompletion, DispatchError> {
        self.dispatch_inner(ctx, true).await
    }

    /// Same, but confined to this peer's own subtree; used for tasks that
    /// arrived via peer dispatch so placement never ping-pongs.
    pub async fn dispatch_local(&self, ctx: &TaskDispatch) -> Result<TaskCompletion, DispatchError> {
        self.dispatch_inner(ctx, false).await
    }

    async fn dispatch_inner(
        &self,
        ctx: &TaskDispatch,
        allow_remote: bool,
    ) -> Result<TaskCompletion, DispatchError> {
        let deadline = Instant::now() + self.config.no_capacity_poll_window;
        loop {
            match self.try_dispatch(ctx, allow_remote).await {
                Err(DispatchError::NoCapacity) if Instant::now() < deadline => {
                    tokio::time::sleep(self.config.no_capacity_poll_interval).await;
                }
                other => return other,
            }
        }
    }

    async fn try_dispatch(
        &self,
        ctx: &TaskDispatch,
        allow_remote: bool,
    ) -> Result<TaskCompletion, DispatchError> {
        let fingerprint = ctx.function.fingerprint();

        // A raced checkout (another task claimed the chosen component
        // between snapshot and claim) re-places a bounded number of times.
        for _ in 0..3 {
            let placement = self.place(&fingerprint, ctx, allow_remote);
            match placement {
                Placement::Reuse { component } => {
                    match self
                        .pool
                        .checkout_idle(&fingerprint, Some(&component), ctx.session_id)
                    {
                        Some(entry) => return self.invoke_checked_out(entry, ctx).await,
                        None => continue,
                    }
                }
                Placement::ColdStart { provider } => {
                    let component = self
                        .cold_start_component(&provider, &ctx.function, &fingerprint)
                        .await?;
                    match self
                        .pool
                        .checkout_idle(&fingerprint, Some(&component), ctx.session_id)
                    {
                        Some(entry) => return self.invoke_checked_out(entry, ctx).await,
                        None => continue,
                    }
                }
                Placement::Remote { peer, provider } => {
                    return self.dispatch_remote(&peer, &provider, ctx).await;
                }
                Placement::NoCapacity => {
                    // Idle components of other functions hold committed
                    // reservations; reclaiming one may admit this request.
                    if self.reclaim_for(&ctx.function.resources).await {
                        continue;
                    }
                    return Err(DispatchError::NoCapacity);
                }
            }
        }
        Err(DispatchError::NoCapacity)
    }

    fn place(
        &self,
        fingerprint: &FunctionFingerprint,
        ctx: &TaskDispatch,
        allow_remote: bool,
    ) -> Placement {
        let snapshot = self.ledger.snapshot();
        let idle: Vec<ComponentView> = self
            .pool
            .views_for(fingerprint)
            .into_iter()
            .filter(|view| view.state == ComponentState::Idle)
            .collect();
        let local_peer = self.peers.local_peer_id().clone();
        let input_sources = ctx
            .args
            .iter()
            .map(|(_, reference)| {
                let source = reference
                    .source
                    .clone()
                    .unwrap_or_else(|| local_peer.clone());
                let size = self
                    .store
                    .size_of(&reference.id)
                    .unwrap_or(self.config.default_transfer_bytes);
                (source, size)
            })
            .collect();
        let inputs = PlacementInputs {
            resources: &ctx.function.resources,
            input_sources,
            local_peer,
            allow_remote,
        };
        let cold_start_secs = self.cold_start_secs.lock().unwrap().clone();
        place(
            &snapshot,
            &idle,
            &inputs,
            &self.config.weights,
            &cold_start_secs,
            self.config.default_cold_start_secs,
            |peer| self.peers.is_alive(peer),
        )
    }

    async fn reclaim_for(&self, request: &plexus_common::model::Resources) -> bool {
        let snapshot = self.ledger.snapshot();
        let hosts: Vec<ProviderId> = snapshot
            .providers
            .iter()
            .filter(|p| {
                p.owner.is_local()
                    && p.reachable
                    && p.capacity.covers_tags(request)
                    && request.fits_within(&p.capacity)
            })
            .map(|p| p.id.clone())
            .collect();
        if hosts.is_empty() {
            return false;
        }
        match self.pool.reclaim_idle_on(&hosts) {
            Some(evicted) => {
                debug!(component = %evicted.component_id, "Reclaimed idle component for capacity");
                self.ledger.release(evicted.reservation_id);
                let providers = self.providers.clone();
                tokio::spawn(async move {
                    providers.stop_component(&evicted.descriptor).await;
                });
                true
            }
            None => false,
        }
    }

    async fn invoke_checked_out(
        &self,
        entry: ComponentEntry,
        ctx: &TaskDispatch,
    ) -> Result<TaskCompletion, DispatchError> {
        let reply = self
            .router
            .invoke(&entry.id, &ctx.session_id, ctx.args.clone(), ctx.timeout)
            .await;
        match reply {
            Ok(reply) => {
                self.pool.checkin(&entry.id);
                match (reply.error, reply.result) {
                    (Some(message), _) => Err(DispatchError::Application(message)),
                    (None, Some(result)) => {
                        metrics::record_calc_latency(reply.calc_latency);
                        Ok(TaskCompletion {
                            result,
                            calc_latency: reply.calc_latency,
                        })
                    }
                    (None, None) => Err(DispatchError::Internal(
                        "invoke response carried neither result nor error".to_string(),
                    )),
                }
            }
            Err(RouterError::InvokeTimeout(duration)) => {
                Err(DispatchError::InvocationTimeout(duration))
            }
            Err(RouterError::ComponentUnavailable(id)) => {
                self.pool.mark_dead(&id);
                Err(DispatchError::WorkerCrashed(format!(
                    "component {id} lost its transport"
                )))
            }
            Err(err @ (RouterError::WorkerCrashed(_) | RouterError::QueueFull(_))) => {
                Err(DispatchError::WorkerCrashed(err.to_string()))
            }
            Err(err) => Err(DispatchError::Internal(err.to_string())),
        }
    }

    /// Reserve, boot, handshake. On success the component sits IDLE in the
    /// pool with a committed reservation.
    async fn cold_start_component(
        &self,
        provider_id: &ProviderId,
        function: &Arc<FunctionSpec>,
        fingerprint: &FunctionFingerprint,
    ) -> Result<ComponentId, DispatchError> {
        let reservation = match self.ledger.reserve(provider_id, &function.resources) {
            Ok(reservation) => reservation,
            Err(
                LedgerError::InsufficientCapacity(_) | LedgerError::ProviderUnreachable(_),
            ) => return Err(DispatchError::NoCapacity),
            Err(err) => return Err(DispatchError::Internal(err.to_string())),
        };

        let component_id = ComponentId::new_v4();
        let function_message = actor::Function {
            name: function.name.clone(),
            language: function.language.to_proto_i32(),
            pickled_body: function.body.to_vec(),
            requirements: function.requirements.clone(),
        };
        let ready_rx = self.router.expect_component(component_id, function_message);

        let Some(adapter) = self.providers.get(provider_id) else {
            self.router.abandon_expected(&component_id);
            self.ledger.release(reservation);
            return Err(DispatchError::ColdStartFailed(format!(
                "no adapter for provider {provider_id}"
            )));
        };

        // The STARTING entry goes into the pool before the sandbox boots so
        // the router's handshake always finds it.
        let started_at = Instant::now();
        self.pool.insert(ComponentEntry {
            id: component_id,
            provider_id: provider_id.clone(),
            fingerprint: fingerprint.clone(),
            language: function.language,
            state: ComponentState::Starting,
            reservation_id: reservation,
            descriptor: ComponentDescriptor {
                provider_id: provider_id.clone(),
                component_id,
                sandbox: String::new(),
            },
            session: None,
            started_at,
        });

        let launch = ComponentLaunch {
            component_id,
            language: function.language,
            resources: function.resources.clone(),
            transport_addr: self.endpoints.router_addr(),
            store_addr: self.endpoints.grpc_addr(),
        };

        let descriptor = match adapter.start_component(&launch).await {
            Ok(descriptor) => descriptor,
            Err(err) => {
                self.router.abandon_expected(&component_id);
                self.pool.remove(&component_id);
                self.ledger.release(reservation);
                return Err(match err {
                    ProviderError::Transient(message) => DispatchError::ColdStartFailed(message),
                    ProviderError::Failed(message) => DispatchError::ColdStartFailed(message),
                });
            }
        };
        self.pool.set_descriptor(&component_id, descriptor.clone());

        match timeout(self.config.cold_start_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                if let Err(err) = self.ledger.commit(reservation, component_id) {
                    warn!(component = %component_id, "Reservation commit failed: {err}");
                }
                let elapsed = started_at.elapsed();
                self.record_cold_start(provider_id, elapsed);
                metrics::record_cold_start_latency(elapsed);
                info!(component = %component_id, provider = %provider_id, "Component warm");
                Ok(component_id)
            }
            Ok(Ok(Err(err))) => {
                self.pool.remove(&component_id);
                self.ledger.release(reservation);
                self.providers.stop_component(&descriptor).await;
                Err(DispatchError::ColdStartFailed(err.to_string()))
            }
            Ok(Err(_)) => {
                self.pool.remove(&component_id);
                self.ledger.release(reservation);
                self.providers.stop_component(&descriptor).await;
                Err(DispatchError::ColdStartFailed(
                    "handshake waiter dropped".to_string(),
                ))
            }
            Err(_) => {
                self.router.abandon_expected(&component_id);
                self.pool.remove(&component_id);
                self.ledger.release(reservation);
                self.providers.stop_component(&descriptor).await;
                Err(DispatchError::ColdStartFailed(format!(
                    "component did not become ready within {:?}",
                    self.config.cold_start_timeout
                )))
            }
        }
    }

    fn record_cold_start(&self, provider_id: &ProviderId, elapsed: Duration) {
        let mut stats = self.cold_start_secs.lock().unwrap();
        let sample = elapsed.as_secs_f64();
        stats
            .entry(provider_id.clone())
            .and_modify(|current| *current = 0.7 * *current + 0.3 * sample)
            .or_insert(sample);
    }

    /// Best-effort warm pool for `replicas > 1` (a hint, never a gate):
    /// starts up to `count` extra components for the fingerprint.
    pub async fn prewarm(&self, function: Arc<FunctionSpec>, count: u32) {
        let fingerprint = function.fingerprint();
        for _ in 0..count {
            let snapshot = self.ledger.snapshot();
            let candidates: Vec<&crate::model::ProviderView> = snapshot
                .providers
                .iter()
                .filter(|p| p.owner.is_local() && p.admits(&function.resources))
                .collect();
            let Some(best) = candidates.iter().max_by(|a, b| {
                a.headroom_ratio()
                    .partial_cmp(&b.headroom_ratio())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.id.cmp(&a.id))
            }) else {
                break;
            };
            let provider_id = best.id.clone();
            match self
                .cold_start_component(&provider_id, &function, &fingerprint)
                .await
            {
                Ok(component) => {
                    debug!(component = %component, function = %function.name, "Prewarmed component")
                }
                Err(err) => {
                    debug!(function = %function.name, "Prewarm stopped: {err}");
                    break;
                }
            }
        }
    }

    async fn dispatch_remote(
        &self,
        peer: &PeerId,
        provider: &ProviderId,
        ctx: &TaskDispatch,
    ) -> Result<TaskCompletion, DispatchError> {
        let completion_rx = self
            .peers
            .register_completion(ctx.session_id, ctx.task_id.clone());

        let request = peer_proto::DispatchRequest {
            session_id: ctx.session_id.to_string(),
            workflow_id: ctx.workflow_id.to_string(),
            task_id: ctx.task_id.to_string(),
            function: Some(ctx.function.as_ref().clone().into()),
            args: ctx
                .args
                .iter()
                .map(|(param, value)| peer_proto::DispatchArg {
                    param: param.clone(),
                    value: Some(value.clone().into()),
                })
                .collect(),
            provider_id: provider.to_string(),
            reply_to: self.peers.local_address(),
            timeout_ms: ctx.timeout.as_millis() as u64,
        };

        match self.peers.dispatch(peer, request).await {
            Ok(()) => {}
            Err(PeerCallError::Refused(reason)) => {
                self.peers.cancel_completion(&ctx.session_id, &ctx.task_id);
                debug!(peer = %peer, "Dispatch refused: {reason}");
                return Err(DispatchError::NoCapacity);
            }
            Err(err) => {
                self.peers.cancel_completion(&ctx.session_id, &ctx.task_id);
                return Err(DispatchError::PeerUnreachable(err.to_string()));
            }
        }

        let wait_budget = ctx.timeout + self.config.remote_dispatch_slack;
        match timeout(wait_budget, completion_rx).await {
            Ok(Ok(completion)) => match completion.error {
                None => match completion.result {
                    Some(result) => Ok(TaskCompletion {
                        result,
                        calc_latency: completion.calc_latency,
                    }),
                    None => Err(DispatchError::Internal(
                        "remote completion carried neither result nor error".to_string(),
                    )),
                },
                Some((kind, message)) => Err(DispatchError::from_kind(kind, message)),
            },
            Ok(Err(_)) => Err(DispatchError::Internal(
                "completion waiter dropped".to_string(),
            )),
            Err(_) => {
                self.peers.cancel_completion(&ctx.session_id, &ctx.task_id);
                if self.peers.is_alive(peer) {
                    Err(DispatchError::InvocationTimeout(wait_budget))
                } else {
                    Err(DispatchError::PeerUnreachable(format!(
                        "peer {peer} died while executing the task"
                    )))
                }
            }
        }
    }

    /// Admission + execution of a task handed over by a sibling peer. A
    /// refusal tells the origin to treat it as `no_capacity`.
    pub fn handle_remote_dispatch(
        self: &Arc<Self>,
        dispatch: RemoteDispatch,
    ) -> Result<(), String> {
        let fingerprint = dispatch.function.fingerprint();
        let snapshot = self.ledger.snapshot();
        let has_capacity = snapshot
            .providers
            .iter()
            .any(|p| p.owner.is_local() && p.admits(&dispatch.function.resources));
        let has_warm = self
            .pool
            .views_for(&fingerprint)
            .iter()
            .any(|view| view.state == ComponentState::Idle);
        if !has_capacity && !has_warm {
            return Err("no local capacity for dispatched task".to_string());
        }
        if let Some(provider) = &dispatch.provider_hint {
            if snapshot.provider(provider).is_none() {
                debug!(provider = %provider, "Dispatch names an unknown provider, scheduling freely");
            }
        }

        let scheduler = self.clone();
        tokio::spawn(async move {
            let ctx = TaskDispatch {
                workflow_id: dispatch.workflow_id,
                session_id: dispatch.session_id,
                task_id: dispatch.task_id.clone(),
                function: Arc::new(dispatch.function),
                args: dispatch.args,
                timeout: dispatch.timeout,
            };
            let outcome = scheduler.dispatch_local(&ctx).await;

            let request = match &outcome {
                Ok(completion) => peer_proto::CompleteRequest {
                    session_id: ctx.session_id.to_string(),
                    task_id: ctx.task_id.to_string(),
                    result: Some(completion.result.clone().into()),
                    error: String::new(),
                    error_kind: String::new(),
                    calc_latency_ms: completion.calc_latency.as_millis() as u64,
                },
                Err(err) => peer_proto::CompleteRequest {
                    session_id: ctx.session_id.to_string(),
                    task_id: ctx.task_id.to_string(),
                    result: None,
                    error: err.to_string(),
                    error_kind: err.kind().as_str().to_string(),
                    calc_latency_ms: 0,
                },
            };
            if let Err(err) = scheduler.peers.complete(&dispatch.reply_to, request).await {
                warn!(reply_to = %dispatch.reply_to, "Failed to report completion: {err}");
            }
        });
        Ok(())
    }
}

/// Deterministic placement over one snapshot.
///
/// Pass 1 prefers warm capacity: the peer owning the majority of the input
/// bytes first (a remote majority owner is trusted to reuse its own warm
/// components), then idle local components with the providers' headroom as
/// tie-break. Pass 2 scores a cold start on every admissible provider:
///
/// `cost = alpha * (1 - headroom) + beta * transfer + gamma * cold_start`
///
/// with transfer and cold-start terms normalised across the candidate set,
/// lowest cost first and ties broken by provider id.
#[allow(clippy::too_many_arguments)]
fn place(
    snapshot: &LedgerSnapshot,
    idle_components: &[ComponentView],
    inputs: &PlacementInputs<'_>,
    weights: &crate::config::SchedulerWeights,
    cold_start_secs: &HashMap<ProviderId, f64>,
    default_cold_start_secs: f64,
    peer_alive: impl Fn(&PeerId) -> bool,
) -> Placement {
    // Majority input-source peer, by bytes; deterministic tie-break on id.
    let mut per_peer: HashMap<&PeerId, u64> = HashMap::new();
    for (source, size) in &inputs.input_sources {
        *per_peer.entry(source).or_default() += *size;
    }
    let majority = per_peer
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(peer, _)| (*peer).clone());

    if inputs.allow_remote {
        if let Some(majority_peer) = &majority {
            if majority_peer != &inputs.local_peer && peer_alive(majority_peer) {
                let mut owned: Vec<&crate::model::ProviderView> = snapshot
                    .providers
                    .iter()
                    .filter(|p| {
                        p.owner.peer() == Some(majority_peer) && p.admits(inputs.resources)
                    })
                    .collect();
                owned.sort_by(|a, b| {
                    b.headroom_ratio()
                        .partial_cmp(&a.headroom_ratio())
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.id.cmp(&b.id))
                });
                if let Some(best) = owned.first() {
                    return Placement::Remote {
                        peer: majority_peer.clone(),
                        provider: best.id.clone(),
                    };
                }
            }
        }
    }

    // Local warm reuse.
    let mut reusable: Vec<&ComponentView> = idle_components
        .iter()
        .filter(|view| view.state == ComponentState::Idle)
        .collect();
    reusable.sort_by(|a, b| {
        let headroom_a = snapshot
            .provider(&a.provider_id)
            .map(|p| p.headroom_ratio())
            .unwrap_or(0.0);
        let headroom_b = snapshot
            .provider(&b.provider_id)
            .map(|p| p.headroom_ratio())
            .unwrap_or(0.0);
        headroom_b
            .partial_cmp(&headroom_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.provider_id.cmp(&b.provider_id))
            .then_with(|| a.id.cmp(&b.id))
    });
    if let Some(best) = reusable.first() {
        return Placement::Reuse {
            component: best.id,
        };
    }

    // Cold-start pass.
    let candidates: Vec<&crate::model::ProviderView> = snapshot
        .providers
        .iter()
        .filter(|p| p.admits(inputs.resources))
        .filter(|p| {
            inputs.allow_remote
                || p.owner.is_local()
        })
        .filter(|p| match p.owner.peer() {
            Some(peer) => peer_alive(peer),
            None => true,
        })
        .collect();
    if candidates.is_empty() {
        return Placement::NoCapacity;
    }

    let transfer_for = |candidate: &crate::model::ProviderView| -> u64 {
        let provider_peer = candidate
            .owner
            .peer()
            .cloned()
            .unwrap_or_else(|| inputs.local_peer.clone());
        inputs
            .input_sources
            .iter()
            .filter(|(source, _)| source != &provider_peer)
            .map(|(_, size)| *size)
            .sum()
    };
    let max_transfer = candidates
        .iter()
        .map(|c| transfer_for(c))
        .max()
        .unwrap_or(0)
        .max(1);
    let max_cold = candidates
        .iter()
        .map(|c| {
            cold_start_secs
                .get(&c.id)
                .copied()
                .unwrap_or(default_cold_start_secs)
        })
        .fold(f64::MIN, f64::max)
        .max(f64::MIN_POSITIVE);

    let mut scored: Vec<(f64, &crate::model::ProviderView)> = candidates
        .into_iter()
        .map(|candidate| {
            let headroom = candidate.headroom_ratio();
            let transfer = transfer_for(candidate) as f64 / max_transfer as f64;
            let cold = cold_start_secs
                .get(&candidate.id)
                .copied()
                .unwrap_or(default_cold_start_secs)
                / max_cold;
            let cost =
                weights.alpha * (1.0 - headroom) + weights.beta * transfer + weights.gamma * cold;
            (cost, candidate)
        })
        .collect();
    scored.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.id.cmp(&b.1.id))
    });

    let (_, best) = scored.first().expect("non-empty candidate set");
    match best.owner.peer() {
        None => Placement::ColdStart {
            provider: best.id.clone(),
        },
        Some(peer) => Placement::Remote {
            peer: peer.clone(),
            provider: best.id.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use plexus_common::model::{ProviderKind, Resources};
    use test_r::test;

    use super::*;
    use crate::config::SchedulerWeights;
    use crate::model::{ProviderOwner, ProviderView};

    fn provider(id: &str, owner: ProviderOwner, allocated_millis: i64) -> ProviderView {
        ProviderView {
            id: ProviderId::new(id),
            kind: ProviderKind::ContainerHost,
            owner,
            capacity: Resources::new(1000, 1 << 30, 0),
            allocated: Resources::new(allocated_millis, 0, 0),
            reachable: true,
        }
    }

    fn inputs<'a>(
        resources: &'a Resources,
        sources: Vec<(PeerId, u64)>,
        allow_remote: bool,
    ) -> PlacementInputs<'a> {
        PlacementInputs {
            resources,
            input_sources: sources,
            local_peer: PeerId::new("peer-a"),
            allow_remote,
        }
    }

    #[test]
    fn warm_local_component_wins_over_cold_start() {
        let fingerprint = FunctionFingerprint("fp".to_string());
        let resources = Resources::new(100, 1024, 0);
        let snapshot = LedgerSnapshot {
            providers: vec![provider("prov-1", ProviderOwner::Local, 0)],
        };
        let component = ComponentId::new_v4();
        let idle = vec![ComponentView {
            id: component,
            provider_id: ProviderId::new("prov-1"),
            fingerprint: fingerprint.clone(),
            state: ComponentState::Idle,
        }];
        let placement = place(
            &snapshot,
            &idle,
            &inputs(&resources, vec![], true),
            &SchedulerWeights::default(),
            &HashMap::new(),
            1.0,
            |_| true,
        );
        assert_eq!(placement, Placement::Reuse { component });
    }

    #[test]
    fn cold_start_prefers_headroom_and_breaks_ties_by_id() {
        let resources = Resources::new(100, 1024, 0);
        let snapshot = LedgerSnapshot {
            providers: vec![
                provider("prov-b", ProviderOwner::Local, 500),
                provider("prov-a", ProviderOwner::Local, 0),
            ],
        };
        let placement = place(
            &snapshot,
            &[],
            &inputs(&resources, vec![], true),
            &SchedulerWeights::default(),
            &HashMap::new(),
            1.0,
            |_| true,
        );
        assert_eq!(
            placement,
            Placement::ColdStart {
                provider: ProviderId::new("prov-a")
            }
        );

        let snapshot_tied = LedgerSnapshot {
            providers: vec![
                provider("prov-b", ProviderOwner::Local, 0),
                provider("prov-a", ProviderOwner::Local, 0),
            ],
        };
        let placement = place(
            &snapshot_tied,
            &[],
            &inputs(&resources, vec![], true),
            &SchedulerWeights::default(),
            &HashMap::new(),
            1.0,
            |_| true,
        );
        assert_eq!(
            placement,
            Placement::ColdStart {
                provider: ProviderId::new("prov-a")
            }
        );
    }

    #[test]
    fn majority_remote_inputs_pull_the_task_to_their_peer() {
        let resources = Resources::new(100, 1024, 0);
        let peer_b = PeerId::new("peer-b");
        let snapshot = LedgerSnapshot {
            providers: vec![
                provider("prov-local", ProviderOwner::Local, 0),
                provider("prov-remote", ProviderOwner::Remote(peer_b.clone()), 0),
            ],
        };
        let placement = place(
            &snapshot,
            &[],
            &inputs(
                &resources,
                vec![(peer_b.clone(), 4096), (PeerId::new("peer-a"), 10)],
                true,
            ),
            &SchedulerWeights::default(),
            &HashMap::new(),
            1.0,
            |_| true,
        );
        assert_eq!(
            placement,
            Placement::Remote {
                peer: peer_b,
                provider: ProviderId::new("prov-remote")
            }
        );
    }

    #[test]
    fn local_only_placement_ignores_remote_providers() {
        let resources = Resources::new(100, 1024, 0);
        let peer_b = PeerId::new("peer-b");
        let snapshot = LedgerSnapshot {
            providers: vec![provider(
                "prov-remote",
                ProviderOwner::Remote(peer_b.clone()),
                0,
            )],
        };
        let placement = place(
            &snapshot,
            &[],
            &inputs(&resources, vec![(peer_b, 4096)], false),
            &SchedulerWeights::default(),
            &HashMap::new(),
            1.0,
            |_| true,
        );
        assert_eq!(placement, Placement::NoCapacity);
    }

    #[test]
    fn tag_requirements_filter_providers() {
        let resources = Resources::new(100, 1024, 0).with_tags(vec!["gpu".to_string()]);
        let mut tagged = provider("prov-tagged", ProviderOwner::Local, 0);
        tagged.capacity.tags.insert("gpu".to_string());
        let snapshot = LedgerSnapshot {
            providers: vec![provider("prov-plain", ProviderOwner::Local, 0), tagged],
        };
        let placement = place(
            &snapshot,
            &[],
            &inputs(&resources, vec![], true),
            &SchedulerWeights::default(),
            &HashMap::new(),
            1.0,
            |_| true,
        );
        assert_eq!(
            placement,
            Placement::ColdStart {
                provider: ProviderId::new("prov-tagged")
            }
        );
    }
}
