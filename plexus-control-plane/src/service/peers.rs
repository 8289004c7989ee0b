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
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use plexus_api_grpc::proto::plexus::peer::v1 as peer_proto;
use plexus_api_grpc::proto::plexus::peer::v1::peer_service_client::PeerServiceClient;
use plexus_common::model::{
    EncodedValue, ObjectId, ObjectRef, PeerId, ProviderKind, SessionId, StreamChunk, TaskId,
};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use crate::config::PeerMeshConfig;
use crate::service::ledger::ResourceLedger;

#[derive(Debug, thiserror::Error)]
pub enum PeerCallError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("dispatch refused: {0}")]
    Refused(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Terminal outcome of a task executed on a remote peer, delivered through
/// the Complete callback.
#[derive(Debug, Clone)]
pub struct RemoteCompletion {
    pub result: Option<ObjectRef>,
    pub error: Option<(plexus_common::model::ErrorKind, String)>,
    pub calc_latency: Duration,
}

struct PeerState {
    address: String,
    channel: Option<Channel>,
    last_seen: Option<Instant>,
    catalog_version: u64,
    alive: bool,
}

/// The all-to-all control-plane mesh: pushes this peer's provider catalog,
/// merges the siblings' catalogs into the ledger view, tracks liveness, and
/// carries cross-peer dispatch and object traffic.
pub struct PeerLayer {
    local_id: PeerId,
    local_address: RwLock<String>,
    peers: Mutex<HashMap<PeerId, PeerState>>,
    completions: Mutex<HashMap<(SessionId, TaskId), oneshot::Sender<RemoteCompletion>>>,
    catalog_version: AtomicU64,
    ledger: Arc<ResourceLedger>,
    config: PeerMeshConfig,
}

impl PeerLayer {
    pub fn new(local_id: PeerId, config: PeerMeshConfig, ledger: Arc<ResourceLedger>) -> Self {
        let mut peers = HashMap::new();
        for seed in &config.static_peers {
            peers.insert(
                PeerId::new(seed.peer_id.clone()),
                PeerState {
                    address: seed.address.clone(),
                    channel: None,
                    last_seen: None,
                    catalog_version: 0,
                    alive: false,
                },
            );
        }
        Self {
            local_id,
            local_address: RwLock::new(String::new()),
            peers: Mutex::new(peers),
            completions: Mutex::new(HashMap::new()),
            catalog_version: AtomicU64::new(0),
            ledger,
            config,
        }
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn local_address(&self) -> String {
        self.local_address.read().unwrap().clone()
    }

    /// Called once the gRPC listener is bound; the advertised address must
    /// carry the real port, which is only known after the bind.
    pub fn set_local_address(&self, address: String) {
        *self.local_address.write().unwrap() = address;
    }

    pub fn is_alive(&self, peer: &PeerId) -> bool {
        self.peers
            .lock()
            .unwrap()
            .get(peer)
            .map(|p| p.alive)
            .unwrap_or(false)
    }

    pub fn live_peers(&self) -> Vec<PeerId> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, state)| state.alive)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn channel_for(&self, peer: &PeerId) -> Result<Channel, PeerCallError> {
        let mut peers = self.peers.lock().unwrap();
        let state = peers
            .get_mut(peer)
            .ok_or_else(|| PeerCallError::Unreachable(format!("unknown peer {peer}")))?;
        if let Some(channel) = &state.channel {
            return Ok(channel.clone());
        }
        let channel = channel_to(&state.address)?;
        state.channel = Some(channel.clone());
        Ok(channel)
    }

    fn build_catalog(&self) -> peer_proto::ProviderCatalog {
        let version = self.catalog_version.fetch_add(1, Ordering::SeqCst) + 1;
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let providers = self
            .ledger
            .local_catalog()
            .into_iter()
            .map(|view| peer_proto::ProviderSummary {
                provider_id: view.id.to_string(),
                kind: peer_proto::ProviderKind::from(view.kind) as i32,
                capacity: Some(view.capacity.into()),
                allocated: Some(view.allocated.into()),
                last_updated_ms: now_ms,
            })
            .collect();
        peer_proto::ProviderCatalog {
            peer_id: self.local_id.to_string(),
            peer_address: self.local_address(),
            version,
            providers,
        }
    }

    /// Periodic catalog push to every known sibling.
    pub fn run_gossip(self: &Arc<Self>, join_set: &mut JoinSet<Result<(), anyhow::Error>>) {
        let layer = self.clone();
        join_set.spawn(async move {
            let mut ticker = tokio::time::interval(layer.config.gossip_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let catalog = layer.build_catalog();
                let targets: Vec<(PeerId, String)> = {
                    let peers = layer.peers.lock().unwrap();
                    peers
                        .iter()
                        .map(|(id, state)| (id.clone(), state.address.clone()))
                        .collect()
                };
                for (peer_id, _) in targets {
                    let request = peer_proto::HeartbeatRequest {
                        catalog: Some(catalog.clone()),
                    };
                    match layer.channel_for(&peer_id) {
                        Ok(channel) => {
                            let mut client = PeerServiceClient::new(channel);
                            if let Err(status) = client.heartbeat(request).await {
                                debug!(peer = %peer_id, "Heartbeat failed: {status}");
                            }
                        }
                        Err(err) => debug!(peer = %peer_id, "Heartbeat skipped: {err}"),
                    }
                }
            }
        });
    }

    /// Declares peers dead after `miss_threshold` silent gossip intervals
    /// and drops their providers from the merged ledger view.
    pub fn run_liveness(self: &Arc<Self>, join_set: &mut JoinSet<Result<(), anyhow::Error>>) {
        let layer = self.clone();
        join_set.spawn(async move {
            let mut ticker = tokio::time::interval(layer.config.gossip_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let budget = layer.config.gossip_interval * layer.config.miss_threshold;
                let newly_dead: Vec<PeerId> = {
                    let mut peers = layer.peers.lock().unwrap();
                    let mut dead = Vec::new();
                    for (id, state) in peers.iter_mut() {
                        let silent = state
                            .last_seen
                            .map(|seen| seen.elapsed() > budget)
                            .unwrap_or(false);
                        if state.alive && silent {
                            state.alive = false;
                            dead.push(id.clone());
                        }
                    }
                    dead
                };
                for peer in newly_dead {
                    warn!(peer = %peer, "Peer missed {} gossip intervals, declaring dead", layer.config.miss_threshold);
                    layer.ledger.drop_peer(&peer);
                }
            }
        });
    }

    /// Incoming catalog from a sibling; replaces the prior view when the
    /// version advances.
    pub fn handle_heartbeat(&self, catalog: peer_proto::ProviderCatalog) -> Result<(), String> {
        if catalog.peer_id.is_empty() {
            return Err("missing peer id".to_string());
        }
        let peer_id = PeerId::new(catalog.peer_id.clone());
        if peer_id == self.local_id {
            return Ok(());
        }

        let merge = {
            let mut peers = self.peers.lock().unwrap();
            let state = peers.entry(peer_id.clone()).or_insert_with(|| PeerState {
                address: catalog.peer_address.clone(),
                channel: None,
                last_seen: None,
                catalog_version: 0,
                alive: false,
            });
            if !catalog.peer_address.is_empty() && state.address != catalog.peer_address {
                state.address = catalog.peer_address.clone();
                state.channel = None;
            }
            state.last_seen = Some(Instant::now());
            if !state.alive {
                info!(peer = %peer_id, "Peer is live");
                // A peer returning from the dead may have restarted with a
                // fresh version counter.
                state.catalog_version = 0;
            }
            state.alive = true;
            if catalog.version > state.catalog_version {
                state.catalog_version = catalog.version;
                true
            } else {
                false
            }
        };

        if merge {
            let providers = catalog
                .providers
                .into_iter()
                .filter_map(|summary| {
                    let kind = peer_proto::ProviderKind::try_from(summary.kind)
                        .ok()
                        .and_then(|k| ProviderKind::try_from(k).ok())?;
                    Some((
                        plexus_common::model::ProviderId::new(summary.provider_id),
                        kind,
                        summary.capacity.map(Into::into).unwrap_or_default(),
                        summary.allocated.map(Into::into).unwrap_or_default(),
                    ))
                })
                .collect();
            self.ledger.merge_peer_catalog(&peer_id, providers);
        }
        Ok(())
    }

    /// Hands a task to the peer owning the selected provider.
    pub async fn dispatch(
        &self,
        peer: &PeerId,
        request: peer_proto::DispatchRequest,
    ) -> Result<(), PeerCallError> {
        let channel = self.channel_for(peer)?;
        let mut client = PeerServiceClient::new(channel);
        let response = client
            .dispatch(request)
            .await
            .map_err(|status| PeerCallError::Unreachable(status.to_string()))?
            .into_inner();
        match response.result {
            Some(peer_proto::dispatch_response::Result::Accepted(_)) => Ok(()),
            Some(peer_proto::dispatch_response::Result::Refused(body)) => {
                Err(PeerCallError::Refused(body.error))
            }
            None => Err(PeerCallError::Protocol(
                "empty dispatch response".to_string(),
            )),
        }
    }

    /// Reports a remotely executed task's terminal state back to its origin
    /// peer.
    pub async fn complete(
        &self,
        reply_to: &str,
        request: peer_proto::CompleteRequest,
    ) -> Result<(), PeerCallError> {
        let channel = {
            let peers = self.peers.lock().unwrap();
            peers
                .values()
                .find(|state| state.address == reply_to)
                .and_then(|state| state.channel.clone())
        };
        let channel = match channel {
            Some(channel) => channel,
            None => channel_to(reply_to)?,
        };
        let mut client = PeerServiceClient::new(channel);
        client
            .complete(request)
            .await
            .map_err(|status| PeerCallError::Unreachable(status.to_string()))?;
        Ok(())
    }

    pub fn register_completion(
        &self,
        session_id: SessionId,
        task_id: TaskId,
    ) -> oneshot::Receiver<RemoteCompletion> {
        let (tx, rx) = oneshot::channel();
        self.completions
            .lock()
            .unwrap()
            .insert((session_id, task_id), tx);
        rx
    }

    pub fn cancel_completion(&self, session_id: &SessionId, task_id: &TaskId) {
        self.completions
            .lock()
            .unwrap()
            .remove(&(*session_id, task_id.clone()));
    }

    /// Resolves the waiter registered by a remote dispatch; unmatched
    /// completions (late replies after a timeout) are dropped.
    pub fn resolve_completion(
        &self,
        session_id: &SessionId,
        task_id: &TaskId,
        completion: RemoteCompletion,
    ) {
        let waiter = self
            .completions
            .lock()
            .unwrap()
            .remove(&(*session_id, task_id.clone()));
        match waiter {
            Some(tx) => {
                let _ = tx.send(completion);
            }
            None => {
                debug!(session = %session_id, task = %task_id, "Dropping unmatched completion");
            }
        }
    }

    pub async fn fetch_object(
        &self,
        source: &PeerId,
        object_id: &ObjectId,
    ) -> Result<Option<EncodedValue>, PeerCallError> {
        let channel = self.channel_for(source)?;
        let mut client = PeerServiceClient::new(channel);
        let response = client
            .fetch_object(peer_proto::FetchObjectRequest {
                object_id: object_id.to_string(),
            })
            .await
            .map_err(|status| PeerCallError::Unreachable(status.to_string()))?
            .into_inner();
        match response.result {
            Some(peer_proto::fetch_object_response::Result::Success(object)) => {
                Ok(Some(object.into()))
            }
            Some(peer_proto::fetch_object_response::Result::NotFound(_)) | None => Ok(None),
        }
    }

    pub async fn fetch_stream_chunk(
        &self,
        source: &PeerId,
        object_id: &ObjectId,
        offset: u64,
    ) -> Result<Option<StreamChunk>, PeerCallError> {
        let channel = self.channel_for(source)?;
        let mut client = PeerServiceClient::new(channel);
        let response = client
            .fetch_stream_chunk(peer_proto::FetchStreamChunkRequest {
                object_id: object_id.to_string(),
                offset,
            })
            .await
            .map_err(|status| PeerCallError::Unreachable(status.to_string()))?
            .into_inner();
        match response.result {
            Some(peer_proto::fetch_stream_chunk_response::Result::Success(chunk)) => chunk
                .try_into()
                .map(Some)
                .map_err(PeerCallError::Protocol),
            Some(peer_proto::fetch_stream_chunk_response::Result::NotFound(_)) | None => Ok(None),
        }
    }

    /// Last-resort lookup when an object carries no usable source hint:
    /// asks every live peer in turn.
    pub async fn broadcast_find_object(&self, object_id: &ObjectId) -> Option<EncodedValue> {
        for peer in self.live_peers() {
            match self.fetch_object(&peer, object_id).await {
                Ok(Some(object)) => return Some(object),
                Ok(None) => continue,
                Err(err) => {
                    debug!(peer = %peer, "Broadcast lookup leg failed: {err}");
                }
            }
        }
        None
    }
}

fn channel_to(address: &str) -> Result<Channel, PeerCallError> {
    let endpoint = Endpoint::from_shared(format!("http://{address}"))
        .map_err(|err| PeerCallError::Unreachable(err.to_string()))?;
    Ok(endpoint.connect_lazy())
}
