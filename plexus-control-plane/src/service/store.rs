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

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use bytes::Bytes;
use plexus_common::model::{
    EncodedValue, Language, ObjectId, ObjectRef, PeerId, StreamChunk, WorkflowId,
};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::service::peers::PeerLayer;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(ObjectId),
    #[error("object {0} already exists with different content")]
    Conflict(ObjectId),
    #[error("duplicate stream chunk for {0} at offset {1}")]
    DuplicateChunk(ObjectId, u64),
    #[error("stream {0} already closed")]
    StreamClosed(ObjectId),
    #[error("fetch failed: {0}")]
    FetchFailed(String),
}

struct StoredObject {
    language: Language,
    data: Bytes,
    is_stream: bool,
    source: PeerId,
    workflows: HashSet<WorkflowId>,
    expires_at: Option<Instant>,
}

struct StreamState {
    chunks: BTreeMap<u64, Bytes>,
    closed: bool,
}

/// Append-only, content-addressed byte store; one instance per peer.
/// Objects live for the owning workflows' lifetime plus the configured
/// retention, then get collected. Reads of foreign objects follow the
/// ObjectRef source hint and fall back to a peer broadcast.
pub struct ObjectStore {
    local_peer: PeerId,
    objects: RwLock<HashMap<ObjectId, StoredObject>>,
    streams: RwLock<HashMap<ObjectId, StreamState>>,
    peers: Arc<PeerLayer>,
    config: StoreConfig,
}

impl ObjectStore {
    pub fn new(local_peer: PeerId, config: StoreConfig, peers: Arc<PeerLayer>) -> Self {
        Self {
            local_peer,
            objects: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
            peers,
            config,
        }
    }

    /// Saves an object, assigning an id when the caller did not provide
    /// one. Saving identical bytes under an existing id is idempotent;
    /// diverging bytes are rejected (saved objects are immutable).
    pub fn save(
        &self,
        value: EncodedValue,
        workflow: Option<WorkflowId>,
    ) -> Result<ObjectRef, StoreError> {
        let id = value.id.clone().unwrap_or_else(ObjectId::generate);
        let source = value.source.clone().unwrap_or_else(|| self.local_peer.clone());

        let mut objects = self.objects.write().unwrap();
        if let Some(existing) = objects.get_mut(&id) {
            if existing.data != value.data || existing.language != value.language {
                return Err(StoreError::Conflict(id));
            }
            if let Some(workflow) = workflow {
                existing.workflows.insert(workflow);
                existing.expires_at = None;
            }
        } else {
            let mut workflows = HashSet::new();
            let expires_at = match workflow {
                Some(workflow) => {
                    workflows.insert(workflow);
                    None
                }
                // Unowned objects (worker results not yet recorded) age out
                // on their own so nothing leaks.
                None => Some(Instant::now() + self.config.object_retention_after_workflow),
            };
            objects.insert(
                id.clone(),
                StoredObject {
                    language: value.language,
                    data: value.data,
                    is_stream: value.is_stream,
                    source: source.clone(),
                    workflows,
                    expires_at,
                },
            );
        }

        Ok(ObjectRef {
            id,
            source: Some(source),
        })
    }

    /// Size of a locally held object, used by the scheduler's transfer
    /// estimate.
    pub fn size_of(&self, id: &ObjectId) -> Option<u64> {
        let objects = self.objects.read().unwrap();
        objects.get(id).map(|stored| stored.data.len() as u64)
    }

    pub fn get_local(&self, id: &ObjectId) -> Option<EncodedValue> {
        let objects = self.objects.read().unwrap();
        objects.get(id).map(|stored| EncodedValue {
            id: Some(id.clone()),
            language: stored.language,
            data: stored.data.clone(),
            is_stream: stored.is_stream,
            source: Some(stored.source.clone()),
        })
    }

    /// Resolves an ObjectRef: local store first, then the source peer, then
    /// a broadcast lookup. Remote hits are cached locally with their origin
    /// preserved.
    pub async fn get(&self, reference: &ObjectRef) -> Result<EncodedValue, StoreError> {
        if let Some(found) = self.get_local(&reference.id) {
            return Ok(found);
        }

        let remote = timeout(self.config.fetch_timeout, self.fetch_remote(reference))
            .await
            .map_err(|_| StoreError::FetchFailed(format!("fetch of {} timed out", reference.id)))??;

        match remote {
            Some(value) => {
                let cached = EncodedValue {
                    id: Some(reference.id.clone()),
                    ..value.clone()
                };
                if let Err(err) = self.save(cached, None) {
                    debug!(object = %reference.id, "Not caching fetched object: {err}");
                }
                Ok(value)
            }
            None => Err(StoreError::NotFound(reference.id.clone())),
        }
    }

    async fn fetch_remote(
        &self,
        reference: &ObjectRef,
    ) -> Result<Option<EncodedValue>, StoreError> {
        if let Some(source) = &reference.source {
            if source != &self.local_peer {
                match self.peers.fetch_object(source, &reference.id).await {
                    Ok(found @ Some(_)) => return Ok(found),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(object = %reference.id, source = %source, "Source fetch failed: {err}");
                    }
                }
            }
        }
        Ok(self.peers.broadcast_find_object(&reference.id).await)
    }

    /// Appends one chunk of a stream object. Chunks arrive at most once per
    /// offset; the stream closes at the end-of-stream marker.
    pub fn save_chunk(&self, chunk: StreamChunk) -> Result<(), StoreError> {
        let mut streams = self.streams.write().unwrap();
        let state = streams.entry(chunk.object_id.clone()).or_insert_with(|| StreamState {
            chunks: BTreeMap::new(),
            closed: false,
        });
        if state.closed {
            return Err(StoreError::StreamClosed(chunk.object_id));
        }
        if state.chunks.contains_key(&chunk.offset) {
            return Err(StoreError::DuplicateChunk(chunk.object_id, chunk.offset));
        }
        state.chunks.insert(chunk.offset, chunk.data);
        if chunk.end_of_stream {
            state.closed = true;
        }
        Ok(())
    }

    pub fn get_chunk_local(&self, id: &ObjectId, offset: u64) -> Option<StreamChunk> {
        let streams = self.streams.read().unwrap();
        let state = streams.get(id)?;
        let data = state.chunks.get(&offset)?.clone();
        let last = state
            .chunks
            .keys()
            .next_back()
            .copied()
            .unwrap_or_default();
        Some(StreamChunk {
            object_id: id.clone(),
            offset,
            data,
            end_of_stream: state.closed && offset == last,
        })
    }

    /// Cross-peer stream read: chunks are only served from the source peer,
    /// never found by broadcast.
    pub async fn get_chunk(
        &self,
        reference: &ObjectRef,
        offset: u64,
    ) -> Result<StreamChunk, StoreError> {
        if let Some(found) = self.get_chunk_local(&reference.id, offset) {
            return Ok(found);
        }
        if let Some(source) = &reference.source {
            if source != &self.local_peer {
                let fetched = timeout(
                    self.config.fetch_timeout,
                    self.peers.fetch_stream_chunk(source, &reference.id, offset),
                )
                .await
                .map_err(|_| {
                    StoreError::FetchFailed(format!("chunk fetch of {} timed out", reference.id))
                })?
                .map_err(|err| StoreError::FetchFailed(err.to_string()))?;
                if let Some(chunk) = fetched {
                    return Ok(chunk);
                }
            }
        }
        Err(StoreError::NotFound(reference.id.clone()))
    }

    /// Ties an already-saved object to a workflow so it survives until that
    /// workflow releases it.
    pub fn attach_workflow(&self, id: &ObjectId, workflow: WorkflowId) {
        let mut objects = self.objects.write().unwrap();
        if let Some(stored) = objects.get_mut(id) {
            stored.workflows.insert(workflow);
            stored.expires_at = None;
        }
    }

    /// Detaches a finished workflow from everything it referenced; objects
    /// with no remaining references start their retention countdown.
    pub fn release_workflow(&self, workflow: &WorkflowId) {
        let retention = self.config.object_retention_after_workflow;
        let mut objects = self.objects.write().unwrap();
        for stored in objects.values_mut() {
            if stored.workflows.remove(workflow) && stored.workflows.is_empty() {
                stored.expires_at = Some(Instant::now() + retention);
            }
        }
    }

    pub fn sweep(&self) {
        let now = Instant::now();
        let mut objects = self.objects.write().unwrap();
        let before = objects.len();
        objects.retain(|_, stored| stored.expires_at.map(|at| at > now).unwrap_or(true));
        let removed = before - objects.len();
        if removed > 0 {
            debug!("Collected {removed} expired objects");
        }
    }

    pub fn run_sweeper(self: &Arc<Self>, join_set: &mut JoinSet<Result<(), anyhow::Error>>) {
        let store = self.clone();
        join_set.spawn(async move {
            let mut ticker = tokio::time::interval(store.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.sweep();
            }
        });
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use test_r::test;

    use super::*;
    use crate::config::{LedgerConfig, PeerMeshConfig};
    use crate::repo::provider::NoopProviderRepo;
    use crate::service::ledger::ResourceLedger;

    async fn isolated_store(retention: Duration) -> ObjectStore {
        let ledger = Arc::new(
            ResourceLedger::new(LedgerConfig::default(), Arc::new(NoopProviderRepo))
                .await
                .unwrap(),
        );
        let peers = Arc::new(PeerLayer::new(
            PeerId::new("peer-a"),
            PeerMeshConfig::default(),
            ledger,
        ));
        let config = StoreConfig {
            object_retention_after_workflow: retention,
            ..StoreConfig::default()
        };
        ObjectStore::new(PeerId::new("peer-a"), config, peers)
    }

    #[test]
    async fn saved_payload_resolves_deterministically() {
        let store = isolated_store(Duration::from_secs(60)).await;
        let payload = Bytes::from_static(b"\"hi\"");
        let reference = store
            .save(EncodedValue::new(Language::Json, payload.clone()), None)
            .unwrap();

        let first = store.get_local(&reference.id).unwrap();
        let second = store.get_local(&reference.id).unwrap();
        assert_eq!(first.data, payload);
        assert_eq!(first, second);
        assert_eq!(first.source, Some(PeerId::new("peer-a")));
    }

    #[test]
    async fn conflicting_rewrite_is_rejected() {
        let store = isolated_store(Duration::from_secs(60)).await;
        let mut value = EncodedValue::new(Language::Json, Bytes::from_static(b"1"));
        value.id = Some(ObjectId::new("obj.fixed"));
        store.save(value.clone(), None).unwrap();

        // Idempotent duplicate save.
        assert!(store.save(value.clone(), None).is_ok());

        value.data = Bytes::from_static(b"2");
        assert!(matches!(
            store.save(value, None),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    async fn unreferenced_objects_expire_after_retention() {
        let store = isolated_store(Duration::from_millis(0)).await;
        let reference = store
            .save(EncodedValue::new(Language::Json, Bytes::from_static(b"1")), None)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.sweep();
        assert!(store.get_local(&reference.id).is_none());
    }

    #[test]
    async fn workflow_reference_pins_objects_until_release() {
        let store = isolated_store(Duration::from_millis(0)).await;
        let workflow = WorkflowId::new_v4();
        let reference = store
            .save(
                EncodedValue::new(Language::Json, Bytes::from_static(b"1")),
                Some(workflow),
            )
            .unwrap();

        store.sweep();
        assert!(store.get_local(&reference.id).is_some());

        store.release_workflow(&workflow);
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.sweep();
        assert!(store.get_local(&reference.id).is_none());
    }

    #[test]
    async fn stream_chunks_are_at_most_once_per_offset() {
        let store = isolated_store(Duration::from_secs(60)).await;
        let id = ObjectId::new("obj.stream");
        store
            .save_chunk(StreamChunk {
                object_id: id.clone(),
                offset: 0,
                data: Bytes::from_static(b"a"),
                end_of_stream: false,
            })
            .unwrap();
        assert!(matches!(
            store.save_chunk(StreamChunk {
                object_id: id.clone(),
                offset: 0,
                data: Bytes::from_static(b"b"),
                end_of_stream: false,
            }),
            Err(StoreError::DuplicateChunk(_, 0))
        ));
        store
            .save_chunk(StreamChunk {
                object_id: id.clone(),
                offset: 1,
                data: Bytes::from_static(b"b"),
                end_of_stream: true,
            })
            .unwrap();
        assert!(matches!(
            store.save_chunk(StreamChunk {
                object_id: id.clone(),
                offset: 2,
                data: Bytes::from_static(b"c"),
                end_of_stream: false,
            }),
            Err(StoreError::StreamClosed(_))
        ));

        let chunk = store.get_chunk_local(&id, 1).unwrap();
        assert!(chunk.end_of_stream);
        let chunk = store.get_chunk_local(&id, 0).unwrap();
        assert!(!chunk.end_of_stream);
    }
}
