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

use std::sync::Arc;

use plexus_common::model::PeerId;

use crate::config::ControlPlaneConfig;
use crate::repo::provider::{DbProviderRepo, ProviderRepo};
use crate::service::ledger::ResourceLedger;
use crate::service::peers::PeerLayer;
use crate::service::pool::ComponentPool;
use crate::service::provider::ProviderRegistry;
use crate::service::router::Router;
use crate::service::scheduler::Scheduler;
use crate::service::store::ObjectStore;
use crate::service::workflow::WorkflowServiceDefault;
use crate::Endpoints;

/// The one top-level value owning every subsystem; everything reaches its
/// collaborators through here instead of ambient globals.
#[derive(Clone)]
pub struct Services {
    pub ledger: Arc<ResourceLedger>,
    pub pool: Arc<ComponentPool>,
    pub router: Arc<Router>,
    pub peers: Arc<PeerLayer>,
    pub store: Arc<ObjectStore>,
    pub providers: Arc<ProviderRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub workflow_service: Arc<WorkflowServiceDefault>,
    pub endpoints: Arc<Endpoints>,
}

impl Services {
    pub async fn new(config: &ControlPlaneConfig) -> anyhow::Result<Services> {
        let local_peer = PeerId::new(config.peer_id.clone());

        let repo: Arc<dyn ProviderRepo> =
            Arc::new(DbProviderRepo::configured(&config.ledger.db).await?);
        let ledger = Arc::new(ResourceLedger::new(config.ledger.clone(), repo).await?);

        let peers = Arc::new(PeerLayer::new(
            local_peer.clone(),
            config.peer.clone(),
            ledger.clone(),
        ));

        let store = Arc::new(ObjectStore::new(
            local_peer,
            config.store.clone(),
            peers.clone(),
        ));

        let pool = Arc::new(ComponentPool::new());
        let router = Arc::new(Router::new(pool.clone(), config.router.clone()));
        let providers = Arc::new(ProviderRegistry::new(ledger.clone()));
        let endpoints = Arc::new(Endpoints::new());

        let scheduler = Arc::new(Scheduler::new(
            ledger.clone(),
            pool.clone(),
            router.clone(),
            providers.clone(),
            peers.clone(),
            store.clone(),
            endpoints.clone(),
            config.scheduler.clone(),
        ));

        let workflow_service = Arc::new(WorkflowServiceDefault::new(
            scheduler.clone(),
            store.clone(),
            config.workflow.clone(),
        ));

        providers.register_configured(&config.providers).await?;

        Ok(Services {
            ledger,
            pool,
            router,
            peers,
            store,
            providers,
            scheduler,
            workflow_service,
            endpoints,
        })
    }
}
