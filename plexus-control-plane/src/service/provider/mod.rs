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

pub mod docker;
pub mod kubernetes;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use plexus_common::model::{ProviderId, ProviderKind};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::ProvidersConfig;
use crate::model::{CapacityReport, ComponentDescriptor, ComponentLaunch};
use crate::service::ledger::ResourceLedger;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Worth retrying against the same provider (daemon hiccup, apiserver
    /// conflict).
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("provider failure: {0}")]
    Failed(String),
}

/// Uniform surface over everything that can host components. The adapter
/// only knows how to start and stop sandboxes and to report capacity; all
/// accounting stays in the ledger.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_id(&self) -> &ProviderId;
    fn kind(&self) -> ProviderKind;
    fn address(&self) -> String;

    async fn start_component(
        &self,
        launch: &ComponentLaunch,
    ) -> Result<ComponentDescriptor, ProviderError>;

    async fn stop_component(&self, descriptor: &ComponentDescriptor) -> Result<(), ProviderError>;

    async fn heartbeat(&self) -> Result<CapacityReport, ProviderError>;
}

/// Holds the adapters for every provider this peer owns.
pub struct ProviderRegistry {
    adapters: RwLock<HashMap<ProviderId, Arc<dyn ProviderAdapter>>>,
    ledger: Arc<ResourceLedger>,
}

impl ProviderRegistry {
    pub fn new(ledger: Arc<ResourceLedger>) -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            ledger,
        }
    }

    /// Registers the adapter, seeding the ledger with its first capacity
    /// report and persisting it into the provider catalog.
    pub async fn register(&self, adapter: Arc<dyn ProviderAdapter>) -> Result<(), ProviderError> {
        let report = adapter.heartbeat().await?;
        self.ledger
            .register_local_provider(
                adapter.provider_id().clone(),
                adapter.kind(),
                adapter.address(),
                report.capacity,
            )
            .await
            .map_err(|err| ProviderError::Failed(err.to_string()))?;
        self.adapters
            .write()
            .unwrap()
            .insert(adapter.provider_id().clone(), adapter);
        Ok(())
    }

    pub fn get(&self, provider_id: &ProviderId) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.read().unwrap().get(provider_id).cloned()
    }

    pub async fn stop_component(&self, descriptor: &ComponentDescriptor) {
        if descriptor.sandbox.is_empty() {
            // The component died before its sandbox was reported started.
            return;
        }
        match self.get(&descriptor.provider_id) {
            Some(adapter) => {
                if let Err(err) = adapter.stop_component(descriptor).await {
                    warn!(
                        component = %descriptor.component_id,
                        provider = %descriptor.provider_id,
                        "Failed to stop component sandbox: {err}"
                    );
                }
            }
            None => warn!(
                provider = %descriptor.provider_id,
                "No adapter for provider while stopping component"
            ),
        }
    }

    /// Regular capacity sampling tick; a provider that keeps failing here
    /// stops heartbeating the ledger and is eventually declared dead.
    pub fn run_heartbeats(
        self: &Arc<Self>,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
        interval: std::time::Duration,
    ) {
        let registry = self.clone();
        join_set.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let adapters: Vec<Arc<dyn ProviderAdapter>> =
                    registry.adapters.read().unwrap().values().cloned().collect();
                for adapter in adapters {
                    match adapter.heartbeat().await {
                        Ok(report) => {
                            registry
                                .ledger
                                .report_capacity(adapter.provider_id(), report.capacity);
                        }
                        Err(err) => {
                            warn!(provider = %adapter.provider_id(), "Provider heartbeat failed: {err}");
                        }
                    }
                }
            }
        });
    }

    /// Builds and registers the adapters named in the service config.
    pub async fn register_configured(&self, config: &ProvidersConfig) -> anyhow::Result<()> {
        for docker in &config.docker {
            let adapter = Arc::new(docker::DockerProviderAdapter::new(docker.clone()));
            self.register(adapter)
                .await
                .map_err(|err| anyhow::anyhow!("docker provider {}: {err}", docker.provider_id))?;
            info!(provider = %docker.provider_id, "Registered docker provider");
        }
        for cluster in &config.kubernetes {
            let adapter =
                Arc::new(kubernetes::KubernetesProviderAdapter::new(cluster.clone()).await?);
            self.register(adapter)
                .await
                .map_err(|err| anyhow::anyhow!("kubernetes provider {}: {err}", cluster.provider_id))?;
            info!(provider = %cluster.provider_id, "Registered kubernetes provider");
        }
        Ok(())
    }
}
