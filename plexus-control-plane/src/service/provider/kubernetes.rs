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

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use plexus_common::model::{ProviderId, ProviderKind};
use serde_json::json;
use tracing::debug;

use crate::config::KubernetesProviderConfig;
use crate::model::{CapacityReport, ComponentDescriptor, ComponentLaunch};
use crate::service::provider::{ProviderAdapter, ProviderError};

/// Cluster-orchestrator provider: one workload unit (Pod) per component.
/// Scale-out is expressed by creating more pods; declared capacity comes
/// from configuration, sampled cluster metrics are out of scope here.
pub struct KubernetesProviderAdapter {
    config: KubernetesProviderConfig,
    provider_id: ProviderId,
    pods: Api<Pod>,
}

impl KubernetesProviderAdapter {
    pub async fn new(config: KubernetesProviderConfig) -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        let pods = Api::namespaced(client, &config.namespace);
        Ok(Self {
            provider_id: ProviderId::new(config.provider_id.clone()),
            config,
            pods,
        })
    }

    fn image_for(&self, language: &str) -> Result<String, ProviderError> {
        self.config
            .base_images
            .get(language)
            .cloned()
            .ok_or_else(|| {
                ProviderError::Failed(format!("no base image configured for language {language}"))
            })
    }
}

#[async_trait]
impl ProviderAdapter for KubernetesProviderAdapter {
    fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Cluster
    }

    fn address(&self) -> String {
        self.config.address.clone()
    }

    async fn start_component(
        &self,
        launch: &ComponentLaunch,
    ) -> Result<ComponentDescriptor, ProviderError> {
        let image = self.image_for(launch.language.as_str())?;
        let name = format!("plexus-{}", launch.component_id);

        let pod: Pod = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "labels": {
                    "app.kubernetes.io/managed-by": "plexus",
                    "plexus/component-id": launch.component_id.to_string(),
                }
            },
            "spec": {
                "restartPolicy": "Never",
                "containers": [{
                    "name": "worker",
                    "image": image,
                    "env": [
                        { "name": "COMPONENT_ID", "value": launch.component_id.to_string() },
                        { "name": "TRANSPORT_ADDR", "value": launch.transport_addr },
                        { "name": "STORE_ADDR", "value": launch.store_addr },
                        { "name": "LANGUAGE", "value": launch.language.to_string() },
                    ],
                    "resources": {
                        "limits": {
                            "cpu": format!("{}m", launch.resources.millicpu.max(1)),
                            "memory": launch.resources.memory_bytes.max(1).to_string(),
                        }
                    }
                }]
            }
        }))
        .map_err(|err| ProviderError::Failed(format!("invalid pod manifest: {err}")))?;

        self.pods
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|err| ProviderError::Transient(format!("pod create failed: {err}")))?;
        debug!(component = %launch.component_id, pod = %name, "Created pod");

        Ok(ComponentDescriptor {
            provider_id: self.provider_id.clone(),
            component_id: launch.component_id,
            sandbox: name,
        })
    }

    async fn stop_component(&self, descriptor: &ComponentDescriptor) -> Result<(), ProviderError> {
        self.pods
            .delete(&descriptor.sandbox, &DeleteParams::default())
            .await
            .map_err(|err| ProviderError::Failed(format!("pod delete failed: {err}")))?;
        Ok(())
    }

    async fn heartbeat(&self) -> Result<CapacityReport, ProviderError> {
        Ok(CapacityReport {
            capacity: self.config.capacity.clone(),
        })
    }
}
