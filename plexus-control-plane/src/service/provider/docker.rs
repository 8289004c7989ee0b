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
use plexus_common::model::{ProviderId, ProviderKind, Resources};
use sysinfo::System;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::DockerProviderConfig;
use crate::model::{CapacityReport, ComponentDescriptor, ComponentLaunch};
use crate::service::provider::{ProviderAdapter, ProviderError};

/// Container-host provider: one container per component, created through
/// the docker CLI on the host this control plane can reach. The worker
/// runtime inside the image picks up its identity and endpoints from the
/// injected environment.
pub struct DockerProviderAdapter {
    config: DockerProviderConfig,
    provider_id: ProviderId,
    system: Mutex<System>,
}

impl DockerProviderAdapter {
    pub fn new(config: DockerProviderConfig) -> Self {
        Self {
            provider_id: ProviderId::new(config.provider_id.clone()),
            config,
            system: Mutex::new(System::new()),
        }
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
impl ProviderAdapter for DockerProviderAdapter {
    fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::ContainerHost
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

        let mut command = Command::new(&self.config.docker_bin);
        command
            .arg("run")
            .arg("--detach")
            .arg("--name")
            .arg(&name)
            .arg("--env")
            .arg(format!("COMPONENT_ID={}", launch.component_id))
            .arg("--env")
            .arg(format!("TRANSPORT_ADDR={}", launch.transport_addr))
            .arg("--env")
            .arg(format!("STORE_ADDR={}", launch.store_addr))
            .arg("--env")
            .arg(format!("LANGUAGE={}", launch.language));
        if launch.resources.millicpu > 0 {
            command
                .arg("--cpus")
                .arg(format!("{:.3}", launch.resources.millicpu as f64 / 1000.0));
        }
        if launch.resources.memory_bytes > 0 {
            command
                .arg("--memory")
                .arg(launch.resources.memory_bytes.to_string());
        }
        for arg in &self.config.extra_run_args {
            command.arg(arg);
        }
        command.arg(&image);

        let output = command
            .output()
            .await
            .map_err(|err| ProviderError::Transient(format!("docker run failed to spawn: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::Transient(format!(
                "docker run exited with {}: {stderr}",
                output.status
            )));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(component = %launch.component_id, container = %container_id, "Started container");

        Ok(ComponentDescriptor {
            provider_id: self.provider_id.clone(),
            component_id: launch.component_id,
            sandbox: container_id,
        })
    }

    async fn stop_component(&self, descriptor: &ComponentDescriptor) -> Result<(), ProviderError> {
        let output = Command::new(&self.config.docker_bin)
            .arg("rm")
            .arg("--force")
            .arg(&descriptor.sandbox)
            .output()
            .await
            .map_err(|err| ProviderError::Transient(format!("docker rm failed to spawn: {err}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::Failed(format!(
                "docker rm exited with {}: {stderr}",
                output.status
            )));
        }
        Ok(())
    }

    async fn heartbeat(&self) -> Result<CapacityReport, ProviderError> {
        if let Some(capacity) = &self.config.capacity_override {
            return Ok(CapacityReport {
                capacity: capacity.clone(),
            });
        }
        let mut system = self.system.lock().await;
        system.refresh_memory();
        system.refresh_cpu_all();
        let capacity = Resources {
            millicpu: system.cpus().len() as i64 * 1000,
            memory_bytes: system.total_memory() as i64,
            gpus: self.config.gpus,
            tags: self.config.tags.iter().cloned().collect(),
        };
        Ok(CapacityReport { capacity })
    }
}
