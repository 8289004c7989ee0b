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
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

use plexus_common::config::ConfigLoader;
use plexus_common::model::Resources;
use plexus_common::retries::RetryConfig;
use plexus_common::tracing::TracingConfig;
use plexus_common::SafeDisplay;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    pub tracing: TracingConfig,
    /// Identity of this control-plane node in the peer mesh.
    pub peer_id: String,
    /// Host name or address put into peer catalogs and worker environments.
    pub advertised_host: String,
    pub grpc_port: u16,
    /// Worker transport listener.
    pub router_port: u16,
    /// Prometheus exposition endpoint.
    pub metrics_port: u16,
    pub peer: PeerMeshConfig,
    pub scheduler: SchedulerConfig,
    pub ledger: LedgerConfig,
    pub router: RouterConfig,
    pub store: StoreConfig,
    pub workflow: WorkflowExecConfig,
    pub providers: ProvidersConfig,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("plexus-control-plane"),
            peer_id: "peer-local".to_string(),
            advertised_host: "127.0.0.1".to_string(),
            grpc_port: 9090,
            router_port: 9091,
            metrics_port: 9092,
            peer: PeerMeshConfig::default(),
            scheduler: SchedulerConfig::default(),
            ledger: LedgerConfig::default(),
            router: RouterConfig::default(),
            store: StoreConfig::default(),
            workflow: WorkflowExecConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }
}

impl SafeDisplay for ControlPlaneConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "peer id: {}", self.peer_id);
        let _ = writeln!(&mut result, "advertised host: {}", self.advertised_host);
        let _ = writeln!(&mut result, "gRPC port: {}", self.grpc_port);
        let _ = writeln!(&mut result, "router port: {}", self.router_port);
        let _ = writeln!(&mut result, "metrics port: {}", self.metrics_port);
        let _ = writeln!(&mut result, "peer mesh:");
        let _ = writeln!(&mut result, "{}", self.peer.to_safe_string_indented());
        let _ = writeln!(&mut result, "scheduler:");
        let _ = writeln!(&mut result, "{}", self.scheduler.to_safe_string_indented());
        let _ = writeln!(&mut result, "ledger:");
        let _ = writeln!(&mut result, "{}", self.ledger.to_safe_string_indented());
        let _ = writeln!(&mut result, "store:");
        let _ = writeln!(&mut result, "{}", self.store.to_safe_string_indented());
        let _ = writeln!(&mut result, "workflow:");
        let _ = writeln!(&mut result, "{}", self.workflow.to_safe_string_indented());
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerSeedConfig {
    pub peer_id: String,
    pub address: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerMeshConfig {
    #[serde(with = "humantime_serde")]
    pub gossip_interval: Duration,
    /// Consecutive silent intervals before a peer is declared dead.
    pub miss_threshold: u32,
    #[serde(default)]
    pub static_peers: Vec<PeerSeedConfig>,
}

impl Default for PeerMeshConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_secs(2),
            miss_threshold: 3,
            static_peers: Vec::new(),
        }
    }
}

impl SafeDisplay for PeerMeshConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "gossip interval: {:?}, miss threshold: {}, static peers: {}",
            self.gossip_interval,
            self.miss_threshold,
            self.static_peers.len()
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerWeights {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl Default for SchedulerWeights {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            beta: 0.3,
            gamma: 0.2,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub weights: SchedulerWeights,
    /// How long to wait for a newly requested component to become READY.
    #[serde(with = "humantime_serde")]
    pub cold_start_timeout: Duration,
    /// Backpressure window: how long a dispatch polls for capacity before
    /// returning `no_capacity`.
    #[serde(with = "humantime_serde")]
    pub no_capacity_poll_window: Duration,
    #[serde(with = "humantime_serde")]
    pub no_capacity_poll_interval: Duration,
    /// Extra budget on top of the task timeout when waiting for a remote
    /// peer's completion callback.
    #[serde(with = "humantime_serde")]
    pub remote_dispatch_slack: Duration,
    /// Transfer estimate for inputs whose size the local store does not
    /// know.
    pub default_transfer_bytes: u64,
    /// Cold-start cost assumed for providers without history yet.
    pub default_cold_start_secs: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            weights: SchedulerWeights::default(),
            cold_start_timeout: Duration::from_secs(45),
            no_capacity_poll_window: Duration::from_secs(10),
            no_capacity_poll_interval: Duration::from_millis(250),
            remote_dispatch_slack: Duration::from_secs(10),
            default_transfer_bytes: 64 * 1024,
            default_cold_start_secs: 1.0,
        }
    }
}

impl SafeDisplay for SchedulerConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "weights: ({}, {}, {}), cold start timeout: {:?}, poll window: {:?}",
            self.weights.alpha,
            self.weights.beta,
            self.weights.gamma,
            self.cold_start_timeout,
            self.no_capacity_poll_window
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerDbConfig {
    /// sqlx connection string for the provider catalog.
    pub database: String,
    pub max_connections: u32,
}

impl Default for LedgerDbConfig {
    fn default() -> Self {
        Self {
            database: "sqlite:plexus-providers.db".to_string(),
            max_connections: 4,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Uncommitted reservations are auto-released after this long.
    #[serde(with = "humantime_serde")]
    pub reservation_timeout: Duration,
    /// Missed-heartbeat threshold for providers.
    #[serde(with = "humantime_serde")]
    pub dead_provider_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    pub db: LedgerDbConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            reservation_timeout: Duration::from_secs(60),
            dead_provider_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            db: LedgerDbConfig::default(),
        }
    }
}

impl SafeDisplay for LedgerConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "reservation timeout: {:?}, dead provider timeout: {:?}, db: {}",
            self.reservation_timeout, self.dead_provider_timeout, self.db.database
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Bounded outbound queue per component.
    pub send_queue_depth: usize,
    /// Full-queue retries before the component is declared dead.
    pub send_retry_budget: u32,
    #[serde(with = "humantime_serde")]
    pub send_retry_delay: Duration,
    /// Budget for the READY frame after a connection opens.
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Budget for the ACK after FUNCTION; covers worker-side dependency
    /// install.
    #[serde(with = "humantime_serde")]
    pub function_ack_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            send_queue_depth: 64,
            send_retry_budget: 10,
            send_retry_delay: Duration::from_millis(50),
            handshake_timeout: Duration::from_secs(10),
            function_ack_timeout: Duration::from_secs(330),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Objects outlive their workflows by this much before collection.
    #[serde(with = "humantime_serde")]
    pub object_retention_after_workflow: Duration,
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            object_retention_after_workflow: Duration::from_secs(300),
            fetch_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl SafeDisplay for StoreConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "retention after workflow: {:?}, fetch timeout: {:?}",
            self.object_retention_after_workflow, self.fetch_timeout
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowExecConfig {
    /// Backoff policy for transient task failures.
    pub retries: RetryConfig,
    #[serde(with = "humantime_serde")]
    pub task_default_timeout: Duration,
    /// How long in-flight invocations may continue after cancellation.
    #[serde(with = "humantime_serde")]
    pub cancel_grace: Duration,
    /// How long finished instances stay queryable.
    #[serde(with = "humantime_serde")]
    pub instance_retention: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for WorkflowExecConfig {
    fn default() -> Self {
        Self {
            retries: RetryConfig::default(),
            task_default_timeout: Duration::from_secs(60),
            cancel_grace: Duration::from_secs(5),
            instance_retention: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl SafeDisplay for WorkflowExecConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "retries: {}, default task timeout: {:?}, cancel grace: {:?}",
            self.retries.to_safe_string(),
            self.task_default_timeout,
            self.cancel_grace
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DockerProviderConfig {
    pub provider_id: String,
    /// Reachable address of the container host.
    pub address: String,
    pub docker_bin: String,
    /// Language tag to base image.
    pub base_images: HashMap<String, String>,
    #[serde(default)]
    pub extra_run_args: Vec<String>,
    /// Overrides the sampled host capacity when set.
    #[serde(default)]
    pub capacity_override: Option<Resources>,
    #[serde(default)]
    pub gpus: i32,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KubernetesProviderConfig {
    pub provider_id: String,
    pub address: String,
    pub namespace: String,
    pub base_images: HashMap<String, String>,
    /// Declared capacity of the cluster slice given to plexus.
    pub capacity: Resources,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(default)]
    pub docker: Vec<DockerProviderConfig>,
    #[serde(default)]
    pub kubernetes: Vec<KubernetesProviderConfig>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            docker: Vec::new(),
            kubernetes: Vec::new(),
        }
    }
}

pub fn make_config_loader() -> ConfigLoader<ControlPlaneConfig> {
    ConfigLoader::new(&PathBuf::from("config/control-plane.toml"))
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::path::PathBuf;

    use test_r::test;

    use super::*;

    #[test]
    pub fn config_is_loadable() {
        env::set_current_dir(PathBuf::from(env!("CARGO_MANIFEST_DIR")))
            .expect("Failed to set current directory");

        make_config_loader().load().expect("Failed to load config");
    }
}
