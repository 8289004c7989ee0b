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
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use plexus_common::model::{
    ComponentId, EncodedValue, FunctionSpec, Language, ProviderId, ProviderKind, Resources,
};
use plexus_common::retries::RetryConfig;
use plexus_common::tracing::TracingConfig;
use plexus_control_plane::config::{
    ControlPlaneConfig, LedgerConfig, LedgerDbConfig, PeerMeshConfig, PeerSeedConfig, RouterConfig,
    SchedulerConfig, StoreConfig, WorkflowExecConfig,
};
use plexus_control_plane::model::{CapacityReport, ComponentDescriptor, ComponentLaunch};
use plexus_control_plane::service::provider::{ProviderAdapter, ProviderError};
use plexus_control_plane::service::workflow::{
    BindingSource, SubmitRequest, TaskNode, WorkflowService,
};
use plexus_control_plane::{ControlPlane, RunDetails};
use plexus_worker::config::WorkerConfig;
use plexus_worker::engine::native::NativeEngine;
use plexus_worker::engine::{EngineError, FunctionEngine, FunctionPayload, FunctionValue};
use plexus_worker::runtime::WorkerRuntime;
use plexus_worker::WorkerError;
use plexus_common::model::TaskId;
use tokio::task::{JoinHandle, JoinSet};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub type EngineFactory = Arc<dyn Fn() -> NativeEngine + Send + Sync>;

/// Records which component registered which function, so tests can target a
/// specific worker (e.g. to kill it mid-invocation).
struct RecordingEngine {
    component_id: ComponentId,
    inner: NativeEngine,
    registrations: Arc<Mutex<HashMap<String, ComponentId>>>,
}

#[async_trait]
impl FunctionEngine for RecordingEngine {
    async fn register(&self, function: &FunctionPayload) -> Result<(), EngineError> {
        self.registrations
            .lock()
            .unwrap()
            .insert(function.name.clone(), self.component_id);
        self.inner.register(function).await
    }

    async fn invoke(
        &self,
        args: Vec<(String, FunctionValue)>,
    ) -> Result<FunctionValue, EngineError> {
        self.inner.invoke(args).await
    }
}

/// Provider adapter that "boots" components as in-process worker runtimes
/// on tokio tasks, connected to the cluster over real sockets.
pub struct TestProviderAdapter {
    provider_id: ProviderId,
    capacity: Resources,
    engine_factory: EngineFactory,
    fail_starts: AtomicU32,
    registrations: Arc<Mutex<HashMap<String, ComponentId>>>,
    workers: Mutex<HashMap<ComponentId, JoinHandle<Result<(), WorkerError>>>>,
}

impl TestProviderAdapter {
    pub fn new(provider_id: &str, capacity: Resources, engine_factory: EngineFactory) -> Arc<Self> {
        Arc::new(Self {
            provider_id: ProviderId::new(provider_id),
            capacity,
            engine_factory,
            fail_starts: AtomicU32::new(0),
            registrations: Arc::new(Mutex::new(HashMap::new())),
            workers: Mutex::new(HashMap::new()),
        })
    }

    /// The next `count` start_component calls fail with a transient error.
    pub fn fail_next_starts(&self, count: u32) {
        self.fail_starts.store(count, Ordering::SeqCst);
    }

    pub fn component_for_function(&self, function_name: &str) -> Option<ComponentId> {
        self.registrations
            .lock()
            .unwrap()
            .get(function_name)
            .copied()
    }

    /// Kills the in-process worker, closing its transport mid-whatever it
    /// was doing.
    pub fn abort_component(&self, component_id: &ComponentId) -> bool {
        match self.workers.lock().unwrap().get(component_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ProviderAdapter for TestProviderAdapter {
    fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::ContainerHost
    }

    fn address(&self) -> String {
        "127.0.0.1".to_string()
    }

    async fn start_component(
        &self,
        launch: &ComponentLaunch,
    ) -> Result<ComponentDescriptor, ProviderError> {
        let failures = self.fail_starts.load(Ordering::SeqCst);
        if failures > 0
            && self
                .fail_starts
                .compare_exchange(failures, failures - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(ProviderError::Transient(
                "injected component start failure".to_string(),
            ));
        }

        let worker_config = WorkerConfig {
            component_id: launch.component_id.to_string(),
            transport_addr: launch.transport_addr.clone(),
            store_addr: launch.store_addr.clone(),
            language: launch.language,
            dependency_install_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(5),
            connect_attempts: 20,
            connect_backoff: Duration::from_millis(50),
        };
        let engine = Arc::new(RecordingEngine {
            component_id: launch.component_id,
            inner: (self.engine_factory)(),
            registrations: self.registrations.clone(),
        });
        let handle = tokio::spawn(WorkerRuntime::new(worker_config, engine).run());
        self.workers
            .lock()
            .unwrap()
            .insert(launch.component_id, handle);

        Ok(ComponentDescriptor {
            provider_id: self.provider_id.clone(),
            component_id: launch.component_id,
            sandbox: launch.component_id.to_string(),
        })
    }

    async fn stop_component(&self, descriptor: &ComponentDescriptor) -> Result<(), ProviderError> {
        if let Some(handle) = self
            .workers
            .lock()
            .unwrap()
            .remove(&descriptor.component_id)
        {
            handle.abort();
        }
        Ok(())
    }

    async fn heartbeat(&self) -> Result<CapacityReport, ProviderError> {
        Ok(CapacityReport {
            capacity: self.capacity.clone(),
        })
    }
}

pub fn test_config(peer_id: &str, static_peers: Vec<PeerSeedConfig>) -> ControlPlaneConfig {
    ControlPlaneConfig {
        tracing: TracingConfig::local_dev(peer_id),
        peer_id: peer_id.to_string(),
        advertised_host: "127.0.0.1".to_string(),
        grpc_port: 0,
        router_port: 0,
        metrics_port: 0,
        peer: PeerMeshConfig {
            gossip_interval: Duration::from_millis(200),
            miss_threshold: 3,
            static_peers,
        },
        scheduler: SchedulerConfig {
            cold_start_timeout: Duration::from_secs(10),
            no_capacity_poll_window: Duration::from_secs(5),
            no_capacity_poll_interval: Duration::from_millis(50),
            remote_dispatch_slack: Duration::from_secs(10),
            ..SchedulerConfig::default()
        },
        ledger: LedgerConfig {
            reservation_timeout: Duration::from_secs(10),
            dead_provider_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_millis(200),
            db: LedgerDbConfig {
                database: "sqlite::memory:".to_string(),
                max_connections: 1,
            },
        },
        router: RouterConfig {
            handshake_timeout: Duration::from_secs(5),
            function_ack_timeout: Duration::from_secs(10),
            ..RouterConfig::default()
        },
        store: StoreConfig {
            object_retention_after_workflow: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
        },
        workflow: WorkflowExecConfig {
            retries: RetryConfig {
                max_attempts: 3,
                min_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(200),
                multiplier: 2.0,
            },
            task_default_timeout: Duration::from_secs(10),
            cancel_grace: Duration::from_millis(500),
            instance_retention: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
        },
        providers: plexus_control_plane::config::ProvidersConfig {
            heartbeat_interval: Duration::from_secs(1),
            ..Default::default()
        },
    }
}

/// One in-process control-plane peer with a test provider attached.
pub struct TestCluster {
    pub control_plane: ControlPlane,
    pub adapter: Arc<TestProviderAdapter>,
    pub details: RunDetails,
    // Dropping the join set tears the whole peer down with the test.
    _join_set: JoinSet<Result<(), anyhow::Error>>,
}

impl TestCluster {
    pub async fn start(
        peer_id: &str,
        static_peers: Vec<PeerSeedConfig>,
        capacity: Resources,
        engine_factory: EngineFactory,
    ) -> TestCluster {
        init_tracing();
        let config = test_config(peer_id, static_peers);
        let control_plane = ControlPlane::new(config).await.expect("control plane");
        let mut join_set = JoinSet::new();
        let details = control_plane.run(&mut join_set).await.expect("run");

        let adapter = TestProviderAdapter::new(
            &format!("{peer_id}-provider"),
            capacity,
            engine_factory,
        );
        control_plane
            .services()
            .providers
            .register(adapter.clone())
            .await
            .expect("provider registration");

        TestCluster {
            control_plane,
            adapter,
            details,
            _join_set: join_set,
        }
    }

    pub fn grpc_addr(&self) -> String {
        format!("127.0.0.1:{}", self.details.grpc_port)
    }

    pub fn workflow_service(&self) -> Arc<dyn WorkflowService> {
        self.control_plane.services().workflow_service.clone()
    }
}

pub fn json_function(name: &str, millicpu: i64) -> FunctionSpec {
    FunctionSpec {
        name: name.to_string(),
        language: Language::Json,
        // Distinct bodies keep fingerprints distinct per function.
        body: Bytes::from(name.as_bytes().to_vec()),
        requirements: vec![],
        resources: Resources::new(millicpu, 1 << 20, 0),
        replicas: 1,
        venv: None,
        timeout: None,
    }
}

pub fn task(
    id: &str,
    function: &str,
    bindings: Vec<(&str, BindingSource)>,
    is_output: bool,
) -> TaskNode {
    TaskNode {
        task_id: TaskId::new(id),
        function_name: function.to_string(),
        bindings: bindings
            .into_iter()
            .map(|(param, source)| (param.to_string(), source))
            .collect(),
        is_output,
    }
}

pub fn from_input(name: &str) -> BindingSource {
    BindingSource::Input(name.to_string())
}

pub fn from_task(id: &str) -> BindingSource {
    BindingSource::Task(TaskId::new(id))
}

pub fn json_input(value: serde_json::Value) -> EncodedValue {
    EncodedValue::new(
        Language::Json,
        Bytes::from(serde_json::to_vec(&value).unwrap()),
    )
}

pub fn submit_request(
    tasks: Vec<TaskNode>,
    functions: Vec<FunctionSpec>,
    inputs: Vec<(&str, serde_json::Value)>,
) -> SubmitRequest {
    SubmitRequest {
        tasks,
        functions,
        inputs: inputs
            .into_iter()
            .map(|(name, value)| (name.to_string(), json_input(value)))
            .collect(),
        default_task_timeout: None,
    }
}

pub fn decode_json_output(value: &EncodedValue) -> serde_json::Value {
    assert_eq!(value.language, Language::Json);
    serde_json::from_slice(&value.data).expect("output is valid JSON")
}
