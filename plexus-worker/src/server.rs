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

use plexus_common::model::Language;
use plexus_common::tracing::{init_tracing_with_default_env_filter, TracingConfig};
use plexus_worker::config::WorkerConfig;
use plexus_worker::engine::process::{ProcessEngine, ProcessEngineConfig};
use plexus_worker::engine::FunctionEngine;
use plexus_worker::runtime::WorkerRuntime;
use plexus_worker::WorkerError;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    init_tracing_with_default_env_filter(&TracingConfig::deployed("plexus-worker"));

    let config = WorkerConfig::from_env()?;
    info!(
        component = %config.component_id,
        language = %config.language,
        "Starting worker runtime"
    );

    let engine = engine_for(&config)?;
    if let Err(err) = WorkerRuntime::new(config, engine).run().await {
        // The router treats our disconnect as the failure signal; the exit
        // code is for the sandbox logs.
        error!("Worker runtime failed: {err}");
        return Err(err.into());
    }
    Ok(())
}

/// The harness command can always be overridden with PLEXUS_ENGINE_CMD;
/// otherwise each interpreter language has a conventional location inside
/// its base image.
fn engine_for(config: &WorkerConfig) -> Result<Arc<dyn FunctionEngine>, WorkerError> {
    let command = match std::env::var("PLEXUS_ENGINE_CMD") {
        Ok(value) => value.split_whitespace().map(str::to_string).collect(),
        Err(_) => match config.language {
            Language::Python => vec![
                "python3".to_string(),
                "-u".to_string(),
                "/opt/plexus/harness.py".to_string(),
            ],
            Language::Go => vec!["/opt/plexus/go-harness".to_string()],
            Language::Ocaml => vec!["/opt/plexus/ocaml-harness".to_string()],
            Language::Json | Language::Unknown => {
                return Err(WorkerError::InvalidConfig(format!(
                    "language {} has no interpreter harness; embed the runtime with a native engine instead",
                    config.language
                )))
            }
        },
    };

    let install_command = match std::env::var("PLEXUS_INSTALL_CMD") {
        Ok(value) => value.split_whitespace().map(str::to_string).collect(),
        Err(_) => match config.language {
            Language::Python => vec![
                "python3".to_string(),
                "-m".to_string(),
                "pip".to_string(),
                "install".to_string(),
                "--quiet".to_string(),
                "--no-cache-dir".to_string(),
                "--no-warn-script-location".to_string(),
            ],
            _ => Vec::new(),
        },
    };

    Ok(Arc::new(ProcessEngine::new(ProcessEngineConfig {
        command,
        install_command,
        install_timeout: config.dependency_install_timeout,
    })))
}
