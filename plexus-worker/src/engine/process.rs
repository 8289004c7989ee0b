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

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::engine::{EngineError, FunctionEngine, FunctionPayload, FunctionValue};

#[derive(Debug, Clone)]
pub struct ProcessEngineConfig {
    /// Interpreter harness command, e.g. `python3 -u /opt/plexus/harness.py`.
    pub command: Vec<String>,
    /// Dependency installer, e.g. `python3 -m pip install --quiet`; empty
    /// disables installation.
    pub install_command: Vec<String>,
    pub install_timeout: Duration,
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum HarnessRequest<'a> {
    Register {
        name: &'a str,
        language: &'a str,
        body_b64: String,
    },
    Invoke {
        args: BTreeMap<&'a str, HarnessValue>,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum HarnessValue {
    Json { json: serde_json::Value },
    Bytes { b64: String },
}

#[derive(Deserialize)]
struct HarnessResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    result: Option<HarnessValue>,
}

struct HarnessChild {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    _child: Child,
}

/// Delegates function interpretation to a per-language harness process
/// speaking newline-delimited JSON over stdio. The harness deserialises the
/// body once at registration and then evaluates invocations by keyword
/// arguments, exactly like the in-container interpreter runtimes do.
pub struct ProcessEngine {
    config: ProcessEngineConfig,
    child: Mutex<Option<HarnessChild>>,
}

impl ProcessEngine {
    pub fn new(config: ProcessEngineConfig) -> Self {
        Self {
            config,
            child: Mutex::new(None),
        }
    }

    async fn install_requirements(&self, requirements: &[String]) -> Result<(), EngineError> {
        if requirements.is_empty() || self.config.install_command.is_empty() {
            return Ok(());
        }
        info!("Installing {} dependencies", requirements.len());
        let mut command = Command::new(&self.config.install_command[0]);
        command.args(&self.config.install_command[1..]);
        command.args(requirements);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = timeout(self.config.install_timeout, command.output())
            .await
            .map_err(|_| {
                EngineError::Registration(format!(
                    "dependency install exceeded {:?}",
                    self.config.install_timeout
                ))
            })?
            .map_err(|err| EngineError::Registration(format!("installer failed to run: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Registration(format!(
                "dependency install exited with {}: {stderr}",
                output.status
            )));
        }
        debug!("Dependencies installed");
        Ok(())
    }

    async fn roundtrip(
        &self,
        child: &mut HarnessChild,
        request: &HarnessRequest<'_>,
    ) -> Result<HarnessResponse, EngineError> {
        let mut line = serde_json::to_string(request)
            .map_err(|err| EngineError::Execution(err.to_string()))?;
        line.push('\n');
        child
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| EngineError::Execution(format!("harness stdin closed: {err}")))?;

        let mut response_line = String::new();
        let read = child
            .stdout
            .read_line(&mut response_line)
            .await
            .map_err(|err| EngineError::Execution(format!("harness stdout failed: {err}")))?;
        if read == 0 {
            return Err(EngineError::Execution("harness exited".to_string()));
        }
        serde_json::from_str(&response_line)
            .map_err(|err| EngineError::Execution(format!("undecodable harness reply: {err}")))
    }
}

#[async_trait]
impl FunctionEngine for ProcessEngine {
    async fn register(&self, function: &FunctionPayload) -> Result<(), EngineError> {
        self.install_requirements(&function.requirements).await?;

        if self.config.command.is_empty() {
            return Err(EngineError::Unsupported(
                "no harness command configured".to_string(),
            ));
        }
        let mut command = Command::new(&self.config.command[0]);
        command.args(&self.config.command[1..]);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut spawned = command
            .spawn()
            .map_err(|err| EngineError::Registration(format!("harness failed to start: {err}")))?;

        let stdin = spawned
            .stdin
            .take()
            .ok_or_else(|| EngineError::Registration("harness has no stdin".to_string()))?;
        let stdout = spawned
            .stdout
            .take()
            .ok_or_else(|| EngineError::Registration("harness has no stdout".to_string()))?;
        let mut child = HarnessChild {
            stdin,
            stdout: BufReader::new(stdout),
            _child: spawned,
        };

        let response = self
            .roundtrip(
                &mut child,
                &HarnessRequest::Register {
                    name: &function.name,
                    language: function.language.as_str(),
                    body_b64: BASE64.encode(&function.body),
                },
            )
            .await
            .map_err(|err| EngineError::Registration(err.to_string()))?;
        if !response.ok {
            return Err(EngineError::Registration(
                response.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        *self.child.lock().await = Some(child);
        info!(function = %function.name, "Function registered in harness");
        Ok(())
    }

    async fn invoke(
        &self,
        args: Vec<(String, FunctionValue)>,
    ) -> Result<FunctionValue, EngineError> {
        let mut guard = self.child.lock().await;
        let child = guard
            .as_mut()
            .ok_or_else(|| EngineError::Execution("no function registered".to_string()))?;

        let wire_args: BTreeMap<&str, HarnessValue> = args
            .iter()
            .map(|(param, value)| {
                let wire = match value {
                    FunctionValue::Json(json) => HarnessValue::Json { json: json.clone() },
                    FunctionValue::Opaque(data) => HarnessValue::Bytes {
                        b64: BASE64.encode(data),
                    },
                };
                (param.as_str(), wire)
            })
            .collect();

        let response = self
            .roundtrip(child, &HarnessRequest::Invoke { args: wire_args })
            .await;
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                // A dead harness cannot serve this component any further.
                warn!("Harness roundtrip failed: {err}");
                *guard = None;
                return Err(err);
            }
        };

        if !response.ok {
            return Err(EngineError::Execution(
                response.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        match response.result {
            Some(HarnessValue::Json { json }) => Ok(FunctionValue::Json(json)),
            Some(HarnessValue::Bytes { b64 }) => BASE64
                .decode(b64)
                .map(|data| FunctionValue::Opaque(Bytes::from(data)))
                .map_err(|err| EngineError::Execution(format!("undecodable result bytes: {err}"))),
            None => Err(EngineError::Execution(
                "harness reply carried no result".to_string(),
            )),
        }
    }
}
