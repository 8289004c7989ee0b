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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use plexus_api_grpc::proto::plexus::actor;
use plexus_common::model::{EncodedValue, Language, ObjectRef};
use prost::Message as ProstMessage;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::encdec;
use crate::engine::{FunctionEngine, FunctionPayload, FunctionValue};
use crate::store_client::StoreClient;
use crate::WorkerError;

/// The in-sandbox actor: opens the transport, announces readiness, takes
/// one FUNCTION for life, then serves one invocation at a time. Receipt of
/// further frames is not blocked by execution (each invocation runs on its
/// own task), but the busy flag keeps the external contract of a single
/// outstanding invocation.
pub struct WorkerRuntime {
    config: WorkerConfig,
    engine: Arc<dyn FunctionEngine>,
}

impl WorkerRuntime {
    pub fn new(config: WorkerConfig, engine: Arc<dyn FunctionEngine>) -> Self {
        Self { config, engine }
    }

    pub async fn run(self) -> Result<(), WorkerError> {
        let stream = self.connect_transport().await?;
        info!(
            component = %self.config.component_id,
            transport = %self.config.transport_addr,
            "Connected to control plane"
        );

        // Both halves stay locals of this task, so killing the worker task
        // tears the whole connection down.
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
        let mut writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());

        send_message(
            &mut writer,
            envelope(
                actor::MessageType::Ready,
                actor::message::Body::Ready(actor::Ready {
                    component_id: self.config.component_id.clone(),
                }),
            ),
        )
        .await?;
        debug!("READY sent, waiting for FUNCTION");

        let function = self.wait_for_function(&mut reader).await?;
        let function_language = function.language;

        match timeout(
            self.config.dependency_install_timeout,
            self.engine.register(&function),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(function = %function.name, "Function registration failed: {err}");
                return Err(WorkerError::Registration(err.to_string()));
            }
            Err(_) => {
                error!(function = %function.name, "Function registration timed out");
                return Err(WorkerError::Registration(format!(
                    "registration exceeded {:?}",
                    self.config.dependency_install_timeout
                )));
            }
        }

        send_message(
            &mut writer,
            envelope(
                actor::MessageType::Ack,
                actor::message::Body::Ack(actor::Ack {}),
            ),
        )
        .await?;
        info!(function = %function.name, "Function registered, serving invocations");

        let store = StoreClient::connect_lazy(&self.config.store_addr)
            .map_err(|err| WorkerError::Store(err.to_string()))?;

        // The message loop stays single-threaded and owns the socket;
        // dispatch tasks hand their responses back through a queue.
        let (send_tx, mut send_rx) = mpsc::channel::<actor::Message>(32);
        let busy = Arc::new(AtomicBool::new(false));

        loop {
            tokio::select! {
                frame = reader.next() => {
                    let Some(frame) = frame else { break };
                    let frame = frame.map_err(|err| WorkerError::Transport(err.to_string()))?;
                    let message = match actor::Message::decode(&frame[..]) {
                        Ok(message) => message,
                        Err(err) => {
                            warn!("Dropping undecodable frame: {err}");
                            continue;
                        }
                    };
                    match message.body {
                        Some(actor::message::Body::InvokeRequest(request)) => {
                            if busy.swap(true, Ordering::SeqCst) {
                                warn!(session = %request.session_id, "Invocation while busy, refusing");
                                let _ = send_tx
                                    .send(error_response(
                                        request.session_id,
                                        "component already has an invocation in flight".to_string(),
                                    ))
                                    .await;
                                continue;
                            }
                            let engine = self.engine.clone();
                            let store = store.clone();
                            let send_tx = send_tx.clone();
                            let busy = busy.clone();
                            let fetch_timeout = self.config.fetch_timeout;
                            tokio::spawn(async move {
                                let response = dispatch_invocation(
                                    engine,
                                    store,
                                    function_language,
                                    &request,
                                    fetch_timeout,
                                )
                                .await;
                                busy.store(false, Ordering::SeqCst);
                                let _ = send_tx.send(response).await;
                            });
                        }
                        Some(actor::message::Body::Function(_)) => {
                            warn!("FUNCTION after registration ignored; components hold one function for life");
                        }
                        other => {
                            debug!("Ignoring message: {other:?}");
                        }
                    }
                }
                Some(message) = send_rx.recv() => {
                    send_message(&mut writer, message).await?;
                }
            }
        }

        info!("Transport closed, worker exiting");
        Ok(())
    }

    async fn connect_transport(&self) -> Result<TcpStream, WorkerError> {
        let mut backoff = self.config.connect_backoff;
        let mut last_error = None;
        for _ in 0..self.config.connect_attempts {
            match TcpStream::connect(&self.config.transport_addr).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    last_error = Some(err.to_string());
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                }
            }
        }
        Err(WorkerError::Transport(format!(
            "could not reach {} after {} attempts: {}",
            self.config.transport_addr,
            self.config.connect_attempts,
            last_error.unwrap_or_default()
        )))
    }

    async fn wait_for_function(
        &self,
        reader: &mut FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    ) -> Result<FunctionPayload, WorkerError> {
        while let Some(frame) = reader.next().await {
            let frame = frame.map_err(|err| WorkerError::Transport(err.to_string()))?;
            let message = actor::Message::decode(&frame[..])
                .map_err(|err| WorkerError::Transport(err.to_string()))?;
            match message.body {
                Some(actor::message::Body::Function(function)) => {
                    return Ok(FunctionPayload {
                        name: function.name,
                        language: Language::from_proto_i32(function.language),
                        body: bytes::Bytes::from(function.pickled_body),
                        requirements: function.requirements,
                    });
                }
                other => {
                    warn!("Unexpected message while waiting for FUNCTION: {other:?}");
                }
            }
        }
        Err(WorkerError::Transport(
            "connection closed before FUNCTION".to_string(),
        ))
    }
}

async fn dispatch_invocation(
    engine: Arc<dyn FunctionEngine>,
    store: StoreClient,
    function_language: Language,
    request: &actor::InvokeRequest,
    fetch_timeout: Duration,
) -> actor::Message {
    let session_id = request.session_id.clone();

    let mut args: Vec<(String, FunctionValue)> = Vec::with_capacity(request.args.len());
    for arg in &request.args {
        let reference: ObjectRef = match arg.value.clone().and_then(|v| v.try_into().ok()) {
            Some(reference) => reference,
            None => {
                return error_response(
                    session_id,
                    format!("argument {} has no usable object reference", arg.param),
                )
            }
        };
        let fetched = match timeout(fetch_timeout, store.get_object(&reference)).await {
            Ok(Ok(object)) => object,
            Ok(Err(err)) => {
                return error_response(
                    session_id,
                    format!("failed to fetch argument {}: {err}", arg.param),
                )
            }
            Err(_) => {
                return error_response(
                    session_id,
                    format!("fetch of argument {} exceeded {fetch_timeout:?}", arg.param),
                )
            }
        };
        match encdec::decode(&fetched) {
            Ok(value) => args.push((arg.param.clone(), value)),
            Err(err) => {
                return error_response(
                    session_id,
                    format!("failed to decode argument {}: {err}", arg.param),
                )
            }
        }
    }

    debug!(session = %session_id, args = args.len(), "Executing function");
    let started = Instant::now();
    let result = engine.invoke(args).await;
    let calc_latency_ms = started.elapsed().as_millis() as u64;

    let value = match result {
        Ok(value) => value,
        Err(err) => return error_response_with_latency(session_id, err.to_string(), calc_latency_ms),
    };

    let (data, language) = match encdec::encode(value, function_language) {
        Ok(encoded) => encoded,
        Err(err) => {
            return error_response_with_latency(
                session_id,
                format!("failed to encode result: {err}"),
                calc_latency_ms,
            )
        }
    };

    match store.save_object(EncodedValue::new(language, data)).await {
        Ok(reference) => {
            debug!(session = %session_id, result = %reference, calc_latency_ms, "Invocation complete");
            envelope(
                actor::MessageType::InvokeResponse,
                actor::message::Body::InvokeResponse(actor::InvokeResponse {
                    session_id,
                    result: Some(reference.into()),
                    error: String::new(),
                    calc_latency_ms,
                }),
            )
        }
        Err(err) => error_response_with_latency(
            session_id,
            format!("failed to save result: {err}"),
            calc_latency_ms,
        ),
    }
}

fn envelope(message_type: actor::MessageType, body: actor::message::Body) -> actor::Message {
    actor::Message {
        r#type: message_type as i32,
        body: Some(body),
    }
}

fn error_response(session_id: String, error: String) -> actor::Message {
    error_response_with_latency(session_id, error, 0)
}

fn error_response_with_latency(
    session_id: String,
    error: String,
    calc_latency_ms: u64,
) -> actor::Message {
    envelope(
        actor::MessageType::InvokeResponse,
        actor::message::Body::InvokeResponse(actor::InvokeResponse {
            session_id,
            result: None,
            error,
            calc_latency_ms,
        }),
    )
}

async fn send_message(
    writer: &mut FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    message: actor::Message,
) -> Result<(), WorkerError> {
    let bytes = bytes::Bytes::from(message.encode_to_vec());
    writer
        .send(bytes)
        .await
        .map_err(|err| WorkerError::Transport(err.to_string()))
}
