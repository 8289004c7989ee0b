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
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use plexus_api_grpc::proto::plexus::actor;
use plexus_common::model::{ComponentId, ObjectRef, SessionId};
use prost::Message as ProstMessage;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::model::ComponentState;
use crate::service::pool::ComponentPool;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("component {0} has no live transport")]
    ComponentUnavailable(ComponentId),
    #[error("component {0} already has an invocation in flight")]
    Busy(ComponentId),
    #[error("component {0} send queue stayed full past the retry budget")]
    QueueFull(ComponentId),
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),
    #[error("invocation exceeded {0:?}")]
    InvokeTimeout(Duration),
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// What the worker reported back for one invocation.
#[derive(Debug, Clone)]
pub struct InvokeReply {
    pub result: Option<ObjectRef>,
    pub error: Option<String>,
    pub calc_latency: Duration,
}

struct InFlight {
    session_id: SessionId,
    reply_tx: oneshot::Sender<Result<InvokeReply, RouterError>>,
}

struct ConnectionHandle {
    outbound: mpsc::Sender<actor::Message>,
    in_flight: Arc<Mutex<Option<InFlight>>>,
}

struct ExpectedComponent {
    function: actor::Function,
    ready_tx: oneshot::Sender<Result<(), RouterError>>,
}

#[derive(Default)]
struct RouterState {
    expected: HashMap<ComponentId, ExpectedComponent>,
    connections: HashMap<ComponentId, ConnectionHandle>,
}

/// Multiplexes all worker transports over one listening endpoint. Every
/// connection is claimed by a READY envelope carrying the component id the
/// control plane injected at start; after the FUNCTION/ACK handshake the
/// component is IDLE and accepts one INVOKE_REQUEST at a time.
pub struct Router {
    pool: Arc<ComponentPool>,
    config: RouterConfig,
    state: Mutex<RouterState>,
}

impl Router {
    pub fn new(pool: Arc<ComponentPool>, config: RouterConfig) -> Self {
        Self {
            pool,
            config,
            state: Mutex::new(RouterState::default()),
        }
    }

    /// Registers a cold-starting component before its sandbox boots. The
    /// returned receiver resolves once the worker has ACKed its function,
    /// or with the handshake failure.
    pub fn expect_component(
        &self,
        component_id: ComponentId,
        function: actor::Function,
    ) -> oneshot::Receiver<Result<(), RouterError>> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        state.expected.insert(
            component_id,
            ExpectedComponent { function, ready_tx },
        );
        ready_rx
    }

    /// Forgets a component whose cold start was given up on.
    pub fn abandon_expected(&self, component_id: &ComponentId) {
        let mut state = self.state.lock().unwrap();
        state.expected.remove(component_id);
    }

    pub async fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    ) {
        let router = self.clone();
        join_set.spawn(async move {
            info!("Worker transport listening");
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!(%addr, "Worker transport connection accepted");
                        let router = router.clone();
                        tokio::spawn(async move {
                            if let Err(err) = router.handle_connection(stream).await {
                                debug!("Worker transport connection ended: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        warn!("Failed to accept worker transport connection: {err}");
                    }
                }
            }
        });
    }

    /// Sends one INVOKE_REQUEST and waits for the matching response. The
    /// caller must have checked the component out of the pool; a second
    /// in-flight invocation on one component is an invariant violation.
    pub async fn invoke(
        &self,
        component_id: &ComponentId,
        session_id: &SessionId,
        args: Vec<(String, ObjectRef)>,
        invoke_timeout: Duration,
    ) -> Result<InvokeReply, RouterError> {
        let (outbound, in_flight) = {
            let state = self.state.lock().unwrap();
            let conn = state
                .connections
                .get(component_id)
                .ok_or(RouterError::ComponentUnavailable(*component_id))?;
            (conn.outbound.clone(), conn.in_flight.clone())
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut slot = in_flight.lock().unwrap();
            if slot.is_some() {
                return Err(RouterError::Busy(*component_id));
            }
            *slot = Some(InFlight {
                session_id: *session_id,
                reply_tx,
            });
        }

        let request = actor::Message {
            r#type: actor::MessageType::InvokeRequest as i32,
            body: Some(actor::message::Body::InvokeRequest(actor::InvokeRequest {
                session_id: session_id.to_string(),
                args: args
                    .into_iter()
                    .map(|(param, value)| actor::Arg {
                        param,
                        value: Some(value.into()),
                    })
                    .collect(),
            })),
        };

        // Transport sends are non-blocking for the caller; a queue that
        // stays full past the retry budget means the worker stopped
        // draining it and the component is declared dead.
        let mut message = request;
        let mut retries = 0u32;
        loop {
            match outbound.try_send(message) {
                Ok(()) => break,
                Err(mpsc::error::TrySendError::Full(returned)) => {
                    message = returned;
                    retries += 1;
                    if retries > self.config.send_retry_budget {
                        in_flight.lock().unwrap().take();
                        self.pool.mark_dead(component_id);
                        self.drop_connection(component_id);
                        return Err(RouterError::QueueFull(*component_id));
                    }
                    tokio::time::sleep(self.config.send_retry_delay).await;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    in_flight.lock().unwrap().take();
                    return Err(RouterError::ComponentUnavailable(*component_id));
                }
            }
        }

        match timeout(invoke_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(RouterError::WorkerCrashed(
                "transport closed mid-invocation".to_string(),
            )),
            Err(_) => {
                // Fabricated timeout: clear the slot so the late reply (if
                // any) only finishes the drain, and stop routing new work
                // to this component.
                in_flight.lock().unwrap().take();
                self.pool.mark_draining(component_id);
                Err(RouterError::InvokeTimeout(invoke_timeout))
            }
        }
    }

    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
    ) -> Result<(), RouterError> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
        let mut writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());

        let first = timeout(self.config.handshake_timeout, reader.next())
            .await
            .map_err(|_| RouterError::Handshake("timed out waiting for READY".to_string()))?
            .ok_or_else(|| RouterError::Handshake("connection closed before READY".to_string()))?
            .map_err(|err| RouterError::Handshake(err.to_string()))?;

        let message = actor::Message::decode(&first[..])
            .map_err(|err| RouterError::Handshake(format!("undecodable first frame: {err}")))?;
        let component_id = match message.body {
            Some(actor::message::Body::Ready(ready)) => {
                ComponentId::from_str(&ready.component_id)
                    .map_err(|err| RouterError::Handshake(err))?
            }
            _ => {
                return Err(RouterError::Handshake(
                    "first frame was not READY".to_string(),
                ))
            }
        };

        let expected = {
            let mut state = self.state.lock().unwrap();
            state.expected.remove(&component_id)
        };
        let Some(expected) = expected else {
            warn!(component = %component_id, "READY from unknown component, closing");
            return Err(RouterError::Handshake(format!(
                "unknown component {component_id}"
            )));
        };

        let (outbound_tx, mut outbound_rx) =
            mpsc::channel::<actor::Message>(self.config.send_queue_depth);
        let in_flight: Arc<Mutex<Option<InFlight>>> = Arc::new(Mutex::new(None));
        {
            let mut state = self.state.lock().unwrap();
            state.connections.insert(
                component_id,
                ConnectionHandle {
                    outbound: outbound_tx.clone(),
                    in_flight: in_flight.clone(),
                },
            );
        }

        let writer_task = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let bytes = bytes::Bytes::from(message.encode_to_vec());
                if writer.send(bytes).await.is_err() {
                    break;
                }
            }
        });

        // Push the cached FUNCTION and wait for the ACK; dependency install
        // happens on the worker side of this exchange.
        let function_message = actor::Message {
            r#type: actor::MessageType::Function as i32,
            body: Some(actor::message::Body::Function(expected.function)),
        };
        if outbound_tx.send(function_message).await.is_err() {
            let _ = expected
                .ready_tx
                .send(Err(RouterError::Handshake("send failed".to_string())));
            self.disconnect(&component_id, &in_flight);
            writer_task.abort();
            return Err(RouterError::Handshake("send failed".to_string()));
        }

        match self
            .wait_for_ack(&mut reader, self.config.function_ack_timeout)
            .await
        {
            Ok(()) => {
                self.pool.mark_idle(&component_id);
                debug!(component = %component_id, "Component handshake complete");
                let _ = expected.ready_tx.send(Ok(()));
            }
            Err(err) => {
                warn!(component = %component_id, "Component handshake failed: {err}");
                let _ = expected
                    .ready_tx
                    .send(Err(RouterError::Handshake(err.to_string())));
                self.disconnect(&component_id, &in_flight);
                writer_task.abort();
                return Err(err);
            }
        }

        // Main receive loop; frames for one component arrive in send order.
        let result = self.receive_loop(&component_id, &mut reader, &in_flight).await;
        self.disconnect(&component_id, &in_flight);
        writer_task.abort();
        result
    }

    async fn wait_for_ack(
        &self,
        reader: &mut FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
        ack_timeout: Duration,
    ) -> Result<(), RouterError> {
        loop {
            let frame = timeout(ack_timeout, reader.next())
                .await
                .map_err(|_| RouterError::Handshake("timed out waiting for ACK".to_string()))?
                .ok_or_else(|| {
                    RouterError::Handshake("connection closed before ACK".to_string())
                })?
                .map_err(|err| RouterError::Handshake(err.to_string()))?;
            let message = actor::Message::decode(&frame[..])
                .map_err(|err| RouterError::Handshake(err.to_string()))?;
            match message.body {
                Some(actor::message::Body::Ack(_)) => return Ok(()),
                // A worker may re-send READY while waiting; ignore.
                Some(actor::message::Body::Ready(_)) => continue,
                other => {
                    return Err(RouterError::Handshake(format!(
                        "expected ACK, got {other:?}"
                    )))
                }
            }
        }
    }

    async fn receive_loop(
        &self,
        component_id: &ComponentId,
        reader: &mut FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
        in_flight: &Arc<Mutex<Option<InFlight>>>,
    ) -> Result<(), RouterError> {
        while let Some(frame) = reader.next().await {
            let frame = frame.map_err(|err| RouterError::WorkerCrashed(err.to_string()))?;
            let message = match actor::Message::decode(&frame[..]) {
                Ok(message) => message,
                Err(err) => {
                    warn!(component = %component_id, "Dropping undecodable frame: {err}");
                    continue;
                }
            };
            match message.body {
                Some(actor::message::Body::InvokeResponse(response)) => {
                    self.handle_invoke_response(component_id, response, in_flight);
                }
                Some(actor::message::Body::Ready(_)) => {
                    debug!(component = %component_id, "Ignoring duplicate READY");
                }
                Some(actor::message::Body::Ack(_)) => {}
                other => {
                    warn!(component = %component_id, "Unexpected message from worker: {other:?}");
                }
            }
        }
        Ok(())
    }

    fn handle_invoke_response(
        &self,
        component_id: &ComponentId,
        response: actor::InvokeResponse,
        in_flight: &Arc<Mutex<Option<InFlight>>>,
    ) {
        let slot = in_flight.lock().unwrap().take();
        match slot {
            Some(in_flight) => {
                if in_flight.session_id.to_string() != response.session_id {
                    warn!(
                        component = %component_id,
                        expected = %in_flight.session_id,
                        got = %response.session_id,
                        "Session mismatch on INVOKE_RESPONSE"
                    );
                }
                let reply = InvokeReply {
                    result: response
                        .result
                        .and_then(|reference| reference.try_into().ok()),
                    error: if response.error.is_empty() {
                        None
                    } else {
                        Some(response.error)
                    },
                    calc_latency: Duration::from_millis(response.calc_latency_ms),
                };
                let _ = in_flight.reply_tx.send(Ok(reply));
            }
            None => {
                // Late reply after a fabricated timeout: the drain is done.
                if self.pool.state_of(component_id) == Some(ComponentState::Draining) {
                    debug!(component = %component_id, "Drained component delivered its late reply");
                    self.pool.mark_dead(component_id);
                }
            }
        }
    }

    fn disconnect(&self, component_id: &ComponentId, in_flight: &Arc<Mutex<Option<InFlight>>>) {
        if let Some(in_flight) = in_flight.lock().unwrap().take() {
            let _ = in_flight.reply_tx.send(Err(RouterError::WorkerCrashed(
                "transport closed mid-invocation".to_string(),
            )));
        }
        self.drop_connection(component_id);
        self.pool.mark_dead(component_id);
    }

    fn drop_connection(&self, component_id: &ComponentId) {
        let mut state = self.state.lock().unwrap();
        state.connections.remove(component_id);
    }
}
