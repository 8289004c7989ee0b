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

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use plexus_api_grpc::proto::plexus::common::{Empty, ErrorBody};
use plexus_api_grpc::proto::plexus::peer::v1 as peer_proto;
use plexus_api_grpc::proto::plexus::peer::v1::peer_service_server::PeerService as GrpcPeerService;
use plexus_common::model::{
    ErrorKind, ObjectId, ProviderId, SessionId, TaskId, WorkflowId,
};
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::service::peers::{PeerLayer, RemoteCompletion};
use crate::service::scheduler::{RemoteDispatch, Scheduler};
use crate::service::store::ObjectStore;

pub struct PeerGrpcApi {
    pub peers: Arc<PeerLayer>,
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<ObjectStore>,
}

impl PeerGrpcApi {
    fn parse_dispatch(
        &self,
        request: peer_proto::DispatchRequest,
    ) -> Result<RemoteDispatch, String> {
        let session_id = SessionId::from_str(&request.session_id)?;
        let workflow_id = WorkflowId::from_str(&request.workflow_id)?;
        if request.task_id.is_empty() {
            return Err("missing task id".to_string());
        }
        let function = request
            .function
            .ok_or_else(|| "missing function".to_string())?
            .try_into()?;
        let args = request
            .args
            .into_iter()
            .map(|arg| {
                let value = arg
                    .value
                    .ok_or_else(|| format!("arg {} has no value", arg.param))?
                    .try_into()?;
                Ok((arg.param, value))
            })
            .collect::<Result<Vec<_>, String>>()?;
        if request.reply_to.is_empty() {
            return Err("missing reply_to address".to_string());
        }

        Ok(RemoteDispatch {
            session_id,
            workflow_id,
            task_id: TaskId::new(request.task_id),
            function,
            args,
            provider_hint: if request.provider_id.is_empty() {
                None
            } else {
                Some(ProviderId::new(request.provider_id))
            },
            reply_to: request.reply_to,
            timeout: Duration::from_millis(request.timeout_ms.max(1)),
        })
    }
}

#[tonic::async_trait]
impl GrpcPeerService for PeerGrpcApi {
    async fn heartbeat(
        &self,
        request: Request<peer_proto::HeartbeatRequest>,
    ) -> Result<Response<peer_proto::HeartbeatResponse>, Status> {
        let request = request.into_inner();
        let catalog = request
            .catalog
            .ok_or_else(|| Status::invalid_argument("missing catalog"))?;
        self.peers
            .handle_heartbeat(catalog)
            .map_err(Status::invalid_argument)?;
        Ok(Response::new(peer_proto::HeartbeatResponse {
            ack: Some(Empty {}),
        }))
    }

    async fn dispatch(
        &self,
        request: Request<peer_proto::DispatchRequest>,
    ) -> Result<Response<peer_proto::DispatchResponse>, Status> {
        let request = request.into_inner();
        debug!(
            task = %request.task_id,
            session = %request.session_id,
            "Incoming peer dispatch"
        );

        let dispatch = match self.parse_dispatch(request) {
            Ok(dispatch) => dispatch,
            Err(error) => {
                return Ok(Response::new(peer_proto::DispatchResponse {
                    result: Some(peer_proto::dispatch_response::Result::Refused(ErrorBody {
                        error,
                    })),
                }))
            }
        };

        let result = match self.scheduler.handle_remote_dispatch(dispatch) {
            Ok(()) => peer_proto::dispatch_response::Result::Accepted(Empty {}),
            Err(reason) => {
                peer_proto::dispatch_response::Result::Refused(ErrorBody { error: reason })
            }
        };
        Ok(Response::new(peer_proto::DispatchResponse {
            result: Some(result),
        }))
    }

    async fn complete(
        &self,
        request: Request<peer_proto::CompleteRequest>,
    ) -> Result<Response<peer_proto::CompleteResponse>, Status> {
        let request = request.into_inner();
        let session_id = SessionId::from_str(&request.session_id)
            .map_err(Status::invalid_argument)?;
        let task_id = TaskId::new(request.task_id);

        let error = if request.error.is_empty() {
            None
        } else {
            let kind = match request.error_kind.as_str() {
                "no_capacity" => ErrorKind::NoCapacity,
                "cold_start_failed" => ErrorKind::ColdStartFailed,
                "worker_crashed" => ErrorKind::WorkerCrashed,
                "timeout" => ErrorKind::Timeout,
                "cancelled" => ErrorKind::Cancelled,
                "peer_unreachable" => ErrorKind::PeerUnreachable,
                "upstream_failed" => ErrorKind::UpstreamFailed,
                "invalid_argument" => ErrorKind::InvalidArgument,
                _ => ErrorKind::Fatal,
            };
            Some((kind, request.error))
        };

        self.peers.resolve_completion(
            &session_id,
            &task_id,
            RemoteCompletion {
                result: error
                    .is_none()
                    .then(|| request.result.and_then(|r| r.try_into().ok()))
                    .flatten(),
                error,
                calc_latency: Duration::from_millis(request.calc_latency_ms),
            },
        );

        Ok(Response::new(peer_proto::CompleteResponse {
            ack: Some(Empty {}),
        }))
    }

    async fn fetch_object(
        &self,
        request: Request<peer_proto::FetchObjectRequest>,
    ) -> Result<Response<peer_proto::FetchObjectResponse>, Status> {
        let request = request.into_inner();
        let object_id = ObjectId::new(request.object_id);
        let result = match self.store.get_local(&object_id) {
            Some(object) => peer_proto::fetch_object_response::Result::Success(object.into()),
            None => peer_proto::fetch_object_response::Result::NotFound(Empty {}),
        };
        Ok(Response::new(peer_proto::FetchObjectResponse {
            result: Some(result),
        }))
    }

    async fn fetch_stream_chunk(
        &self,
        request: Request<peer_proto::FetchStreamChunkRequest>,
    ) -> Result<Response<peer_proto::FetchStreamChunkResponse>, Status> {
        let request = request.into_inner();
        let object_id = ObjectId::new(request.object_id);
        let result = match self.store.get_chunk_local(&object_id, request.offset) {
            Some(chunk) => {
                peer_proto::fetch_stream_chunk_response::Result::Success(chunk.into())
            }
            None => peer_proto::fetch_stream_chunk_response::Result::NotFound(Empty {}),
        };
        Ok(Response::new(peer_proto::FetchStreamChunkResponse {
            result: Some(result),
        }))
    }
}
