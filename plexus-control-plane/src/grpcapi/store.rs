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

use plexus_api_grpc::proto::plexus::common::{Empty, ErrorBody};
use plexus_api_grpc::proto::plexus::store::v1 as store_proto;
use plexus_api_grpc::proto::plexus::store::v1::object_store_service_server::ObjectStoreService as GrpcObjectStoreService;
use plexus_common::model::ObjectId;
use tonic::{Request, Response, Status};

use crate::service::store::{ObjectStore, StoreError};

pub struct StoreGrpcApi {
    pub store: Arc<ObjectStore>,
}

#[tonic::async_trait]
impl GrpcObjectStoreService for StoreGrpcApi {
    async fn save_object(
        &self,
        request: Request<store_proto::SaveObjectRequest>,
    ) -> Result<Response<store_proto::SaveObjectResponse>, Status> {
        let request = request.into_inner();
        let result = match request.object {
            None => store_proto::save_object_response::Result::Error(ErrorBody {
                error: "missing object".to_string(),
            }),
            Some(object) => match self.store.save(object.into(), None) {
                Ok(reference) => {
                    store_proto::save_object_response::Result::Success(reference.into())
                }
                Err(err) => store_proto::save_object_response::Result::Error(ErrorBody {
                    error: err.to_string(),
                }),
            },
        };
        Ok(Response::new(store_proto::SaveObjectResponse {
            result: Some(result),
        }))
    }

    async fn get_object(
        &self,
        request: Request<store_proto::GetObjectRequest>,
    ) -> Result<Response<store_proto::GetObjectResponse>, Status> {
        let request = request.into_inner();
        let reference = request
            .object_ref
            .ok_or_else(|| Status::invalid_argument("missing object ref"))?
            .try_into()
            .map_err(Status::invalid_argument)?;

        let result = match self.store.get(&reference).await {
            Ok(object) => store_proto::get_object_response::Result::Success(object.into()),
            Err(StoreError::NotFound(_)) => {
                store_proto::get_object_response::Result::NotFound(Empty {})
            }
            Err(err) => store_proto::get_object_response::Result::Error(ErrorBody {
                error: err.to_string(),
            }),
        };
        Ok(Response::new(store_proto::GetObjectResponse {
            result: Some(result),
        }))
    }

    async fn save_stream_chunk(
        &self,
        request: Request<store_proto::SaveStreamChunkRequest>,
    ) -> Result<Response<store_proto::SaveStreamChunkResponse>, Status> {
        let request = request.into_inner();
        let chunk = request
            .chunk
            .ok_or_else(|| Status::invalid_argument("missing chunk"))?
            .try_into()
            .map_err(Status::invalid_argument)?;

        let result = match self.store.save_chunk(chunk) {
            Ok(()) => store_proto::save_stream_chunk_response::Result::Success(Empty {}),
            Err(err) => store_proto::save_stream_chunk_response::Result::Error(ErrorBody {
                error: err.to_string(),
            }),
        };
        Ok(Response::new(store_proto::SaveStreamChunkResponse {
            result: Some(result),
        }))
    }

    async fn get_stream_chunk(
        &self,
        request: Request<store_proto::GetStreamChunkRequest>,
    ) -> Result<Response<store_proto::GetStreamChunkResponse>, Status> {
        let request = request.into_inner();
        let object_id = ObjectId::new(request.object_id);
        let result = match self.store.get_chunk_local(&object_id, request.offset) {
            Some(chunk) => store_proto::get_stream_chunk_response::Result::Success(chunk.into()),
            None => store_proto::get_stream_chunk_response::Result::NotFound(Empty {}),
        };
        Ok(Response::new(store_proto::GetStreamChunkResponse {
            result: Some(result),
        }))
    }
}
