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

use plexus_api_grpc::proto::plexus::store::v1 as store_proto;
use plexus_api_grpc::proto::plexus::store::v1::object_store_service_client::ObjectStoreServiceClient;
use plexus_common::model::{EncodedValue, ObjectRef};
use tonic::transport::{Channel, Endpoint};

#[derive(Debug, thiserror::Error)]
pub enum StoreClientError {
    #[error("store unreachable: {0}")]
    Unreachable(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("store call failed: {0}")]
    Failed(String),
}

/// Thin wrapper over the control plane's object store service, used by the
/// worker to fetch arguments and publish results.
#[derive(Clone)]
pub struct StoreClient {
    client: ObjectStoreServiceClient<Channel>,
}

impl StoreClient {
    pub fn connect_lazy(addr: &str) -> Result<Self, StoreClientError> {
        let endpoint = Endpoint::from_shared(format!("http://{addr}"))
            .map_err(|err| StoreClientError::Unreachable(err.to_string()))?;
        Ok(Self {
            client: ObjectStoreServiceClient::new(endpoint.connect_lazy()),
        })
    }

    pub async fn get_object(
        &self,
        reference: &ObjectRef,
    ) -> Result<EncodedValue, StoreClientError> {
        let mut client = self.client.clone();
        let response = client
            .get_object(store_proto::GetObjectRequest {
                object_ref: Some(reference.clone().into()),
            })
            .await
            .map_err(|status| StoreClientError::Unreachable(status.to_string()))?
            .into_inner();
        match response.result {
            Some(store_proto::get_object_response::Result::Success(object)) => Ok(object.into()),
            Some(store_proto::get_object_response::Result::NotFound(_)) => {
                Err(StoreClientError::NotFound(reference.id.to_string()))
            }
            Some(store_proto::get_object_response::Result::Error(body)) => {
                Err(StoreClientError::Failed(body.error))
            }
            None => Err(StoreClientError::Failed("empty response".to_string())),
        }
    }

    pub async fn save_object(&self, value: EncodedValue) -> Result<ObjectRef, StoreClientError> {
        let mut client = self.client.clone();
        let response = client
            .save_object(store_proto::SaveObjectRequest {
                object: Some(value.into()),
            })
            .await
            .map_err(|status| StoreClientError::Unreachable(status.to_string()))?
            .into_inner();
        match response.result {
            Some(store_proto::save_object_response::Result::Success(reference)) => reference
                .try_into()
                .map_err(StoreClientError::Failed),
            Some(store_proto::save_object_response::Result::Error(body)) => {
                Err(StoreClientError::Failed(body.error))
            }
            None => Err(StoreClientError::Failed("empty response".to_string())),
        }
    }
}
