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

use std::net::SocketAddr;

use plexus_api_grpc::proto::plexus::peer::v1::peer_service_server::PeerServiceServer;
use plexus_api_grpc::proto::plexus::store::v1::object_store_service_server::ObjectStoreServiceServer;
use plexus_api_grpc::proto::plexus::workflow::v1::workflow_service_server::WorkflowServiceServer;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use crate::bootstrap::Services;
use crate::grpcapi::peer::PeerGrpcApi;
use crate::grpcapi::store::StoreGrpcApi;
use crate::grpcapi::workflow::WorkflowGrpcApi;

mod peer;
mod store;
mod workflow;

/// Starts the combined gRPC endpoint (client submission, peer mesh, object
/// store) plus health and reflection, and returns the bound port.
pub async fn start_grpc_server(
    addr: SocketAddr,
    services: &Services,
    join_set: &mut JoinSet<Result<(), anyhow::Error>>,
) -> Result<u16, anyhow::Error> {
    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<WorkflowServiceServer<WorkflowGrpcApi>>()
        .await;
    health_reporter
        .set_serving::<PeerServiceServer<PeerGrpcApi>>()
        .await;
    health_reporter
        .set_serving::<ObjectStoreServiceServer<StoreGrpcApi>>()
        .await;

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(plexus_api_grpc::proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let listener = TcpListener::bind(addr).await?;
    let port = listener.local_addr()?.port();

    let workflow_api = WorkflowGrpcApi {
        workflow_service: services.workflow_service.clone(),
    };
    let peer_api = PeerGrpcApi {
        peers: services.peers.clone(),
        scheduler: services.scheduler.clone(),
        store: services.store.clone(),
    };
    let store_api = StoreGrpcApi {
        store: services.store.clone(),
    };

    join_set.spawn(async move {
        Server::builder()
            .add_service(reflection_service)
            .add_service(health_service)
            .add_service(WorkflowServiceServer::new(workflow_api))
            .add_service(PeerServiceServer::new(peer_api))
            .add_service(ObjectStoreServiceServer::new(store_api))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .map_err(anyhow::Error::from)
    });

    Ok(port)
}
