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

pub mod bootstrap;
pub mod config;
pub mod grpcapi;
pub mod metrics;
pub mod model;
pub mod repo;
pub mod service;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::OnceLock;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::info;

use crate::bootstrap::Services;
use crate::config::ControlPlaneConfig;

#[cfg(test)]
test_r::enable!();

/// Addresses handed to workers and peers. They carry real ports, which are
/// only known once the listeners are bound, so they are filled in by
/// `ControlPlane::run`.
pub struct Endpoints {
    grpc: OnceLock<String>,
    router: OnceLock<String>,
}

impl Endpoints {
    pub fn new() -> Self {
        Self {
            grpc: OnceLock::new(),
            router: OnceLock::new(),
        }
    }

    pub fn set_grpc_addr(&self, addr: String) {
        let _ = self.grpc.set(addr);
    }

    pub fn set_router_addr(&self, addr: String) {
        let _ = self.router.set(addr);
    }

    pub fn grpc_addr(&self) -> String {
        self.grpc.get().cloned().unwrap_or_default()
    }

    pub fn router_addr(&self) -> String {
        self.router.get().cloned().unwrap_or_default()
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RunDetails {
    pub grpc_port: u16,
    pub router_port: u16,
    pub metrics_port: u16,
}

/// One control-plane peer: gRPC surfaces, worker transport, gossip and the
/// background sweeps, all spawned onto the caller's JoinSet.
pub struct ControlPlane {
    config: ControlPlaneConfig,
    services: Services,
}

impl ControlPlane {
    pub async fn new(config: ControlPlaneConfig) -> Result<Self, anyhow::Error> {
        let services = Services::new(&config).await?;
        Ok(Self { config, services })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub async fn run(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    ) -> Result<RunDetails, anyhow::Error> {
        let router_listener = TcpListener::bind(SocketAddrV4::new(
            Ipv4Addr::new(0, 0, 0, 0),
            self.config.router_port,
        ))
        .await?;
        let router_port = router_listener.local_addr()?.port();
        self.services.endpoints.set_router_addr(format!(
            "{}:{}",
            self.config.advertised_host, router_port
        ));
        self.services.router.serve(router_listener, join_set).await;

        let grpc_port = grpcapi::start_grpc_server(
            SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), self.config.grpc_port).into(),
            &self.services,
            join_set,
        )
        .await?;
        let grpc_addr = format!("{}:{}", self.config.advertised_host, grpc_port);
        self.services.endpoints.set_grpc_addr(grpc_addr.clone());
        self.services.peers.set_local_address(grpc_addr);

        let metrics_listener = TcpListener::bind(SocketAddrV4::new(
            Ipv4Addr::new(0, 0, 0, 0),
            self.config.metrics_port,
        ))
        .await?;
        let metrics_port = metrics_listener.local_addr()?.port();
        join_set.spawn(async move {
            axum::serve(metrics_listener, metrics::exposition_router())
                .await
                .map_err(anyhow::Error::from)
        });

        self.services.peers.run_gossip(join_set);
        self.services.peers.run_liveness(join_set);
        self.services.store.run_sweeper(join_set);
        self.services
            .providers
            .run_heartbeats(join_set, self.config.providers.heartbeat_interval);
        self.services.workflow_service.run_instance_sweeper(join_set);
        self.run_ledger_sweeper(join_set);

        info!(
            "Started control-plane peer {} on ports: grpc: {}, router: {}, metrics: {}",
            self.config.peer_id, grpc_port, router_port, metrics_port
        );

        Ok(RunDetails {
            grpc_port,
            router_port,
            metrics_port,
        })
    }

    /// Releases expired reservations, cascades dead providers onto their
    /// components, and tears down evictable components.
    fn run_ledger_sweeper(&self, join_set: &mut JoinSet<Result<(), anyhow::Error>>) {
        let ledger = self.services.ledger.clone();
        let pool = self.services.pool.clone();
        let providers = self.services.providers.clone();
        join_set.spawn(async move {
            let mut ticker = tokio::time::interval(ledger.sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let outcome = ledger.sweep();
                for provider_id in &outcome.dead_providers {
                    pool.mark_provider_dead(provider_id);
                }
                for component_id in &outcome.orphaned_components {
                    pool.mark_dead(component_id);
                }
                for evicted in pool.collect_evictable() {
                    ledger.release(evicted.reservation_id);
                    providers.stop_component(&evicted.descriptor).await;
                }
            }
        });
    }
}
