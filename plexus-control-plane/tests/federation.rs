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

test_r::enable!();

mod common;

use std::sync::Arc;
use std::time::Duration;

use plexus_common::model::{PeerId, Resources};
use plexus_control_plane::config::PeerSeedConfig;
use plexus_worker::engine::native::NativeEngine;
use serde_json::json;
use test_r::test;

use common::{
    decode_json_output, from_input, from_task, json_function, submit_request, task, EngineFactory,
    TestCluster,
};

fn tagged_capacity(tag: &str) -> Resources {
    Resources::new(1000, 1 << 30, 0).with_tags(vec![tag.to_string()])
}

fn tagged_function(name: &str, tag: &str) -> plexus_common::model::FunctionSpec {
    let mut function = json_function(name, 100);
    function.resources = function.resources.with_tags(vec![tag.to_string()]);
    function
}

async fn wait_for_catalog_convergence(clusters: &[&TestCluster], provider_count: usize) {
    for _ in 0..100 {
        let converged = clusters.iter().all(|cluster| {
            let snapshot = cluster.control_plane.services().ledger.snapshot();
            snapshot
                .providers
                .iter()
                .filter(|provider| provider.reachable)
                .count()
                == provider_count
        });
        if converged {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("peer catalogs did not converge");
}

// Property 8: after a few gossip rounds all live peers agree on the set of
// live providers and their declared capacities.
#[test]
async fn peer_catalogs_converge() {
    let noop_factory: EngineFactory = Arc::new(NativeEngine::new);
    let p1 = TestCluster::start(
        "peer-conv-one",
        vec![],
        tagged_capacity("p1"),
        noop_factory.clone(),
    )
    .await;
    let p2 = TestCluster::start(
        "peer-conv-two",
        vec![PeerSeedConfig {
            peer_id: "peer-conv-one".to_string(),
            address: p1.grpc_addr(),
        }],
        tagged_capacity("p2"),
        noop_factory,
    )
    .await;

    wait_for_catalog_convergence(&[&p1, &p2], 2).await;

    let view_one = p1.control_plane.services().ledger.snapshot();
    let view_two = p2.control_plane.services().ledger.snapshot();
    for provider in &view_one.providers {
        let other = view_two
            .provider(&provider.id)
            .expect("provider known on both peers");
        assert_eq!(provider.capacity, other.capacity);
    }
}

// S5: T1 runs on peer one, T2 runs on peer two; T2's worker pulls T1's
// result across peers through the object store's source hint.
#[test]
async fn cross_peer_input_is_fetched_from_the_source_peer() {
    let factory_one: EngineFactory = Arc::new(|| {
        NativeEngine::new().with_function("step1", |args| {
            let value = args["value"].as_str().ok_or("value is not a string")?;
            Ok(json!(format!("T1:{value}")))
        })
    });
    let factory_two: EngineFactory = Arc::new(|| {
        NativeEngine::new().with_function("step2", |args| {
            let value = args["value"].as_str().ok_or("value is not a string")?;
            Ok(json!(format!("T2:{value}")))
        })
    });

    let p1 = TestCluster::start(
        "peer-s5-one",
        vec![],
        tagged_capacity("p1"),
        factory_one,
    )
    .await;
    let p2 = TestCluster::start(
        "peer-s5-two",
        vec![PeerSeedConfig {
            peer_id: "peer-s5-one".to_string(),
            address: p1.grpc_addr(),
        }],
        tagged_capacity("p2"),
        factory_two,
    )
    .await;

    wait_for_catalog_convergence(&[&p1, &p2], 2).await;

    // step1 only fits peer one's provider, step2 only peer two's.
    let request = submit_request(
        vec![
            task("t1", "step1", vec![("value", from_input("seed"))], false),
            task("t2", "step2", vec![("value", from_task("t1"))], true),
        ],
        vec![
            tagged_function("step1", "p1"),
            tagged_function("step2", "p2"),
        ],
        vec![("seed", json!("hi"))],
    );

    let service = p1.workflow_service();
    let workflow_id = service.submit(request).await.unwrap();
    let output = service.wait(&workflow_id).await.unwrap();

    assert_eq!(decode_json_output(&output.object), json!("T2:T1:hi"));
    // The output object was materialised on the executing peer and fetched
    // back through the mesh.
    assert_eq!(
        output.reference.source,
        Some(PeerId::new("peer-s5-two"))
    );
}

// A peer that stops gossiping is declared dead and its providers drop out
// of the survivors' ledger views.
#[test]
async fn dead_peers_lose_their_providers() {
    let noop_factory: EngineFactory = Arc::new(NativeEngine::new);
    let p1 = TestCluster::start(
        "peer-dead-one",
        vec![],
        tagged_capacity("p1"),
        noop_factory.clone(),
    )
    .await;
    let p2 = TestCluster::start(
        "peer-dead-two",
        vec![PeerSeedConfig {
            peer_id: "peer-dead-one".to_string(),
            address: p1.grpc_addr(),
        }],
        tagged_capacity("p2"),
        noop_factory,
    )
    .await;

    wait_for_catalog_convergence(&[&p1, &p2], 2).await;

    // Tear peer two down; its tasks die with the dropped join set.
    drop(p2);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let reachable = p1
            .control_plane
            .services()
            .ledger
            .snapshot()
            .providers
            .iter()
            .filter(|provider| provider.reachable)
            .count();
        if reachable == 1 {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("peer death was not observed");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
