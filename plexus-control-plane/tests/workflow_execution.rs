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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use plexus_common::model::{ErrorKind, Resources, TaskState, WorkflowState};
use plexus_control_plane::service::workflow::WorkflowServiceError;
use plexus_worker::engine::native::NativeEngine;
use serde_json::json;
use test_r::test;

use common::{
    from_input, from_task, json_function, submit_request, task, decode_json_output, EngineFactory,
    TestCluster,
};

fn prefix_step(log: Arc<Mutex<Vec<String>>>, label: &'static str) -> impl Fn(std::collections::BTreeMap<String, serde_json::Value>) -> Result<serde_json::Value, String> + Send + Sync + 'static
{
    move |args| {
        let value = args["value"]
            .as_str()
            .ok_or_else(|| "value is not a string".to_string())?
            .to_string();
        log.lock().unwrap().push(label.to_string());
        Ok(json!(format!("{label}:{value}")))
    }
}

fn pipeline_factory(log: Arc<Mutex<Vec<String>>>) -> EngineFactory {
    Arc::new(move || {
        NativeEngine::new()
            .with_function("step1", prefix_step(log.clone(), "T1"))
            .with_function("step2", prefix_step(log.clone(), "T2"))
            .with_function("step3", prefix_step(log.clone(), "T3"))
    })
}

fn pipeline_request() -> plexus_control_plane::service::workflow::SubmitRequest {
    submit_request(
        vec![
            task("t1", "step1", vec![("value", from_input("seed"))], false),
            task("t2", "step2", vec![("value", from_task("t1"))], false),
            task("t3", "step3", vec![("value", from_task("t2"))], true),
        ],
        vec![
            json_function("step1", 100),
            json_function("step2", 100),
            json_function("step3", 100),
        ],
        vec![("seed", json!("hi"))],
    )
}

// S1: three chained tasks, each prefixing its name onto the input.
#[test]
async fn sequential_pipeline_produces_chained_output() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let cluster = TestCluster::start(
        "peer-s1",
        vec![],
        Resources::new(1000, 1 << 30, 0),
        pipeline_factory(log.clone()),
    )
    .await;

    let service = cluster.workflow_service();
    let workflow_id = service.submit(pipeline_request()).await.unwrap();
    let output = service.wait(&workflow_id).await.unwrap();

    assert_eq!(decode_json_output(&output.object), json!("T3:T2:T1:hi"));
    // Dependency ordering: a task's request is only sent after its
    // upstream's response was observed.
    assert_eq!(*log.lock().unwrap(), vec!["T1", "T2", "T3"]);

    let status = service.status(&workflow_id).await.unwrap();
    assert_eq!(status.state, WorkflowState::Succeeded);
    assert!(status
        .tasks
        .iter()
        .all(|task| task.state == TaskState::Succeeded && task.attempts == 1));
}

// S2: diamond dependency; the join task sees both branch results.
#[test]
async fn diamond_join_combines_both_branches() {
    let factory: EngineFactory = Arc::new(|| {
        NativeEngine::new()
            .with_function("produce", |_args| Ok(json!([1, 2, 3])))
            .with_function("sum_plus_ten", |args| {
                let total: i64 = args["values"]
                    .as_array()
                    .ok_or("values is not a list")?
                    .iter()
                    .filter_map(|v| v.as_i64())
                    .sum();
                Ok(json!(total + 10))
            })
            .with_function("maximum", |args| {
                let max = args["values"]
                    .as_array()
                    .ok_or("values is not a list")?
                    .iter()
                    .filter_map(|v| v.as_i64())
                    .max()
                    .ok_or("empty list")?;
                Ok(json!(max))
            })
            .with_function("pick_larger", |args| {
                let s = args["s"].as_i64().ok_or("s is not a number")?;
                let m = args["m"].as_i64().ok_or("m is not a number")?;
                Ok(json!(s.max(m)))
            })
    });
    let cluster = TestCluster::start(
        "peer-s2",
        vec![],
        Resources::new(1000, 1 << 30, 0),
        factory,
    )
    .await;

    let request = submit_request(
        vec![
            task("t1", "produce", vec![("ignored", from_input("seed"))], false),
            task("t2a", "sum_plus_ten", vec![("values", from_task("t1"))], false),
            task("t2b", "maximum", vec![("values", from_task("t1"))], false),
            task(
                "t3",
                "pick_larger",
                vec![("s", from_task("t2a")), ("m", from_task("t2b"))],
                true,
            ),
        ],
        vec![
            json_function("produce", 100),
            json_function("sum_plus_ten", 100),
            json_function("maximum", 100),
            json_function("pick_larger", 100),
        ],
        vec![("seed", json!(null))],
    );

    let service = cluster.workflow_service();
    let workflow_id = service.submit(request).await.unwrap();
    let output = service.wait(&workflow_id).await.unwrap();
    assert_eq!(decode_json_output(&output.object), json!(16));
}

// S3: the provider rejects the first component start with a transient
// failure; the retry path recovers without client involvement.
#[test]
async fn cold_start_failure_is_retried() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let cluster = TestCluster::start(
        "peer-s3",
        vec![],
        Resources::new(1000, 1 << 30, 0),
        pipeline_factory(log.clone()),
    )
    .await;
    cluster.adapter.fail_next_starts(1);

    let service = cluster.workflow_service();
    let workflow_id = service.submit(pipeline_request()).await.unwrap();
    let output = service.wait(&workflow_id).await.unwrap();
    assert_eq!(decode_json_output(&output.object), json!("T3:T2:T1:hi"));

    let status = service.status(&workflow_id).await.unwrap();
    let t1 = status
        .tasks
        .iter()
        .find(|task| task.task_id.0 == "t1")
        .unwrap();
    assert_eq!(t1.attempts, 2);
}

// S4: the component's transport closes mid-invocation; the task is
// re-dispatched to a fresh component and exactly one result is recorded.
#[test]
async fn worker_crash_mid_task_is_redispatched() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let crashed = Arc::new(AtomicBool::new(false));
    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel::<()>();

    let factory: EngineFactory = {
        let log = log.clone();
        let crashed = crashed.clone();
        Arc::new(move || {
            let log = log.clone();
            let crashed = crashed.clone();
            let started_tx = started_tx.clone();
            NativeEngine::new()
                .with_function("step1", prefix_step(log.clone(), "T1"))
                .with_async_function("crashy", {
                    let crashed = crashed.clone();
                    move |args| {
                        let crashed = crashed.clone();
                        let started_tx = started_tx.clone();
                        async move {
                            if !crashed.swap(true, Ordering::SeqCst) {
                                // First attempt: report that we are running
                                // and hang until the harness kills us.
                                let _ = started_tx.send(());
                                tokio::time::sleep(Duration::from_secs(30)).await;
                                Err("should have been aborted".to_string())
                            } else {
                                let value = args["value"]
                                    .as_str()
                                    .ok_or("value is not a string")?
                                    .to_string();
                                Ok(json!(format!("T2:{value}")))
                            }
                        }
                        .boxed()
                    }
                })
                .with_function("step3", prefix_step(log.clone(), "T3"))
        })
    };

    let cluster = TestCluster::start(
        "peer-s4",
        vec![],
        Resources::new(1000, 1 << 30, 0),
        factory,
    )
    .await;

    let request = submit_request(
        vec![
            task("t1", "step1", vec![("value", from_input("seed"))], false),
            task("t2", "crashy", vec![("value", from_task("t1"))], false),
            task("t3", "step3", vec![("value", from_task("t2"))], true),
        ],
        vec![
            json_function("step1", 100),
            json_function("crashy", 100),
            json_function("step3", 100),
        ],
        vec![("seed", json!("hi"))],
    );

    let service = cluster.workflow_service();
    let workflow_id = service.submit(request).await.unwrap();

    // Kill the worker executing t2 once the function is really running.
    started_rx.recv().await.expect("t2 started");
    let component = cluster
        .adapter
        .component_for_function("crashy")
        .expect("crashy registered");
    assert!(cluster.adapter.abort_component(&component));

    let output = service.wait(&workflow_id).await.unwrap();
    assert_eq!(decode_json_output(&output.object), json!("T3:T2:T1:hi"));

    let status = service.status(&workflow_id).await.unwrap();
    let t2 = status
        .tasks
        .iter()
        .find(|task| task.task_id.0 == "t2")
        .unwrap();
    assert_eq!(t2.state, TaskState::Succeeded);
    assert_eq!(t2.attempts, 2);
}

// S6: all capacity is held by a long-running task; the follow-up workflow
// rides out `no_capacity` and completes once capacity frees up, without
// manual intervention.
#[test]
async fn capacity_exhaustion_recovers_when_capacity_frees_up() {
    let factory: EngineFactory = Arc::new(|| {
        NativeEngine::new()
            .with_async_function("hold", |_args| {
                async {
                    tokio::time::sleep(Duration::from_millis(1500)).await;
                    Ok(json!("held"))
                }
                .boxed()
            })
            .with_function("quick", |_args| Ok(json!("quick")))
    });

    // One provider, and `hold` fills it completely.
    let cluster = TestCluster::start(
        "peer-s6",
        vec![],
        Resources::new(1000, 1 << 30, 0),
        factory,
    )
    .await;
    let service = cluster.workflow_service();

    let hold_request = submit_request(
        vec![task("h", "hold", vec![("value", from_input("seed"))], true)],
        vec![json_function("hold", 1000)],
        vec![("seed", json!(null))],
    );
    let hold_id = service.submit(hold_request).await.unwrap();

    // Give the hold task time to claim the provider.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let quick_request = submit_request(
        vec![task("q", "quick", vec![("value", from_input("seed"))], true)],
        vec![json_function("quick", 1000)],
        vec![("seed", json!(null))],
    );
    let quick_id = service.submit(quick_request).await.unwrap();

    let hold_output = service.wait(&hold_id).await.unwrap();
    assert_eq!(decode_json_output(&hold_output.object), json!("held"));

    let quick_output = service.wait(&quick_id).await.unwrap();
    assert_eq!(decode_json_output(&quick_output.object), json!("quick"));
}

// Property 1: an invalid graph is rejected at submission and nothing runs.
#[test]
async fn invalid_graphs_are_rejected_before_any_task_runs() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let cluster = TestCluster::start(
        "peer-invalid",
        vec![],
        Resources::new(1000, 1 << 30, 0),
        pipeline_factory(log.clone()),
    )
    .await;
    let service = cluster.workflow_service();

    // Cycle.
    let cyclic = submit_request(
        vec![
            task("t1", "step1", vec![("value", from_task("t2"))], false),
            task("t2", "step2", vec![("value", from_task("t1"))], true),
        ],
        vec![json_function("step1", 100), json_function("step2", 100)],
        vec![],
    );
    let err = service.submit(cyclic).await.unwrap_err();
    assert!(matches!(err, WorkflowServiceError::InvalidArgument(_)));

    // Unresolved input reference.
    let unresolved = submit_request(
        vec![task("t1", "step1", vec![("value", from_input("nope"))], true)],
        vec![json_function("step1", 100)],
        vec![("seed", json!("hi"))],
    );
    let err = service.submit(unresolved).await.unwrap_err();
    assert!(matches!(err, WorkflowServiceError::InvalidArgument(_)));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(log.lock().unwrap().is_empty());
}

// A function-raised error is permanent: no retries, descendants fail with
// upstream_failed, and the workflow error keeps its kind.
#[test]
async fn application_errors_fail_the_task_and_its_descendants() {
    let factory: EngineFactory = Arc::new(|| {
        NativeEngine::new()
            .with_function("boom", |_args| Err("ValueError: broken".to_string()))
            .with_function("after", |_args| Ok(json!("unreachable")))
    });
    let cluster = TestCluster::start(
        "peer-apperr",
        vec![],
        Resources::new(1000, 1 << 30, 0),
        factory,
    )
    .await;
    let service = cluster.workflow_service();

    let request = submit_request(
        vec![
            task("t1", "boom", vec![("value", from_input("seed"))], false),
            task("t2", "after", vec![("value", from_task("t1"))], true),
        ],
        vec![json_function("boom", 100), json_function("after", 100)],
        vec![("seed", json!(null))],
    );
    let workflow_id = service.submit(request).await.unwrap();

    let err = service.wait(&workflow_id).await.unwrap_err();
    match err {
        WorkflowServiceError::Execution(failure) => {
            assert_eq!(failure.kind, ErrorKind::UpstreamFailed);
        }
        other => panic!("unexpected error {other:?}"),
    }

    let status = service.status(&workflow_id).await.unwrap();
    let t1 = status.tasks.iter().find(|t| t.task_id.0 == "t1").unwrap();
    let t2 = status.tasks.iter().find(|t| t.task_id.0 == "t2").unwrap();
    assert_eq!(t1.state, TaskState::Failed);
    assert_eq!(t1.attempts, 1);
    assert_eq!(t2.state, TaskState::Failed);
    assert!(t2.error.as_deref().unwrap_or_default().contains("upstream"));
}

// Per-task timeout: the executor fabricates a `timeout` failure while the
// function is still running.
#[test]
async fn task_timeout_surfaces_as_timeout_error() {
    let factory: EngineFactory = Arc::new(|| {
        NativeEngine::new().with_async_function("sleepy", |_args| {
            async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!("too late"))
            }
            .boxed()
        })
    });
    let cluster = TestCluster::start(
        "peer-timeout",
        vec![],
        Resources::new(1000, 1 << 30, 0),
        factory,
    )
    .await;
    let service = cluster.workflow_service();

    let mut request = submit_request(
        vec![task("t1", "sleepy", vec![("value", from_input("seed"))], true)],
        vec![json_function("sleepy", 100)],
        vec![("seed", json!(null))],
    );
    request.default_task_timeout = Some(Duration::from_millis(300));

    let workflow_id = service.submit(request).await.unwrap();
    let err = service.wait(&workflow_id).await.unwrap_err();
    match err {
        WorkflowServiceError::Execution(failure) => {
            assert_eq!(failure.kind, ErrorKind::Timeout);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

// Cancellation: pending tasks fail with `cancelled` and the waiting client
// is released.
#[test]
async fn cancellation_fails_pending_tasks() {
    let factory: EngineFactory = Arc::new(|| {
        NativeEngine::new()
            .with_async_function("hold", |_args| {
                async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(json!("held"))
                }
                .boxed()
            })
            .with_function("after", |_args| Ok(json!("unreachable")))
    });
    let cluster = TestCluster::start(
        "peer-cancel",
        vec![],
        Resources::new(1000, 1 << 30, 0),
        factory,
    )
    .await;
    let service = cluster.workflow_service();

    let request = submit_request(
        vec![
            task("t1", "hold", vec![("value", from_input("seed"))], false),
            task("t2", "after", vec![("value", from_task("t1"))], true),
        ],
        vec![json_function("hold", 100), json_function("after", 100)],
        vec![("seed", json!(null))],
    );
    let workflow_id = service.submit(request).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    service.cancel(&workflow_id).await.unwrap();

    let err = service.wait(&workflow_id).await.unwrap_err();
    match err {
        WorkflowServiceError::Execution(failure) => {
            assert_eq!(failure.kind, ErrorKind::Cancelled);
        }
        other => panic!("unexpected error {other:?}"),
    }

    let status = service.status(&workflow_id).await.unwrap();
    assert_eq!(status.state, WorkflowState::Cancelled);
}

// Warm reuse: a second workflow using the same function table rides the
// already warm components instead of cold-starting new ones.
#[test]
async fn warm_components_are_reused_across_workflows() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let cluster = TestCluster::start(
        "peer-reuse",
        vec![],
        Resources::new(1000, 1 << 30, 0),
        pipeline_factory(log.clone()),
    )
    .await;
    let service = cluster.workflow_service();

    let first = service.submit(pipeline_request()).await.unwrap();
    service.wait(&first).await.unwrap();
    let first_component = cluster
        .adapter
        .component_for_function("step1")
        .expect("step1 warm");

    let second = service.submit(pipeline_request()).await.unwrap();
    let output = service.wait(&second).await.unwrap();
    assert_eq!(decode_json_output(&output.object), json!("T3:T2:T1:hi"));

    // Still the same component: registration was not repeated.
    assert_eq!(
        cluster.adapter.component_for_function("step1"),
        Some(first_component)
    );
}
