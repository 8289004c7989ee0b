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

use std::time::Duration;

use axum::routing::get;
use axum::Router;
use lazy_static::lazy_static;
use prometheus::{register_counter, register_histogram, Counter, Histogram, TextEncoder};

lazy_static! {
    static ref WORKFLOWS_SUBMITTED: Counter = register_counter!(
        "workflows_submitted_total",
        "Number of workflows accepted by Submit"
    )
    .unwrap();
    static ref WORKFLOWS_SUCCEEDED: Counter = register_counter!(
        "workflows_succeeded_total",
        "Number of workflows whose output task succeeded"
    )
    .unwrap();
    static ref WORKFLOWS_FAILED: Counter = register_counter!(
        "workflows_failed_total",
        "Number of workflows that failed or were cancelled"
    )
    .unwrap();
    static ref TASKS_SUCCEEDED: Counter =
        register_counter!("tasks_succeeded_total", "Number of successful task attempts").unwrap();
    static ref TASKS_FAILED: Counter =
        register_counter!("tasks_failed_total", "Number of permanently failed tasks").unwrap();
    static ref TASKS_RETRIED: Counter =
        register_counter!("tasks_retried_total", "Number of task attempts retried").unwrap();
    static ref CALC_LATENCY_SECONDS: Histogram = register_histogram!(
        "invocation_calc_latency_seconds",
        "Function execution time as reported by workers"
    )
    .unwrap();
    static ref COLD_START_SECONDS: Histogram = register_histogram!(
        "component_cold_start_seconds",
        "Time from component start request to a completed handshake"
    )
    .unwrap();
}

pub fn record_workflow_submitted() {
    WORKFLOWS_SUBMITTED.inc();
}

pub fn record_workflow_succeeded() {
    WORKFLOWS_SUCCEEDED.inc();
}

pub fn record_workflow_failed() {
    WORKFLOWS_FAILED.inc();
}

pub fn record_task_succeeded() {
    TASKS_SUCCEEDED.inc();
}

pub fn record_task_failed() {
    TASKS_FAILED.inc();
}

pub fn record_task_retried() {
    TASKS_RETRIED.inc();
}

pub fn record_calc_latency(latency: Duration) {
    CALC_LATENCY_SECONDS.observe(latency.as_secs_f64());
}

pub fn record_cold_start_latency(latency: Duration) {
    COLD_START_SECONDS.observe(latency.as_secs_f64());
}

/// Prometheus text exposition, mounted by the control-plane binary next to
/// its gRPC endpoint.
pub fn exposition_router() -> Router {
    Router::new().route(
        "/metrics",
        get(|| async {
            TextEncoder::new()
                .encode_to_string(&prometheus::gather())
                .unwrap_or_default()
        }),
    )
}
