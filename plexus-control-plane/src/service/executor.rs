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
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use plexus_common::model::{
    ErrorKind, FunctionSpec, ObjectRef, SessionId, TaskId, TaskState, WorkflowId, WorkflowState,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WorkflowExecConfig;
use crate::metrics;
use crate::model::TaskCompletion;
use crate::service::scheduler::{DispatchError, Scheduler, TaskDispatch};
use crate::service::store::ObjectStore;
use crate::service::workflow::{BindingSource, ValidatedGraph};

#[derive(Debug, Clone)]
pub struct WorkflowFailure {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub state: TaskState,
    pub attempts: u32,
    pub result: Option<ObjectRef>,
    pub error: Option<WorkflowFailure>,
}

impl TaskRecord {
    fn new() -> Self {
        Self {
            state: TaskState::Pending,
            attempts: 0,
            result: None,
            error: None,
        }
    }
}

pub type WorkflowOutcome = Option<Result<ObjectRef, WorkflowFailure>>;

/// Shared view of one workflow instance: the executor task writes it, the
/// service reads it for `status`, `wait` and `cancel`.
pub struct WorkflowStateHandle {
    pub workflow_id: WorkflowId,
    pub session_id: SessionId,
    pub tasks: Mutex<HashMap<TaskId, TaskRecord>>,
    pub state: Mutex<WorkflowState>,
    output_tx: watch::Sender<WorkflowOutcome>,
    pub cancel: CancellationToken,
    pub finished_at: Mutex<Option<Instant>>,
}

impl WorkflowStateHandle {
    pub fn new(workflow_id: WorkflowId, session_id: SessionId, task_ids: Vec<TaskId>) -> Self {
        let tasks = task_ids
            .into_iter()
            .map(|id| (id, TaskRecord::new()))
            .collect();
        let (output_tx, _) = watch::channel(None);
        Self {
            workflow_id,
            session_id,
            tasks: Mutex::new(tasks),
            state: Mutex::new(WorkflowState::Running),
            output_tx,
            cancel: CancellationToken::new(),
            finished_at: Mutex::new(None),
        }
    }

    pub fn subscribe_output(&self) -> watch::Receiver<WorkflowOutcome> {
        self.output_tx.subscribe()
    }

    pub fn workflow_state(&self) -> WorkflowState {
        *self.state.lock().unwrap()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.lock().unwrap().is_some()
    }

    fn resolve_output(&self, outcome: Result<ObjectRef, WorkflowFailure>) {
        self.output_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(outcome.clone());
                true
            } else {
                false
            }
        });
    }
}

enum TaskEvent {
    Finished(TaskId, Result<TaskCompletion, DispatchError>),
    RetryReady(TaskId),
}

/// Owns one workflow instance: releases tasks whose inputs are all
/// materialised, hands them to the scheduler, records completions, retries
/// transient failures with backoff and fails descendants of permanent ones.
pub struct WorkflowExecutor {
    pub workflow_id: WorkflowId,
    pub session_id: SessionId,
    pub graph: ValidatedGraph,
    pub functions: HashMap<String, Arc<FunctionSpec>>,
    pub inputs: HashMap<String, ObjectRef>,
    pub default_task_timeout: Option<Duration>,
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<ObjectStore>,
    pub config: WorkflowExecConfig,
    pub handle: Arc<WorkflowStateHandle>,
}

impl WorkflowExecutor {
    pub fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(self) {
        let workflow_id = self.workflow_id;
        info!(workflow = %workflow_id, session = %self.session_id, "Workflow started");

        let (events_tx, mut events_rx) = mpsc::channel::<TaskEvent>(64);

        let initially_ready: Vec<TaskId> = self
            .graph
            .tasks
            .keys()
            .filter(|task_id| self.is_ready(task_id))
            .cloned()
            .collect();
        for task_id in initially_ready {
            self.dispatch_task(&task_id, &events_tx);
        }

        let mut cancelling = false;
        loop {
            if self.is_complete() {
                break;
            }
            tokio::select! {
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        TaskEvent::Finished(task_id, Ok(completion)) => {
                            if cancelling {
                                debug!(workflow = %workflow_id, task = %task_id, "Discarding result of cancelled workflow");
                                self.fail_task(&task_id, WorkflowFailure {
                                    kind: ErrorKind::Cancelled,
                                    message: "workflow cancelled".to_string(),
                                });
                            } else {
                                self.complete_task(&task_id, completion, &events_tx);
                            }
                        }
                        TaskEvent::Finished(task_id, Err(error)) => {
                            self.handle_task_failure(&task_id, error, &events_tx, cancelling);
                        }
                        TaskEvent::RetryReady(task_id) => {
                            if !cancelling {
                                self.dispatch_task(&task_id, &events_tx);
                            }
                        }
                    }
                }
                _ = self.handle.cancel.cancelled(), if !cancelling => {
                    cancelling = true;
                    self.begin_cancel();
                }
            }
        }

        self.finish();
    }

    fn is_ready(&self, task_id: &TaskId) -> bool {
        let tasks = self.handle.tasks.lock().unwrap();
        let Some(record) = tasks.get(task_id) else {
            return false;
        };
        if record.state != TaskState::Pending {
            return false;
        }
        let node = &self.graph.tasks[task_id];
        node.bindings.iter().all(|(_, source)| match source {
            BindingSource::Input(_) => true,
            BindingSource::Task(upstream) => tasks
                .get(upstream)
                .map(|r| r.result.is_some())
                .unwrap_or(false),
        })
    }

    fn resolve_args(&self, task_id: &TaskId) -> Option<Vec<(String, ObjectRef)>> {
        let tasks = self.handle.tasks.lock().unwrap();
        let node = &self.graph.tasks[task_id];
        node.bindings
            .iter()
            .map(|(param, source)| {
                let reference = match source {
                    BindingSource::Input(name) => self.inputs.get(name).cloned(),
                    BindingSource::Task(upstream) => {
                        tasks.get(upstream).and_then(|r| r.result.clone())
                    }
                };
                reference.map(|reference| (param.clone(), reference))
            })
            .collect()
    }

    fn dispatch_task(&self, task_id: &TaskId, events_tx: &mpsc::Sender<TaskEvent>) {
        let node = &self.graph.tasks[task_id];
        let function = self.functions[&node.function_name].clone();
        let Some(args) = self.resolve_args(task_id) else {
            self.fail_task(
                task_id,
                WorkflowFailure {
                    kind: ErrorKind::Fatal,
                    message: "task released with unmaterialised inputs".to_string(),
                },
            );
            return;
        };

        {
            let mut tasks = self.handle.tasks.lock().unwrap();
            let record = tasks.get_mut(task_id).unwrap();
            record.state = TaskState::Dispatched;
            record.attempts += 1;
        }

        let timeout = function
            .timeout
            .or(self.default_task_timeout)
            .unwrap_or(self.config.task_default_timeout);
        let ctx = TaskDispatch {
            workflow_id: self.workflow_id,
            session_id: self.session_id,
            task_id: task_id.clone(),
            function,
            args,
            timeout,
        };

        let scheduler = self.scheduler.clone();
        let events_tx = events_tx.clone();
        let cancel = self.handle.cancel.clone();
        let grace = self.config.cancel_grace;
        let task_id = task_id.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                result = scheduler.dispatch(&ctx) => result,
                // Cancellation lets the in-flight invocation run out its
                // grace period, then gives up on it.
                _ = cancelled_after(cancel, grace) => Err(DispatchError::Cancelled),
            };
            let _ = events_tx.send(TaskEvent::Finished(task_id, result)).await;
        });
    }

    fn complete_task(
        &self,
        task_id: &TaskId,
        completion: TaskCompletion,
        events_tx: &mpsc::Sender<TaskEvent>,
    ) {
        debug!(
            workflow = %self.workflow_id,
            task = %task_id,
            calc_latency_ms = completion.calc_latency.as_millis() as u64,
            "Task succeeded"
        );
        metrics::record_task_succeeded();
        self.store
            .attach_workflow(&completion.result.id, self.workflow_id);
        {
            let mut tasks = self.handle.tasks.lock().unwrap();
            let record = tasks.get_mut(task_id).unwrap();
            record.state = TaskState::Succeeded;
            record.result = Some(completion.result.clone());
        }

        let node = &self.graph.tasks[task_id];
        if node.is_output {
            *self.handle.state.lock().unwrap() = WorkflowState::Succeeded;
            self.handle.resolve_output(Ok(completion.result));
            return;
        }

        let downstream = self
            .graph
            .downstream
            .get(task_id)
            .cloned()
            .unwrap_or_default();
        for next in downstream {
            if self.is_ready(&next) {
                self.dispatch_task(&next, events_tx);
            }
        }
    }

    fn handle_task_failure(
        &self,
        task_id: &TaskId,
        error: DispatchError,
        events_tx: &mpsc::Sender<TaskEvent>,
        cancelling: bool,
    ) {
        let attempts = {
            let tasks = self.handle.tasks.lock().unwrap();
            tasks.get(task_id).map(|r| r.attempts).unwrap_or(0)
        };

        let retryable = !cancelling
            && error.is_transient()
            && !self.config.retries.attempts_exhausted(attempts);
        if retryable {
            let delay = self.config.retries.delay_for_attempt(attempts);
            warn!(
                workflow = %self.workflow_id,
                task = %task_id,
                attempts,
                "Task attempt failed ({error}), retrying in {delay:?}"
            );
            metrics::record_task_retried();
            {
                let mut tasks = self.handle.tasks.lock().unwrap();
                if let Some(record) = tasks.get_mut(task_id) {
                    record.state = TaskState::Pending;
                }
            }
            let events_tx = events_tx.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events_tx.send(TaskEvent::RetryReady(task_id)).await;
            });
            return;
        }

        let failure = WorkflowFailure {
            kind: if cancelling {
                ErrorKind::Cancelled
            } else {
                error.kind()
            },
            message: error.to_string(),
        };
        warn!(
            workflow = %self.workflow_id,
            task = %task_id,
            kind = %failure.kind,
            "Task failed permanently: {}",
            failure.message
        );
        self.fail_task(task_id, failure);
    }

    /// Marks a task FAILED and transitively fails every non-terminal
    /// descendant with `upstream_failed`.
    fn fail_task(&self, task_id: &TaskId, failure: WorkflowFailure) {
        metrics::record_task_failed();
        let mut failed_output = None;
        {
            let mut tasks = self.handle.tasks.lock().unwrap();
            if let Some(record) = tasks.get_mut(task_id) {
                if record.state.is_terminal() {
                    return;
                }
                record.state = TaskState::Failed;
                record.error = Some(failure.clone());
            }
            if self.graph.tasks[task_id].is_output {
                failed_output = Some(failure.clone());
            }

            let mut frontier = vec![task_id.clone()];
            while let Some(current) = frontier.pop() {
                let downstream = self
                    .graph
                    .downstream
                    .get(&current)
                    .cloned()
                    .unwrap_or_default();
                for next in downstream {
                    let record = tasks.get_mut(&next).unwrap();
                    if record.state.is_terminal() {
                        continue;
                    }
                    record.state = TaskState::Failed;
                    let upstream_failure = WorkflowFailure {
                        kind: ErrorKind::UpstreamFailed,
                        message: format!("upstream task {current} failed: {}", failure.message),
                    };
                    record.error = Some(upstream_failure.clone());
                    if self.graph.tasks[&next].is_output {
                        failed_output = Some(upstream_failure);
                    }
                    frontier.push(next);
                }
            }
        }

        if let Some(failure) = failed_output {
            let mut state = self.handle.state.lock().unwrap();
            if *state == WorkflowState::Running {
                *state = if failure.kind == ErrorKind::Cancelled {
                    WorkflowState::Cancelled
                } else {
                    WorkflowState::Failed
                };
            }
            drop(state);
            self.handle.resolve_output(Err(failure));
        }
    }

    fn begin_cancel(&self) {
        info!(workflow = %self.workflow_id, "Workflow cancelled");
        *self.handle.state.lock().unwrap() = WorkflowState::Cancelled;
        let pending: Vec<TaskId> = {
            let tasks = self.handle.tasks.lock().unwrap();
            tasks
                .iter()
                .filter(|(_, record)| {
                    !record.state.is_terminal() && record.state != TaskState::Dispatched
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        for task_id in pending {
            self.fail_task(
                &task_id,
                WorkflowFailure {
                    kind: ErrorKind::Cancelled,
                    message: "workflow cancelled".to_string(),
                },
            );
        }
        self.handle.resolve_output(Err(WorkflowFailure {
            kind: ErrorKind::Cancelled,
            message: "workflow cancelled".to_string(),
        }));
    }

    /// The run loop ends when the output task is terminal and nothing else
    /// is still dispatched.
    fn is_complete(&self) -> bool {
        let tasks = self.handle.tasks.lock().unwrap();
        let output_terminal = tasks
            .get(&self.graph.output_task)
            .map(|r| r.state.is_terminal())
            .unwrap_or(true);
        if !output_terminal {
            return false;
        }
        tasks
            .values()
            .all(|record| record.state != TaskState::Dispatched)
    }

    fn finish(&self) {
        {
            let mut state = self.handle.state.lock().unwrap();
            if *state == WorkflowState::Running {
                *state = WorkflowState::Failed;
            }
            match *state {
                WorkflowState::Succeeded => metrics::record_workflow_succeeded(),
                _ => metrics::record_workflow_failed(),
            }
        }
        // Dropping the workflow's object references starts the retention
        // countdown for everything it materialised.
        self.store.release_workflow(&self.workflow_id);
        *self.handle.finished_at.lock().unwrap() = Some(Instant::now());
        info!(
            workflow = %self.workflow_id,
            state = ?self.handle.workflow_state(),
            "Workflow finished"
        );
    }
}

async fn cancelled_after(cancel: CancellationToken, grace: Duration) {
    cancel.cancelled().await;
    tokio::time::sleep(grace).await;
}
