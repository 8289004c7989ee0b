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

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use plexus_common::model::{
    EncodedValue, FunctionSpec, ObjectRef, SessionId, TaskId, TaskState, WorkflowId, WorkflowState,
};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::config::WorkflowExecConfig;
use crate::metrics;
use crate::service::executor::{
    WorkflowExecutor, WorkflowFailure, WorkflowStateHandle,
};
use crate::service::scheduler::Scheduler;
use crate::service::store::ObjectStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingSource {
    /// A named workflow input.
    Input(String),
    /// The result of an upstream task.
    Task(TaskId),
}

#[derive(Debug, Clone)]
pub struct TaskNode {
    pub task_id: TaskId,
    pub function_name: String,
    pub bindings: Vec<(String, BindingSource)>,
    pub is_output: bool,
}

/// The task table after submission-time validation: a DAG in which every
/// binding resolves to a workflow input or an upstream task.
#[derive(Debug, Clone)]
pub struct ValidatedGraph {
    pub tasks: HashMap<TaskId, TaskNode>,
    pub downstream: HashMap<TaskId, Vec<TaskId>>,
    pub output_task: TaskId,
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub tasks: Vec<TaskNode>,
    pub functions: Vec<FunctionSpec>,
    pub inputs: HashMap<String, EncodedValue>,
    pub default_task_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct WorkflowOutput {
    pub reference: ObjectRef,
    pub object: EncodedValue,
}

#[derive(Debug, Clone)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub state: TaskState,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorkflowStatusView {
    pub workflow_id: WorkflowId,
    pub state: WorkflowState,
    pub tasks: Vec<TaskStatusView>,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowServiceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("workflow not found: {0}")]
    NotFound(WorkflowId),
    #[error("{}: {}", .0.kind, .0.message)]
    Execution(WorkflowFailure),
    #[error("internal error: {0}")]
    Internal(String),
}

#[async_trait]
pub trait WorkflowService: Send + Sync {
    /// Validates the graph, seeds the inputs into the object store, releases
    /// the root tasks and returns the workflow id.
    async fn submit(&self, request: SubmitRequest) -> Result<WorkflowId, WorkflowServiceError>;

    /// Blocks until the output task reaches a terminal state and returns the
    /// output object.
    async fn wait(&self, workflow_id: &WorkflowId) -> Result<WorkflowOutput, WorkflowServiceError>;

    async fn status(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<WorkflowStatusView, WorkflowServiceError>;

    /// Marks the workflow cancelled: in-flight invocations may finish within
    /// the grace period but their results are discarded, and dependent tasks
    /// fail with `cancelled`.
    async fn cancel(&self, workflow_id: &WorkflowId) -> Result<(), WorkflowServiceError>;
}

pub struct WorkflowServiceDefault {
    scheduler: Arc<Scheduler>,
    store: Arc<ObjectStore>,
    config: WorkflowExecConfig,
    instances: RwLock<HashMap<WorkflowId, Arc<WorkflowStateHandle>>>,
}

impl WorkflowServiceDefault {
    pub fn new(
        scheduler: Arc<Scheduler>,
        store: Arc<ObjectStore>,
        config: WorkflowExecConfig,
    ) -> Self {
        Self {
            scheduler,
            store,
            config,
            instances: RwLock::new(HashMap::new()),
        }
    }

    fn instance(&self, workflow_id: &WorkflowId) -> Option<Arc<WorkflowStateHandle>> {
        self.instances.read().unwrap().get(workflow_id).cloned()
    }

    /// Drops terminal instances after the configured retention; the
    /// executor already released their object references.
    pub fn run_instance_sweeper(
        self: &Arc<Self>,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    ) {
        let service = self.clone();
        join_set.spawn(async move {
            let mut ticker = tokio::time::interval(service.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let retention = service.config.instance_retention;
                let mut instances = service.instances.write().unwrap();
                instances.retain(|workflow_id, handle| {
                    let expired = handle
                        .finished_at
                        .lock()
                        .unwrap()
                        .map(|at| at.elapsed() > retention)
                        .unwrap_or(false);
                    if expired {
                        debug!(workflow = %workflow_id, "Dropping retained workflow instance");
                    }
                    !expired
                });
            }
        });
    }
}

#[async_trait]
impl WorkflowService for WorkflowServiceDefault {
    async fn submit(&self, request: SubmitRequest) -> Result<WorkflowId, WorkflowServiceError> {
        let mut functions: HashMap<String, Arc<FunctionSpec>> = HashMap::new();
        for function in request.functions {
            if functions
                .insert(function.name.clone(), Arc::new(function))
                .is_some()
            {
                return Err(WorkflowServiceError::InvalidArgument(
                    "duplicate function name in function table".to_string(),
                ));
            }
        }

        let input_names: HashSet<String> = request.inputs.keys().cloned().collect();
        let graph = validate_graph(request.tasks, &functions, &input_names)
            .map_err(WorkflowServiceError::InvalidArgument)?;

        let workflow_id = WorkflowId::new_v4();
        let session_id = SessionId::new_v4();

        let mut inputs = HashMap::new();
        for (name, value) in request.inputs {
            let reference = self
                .store
                .save(value, Some(workflow_id))
                .map_err(|err| WorkflowServiceError::InvalidArgument(err.to_string()))?;
            inputs.insert(name, reference);
        }

        let handle = Arc::new(WorkflowStateHandle::new(
            workflow_id,
            session_id,
            graph.tasks.keys().cloned().collect(),
        ));
        self.instances
            .write()
            .unwrap()
            .insert(workflow_id, handle.clone());

        // replicas > 1 is a warm-pool hint: best-effort, never gates the
        // dispatch path.
        for function in functions.values() {
            if function.replicas > 1 {
                let scheduler = self.scheduler.clone();
                let function = function.clone();
                let replicas = function.replicas;
                tokio::spawn(async move {
                    scheduler.prewarm(function, replicas).await;
                });
            }
        }

        metrics::record_workflow_submitted();
        info!(
            workflow = %workflow_id,
            tasks = graph.tasks.len(),
            functions = functions.len(),
            "Workflow submitted"
        );

        WorkflowExecutor {
            workflow_id,
            session_id,
            graph,
            functions,
            inputs,
            default_task_timeout: request.default_task_timeout,
            scheduler: self.scheduler.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            handle,
        }
        .spawn();

        Ok(workflow_id)
    }

    async fn wait(&self, workflow_id: &WorkflowId) -> Result<WorkflowOutput, WorkflowServiceError> {
        let handle = self
            .instance(workflow_id)
            .ok_or(WorkflowServiceError::NotFound(*workflow_id))?;
        let mut output_rx = handle.subscribe_output();

        let outcome = loop {
            let current = output_rx.borrow().clone();
            if let Some(outcome) = current {
                break outcome;
            }
            output_rx
                .changed()
                .await
                .map_err(|_| WorkflowServiceError::Internal("executor went away".to_string()))?;
        };

        match outcome {
            Ok(reference) => {
                let object = self
                    .store
                    .get(&reference)
                    .await
                    .map_err(|err| WorkflowServiceError::Internal(err.to_string()))?;
                Ok(WorkflowOutput { reference, object })
            }
            Err(failure) => Err(WorkflowServiceError::Execution(failure)),
        }
    }

    async fn status(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<WorkflowStatusView, WorkflowServiceError> {
        let handle = self
            .instance(workflow_id)
            .ok_or(WorkflowServiceError::NotFound(*workflow_id))?;
        let tasks = handle.tasks.lock().unwrap();
        let mut task_views: Vec<TaskStatusView> = tasks
            .iter()
            .map(|(task_id, record)| TaskStatusView {
                task_id: task_id.clone(),
                state: record.state,
                attempts: record.attempts,
                error: record.error.as_ref().map(|e| format!("{}: {}", e.kind, e.message)),
            })
            .collect();
        task_views.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(WorkflowStatusView {
            workflow_id: *workflow_id,
            state: handle.workflow_state(),
            tasks: task_views,
        })
    }

    async fn cancel(&self, workflow_id: &WorkflowId) -> Result<(), WorkflowServiceError> {
        let handle = self
            .instance(workflow_id)
            .ok_or(WorkflowServiceError::NotFound(*workflow_id))?;
        handle.cancel.cancel();
        Ok(())
    }
}

/// Submission-time validation: unique task ids, known functions, bindings
/// that resolve to existing inputs or tasks, no duplicate parameters,
/// exactly one output task, and no cycles.
pub fn validate_graph(
    tasks: Vec<TaskNode>,
    functions: &HashMap<String, Arc<FunctionSpec>>,
    input_names: &HashSet<String>,
) -> Result<ValidatedGraph, String> {
    if tasks.is_empty() {
        return Err("workflow graph has no tasks".to_string());
    }

    let mut table: HashMap<TaskId, TaskNode> = HashMap::new();
    for task in &tasks {
        if task.task_id.0.is_empty() {
            return Err("task with empty id".to_string());
        }
        if table.insert(task.task_id.clone(), task.clone()).is_some() {
            return Err(format!("duplicate task id {}", task.task_id));
        }
    }

    let outputs: Vec<&TaskNode> = tasks.iter().filter(|t| t.is_output).collect();
    let output_task = match outputs.as_slice() {
        [single] => single.task_id.clone(),
        [] => return Err("no task is marked as the workflow output".to_string()),
        _ => return Err("more than one task is marked as the workflow output".to_string()),
    };

    let mut downstream: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
    let mut upstream_count: HashMap<TaskId, usize> = HashMap::new();
    for task in &tasks {
        if !functions.contains_key(&task.function_name) {
            return Err(format!(
                "task {} references unknown function {}",
                task.task_id, task.function_name
            ));
        }
        let mut seen_params = HashSet::new();
        let mut upstreams = HashSet::new();
        for (param, source) in &task.bindings {
            if !seen_params.insert(param.clone()) {
                return Err(format!(
                    "task {} binds parameter {param} more than once",
                    task.task_id
                ));
            }
            match source {
                BindingSource::Input(name) => {
                    if !input_names.contains(name) {
                        return Err(format!(
                            "task {} references unknown input {name}",
                            task.task_id
                        ));
                    }
                }
                BindingSource::Task(upstream) => {
                    if upstream == &task.task_id {
                        return Err(format!("task {} depends on itself", task.task_id));
                    }
                    if !table.contains_key(upstream) {
                        return Err(format!(
                            "task {} references unknown task {upstream}",
                            task.task_id
                        ));
                    }
                    upstreams.insert(upstream.clone());
                }
            }
        }
        upstream_count.insert(task.task_id.clone(), upstreams.len());
        for upstream in upstreams {
            downstream
                .entry(upstream)
                .or_default()
                .push(task.task_id.clone());
        }
    }
    for successors in downstream.values_mut() {
        successors.sort();
    }

    // Kahn's algorithm; anything left over sits on a cycle.
    let mut queue: VecDeque<TaskId> = upstream_count
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| id.clone())
        .collect();
    let mut visited = 0usize;
    let mut remaining = upstream_count;
    while let Some(current) = queue.pop_front() {
        visited += 1;
        if let Some(successors) = downstream.get(&current) {
            for next in successors {
                let count = remaining.get_mut(next).unwrap();
                *count -= 1;
                if *count == 0 {
                    queue.push_back(next.clone());
                }
            }
        }
    }
    if visited != table.len() {
        return Err("workflow graph contains a cycle".to_string());
    }

    Ok(ValidatedGraph {
        tasks: table,
        downstream,
        output_task,
    })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use plexus_common::model::{Language, Resources};
    use test_r::test;

    use super::*;

    fn function(name: &str) -> (String, Arc<FunctionSpec>) {
        (
            name.to_string(),
            Arc::new(FunctionSpec {
                name: name.to_string(),
                language: Language::Json,
                body: Bytes::from_static(b"{}"),
                requirements: vec![],
                resources: Resources::new(100, 1024, 0),
                replicas: 1,
                venv: None,
                timeout: None,
            }),
        )
    }

    fn task(id: &str, function: &str, bindings: Vec<(&str, BindingSource)>, output: bool) -> TaskNode {
        TaskNode {
            task_id: TaskId::new(id),
            function_name: function.to_string(),
            bindings: bindings
                .into_iter()
                .map(|(param, source)| (param.to_string(), source))
                .collect(),
            is_output: output,
        }
    }

    #[test]
    fn accepts_a_linear_pipeline() {
        let functions: HashMap<_, _> = vec![function("step")].into_iter().collect();
        let inputs: HashSet<String> = ["seed".to_string()].into_iter().collect();
        let graph = validate_graph(
            vec![
                task("t1", "step", vec![("value", BindingSource::Input("seed".to_string()))], false),
                task("t2", "step", vec![("value", BindingSource::Task(TaskId::new("t1")))], false),
                task("t3", "step", vec![("value", BindingSource::Task(TaskId::new("t2")))], true),
            ],
            &functions,
            &inputs,
        )
        .unwrap();
        assert_eq!(graph.output_task, TaskId::new("t3"));
        assert_eq!(graph.downstream[&TaskId::new("t1")], vec![TaskId::new("t2")]);
    }

    #[test]
    fn rejects_cycles() {
        let functions: HashMap<_, _> = vec![function("step")].into_iter().collect();
        let inputs = HashSet::new();
        let err = validate_graph(
            vec![
                task("t1", "step", vec![("value", BindingSource::Task(TaskId::new("t2")))], false),
                task("t2", "step", vec![("value", BindingSource::Task(TaskId::new("t1")))], true),
            ],
            &functions,
            &inputs,
        )
        .unwrap_err();
        assert!(err.contains("cycle"));
    }

    #[test]
    fn rejects_unknown_references() {
        let functions: HashMap<_, _> = vec![function("step")].into_iter().collect();
        let inputs = HashSet::new();

        let err = validate_graph(
            vec![task(
                "t1",
                "missing_fn",
                vec![],
                true,
            )],
            &functions,
            &inputs,
        )
        .unwrap_err();
        assert!(err.contains("unknown function"));

        let err = validate_graph(
            vec![task(
                "t1",
                "step",
                vec![("value", BindingSource::Input("missing".to_string()))],
                true,
            )],
            &functions,
            &inputs,
        )
        .unwrap_err();
        assert!(err.contains("unknown input"));

        let err = validate_graph(
            vec![task(
                "t1",
                "step",
                vec![("value", BindingSource::Task(TaskId::new("ghost")))],
                true,
            )],
            &functions,
            &inputs,
        )
        .unwrap_err();
        assert!(err.contains("unknown task"));
    }

    #[test]
    fn rejects_missing_or_ambiguous_output() {
        let functions: HashMap<_, _> = vec![function("step")].into_iter().collect();
        let inputs = HashSet::new();

        let err = validate_graph(
            vec![task("t1", "step", vec![], false)],
            &functions,
            &inputs,
        )
        .unwrap_err();
        assert!(err.contains("output"));

        let err = validate_graph(
            vec![
                task("t1", "step", vec![], true),
                task("t2", "step", vec![], true),
            ],
            &functions,
            &inputs,
        )
        .unwrap_err();
        assert!(err.contains("more than one"));
    }

    #[test]
    fn rejects_duplicate_parameter_bindings() {
        let functions: HashMap<_, _> = vec![function("step")].into_iter().collect();
        let inputs: HashSet<String> = ["a".to_string(), "b".to_string()].into_iter().collect();
        let err = validate_graph(
            vec![task(
                "t1",
                "step",
                vec![
                    ("value", BindingSource::Input("a".to_string())),
                    ("value", BindingSource::Input("b".to_string())),
                ],
                true,
            )],
            &functions,
            &inputs,
        )
        .unwrap_err();
        assert!(err.contains("more than once"));
    }
}
