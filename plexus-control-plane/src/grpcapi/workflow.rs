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
use std::sync::Arc;
use std::time::Duration;

use plexus_api_grpc::proto::plexus::common::{Empty, ErrorBody};
use plexus_api_grpc::proto::plexus::workflow::v1 as workflow_proto;
use plexus_api_grpc::proto::plexus::workflow::v1::workflow_service_server::WorkflowService as GrpcWorkflowService;
use plexus_common::metrics::api::TraceErrorKind;
use plexus_common::model::{ErrorKind, TaskId, WorkflowId};
use plexus_common::recorded_grpc_api_request;
use tonic::{Request, Response, Status};
use tracing::Instrument;

use crate::service::workflow::{
    BindingSource, SubmitRequest, TaskNode, WorkflowService, WorkflowServiceError,
};

impl From<WorkflowServiceError> for workflow_proto::WorkflowError {
    fn from(value: WorkflowServiceError) -> Self {
        match value {
            WorkflowServiceError::InvalidArgument(message) => {
                error_to_proto(ErrorKind::InvalidArgument, message)
            }
            WorkflowServiceError::NotFound(workflow_id) => error_to_proto(
                ErrorKind::NotFound,
                format!("workflow {workflow_id} not found"),
            ),
            WorkflowServiceError::Execution(failure) => {
                error_to_proto(failure.kind, failure.message)
            }
            WorkflowServiceError::Internal(message) => error_to_proto(ErrorKind::Fatal, message),
        }
    }
}

fn error_to_proto(kind: ErrorKind, message: String) -> workflow_proto::WorkflowError {
    use workflow_proto::workflow_error::Error;

    let body = ErrorBody { error: message };
    let error = match kind {
        ErrorKind::InvalidArgument => Error::InvalidArgument(body),
        ErrorKind::NoCapacity => Error::NoCapacity(body),
        ErrorKind::ColdStartFailed => Error::ColdStartFailed(body),
        ErrorKind::WorkerCrashed => Error::WorkerCrashed(body),
        ErrorKind::Timeout => Error::Timeout(body),
        ErrorKind::Cancelled => Error::Cancelled(body),
        ErrorKind::PeerUnreachable => Error::PeerUnreachable(body),
        ErrorKind::UpstreamFailed => Error::UpstreamFailed(body),
        ErrorKind::NotFound => Error::NotFound(body),
        ErrorKind::Fatal => Error::Internal(body),
    };
    workflow_proto::WorkflowError { error: Some(error) }
}

struct WorkflowTraceErrorKind<'a>(&'a workflow_proto::WorkflowError);

impl TraceErrorKind for WorkflowTraceErrorKind<'_> {
    fn trace_error_kind(&self) -> &'static str {
        use workflow_proto::workflow_error::Error;

        match &self.0.error {
            None => "unknown",
            Some(Error::InvalidArgument(_)) => "invalid_argument",
            Some(Error::NoCapacity(_)) => "no_capacity",
            Some(Error::ColdStartFailed(_)) => "cold_start_failed",
            Some(Error::WorkerCrashed(_)) => "worker_crashed",
            Some(Error::Timeout(_)) => "timeout",
            Some(Error::Cancelled(_)) => "cancelled",
            Some(Error::PeerUnreachable(_)) => "peer_unreachable",
            Some(Error::UpstreamFailed(_)) => "upstream_failed",
            Some(Error::NotFound(_)) => "not_found",
            Some(Error::Internal(_)) => "internal",
        }
    }

    fn is_expected(&self) -> bool {
        use workflow_proto::workflow_error::Error;

        !matches!(&self.0.error, Some(Error::Internal(_)) | None)
    }
}

fn bad_request_error(error: impl Into<String>) -> workflow_proto::WorkflowError {
    error_to_proto(ErrorKind::InvalidArgument, error.into())
}

pub struct WorkflowGrpcApi {
    pub workflow_service: Arc<dyn WorkflowService>,
}

impl WorkflowGrpcApi {
    async fn submit(
        &self,
        request: workflow_proto::SubmitWorkflowRequest,
    ) -> Result<workflow_proto::WorkflowId, workflow_proto::WorkflowError> {
        let graph = request
            .graph
            .ok_or_else(|| bad_request_error("Missing workflow graph"))?;

        let tasks = graph
            .tasks
            .into_iter()
            .map(task_from_proto)
            .collect::<Result<Vec<_>, _>>()?;

        let functions = request
            .functions
            .into_iter()
            .map(|def| def.try_into().map_err(bad_request_error))
            .collect::<Result<Vec<_>, workflow_proto::WorkflowError>>()?;

        let inputs: HashMap<String, plexus_common::model::EncodedValue> = request
            .inputs
            .into_iter()
            .map(|(name, object)| (name, object.into()))
            .collect();

        let submit = SubmitRequest {
            tasks,
            functions,
            inputs,
            default_task_timeout: if request.default_task_timeout_ms == 0 {
                None
            } else {
                Some(Duration::from_millis(request.default_task_timeout_ms))
            },
        };

        let workflow_id = self.workflow_service.submit(submit).await?;
        Ok(workflow_id.into())
    }

    async fn wait(
        &self,
        request: workflow_proto::WaitWorkflowRequest,
    ) -> Result<workflow_proto::WorkflowOutput, workflow_proto::WorkflowError> {
        let workflow_id = workflow_id_from_proto(request.workflow_id)?;
        let output = self.workflow_service.wait(&workflow_id).await?;
        Ok(workflow_proto::WorkflowOutput {
            object_ref: Some(output.reference.into()),
            object: Some(output.object.into()),
        })
    }

    async fn status(
        &self,
        request: workflow_proto::GetWorkflowStatusRequest,
    ) -> Result<workflow_proto::WorkflowStatus, workflow_proto::WorkflowError> {
        let workflow_id = workflow_id_from_proto(request.workflow_id)?;
        let status = self.workflow_service.status(&workflow_id).await?;
        Ok(workflow_proto::WorkflowStatus {
            workflow_id: Some(status.workflow_id.into()),
            state: workflow_proto::WorkflowState::from(status.state) as i32,
            tasks: status
                .tasks
                .into_iter()
                .map(|task| workflow_proto::TaskStatus {
                    task_id: task.task_id.to_string(),
                    state: workflow_proto::TaskState::from(task.state) as i32,
                    attempts: task.attempts,
                    error: task.error.unwrap_or_default(),
                })
                .collect(),
        })
    }

    async fn cancel(
        &self,
        request: workflow_proto::CancelWorkflowRequest,
    ) -> Result<(), workflow_proto::WorkflowError> {
        let workflow_id = workflow_id_from_proto(request.workflow_id)?;
        self.workflow_service.cancel(&workflow_id).await?;
        Ok(())
    }
}

fn workflow_id_from_proto(
    id: Option<workflow_proto::WorkflowId>,
) -> Result<WorkflowId, workflow_proto::WorkflowError> {
    id.ok_or_else(|| bad_request_error("Missing workflow id"))?
        .try_into()
        .map_err(bad_request_error)
}

fn task_from_proto(
    task: workflow_proto::TaskDef,
) -> Result<TaskNode, workflow_proto::WorkflowError> {
    let bindings = task
        .bindings
        .into_iter()
        .map(|binding| {
            let source = match binding.source {
                Some(workflow_proto::task_binding::Source::InputName(name)) => {
                    BindingSource::Input(name)
                }
                Some(workflow_proto::task_binding::Source::TaskId(task_id)) => {
                    BindingSource::Task(TaskId::new(task_id))
                }
                None => {
                    return Err(bad_request_error(format!(
                        "Binding {} of task {} has no source",
                        binding.param, task.task_id
                    )))
                }
            };
            Ok((binding.param, source))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TaskNode {
        task_id: TaskId::new(task.task_id),
        function_name: task.function_name,
        bindings,
        is_output: task.is_output,
    })
}

#[tonic::async_trait]
impl GrpcWorkflowService for WorkflowGrpcApi {
    async fn submit_workflow(
        &self,
        request: Request<workflow_proto::SubmitWorkflowRequest>,
    ) -> Result<Response<workflow_proto::SubmitWorkflowResponse>, Status> {
        let request = request.into_inner();
        let record =
            recorded_grpc_api_request!("submit_workflow", task_count = request
                .graph
                .as_ref()
                .map(|g| g.tasks.len())
                .unwrap_or(0));

        let response = match self.submit(request).instrument(record.span.clone()).await {
            Ok(workflow_id) => record.succeed(
                workflow_proto::submit_workflow_response::Result::Success(workflow_id),
            ),
            Err(error) => record.fail(
                workflow_proto::submit_workflow_response::Result::Error(error.clone()),
                &WorkflowTraceErrorKind(&error),
            ),
        };

        Ok(Response::new(workflow_proto::SubmitWorkflowResponse {
            result: Some(response),
        }))
    }

    async fn wait_workflow(
        &self,
        request: Request<workflow_proto::WaitWorkflowRequest>,
    ) -> Result<Response<workflow_proto::WaitWorkflowResponse>, Status> {
        let request = request.into_inner();
        let record = recorded_grpc_api_request!(
            "wait_workflow",
            workflow_id = request
                .workflow_id
                .as_ref()
                .map(|id| id.value.clone())
                .unwrap_or_default()
        );

        let response = match self.wait(request).instrument(record.span.clone()).await {
            Ok(output) => {
                record.succeed(workflow_proto::wait_workflow_response::Result::Success(output))
            }
            Err(error) => record.fail(
                workflow_proto::wait_workflow_response::Result::Error(error.clone()),
                &WorkflowTraceErrorKind(&error),
            ),
        };

        Ok(Response::new(workflow_proto::WaitWorkflowResponse {
            result: Some(response),
        }))
    }

    async fn get_workflow_status(
        &self,
        request: Request<workflow_proto::GetWorkflowStatusRequest>,
    ) -> Result<Response<workflow_proto::GetWorkflowStatusResponse>, Status> {
        let request = request.into_inner();
        let record = recorded_grpc_api_request!(
            "get_workflow_status",
            workflow_id = request
                .workflow_id
                .as_ref()
                .map(|id| id.value.clone())
                .unwrap_or_default()
        );

        let response = match self.status(request).instrument(record.span.clone()).await {
            Ok(status) => record.succeed(
                workflow_proto::get_workflow_status_response::Result::Success(status),
            ),
            Err(error) => record.fail(
                workflow_proto::get_workflow_status_response::Result::Error(error.clone()),
                &WorkflowTraceErrorKind(&error),
            ),
        };

        Ok(Response::new(workflow_proto::GetWorkflowStatusResponse {
            result: Some(response),
        }))
    }

    async fn cancel_workflow(
        &self,
        request: Request<workflow_proto::CancelWorkflowRequest>,
    ) -> Result<Response<workflow_proto::CancelWorkflowResponse>, Status> {
        let request = request.into_inner();
        let record = recorded_grpc_api_request!(
            "cancel_workflow",
            workflow_id = request
                .workflow_id
                .as_ref()
                .map(|id| id.value.clone())
                .unwrap_or_default()
        );

        let response = match self.cancel(request).instrument(record.span.clone()).await {
            Ok(()) => record.succeed(workflow_proto::cancel_workflow_response::Result::Success(
                Empty {},
            )),
            Err(error) => record.fail(
                workflow_proto::cancel_workflow_response::Result::Error(error.clone()),
                &WorkflowTraceErrorKind(&error),
            ),
        };

        Ok(Response::new(workflow_proto::CancelWorkflowResponse {
            result: Some(response),
        }))
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn every_error_kind_maps_to_its_wire_arm() {
        let kinds = [
            (ErrorKind::InvalidArgument, "invalid_argument"),
            (ErrorKind::NoCapacity, "no_capacity"),
            (ErrorKind::ColdStartFailed, "cold_start_failed"),
            (ErrorKind::WorkerCrashed, "worker_crashed"),
            (ErrorKind::Timeout, "timeout"),
            (ErrorKind::Cancelled, "cancelled"),
            (ErrorKind::PeerUnreachable, "peer_unreachable"),
            (ErrorKind::UpstreamFailed, "upstream_failed"),
            (ErrorKind::NotFound, "not_found"),
            (ErrorKind::Fatal, "internal"),
        ];
        for (kind, expected) in kinds {
            let error = error_to_proto(kind, "boom".to_string());
            assert_eq!(WorkflowTraceErrorKind(&error).trace_error_kind(), expected);
        }
    }

    #[test]
    fn only_internal_errors_are_unexpected() {
        let internal = error_to_proto(ErrorKind::Fatal, "broken".to_string());
        assert!(!WorkflowTraceErrorKind(&internal).is_expected());

        let user_error = error_to_proto(ErrorKind::InvalidArgument, "bad".to_string());
        assert!(WorkflowTraceErrorKind(&user_error).is_expected());
    }
}
