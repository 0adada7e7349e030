//! JSON request/response shapes for the HTTP API, plus the error type every
//! handler funnels through.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{
    data_model::{
        InstanceId, JobConfig, JobRuntime, Label, TaskInfo, UpdateConfig, UpdateInfo, WorkflowType,
    },
    jobsvc::ServiceError,
    storage::StoreError,
};

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::Store(store_err) => match store_err {
                StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
                StoreError::AlreadyExists { .. } | StoreError::Conflict { .. } => {
                    StatusCode::CONFLICT
                }
                StoreError::Invalid { .. } => StatusCode::BAD_REQUEST,
                StoreError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ServiceError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                message: self.message,
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub job_id: Option<String>,
    pub config: JobConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub job_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub job_id: String,
    pub config: JobConfig,
    pub runtime: JobRuntime,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct QueryJobsRequest {
    pub labels: Vec<Label>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryJobsResponse {
    pub job_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TasksResponse {
    pub tasks: Vec<TaskInfo>,
}

#[derive(Debug, Deserialize)]
pub struct TaskRangeQuery {
    #[serde(default)]
    pub from: InstanceId,
    pub to: Option<InstanceId>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct InstancesRequest {
    /// Instance ids to operate on; every instance when omitted.
    pub instances: Option<Vec<InstanceId>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateUpdateRequest {
    pub job_config: JobConfig,
    #[serde(default)]
    pub update_config: UpdateConfig,
    #[serde(default)]
    pub workflow_type: WorkflowType,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateUpdateResponse {
    pub update_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub update: UpdateInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRespoolResponse {
    pub respool_id: String,
}
