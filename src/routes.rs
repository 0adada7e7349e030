//! HTTP API. Every subcommand of the CLI talks to these routes; they are a
//! thin layer over [`crate::jobsvc::JobService`].

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};

use crate::{
    api_objects::{
        ApiError, CreateJobRequest, CreateJobResponse, CreateRespoolResponse, CreateUpdateRequest,
        CreateUpdateResponse, InstancesRequest, JobResponse, QueryJobsRequest, QueryJobsResponse,
        TaskRangeQuery, TasksResponse, UpdateResponse,
    },
    data_model::{JobId, TaskInfo, UpdateId},
    jobsvc::JobService,
    respool::RespoolConfig,
};

#[derive(Clone)]
pub struct RouteState {
    pub job_service: Arc<JobService>,
}

pub fn create_routes(state: RouteState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/jobs", post(create_job))
        .route("/v1/jobs/query", post(query_jobs))
        .route("/v1/jobs/{job_id}", get(get_job).delete(delete_job))
        .route("/v1/jobs/{job_id}/tasks", get(list_tasks))
        .route("/v1/jobs/{job_id}/tasks/{instance_id}", get(get_task))
        .route("/v1/jobs/{job_id}/tasks/start", post(start_tasks))
        .route("/v1/jobs/{job_id}/tasks/stop", post(stop_tasks))
        .route("/v1/jobs/{job_id}/tasks/restart", post(restart_tasks))
        .route("/v1/jobs/{job_id}/updates", post(create_update))
        .route("/v1/updates/{update_id}", get(get_update))
        .route("/v1/respools", post(create_respool))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn create_job(
    State(state): State<RouteState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<Json<CreateJobResponse>, ApiError> {
    let job_id = state
        .job_service
        .create_job(request.job_id.map(JobId::new), request.config)
        .await?;
    Ok(Json(CreateJobResponse {
        job_id: job_id.to_string(),
    }))
}

async fn get_job(
    State(state): State<RouteState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job_id = JobId::new(job_id);
    let (config, runtime) = state.job_service.get_job(&job_id).await?;
    Ok(Json(JobResponse {
        job_id: job_id.to_string(),
        config,
        runtime,
    }))
}

async fn delete_job(
    State(state): State<RouteState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.job_service.delete_job(&JobId::new(job_id)).await?;
    Ok(Json(serde_json::json!({})))
}

async fn query_jobs(
    State(state): State<RouteState>,
    Json(request): Json<QueryJobsRequest>,
) -> Result<Json<QueryJobsResponse>, ApiError> {
    let job_ids = state.job_service.query_jobs(&request.labels).await?;
    Ok(Json(QueryJobsResponse {
        job_ids: job_ids.iter().map(ToString::to_string).collect(),
    }))
}

async fn list_tasks(
    State(state): State<RouteState>,
    Path(job_id): Path<String>,
    Query(range): Query<TaskRangeQuery>,
) -> Result<Json<TasksResponse>, ApiError> {
    let tasks = state
        .job_service
        .list_tasks(
            &JobId::new(job_id),
            range.from,
            range.to.unwrap_or(u32::MAX),
        )
        .await?;
    Ok(Json(TasksResponse { tasks }))
}

async fn get_task(
    State(state): State<RouteState>,
    Path((job_id, instance_id)): Path<(String, u32)>,
) -> Result<Json<TaskInfo>, ApiError> {
    let task = state
        .job_service
        .get_task(&JobId::new(job_id), instance_id)
        .await?;
    Ok(Json(task))
}

async fn start_tasks(
    State(state): State<RouteState>,
    Path(job_id): Path<String>,
    Json(request): Json<InstancesRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .job_service
        .start_tasks(&JobId::new(job_id), request.instances)
        .await?;
    Ok(Json(serde_json::json!({})))
}

async fn stop_tasks(
    State(state): State<RouteState>,
    Path(job_id): Path<String>,
    Json(request): Json<InstancesRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .job_service
        .stop_tasks(&JobId::new(job_id), request.instances)
        .await?;
    Ok(Json(serde_json::json!({})))
}

async fn restart_tasks(
    State(state): State<RouteState>,
    Path(job_id): Path<String>,
    Json(request): Json<InstancesRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .job_service
        .restart_tasks(&JobId::new(job_id), request.instances)
        .await?;
    Ok(Json(serde_json::json!({})))
}

async fn create_update(
    State(state): State<RouteState>,
    Path(job_id): Path<String>,
    Json(request): Json<CreateUpdateRequest>,
) -> Result<Json<CreateUpdateResponse>, ApiError> {
    let update_id = state
        .job_service
        .create_update(
            &JobId::new(job_id),
            request.job_config,
            request.update_config,
            request.workflow_type,
        )
        .await?;
    Ok(Json(CreateUpdateResponse {
        update_id: update_id.to_string(),
    }))
}

async fn get_update(
    State(state): State<RouteState>,
    Path(update_id): Path<String>,
) -> Result<Json<UpdateResponse>, ApiError> {
    let update = state
        .job_service
        .get_update(&UpdateId::from(update_id.as_str()))
        .await?;
    Ok(Json(UpdateResponse { update }))
}

async fn create_respool(
    State(state): State<RouteState>,
    Json(config): Json<RespoolConfig>,
) -> Result<Json<CreateRespoolResponse>, ApiError> {
    let respool_id = state.job_service.create_respool(&config).await?;
    Ok(Json(CreateRespoolResponse { respool_id }))
}
