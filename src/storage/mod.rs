//! Store interfaces for the durable records the orchestrator manages.
//!
//! The storage backend itself is external; these traits are the entire
//! surface the core depends on. Writes are revisioned: every runtime write
//! carries the revision the caller read, and the store rejects the write
//! with [`StoreError::Conflict`] when the record has moved underneath it.

use async_trait::async_trait;

use crate::data_model::{
    InstanceId, JobConfig, JobId, JobRuntime, JobState, Label, PersistentVolumeInfo, PodEvent,
    TaskInfo, TaskRuntime, UpdateId, UpdateInfo, UpdateState, VolumeId,
};

pub mod memory;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("revision conflict on {id}: expected {expected}, stored {actual}")]
    Conflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("store unavailable: {message}")]
    Unavailable { message: String },

    #[error("invalid record: {message}")]
    Invalid { message: String },
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn already_exists(kind: &'static str, id: impl ToString) -> Self {
        Self::AlreadyExists {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Identifies failures worth retrying. Conflicts are retryable after the
    /// caller reloads; Unavailable is retryable as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Unavailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new job's config and runtime. Fails with AlreadyExists.
    async fn create_job(
        &self,
        job_id: &JobId,
        config: &JobConfig,
        runtime: &JobRuntime,
    ) -> Result<()>;

    /// Config at the given version, or the latest when `version` is None.
    async fn get_job_config(&self, job_id: &JobId, version: Option<u64>) -> Result<JobConfig>;

    /// Persists a new config version. The version must be strictly greater
    /// than every previously stored version.
    async fn update_job_config(&self, job_id: &JobId, config: &JobConfig) -> Result<()>;

    async fn get_job_runtime(&self, job_id: &JobId) -> Result<JobRuntime>;

    /// Revisioned runtime write: `expected_revision` is the version the
    /// caller read. The stored runtime's revision must advance strictly.
    async fn update_job_runtime(
        &self,
        job_id: &JobId,
        runtime: &JobRuntime,
        expected_revision: u64,
    ) -> Result<()>;

    async fn get_jobs_by_state(&self, state: JobState) -> Result<Vec<JobId>>;

    async fn delete_job(&self, job_id: &JobId) -> Result<()>;

    /// Jobs whose config labels contain all the given labels.
    async fn query_jobs(&self, labels: &[Label]) -> Result<Vec<JobId>>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persists a new task record. Fails with AlreadyExists.
    async fn create_task(
        &self,
        job_id: &JobId,
        instance_id: InstanceId,
        info: &TaskInfo,
        owner: &str,
    ) -> Result<()>;

    async fn get_task_for_job(&self, job_id: &JobId, instance_id: InstanceId) -> Result<TaskInfo>;

    async fn get_task_runtime(
        &self,
        job_id: &JobId,
        instance_id: InstanceId,
    ) -> Result<TaskRuntime>;

    async fn get_task_config(
        &self,
        job_id: &JobId,
        instance_id: InstanceId,
        version: u64,
    ) -> Result<crate::data_model::TaskConfig>;

    /// Revisioned runtime write; appends a pod event on success.
    async fn update_task_runtime(
        &self,
        job_id: &JobId,
        instance_id: InstanceId,
        runtime: &TaskRuntime,
        expected_revision: u64,
    ) -> Result<()>;

    /// Tasks for a job in `[from, to)` instance range.
    async fn get_tasks_for_job_by_range(
        &self,
        job_id: &JobId,
        from: InstanceId,
        to: InstanceId,
    ) -> Result<Vec<TaskInfo>>;

    /// Pod events of one instance, oldest first, optionally filtered to a
    /// single run index.
    async fn get_pod_events(
        &self,
        job_id: &JobId,
        instance_id: InstanceId,
        run: Option<u64>,
    ) -> Result<Vec<PodEvent>>;
}

#[async_trait]
pub trait VolumeStore: Send + Sync {
    /// NotFound is a meaningful outcome here: a task whose volume record is
    /// missing goes through the normal placement path.
    async fn get_persistent_volume(&self, volume_id: &VolumeId) -> Result<PersistentVolumeInfo>;
}

#[async_trait]
pub trait UpdateStore: Send + Sync {
    async fn create_update(&self, update: &UpdateInfo) -> Result<()>;

    async fn get_update(&self, update_id: &UpdateId) -> Result<UpdateInfo>;

    /// Single progress write per update run.
    async fn write_progress(
        &self,
        update_id: &UpdateId,
        state: UpdateState,
        done: &[InstanceId],
        failed: &[InstanceId],
        current: &[InstanceId],
    ) -> Result<()>;

    /// Full record write, used when the update itself changes shape
    /// (rollback swaps versions and instance sets).
    async fn update_update(&self, update: &UpdateInfo) -> Result<()>;

    async fn get_updates_for_job(&self, job_id: &JobId) -> Result<Vec<UpdateInfo>>;

    async fn delete_update(&self, update_id: &UpdateId) -> Result<()>;
}
