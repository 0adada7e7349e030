//! Job, task and update operations behind the API surface. All writes go
//! through the stores and the tracker so the goal-state engine observes
//! every mutation.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info};

use crate::{
    data_model::{
        default_task_goal_state, new_initializing_runtime, InstanceId, JobConfig, JobId,
        JobRuntime, JobState, Label, TaskInfo, TaskState, UpdateConfig, UpdateId, UpdateInfo,
        UpdateState, WorkflowType,
    },
    goal_state::update_run::compute_instance_sets,
    respool::{validate_respool_config, RespoolConfig},
    rpc::{HostManagerClient, ResourceManagerClient},
    storage::{JobStore, StoreError, TaskStore, UpdateStore},
    tracker::{RuntimeDiff, Tracker},
    utils::get_epoch_time_in_ms,
};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid request: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

pub struct JobService {
    job_store: Arc<dyn JobStore>,
    task_store: Arc<dyn TaskStore>,
    update_store: Arc<dyn UpdateStore>,
    tracker: Arc<Tracker>,
    resmgr: Arc<dyn ResourceManagerClient>,
    host_manager: Arc<dyn HostManagerClient>,
}

impl JobService {
    pub fn new(
        job_store: Arc<dyn JobStore>,
        task_store: Arc<dyn TaskStore>,
        update_store: Arc<dyn UpdateStore>,
        tracker: Arc<Tracker>,
        resmgr: Arc<dyn ResourceManagerClient>,
        host_manager: Arc<dyn HostManagerClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            job_store,
            task_store,
            update_store,
            tracker,
            resmgr,
            host_manager,
        })
    }

    fn validate_job_config(config: &JobConfig) -> Result<()> {
        if config.name.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "job name must not be empty".to_string(),
            ));
        }
        if config.instance_count == 0 {
            return Err(ServiceError::InvalidArgument(
                "instance count must be positive".to_string(),
            ));
        }
        if config.default_config.resource.cpu_limit <= 0.0 {
            return Err(ServiceError::InvalidArgument(
                "default task config must request cpu".to_string(),
            ));
        }
        Ok(())
    }

    /// Persists a new job, creates its task records, and schedules every
    /// task so the goal-state engine pushes them into the resource manager.
    pub async fn create_job(
        &self,
        job_id: Option<JobId>,
        mut config: JobConfig,
    ) -> Result<JobId> {
        Self::validate_job_config(&config)?;
        if let Some(job_id) = &job_id {
            // the mesos task-id format splits on dashes with the job id as
            // the first segment
            if job_id.get().contains('-') || job_id.get().is_empty() {
                return Err(ServiceError::InvalidArgument(format!(
                    "job id {job_id:?} must be non-empty and contain no '-'"
                )));
            }
        }
        let job_id = job_id.unwrap_or_else(JobId::generate);
        if config.change_log.version == 0 {
            config.change_log = crate::data_model::Revision::new(1);
        }

        let goal_state = match config.job_type {
            crate::data_model::JobType::Service => JobState::Running,
            crate::data_model::JobType::Batch => JobState::Succeeded,
        };
        let runtime = JobRuntime {
            state: JobState::Initialized,
            goal_state,
            ..Default::default()
        };
        self.job_store.create_job(&job_id, &config, &runtime).await?;
        info!(job = %job_id, instances = config.instance_count, "created job");

        let job = self.tracker.get_or_create_job(&job_id);
        job.set_config(config.clone());

        for instance_id in 0..config.instance_count {
            let info = TaskInfo {
                job_id: job_id.clone(),
                instance_id,
                config: config.task_config(instance_id).clone(),
                runtime: new_initializing_runtime(&job_id, instance_id, &config),
            };
            self.task_store
                .create_task(&job_id, instance_id, &info, &config.owning_team)
                .await?;
            self.tracker
                .schedule_task(&info.key(), Duration::ZERO);
        }

        let mut pending = runtime;
        pending.state = JobState::Pending;
        self.tracker.update_job_runtime(&job_id, &pending).await?;
        Ok(job_id)
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<(JobConfig, JobRuntime)> {
        let config = self.job_store.get_job_config(job_id, None).await?;
        let runtime = self.job_store.get_job_runtime(job_id).await?;
        Ok((config, runtime))
    }

    pub async fn query_jobs(&self, labels: &[Label]) -> Result<Vec<JobId>> {
        Ok(self.job_store.query_jobs(labels).await?)
    }

    pub async fn delete_job(&self, job_id: &JobId) -> Result<()> {
        let runtime = self.job_store.get_job_runtime(job_id).await?;
        if !runtime.state.is_terminal() {
            return Err(ServiceError::InvalidArgument(format!(
                "job {job_id} is {}; stop it before deleting",
                runtime.state
            )));
        }
        self.job_store.delete_job(job_id).await?;
        self.tracker.untrack_job(job_id);
        Ok(())
    }

    pub async fn get_task(&self, job_id: &JobId, instance_id: InstanceId) -> Result<TaskInfo> {
        Ok(self.task_store.get_task_for_job(job_id, instance_id).await?)
    }

    pub async fn list_tasks(
        &self,
        job_id: &JobId,
        from: InstanceId,
        to: InstanceId,
    ) -> Result<Vec<TaskInfo>> {
        Ok(self
            .task_store
            .get_tasks_for_job_by_range(job_id, from, to)
            .await?)
    }

    fn resolve_instances(
        config: &JobConfig,
        instances: Option<Vec<InstanceId>>,
    ) -> Vec<InstanceId> {
        instances.unwrap_or_else(|| (0..config.instance_count).collect())
    }

    /// Sets the goal state of the given instances (all when None) back to
    /// the job default, restarting tasks that were stopped.
    pub async fn start_tasks(
        &self,
        job_id: &JobId,
        instances: Option<Vec<InstanceId>>,
    ) -> Result<()> {
        let config = self.job_store.get_job_config(job_id, None).await?;
        let goal = default_task_goal_state(config.job_type);
        let diffs = Self::resolve_instances(&config, instances)
            .into_iter()
            .map(|i| {
                (
                    i,
                    RuntimeDiff {
                        goal_state: Some(goal),
                        message: Some("task started by request".to_string()),
                        ..Default::default()
                    },
                )
            })
            .collect();
        self.tracker.patch_tasks(job_id, diffs).await?;
        Ok(())
    }

    /// Sets the goal state of the given instances to KILLED; the goal-state
    /// engine drives the kills.
    pub async fn stop_tasks(
        &self,
        job_id: &JobId,
        instances: Option<Vec<InstanceId>>,
    ) -> Result<()> {
        let config = self.job_store.get_job_config(job_id, None).await?;
        let diffs = Self::resolve_instances(&config, instances)
            .into_iter()
            .map(|i| {
                (
                    i,
                    RuntimeDiff {
                        goal_state: Some(TaskState::Killed),
                        message: Some("task stopped by request".to_string()),
                        ..Default::default()
                    },
                )
            })
            .collect();
        self.tracker.patch_tasks(job_id, diffs).await?;
        Ok(())
    }

    /// Restarts instances. Live runs are killed through the host manager
    /// and restart off the terminal status update; terminal runs are marked
    /// KILLED so the retry path starts a fresh run. Either way the goal
    /// state stays up.
    pub async fn restart_tasks(
        &self,
        job_id: &JobId,
        instances: Option<Vec<InstanceId>>,
    ) -> Result<()> {
        let config = self.job_store.get_job_config(job_id, None).await?;
        let goal = default_task_goal_state(config.job_type);
        for instance_id in Self::resolve_instances(&config, instances) {
            let runtime = self.task_store.get_task_runtime(job_id, instance_id).await?;
            let diffs = [(
                instance_id,
                RuntimeDiff {
                    goal_state: Some(goal),
                    state: runtime.state.is_terminal().then_some(TaskState::Killed),
                    message: Some("task restarted by request".to_string()),
                    ..Default::default()
                },
            )]
            .into_iter()
            .collect();
            self.tracker.patch_tasks(job_id, diffs).await?;

            if !runtime.state.is_terminal() {
                if let Some(mesos_task_id) = runtime.mesos_task_id {
                    debug!(job = %job_id, instance_id, "killing current run for restart");
                    self.host_manager
                        .kill_tasks(&[mesos_task_id])
                        .await
                        .map_err(ServiceError::Internal)?;
                }
            }
        }
        Ok(())
    }

    /// Creates a rolling workflow moving the job to a new config version.
    /// At most one non-terminal update may exist per job.
    pub async fn create_update(
        &self,
        job_id: &JobId,
        mut new_config: JobConfig,
        update_config: UpdateConfig,
        workflow_type: WorkflowType,
    ) -> Result<UpdateId> {
        Self::validate_job_config(&new_config)?;
        let current = self.job_store.get_job_config(job_id, None).await?;

        for existing in self.update_store.get_updates_for_job(job_id).await? {
            if !existing.state.is_terminal() {
                return Err(ServiceError::InvalidArgument(format!(
                    "job {job_id} already has update {} in {}",
                    existing.id, existing.state
                )));
            }
        }

        if new_config.change_log.version <= current.change_log.version {
            new_config.change_log = crate::data_model::Revision::new(current.change_log.version + 1);
        }
        self.job_store.update_job_config(job_id, &new_config).await?;

        let (added, updated, removed) =
            compute_instance_sets(current.instance_count, new_config.instance_count);
        let mut total: Vec<InstanceId> = added
            .iter()
            .chain(updated.iter())
            .chain(removed.iter())
            .copied()
            .collect();
        total.sort_unstable();

        let update = UpdateInfo {
            id: UpdateId::default(),
            job_id: job_id.clone(),
            workflow_type,
            config: update_config,
            state: UpdateState::Initialized,
            target_config_version: new_config.change_log.version,
            source_config_version: current.change_log.version,
            instances_total: total,
            instances_added: added,
            instances_updated: updated,
            instances_removed: removed,
            instances_done: vec![],
            instances_failed: vec![],
            instances_current: vec![],
            creation_time: get_epoch_time_in_ms(),
        };
        self.update_store.create_update(&update).await?;
        info!(job = %job_id, update = %update.id, "created update");
        self.tracker
            .schedule_update(&update.id, job_id, Duration::ZERO);
        Ok(update.id)
    }

    pub async fn get_update(&self, update_id: &UpdateId) -> Result<UpdateInfo> {
        Ok(self.update_store.get_update(update_id).await?)
    }

    /// Validates a resource-pool spec and forwards it to the resource
    /// manager.
    pub async fn create_respool(&self, config: &RespoolConfig) -> Result<String> {
        validate_respool_config(config).map_err(|e| ServiceError::InvalidArgument(e.to_string()))?;
        Ok(self.resmgr.create_resource_pool(config).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data_model::JobType,
        storage::{JobStore as _, TaskStore as _, UpdateStore as _},
        testing::TestHarness,
    };

    fn service(harness: &TestHarness) -> Arc<JobService> {
        JobService::new(
            harness.store.clone(),
            harness.store.clone(),
            harness.store.clone(),
            harness.tracker.clone(),
            harness.resmgr.clone(),
            harness.host_manager.clone(),
        )
    }

    #[tokio::test]
    async fn test_create_job_creates_tasks_and_schedules() {
        let mut harness = TestHarness::new();
        let svc = service(&harness);
        let config = crate::data_model::test_objects::tests::mock_job_config(JobType::Batch, 3);

        let job_id = svc.create_job(None, config).await.unwrap();

        let tasks = harness
            .store
            .get_tasks_for_job_by_range(&job_id, 0, 10)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 3);
        for task in &tasks {
            assert_eq!(task.runtime.state, TaskState::Initialized);
            assert_eq!(task.runtime.goal_state, TaskState::Succeeded);
        }

        let runtime = harness.store.get_job_runtime(&job_id).await.unwrap();
        assert_eq!(runtime.state, JobState::Pending);

        // every instance was scheduled into the goal-state pipeline
        let mut scheduled = 0;
        while harness.schedule_rx.try_recv().is_ok() {
            scheduled += 1;
        }
        assert_eq!(scheduled, 3);
    }

    #[tokio::test]
    async fn test_create_job_rejects_bad_config() {
        let harness = TestHarness::new();
        let svc = service(&harness);
        let mut config = crate::data_model::test_objects::tests::mock_job_config(JobType::Batch, 0);
        let err = svc.create_job(None, config.clone()).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));

        config.instance_count = 1;
        config.name.clear();
        let err = svc.create_job(None, config).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_stop_tasks_patches_goal_state() {
        let harness = TestHarness::new();
        let (job_id, config) = harness.default_job("job1", JobType::Service, 2);
        harness.create_job_with_tasks(&job_id, &config).await;
        let svc = service(&harness);

        svc.stop_tasks(&job_id, Some(vec![1])).await.unwrap();

        let untouched = harness.store.get_task_runtime(&job_id, 0).await.unwrap();
        assert_eq!(untouched.goal_state, TaskState::Running);
        let stopped = harness.store.get_task_runtime(&job_id, 1).await.unwrap();
        assert_eq!(stopped.goal_state, TaskState::Killed);
    }

    #[tokio::test]
    async fn test_delete_requires_terminal_job() {
        let harness = TestHarness::new();
        let (job_id, config) = harness.default_job("job1", JobType::Batch, 1);
        harness.create_job_with_tasks(&job_id, &config).await;
        let svc = service(&harness);

        let err = svc.delete_job(&job_id).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_single_nonterminal_update_per_job() {
        let harness = TestHarness::new();
        let (job_id, config) = harness.default_job("job1", JobType::Service, 2);
        harness.create_job_with_tasks(&job_id, &config).await;
        let svc = service(&harness);

        let mut new_config = config.clone();
        new_config.instance_count = 4;
        let update_id = svc
            .create_update(
                &job_id,
                new_config.clone(),
                UpdateConfig::default(),
                WorkflowType::Update,
            )
            .await
            .unwrap();

        let update = harness.store.get_update(&update_id).await.unwrap();
        assert_eq!(update.instances_added, vec![2, 3]);
        assert_eq!(update.instances_updated, vec![0, 1]);
        assert!(update.instances_removed.is_empty());
        assert_eq!(update.source_config_version, 1);
        assert_eq!(update.target_config_version, 2);

        // a second concurrent update is rejected
        let err = svc
            .create_update(
                &job_id,
                new_config,
                UpdateConfig::default(),
                WorkflowType::Update,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
    }
}
