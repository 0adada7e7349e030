//! Shared fixture wiring the whole pipeline against the in-memory store and
//! the loopback resource/host managers.

use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;

use crate::{
    config::GoalStateConfig,
    data_model::{
        new_initializing_runtime, JobConfig, JobId, JobRuntime, JobType, TaskInfo, TaskRuntime,
    },
    goal_state::driver::GoalStateDriver,
    rpc::local::{AgentSpec, LocalHostManager, LocalResourceManager},
    storage::{memory::InMemoryStore, JobStore, TaskStore},
    tracker::{ScheduleRequest, Tracker},
};

pub struct TestHarness {
    pub store: Arc<InMemoryStore>,
    pub resmgr: Arc<LocalResourceManager>,
    pub host_manager: Arc<LocalHostManager>,
    pub tracker: Arc<Tracker>,
    pub driver: Arc<GoalStateDriver>,
    pub schedule_rx: mpsc::UnboundedReceiver<ScheduleRequest>,
}

pub fn test_goal_state_config() -> GoalStateConfig {
    GoalStateConfig {
        engine_workers: 4,
        launch_timeout_sec: 600,
        max_launch_retries: 2,
        max_killing_attempts: 2,
        failure_retry_limit: 3,
        failure_retry_delay_sec: 1,
        max_retry_delay_sec: 5,
        rpc_timeout_sec: 2,
        kill_rpc_timeout_sec: 2,
        stop_retry_delay_sec: 1,
        update_run_interval_sec: 1,
    }
}

pub fn test_agents(count: usize) -> Vec<AgentSpec> {
    (0..count)
        .map(|i| AgentSpec {
            hostname: format!("host{i}"),
            cpus: 8.0,
            mem_mb: 8192.0,
            disk_mb: 100_000.0,
            port_begin: 31000,
            port_end: 32000,
        })
        .collect()
}

impl TestHarness {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let resmgr = Arc::new(LocalResourceManager::new(Duration::from_millis(10)));
        let host_manager = Arc::new(LocalHostManager::new(
            test_agents(2),
            Duration::from_millis(50),
        ));
        let (tracker, schedule_rx) = Tracker::new(store.clone(), store.clone(), store.clone());
        let driver = GoalStateDriver::new(
            tracker.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            resmgr.clone(),
            host_manager.clone(),
            test_goal_state_config(),
        );
        Self {
            store,
            resmgr,
            host_manager,
            tracker,
            driver,
            schedule_rx,
        }
    }

    /// Persists a job and all its task records in INITIALIZED state.
    pub async fn create_job_with_tasks(&self, job_id: &JobId, config: &JobConfig) {
        self.store
            .create_job(job_id, config, &JobRuntime::default())
            .await
            .unwrap();
        for instance_id in 0..config.instance_count {
            let info = TaskInfo {
                job_id: job_id.clone(),
                instance_id,
                config: config.task_config(instance_id).clone(),
                runtime: new_initializing_runtime(job_id, instance_id, config),
            };
            self.store
                .create_task(job_id, instance_id, &info, &config.owning_team)
                .await
                .unwrap();
        }
    }

    /// Read-modify-write of one task runtime straight through the store.
    pub async fn mutate_task_runtime(
        &self,
        job_id: &JobId,
        instance_id: u32,
        mutate: impl FnOnce(&mut TaskRuntime),
    ) {
        let current = self.store.get_task_runtime(job_id, instance_id).await.unwrap();
        let mut updated = current.clone();
        mutate(&mut updated);
        updated.revision = current.revision.next();
        self.store
            .update_task_runtime(job_id, instance_id, &updated, current.revision.version)
            .await
            .unwrap();
    }

    pub fn default_job(&self, name: &str, job_type: JobType, instances: u32) -> (JobId, JobConfig) {
        let job_id = JobId::from(name);
        let config = crate::data_model::test_objects::tests::mock_job_config(job_type, instances);
        (job_id, config)
    }
}
