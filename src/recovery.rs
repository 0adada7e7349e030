//! Leader-gain recovery: jobs can be left in INITIALIZED with only part of
//! their tasks created when a job manager dies mid-creation. On gaining
//! leadership the recovery pass creates the missing tasks, requeues the
//! INITIALIZED ones, and moves the job to PENDING.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::{
    data_model::{
        new_initializing_runtime, JobId, JobState, TaskInfo,
    },
    metrics::RecoveryMetrics,
    rpc::{Gang, ResourceManagerClient},
    storage::{JobStore, TaskStore},
    tracker::Tracker,
    utils::get_epoch_time_in_ms,
};

/// Instances examined per store round trip.
const BATCH_ROWS: u32 = 1000;

pub struct Recovery {
    job_store: Arc<dyn JobStore>,
    task_store: Arc<dyn TaskStore>,
    resmgr: Arc<dyn ResourceManagerClient>,
    tracker: Arc<Tracker>,
    /// Jobs younger than this are skipped to avoid racing their creator;
    /// recovery passes are also rate-limited to this interval.
    recovery_interval: Duration,
    last_recovery_time: Mutex<Option<Instant>>,
    metrics: RecoveryMetrics,
}

impl Recovery {
    pub fn new(
        job_store: Arc<dyn JobStore>,
        task_store: Arc<dyn TaskStore>,
        resmgr: Arc<dyn ResourceManagerClient>,
        tracker: Arc<Tracker>,
        recovery_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            job_store,
            task_store,
            resmgr,
            tracker,
            recovery_interval,
            last_recovery_time: Mutex::new(None),
            metrics: RecoveryMetrics::new(),
        })
    }

    /// Scans INITIALIZED jobs and completes their task creation. Runs at
    /// most once per recovery interval.
    pub async fn recover_jobs(&self) {
        {
            let mut last = self.last_recovery_time.lock().await;
            if let Some(at) = *last {
                if at.elapsed() < self.recovery_interval {
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        let job_ids = match self.job_store.get_jobs_by_state(JobState::Initialized).await {
            Ok(job_ids) => job_ids,
            Err(err) => {
                error!(error = %err, "listing initialized jobs failed");
                return;
            }
        };
        info!(count = job_ids.len(), "recovering initialized jobs");

        for job_id in job_ids {
            match self.recover_job(&job_id).await {
                Ok(()) => self.metrics.jobs_recovered.add(1, &[]),
                Err(err) => {
                    error!(job = %job_id, error = %err, "job recovery failed");
                    self.metrics.jobs_recover_failed.add(1, &[]);
                }
            }
        }
    }

    /// Makes sure every task of one job exists and is queued.
    pub async fn recover_job(&self, job_id: &JobId) -> Result<()> {
        info!(job = %job_id, "recovering job");
        let job_config = self.job_store.get_job_config(job_id, None).await?;
        let job_runtime = self.job_store.get_job_runtime(job_id).await?;

        // a job created moments ago may still be mid-creation by its owner
        let age_ms = get_epoch_time_in_ms().saturating_sub(job_runtime.creation_time);
        if Duration::from_millis(age_ms) < self.recovery_interval {
            info!(job = %job_id, "job created recently, skipping");
            return Ok(());
        }

        let instance_count = job_config.instance_count;
        for batch in 0..(instance_count / BATCH_ROWS + 1) {
            let start = batch * BATCH_ROWS;
            let end = ((batch + 1) * BATCH_ROWS).min(instance_count);
            debug!(job = %job_id, start, end, "validating task range");

            let mut to_requeue: Vec<TaskInfo> = vec![];
            for instance_id in start..end {
                match self.task_store.get_task_for_job(job_id, instance_id).await {
                    Err(err) if err.is_not_found() => {
                        info!(job = %job_id, instance_id, "creating missing task");
                        let info = TaskInfo {
                            job_id: job_id.clone(),
                            instance_id,
                            config: job_config.task_config(instance_id).clone(),
                            runtime: new_initializing_runtime(job_id, instance_id, &job_config),
                        };
                        self.task_store
                            .create_task(job_id, instance_id, &info, &job_config.owning_team)
                            .await?;
                        self.metrics.tasks_created.add(1, &[]);
                        to_requeue.push(info);
                    }
                    Err(err) => {
                        error!(job = %job_id, instance_id, error = %err, "reading task failed");
                        continue;
                    }
                    Ok(info) if info.runtime.state == crate::data_model::TaskState::Initialized => {
                        info!(job = %job_id, instance_id, "requeueing initialized task");
                        self.metrics.tasks_requeued.add(1, &[]);
                        to_requeue.push(info);
                    }
                    // anything past INITIALIZED is already on its way
                    Ok(_) => {}
                }
            }

            if !to_requeue.is_empty() {
                let gangs: Vec<Gang> = to_requeue.into_iter().map(Gang::single).collect();
                self.resmgr.enqueue_gangs(gangs).await?;
            }
        }

        let mut runtime = job_runtime;
        runtime.state = JobState::Pending;
        self.tracker.update_job_runtime(job_id, &runtime).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data_model::{JobRuntime, JobType, Revision, TaskState},
        storage::{JobStore as _, TaskStore as _},
        testing::TestHarness,
    };

    fn recovery(harness: &TestHarness, interval: Duration) -> Arc<Recovery> {
        Recovery::new(
            harness.store.clone(),
            harness.store.clone(),
            harness.resmgr.clone(),
            harness.tracker.clone(),
            interval,
        )
    }

    async fn create_old_initialized_job(
        harness: &TestHarness,
        name: &str,
        instance_count: u32,
    ) -> JobId {
        let (job_id, config) = harness.default_job(name, JobType::Batch, instance_count);
        let runtime = JobRuntime {
            state: JobState::Initialized,
            goal_state: JobState::Succeeded,
            creation_time: get_epoch_time_in_ms() - 20 * 60 * 1000,
            completion_time: None,
            revision: Revision::new(1),
        };
        harness
            .store
            .create_job(&job_id, &config, &runtime)
            .await
            .unwrap();
        job_id
    }

    #[tokio::test]
    async fn test_recovers_partially_created_job() {
        let harness = TestHarness::new();
        let job_id = create_old_initialized_job(&harness, "job1", 3).await;
        let config = harness.store.get_job_config(&job_id, None).await.unwrap();

        // only instance 0 was created before the old leader died
        let info = TaskInfo {
            job_id: job_id.clone(),
            instance_id: 0,
            config: config.task_config(0).clone(),
            runtime: new_initializing_runtime(&job_id, 0, &config),
        };
        harness
            .store
            .create_task(&job_id, 0, &info, &config.owning_team)
            .await
            .unwrap();

        let recovery = recovery(&harness, Duration::from_secs(900));
        recovery.recover_job(&job_id).await.unwrap();

        // instances 1 and 2 exist now, and everything was requeued
        for i in 0..3 {
            let runtime = harness.store.get_task_runtime(&job_id, i).await.unwrap();
            assert_eq!(runtime.state, TaskState::Initialized);
        }
        assert_eq!(harness.resmgr.enqueued_total(), 3);

        let job_runtime = harness.store.get_job_runtime(&job_id).await.unwrap();
        assert_eq!(job_runtime.state, JobState::Pending);
    }

    #[tokio::test]
    async fn test_recovery_is_idempotent() {
        let harness = TestHarness::new();
        let job_id = create_old_initialized_job(&harness, "job1", 3).await;

        let recovery = recovery(&harness, Duration::from_secs(900));
        recovery.recover_job(&job_id).await.unwrap();
        let first: Vec<u32> = harness
            .store
            .get_tasks_for_job_by_range(&job_id, 0, 100)
            .await
            .unwrap()
            .iter()
            .map(|t| t.instance_id)
            .collect();

        recovery.recover_job(&job_id).await.unwrap();
        let second: Vec<u32> = harness
            .store
            .get_tasks_for_job_by_range(&job_id, 0, 100)
            .await
            .unwrap()
            .iter()
            .map(|t| t.instance_id)
            .collect();

        assert_eq!(first, vec![0, 1, 2]);
        assert_eq!(second, first, "no duplicate instance ids");
    }

    #[tokio::test]
    async fn test_recent_jobs_are_skipped() {
        let harness = TestHarness::new();
        let (job_id, config) = harness.default_job("job1", JobType::Batch, 2);
        harness
            .store
            .create_job(&job_id, &config, &JobRuntime::default())
            .await
            .unwrap();

        let recovery = recovery(&harness, Duration::from_secs(900));
        recovery.recover_job(&job_id).await.unwrap();

        // nothing created, job untouched
        assert!(harness
            .store
            .get_tasks_for_job_by_range(&job_id, 0, 10)
            .await
            .unwrap()
            .is_empty());
        let runtime = harness.store.get_job_runtime(&job_id).await.unwrap();
        assert_eq!(runtime.state, JobState::Initialized);
    }

    #[tokio::test]
    async fn test_tasks_past_initialized_are_left_alone() {
        let harness = TestHarness::new();
        let job_id = create_old_initialized_job(&harness, "job1", 2).await;
        let config = harness.store.get_job_config(&job_id, None).await.unwrap();

        for i in 0..2 {
            let info = TaskInfo {
                job_id: job_id.clone(),
                instance_id: i,
                config: config.task_config(i).clone(),
                runtime: new_initializing_runtime(&job_id, i, &config),
            };
            harness
                .store
                .create_task(&job_id, i, &info, &config.owning_team)
                .await
                .unwrap();
        }
        // instance 1 is already running
        harness
            .mutate_task_runtime(&job_id, 1, |r| r.state = TaskState::Running)
            .await;

        let recovery = recovery(&harness, Duration::from_secs(900));
        recovery.recover_job(&job_id).await.unwrap();

        // only the initialized instance was requeued
        assert_eq!(harness.resmgr.enqueued_total(), 1);
        let runtime = harness.store.get_task_runtime(&job_id, 1).await.unwrap();
        assert_eq!(runtime.state, TaskState::Running);
    }
}
