//! Status-update processing: the stream of mesos task states from the host
//! manager, fanned out to a bounded set of workers writing through the
//! tracker. Updates for the same task always land on the same worker, so
//! per-task ordering survives the fan-out.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::{
    data_model::{
        mesos_state_to_task_state, parse_task_id_from_mesos, HealthState, JobId, MesosTaskState,
        TaskStatusUpdate,
    },
    rpc::{ExecutorOnAgent, HostManagerClient},
    tracker::{Tracker, UpdateMode},
    utils::get_epoch_time_in_ms,
};

pub struct StatusUpdateProcessor {
    tracker: Arc<Tracker>,
    host_manager: Arc<dyn HostManagerClient>,
    concurrency: usize,
}

impl StatusUpdateProcessor {
    pub fn new(
        tracker: Arc<Tracker>,
        host_manager: Arc<dyn HostManagerClient>,
        concurrency: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            tracker,
            host_manager,
            concurrency: concurrency.max(1),
        })
    }

    /// Starts the distributor and its workers.
    pub fn start(
        self: &Arc<Self>,
        mut status_rx: mpsc::UnboundedReceiver<TaskStatusUpdate>,
        shutdown_rx: watch::Receiver<()>,
    ) {
        let mut workers: Vec<mpsc::UnboundedSender<TaskStatusUpdate>> = vec![];
        for worker in 0..self.concurrency {
            let (tx, mut rx) = mpsc::unbounded_channel::<TaskStatusUpdate>();
            workers.push(tx);
            let processor = self.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            debug!(worker, "status update worker shutting down");
                            return;
                        }
                        update = rx.recv() => {
                            let Some(update) = update else { return };
                            if let Err(err) = processor.process(&update).await {
                                warn!(
                                    mesos_task_id = %update.mesos_task_id,
                                    error = %err,
                                    "status update processing failed"
                                );
                            }
                        }
                    }
                }
            });
        }

        let concurrency = self.concurrency;
        let mut shutdown_rx = shutdown_rx;
        tokio::spawn(async move {
            info!(workers = concurrency, "status update processor started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("status update distributor shutting down");
                        return;
                    }
                    update = status_rx.recv() => {
                        let Some(update) = update else { return };
                        let mut hasher = DefaultHasher::new();
                        update.mesos_task_id.get().hash(&mut hasher);
                        let worker = (hasher.finish() as usize) % concurrency;
                        let _ = workers[worker].send(update);
                    }
                }
            }
        });
    }

    /// Applies one status update through the tracker.
    pub async fn process(&self, update: &TaskStatusUpdate) -> Result<()> {
        let (job, instance_id) = match parse_task_id_from_mesos(update.mesos_task_id.get()) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(mesos_task_id = %update.mesos_task_id, error = %err, "unparseable task id");
                return Ok(());
            }
        };
        let job_id = JobId::new(job);

        let task = match self.tracker.get_or_create_task(&job_id, instance_id).await {
            Ok(task) => task,
            Err(_) => {
                // nothing known about this task: kill the orphan run
                return self.kill_orphan(update).await;
            }
        };

        let current = match task.runtime().await {
            Some(runtime) => runtime,
            None => {
                match self
                    .tracker
                    .task_store()
                    .get_task_runtime(&job_id, instance_id)
                    .await
                {
                    Ok(runtime) => runtime,
                    Err(err) if err.is_not_found() => {
                        return self.kill_orphan(update).await;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        };

        // update for a previous run of this instance
        if current.mesos_task_id.as_ref() != Some(&update.mesos_task_id) {
            debug!(
                mesos_task_id = %update.mesos_task_id,
                current = ?current.mesos_task_id,
                "status update for a stale run"
            );
            return self.kill_orphan(update).await;
        }

        let new_state = mesos_state_to_task_state(update.state);
        if current.state == new_state {
            return Ok(());
        }

        let mut new_runtime = current.clone();
        new_runtime.state = new_state;
        new_runtime.message = update.message.clone();
        if update.agent_id.is_some() {
            new_runtime.agent_id = update.agent_id.clone();
        }
        new_runtime.healthy = match update.healthy {
            Some(true) => HealthState::Healthy,
            Some(false) => HealthState::Unhealthy,
            None if new_state.is_terminal() => HealthState::Invalid,
            None => current.healthy,
        };
        if new_state == crate::data_model::TaskState::Failed {
            new_runtime.failure_count = current.failure_count + 1;
        }
        if new_state == crate::data_model::TaskState::Running && current.start_time.is_none() {
            new_runtime.start_time = Some(get_epoch_time_in_ms());
        }
        if new_state.is_terminal() {
            new_runtime.completion_time = Some(get_epoch_time_in_ms());
        }

        self.tracker
            .update_task_runtime(&task, new_runtime, UpdateMode::CacheAndSchedule)
            .await
    }

    /// Kills a mesos task nobody owns. A task stuck in KILLING escalates to
    /// an executor shutdown.
    async fn kill_orphan(&self, update: &TaskStatusUpdate) -> Result<()> {
        let translated = mesos_state_to_task_state(update.state);
        if translated.is_terminal() {
            return Ok(());
        }
        warn!(mesos_task_id = %update.mesos_task_id, "killing orphan task");
        if update.state == MesosTaskState::Killing {
            let executor = ExecutorOnAgent {
                executor_id: update.mesos_task_id.get().to_string(),
                agent_id: update.agent_id.clone().unwrap_or_default(),
            };
            self.host_manager.shutdown_executors(&[executor]).await
        } else {
            self.host_manager
                .kill_tasks(&[update.mesos_task_id.clone()])
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data_model::{JobType, MesosTaskId, TaskState},
        storage::TaskStore,
        testing::TestHarness,
    };

    fn processor(harness: &TestHarness) -> Arc<StatusUpdateProcessor> {
        StatusUpdateProcessor::new(harness.tracker.clone(), harness.host_manager.clone(), 4)
    }

    #[tokio::test]
    async fn test_translates_and_persists_state() {
        let harness = TestHarness::new();
        let (job_id, config) = harness.default_job("job1", JobType::Batch, 1);
        harness.create_job_with_tasks(&job_id, &config).await;
        let processor = processor(&harness);

        let stored = harness.store.get_task_runtime(&job_id, 0).await.unwrap();
        let mesos_task_id = stored.mesos_task_id.clone().unwrap();

        processor
            .process(&TaskStatusUpdate {
                mesos_task_id: mesos_task_id.clone(),
                state: MesosTaskState::Staging,
                agent_id: Some("agent-1".to_string()),
                healthy: None,
                message: String::new(),
            })
            .await
            .unwrap();

        let runtime = harness.store.get_task_runtime(&job_id, 0).await.unwrap();
        assert_eq!(runtime.state, TaskState::Launched);
        assert_eq!(runtime.agent_id.as_deref(), Some("agent-1"));
        assert_eq!(runtime.revision.version, stored.revision.version + 1);

        // KILLING translates to RUNNING: the task is still alive
        processor
            .process(&TaskStatusUpdate {
                mesos_task_id,
                state: MesosTaskState::Killing,
                agent_id: None,
                healthy: None,
                message: String::new(),
            })
            .await
            .unwrap();
        let runtime = harness.store.get_task_runtime(&job_id, 0).await.unwrap();
        assert_eq!(runtime.state, TaskState::Running);
        assert!(runtime.start_time.is_some());
    }

    #[tokio::test]
    async fn test_failure_increments_failure_count() {
        let harness = TestHarness::new();
        let (job_id, config) = harness.default_job("job1", JobType::Batch, 1);
        harness.create_job_with_tasks(&job_id, &config).await;
        let processor = processor(&harness);

        let stored = harness.store.get_task_runtime(&job_id, 0).await.unwrap();
        processor
            .process(&TaskStatusUpdate {
                mesos_task_id: stored.mesos_task_id.clone().unwrap(),
                state: MesosTaskState::Failed,
                agent_id: None,
                healthy: None,
                message: "oom".to_string(),
            })
            .await
            .unwrap();

        let runtime = harness.store.get_task_runtime(&job_id, 0).await.unwrap();
        assert_eq!(runtime.state, TaskState::Failed);
        assert_eq!(runtime.failure_count, 1);
        assert_eq!(runtime.healthy, HealthState::Invalid);
        assert_eq!(runtime.message, "oom");
        assert!(runtime.completion_time.is_some());
    }

    #[tokio::test]
    async fn test_unknown_task_is_orphan_killed() {
        let harness = TestHarness::new();
        let processor = processor(&harness);
        let mut status_rx = harness.host_manager.subscribe_status_updates();

        processor
            .process(&TaskStatusUpdate {
                mesos_task_id: MesosTaskId::from("ghost-0-1"),
                state: MesosTaskState::Running,
                agent_id: None,
                healthy: None,
                message: String::new(),
            })
            .await
            .unwrap();

        // the loopback host manager acknowledges the kill with KILLED
        let update = status_rx.recv().await.unwrap();
        assert_eq!(update.state, MesosTaskState::Killed);
        assert_eq!(update.mesos_task_id.get(), "ghost-0-1");
    }

    #[tokio::test]
    async fn test_stale_run_update_is_ignored_and_killed() {
        let harness = TestHarness::new();
        let (job_id, config) = harness.default_job("job1", JobType::Batch, 1);
        harness.create_job_with_tasks(&job_id, &config).await;
        let processor = processor(&harness);
        let mut status_rx = harness.host_manager.subscribe_status_updates();

        let stored = harness.store.get_task_runtime(&job_id, 0).await.unwrap();
        let stale_id = MesosTaskId::new(&job_id, 0, 99);

        processor
            .process(&TaskStatusUpdate {
                mesos_task_id: stale_id.clone(),
                state: MesosTaskState::Running,
                agent_id: None,
                healthy: None,
                message: String::new(),
            })
            .await
            .unwrap();

        // the stored runtime is untouched
        let runtime = harness.store.get_task_runtime(&job_id, 0).await.unwrap();
        assert_eq!(runtime.revision.version, stored.revision.version);
        assert_eq!(runtime.state, TaskState::Initialized);

        // and the stale run got a kill
        let update = status_rx.recv().await.unwrap();
        assert_eq!(update.mesos_task_id, stale_id);
    }

    #[tokio::test]
    async fn test_duplicate_state_is_a_noop() {
        let harness = TestHarness::new();
        let (job_id, config) = harness.default_job("job1", JobType::Batch, 1);
        harness.create_job_with_tasks(&job_id, &config).await;
        let processor = processor(&harness);

        let stored = harness.store.get_task_runtime(&job_id, 0).await.unwrap();
        let mesos_task_id = stored.mesos_task_id.clone().unwrap();
        let update = TaskStatusUpdate {
            mesos_task_id,
            state: MesosTaskState::Running,
            agent_id: None,
            healthy: Some(true),
            message: String::new(),
        };
        processor.process(&update).await.unwrap();
        let after_first = harness.store.get_task_runtime(&job_id, 0).await.unwrap();
        processor.process(&update).await.unwrap();
        let after_second = harness.store.get_task_runtime(&job_id, 0).await.unwrap();
        assert_eq!(after_first.revision.version, after_second.revision.version);
    }
}
