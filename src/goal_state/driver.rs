//! Goal-state driver: owns the two engines (tasks, updates), consumes the
//! tracker's schedule requests, and implements the side-effecting bodies of
//! every task action. One driver instance serves the whole process.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::{
    config::GoalStateConfig,
    data_model::{
        next_run_index, HealthState, JobId, MesosTaskId, TaskInfo, TaskKey, TaskRuntime, TaskState,
        UpdateId,
    },
    goal_state::{
        engine::{Engine, EngineConfig, Entity},
        task_actions::{suggest_task_action, TaskAction, TaskSignals},
        update_run,
    },
    metrics::GoalStateMetrics,
    rpc::{ExecutorOnAgent, Gang, HostManagerClient, ResourceManagerClient},
    storage::{JobStore, TaskStore, UpdateStore, VolumeStore},
    tracker::{ScheduleRequest, TrackedTask, Tracker, UpdateMode},
    utils::get_epoch_time_in_ms,
};

pub struct GoalStateDriver {
    pub(crate) tracker: Arc<Tracker>,
    pub(crate) job_store: Arc<dyn JobStore>,
    pub(crate) task_store: Arc<dyn TaskStore>,
    pub(crate) volume_store: Arc<dyn VolumeStore>,
    pub(crate) update_store: Arc<dyn UpdateStore>,
    pub(crate) resmgr: Arc<dyn ResourceManagerClient>,
    pub(crate) host_manager: Arc<dyn HostManagerClient>,
    pub(crate) config: GoalStateConfig,
    task_engine: Arc<Engine>,
    update_engine: Arc<Engine>,
    metrics: GoalStateMetrics,
}

struct TaskEntity {
    key: TaskKey,
    driver: Arc<GoalStateDriver>,
}

#[async_trait]
impl Entity for TaskEntity {
    fn id(&self) -> String {
        self.key.to_string()
    }

    async fn run(&self) -> Result<Option<Duration>> {
        self.driver.run_task_action(&self.key).await
    }
}

struct UpdateEntity {
    update_id: UpdateId,
    job_id: JobId,
    driver: Arc<GoalStateDriver>,
}

#[async_trait]
impl Entity for UpdateEntity {
    fn id(&self) -> String {
        self.update_id.to_string()
    }

    async fn run(&self) -> Result<Option<Duration>> {
        update_run::run_update(&self.driver, &self.update_id, &self.job_id).await
    }
}

impl GoalStateDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tracker: Arc<Tracker>,
        job_store: Arc<dyn JobStore>,
        task_store: Arc<dyn TaskStore>,
        volume_store: Arc<dyn VolumeStore>,
        update_store: Arc<dyn UpdateStore>,
        resmgr: Arc<dyn ResourceManagerClient>,
        host_manager: Arc<dyn HostManagerClient>,
        config: GoalStateConfig,
    ) -> Arc<Self> {
        let engine_config = EngineConfig {
            workers: config.engine_workers,
            failure_retry_delay: Duration::from_secs(config.failure_retry_delay_sec),
            max_retry_delay: Duration::from_secs(config.max_retry_delay_sec),
        };
        Arc::new(Self {
            tracker,
            job_store,
            task_store,
            volume_store,
            update_store,
            resmgr,
            host_manager,
            config,
            task_engine: Engine::new("task", engine_config.clone()),
            update_engine: Engine::new("update", engine_config),
            metrics: GoalStateMetrics::new(),
        })
    }

    /// Starts both engines and the loop feeding them from the tracker.
    pub fn start(
        self: &Arc<Self>,
        mut schedule_rx: mpsc::UnboundedReceiver<ScheduleRequest>,
        shutdown_rx: watch::Receiver<()>,
    ) {
        self.task_engine.reopen();
        self.update_engine.reopen();
        self.task_engine.start(shutdown_rx.clone());
        self.update_engine.start(shutdown_rx.clone());

        let driver = self.clone();
        let mut shutdown_rx = shutdown_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("goal state schedule loop shutting down");
                        break;
                    }
                    request = schedule_rx.recv() => {
                        let Some(request) = request else { break };
                        match request {
                            ScheduleRequest::Task { key, delay } => {
                                driver.enqueue_task(&key, delay);
                            }
                            ScheduleRequest::Update { update_id, job_id, delay } => {
                                driver.enqueue_update(&update_id, &job_id, delay);
                            }
                        }
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        self.task_engine.stop();
        self.update_engine.stop();
    }

    pub fn enqueue_task(self: &Arc<Self>, key: &TaskKey, delay: Duration) {
        self.task_engine.enqueue(
            Arc::new(TaskEntity {
                key: key.clone(),
                driver: self.clone(),
            }),
            Instant::now() + delay,
        );
    }

    pub fn enqueue_update(self: &Arc<Self>, update_id: &UpdateId, job_id: &JobId, delay: Duration) {
        self.update_engine.enqueue(
            Arc::new(UpdateEntity {
                update_id: update_id.clone(),
                job_id: job_id.clone(),
                driver: self.clone(),
            }),
            Instant::now() + delay,
        );
    }

    async fn with_deadline<T, F>(&self, what: &'static str, secs: u64, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::time::timeout(Duration::from_secs(secs), fut)
            .await
            .map_err(|_| anyhow!("{what} timed out after {secs}s"))?
    }

    /// One evaluation of a task entity: pick the action from the decision
    /// table and run it.
    pub async fn run_task_action(self: &Arc<Self>, key: &TaskKey) -> Result<Option<Duration>> {
        let task = match self.tracker.get_or_create_task(&key.job_id, key.instance_id).await {
            Ok(task) => task,
            Err(err) => {
                let job_gone = err
                    .downcast_ref::<crate::storage::StoreError>()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false);
                if job_gone {
                    warn!(task = %key, "job gone from the store, dropping from goal state");
                    return Ok(None);
                }
                return Err(err);
            }
        };

        let runtime = task.runtime().await;
        let action = match &runtime {
            None => TaskAction::ReloadRuntime,
            Some(runtime) => {
                let launch_age = task
                    .last_runtime_update_time()
                    .await
                    .map(|t| t.elapsed())
                    .unwrap_or_default();
                let signals = TaskSignals {
                    launch_timed_out: launch_age
                        > Duration::from_secs(self.config.launch_timeout_sec),
                    launch_notified: task.notified_launch().await == runtime.mesos_task_id,
                    failure_retry_limit: self.config.failure_retry_limit,
                };
                suggest_task_action(runtime, &signals)
            }
        };

        task.record_action(action).await;
        self.metrics.record_task_action(action);
        if action != TaskAction::NoAction {
            info!(
                task = %key,
                action = %action,
                current_state = %runtime.as_ref().map(|r| r.state).unwrap_or_default(),
                goal_state = %runtime.as_ref().map(|r| r.goal_state).unwrap_or_default(),
                "running action for task"
            );
        }

        let _timer = self.metrics.action_timer(action);
        match action {
            TaskAction::NoAction => Ok(None),
            TaskAction::Killed => {
                task.clear_killing_attempts().await;
                task.clear_launch_attempts().await;
                Ok(None)
            }
            TaskAction::ReloadRuntime => self.reload_runtime(&task).await,
            TaskAction::Start => self.start_task(&task).await,
            TaskAction::Stop => self.stop_task(&task).await,
            TaskAction::Initialize => self.initialize_task(&task).await,
            TaskAction::LaunchRetry => self.launch_retry(&task).await,
            TaskAction::Fail => self.fail_task(&task).await,
            TaskAction::FailRetry => self.failure_retry(&task).await,
            TaskAction::NotifyLaunchedTasks => self.notify_launched(&task).await,
            TaskAction::Preempt => self.preempt_task(&task).await,
        }
    }

    /// Reloads the runtime from the store. The task re-evaluates right away
    /// on the fresh state.
    async fn reload_runtime(&self, task: &TrackedTask) -> Result<Option<Duration>> {
        let key = &task.key;
        match self
            .task_store
            .get_task_runtime(&key.job_id, key.instance_id)
            .await
        {
            Ok(runtime) => {
                self.tracker
                    .update_task_runtime(task, runtime, UpdateMode::CacheOnly)
                    .await?;
                Ok(Some(Duration::ZERO))
            }
            Err(err) if err.is_not_found() => {
                warn!(task = %key, "task record gone, dropping from goal state");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Resolves the effective config and hands the task to the scheduling
    /// pipeline: stateful tasks with a CREATED volume launch directly with
    /// their reserved resources, everything else goes to the resource
    /// manager as a gang.
    async fn start_task(&self, task: &TrackedTask) -> Result<Option<Duration>> {
        let key = &task.key;
        let runtime = task
            .runtime()
            .await
            .ok_or_else(|| anyhow!("runtime missing for {key}"))?;

        let config = self
            .task_store
            .get_task_config(&key.job_id, key.instance_id, runtime.desired_config_version)
            .await
            .with_context(|| format!("resolving config for {key}"))?;

        let info = TaskInfo {
            job_id: key.job_id.clone(),
            instance_id: key.instance_id,
            config: config.clone(),
            runtime: runtime.clone(),
        };

        if config.volume.is_some() {
            if let Some(volume_id) = &runtime.volume_id {
                match self.volume_store.get_persistent_volume(volume_id).await {
                    Ok(volume) if volume.state == crate::data_model::VolumeState::Created => {
                        // volume already reserved on a host: skip placement
                        self.with_deadline("launch with reserved resource", self.config.rpc_timeout_sec,
                            self.host_manager.launch_task_with_reserved_resource(&info))
                            .await?;
                        return Ok(None);
                    }
                    Ok(_) => {}
                    Err(err) if err.is_not_found() => {
                        // no volume record: place like a stateless task
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        self.with_deadline(
            "enqueue gangs",
            self.config.rpc_timeout_sec,
            self.resmgr.enqueue_gangs(vec![Gang::single(info)]),
        )
        .await?;

        let mut pending = runtime;
        pending.state = TaskState::Pending;
        self.tracker
            .update_task_runtime(task, pending, UpdateMode::CacheAndDb)
            .await?;
        Ok(None)
    }

    /// Kills the task through the host manager, escalating to an executor
    /// shutdown when kills keep not sticking. Tasks that never launched are
    /// terminated directly in the store.
    async fn stop_task(&self, task: &TrackedTask) -> Result<Option<Duration>> {
        let key = &task.key;
        let runtime = task
            .runtime()
            .await
            .ok_or_else(|| anyhow!("runtime missing for {key}"))?;

        let unlaunched = matches!(runtime.state, TaskState::Initialized | TaskState::Pending);
        if unlaunched || runtime.mesos_task_id.is_none() {
            // never reached a host; take it back from the resource manager
            // and settle it in the store
            if let Err(err) = self.resmgr.kill_tasks(&[key.clone()]).await {
                debug!(task = %key, error = %err, "resource manager kill failed");
            }
            let mut killed = runtime;
            killed.state = TaskState::Killed;
            killed.completion_time = Some(get_epoch_time_in_ms());
            killed.message = "task killed before launch".to_string();
            self.tracker
                .update_task_runtime(task, killed, UpdateMode::CacheAndSchedule)
                .await?;
            return Ok(None);
        }

        let Some(mesos_task_id) = runtime.mesos_task_id.clone() else {
            return Ok(None);
        };
        let attempts = task.increment_killing_attempts().await;
        if attempts > self.config.max_killing_attempts {
            let executor = ExecutorOnAgent {
                executor_id: mesos_task_id.get().to_string(),
                agent_id: runtime.agent_id.clone().unwrap_or_default(),
            };
            warn!(task = %key, attempts, "kill attempts exhausted, shutting down executor");
            self.with_deadline(
                "shutdown executors",
                self.config.kill_rpc_timeout_sec,
                self.host_manager.shutdown_executors(&[executor]),
            )
            .await?;
        } else {
            self.with_deadline(
                "kill tasks",
                self.config.kill_rpc_timeout_sec,
                self.host_manager.kill_tasks(&[mesos_task_id]),
            )
            .await?;
        }

        // re-check until the terminal status update lands
        Ok(Some(Duration::from_secs(self.config.stop_retry_delay_sec)))
    }

    /// Resets the runtime to INITIALIZED at the desired config version with
    /// a fresh run id. A still-live mesos task is killed first.
    async fn initialize_task(&self, task: &TrackedTask) -> Result<Option<Duration>> {
        let key = &task.key;
        let runtime = task
            .runtime()
            .await
            .ok_or_else(|| anyhow!("runtime missing for {key}"))?;

        let launched = !runtime.state.is_terminal()
            && !matches!(runtime.state, TaskState::Initialized | TaskState::Pending);
        if launched {
            if let Some(mesos_task_id) = &runtime.mesos_task_id {
                if let Err(err) = self
                    .with_deadline(
                        "kill tasks",
                        self.config.kill_rpc_timeout_sec,
                        self.host_manager.kill_tasks(&[mesos_task_id.clone()]),
                    )
                    .await
                {
                    debug!(task = %key, error = %err, "pre-initialize kill failed");
                }
            }
        }

        let events = self
            .task_store
            .get_pod_events(&key.job_id, key.instance_id, None)
            .await?;
        let run = next_run_index(&events);

        let new_runtime = TaskRuntime {
            state: TaskState::Initialized,
            goal_state: runtime.goal_state,
            mesos_task_id: Some(MesosTaskId::new(&key.job_id, key.instance_id, run)),
            config_version: runtime.desired_config_version,
            desired_config_version: runtime.desired_config_version,
            failure_count: runtime.failure_count,
            healthy: HealthState::Unknown,
            volume_id: runtime.volume_id.clone(),
            message: "task reinitialized at desired configuration".to_string(),
            revision: runtime.revision.clone(),
            ..Default::default()
        };
        task.set_notified_launch(None).await;
        task.clear_killing_attempts().await;
        self.tracker
            .update_task_runtime(task, new_runtime, UpdateMode::CacheAndSchedule)
            .await?;
        Ok(None)
    }

    /// Launch never became RUNNING: kill the stuck run and resubmit, or give
    /// up and fail the task after too many rounds.
    async fn launch_retry(&self, task: &TrackedTask) -> Result<Option<Duration>> {
        let key = &task.key;
        let attempts = task.increment_launch_attempts().await;
        if attempts > self.config.max_launch_retries {
            let mut runtime = self
                .task_store
                .get_task_runtime(&key.job_id, key.instance_id)
                .await?;
            runtime.state = TaskState::Failed;
            runtime.healthy = HealthState::Invalid;
            runtime.message = format!("launch retries exhausted after {attempts} attempts");
            runtime.completion_time = Some(get_epoch_time_in_ms());
            self.tracker
                .update_task_runtime(task, runtime, UpdateMode::CacheAndSchedule)
                .await?;
            return Ok(None);
        }

        info!(task = %key, attempts, "launch timed out, reinitializing");
        self.initialize_task(task).await
    }

    /// Records terminal failure once retries are spent.
    async fn fail_task(&self, task: &TrackedTask) -> Result<Option<Duration>> {
        let key = &task.key;
        let mut runtime = self
            .task_store
            .get_task_runtime(&key.job_id, key.instance_id)
            .await?;
        runtime.state = TaskState::Failed;
        runtime.goal_state = TaskState::Failed;
        runtime.completion_time = Some(get_epoch_time_in_ms());
        if runtime.message.is_empty() {
            runtime.message = "task failed, retry limit reached".to_string();
        }
        self.tracker
            .update_task_runtime(task, runtime, UpdateMode::CacheAndSchedule)
            .await?;
        Ok(None)
    }

    /// Failed below the retry limit: bump the failure count and start a new
    /// run of the same config version.
    async fn failure_retry(&self, task: &TrackedTask) -> Result<Option<Duration>> {
        let key = &task.key;
        let runtime = task
            .runtime()
            .await
            .ok_or_else(|| anyhow!("runtime missing for {key}"))?;

        let events = self
            .task_store
            .get_pod_events(&key.job_id, key.instance_id, None)
            .await?;
        let run = next_run_index(&events);

        // restarts of killed runs keep the failure count
        let failure_count = if runtime.state == TaskState::Killed {
            runtime.failure_count
        } else {
            runtime.failure_count + 1
        };
        let new_runtime = TaskRuntime {
            state: TaskState::Initialized,
            goal_state: runtime.goal_state,
            mesos_task_id: Some(MesosTaskId::new(&key.job_id, key.instance_id, run)),
            config_version: runtime.config_version,
            desired_config_version: runtime.desired_config_version,
            failure_count,
            healthy: HealthState::Unknown,
            volume_id: runtime.volume_id.clone(),
            message: format!("starting run {run}"),
            revision: runtime.revision.clone(),
            ..Default::default()
        };
        task.set_notified_launch(None).await;
        self.tracker
            .update_task_runtime(task, new_runtime, UpdateMode::CacheAndSchedule)
            .await?;
        Ok(None)
    }

    /// Accounting ping back to the resource manager once a launch is seen.
    async fn notify_launched(&self, task: &TrackedTask) -> Result<Option<Duration>> {
        let key = &task.key;
        let runtime = task
            .runtime()
            .await
            .ok_or_else(|| anyhow!("runtime missing for {key}"))?;
        let Some(mesos_task_id) = runtime.mesos_task_id.clone() else {
            return Ok(None);
        };
        self.with_deadline(
            "mark tasks launched",
            self.config.rpc_timeout_sec,
            self.resmgr.mark_tasks_launched(&[mesos_task_id.clone()]),
        )
        .await?;
        task.set_notified_launch(Some(mesos_task_id)).await;
        // come back to catch a stuck launch
        Ok(Some(Duration::from_secs(self.config.launch_timeout_sec)))
    }

    /// Runs the action the preemption policy asks for: drop the task, or
    /// reinitialize it so the resource manager places it elsewhere.
    async fn preempt_task(self: &Arc<Self>, task: &TrackedTask) -> Result<Option<Duration>> {
        let key = &task.key;
        let runtime = task
            .runtime()
            .await
            .ok_or_else(|| anyhow!("runtime missing for {key}"))?;

        let config = self
            .task_store
            .get_task_config(&key.job_id, key.instance_id, runtime.desired_config_version)
            .await?;
        let kill_on_preempt = config
            .preemption_policy
            .map(|p| p.kill_on_preempt)
            .unwrap_or(false);

        if kill_on_preempt {
            debug!(task = %key, "preemption policy keeps the task down");
            return Ok(None);
        }
        self.initialize_task(task).await
    }

    /// True when no entity is queued in either engine. Test hook.
    pub fn is_idle(&self) -> bool {
        self.task_engine.is_empty() && self.update_engine.is_empty()
    }

    pub(crate) fn metrics_update_run(&self) {
        self.metrics.update_runs.add(1, &[]);
    }
}