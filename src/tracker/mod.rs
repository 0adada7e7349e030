//! In-memory tracker: the authoritative best-effort view of jobs, tasks and
//! updates, mediating every cache-vs-store write.
//!
//! Ownership rules: the tracker exclusively owns the cached objects; stores
//! own the durable records. A cached runtime of `None` is legal and means
//! "reload from the store before the next action". Tasks serialize their own
//! mutations behind a per-task async mutex; the goal-state engine guarantees
//! at most one action per task on top of that.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::{
    data_model::{
        InstanceId, JobConfig, JobId, JobRuntime, MesosTaskId, TaskKey, TaskRuntime, TaskState,
        HealthState, UpdateId, UpdateInfo,
    },
    goal_state::task_actions::TaskAction,
    storage::{JobStore, StoreError, TaskStore, UpdateStore},
};

/// How far a runtime write propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Update the cache only (status already durable, e.g. reload).
    CacheOnly,
    /// Write through to the store, then update the cache.
    CacheAndDb,
    /// Write through, update the cache, and enqueue the task for the
    /// goal-state engine.
    CacheAndSchedule,
}

/// Request to enqueue an entity into a goal-state engine. The tracker emits
/// these; the goal-state driver consumes them.
#[derive(Debug, Clone)]
pub enum ScheduleRequest {
    Task { key: TaskKey, delay: Duration },
    Update {
        update_id: UpdateId,
        job_id: JobId,
        delay: Duration,
    },
}

/// Field-wise diff applied to a task runtime during a read-modify-write.
#[derive(Debug, Clone, Default)]
pub struct RuntimeDiff {
    pub state: Option<TaskState>,
    pub goal_state: Option<TaskState>,
    pub config_version: Option<u64>,
    pub desired_config_version: Option<u64>,
    pub failure_count: Option<u32>,
    pub healthy: Option<HealthState>,
    pub mesos_task_id: Option<MesosTaskId>,
    pub host: Option<String>,
    pub agent_id: Option<String>,
    pub message: Option<String>,
}

impl RuntimeDiff {
    pub fn apply(&self, runtime: &mut TaskRuntime) {
        if let Some(state) = self.state {
            runtime.state = state;
        }
        if let Some(goal_state) = self.goal_state {
            runtime.goal_state = goal_state;
        }
        if let Some(version) = self.config_version {
            runtime.config_version = version;
        }
        if let Some(version) = self.desired_config_version {
            runtime.desired_config_version = version;
        }
        if let Some(count) = self.failure_count {
            runtime.failure_count = count;
        }
        if let Some(healthy) = self.healthy {
            runtime.healthy = healthy;
        }
        if let Some(id) = &self.mesos_task_id {
            runtime.mesos_task_id = Some(id.clone());
        }
        if let Some(host) = &self.host {
            runtime.host = Some(host.clone());
        }
        if let Some(agent_id) = &self.agent_id {
            runtime.agent_id = Some(agent_id.clone());
        }
        if let Some(message) = &self.message {
            runtime.message = message.clone();
        }
    }
}

/// Mutable task state, guarded by one async mutex per task.
#[derive(Debug, Default)]
struct TaskMut {
    runtime: Option<TaskRuntime>,
    last_action: Option<TaskAction>,
    last_action_time: Option<Instant>,
    last_runtime_update_time: Option<Instant>,
    killing_attempts: u32,
    launch_attempts: u32,
    /// Mesos task id of the launch already reported to the resource manager.
    notified_launch: Option<MesosTaskId>,
}

pub struct TrackedTask {
    pub key: TaskKey,
    state: Mutex<TaskMut>,
}

impl TrackedTask {
    fn new(key: TaskKey) -> Self {
        Self {
            key,
            state: Mutex::new(TaskMut::default()),
        }
    }

    pub async fn runtime(&self) -> Option<TaskRuntime> {
        self.state.lock().await.runtime.clone()
    }

    /// Drops the cached runtime so the next action reloads from the store.
    pub async fn invalidate_runtime(&self) {
        self.state.lock().await.runtime = None;
    }

    pub async fn last_action(&self) -> (Option<TaskAction>, Option<Instant>) {
        let state = self.state.lock().await;
        (state.last_action, state.last_action_time)
    }

    pub async fn record_action(&self, action: TaskAction) {
        let mut state = self.state.lock().await;
        state.last_action = Some(action);
        state.last_action_time = Some(Instant::now());
    }

    pub async fn last_runtime_update_time(&self) -> Option<Instant> {
        self.state.lock().await.last_runtime_update_time
    }

    pub async fn killing_attempts(&self) -> u32 {
        self.state.lock().await.killing_attempts
    }

    pub async fn increment_killing_attempts(&self) -> u32 {
        let mut state = self.state.lock().await;
        state.killing_attempts += 1;
        state.killing_attempts
    }

    pub async fn clear_killing_attempts(&self) {
        self.state.lock().await.killing_attempts = 0;
    }

    pub async fn launch_attempts(&self) -> u32 {
        self.state.lock().await.launch_attempts
    }

    pub async fn increment_launch_attempts(&self) -> u32 {
        let mut state = self.state.lock().await;
        state.launch_attempts += 1;
        state.launch_attempts
    }

    pub async fn clear_launch_attempts(&self) {
        self.state.lock().await.launch_attempts = 0;
    }

    pub async fn notified_launch(&self) -> Option<MesosTaskId> {
        self.state.lock().await.notified_launch.clone()
    }

    pub async fn set_notified_launch(&self, id: Option<MesosTaskId>) {
        self.state.lock().await.notified_launch = id;
    }

    /// Applies the runtime cache contract: stale revisions are dropped, an
    /// equal revision invalidates the entry, a newer one replaces it.
    fn apply_to_cache(state: &mut TaskMut, key: &TaskKey, new_runtime: TaskRuntime) {
        if let Some(cached) = &state.runtime {
            if cached == &new_runtime {
                return;
            }
            let cached_version = cached.revision.version;
            let new_version = new_runtime.revision.version;
            if cached_version > new_version {
                info!(
                    task = %key,
                    cached_revision = cached_version,
                    new_revision = new_version,
                    "dropping stale runtime update"
                );
                return;
            }
            if cached_version == new_version {
                debug!(
                    task = %key,
                    revision = new_version,
                    "same revision seen twice, invalidating cached runtime"
                );
                state.runtime = None;
                return;
            }
        }
        state.runtime = Some(new_runtime);
        state.last_runtime_update_time = Some(Instant::now());
    }
}

pub struct TrackedJob {
    pub id: JobId,
    config: RwLock<Option<JobConfig>>,
    tasks: RwLock<HashMap<InstanceId, Arc<TrackedTask>>>,
}

impl TrackedJob {
    fn new(id: JobId) -> Self {
        Self {
            id,
            config: RwLock::new(None),
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub fn cached_config(&self) -> Option<JobConfig> {
        self.config.read().unwrap().clone()
    }

    pub fn set_config(&self, config: JobConfig) {
        *self.config.write().unwrap() = Some(config);
    }

    pub fn get_task(&self, instance_id: InstanceId) -> Option<Arc<TrackedTask>> {
        self.tasks.read().unwrap().get(&instance_id).cloned()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.read().unwrap().len()
    }

    fn get_or_insert_task(&self, instance_id: InstanceId) -> Arc<TrackedTask> {
        if let Some(task) = self.get_task(instance_id) {
            return task;
        }
        let mut tasks = self.tasks.write().unwrap();
        tasks
            .entry(instance_id)
            .or_insert_with(|| {
                Arc::new(TrackedTask::new(TaskKey::new(self.id.clone(), instance_id)))
            })
            .clone()
    }
}

pub struct TrackedUpdate {
    pub id: UpdateId,
    pub job_id: JobId,
    cached: Mutex<Option<UpdateInfo>>,
}

impl TrackedUpdate {
    pub async fn cached(&self) -> Option<UpdateInfo> {
        self.cached.lock().await.clone()
    }

    pub async fn set_cached(&self, info: UpdateInfo) {
        *self.cached.lock().await = Some(info);
    }

    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

/// Revisioned writes that conflict are reloaded and retried this many times
/// before the error surfaces.
const PATCH_RETRY_LIMIT: usize = 3;

pub struct Tracker {
    jobs: RwLock<HashMap<JobId, Arc<TrackedJob>>>,
    updates: RwLock<HashMap<UpdateId, Arc<TrackedUpdate>>>,
    job_store: Arc<dyn JobStore>,
    task_store: Arc<dyn TaskStore>,
    update_store: Arc<dyn UpdateStore>,
    schedule_tx: RwLock<mpsc::UnboundedSender<ScheduleRequest>>,
}

impl Tracker {
    pub fn new(
        job_store: Arc<dyn JobStore>,
        task_store: Arc<dyn TaskStore>,
        update_store: Arc<dyn UpdateStore>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ScheduleRequest>) {
        let (schedule_tx, schedule_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                jobs: RwLock::new(HashMap::new()),
                updates: RwLock::new(HashMap::new()),
                job_store,
                task_store,
                update_store,
                schedule_tx: RwLock::new(schedule_tx),
            }),
            schedule_rx,
        )
    }

    /// Replaces the schedule channel, returning the fresh receiver. Used
    /// when leadership is regained and the previous consumer is gone.
    pub fn new_schedule_receiver(&self) -> mpsc::UnboundedReceiver<ScheduleRequest> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.schedule_tx.write().unwrap() = tx;
        rx
    }

    pub fn get_or_create_job(&self, job_id: &JobId) -> Arc<TrackedJob> {
        if let Some(job) = self.jobs.read().unwrap().get(job_id) {
            return job.clone();
        }
        let mut jobs = self.jobs.write().unwrap();
        jobs.entry(job_id.clone())
            .or_insert_with(|| Arc::new(TrackedJob::new(job_id.clone())))
            .clone()
    }

    pub fn get_job(&self, job_id: &JobId) -> Option<Arc<TrackedJob>> {
        self.jobs.read().unwrap().get(job_id).cloned()
    }

    pub fn untrack_job(&self, job_id: &JobId) {
        self.jobs.write().unwrap().remove(job_id);
    }

    /// Job config from cache, falling back to the store.
    pub async fn job_config(&self, job: &TrackedJob) -> Result<JobConfig> {
        if let Some(config) = job.cached_config() {
            return Ok(config);
        }
        let config = self.job_store.get_job_config(&job.id, None).await?;
        job.set_config(config.clone());
        Ok(config)
    }

    /// Task handle within a tracked job. Fails when neither the cache nor
    /// the store knows the owning job.
    pub async fn get_or_create_task(
        &self,
        job_id: &JobId,
        instance_id: InstanceId,
    ) -> Result<Arc<TrackedTask>> {
        let job = self.get_or_create_job(job_id);
        if job.cached_config().is_none() {
            let config = self.job_store.get_job_config(job_id, None).await.map_err(|e| {
                anyhow::Error::new(e)
                    .context(format!("cannot track task {job_id}-{instance_id}"))
            })?;
            job.set_config(config);
        }
        Ok(job.get_or_insert_task(instance_id))
    }

    /// Writes a task runtime per the given mode. The caller passes the full
    /// new runtime contents; the tracker stamps the next revision for store
    /// writes. A failed store write invalidates the cache and schedules the
    /// task so `ReloadTaskRuntime` repairs it.
    pub async fn update_task_runtime(
        &self,
        task: &TrackedTask,
        mut new_runtime: TaskRuntime,
        mode: UpdateMode,
    ) -> Result<()> {
        let mut state = task.state.lock().await;

        if mode == UpdateMode::CacheOnly {
            TrackedTask::apply_to_cache(&mut state, &task.key, new_runtime);
            return Ok(());
        }

        // load the revision the write is conditioned on
        let expected = match &state.runtime {
            Some(runtime) => runtime.revision.version,
            None => {
                let stored = self
                    .task_store
                    .get_task_runtime(&task.key.job_id, task.key.instance_id)
                    .await?;
                let version = stored.revision.version;
                state.runtime = Some(stored);
                version
            }
        };
        let current = state.runtime.as_ref().expect("runtime loaded above");
        new_runtime.revision = current.revision.next();

        let write = self
            .task_store
            .update_task_runtime(
                &task.key.job_id,
                task.key.instance_id,
                &new_runtime,
                expected,
            )
            .await;

        match write {
            Ok(()) => {
                state.runtime = Some(new_runtime);
                state.last_runtime_update_time = Some(Instant::now());
            }
            Err(err) => {
                warn!(task = %task.key, error = %err, "task runtime write failed, invalidating cache");
                state.runtime = None;
                drop(state);
                self.schedule_task(&task.key, Duration::ZERO);
                return Err(err.into());
            }
        }
        drop(state);

        if mode == UpdateMode::CacheAndSchedule {
            self.schedule_task(&task.key, Duration::ZERO);
        }
        Ok(())
    }

    /// Atomic-per-task read-modify-write of runtime diffs against the store.
    /// Conflicts reload and retry up to the bound; each patched task is
    /// scheduled for re-evaluation.
    pub async fn patch_tasks(
        &self,
        job_id: &JobId,
        diffs: HashMap<InstanceId, RuntimeDiff>,
    ) -> Result<()> {
        for (instance_id, diff) in diffs {
            let task = self.get_or_create_task(job_id, instance_id).await?;
            self.patch_one(&task, &diff).await?;
            self.schedule_task(&task.key, Duration::ZERO);
        }
        Ok(())
    }

    async fn patch_one(&self, task: &TrackedTask, diff: &RuntimeDiff) -> Result<()> {
        let mut state = task.state.lock().await;
        let mut last_err: Option<StoreError> = None;

        for _attempt in 0..PATCH_RETRY_LIMIT {
            let current = match &state.runtime {
                Some(runtime) => runtime.clone(),
                None => {
                    let stored = self
                        .task_store
                        .get_task_runtime(&task.key.job_id, task.key.instance_id)
                        .await?;
                    state.runtime = Some(stored.clone());
                    stored
                }
            };

            let mut patched = current.clone();
            diff.apply(&mut patched);
            patched.revision = current.revision.next();

            match self
                .task_store
                .update_task_runtime(
                    &task.key.job_id,
                    task.key.instance_id,
                    &patched,
                    current.revision.version,
                )
                .await
            {
                Ok(()) => {
                    state.runtime = Some(patched);
                    state.last_runtime_update_time = Some(Instant::now());
                    return Ok(());
                }
                Err(err) if err.is_conflict() => {
                    debug!(task = %task.key, error = %err, "patch conflicted, reloading");
                    state.runtime = None;
                    last_err = Some(err);
                }
                Err(err) => {
                    state.runtime = None;
                    return Err(err.into());
                }
            }
        }
        Err(last_err
            .map(Into::into)
            .unwrap_or_else(|| anyhow!("patch retries exhausted for {}", task.key)))
    }

    /// Revisioned job runtime write through the store.
    pub async fn update_job_runtime(&self, job_id: &JobId, runtime: &JobRuntime) -> Result<()> {
        let mut new_runtime = runtime.clone();
        for _attempt in 0..PATCH_RETRY_LIMIT {
            let stored = self.job_store.get_job_runtime(job_id).await?;
            new_runtime.revision = stored.revision.next();
            match self
                .job_store
                .update_job_runtime(job_id, &new_runtime, stored.revision.version)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(anyhow!("job runtime write retries exhausted for {job_id}"))
    }

    pub fn get_or_create_update(&self, update_id: &UpdateId, job_id: &JobId) -> Arc<TrackedUpdate> {
        if let Some(update) = self.updates.read().unwrap().get(update_id) {
            return update.clone();
        }
        let mut updates = self.updates.write().unwrap();
        updates
            .entry(update_id.clone())
            .or_insert_with(|| {
                Arc::new(TrackedUpdate {
                    id: update_id.clone(),
                    job_id: job_id.clone(),
                    cached: Mutex::new(None),
                })
            })
            .clone()
    }

    pub fn get_update(&self, update_id: &UpdateId) -> Option<Arc<TrackedUpdate>> {
        self.updates.read().unwrap().get(update_id).cloned()
    }

    pub fn untrack_update(&self, update_id: &UpdateId) {
        self.updates.write().unwrap().remove(update_id);
    }

    /// Update record from cache, falling back to the store.
    pub async fn update_info(&self, update: &TrackedUpdate) -> Result<Option<UpdateInfo>> {
        if let Some(info) = update.cached().await {
            return Ok(Some(info));
        }
        match self.update_store.get_update(&update.id).await {
            Ok(info) => {
                update.set_cached(info.clone()).await;
                Ok(Some(info))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn schedule_task(&self, key: &TaskKey, delay: Duration) {
        let _ = self.schedule_tx.read().unwrap().send(ScheduleRequest::Task {
            key: key.clone(),
            delay,
        });
    }

    pub fn schedule_update(&self, update_id: &UpdateId, job_id: &JobId, delay: Duration) {
        let _ = self
            .schedule_tx
            .read()
            .unwrap()
            .send(ScheduleRequest::Update {
                update_id: update_id.clone(),
                job_id: job_id.clone(),
                delay,
            });
    }

    pub fn task_store(&self) -> &Arc<dyn TaskStore> {
        &self.task_store
    }

    pub fn job_store(&self) -> &Arc<dyn JobStore> {
        &self.job_store
    }

    pub fn update_store(&self) -> &Arc<dyn UpdateStore> {
        &self.update_store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data_model::{
            new_initializing_runtime, test_objects::tests::*, JobType, Revision, TaskInfo,
        },
        storage::memory::InMemoryStore,
    };

    async fn setup() -> (
        Arc<Tracker>,
        mpsc::UnboundedReceiver<ScheduleRequest>,
        Arc<InMemoryStore>,
        JobId,
        JobConfig,
    ) {
        let store = Arc::new(InMemoryStore::new());
        let (tracker, rx) = Tracker::new(store.clone(), store.clone(), store.clone());
        let job_id = mock_job_id("job1");
        let config = mock_job_config(JobType::Batch, 2);
        store
            .create_job(&job_id, &config, &JobRuntime::default())
            .await
            .unwrap();
        for i in 0..2 {
            let info = TaskInfo {
                job_id: job_id.clone(),
                instance_id: i,
                config: config.task_config(i).clone(),
                runtime: new_initializing_runtime(&job_id, i, &config),
            };
            store.create_task(&job_id, i, &info, TEST_TEAM).await.unwrap();
        }
        (tracker, rx, store, job_id, config)
    }

    #[tokio::test]
    async fn test_stale_revision_dropped() {
        let (tracker, _rx, _store, job_id, _config) = setup().await;
        let task = tracker.get_or_create_task(&job_id, 0).await.unwrap();

        let mut cached = TaskRuntime {
            revision: Revision::new(5),
            ..Default::default()
        };
        cached.state = TaskState::Running;
        tracker
            .update_task_runtime(&task, cached.clone(), UpdateMode::CacheOnly)
            .await
            .unwrap();

        // incoming revision 4 is stale and must leave the cache unchanged
        let stale = TaskRuntime {
            state: TaskState::Failed,
            revision: Revision::new(4),
            ..Default::default()
        };
        tracker
            .update_task_runtime(&task, stale, UpdateMode::CacheOnly)
            .await
            .unwrap();

        let runtime = task.runtime().await.unwrap();
        assert_eq!(runtime.state, TaskState::Running);
        assert_eq!(runtime.revision.version, 5);
    }

    #[tokio::test]
    async fn test_equal_revision_invalidates_cache() {
        let (tracker, _rx, _store, job_id, _config) = setup().await;
        let task = tracker.get_or_create_task(&job_id, 0).await.unwrap();

        let cached = TaskRuntime {
            state: TaskState::Running,
            revision: Revision::new(5),
            ..Default::default()
        };
        tracker
            .update_task_runtime(&task, cached, UpdateMode::CacheOnly)
            .await
            .unwrap();

        let same_revision = TaskRuntime {
            state: TaskState::Failed,
            revision: Revision::new(5),
            ..Default::default()
        };
        tracker
            .update_task_runtime(&task, same_revision, UpdateMode::CacheOnly)
            .await
            .unwrap();

        assert!(task.runtime().await.is_none());
    }

    #[tokio::test]
    async fn test_write_through_advances_revision() {
        let (tracker, mut rx, store, job_id, _config) = setup().await;
        let task = tracker.get_or_create_task(&job_id, 0).await.unwrap();

        let stored = store.get_task_runtime(&job_id, 0).await.unwrap();
        let mut new_runtime = stored.clone();
        new_runtime.state = TaskState::Running;
        tracker
            .update_task_runtime(&task, new_runtime, UpdateMode::CacheAndSchedule)
            .await
            .unwrap();

        let persisted = store.get_task_runtime(&job_id, 0).await.unwrap();
        assert_eq!(persisted.state, TaskState::Running);
        assert_eq!(persisted.revision.version, stored.revision.version + 1);

        match rx.recv().await.unwrap() {
            ScheduleRequest::Task { key, .. } => assert_eq!(key.instance_id, 0),
            other => panic!("unexpected schedule request {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_write_invalidates_and_schedules() {
        let (tracker, mut rx, store, job_id, _config) = setup().await;
        let task = tracker.get_or_create_task(&job_id, 0).await.unwrap();

        // warm the cache
        let stored = store.get_task_runtime(&job_id, 0).await.unwrap();
        tracker
            .update_task_runtime(&task, stored.clone(), UpdateMode::CacheOnly)
            .await
            .unwrap();

        store.set_unavailable(true);
        let mut new_runtime = stored.clone();
        new_runtime.state = TaskState::Running;
        let result = tracker
            .update_task_runtime(&task, new_runtime, UpdateMode::CacheAndDb)
            .await;
        store.set_unavailable(false);

        assert!(result.is_err());
        assert!(task.runtime().await.is_none());
        assert!(matches!(
            rx.recv().await.unwrap(),
            ScheduleRequest::Task { .. }
        ));
    }

    #[tokio::test]
    async fn test_patch_tasks_applies_diffs() {
        let (tracker, _rx, store, job_id, _config) = setup().await;

        let mut diffs = HashMap::new();
        diffs.insert(
            1,
            RuntimeDiff {
                goal_state: Some(TaskState::Killed),
                ..Default::default()
            },
        );
        tracker.patch_tasks(&job_id, diffs).await.unwrap();

        let runtime = store.get_task_runtime(&job_id, 1).await.unwrap();
        assert_eq!(runtime.goal_state, TaskState::Killed);
        assert_eq!(runtime.state, TaskState::Initialized);
    }

    #[tokio::test]
    async fn test_get_or_create_task_unknown_job_fails() {
        let store = Arc::new(InMemoryStore::new());
        let (tracker, _rx) = Tracker::new(store.clone(), store.clone(), store.clone());
        assert!(tracker
            .get_or_create_task(&mock_job_id("missing"), 0)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_job_config_cached_after_first_load() {
        let (tracker, _rx, store, job_id, config) = setup().await;
        let job = tracker.get_or_create_job(&job_id);
        assert!(job.cached_config().is_none());

        let loaded = tracker.job_config(&job).await.unwrap();
        assert_eq!(loaded.instance_count, config.instance_count);

        // cached now: even an unavailable store serves the config
        store.set_unavailable(true);
        let cached = tracker.job_config(&job).await.unwrap();
        assert_eq!(cached.instance_count, config.instance_count);
    }
}
