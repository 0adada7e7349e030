//! In-memory store backing tests and single-process dev mode. Implements the
//! same revision discipline a durable backend must: runtime writes carry the
//! expected revision and conflict when the record has advanced.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        RwLock,
    },
};

use async_trait::async_trait;

use crate::{
    data_model::{
        InstanceId, JobConfig, JobId, JobRuntime, JobState, Label, PersistentVolumeInfo, PodEvent,
        TaskConfig, TaskInfo, TaskKey, TaskRuntime, UpdateId, UpdateInfo, UpdateState, VolumeId,
    },
    storage::{JobStore, Result, StoreError, TaskStore, UpdateStore, VolumeStore},
    utils::get_epoch_time_in_ms,
};

#[derive(Default)]
struct Inner {
    job_configs: HashMap<JobId, BTreeMap<u64, JobConfig>>,
    job_runtimes: HashMap<JobId, JobRuntime>,
    tasks: HashMap<JobId, BTreeMap<InstanceId, TaskInfo>>,
    task_owners: HashMap<JobId, String>,
    pod_events: HashMap<TaskKey, Vec<PodEvent>>,
    volumes: HashMap<VolumeId, PersistentVolumeInfo>,
    updates: HashMap<UpdateId, UpdateInfo>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail with `Unavailable` until cleared. Lets
    /// tests drive the transient-error paths.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn put_volume(&self, volume: PersistentVolumeInfo) {
        let mut inner = self.inner.write().unwrap();
        inner.volumes.insert(volume.id.clone(), volume);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                message: "store marked unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn pod_event_for(runtime: &TaskRuntime) -> Option<PodEvent> {
        runtime.mesos_task_id.as_ref().map(|id| PodEvent {
            mesos_task_id: id.clone(),
            actual_state: runtime.state,
            goal_state: runtime.goal_state,
            timestamp: get_epoch_time_in_ms(),
            message: runtime.message.clone(),
        })
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn create_job(
        &self,
        job_id: &JobId,
        config: &JobConfig,
        runtime: &JobRuntime,
    ) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.write().unwrap();
        if inner.job_runtimes.contains_key(job_id) {
            return Err(StoreError::already_exists("job", job_id));
        }
        inner
            .job_configs
            .entry(job_id.clone())
            .or_default()
            .insert(config.change_log.version, config.clone());
        inner.job_runtimes.insert(job_id.clone(), runtime.clone());
        Ok(())
    }

    async fn get_job_config(&self, job_id: &JobId, version: Option<u64>) -> Result<JobConfig> {
        self.check_available()?;
        let inner = self.inner.read().unwrap();
        let versions = inner
            .job_configs
            .get(job_id)
            .ok_or_else(|| StoreError::not_found("job", job_id))?;
        let config = match version {
            Some(v) => versions.get(&v),
            None => versions.values().next_back(),
        };
        config
            .cloned()
            .ok_or_else(|| StoreError::not_found("job config", job_id))
    }

    async fn update_job_config(&self, job_id: &JobId, config: &JobConfig) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.write().unwrap();
        let versions = inner
            .job_configs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::not_found("job", job_id))?;
        let latest = versions.keys().next_back().copied().unwrap_or(0);
        if config.change_log.version <= latest {
            return Err(StoreError::Invalid {
                message: format!(
                    "job config version must advance: {} <= {latest}",
                    config.change_log.version
                ),
            });
        }
        versions.insert(config.change_log.version, config.clone());
        Ok(())
    }

    async fn get_job_runtime(&self, job_id: &JobId) -> Result<JobRuntime> {
        self.check_available()?;
        let inner = self.inner.read().unwrap();
        inner
            .job_runtimes
            .get(job_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("job", job_id))
    }

    async fn update_job_runtime(
        &self,
        job_id: &JobId,
        runtime: &JobRuntime,
        expected_revision: u64,
    ) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.write().unwrap();
        let stored = inner
            .job_runtimes
            .get_mut(job_id)
            .ok_or_else(|| StoreError::not_found("job", job_id))?;
        if stored.revision.version != expected_revision {
            return Err(StoreError::Conflict {
                id: job_id.to_string(),
                expected: expected_revision,
                actual: stored.revision.version,
            });
        }
        if runtime.revision.version <= stored.revision.version {
            return Err(StoreError::Invalid {
                message: format!(
                    "job runtime revision must advance: {} <= {}",
                    runtime.revision.version, stored.revision.version
                ),
            });
        }
        *stored = runtime.clone();
        Ok(())
    }

    async fn get_jobs_by_state(&self, state: JobState) -> Result<Vec<JobId>> {
        self.check_available()?;
        let inner = self.inner.read().unwrap();
        Ok(inner
            .job_runtimes
            .iter()
            .filter(|(_, runtime)| runtime.state == state)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn delete_job(&self, job_id: &JobId) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.write().unwrap();
        if inner.job_runtimes.remove(job_id).is_none() {
            return Err(StoreError::not_found("job", job_id));
        }
        inner.job_configs.remove(job_id);
        inner.tasks.remove(job_id);
        inner.task_owners.remove(job_id);
        inner
            .pod_events
            .retain(|key, _| key.job_id != *job_id);
        Ok(())
    }

    async fn query_jobs(&self, labels: &[Label]) -> Result<Vec<JobId>> {
        self.check_available()?;
        let inner = self.inner.read().unwrap();
        let mut out = vec![];
        for (job_id, versions) in &inner.job_configs {
            let Some(config) = versions.values().next_back() else {
                continue;
            };
            if labels.iter().all(|l| config.labels.contains(l)) {
                out.push(job_id.clone());
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn create_task(
        &self,
        job_id: &JobId,
        instance_id: InstanceId,
        info: &TaskInfo,
        owner: &str,
    ) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.write().unwrap();
        let tasks = inner.tasks.entry(job_id.clone()).or_default();
        if tasks.contains_key(&instance_id) {
            return Err(StoreError::already_exists(
                "task",
                TaskKey::new(job_id.clone(), instance_id),
            ));
        }
        tasks.insert(instance_id, info.clone());
        inner
            .task_owners
            .insert(job_id.clone(), owner.to_string());
        if let Some(event) = Self::pod_event_for(&info.runtime) {
            inner
                .pod_events
                .entry(TaskKey::new(job_id.clone(), instance_id))
                .or_default()
                .push(event);
        }
        Ok(())
    }

    async fn get_task_for_job(&self, job_id: &JobId, instance_id: InstanceId) -> Result<TaskInfo> {
        self.check_available()?;
        let inner = self.inner.read().unwrap();
        inner
            .tasks
            .get(job_id)
            .and_then(|tasks| tasks.get(&instance_id))
            .cloned()
            .ok_or_else(|| {
                StoreError::not_found("task", TaskKey::new(job_id.clone(), instance_id))
            })
    }

    async fn get_task_runtime(
        &self,
        job_id: &JobId,
        instance_id: InstanceId,
    ) -> Result<TaskRuntime> {
        self.get_task_for_job(job_id, instance_id)
            .await
            .map(|info| info.runtime)
    }

    async fn get_task_config(
        &self,
        job_id: &JobId,
        instance_id: InstanceId,
        version: u64,
    ) -> Result<TaskConfig> {
        self.check_available()?;
        let inner = self.inner.read().unwrap();
        let versions = inner
            .job_configs
            .get(job_id)
            .ok_or_else(|| StoreError::not_found("job", job_id))?;
        let config = versions
            .get(&version)
            .ok_or_else(|| StoreError::not_found("job config", job_id))?;
        Ok(config.task_config(instance_id).clone())
    }

    async fn update_task_runtime(
        &self,
        job_id: &JobId,
        instance_id: InstanceId,
        runtime: &TaskRuntime,
        expected_revision: u64,
    ) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.write().unwrap();
        let key = TaskKey::new(job_id.clone(), instance_id);
        let info = inner
            .tasks
            .get_mut(job_id)
            .and_then(|tasks| tasks.get_mut(&instance_id))
            .ok_or_else(|| StoreError::not_found("task", key.clone()))?;
        if info.runtime.revision.version != expected_revision {
            return Err(StoreError::Conflict {
                id: key.to_string(),
                expected: expected_revision,
                actual: info.runtime.revision.version,
            });
        }
        if runtime.revision.version <= info.runtime.revision.version {
            return Err(StoreError::Invalid {
                message: format!(
                    "task runtime revision must advance: {} <= {}",
                    runtime.revision.version, info.runtime.revision.version
                ),
            });
        }
        info.runtime = runtime.clone();
        let event = Self::pod_event_for(runtime);
        if let Some(event) = event {
            inner.pod_events.entry(key).or_default().push(event);
        }
        Ok(())
    }

    async fn get_tasks_for_job_by_range(
        &self,
        job_id: &JobId,
        from: InstanceId,
        to: InstanceId,
    ) -> Result<Vec<TaskInfo>> {
        self.check_available()?;
        let inner = self.inner.read().unwrap();
        let tasks = inner
            .tasks
            .get(job_id)
            .ok_or_else(|| StoreError::not_found("job", job_id))?;
        if from >= to {
            return Ok(vec![]);
        }
        Ok(tasks.range(from..to).map(|(_, info)| info.clone()).collect())
    }

    async fn get_pod_events(
        &self,
        job_id: &JobId,
        instance_id: InstanceId,
        run: Option<u64>,
    ) -> Result<Vec<PodEvent>> {
        self.check_available()?;
        let inner = self.inner.read().unwrap();
        let events = inner
            .pod_events
            .get(&TaskKey::new(job_id.clone(), instance_id))
            .cloned()
            .unwrap_or_default();
        Ok(match run {
            Some(run) => events
                .into_iter()
                .filter(|ev| ev.mesos_task_id.run_index() == Some(run))
                .collect(),
            None => events,
        })
    }
}

#[async_trait]
impl VolumeStore for InMemoryStore {
    async fn get_persistent_volume(&self, volume_id: &VolumeId) -> Result<PersistentVolumeInfo> {
        self.check_available()?;
        let inner = self.inner.read().unwrap();
        inner
            .volumes
            .get(volume_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("volume", volume_id))
    }
}

#[async_trait]
impl UpdateStore for InMemoryStore {
    async fn create_update(&self, update: &UpdateInfo) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.write().unwrap();
        if inner.updates.contains_key(&update.id) {
            return Err(StoreError::already_exists("update", &update.id));
        }
        inner.updates.insert(update.id.clone(), update.clone());
        Ok(())
    }

    async fn get_update(&self, update_id: &UpdateId) -> Result<UpdateInfo> {
        self.check_available()?;
        let inner = self.inner.read().unwrap();
        inner
            .updates
            .get(update_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("update", update_id))
    }

    async fn write_progress(
        &self,
        update_id: &UpdateId,
        state: UpdateState,
        done: &[InstanceId],
        failed: &[InstanceId],
        current: &[InstanceId],
    ) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.write().unwrap();
        let update = inner
            .updates
            .get_mut(update_id)
            .ok_or_else(|| StoreError::not_found("update", update_id))?;
        update.state = state;
        update.instances_done = done.to_vec();
        update.instances_failed = failed.to_vec();
        update.instances_current = current.to_vec();
        Ok(())
    }

    async fn update_update(&self, update: &UpdateInfo) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.write().unwrap();
        if !inner.updates.contains_key(&update.id) {
            return Err(StoreError::not_found("update", &update.id));
        }
        inner.updates.insert(update.id.clone(), update.clone());
        Ok(())
    }

    async fn get_updates_for_job(&self, job_id: &JobId) -> Result<Vec<UpdateInfo>> {
        self.check_available()?;
        let inner = self.inner.read().unwrap();
        Ok(inner
            .updates
            .values()
            .filter(|u| u.job_id == *job_id)
            .cloned()
            .collect())
    }

    async fn delete_update(&self, update_id: &UpdateId) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.write().unwrap();
        inner
            .updates
            .remove(update_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("update", update_id))
    }
}
