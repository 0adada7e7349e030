pub mod resources;
pub mod test_objects;

use std::{
    collections::HashMap,
    fmt::{self, Display},
};

use anyhow::{anyhow, Result};
use derive_builder::Builder;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{
    data_model::resources::{PortRange, ResourceSpec},
    utils::get_epoch_time_in_ms,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
#[serde(transparent)]
pub struct JobId(String);

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl JobId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    /// Dash-free so the mesos task-id parser can split `"{job}-{inst}-{run}"`
    /// on the first dash.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self::new(value.to_string())
    }
}

/// Instance index of a task within its job.
pub type InstanceId = u32;

/// Identity of a task: `(JobId, InstanceId)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskKey {
    pub job_id: JobId,
    pub instance_id: InstanceId,
}

impl TaskKey {
    pub fn new(job_id: JobId, instance_id: InstanceId) -> Self {
        Self {
            job_id,
            instance_id,
        }
    }
}

impl Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.job_id, self.instance_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct UpdateId(String);

impl Default for UpdateId {
    fn default() -> Self {
        Self(nanoid!())
    }
}

impl Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl UpdateId {
    pub fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UpdateId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct OfferId(String);

impl Display for OfferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl OfferId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OfferId {
    fn from(value: &str) -> Self {
        Self::new(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct VolumeId(String);

impl Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl VolumeId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

/// Mesos task identifier, formatted `"{jobID}-{instanceID}-{run}"` where
/// `run` is a monotonic run index or a UUID for runs predating run counting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MesosTaskId(String);

impl MesosTaskId {
    pub fn new(job_id: &JobId, instance_id: InstanceId, run: u64) -> Self {
        Self(format!("{job_id}-{instance_id}-{run}"))
    }

    pub fn from_parts_with_uuid(job_id: &JobId, instance_id: InstanceId) -> Self {
        Self(format!(
            "{job_id}-{instance_id}-{}",
            uuid::Uuid::new_v4()
        ))
    }

    pub fn get(&self) -> &str {
        &self.0
    }

    /// Run suffix of the mesos task id, when it is a numeric run index.
    pub fn run_index(&self) -> Option<u64> {
        let suffix = self.0.rsplit('-').next()?;
        suffix.parse().ok()
    }
}

impl Display for MesosTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MesosTaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Parses `jobID` and `instanceID` out of a peloton task id of the form
/// `"{jobID}-{instanceID}"`, splitting on the last dash.
pub fn parse_task_id(task_id: &str) -> Result<(String, InstanceId)> {
    let pos = task_id
        .rfind('-')
        .ok_or_else(|| anyhow!("invalid task id {task_id}"))?;
    let instance_id = task_id[pos + 1..]
        .parse::<InstanceId>()
        .map_err(|e| anyhow!("invalid instance id in task id {task_id}: {e}"))?;
    Ok((task_id[..pos].to_string(), instance_id))
}

/// Parses the owning `(jobID, instanceID)` from a mesos task id of the form
/// `"{jobID}-{instanceID}-{run}"`. The run suffix is optional. Requires at
/// least two dash-separated segments with a numeric second segment.
pub fn parse_task_id_from_mesos(mesos_task_id: &str) -> Result<(String, InstanceId)> {
    let parts: Vec<&str> = mesos_task_id.split('-').collect();
    if parts.len() < 2 {
        return Err(anyhow!("invalid mesos task id {mesos_task_id}"));
    }
    let instance_id = parts[1]
        .parse::<InstanceId>()
        .map_err(|e| anyhow!("invalid mesos task id {mesos_task_id}: {e}"))?;
    Ok((parts[0].to_string(), instance_id))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, Default)]
pub enum JobState {
    #[default]
    Initialized,
    Pending,
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Killed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, Default)]
pub enum JobType {
    #[default]
    Batch,
    Service,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, Default)]
pub enum TaskState {
    #[default]
    Initialized,
    Pending,
    Launched,
    Running,
    Killing,
    Preempting,
    Succeeded,
    Failed,
    Killed,
    Lost,
    Deleted,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Killed | Self::Lost | Self::Deleted
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, Default)]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    Invalid,
}

/// Task states reported by the mesos-style offer source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
pub enum MesosTaskState {
    Staging,
    Starting,
    Running,
    Killing,
    Finished,
    Failed,
    Error,
    Killed,
    Lost,
}

/// Fixed translation from mesos task states to peloton task states.
/// KILLING maps to RUNNING: the kill is in flight but the task is still up.
pub fn mesos_state_to_task_state(state: MesosTaskState) -> TaskState {
    match state {
        MesosTaskState::Staging | MesosTaskState::Starting => TaskState::Launched,
        MesosTaskState::Running | MesosTaskState::Killing => TaskState::Running,
        MesosTaskState::Finished => TaskState::Succeeded,
        MesosTaskState::Failed | MesosTaskState::Error => TaskState::Failed,
        MesosTaskState::Killed => TaskState::Killed,
        MesosTaskState::Lost => TaskState::Lost,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
pub enum UpdateState {
    Initialized,
    RollingForward,
    RollingBackward,
    Paused,
    Succeeded,
    Failed,
    Aborted,
}

impl UpdateState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, Default)]
pub enum WorkflowType {
    #[default]
    Update,
    Restart,
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
pub enum VolumeState {
    Initialized,
    Created,
    Deleted,
}

/// Revision of a persisted record. `version` must be strictly monotonic per
/// entity; stores reject writes whose expected version does not match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Revision {
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Revision {
    pub fn new(version: u64) -> Self {
        let now = get_epoch_time_in_ms();
        Self {
            version,
            created_at: now,
            updated_at: now,
        }
    }

    /// Next revision derived from this one; bumps the version and stamps the
    /// update time, keeping the creation time.
    pub fn next(&self) -> Self {
        Self {
            version: self.version + 1,
            created_at: self.created_at,
            updated_at: get_epoch_time_in_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Label {
    pub key: String,
    pub value: String,
}

/// Scheduling constraint matched against host attributes during placement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct SchedulingConstraint {
    pub attribute: String,
    pub value: String,
}

/// Behavior of a task when the resource manager preempts it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PreemptionPolicy {
    pub kill_on_preempt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VolumeConfig {
    pub container_path: String,
    pub size_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, Builder)]
#[builder(default)]
pub struct TaskConfig {
    pub name: String,
    pub resource: ResourceSpec,
    pub command: Vec<String>,
    pub container_image: Option<String>,
    pub num_ports: u32,
    pub constraint: Option<SchedulingConstraint>,
    pub volume: Option<VolumeConfig>,
    pub preemption_policy: Option<PreemptionPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SlaConfig {
    pub priority: u32,
    pub preemptible: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, Builder)]
#[builder(default)]
pub struct JobConfig {
    pub name: String,
    pub owning_team: String,
    pub respool_id: Option<String>,
    pub job_type: JobType,
    pub instance_count: u32,
    pub sla: SlaConfig,
    pub labels: Vec<Label>,
    pub default_config: TaskConfig,
    /// Per-instance overrides; instances not present use `default_config`.
    pub instance_config: HashMap<InstanceId, TaskConfig>,
    pub change_log: Revision,
}

impl JobConfig {
    /// Effective config for one instance.
    pub fn task_config(&self, instance_id: InstanceId) -> &TaskConfig {
        self.instance_config
            .get(&instance_id)
            .unwrap_or(&self.default_config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
#[builder(default)]
pub struct JobRuntime {
    pub state: JobState,
    pub goal_state: JobState,
    pub creation_time: u64,
    pub completion_time: Option<u64>,
    pub revision: Revision,
}

impl Default for JobRuntime {
    fn default() -> Self {
        Self {
            state: JobState::Initialized,
            goal_state: JobState::Succeeded,
            creation_time: get_epoch_time_in_ms(),
            completion_time: None,
            revision: Revision::new(1),
        }
    }
}

/// Default goal state for tasks of a job: long-running services converge to
/// RUNNING, batch tasks to SUCCEEDED.
pub fn default_task_goal_state(job_type: JobType) -> TaskState {
    match job_type {
        JobType::Service => TaskState::Running,
        JobType::Batch => TaskState::Succeeded,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
#[builder(default)]
pub struct TaskRuntime {
    pub state: TaskState,
    pub goal_state: TaskState,
    pub mesos_task_id: Option<MesosTaskId>,
    pub agent_id: Option<String>,
    pub host: Option<String>,
    pub config_version: u64,
    pub desired_config_version: u64,
    pub failure_count: u32,
    pub healthy: HealthState,
    pub volume_id: Option<VolumeId>,
    pub message: String,
    pub start_time: Option<u64>,
    pub completion_time: Option<u64>,
    pub revision: Revision,
}

impl Default for TaskRuntime {
    fn default() -> Self {
        Self {
            state: TaskState::Initialized,
            goal_state: TaskState::Succeeded,
            mesos_task_id: None,
            agent_id: None,
            host: None,
            config_version: 0,
            desired_config_version: 0,
            failure_count: 0,
            healthy: HealthState::Unknown,
            volume_id: None,
            message: String::new(),
            start_time: None,
            completion_time: None,
            revision: Revision::new(1),
        }
    }
}

impl TaskRuntime {
    /// True when the current config lags the desired one.
    pub fn needs_config_update(&self) -> bool {
        self.config_version != self.desired_config_version
    }
}

/// Runtime for a task created fresh at the given config version, before it is
/// enqueued to the resource manager. Run index 1; retries bump it.
pub fn new_initializing_runtime(
    job_id: &JobId,
    instance_id: InstanceId,
    job_config: &JobConfig,
) -> TaskRuntime {
    TaskRuntime {
        state: TaskState::Initialized,
        goal_state: default_task_goal_state(job_config.job_type),
        mesos_task_id: Some(MesosTaskId::new(job_id, instance_id, 1)),
        config_version: job_config.change_log.version,
        desired_config_version: job_config.change_log.version,
        ..Default::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInfo {
    pub job_id: JobId,
    pub instance_id: InstanceId,
    pub config: TaskConfig,
    pub runtime: TaskRuntime,
}

impl TaskInfo {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.job_id.clone(), self.instance_id)
    }
}

/// One observed state transition of a task run, appended per runtime write.
/// The latest event's mesos task id carries the run index used to mint the
/// id of the next run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodEvent {
    pub mesos_task_id: MesosTaskId,
    pub actual_state: TaskState,
    pub goal_state: TaskState,
    pub timestamp: u64,
    pub message: String,
}

/// Next run index for an instance given its stored pod events.
pub fn next_run_index(events: &[PodEvent]) -> u64 {
    events
        .last()
        .and_then(|ev| ev.mesos_task_id.run_index())
        .map(|run| run + 1)
        .unwrap_or(events.len() as u64 + 1)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UpdateConfig {
    /// Instances updated concurrently; 0 means unbounded.
    pub batch_size: u32,
    /// Failed instances tolerated before the update is declared failed.
    pub max_failure_instances: u32,
    /// Task restarts tolerated per instance before it counts as failed.
    pub max_instance_attempts: u32,
    pub rollback_on_failure: bool,
}

/// Durable record of a rolling workflow bound to one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateInfo {
    pub id: UpdateId,
    pub job_id: JobId,
    pub workflow_type: WorkflowType,
    pub config: UpdateConfig,
    pub state: UpdateState,
    /// Config version the workflow drives instances toward.
    pub target_config_version: u64,
    /// Config version instances are migrating away from.
    pub source_config_version: u64,
    pub instances_total: Vec<InstanceId>,
    pub instances_added: Vec<InstanceId>,
    pub instances_updated: Vec<InstanceId>,
    pub instances_removed: Vec<InstanceId>,
    pub instances_done: Vec<InstanceId>,
    pub instances_failed: Vec<InstanceId>,
    pub instances_current: Vec<InstanceId>,
    pub creation_time: u64,
}

impl Default for UpdateInfo {
    fn default() -> Self {
        Self {
            id: UpdateId::default(),
            job_id: JobId::default(),
            workflow_type: WorkflowType::Update,
            config: UpdateConfig::default(),
            state: UpdateState::Initialized,
            target_config_version: 0,
            source_config_version: 0,
            instances_total: vec![],
            instances_added: vec![],
            instances_updated: vec![],
            instances_removed: vec![],
            instances_done: vec![],
            instances_failed: vec![],
            instances_current: vec![],
            creation_time: get_epoch_time_in_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistentVolumeInfo {
    pub id: VolumeId,
    pub state: VolumeState,
    pub job_id: JobId,
    pub instance_id: InstanceId,
    pub size_mb: u64,
}

/// A host's declaration of currently available resources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Offer {
    pub id: OfferId,
    pub hostname: String,
    pub agent_id: String,
    pub resources: resources::HostResources,
    pub attributes: Vec<Label>,
}

impl Offer {
    pub fn port_ranges(&self) -> &[PortRange] {
        &self.resources.ports
    }
}

/// Status update delivered by the host-manager event stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatusUpdate {
    pub mesos_task_id: MesosTaskId,
    pub state: MesosTaskState,
    pub agent_id: Option<String>,
    pub healthy: Option<bool>,
    pub message: String,
}
