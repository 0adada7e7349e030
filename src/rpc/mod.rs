//! Client interfaces to the resource manager and the host manager. Both
//! services are external; the core only sees these traits. Every call is
//! expected to be wrapped in a deadline by the caller (the defaults live in
//! [`crate::config::ServerConfig`]).

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    data_model::{MesosTaskId, Offer, OfferId, TaskInfo, TaskKey, TaskStatusUpdate},
    respool::RespoolConfig,
};

pub mod local;

/// A set of tasks that must be admitted together. Single-task gangs are the
/// common case.
#[derive(Debug, Clone)]
pub struct Gang {
    pub tasks: Vec<TaskInfo>,
}

impl Gang {
    pub fn single(task: TaskInfo) -> Self {
        Self { tasks: vec![task] }
    }
}

/// One task ready to launch, with the ports selected for it from the offer.
#[derive(Debug, Clone)]
pub struct LaunchableTask {
    pub task: TaskInfo,
    pub selected_ports: Vec<u32>,
}

/// Executor identity used for shutdown escalation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOnAgent {
    pub executor_id: String,
    pub agent_id: String,
}

#[async_trait]
pub trait ResourceManagerClient: Send + Sync {
    /// Admits gangs into the resource manager's scheduling queues.
    async fn enqueue_gangs(&self, gangs: Vec<Gang>) -> Result<()>;

    /// Pulls up to `limit` placeable tasks. Returns an empty vec on timeout.
    async fn dequeue_tasks(&self, limit: u32) -> Result<Vec<TaskInfo>>;

    async fn kill_tasks(&self, tasks: &[TaskKey]) -> Result<()>;

    /// Accounting callback: tells the resource manager which tasks left the
    /// placement pipeline because they were launched.
    async fn mark_tasks_launched(&self, tasks: &[MesosTaskId]) -> Result<()>;

    async fn create_resource_pool(&self, config: &RespoolConfig) -> Result<String>;
}

#[async_trait]
pub trait HostManagerClient: Send + Sync {
    /// Launches tasks against a held offer. Consumes the offer on success.
    async fn launch_tasks(&self, offer: &Offer, tasks: &[LaunchableTask]) -> Result<()>;

    /// Launches a stateful task directly onto the host holding its reserved
    /// volume, bypassing placement.
    async fn launch_task_with_reserved_resource(&self, task: &TaskInfo) -> Result<()>;

    async fn kill_tasks(&self, task_ids: &[MesosTaskId]) -> Result<()>;

    async fn shutdown_executors(&self, executors: &[ExecutorOnAgent]) -> Result<()>;

    /// Returns expired offers to the offer source.
    async fn decline_offers(&self, offer_ids: &[OfferId]) -> Result<()>;

    /// Stream of incoming host offers. Called once at startup.
    fn subscribe_offers(&self) -> mpsc::UnboundedReceiver<Vec<Offer>>;

    /// Stream of mesos task status updates. Called once at startup.
    fn subscribe_status_updates(&self) -> mpsc::UnboundedReceiver<TaskStatusUpdate>;
}

/// Filter describing what one group of assignments needs from a host.
/// Assignments with equal filters share acquired offers.
#[derive(Debug, Clone, PartialEq)]
pub struct HostFilter {
    pub minimum: crate::data_model::resources::ResourceSpec,
    pub num_ports: u32,
    pub constraint: Option<crate::data_model::SchedulingConstraint>,
}

impl HostFilter {
    /// Stable grouping key.
    pub fn key(&self) -> String {
        let constraint = self
            .constraint
            .as_ref()
            .map(|c| format!("{}={}", c.attribute, c.value))
            .unwrap_or_default();
        format!(
            "cpu:{};mem:{};disk:{};gpu:{};fd:{};ports:{};{constraint}",
            self.minimum.cpu_limit,
            self.minimum.mem_limit_mb,
            self.minimum.disk_limit_mb,
            self.minimum.gpu_limit,
            self.minimum.fd_limit,
            self.num_ports,
        )
    }
}

/// Groups tasks by their host filter so one acquisition serves the group.
pub fn group_by_filter(tasks: Vec<TaskInfo>) -> HashMap<String, (HostFilter, Vec<TaskInfo>)> {
    let mut groups: HashMap<String, (HostFilter, Vec<TaskInfo>)> = HashMap::new();
    for task in tasks {
        let filter = HostFilter {
            minimum: task.config.resource.clone(),
            num_ports: task.config.num_ports,
            constraint: task.config.constraint.clone(),
        };
        groups
            .entry(filter.key())
            .or_insert_with(|| (filter, vec![]))
            .1
            .push(task);
    }
    groups
}
