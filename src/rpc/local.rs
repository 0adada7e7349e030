//! In-process loopback implementations of the external services. Dev mode
//! and integration-style tests run the whole pipeline in one process
//! against these: a FIFO task queue standing in for the resource manager
//! and a synthetic agent fleet standing in for the host manager.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::{
    data_model::{
        resources::{HostResources, PortRange, ScalarResources},
        MesosTaskId, MesosTaskState, Offer, OfferId, TaskInfo, TaskKey, TaskStatusUpdate,
    },
    respool::{validate_respool_config, RespoolConfig},
    rpc::{ExecutorOnAgent, Gang, HostManagerClient, LaunchableTask, ResourceManagerClient},
};

/// FIFO task queue with the resource manager's enqueue/dequeue surface.
pub struct LocalResourceManager {
    queue: Mutex<VecDeque<TaskInfo>>,
    notify: Notify,
    dequeue_wait: Duration,
    enqueued_total: AtomicU64,
    killed: Mutex<Vec<TaskKey>>,
    launched: Mutex<Vec<MesosTaskId>>,
    respools: Mutex<HashMap<String, RespoolConfig>>,
}

impl LocalResourceManager {
    pub fn new(dequeue_wait: Duration) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dequeue_wait,
            enqueued_total: AtomicU64::new(0),
            killed: Mutex::new(vec![]),
            launched: Mutex::new(vec![]),
            respools: Mutex::new(HashMap::new()),
        }
    }

    pub fn queued_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Tasks ever enqueued, including requeues.
    pub fn enqueued_total(&self) -> u64 {
        self.enqueued_total.load(Ordering::SeqCst)
    }

    pub fn killed_tasks(&self) -> Vec<TaskKey> {
        self.killed.lock().unwrap().clone()
    }

    pub fn launched_tasks(&self) -> Vec<MesosTaskId> {
        self.launched.lock().unwrap().clone()
    }

    fn drain(&self, limit: u32) -> Vec<TaskInfo> {
        let mut queue = self.queue.lock().unwrap();
        let take = (limit as usize).min(queue.len());
        queue.drain(..take).collect()
    }
}

#[async_trait]
impl ResourceManagerClient for LocalResourceManager {
    async fn enqueue_gangs(&self, gangs: Vec<Gang>) -> Result<()> {
        let mut queue = self.queue.lock().unwrap();
        for gang in gangs {
            self.enqueued_total
                .fetch_add(gang.tasks.len() as u64, Ordering::SeqCst);
            queue.extend(gang.tasks);
        }
        drop(queue);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue_tasks(&self, limit: u32) -> Result<Vec<TaskInfo>> {
        let tasks = self.drain(limit);
        if !tasks.is_empty() {
            return Ok(tasks);
        }
        // empty queue: wait for an enqueue, bounded by the dequeue timeout
        let _ = tokio::time::timeout(self.dequeue_wait, self.notify.notified()).await;
        Ok(self.drain(limit))
    }

    async fn kill_tasks(&self, tasks: &[TaskKey]) -> Result<()> {
        let mut queue = self.queue.lock().unwrap();
        queue.retain(|t| !tasks.contains(&t.key()));
        drop(queue);
        self.killed.lock().unwrap().extend_from_slice(tasks);
        Ok(())
    }

    async fn mark_tasks_launched(&self, tasks: &[MesosTaskId]) -> Result<()> {
        self.launched.lock().unwrap().extend_from_slice(tasks);
        Ok(())
    }

    async fn create_resource_pool(&self, config: &RespoolConfig) -> Result<String> {
        validate_respool_config(config)?;
        let id = format!("{}{}", config.parent_path.trim_end_matches('/'), config.name);
        self.respools
            .lock()
            .unwrap()
            .insert(id.clone(), config.clone());
        Ok(id)
    }
}

/// Shape of one synthetic agent in the loopback fleet.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub hostname: String,
    pub cpus: f64,
    pub mem_mb: f64,
    pub disk_mb: f64,
    pub port_begin: u32,
    pub port_end: u32,
}

struct HostInner {
    offers_tx: Mutex<Option<mpsc::UnboundedSender<Vec<Offer>>>>,
    status_tx: Mutex<Option<mpsc::UnboundedSender<TaskStatusUpdate>>>,
    outstanding: Mutex<HashMap<OfferId, Offer>>,
    launches: Mutex<Vec<(OfferId, Vec<MesosTaskId>)>>,
    shutdowns: Mutex<Vec<ExecutorOnAgent>>,
    offer_seq: AtomicU64,
    agents: Vec<AgentSpec>,
    task_run_duration: Duration,
}

impl HostInner {
    fn offer_for_agent(&self, agent: &AgentSpec) -> Offer {
        let seq = self.offer_seq.fetch_add(1, Ordering::SeqCst);
        Offer {
            id: OfferId::new(format!("{}-{seq}", agent.hostname)),
            hostname: agent.hostname.clone(),
            agent_id: format!("agent-{}", agent.hostname),
            resources: HostResources::unreserved(
                ScalarResources {
                    cpus: agent.cpus,
                    mem_mb: agent.mem_mb,
                    disk_mb: agent.disk_mb,
                    gpu: 0.0,
                    fd: 100_000,
                },
                vec![PortRange {
                    begin: agent.port_begin,
                    end: agent.port_end,
                }],
            ),
            attributes: vec![],
        }
    }

    fn send_offers(&self, offers: Vec<Offer>) {
        let mut outstanding = self.outstanding.lock().unwrap();
        for offer in &offers {
            outstanding.insert(offer.id.clone(), offer.clone());
        }
        drop(outstanding);
        if let Some(tx) = self.offers_tx.lock().unwrap().clone() {
            let _ = tx.send(offers);
        }
    }

    fn send_status(&self, update: TaskStatusUpdate) {
        if let Some(tx) = self.status_tx.lock().unwrap().clone() {
            let _ = tx.send(update);
        }
    }
}

/// Synthetic agent fleet. Launches report RUNNING immediately and FINISHED
/// after `task_run_duration`; the agent's resources are then re-offered.
pub struct LocalHostManager {
    inner: Arc<HostInner>,
}

impl LocalHostManager {
    pub fn new(agents: Vec<AgentSpec>, task_run_duration: Duration) -> Self {
        Self {
            inner: Arc::new(HostInner {
                offers_tx: Mutex::new(None),
                status_tx: Mutex::new(None),
                outstanding: Mutex::new(HashMap::new()),
                launches: Mutex::new(vec![]),
                shutdowns: Mutex::new(vec![]),
                offer_seq: AtomicU64::new(0),
                agents,
                task_run_duration,
            }),
        }
    }

    pub fn launches(&self) -> Vec<(OfferId, Vec<MesosTaskId>)> {
        self.inner.launches.lock().unwrap().clone()
    }

    pub fn shutdowns(&self) -> Vec<ExecutorOnAgent> {
        self.inner.shutdowns.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostManagerClient for LocalHostManager {
    async fn launch_tasks(&self, offer: &Offer, tasks: &[LaunchableTask]) -> Result<()> {
        let inner = self.inner.clone();
        inner.outstanding.lock().unwrap().remove(&offer.id);

        let ids: Vec<MesosTaskId> = tasks
            .iter()
            .filter_map(|t| t.task.runtime.mesos_task_id.clone())
            .collect();
        inner
            .launches
            .lock()
            .unwrap()
            .push((offer.id.clone(), ids.clone()));
        debug!(offer_id = %offer.id, hostname = %offer.hostname, tasks = ids.len(), "launching tasks");

        for id in &ids {
            self.inner.send_status(TaskStatusUpdate {
                mesos_task_id: id.clone(),
                state: MesosTaskState::Running,
                agent_id: Some(offer.agent_id.clone()),
                healthy: Some(true),
                message: String::new(),
            });
        }

        // finish the run later and put the host back into rotation
        let agent = inner
            .agents
            .iter()
            .find(|a| a.hostname == offer.hostname)
            .cloned();
        let agent_id = offer.agent_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.task_run_duration).await;
            for id in &ids {
                inner.send_status(TaskStatusUpdate {
                    mesos_task_id: id.clone(),
                    state: MesosTaskState::Finished,
                    agent_id: Some(agent_id.clone()),
                    healthy: None,
                    message: String::new(),
                });
            }
            if let Some(agent) = agent {
                let offer = inner.offer_for_agent(&agent);
                inner.send_offers(vec![offer]);
            }
        });
        Ok(())
    }

    async fn launch_task_with_reserved_resource(&self, task: &TaskInfo) -> Result<()> {
        if let Some(id) = &task.runtime.mesos_task_id {
            self.inner.send_status(TaskStatusUpdate {
                mesos_task_id: id.clone(),
                state: MesosTaskState::Running,
                agent_id: task.runtime.agent_id.clone(),
                healthy: Some(true),
                message: String::new(),
            });
        }
        Ok(())
    }

    async fn kill_tasks(&self, task_ids: &[MesosTaskId]) -> Result<()> {
        for id in task_ids {
            self.inner.send_status(TaskStatusUpdate {
                mesos_task_id: id.clone(),
                state: MesosTaskState::Killed,
                agent_id: None,
                healthy: None,
                message: "killed by job manager".to_string(),
            });
        }
        Ok(())
    }

    async fn shutdown_executors(&self, executors: &[ExecutorOnAgent]) -> Result<()> {
        self.inner
            .shutdowns
            .lock()
            .unwrap()
            .extend_from_slice(executors);
        Ok(())
    }

    async fn decline_offers(&self, offer_ids: &[OfferId]) -> Result<()> {
        // declined resources come back as fresh offers after a beat
        let inner = self.inner.clone();
        let mut hosts = vec![];
        {
            let mut outstanding = inner.outstanding.lock().unwrap();
            for id in offer_ids {
                if let Some(offer) = outstanding.remove(id) {
                    hosts.push(offer.hostname);
                }
            }
        }
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let offers: Vec<Offer> = hosts
                .iter()
                .filter_map(|hostname| {
                    inner
                        .agents
                        .iter()
                        .find(|a| a.hostname == *hostname)
                        .map(|a| inner.offer_for_agent(a))
                })
                .collect();
            if !offers.is_empty() {
                inner.send_offers(offers);
            }
        });
        Ok(())
    }

    fn subscribe_offers(&self) -> mpsc::UnboundedReceiver<Vec<Offer>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.offers_tx.lock().unwrap() = Some(tx);
        let offers: Vec<Offer> = self
            .inner
            .agents
            .iter()
            .map(|a| self.inner.offer_for_agent(a))
            .collect();
        self.inner.send_offers(offers);
        rx
    }

    fn subscribe_status_updates(&self) -> mpsc::UnboundedReceiver<TaskStatusUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.status_tx.lock().unwrap() = Some(tx);
        rx
    }
}
