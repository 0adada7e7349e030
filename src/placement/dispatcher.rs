//! Placement dispatcher: the loop connecting the resource-manager dequeue
//! stream to the batch strategy and on to host-manager launches. Tasks that
//! cannot be placed within the retry budget go back to the resource manager
//! so they are not starved silently.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    config::PlacementConfig,
    data_model::{TaskInfo, TaskState},
    metrics::PlacementMetrics,
    placement::{
        offer_pool::OfferPool,
        strategy::{Assignment, BatchStrategy, PlacementHost},
    },
    rpc::{group_by_filter, Gang, HostFilter, HostManagerClient, ResourceManagerClient},
    tracker::{RuntimeDiff, Tracker},
};

pub struct Dispatcher {
    resmgr: Arc<dyn ResourceManagerClient>,
    host_manager: Arc<dyn HostManagerClient>,
    offer_pool: Arc<OfferPool>,
    tracker: Arc<Tracker>,
    strategy: BatchStrategy,
    config: PlacementConfig,
    task_dequeue_limit: u32,
    offer_dequeue_limit: u32,
    metrics: PlacementMetrics,
}

impl Dispatcher {
    pub fn new(
        resmgr: Arc<dyn ResourceManagerClient>,
        host_manager: Arc<dyn HostManagerClient>,
        offer_pool: Arc<OfferPool>,
        tracker: Arc<Tracker>,
        config: PlacementConfig,
        task_dequeue_limit: u32,
        offer_dequeue_limit: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            resmgr,
            host_manager,
            offer_pool,
            tracker,
            strategy: BatchStrategy::new(),
            config,
            task_dequeue_limit,
            offer_dequeue_limit,
            metrics: PlacementMetrics::new(),
        })
    }

    pub fn start(self: &Arc<Self>, shutdown_rx: watch::Receiver<()>) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.work_loop(shutdown_rx).await;
        });
    }

    async fn work_loop(&self, mut shutdown_rx: watch::Receiver<()>) {
        info!("placement dispatcher started");
        let dequeue_sleep = Duration::from_millis(self.config.task_dequeue_timeout_ms);
        loop {
            if shutdown_rx.has_changed().unwrap_or(true) {
                info!("placement dispatcher shutting down");
                return;
            }

            let tasks = match self.resmgr.dequeue_tasks(self.task_dequeue_limit).await {
                Ok(tasks) => tasks,
                Err(err) => {
                    error!(error = %err, "task dequeue failed");
                    tokio::select! {
                        _ = shutdown_rx.changed() => return,
                        _ = tokio::time::sleep(dequeue_sleep) => continue,
                    }
                }
            };
            if tasks.is_empty() {
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    _ = tokio::time::sleep(dequeue_sleep) => {}
                }
                continue;
            }

            self.metrics.tasks_dequeued.add(tasks.len() as u64, &[]);
            debug!(count = tasks.len(), "dequeued tasks for placement");
            self.place_and_launch(tasks, &mut shutdown_rx).await;
        }
    }

    /// Places one dequeued batch. Tasks with identical demands share offer
    /// acquisitions through their host filter group.
    async fn place_and_launch(&self, tasks: Vec<TaskInfo>, shutdown_rx: &mut watch::Receiver<()>) {
        for (_, (filter, group)) in group_by_filter(tasks) {
            let unassigned: Vec<Assignment> = group.into_iter().map(Assignment::new).collect();
            if let Err(err) = self.place_group(&filter, unassigned, shutdown_rx).await {
                warn!(error = %err, "placement group failed");
            }
        }
    }

    async fn place_group(
        &self,
        filter: &HostFilter,
        mut unassigned: Vec<Assignment>,
        shutdown_rx: &mut watch::Receiver<()>,
    ) -> Result<()> {
        let offer_sleep = Duration::from_millis(self.config.offer_wait_timeout_ms);
        let mut starved_rounds = 0u32;

        while !unassigned.is_empty() {
            if shutdown_rx.has_changed().unwrap_or(true) {
                return Ok(());
            }
            if starved_rounds >= self.config.offer_retry_limit {
                // give the tasks back instead of spinning on an empty pool
                warn!(
                    tasks = unassigned.len(),
                    rounds = starved_rounds,
                    "offer starvation, returning tasks to the resource manager"
                );
                self.requeue(unassigned).await;
                return Ok(());
            }

            let offers = self
                .offer_pool
                .acquire(filter, self.offer_dequeue_limit as usize);
            if offers.is_empty() {
                self.metrics.offers_starved.add(1, &[]);
                starved_rounds += 1;
                tokio::select! {
                    _ = shutdown_rx.changed() => return Ok(()),
                    _ = tokio::time::sleep(offer_sleep) => continue,
                }
            }
            self.metrics.offers_acquired.add(offers.len() as u64, &[]);
            starved_rounds = 0;

            let mut hosts: Vec<PlacementHost> =
                offers.into_iter().map(PlacementHost::new).collect();
            unassigned = self.strategy.place_once(unassigned, &mut hosts);

            for host in hosts {
                if host.has_selection() {
                    self.launch(host).await;
                } else {
                    // untouched offers go straight back into the pool
                    self.offer_pool.release(vec![host.offer]);
                }
            }
        }
        Ok(())
    }

    /// Launches one filled offer. The placement is recorded in the runtimes
    /// first so a fast status update never races the write; a failed launch
    /// rolls the tasks back, releases the offer, and requeues.
    async fn launch(&self, host: PlacementHost) {
        let task_count = host.selected.len();
        self.record_placement(&host, TaskState::Launched).await;

        match self
            .host_manager
            .launch_tasks(&host.offer, &host.selected)
            .await
        {
            Ok(()) => {
                self.metrics.launches.add(task_count as u64, &[]);
                info!(
                    hostname = %host.offer.hostname,
                    offer_id = %host.offer.id,
                    tasks = task_count,
                    "launched tasks"
                );
            }
            Err(err) => {
                self.metrics.launch_failures.add(1, &[]);
                error!(
                    hostname = %host.offer.hostname,
                    offer_id = %host.offer.id,
                    error = %err,
                    "launch failed, returning offer and tasks"
                );
                self.record_placement(&host, TaskState::Initialized).await;
                let tasks = host
                    .selected
                    .into_iter()
                    .map(|launchable| Assignment::new(launchable.task))
                    .collect();
                self.offer_pool.release(vec![host.offer]);
                self.requeue(tasks).await;
            }
        }
    }

    async fn record_placement(&self, host: &PlacementHost, state: TaskState) {
        let mut diffs: HashMap<crate::data_model::JobId, HashMap<u32, RuntimeDiff>> =
            HashMap::new();
        for launchable in &host.selected {
            diffs
                .entry(launchable.task.job_id.clone())
                .or_default()
                .insert(
                    launchable.task.instance_id,
                    RuntimeDiff {
                        state: Some(state),
                        host: Some(host.offer.hostname.clone()),
                        agent_id: Some(host.offer.agent_id.clone()),
                        ..Default::default()
                    },
                );
        }
        for (job_id, job_diffs) in diffs {
            if let Err(err) = self.tracker.patch_tasks(&job_id, job_diffs).await {
                warn!(job = %job_id, error = %err, "recording placement failed");
            }
        }
    }

    async fn requeue(&self, assignments: Vec<Assignment>) {
        let gangs: Vec<Gang> = assignments
            .iter()
            .map(|a| Gang::single(a.task.clone()))
            .collect();
        if let Err(err) = self.resmgr.enqueue_gangs(gangs).await {
            error!(error = %err, "requeue to resource manager failed");
        }
        // let the goal-state engine re-evaluate the returned tasks too
        for assignment in assignments {
            self.tracker
                .schedule_task(&assignment.task.key(), Duration::ZERO);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data_model::JobType,
        rpc::local::{LocalHostManager, LocalResourceManager},
        storage::TaskStore,
        testing::{test_agents, TestHarness},
    };

    #[tokio::test]
    async fn test_dispatcher_places_and_launches() {
        let harness = TestHarness::new();
        let (job_id, config) = harness.default_job("job1", JobType::Batch, 3);
        harness.create_job_with_tasks(&job_id, &config).await;

        let offer_pool = Arc::new(OfferPool::new(Duration::from_secs(300)));
        let mut offers_rx = harness.host_manager.subscribe_offers();
        offer_pool.add(offers_rx.recv().await.unwrap());

        let dispatcher = Dispatcher::new(
            harness.resmgr.clone(),
            harness.host_manager.clone(),
            offer_pool.clone(),
            harness.tracker.clone(),
            PlacementConfig {
                task_dequeue_timeout_ms: 10,
                offer_wait_timeout_ms: 10,
                offer_retry_limit: 3,
            },
            10,
            10,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        dispatcher.start(shutdown_rx);

        // feed the pipeline through the resource manager
        let mut gangs = vec![];
        for i in 0..3 {
            let info = harness.store.get_task_for_job(&job_id, i).await.unwrap();
            gangs.push(Gang::single(info));
        }
        harness.resmgr.enqueue_gangs(gangs).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let launches = harness.host_manager.launches();
        let launched: usize = launches.iter().map(|(_, ids)| ids.len()).sum();
        assert_eq!(launched, 3);

        // launches are recorded in the runtimes
        for i in 0..3 {
            let runtime = harness.store.get_task_runtime(&job_id, i).await.unwrap();
            assert_eq!(runtime.state, TaskState::Launched);
            assert!(runtime.host.is_some());
        }
        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_offer_starvation_requeues_tasks() {
        let harness = TestHarness::new();
        let (job_id, config) = harness.default_job("job1", JobType::Batch, 1);
        harness.create_job_with_tasks(&job_id, &config).await;

        // empty offer pool and nothing feeding it
        let offer_pool = Arc::new(OfferPool::new(Duration::from_secs(300)));
        let resmgr = Arc::new(LocalResourceManager::new(Duration::from_millis(5)));
        let host_manager = Arc::new(LocalHostManager::new(
            test_agents(0),
            Duration::from_millis(10),
        ));

        let dispatcher = Dispatcher::new(
            resmgr.clone(),
            host_manager,
            offer_pool,
            harness.tracker.clone(),
            PlacementConfig {
                task_dequeue_timeout_ms: 10,
                offer_wait_timeout_ms: 5,
                offer_retry_limit: 2,
            },
            10,
            10,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        dispatcher.start(shutdown_rx);

        let info = harness.store.get_task_for_job(&job_id, 0).await.unwrap();
        resmgr.enqueue_gangs(vec![Gang::single(info)]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = shutdown_tx.send(());

        // the task went back to the resource manager at least once
        assert!(resmgr.enqueued_total() >= 2);
    }
}
