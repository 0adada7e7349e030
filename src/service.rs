//! Process wiring: builds the tracker, engines and loops, ties their
//! lifetimes to leadership, and serves the HTTP API.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum_server::Handle;
use tokio::{signal, sync::watch};
use tracing::{error, info};

use crate::{
    config::ServerConfig,
    goal_state::driver::GoalStateDriver,
    jobsvc::JobService,
    leadership::{LeaderLifecycle, LeadershipController},
    metrics,
    placement::{dispatcher::Dispatcher, offer_manager::OfferManager, offer_pool::OfferPool},
    recovery::Recovery,
    routes::{create_routes, RouteState},
    rpc::{
        local::{AgentSpec, LocalHostManager, LocalResourceManager},
        HostManagerClient, ResourceManagerClient,
    },
    status_update::StatusUpdateProcessor,
    storage::{memory::InMemoryStore, JobStore, TaskStore, UpdateStore, VolumeStore},
    tracker::Tracker,
};

pub struct Stores {
    pub job_store: Arc<dyn JobStore>,
    pub task_store: Arc<dyn TaskStore>,
    pub volume_store: Arc<dyn VolumeStore>,
    pub update_store: Arc<dyn UpdateStore>,
}

pub struct Clients {
    pub resmgr: Arc<dyn ResourceManagerClient>,
    pub host_manager: Arc<dyn HostManagerClient>,
}

struct ServiceInner {
    tracker: Arc<Tracker>,
    driver: Arc<GoalStateDriver>,
    offer_manager: Arc<OfferManager>,
    dispatcher: Arc<Dispatcher>,
    status_processor: Arc<StatusUpdateProcessor>,
    recovery: Arc<Recovery>,
    host_manager: Arc<dyn HostManagerClient>,
    /// Shutdown channel for the current leadership tenure.
    leader_shutdown: std::sync::Mutex<Option<watch::Sender<()>>>,
}

impl ServiceInner {
    fn start_components(self: &Arc<Self>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        {
            let mut slot = self.leader_shutdown.lock().unwrap();
            if slot.is_some() {
                return;
            }
            *slot = Some(shutdown_tx);
        }

        let schedule_rx = self.tracker.new_schedule_receiver();
        self.driver.start(schedule_rx, shutdown_rx.clone());

        self.status_processor
            .start(self.host_manager.subscribe_status_updates(), shutdown_rx.clone());

        self.offer_manager
            .start(self.host_manager.subscribe_offers(), shutdown_rx.clone());

        self.dispatcher.start(shutdown_rx);

        let recovery = self.recovery.clone();
        tokio::spawn(async move {
            recovery.recover_jobs().await;
        });
    }

    fn stop_components(self: &Arc<Self>) {
        let sender = self.leader_shutdown.lock().unwrap().take();
        let Some(sender) = sender else { return };
        let _ = sender.send(());
        self.driver.stop();

        // flush the pool so a future leader starts from fresh offers
        let offer_manager = self.offer_manager.clone();
        tokio::spawn(async move {
            offer_manager.prune(true).await;
        });
    }
}

struct CoreLifecycle {
    inner: Arc<ServiceInner>,
}

impl LeaderLifecycle for CoreLifecycle {
    fn start(&self) {
        self.inner.start_components();
    }

    fn stop(&self) {
        self.inner.stop_components();
    }

    fn name(&self) -> &'static str {
        "core"
    }
}

pub struct Service {
    pub config: ServerConfig,
    controller: Arc<LeadershipController>,
    job_service: Arc<JobService>,
}

impl Service {
    /// Builds a service against externally provided stores and clients.
    pub fn new(config: ServerConfig, stores: Stores, clients: Clients) -> Result<Self> {
        metrics::init_provider(config.tracing.enabled, config.tracing.endpoint.as_ref())?;

        let (tracker, _initial_rx) = Tracker::new(
            stores.job_store.clone(),
            stores.task_store.clone(),
            stores.update_store.clone(),
        );

        let driver = GoalStateDriver::new(
            tracker.clone(),
            stores.job_store.clone(),
            stores.task_store.clone(),
            stores.volume_store.clone(),
            stores.update_store.clone(),
            clients.resmgr.clone(),
            clients.host_manager.clone(),
            config.goal_state.clone(),
        );

        let offer_pool = Arc::new(OfferPool::new(Duration::from_secs(
            config.offer_hold_time_sec,
        )));
        let offer_manager = OfferManager::new(
            offer_pool.clone(),
            clients.host_manager.clone(),
            Duration::from_secs(config.offer_pruning_period_sec),
        );
        let dispatcher = Dispatcher::new(
            clients.resmgr.clone(),
            clients.host_manager.clone(),
            offer_pool.clone(),
            tracker.clone(),
            config.placement.clone(),
            config.task_dequeue_limit,
            config.offer_dequeue_limit,
        );
        let status_processor = StatusUpdateProcessor::new(
            tracker.clone(),
            clients.host_manager.clone(),
            config.db_write_concurrency,
        );
        let recovery = Recovery::new(
            stores.job_store.clone(),
            stores.task_store.clone(),
            clients.resmgr.clone(),
            tracker.clone(),
            Duration::from_secs(config.recovery_interval_sec),
        );
        let job_service = JobService::new(
            stores.job_store,
            stores.task_store,
            stores.update_store,
            tracker.clone(),
            clients.resmgr,
            clients.host_manager.clone(),
        );

        let inner = Arc::new(ServiceInner {
            tracker,
            driver,
            offer_manager,
            dispatcher,
            status_processor,
            recovery,
            host_manager: clients.host_manager,
            leader_shutdown: std::sync::Mutex::new(None),
        });

        let controller = LeadershipController::new(format!("0.0.0.0:{}", config.port));
        controller.register(Arc::new(CoreLifecycle { inner }));

        Ok(Self {
            config,
            controller,
            job_service,
        })
    }

    /// Single-process dev mode: in-memory store, loopback resource manager,
    /// and a synthetic agent fleet.
    pub fn new_dev(config: ServerConfig) -> Result<Self> {
        let store = Arc::new(InMemoryStore::new());
        let agents: Vec<AgentSpec> = (0..3)
            .map(|i| AgentSpec {
                hostname: format!("dev-agent-{i}"),
                cpus: 16.0,
                mem_mb: 32.0 * 1024.0,
                disk_mb: 512.0 * 1024.0,
                port_begin: 31000,
                port_end: 32000,
            })
            .collect();
        let resmgr = Arc::new(LocalResourceManager::new(Duration::from_secs(1)));
        let host_manager = Arc::new(LocalHostManager::new(agents, Duration::from_secs(10)));
        Self::new(
            config,
            Stores {
                job_store: store.clone(),
                task_store: store.clone(),
                volume_store: store.clone(),
                update_store: store,
            },
            Clients {
                resmgr,
                host_manager,
            },
        )
    }

    pub fn controller(&self) -> Arc<LeadershipController> {
        self.controller.clone()
    }

    /// Serves the API, holding leadership until shutdown. With election
    /// disabled this instance leads unconditionally.
    pub async fn start(&self) -> Result<()> {
        if !self.config.election.enabled {
            info!("election disabled, assuming leadership");
            self.controller.gained_leadership();
        }

        let route_state = RouteState {
            job_service: self.job_service.clone(),
        };
        let routes = create_routes(route_state);

        let handle = Handle::new();
        let handle_for_signal = handle.clone();
        let controller = self.controller.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received, resigning and stopping the server");
            controller.shutdown();
            handle_for_signal.graceful_shutdown(Some(Duration::from_secs(10)));
        });

        let addr: SocketAddr = self
            .config
            .listen_addr()
            .parse()
            .context("parsing listen address")?;
        info!(addr = %addr, "api server listening");
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "installing ctrl-c handler failed");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => error!(error = %err, "installing sigterm handler failed"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data_model::{JobState, JobType, TaskState},
        storage::JobStore as _,
    };

    fn dev_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.goal_state.engine_workers = 4;
        config.placement.task_dequeue_timeout_ms = 20;
        config.placement.offer_wait_timeout_ms = 20;
        config.db_write_concurrency = 4;
        config
    }

    /// End-to-end pass through the whole pipeline: job create → goal state
    /// start → resource manager → placement → launch → status updates →
    /// terminal batch job.
    #[tokio::test]
    async fn test_batch_job_runs_to_completion_in_dev_mode() {
        let store = Arc::new(InMemoryStore::new());
        let resmgr = Arc::new(LocalResourceManager::new(Duration::from_millis(20)));
        let host_manager = Arc::new(LocalHostManager::new(
            crate::testing::test_agents(2),
            Duration::from_millis(50),
        ));
        let service = Service::new(
            dev_config(),
            Stores {
                job_store: store.clone(),
                task_store: store.clone(),
                volume_store: store.clone(),
                update_store: store.clone(),
            },
            Clients {
                resmgr: resmgr.clone(),
                host_manager: host_manager.clone(),
            },
        )
        .unwrap();
        service.controller.gained_leadership();

        let config = crate::data_model::test_objects::tests::mock_job_config(JobType::Batch, 3);
        let job_id = service
            .job_service
            .create_job(None, config)
            .await
            .unwrap();

        // all three tasks run and finish through the loopback fleet
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        let mut done = false;
        while tokio::time::Instant::now() < deadline && !done {
            done = true;
            for i in 0..3 {
                let state = crate::storage::TaskStore::get_task_runtime(&*store, &job_id, i)
                    .await
                    .map(|runtime| runtime.state);
                if !matches!(state, Ok(TaskState::Succeeded)) {
                    done = false;
                }
            }
            if !done {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        assert!(done, "batch job did not finish in time");

        let runtime = store.get_job_runtime(&job_id).await.unwrap();
        assert_eq!(runtime.state, JobState::Pending);

        service.controller.lost_leadership();
    }

    #[tokio::test]
    async fn test_leadership_cycle_restarts_components() {
        let service = Service::new_dev(dev_config()).unwrap();
        service.controller.gained_leadership();
        service.controller.lost_leadership();
        // a second tenure must come up cleanly
        service.controller.gained_leadership();
        assert!(service.controller.is_leading());
        service.controller.lost_leadership();
    }
}
