use std::net::SocketAddr;

use anyhow::Result;
use figment::{
    providers::{Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port the HTTP API listens on.
    pub port: u16,
    /// Workers applying status updates through the tracker.
    pub db_write_concurrency: usize,
    pub offer_hold_time_sec: u64,
    pub offer_pruning_period_sec: u64,
    pub task_dequeue_limit: u32,
    pub offer_dequeue_limit: u32,
    pub recovery_interval_sec: u64,
    pub election: ElectionConfig,
    pub storage: StorageConfig,
    pub goal_state: GoalStateConfig,
    pub placement: PlacementConfig,
    pub tracing: TracingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5292,
            db_write_concurrency: 25,
            offer_hold_time_sec: 300,
            offer_pruning_period_sec: 60,
            task_dequeue_limit: 100,
            offer_dequeue_limit: 10,
            recovery_interval_sec: 900,
            election: ElectionConfig::default(),
            storage: StorageConfig::default(),
            goal_state: GoalStateConfig::default(),
            placement: PlacementConfig::default(),
            tracing: TracingConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ServerConfig = Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Yaml::string(&config_str))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if format!("0.0.0.0:{}", self.port).parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!("invalid listen port: {}", self.port));
        }
        if self.task_dequeue_limit == 0 {
            return Err(anyhow::anyhow!("task_dequeue_limit must be positive"));
        }
        if self.offer_dequeue_limit == 0 {
            return Err(anyhow::anyhow!("offer_dequeue_limit must be positive"));
        }
        if self.db_write_concurrency == 0 {
            return Err(anyhow::anyhow!("db_write_concurrency must be positive"));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

/// Leader election. The election service itself is external; these knobs
/// only describe how this instance registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    pub enabled: bool,
    pub zk_servers: Vec<String>,
    pub root: String,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            zk_servers: vec![],
            root: "/peloton".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage backend. `memory` keeps everything in process; anything else
    /// is provided by an external store implementation.
    pub backend: String,
    pub hosts: Vec<String>,
    pub keyspace: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            hosts: vec![],
            keyspace: "peloton".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalStateConfig {
    /// Workers per goal-state engine.
    pub engine_workers: usize,
    pub launch_timeout_sec: u64,
    pub max_launch_retries: u32,
    pub max_killing_attempts: u32,
    /// Restarts allowed before a failed task stays failed.
    pub failure_retry_limit: u32,
    pub failure_retry_delay_sec: u64,
    pub max_retry_delay_sec: u64,
    pub rpc_timeout_sec: u64,
    pub kill_rpc_timeout_sec: u64,
    pub stop_retry_delay_sec: u64,
    pub update_run_interval_sec: u64,
}

impl Default for GoalStateConfig {
    fn default() -> Self {
        Self {
            engine_workers: 500,
            launch_timeout_sec: 600,
            max_launch_retries: 3,
            max_killing_attempts: 5,
            failure_retry_limit: 3,
            failure_retry_delay_sec: 1,
            max_retry_delay_sec: 60,
            rpc_timeout_sec: 10,
            kill_rpc_timeout_sec: 5,
            stop_retry_delay_sec: 10,
            update_run_interval_sec: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Sleep between empty dequeues from the resource manager.
    pub task_dequeue_timeout_ms: u64,
    /// Sleep between empty offer-pool acquisitions.
    pub offer_wait_timeout_ms: u64,
    /// Offer acquisitions attempted per task batch before the tasks go back
    /// to the resource manager.
    pub offer_retry_limit: u32,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            task_dequeue_timeout_ms: 1000,
            offer_wait_timeout_ms: 1000,
            offer_retry_limit: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TracingConfig {
    /// Export OTLP metrics and spans.
    pub enabled: bool,
    /// Collector endpoint; falls back to OTEL_EXPORTER_OTLP_ENDPOINT.
    pub endpoint: Option<String>,
}
