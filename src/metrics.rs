//! Metrics plumbing: one OTLP meter provider for the process plus typed
//! handles per subsystem.

use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    KeyValue,
};

use crate::goal_state::task_actions::TaskAction;

/// RAII guard recording elapsed seconds into a histogram when dropped.
pub struct Timer<'a> {
    histogram: &'a Histogram<f64>,
    labels: Vec<KeyValue>,
    start: Instant,
}

impl<'a> Timer<'a> {
    pub fn start_with_labels(histogram: &'a Histogram<f64>, labels: Vec<KeyValue>) -> Self {
        Self {
            histogram,
            labels,
            start: Instant::now(),
        }
    }
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        self.histogram
            .record(self.start.elapsed().as_secs_f64(), &self.labels);
    }
}

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0,
    ]
}

/// Installs the global OTLP meter provider when exporting is enabled.
pub fn init_provider(enabled: bool, endpoint: Option<&String>) -> Result<()> {
    if !enabled {
        return Ok(());
    }

    use opentelemetry_otlp::{MetricExporter, WithExportConfig};
    use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.clone());
    }
    let reader = PeriodicReader::builder(exporter.build()?)
        .with_interval(Duration::from_secs(30))
        .build();
    let provider = SdkMeterProvider::builder().with_reader(reader).build();
    global::set_meter_provider(provider);
    Ok(())
}

pub struct GoalStateMetrics {
    task_actions: Counter<u64>,
    action_duration: Histogram<f64>,
    pub update_runs: Counter<u64>,
}

impl GoalStateMetrics {
    pub fn new() -> Self {
        let meter = global::meter("peloton.goal_state");
        Self {
            task_actions: meter
                .u64_counter("peloton.goal_state.task_actions")
                .with_description("Task actions executed, by action")
                .build(),
            action_duration: meter
                .f64_histogram("peloton.goal_state.action_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("Task action run duration in seconds")
                .build(),
            update_runs: meter
                .u64_counter("peloton.goal_state.update_runs")
                .with_description("Rolling update evaluations")
                .build(),
        }
    }

    pub fn record_task_action(&self, action: TaskAction) {
        self.task_actions
            .add(1, &[KeyValue::new("action", action.to_string())]);
    }

    /// Guard timing one action run.
    pub fn action_timer(&self, action: TaskAction) -> Timer<'_> {
        Timer::start_with_labels(
            &self.action_duration,
            vec![KeyValue::new("action", action.to_string())],
        )
    }
}

impl Default for GoalStateMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PlacementMetrics {
    pub tasks_dequeued: Counter<u64>,
    pub offers_acquired: Counter<u64>,
    pub offers_starved: Counter<u64>,
    pub offers_expired: Counter<u64>,
    pub launches: Counter<u64>,
    pub launch_failures: Counter<u64>,
}

impl PlacementMetrics {
    pub fn new() -> Self {
        let meter = global::meter("peloton.placement");
        Self {
            tasks_dequeued: meter
                .u64_counter("peloton.placement.tasks_dequeued")
                .with_description("Tasks dequeued from the resource manager")
                .build(),
            offers_acquired: meter
                .u64_counter("peloton.placement.offers_acquired")
                .with_description("Offers taken from the pool")
                .build(),
            offers_starved: meter
                .u64_counter("peloton.placement.offers_starved")
                .with_description("Acquisition rounds that found no offers")
                .build(),
            offers_expired: meter
                .u64_counter("peloton.placement.offers_expired")
                .with_description("Offers pruned past their hold time")
                .build(),
            launches: meter
                .u64_counter("peloton.placement.launches")
                .with_description("Tasks handed to the host manager")
                .build(),
            launch_failures: meter
                .u64_counter("peloton.placement.launch_failures")
                .with_description("Launch calls that failed")
                .build(),
        }
    }
}

impl Default for PlacementMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RecoveryMetrics {
    pub jobs_recovered: Counter<u64>,
    pub jobs_recover_failed: Counter<u64>,
    pub tasks_created: Counter<u64>,
    pub tasks_requeued: Counter<u64>,
}

impl RecoveryMetrics {
    pub fn new() -> Self {
        let meter = global::meter("peloton.recovery");
        Self {
            jobs_recovered: meter
                .u64_counter("peloton.recovery.jobs_recovered")
                .with_description("Jobs recovered on leadership gain")
                .build(),
            jobs_recover_failed: meter
                .u64_counter("peloton.recovery.jobs_recover_failed")
                .with_description("Jobs whose recovery failed")
                .build(),
            tasks_created: meter
                .u64_counter("peloton.recovery.tasks_created")
                .with_description("Missing tasks created during recovery")
                .build(),
            tasks_requeued: meter
                .u64_counter("peloton.recovery.tasks_requeued")
                .with_description("Initialized tasks requeued during recovery")
                .build(),
        }
    }
}

impl Default for RecoveryMetrics {
    fn default() -> Self {
        Self::new()
    }
}
