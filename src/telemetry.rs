//! Logging setup. `RUST_LOG` controls the level; defaults to info.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(tracing::level_filters::LevelFilter::INFO.into()))
}

pub fn setup_logging() {
    let log_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_filter(env_filter());
    tracing_subscriber::registry().with(log_layer).init();
}
