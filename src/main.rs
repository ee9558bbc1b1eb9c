//! The cluster network operator.
//!
//! Before any reconciliation is performed, the operator acquires a cluster-wide leader lock so
//! that only one replica acts as the primary instance.

mod app;
mod config;
mod error;
#[cfg(test)]
mod fixtures;
mod k8s;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Arc::new(Config::new()?);

    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the configured directives.
        .with(tracing_subscriber::EnvFilter::new(&cfg.rust_log))
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let recorder = build_metrics_recorder(&cfg);
    metrics::set_recorder(recorder).context("error setting prometheus metrics recorder")?;

    tracing::info!(
        lock_name = %cfg.lock_name,
        pod_name = ?cfg.pod_name,
        run_mode = ?cfg.run_mode,
        version = env!("CARGO_PKG_VERSION"),
        "starting network operator",
    );
    let res = App::new(cfg).await?.spawn().await.context("error joining app task").and_then(|res| res);
    if let Err(err) = &res {
        tracing::error!(error = ?err);
    }

    // No scrape endpoint is served during bootstrap, so leave a final snapshot in the logs.
    tracing::debug!(metrics = %recorder.handle().render(), "final metrics snapshot");

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    res
}

/// Build the process-wide metrics recorder.
fn build_metrics_recorder(config: &Config) -> &'static PrometheusRecorder {
    let mut builder = PrometheusBuilder::new().add_global_label("lock", config.lock_name.clone());
    if let Some(pod_name) = config.pod_name.as_ref() {
        builder = builder.add_global_label("pod", pod_name.clone());
    }
    Box::leak(Box::new(builder.build()))
}
