//! Autopatch daemon entry point.
//!
//! A long-running orchestrator that polls the pending-proposal directory on
//! a fixed interval, drives each proposal through the pipeline, and
//! periodically confirms or rolls back applied patches against their metric
//! baselines. A crash-flag watcher runs alongside.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use autopatch_core::{FileMetrics, ManagerConfig};
use autopatch_daemon::supervisor::Supervisor;
use autopatch_daemon::watcher::watch_crash_flag;

#[tokio::main]
async fn main() {
    // Load .env if present (before any env::var reads).
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[autopatch-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Arc::new(ManagerConfig::load().expect("load ManagerConfig"));
    let db = sled::open(&cfg.store_path).expect("open autopatch store");
    let metrics = Arc::new(FileMetrics::new(cfg.metrics_file.clone()));

    let supervisor =
        Arc::new(Supervisor::new(Arc::clone(&cfg), &db, metrics).expect("build supervisor"));

    tokio::spawn(watch_crash_flag(Arc::clone(&cfg), supervisor.notifier()));

    tracing::info!(
        poll_interval_secs = cfg.poll_interval_secs,
        pending_dir = %cfg.pending_dir.display(),
        system_root = %cfg.system_root.display(),
        batch_mode = cfg.batch_mode,
        "autopatch daemon started"
    );
    supervisor
        .notifier()
        .send(&format!(
            "Autopatcher started. Polling every {}s.",
            cfg.poll_interval_secs
        ))
        .await;

    let mut interval = tokio::time::interval(Duration::from_secs(cfg.poll_interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let results = supervisor.run_pass().await;
                if !results.is_empty() {
                    tracing::info!(processed = results.len(), "orchestration pass complete");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down daemon");
                break;
            }
        }
    }

    if let Err(e) = supervisor.audit().flush() {
        tracing::warn!(error = %e, "final store flush failed");
    }
}
