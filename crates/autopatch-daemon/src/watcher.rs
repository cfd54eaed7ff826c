//! Crash-flag watcher.
//!
//! The supervised system (or its process supervisor) raises a sentinel file
//! when it goes down; this task polls for it and reports the transition both
//! ways. Restart sequencing itself is external — the watcher only surfaces
//! the signal.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use autopatch_core::config::ManagerConfig;
use autopatch_core::notify::Notifier;

pub async fn watch_crash_flag(cfg: Arc<ManagerConfig>, notifier: Arc<Notifier>) {
    let mut interval = tokio::time::interval(Duration::from_secs(cfg.crash_poll_secs.max(1)));
    let mut was_present = cfg.crash_flag.exists();

    loop {
        interval.tick().await;
        let present = cfg.crash_flag.exists();
        if present && !was_present {
            warn!(
                target: "autopatch::watcher",
                flag = %cfg.crash_flag.display(),
                "crash flag detected"
            );
            notifier
                .send("Crash flag detected: the supervised system is down and needs a restart.")
                .await;
        } else if !present && was_present {
            info!(target: "autopatch::watcher", "crash flag cleared");
            notifier.send("Crash flag cleared: supervised system recovered.").await;
        }
        was_present = present;
    }
}
