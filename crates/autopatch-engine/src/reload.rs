//! Runtime reload controller: an explicit registry of hot-swappable units.
//!
//! The supervised system registers the units it has loaded; after a live
//! apply the controller swaps the affected unit's content digest and bumps
//! its generation in one write-lock section, and appends to a reload history.
//! Files in the critical set are never hot-swapped — patching one raises the
//! restart-required sentinel instead, and that outcome is surfaced
//! distinctly from a fully-live apply.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::Utc;
use tracing::{info, warn};

use autopatch_core::schema::sha256_hex;

/// Result of a reload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The unit was live and has been swapped in place.
    Reloaded { generation: u64 },
    /// The unit is not registered as loaded; nothing to swap.
    NotLoaded,
    /// Critical file: applied on disk, process restart required.
    RestartRequired,
}

/// One entry in the reload history.
#[derive(Debug, Clone)]
pub struct ReloadEvent {
    pub unit: String,
    pub generation: u64,
    pub at: String,
}

#[derive(Debug)]
struct UnitSlot {
    generation: u64,
    digest: String,
    swapped_at: String,
}

pub struct ReloadRegistry {
    critical: Vec<String>,
    restart_flag: PathBuf,
    units: RwLock<HashMap<String, UnitSlot>>,
    history: RwLock<Vec<ReloadEvent>>,
}

impl ReloadRegistry {
    pub fn new(critical: Vec<String>, restart_flag: PathBuf) -> Self {
        Self {
            critical,
            restart_flag,
            units: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
        }
    }

    /// Register a unit as currently loaded, at generation 1.
    pub fn register(&self, unit: &str, source: &str) {
        if let Ok(mut guard) = self.units.write() {
            guard.insert(
                unit.to_string(),
                UnitSlot {
                    generation: 1,
                    digest: sha256_hex(source.as_bytes()),
                    swapped_at: Utc::now().to_rfc3339(),
                },
            );
        }
    }

    pub fn is_registered(&self, unit: &str) -> bool {
        self.units
            .read()
            .map(|g| g.contains_key(unit))
            .unwrap_or(false)
    }

    /// Swap a unit after its file was patched on disk.
    pub fn reload(&self, unit: &str, system_root: &Path) -> Result<ReloadOutcome, std::io::Error> {
        if self.critical.iter().any(|crit| unit.contains(crit.as_str())) {
            std::fs::write(
                &self.restart_flag,
                format!("{} {}\n", Utc::now().to_rfc3339(), unit),
            )?;
            warn!(
                target: "autopatch::reload",
                unit,
                flag = %self.restart_flag.display(),
                "critical file patched; restart required"
            );
            return Ok(ReloadOutcome::RestartRequired);
        }

        let source = std::fs::read_to_string(system_root.join(unit))?;
        let digest = sha256_hex(source.as_bytes());

        let generation = {
            let Ok(mut guard) = self.units.write() else {
                return Ok(ReloadOutcome::NotLoaded);
            };
            let Some(slot) = guard.get_mut(unit) else {
                info!(target: "autopatch::reload", unit, "unit not loaded; no swap");
                return Ok(ReloadOutcome::NotLoaded);
            };
            slot.generation += 1;
            slot.digest = digest;
            slot.swapped_at = Utc::now().to_rfc3339();
            slot.generation
        };

        let event = ReloadEvent {
            unit: unit.to_string(),
            generation,
            at: Utc::now().to_rfc3339(),
        };
        if let Ok(mut history) = self.history.write() {
            history.push(event);
        }
        info!(target: "autopatch::reload", unit, generation, "unit hot-swapped");
        Ok(ReloadOutcome::Reloaded { generation })
    }

    /// Reloads performed so far, oldest first.
    pub fn history(&self) -> Vec<ReloadEvent> {
        self.history
            .read()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    pub fn current_generation(&self, unit: &str) -> Option<u64> {
        self.units
            .read()
            .ok()
            .and_then(|g| g.get(unit).map(|s| s.generation))
    }

    /// True while the restart sentinel is present.
    pub fn restart_required(&self) -> bool {
        self.restart_flag.exists()
    }

    /// Remove the sentinel once the supervised process has restarted.
    pub fn clear_restart_flag(&self) -> Result<bool, std::io::Error> {
        match std::fs::remove_file(&self.restart_flag) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &tempfile::TempDir) -> ReloadRegistry {
        ReloadRegistry::new(
            vec!["bot.py".into(), "supervisor.py".into(), "settings.py".into()],
            dir.path().join("restart_required.flag"),
        )
    }

    #[test]
    fn live_unit_swaps_and_records_history() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("system");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("logic.py"), "v1\n").unwrap();

        let reg = registry(&dir);
        reg.register("logic.py", "v1\n");
        assert_eq!(reg.current_generation("logic.py"), Some(1));

        std::fs::write(root.join("logic.py"), "v2\n").unwrap();
        let outcome = reg.reload("logic.py", &root).unwrap();
        assert_eq!(outcome, ReloadOutcome::Reloaded { generation: 2 });
        let history = reg.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].unit, "logic.py");
        assert_eq!(history[0].generation, 2);
    }

    #[test]
    fn unregistered_unit_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("system");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("logic.py"), "v1\n").unwrap();

        let reg = registry(&dir);
        assert_eq!(reg.reload("logic.py", &root).unwrap(), ReloadOutcome::NotLoaded);
        assert!(reg.history().is_empty());
    }

    #[test]
    fn critical_file_raises_the_restart_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("system");
        std::fs::create_dir_all(&root).unwrap();

        let reg = registry(&dir);
        reg.register("core/settings.py", "x = 1\n");
        let outcome = reg.reload("core/settings.py", &root).unwrap();
        assert_eq!(outcome, ReloadOutcome::RestartRequired);
        assert!(reg.restart_required());
        // Generation untouched: the unit was not swapped.
        assert_eq!(reg.current_generation("core/settings.py"), Some(1));

        assert!(reg.clear_restart_flag().unwrap());
        assert!(!reg.restart_required());
        assert!(!reg.clear_restart_flag().unwrap());
    }
}
