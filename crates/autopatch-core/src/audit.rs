//! Durable audit store and the human-readable integration trail.
//!
//! Two sled trees: `patches` holds one row per applied patch (forward and
//! reverse bodies, status), `snapshots` holds metric baselines captured at
//! apply time. Row ids come from sled's monotonic id allocator and rows are
//! never deleted — the only mutation ever performed on a past row is a status
//! transition.
//!
//! Alongside the store, [`IntegrationTrail`] writes the per-proposal text
//! reports and the append-only `integration_errors.log` consumed by
//! operators; proposals that never reach "applied" only ever appear there.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Storage-layer failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Sled(#[from] sled::Error),
    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Lifecycle status of an applied patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchStatus {
    /// Applied, metric-tied, awaiting the confirmation window.
    Pending,
    /// Applied with no metric to confirm against.
    Applied,
    /// Confirmed: the tied metric improved over its baseline.
    Success,
    /// Reversed after the confirmation window.
    Rollback,
}

impl fmt::Display for PatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchStatus::Pending => write!(f, "pending"),
            PatchStatus::Applied => write!(f, "applied"),
            PatchStatus::Success => write!(f, "success"),
            PatchStatus::Rollback => write!(f, "rollback"),
        }
    }
}

/// One audit row per applied patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchRecord {
    pub id: u64,
    pub timestamp: String,
    pub file: String,
    pub metric: String,
    /// Serialized forward proposal, exactly as validated.
    pub proposal: serde_json::Value,
    /// Serialized reverse patch derived at apply time.
    pub reverse: serde_json::Value,
    pub status: PatchStatus,
}

/// Point-in-time metric value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: u64,
    pub timestamp: String,
    pub metric: String,
    pub value: f64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Append-only audit store over sled.
pub struct AuditStore {
    db: sled::Db,
    patches: sled::Tree,
    snapshots: sled::Tree,
}

impl AuditStore {
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            db: db.clone(),
            patches: db.open_tree("patches")?,
            snapshots: db.open_tree("snapshots")?,
        })
    }

    /// Append a patch row; returns the assigned monotonic id.
    pub fn log_patch(
        &self,
        file: &str,
        metric: &str,
        proposal: &serde_json::Value,
        reverse: &serde_json::Value,
        status: PatchStatus,
    ) -> Result<u64, StoreError> {
        let id = self.db.generate_id()?;
        let record = PatchRecord {
            id,
            timestamp: Utc::now().to_rfc3339(),
            file: file.to_string(),
            metric: metric.to_string(),
            proposal: proposal.clone(),
            reverse: reverse.clone(),
            status,
        };
        self.patches
            .insert(id.to_be_bytes(), serde_json::to_vec(&record)?)?;
        info!(target: "autopatch::audit", id, file, metric, status = %status, "patch recorded");
        Ok(id)
    }

    /// Transition the status of an existing row. Returns false if the id is
    /// unknown.
    pub fn mark_status(&self, id: u64, status: PatchStatus) -> Result<bool, StoreError> {
        let Some(bytes) = self.patches.get(id.to_be_bytes())? else {
            warn!(target: "autopatch::audit", id, "status transition for unknown patch id");
            return Ok(false);
        };
        let mut record: PatchRecord = serde_json::from_slice(&bytes)?;
        record.status = status;
        self.patches
            .insert(id.to_be_bytes(), serde_json::to_vec(&record)?)?;
        info!(target: "autopatch::audit", id, status = %status, "patch status updated");
        Ok(true)
    }

    pub fn get(&self, id: u64) -> Result<Option<PatchRecord>, StoreError> {
        match self.patches.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Most recent row for `metric`, optionally filtered by status.
    pub fn latest_for_metric(
        &self,
        metric: &str,
        status: Option<PatchStatus>,
    ) -> Result<Option<PatchRecord>, StoreError> {
        for item in self.patches.iter().rev() {
            let (_, bytes) = item?;
            let record: PatchRecord = serde_json::from_slice(&bytes)?;
            if record.metric == metric && status.map_or(true, |s| record.status == s) {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// All rows currently in the given status, oldest first.
    pub fn with_status(&self, status: PatchStatus) -> Result<Vec<PatchRecord>, StoreError> {
        let mut out = Vec::new();
        for item in self.patches.iter() {
            let (_, bytes) = item?;
            let record: PatchRecord = serde_json::from_slice(&bytes)?;
            if record.status == status {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Append a metric baseline snapshot.
    pub fn log_snapshot(&self, metric: &str, value: f64) -> Result<u64, StoreError> {
        let id = self.db.generate_id()?;
        let snapshot = Snapshot {
            id,
            timestamp: Utc::now().to_rfc3339(),
            metric: metric.to_uppercase(),
            value,
        };
        self.snapshots
            .insert(id.to_be_bytes(), serde_json::to_vec(&snapshot)?)?;
        Ok(id)
    }

    /// Most recent snapshot for `metric`.
    pub fn latest_snapshot(&self, metric: &str) -> Result<Option<Snapshot>, StoreError> {
        let wanted = metric.to_uppercase();
        for item in self.snapshots.iter().rev() {
            let (_, bytes) = item?;
            let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
            if snapshot.metric == wanted {
                return Ok(Some(snapshot));
            }
        }
        Ok(None)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Integration trail
// ---------------------------------------------------------------------------

/// Fields of one human-readable integration report.
#[derive(Debug, Clone, Default)]
pub struct ReportFields<'a> {
    pub source: &'a str,
    pub engine: &'a str,
    pub patch_kind: &'a str,
    pub file: &'a str,
    pub match_type: &'a str,
    pub location: &'a str,
    pub param: Option<&'a str>,
    pub old_value: Option<&'a str>,
    pub new_value: Option<&'a str>,
    pub reason: &'a str,
}

/// Writer for the per-run text reports and the error trail.
pub struct IntegrationTrail {
    logs_dir: PathBuf,
}

impl IntegrationTrail {
    pub fn new(logs_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(logs_dir)?;
        Ok(Self {
            logs_dir: logs_dir.to_path_buf(),
        })
    }

    /// Write one detailed report file for an integration attempt.
    pub fn write_report(&self, fields: &ReportFields<'_>) -> Result<PathBuf, StoreError> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let source_stem = fields.source.trim_end_matches(".json");
        let path = self
            .logs_dir
            .join(format!("integration_{}_{}.txt", stamp, source_stem));

        let mut body = String::new();
        body.push_str("=== PATCH INTEGRATION ===\n");
        body.push_str(&format!("Timestamp        : {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S")));
        body.push_str(&format!("Source proposal  : {}\n", fields.source));
        body.push_str(&format!("Engine           : {}\n", fields.engine));
        body.push_str(&format!("Patch kind       : {}\n", fields.patch_kind));
        body.push_str(&format!("Target file      : {}\n", fields.file));
        body.push_str(&format!("Match type       : {}\n", fields.match_type));
        body.push_str(&format!("Location / line  : {}\n", fields.location));
        if let Some(param) = fields.param {
            body.push_str(&format!("Parameter        : {}\n", param));
        }
        if let Some(old) = fields.old_value {
            body.push_str(&format!("Previous value   : {}\n", old));
        }
        if let Some(new) = fields.new_value {
            body.push_str(&format!("New value        : {}\n", new));
        }
        body.push_str("\nReason:\n");
        for line in fields.reason.lines() {
            body.push_str(&format!("  {}\n", line));
        }
        body.push_str("\n========================\n");

        std::fs::write(&path, body)?;
        info!(target: "autopatch::audit", path = %path.display(), "integration report written");
        Ok(path)
    }

    /// Append one line to the error trail.
    pub fn log_error(&self, subject: &str, message: &str) {
        let path = self.logs_dir.join("integration_errors.log");
        let line = format!(
            "[{}] {}: {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            subject,
            message
        );
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!(target: "autopatch::audit", error = %e, "error trail write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, AuditStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("db")).unwrap();
        let store = AuditStore::open(&db).unwrap();
        (dir, store)
    }

    #[test]
    fn ids_are_monotonic_and_rows_survive_status_transitions() {
        let (_dir, store) = open_store();
        let p = serde_json::json!({"kind": "code_patch"});
        let r = serde_json::json!({"kind": "code_patch", "reverse": true});

        let a = store.log_patch("a.py", "WINRATE", &p, &r, PatchStatus::Pending).unwrap();
        let b = store.log_patch("b.py", "WINRATE", &p, &r, PatchStatus::Applied).unwrap();
        assert!(b > a);

        assert!(store.mark_status(a, PatchStatus::Rollback).unwrap());
        let rec = store.get(a).unwrap().unwrap();
        assert_eq!(rec.status, PatchStatus::Rollback);
        assert_eq!(rec.file, "a.py");
        assert_eq!(rec.reverse, r);
        assert!(!store.mark_status(9999, PatchStatus::Success).unwrap());
    }

    #[test]
    fn latest_for_metric_picks_newest_matching() {
        let (_dir, store) = open_store();
        let p = serde_json::json!({});
        store.log_patch("a.py", "WINRATE", &p, &p, PatchStatus::Success).unwrap();
        let newest = store.log_patch("b.py", "WINRATE", &p, &p, PatchStatus::Pending).unwrap();
        store.log_patch("c.py", "PRECISION", &p, &p, PatchStatus::Pending).unwrap();

        let found = store.latest_for_metric("WINRATE", None).unwrap().unwrap();
        assert_eq!(found.id, newest);
        let found = store
            .latest_for_metric("WINRATE", Some(PatchStatus::Success))
            .unwrap()
            .unwrap();
        assert_eq!(found.file, "a.py");
        assert!(store.latest_for_metric("UNKNOWN", None).unwrap().is_none());
    }

    #[test]
    fn with_status_returns_oldest_first() {
        let (_dir, store) = open_store();
        let p = serde_json::json!({});
        let a = store.log_patch("a.py", "M", &p, &p, PatchStatus::Pending).unwrap();
        let b = store.log_patch("b.py", "M", &p, &p, PatchStatus::Pending).unwrap();
        store.log_patch("c.py", "M", &p, &p, PatchStatus::Applied).unwrap();

        let pending = store.with_status(PatchStatus::Pending).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, a);
        assert_eq!(pending[1].id, b);
    }

    #[test]
    fn snapshot_lookup_is_case_insensitive_and_newest() {
        let (_dir, store) = open_store();
        store.log_snapshot("winrate", 0.55).unwrap();
        store.log_snapshot("WINRATE", 0.61).unwrap();
        let snap = store.latest_snapshot("WinRate").unwrap().unwrap();
        assert_eq!(snap.value, 0.61);
        assert_eq!(snap.metric, "WINRATE");
    }

    #[test]
    fn trail_writes_report_and_error_lines() {
        let dir = tempfile::tempdir().unwrap();
        let trail = IntegrationTrail::new(dir.path()).unwrap();
        let path = trail
            .write_report(&ReportFields {
                source: "patch_001.json",
                engine: "gpt-4-turbo",
                patch_kind: "param_update",
                file: "settings.py",
                match_type: "param",
                location: "12",
                param: Some("MIN_LOT_SIZE"),
                old_value: Some("MIN_LOT_SIZE = 0.01"),
                new_value: Some("MIN_LOT_SIZE = 0.05"),
                reason: "raise minimum lot\nsecond line",
            })
            .unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("Parameter        : MIN_LOT_SIZE"));
        assert!(body.contains("  second line"));

        trail.log_error("patch_002.json", "old_value mismatch");
        let errors =
            std::fs::read_to_string(dir.path().join("integration_errors.log")).unwrap();
        assert!(errors.contains("patch_002.json: old_value mismatch"));
    }
}
