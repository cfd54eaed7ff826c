//! The safety gate: five policy checks, fixed order, first block wins.
//!
//! 1. Protected parameter — reserved names (credentials, mode flags) may not
//!    be changed, directly or by a code patch rewriting the settings file.
//! 2. Protected file — production mode restricts code patches to the
//!    settings file; otherwise a fixed critical-file list is off limits.
//! 3. Blacklist — a body hash that failed before is blocked without
//!    re-validating anything.
//! 4. Structural pre-check — embedded source that cannot scan as well-formed
//!    is blacklisted and blocked: it can never succeed.
//! 5. Cooldown lock — a locked target or metric defers the proposal to a
//!    later pass; this is the only non-terminal block.
//!
//! A proposal that clears all five proceeds to sandboxing. The gate itself
//! performs no file I/O on the target tree; its only side effect is the
//! blacklist insertion in check 4.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::blacklist::Blacklist;
use crate::config::ManagerConfig;
use crate::locks::{location_key, LockManager};
use crate::scan::structural_scan;
use crate::schema::{LocationKind, PatchProposal};

/// Why the gate stopped a proposal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateBlock {
    #[error("parameter `{0}` is protected")]
    ProtectedParam(String),
    #[error("file `{0}` is not modifiable")]
    ProtectedFile(String),
    #[error("proposal body is blacklisted")]
    Blacklisted,
    #[error("embedded source rejected: {0}")]
    SyntaxRejected(String),
    #[error("target `{0}` is already in testing")]
    Locked(String),
}

impl GateBlock {
    /// Deferred blocks are retryable on a later pass; the rest are terminal
    /// for this exact body.
    pub fn is_deferral(&self) -> bool {
        matches!(self, GateBlock::Locked(_))
    }
}

pub struct SafetyGate {
    cfg: Arc<ManagerConfig>,
    blacklist: Arc<Blacklist>,
    locks: Arc<LockManager>,
}

impl SafetyGate {
    pub fn new(cfg: Arc<ManagerConfig>, blacklist: Arc<Blacklist>, locks: Arc<LockManager>) -> Self {
        Self {
            cfg,
            blacklist,
            locks,
        }
    }

    /// Run all five checks against a schema-valid proposal.
    /// `body_hash` is the canonical hash of the raw document.
    pub fn screen(&self, body_hash: &str, proposal: &PatchProposal) -> Result<(), GateBlock> {
        self.check_protected_param(proposal)?;
        self.check_protected_file(proposal)?;
        self.check_blacklist(body_hash)?;
        self.check_structure(body_hash, proposal)?;
        self.check_locks(proposal)?;
        info!(
            target: "autopatch::gate",
            file = proposal.target_file(),
            kind = proposal.kind_label(),
            "proposal cleared the safety gate"
        );
        Ok(())
    }

    fn check_protected_param(&self, proposal: &PatchProposal) -> Result<(), GateBlock> {
        match proposal {
            PatchProposal::ParamUpdate(p) => {
                if self.cfg.is_param_protected(&p.param_name) {
                    return Err(GateBlock::ProtectedParam(p.param_name.clone()));
                }
            }
            PatchProposal::CodePatch(p) => {
                // A code patch rewriting the settings file must not smuggle a
                // protected parameter in its new text.
                if p.target_file == self.cfg.settings_file {
                    if let Some(code) = p.modification.new_value.as_deref() {
                        for param in &self.cfg.protected_params {
                            if code.contains(param.as_str()) {
                                return Err(GateBlock::ProtectedParam(param.clone()));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn check_protected_file(&self, proposal: &PatchProposal) -> Result<(), GateBlock> {
        if let PatchProposal::CodePatch(p) = proposal {
            if self.cfg.is_file_protected(&p.target_file) {
                return Err(GateBlock::ProtectedFile(p.target_file.clone()));
            }
        }
        Ok(())
    }

    fn check_blacklist(&self, body_hash: &str) -> Result<(), GateBlock> {
        let banned = self.blacklist.contains(body_hash).unwrap_or_else(|e| {
            warn!(target: "autopatch::gate", error = %e, "blacklist read failed; treating as not banned");
            false
        });
        if banned {
            return Err(GateBlock::Blacklisted);
        }
        Ok(())
    }

    fn check_structure(&self, body_hash: &str, proposal: &PatchProposal) -> Result<(), GateBlock> {
        let Some(code) = proposal.new_source() else {
            return Ok(());
        };
        if let Err(issue) = structural_scan(code) {
            if let Err(e) = self.blacklist.insert(body_hash, &issue.to_string()) {
                warn!(target: "autopatch::gate", error = %e, "blacklist insert failed");
            }
            return Err(GateBlock::SyntaxRejected(issue.to_string()));
        }
        Ok(())
    }

    fn check_locks(&self, proposal: &PatchProposal) -> Result<(), GateBlock> {
        let mut keys: Vec<String> = Vec::new();
        match proposal {
            PatchProposal::ParamUpdate(p) => keys.push(p.param_name.clone()),
            PatchProposal::CodePatch(p) => {
                if p.modification.location.kind != LocationKind::FullFile {
                    keys.push(location_key(&p.target_file, &p.modification.location.value));
                } else {
                    keys.push(location_key(&p.target_file, "full_file"));
                }
            }
        }
        if let Some(metric) = proposal.metric() {
            keys.push(metric.to_string());
        }
        for key in keys {
            if self.locks.is_locked(&key) {
                return Err(GateBlock::Locked(key));
            }
        }
        Ok(())
    }

    /// Keys the orchestrator locks once a proposal is accepted into
    /// safety-gated processing.
    pub fn lock_keys(proposal: &PatchProposal) -> Vec<String> {
        let mut keys = Vec::new();
        match proposal {
            PatchProposal::ParamUpdate(p) => keys.push(p.param_name.clone()),
            PatchProposal::CodePatch(p) => {
                let loc = if p.modification.location.kind == LocationKind::FullFile {
                    "full_file"
                } else {
                    p.modification.location.value.as_str()
                };
                keys.push(location_key(&p.target_file, loc));
            }
        }
        if let Some(metric) = proposal.metric() {
            keys.push(metric.to_string());
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{validate, ProposalDoc};
    use std::time::Duration;

    fn fixture() -> (tempfile::TempDir, SafetyGate, Arc<Blacklist>, Arc<LockManager>) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("db")).unwrap();
        let blacklist = Arc::new(Blacklist::open(&db).unwrap());
        let locks = Arc::new(LockManager::new(Duration::from_secs(3600)));
        let cfg = Arc::new(ManagerConfig::default());
        let gate = SafetyGate::new(cfg, Arc::clone(&blacklist), Arc::clone(&locks));
        (dir, gate, blacklist, locks)
    }

    fn proposal(json: serde_json::Value) -> PatchProposal {
        let doc: ProposalDoc = serde_json::from_value(json).unwrap();
        validate(&doc, "settings.py").unwrap()
    }

    #[test]
    fn protected_param_blocked_first() {
        let (_d, gate, _bl, _locks) = fixture();
        let p = proposal(serde_json::json!({
            "modification_type": "param_update",
            "param_to_modify": "API_KEY",
            "new_value": "stolen",
        }));
        assert_eq!(
            gate.screen("h1", &p).unwrap_err(),
            GateBlock::ProtectedParam("API_KEY".into())
        );
    }

    #[test]
    fn settings_code_patch_with_protected_param_blocked() {
        let (_d, gate, _bl, _locks) = fixture();
        let p = proposal(serde_json::json!({
            "modification_type": "code_patch",
            "file": "settings.py",
            "modification": {
                "action": "replace",
                "location": {"type": "string", "value": "AUTO_APPLY_PATCHES"},
                "new_value": "AUTO_APPLY_PATCHES = True",
            },
        }));
        assert!(matches!(
            gate.screen("h2", &p).unwrap_err(),
            GateBlock::ProtectedParam(_)
        ));
    }

    #[test]
    fn protected_file_blocked() {
        let (_d, gate, _bl, _locks) = fixture();
        let p = proposal(serde_json::json!({
            "modification_type": "code_patch",
            "file": "supervisor.py",
            "modification": {
                "action": "delete",
                "location": {"type": "line", "value": 10},
            },
        }));
        assert_eq!(
            gate.screen("h3", &p).unwrap_err(),
            GateBlock::ProtectedFile("supervisor.py".into())
        );
    }

    #[test]
    fn bad_syntax_blacklists_and_blocks_resubmission() {
        let (_d, gate, bl, _locks) = fixture();
        let p = proposal(serde_json::json!({
            "modification_type": "code_patch",
            "file": "logic/entry.py",
            "modification": {
                "action": "replace",
                "location": {"type": "string", "value": "threshold"},
                "new_value": "def broken(:\n    return (",
            },
        }));
        assert!(matches!(
            gate.screen("h4", &p).unwrap_err(),
            GateBlock::SyntaxRejected(_)
        ));
        assert!(bl.contains("h4").unwrap());

        // Identical body comes back: blocked at the blacklist check, before
        // any re-validation.
        assert_eq!(gate.screen("h4", &p).unwrap_err(), GateBlock::Blacklisted);
    }

    #[test]
    fn locked_location_defers() {
        let (_d, gate, _bl, locks) = fixture();
        let p = proposal(serde_json::json!({
            "modification_type": "code_patch",
            "file": "logic/entry.py",
            "modification": {
                "action": "delete",
                "location": {"type": "line", "value": 42},
            },
        }));
        locks.acquire("logic/entry.py::42");
        let block = gate.screen("h5", &p).unwrap_err();
        assert_eq!(block, GateBlock::Locked("logic/entry.py::42".into()));
        assert!(block.is_deferral());
    }

    #[test]
    fn locked_metric_defers_param_update() {
        let (_d, gate, _bl, locks) = fixture();
        let p = proposal(serde_json::json!({
            "modification_type": "param_update",
            "param_to_modify": "MIN_LOT_SIZE",
            "new_value": 0.05,
            "metric": "WINRATE",
        }));
        locks.acquire("WINRATE");
        assert_eq!(
            gate.screen("h6", &p).unwrap_err(),
            GateBlock::Locked("WINRATE".into())
        );
    }

    #[test]
    fn clean_proposal_passes_and_lock_keys_cover_target_and_metric() {
        let (_d, gate, _bl, _locks) = fixture();
        let p = proposal(serde_json::json!({
            "modification_type": "code_patch",
            "file": "logic/entry.py",
            "metric": "WINRATE",
            "modification": {
                "action": "replace",
                "location": {"type": "string", "value": "threshold ="},
                "new_value": "threshold = 0.4",
            },
        }));
        assert!(gate.screen("h7", &p).is_ok());
        let keys = SafetyGate::lock_keys(&p);
        assert!(keys.contains(&"logic/entry.py::threshold =".to_string()));
        assert!(keys.contains(&"WINRATE".to_string()));
    }
}
