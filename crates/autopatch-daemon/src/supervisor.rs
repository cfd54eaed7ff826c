//! The per-proposal pipeline and the confirmation/rollback pass.
//!
//! Stage order is fixed and never reordered: schema → safety gate → sandbox
//! → apply → post-validate → reload → audit. A proposal that reaches a
//! terminal outcome (applied, or permanently blocked) is moved to the
//! processed directory; deferrals and sandbox failures stay queued for the
//! next pass. Locks are taken the moment a proposal clears the gate and are
//! only released by the confirmation pass — a failed patch keeps its
//! cooldown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{error, info, warn};

use autopatch_core::audit::{
    AuditStore, IntegrationTrail, PatchRecord, PatchStatus, ReportFields, StoreError,
};
use autopatch_core::blacklist::Blacklist;
use autopatch_core::config::ManagerConfig;
use autopatch_core::gate::{GateBlock, SafetyGate};
use autopatch_core::locks::LockManager;
use autopatch_core::metrics::MetricsSource;
use autopatch_core::notify::Notifier;
use autopatch_core::schema::{
    self, canonical_hash, CodePatch, LocationKind, Modification, ParamUpdate, PatchProposal,
    ProposalDoc,
};
use autopatch_core::settings::SettingsStore;
use autopatch_engine::{
    apply_modification, apply_param_update, reverse_modification, run_sandbox_trial,
    validate_live_file, AppliedEdit, ApplyOutcome, ReloadOutcome, ReloadRegistry,
};

use crate::batch;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Terminal or deferred classification of one proposal, per pass.
#[derive(Debug, Clone, PartialEq)]
pub enum ProposalOutcome {
    /// Malformed document; never logged to the audit store.
    SchemaInvalid(String),
    /// Protected parameter/file or production-mode restriction.
    PolicyBlocked(String),
    /// Body hash previously banned.
    Blacklisted,
    /// Embedded source failed the structural pre-check; now blacklisted.
    SyntaxRejected(String),
    /// Cooldown lock active; retried on a later pass.
    Deferred(String),
    /// Trial failed; stays queued for external re-generation.
    SandboxFailed(String),
    /// The real edit failed or had no effect; not retried.
    ApplyFailed(String),
    /// Applied but unloadable; manual intervention, no auto-rollback.
    PostValidateFailed { record_id: u64 },
    Applied {
        record_id: u64,
        restart_required: bool,
    },
}

impl ProposalOutcome {
    /// Terminal outcomes move the proposal file to the processed directory.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ProposalOutcome::Deferred(_) | ProposalOutcome::SandboxFailed(_)
        )
    }
}

/// One pending proposal file, as listed from the intake directory.
#[derive(Debug, Clone)]
pub struct QueuedProposal {
    pub name: String,
    pub path: PathBuf,
    pub raw: serde_json::Value,
    pub parse_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor {
    cfg: Arc<ManagerConfig>,
    locks: Arc<LockManager>,
    blacklist: Arc<Blacklist>,
    audit: AuditStore,
    gate: SafetyGate,
    notifier: Arc<Notifier>,
    reload: ReloadRegistry,
    settings: SettingsStore,
    metrics: Arc<dyn MetricsSource>,
    trail: IntegrationTrail,
    /// Monitoring cycles elapsed per pending record id.
    confirm_cycles: Mutex<HashMap<u64, u32>>,
    /// Rollback attempts per record id; never silently more than two.
    rollback_attempts: Mutex<HashMap<u64, u32>>,
}

impl Supervisor {
    pub fn new(
        cfg: Arc<ManagerConfig>,
        db: &sled::Db,
        metrics: Arc<dyn MetricsSource>,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&cfg.pending_dir)?;
        std::fs::create_dir_all(&cfg.processed_dir)?;

        let locks = Arc::new(LockManager::new(Duration::from_secs(cfg.cooldown_secs)));
        let blacklist = Arc::new(Blacklist::open(db)?);
        let audit = AuditStore::open(db)?;
        let gate = SafetyGate::new(Arc::clone(&cfg), Arc::clone(&blacklist), Arc::clone(&locks));
        let notifier = Arc::new(Notifier::new(cfg.notifier.clone()));
        let reload = ReloadRegistry::new(cfg.critical_restart_files.clone(), cfg.restart_flag.clone());
        let settings = SettingsStore::open(&cfg.system_root.join(&cfg.settings_file))?;
        let trail = IntegrationTrail::new(&cfg.logs_dir)?;

        Ok(Self {
            cfg,
            locks,
            blacklist,
            audit,
            gate,
            notifier,
            reload,
            settings,
            metrics,
            trail,
            confirm_cycles: Mutex::new(HashMap::new()),
            rollback_attempts: Mutex::new(HashMap::new()),
        })
    }

    pub fn audit(&self) -> &AuditStore {
        &self.audit
    }
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }
    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }
    pub fn reload_registry(&self) -> &ReloadRegistry {
        &self.reload
    }
    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }
    pub fn notifier(&self) -> Arc<Notifier> {
        Arc::clone(&self.notifier)
    }

    // -----------------------------------------------------------------------
    // Pass driver
    // -----------------------------------------------------------------------

    /// One orchestration pass: drain the queue, then re-evaluate pending
    /// confirmations. Never fails — internal errors degrade to logged skips.
    pub async fn run_pass(&self) -> Vec<(String, ProposalOutcome)> {
        let queue = self.load_queue();
        let selected = if self.cfg.batch_mode {
            batch::select_batch(queue, &self.cfg.metric_priority, &self.locks)
        } else {
            queue
        };

        let mut results = Vec::new();
        for q in selected {
            let outcome = self.process_proposal(&q).await;
            self.finalize(&q, &outcome);
            results.push((q.name, outcome));
        }

        self.confirmation_pass().await;
        results
    }

    /// Pending proposals in listing order.
    fn load_queue(&self) -> Vec<QueuedProposal> {
        let entries = match std::fs::read_dir(&self.cfg.pending_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(target: "autopatch::supervisor", error = %e, "pending directory unreadable");
                return Vec::new();
            }
        };
        let mut listed: Vec<(String, PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                let name = path.file_name()?.to_str()?.to_string();
                name.ends_with(".json").then_some((name, path))
            })
            .collect();
        listed.sort();

        listed
            .into_iter()
            .map(|(name, path)| match std::fs::read_to_string(&path) {
                Ok(text) => match serde_json::from_str(&text) {
                    Ok(raw) => QueuedProposal {
                        name,
                        path,
                        raw,
                        parse_error: None,
                    },
                    Err(e) => QueuedProposal {
                        name,
                        path,
                        raw: serde_json::Value::Null,
                        parse_error: Some(e.to_string()),
                    },
                },
                Err(e) => QueuedProposal {
                    name,
                    path,
                    raw: serde_json::Value::Null,
                    parse_error: Some(e.to_string()),
                },
            })
            .collect()
    }

    fn finalize(&self, q: &QueuedProposal, outcome: &ProposalOutcome) {
        info!(
            target: "autopatch::supervisor",
            name = %q.name,
            outcome = ?outcome,
            "proposal processed"
        );
        if !outcome.is_terminal() {
            return;
        }
        let dest = self.cfg.processed_dir.join(&q.name);
        if let Err(e) = std::fs::rename(&q.path, &dest) {
            warn!(target: "autopatch::supervisor", name = %q.name, error = %e, "could not move proposal to processed");
        }
    }

    // -----------------------------------------------------------------------
    // Per-proposal pipeline
    // -----------------------------------------------------------------------

    async fn process_proposal(&self, q: &QueuedProposal) -> ProposalOutcome {
        if let Some(err) = &q.parse_error {
            self.trail
                .log_error(&q.name, &format!("unreadable proposal: {}", err));
            self.notify(format!("Proposal `{}` rejected: malformed document.", q.name))
                .await;
            return ProposalOutcome::SchemaInvalid(err.clone());
        }

        let doc: ProposalDoc = match serde_json::from_value(q.raw.clone()) {
            Ok(doc) => doc,
            Err(e) => {
                self.trail.log_error(&q.name, &e.to_string());
                self.notify(format!("Proposal `{}` rejected: {}", q.name, e)).await;
                return ProposalOutcome::SchemaInvalid(e.to_string());
            }
        };
        let proposal = match schema::validate(&doc, &self.cfg.settings_file) {
            Ok(p) => p,
            Err(e) => {
                self.trail.log_error(&q.name, &e.to_string());
                self.notify(format!("Proposal `{}` rejected: {}", q.name, e)).await;
                return ProposalOutcome::SchemaInvalid(e.to_string());
            }
        };

        let body_hash = canonical_hash(&q.raw);
        if let Err(block) = self.gate.screen(&body_hash, &proposal) {
            return self.handle_block(q, block).await;
        }

        // Baseline first: the metric lock lands right after and must not
        // suppress the snapshot.
        self.capture_baseline(&proposal);
        for key in SafetyGate::lock_keys(&proposal) {
            self.locks.acquire(&key);
        }

        match &proposal {
            PatchProposal::ParamUpdate(p) => self.apply_param(q, &proposal, p).await,
            PatchProposal::CodePatch(p) => self.apply_code(q, &proposal, p).await,
        }
    }

    async fn handle_block(&self, q: &QueuedProposal, block: GateBlock) -> ProposalOutcome {
        match block {
            GateBlock::Locked(key) => {
                info!(target: "autopatch::supervisor", name = %q.name, key = %key, "deferred: target already in testing");
                ProposalOutcome::Deferred(key)
            }
            GateBlock::Blacklisted => {
                self.notify(format!("Proposal `{}` already failed in the past. Skipped.", q.name))
                    .await;
                ProposalOutcome::Blacklisted
            }
            GateBlock::SyntaxRejected(msg) => {
                self.trail
                    .log_error(&q.name, &format!("structural pre-check failed: {}", msg));
                self.notify(format!(
                    "Proposal `{}` rejected: embedded code is not valid. Blacklisted.",
                    q.name
                ))
                .await;
                ProposalOutcome::SyntaxRejected(msg)
            }
            GateBlock::ProtectedParam(param) => {
                self.notify(format!(
                    "Parameter `{}` is protected. Proposal `{}` blocked.",
                    param, q.name
                ))
                .await;
                ProposalOutcome::PolicyBlocked(format!("protected parameter {}", param))
            }
            GateBlock::ProtectedFile(file) => {
                self.notify(format!(
                    "File `{}` is not modifiable. Proposal `{}` blocked.",
                    file, q.name
                ))
                .await;
                ProposalOutcome::PolicyBlocked(format!("protected file {}", file))
            }
        }
    }

    /// Record the live value of the proposal's metric as the comparison
    /// baseline, immediately before apply.
    fn capture_baseline(&self, proposal: &PatchProposal) {
        let Some(metric) = proposal.metric() else {
            return;
        };
        match self.metrics.current_value(metric) {
            Some(value) => {
                if let Err(e) = self.audit.log_snapshot(metric, value) {
                    warn!(target: "autopatch::supervisor", error = %e, metric, "baseline snapshot write failed");
                }
            }
            None => {
                warn!(target: "autopatch::supervisor", metric, "no live value; baseline not captured");
            }
        }
    }

    async fn apply_param(
        &self,
        q: &QueuedProposal,
        proposal: &PatchProposal,
        p: &ParamUpdate,
    ) -> ProposalOutcome {
        let edit = match apply_param_update(
            &self.cfg.system_root,
            &p.target_file,
            &p.param_name,
            &p.new_value,
        ) {
            Err(e) => {
                self.trail.log_error(
                    &p.param_name,
                    &format!("parameter update failed ({}): {}", e.reason_code(), e),
                );
                return ProposalOutcome::ApplyFailed(e.to_string());
            }
            Ok(ApplyOutcome::NoChange(reason)) => {
                self.trail.log_error(
                    &p.param_name,
                    &format!("parameter not found or no effect ({})", reason),
                );
                return ProposalOutcome::ApplyFailed(format!("no_change: {}", reason));
            }
            Ok(ApplyOutcome::Applied(edit)) => edit,
        };

        if let Err(e) = self.settings.reload() {
            warn!(target: "autopatch::supervisor", error = %e, "settings version publish failed");
        }
        let record_id = self.record_applied(q, proposal, &edit, "param");
        self.notify(format!(
            "Parameter `{}` updated via `{}`.",
            p.param_name, q.name
        ))
        .await;
        ProposalOutcome::Applied {
            record_id,
            restart_required: false,
        }
    }

    async fn apply_code(
        &self,
        q: &QueuedProposal,
        proposal: &PatchProposal,
        p: &CodePatch,
    ) -> ProposalOutcome {
        // Sandbox strictly precedes any mutation of the live file.
        if let Err(failure) = run_sandbox_trial(&self.cfg.toolchain, &self.cfg.system_root, p).await
        {
            if let Some(fallback) = &failure.fallback {
                if let Ok(json) = serde_json::to_string(fallback) {
                    self.trail
                        .log_error(&q.name, &format!("fallback context: {}", json));
                }
            }
            self.trail.log_error(
                &q.name,
                &format!("sandbox {} failure: {}", failure.reason, failure.error),
            );
            self.notify(format!("Sandbox failed for `{}`: {}", q.name, failure.error))
                .await;
            return ProposalOutcome::SandboxFailed(failure.error);
        }

        let edit = match apply_modification(&self.cfg.system_root, &p.target_file, &p.modification)
        {
            Err(e) => {
                self.trail.log_error(
                    &p.target_file,
                    &format!("apply failed ({}): {}", e.reason_code(), e),
                );
                return ProposalOutcome::ApplyFailed(e.to_string());
            }
            Ok(ApplyOutcome::NoChange(reason)) => {
                self.trail
                    .log_error(&p.target_file, &format!("no change applied ({})", reason));
                return ProposalOutcome::ApplyFailed(format!("no_change: {}", reason));
            }
            Ok(ApplyOutcome::Applied(edit)) => edit,
        };

        if p.target_file == self.cfg.settings_file {
            if let Err(e) = self.settings.reload() {
                warn!(target: "autopatch::supervisor", error = %e, "settings version publish failed");
            }
        }

        let live_path = self.cfg.system_root.join(&p.target_file);
        if let Err(e) = validate_live_file(&self.cfg.toolchain, &live_path).await {
            let mode = edit.mode.to_string();
            let record_id = self.record_applied(q, proposal, &edit, &mode);
            self.trail.log_error(
                &p.target_file,
                &format!("post-apply validation failed: {}", e),
            );
            self.notify(format!(
                "Patch `{}` applied but failed post-validation: {}. Manual intervention required.",
                q.name, e
            ))
            .await;
            return ProposalOutcome::PostValidateFailed { record_id };
        }

        let mode = edit.mode.to_string();
        let record_id = self.record_applied(q, proposal, &edit, &mode);

        let restart_required = match self.reload.reload(&p.target_file, &self.cfg.system_root) {
            Ok(ReloadOutcome::RestartRequired) => true,
            Ok(ReloadOutcome::Reloaded { generation }) => {
                info!(target: "autopatch::supervisor", file = %p.target_file, generation, "unit reloaded live");
                false
            }
            Ok(ReloadOutcome::NotLoaded) => false,
            Err(e) => {
                warn!(target: "autopatch::supervisor", file = %p.target_file, error = %e, "reload failed");
                false
            }
        };

        if restart_required {
            self.notify(format!(
                "Patch `{}` applied; restart required to activate `{}`.",
                q.name, p.target_file
            ))
            .await;
        } else {
            self.notify(format!("Patch `{}` applied successfully.", q.name))
                .await;
        }
        ProposalOutcome::Applied {
            record_id,
            restart_required,
        }
    }

    /// Persist the audit row (forward + engine-derived reverse) and write the
    /// integration report. Returns the record id (0 if the store failed).
    fn record_applied(
        &self,
        q: &QueuedProposal,
        proposal: &PatchProposal,
        edit: &AppliedEdit,
        match_type: &str,
    ) -> u64 {
        let reverse = reverse_modification(edit);
        let reverse_doc = serde_json::json!({
            "file": edit.file,
            "modification": reverse,
        });
        let proposal_json = serde_json::to_value(proposal).unwrap_or(serde_json::Value::Null);
        let status = if proposal.metric().is_some() {
            PatchStatus::Pending
        } else {
            PatchStatus::Applied
        };

        let record_id = match self.audit.log_patch(
            proposal.target_file(),
            &proposal.metric_label(),
            &proposal_json,
            &reverse_doc,
            status,
        ) {
            Ok(id) => id,
            Err(e) => {
                error!(target: "autopatch::supervisor", error = %e, "audit write failed");
                0
            }
        };

        let location = edit
            .line
            .map(|l| l.to_string())
            .unwrap_or_else(|| edit.location_label.clone());
        let full_file = edit.mode == LocationKind::FullFile;
        let report = ReportFields {
            source: &q.name,
            engine: proposal.engine_used(),
            patch_kind: proposal.kind_label(),
            file: proposal.target_file(),
            match_type,
            location: &location,
            param: match proposal {
                PatchProposal::ParamUpdate(p) => Some(p.param_name.as_str()),
                PatchProposal::CodePatch(_) => None,
            },
            old_value: if full_file {
                Some("(entire file)")
            } else {
                edit.old_text.as_deref()
            },
            new_value: if full_file {
                Some("(replaced)")
            } else {
                edit.new_text.as_deref()
            },
            reason: proposal.reason(),
        };
        if let Err(e) = self.trail.write_report(&report) {
            warn!(target: "autopatch::supervisor", error = %e, "integration report write failed");
        }
        record_id
    }

    // -----------------------------------------------------------------------
    // Confirmation / rollback
    // -----------------------------------------------------------------------

    /// Advance the monitoring window of every pending patch; judge the ones
    /// whose window has elapsed.
    pub async fn confirmation_pass(&self) {
        let pending = match self.audit.with_status(PatchStatus::Pending) {
            Ok(pending) => pending,
            Err(e) => {
                warn!(target: "autopatch::supervisor", error = %e, "could not list pending patches");
                return;
            }
        };
        for record in pending {
            let due = {
                let mut cycles = lock_map(&self.confirm_cycles);
                let counter = cycles.entry(record.id).or_insert(0);
                *counter += 1;
                *counter >= self.cfg.confirmation_cycles
            };
            if due {
                self.evaluate_record(&record).await;
            }
        }
    }

    async fn evaluate_record(&self, record: &PatchRecord) {
        let metric = record.metric.clone();
        if metric == "UNDEFINED" {
            // Nothing to judge against; the apply stands.
            let _ = self.audit.mark_status(record.id, PatchStatus::Applied);
            self.clear_tracking(record.id);
            return;
        }

        let baseline = match self.audit.latest_snapshot(&metric) {
            Ok(Some(snapshot)) => snapshot,
            _ => {
                self.notify(format!(
                    "No baseline snapshot for `{}`; patch #{} cannot be judged yet.",
                    metric, record.id
                ))
                .await;
                self.reset_cycles(record.id);
                return;
            }
        };
        let Some(current) = self.metrics.current_value(&metric) else {
            self.notify(format!(
                "Metric `{}` unavailable; patch #{} judgement postponed.",
                metric, record.id
            ))
            .await;
            self.reset_cycles(record.id);
            return;
        };

        let improved = if self.cfg.is_lower_better(&metric) {
            current < baseline.value
        } else {
            current >= baseline.value
        };

        // Unlock either way so future attempts are possible.
        self.locks.release(&metric);

        if improved {
            if let Err(e) = self.audit.mark_status(record.id, PatchStatus::Success) {
                warn!(target: "autopatch::supervisor", error = %e, "status transition failed");
            }
            self.clear_tracking(record.id);
            self.notify(format!(
                "Patch on `{}` confirmed: {:.4} → {:.4}.",
                metric, baseline.value, current
            ))
            .await;
        } else {
            self.rollback_record(record, &metric, baseline.value, current).await;
        }
    }

    async fn rollback_record(
        &self,
        record: &PatchRecord,
        metric: &str,
        baseline: f64,
        current: f64,
    ) {
        let attempts = {
            let mut map = lock_map(&self.rollback_attempts);
            let counter = map.entry(record.id).or_insert(0);
            *counter += 1;
            *counter
        };

        let modification: Option<Modification> = record
            .reverse
            .get("modification")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());
        let Some(modification) = modification else {
            self.trail.log_error(
                &record.file,
                &format!("reverse patch for record {} is unreadable", record.id),
            );
            self.notify(format!(
                "Rollback impossible for patch #{}: reverse patch unreadable.",
                record.id
            ))
            .await;
            let _ = self.audit.mark_status(record.id, PatchStatus::Rollback);
            self.clear_tracking(record.id);
            return;
        };

        let failure_detail =
            match apply_modification(&self.cfg.system_root, &record.file, &modification) {
                Ok(ApplyOutcome::Applied(_)) => None,
                Ok(ApplyOutcome::NoChange(reason)) => Some(format!("no effect ({})", reason)),
                Err(e) => Some(e.to_string()),
            };

        match failure_detail {
            None => {
                if record.file == self.cfg.settings_file {
                    let _ = self.settings.reload();
                }
                if let Err(e) = self.audit.mark_status(record.id, PatchStatus::Rollback) {
                    warn!(target: "autopatch::supervisor", error = %e, "status transition failed");
                }
                self.clear_tracking(record.id);
                self.notify(format!(
                    "Patch on `{}` rolled back: {:.4} → {:.4}.",
                    metric, baseline, current
                ))
                .await;
            }
            Some(detail) => {
                if attempts < 2 {
                    self.trail.log_error(
                        &record.file,
                        &format!("rollback attempt failed: {}; one retry scheduled", detail),
                    );
                    self.notify(format!(
                        "Rollback failed for patch #{} ({}). Retrying next cycle.",
                        record.id, detail
                    ))
                    .await;
                    // Keep the record pending so exactly one retry happens.
                } else {
                    self.trail.log_error(
                        &record.file,
                        &format!(
                            "rollback failed twice ({}); manual intervention required",
                            detail
                        ),
                    );
                    self.notify(format!(
                        "Rollback failed twice for patch #{}. Manual intervention required.",
                        record.id
                    ))
                    .await;
                    let _ = self.audit.mark_status(record.id, PatchStatus::Rollback);
                    self.clear_tracking(record.id);
                }
            }
        }
    }

    fn reset_cycles(&self, id: u64) {
        lock_map(&self.confirm_cycles).remove(&id);
    }

    fn clear_tracking(&self, id: u64) {
        lock_map(&self.confirm_cycles).remove(&id);
        lock_map(&self.rollback_attempts).remove(&id);
    }

    async fn notify(&self, text: String) {
        self.notifier.send(&text).await;
    }
}

fn lock_map<'a>(mutex: &'a Mutex<HashMap<u64, u32>>) -> MutexGuard<'a, HashMap<u64, u32>> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
