//! autopatch-engine: the mutation machinery of the patch pipeline.
//!
//! Everything that touches a target file lives here, in strict order of
//! increasing risk:
//! - [`sandbox`] trial-applies a proposal to a disposable copy and runs it
//!   under a wall-clock bound — no live file is touched until this passes.
//! - [`apply`] performs the real edit: full-file replacement or a
//!   line/string/regex-addressed partial edit, atomically written.
//! - [`reverse`] derives the inverse edit from what was actually observed at
//!   apply time, for rollback.
//! - [`validate`] re-checks the live file after an apply.
//! - [`reload`] hot-swaps the affected unit, or signals restart-required for
//!   critical files.

pub mod apply;
mod exec;
pub mod reload;
pub mod reverse;
pub mod sandbox;
pub mod validate;

pub use apply::{
    apply_modification, apply_param_update, AppliedEdit, ApplyError, ApplyOutcome, NoChangeReason,
};
pub use reload::{ReloadEvent, ReloadOutcome, ReloadRegistry};
pub use reverse::reverse_modification;
pub use sandbox::{
    run_sandbox_trial, FallbackContext, SandboxFailReason, SandboxFailure, SandboxVerdict,
};
pub use validate::{validate_live_file, PostValidateError};
