//! autopatch-daemon: the orchestration layer of the patch pipeline.
//!
//! One long-lived polling loop drains the pending-proposal directory and
//! drives each proposal through the fixed stage order (schema → safety →
//! sandbox → apply → post-validate → reload → audit), then periodically
//! re-evaluates applied patches against their metric baselines to confirm or
//! roll back. A crash-flag watcher runs alongside. No error escapes the
//! loop: every stage returns a typed outcome and unexpected failures degrade
//! to a logged skip.

pub mod batch;
pub mod supervisor;
pub mod watcher;

pub use supervisor::{ProposalOutcome, QueuedProposal, Supervisor};
