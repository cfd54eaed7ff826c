//! autopatch-core: shared model and gatekeeping for the patch-integration pipeline.
//!
//! The pipeline accepts machine-generated change proposals against a running
//! system, screens them for structural and policy safety, and records every
//! attempt durably so that applied patches can later be confirmed against live
//! performance or rolled back.
//!
//! This crate owns everything the engine and the daemon share:
//! - the proposal wire schema and its pure validator ([`schema`])
//! - the five-check safety gate ([`gate`])
//! - cooldown locks and the permanent blacklist ([`locks`], [`blacklist`])
//! - the sled-backed audit store, metric snapshots, and the human-readable
//!   integration trail ([`audit`])
//! - versioned supervised-system settings ([`settings`])
//! - manager configuration, operator notification, and live metric access
//!   ([`config`], [`notify`], [`metrics`])

pub mod audit;
pub mod blacklist;
pub mod config;
pub mod gate;
pub mod locks;
pub mod metrics;
pub mod notify;
pub mod scan;
pub mod schema;
pub mod settings;

pub use audit::{AuditStore, IntegrationTrail, PatchRecord, PatchStatus, Snapshot, StoreError};
pub use blacklist::Blacklist;
pub use config::{ManagerConfig, NotifierConfig, ToolchainConfig};
pub use gate::{GateBlock, SafetyGate};
pub use locks::LockManager;
pub use metrics::{FileMetrics, MetricsSource};
pub use notify::Notifier;
pub use schema::{
    canonical_hash, sha256_hex, Action, CodePatch, Location, LocationKind, Modification,
    ParamUpdate, PatchProposal, ProposalDoc, SchemaError,
};
pub use settings::{SettingsStore, SettingsVersion};
