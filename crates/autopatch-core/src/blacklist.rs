//! Permanent blacklist of failed proposal bodies.
//!
//! Keys are the canonical SHA-256 hash of the proposal JSON; values record
//! when and why the body was banned. Membership is permanent until an
//! operator clears it — a byte-identical bad proposal is never re-validated.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::StoreError;

const TREE_NAME: &str = "blacklist";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BanRecord {
    banned_at: String,
    reason: String,
}

/// Sled-backed hash set of rejected proposal bodies.
pub struct Blacklist {
    tree: sled::Tree,
}

impl Blacklist {
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            tree: db.open_tree(TREE_NAME)?,
        })
    }

    pub fn contains(&self, hash: &str) -> Result<bool, StoreError> {
        Ok(self.tree.contains_key(hash.as_bytes())?)
    }

    pub fn insert(&self, hash: &str, reason: &str) -> Result<(), StoreError> {
        let record = BanRecord {
            banned_at: Utc::now().to_rfc3339(),
            reason: reason.to_string(),
        };
        self.tree
            .insert(hash.as_bytes(), serde_json::to_vec(&record)?)?;
        info!(target: "autopatch::blacklist", hash = &hash[..12.min(hash.len())], reason, "proposal body blacklisted");
        Ok(())
    }

    /// Manual operator escape hatch.
    pub fn remove(&self, hash: &str) -> Result<bool, StoreError> {
        Ok(self.tree.remove(hash.as_bytes())?.is_some())
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
