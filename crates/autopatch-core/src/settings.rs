//! Versioned view of the supervised system's settings file.
//!
//! The settings file is plain `KEY = value` lines and is a patch *target*:
//! a ParamUpdate rewrites it on disk and then publishes the next immutable
//! version here. Readers hold an `Arc` snapshot and never re-parse the live
//! file per access; "current settings" is a pointer swap.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::info;

/// One immutable parse of the settings file.
#[derive(Debug, Clone)]
pub struct SettingsVersion {
    pub version: u64,
    pub values: BTreeMap<String, String>,
    pub loaded_at: String,
}

impl SettingsVersion {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Holder of the current settings version.
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Arc<SettingsVersion>>,
}

impl SettingsStore {
    /// Parse the settings file and publish version 1. A missing file yields
    /// an empty version — the supervised system may not have settings yet.
    pub fn open(path: &Path) -> Result<Self, std::io::Error> {
        let values = match std::fs::read_to_string(path) {
            Ok(text) => parse_settings(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        let version = Arc::new(SettingsVersion {
            version: 1,
            values,
            loaded_at: chrono::Utc::now().to_rfc3339(),
        });
        Ok(Self {
            path: path.to_path_buf(),
            current: RwLock::new(version),
        })
    }

    /// Current immutable snapshot.
    pub fn current(&self) -> Arc<SettingsVersion> {
        self.current
            .read()
            .map(|g| Arc::clone(&g))
            .unwrap_or_else(|p| Arc::clone(&p.into_inner()))
    }

    /// Re-parse the on-disk file and publish it as the next version.
    /// Called after a ParamUpdate has rewritten the file.
    pub fn reload(&self) -> Result<Arc<SettingsVersion>, std::io::Error> {
        let text = std::fs::read_to_string(&self.path)?;
        let values = parse_settings(&text);
        let next = {
            let mut guard = self
                .current
                .write()
                .unwrap_or_else(|p| p.into_inner());
            let next = Arc::new(SettingsVersion {
                version: guard.version + 1,
                values,
                loaded_at: chrono::Utc::now().to_rfc3339(),
            });
            *guard = Arc::clone(&next);
            next
        };
        info!(
            target: "autopatch::settings",
            version = next.version,
            keys = next.values.len(),
            "settings version published"
        );
        Ok(next)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse `KEY = value` lines; `#` starts a comment, blanks are skipped.
fn parse_settings(text: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            continue;
        }
        values.insert(key.to_string(), value.trim().to_string());
    }
    values
}

/// Render a JSON scalar as a settings-file literal.
pub fn render_literal(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => format!("\"{}\"", s.replace('"', "\\\"")),
        other => other.to_string(),
    }
}
