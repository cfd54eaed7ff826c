//! Manager configuration, layered defaults → `autopatch.toml` → environment.
//!
//! Environment overrides use the `AUTOPATCH_` prefix with `__` as the section
//! separator (e.g. `AUTOPATCH_TOOLCHAIN__SANDBOX_TIMEOUT_SECS=10`). The
//! manager's own configuration is distinct from the supervised system's
//! settings file — the latter is patch *target* data, never read here.

use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

fn default_system_root() -> PathBuf {
    PathBuf::from("./system")
}
fn default_pending_dir() -> PathBuf {
    PathBuf::from("./modification_logs/pending")
}
fn default_processed_dir() -> PathBuf {
    PathBuf::from("./modification_logs/processed")
}
fn default_logs_dir() -> PathBuf {
    PathBuf::from("./integration_logs")
}
fn default_store_path() -> PathBuf {
    PathBuf::from("./data/autopatch_store")
}
fn default_metrics_file() -> PathBuf {
    PathBuf::from("./data/current_metrics.json")
}
fn default_restart_flag() -> PathBuf {
    PathBuf::from("./restart_required.flag")
}
fn default_crash_flag() -> PathBuf {
    PathBuf::from("./system_crashed.flag")
}
fn default_settings_file() -> String {
    "settings.py".to_string()
}
fn default_poll_interval() -> u64 {
    600
}
fn default_crash_poll() -> u64 {
    15
}
fn default_cooldown() -> u64 {
    3600
}
fn default_confirmation_cycles() -> u32 {
    3
}
fn default_protected_params() -> Vec<String> {
    ["API_KEY", "PRODUCTION_MODE", "NOTIFY_CHAT_ID", "AUTO_APPLY_PATCHES"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_protected_files() -> Vec<String> {
    ["run.py", "supervisor.py", "lock_manager.py", "audit_log.py"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_critical_files() -> Vec<String> {
    ["bot.py", "supervisor.py", "settings.py"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_metric_priority() -> Vec<String> {
    ["WINRATE", "MAX_DRAWDOWN", "DAILY_PROFIT", "PRECISION", "AVG_TRADE_EV"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_lower_is_better() -> Vec<String> {
    vec!["MAX_DRAWDOWN".to_string()]
}
fn default_check_cmd() -> Vec<String> {
    vec!["python3".into(), "-m".into(), "py_compile".into()]
}
fn default_run_cmd() -> Vec<String> {
    vec!["python3".into()]
}
fn default_sandbox_timeout() -> u64 {
    5
}
fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

/// External toolchain used to check, trial-run, and load patched units.
/// The target file path is appended as the final argument of each command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainConfig {
    /// Syntax check, e.g. `python3 -m py_compile`.
    #[serde(default = "default_check_cmd")]
    pub check_cmd: Vec<String>,
    /// Standalone execution of a sandbox copy.
    #[serde(default = "default_run_cmd")]
    pub run_cmd: Vec<String>,
    /// Load/initialize check after a live apply. Defaults to `run_cmd`-style
    /// execution, which for interpreted units is exactly an import.
    #[serde(default = "default_run_cmd")]
    pub load_cmd: Vec<String>,
    /// Wall-clock bound on sandbox and validation commands.
    #[serde(default = "default_sandbox_timeout")]
    pub sandbox_timeout_secs: u64,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            check_cmd: default_check_cmd(),
            run_cmd: default_run_cmd(),
            load_cmd: default_run_cmd(),
            sandbox_timeout_secs: default_sandbox_timeout(),
        }
    }
}

/// Operator notification channel (Telegram-style sendMessage endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            chat_id: String::new(),
            api_base: default_api_base(),
        }
    }
}

/// Top-level configuration of the patch manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Root of the supervised source tree all relative target paths resolve
    /// against.
    #[serde(default = "default_system_root")]
    pub system_root: PathBuf,
    /// Directory polled for pending proposal documents.
    #[serde(default = "default_pending_dir")]
    pub pending_dir: PathBuf,
    /// Terminal proposals are moved here.
    #[serde(default = "default_processed_dir")]
    pub processed_dir: PathBuf,
    /// Integration reports and the error trail.
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
    /// Sled database path (audit rows, snapshots, blacklist).
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// Live metric values consumed by the confirmation pass.
    #[serde(default = "default_metrics_file")]
    pub metrics_file: PathBuf,
    /// Sentinel written when a critical-file patch needs a process restart.
    #[serde(default = "default_restart_flag")]
    pub restart_flag: PathBuf,
    /// Sentinel watched for supervised-system crashes.
    #[serde(default = "default_crash_flag")]
    pub crash_flag: PathBuf,

    /// Relative path of the supervised settings file.
    #[serde(default = "default_settings_file")]
    pub settings_file: String,
    /// Restricted mode: only the settings file may be patched.
    #[serde(default)]
    pub production_mode: bool,
    /// Process proposals grouped by metric priority instead of listing order.
    #[serde(default)]
    pub batch_mode: bool,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_crash_poll")]
    pub crash_poll_secs: u64,
    /// Cooldown for advisory locks, seconds.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Monitoring cycles a patch stays pending before confirmation.
    #[serde(default = "default_confirmation_cycles")]
    pub confirmation_cycles: u32,

    /// Reserved parameters no proposal may touch.
    #[serde(default = "default_protected_params")]
    pub protected_params: Vec<String>,
    /// Files protected outside production mode.
    #[serde(default = "default_protected_files")]
    pub protected_files: Vec<String>,
    /// Files whose patches require a process restart instead of a hot swap.
    #[serde(default = "default_critical_files")]
    pub critical_restart_files: Vec<String>,
    /// Batch-mode priority order; unlisted metrics sort after, UNDEFINED last.
    #[serde(default = "default_metric_priority")]
    pub metric_priority: Vec<String>,
    /// Metrics where improvement means a *lower* value.
    #[serde(default = "default_lower_is_better")]
    pub lower_is_better_metrics: Vec<String>,

    #[serde(default)]
    pub toolchain: ToolchainConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        // Deserializing an empty map exercises every serde default above.
        serde_json::from_value(serde_json::json!({}))
            .unwrap_or_else(|_| unreachable!("defaults are total"))
    }
}

impl ManagerConfig {
    /// Load from `autopatch.toml` (optional) with `AUTOPATCH_*` env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("autopatch")
    }

    pub fn load_from(basename: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(basename).required(false))
            .add_source(Environment::with_prefix("AUTOPATCH").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// True when the parameter is in the reserved set (case-insensitive).
    pub fn is_param_protected(&self, param: &str) -> bool {
        let wanted = param.trim().to_uppercase();
        self.protected_params.iter().any(|p| p.to_uppercase() == wanted)
    }

    /// True when a code patch may not touch this file.
    pub fn is_file_protected(&self, rel_path: &str) -> bool {
        if self.production_mode {
            return rel_path != self.settings_file;
        }
        self.protected_files.iter().any(|p| p == rel_path)
    }

    /// True when a patched file needs a restart to take effect.
    pub fn is_critical_file(&self, rel_path: &str) -> bool {
        self.critical_restart_files
            .iter()
            .any(|crit| rel_path.contains(crit.as_str()))
    }

    pub fn is_lower_better(&self, metric: &str) -> bool {
        self.lower_is_better_metrics
            .iter()
            .any(|m| m.eq_ignore_ascii_case(metric))
    }
}
