//! Live metric access for the confirmation pass.
//!
//! The supervised system publishes its current indicator values; the
//! pipeline only ever reads them. The seam is a trait so tests and other
//! deployments can supply values without a file.

use std::path::PathBuf;

use tracing::warn;

/// Source of current performance-indicator values, keyed by uppercase name.
pub trait MetricsSource: Send + Sync {
    fn current_value(&self, metric: &str) -> Option<f64>;
}

/// JSON-file metrics: a flat object of `"METRIC": value` pairs, rewritten by
/// the supervised system as it runs.
pub struct FileMetrics {
    path: PathBuf,
}

impl FileMetrics {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl MetricsSource for FileMetrics {
    fn current_value(&self, metric: &str) -> Option<f64> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) => {
                warn!(target: "autopatch::metrics", error = %e, path = %self.path.display(), "metrics file unreadable");
                return None;
            }
        };
        let values: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!(target: "autopatch::metrics", error = %e, "metrics file is not valid JSON");
                return None;
            }
        };
        let wanted = metric.to_uppercase();
        values
            .as_object()?
            .iter()
            .find(|(k, _)| k.to_uppercase() == wanted)
            .and_then(|(_, v)| v.as_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_value_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, r#"{"winrate": 0.62, "MAX_DRAWDOWN": 0.08}"#).unwrap();
        let source = FileMetrics::new(path);
        assert_eq!(source.current_value("WINRATE"), Some(0.62));
        assert_eq!(source.current_value("max_drawdown"), Some(0.08));
        assert_eq!(source.current_value("PRECISION"), None);
    }

    #[test]
    fn missing_or_malformed_file_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileMetrics::new(dir.path().join("absent.json"));
        assert_eq!(source.current_value("WINRATE"), None);

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();
        let source = FileMetrics::new(path);
        assert_eq!(source.current_value("WINRATE"), None);
    }
}
