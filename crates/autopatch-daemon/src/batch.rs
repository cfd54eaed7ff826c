//! Batch prioritization: group pending proposals by metric, try the highest
//! priority group first, one proposal per group per pass. A locked metric
//! skips its whole group until the cooldown clears.

use std::collections::BTreeMap;

use tracing::info;

use autopatch_core::locks::LockManager;

use crate::supervisor::QueuedProposal;

/// Grouping key for a raw proposal document.
pub fn metric_of(raw: &serde_json::Value) -> String {
    raw.get("metric")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "UNDEFINED".to_string())
}

fn rank(metric: &str, priority: &[String]) -> usize {
    if metric == "UNDEFINED" {
        return priority.len() + 1;
    }
    priority
        .iter()
        .position(|p| p == metric)
        .unwrap_or(priority.len())
}

/// Pick the proposals to attempt this pass: the first of each metric group,
/// groups ordered by priority (unlisted metrics alphabetical, UNDEFINED
/// last), locked groups skipped entirely.
pub fn select_batch(
    queue: Vec<QueuedProposal>,
    priority: &[String],
    locks: &LockManager,
) -> Vec<QueuedProposal> {
    // BTreeMap keeps unlisted metrics alphabetical within equal rank.
    let mut groups: BTreeMap<String, Vec<QueuedProposal>> = BTreeMap::new();
    for q in queue {
        groups.entry(metric_of(&q.raw)).or_default().push(q);
    }

    let mut ordered: Vec<(String, Vec<QueuedProposal>)> = groups.into_iter().collect();
    ordered.sort_by_key(|(metric, _)| rank(metric, priority));

    let mut selected = Vec::new();
    for (metric, mut group) in ordered {
        if locks.is_locked(&metric) {
            info!(target: "autopatch::batch", metric = %metric, "metric locked; group skipped this pass");
            continue;
        }
        if !group.is_empty() {
            selected.push(group.remove(0));
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn q(name: &str, metric: Option<&str>) -> QueuedProposal {
        let raw = match metric {
            Some(m) => serde_json::json!({"metric": m}),
            None => serde_json::json!({}),
        };
        QueuedProposal {
            name: name.to_string(),
            path: PathBuf::from(name),
            raw,
            parse_error: None,
        }
    }

    fn priority() -> Vec<String> {
        ["WINRATE", "MAX_DRAWDOWN", "DAILY_PROFIT", "PRECISION", "AVG_TRADE_EV"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn metric_of_defaults_and_uppercases() {
        assert_eq!(metric_of(&serde_json::json!({"metric": "winrate"})), "WINRATE");
        assert_eq!(metric_of(&serde_json::json!({"metric": "  "})), "UNDEFINED");
        assert_eq!(metric_of(&serde_json::json!({})), "UNDEFINED");
    }

    #[test]
    fn one_proposal_per_group_in_priority_order() {
        let locks = LockManager::new(Duration::from_secs(60));
        let queue = vec![
            q("a.json", Some("DAILY_PROFIT")),
            q("b.json", Some("WINRATE")),
            q("c.json", Some("WINRATE")),
            q("d.json", None),
            q("e.json", Some("ZULU")),
        ];
        let selected = select_batch(queue, &priority(), &locks);
        let names: Vec<&str> = selected.iter().map(|q| q.name.as_str()).collect();
        // WINRATE first (b before c in listing order), then DAILY_PROFIT,
        // then the unlisted metric, UNDEFINED last.
        assert_eq!(names, vec!["b.json", "a.json", "e.json", "d.json"]);
    }

    #[test]
    fn locked_metric_skips_its_group() {
        let locks = LockManager::new(Duration::from_secs(60));
        locks.acquire("WINRATE");
        let queue = vec![q("a.json", Some("WINRATE")), q("b.json", Some("PRECISION"))];
        let selected = select_batch(queue, &priority(), &locks);
        let names: Vec<&str> = selected.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(names, vec!["b.json"]);
    }
}
