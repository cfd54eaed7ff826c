//! Proposal wire schema and its pure validator.
//!
//! Proposals arrive as self-contained JSON documents produced by an external
//! generator. The wire shape ([`ProposalDoc`]) is deliberately permissive —
//! every field optional, values loosely typed — because the generator is an
//! untrusted collaborator. [`validate`] turns a document into the typed
//! [`PatchProposal`] or rejects it with a [`SchemaError`], with no side
//! effects of any kind.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Wire shape
// ---------------------------------------------------------------------------

/// A raw proposal document as read from the pending directory.
///
/// `modification_type` selects the kind (`param_update` | `code_patch`); when
/// absent the kind is inferred from which fields are populated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProposalDoc {
    #[serde(default)]
    pub modification_type: Option<String>,
    #[serde(default)]
    pub engine_used: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Uppercase performance-indicator name this proposal targets, if any.
    #[serde(default)]
    pub metric: Option<String>,

    // param_update
    #[serde(default)]
    pub param_to_modify: Option<String>,
    #[serde(default)]
    pub new_value: Option<serde_json::Value>,
    #[serde(default)]
    pub target_file: Option<String>,

    // code_patch
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub modification: Option<ModificationDoc>,
}

/// Wire shape of a code modification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModificationDoc {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub location: Option<LocationDoc>,
    #[serde(default)]
    pub old_value: Option<String>,
    #[serde(default)]
    pub new_value: Option<serde_json::Value>,
    /// Legacy alias for `new_value` emitted by older generators.
    #[serde(default)]
    pub content: Option<serde_json::Value>,
}

/// Wire shape of an edit location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationDoc {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// Line number, literal substring, or pattern — number or string on the wire.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Typed model
// ---------------------------------------------------------------------------

/// Edit action for a partial patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Replace,
    Insert,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Replace => write!(f, "replace"),
            Action::Insert => write!(f, "insert"),
            Action::Delete => write!(f, "delete"),
        }
    }
}

/// Addressing family for a patch location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    /// Line contains the literal value.
    #[serde(rename = "string")]
    Str,
    /// 1-based line index equals the value. Index 0 addresses the top of the
    /// file for `insert` (used by generated reverse patches).
    Line,
    /// Line matches the value as a search pattern.
    Regex,
    /// The whole file is replaced.
    FullFile,
}

impl fmt::Display for LocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationKind::Str => write!(f, "string"),
            LocationKind::Line => write!(f, "line"),
            LocationKind::Regex => write!(f, "regex"),
            LocationKind::FullFile => write!(f, "full_file"),
        }
    }
}

/// A validated edit location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    #[serde(rename = "type")]
    pub kind: LocationKind,
    pub value: String,
}

impl Location {
    pub fn line(n: usize) -> Self {
        Self {
            kind: LocationKind::Line,
            value: n.to_string(),
        }
    }

    /// The line index for `Line` locations. Validation guarantees this parses.
    pub fn line_number(&self) -> Option<usize> {
        match self.kind {
            LocationKind::Line => self.value.parse().ok(),
            _ => None,
        }
    }
}

/// A validated code modification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    pub action: Action,
    pub location: Location,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
}

/// A settings-parameter update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamUpdate {
    pub param_name: String,
    pub new_value: serde_json::Value,
    /// Relative path of the settings file this parameter lives in.
    pub target_file: String,
    pub metric: Option<String>,
    pub reason: String,
    pub engine_used: String,
}

/// A source-code patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodePatch {
    pub target_file: String,
    pub modification: Modification,
    pub metric: Option<String>,
    pub reason: String,
    pub engine_used: String,
}

/// A schema-valid proposal. Exactly one kind is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PatchProposal {
    ParamUpdate(ParamUpdate),
    CodePatch(CodePatch),
}

impl PatchProposal {
    pub fn metric(&self) -> Option<&str> {
        match self {
            PatchProposal::ParamUpdate(p) => p.metric.as_deref(),
            PatchProposal::CodePatch(p) => p.metric.as_deref(),
        }
    }

    /// Metric label used for grouping and audit rows.
    pub fn metric_label(&self) -> String {
        self.metric().unwrap_or("UNDEFINED").to_string()
    }

    pub fn target_file(&self) -> &str {
        match self {
            PatchProposal::ParamUpdate(p) => &p.target_file,
            PatchProposal::CodePatch(p) => &p.target_file,
        }
    }

    pub fn engine_used(&self) -> &str {
        match self {
            PatchProposal::ParamUpdate(p) => &p.engine_used,
            PatchProposal::CodePatch(p) => &p.engine_used,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            PatchProposal::ParamUpdate(p) => &p.reason,
            PatchProposal::CodePatch(p) => &p.reason,
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            PatchProposal::ParamUpdate(_) => "param_update",
            PatchProposal::CodePatch(_) => "code_patch",
        }
    }

    /// Embedded new source text, if this proposal carries any.
    pub fn new_source(&self) -> Option<&str> {
        match self {
            PatchProposal::ParamUpdate(_) => None,
            PatchProposal::CodePatch(p) => p.modification.new_value.as_deref(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Structural rejection of a proposal document. Never logged to the audit
/// store; the document can simply never be processed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("cannot determine proposal kind (no modification_type, no recognizable fields)")]
    KindUndetermined,
    #[error("unknown modification_type: {0}")]
    UnknownKind(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid action: {0}")]
    InvalidAction(String),
    #[error("invalid location type: {0}")]
    InvalidLocationKind(String),
    #[error("line location must be a non-negative integer, got {0:?}")]
    InvalidLineNumber(String),
}

/// Validate a raw document into a typed proposal. Pure — no I/O, no state.
pub fn validate(doc: &ProposalDoc, default_settings_file: &str) -> Result<PatchProposal, SchemaError> {
    let kind = match doc.modification_type.as_deref() {
        Some("param_update") => "param_update",
        Some("code_patch") => "code_patch",
        Some(other) => return Err(SchemaError::UnknownKind(other.to_string())),
        None => {
            if doc.param_to_modify.is_some() {
                "param_update"
            } else if doc.file.is_some() && doc.modification.is_some() {
                "code_patch"
            } else {
                return Err(SchemaError::KindUndetermined);
            }
        }
    };

    let reason = doc.reason.clone().unwrap_or_default();
    let engine_used = doc
        .engine_used
        .clone()
        .unwrap_or_else(|| "unknown".to_string());
    let metric = doc
        .metric
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_uppercase);

    if kind == "param_update" {
        let param_name = doc
            .param_to_modify
            .clone()
            .ok_or(SchemaError::MissingField("param_to_modify"))?;
        let new_value = doc
            .new_value
            .clone()
            .ok_or(SchemaError::MissingField("new_value"))?;
        let target_file = doc
            .target_file
            .clone()
            .unwrap_or_else(|| default_settings_file.to_string());
        return Ok(PatchProposal::ParamUpdate(ParamUpdate {
            param_name,
            new_value,
            target_file,
            metric,
            reason,
            engine_used,
        }));
    }

    let target_file = doc.file.clone().ok_or(SchemaError::MissingField("file"))?;
    let m = doc
        .modification
        .as_ref()
        .ok_or(SchemaError::MissingField("modification"))?;
    let modification = validate_modification(m)?;
    Ok(PatchProposal::CodePatch(CodePatch {
        target_file,
        modification,
        metric,
        reason,
        engine_used,
    }))
}

fn validate_modification(m: &ModificationDoc) -> Result<Modification, SchemaError> {
    let action = match m.action.as_deref() {
        Some("replace") => Action::Replace,
        Some("insert") => Action::Insert,
        Some("delete") => Action::Delete,
        Some(other) => return Err(SchemaError::InvalidAction(other.to_string())),
        None => return Err(SchemaError::MissingField("modification.action")),
    };
    let loc = m
        .location
        .as_ref()
        .ok_or(SchemaError::MissingField("modification.location"))?;
    let kind = match loc.kind.as_deref() {
        Some("string") => LocationKind::Str,
        Some("line") => LocationKind::Line,
        Some("regex") => LocationKind::Regex,
        Some("full_file") => LocationKind::FullFile,
        Some(other) => return Err(SchemaError::InvalidLocationKind(other.to_string())),
        None => return Err(SchemaError::MissingField("modification.location.type")),
    };
    let value = match kind {
        // full_file carries no meaningful location value.
        LocationKind::FullFile => loc
            .value
            .as_ref()
            .map(scalar_to_string)
            .unwrap_or_default(),
        _ => scalar_to_string(
            loc.value
                .as_ref()
                .ok_or(SchemaError::MissingField("modification.location.value"))?,
        ),
    };
    if kind == LocationKind::Line && value.parse::<usize>().is_err() {
        return Err(SchemaError::InvalidLineNumber(value));
    }

    let new_value = m
        .new_value
        .as_ref()
        .or(m.content.as_ref())
        .map(scalar_to_string)
        .filter(|s| !s.is_empty());
    if kind == LocationKind::FullFile && new_value.is_none() {
        return Err(SchemaError::MissingField("modification.new_value"));
    }

    Ok(Modification {
        action,
        location: Location { kind, value },
        old_value: m.old_value.clone().filter(|s| !s.is_empty()),
        new_value,
    })
}

fn scalar_to_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Content hashing
// ---------------------------------------------------------------------------

/// SHA-256 hex digest of arbitrary bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Stable content hash of a proposal body.
///
/// `serde_json` object maps are BTree-ordered, so serializing a `Value` yields
/// a canonical key order regardless of the order in the source document.
pub fn canonical_hash(body: &serde_json::Value) -> String {
    sha256_hex(body.to_string().as_bytes())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(json: serde_json::Value) -> ProposalDoc {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn param_update_validates_with_defaults() {
        let d = doc(serde_json::json!({
            "modification_type": "param_update",
            "param_to_modify": "MIN_LOT_SIZE",
            "new_value": 0.05,
            "reason": "raise minimum lot",
        }));
        let p = validate(&d, "settings.py").unwrap();
        match p {
            PatchProposal::ParamUpdate(u) => {
                assert_eq!(u.param_name, "MIN_LOT_SIZE");
                assert_eq!(u.target_file, "settings.py");
                assert_eq!(u.new_value, serde_json::json!(0.05));
            }
            _ => panic!("expected param update"),
        }
    }

    #[test]
    fn kind_inferred_from_fields() {
        let d = doc(serde_json::json!({
            "param_to_modify": "X",
            "new_value": 1,
        }));
        assert!(matches!(
            validate(&d, "settings.py"),
            Ok(PatchProposal::ParamUpdate(_))
        ));

        let d = doc(serde_json::json!({
            "file": "logic/entry.py",
            "modification": {
                "action": "replace",
                "location": {"type": "string", "value": "threshold ="},
                "new_value": "threshold = 0.4",
            },
        }));
        assert!(matches!(
            validate(&d, "settings.py"),
            Ok(PatchProposal::CodePatch(_))
        ));
    }

    #[test]
    fn undetermined_kind_rejected() {
        let d = doc(serde_json::json!({"reason": "??"}));
        assert_eq!(
            validate(&d, "settings.py").unwrap_err(),
            SchemaError::KindUndetermined
        );
    }

    #[test]
    fn param_update_requires_value() {
        let d = doc(serde_json::json!({
            "modification_type": "param_update",
            "param_to_modify": "X",
        }));
        assert_eq!(
            validate(&d, "settings.py").unwrap_err(),
            SchemaError::MissingField("new_value")
        );
    }

    #[test]
    fn code_patch_requires_location_value() {
        let d = doc(serde_json::json!({
            "modification_type": "code_patch",
            "file": "a.py",
            "modification": {"action": "delete", "location": {"type": "line"}},
        }));
        assert_eq!(
            validate(&d, "settings.py").unwrap_err(),
            SchemaError::MissingField("modification.location.value")
        );
    }

    #[test]
    fn numeric_line_location_accepted_and_stringified() {
        let d = doc(serde_json::json!({
            "modification_type": "code_patch",
            "file": "a.py",
            "modification": {"action": "delete", "location": {"type": "line", "value": 42}},
        }));
        let p = validate(&d, "settings.py").unwrap();
        match p {
            PatchProposal::CodePatch(c) => {
                assert_eq!(c.modification.location.line_number(), Some(42));
            }
            _ => panic!(),
        }
    }

    #[test]
    fn non_numeric_line_location_rejected() {
        let d = doc(serde_json::json!({
            "modification_type": "code_patch",
            "file": "a.py",
            "modification": {"action": "delete", "location": {"type": "line", "value": "forty"}},
        }));
        assert!(matches!(
            validate(&d, "settings.py").unwrap_err(),
            SchemaError::InvalidLineNumber(_)
        ));
    }

    #[test]
    fn full_file_requires_new_content() {
        let d = doc(serde_json::json!({
            "modification_type": "code_patch",
            "file": "a.py",
            "modification": {"action": "replace", "location": {"type": "full_file"}},
        }));
        assert_eq!(
            validate(&d, "settings.py").unwrap_err(),
            SchemaError::MissingField("modification.new_value")
        );
    }

    #[test]
    fn legacy_content_alias_is_honored() {
        let d = doc(serde_json::json!({
            "modification_type": "code_patch",
            "file": "a.py",
            "modification": {
                "action": "insert",
                "location": {"type": "line", "value": 3},
                "content": "x = 1",
            },
        }));
        let p = validate(&d, "settings.py").unwrap();
        match p {
            PatchProposal::CodePatch(c) => {
                assert_eq!(c.modification.new_value.as_deref(), Some("x = 1"));
            }
            _ => panic!(),
        }
    }

    #[test]
    fn metric_is_uppercased() {
        let d = doc(serde_json::json!({
            "modification_type": "param_update",
            "param_to_modify": "X",
            "new_value": 1,
            "metric": "winrate",
        }));
        let p = validate(&d, "settings.py").unwrap();
        assert_eq!(p.metric(), Some("WINRATE"));
        assert_eq!(p.metric_label(), "WINRATE");
    }

    #[test]
    fn canonical_hash_is_stable_across_key_order() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": 3}}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"a": {"x": 3, "y": 2}, "b": 1}"#).unwrap();
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
        let c: serde_json::Value = serde_json::from_str(r#"{"a": {"x": 3}, "b": 1}"#).unwrap();
        assert_ne!(canonical_hash(&a), canonical_hash(&c));
    }
}
