//! The patch application engine.
//!
//! Two addressing families: full-file replacement (guarded by the structural
//! scan and the essential-function rule) and partial edits addressed by line
//! index, literal substring, or pattern. Partial edits act on the *first*
//! matching line only; every other line passes through untouched. Writes are
//! atomic (temp file + rename), and every successful write reports exactly
//! what was observed so reverse patches are built from real file content,
//! never from the proposal's claims.

use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;
use tracing::info;

use autopatch_core::scan::{missing_essential_functions, structural_scan};
use autopatch_core::schema::{Action, LocationKind, Modification};
use autopatch_core::settings::render_literal;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What a successful write acted on, as observed on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEdit {
    /// Relative path of the patched file.
    pub file: String,
    pub action: Action,
    pub mode: LocationKind,
    /// Acted line, 1-based. 0 means the edit prepended before line 1.
    /// `None` for full-file replacement.
    pub line: Option<usize>,
    /// Location as it should appear in audit output (line number, matched
    /// value, parameter name, or `FULL`).
    pub location_label: String,
    /// Text that was on the acted line (or the whole prior file) before the
    /// write.
    pub old_text: Option<String>,
    /// Text written by this edit.
    pub new_text: Option<String>,
}

/// A benign non-edit: the file is byte-identical to before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoChangeReason {
    /// No line ever matched the location.
    NoMatch,
    /// `replace` with an empty new value.
    EmptyReplacement,
    /// `insert` with an empty new value.
    EmptyInsert,
}

impl std::fmt::Display for NoChangeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoChangeReason::NoMatch => write!(f, "no_match"),
            NoChangeReason::EmptyReplacement => write!(f, "empty_replacement"),
            NoChangeReason::EmptyInsert => write!(f, "empty_insert"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(AppliedEdit),
    NoChange(NoChangeReason),
}

/// Typed apply failure. The target file is untouched in every case.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("target file missing: {0}")]
    TargetMissing(PathBuf),
    #[error("new content is not structurally valid: {0}")]
    SyntaxInvalid(String),
    #[error("essential functions removed: {0:?}")]
    EssentialFunctionRemoved(Vec<String>),
    #[error("old_value mismatch at line {line}")]
    OldValueMismatch { line: usize },
    #[error("invalid search pattern: {0}")]
    BadPattern(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApplyError {
    /// Short reason code for the error trail.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ApplyError::TargetMissing(_) => "target_missing",
            ApplyError::SyntaxInvalid(_) => "syntax_invalid",
            ApplyError::EssentialFunctionRemoved(_) => "essential_function_removed",
            ApplyError::OldValueMismatch { .. } => "old_value_mismatch",
            ApplyError::BadPattern(_) => "bad_pattern",
            ApplyError::Io(_) => "io_error",
        }
    }
}

// ---------------------------------------------------------------------------
// Line handling
// ---------------------------------------------------------------------------

/// A line with its original terminator, so rewrites round-trip byte-for-byte.
struct LineRec {
    text: String,
    term: &'static str,
}

fn split_lines(content: &str) -> Vec<LineRec> {
    content
        .split_inclusive('\n')
        .map(|chunk| {
            if let Some(stripped) = chunk.strip_suffix("\r\n") {
                LineRec {
                    text: stripped.to_string(),
                    term: "\r\n",
                }
            } else if let Some(stripped) = chunk.strip_suffix('\n') {
                LineRec {
                    text: stripped.to_string(),
                    term: "\n",
                }
            } else {
                LineRec {
                    text: chunk.to_string(),
                    term: "",
                }
            }
        })
        .collect()
}

fn join_lines(lines: &[LineRec]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(&line.text);
        out.push_str(line.term);
    }
    out
}

/// Atomic overwrite: write a sibling temp file, then rename over the target.
fn write_atomic(path: &Path, content: &str) -> Result<(), std::io::Error> {
    let tmp = path.with_extension("tmp_patch");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}

enum Matcher {
    Line(usize),
    Literal(String),
    Pattern(Regex),
}

impl Matcher {
    fn build(m: &Modification) -> Result<Self, ApplyError> {
        match m.location.kind {
            LocationKind::Line => {
                // Validated upstream; a malformed value simply never matches.
                Ok(Matcher::Line(m.location.value.parse().unwrap_or(usize::MAX)))
            }
            LocationKind::Str => Ok(Matcher::Literal(m.location.value.clone())),
            LocationKind::Regex => Regex::new(&m.location.value)
                .map(Matcher::Pattern)
                .map_err(|e| ApplyError::BadPattern(e.to_string())),
            LocationKind::FullFile => Ok(Matcher::Line(usize::MAX)),
        }
    }

    fn hits(&self, line_no: usize, text: &str) -> bool {
        match self {
            Matcher::Line(n) => line_no == *n,
            Matcher::Literal(s) => text.contains(s.as_str()),
            Matcher::Pattern(re) => re.is_match(text),
        }
    }
}

// ---------------------------------------------------------------------------
// Code patches
// ---------------------------------------------------------------------------

/// Apply a code modification to `rel_path` under `root`.
pub fn apply_modification(
    root: &Path,
    rel_path: &str,
    m: &Modification,
) -> Result<ApplyOutcome, ApplyError> {
    let target = root.join(rel_path);
    if !target.is_file() {
        return Err(ApplyError::TargetMissing(target));
    }
    if m.location.kind == LocationKind::FullFile {
        return apply_full_file(&target, rel_path, m);
    }
    apply_partial(&target, rel_path, m)
}

fn apply_full_file(
    target: &Path,
    rel_path: &str,
    m: &Modification,
) -> Result<ApplyOutcome, ApplyError> {
    let new_code = m
        .new_value
        .as_deref()
        .ok_or_else(|| ApplyError::SyntaxInvalid("empty replacement content".to_string()))?;

    structural_scan(new_code).map_err(|issue| ApplyError::SyntaxInvalid(issue.to_string()))?;

    let old_code = std::fs::read_to_string(target)?;
    let missing = missing_essential_functions(&old_code, new_code);
    if !missing.is_empty() {
        return Err(ApplyError::EssentialFunctionRemoved(missing));
    }

    write_atomic(target, &format!("{}\n", new_code.trim()))?;
    info!(target: "autopatch::apply", file = rel_path, "full-file replacement written");

    Ok(ApplyOutcome::Applied(AppliedEdit {
        file: rel_path.to_string(),
        action: m.action,
        mode: LocationKind::FullFile,
        line: None,
        location_label: "FULL".to_string(),
        old_text: Some(old_code),
        new_text: Some(new_code.to_string()),
    }))
}

fn apply_partial(
    target: &Path,
    rel_path: &str,
    m: &Modification,
) -> Result<ApplyOutcome, ApplyError> {
    let matcher = Matcher::build(m)?;
    let new_code = m.new_value.as_deref().unwrap_or("");
    let content = std::fs::read_to_string(target)?;
    let mut lines = split_lines(&content);

    // Line index 0 + insert addresses the top of the file. Reverse patches
    // for "delete line 1" need this to restore the original first line.
    if matches!(matcher, Matcher::Line(0)) {
        if m.action != Action::Insert {
            return Ok(ApplyOutcome::NoChange(NoChangeReason::NoMatch));
        }
        if new_code.is_empty() {
            return Ok(ApplyOutcome::NoChange(NoChangeReason::EmptyInsert));
        }
        lines.insert(
            0,
            LineRec {
                text: new_code.to_string(),
                term: "\n",
            },
        );
        write_atomic(target, &join_lines(&lines))?;
        return Ok(applied_partial(rel_path, m, 0, None, Some(new_code)));
    }

    let mut hit_index: Option<usize> = None;
    for (i, line) in lines.iter().enumerate() {
        if matcher.hits(i + 1, &line.text) {
            hit_index = Some(i);
            break;
        }
    }
    let Some(i) = hit_index else {
        return Ok(ApplyOutcome::NoChange(NoChangeReason::NoMatch));
    };
    let line_no = i + 1;

    // Stale-patch protection: the declared old value must still be present
    // on the matched line.
    if let Some(old_check) = m.old_value.as_deref() {
        if !lines[i].text.contains(old_check) {
            return Err(ApplyError::OldValueMismatch { line: line_no });
        }
    }

    let (old_text, new_text): (Option<String>, Option<&str>) = match m.action {
        Action::Delete => {
            let removed = lines.remove(i);
            (Some(removed.text), None)
        }
        Action::Insert => {
            if new_code.is_empty() {
                return Ok(ApplyOutcome::NoChange(NoChangeReason::EmptyInsert));
            }
            if lines[i].term.is_empty() {
                lines[i].term = "\n";
            }
            lines.insert(
                i + 1,
                LineRec {
                    text: new_code.to_string(),
                    term: "\n",
                },
            );
            (None, Some(new_code))
        }
        Action::Replace => {
            if new_code.is_empty() {
                return Ok(ApplyOutcome::NoChange(NoChangeReason::EmptyReplacement));
            }
            let old = std::mem::replace(&mut lines[i].text, new_code.to_string());
            (Some(old), Some(new_code))
        }
    };

    write_atomic(target, &join_lines(&lines))?;
    Ok(applied_partial(rel_path, m, line_no, old_text, new_text))
}

fn applied_partial(
    rel_path: &str,
    m: &Modification,
    line_no: usize,
    old_text: Option<String>,
    new_text: Option<&str>,
) -> ApplyOutcome {
    info!(
        target: "autopatch::apply",
        file = rel_path,
        line = line_no,
        action = %m.action,
        mode = %m.location.kind,
        "partial edit written"
    );
    ApplyOutcome::Applied(AppliedEdit {
        file: rel_path.to_string(),
        action: m.action,
        mode: m.location.kind,
        line: Some(line_no),
        location_label: m.location.value.clone(),
        old_text,
        new_text: new_text.map(str::to_string),
    })
}

// ---------------------------------------------------------------------------
// Parameter updates
// ---------------------------------------------------------------------------

/// Rewrite `PARAM = value` in the settings file, preserving the left-hand
/// side as written. First matching line only.
pub fn apply_param_update(
    root: &Path,
    rel_path: &str,
    param: &str,
    value: &serde_json::Value,
) -> Result<ApplyOutcome, ApplyError> {
    let target = root.join(rel_path);
    if !target.is_file() {
        return Err(ApplyError::TargetMissing(target));
    }
    let content = std::fs::read_to_string(&target)?;
    let mut lines = split_lines(&content);

    let space_form = format!("{} ", param);
    let eq_form = format!("{}=", param);
    let mut acted: Option<(usize, String)> = None;

    for (i, line) in lines.iter_mut().enumerate() {
        let trimmed = line.text.trim_start();
        if !(trimmed.starts_with(&space_form) || trimmed.starts_with(&eq_form)) {
            continue;
        }
        let Some(eq_idx) = line.text.find('=') else {
            continue;
        };
        let prefix = line.text[..eq_idx].trim_end().to_string();
        let old = std::mem::replace(
            &mut line.text,
            format!("{} = {}", prefix, render_literal(value)),
        );
        acted = Some((i + 1, old));
        break;
    }

    let Some((line_no, old)) = acted else {
        return Ok(ApplyOutcome::NoChange(NoChangeReason::NoMatch));
    };
    let new_text = lines[line_no - 1].text.clone();
    write_atomic(&target, &join_lines(&lines))?;
    info!(target: "autopatch::apply", file = rel_path, line = line_no, param, "parameter updated");

    Ok(ApplyOutcome::Applied(AppliedEdit {
        file: rel_path.to_string(),
        action: Action::Replace,
        mode: LocationKind::Str,
        line: Some(line_no),
        location_label: param.to_string(),
        old_text: Some(old),
        new_text: Some(new_text),
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
