//! Reverse-patch generation.
//!
//! The inverse is derived from the [`AppliedEdit`] — i.e. from what was
//! actually read off disk at apply time — never from the forward proposal's
//! declared `old_value`, which may be absent or wrong. All reverse locations
//! are line-addressed: the engine knows exactly which line it acted on.

use autopatch_core::schema::{Action, Location, LocationKind, Modification};

use crate::apply::AppliedEdit;

/// Build the modification that undoes `edit`.
///
/// - replace(line N)  → replace(line N) with the observed prior text
/// - insert(after N)  → delete(line N+1), guarded by the inserted text
/// - delete(line N)   → insert(after N−1); N = 1 reverses through the
///   top-of-file address (line 0)
/// - full-file        → full-file with the complete prior content
pub fn reverse_modification(edit: &AppliedEdit) -> Modification {
    if edit.mode == LocationKind::FullFile {
        return Modification {
            action: Action::Replace,
            location: Location {
                kind: LocationKind::FullFile,
                value: String::new(),
            },
            old_value: None,
            new_value: edit.old_text.clone(),
        };
    }

    let line = edit.line.unwrap_or(0);
    match edit.action {
        Action::Replace => Modification {
            action: Action::Replace,
            location: Location::line(line),
            old_value: edit.new_text.clone(),
            new_value: edit.old_text.clone(),
        },
        Action::Insert => Modification {
            action: Action::Delete,
            location: Location::line(line + 1),
            old_value: edit.new_text.clone(),
            new_value: None,
        },
        Action::Delete => Modification {
            action: Action::Insert,
            location: Location::line(line.saturating_sub(1)),
            old_value: None,
            new_value: edit.old_text.clone(),
        },
    }
}
