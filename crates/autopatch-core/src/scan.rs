//! Language-neutral structural checks for embedded source text.
//!
//! The pipeline never interprets the patched language; the sandbox runs the
//! real toolchain. What the gate needs earlier is a cheap answer to "can this
//! text possibly be a well-formed source fragment": balanced bracket
//! delimiters and terminated double-quoted strings. A fragment that fails
//! this scan can never pass the toolchain, so it is blacklisted outright.

use thiserror::Error;

/// Structural defect found by [`structural_scan`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScanIssue {
    #[error("unexpected closing '{found}' at line {line}")]
    UnexpectedClosing { found: char, line: usize },
    #[error("mismatched '{found}' at line {line}, expected '{expected}'")]
    MismatchedClosing {
        found: char,
        expected: char,
        line: usize,
    },
    #[error("unclosed '{open}' opened at line {line}")]
    Unclosed { open: char, line: usize },
    #[error("empty source text")]
    Empty,
}

fn closing_for(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

/// Scan a source fragment for gross structural validity.
///
/// Tracks `()`, `[]`, `{}` nesting outside double-quoted strings. String
/// state resets at end of line; single quotes are ignored entirely (they are
/// apostrophes in too many languages to track reliably).
pub fn structural_scan(source: &str) -> Result<(), ScanIssue> {
    if source.trim().is_empty() {
        return Err(ScanIssue::Empty);
    }

    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1usize;
    let mut in_string = false;
    let mut escaped = false;

    for c in source.chars() {
        if c == '\n' {
            line += 1;
            in_string = false;
            escaped = false;
            continue;
        }
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => match stack.pop() {
                None => return Err(ScanIssue::UnexpectedClosing { found: c, line }),
                Some((open, _)) if closing_for(open) != c => {
                    return Err(ScanIssue::MismatchedClosing {
                        found: c,
                        expected: closing_for(open),
                        line,
                    })
                }
                Some(_) => {}
            },
            _ => {}
        }
    }

    if let Some((open, line)) = stack.pop() {
        return Err(ScanIssue::Unclosed { open, line });
    }
    Ok(())
}

/// Function names whose removal from a file disqualifies a full-file
/// replacement: the entry points the supervised system is started through.
pub const ESSENTIAL_FUNCTIONS: [&str; 4] = ["main", "run", "start", "supervise"];

/// Extract declared function names from a source fragment.
///
/// Line-prefix matching over the common declaration heads (`fn`, `def`,
/// `function`), which covers the languages the pipeline is pointed at without
/// a grammar. Decorated or indented declarations count; expressions do not.
pub fn extract_function_names(source: &str) -> Vec<String> {
    let mut names = Vec::new();
    for raw in source.lines() {
        let line = raw.trim_start();
        let rest = ["pub async fn ", "pub fn ", "async fn ", "fn ", "async def ", "def ", "function "]
            .iter()
            .find_map(|prefix| line.strip_prefix(prefix));
        let Some(rest) = rest else { continue };
        let name: String = rest
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if !name.is_empty() && !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Essential functions present in `old` but missing from `new`.
pub fn missing_essential_functions(old: &str, new: &str) -> Vec<String> {
    let old_names = extract_function_names(old);
    let new_names = extract_function_names(new);
    ESSENTIAL_FUNCTIONS
        .iter()
        .filter(|f| old_names.iter().any(|n| n == *f))
        .filter(|f| !new_names.iter().any(|n| n == *f))
        .map(|f| f.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_source_passes() {
        assert!(structural_scan("def f(x):\n    return [x, (x + 1)]\n").is_ok());
        assert!(structural_scan("fn main() { println!(\"hi\"); }\n").is_ok());
    }

    #[test]
    fn unclosed_brace_fails() {
        let err = structural_scan("fn main() {\n    let x = 1;\n").unwrap_err();
        assert_eq!(err, ScanIssue::Unclosed { open: '{', line: 1 });
    }

    #[test]
    fn mismatched_and_stray_closers_fail() {
        assert!(matches!(
            structural_scan("a = (1]"),
            Err(ScanIssue::MismatchedClosing { .. })
        ));
        assert!(matches!(
            structural_scan("a = 1)"),
            Err(ScanIssue::UnexpectedClosing { .. })
        ));
    }

    #[test]
    fn delimiters_inside_strings_are_ignored() {
        assert!(structural_scan("s = \"unbalanced ( [ {\"\n").is_ok());
    }

    #[test]
    fn apostrophes_do_not_confuse_the_scan() {
        assert!(structural_scan("# don't panic\nx = (1 + 2)\n").is_ok());
    }

    #[test]
    fn empty_source_rejected() {
        assert_eq!(structural_scan("   \n  "), Err(ScanIssue::Empty));
    }

    #[test]
    fn function_extraction_covers_common_heads() {
        let src = "def run(x):\n    pass\n\nasync def start():\n    pass\nfn main() {}\nfunction helper(a) {}\n";
        let names = extract_function_names(src);
        assert_eq!(names, vec!["run", "start", "main", "helper"]);
    }

    #[test]
    fn missing_essential_detected() {
        let old = "def run():\n    pass\ndef helper():\n    pass\n";
        let new = "def helper():\n    pass\n";
        assert_eq!(missing_essential_functions(old, new), vec!["run"]);
        // Dropping a non-essential function is fine.
        let new2 = "def run():\n    pass\n";
        assert!(missing_essential_functions(old, new2).is_empty());
    }
}
