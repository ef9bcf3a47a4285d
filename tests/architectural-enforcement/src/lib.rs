//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles:
//! - No sleep() calls in production code
//! - No unwrap()/expect() in production code
//! - Per-topic state guarded by `parking_lot` locks, never `std::sync`
//!
//! Production code is every line of a source file before its
//! `#[cfg(test)]` module; comment lines are ignored.

use std::fs;
use std::path::{Path, PathBuf};

/// Source trees checked by the enforcement tests, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["switchboard/core/src", "switchboard/daemon/src"];

/// A rule violation found in a source line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File the line belongs to
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// The offending line, trimmed
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.text)
    }
}

/// Workspace root, two levels above this package
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// Every `.rs` file under `dir` (relative to the workspace root)
#[must_use]
pub fn rust_files(dir: &str) -> Vec<PathBuf> {
    let path = workspace_root().join(dir);
    if !path.exists() {
        return Vec::new();
    }

    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.into_path())
        .collect()
}

/// Code lines of `content` that precede its test module, with 1-based numbers
///
/// Comment lines are skipped and trailing `//` comments stripped.
#[must_use]
pub fn production_lines(content: &str) -> Vec<(usize, &str)> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
        .filter(|(_, line)| !line.trim_start().starts_with("//"))
        .map(|(idx, line)| (idx + 1, line.split("//").next().unwrap_or(line)))
        .collect()
}

/// Scan production code under `dirs` for lines matching `is_violation`
#[must_use]
pub fn scan<F>(dirs: &[&str], is_violation: F) -> Vec<Violation>
where
    F: Fn(&Path, &str) -> bool,
{
    let mut violations = Vec::new();
    for dir in dirs {
        for path in rust_files(dir) {
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            for (line, code) in production_lines(&content) {
                if is_violation(&path, code) {
                    violations.push(Violation {
                        path: path.clone(),
                        line,
                        text: code.trim().to_string(),
                    });
                }
            }
        }
    }
    violations
}

/// Print violations and fail the test if there are any
pub fn report(rule: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }

    eprintln!("\n❌ CRITICAL: {rule}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }

    panic!(
        "\nFound {} violation(s) of: {rule}\nFix these before merging!",
        violations.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let content = "fn a() {}\n// note .unwrap()\nfn b() {} // trailing\n#[cfg(test)]\nmod tests {}\n";
        let lines = production_lines(content);
        assert_eq!(lines, vec![(1, "fn a() {}"), (3, "fn b() {} ")]);
    }

    #[test]
    fn test_production_dirs_exist() {
        for dir in PRODUCTION_DIRS {
            assert!(
                !rust_files(dir).is_empty(),
                "expected Rust sources under {dir}"
            );
        }
    }
}
