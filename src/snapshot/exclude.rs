//! Exclude rules for walks and archives.
//!
//! Patterns use gitignore syntax, compiled with the `ignore` crate (the same
//! matcher ripgrep uses): later patterns override earlier ones, `!pattern`
//! re-includes, and a trailing slash restricts a pattern to directories.

use crate::error::{Result, SyncError};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;

/// Compiled exclude patterns.
///
/// An empty pattern list never produces a matcher; callers hold an
/// `Option<IgnoreMatcher>` and skip matching entirely when it is `None`.
#[derive(Debug, Clone)]
pub struct IgnoreMatcher {
    gitignore: Gitignore,
}

impl IgnoreMatcher {
    /// Compile exclude patterns. Returns `Ok(None)` when there is nothing to
    /// exclude.
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Option<Self>> {
        if patterns.is_empty() {
            return Ok(None);
        }

        let mut builder = GitignoreBuilder::new("");
        for pattern in patterns {
            let pattern = pattern.as_ref();
            builder
                .add_line(None, pattern)
                .map_err(|source| SyncError::InvalidPattern {
                    pattern: pattern.to_string(),
                    source,
                })?;
        }

        let gitignore = builder.build().map_err(|source| SyncError::InvalidPattern {
            pattern: patterns
                .iter()
                .map(|p| p.as_ref())
                .collect::<Vec<_>>()
                .join(", "),
            source,
        })?;

        Ok(Some(Self { gitignore }))
    }

    /// Check a path relative to the synced root.
    ///
    /// A path is excluded when it, or any of its parent directories, is
    /// matched by the rules.
    pub fn matches(&self, relative_path: &Path, is_dir: bool) -> bool {
        let relative_path = relative_path
            .strip_prefix("/")
            .unwrap_or(relative_path);
        if relative_path.as_os_str().is_empty() {
            return false;
        }

        self.gitignore
            .matched_path_or_any_parents(relative_path, is_dir)
            .is_ignore()
    }

    pub fn len(&self) -> usize {
        self.gitignore.num_ignores() as usize + self.gitignore.num_whitelists() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(patterns: &[&str]) -> IgnoreMatcher {
        IgnoreMatcher::compile(patterns).unwrap().unwrap()
    }

    #[test]
    fn test_empty_patterns_yield_no_matcher() {
        let none: &[&str] = &[];
        assert!(IgnoreMatcher::compile(none).unwrap().is_none());
    }

    #[test]
    fn test_extension_pattern() {
        let matcher = compile(&["*.log"]);

        assert!(matcher.matches(Path::new("app.log"), false));
        assert!(matcher.matches(Path::new("deep/nested/app.log"), false));
        assert!(!matcher.matches(Path::new("app.txt"), false));
    }

    #[test]
    fn test_trailing_slash_matches_directories_only() {
        let matcher = compile(&["build/"]);

        assert!(matcher.matches(Path::new("build"), true));
        assert!(!matcher.matches(Path::new("build"), false));
        // Children of an excluded directory are excluded too
        assert!(matcher.matches(Path::new("build/out.o"), false));
    }

    #[test]
    fn test_later_patterns_override_earlier() {
        let matcher = compile(&["*.log", "!keep.log"]);

        assert!(matcher.matches(Path::new("debug.log"), false));
        assert!(!matcher.matches(Path::new("keep.log"), false));

        let matcher = compile(&["!keep.log", "*.log"]);
        assert!(matcher.matches(Path::new("keep.log"), false));
    }

    #[test]
    fn test_anchored_pattern() {
        let matcher = compile(&["/node_modules"]);

        assert!(matcher.matches(Path::new("node_modules"), true));
        assert!(!matcher.matches(Path::new("web/node_modules"), true));
    }

    #[test]
    fn test_leading_slash_in_path_is_ignored() {
        let matcher = compile(&["*.tmp"]);
        assert!(matcher.matches(Path::new("/cache/a.tmp"), false));
        assert!(!matcher.matches(Path::new("/"), true));
    }

    #[test]
    fn test_malformed_pattern_is_rejected() {
        let err = IgnoreMatcher::compile(&["src/{a,b"]).unwrap_err();
        match err {
            SyncError::InvalidPattern { pattern, .. } => assert_eq!(pattern, "src/{a,b"),
            other => panic!("Expected InvalidPattern, got {:?}", other),
        }
    }
}
