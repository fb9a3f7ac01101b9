//! Ignore rules for staged job trees
//!
//! Patterns use gitignore semantics and are matched against paths relative
//! to the staged root.

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;

/// Errors for ignore rule construction
#[derive(Debug, thiserror::Error)]
pub enum IgnoreError {
    #[error("invalid ignore pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        source: ignore::Error,
    },

    #[error("cannot build ignore rules: {0}")]
    Build(#[from] ignore::Error),
}

/// Compiled ignore rules for one staged job.
pub struct IgnoreRules {
    matcher: Gitignore,
}

impl IgnoreRules {
    pub fn new(root: &Path, patterns: &[String]) -> Result<Self, IgnoreError> {
        let mut builder = GitignoreBuilder::new(root);
        for pattern in patterns {
            builder
                .add_line(None, pattern)
                .map_err(|source| IgnoreError::Pattern {
                    pattern: pattern.clone(),
                    source,
                })?;
        }
        Ok(Self {
            matcher: builder.build()?,
        })
    }

    /// Check a path relative to the staged root. A path inside an ignored
    /// directory is ignored too.
    pub fn is_ignored(&self, rel_path: &Path, is_dir: bool) -> bool {
        self.matcher
            .matched_path_or_any_parents(rel_path, is_dir)
            .is_ignore()
    }
}
