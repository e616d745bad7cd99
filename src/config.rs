//! Downstream server options.
//!
//! Priority chain:
//! 1. Built-in defaults
//! 2. TOML file (`--config`)
//! 3. CLI flags

use crate::error::{Result, SyncError};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// What the downstream server observes and how it reacts to the tunnel
/// going away.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct DownstreamOptions {
    /// Root of the tree to watch (`~` is expanded)
    pub remote_path: PathBuf,

    /// Gitignore-style exclude patterns, later ones win
    pub exclude_paths: Vec<String>,

    /// Exit the process when the peer closes its side of the tunnel
    pub exit_on_close: bool,
}

impl Default for DownstreamOptions {
    fn default() -> Self {
        Self {
            remote_path: PathBuf::from("."),
            exclude_paths: Vec::new(),
            exit_on_close: false,
        }
    }
}

impl DownstreamOptions {
    pub fn new(remote_path: impl Into<PathBuf>) -> Self {
        Self {
            remote_path: remote_path.into(),
            ..Self::default()
        }
    }

    pub fn with_excludes<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_paths.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| SyncError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Expand `~` and check that the root is an existing directory.
    pub fn validate(mut self) -> Result<Self> {
        if self.remote_path.as_os_str().is_empty() {
            return Err(SyncError::Config("Remote path must not be empty".into()));
        }

        self.remote_path = expand_tilde(&self.remote_path);
        if !self.remote_path.is_dir() {
            return Err(SyncError::Config(format!(
                "Remote path is not a directory: {}",
                self.remote_path.display()
            )));
        }
        Ok(self)
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}
