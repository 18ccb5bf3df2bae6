use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("git {command} failed: {stderr}")]
    GitCommand { command: String, stderr: String },

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Repository not found: {0}")]
    RepoNotFound(String),

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Branch already exists: {0}")]
    BranchExists(String),

    #[error("Branch '{branch}' is already checked out at {}", path.display())]
    BranchCheckedOutElsewhere { branch: String, path: PathBuf },

    #[error("Index is locked by another git process: {}", path.display())]
    IndexLocked { path: PathBuf },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Griptree already exists for branch: {0}")]
    GriptreeExists(String),

    #[error("Griptree not found for branch: {0}")]
    GriptreeNotFound(String),

    #[error("Griptree for branch '{0}' is locked (use --force to remove anyway)")]
    GriptreeLocked(String),

    #[error("Target directory already exists: {}", .0.display())]
    TargetExists(PathBuf),

    #[error("Invalid griptree transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Griptree registry is corrupt: {0}")]
    RegistryCorrupt(String),

    #[error("Platform error for {repo}: {message}")]
    Platform { repo: String, message: String },

    #[error("Pull request #{number} in {repo} is not mergeable: {reason}")]
    NotMergeable {
        repo: String,
        number: u64,
        reason: String,
    },
}

impl Error {
    /// Errors worth retrying after a short pause: a competing git process or
    /// a slow remote.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::IndexLocked { .. } | Error::Timeout(_))
    }

    pub fn is_checked_out_elsewhere(&self) -> bool {
        matches!(self, Error::BranchCheckedOutElsewhere { .. })
    }

    pub fn platform(repo: &str, message: impl Into<String>) -> Self {
        Error::Platform {
            repo: repo.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
