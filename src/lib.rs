pub mod branch;
pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod git;
pub mod griptree;
pub mod log;
pub mod manifest;
pub mod platform;
pub mod pr;
pub mod repo;
pub mod util;

pub use error::{Error, Result};
pub use executor::{ExecutionReport, Outcome, RepoSetExecutor};
pub use manifest::{ManifestProvider, TomlManifest, Workspace};
pub use repo::{RepoFilter, RepoSelection, Repository};
