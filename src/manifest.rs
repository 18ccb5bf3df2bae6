//! Workspace description consumed by the orchestration engine.
//!
//! The engine treats a `Workspace` as read-only input for one command. Where
//! it comes from is the concern of a `ManifestProvider`; `TomlManifest` reads
//! `<root>/.gitgrip/workspace.toml`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::platform::MergeMethod;
use crate::pr::MergeStrategy;
use crate::repo::{RepoSpec, Repository, MANIFEST_REPO_NAME};
use crate::{glog_debug, Error, Result};

pub const GRIP_DIR: &str = ".gitgrip";
pub const WORKSPACE_FILE: &str = "workspace.toml";
const DEFAULT_MANIFEST_PATH: &str = ".gitgrip/manifests";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSettings {
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default)]
    pub default_merge_method: MergeMethod,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub root: PathBuf,
    /// Declared repositories in declaration order.
    pub repos: Vec<Repository>,
    /// The self-tracked configuration repository, if the workspace has one.
    pub manifest_repo: Option<Repository>,
    pub settings: WorkspaceSettings,
}

impl Workspace {
    pub fn grip_dir(&self) -> PathBuf {
        self.root.join(GRIP_DIR)
    }

    pub fn find(&self, name: &str) -> Option<&Repository> {
        self.repos
            .iter()
            .chain(self.manifest_repo.iter())
            .find(|r| r.name == name)
    }

    /// Declared repositories followed by the configuration repository.
    pub fn all_repos(&self) -> impl Iterator<Item = &Repository> {
        self.repos.iter().chain(self.manifest_repo.iter())
    }
}

/// Supplies the workspace for one command invocation.
pub trait ManifestProvider {
    fn load(&self) -> Result<Workspace>;
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    workspace: WorkspaceSettings,
    #[serde(default)]
    manifest: Option<ManifestRepoSpec>,
    #[serde(default)]
    repos: Vec<RepoSpec>,
}

#[derive(Debug, Deserialize)]
struct ManifestRepoSpec {
    url: String,
    name: Option<String>,
    path: Option<String>,
    #[serde(default = "default_manifest_branch")]
    default_branch: String,
    platform: Option<String>,
}

fn default_manifest_branch() -> String {
    "main".to_string()
}

/// Reads the workspace from `<root>/.gitgrip/workspace.toml`.
pub struct TomlManifest {
    root: PathBuf,
}

impl TomlManifest {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.root.join(GRIP_DIR).join(WORKSPACE_FILE)
    }

    /// Walk up from `start` to the nearest directory with a workspace file.
    pub fn discover(start: &Path) -> Result<Self> {
        let mut current = Some(start);
        while let Some(dir) = current {
            if dir.join(GRIP_DIR).join(WORKSPACE_FILE).is_file() {
                return Ok(Self::new(dir));
            }
            current = dir.parent();
        }
        Err(Error::Validation(format!(
            "no {}/{} found in {} or any parent",
            GRIP_DIR,
            WORKSPACE_FILE,
            start.display()
        )))
    }

    pub fn parse(root: &Path, contents: &str) -> Result<Workspace> {
        let file: ManifestFile = toml::from_str(contents)?;

        let mut seen = HashSet::new();
        let mut repos = Vec::with_capacity(file.repos.len());
        for spec in &file.repos {
            if !seen.insert(spec.name.clone()) {
                return Err(Error::Validation(format!(
                    "repository '{}' is declared more than once",
                    spec.name
                )));
            }
            repos.push(Repository::from_spec(spec, root)?);
        }

        let manifest_repo = match file.manifest {
            Some(m) => {
                let spec = RepoSpec {
                    name: m.name.unwrap_or_else(|| MANIFEST_REPO_NAME.to_string()),
                    url: m.url,
                    path: Some(m.path.unwrap_or_else(|| DEFAULT_MANIFEST_PATH.to_string())),
                    default_branch: m.default_branch,
                    reference: false,
                    groups: Vec::new(),
                    platform: m.platform,
                };
                if seen.contains(&spec.name) {
                    return Err(Error::Validation(format!(
                        "manifest repository name '{}' collides with a declared repository",
                        spec.name
                    )));
                }
                let mut repo = Repository::from_spec(&spec, root)?;
                repo.is_manifest = true;
                Some(repo)
            }
            None => None,
        };

        Ok(Workspace {
            root: root.to_path_buf(),
            repos,
            manifest_repo,
            settings: file.workspace,
        })
    }
}

impl ManifestProvider for TomlManifest {
    fn load(&self) -> Result<Workspace> {
        let path = self.path();
        glog_debug!("TomlManifest::load path={}", path.display());
        let workspace = Self::parse(&self.root, &fs::read_to_string(&path)?)?;
        glog_debug!(
            "Workspace loaded: {} repos, manifest repo: {}",
            workspace.repos.len(),
            workspace.manifest_repo.is_some()
        );
        Ok(workspace)
    }
}
