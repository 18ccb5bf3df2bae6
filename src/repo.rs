//! Repository registry: resolved, path-validated repository entries and
//! the filters that turn a workspace into a `RepoSelection`.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cache::StatusCache;
use crate::manifest::Workspace;
use crate::{glog_debug, Error, Result};

/// Name given to the self-tracked configuration repository when the
/// manifest does not name it.
pub const MANIFEST_REPO_NAME: &str = "manifest";

/// A repository as declared by the workspace, resolved to an absolute path.
///
/// Constructed once per command and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub url: String,
    /// Absolute path of the main checkout.
    pub path: PathBuf,
    /// Path relative to the workspace root, as declared.
    pub rel_path: PathBuf,
    pub default_branch: String,
    /// Read-only repositories are synced but never branched, committed or PR'd.
    #[serde(default)]
    pub reference: bool,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Hosting platform override (e.g. "github", "gitlab").
    #[serde(default)]
    pub platform: Option<String>,
    /// True for the workspace's self-tracked configuration repository.
    #[serde(default)]
    pub is_manifest: bool,
}

/// Declared repository before path resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoSpec {
    pub name: String,
    pub url: String,
    pub path: Option<String>,
    #[serde(default = "default_branch_name")]
    pub default_branch: String,
    #[serde(default)]
    pub reference: bool,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

fn default_branch_name() -> String {
    "main".to_string()
}

impl Repository {
    /// Resolve a declared repository against the workspace root.
    ///
    /// The declared path must stay inside the workspace.
    pub fn from_spec(spec: &RepoSpec, root: &Path) -> Result<Self> {
        if spec.name.trim().is_empty() {
            return Err(Error::Validation("repository name cannot be empty".to_string()));
        }
        let rel = PathBuf::from(spec.path.as_deref().unwrap_or(&spec.name));
        validate_relative(&spec.name, &rel)?;
        Ok(Self {
            name: spec.name.clone(),
            url: spec.url.clone(),
            path: root.join(&rel),
            rel_path: rel,
            default_branch: spec.default_branch.clone(),
            reference: spec.reference,
            groups: spec.groups.clone(),
            platform: spec.platform.clone(),
            is_manifest: false,
        })
    }

    pub fn exists(&self) -> bool {
        self.path.join(".git").exists()
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }

    /// Owner and repository identifiers parsed from the clone URL.
    pub fn owner_repo(&self) -> Option<(String, String)> {
        parse_owner_repo(&self.url)
    }
}

fn validate_relative(name: &str, rel: &Path) -> Result<()> {
    if rel.as_os_str().is_empty() {
        return Err(Error::Validation(format!("repository '{}' has an empty path", name)));
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(Error::Validation(format!(
                    "repository '{}' path '{}' escapes the workspace",
                    name,
                    rel.display()
                )))
            }
        }
    }
    Ok(())
}

fn url_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // Azure DevOps: https://dev.azure.com/org/project/_git/repo
            Regex::new(r"^.*/(?P<owner>[^/]+)/_git/(?P<repo>[^/]+?)(?:\.git)?/?$").expect("valid regex"),
            // scp-like: git@host:owner/repo.git
            Regex::new(r"^[^@/]+@[^:]+:(?:.*/)?(?P<owner>[^/]+)/(?P<repo>[^/]+?)(?:\.git)?/?$")
                .expect("valid regex"),
            // https://host/owner/repo(.git)
            Regex::new(r"^[a-z+]+://[^/]+/(?:.*/)?(?P<owner>[^/]+)/(?P<repo>[^/]+?)(?:\.git)?/?$")
                .expect("valid regex"),
        ]
    })
}

pub fn parse_owner_repo(url: &str) -> Option<(String, String)> {
    url_patterns().iter().find_map(|re| {
        re.captures(url.trim())
            .map(|caps| (caps["owner"].to_string(), caps["repo"].to_string()))
    })
}

/// An ordered set of repositories chosen for one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoSelection {
    repos: Vec<Repository>,
}

impl RepoSelection {
    pub fn new(repos: Vec<Repository>) -> Self {
        Self { repos }
    }

    pub fn len(&self) -> usize {
        self.repos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Repository> {
        self.repos.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.repos.iter().map(|r| r.name.as_str()).collect()
    }

    /// Append `repo` unless a repository of that name is already selected.
    pub fn push(&mut self, repo: Repository) {
        if !self.repos.iter().any(|r| r.name == repo.name) {
            self.repos.push(repo);
        }
    }
}

impl IntoIterator for RepoSelection {
    type Item = Repository;
    type IntoIter = std::vec::IntoIter<Repository>;

    fn into_iter(self) -> Self::IntoIter {
        self.repos.into_iter()
    }
}

/// Criteria for choosing repositories. Empty criteria select every
/// declared repository in declaration order.
#[derive(Debug, Clone, Default)]
pub struct RepoFilter {
    pub names: Vec<String>,
    pub groups: Vec<String>,
    pub only_changed: bool,
    pub only_existing: bool,
    pub exclude_reference: bool,
}

impl RepoFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn mutating() -> Self {
        Self {
            exclude_reference: true,
            ..Self::default()
        }
    }

    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Apply static criteria (names, groups, reference, existence).
    pub fn apply(&self, workspace: &Workspace) -> Result<RepoSelection> {
        let known: HashSet<&str> = workspace.repos.iter().map(|r| r.name.as_str()).collect();
        if let Some(unknown) = self.names.iter().find(|n| !known.contains(n.as_str())) {
            return Err(Error::RepoNotFound(unknown.clone()));
        }

        let repos = workspace
            .repos
            .iter()
            .filter(|r| self.names.is_empty() || self.names.contains(&r.name))
            .filter(|r| self.groups.is_empty() || self.groups.iter().any(|g| r.in_group(g)))
            .filter(|r| !(self.exclude_reference && r.reference))
            .filter(|r| !(self.only_existing || self.only_changed) || r.exists())
            .cloned()
            .collect();
        Ok(RepoSelection::new(repos))
    }

    /// Apply every criterion, consulting `cache` for working-tree state.
    pub async fn select(&self, workspace: &Workspace, cache: &StatusCache) -> Result<RepoSelection> {
        let selection = self.apply(workspace)?;
        if !self.only_changed {
            return Ok(selection);
        }
        let mut changed = Vec::new();
        for repo in selection {
            let status = cache.status(&repo).await?;
            if status.has_changes {
                changed.push(repo);
            } else {
                glog_debug!("RepoFilter: {} has no local changes, skipping", repo.name);
            }
        }
        Ok(RepoSelection::new(changed))
    }
}
