//! Griptrees: parallel multi-repository workspaces built from git worktrees.
//!
//! A griptree for branch `feat/x` is a directory (by default `../feat-x`
//! next to the main workspace) holding one worktree per repository, plus
//! one for the self-tracked configuration repository, all on `feat/x`.
//!
//! Removing a griptree force-removes its worktrees: uncommitted changes
//! inside them are discarded. Branches are never deleted.

mod registry;
mod state;

pub use registry::{
    sanitize_branch, Griptree, GriptreeHealth, GriptreePointer, GriptreeRegistry, LEGACY_POINTER_FILE,
    POINTER_FILE, REGISTRY_FILE,
};
pub use state::GriptreeState;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::branch::{NOT_CLONED_SKIP, REFERENCE_SKIP};
use crate::executor::{ExecutionReport, RepoSetExecutor, Step};
use crate::git::{BranchSource, GitOps};
use crate::manifest::Workspace;
use crate::repo::{RepoSelection, Repository};
use crate::util::{blocking, blocking_with_timeout, retry_transient, Backoff};
use crate::{glog, glog_debug, glog_warn, Error, Result};

/// Result of `add`. `griptree` is `None` when nothing could be created and
/// the attempt was rolled back.
#[derive(Debug)]
pub struct GriptreeAdd {
    pub griptree: Option<Griptree>,
    pub report: ExecutionReport,
}

impl GriptreeAdd {
    pub fn is_partial(&self) -> bool {
        self.griptree.is_some() && !self.report.is_success()
    }
}

#[derive(Debug)]
pub struct GriptreeRemove {
    /// False when worktree removal failed and the griptree was kept.
    pub removed: bool,
    pub report: ExecutionReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct GriptreeListing {
    pub griptree: Griptree,
    pub health: GriptreeHealth,
    /// Found through a pointer marker and written into the registry by this listing.
    pub adopted: bool,
}

/// Where `repo`'s worktree lives inside a griptree.
pub fn worktree_path(repo: &Repository, griptree_dir: &Path) -> PathBuf {
    if repo.is_manifest {
        griptree_dir.join(&repo.rel_path)
    } else {
        griptree_dir.join(&repo.name)
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

pub struct GriptreeManager {
    workspace: Workspace,
    executor: RepoSetExecutor,
    git_timeout: Duration,
    backoff: Backoff,
}

impl GriptreeManager {
    pub fn new(workspace: Workspace, executor: RepoSetExecutor, git_timeout: Duration) -> Self {
        Self {
            workspace,
            executor,
            git_timeout,
            backoff: Backoff::default(),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        GriptreeRegistry::path_for(&self.workspace.grip_dir())
    }

    fn load_registry(&self) -> Result<GriptreeRegistry> {
        GriptreeRegistry::load(&self.registry_path())
    }

    /// Sibling of the workspace root named after the sanitized branch.
    pub fn default_dir(&self, branch: &str) -> Result<PathBuf> {
        let parent = self.workspace.root.parent().ok_or_else(|| {
            Error::Validation(format!(
                "workspace root {} has no parent directory for griptrees",
                self.workspace.root.display()
            ))
        })?;
        Ok(parent.join(sanitize_branch(branch)))
    }

    pub fn get(&self, branch: &str) -> Result<Option<Griptree>> {
        Ok(self.load_registry()?.get(branch).cloned())
    }

    pub async fn add(&self, branch: &str, path: Option<&Path>, selection: &RepoSelection) -> Result<GriptreeAdd> {
        let branch = branch.trim();
        if branch.is_empty() {
            return Err(Error::Validation("branch name cannot be empty".to_string()));
        }
        glog!("GriptreeManager::add branch={} repos={}", branch, selection.len());

        let mut state = GriptreeState::Absent;
        let mut registry = self.load_registry()?;
        if let Some(existing) = registry.get(branch) {
            return Err(Error::GriptreeExists(existing.branch.clone()));
        }
        let dir = match path {
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => std::env::current_dir()?.join(p),
            None => self.default_dir(branch)?,
        };
        if dir.exists() {
            return Err(Error::TargetExists(dir));
        }

        state.transition(GriptreeState::Creating)?;
        fs::create_dir_all(&dir)?;

        let mut repos = selection.clone();
        if let Some(manifest) = &self.workspace.manifest_repo {
            if manifest.exists() {
                repos.push(manifest.clone());
            }
        }

        let report = self.create_worktrees(branch, &dir, &repos).await;
        let created: Vec<Repository> = report.successful_repos().cloned().collect();

        if created.is_empty() {
            glog_warn!("griptree {}: no worktree could be created, rolling back", branch);
            self.rollback(&dir, &[]).await;
            state.transition(GriptreeState::Absent)?;
            return Ok(GriptreeAdd {
                griptree: None,
                report,
            });
        }

        match self.persist_new(&mut registry, branch, &dir, &created).await {
            Ok(griptree) => {
                state.transition(GriptreeState::Active { locked: false })?;
                if !report.is_success() {
                    glog_warn!(
                        "griptree {} created with {} of {} worktrees",
                        branch,
                        created.len(),
                        report.len()
                    );
                }
                Ok(GriptreeAdd {
                    griptree: Some(griptree),
                    report,
                })
            }
            Err(e) => {
                glog_warn!("griptree {}: could not be registered ({}), rolling back", branch, e);
                self.rollback(&dir, &created).await;
                state.transition(GriptreeState::Absent)?;
                Err(e)
            }
        }
    }

    async fn create_worktrees(&self, branch: &str, dir: &Path, repos: &RepoSelection) -> ExecutionReport {
        let dir = Arc::new(dir.to_path_buf());
        let branch = branch.to_string();
        let worktree_name = sanitize_branch(&branch);
        let timeout = self.git_timeout;
        let backoff = self.backoff;

        self.executor
            .run("tree add", repos, move |repo| {
                let dir = Arc::clone(&dir);
                let branch = branch.clone();
                let worktree_name = worktree_name.clone();
                async move {
                    if repo.reference {
                        return Ok(Step::skip(REFERENCE_SKIP));
                    }
                    if !repo.exists() {
                        return Ok(Step::skip(NOT_CLONED_SKIP));
                    }
                    let target = worktree_path(&repo, &dir);

                    let source = retry_transient(backoff, || {
                        let path = repo.path.clone();
                        let branch = branch.clone();
                        blocking_with_timeout(timeout, move || {
                            GitOps::new(&path)?.prepare_worktree_branch(&branch)
                        })
                    })
                    .await?;

                    retry_transient(backoff, || {
                        let path = repo.path.clone();
                        let branch = branch.clone();
                        let name = worktree_name.clone();
                        let target = target.clone();
                        blocking_with_timeout(timeout, move || {
                            GitOps::new(&path)?.add_worktree(&name, &branch, &target)
                        })
                    })
                    .await?;

                    let detail = match source {
                        BranchSource::Local => format!("worktree on existing {}", branch),
                        BranchSource::Remote { upstream } => format!("worktree tracking {}", upstream),
                        BranchSource::Head => format!("worktree on new {}", branch),
                    };
                    Ok(Step::done(detail))
                }
            })
            .await
    }

    async fn persist_new(
        &self,
        registry: &mut GriptreeRegistry,
        branch: &str,
        dir: &Path,
        created: &[Repository],
    ) -> Result<Griptree> {
        let mut griptree = Griptree::new(branch, dir);
        for repo in created {
            griptree
                .worktrees
                .insert(repo.name.clone(), worktree_path(repo, dir));
        }

        let lookups: Vec<(String, PathBuf)> = created
            .iter()
            .map(|r| (r.name.clone(), r.path.clone()))
            .collect();
        let branch_owned = branch.to_string();
        let upstreams = blocking(move || {
            let mut found = Vec::new();
            for (name, path) in lookups {
                if let Some(upstream) = GitOps::new(&path)?.upstream_of(&branch_owned)? {
                    found.push((name, upstream));
                }
            }
            Ok(found)
        })
        .await?;
        griptree.upstreams.extend(upstreams);

        GriptreePointer::new(&self.workspace.root, branch).write(dir)?;
        registry.insert(griptree.clone())?;
        registry.save()?;
        glog!("griptree {} registered at {}", branch, dir.display());
        Ok(griptree)
    }

    /// Undo a failed `add`: remove worktrees that were made, then the directory.
    async fn rollback(&self, dir: &Path, created: &[Repository]) {
        let pairs: Vec<(PathBuf, PathBuf)> = created
            .iter()
            .map(|r| (r.path.clone(), worktree_path(r, dir)))
            .collect();
        let dir = dir.to_path_buf();
        let result = blocking(move || {
            for (repo_path, wt) in pairs {
                if let Err(e) = GitOps::new(&repo_path).and_then(|git| git.remove_worktree(&wt)) {
                    glog_warn!("rollback: could not remove worktree {}: {}", wt.display(), e);
                }
            }
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            Ok(())
        })
        .await;
        if let Err(e) = result {
            glog_warn!("rollback incomplete: {}", e);
        }
    }

    /// Remove a griptree's worktrees, its directory and its registry entry.
    ///
    /// Worktrees are removed forcibly, so uncommitted changes inside the
    /// griptree are lost. Without `force`, a locked griptree is refused and a
    /// failed worktree removal keeps the griptree registered.
    pub async fn remove(&self, branch: &str, force: bool) -> Result<GriptreeRemove> {
        glog!("GriptreeManager::remove branch={} force={}", branch, force);
        let mut registry = self.load_registry()?;
        let griptree = registry
            .get(branch)
            .cloned()
            .ok_or_else(|| Error::GriptreeNotFound(branch.to_string()))?;
        if griptree.locked && !force {
            return Err(Error::GriptreeLocked(griptree.branch));
        }

        let mut state = GriptreeState::Active {
            locked: griptree.locked,
        };
        state.transition(GriptreeState::Removing)?;
        glog_warn!(
            "removing griptree {} at {}: uncommitted changes in its worktrees are discarded",
            griptree.branch,
            griptree.path.display()
        );

        let known: HashSet<&str> = self.workspace.all_repos().map(|r| r.name.as_str()).collect();
        for name in griptree.worktrees.keys().filter(|n| !known.contains(n.as_str())) {
            glog_warn!("griptree {}: repository {} is no longer in the workspace", griptree.branch, name);
        }
        let selection = RepoSelection::new(
            self.workspace
                .all_repos()
                .filter(|r| griptree.worktrees.contains_key(&r.name))
                .cloned()
                .collect(),
        );

        let worktrees = Arc::new(griptree.worktrees.clone());
        let timeout = self.git_timeout;
        let backoff = self.backoff;
        let report = self
            .executor
            .run("tree remove", &selection, move |repo| {
                let worktrees = Arc::clone(&worktrees);
                async move {
                    let Some(wt) = worktrees.get(&repo.name).cloned() else {
                        return Ok(Step::skip("no worktree"));
                    };
                    if !repo.exists() {
                        return Ok(Step::skip("repository not cloned"));
                    }
                    retry_transient(backoff, || {
                        let path = repo.path.clone();
                        let wt = wt.clone();
                        blocking_with_timeout(timeout, move || GitOps::new(&path)?.remove_worktree(&wt))
                    })
                    .await?;
                    Ok(Step::done(format!("removed {}", wt.display())))
                }
            })
            .await;

        if !report.is_success() && !force {
            glog_warn!("griptree {} kept: some worktrees could not be removed", griptree.branch);
            return Ok(GriptreeRemove {
                removed: false,
                report,
            });
        }

        if griptree.path.exists() {
            fs::remove_dir_all(&griptree.path)?;
        }
        registry.remove(branch);
        registry.save()?;
        state.transition(GriptreeState::Absent)?;
        glog!("griptree {} removed", griptree.branch);
        Ok(GriptreeRemove {
            removed: true,
            report,
        })
    }

    /// Set the lock bit. Returns whether anything changed; setting the bit
    /// to its current value is a successful no-op.
    pub fn set_locked(&self, branch: &str, locked: bool) -> Result<bool> {
        let mut registry = self.load_registry()?;
        let griptree = registry
            .get_mut(branch)
            .ok_or_else(|| Error::GriptreeNotFound(branch.to_string()))?;
        let mut state = GriptreeState::Active {
            locked: griptree.locked,
        };
        state.transition(GriptreeState::Active { locked })?;
        if griptree.locked == locked {
            glog_debug!("griptree {} already {}", branch, state);
            return Ok(false);
        }
        griptree.locked = locked;
        let dir = griptree.path.clone();
        registry.save()?;

        if let Ok(Some(mut pointer)) = GriptreePointer::read(&dir) {
            if !GriptreePointer::is_legacy(&dir) {
                pointer.locked = locked;
                if let Err(e) = pointer.write(&dir) {
                    glog_warn!("could not update pointer in {}: {}", dir.display(), e);
                }
            }
        }
        glog!("griptree {} is now {}", branch, state);
        Ok(true)
    }

    pub fn lock(&self, branch: &str) -> Result<bool> {
        self.set_locked(branch, true)
    }

    pub fn unlock(&self, branch: &str) -> Result<bool> {
        self.set_locked(branch, false)
    }

    /// Registry entries plus griptrees next to the workspace that only carry
    /// a pointer marker. The latter are adopted into the registry, and each
    /// adoption is logged. The registry wins whenever both know a branch.
    pub fn list(&self) -> Result<Vec<GriptreeListing>> {
        let mut registry = self.load_registry()?;
        let discovered = self.discover_unregistered(&registry)?;

        let mut adopted = HashSet::new();
        for griptree in &discovered {
            glog_warn!(
                "reconcile: adopting griptree '{}' at {} into the registry",
                griptree.branch,
                griptree.path.display()
            );
            adopted.insert(griptree.key());
            registry.insert(griptree.clone())?;
        }
        if !discovered.is_empty() {
            registry.save()?;
        }

        Ok(registry
            .iter()
            .map(|gt| GriptreeListing {
                health: gt.health(),
                adopted: adopted.contains(&gt.key()),
                griptree: gt.clone(),
            })
            .collect())
    }

    fn discover_unregistered(&self, registry: &GriptreeRegistry) -> Result<Vec<Griptree>> {
        let Some(parent) = self.workspace.root.parent() else {
            return Ok(Vec::new());
        };
        let mut found: Vec<Griptree> = Vec::new();
        let mut entries: Vec<PathBuf> = fs::read_dir(parent)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir() && !same_path(p, &self.workspace.root))
            .collect();
        entries.sort();

        for dir in entries {
            let pointer = match GriptreePointer::read(&dir) {
                Ok(Some(pointer)) => pointer,
                Ok(None) => continue,
                Err(e) => {
                    glog_debug!("ignoring unreadable pointer in {}: {}", dir.display(), e);
                    continue;
                }
            };
            if !same_path(&pointer.main_workspace, &self.workspace.root) {
                continue;
            }
            if let Some(registered) = registry.get(&pointer.branch) {
                if !same_path(&registered.path, &dir) {
                    glog_warn!(
                        "reconcile: {} claims branch '{}' but the registry places it at {}; keeping the registry entry",
                        dir.display(),
                        pointer.branch,
                        registered.path.display()
                    );
                }
                continue;
            }
            let key = sanitize_branch(&pointer.branch);
            if let Some(other) = found.iter().find(|g| g.key() == key) {
                return Err(Error::RegistryCorrupt(format!(
                    "{} and {} both claim griptree branch '{}'",
                    other.path.display(),
                    dir.display(),
                    pointer.branch
                )));
            }

            let mut griptree = Griptree::new(&pointer.branch, &dir);
            griptree.locked = pointer.locked;
            griptree.created_at = pointer.created_at;
            for repo in self.workspace.all_repos() {
                let wt = worktree_path(repo, &dir);
                if wt.join(".git").exists() {
                    griptree.worktrees.insert(repo.name.clone(), wt);
                }
            }
            found.push(griptree);
        }
        Ok(found)
    }
}
