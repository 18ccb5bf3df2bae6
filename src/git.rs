use std::path::{Path, PathBuf};
use std::process::Command;

use git2::{BranchType, ErrorCode, Repository, StatusOptions, WorktreeAddOptions, WorktreePruneOptions};

use crate::{glog_debug, glog_warn, Error, Result};

pub const DEFAULT_REMOTE: &str = "origin";

/// Where a new worktree's branch came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchSource {
    /// A local branch of that name already existed.
    Local,
    /// Created from the fetched remote branch, tracking it.
    Remote { upstream: String },
    /// Created fresh from the repository's current HEAD.
    Head,
}

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        glog_debug!("GitOps::new path={}", repo_path.display());
        let _ = Repository::open(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.repo_path)?)
    }

    /// Map a libgit2 failure onto the crate's taxonomy.
    fn classify(&self, err: git2::Error) -> Error {
        match err.code() {
            ErrorCode::Locked => Error::IndexLocked {
                path: self.index_lock_path(),
            },
            _ => Error::Git(err),
        }
    }

    fn index_lock_path(&self) -> PathBuf {
        self.repo()
            .map(|r| r.path().join("index.lock"))
            .unwrap_or_else(|_| self.repo_path.join(".git").join("index.lock"))
    }

    /// Fail fast with `IndexLocked` while another git process holds the index.
    fn ensure_unlocked(&self) -> Result<()> {
        let lock = self.index_lock_path();
        if lock.exists() {
            glog_debug!("index lock present: {}", lock.display());
            return Err(Error::IndexLocked { path: lock });
        }
        Ok(())
    }

    /// Name of the checked-out branch, `None` when HEAD is detached or unborn.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let repo = self.repo()?;
        let head = match repo.head() {
            Ok(head) => head,
            Err(e) if e.code() == ErrorCode::UnbornBranch => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if head.is_branch() {
            return Ok(head.shorthand().map(String::from));
        }
        Ok(None)
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let result = match repo.find_branch(branch, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        result
    }

    pub fn remote_branch_exists(&self, remote: &str, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let name = format!("{}/{}", remote, branch);
        let result = match repo.find_branch(&name, BranchType::Remote) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        result
    }

    /// Create `branch` at HEAD, optionally switching to it.
    ///
    /// # Errors
    /// `BranchExists` when a local branch of that name is already present.
    pub fn create_branch(&self, branch: &str, checkout: bool) -> Result<()> {
        glog_debug!("GitOps::create_branch branch={} checkout={}", branch, checkout);
        self.ensure_unlocked()?;
        {
            let repo = self.repo()?;
            let commit = repo.head()?.peel_to_commit()?;
            match repo.branch(branch, &commit, false) {
                Ok(_) => {}
                Err(e) if e.code() == ErrorCode::Exists => {
                    return Err(Error::BranchExists(branch.to_string()))
                }
                Err(e) => return Err(self.classify(e)),
            };
        }
        if checkout {
            self.checkout(branch)?;
        }
        Ok(())
    }

    /// Switch the working tree to an existing local branch. Uncommitted
    /// changes that would be overwritten abort the checkout.
    pub fn checkout(&self, branch: &str) -> Result<()> {
        glog_debug!("GitOps::checkout path={} branch={}", self.repo_path.display(), branch);
        self.ensure_unlocked()?;
        let repo = self.repo()?;
        let reference = match repo.find_branch(branch, BranchType::Local) {
            Ok(b) => b.into_reference(),
            Err(e) if e.code() == ErrorCode::NotFound => {
                return Err(Error::BranchNotFound(branch.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let refname = reference
            .name()
            .ok_or_else(|| Error::Validation(format!("branch '{}' has a non-UTF-8 name", branch)))?
            .to_string();
        let target = reference.peel_to_commit()?;

        let mut opts = git2::build::CheckoutBuilder::new();
        opts.safe();
        repo.checkout_tree(target.as_object(), Some(&mut opts))
            .map_err(|e| self.classify(e))?;
        repo.set_head(&refname).map_err(|e| self.classify(e))?;
        Ok(())
    }

    /// Whether the working tree has staged, unstaged or untracked changes.
    pub fn is_dirty(&self) -> Result<bool> {
        let repo = self.repo()?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    /// Commits on HEAD that are not on `base`. The remote-tracking copy of
    /// `base` is preferred when it exists.
    pub fn commits_ahead(&self, base: &str) -> Result<usize> {
        let repo = self.repo()?;
        let head = repo.head()?.peel_to_commit()?;
        let remote_name = format!("{}/{}", DEFAULT_REMOTE, base);
        let base_commit = match repo.find_branch(&remote_name, BranchType::Remote) {
            Ok(b) => b.into_reference().peel_to_commit()?,
            Err(_) => match repo.find_branch(base, BranchType::Local) {
                Ok(b) => b.into_reference().peel_to_commit()?,
                Err(e) if e.code() == ErrorCode::NotFound => {
                    return Err(Error::BranchNotFound(base.to_string()))
                }
                Err(e) => return Err(e.into()),
            },
        };
        let (ahead, _behind) = repo.graph_ahead_behind(head.id(), base_commit.id())?;
        Ok(ahead)
    }

    pub fn has_remote(&self, remote: &str) -> bool {
        self.repo()
            .map(|r| r.find_remote(remote).is_ok())
            .unwrap_or(false)
    }

    /// Fetch one branch from `remote` with the git CLI (which carries the
    /// user's credential helpers). Returns false when the remote does not
    /// have the branch.
    pub fn fetch_branch(&self, remote: &str, branch: &str) -> Result<bool> {
        if !self.has_remote(remote) {
            return Ok(false);
        }
        let git = which::which("git").map_err(|e| Error::GitCommand {
            command: "fetch".to_string(),
            stderr: e.to_string(),
        })?;
        let refspec = format!("+refs/heads/{0}:refs/remotes/{1}/{0}", branch, remote);
        glog_debug!("GitOps::fetch_branch path={} refspec={}", self.repo_path.display(), refspec);
        let output = Command::new(git)
            .args(["fetch", "--quiet", remote, &refspec])
            .current_dir(&self.repo_path)
            .output()?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("couldn't find remote ref") {
            return Ok(false);
        }
        if stderr.contains("index.lock") {
            return Err(Error::IndexLocked {
                path: self.index_lock_path(),
            });
        }
        Err(Error::GitCommand {
            command: "fetch".to_string(),
            stderr,
        })
    }

    /// Make sure a local `branch` exists for a new worktree: keep an existing
    /// one, otherwise track the remote branch, otherwise branch from HEAD.
    pub fn prepare_worktree_branch(&self, branch: &str) -> Result<BranchSource> {
        if self.branch_exists(branch)? {
            return Ok(BranchSource::Local);
        }

        // A failed fetch must not fall through to a fresh branch from HEAD.
        let fetched = self.fetch_branch(DEFAULT_REMOTE, branch)?;

        let repo = self.repo()?;
        if fetched || self.remote_branch_exists(DEFAULT_REMOTE, branch)? {
            let upstream = format!("{}/{}", DEFAULT_REMOTE, branch);
            let commit = repo
                .find_branch(&upstream, BranchType::Remote)?
                .into_reference()
                .peel_to_commit()?;
            let mut local = repo.branch(branch, &commit, false).map_err(|e| self.classify(e))?;
            local.set_upstream(Some(&upstream))?;
            glog_debug!("created {} tracking {}", branch, upstream);
            return Ok(BranchSource::Remote { upstream });
        }

        let commit = repo.head()?.peel_to_commit()?;
        repo.branch(branch, &commit, false).map_err(|e| self.classify(e))?;
        glog_debug!("created {} from HEAD {}", branch, commit.id());
        Ok(BranchSource::Head)
    }

    /// Upstream of a local branch as `remote/branch`, if it tracks one.
    pub fn upstream_of(&self, branch: &str) -> Result<Option<String>> {
        let repo = self.repo()?;
        let local = match repo.find_branch(branch, BranchType::Local) {
            Ok(b) => b,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let upstream = match local.upstream() {
            Ok(up) => up.name()?.map(String::from),
            Err(e) if e.code() == ErrorCode::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(upstream)
    }

    /// Path of the worktree (main checkout included) that has `branch` checked out.
    pub fn checked_out_at(&self, branch: &str) -> Result<Option<PathBuf>> {
        let repo = self.repo()?;
        if !repo.is_bare() {
            if let Ok(head) = repo.head() {
                if head.is_branch() && head.shorthand() == Some(branch) {
                    return Ok(repo.workdir().map(Path::to_path_buf));
                }
            }
        }
        for name in repo.worktrees()?.iter().flatten() {
            let Ok(wt) = repo.find_worktree(name) else {
                continue;
            };
            let Ok(wt_repo) = Repository::open_from_worktree(&wt) else {
                continue;
            };
            if let Ok(head) = wt_repo.head() {
                if head.is_branch() && head.shorthand() == Some(branch) {
                    return Ok(Some(wt.path().to_path_buf()));
                }
            };
        }
        Ok(None)
    }

    /// Add a worktree named `name` at `worktree_path` on the local `branch`.
    ///
    /// # Errors
    /// `BranchCheckedOutElsewhere` when git's one-checkout-per-branch rule
    /// forbids it.
    pub fn add_worktree(&self, name: &str, branch: &str, worktree_path: &Path) -> Result<()> {
        glog_debug!(
            "GitOps::add_worktree name={} branch={} path={}",
            name,
            branch,
            worktree_path.display()
        );
        if let Some(path) = self.checked_out_at(branch)? {
            return Err(Error::BranchCheckedOutElsewhere {
                branch: branch.to_string(),
                path,
            });
        }
        let repo = self.repo()?;
        let reference = match repo.find_branch(branch, BranchType::Local) {
            Ok(b) => b.into_reference(),
            Err(e) if e.code() == ErrorCode::NotFound => {
                return Err(Error::BranchNotFound(branch.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        repo.worktree(name, worktree_path, Some(&opts))
            .map_err(|e| self.classify(e))?;
        glog_debug!("Worktree created successfully");
        Ok(())
    }

    /// Remove the worktree at `worktree_path`, discarding any uncommitted
    /// work inside it. The branch is left untouched.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        glog_debug!("GitOps::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;

        let canonical = worktree_path.canonicalize().ok();
        let worktree_name: Option<String> = worktrees
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| {
                        wt.path() == worktree_path
                            || canonical
                                .as_deref()
                                .is_some_and(|c| wt.path().canonicalize().ok().as_deref() == Some(c))
                    })
                    .unwrap_or(false)
            })
            .map(String::from);

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                let pruned = worktree.prune(Some(
                    WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                ));
                if let Err(e) = pruned {
                    glog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
        } else {
            glog_warn!(
                "{} is not a registered worktree of {}",
                worktree_path.display(),
                self.repo_path.display()
            );
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        // A leftover admin dir keeps the branch marked as checked out.
        if let Some(ref name) = worktree_name {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                glog_debug!("Cleaning up worktree admin dir: {}", admin_dir.display());
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
        Ok(())
    }
}
