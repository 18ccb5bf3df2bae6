//! Branch consistency resolver.
//!
//! Brings every selected repository onto one branch even when they start
//! out in different states: repositories that already have the branch are
//! switched to it, the rest get it created, all in a single executor pass.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;

use crate::cache::StatusCache;
use crate::executor::{ExecutionReport, RepoSetExecutor, Step};
use crate::git::GitOps;
use crate::manifest::Workspace;
use crate::repo::{RepoSelection, Repository};
use crate::util::{blocking_with_timeout, retry_transient, Backoff};
use crate::{glog, glog_debug, Error, Result};

pub const REFERENCE_SKIP: &str = "reference repo";
pub const NOT_CLONED_SKIP: &str = "not cloned";

/// Local state of the target branch in one repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    Absent,
    Present,
    Current,
}

/// How the whole selection was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchPlan {
    /// Branch exists nowhere: create it everywhere.
    Create,
    /// Branch exists everywhere (or only checkout was asked for).
    Checkout,
    /// Some repositories have it, some do not: decide per repository.
    Mixed,
}

impl fmt::Display for BranchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchPlan::Create => write!(f, "create"),
            BranchPlan::Checkout => write!(f, "checkout"),
            BranchPlan::Mixed => write!(f, "mixed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BranchRequest {
    pub branch: String,
    /// Never create; repositories without the branch are reported as failed.
    pub checkout_only: bool,
    /// Always include the self-tracked configuration repository, not only
    /// when it has uncommitted changes.
    pub include_manifest: bool,
}

impl BranchRequest {
    pub fn create(branch: &str) -> Self {
        Self {
            branch: branch.to_string(),
            checkout_only: false,
            include_manifest: false,
        }
    }

    pub fn checkout(branch: &str) -> Self {
        Self {
            branch: branch.to_string(),
            checkout_only: true,
            include_manifest: false,
        }
    }

    pub fn with_manifest(mut self, include: bool) -> Self {
        self.include_manifest = include;
        self
    }
}

#[derive(Debug)]
pub struct BranchResolution {
    pub plan: BranchPlan,
    pub report: ExecutionReport,
}

pub struct BranchResolver {
    executor: RepoSetExecutor,
    cache: StatusCache,
    git_timeout: Duration,
    backoff: Backoff,
}

impl BranchResolver {
    pub fn new(executor: RepoSetExecutor, cache: StatusCache, git_timeout: Duration) -> Self {
        Self {
            executor,
            cache,
            git_timeout,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Decide the global plan from per-repository states.
    pub fn plan(states: &[BranchState], checkout_only: bool) -> BranchPlan {
        let present = states.iter().filter(|s| **s != BranchState::Absent).count();
        if checkout_only || present == states.len() {
            BranchPlan::Checkout
        } else if present == 0 {
            BranchPlan::Create
        } else {
            BranchPlan::Mixed
        }
    }

    /// The selection plus the configuration repository when it was asked for
    /// or carries uncommitted work.
    async fn effective_selection(
        &self,
        workspace: &Workspace,
        selection: &RepoSelection,
        include_manifest: bool,
    ) -> Result<RepoSelection> {
        let mut effective = selection.clone();
        if let Some(manifest) = &workspace.manifest_repo {
            let status = self.cache.status(manifest).await?;
            if status.exists && (include_manifest || status.has_changes) {
                if !include_manifest {
                    glog!("including {} because it has uncommitted changes", manifest.name);
                }
                effective.push(manifest.clone());
            }
        }
        Ok(effective)
    }

    async fn classify(&self, repos: &[Repository], branch: &str) -> HashMap<String, Result<BranchState>> {
        let timeout = self.git_timeout;
        let lookups = repos.iter().filter(|r| !r.reference && r.exists()).map(|repo| {
            let path = repo.path.clone();
            let name = repo.name.clone();
            let branch = branch.to_string();
            async move {
                let state = blocking_with_timeout(timeout, move || {
                    let git = GitOps::new(&path)?;
                    if !git.branch_exists(&branch)? {
                        return Ok(BranchState::Absent);
                    }
                    if git.current_branch()?.as_deref() == Some(branch.as_str()) {
                        Ok(BranchState::Current)
                    } else {
                        Ok(BranchState::Present)
                    }
                })
                .await;
                (name, state)
            }
        });
        join_all(lookups).await.into_iter().collect()
    }

    pub async fn resolve(
        &self,
        workspace: &Workspace,
        selection: &RepoSelection,
        request: &BranchRequest,
    ) -> Result<BranchResolution> {
        if request.branch.trim().is_empty() {
            return Err(Error::Validation("branch name cannot be empty".to_string()));
        }
        glog!(
            "BranchResolver::resolve branch={} repos={} checkout_only={}",
            request.branch,
            selection.len(),
            request.checkout_only
        );

        let effective = self
            .effective_selection(workspace, selection, request.include_manifest)
            .await?;
        let repos: Vec<Repository> = effective.iter().cloned().collect();
        let classified = self.classify(&repos, &request.branch).await;

        let states: Vec<BranchState> = classified
            .values()
            .filter_map(|s| s.as_ref().ok().copied())
            .collect();
        let plan = Self::plan(&states, request.checkout_only);
        glog_debug!("branch {} plan={} states={:?}", request.branch, plan, states);

        // Each task takes its own entry so inspection errors reach the report intact.
        let classified = Arc::new(Mutex::new(classified));
        let branch = request.branch.clone();
        let checkout_only = request.checkout_only;
        let cache = self.cache.clone();
        let timeout = self.git_timeout;
        let backoff = self.backoff;
        let operation = if checkout_only { "checkout" } else { "branch" };

        let report = self
            .executor
            .run(operation, &effective, move |repo| {
                let classified = Arc::clone(&classified);
                let branch = branch.clone();
                let cache = cache.clone();
                async move {
                    if repo.reference {
                        return Ok(Step::skip(REFERENCE_SKIP));
                    }
                    if !repo.exists() {
                        return Ok(Step::skip(NOT_CLONED_SKIP));
                    }
                    let entry = classified.lock().await.remove(&repo.name);
                    let state = match entry {
                        Some(state) => state?,
                        None => return Err(Error::RepoNotFound(repo.name.clone())),
                    };
                    let step = apply(&repo, &branch, state, checkout_only, timeout, backoff).await;
                    cache.invalidate(&repo.name).await;
                    step
                }
            })
            .await;

        Ok(BranchResolution { plan, report })
    }
}

async fn apply(
    repo: &Repository,
    branch: &str,
    state: BranchState,
    checkout_only: bool,
    timeout: Duration,
    backoff: Backoff,
) -> Result<Step> {
    match state {
        BranchState::Current => Ok(Step::done(format!("already on {}", branch))),
        BranchState::Present => {
            checkout(repo, branch, timeout, backoff).await?;
            Ok(Step::done(format!("checked out {}", branch)))
        }
        BranchState::Absent if checkout_only => Err(Error::BranchNotFound(branch.to_string())),
        BranchState::Absent => match create(repo, branch, timeout, backoff).await {
            Ok(()) => Ok(Step::done(format!("created {}", branch))),
            // Lost a race with another creator: the branch is there, use it.
            Err(Error::BranchExists(_)) => {
                checkout(repo, branch, timeout, backoff).await?;
                Ok(Step::done(format!("{} already existed, checked out", branch)))
            }
            Err(e) => Err(e),
        },
    }
}

async fn checkout(repo: &Repository, branch: &str, timeout: Duration, backoff: Backoff) -> Result<()> {
    retry_transient(backoff, || {
        let path = repo.path.clone();
        let branch = branch.to_string();
        blocking_with_timeout(timeout, move || GitOps::new(&path)?.checkout(&branch))
    })
    .await
}

async fn create(repo: &Repository, branch: &str, timeout: Duration, backoff: Backoff) -> Result<()> {
    retry_transient(backoff, || {
        let path = repo.path.clone();
        let branch = branch.to_string();
        blocking_with_timeout(timeout, move || GitOps::new(&path)?.create_branch(&branch, true))
    })
    .await
}
