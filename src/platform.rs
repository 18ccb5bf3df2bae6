//! Hosting platform capability used by the linked PR coordinator.
//!
//! Concrete adapters (GitHub, GitLab, Azure DevOps, Bitbucket) live outside
//! this crate. Each repository resolves to one adapter through
//! [`PlatformRegistry`]; repositories in the same link set may use
//! different platforms.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::repo::Repository;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

impl fmt::Display for PrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrState::Open => write!(f, "open"),
            PrState::Merged => write!(f, "merged"),
            PrState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub title: String,
    pub state: PrState,
    pub mergeable: bool,
    pub head: String,
    pub base: String,
    #[serde(default)]
    pub body: String,
}

/// Input to `create_pr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPullRequest {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
    pub draft: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Commented,
    Dismissed,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub author: String,
    pub state: ReviewState,
}

/// Approved when at least one reviewer approves and no reviewer's latest
/// verdict requests changes. Comments and pending reviews do not count.
pub fn is_approved(reviews: &[Review]) -> bool {
    let mut latest: HashMap<&str, ReviewState> = HashMap::new();
    for review in reviews {
        match review.state {
            ReviewState::Approved | ReviewState::ChangesRequested | ReviewState::Dismissed => {
                latest.insert(review.author.as_str(), review.state);
            }
            ReviewState::Commented | ReviewState::Pending => {}
        }
    }
    latest.values().any(|s| *s == ReviewState::Approved)
        && !latest.values().any(|s| *s == ReviewState::ChangesRequested)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Success,
    Pending,
    Failure,
}

impl CheckStatus {
    /// Fold individual check runs: any failure wins, then any pending.
    /// No checks at all counts as success.
    pub fn aggregate<I: IntoIterator<Item = CheckStatus>>(runs: I) -> CheckStatus {
        runs.into_iter().fold(CheckStatus::Success, |acc, run| match (acc, run) {
            (CheckStatus::Failure, _) | (_, CheckStatus::Failure) => CheckStatus::Failure,
            (CheckStatus::Pending, _) | (_, CheckStatus::Pending) => CheckStatus::Pending,
            _ => CheckStatus::Success,
        })
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckStatus::Success => write!(f, "success"),
            CheckStatus::Pending => write!(f, "pending"),
            CheckStatus::Failure => write!(f, "failure"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeMethod {
    #[default]
    Merge,
    Squash,
    Rebase,
}

impl fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeMethod::Merge => write!(f, "merge"),
            MergeMethod::Squash => write!(f, "squash"),
            MergeMethod::Rebase => write!(f, "rebase"),
        }
    }
}

/// Pull request operations of one hosting platform.
///
/// Every call names the repository by `owner`/`repo` as derived from its
/// clone URL. Implementations report HTTP and API failures as
/// `Error::Platform` and must not retry internally.
#[async_trait::async_trait]
pub trait HostingPlatform: Send + Sync {
    fn name(&self) -> &str;

    async fn create_pr(&self, owner: &str, repo: &str, pr: &NewPullRequest) -> Result<PullRequest>;

    async fn get_pr(&self, owner: &str, repo: &str, number: u64) -> Result<PullRequest>;

    /// The open pull request whose head is `branch`, if any.
    async fn find_pr_by_branch(&self, owner: &str, repo: &str, branch: &str) -> Result<Option<PullRequest>>;

    async fn list_reviews(&self, owner: &str, repo: &str, number: u64) -> Result<Vec<Review>>;

    async fn get_check_status(&self, owner: &str, repo: &str, number: u64) -> Result<CheckStatus>;

    /// Ask the platform to merge. Success here does not prove the PR merged.
    async fn merge_pr(&self, owner: &str, repo: &str, number: u64, method: MergeMethod) -> Result<()>;

    async fn update_pr_body(&self, owner: &str, repo: &str, number: u64, body: &str) -> Result<()>;
}

/// Resolves the platform adapter for each repository: a named override from
/// the repository's `platform` field, else the default.
#[derive(Clone, Default)]
pub struct PlatformRegistry {
    default: Option<Arc<dyn HostingPlatform>>,
    named: HashMap<String, Arc<dyn HostingPlatform>>,
}

impl PlatformRegistry {
    pub fn new(default: Arc<dyn HostingPlatform>) -> Self {
        Self {
            default: Some(default),
            named: HashMap::new(),
        }
    }

    pub fn with_platform(mut self, name: &str, platform: Arc<dyn HostingPlatform>) -> Self {
        self.named.insert(name.to_string(), platform);
        self
    }

    pub fn for_repo(&self, repo: &Repository) -> Result<Arc<dyn HostingPlatform>> {
        match &repo.platform {
            Some(name) => self.named.get(name).cloned().ok_or_else(|| {
                Error::platform(&repo.name, format!("no adapter registered for platform '{}'", name))
            }),
            None => self
                .default
                .clone()
                .ok_or_else(|| Error::platform(&repo.name, "no default platform adapter registered")),
        }
    }
}

impl fmt::Debug for PlatformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformRegistry")
            .field("default", &self.default.as_ref().map(|p| p.name().to_string()))
            .field("named", &self.named.keys().collect::<Vec<_>>())
            .finish()
    }
}
