//! Short-lived memo of per-repository git status.
//!
//! A `StatusCache` lives for one command invocation and is handed to the
//! operations that need it. Entries expire after the TTL and are dropped
//! whenever an operation mutates the repository.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::git::GitOps;
use crate::repo::Repository;
use crate::util::blocking_with_timeout;
use crate::{glog_trace, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoStatus {
    pub exists: bool,
    pub branch: Option<String>,
    pub has_changes: bool,
}

impl RepoStatus {
    fn missing() -> Self {
        Self {
            exists: false,
            branch: None,
            has_changes: false,
        }
    }
}

#[derive(Clone)]
pub struct StatusCache {
    ttl: Duration,
    git_timeout: Duration,
    entries: Arc<RwLock<HashMap<String, (Instant, RepoStatus)>>>,
}

impl StatusCache {
    pub fn new(ttl: Duration, git_timeout: Duration) -> Self {
        Self {
            ttl,
            git_timeout,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn status(&self, repo: &Repository) -> Result<RepoStatus> {
        {
            let entries = self.entries.read().await;
            if let Some((at, status)) = entries.get(&repo.name) {
                if at.elapsed() < self.ttl {
                    glog_trace!("status cache hit for {}", repo.name);
                    return Ok(status.clone());
                }
            }
        }

        let path = repo.path.clone();
        let status = blocking_with_timeout(self.git_timeout, move || {
            if !path.join(".git").exists() {
                return Ok(RepoStatus::missing());
            }
            let git = GitOps::new(&path)?;
            Ok(RepoStatus {
                exists: true,
                branch: git.current_branch()?,
                has_changes: git.is_dirty()?,
            })
        })
        .await?;

        self.insert(&repo.name, status.clone()).await;
        Ok(status)
    }

    pub async fn insert(&self, name: &str, status: RepoStatus) {
        self.entries
            .write()
            .await
            .insert(name.to_string(), (Instant::now(), status));
    }

    pub async fn invalidate(&self, name: &str) {
        self.entries.write().await.remove(name);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
