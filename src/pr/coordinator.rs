//! Creates, discovers and merges linked pull requests.
//!
//! Nothing here is stored locally. A link set is rebuilt on demand by asking
//! each repository's platform for the open PR on its current branch; the
//! marker written into one PR body is only an index for humans and tools.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::branch::{NOT_CLONED_SKIP, REFERENCE_SKIP};
use crate::executor::{ExecutionReport, RepoSetExecutor, Step};
use crate::git::GitOps;
use crate::manifest::Workspace;
use crate::platform::{is_approved, CheckStatus, HostingPlatform, NewPullRequest, PlatformRegistry, PullRequest};
use crate::pr::link::{parse_marker, with_marker, LinkSet, LinkedPr};
use crate::pr::merge::{MergeCandidate, MergeOptions, MergeReport, Merger};
use crate::repo::{RepoSelection, Repository};
use crate::util::{blocking_with_timeout, retry_transient, with_timeout, Backoff};
use crate::{glog, glog_debug, glog_warn, Error, Result};

#[derive(Debug, Clone, Default)]
pub struct PrOptions {
    /// Defaults to the branch name.
    pub title: Option<String>,
    pub body: String,
    pub draft: bool,
    /// Target branch instead of each repository's default branch.
    pub base_override: Option<String>,
}

#[derive(Debug)]
pub struct PrCreation {
    pub link_set: LinkSet,
    pub report: ExecutionReport,
}

#[derive(Debug)]
pub struct PrStatus {
    pub link_set: LinkSet,
    pub report: ExecutionReport,
}

impl PrStatus {
    /// Every member approved, green and mergeable, and no status query failed.
    pub fn is_ready(&self) -> bool {
        self.report.is_success() && self.link_set.is_ready()
    }
}

/// Pull requests found or opened during one pass, keyed by repository name.
type Found = Arc<Mutex<HashMap<String, (LinkedPr, String)>>>;

struct LocalState {
    branch: Option<String>,
    ahead: usize,
    dirty: bool,
}

pub struct PrCoordinator {
    platforms: PlatformRegistry,
    executor: RepoSetExecutor,
    git_timeout: Duration,
    platform_timeout: Duration,
    read_backoff: Backoff,
    verify_backoff: Backoff,
}

impl PrCoordinator {
    pub fn new(
        platforms: PlatformRegistry,
        executor: RepoSetExecutor,
        git_timeout: Duration,
        platform_timeout: Duration,
    ) -> Self {
        Self {
            platforms,
            executor,
            git_timeout,
            platform_timeout,
            read_backoff: Backoff {
                attempts: 3,
                base: Duration::from_millis(200),
            },
            verify_backoff: Backoff {
                attempts: 3,
                base: Duration::from_millis(500),
            },
        }
    }

    pub fn with_verify_backoff(mut self, backoff: Backoff) -> Self {
        self.verify_backoff = backoff;
        self
    }

    /// `selection` followed by the configuration repository. Reference
    /// repositories stay in so the report shows them as skipped.
    fn scope(workspace: &Workspace, selection: &RepoSelection) -> RepoSelection {
        let mut scope = selection.clone();
        if let Some(manifest) = &workspace.manifest_repo {
            if manifest.exists() {
                scope.push(manifest.clone());
            }
        }
        scope
    }

    /// Open a PR from the current branch in every repository with work to
    /// propose, then record the link set marker in one PR body.
    pub async fn create(
        &self,
        workspace: &Workspace,
        selection: &RepoSelection,
        options: &PrOptions,
    ) -> Result<PrCreation> {
        let scope = Self::scope(workspace, selection);
        glog!("PrCoordinator::create repos={}", scope.len());

        let found: Found = Arc::new(Mutex::new(HashMap::new()));
        let platforms = self.platforms.clone();
        let options = Arc::new(options.clone());
        let sink = Arc::clone(&found);
        let git_timeout = self.git_timeout;
        let timeout = self.platform_timeout;
        let backoff = self.read_backoff;

        let report = self
            .executor
            .run("pr create", &scope, move |repo| {
                let platforms = platforms.clone();
                let options = Arc::clone(&options);
                let sink = Arc::clone(&sink);
                async move {
                    if repo.reference {
                        return Ok(Step::skip(REFERENCE_SKIP));
                    }
                    if !repo.exists() {
                        return Ok(Step::skip(NOT_CLONED_SKIP));
                    }
                    let local = local_state(&repo, git_timeout).await?;
                    let Some(branch) = local.branch else {
                        return Ok(Step::skip("detached HEAD"));
                    };
                    if branch == repo.default_branch {
                        return Ok(Step::skip("on default branch"));
                    }
                    if local.ahead == 0 && !(repo.is_manifest && local.dirty) {
                        return Ok(Step::skip(format!("no commits ahead of {}", repo.default_branch)));
                    }

                    let platform = platforms.for_repo(&repo)?;
                    let (owner, name) = owner_repo(&repo)?;
                    let existing =
                        read(backoff, timeout, || platform.find_pr_by_branch(&owner, &name, &branch)).await?;
                    if let Some(pr) = existing {
                        let detail = format!("#{} already open", pr.number);
                        sink.lock().await.insert(repo.name.clone(), linked(&repo, &owner, &name, &pr));
                        return Ok(Step::done(detail));
                    }

                    let request = NewPullRequest {
                        head: branch.clone(),
                        base: options
                            .base_override
                            .clone()
                            .unwrap_or_else(|| repo.default_branch.clone()),
                        title: options.title.clone().unwrap_or_else(|| branch.clone()),
                        body: options.body.clone(),
                        draft: options.draft,
                    };
                    let pr = with_timeout(timeout, platform.create_pr(&owner, &name, &request)).await?;
                    let detail = format!("opened #{} {}", pr.number, pr.url);
                    sink.lock().await.insert(repo.name.clone(), linked(&repo, &owner, &name, &pr));
                    Ok(Step::done(detail))
                }
            })
            .await;

        let link_set = assemble(&scope, &found).await;
        if !link_set.is_empty() {
            self.write_marker(workspace, &link_set, &found).await;
        }
        Ok(PrCreation { link_set, report })
    }

    /// Put the marker into the configuration repository's PR, or the first
    /// member's. Failing to do so is logged and otherwise ignored.
    async fn write_marker(&self, workspace: &Workspace, link_set: &LinkSet, found: &Found) {
        let designated = link_set
            .members
            .iter()
            .find(|m| workspace.manifest_repo.as_ref().is_some_and(|r| r.name == m.repo))
            .or_else(|| link_set.members.first());
        let Some(member) = designated else {
            return;
        };
        let Some(repo) = workspace.find(&member.repo) else {
            return;
        };
        let body = found
            .lock()
            .await
            .get(&member.repo)
            .map(|(_, body)| body.clone())
            .unwrap_or_default();
        let updated = with_marker(&body, &link_set.marker());

        let result = match self.platforms.for_repo(repo) {
            Ok(platform) => {
                with_timeout(
                    self.platform_timeout,
                    platform.update_pr_body(&member.owner, &member.repo_name, member.number, &updated),
                )
                .await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => glog_debug!("link marker written to {}#{}", member.repo, member.number),
            Err(e) => glog_warn!("could not write link marker to {}#{}: {}", member.repo, member.number, e),
        }
    }

    /// Rebuild the link set from the platforms.
    pub async fn discover(&self, workspace: &Workspace, selection: &RepoSelection) -> Result<PrStatus> {
        self.collect("pr discover", workspace, selection, false).await
    }

    /// Discover, then fetch approvals and checks for every member.
    pub async fn status(&self, workspace: &Workspace, selection: &RepoSelection) -> Result<PrStatus> {
        self.collect("pr status", workspace, selection, true).await
    }

    async fn collect(
        &self,
        operation: &str,
        workspace: &Workspace,
        selection: &RepoSelection,
        with_reviews: bool,
    ) -> Result<PrStatus> {
        let scope = Self::scope(workspace, selection);
        glog!("PrCoordinator::{} repos={}", operation, scope.len());

        let found: Found = Arc::new(Mutex::new(HashMap::new()));
        let platforms = self.platforms.clone();
        let sink = Arc::clone(&found);
        let git_timeout = self.git_timeout;
        let timeout = self.platform_timeout;
        let backoff = self.read_backoff;

        let report = self
            .executor
            .run(operation, &scope, move |repo| {
                let platforms = platforms.clone();
                let sink = Arc::clone(&sink);
                async move {
                    if repo.reference {
                        return Ok(Step::skip(REFERENCE_SKIP));
                    }
                    if !repo.exists() {
                        return Ok(Step::skip(NOT_CLONED_SKIP));
                    }
                    let branch = current_branch(&repo, git_timeout).await?;
                    let Some(branch) = branch else {
                        return Ok(Step::skip("detached HEAD"));
                    };
                    if branch == repo.default_branch {
                        return Ok(Step::skip("on default branch"));
                    }

                    let platform = platforms.for_repo(&repo)?;
                    let (owner, name) = owner_repo(&repo)?;
                    let Some(pr) = read(backoff, timeout, || platform.find_pr_by_branch(&owner, &name, &branch)).await?
                    else {
                        return Ok(Step::skip(format!("no open pull request for {}", branch)));
                    };

                    let (mut member, body) = linked(&repo, &owner, &name, &pr);
                    if with_reviews {
                        enrich(&mut member, platform.as_ref(), backoff, timeout).await?;
                    }
                    let detail = if with_reviews {
                        let blockers = member.blockers(false);
                        if blockers.is_empty() {
                            format!("#{} ready", member.number)
                        } else {
                            format!("#{} {}", member.number, blockers.join(", "))
                        }
                    } else {
                        format!("#{} {}", member.number, member.url)
                    };
                    sink.lock().await.insert(repo.name.clone(), (member, body));
                    Ok(Step::done(detail))
                }
            })
            .await;

        let link_set = assemble(&scope, &found).await;
        check_markers(&link_set, &found).await;
        Ok(PrStatus { link_set, report })
    }

    /// Merge the link set with the workspace's strategy unless `options`
    /// overrides it.
    pub async fn merge(
        &self,
        workspace: &Workspace,
        selection: &RepoSelection,
        options: &MergeOptions,
    ) -> Result<MergeReport> {
        let strategy = options.strategy.unwrap_or(workspace.settings.merge_strategy);
        let method = options.method.unwrap_or(workspace.settings.default_merge_method);
        let status = self.status(workspace, selection).await?;

        let mut candidates = Vec::new();
        for (repo, outcome) in &status.report.outcomes {
            let pr = match (status.link_set.get(&repo.name), outcome.failure()) {
                (Some(member), _) => Ok(member.clone()),
                (None, Some(failure)) => Err(failure.message.clone()),
                (None, None) => continue,
            };
            let platform = self.platforms.for_repo(repo)?;
            candidates.push(MergeCandidate {
                repo: repo.clone(),
                pr,
                platform,
            });
        }

        if candidates.is_empty() {
            return Err(Error::Validation(
                "no open pull requests found for the current branches".to_string(),
            ));
        }

        let merger = Merger {
            method,
            force: options.force,
            platform_timeout: self.platform_timeout,
            verify: self.verify_backoff,
        };
        Ok(merger.run(strategy, candidates).await)
    }
}

/// Read-only platform call: bounded by the timeout and retried when it times out.
async fn read<T, F, Fut>(backoff: Backoff, timeout: Duration, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_transient(backoff, || with_timeout(timeout, f())).await
}

async fn enrich(member: &mut LinkedPr, platform: &dyn HostingPlatform, backoff: Backoff, timeout: Duration) -> Result<()> {
    let (owner, name, number) = (member.owner.clone(), member.repo_name.clone(), member.number);
    let (current, reviews, checks) = futures::try_join!(
        read(backoff, timeout, || platform.get_pr(&owner, &name, number)),
        read(backoff, timeout, || platform.list_reviews(&owner, &name, number)),
        read(backoff, timeout, || platform.get_check_status(&owner, &name, number)),
    )?;
    member.state = current.state;
    member.mergeable = current.mergeable;
    member.approved = is_approved(&reviews);
    member.checks = checks;
    Ok(())
}

fn owner_repo(repo: &Repository) -> Result<(String, String)> {
    repo.owner_repo().ok_or_else(|| {
        Error::Validation(format!(
            "cannot derive owner/repo for {} from {}",
            repo.name, repo.url
        ))
    })
}

/// Link set member from a platform record, plus the PR body.
fn linked(repo: &Repository, owner: &str, name: &str, pr: &PullRequest) -> (LinkedPr, String) {
    let member = LinkedPr {
        repo: repo.name.clone(),
        owner: owner.to_string(),
        repo_name: name.to_string(),
        number: pr.number,
        url: pr.url.clone(),
        head: pr.head.clone(),
        state: pr.state,
        approved: false,
        checks: CheckStatus::Pending,
        mergeable: pr.mergeable,
    };
    (member, pr.body.clone())
}

/// Members in scope order, so the configuration repository comes last.
async fn assemble(scope: &RepoSelection, found: &Found) -> LinkSet {
    let found = found.lock().await;
    let members: Vec<LinkedPr> = scope
        .iter()
        .filter_map(|repo| found.get(&repo.name).map(|(member, _)| member.clone()))
        .collect();
    let branch = members.first().map(|m| m.head.clone()).unwrap_or_default();
    for member in members.iter().filter(|m| m.head != branch) {
        glog_warn!(
            "{}#{} is on {} while the link set branch is {}",
            member.repo,
            member.number,
            member.head,
            branch
        );
    }
    LinkSet { branch, members }
}

/// Compare any marker found in member bodies with what was discovered.
async fn check_markers(link_set: &LinkSet, found: &Found) {
    let found = found.lock().await;
    for (repo, (_, body)) in found.iter() {
        for (listed, number) in parse_marker(body) {
            match link_set.get(&listed) {
                Some(member) if member.number == number => {}
                Some(member) => glog_warn!(
                    "marker in {} lists {}#{} but the open PR is #{}",
                    repo,
                    listed,
                    number,
                    member.number
                ),
                None => glog_warn!(
                    "marker in {} lists {}#{} but no open PR was found for it",
                    repo,
                    listed,
                    number
                ),
            }
        }
    }
}

async fn current_branch(repo: &Repository, timeout: Duration) -> Result<Option<String>> {
    let path = repo.path.clone();
    blocking_with_timeout(timeout, move || GitOps::new(&path)?.current_branch()).await
}

async fn local_state(repo: &Repository, timeout: Duration) -> Result<LocalState> {
    let path = repo.path.clone();
    let base = repo.default_branch.clone();
    let is_manifest = repo.is_manifest;
    blocking_with_timeout(timeout, move || {
        let git = GitOps::new(&path)?;
        let branch = git.current_branch()?;
        let ahead = match &branch {
            Some(b) if *b != base => git.commits_ahead(&base)?,
            _ => 0,
        };
        let dirty = is_manifest && git.is_dirty()?;
        Ok(LocalState { branch, ahead, dirty })
    })
    .await
}
