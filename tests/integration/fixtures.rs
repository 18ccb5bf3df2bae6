//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating a temporary workspace of real git repositories
//! - An in-memory hosting platform

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::TempDir;

use grip::cache::StatusCache;
use grip::platform::{
    CheckStatus, HostingPlatform, MergeMethod, NewPullRequest, PrState, PullRequest, Review, ReviewState,
};
use grip::{Error, ManifestProvider, Result, TomlManifest, Workspace};

pub const GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Run git in `dir`, panicking with stderr on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed in {}: {}",
        args,
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Initialize a repository on `main` with one commit.
pub fn init_repo(path: &Path) {
    std::fs::create_dir_all(path).expect("Failed to create repo dir");
    git(path, &["init", "--quiet"]);
    git(path, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(path, &["config", "user.email", "test@test.com"]);
    git(path, &["config", "user.name", "Test User"]);
    std::fs::write(path.join("README.md"), "# Test Repository\n").expect("Failed to write README");
    git(path, &["add", "."]);
    git(path, &["commit", "--quiet", "-m", "Initial commit"]);
}

/// Declared repository of a test workspace.
pub struct RepoDecl {
    pub name: &'static str,
    pub reference: bool,
}

pub fn repo(name: &'static str) -> RepoDecl {
    RepoDecl { name, reference: false }
}

pub fn reference(name: &'static str) -> RepoDecl {
    RepoDecl { name, reference: true }
}

/// A workspace root inside a sandbox directory, so griptrees created as
/// siblings of the root are cleaned up with the sandbox.
pub struct TestWorkspace {
    pub sandbox: TempDir,
    pub root: PathBuf,
    pub has_manifest: bool,
}

impl TestWorkspace {
    pub fn new(repos: &[RepoDecl]) -> Self {
        Self::build(repos, false)
    }

    /// Same, plus a self-tracked configuration repository at `.gitgrip/manifests`.
    pub fn with_manifest(repos: &[RepoDecl]) -> Self {
        Self::build(repos, true)
    }

    fn build(repos: &[RepoDecl], has_manifest: bool) -> Self {
        let sandbox = TempDir::new().expect("Failed to create temp directory");
        let root = sandbox.path().join("ws");

        let mut toml = String::new();
        if has_manifest {
            toml.push_str("[manifest]\nurl = \"git@github.com:acme/workspace.git\"\n\n");
        }
        for decl in repos {
            toml.push_str(&format!(
                "[[repos]]\nname = \"{0}\"\nurl = \"git@github.com:acme/{0}.git\"\nreference = {1}\n\n",
                decl.name, decl.reference
            ));
            init_repo(&root.join(decl.name));
        }
        if has_manifest {
            init_repo(&root.join(".gitgrip/manifests"));
        }
        std::fs::create_dir_all(root.join(".gitgrip")).expect("Failed to create .gitgrip");
        std::fs::write(root.join(".gitgrip/workspace.toml"), toml).expect("Failed to write workspace.toml");

        Self {
            sandbox,
            root,
            has_manifest,
        }
    }

    pub fn workspace(&self) -> Workspace {
        TomlManifest::new(&self.root).load().expect("Failed to load workspace")
    }

    pub fn path(&self, name: &str) -> PathBuf {
        if name == "manifest" && self.has_manifest {
            self.root.join(".gitgrip/manifests")
        } else {
            self.root.join(name)
        }
    }

    pub fn git(&self, name: &str, args: &[&str]) -> String {
        git(&self.path(name), args)
    }

    pub fn branch_exists(&self, name: &str, branch: &str) -> bool {
        Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
            .current_dir(self.path(name))
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    pub fn current_branch(&self, name: &str) -> String {
        self.git(name, &["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn commit_file(&self, name: &str, file: &str, content: &str) {
        std::fs::write(self.path(name).join(file), content).expect("Failed to write file");
        self.git(name, &["add", file]);
        self.git(name, &["commit", "--quiet", "-m", &format!("Add {}", file)]);
    }

    /// Put `name` on a new `branch` with one commit ahead of main.
    pub fn feature_commit(&self, name: &str, branch: &str) {
        self.git(name, &["checkout", "--quiet", "-b", branch]);
        self.commit_file(name, &format!("{}.txt", name), "feature work\n");
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join(".gitgrip/griptrees.json")
    }
}

pub fn status_cache() -> StatusCache {
    StatusCache::new(Duration::from_millis(0), GIT_TIMEOUT)
}

#[derive(Default)]
struct MockState {
    next_number: u64,
    /// Keyed by repository name (the part after the owner).
    prs: HashMap<String, Vec<PullRequest>>,
    reviews: HashMap<String, Vec<Review>>,
    checks: HashMap<String, CheckStatus>,
    failing_merges: HashSet<String>,
    ignored_merges: HashSet<String>,
    merge_calls: Vec<String>,
}

/// In-memory hosting platform. Repositories are identified by name only.
#[derive(Default)]
pub struct MockPlatform {
    state: Mutex<MockState>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an approving review to the open PR of `repo`.
    pub fn approve(&self, repo: &str) {
        self.review(repo, ReviewState::Approved);
    }

    pub fn review(&self, repo: &str, state: ReviewState) {
        let mut s = self.state.lock().unwrap();
        s.reviews.entry(repo.to_string()).or_default().push(Review {
            author: format!("reviewer-{}", state as u8),
            state,
        });
    }

    pub fn set_checks(&self, repo: &str, status: CheckStatus) {
        self.state.lock().unwrap().checks.insert(repo.to_string(), status);
    }

    /// Approve with green checks.
    pub fn make_ready(&self, repo: &str) {
        self.approve(repo);
        self.set_checks(repo, CheckStatus::Success);
    }

    /// `merge_pr` on `repo` returns an error.
    pub fn fail_merge(&self, repo: &str) {
        self.state.lock().unwrap().failing_merges.insert(repo.to_string());
    }

    /// `merge_pr` on `repo` reports success but leaves the PR open.
    pub fn ignore_merge(&self, repo: &str) {
        self.state.lock().unwrap().ignored_merges.insert(repo.to_string());
    }

    pub fn merge_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().merge_calls.clone()
    }

    pub fn pr(&self, repo: &str) -> Option<PullRequest> {
        self.state
            .lock()
            .unwrap()
            .prs
            .get(repo)
            .and_then(|prs| prs.last().cloned())
    }

    pub fn pr_count(&self) -> usize {
        self.state.lock().unwrap().prs.values().map(Vec::len).sum()
    }
}

fn find_mut<'a>(state: &'a mut MockState, repo: &str, number: u64) -> Result<&'a mut PullRequest> {
    state
        .prs
        .get_mut(repo)
        .and_then(|prs| prs.iter_mut().find(|pr| pr.number == number))
        .ok_or_else(|| Error::platform(repo, format!("no pull request #{}", number)))
}

#[async_trait::async_trait]
impl HostingPlatform for MockPlatform {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_pr(&self, owner: &str, repo: &str, pr: &NewPullRequest) -> Result<PullRequest> {
        let mut s = self.state.lock().unwrap();
        s.next_number += 1;
        let created = PullRequest {
            number: s.next_number,
            url: format!("https://git.example.com/{}/{}/pull/{}", owner, repo, s.next_number),
            title: pr.title.clone(),
            state: PrState::Open,
            mergeable: true,
            head: pr.head.clone(),
            base: pr.base.clone(),
            body: pr.body.clone(),
        };
        s.prs.entry(repo.to_string()).or_default().push(created.clone());
        Ok(created)
    }

    async fn get_pr(&self, _owner: &str, repo: &str, number: u64) -> Result<PullRequest> {
        let mut s = self.state.lock().unwrap();
        Ok(find_mut(&mut s, repo, number)?.clone())
    }

    async fn find_pr_by_branch(&self, _owner: &str, repo: &str, branch: &str) -> Result<Option<PullRequest>> {
        let s = self.state.lock().unwrap();
        Ok(s.prs
            .get(repo)
            .and_then(|prs| prs.iter().find(|pr| pr.head == branch && pr.state == PrState::Open))
            .cloned())
    }

    async fn list_reviews(&self, _owner: &str, repo: &str, _number: u64) -> Result<Vec<Review>> {
        Ok(self.state.lock().unwrap().reviews.get(repo).cloned().unwrap_or_default())
    }

    async fn get_check_status(&self, _owner: &str, repo: &str, _number: u64) -> Result<CheckStatus> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .checks
            .get(repo)
            .copied()
            .unwrap_or(CheckStatus::Pending))
    }

    async fn merge_pr(&self, _owner: &str, repo: &str, number: u64, _method: MergeMethod) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.merge_calls.push(repo.to_string());
        if s.failing_merges.contains(repo) {
            return Err(Error::platform(repo, "merge conflict"));
        }
        let ignored = s.ignored_merges.contains(repo);
        let pr = find_mut(&mut s, repo, number)?;
        if !ignored {
            pr.state = PrState::Merged;
        }
        Ok(())
    }

    async fn update_pr_body(&self, _owner: &str, repo: &str, number: u64, body: &str) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        find_mut(&mut s, repo, number)?.body = body.to_string();
        Ok(())
    }
}
