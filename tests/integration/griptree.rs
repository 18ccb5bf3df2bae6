//! Griptree lifecycle integration tests.

use grip::executor::FailureKind;
use grip::griptree::{GriptreeHealth, GriptreeManager, GriptreeRegistry, LEGACY_POINTER_FILE, POINTER_FILE};
use grip::{Error, RepoFilter, RepoSetExecutor};

use crate::fixtures::{reference, repo, TestWorkspace, GIT_TIMEOUT};

fn manager(tw: &TestWorkspace) -> GriptreeManager {
    GriptreeManager::new(tw.workspace(), RepoSetExecutor::parallel(4), GIT_TIMEOUT)
}

/// Test: Add then remove leaves nothing behind
/// Given a workspace with two repositories
/// When griptree feat/x is added and then removed
/// Then no registry entry and no directory remain, and the branches survive
#[tokio::test]
async fn test_add_remove_round_trip() {
    let tw = TestWorkspace::new(&[repo("a"), repo("b")]);
    let ws = tw.workspace();
    let manager = manager(&tw);
    let selection = RepoFilter::all().apply(&ws).unwrap();

    let added = manager.add("feat/x", None, &selection).await.unwrap();
    assert!(added.report.is_success(), "{}", added.report);
    let griptree = added.griptree.expect("griptree registered");
    let dir = tw.sandbox.path().join("feat-x");
    assert_eq!(griptree.path, dir);
    assert!(dir.join("a/README.md").exists());
    assert!(dir.join("b/README.md").exists());
    assert!(dir.join(POINTER_FILE).exists());
    assert_eq!(griptree.worktrees.len(), 2);
    assert!(griptree.upstreams.is_empty());
    // Main checkouts are untouched.
    assert_eq!(tw.current_branch("a"), "main");

    let removed = manager.remove("feat/x", false).await.unwrap();
    assert!(removed.removed);
    assert!(removed.report.is_success(), "{}", removed.report);
    assert!(!dir.exists());
    assert!(manager.get("feat/x").unwrap().is_none());
    assert!(tw.branch_exists("a", "feat/x"));
    assert!(tw.branch_exists("b", "feat/x"));
}

/// Test: Locked griptrees survive removal without force
/// Given a locked griptree
/// When it is removed without force
/// Then removal fails with a locked error and the griptree is intact
#[tokio::test]
async fn test_locked_griptree_requires_force() {
    let tw = TestWorkspace::new(&[repo("a")]);
    let ws = tw.workspace();
    let manager = manager(&tw);
    let selection = RepoFilter::all().apply(&ws).unwrap();
    manager.add("feat/x", None, &selection).await.unwrap();

    assert!(manager.lock("feat/x").unwrap());
    // Locking again is a successful no-op.
    assert!(!manager.lock("feat/x").unwrap());

    let err = manager.remove("feat/x", false).await.unwrap_err();
    assert!(matches!(err, Error::GriptreeLocked(ref b) if b == "feat/x"));
    let griptree = manager.get("feat/x").unwrap().expect("still registered");
    assert!(griptree.locked);
    assert!(griptree.path.join("a").exists());

    let removed = manager.remove("feat/x", true).await.unwrap();
    assert!(removed.removed);
    assert!(manager.get("feat/x").unwrap().is_none());
}

/// Test: Unlock restores normal removal
#[tokio::test]
async fn test_unlock_then_remove() {
    let tw = TestWorkspace::new(&[repo("a")]);
    let ws = tw.workspace();
    let manager = manager(&tw);
    let selection = RepoFilter::all().apply(&ws).unwrap();
    manager.add("feat/x", None, &selection).await.unwrap();

    manager.lock("feat/x").unwrap();
    assert!(manager.unlock("feat/x").unwrap());
    assert!(!manager.unlock("feat/x").unwrap());
    assert!(manager.remove("feat/x", false).await.unwrap().removed);

    assert!(matches!(manager.lock("feat/x"), Err(Error::GriptreeNotFound(_))));
}

/// Test: Partial failure keeps the successful worktrees
/// Given feat/x is already checked out in A's main checkout
/// When griptree feat/x is added for A and B
/// Then A fails with the checked-out-elsewhere limitation and B's worktree is registered
#[tokio::test]
async fn test_partial_failure_keeps_successes() {
    let tw = TestWorkspace::new(&[repo("a"), repo("b")]);
    tw.git("a", &["checkout", "--quiet", "-b", "feat/x"]);
    let ws = tw.workspace();
    let manager = manager(&tw);
    let selection = RepoFilter::all().apply(&ws).unwrap();

    let added = manager.add("feat/x", None, &selection).await.unwrap();
    assert!(added.is_partial());
    let failure = added.report.get("a").unwrap().failure().unwrap();
    assert_eq!(failure.kind, FailureKind::CheckedOutElsewhere);
    assert!(added.report.get("b").unwrap().is_success());

    let griptree = manager.get("feat/x").unwrap().expect("registered");
    assert_eq!(griptree.worktrees.keys().collect::<Vec<_>>(), vec!["b"]);
    assert!(griptree.path.join("b").exists());
    assert!(!griptree.path.join("a").exists());
}

/// Test: A failed fetch does not silently branch from HEAD
/// Given A's origin points at a repository that does not exist
/// When griptree feat/x is added for A and B
/// Then A fails on the fetch without creating feat/x and B's worktree is registered
#[tokio::test]
async fn test_unreachable_origin_fails_repo() {
    let tw = TestWorkspace::new(&[repo("a"), repo("b")]);
    let gone = tw.sandbox.path().join("gone.git");
    tw.git("a", &["remote", "add", "origin", gone.to_str().unwrap()]);
    let ws = tw.workspace();
    let manager = manager(&tw);
    let selection = RepoFilter::all().apply(&ws).unwrap();

    let added = manager.add("feat/x", None, &selection).await.unwrap();
    assert!(added.is_partial());
    let failure = added.report.get("a").unwrap().failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Other);
    assert!(failure.message.contains("fetch"), "{}", failure.message);
    assert!(!tw.branch_exists("a", "feat/x"));

    let griptree = manager.get("feat/x").unwrap().expect("registered");
    assert_eq!(griptree.worktrees.keys().collect::<Vec<_>>(), vec!["b"]);
}

/// Test: Total failure rolls back
/// Given feat/x is checked out in every main checkout
/// When griptree feat/x is added
/// Then nothing is registered and no directory remains
#[tokio::test]
async fn test_total_failure_rolls_back() {
    let tw = TestWorkspace::new(&[repo("a"), repo("b")]);
    tw.git("a", &["checkout", "--quiet", "-b", "feat/x"]);
    tw.git("b", &["checkout", "--quiet", "-b", "feat/x"]);
    let ws = tw.workspace();
    let manager = manager(&tw);
    let selection = RepoFilter::all().apply(&ws).unwrap();

    let added = manager.add("feat/x", None, &selection).await.unwrap();
    assert!(added.griptree.is_none());
    assert_eq!(added.report.failed(), 2);
    assert!(!tw.sandbox.path().join("feat-x").exists());
    assert!(manager.get("feat/x").unwrap().is_none());
}

/// Test: Existing griptree or directory is rejected
#[tokio::test]
async fn test_add_rejects_existing() {
    let tw = TestWorkspace::new(&[repo("a")]);
    let ws = tw.workspace();
    let manager = manager(&tw);
    let selection = RepoFilter::all().apply(&ws).unwrap();
    manager.add("feat/x", None, &selection).await.unwrap();

    let err = manager.add("feat/x", None, &selection).await.unwrap_err();
    assert!(matches!(err, Error::GriptreeExists(_)));
    // Sanitizes to the same key.
    let err = manager.add("feat-x", None, &selection).await.unwrap_err();
    assert!(matches!(err, Error::GriptreeExists(ref b) if b == "feat/x"));

    std::fs::create_dir_all(tw.sandbox.path().join("feat-y")).unwrap();
    let err = manager.add("feat/y", None, &selection).await.unwrap_err();
    assert!(matches!(err, Error::TargetExists(_)));
}

/// Test: Explicit path, reference repos and the configuration repository
/// Given a reference repository and a configuration repository
/// When a griptree is added at an explicit path
/// Then the reference repo is skipped and the configuration repo gets a worktree
#[tokio::test]
async fn test_add_with_manifest_and_reference() {
    let tw = TestWorkspace::with_manifest(&[repo("app"), reference("docs")]);
    let ws = tw.workspace();
    let manager = manager(&tw);
    let selection = RepoFilter::all().apply(&ws).unwrap();
    let target = tw.sandbox.path().join("trees/login");

    let added = manager.add("feat/login", Some(&target), &selection).await.unwrap();
    assert_eq!(
        added.report.get("docs").unwrap().to_string(),
        "skipped  reference repo"
    );
    let griptree = added.griptree.unwrap();
    assert_eq!(griptree.path, target);
    assert!(target.join("app/README.md").exists());
    assert!(target.join(".gitgrip/manifests/README.md").exists());
    assert!(griptree.worktrees.contains_key("manifest"));
    assert!(!griptree.worktrees.contains_key("docs"));
}

/// Test: Legacy griptrees are adopted into the registry
/// Given a sibling directory carrying only a legacy pointer to this workspace
/// When griptrees are listed
/// Then it is reported as adopted and is registered from then on
#[tokio::test]
async fn test_list_adopts_legacy_griptree() {
    let tw = TestWorkspace::new(&[repo("a")]);
    let legacy_dir = tw.sandbox.path().join("old-feature");
    std::fs::create_dir_all(&legacy_dir).unwrap();
    let pointer = serde_json::json!({
        "main_workspace": tw.root,
        "branch": "old/feature",
    });
    std::fs::write(legacy_dir.join(LEGACY_POINTER_FILE), pointer.to_string()).unwrap();

    // Points at another workspace: ignored.
    let foreign_dir = tw.sandbox.path().join("foreign");
    std::fs::create_dir_all(&foreign_dir).unwrap();
    let foreign = serde_json::json!({ "main_workspace": "/somewhere/else", "branch": "x" });
    std::fs::write(foreign_dir.join(LEGACY_POINTER_FILE), foreign.to_string()).unwrap();

    let manager = manager(&tw);
    let listings = manager.list().unwrap();
    assert_eq!(listings.len(), 1);
    assert!(listings[0].adopted);
    assert_eq!(listings[0].griptree.branch, "old/feature");
    assert_eq!(listings[0].health, GriptreeHealth::Ok);

    let registry = GriptreeRegistry::load(&tw.registry_path()).unwrap();
    assert!(registry.contains("old/feature"));

    let again = manager.list().unwrap();
    assert_eq!(again.len(), 1);
    assert!(!again[0].adopted);
}

/// Test: Registry wins over a conflicting marker
/// Given a registered griptree and another directory claiming the same branch
/// When griptrees are listed
/// Then only the registered griptree is reported
#[tokio::test]
async fn test_registry_wins_over_marker() {
    let tw = TestWorkspace::new(&[repo("a")]);
    let ws = tw.workspace();
    let manager = manager(&tw);
    let selection = RepoFilter::all().apply(&ws).unwrap();
    let griptree = manager.add("feat/x", None, &selection).await.unwrap().griptree.unwrap();

    let impostor = tw.sandbox.path().join("impostor");
    std::fs::create_dir_all(&impostor).unwrap();
    let pointer = serde_json::json!({ "main_workspace": tw.root, "branch": "feat/x" });
    std::fs::write(impostor.join(LEGACY_POINTER_FILE), pointer.to_string()).unwrap();

    let listings = manager.list().unwrap();
    assert_eq!(listings.len(), 1);
    assert_eq!(listings[0].griptree.path, griptree.path);
    assert!(!listings[0].adopted);
}

/// Test: Health is reported, not repaired
#[tokio::test]
async fn test_list_reports_missing_marker() {
    let tw = TestWorkspace::new(&[repo("a")]);
    let ws = tw.workspace();
    let manager = manager(&tw);
    let selection = RepoFilter::all().apply(&ws).unwrap();
    let griptree = manager.add("feat/x", None, &selection).await.unwrap().griptree.unwrap();

    std::fs::remove_file(griptree.path.join(POINTER_FILE)).unwrap();
    let listings = manager.list().unwrap();
    assert_eq!(listings[0].health, GriptreeHealth::MissingMarker);
    assert!(!griptree.path.join(POINTER_FILE).exists());
}
