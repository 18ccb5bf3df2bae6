//! Linked pull request integration tests against the in-memory platform.

use std::sync::Arc;
use std::time::Duration;

use grip::executor::{Outcome, EARLIER_FAILURE};
use grip::platform::{CheckStatus, PlatformRegistry, PrState, ReviewState};
use grip::pr::{parse_marker, MergeOptions, MergeStrategy, PrCoordinator, PrOptions};
use grip::util::Backoff;
use grip::{RepoFilter, RepoSetExecutor};

use crate::fixtures::{reference, repo, MockPlatform, TestWorkspace, GIT_TIMEOUT};

const PLATFORM_TIMEOUT: Duration = Duration::from_secs(5);

fn coordinator(mock: &Arc<MockPlatform>) -> PrCoordinator {
    PrCoordinator::new(
        PlatformRegistry::new(mock.clone()),
        RepoSetExecutor::parallel(4),
        GIT_TIMEOUT,
        PLATFORM_TIMEOUT,
    )
    .with_verify_backoff(Backoff {
        attempts: 2,
        base: Duration::from_millis(1),
    })
}

/// Repositories with one commit each on feat/x.
fn feature_workspace(names: &[&'static str]) -> TestWorkspace {
    let decls: Vec<_> = names.iter().map(|&n| repo(n)).collect();
    let tw = TestWorkspace::new(&decls);
    for name in names {
        tw.feature_commit(name, "feat/x");
    }
    tw
}

fn strategy(strategy: MergeStrategy) -> MergeOptions {
    MergeOptions {
        strategy: Some(strategy),
        ..MergeOptions::default()
    }
}

/// Test: Creation only opens PRs where there is work
/// Given A and B ahead of main, C on feat/x with no commits, and a reference repo
/// When linked PRs are created
/// Then only A and B get a PR and the marker in A's PR lists both
#[tokio::test]
async fn test_create_skips_repos_without_work() {
    let tw = TestWorkspace::new(&[repo("a"), repo("b"), repo("c"), reference("docs")]);
    tw.feature_commit("a", "feat/x");
    tw.feature_commit("b", "feat/x");
    tw.git("c", &["checkout", "--quiet", "-b", "feat/x"]);
    let ws = tw.workspace();
    let selection = RepoFilter::all().apply(&ws).unwrap();
    let mock = Arc::new(MockPlatform::new());

    let created = coordinator(&mock)
        .create(&ws, &selection, &PrOptions::default())
        .await
        .unwrap();

    assert!(created.report.is_success(), "{}", created.report);
    assert_eq!(created.link_set.branch, "feat/x");
    assert_eq!(created.link_set.repos(), vec!["a", "b"]);
    assert_eq!(
        created.report.get("c"),
        Some(&Outcome::Skipped("no commits ahead of main".to_string()))
    );
    assert_eq!(
        created.report.get("docs"),
        Some(&Outcome::Skipped("reference repo".to_string()))
    );
    assert_eq!(mock.pr_count(), 2);

    let a = mock.pr("a").unwrap();
    assert_eq!(a.title, "feat/x");
    assert_eq!(a.base, "main");
    let expected: Vec<(String, u64)> = created
        .link_set
        .members
        .iter()
        .map(|m| (m.repo.clone(), m.number))
        .collect();
    assert_eq!(parse_marker(&a.body), expected);
    assert!(parse_marker(&mock.pr("b").unwrap().body).is_empty());
}

/// Test: Creating again reuses the open PRs
#[tokio::test]
async fn test_create_is_idempotent() {
    let tw = feature_workspace(&["a", "b"]);
    let ws = tw.workspace();
    let selection = RepoFilter::all().apply(&ws).unwrap();
    let mock = Arc::new(MockPlatform::new());
    let coordinator = coordinator(&mock);

    let first = coordinator.create(&ws, &selection, &PrOptions::default()).await.unwrap();
    let second = coordinator.create(&ws, &selection, &PrOptions::default()).await.unwrap();

    assert_eq!(mock.pr_count(), 2);
    assert_eq!(first.link_set.repos(), second.link_set.repos());
    let number = first.link_set.get("a").unwrap().number;
    assert_eq!(
        second.report.get("a"),
        Some(&Outcome::Success(format!("#{} already open", number)))
    );
}

/// Test: The configuration repository carries the marker
/// Given a dirty configuration repository on the feature branch with no commits
/// When linked PRs are created
/// Then it gets a PR, listed last, and that PR holds the marker
#[tokio::test]
async fn test_marker_goes_to_manifest_pr() {
    let tw = TestWorkspace::with_manifest(&[repo("app")]);
    tw.feature_commit("app", "feat/x");
    tw.git("manifest", &["checkout", "--quiet", "-b", "feat/x"]);
    std::fs::write(tw.path("manifest").join("README.md"), "# Changed\n").unwrap();
    let ws = tw.workspace();
    let selection = RepoFilter::all().apply(&ws).unwrap();
    let mock = Arc::new(MockPlatform::new());

    let created = coordinator(&mock)
        .create(
            &ws,
            &selection,
            &PrOptions {
                title: Some("Login flow".to_string()),
                body: "Adds login.".to_string(),
                ..PrOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(created.link_set.repos(), vec!["app", "manifest"]);
    let manifest_pr = mock.pr("workspace").unwrap();
    assert_eq!(manifest_pr.title, "Login flow");
    assert!(manifest_pr.body.starts_with("Adds login.\n\n"));
    let listed: Vec<String> = parse_marker(&manifest_pr.body).into_iter().map(|(r, _)| r).collect();
    assert_eq!(listed, vec!["app", "manifest"]);
    assert_eq!(mock.pr("app").unwrap().body, "Adds login.");
}

/// Test: A link set is rediscovered without local state
/// Given PRs created by one coordinator
/// When a fresh coordinator discovers and queries status
/// Then it finds the same members, and readiness follows reviews and checks
#[tokio::test]
async fn test_discover_and_status() {
    let tw = feature_workspace(&["a", "b"]);
    let ws = tw.workspace();
    let selection = RepoFilter::all().apply(&ws).unwrap();
    let mock = Arc::new(MockPlatform::new());
    let created = coordinator(&mock)
        .create(&ws, &selection, &PrOptions::default())
        .await
        .unwrap();

    let fresh = coordinator(&mock);
    let discovered = fresh.discover(&ws, &selection).await.unwrap();
    assert_eq!(discovered.link_set, created.link_set);

    mock.make_ready("a");
    mock.approve("b");
    let status = fresh.status(&ws, &selection).await.unwrap();
    assert!(!status.is_ready());
    let b = status.link_set.get("b").unwrap();
    assert!(b.approved);
    assert_eq!(b.checks, CheckStatus::Pending);
    assert_eq!(b.blockers(false), vec!["checks pending".to_string()]);

    mock.set_checks("b", CheckStatus::Success);
    assert!(fresh.status(&ws, &selection).await.unwrap().is_ready());

    // Changes requested by a second reviewer withdraw readiness.
    mock.review("b", ReviewState::ChangesRequested);
    let status = fresh.status(&ws, &selection).await.unwrap();
    assert!(!status.link_set.get("b").unwrap().approved);
}

/// Test: All-or-nothing merges nothing when one member is blocked
/// Given A ready and B not approved
/// When the link set is merged all-or-nothing
/// Then no merge call is made and B is reported as the blocker
#[tokio::test]
async fn test_all_or_nothing_blocked() {
    let tw = feature_workspace(&["a", "b"]);
    let ws = tw.workspace();
    let selection = RepoFilter::all().apply(&ws).unwrap();
    let mock = Arc::new(MockPlatform::new());
    let coordinator = coordinator(&mock);
    coordinator.create(&ws, &selection, &PrOptions::default()).await.unwrap();
    mock.make_ready("a");
    mock.set_checks("b", CheckStatus::Success);

    let report = coordinator
        .merge(&ws, &selection, &strategy(MergeStrategy::AllOrNothing))
        .await
        .unwrap();

    assert!(!report.is_success());
    assert!(mock.merge_calls().is_empty());
    assert_eq!(report.blocked.len(), 1);
    assert_eq!(report.blocked[0].repo, "b");
    assert_eq!(report.blocked[0].reasons, vec!["not approved".to_string()]);
    assert!(report.outcomes.get("b").unwrap().is_failed());
    assert_eq!(
        report.outcomes.get("a"),
        Some(&Outcome::Skipped("not merged: blocked by b".to_string()))
    );
    assert_eq!(mock.pr("a").unwrap().state, PrState::Open);
}

/// Test: All-or-nothing merges everything once every member is ready
#[tokio::test]
async fn test_all_or_nothing_merges_all() {
    let tw = feature_workspace(&["a", "b"]);
    let ws = tw.workspace();
    let selection = RepoFilter::all().apply(&ws).unwrap();
    let mock = Arc::new(MockPlatform::new());
    let coordinator = coordinator(&mock);
    coordinator.create(&ws, &selection, &PrOptions::default()).await.unwrap();
    mock.make_ready("a");
    mock.make_ready("b");

    // Workspace default strategy is all-or-nothing.
    let report = coordinator.merge(&ws, &selection, &MergeOptions::default()).await.unwrap();

    assert!(report.is_success(), "{}", report);
    assert_eq!(report.strategy, MergeStrategy::AllOrNothing);
    assert_eq!(report.merged(), vec!["a", "b"]);
    assert_eq!(mock.merge_calls(), vec!["a", "b"]);
    assert_eq!(mock.pr("b").unwrap().state, PrState::Merged);
}

/// Test: Sequential stops at the first failed merge
/// Given A, B and C ready, with B's merge call failing
/// When the link set is merged sequentially
/// Then A is merged, B failed and C is skipped after the earlier failure
#[tokio::test]
async fn test_sequential_stops_at_failure() {
    let tw = feature_workspace(&["a", "b", "c"]);
    let ws = tw.workspace();
    let selection = RepoFilter::all().apply(&ws).unwrap();
    let mock = Arc::new(MockPlatform::new());
    let coordinator = coordinator(&mock);
    coordinator.create(&ws, &selection, &PrOptions::default()).await.unwrap();
    for name in ["a", "b", "c"] {
        mock.make_ready(name);
    }
    mock.fail_merge("b");

    let report = coordinator
        .merge(&ws, &selection, &strategy(MergeStrategy::Sequential))
        .await
        .unwrap();

    assert_eq!(report.merged(), vec!["a"]);
    let failure = report.outcomes.get("b").unwrap().failure().unwrap();
    assert!(failure.message.contains("merge conflict"));
    assert_eq!(
        report.outcomes.get("c"),
        Some(&Outcome::Skipped(EARLIER_FAILURE.to_string()))
    );
    assert_eq!(mock.merge_calls(), vec!["a", "b"]);
    assert_eq!(mock.pr("c").unwrap().state, PrState::Open);
}

/// Test: Independent attempts every member
#[tokio::test]
async fn test_independent_attempts_all() {
    let tw = feature_workspace(&["a", "b", "c"]);
    let ws = tw.workspace();
    let selection = RepoFilter::all().apply(&ws).unwrap();
    let mock = Arc::new(MockPlatform::new());
    let coordinator = coordinator(&mock);
    coordinator.create(&ws, &selection, &PrOptions::default()).await.unwrap();
    for name in ["a", "b", "c"] {
        mock.make_ready(name);
    }
    mock.fail_merge("b");

    let report = coordinator
        .merge(&ws, &selection, &strategy(MergeStrategy::Independent))
        .await
        .unwrap();

    assert_eq!(report.merged(), vec!["a", "c"]);
    assert!(report.outcomes.get("b").unwrap().is_failed());
    assert_eq!(mock.merge_calls(), vec!["a", "b", "c"]);
    assert!(!report.is_success());
}

/// Test: A merge that does not take effect is a failure
/// Given the platform accepts B's merge call but leaves the PR open
/// When the link set is merged independently
/// Then B is reported failed after verification
#[tokio::test]
async fn test_unverified_merge_fails() {
    let tw = feature_workspace(&["a", "b"]);
    let ws = tw.workspace();
    let selection = RepoFilter::all().apply(&ws).unwrap();
    let mock = Arc::new(MockPlatform::new());
    let coordinator = coordinator(&mock);
    coordinator.create(&ws, &selection, &PrOptions::default()).await.unwrap();
    mock.make_ready("a");
    mock.make_ready("b");
    mock.ignore_merge("b");

    let report = coordinator
        .merge(&ws, &selection, &strategy(MergeStrategy::Independent))
        .await
        .unwrap();

    assert_eq!(report.merged(), vec!["a"]);
    let failure = report.outcomes.get("b").unwrap().failure().unwrap();
    assert!(failure.message.contains("still open"), "{}", failure.message);
}

/// Test: Force bypasses pending checks but not approval
#[tokio::test]
async fn test_force_bypasses_checks() {
    let tw = feature_workspace(&["a"]);
    let ws = tw.workspace();
    let selection = RepoFilter::all().apply(&ws).unwrap();
    let mock = Arc::new(MockPlatform::new());
    let coordinator = coordinator(&mock);
    coordinator.create(&ws, &selection, &PrOptions::default()).await.unwrap();
    mock.approve("a");

    let blocked = coordinator.merge(&ws, &selection, &MergeOptions::default()).await.unwrap();
    assert_eq!(blocked.blocked[0].reasons, vec!["checks pending".to_string()]);
    assert!(mock.merge_calls().is_empty());

    let forced = coordinator
        .merge(
            &ws,
            &selection,
            &MergeOptions {
                force: true,
                ..MergeOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(forced.is_success(), "{}", forced);
    assert_eq!(mock.pr("a").unwrap().state, PrState::Merged);
}

/// Test: Nothing to merge is an error
#[tokio::test]
async fn test_merge_without_prs_fails() {
    let tw = feature_workspace(&["a"]);
    let ws = tw.workspace();
    let selection = RepoFilter::all().apply(&ws).unwrap();
    let mock = Arc::new(MockPlatform::new());

    let err = coordinator(&mock)
        .merge(&ws, &selection, &MergeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, grip::Error::Validation(_)));
}
