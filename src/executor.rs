//! Repo set executor: apply one operation to many repositories.
//!
//! Every selected repository gets exactly one `Outcome`, in selection order,
//! whatever happens to its siblings. A repository's failure (or panic) is
//! recorded against that repository and never cancels the others.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::repo::{RepoSelection, Repository};
use crate::{glog_debug, glog_warn, Error, Result};

pub const EARLIER_FAILURE: &str = "earlier failure";

/// What a per-repo operation reports when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Work was performed.
    Done(String),
    /// Nothing needed doing; distinct from a failure.
    Skip(String),
}

impl Step {
    pub fn done(detail: impl Into<String>) -> Self {
        Step::Done(detail.into())
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Step::Skip(reason.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Git refuses a second checkout of the same branch.
    CheckedOutElsewhere,
    /// Index lock or timeout that outlived its retries.
    Transient,
    /// The task panicked or was cancelled.
    Aborted,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&Error> for Failure {
    fn from(err: &Error) -> Self {
        let kind = if err.is_checked_out_elsewhere() {
            FailureKind::CheckedOutElsewhere
        } else if err.is_transient() {
            FailureKind::Transient
        } else {
            FailureKind::Other
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "lowercase")]
pub enum Outcome {
    Success(String),
    Skipped(String),
    Failed(Failure),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Outcome::Failed(f) => Some(f),
            _ => None,
        }
    }

    pub fn failed(err: &Error) -> Self {
        Outcome::Failed(Failure::from(err))
    }

    pub fn from_result(result: Result<Step>) -> Self {
        match result {
            Ok(Step::Done(detail)) => Outcome::Success(detail),
            Ok(Step::Skip(reason)) => Outcome::Skipped(reason),
            Err(e) => Outcome::failed(&e),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success(detail) => write!(f, "ok       {}", detail),
            Outcome::Skipped(reason) => write!(f, "skipped  {}", reason),
            Outcome::Failed(failure) => write!(f, "FAILED   {}", failure.message),
        }
    }
}

/// Ordered per-repo outcomes of one operation.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub operation: String,
    pub outcomes: Vec<(Repository, Outcome)>,
}

#[derive(Serialize)]
struct ReportEntry<'a> {
    repo: &'a str,
    #[serde(flatten)]
    outcome: &'a Outcome,
}

#[derive(Serialize)]
struct ReportJson<'a> {
    operation: &'a str,
    succeeded: usize,
    skipped: usize,
    failed: usize,
    repos: Vec<ReportEntry<'a>>,
}

impl ExecutionReport {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            outcomes: Vec::new(),
        }
    }

    pub fn push(&mut self, repo: Repository, outcome: Outcome) {
        self.outcomes.push((repo, outcome));
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|(r, _)| r.name == name)
            .map(|(_, o)| o)
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_success()).count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_skipped()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_failed()).count()
    }

    /// No repository failed. Skips do not count against success.
    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = (&Repository, &Failure)> {
        self.outcomes
            .iter()
            .filter_map(|(r, o)| o.failure().map(|f| (r, f)))
    }

    pub fn successful_repos(&self) -> impl Iterator<Item = &Repository> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.is_success())
            .map(|(r, _)| r)
    }

    pub fn to_json(&self) -> Result<String> {
        let json = ReportJson {
            operation: &self.operation,
            succeeded: self.succeeded(),
            skipped: self.skipped(),
            failed: self.failed(),
            repos: self
                .outcomes
                .iter()
                .map(|(r, o)| ReportEntry {
                    repo: &r.name,
                    outcome: o,
                })
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&json)?)
    }
}

impl fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .outcomes
            .iter()
            .map(|(r, _)| r.name.len())
            .max()
            .unwrap_or(0);
        for (repo, outcome) in &self.outcomes {
            writeln!(f, "  {:width$}  {}", repo.name, outcome, width = width)?;
        }
        write!(
            f,
            "{}: {} succeeded, {} skipped, {} failed",
            self.operation,
            self.succeeded(),
            self.skipped(),
            self.failed()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecMode {
    /// One task per repository, at most `max_concurrency` at a time.
    Parallel { max_concurrency: usize },
    /// One repository at a time, in selection order.
    Sequential,
}

#[derive(Debug, Clone)]
pub struct RepoSetExecutor {
    mode: ExecMode,
    stop_on_first_error: bool,
}

impl RepoSetExecutor {
    pub fn parallel(max_concurrency: usize) -> Self {
        Self {
            mode: ExecMode::Parallel {
                max_concurrency: max_concurrency.max(1),
            },
            stop_on_first_error: false,
        }
    }

    pub fn sequential() -> Self {
        Self {
            mode: ExecMode::Sequential,
            stop_on_first_error: false,
        }
    }

    /// After the first failure, repositories not yet started are recorded as
    /// `Skipped("earlier failure")` instead of being attempted.
    pub fn stop_on_first_error(mut self, stop: bool) -> Self {
        self.stop_on_first_error = stop;
        self
    }

    pub async fn run<F, Fut>(&self, operation: &str, selection: &RepoSelection, op: F) -> ExecutionReport
    where
        F: Fn(Repository) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Step>> + Send + 'static,
    {
        glog_debug!(
            "RepoSetExecutor::run op={} repos={} mode={:?} stop_on_first_error={}",
            operation,
            selection.len(),
            self.mode,
            self.stop_on_first_error
        );
        let report = match self.mode {
            ExecMode::Sequential => self.run_sequential(operation, selection, op).await,
            ExecMode::Parallel { max_concurrency } => {
                self.run_parallel(operation, selection, op, max_concurrency).await
            }
        };
        for (repo, failure) in report.failures() {
            glog_warn!("{} failed in {}: {}", operation, repo.name, failure.message);
        }
        report
    }

    async fn run_sequential<F, Fut>(&self, operation: &str, selection: &RepoSelection, op: F) -> ExecutionReport
    where
        F: Fn(Repository) -> Fut,
        Fut: Future<Output = Result<Step>>,
    {
        let mut report = ExecutionReport::new(operation);
        let mut halted = false;
        for repo in selection.iter() {
            if halted {
                report.push(repo.clone(), Outcome::Skipped(EARLIER_FAILURE.to_string()));
                continue;
            }
            let outcome = Outcome::from_result(op(repo.clone()).await);
            halted = self.stop_on_first_error && outcome.is_failed();
            report.push(repo.clone(), outcome);
        }
        report
    }

    async fn run_parallel<F, Fut>(
        &self,
        operation: &str,
        selection: &RepoSelection,
        op: F,
        max_concurrency: usize,
    ) -> ExecutionReport
    where
        F: Fn(Repository) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Step>> + Send + 'static,
    {
        let op = Arc::new(op);
        let permits = Arc::new(Semaphore::new(max_concurrency));
        let halted = Arc::new(AtomicBool::new(false));
        let stop_on_first_error = self.stop_on_first_error;

        let handles: Vec<_> = selection
            .iter()
            .map(|repo| {
                let op = Arc::clone(&op);
                let permits = Arc::clone(&permits);
                let halted = Arc::clone(&halted);
                let repo = repo.clone();
                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    if stop_on_first_error && halted.load(Ordering::SeqCst) {
                        return Outcome::Skipped(EARLIER_FAILURE.to_string());
                    }
                    let outcome = Outcome::from_result(op(repo).await);
                    if stop_on_first_error && outcome.is_failed() {
                        halted.store(true, Ordering::SeqCst);
                    }
                    outcome
                })
            })
            .collect();

        let mut report = ExecutionReport::new(operation);
        for (repo, handle) in selection.iter().zip(handles) {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => Outcome::Failed(Failure {
                    kind: FailureKind::Aborted,
                    message: format!("task aborted: {}", join_err),
                }),
            };
            report.push(repo.clone(), outcome);
        }
        report
    }
}
