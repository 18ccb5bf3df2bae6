//! Merge strategies for a link set.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;

use crate::executor::{ExecutionReport, Outcome, Step, EARLIER_FAILURE};
use crate::platform::{HostingPlatform, MergeMethod, PrState};
use crate::pr::link::LinkedPr;
use crate::pr::MergeStrategy;
use crate::repo::Repository;
use crate::util::{retry_transient, with_timeout, Backoff};
use crate::{glog, glog_debug, glog_warn, Error, Result};

/// A link set member together with what is needed to act on it. `pr` is
/// the error text when the member's status could not be determined.
#[derive(Clone)]
pub struct MergeCandidate {
    pub repo: Repository,
    pub pr: std::result::Result<LinkedPr, String>,
    pub platform: Arc<dyn HostingPlatform>,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Overrides the workspace's configured strategy.
    pub strategy: Option<MergeStrategy>,
    pub method: Option<MergeMethod>,
    /// Ignore failing or pending checks. Approval and mergeability still apply.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Blocker {
    pub repo: String,
    pub number: Option<u64>,
    pub reasons: Vec<String>,
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.number {
            Some(number) => write!(f, "{}#{}: {}", self.repo, number, self.reasons.join(", ")),
            None => write!(f, "{}: {}", self.repo, self.reasons.join(", ")),
        }
    }
}

#[derive(Debug)]
pub struct MergeReport {
    pub strategy: MergeStrategy,
    pub method: MergeMethod,
    pub outcomes: ExecutionReport,
    /// Members that failed the all-or-nothing precondition.
    pub blocked: Vec<Blocker>,
}

#[derive(Serialize)]
struct MergeReportJson<'a> {
    strategy: MergeStrategy,
    method: MergeMethod,
    blocked: &'a [Blocker],
    merged: Vec<&'a str>,
    report: serde_json::Value,
}

impl MergeReport {
    pub fn is_success(&self) -> bool {
        self.blocked.is_empty() && self.outcomes.is_success()
    }

    pub fn merged(&self) -> Vec<&str> {
        self.outcomes.successful_repos().map(|r| r.name.as_str()).collect()
    }

    pub fn to_json(&self) -> Result<String> {
        let json = MergeReportJson {
            strategy: self.strategy,
            method: self.method,
            blocked: &self.blocked,
            merged: self.merged(),
            report: serde_json::from_str(&self.outcomes.to_json()?)?,
        };
        Ok(serde_json::to_string_pretty(&json)?)
    }
}

impl fmt::Display for MergeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.blocked.is_empty() {
            writeln!(f, "merge aborted, nothing was merged; blocked by:")?;
            for blocker in &self.blocked {
                writeln!(f, "  {}", blocker)?;
            }
        }
        write!(f, "{}", self.outcomes)
    }
}

pub(crate) struct Merger {
    pub method: MergeMethod,
    pub force: bool,
    pub platform_timeout: Duration,
    pub verify: Backoff,
}

impl Merger {
    pub async fn run(&self, strategy: MergeStrategy, candidates: Vec<MergeCandidate>) -> MergeReport {
        glog!(
            "Merger::run strategy={} method={} force={} prs={}",
            strategy,
            self.method,
            self.force,
            candidates.len()
        );
        let mut report = MergeReport {
            strategy,
            method: self.method,
            outcomes: ExecutionReport::new("pr merge"),
            blocked: Vec::new(),
        };

        match strategy {
            MergeStrategy::AllOrNothing => self.all_or_nothing(candidates, &mut report).await,
            MergeStrategy::Sequential => self.sequential(candidates, &mut report).await,
            MergeStrategy::Independent => self.independent(candidates, &mut report).await,
        }
        for blocker in &report.blocked {
            glog_warn!("merge blocked by {}", blocker);
        }
        report
    }

    fn blocker(&self, candidate: &MergeCandidate) -> Option<Blocker> {
        if already_merged(candidate) {
            return None;
        }
        let (number, reasons) = match &candidate.pr {
            Ok(pr) => (Some(pr.number), pr.blockers(self.force)),
            Err(message) => (None, vec![format!("status unavailable: {}", message)]),
        };
        (!reasons.is_empty()).then(|| Blocker {
            repo: candidate.repo.name.clone(),
            number,
            reasons,
        })
    }

    async fn all_or_nothing(&self, candidates: Vec<MergeCandidate>, report: &mut MergeReport) {
        report.blocked = candidates.iter().filter_map(|c| self.blocker(c)).collect();
        if !report.blocked.is_empty() {
            let names: Vec<&str> = report.blocked.iter().map(|b| b.repo.as_str()).collect();
            let summary = format!("not merged: blocked by {}", names.join(", "));
            for candidate in candidates {
                let outcome = match report.blocked.iter().find(|b| b.repo == candidate.repo.name) {
                    Some(blocker) => Outcome::failed(&not_mergeable(blocker)),
                    None if already_merged(&candidate) => Outcome::Skipped("already merged".to_string()),
                    None => Outcome::Skipped(summary.clone()),
                };
                report.outcomes.push(candidate.repo, outcome);
            }
            return;
        }

        // Preconditions held for every member. Without force the first
        // failing merge call stops the batch; with force the rest are still
        // attempted and the failure is reported.
        let mut halted = false;
        for candidate in candidates {
            if halted {
                report
                    .outcomes
                    .push(candidate.repo, Outcome::Skipped(EARLIER_FAILURE.to_string()));
                continue;
            }
            let outcome = Outcome::from_result(self.merge_one(&candidate).await);
            halted = !self.force && outcome.is_failed();
            report.outcomes.push(candidate.repo, outcome);
        }
    }

    async fn sequential(&self, candidates: Vec<MergeCandidate>, report: &mut MergeReport) {
        let mut halted = false;
        for candidate in candidates {
            if halted {
                report
                    .outcomes
                    .push(candidate.repo, Outcome::Skipped(EARLIER_FAILURE.to_string()));
                continue;
            }
            let result = match self.blocker(&candidate) {
                Some(blocker) => Err(not_mergeable(&blocker)),
                None => self.merge_one(&candidate).await,
            };
            let outcome = Outcome::from_result(result);
            halted = outcome.is_failed();
            report.outcomes.push(candidate.repo, outcome);
        }
    }

    async fn independent(&self, candidates: Vec<MergeCandidate>, report: &mut MergeReport) {
        for candidate in candidates {
            let result = match self.blocker(&candidate) {
                Some(blocker) => Err(not_mergeable(&blocker)),
                None => self.merge_one(&candidate).await,
            };
            report.outcomes.push(candidate.repo, Outcome::from_result(result));
        }
    }

    /// Merge call followed by verification. The merge call itself is not
    /// retried.
    async fn merge_one(&self, candidate: &MergeCandidate) -> Result<Step> {
        if already_merged(candidate) {
            return Ok(Step::skip("already merged"));
        }
        let pr = candidate
            .pr
            .as_ref()
            .map_err(|message| Error::platform(&candidate.repo.name, message.clone()))?;
        glog_debug!("merging {}#{} via {}", candidate.repo.name, pr.number, self.method);
        with_timeout(
            self.platform_timeout,
            candidate
                .platform
                .merge_pr(&pr.owner, &pr.repo_name, pr.number, self.method),
        )
        .await?;
        self.verify_merged(candidate, pr).await?;
        Ok(Step::done(format!("merged #{} ({})", pr.number, self.method)))
    }

    async fn verify_merged(&self, candidate: &MergeCandidate, pr: &LinkedPr) -> Result<()> {
        let mut last_state = pr.state;
        for attempt in 0..self.verify.attempts.max(1) {
            if attempt > 0 {
                sleep(self.verify.delay(attempt - 1)).await;
            }
            let fetched = retry_transient(Backoff::default(), || {
                with_timeout(
                    self.platform_timeout,
                    candidate.platform.get_pr(&pr.owner, &pr.repo_name, pr.number),
                )
            })
            .await;
            match fetched {
                Ok(current) if current.state == PrState::Merged => return Ok(()),
                Ok(current) => last_state = current.state,
                Err(e) => glog_debug!("verify {}#{}: {}", candidate.repo.name, pr.number, e),
            }
        }
        Err(Error::platform(
            &candidate.repo.name,
            format!("merge reported success but PR is still {}", last_state),
        ))
    }
}

fn already_merged(candidate: &MergeCandidate) -> bool {
    matches!(&candidate.pr, Ok(pr) if pr.state == PrState::Merged)
}

fn not_mergeable(blocker: &Blocker) -> Error {
    match blocker.number {
        Some(number) => Error::NotMergeable {
            repo: blocker.repo.clone(),
            number,
            reason: blocker.reasons.join(", "),
        },
        None => Error::platform(&blocker.repo, blocker.reasons.join(", ")),
    }
}
