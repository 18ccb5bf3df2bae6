//! Link sets and the `repo#number` marker kept in one PR body.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::platform::{CheckStatus, PrState};

pub const MARKER_PREFIX: &str = "<!-- grip:linked-prs";

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<!-- grip:linked-prs ?([^>]*?) ?-->").expect("valid regex"))
}

/// One member of a link set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkedPr {
    /// Workspace repository name.
    pub repo: String,
    pub owner: String,
    pub repo_name: String,
    pub number: u64,
    pub url: String,
    pub head: String,
    pub state: PrState,
    pub approved: bool,
    pub checks: CheckStatus,
    pub mergeable: bool,
}

impl LinkedPr {
    pub fn checks_pass(&self) -> bool {
        self.checks == CheckStatus::Success
    }

    /// Reasons this PR cannot be merged right now. With `skip_checks` the
    /// check status is not considered.
    pub fn blockers(&self, skip_checks: bool) -> Vec<String> {
        let mut reasons = Vec::new();
        if self.state != PrState::Open {
            reasons.push(format!("pull request is {}", self.state));
        }
        if !self.approved {
            reasons.push("not approved".to_string());
        }
        if !skip_checks && !self.checks_pass() {
            reasons.push(format!("checks {}", self.checks));
        }
        if !self.mergeable {
            reasons.push("not mergeable".to_string());
        }
        reasons
    }

    pub fn is_ready(&self) -> bool {
        self.blockers(false).is_empty()
    }
}

impl fmt::Display for LinkedPr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} [{}] approved={} checks={} mergeable={}",
            self.repo, self.number, self.state, self.approved, self.checks, self.mergeable
        )
    }
}

/// Pull requests sharing one feature branch, in workspace declaration order
/// with the configuration repository last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkSet {
    pub branch: String,
    pub members: Vec<LinkedPr>,
}

impl LinkSet {
    pub fn new(branch: &str) -> Self {
        Self {
            branch: branch.to_string(),
            members: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn get(&self, repo: &str) -> Option<&LinkedPr> {
        self.members.iter().find(|m| m.repo == repo)
    }

    pub fn repos(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.repo.as_str()).collect()
    }

    /// Every member ready to merge. An empty set is never ready.
    pub fn is_ready(&self) -> bool {
        !self.members.is_empty() && self.members.iter().all(LinkedPr::is_ready)
    }

    pub fn marker(&self) -> String {
        render_marker(self.members.iter().map(|m| (m.repo.as_str(), m.number)))
    }
}

pub fn render_marker<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, u64)>,
{
    let list: Vec<String> = entries
        .into_iter()
        .map(|(repo, number)| format!("{}#{}", repo, number))
        .collect();
    format!("{} {} -->", MARKER_PREFIX, list.join(","))
}

/// `repo#number` pairs from the first marker in `body`. Malformed entries
/// are dropped.
pub fn parse_marker(body: &str) -> Vec<(String, u64)> {
    let Some(caps) = marker_regex().captures(body) else {
        return Vec::new();
    };
    caps[1]
        .split(',')
        .filter_map(|entry| {
            let (repo, number) = entry.trim().rsplit_once('#')?;
            let number = number.parse().ok()?;
            (!repo.is_empty()).then(|| (repo.to_string(), number))
        })
        .collect()
}

/// `body` with its marker replaced by `marker`, or `marker` appended.
pub fn with_marker(body: &str, marker: &str) -> String {
    if marker_regex().is_match(body) {
        return marker_regex().replace(body, regex::NoExpand(marker)).into_owned();
    }
    if body.trim().is_empty() {
        marker.to_string()
    } else {
        format!("{}\n\n{}", body.trim_end(), marker)
    }
}
