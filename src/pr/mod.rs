//! Linked pull requests: one PR per repository on a shared feature branch,
//! created, tracked and merged as one release unit.

mod coordinator;
mod link;
mod merge;

pub use coordinator::{PrCoordinator, PrCreation, PrOptions, PrStatus};
pub use link::{parse_marker, render_marker, with_marker, LinkSet, LinkedPr, MARKER_PREFIX};
pub use merge::{Blocker, MergeCandidate, MergeOptions, MergeReport};

use std::fmt;

use serde::{Deserialize, Serialize};

/// How the members of a link set are merged together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Check every member first and merge nothing unless all are ready.
    #[default]
    AllOrNothing,
    /// Declaration order, configuration repository last; stop at the first failure.
    Sequential,
    /// Attempt every member regardless of the others.
    Independent,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStrategy::AllOrNothing => write!(f, "all-or-nothing"),
            MergeStrategy::Sequential => write!(f, "sequential"),
            MergeStrategy::Independent => write!(f, "independent"),
        }
    }
}
