//! Griptree lifecycle: `Absent -> Creating -> Active -> Removing -> Absent`.

use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GriptreeState {
    Absent,
    Creating,
    Active { locked: bool },
    Removing,
}

impl fmt::Display for GriptreeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GriptreeState::Absent => write!(f, "absent"),
            GriptreeState::Creating => write!(f, "creating"),
            GriptreeState::Active { locked: false } => write!(f, "active"),
            GriptreeState::Active { locked: true } => write!(f, "active (locked)"),
            GriptreeState::Removing => write!(f, "removing"),
        }
    }
}

impl GriptreeState {
    /// Valid moves:
    /// - Absent -> Creating
    /// - Creating -> Active (unlocked) or back to Absent on rollback
    /// - Active -> Active with either lock bit
    /// - Active -> Removing (the lock check is the caller's, since `--force` overrides it)
    /// - Removing -> Absent
    pub fn can_transition(&self, target: GriptreeState) -> bool {
        matches!(
            (self, target),
            (GriptreeState::Absent, GriptreeState::Creating)
                | (GriptreeState::Creating, GriptreeState::Active { locked: false })
                | (GriptreeState::Creating, GriptreeState::Absent)
                | (GriptreeState::Active { .. }, GriptreeState::Active { .. })
                | (GriptreeState::Active { .. }, GriptreeState::Removing)
                | (GriptreeState::Removing, GriptreeState::Absent)
        )
    }

    pub fn transition(&mut self, target: GriptreeState) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidTransition {
                from: self.to_string(),
                to: target.to_string(),
            });
        }
        *self = target;
        Ok(())
    }
}
