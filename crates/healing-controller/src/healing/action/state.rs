//! Forward-only lifecycle of a `HealingAction`.
//!
//! ```text
//! Pending -> Validating -> Approved -> Executing -> Succeeded
//!                     \-> Denied          |  ^  \-> Failed
//!                                         v  |
//!                                       Retrying
//! ```
//!
//! `Executing <-> Retrying` is the only loop; it is bounded by the retry
//! ceiling, and a resumed `Retrying` action that already hit the ceiling goes
//! straight to `Failed`. Terminal phases never change again.

use crate::crds::ActionPhase;

pub trait PhaseExt {
    fn is_terminal(self) -> bool;
    /// Admitted by the safety controller and not yet finished
    fn is_admitted(self) -> bool;
    fn can_transition_to(self, next: ActionPhase) -> bool;
}

impl PhaseExt for ActionPhase {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionPhase::Succeeded | ActionPhase::Failed | ActionPhase::Denied
        )
    }

    fn is_admitted(self) -> bool {
        matches!(
            self,
            ActionPhase::Approved | ActionPhase::Executing | ActionPhase::Retrying
        )
    }

    fn can_transition_to(self, next: ActionPhase) -> bool {
        use ActionPhase::{
            Approved, Denied, Executing, Failed, Pending, Retrying, Succeeded, Validating,
        };
        matches!(
            (self, next),
            (Pending, Validating)
                | (Validating, Approved | Denied)
                | (Approved | Retrying, Executing)
                | (Executing, Succeeded | Failed | Retrying)
                | (Retrying, Failed)
        )
    }
}

/// Error for a transition the lifecycle does not allow
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal phase transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: ActionPhase,
    pub to: ActionPhase,
}

/// Validate `from -> to`. Re-asserting a non-terminal phase (for example an
/// attempt counter update while `Executing`) is allowed.
pub fn check_transition(from: ActionPhase, to: ActionPhase) -> Result<(), IllegalTransition> {
    if from.can_transition_to(to) || (from == to && !from.is_terminal()) {
        Ok(())
    } else {
        Err(IllegalTransition { from, to })
    }
}
