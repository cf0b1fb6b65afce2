//! `HealingPolicy` evaluation: trigger planning, action naming, reconcile loop.

pub mod controller;
pub mod evaluator;
pub mod naming;

pub use controller::{error_policy, reconcile_policy};
pub use evaluator::{Candidate, EvaluationPlan, Suppression};
pub use naming::ActionNaming;
