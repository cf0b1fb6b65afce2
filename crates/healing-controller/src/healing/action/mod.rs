//! `HealingAction` lifecycle: state machine and reconcile loop.

pub mod controller;
pub mod state;

pub use controller::{
    error_action, reconcile_action, ActionDriver, KubePolicySource, KubeStatusSink, PolicySource,
};
pub use state::{check_transition, IllegalTransition, PhaseExt};
