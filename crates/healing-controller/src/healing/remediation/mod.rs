//! Execution side of the pipeline: cluster mutations, retry, audit ledger.

pub mod cluster;
pub mod engine;
pub mod recorder;

pub use cluster::{ClusterError, ClusterOps, KubeClusterOps};
pub use engine::{ExecutionOutcome, RemediationEngine, RetryPolicy, StatusSink, StatusUpdate};
pub use recorder::{ActionRecord, ActionRecorder, DecisionRecord, SweepReport};
