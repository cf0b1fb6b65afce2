//! Safety gate between a materialized action and the cluster.
//!
//! Every admission goes through [`SafetyController::validate`], which decides
//! and records the admission inside one critical section per
//! (policy, target). Checks run in a fixed order so a denial is reproducible:
//! dry-run, cooldown, concurrency cap, rate limit, blast radius.

pub mod recovery;
pub mod store;

pub use store::{ActionStore, Release, SafetyKey, SafetyState};

use super::metrics::HealingMetrics;
use crate::crds::{ActionOutcome, SafetySpec};
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::Arc;
use store::PolicyWindow;
use tracing::{debug, info};

/// Why an action was not admitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    Cooldown { remaining_seconds: i64 },
    ConcurrencyCap { in_flight: usize, max: u32 },
    RateLimited { count: usize, max: u32, window_seconds: u64 },
    BlastRadius { targets: usize, max: u32 },
    RejectedByOperator,
    PolicyNotFound,
}

impl DenyReason {
    /// Machine-readable reason written to `status.reason`
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            DenyReason::Cooldown { .. } => "Cooldown",
            DenyReason::ConcurrencyCap { .. } => "ConcurrencyCap",
            DenyReason::RateLimited { .. } => "RateLimited",
            DenyReason::BlastRadius { .. } => "BlastRadius",
            DenyReason::RejectedByOperator => "RejectedByOperator",
            DenyReason::PolicyNotFound => "PolicyNotFound",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::Cooldown { remaining_seconds } => {
                write!(f, "target is cooling down for another {remaining_seconds}s")
            }
            DenyReason::ConcurrencyCap { in_flight, max } => {
                write!(f, "{in_flight} action(s) already in flight (max {max})")
            }
            DenyReason::RateLimited {
                count,
                max,
                window_seconds,
            } => write!(
                f,
                "{count} action(s) admitted in the last {window_seconds}s (max {max})"
            ),
            DenyReason::BlastRadius { targets, max } => write!(
                f,
                "policy already touched {targets} distinct target(s) this window (max {max})"
            ),
            DenyReason::RejectedByOperator => f.write_str("operator rejected the action"),
            DenyReason::PolicyNotFound => f.write_str("owning policy no longer exists"),
        }
    }
}

/// Admission request for one action
#[derive(Debug, Clone, Copy)]
pub struct ValidationRequest<'a> {
    pub action_id: &'a str,
    pub key: &'a SafetyKey,
    pub safety: &'a SafetySpec,
}

/// Outcome of [`SafetyController::validate`]
#[derive(Debug)]
pub enum Verdict {
    Approved(InFlightPermit),
    Denied(DenyReason),
}

impl Verdict {
    #[must_use]
    pub fn is_approved(&self) -> bool {
        matches!(self, Verdict::Approved(_))
    }
}

/// Holds one in-flight slot until released.
///
/// Dropping the permit frees the slot without touching failure accounting.
pub struct InFlightPermit {
    store: Arc<ActionStore>,
    key: SafetyKey,
    action_id: String,
    simulated: bool,
    released: bool,
}

impl InFlightPermit {
    #[must_use]
    pub fn key(&self) -> &SafetyKey {
        &self.key
    }

    #[must_use]
    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    /// Dry-run admissions occupy no slot and must not mutate the cluster
    #[must_use]
    pub fn is_simulated(&self) -> bool {
        self.simulated
    }

    /// Release with an execution outcome
    pub fn complete(mut self, outcome: ActionOutcome) {
        let release = if outcome.is_success() {
            Release::Succeeded
        } else {
            Release::Failed
        };
        self.release_slot(release);
    }

    /// Release without an outcome
    pub fn abandon(mut self) {
        self.release_slot(Release::Abandoned);
    }

    fn release_slot(&mut self, release: Release) {
        if self.released {
            return;
        }
        self.released = true;
        if !self.simulated {
            self.store.release(&self.key, &self.action_id, release);
        }
    }
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.release_slot(Release::Abandoned);
    }
}

impl fmt::Debug for InFlightPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightPermit")
            .field("key", &self.key)
            .field("action_id", &self.action_id)
            .field("simulated", &self.simulated)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

pub struct SafetyController {
    store: Arc<ActionStore>,
    force_dry_run: bool,
    metrics: Arc<HealingMetrics>,
}

impl SafetyController {
    #[must_use]
    pub fn new(store: Arc<ActionStore>, force_dry_run: bool, metrics: Arc<HealingMetrics>) -> Self {
        Self {
            store,
            force_dry_run,
            metrics,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ActionStore> {
        &self.store
    }

    /// Whether actions under `safety` run simulated
    #[must_use]
    pub fn is_dry_run(&self, safety: &SafetySpec) -> bool {
        self.force_dry_run || safety.dry_run
    }

    /// Decide and record admission of one action.
    ///
    /// Revalidating an action that already holds a slot approves it again
    /// without consuming another slot.
    pub fn validate(&self, req: &ValidationRequest<'_>, now: DateTime<Utc>) -> Verdict {
        let cooldown = seconds(req.safety.cooldown_seconds);
        let window_len = seconds(req.safety.window_seconds);
        let cap = self.store.failure_backoff_cap();
        let simulated = self.is_dry_run(req.safety);

        let decision: Result<(), DenyReason> =
            self.store.with_entry(req.key, window_len, now, |policy, state| {
                if simulated {
                    // Anchors the cooldown so a dry run paces like a real one.
                    state.last_action = Some(now);
                    state.cooldown = cooldown;
                    state.window_len = window_len;
                    return Ok(());
                }
                if state.in_flight.contains(req.action_id) {
                    return Ok(());
                }
                check_admission(req, Some(policy), Some(state), cap, now)?;

                state.in_flight.insert(req.action_id.to_string());
                state.window.push_back(now);
                state.last_action = Some(now);
                state.cooldown = cooldown;
                state.window_len = window_len;
                policy.touched.push_back((now, req.key.target.clone()));
                policy.window_len = policy.window_len.max(window_len);
                Ok(())
            });

        match decision {
            Ok(()) => {
                let result = if simulated { "dry_run" } else { "approved" };
                self.metrics.record_validation(result);
                info!(
                    action = %req.action_id,
                    key = %req.key,
                    simulated,
                    "Action admitted"
                );
                Verdict::Approved(InFlightPermit {
                    store: Arc::clone(&self.store),
                    key: req.key.clone(),
                    action_id: req.action_id.to_string(),
                    simulated,
                    released: false,
                })
            }
            Err(reason) => {
                self.metrics.record_validation("denied");
                info!(
                    action = %req.action_id,
                    key = %req.key,
                    reason = reason.reason(),
                    "Action denied: {reason}"
                );
                Verdict::Denied(reason)
            }
        }
    }

    /// Evaluate the checks for `key` without recording anything
    pub fn preview(
        &self,
        key: &SafetyKey,
        safety: &SafetySpec,
        now: DateTime<Utc>,
    ) -> Result<(), DenyReason> {
        let req = ValidationRequest {
            action_id: "",
            key,
            safety,
        };
        let cap = self.store.failure_backoff_cap();
        self.store
            .inspect(key, |policy, state| check_admission(&req, policy, state, cap, now))
    }

    /// Remaining cooldown for `key`, dry-run anchors included
    #[must_use]
    pub fn cooldown_remaining(
        &self,
        key: &SafetyKey,
        safety: &SafetySpec,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let cap = self.store.failure_backoff_cap();
        self.store.inspect(key, |_, state| {
            state.and_then(|s| s.cooldown_remaining(seconds(safety.cooldown_seconds), cap, now))
        })
    }

    /// Reclaim the slot of an action admitted before a restart
    #[must_use]
    pub fn adopt(&self, key: &SafetyKey, action_id: &str, simulated: bool) -> InFlightPermit {
        if !simulated {
            self.store.adopt(key, action_id);
        }
        debug!(action = %action_id, key = %key, simulated, "Adopted admitted action");
        InFlightPermit {
            store: Arc::clone(&self.store),
            key: key.clone(),
            action_id: action_id.to_string(),
            simulated,
            released: false,
        }
    }

    /// Drop bookkeeping that no longer constrains admission
    pub fn purge(&self, now: DateTime<Utc>) -> usize {
        self.store.purge(now)
    }
}

fn check_admission(
    req: &ValidationRequest<'_>,
    policy: Option<&PolicyWindow>,
    state: Option<&SafetyState>,
    backoff_cap: u32,
    now: DateTime<Utc>,
) -> Result<(), DenyReason> {
    let safety = req.safety;
    let window_len = seconds(safety.window_seconds);

    if let Some(state) = state {
        if let Some(remaining) =
            state.cooldown_remaining(seconds(safety.cooldown_seconds), backoff_cap, now)
        {
            return Err(DenyReason::Cooldown {
                remaining_seconds: remaining.num_seconds().max(1),
            });
        }

        let in_flight = state.in_flight.len();
        if in_flight >= safety.max_concurrent_actions as usize {
            return Err(DenyReason::ConcurrencyCap {
                in_flight,
                max: safety.max_concurrent_actions,
            });
        }

        let count = state.actions_in_window(now, window_len);
        if safety.max_actions_per_window > 0 && count >= safety.max_actions_per_window as usize {
            return Err(DenyReason::RateLimited {
                count,
                max: safety.max_actions_per_window,
                window_seconds: safety.window_seconds,
            });
        }
    } else if safety.max_concurrent_actions == 0 {
        return Err(DenyReason::ConcurrencyCap {
            in_flight: 0,
            max: 0,
        });
    }

    if let Some(policy) = policy {
        let touched = policy.distinct_targets(now, window_len);
        if safety.max_targets_per_window > 0
            && !touched.contains(&req.key.target)
            && touched.len() >= safety.max_targets_per_window as usize
        {
            return Err(DenyReason::BlastRadius {
                targets: touched.len(),
                max: safety.max_targets_per_window,
            });
        }
    }

    Ok(())
}

pub(crate) fn seconds(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value.min(100 * 365 * 24 * 3600)).unwrap_or(i64::MAX / 1_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{PolicyRef, TargetKind, TargetRef};

    fn key(policy: &str, target: &str) -> SafetyKey {
        SafetyKey::new(
            PolicyRef {
                namespace: "apps".to_string(),
                name: policy.to_string(),
            },
            TargetRef::new(TargetKind::Deployment, Some("apps"), target),
        )
    }

    fn controller(force_dry_run: bool) -> SafetyController {
        SafetyController::new(
            Arc::new(ActionStore::new(4)),
            force_dry_run,
            Arc::new(HealingMetrics::new()),
        )
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn spec(cooldown: u64, max_concurrent: u32) -> SafetySpec {
        SafetySpec {
            cooldown_seconds: cooldown,
            max_concurrent_actions: max_concurrent,
            ..SafetySpec::default()
        }
    }

    fn validate(c: &SafetyController, id: &str, k: &SafetyKey, s: &SafetySpec, now: DateTime<Utc>) -> Verdict {
        c.validate(
            &ValidationRequest {
                action_id: id,
                key: k,
                safety: s,
            },
            now,
        )
    }

    #[test]
    fn cooldown_denies_until_elapsed() {
        let c = controller(false);
        let k = key("cpu", "web");
        let s = spec(300, 1);

        let Verdict::Approved(permit) = validate(&c, "apps/a1", &k, &s, at(0)) else {
            panic!("first action should be admitted");
        };
        permit.complete(ActionOutcome::Succeeded);

        match validate(&c, "apps/a2", &k, &s, at(120)) {
            Verdict::Denied(DenyReason::Cooldown { remaining_seconds }) => {
                assert_eq!(remaining_seconds, 180);
            }
            other => panic!("expected cooldown denial, got {other:?}"),
        }
        assert!(validate(&c, "apps/a3", &k, &s, at(301)).is_approved());
    }

    #[test]
    fn concurrency_cap_counts_held_permits() {
        let c = controller(false);
        let k = key("cpu", "web");
        let s = spec(0, 2);

        let first = validate(&c, "apps/a1", &k, &s, at(0));
        let second = validate(&c, "apps/a2", &k, &s, at(0));
        assert!(first.is_approved() && second.is_approved());

        match validate(&c, "apps/a3", &k, &s, at(0)) {
            Verdict::Denied(reason) => assert_eq!(reason.reason(), "ConcurrencyCap"),
            Verdict::Approved(_) => panic!("cap exceeded"),
        }

        drop(first);
        assert!(validate(&c, "apps/a4", &k, &s, at(1)).is_approved());
    }

    #[test]
    fn revalidation_of_held_action_is_idempotent() {
        let c = controller(false);
        let k = key("cpu", "web");
        let s = spec(300, 1);

        let Verdict::Approved(permit) = validate(&c, "apps/a1", &k, &s, at(0)) else {
            panic!("first action should be admitted");
        };
        std::mem::forget(permit);
        assert!(validate(&c, "apps/a1", &k, &s, at(5)).is_approved());
        assert_eq!(c.store().snapshot(&k).unwrap().window.len(), 1);
    }

    #[test]
    fn rate_limit_caps_admissions_per_window() {
        let c = controller(false);
        let k = key("cpu", "web");
        let s = SafetySpec {
            cooldown_seconds: 0,
            max_concurrent_actions: 10,
            max_actions_per_window: 2,
            window_seconds: 60,
            ..SafetySpec::default()
        };

        assert!(validate(&c, "apps/a1", &k, &s, at(0)).is_approved());
        assert!(validate(&c, "apps/a2", &k, &s, at(10)).is_approved());
        match validate(&c, "apps/a3", &k, &s, at(20)) {
            Verdict::Denied(reason) => assert_eq!(reason.reason(), "RateLimited"),
            Verdict::Approved(_) => panic!("rate limit exceeded"),
        }
        assert!(validate(&c, "apps/a4", &k, &s, at(61)).is_approved());
    }

    #[test]
    fn blast_radius_limits_distinct_targets() {
        let c = controller(false);
        let s = SafetySpec {
            cooldown_seconds: 0,
            max_targets_per_window: 2,
            ..SafetySpec::default()
        };

        assert!(validate(&c, "apps/a1", &key("cpu", "a"), &s, at(0)).is_approved());
        assert!(validate(&c, "apps/a2", &key("cpu", "b"), &s, at(1)).is_approved());
        match validate(&c, "apps/a3", &key("cpu", "c"), &s, at(2)) {
            Verdict::Denied(DenyReason::BlastRadius { targets, max }) => {
                assert_eq!((targets, max), (2, 2));
            }
            other => panic!("expected blast radius denial, got {other:?}"),
        }
        // A different policy has its own budget.
        assert!(validate(&c, "apps/a4", &key("mem", "c"), &s, at(2)).is_approved());
    }

    #[test]
    fn dry_run_approves_without_holding_a_slot() {
        let c = controller(true);
        let k = key("cpu", "web");
        let s = spec(300, 1);

        let Verdict::Approved(permit) = validate(&c, "apps/a1", &k, &s, at(0)) else {
            panic!("dry run always admits");
        };
        assert!(permit.is_simulated());
        assert_eq!(c.store().in_flight_total(), 0);
        assert!(c.cooldown_remaining(&k, &s, at(10)).is_some());
    }

    #[test]
    fn failures_stretch_the_cooldown() {
        let c = controller(false);
        let k = key("cpu", "web");
        let s = spec(100, 1);

        let Verdict::Approved(permit) = validate(&c, "apps/a1", &k, &s, at(0)) else {
            panic!("first action should be admitted");
        };
        permit.complete(ActionOutcome::Failed);

        assert!(c.preview(&k, &s, at(150)).is_err());
        assert!(c.preview(&k, &s, at(201)).is_ok());
    }

    #[test]
    fn long_cooldown_with_many_failures_denies_without_panicking() {
        let c = SafetyController::new(
            Arc::new(ActionStore::new(store::MAX_BACKOFF_EXPONENT)),
            false,
            Arc::new(HealingMetrics::new()),
        );
        let k = key("cpu", "web");
        let s = spec(365 * 24 * 3600, 1);
        for n in 0..20 {
            c.store().adopt(&k, &format!("apps/a{n}"));
            c.store().release(&k, &format!("apps/a{n}"), Release::Failed);
        }
        c.store().restore_admission(&k, at(0), seconds(s.cooldown_seconds), Duration::zero(), true);

        match validate(&c, "apps/next", &k, &s, at(1)) {
            Verdict::Denied(DenyReason::Cooldown { remaining_seconds }) => {
                assert!(remaining_seconds > 0);
            }
            other => panic!("expected cooldown denial, got {other:?}"),
        }
    }

    #[test]
    fn preview_does_not_record() {
        let c = controller(false);
        let k = key("cpu", "web");
        let s = spec(300, 1);
        assert!(c.preview(&k, &s, at(0)).is_ok());
        assert!(c.store().is_empty());
    }
}
