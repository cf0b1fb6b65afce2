//! Per-(policy, target) safety bookkeeping.
//!
//! Two `DashMap`s back the store: one keyed by (policy, target) holding the
//! in-flight set, the admission window and the cooldown anchor, and one keyed
//! by policy holding which targets were touched inside the window (blast
//! radius). Admission always locks the policy entry first and the target entry
//! second; every other path locks at most one entry.

use crate::crds::{PolicyRef, TargetRef};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::{BTreeSet, VecDeque};

/// Largest failure exponent applied to a cooldown
pub const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Identity of the unit every safety check is scoped to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SafetyKey {
    pub policy: PolicyRef,
    pub target: TargetRef,
}

impl SafetyKey {
    #[must_use]
    pub fn new(policy: PolicyRef, target: TargetRef) -> Self {
        Self { policy, target }
    }
}

impl std::fmt::Display for SafetyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.policy, self.target)
    }
}

/// How an admitted action left the in-flight set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Succeeded,
    Failed,
    /// Dropped without a terminal outcome (shutdown, lost status write)
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct SafetyState {
    /// Action ids admitted and not yet released
    pub in_flight: BTreeSet<String>,
    /// Admission timestamps, oldest first
    pub window: VecDeque<DateTime<Utc>>,
    /// Cooldown anchor
    pub last_action: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Settings seen at the last admission, used by `purge`
    pub cooldown: Duration,
    pub window_len: Duration,
}

impl Default for SafetyState {
    fn default() -> Self {
        Self {
            in_flight: BTreeSet::new(),
            window: VecDeque::new(),
            last_action: None,
            consecutive_failures: 0,
            cooldown: Duration::zero(),
            window_len: Duration::zero(),
        }
    }
}

impl SafetyState {
    /// Cooldown stretched by consecutive failures: `cooldown * 2^min(failures, cap)`.
    /// Saturates at `Duration::MAX`.
    #[must_use]
    pub fn effective_cooldown(&self, base: Duration, backoff_cap: u32) -> Duration {
        let exponent = self.consecutive_failures.min(backoff_cap).min(MAX_BACKOFF_EXPONENT);
        base.checked_mul(1_i32 << exponent).unwrap_or(Duration::MAX)
    }

    /// Remaining cooldown at `now`, if any. A cooldown ending past the
    /// representable time range never elapses.
    #[must_use]
    pub fn cooldown_remaining(
        &self,
        base: Duration,
        backoff_cap: u32,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let last = self.last_action?;
        match last.checked_add_signed(self.effective_cooldown(base, backoff_cap)) {
            Some(until) => (until > now).then(|| until - now),
            None => Some(Duration::MAX),
        }
    }

    /// Admissions strictly inside `(now - window_len, now]`
    #[must_use]
    pub fn actions_in_window(&self, now: DateTime<Utc>, window_len: Duration) -> usize {
        let floor = now - window_len;
        self.window.iter().filter(|at| **at > floor).count()
    }

    fn prune(&mut self, now: DateTime<Utc>, window_len: Duration) {
        let floor = now - window_len;
        while self.window.front().is_some_and(|at| *at <= floor) {
            self.window.pop_front();
        }
    }

    fn is_idle(&self, now: DateTime<Utc>, backoff_cap: u32) -> bool {
        if !self.in_flight.is_empty() {
            return false;
        }
        let horizon = self.effective_cooldown(self.cooldown, backoff_cap).max(self.window_len);
        let anchor_elapsed = match self.last_action {
            Some(at) => at.checked_add_signed(horizon).is_some_and(|until| until <= now),
            None => true,
        };
        anchor_elapsed && self.actions_in_window(now, self.window_len) == 0
    }
}

/// Targets a policy touched inside its window
#[derive(Debug, Clone)]
pub struct PolicyWindow {
    pub touched: VecDeque<(DateTime<Utc>, TargetRef)>,
    pub window_len: Duration,
}

impl Default for PolicyWindow {
    fn default() -> Self {
        Self {
            touched: VecDeque::new(),
            window_len: Duration::zero(),
        }
    }
}

impl PolicyWindow {
    #[must_use]
    pub fn distinct_targets(&self, now: DateTime<Utc>, window_len: Duration) -> BTreeSet<&TargetRef> {
        let floor = now - window_len;
        self.touched
            .iter()
            .filter(|(at, _)| *at > floor)
            .map(|(_, target)| target)
            .collect()
    }

    fn prune(&mut self, now: DateTime<Utc>, window_len: Duration) {
        let floor = now - window_len;
        while self.touched.front().is_some_and(|(at, _)| *at <= floor) {
            self.touched.pop_front();
        }
    }
}

/// Concurrent store of safety state
#[derive(Debug, Default)]
pub struct ActionStore {
    targets: DashMap<SafetyKey, SafetyState>,
    policies: DashMap<PolicyRef, PolicyWindow>,
    failure_backoff_cap: u32,
}

impl ActionStore {
    #[must_use]
    pub fn new(failure_backoff_cap: u32) -> Self {
        Self {
            targets: DashMap::new(),
            policies: DashMap::new(),
            failure_backoff_cap,
        }
    }

    #[must_use]
    pub fn failure_backoff_cap(&self) -> u32 {
        self.failure_backoff_cap
    }

    /// Run `f` while holding both entries for `key` exclusively.
    ///
    /// Stale window entries are pruned before `f` runs.
    pub fn with_entry<T>(
        &self,
        key: &SafetyKey,
        window_len: Duration,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut PolicyWindow, &mut SafetyState) -> T,
    ) -> T {
        let mut policy = self.policies.entry(key.policy.clone()).or_default();
        let mut state = self.targets.entry(key.clone()).or_default();
        policy.prune(now, window_len);
        state.prune(now, window_len);
        f(policy.value_mut(), state.value_mut())
    }

    /// Read both entries for `key` without creating them
    pub fn inspect<T>(
        &self,
        key: &SafetyKey,
        f: impl FnOnce(Option<&PolicyWindow>, Option<&SafetyState>) -> T,
    ) -> T {
        let policy = self.policies.get(&key.policy);
        let state = self.targets.get(key);
        f(policy.as_deref(), state.as_deref())
    }

    /// Remove `action_id` from the in-flight set. Returns whether it was held.
    pub fn release(&self, key: &SafetyKey, action_id: &str, release: Release) -> bool {
        let Some(mut state) = self.targets.get_mut(key) else {
            return false;
        };
        let held = state.in_flight.remove(action_id);
        if held {
            match release {
                Release::Succeeded => state.consecutive_failures = 0,
                Release::Failed => {
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                }
                Release::Abandoned => {}
            }
        }
        held
    }

    /// Put an already-admitted action back into the in-flight set
    pub fn adopt(&self, key: &SafetyKey, action_id: &str) {
        self.targets
            .entry(key.clone())
            .or_default()
            .in_flight
            .insert(action_id.to_string());
    }

    /// Rebuild an admission observed before a restart
    pub fn restore_admission(
        &self,
        key: &SafetyKey,
        at: DateTime<Utc>,
        cooldown: Duration,
        window_len: Duration,
        counts_toward_limits: bool,
    ) {
        if counts_toward_limits {
            let mut policy = self.policies.entry(key.policy.clone()).or_default();
            policy.window_len = policy.window_len.max(window_len);
            let position = policy.touched.partition_point(|(t, _)| *t <= at);
            policy.touched.insert(position, (at, key.target.clone()));
        }
        let mut state = self.targets.entry(key.clone()).or_default();
        state.cooldown = cooldown;
        state.window_len = state.window_len.max(window_len);
        if counts_toward_limits {
            let position = state.window.partition_point(|t| *t <= at);
            state.window.insert(position, at);
        }
        if !matches!(state.last_action, Some(last) if last >= at) {
            state.last_action = Some(at);
        }
    }

    /// Drop entries that no longer constrain any admission
    pub fn purge(&self, now: DateTime<Utc>) -> usize {
        let cap = self.failure_backoff_cap;
        let before = self.targets.len() + self.policies.len();
        self.targets.retain(|_, state| !state.is_idle(now, cap));
        self.policies.retain(|_, policy| {
            let window_len = policy.window_len;
            policy.prune(now, window_len);
            !policy.touched.is_empty()
        });
        before.saturating_sub(self.targets.len() + self.policies.len())
    }

    #[must_use]
    pub fn snapshot(&self, key: &SafetyKey) -> Option<SafetyState> {
        self.targets.get(key).map(|state| state.clone())
    }

    #[must_use]
    pub fn in_flight_total(&self) -> usize {
        self.targets.iter().map(|entry| entry.in_flight.len()).sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
