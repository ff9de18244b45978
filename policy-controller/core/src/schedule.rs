//! Per-policy scheduling state.
//!
//! A [`PolicySchedule`] decides when a policy is next due for evaluation and
//! enforces that at most one evaluation is in flight at a time. It holds no
//! timers itself; the caller passes the current time and polls [`is_due`].
//!
//! [`is_due`]: PolicySchedule::is_due

use config_policy_controller_k8s_api::{ComplianceState, Interval};
use std::time::{Duration, Instant};

/// How often a terminating policy is re-checked when its noncompliant
/// interval isn't a duration.
pub const TERMINATING_RECHECK: Duration = Duration::from_secs(10);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub attempts: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for a trigger or a timer.
    Idle,
    /// An evaluation identified by `token` is running.
    Evaluating { token: u64 },
}

/// The result of an evaluation pass, as seen by the scheduler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    Evaluated(ComplianceState),
    Failed,
}

/// What the caller should do with a finished evaluation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Settled {
    /// The result belongs to a superseded evaluation and must be discarded.
    Stale,
    /// The result should be published.
    Publish,
    /// The pass failed and will be retried after the given delay.
    Retry(Duration),
    /// The pass failed too many times; the last published status is kept and
    /// annotated with the error.
    Exhausted,
}

#[derive(Clone, Debug)]
pub struct PolicySchedule {
    phase: Phase,
    generation: Option<i64>,
    compliant_interval: Interval,
    noncompliant_interval: Interval,
    state: Option<ComplianceState>,
    backoff: Backoff,
    throttle: Duration,
    failures: u32,
    write_failures: u32,
    dirty: bool,
    next_token: u64,
    due: Option<Instant>,
    last_started: Option<Instant>,
}

// === impl Backoff ===

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5 * 60),
            attempts: 5,
        }
    }
}

impl Backoff {
    /// The delay before retrying after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1 << exp)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

// === impl PolicySchedule ===

impl PolicySchedule {
    pub fn new(backoff: Backoff, throttle: Duration) -> Self {
        Self {
            phase: Phase::Idle,
            generation: None,
            compliant_interval: Interval::Watch,
            noncompliant_interval: Interval::Watch,
            state: None,
            backoff,
            throttle,
            failures: 0,
            write_failures: 0,
            dirty: false,
            next_token: 0,
            due: None,
            last_started: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> Option<ComplianceState> {
        self.state
    }

    pub fn due_at(&self) -> Option<Instant> {
        self.due
    }

    /// Seeds the last known compliance state, e.g. from a published status.
    pub fn set_state(&mut self, state: Option<ComplianceState>) {
        self.state = state;
    }

    /// Records a new policy spec. Returns the token of an in-flight
    /// evaluation that must be aborted, if any.
    ///
    /// A new generation is always evaluated immediately.
    pub fn update_spec(
        &mut self,
        generation: Option<i64>,
        compliant: Interval,
        noncompliant: Interval,
        now: Instant,
    ) -> Option<u64> {
        self.compliant_interval = compliant;
        self.noncompliant_interval = noncompliant;
        if self.generation.is_some() && self.generation == generation {
            return None;
        }

        self.generation = generation;
        self.failures = 0;
        self.write_failures = 0;
        let aborted = self.abort();
        self.due = Some(now);
        aborted
    }

    /// Handles a change to a watched object. Returns true if the policy
    /// became due.
    pub fn trigger(&mut self, now: Instant) -> bool {
        if let Phase::Evaluating { .. } = self.phase {
            self.dirty = true;
            return false;
        }
        if self.current_interval() == Interval::Never {
            return false;
        }

        let earliest = self
            .last_started
            .map(|t| t + self.throttle)
            .filter(|t| *t > now)
            .unwrap_or(now);
        self.due = Some(self.due.map_or(earliest, |d| d.min(earliest)));
        true
    }

    /// Handles a failure to write the status of the last evaluation. The
    /// policy is re-evaluated after a backoff that grows with consecutive
    /// write failures. Returns the delay, or `None` if a pass is already in
    /// flight and will publish a fresh status.
    pub fn status_failed(&mut self, now: Instant) -> Option<Duration> {
        if let Phase::Evaluating { .. } = self.phase {
            return None;
        }

        self.write_failures = self.write_failures.saturating_add(1);
        let delay = self.backoff.delay(self.write_failures);
        let retry = now + delay;
        self.due = Some(self.due.map_or(retry, |d| d.min(retry)));
        Some(delay)
    }

    pub fn status_written(&mut self) {
        self.write_failures = 0;
    }

    /// Abandons any in-flight evaluation and returns its token.
    pub fn abort(&mut self) -> Option<u64> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Evaluating { token } => {
                self.dirty = false;
                Some(token)
            }
            Phase::Idle => None,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.phase == Phase::Idle && self.due.is_some_and(|due| due <= now)
    }

    /// Marks an evaluation as started and returns its token.
    pub fn start(&mut self, now: Instant) -> u64 {
        self.next_token += 1;
        let token = self.next_token;
        self.phase = Phase::Evaluating { token };
        self.dirty = false;
        self.due = None;
        self.last_started = Some(now);
        token
    }

    /// Records the result of the evaluation identified by `token`.
    pub fn finish(&mut self, token: u64, completion: Completion, now: Instant) -> Settled {
        if self.phase != (Phase::Evaluating { token }) {
            return Settled::Stale;
        }
        self.phase = Phase::Idle;

        let settled = match completion {
            Completion::Evaluated(state) => {
                self.failures = 0;
                self.state = Some(state);
                self.due = self.interval_due(now);
                Settled::Publish
            }
            Completion::Failed => {
                self.failures += 1;
                if self.failures >= self.backoff.attempts {
                    self.failures = 0;
                    self.due = self.interval_due(now);
                    Settled::Exhausted
                } else {
                    let delay = self.backoff.delay(self.failures);
                    self.due = Some(now + delay);
                    Settled::Retry(delay)
                }
            }
        };

        // Changes seen during the pass are ignored once it settles into a
        // state that is never re-evaluated.
        if std::mem::take(&mut self.dirty) && self.current_interval() != Interval::Never {
            self.due = Some(now);
        }
        settled
    }

    fn current_interval(&self) -> Interval {
        match self.state {
            Some(ComplianceState::Compliant) => self.compliant_interval,
            Some(ComplianceState::NonCompliant) | None => self.noncompliant_interval,
            Some(ComplianceState::Terminating) => match self.noncompliant_interval {
                Interval::Every(d) => Interval::Every(d),
                _ => Interval::Every(TERMINATING_RECHECK),
            },
        }
    }

    fn interval_due(&self, now: Instant) -> Option<Instant> {
        match self.current_interval() {
            Interval::Every(every) => Some(now + every),
            Interval::Watch | Interval::Never => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    fn schedule() -> PolicySchedule {
        PolicySchedule::new(Backoff::default(), Duration::ZERO)
    }

    #[test]
    fn new_generation_is_due_immediately() {
        let now = Instant::now();
        let mut s = schedule();
        assert!(!s.is_due(now));
        assert_eq!(s.update_spec(Some(1), Interval::Watch, Interval::Watch, now), None);
        assert!(s.is_due(now));

        let token = s.start(now);
        assert_eq!(s.phase(), Phase::Evaluating { token });
        assert!(!s.is_due(now));
    }

    #[test]
    fn spec_change_aborts_in_flight_pass() {
        let now = Instant::now();
        let mut s = schedule();
        s.update_spec(Some(1), Interval::Watch, Interval::Watch, now);
        let token = s.start(now);

        // Same generation: nothing to abort.
        assert_eq!(s.update_spec(Some(1), Interval::Watch, Interval::Watch, now), None);
        assert_eq!(
            s.update_spec(Some(2), Interval::Watch, Interval::Watch, now),
            Some(token)
        );
        assert!(s.is_due(now));
        assert_eq!(
            s.finish(token, Completion::Evaluated(ComplianceState::Compliant), now),
            Settled::Stale
        );
    }

    #[test]
    fn triggers_during_a_pass_reschedule_after_it() {
        let now = Instant::now();
        let mut s = schedule();
        s.update_spec(Some(1), Interval::Watch, Interval::Watch, now);
        let token = s.start(now);
        assert!(!s.trigger(now));

        let later = now + SEC;
        assert_eq!(
            s.finish(token, Completion::Evaluated(ComplianceState::Compliant), later),
            Settled::Publish
        );
        assert!(s.is_due(later));
    }

    #[test]
    fn timers_follow_the_compliance_state() {
        let now = Instant::now();
        let mut s = schedule();
        s.update_spec(
            Some(1),
            Interval::Every(60 * SEC),
            Interval::Every(10 * SEC),
            now,
        );

        let token = s.start(now);
        s.finish(token, Completion::Evaluated(ComplianceState::NonCompliant), now);
        assert_eq!(s.due_at(), Some(now + 10 * SEC));

        let token = s.start(now);
        s.finish(token, Completion::Evaluated(ComplianceState::Compliant), now);
        assert_eq!(s.due_at(), Some(now + 60 * SEC));
        assert!(!s.is_due(now + 59 * SEC));
        assert!(s.is_due(now + 60 * SEC));
    }

    #[test]
    fn watch_intervals_rely_on_triggers() {
        let now = Instant::now();
        let mut s = schedule();
        s.update_spec(Some(1), Interval::Watch, Interval::Watch, now);
        let token = s.start(now);
        s.finish(token, Completion::Evaluated(ComplianceState::Compliant), now);
        assert_eq!(s.due_at(), None);

        assert!(s.trigger(now));
        assert!(s.is_due(now));
    }

    #[test]
    fn never_ignores_triggers_until_the_spec_changes() {
        let now = Instant::now();
        let mut s = schedule();
        s.update_spec(Some(1), Interval::Never, Interval::Never, now);
        let token = s.start(now);
        s.finish(token, Completion::Evaluated(ComplianceState::Compliant), now);

        assert!(!s.trigger(now));
        assert!(!s.is_due(now + 3600 * SEC));

        s.update_spec(Some(2), Interval::Never, Interval::Never, now);
        assert!(s.is_due(now));
    }

    #[test]
    fn never_ignores_triggers_during_a_pass() {
        let now = Instant::now();
        let mut s = schedule();
        s.update_spec(Some(1), Interval::Never, Interval::Watch, now);
        let token = s.start(now);
        assert!(!s.trigger(now));
        s.finish(token, Completion::Evaluated(ComplianceState::Compliant), now);
        assert_eq!(s.due_at(), None);

        // A noncompliant result is still re-evaluated on change.
        s.update_spec(Some(2), Interval::Never, Interval::Watch, now);
        let token = s.start(now);
        assert!(!s.trigger(now));
        s.finish(token, Completion::Evaluated(ComplianceState::NonCompliant), now);
        assert!(s.is_due(now));
    }

    #[test]
    fn failed_status_writes_reevaluate_with_backoff() {
        let now = Instant::now();
        let mut s = schedule();
        s.update_spec(Some(1), Interval::Watch, Interval::Watch, now);
        let token = s.start(now);
        s.finish(token, Completion::Evaluated(ComplianceState::Compliant), now);
        assert_eq!(s.due_at(), None);

        assert_eq!(s.status_failed(now), Some(SEC));
        assert!(!s.is_due(now));
        assert!(s.is_due(now + SEC));

        let token = s.start(now + SEC);
        s.finish(token, Completion::Evaluated(ComplianceState::Compliant), now + SEC);
        assert_eq!(s.status_failed(now + SEC), Some(2 * SEC));

        s.status_written();
        assert_eq!(s.status_failed(now + SEC), Some(SEC));

        // A pass in flight publishes its own status.
        s.start(now + 2 * SEC);
        assert_eq!(s.status_failed(now + 2 * SEC), None);
    }

    #[test]
    fn terminating_rechecks_periodically() {
        let now = Instant::now();
        let mut s = schedule();
        s.update_spec(Some(1), Interval::Watch, Interval::Watch, now);
        let token = s.start(now);
        s.finish(token, Completion::Evaluated(ComplianceState::Terminating), now);
        assert_eq!(s.due_at(), Some(now + TERMINATING_RECHECK));
    }

    #[test]
    fn throttles_watch_triggers() {
        let now = Instant::now();
        let mut s = PolicySchedule::new(Backoff::default(), 10 * SEC);
        s.update_spec(Some(1), Interval::Watch, Interval::Watch, now);
        let token = s.start(now);
        s.finish(token, Completion::Evaluated(ComplianceState::Compliant), now + SEC);

        assert!(s.trigger(now + 2 * SEC));
        assert_eq!(s.due_at(), Some(now + 10 * SEC));
    }

    #[test]
    fn failures_back_off_until_exhausted() {
        let now = Instant::now();
        let mut s = schedule();
        s.update_spec(Some(1), Interval::Watch, Interval::Watch, now);

        for delay in [1, 2, 4, 8] {
            let token = s.start(now);
            assert_eq!(
                s.finish(token, Completion::Failed, now),
                Settled::Retry(delay * SEC)
            );
            assert_eq!(s.due_at(), Some(now + delay * SEC));
        }

        let token = s.start(now);
        assert_eq!(s.finish(token, Completion::Failed, now), Settled::Exhausted);
        assert_eq!(s.due_at(), None);
    }

    #[test]
    fn backoff_is_capped() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(1), SEC);
        assert_eq!(backoff.delay(3), 4 * SEC);
        assert_eq!(backoff.delay(10), 300 * SEC);
        assert_eq!(backoff.delay(100), 300 * SEC);
    }
}
