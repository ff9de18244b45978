//! Dispatches policy evaluations.
//!
//! A single loop owns every policy's [`PolicySchedule`]. It consumes triggers
//! from the index, completions from evaluation tasks, and a periodic tick
//! that releases policies whose timers are due. Evaluations run on their own
//! tasks, at most one per policy.

use crate::{
    core::{
        evaluate,
        schedule::{Backoff, Completion, PolicySchedule, Settled},
        status_changed, EvalError, Evaluation, Store,
    },
    index::{ResourceId, SharedIndex, Trigger},
    k8s::{ComplianceState, ConfigurationPolicyStatus, Interval},
    metrics::EvaluationMetrics,
    status,
};
use ahash::AHashMap as HashMap;
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    task::AbortHandle,
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

/// Appended to the published message when evaluations keep failing.
const EVALUATION_ERROR: &str = " (evaluation error: ";

#[derive(Copy, Clone, Debug)]
pub struct Config {
    /// The maximum number of evaluations in flight.
    pub concurrency: usize,

    /// The minimum time between watch-triggered evaluations of a policy.
    pub throttle: Duration,

    pub backoff: Backoff,

    /// How often due timers are checked.
    pub tick: Duration,
}

pub struct Scheduler<S> {
    store: Arc<S>,
    index: SharedIndex,
    leader: status::Leadership,
    updates: mpsc::Sender<status::Update>,
    config: Config,
    metrics: EvaluationMetrics,
    policies: HashMap<ResourceId, Entry>,
}

struct Entry {
    schedule: PolicySchedule,
    task: Option<(u64, AbortHandle)>,
}

struct Done {
    id: ResourceId,
    token: u64,
    started: Instant,
    result: Result<Evaluation, EvalError>,
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 2,
            throttle: Duration::from_secs(10),
            backoff: Backoff::default(),
            tick: Duration::from_secs(1),
        }
    }
}

// === impl Scheduler ===

impl<S> Scheduler<S>
where
    S: Store + 'static,
{
    pub fn new(
        store: Arc<S>,
        index: SharedIndex,
        leader: status::Leadership,
        updates: mpsc::Sender<status::Update>,
        config: Config,
        metrics: EvaluationMetrics,
    ) -> Self {
        Self {
            store,
            index,
            leader,
            updates,
            config,
            metrics,
            policies: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut triggers: mpsc::UnboundedReceiver<Trigger>) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut tick = time::interval(self.config.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                trigger = triggers.recv() => match trigger {
                    Some(trigger) => self.trigger(trigger),
                    None => break,
                },
                Some(done) = done_rx.recv() => self.complete(done).await,
                _ = tick.tick() => {}
            }
            self.dispatch(&done_tx);
        }

        debug!("Triggers closed; stopping scheduler");
        for (_, entry) in self.policies.drain() {
            if let Some((_, task)) = entry.task {
                task.abort();
            }
        }
    }

    fn trigger(&mut self, trigger: Trigger) {
        let now = now();
        match trigger {
            Trigger::Spec(id) => {
                let Some(policy) = self.index.read().policy(&id) else {
                    return;
                };
                let intervals = &policy.spec.evaluation_interval;
                let compliant = intervals.compliant().unwrap_or_else(|error| {
                    warn!(policy = %id, %error, "Invalid compliant evaluation interval");
                    Interval::Watch
                });
                let noncompliant = intervals.noncompliant().unwrap_or_else(|error| {
                    warn!(policy = %id, %error, "Invalid noncompliant evaluation interval");
                    Interval::Watch
                });

                let Config {
                    backoff, throttle, ..
                } = self.config;
                let entry = self.policies.entry(id.clone()).or_insert_with(|| {
                    let mut schedule = PolicySchedule::new(backoff, throttle);
                    schedule.set_state(policy.status.as_ref().and_then(|s| s.compliant));
                    Entry {
                        schedule,
                        task: None,
                    }
                });
                if entry
                    .schedule
                    .update_spec(policy.metadata.generation, compliant, noncompliant, now)
                    .is_some()
                {
                    debug!(policy = %id, "Aborting superseded evaluation");
                    if let Some((_, task)) = entry.task.take() {
                        task.abort();
                        self.metrics.aborted();
                    }
                }
            }

            Trigger::Watch(id) => {
                if let Some(entry) = self.policies.get_mut(&id) {
                    if entry.schedule.trigger(now) {
                        debug!(policy = %id, "Triggered");
                    }
                }
            }

            Trigger::StatusWritten(id) => {
                if let Some(entry) = self.policies.get_mut(&id) {
                    entry.schedule.status_written();
                }
            }

            Trigger::StatusFailed(id) => {
                if let Some(entry) = self.policies.get_mut(&id) {
                    if let Some(delay) = entry.schedule.status_failed(now) {
                        warn!(policy = %id, ?delay, "Status write failed; re-evaluating");
                    }
                }
            }

            Trigger::Deleted(id) => {
                if let Some(entry) = self.policies.remove(&id) {
                    debug!(policy = %id, "Forgetting deleted policy");
                    if let Some((_, task)) = entry.task {
                        task.abort();
                        self.metrics.aborted();
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, done: &mpsc::UnboundedSender<Done>) {
        if !self.leader.is_leader() {
            return;
        }

        let now = now();
        let mut due = self
            .policies
            .iter()
            .filter(|(_, e)| e.schedule.is_due(now))
            .map(|(id, e)| (e.schedule.due_at(), id.clone()))
            .collect::<Vec<_>>();
        due.sort();

        let mut in_flight = self.policies.values().filter(|e| e.task.is_some()).count();
        for (_, id) in due {
            if in_flight >= self.config.concurrency {
                break;
            }

            let policy = self.index.read().policy(&id);
            let Some(policy) = policy else {
                self.policies.remove(&id);
                continue;
            };
            let Some(entry) = self.policies.get_mut(&id) else {
                continue;
            };

            let token = entry.schedule.start(now);
            let store = self.store.clone();
            let tx = done.clone();
            let task = tokio::spawn(async move {
                let started = Instant::now();
                let result = evaluate(&*store, &policy).await;
                let _ = tx.send(Done {
                    id,
                    token,
                    started,
                    result,
                });
            });
            entry.task = Some((token, task.abort_handle()));
            self.metrics.started();
            in_flight += 1;
        }
    }

    async fn complete(&mut self, done: Done) {
        let Done {
            id,
            token,
            started,
            result,
        } = done;

        let Some(entry) = self.policies.get_mut(&id) else {
            debug!(policy = %id, "Discarding evaluation of a deleted policy");
            return;
        };
        if entry.task.as_ref().map(|(t, _)| *t) != Some(token) {
            debug!(policy = %id, "Discarding superseded evaluation");
            return;
        }
        entry.task = None;

        let completion = match &result {
            Ok(evaluation) => Completion::Evaluated(
                evaluation
                    .status
                    .compliant
                    .unwrap_or(ComplianceState::NonCompliant),
            ),
            Err(_) => Completion::Failed,
        };
        let settled = entry.schedule.finish(token, completion, now());
        self.metrics.finished(result_label(&result), started.elapsed());

        match (settled, result) {
            (Settled::Publish, Ok(evaluation)) => self.publish(id, evaluation.status).await,
            (Settled::Retry(delay), Err(error)) => {
                warn!(policy = %id, %error, ?delay, "Evaluation failed; retrying");
            }
            (Settled::Exhausted, Err(error)) => {
                error!(policy = %id, %error, "Evaluation failed; giving up until the next trigger");
                self.annotate(id, &error).await;
            }
            (settled, _) => debug!(policy = %id, ?settled, "Discarding evaluation"),
        }
    }

    async fn publish(&self, id: ResourceId, status: ConfigurationPolicyStatus) {
        let policy = self.index.read().policy(&id);
        let Some(policy) = policy else {
            return;
        };
        // Unchanged verdicts are still written to refresh `lastEvaluated`,
        // but only changes are logged and recorded as events.
        if status_changed(policy.status.as_ref(), &status) {
            info!(policy = %id, compliant = ?status.compliant, "Publishing status");
        } else {
            debug!(policy = %id, "Refreshing unchanged status");
        }
        let update = status::Update::new(id, &policy, status);
        if self.updates.send(update).await.is_err() {
            warn!("Status controller stopped");
        }
    }

    /// Keeps the last published status, noting the failure in its message.
    async fn annotate(&self, id: ResourceId, error: &EvalError) {
        let policy = self.index.read().policy(&id);
        let Some(policy) = policy else {
            return;
        };

        let mut status = policy.status.clone().unwrap_or_default();
        status.message = Some(annotated(status.message.as_deref(), error));
        if policy.status.as_ref() == Some(&status) {
            return;
        }

        let update = status::Update {
            id,
            uid: policy.metadata.uid.clone(),
            status,
            event: None,
        };
        if self.updates.send(update).await.is_err() {
            warn!("Status controller stopped");
        }
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

fn result_label(result: &Result<Evaluation, EvalError>) -> &'static str {
    match result {
        Ok(evaluation) => match evaluation.status.compliant {
            Some(ComplianceState::Compliant) => "compliant",
            Some(ComplianceState::Terminating) => "terminating",
            Some(ComplianceState::NonCompliant) | None => "noncompliant",
        },
        Err(_) => "error",
    }
}

fn annotated(message: Option<&str>, error: &EvalError) -> String {
    let message = message.unwrap_or_default();
    let base = message
        .rfind(EVALUATION_ERROR)
        .map_or(message, |at| &message[..at]);
    if base.is_empty() {
        return error.to_string();
    }
    format!("{base}{EVALUATION_ERROR}{error})")
}

#[cfg(test)]
mod tests;
