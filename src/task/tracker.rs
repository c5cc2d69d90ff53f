//! Task Attempt Tracker
//!
//! Records every (re)submission of a task specification, enforces the retry
//! budget, and classifies per-attempt outcomes. Once attempts are exhausted
//! the terminal outcome is permanently fixed: every dependent reconstruction
//! replays it instead of re-attempting.

use dashmap::{DashMap, DashSet};
use std::sync::Arc;

use super::generator::GeneratorRegistry;
use super::types::{
    ActorId, AttemptOutcome, AttemptPhase, AttemptStatus, TaskAttempt, TaskId, TaskSpecification,
    TaskStatusSnapshot,
};
use crate::config::RecoveryConfig;

/// Environment variable overriding every task's declared retry budget.
/// Sits between the per-call override and the declared `max_retries`.
pub const TASK_MAX_RETRIES_ENV: &str = "TASK_MAX_RETRIES";

/// Resolves the effective retry budget for a specification.
///
/// Resolution order: explicit per-call override > environment-level
/// override > declared `max_retries` > platform default. `-1` means
/// unlimited. Kept pure (the env value arrives as an argument) so the
/// arithmetic is testable without touching process state.
pub fn resolve_retry_budget(
    call_override: Option<i64>,
    env_override: Option<i64>,
    spec: &TaskSpecification,
    default: i64,
) -> i64 {
    call_override
        .or(env_override)
        .or(spec.max_retries)
        .unwrap_or(default)
}

fn env_retry_override() -> Option<i64> {
    std::env::var(TASK_MAX_RETRIES_ENV)
        .ok()
        .and_then(|raw| raw.parse().ok())
}

/// Result of asking for the next attempt of a specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAttempt {
    /// Go ahead; carries the 0-based attempt index.
    Attempt(u32),
    /// Budget exhausted; the terminal outcome is fixed.
    Exhausted,
    /// The bound actor is permanently dead; non-retryable regardless of
    /// remaining budget.
    ActorDead(ActorId),
}

#[derive(Debug, Default)]
struct TaskRecord {
    attempts: Vec<TaskAttempt>,
    phase: Option<AttemptPhase>,
    last_failure: Option<AttemptOutcome>,
}

/// Tracks retry counts, attempt state, and per-attempt outcomes for every
/// task specification that passes through reconstruction.
pub struct TaskAttemptTracker {
    config: RecoveryConfig,
    records: DashMap<TaskId, TaskRecord>,
    dead_actors: DashSet<ActorId>,
    generators: GeneratorRegistry,
}

impl TaskAttemptTracker {
    pub fn new(config: RecoveryConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            records: DashMap::new(),
            dead_actors: DashSet::new(),
            generators: GeneratorRegistry::new(),
        })
    }

    /// Obtains the next attempt of `spec`, or the reason none is allowed.
    ///
    /// With a budget of `N >= 0` a task executes at most `N + 1` times
    /// total across its lifetime; an infrastructure crash consumes a retry
    /// exactly like an application failure.
    pub fn next_attempt(
        &self,
        spec: &TaskSpecification,
        call_override: Option<i64>,
    ) -> NextAttempt {
        if let Some(actor) = spec.target.bound_actor()
            && self.dead_actors.contains(actor)
        {
            return NextAttempt::ActorDead(actor.clone());
        }

        let budget = resolve_retry_budget(
            call_override,
            env_retry_override(),
            spec,
            self.config.max_retries_default,
        );

        let mut record = self.records.entry(spec.id.clone()).or_default();
        let started = record.attempts.len() as i64;

        if budget >= 0 && started >= budget + 1 {
            tracing::warn!(
                "Task {} retry budget exhausted after {} attempt(s)",
                spec.id,
                started
            );
            return NextAttempt::Exhausted;
        }

        let index = record.attempts.len() as u32;
        record.attempts.push(TaskAttempt {
            index,
            status: AttemptStatus::Submitted,
            outcome: None,
        });

        NextAttempt::Attempt(index)
    }

    /// Marks the latest attempt finished successfully.
    pub fn record_success(&self, task: &TaskId, outcome: AttemptOutcome) {
        if let Some(mut record) = self.records.get_mut(task)
            && let Some(attempt) = record.attempts.last_mut()
        {
            attempt.status = AttemptStatus::Finished;
            attempt.outcome = Some(outcome);
        }
    }

    /// Marks the latest attempt failed with its classified outcome.
    pub fn record_failure(&self, task: &TaskId, outcome: AttemptOutcome) {
        if let Some(mut record) = self.records.get_mut(task) {
            if let Some(attempt) = record.attempts.last_mut() {
                attempt.status = AttemptStatus::Failed;
                attempt.outcome = Some(outcome.clone());
            }
            record.last_failure = Some(outcome);
        }
    }

    /// The classified outcome of the most recent failed attempt, if any.
    pub fn last_failure(&self, task: &TaskId) -> Option<AttemptOutcome> {
        self.records
            .get(task)
            .and_then(|record| record.last_failure.clone())
    }

    /// Total executions started for this task across its lifetime.
    pub fn executions(&self, task: &TaskId) -> usize {
        self.records
            .get(task)
            .map(|record| record.attempts.len())
            .unwrap_or(0)
    }

    // --- Actor liveness ---

    /// Signals that an actor's restart budget is exhausted. Every task
    /// bound to it becomes non-retryable from this point on.
    pub fn mark_actor_dead(&self, actor: ActorId) {
        tracing::warn!("Actor {} is permanently dead", actor);
        self.dead_actors.insert(actor);
    }

    pub fn is_actor_dead(&self, actor: &ActorId) -> bool {
        self.dead_actors.contains(actor)
    }

    // --- Progress surfaced to operational tooling ---

    pub fn record_phase(&self, task: &TaskId, phase: AttemptPhase) {
        let mut record = self.records.entry(task.clone()).or_default();
        record.phase = Some(phase);
    }

    /// Point-in-time snapshot of every tracked task's attempt status.
    pub fn snapshot(&self) -> Vec<TaskStatusSnapshot> {
        self.records
            .iter()
            .filter_map(|entry| {
                entry.value().phase.map(|phase| TaskStatusSnapshot {
                    task: entry.key().clone(),
                    attempt: entry.value().attempts.len().saturating_sub(1) as u32,
                    phase,
                })
            })
            .collect()
    }

    /// Streaming-task progress tracking.
    pub fn generators(&self) -> &GeneratorRegistry {
        &self.generators
    }
}
