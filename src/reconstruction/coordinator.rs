//! Reconstruction Coordinator Implementation
//!
//! One in-flight recovery per object identity: concurrent requests attach
//! to the existing state machine through a `watch` channel instead of
//! spawning a duplicate. Dependency recovery runs depth-first inside the
//! requesting recovery's own task; sibling recoveries of the same
//! dependency join through the same dedup map.
//!
//! The coordinator is also the crate's facade. Embedders record
//! submissions, published copies, and reference changes here, and block on
//! `ensure_available` when they need an object's bytes to be reachable.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use super::types::RecoveryState;
use crate::config::RecoveryConfig;
use crate::error::RecoveryError;
use crate::lineage::{LineageEntry, LineageLookup, LineageStore, PutOutcome};
use crate::membership::{MembershipView, NodeId};
use crate::object::{ObjectId, ObjectTable, Resolution};
use crate::placement::PlacementService;
use crate::store::ObjectStore;
use crate::task::{
    AttemptOutcome, AttemptPhase, NextAttempt, ReturnCount, TaskAttemptTracker, TaskId,
    TaskSpecification, TaskStatusSnapshot,
};

/// Longest single pause between attempt resubmissions, jitter excluded.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Owns the recovery state machines and wires the object table, lineage
/// store, attempt tracker, and placement seam together.
pub struct ReconstructionCoordinator {
    config: RecoveryConfig,
    objects: Arc<ObjectTable>,
    lineage: Arc<LineageStore>,
    tracker: Arc<TaskAttemptTracker>,
    placement: Arc<dyn PlacementService>,
    store: Arc<dyn ObjectStore>,
    membership: Arc<MembershipView>,
    /// At most one live recovery per identity; waiters hold the receiver.
    inflight: DashMap<ObjectId, watch::Receiver<RecoveryState>>,
    /// Terminal failures, replayed to every later request for the object.
    failures: DashMap<ObjectId, RecoveryError>,
}

impl ReconstructionCoordinator {
    pub fn new(
        config: RecoveryConfig,
        placement: Arc<dyn PlacementService>,
        store: Arc<dyn ObjectStore>,
        membership: Arc<MembershipView>,
    ) -> Arc<Self> {
        let objects = ObjectTable::new();
        let lineage = LineageStore::new(&config);
        let tracker = TaskAttemptTracker::new(config.clone());

        Arc::new(Self {
            config,
            objects,
            lineage,
            tracker,
            placement,
            store,
            membership,
            inflight: DashMap::new(),
            failures: DashMap::new(),
        })
    }

    /// Spawns the node-death listener. Every death sweeps the object table
    /// and schedules reconstruction for referenced objects that lost their
    /// last copy.
    pub fn start(self: &Arc<Self>) {
        let mut deaths = self.membership.subscribe_deaths();
        let coordinator = self.clone();

        tokio::spawn(async move {
            loop {
                match deaths.recv().await {
                    Ok(node) => coordinator.handle_node_death(&node),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Death listener lagged; {} event(s) missed", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        tracing::info!("Reconstruction coordinator started");
    }

    /// Sweeps the copies a dead node held and schedules reconstruction for
    /// every referenced object that became unreachable.
    pub fn handle_node_death(self: &Arc<Self>, node: &NodeId) {
        for id in self.objects.handle_node_death(node) {
            self.spawn_recovery(id);
        }
    }

    // --- Submission-time bookkeeping ---

    /// Declares a task's return identities and retains its lineage.
    ///
    /// For streaming tasks this opens the progress stream instead; lineage
    /// is retained incrementally, per yielded value.
    pub fn record_submission(&self, spec: &TaskSpecification) {
        match spec.returns {
            ReturnCount::Fixed(_) => {
                for (index, id) in spec.return_ids().into_iter().enumerate() {
                    self.objects.create(id.clone(), spec.id.clone(), index as u32);
                    let outcome = self.lineage.put(id, spec.clone());
                    self.apply_put_outcome(spec, outcome);
                }
            }
            ReturnCount::Streaming => {
                self.tracker.generators().open_stream(spec.id.clone());
            }
        }
    }

    /// Records one published copy: bytes into the store, location into the
    /// table.
    pub async fn record_available(
        &self,
        id: &ObjectId,
        owner: &TaskId,
        return_index: u32,
        node: NodeId,
        bytes: Vec<u8>,
    ) {
        let size = bytes.len() as u64;
        self.store.put(id, &node, bytes).await;
        self.objects
            .record_available(id, owner, return_index, node, size);
    }

    /// Records one value yielded by a streaming attempt: identity, copy,
    /// lineage, and stream progress in one step.
    pub async fn record_stream_yield(
        &self,
        spec: &TaskSpecification,
        index: u32,
        node: NodeId,
        bytes: Vec<u8>,
    ) -> ObjectId {
        let id = ObjectId::new(&spec.id, index);
        self.objects.create(id.clone(), spec.id.clone(), index);
        self.record_available(&id, &spec.id, index, node, bytes).await;

        let outcome = self.lineage.put(id.clone(), spec.clone());
        self.apply_put_outcome(spec, outcome);

        self.tracker.generators().record_yield(&spec.id, id.clone());
        id
    }

    /// Marks a streaming attempt done emitting.
    pub fn record_stream_close(&self, task: &TaskId) {
        self.tracker.generators().close_stream(task);
    }

    /// Moves the copy held by `node` to that node's secondary storage.
    pub async fn spill(&self, id: &ObjectId, node: &NodeId) -> anyhow::Result<()> {
        self.store.spill(id, node).await?;
        self.objects.record_spilled(id, node.clone())
    }

    // --- Reference accounting ---

    pub fn add_reference(&self, id: &ObjectId) {
        self.objects.add_reference(id);
        self.lineage.set_referenced(id, true);
    }

    /// Drops one caller reference. An object whose total count reaches zero
    /// is collected: bytes evicted, lineage released, record removed.
    pub async fn drop_reference(&self, id: &ObjectId) {
        let remaining = self.objects.drop_reference(id);

        if let Some(record) = self.objects.record(id)
            && record.direct_refs == 0
        {
            self.lineage.set_referenced(id, false);
        }

        if remaining == 0 {
            self.collect(id).await;
        }
    }

    /// Explicit, irrevocable release. Terminal even if lineage still exists.
    pub async fn free(&self, id: &ObjectId) {
        self.objects.free(id);
        self.store.evict(id).await;
    }

    /// Cascading release of an unreferenced object: removing its lineage
    /// drops the indirect references its arguments held, which may
    /// unreference them in turn.
    async fn collect(&self, id: &ObjectId) {
        let mut worklist = vec![id.clone()];

        while let Some(id) = worklist.pop() {
            if let Some(record) = self.objects.record(&id)
                && record.total_refs() > 0
            {
                continue;
            }

            if let Some(entry) = self.lineage.remove(&id) {
                for dep in entry.spec.object_args() {
                    if self.objects.drop_lineage_reference(dep) == 0 {
                        worklist.push(dep.clone());
                    }
                }
            }

            self.store.evict(&id).await;
            if self.objects.release_if_unreferenced(&id) {
                tracing::debug!("Collected unreferenced object {}", id);
            }
        }
    }

    /// Reconciles indirect-reference accounting with what the lineage
    /// store actually kept: references are charged only for a retained
    /// entry, and the ones a displaced or evicted entry held are dropped.
    fn apply_put_outcome(&self, spec: &TaskSpecification, outcome: PutOutcome) {
        if outcome.stored {
            for dep in spec.object_args() {
                self.objects.add_lineage_reference(dep);
            }
        }
        if let Some(replaced) = outcome.replaced {
            self.release_entry(&replaced);
        }
        for entry in outcome.evicted {
            self.release_entry(&entry);
        }
    }

    /// An invalidated recipe takes the indirect references its arguments
    /// held with it.
    fn release_entry(&self, entry: &LineageEntry) {
        for dep in entry.spec.object_args() {
            if self.objects.drop_lineage_reference(dep) == 0 {
                self.objects.release_if_unreferenced(dep);
            }
        }
    }

    // --- Resolution ---

    /// Location query passthrough.
    pub fn resolve(&self, id: &ObjectId) -> Resolution {
        self.objects.resolve(id)
    }

    /// Blocks until the object is reachable, recovering it if necessary.
    ///
    /// On timeout the error is `WaitTimeout`: the object is still in
    /// flight, not lost, and a later call may succeed.
    pub async fn ensure_available(
        self: &Arc<Self>,
        id: &ObjectId,
        timeout: Duration,
    ) -> Result<(), RecoveryError> {
        match tokio::time::timeout(timeout, self.resolve_when_ready(id)).await {
            Ok(result) => result,
            Err(_) => Err(RecoveryError::WaitTimeout(timeout)),
        }
    }

    async fn resolve_when_ready(self: &Arc<Self>, id: &ObjectId) -> Result<(), RecoveryError> {
        loop {
            match self.objects.resolve(id) {
                Resolution::Available { .. } | Resolution::Spilled { .. } => return Ok(()),
                Resolution::Freed => return Err(RecoveryError::ObjectFreed(id.clone())),
                Resolution::PermanentlyLost => return Err(self.terminal_failure(id)),
                Resolution::Unknown => return Err(RecoveryError::ObjectLost(id.clone())),
                Resolution::Lost | Resolution::Pending => {
                    let rx = self.spawn_recovery(id.clone());
                    Self::await_terminal(rx, id).await?;
                    // Re-check the table; recovery outcomes are advisory,
                    // the table is the ground truth.
                }
            }
        }
    }

    fn terminal_failure(&self, id: &ObjectId) -> RecoveryError {
        self.failures
            .get(id)
            .map(|cached| cached.clone())
            .unwrap_or_else(|| RecoveryError::ObjectLost(id.clone()))
    }

    async fn await_terminal(
        mut rx: watch::Receiver<RecoveryState>,
        id: &ObjectId,
    ) -> Result<(), RecoveryError> {
        let state = rx
            .wait_for(|state| state.is_terminal())
            .await
            .map(|state| state.clone())
            .map_err(|_| RecoveryError::ObjectLost(id.clone()))?;

        match state {
            RecoveryState::PermanentlyFailed(err) => Err(err),
            _ => Ok(()),
        }
    }

    // --- Recovery state machine ---

    /// Starts a recovery for `id` unless one is already in flight, and
    /// returns the channel its state is published on.
    pub fn spawn_recovery(self: &Arc<Self>, id: ObjectId) -> watch::Receiver<RecoveryState> {
        match self.inflight.entry(id.clone()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(RecoveryState::NotStarted);
                slot.insert(rx.clone());
                self.objects.set_reconstructing(&id);

                let coordinator = self.clone();
                tokio::spawn(async move {
                    let mut visited = HashSet::new();
                    visited.insert(id.clone());
                    let result = coordinator.drive(&id, &tx, &mut visited).await;
                    coordinator.finish(&id, &tx, result);
                });

                rx
            }
        }
    }

    /// Boxed, type-erased form of `drive` for the recursive dependency
    /// walk; the recursion has to pass through a named `dyn Future` type.
    fn drive_boxed<'a>(
        self: &'a Arc<Self>,
        id: &'a ObjectId,
        tx: &'a watch::Sender<RecoveryState>,
        visited: &'a mut HashSet<ObjectId>,
    ) -> Pin<Box<dyn Future<Output = Result<(), RecoveryError>> + Send + 'a>> {
        Box::pin(self.drive(id, tx, visited))
    }

    /// Runs one object's recovery to a terminal state. The lineage entry is
    /// pinned for the duration so budget eviction cannot pull the recipe
    /// out from under a live reconstruction.
    async fn drive(
        self: &Arc<Self>,
        id: &ObjectId,
        tx: &watch::Sender<RecoveryState>,
        visited: &mut HashSet<ObjectId>,
    ) -> Result<(), RecoveryError> {
        if !self.config.reconstruction_enabled {
            return Err(RecoveryError::ObjectLost(id.clone()));
        }

        let entry = match self.lineage.get(id) {
            LineageLookup::Present(entry) => entry,
            LineageLookup::Evicted => return Err(RecoveryError::LineageEvicted(id.clone())),
            LineageLookup::NeverStored => return Err(RecoveryError::ObjectLost(id.clone())),
        };

        self.lineage.pin(id);
        let result = self.drive_attempts(id, entry.spec, tx, visited).await;
        self.lineage.unpin(id);
        result
    }

    async fn drive_attempts(
        self: &Arc<Self>,
        id: &ObjectId,
        spec: TaskSpecification,
        tx: &watch::Sender<RecoveryState>,
        visited: &mut HashSet<ObjectId>,
    ) -> Result<(), RecoveryError> {
        // A value lost mid-stream whose producing attempt is still emitting
        // must not trigger a duplicate attempt: attach and wait instead.
        if let Some(stream) = self.tracker.generators().live_stream_for(id) {
            tracing::info!(
                "Object {} expected from live streaming attempt of task {}; attaching",
                id,
                stream.task()
            );
            self.objects.set_pending_creation(id, true);
            stream.await_completion().await;
            self.objects.set_pending_creation(id, false);

            if self.is_reachable(id) {
                return Ok(());
            }
            // The attempt ended without re-emitting the value; fall through
            // to a fresh resubmission.
        }

        let streaming = spec.returns == ReturnCount::Streaming;

        loop {
            match self.objects.resolve(id) {
                Resolution::Available { .. } | Resolution::Spilled { .. } => return Ok(()),
                Resolution::Freed => return Err(RecoveryError::ObjectFreed(id.clone())),
                _ => {}
            }

            tx.send_replace(RecoveryState::WaitingForDependencies);
            self.tracker
                .record_phase(&spec.id, AttemptPhase::WaitingForDependencies);

            for dep in spec.object_args() {
                self.ensure_dependency(dep, visited)
                    .await
                    .map_err(|err| match err {
                        // Unrecoverable lineage conditions keep their
                        // original classification through the whole chain.
                        RecoveryError::LineageEvicted(_) | RecoveryError::LineageCycle(_) => err,
                        other => RecoveryError::DependenciesUnavailable {
                            task: spec.id.clone(),
                            reason: other.to_string(),
                        },
                    })?;
            }

            let attempt = match self.tracker.next_attempt(&spec, None) {
                NextAttempt::Attempt(index) => index,
                NextAttempt::ActorDead(actor) => {
                    return Err(RecoveryError::ActorUnavailable(actor));
                }
                NextAttempt::Exhausted => return Err(self.exhausted_error(&spec)),
            };

            tx.send_replace(RecoveryState::WaitingForExecution);
            self.tracker
                .record_phase(&spec.id, AttemptPhase::WaitingForExecution);

            if attempt > 0 {
                self.retry_pause(attempt).await;
            }

            tracing::info!("Resubmitting task {} (attempt {})", spec.id, attempt);
            if streaming {
                self.tracker.generators().open_stream(spec.id.clone());
            }
            let outcome = self.placement.submit(&spec, attempt).await;
            if streaming {
                self.tracker.generators().close_stream(&spec.id);
            }

            match outcome {
                AttemptOutcome::Finished { returns } => {
                    for produced in &returns {
                        // The slot is encoded in the identity; the order of
                        // the returned copies carries no meaning.
                        self.objects.record_available(
                            &produced.id,
                            &spec.id,
                            produced.id.return_index(),
                            produced.node.clone(),
                            produced.size_bytes,
                        );
                    }
                    self.tracker
                        .record_success(&spec.id, AttemptOutcome::Finished { returns });
                    self.tracker.record_phase(&spec.id, AttemptPhase::Finished);

                    if self.is_reachable(id) {
                        return Ok(());
                    }
                    tracing::warn!(
                        "Attempt {} of task {} finished without recreating {}",
                        attempt,
                        spec.id,
                        id
                    );
                }
                AttemptOutcome::ApplicationError { reason } => {
                    tracing::warn!("Task {} attempt {} failed: {}", spec.id, attempt, reason);
                    self.tracker
                        .record_failure(&spec.id, AttemptOutcome::ApplicationError { reason });
                }
                AttemptOutcome::WorkerCrashed { node } => {
                    tracing::warn!(
                        "Worker crashed on node {} during task {} attempt {}",
                        node,
                        spec.id,
                        attempt
                    );
                    self.tracker
                        .record_failure(&spec.id, AttemptOutcome::WorkerCrashed { node });
                }
                AttemptOutcome::ActorUnavailable { actor } => {
                    self.tracker.mark_actor_dead(actor.clone());
                    self.tracker.record_failure(
                        &spec.id,
                        AttemptOutcome::ActorUnavailable {
                            actor: actor.clone(),
                        },
                    );
                    return Err(RecoveryError::ActorUnavailable(actor));
                }
            }
        }
    }

    /// Makes one dependency of a regenerating task reachable, recovering it
    /// depth-first within this recovery's own task when needed.
    async fn ensure_dependency(
        self: &Arc<Self>,
        dep: &ObjectId,
        visited: &mut HashSet<ObjectId>,
    ) -> Result<(), RecoveryError> {
        loop {
            if let Some(cached) = self.failures.get(dep) {
                return Err(cached.clone());
            }

            match self.objects.resolve(dep) {
                Resolution::Available { .. } | Resolution::Spilled { .. } => return Ok(()),
                Resolution::Freed => return Err(RecoveryError::ObjectFreed(dep.clone())),
                Resolution::PermanentlyLost => return Err(self.terminal_failure(dep)),
                Resolution::Unknown => return Err(RecoveryError::ObjectLost(dep.clone())),
                Resolution::Lost | Resolution::Pending => {
                    // An ancestor on the current walk means the lineage
                    // graph is not a DAG.
                    if visited.contains(dep) {
                        return Err(RecoveryError::LineageCycle(dep.clone()));
                    }

                    enum Joined {
                        Wait(watch::Receiver<RecoveryState>),
                        Run(watch::Sender<RecoveryState>),
                    }

                    // The entry guard must not be held across an await.
                    let joined = match self.inflight.entry(dep.clone()) {
                        Entry::Occupied(existing) => Joined::Wait(existing.get().clone()),
                        Entry::Vacant(slot) => {
                            let (tx, rx) = watch::channel(RecoveryState::NotStarted);
                            slot.insert(rx);
                            Joined::Run(tx)
                        }
                    };

                    match joined {
                        Joined::Wait(rx) => {
                            Self::await_terminal(rx, dep).await?;
                        }
                        Joined::Run(tx) => {
                            self.objects.set_reconstructing(dep);
                            visited.insert(dep.clone());
                            let result = self.drive_boxed(dep, &tx, visited).await;
                            visited.remove(dep);
                            self.finish(dep, &tx, result.clone());
                            result?;
                        }
                    }
                }
            }
        }
    }

    /// Publishes the terminal state, caches a failure for replay, and
    /// retires the in-flight entry.
    fn finish(
        &self,
        id: &ObjectId,
        tx: &watch::Sender<RecoveryState>,
        result: Result<(), RecoveryError>,
    ) {
        match result {
            Ok(()) => {
                tracing::info!("Reconstruction of {} finished", id);
                tx.send_replace(RecoveryState::Finished);
            }
            Err(err) => {
                tracing::error!("Reconstruction of {} permanently failed: {}", id, err);
                self.failures.insert(id.clone(), err.clone());
                self.objects.set_permanently_lost(id);
                tx.send_replace(RecoveryState::PermanentlyFailed(err));
            }
        }
        self.inflight.remove(id);
    }

    /// Maps an exhausted retry budget to the terminal error dependents
    /// observe: the classified outcome of the final failed attempt.
    fn exhausted_error(&self, spec: &TaskSpecification) -> RecoveryError {
        match self.tracker.last_failure(&spec.id) {
            Some(AttemptOutcome::ApplicationError { reason }) => RecoveryError::TaskError {
                task: spec.id.clone(),
                reason,
            },
            Some(AttemptOutcome::WorkerCrashed { node }) => RecoveryError::WorkerCrashed {
                task: spec.id.clone(),
                node,
            },
            Some(AttemptOutcome::ActorUnavailable { actor }) => {
                RecoveryError::ActorUnavailable(actor)
            }
            Some(AttemptOutcome::Finished { .. }) | None => RecoveryError::TaskError {
                task: spec.id.clone(),
                reason: "retry budget exhausted without recreating the object".to_string(),
            },
        }
    }

    fn is_reachable(&self, id: &ObjectId) -> bool {
        matches!(
            self.objects.resolve(id),
            Resolution::Available { .. } | Resolution::Spilled { .. }
        )
    }

    /// Exponential backoff with jitter between resubmissions of the same
    /// specification.
    async fn retry_pause(&self, attempt: u32) {
        let base_ms = self.config.task_retry_delay.as_millis() as u64;
        let exponent = attempt.saturating_sub(1).min(4);
        let delay_ms = (base_ms << exponent).min(MAX_RETRY_DELAY.as_millis() as u64);
        let jitter_ms = rand::random::<u64>() % 50;
        tokio::time::sleep(Duration::from_millis(delay_ms + jitter_ms)).await;
    }

    // --- Introspection ---

    pub fn status_snapshot(&self) -> Vec<TaskStatusSnapshot> {
        self.tracker.snapshot()
    }

    pub fn objects(&self) -> &Arc<ObjectTable> {
        &self.objects
    }

    pub fn lineage(&self) -> &Arc<LineageStore> {
        &self.lineage
    }

    pub fn tracker(&self) -> &Arc<TaskAttemptTracker> {
        &self.tracker
    }
}
