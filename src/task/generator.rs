//! Generator Stream Tracking
//!
//! Streaming tasks produce many objects per attempt, incrementally. This
//! module tracks partial-emission progress so that an object lost
//! *mid-stream* can be handled without re-emitting already-consumed earlier
//! values: if the producing attempt is still live, the coordinator attaches
//! to it instead of spawning a duplicate.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

use super::types::TaskId;
use crate::object::ObjectId;

/// Progress of one streaming attempt: the ordered identities produced so
/// far and whether the attempt is still emitting.
pub struct GeneratorStream {
    task: TaskId,
    produced: Mutex<Vec<ObjectId>>,
    open: AtomicBool,
    completed: Notify,
}

impl GeneratorStream {
    fn new(task: TaskId) -> Arc<Self> {
        Arc::new(Self {
            task,
            produced: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
            completed: Notify::new(),
        })
    }

    pub fn task(&self) -> &TaskId {
        &self.task
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn produced_count(&self) -> usize {
        self.produced.lock().expect("generator lock poisoned").len()
    }

    pub fn produced(&self) -> Vec<ObjectId> {
        self.produced
            .lock()
            .expect("generator lock poisoned")
            .clone()
    }

    fn push(&self, id: ObjectId) {
        self.produced
            .lock()
            .expect("generator lock poisoned")
            .push(id);
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.completed.notify_waiters();
    }

    /// Waits until the attempt stops emitting. Returns immediately if it
    /// is already closed.
    pub async fn await_completion(&self) {
        let mut notified = std::pin::pin!(self.completed.notified());
        // Register before the open check: `notify_waiters` only wakes
        // already-registered waiters, so a close landing between the check
        // and the await would otherwise be lost.
        notified.as_mut().enable();
        if !self.is_open() {
            return;
        }
        notified.await;
    }
}

/// Registry of live and finished streams, indexed both by task and by the
/// identities each stream has yielded.
pub struct GeneratorRegistry {
    streams: DashMap<TaskId, Arc<GeneratorStream>>,
    by_object: DashMap<ObjectId, TaskId>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
            by_object: DashMap::new(),
        }
    }

    /// Opens (or replaces) the stream for a fresh attempt of `task`.
    /// Replay starts from the beginning, so previous progress is dropped.
    pub fn open_stream(&self, task: TaskId) -> Arc<GeneratorStream> {
        let stream = GeneratorStream::new(task.clone());
        self.streams.insert(task, stream.clone());
        stream
    }

    /// Records one yielded value of the task's live stream.
    pub fn record_yield(&self, task: &TaskId, id: ObjectId) {
        if let Some(stream) = self.streams.get(task) {
            stream.push(id.clone());
            self.by_object.insert(id, task.clone());
        } else {
            tracing::warn!("Yield for task {} with no open stream", task);
        }
    }

    /// Marks the task's stream as done emitting and wakes every waiter.
    pub fn close_stream(&self, task: &TaskId) {
        if let Some(stream) = self.streams.get(task) {
            stream.close();
        }
    }

    /// The still-open stream that yielded `id`, if any. A lost value whose
    /// producer is returned here must not trigger a duplicate attempt.
    pub fn live_stream_for(&self, id: &ObjectId) -> Option<Arc<GeneratorStream>> {
        let task = self.by_object.get(id)?;
        let stream = self.streams.get(task.value())?;
        if stream.is_open() {
            Some(stream.clone())
        } else {
            None
        }
    }

    pub fn stream(&self, task: &TaskId) -> Option<Arc<GeneratorStream>> {
        self.streams.get(task).map(|entry| entry.value().clone())
    }
}

impl Default for GeneratorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
