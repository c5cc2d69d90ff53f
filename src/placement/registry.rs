//! In-Process Execution Registry
//!
//! A dynamic registry that maps target names (e.g. "build_shard") to
//! executable async closures. This is the in-process stand-in for a real
//! scheduler: tests and embedders register handlers per target name, and
//! the coordinator submits attempts through the `PlacementService` seam
//! without knowing the difference.

use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::PlacementService;
use crate::task::{AttemptOutcome, TaskSpecification};

/// Type alias for a thread-safe, asynchronous attempt handler. It receives
/// the specification and the 0-based attempt index and returns a Future
/// resolving to the attempt's classified outcome.
pub type AttemptHandlerFn = Arc<
    dyn Fn(TaskSpecification, u32) -> Pin<Box<dyn Future<Output = AttemptOutcome> + Send>>
        + Send
        + Sync,
>;

/// Registry holding the mapping between target names and their handlers.
pub struct ExecutionRegistry {
    handlers: DashMap<String, AttemptHandlerFn>,
}

impl ExecutionRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: DashMap::new(),
        })
    }

    /// Registers a handler under a target name.
    pub fn register<F, Fut>(&self, target_name: &str, handler: F)
    where
        F: Fn(TaskSpecification, u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AttemptOutcome> + Send + 'static,
    {
        // Box::pin type-erases the concrete Future so different async
        // closures can live in the same map.
        let handler_fn: AttemptHandlerFn = Arc::new(move |spec, attempt| {
            Box::pin(handler(spec, attempt))
                as Pin<Box<dyn Future<Output = AttemptOutcome> + Send>>
        });

        self.handlers.insert(target_name.to_string(), handler_fn);

        tracing::info!("Registered attempt handler: {}", target_name);
    }

    pub fn has_handler(&self, target_name: &str) -> bool {
        self.handlers.contains_key(target_name)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait]
impl PlacementService for ExecutionRegistry {
    async fn submit(&self, spec: &TaskSpecification, attempt: u32) -> AttemptOutcome {
        let name = spec.target.name();
        match self.handlers.get(name) {
            Some(handler_fn) => {
                tracing::debug!(
                    "Submitting task {} attempt {} (target: {})",
                    spec.id,
                    attempt,
                    name
                );
                handler_fn.value()(spec.clone(), attempt).await
            }
            None => {
                let reason = format!("Unknown attempt handler: {}", name);
                tracing::error!("{}", reason);
                AttemptOutcome::ApplicationError { reason }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::NodeId;
    use crate::task::{ReturnCount, TaskId, TaskTarget};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spec(name: &str) -> TaskSpecification {
        TaskSpecification {
            id: TaskId::new(),
            target: TaskTarget::FreeFunction {
                name: name.to_string(),
            },
            args: vec![],
            returns: ReturnCount::Fixed(1),
            max_retries: Some(0),
            owner: NodeId::new(),
        }
    }

    #[tokio::test]
    async fn test_register_and_submit() {
        let registry = ExecutionRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        registry.register("produce", move |_spec, attempt| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                assert_eq!(attempt, 4);
                AttemptOutcome::Finished { returns: vec![] }
            }
        });

        assert!(registry.has_handler("produce"));
        assert_eq!(registry.handler_count(), 1);

        let outcome = registry.submit(&spec("produce"), 4).await;
        assert!(matches!(outcome, AttemptOutcome::Finished { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_target_is_application_error() {
        let registry = ExecutionRegistry::new();
        let outcome = registry.submit(&spec("missing"), 0).await;

        match outcome {
            AttemptOutcome::ApplicationError { reason } => {
                assert!(reason.contains("Unknown attempt handler"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
