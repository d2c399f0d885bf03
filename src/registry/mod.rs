//! Handler registry: maps the class names travelling through queue
//! payloads to concrete handler constructors.
//!
//! Class names are the only job identity the wire knows about, which keeps
//! queue envelopes language-agnostic. Applications register a factory per
//! class at startup; workers instantiate a fresh handler per delivery.

use crate::errors::JobExecutionError;
use crate::models::JsonMap;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Outcome a handler reports back to the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job did its work; the processor records success.
    Complete,
    /// Poison input; discard the message without retrying.
    Reject,
    /// Transient condition; let the transport redeliver.
    Requeue,
}

/// A background job implementation.
///
/// `execute` receives the merged argument map from the queue envelope. The
/// capability hooks are opt-in: a handler that accumulates chain context
/// overrides `set_context`/`context`, one that reports a structured result
/// overrides `result`. The defaults keep plain jobs free of boilerplate.
#[async_trait]
pub trait JobHandler: Send {
    async fn execute(&mut self, args: &JsonMap) -> Result<JobOutcome, JobExecutionError>;

    /// Called with the batch's current context before `execute` on chain
    /// steps. Default: ignore it.
    fn set_context(&mut self, _context: &JsonMap) {}

    /// Context to persist back onto the batch after a successful chain
    /// step. `None` means the handler does not participate in context
    /// accumulation.
    fn context(&self) -> Option<JsonMap> {
        None
    }

    /// Structured result to persist onto the job row. `None` means the
    /// handler does not report results.
    fn result(&self) -> Option<Value> {
        None
    }
}

type HandlerFactory = Box<dyn Fn() -> Box<dyn JobHandler> + Send + Sync>;

/// Registry of job classes available to this process.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler constructor under a class name. Re-registering a
    /// name replaces the previous factory.
    pub fn register<F>(&mut self, class: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn JobHandler> + Send + Sync + 'static,
    {
        self.factories.insert(class.into(), Box::new(factory));
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    /// Construct a fresh handler for a class, if registered.
    pub fn instantiate(&self, class: &str) -> Option<Box<dyn JobHandler>> {
        self.factories.get(class).map(|factory| factory())
    }

    pub fn class_names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("classes", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
