use std::fmt;
use thiserror::Error;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors surfaced to producers by queue and sink operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue has been closed
    #[error("Queue is closed")]
    Closed,

    /// Hard capacity exceeded
    #[error("Queue is full")]
    Full,

    /// The admission predicate declined the enqueue
    #[error("Enqueue rejected by admission predicate")]
    AdmissionRejected,
}

/// A failed single-event enqueue. The event is handed back to the caller.
#[derive(Debug)]
pub struct EnqueueError<E> {
    pub error: QueueError,
    pub event: E,
}

impl<E> EnqueueError<E> {
    pub(crate) fn new(error: QueueError, event: E) -> Self {
        Self { error, event }
    }

    /// Recover the rejected event
    pub fn into_event(self) -> E {
        self.event
    }
}

impl<E> fmt::Display for EnqueueError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl<E: fmt::Debug> std::error::Error for EnqueueError<E> {}

/// Errors that can occur while building or running stages
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A stage with this name already exists
    #[error("Stage {0} already exists")]
    DuplicateStage(String),

    /// No stage with this name
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    /// The stage is already registered with the scheduler
    #[error("Stage {0} already registered")]
    AlreadyRegistered(String),

    /// Event handler failure
    #[error("Event handler failed: {0}")]
    HandlerFailure(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A worker thread could not be spawned
    #[error("Thread spawn error: {0}")]
    ThreadSpawn(String),

    /// Queue error
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl RuntimeError {
    /// Convenience constructor for handler implementations
    pub fn handler(reason: impl Into<String>) -> Self {
        RuntimeError::HandlerFailure(reason.into())
    }
}

impl<E> From<EnqueueError<E>> for RuntimeError {
    fn from(err: EnqueueError<E>) -> Self {
        RuntimeError::Queue(err.error)
    }
}
