//! Errors that cross the engine boundary.
//!
//! Steady-state coordinator failures never surface here; they are logged
//! and reported through the notifier. These variants are what an explicit
//! user action or initial setup can fail with.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Queue change notifications are not available from the player")]
    EventsUnavailable,

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Snapshot {0} has no items")]
    EmptySnapshot(String),

    #[error("The live queue is empty")]
    EmptyQueue,

    #[error("Could not read the live queue: {0}")]
    QueueRead(String),

    #[error("Player rejected the request: {0}")]
    Player(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),
}

impl EngineError {
    pub(crate) fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(format!("{err:#}"))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
