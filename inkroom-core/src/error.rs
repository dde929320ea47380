//! Errors raised by room state operations.

use thiserror::Error;

/// A local mutation was rejected. The state is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Scene index {index} out of range (directory holds {len} scenes)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Invalid move: {0}")]
    InvalidMove(String),

    #[error("Participant is read-only")]
    NotWritable,

    #[error("No broadcaster in the room")]
    NoBroadcaster,

    #[error("Participant is not the current broadcaster")]
    NotCurrentBroadcaster,

    /// A remote pointer or tree referenced a path that no longer exists.
    #[error("Stale scene reference: {0}")]
    StaleSnapshot(String),
}
