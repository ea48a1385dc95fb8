//! Error taxonomy for every public engine operation.

use crate::track_id::TrackId;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned synchronously by control-plane operations.
///
/// Background failures (streaming I/O, decode errors discovered off the
/// caller thread) are not returned here — they are delivered through the
/// `on_complete(id, false, reason)` callback instead, since nothing is
/// blocked on the call site waiting for them.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("track `{0}` not found")]
    NotFound(TrackId),

    #[error("track `{0}` is already playing")]
    AlreadyExists(TrackId),

    #[error("capacity exceeded: {active}/{max} tracks already playing")]
    CapacityExceeded { active: usize, max: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to decode source for track `{track}`: {reason}")]
    DecodeFailed { track: TrackId, reason: String },

    #[error("streaming I/O failed for track `{track}`: {reason}")]
    IoFailed { track: TrackId, reason: String },

    #[error("output device failure: {0}")]
    DeviceFailed(String),

    #[error("engine is not running")]
    EngineNotRunning,
}

impl EngineError {
    pub(crate) fn decode(track: &TrackId, err: impl std::fmt::Display) -> Self {
        EngineError::DecodeFailed {
            track: track.clone(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn io(track: &TrackId, err: impl std::fmt::Display) -> Self {
        EngineError::IoFailed {
            track: track.clone(),
            reason: err.to_string(),
        }
    }
}
