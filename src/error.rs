//! Crate-level error types.

use crate::stream::StreamState;

/// Crate-level error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The device could not be opened or rejected the stream parameters.
    ///
    /// Terminal: the stream moves to [`StreamState::Error`] and will never
    /// produce sound. `close()` is still required to reclaim the stream.
    #[error("failed to open audio device: {0}")]
    OpenFailure(String),

    /// A device write failed and driver-level recovery did not help.
    ///
    /// The stream has released its resources and moved to
    /// [`StreamState::Error`]. The platform-specific code is forwarded to the
    /// producer via `on_error`.
    #[error("device write failed (code {code}): {message}")]
    DeviceWrite { code: i32, message: String },

    /// An operation was invoked from a lifecycle state it is not valid in.
    ///
    /// The operation is a no-op; neither the stream state nor device
    /// resources are affected.
    #[error("{op}() called in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: StreamState,
    },

    /// The requested stream parameters are not supported.
    #[error("unsupported stream parameters: {0}")]
    UnsupportedParams(String),
}

impl Error {
    /// Create an open-failure error.
    pub fn open_failure(msg: impl Into<String>) -> Self {
        Self::OpenFailure(msg.into())
    }

    /// Returns true for illegal-state errors.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }
}

/// Crate-level result type.
pub type Result<T> = std::result::Result<T, Error>;
