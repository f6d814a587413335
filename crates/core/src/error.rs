//! Error types shared across the engine.

use thiserror::Error;

/// Failures that can surface from the streaming and questionnaire services.
///
/// `Aborted` is special: it marks an intentional cancellation and is never
/// presented to the user as a failure. Callers that own a retry affordance
/// should filter it out with [`CoreError::is_abort`].
#[derive(Debug, Error)]
pub enum CoreError {
    /// The server rejected the request before any streaming began.
    #[error("request failed with HTTP {status}: {body}")]
    RequestFailed { status: u16, body: String },

    /// The connection dropped or the transport failed mid-stream.
    #[error("stream error: {0}")]
    Stream(String),

    /// The request could not be issued at all.
    #[error("network error: {0}")]
    Network(String),

    /// The operation was cancelled on purpose.
    #[error("operation aborted")]
    Aborted,

    /// A precondition on user input failed; raised before any network call.
    #[error("validation error: {0}")]
    Validation(String),

    /// The backend replied with a body that does not match the expected shape.
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

impl CoreError {
    /// True when this error only signals an intentional cancellation.
    pub fn is_abort(&self) -> bool {
        matches!(self, CoreError::Aborted)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
