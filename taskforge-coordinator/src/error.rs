use miette::Diagnostic;
use thiserror::Error;

/// Errors raised by [`crate::TaskCoordinator`].
#[derive(Error, Debug, Diagnostic)]
pub enum CoordinatorError {
    #[error("operation was canceled: {reason}")]
    Canceled { reason: String },

    #[error("invalid coordinator state: {0}")]
    InvalidState(&'static str),

    /// `TaskEnvironment::activate`/`shutdown` are specified as infallible, but a panic inside
    /// one is still caught at the dispatch boundary rather than silently swallowed or allowed
    /// to take down the whole process.
    #[error("environment activation panicked: {message}")]
    EnvironmentActivationFailed { message: String },
}
