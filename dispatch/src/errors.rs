use crate::provider::ProviderError;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for dispatch operations
pub type Result<T, E = DispatchError> = std::result::Result<T, E>;

/// Errors that can occur while dispatching work for analysis.
///
/// Every variant is recoverable: the orchestrator converts all of them into
/// a missing-advice result. The enum is `Clone` so that de-duplicated
/// callers awaiting the same in-flight request can each receive the
/// settled error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("queue is full")]
    QueueFull,

    #[error("queued task timed out before execution")]
    QueueTimeout,

    #[error("queue is shutting down")]
    ShuttingDown,

    #[error("circuit open, retry in {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("rate limited, next token in {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("all {attempts} attempts failed: {last}")]
    RetryExhausted { attempts: u32, last: ProviderError },

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("internal error: {0}")]
    Internal(String),
}
