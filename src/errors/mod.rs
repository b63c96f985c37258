use thiserror::Error;

/// Typed error hierarchy for ironloom.
///
/// Use at module boundaries (provider calls, loop entry, config validation).
/// Internal/leaf functions can continue using `anyhow::Result` — the `Internal`
/// variant allows seamless conversion via the `?` operator.
///
/// The variants map onto the orchestration error taxonomy: `Provider` with
/// `retryable=true` and `RateLimit` are transient (retried with backoff),
/// `Auth`/`Config`/`Budget` are fatal (abort the turn immediately), and
/// everything that reaches a tool boundary is converted to a
/// [`ToolOutcome::Failure`](crate::providers::base::ToolOutcome) value instead
/// of propagating as an error.
#[derive(Debug, Error)]
pub enum IronloomError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider error: {message}")]
    Provider { message: String, retryable: bool },

    #[error("Rate limit exceeded")]
    RateLimit { retry_after: Option<u64> },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Budget exhausted: {0}")]
    Budget(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IronloomError {
    /// Whether this error is transient and the operation should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { retryable, .. } => *retryable,
            Self::RateLimit { .. } | Self::Internal(_) => true,
            Self::Auth(_) | Self::Config(_) | Self::Budget(_) | Self::Cancelled(_) => false,
        }
    }

    /// Whether this error should abort the whole turn rather than degrade it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Config(_) | Self::Budget(_))
    }
}

/// Classify an `anyhow::Error` that may wrap an [`IronloomError`].
/// Unknown error types are treated as transient so flaky I/O still gets a retry.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<IronloomError>()
        .is_none_or(IronloomError::is_retryable)
}

/// Classify an `anyhow::Error` as fatal. Unknown types are not fatal.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<IronloomError>()
        .is_some_and(IronloomError::is_fatal)
}
