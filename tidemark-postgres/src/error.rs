use std::time::Duration;

/// Error type for `PostgreSQL` event log operations.
///
/// These never cross the [`EventLog`](tidemark_core::store::EventLog)
/// boundary directly; they surface wrapped in
/// [`StoreError::Transport`](tidemark_core::store::StoreError::Transport)
/// once the retry budget is spent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Query execution or transaction failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// The per-call deadline elapsed.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Whether retrying the operation could plausibly succeed.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Database(error) => matches!(
                error,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
            ),
        }
    }
}
