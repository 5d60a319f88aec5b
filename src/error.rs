//! Error taxonomy shared by the builder, the resolver and the admin surface.
use crate::model::PageType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    /// Unknown page type or action, bad batch size, malformed path.
    #[error("validation error: {0}")]
    Validation(String),
    /// Another invocation holds the `running` claim for this page type.
    #[error("a batch is already running for page type `{page_type}`")]
    ConcurrencyConflict { page_type: PageType },
    /// Single-item render failure; recovered locally by the generator.
    #[error("render failed for `{key}`: {message}")]
    Render { key: String, message: String },
    /// Single-item write failure; recovered locally by the generator.
    #[error("storage write failed for `{path}`: {message}")]
    Storage { path: String, message: String },
    /// The source, the database or the blob root is unreachable.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("batch for page type `{page_type}` was cancelled")]
    Cancelled { page_type: PageType },
    #[error("not found: {0}")]
    NotFound(String),
}

impl CacheError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::BackendUnavailable(err.to_string())
    }

    /// Item-level failures are recorded in `last_error` and never abort a batch.
    pub fn is_item_level(&self) -> bool {
        matches!(self, CacheError::Render { .. } | CacheError::Storage { .. })
    }
}

/// SQLite result codes for a write lock that could not be had within the busy
/// timeout: BUSY, LOCKED, BUSY_RECOVERY and BUSY_SNAPSHOT.
const LOCK_CONTENTION_CODES: [&str; 4] = ["5", "6", "261", "517"];

/// True when a repository error means the database itself is unreachable or
/// wedged on its write lock, as opposed to one statement failing.
pub fn is_connectivity_error(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<sqlx::Error>() {
        Some(
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_),
        ) => true,
        Some(sqlx::Error::Database(db)) => db
            .code()
            .is_some_and(|code| LOCK_CONTENTION_CODES.contains(&&*code)),
        Some(_) => false,
        None => false,
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
