use thiserror::Error;

/// Errors surfaced by the synchronization layer.
///
/// Variants carry rendered messages rather than source errors so the type
/// stays `Clone` and can be held inside `SyncState::Failed`. User
/// cancellation of a picker or consent popup is not an error anywhere in
/// this crate; it is a successful `None`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("network error: {0}")]
    Network(String),

    /// The session token is absent or was rejected by the remote API.
    /// The caller must re-invoke `sign_in()`; there is no silent refresh.
    #[error("authentication required")]
    AuthRequired,

    #[error("malformed snapshot: {0}")]
    Serialization(String),

    /// A sync cycle is already in flight, or `resolve` was called outside
    /// a pending conflict. Concurrent requests are rejected, not queued.
    #[error("sync already in progress")]
    SyncInProgress,

    /// The cloud session has not reached the state the operation needs.
    #[error("session not ready: {0}")]
    NotReady(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
