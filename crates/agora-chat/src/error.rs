use thiserror::Error;

/// Domain error taxonomy. Authorization and validation errors surface to the
/// caller; cache and broker failures never appear here — they are logged and
/// swallowed at the call site.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Authenticated but not authorized for this conversation/action.
    #[error("forbidden")]
    Forbidden,

    /// Referenced entity absent.
    #[error("not found")]
    NotFound,

    /// Malformed business input.
    #[error("{0}")]
    BadRequest(String),

    /// Duplicate group name and the like.
    #[error("{0}")]
    Conflict(String),

    /// Identity service (or another upstream) unreachable. Distinct from
    /// BadRequest: a 404 from identity means "user not found" and maps to
    /// BadRequest, not here.
    #[error("upstream unavailable: {0}")]
    Upstream(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
