// Error registry for the sync server's wire surfaces.
//
// Library internals use anyhow for plumbing; anything that reaches a socket
// or the gateway API is mapped onto `SyncError` so clients see stable codes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid authentication token")]
    Unauthorized,

    #[error("caller scope does not match target scope")]
    ScopeForbidden,

    #[error("scope `{0}` not found")]
    ScopeNotFound(String),

    #[error("job `{0}` not found")]
    JobNotFound(String),

    #[error("could not complete write: target container never became available")]
    WriteTargetNotReady,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("persistence failure: {0}")]
    Persistence(#[source] anyhow::Error),

    #[error("internal error: {0}")]
    Internal(#[source] anyhow::Error),
}

impl SyncError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "AUTH_INVALID_TOKEN",
            Self::ScopeForbidden => "AUTH_FORBIDDEN",
            Self::ScopeNotFound(_) => "SCOPE_NOT_FOUND",
            Self::JobNotFound(_) => "JOB_NOT_FOUND",
            Self::WriteTargetNotReady => "WRITE_TARGET_NOT_READY",
            Self::MalformedFrame(_) => "MALFORMED_FRAME",
            Self::Persistence(_) => "PERSISTENCE_FAILED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub const fn retryable(&self) -> bool {
        matches!(self, Self::WriteTargetNotReady | Self::Persistence(_) | Self::Internal(_))
    }
}
