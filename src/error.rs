// Error taxonomy of the sync engine.
//
// "Not found" is deliberately absent: mutating an id that is already gone is
// a benign race with a background refresh and comes back as `None` from the
// cache instead of an error.

use thiserror::Error;

use crate::api::RemoteError;
use crate::crypto::CryptoError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("server request failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("{0}")]
    Validation(String),

    #[error("not signed in")]
    NotAuthenticated,

    #[error("session changed while the request was in flight")]
    Stale,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::Internal(err.to_string())
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
