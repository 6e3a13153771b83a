//! Engine error types

use thiserror::Error;

use crate::client::ApiError;
use crate::storage::StorageError;

/// Errors surfaced by [`SyncEngine`](super::SyncEngine) operations
///
/// Offline-path mutations fail only when local storage cannot hold them;
/// otherwise errors come from the server refusing a direct request.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The server answered with an authoritative rejection
    #[error("Server rejected the request: {message}")]
    Rejected {
        status: Option<u16>,
        message: String,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EngineError {
    pub fn rejected(error: &ApiError) -> Self {
        Self::Rejected {
            status: error.status_code(),
            message: error.to_string(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
