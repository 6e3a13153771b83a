//! Errors returned by the catalog server client

use thiserror::Error;

/// How the reconciliation pass treats a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Keep the operation queued and try again on the next pass
    Retryable,
    /// The server refused the operation; drop it and report it
    Rejected,
}

/// Errors that can occur talking to the catalog server
#[derive(Debug, Error)]
pub enum ApiError {
    /// Connection, TLS or protocol failure
    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server could not be reached at all
    #[error("Server unreachable: {0}")]
    Unreachable(String),

    /// No response within the allotted time
    #[error("Request timed out")]
    Timeout,

    /// The addressed entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Any other non-success response
    #[error("Server error ({status}): {message}")]
    Status { status: u16, message: String },

    /// The response body was not what we expected
    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// HTTP status, if the server answered
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::NotFound(_) => Some(404),
            Self::Status { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Classify the error for the retry policy
    ///
    /// Validation and conflict answers are final. Authentication failures
    /// are retried because a later session may be authorized.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Status { status, .. } => match *status {
                400 | 409 | 410 | 422 => RetryClass::Rejected,
                _ => RetryClass::Retryable,
            },
            Self::NotFound(_) => RetryClass::Rejected,
            Self::Decode(_) => RetryClass::Rejected,
            Self::Transport(_) | Self::Unreachable(_) | Self::Timeout => RetryClass::Retryable,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    /// True when the request never got an answer from the server
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Transport(e) => e.status().is_none(),
            Self::Unreachable(_) | Self::Timeout => true,
            _ => false,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections() {
        for status in [400, 409, 410, 422] {
            assert_eq!(ApiError::status(status, "no").retry_class(), RetryClass::Rejected);
        }
        assert_eq!(
            ApiError::NotFound("7".into()).retry_class(),
            RetryClass::Rejected
        );
    }

    #[test]
    fn test_retryable_statuses() {
        for status in [401, 403, 408, 425, 429, 500, 502, 503, 418] {
            assert_eq!(
                ApiError::status(status, "later").retry_class(),
                RetryClass::Retryable,
                "status {}",
                status
            );
        }
        assert_eq!(ApiError::Timeout.retry_class(), RetryClass::Retryable);
        assert!(ApiError::Timeout.is_transport());
    }

    #[test]
    fn test_not_found_detection() {
        assert!(ApiError::NotFound("1".into()).is_not_found());
        assert!(ApiError::status(404, "gone").is_not_found());
        assert!(!ApiError::status(410, "gone").is_not_found());
        assert!(!ApiError::status(500, "boom").is_transport());
    }
}
