use serde::Serialize;
use thiserror::Error;

use super::local::LocalError;
use super::model::UnknownVariant;
use super::paths::PathError;
use super::remote::RemoteError;
use super::store::StoreError;
use super::transfer::TransferError;

/// Coarse error classes shared by every sync module. Callers branch on the class,
/// never on the concrete error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    NotFound,
    InvalidState,
    TransientNetwork,
    RemoteConflict,
    FatalStorage,
    Permanent,
    Cancelled,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        self == ErrorClass::TransientNetwork
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("local source error: {0}")]
    Local(#[from] LocalError),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("decode error: {0}")]
    Decode(#[from] UnknownVariant),
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Validation(_) | SyncError::Path(_) | SyncError::Decode(_) => {
                ErrorClass::Validation
            }
            SyncError::NotFound(_) => ErrorClass::NotFound,
            SyncError::InvalidState(_) => ErrorClass::InvalidState,
            SyncError::Store(err) => err.class(),
            SyncError::Local(err) => err.class(),
            SyncError::Remote(err) => err.class(),
            SyncError::Transfer(err) => err.class(),
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            SyncError::Remote(err) | SyncError::Transfer(TransferError::Remote(err)) => {
                err.retry_after_secs()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_follow_the_wrapped_error() {
        assert_eq!(
            SyncError::Validation("empty".into()).class(),
            ErrorClass::Validation
        );
        assert_eq!(
            SyncError::Path(PathError::Empty).class(),
            ErrorClass::Validation
        );
        assert_eq!(
            SyncError::Transfer(TransferError::Stalled(30)).class(),
            ErrorClass::TransientNetwork
        );
        assert_eq!(
            SyncError::Transfer(TransferError::Cancelled).class(),
            ErrorClass::Cancelled
        );
        assert!(ErrorClass::TransientNetwork.is_retryable());
        assert!(!ErrorClass::RemoteConflict.is_retryable());
    }
}
