use serde::Serialize;

use crate::error::{ErrorKind, TransferError};

/// Outcome handed to callers outside the crate, e.g. a web layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpResult<T> {
    pub success: bool,
    pub status_code: u16,
    pub kind: Option<ErrorKind>,
    pub message: Option<String>,
    pub value: Option<T>,
}

impl<T> OpResult<T> {
    pub fn succeed(value: T) -> Self {
        Self {
            success: true,
            status_code: 200,
            kind: None,
            message: None,
            value: Some(value),
        }
    }

    pub fn fail(error: &TransferError) -> Self {
        Self {
            success: false,
            status_code: error.status_code(),
            kind: Some(error.kind()),
            message: Some(error.to_string()),
            value: None,
        }
    }
}

impl<T> From<Result<T, TransferError>> for OpResult<T> {
    fn from(result: Result<T, TransferError>) -> Self {
        match result {
            Ok(value) => Self::succeed(value),
            Err(err) => Self::fail(&err),
        }
    }
}
