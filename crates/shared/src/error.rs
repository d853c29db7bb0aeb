use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InputMissing,
    InputMalformed,
    VerificationFailed,
    VerificationCancelled,
    RegistrationFailed,
    AssetFetchFailed,
    TransportError,
    Internal,
}

/// User-facing failure snapshot carried by presentation states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowError {
    pub code: ErrorCode,
    pub message: String,
}

impl FlowError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("no launch parameters supplied")]
    Missing,
    #[error("launch parameters malformed: {0}")]
    Malformed(String),
}

impl InputError {
    pub fn code(&self) -> ErrorCode {
        match self {
            InputError::Missing => ErrorCode::InputMissing,
            InputError::Malformed(_) => ErrorCode::InputMalformed,
        }
    }
}

impl From<InputError> for FlowError {
    fn from(value: InputError) -> Self {
        Self {
            code: value.code(),
            message: value.to_string(),
        }
    }
}
