use gpuwire_types::ErrorType;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum NativeError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    OutOfMemory(String),

    #[error("{0}")]
    Internal(String),

    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(&'static str),
}

impl NativeError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            NativeError::Validation(_) | NativeError::InvalidDescriptor(_) => ErrorType::Validation,
            NativeError::OutOfMemory(_) => ErrorType::OutOfMemory,
            NativeError::Internal(_) => ErrorType::Internal,
            NativeError::DeviceLost(_) => ErrorType::DeviceLost,
        }
    }
}

pub type Result<T, E = NativeError> = std::result::Result<T, E>;

/// Returns early with a validation error if `cond` does not hold.
macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::NativeError::Validation(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure;
