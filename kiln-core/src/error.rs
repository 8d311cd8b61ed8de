//! Error types shared by the kernel passes.
//!
//! Each pass family has its own variant so callers can tell a rejected
//! program (e.g. existential memory during allocation expansion) apart from
//! a failure of the reference evaluator.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompilerError {
    #[error("Simplification error: {0}")]
    SimplifyError(String),

    #[error("Allocation expansion error: {0}")]
    ExpandError(String),

    #[error("Evaluation error: {0}")]
    EvalError(String),

    #[error("Internal compiler error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, CompilerError>;

#[macro_export]
macro_rules! err_simplify {
    ($($arg:tt)*) => {
        $crate::error::CompilerError::SimplifyError(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! bail_simplify {
    ($($arg:tt)*) => {
        return Err($crate::err_simplify!($($arg)*))
    };
}

#[macro_export]
macro_rules! err_expand {
    ($($arg:tt)*) => {
        $crate::error::CompilerError::ExpandError(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! bail_expand {
    ($($arg:tt)*) => {
        return Err($crate::err_expand!($($arg)*))
    };
}

#[macro_export]
macro_rules! err_eval {
    ($($arg:tt)*) => {
        $crate::error::CompilerError::EvalError(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! bail_eval {
    ($($arg:tt)*) => {
        return Err($crate::err_eval!($($arg)*))
    };
}

#[macro_export]
macro_rules! err_internal {
    ($($arg:tt)*) => {
        $crate::error::CompilerError::InternalError(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! bail_internal {
    ($($arg:tt)*) => {
        return Err($crate::err_internal!($($arg)*))
    };
}
