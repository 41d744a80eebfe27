use thiserror::Error;

use crate::BlockId;

/// Errors raised while executing bytecode on a [`Stack`](crate::Stack).
///
/// Any of these ends the current run: the stack records the error, sets its
/// error flag and moves to [`RunPhase::Finished`](crate::RunPhase::Finished).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("output {index} of '{block}': couldn't cast {got} to type {expected}")]
    OutputTypeMismatch {
        block: String,
        index: usize,
        expected: String,
        got: String,
    },

    #[error("'{block}' takes {expected} inputs, got {got}")]
    ArityMismatch {
        block: String,
        expected: usize,
        got: usize,
    },

    #[error("method '{name}' not found on {receiver}")]
    MethodNotFound { name: String, receiver: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("stack overflow at depth {depth}")]
    StackOverflow { depth: usize },

    #[error("internal invariant violated: {0}")]
    InternalInvariantViolation(String),

    #[error("{0}")]
    HostRaised(String),

    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// Coarse classification of a [`RuntimeError`], for hosts that only care
/// about what went wrong rather than the details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TypeMismatch,
    OutputTypeMismatch,
    ArityMismatch,
    MethodNotFound,
    DivisionByZero,
    IndexOutOfRange,
    StackOverflow,
    InternalInvariantViolation,
    HostRaised,
    Compile,
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            Self::OutputTypeMismatch { .. } => ErrorKind::OutputTypeMismatch,
            Self::ArityMismatch { .. } => ErrorKind::ArityMismatch,
            Self::MethodNotFound { .. } => ErrorKind::MethodNotFound,
            Self::DivisionByZero => ErrorKind::DivisionByZero,
            Self::IndexOutOfRange { .. } => ErrorKind::IndexOutOfRange,
            Self::StackOverflow { .. } => ErrorKind::StackOverflow,
            Self::InternalInvariantViolation(_) => {
                ErrorKind::InternalInvariantViolation
            }
            Self::HostRaised(_) => ErrorKind::HostRaised,
            Self::Compile(_) => ErrorKind::Compile,
        }
    }

    pub(crate) fn type_mismatch(
        expected: impl Into<String>,
        got: impl Into<String>,
    ) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        Self::InternalInvariantViolation(message.into())
    }
}

/// Failure of a value conversion. Never leaves a partially written
/// destination behind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("couldn't cast {from} to type {to}")]
pub struct CastError {
    pub from: String,
    pub to: String,
}

impl From<CastError> for RuntimeError {
    fn from(err: CastError) -> Self {
        Self::TypeMismatch {
            expected: err.to,
            got: err.from,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("unknown block {0:?}")]
    UnknownBlock(BlockId),

    #[error("unknown program index {0}")]
    UnknownProgram(u32),

    #[error("unknown native '{0}'")]
    UnknownNative(String),

    #[error("{pool} pool of '{block}' overflowed")]
    PoolOverflow { block: String, pool: &'static str },

    #[error("lowering '{block}' failed: {message}")]
    Lowering { block: String, message: String },

    #[error("malformed bytecode: {0}")]
    Decode(#[from] bytecode::DecodeError),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("{0} values can't be persisted")]
    NotPersistable(String),

    #[error("unknown record type '{0}'")]
    UnknownType(String),

    #[error(transparent)]
    Cast(#[from] CastError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;
