//! Error taxonomy shared by descriptor creation and execution.
//!
//! Creation-time failures are either `InvalidArguments` (the request is
//! malformed) or `Unimplemented` (the request is legal but outside what an
//! implementation supports, so the caller may fall back elsewhere).
//! `RuntimeFailure` is only produced by `execute` and never poisons the
//! primitive that reported it.

use thiserror::Error;

/// C-style status code surfaced at the library boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    InvalidArguments,
    Unimplemented,
    RuntimeError,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrimError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("unimplemented: {0}")]
    Unimplemented(String),
    #[error("runtime failure: {0}")]
    RuntimeFailure(String),
}

pub type PrimResult<T> = Result<T, PrimError>;

impl PrimError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArguments(msg.into())
    }

    pub fn unimplemented(msg: impl Into<String>) -> Self {
        Self::Unimplemented(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::RuntimeFailure(msg.into())
    }

    pub fn status(&self) -> Status {
        match self {
            Self::InvalidArguments(_) => Status::InvalidArguments,
            Self::Unimplemented(_) => Status::Unimplemented,
            Self::RuntimeFailure(_) => Status::RuntimeError,
        }
    }

    #[inline]
    pub fn is_unimplemented(&self) -> bool {
        matches!(self, Self::Unimplemented(_))
    }
}

impl From<bytemuck::PodCastError> for PrimError {
    fn from(err: bytemuck::PodCastError) -> Self {
        PrimError::RuntimeFailure(format!("buffer reinterpretation failed: {err:?}"))
    }
}

/// Collapse a result into the status code a C caller would see.
pub fn status_of<T>(res: &PrimResult<T>) -> Status {
    match res {
        Ok(_) => Status::Success,
        Err(e) => e.status(),
    }
}
