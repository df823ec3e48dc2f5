//! Error handling for the Vega backend
//!
//! Everything that can go wrong in this half of the compiler is a defect,
//! not a user-facing diagnostic: semantic errors are caught upstream, so a
//! failing pass means an earlier invariant was violated. All variants abort
//! compilation; nothing here is retried or recovered locally.

use thiserror::Error;

/// Top-level backend error, aggregating the per-pass failures.
///
/// The pass crates define their own error enums and convert into this type
/// at the pipeline boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("malformed control flow graph: {message}")]
    MalformedGraph { message: String },

    #[error("activation frame error: {message}")]
    Frame { message: String },

    #[error("label naming error: {message}")]
    Naming { message: String },

    #[error("instruction selection failed: {message}")]
    Selection { message: String },

    #[error("register allocation failed: {message}")]
    RegisterAllocation { message: String },

    #[error("assembly emission failed: {message}")]
    Emission { message: String },

    #[error("internal compiler error: {message}")]
    Internal { message: String },
}

impl BackendError {
    pub fn internal(message: impl Into<String>) -> Self {
        BackendError::Internal {
            message: message.into(),
        }
    }
}

impl From<String> for BackendError {
    fn from(message: String) -> Self {
        BackendError::Internal { message }
    }
}
