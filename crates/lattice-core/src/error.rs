//! Error types for the lattice substrate
//!
//! One crate-level [`Error`] unifies the failure kinds every subsystem
//! reports; frame codec failures keep their own [`FrameError`] type and
//! fold in via `From`.

use std::fmt;

// ----------------------------------------------------------------------------
// Frame Codec Errors
// ----------------------------------------------------------------------------

/// Failures while encoding or decoding a chain wire frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("frame has {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("unknown protocol id: {0:#04x}")]
    UnknownProtocol(u8),
    #[error("unknown frame kind: {0:#04x}")]
    UnknownKind(u8),
    #[error("frame kind mismatched: expected {expected}, got {actual}")]
    KindMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("key too large: {0} bytes")]
    KeyTooLarge(usize),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("sub-body codec failed: {0}")]
    Body(#[from] bincode::Error),
}

// ----------------------------------------------------------------------------
// Crate Error
// ----------------------------------------------------------------------------

/// Failure kinds reported across the substrate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input; the caller's fault.
    #[error("invalid parameter: {0}")]
    Parameter(String),

    /// A name, handle or key was not known.
    #[error("not found: {0}")]
    NotFound(String),

    /// A name or key is already present.
    #[error("duplicated: {0}")]
    Duplicated(String),

    /// A state precondition was violated.
    #[error("state mismatched: {0}")]
    Mismatched(String),

    /// A bounded queue or pool is exhausted.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// An internal invariant is broken; unrecoverable.
    #[error("internal error: {0}")]
    Internal(String),

    /// Operation rejected because the system is shutting down.
    #[error("powering off")]
    PowerOff,

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("os error: {0}")]
    Os(#[from] std::io::Error),
}

impl Error {
    pub fn parameter<T: fmt::Display>(what: T) -> Self {
        Error::Parameter(what.to_string())
    }

    pub fn not_found<T: fmt::Display>(what: T) -> Self {
        Error::NotFound(what.to_string())
    }

    pub fn duplicated<T: fmt::Display>(what: T) -> Self {
        Error::Duplicated(what.to_string())
    }

    pub fn mismatched<T: fmt::Display>(what: T) -> Self {
        Error::Mismatched(what.to_string())
    }

    pub fn resource<T: fmt::Display>(what: T) -> Self {
        Error::Resource(what.to_string())
    }

    /// Construct an `Internal` error. Debug builds panic at the
    /// construction site instead, so invariant breaks surface where
    /// they happen.
    pub fn internal<T: fmt::Display>(what: T) -> Self {
        let what = what.to_string();
        if cfg!(debug_assertions) {
            panic!("internal invariant broken: {what}");
        }
        Error::Internal(what)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_error_folds_into_error() {
        let frame_err = FrameError::TrailingBytes(3);
        let err: Error = frame_err.into();
        assert!(matches!(err, Error::Frame(FrameError::TrailingBytes(3))));
    }

    #[test]
    fn test_io_error_maps_to_os() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: Error = io.into();
        assert!(matches!(err, Error::Os(_)));
    }
}
