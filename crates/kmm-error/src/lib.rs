#![forbid(unsafe_code)]
//! Error types for kmm.
//!
//! # Error Taxonomy
//!
//! The memory core distinguishes exactly two runtime error classes, plus two
//! ambient classes that only exist because this is a hosted library:
//!
//! | Variant | Class | Caller response |
//! |---------|-------|-----------------|
//! | `FatalViolation` | invariant violation | halt; continuing risks silent corruption |
//! | `OutOfMemory` | resource exhaustion | handle gracefully (e.g., fail the requesting operation) |
//! | `InvalidGeometry` | construction-time validation | fix the configuration |
//! | `Io` | host I/O failure | propagate; the in-kernel device model has no error path, the host one does |
//!
//! `FatalViolation` stands in for the kernel's panic: an embedding runtime
//! turns it into a full-system abort, while unit tests can still match on it
//! as an ordinary value. There is no retry logic anywhere in the core: every
//! operation either succeeds, reports exhaustion, or reports a violation
//! immediately.
//!
//! ## Design Constraints
//!
//! - `kmm-error` MUST NOT depend on `kmm-types` (no cyclic deps). Boundary
//!   conversions (e.g., `GeometryError` from `kmm-types`) happen in the crate
//!   that owns the boundary.
//! - String payloads are owned (`String`) so errors cross thread boundaries
//!   without lifetime entanglement.

use thiserror::Error;

/// Unified error type for all kmm operations.
#[derive(Debug, Error)]
pub enum KmmError {
    /// Host I/O error from a file-backed block device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid construction-time configuration (range bounds, shard or core
    /// counts).
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Unrecoverable invariant violation.
    ///
    /// Covers refcount underflow, misaligned or out-of-range page addresses,
    /// double frees, and a cache shard with every buffer referenced. The
    /// embedding runtime must treat this as a halt condition.
    #[error("fatal invariant violation: {detail}")]
    FatalViolation { detail: String },

    /// Every free list was empty at allocation time.
    #[error("out of memory")]
    OutOfMemory,
}

impl KmmError {
    /// Construct a [`KmmError::FatalViolation`].
    #[must_use]
    pub fn fatal(detail: impl Into<String>) -> Self {
        Self::FatalViolation {
            detail: detail.into(),
        }
    }

    /// Whether this error must halt the embedding runtime.
    ///
    /// The match is exhaustive so adding a variant forces a classification
    /// decision here.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::FatalViolation { .. } => true,
            Self::Io(_) | Self::InvalidGeometry(_) | Self::OutOfMemory => false,
        }
    }
}

/// Result alias using `KmmError`.
pub type Result<T> = std::result::Result<T, KmmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification_covers_all_variants() {
        let cases: Vec<(KmmError, bool)> = vec![
            (KmmError::Io(std::io::Error::other("test")), false),
            (KmmError::InvalidGeometry("shards=0".into()), false),
            (KmmError::fatal("refcount underflow"), true),
            (KmmError::OutOfMemory, false),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.is_fatal(), *expected, "wrong class for {error:?}");
        }
    }

    #[test]
    fn display_formatting() {
        let fatal = KmmError::fatal("release of free page");
        assert_eq!(
            fatal.to_string(),
            "fatal invariant violation: release of free page"
        );

        let oom = KmmError::OutOfMemory;
        assert_eq!(oom.to_string(), "out of memory");

        let geom = KmmError::InvalidGeometry("buffers_per_shard=0".into());
        assert_eq!(geom.to_string(), "invalid geometry: buffers_per_shard=0");
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: KmmError = io.into();
        assert!(matches!(err, KmmError::Io(_)));
        assert!(!err.is_fatal());
    }
}
