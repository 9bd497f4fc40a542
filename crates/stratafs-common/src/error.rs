//! Error types for stratafs
//!
//! This module defines the common error type used across all stratafs
//! components.

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for stratafs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for stratafs
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("attribute not set: {0}")]
    AttrUnset(String),

    #[error("failed to lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("failed on {failed} of {total} attributes, last error: {last}")]
    PartialBatch {
        failed: usize,
        total: usize,
        last: String,
    },

    #[error("parse error: {0}")]
    Parse(String),
}

impl Error {
    /// Create a codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Check if this error means the backing file does not exist
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Check if this error means an extended attribute was absent
    #[must_use]
    pub fn is_attr_unset(&self) -> bool {
        matches!(self, Self::AttrUnset(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_not_found() {
        let err = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(err.is_not_found());
        assert!(!Error::AttrUnset("user.x".into()).is_not_found());
    }

    #[test]
    fn test_is_attr_unset() {
        assert!(Error::AttrUnset("user.x".into()).is_attr_unset());
        assert!(!Error::Codec("bad map header".into()).is_attr_unset());
    }

    #[test]
    fn test_partial_batch_message() {
        let err = Error::PartialBatch {
            failed: 2,
            total: 5,
            last: "no space".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("2 of 5"));
        assert!(msg.contains("no space"));
    }
}
