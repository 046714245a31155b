//! Error types for the quantization pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Pipeline error types.
///
/// Every variant is a hard stop. Nothing in the pipeline retries, because a
/// model that silently skipped a masking or quantization step would carry
/// wrong weights into evaluation.
#[derive(Debug, Error)]
pub enum Error {
    /// Conflicting or missing run configuration.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Decoded mask shape is inconsistent with its buffer or its target.
    #[error("shape mismatch for '{name}': expected {expected} elements, {available} available")]
    ShapeMismatch {
        name: String,
        expected: usize,
        available: usize,
    },

    /// Mask dictionary entries that matched no parameter of the model.
    #[error("{} mask entries matched no parameter: {}", keys.len(), keys.join(", "))]
    UnconsumedMask { keys: Vec<String> },

    /// Checkpoint or artifact missing or unreadable.
    #[error("cannot access {}: {source}", path.display())]
    ExternalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Artifact content is malformed.
    #[error("corrupted data: {0}")]
    Corrupted(String),

    /// No feasible placement for the model.
    #[error("placement failed: {0}")]
    Placement(String),

    /// Unsupported dtype, task or operation.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a precondition error.
    pub fn precondition(message: impl Into<String>) -> Self {
        Error::Precondition(message.into())
    }

    /// Create a shape mismatch error.
    pub fn shape_mismatch(name: impl Into<String>, expected: usize, available: usize) -> Self {
        Error::ShapeMismatch {
            name: name.into(),
            expected,
            available,
        }
    }

    /// Create an external I/O error bound to a path.
    pub fn external(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::ExternalIo {
            path: path.into(),
            source,
        }
    }

    /// Create a corrupted data error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Error::Corrupted(message.into())
    }

    /// Create a placement error.
    pub fn placement(message: impl Into<String>) -> Self {
        Error::Placement(message.into())
    }

    /// Create an unsupported-operation error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Error::Unsupported(message.into())
    }

    /// Create an I/O error with a custom message.
    pub fn io(message: impl Into<String>) -> Self {
        Error::Io(std::io::Error::other(message.into()))
    }

    /// Get error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Precondition(_) => "precondition",
            Error::ShapeMismatch { .. } => "shape_mismatch",
            Error::UnconsumedMask { .. } => "unconsumed_mask",
            Error::ExternalIo { .. } => "external_io",
            Error::Corrupted(_) => "corrupted_data",
            Error::Placement(_) => "placement",
            Error::Unsupported(_) => "unsupported",
            Error::Io(_) => "io_error",
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Corrupted(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Corrupted(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconsumed_mask_message_lists_keys() {
        let err = Error::UnconsumedMask {
            keys: vec!["a.weight".into(), "b.weight".into()],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 mask entries"));
        assert!(msg.contains("a.weight, b.weight"));
        assert_eq!(err.category(), "unconsumed_mask");
    }

    #[test]
    fn test_external_io_keeps_path() {
        let err = Error::external(
            "/missing/masks.bin",
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        );
        assert!(err.to_string().contains("/missing/masks.bin"));
        assert_eq!(err.category(), "external_io");
    }
}
