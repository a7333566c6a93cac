//! Error types for the common crate
//!
//! This module defines the error taxonomy shared by every stage of the
//! compiled execution pipeline. Build-time failures (tracing, compilation)
//! are kept distinct from runtime failures (capture, replay) so callers can
//! abort a single stage or a single signature without tearing down the rest.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for Fastpath operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why a packaged artifact cannot be loaded on the current device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncompatibilityReason {
    /// Artifact was compiled for a different accelerator architecture
    Architecture { expected: String, found: String },
    /// Device compute capability is lower than the artifact requires
    Capability {
        required: (u32, u32),
        available: (u32, u32),
    },
    /// Package format version is not understood by this runtime
    FormatVersion { supported: u32, found: u32 },
}

impl fmt::Display for IncompatibilityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncompatibilityReason::Architecture { expected, found } => {
                write!(f, "compiled for architecture {}, device is {}", expected, found)
            }
            IncompatibilityReason::Capability { required, available } => write!(
                f,
                "requires compute capability {}.{}, device provides {}.{}",
                required.0, required.1, available.0, available.1
            ),
            IncompatibilityReason::FormatVersion { supported, found } => write!(
                f,
                "package format version {} is not supported (runtime supports {})",
                found, supported
            ),
        }
    }
}

/// Common error type for Fastpath operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Computation cannot be represented as a shape-determined graph
    #[error("Trace error: {0}")]
    Trace(String),

    /// Target device or toolchain cannot lower the traced graph
    #[error("Compile error: {0}")]
    Compile(String),

    /// No artifact at the requested path
    #[error("Artifact not found: {}", path.display())]
    ArtifactNotFound { path: PathBuf },

    /// Artifact exists but targets a different device or format
    #[error("Artifact {} is incompatible: {reason}", path.display())]
    ArtifactIncompatible {
        path: PathBuf,
        reason: IncompatibilityReason,
    },

    /// Artifact exists but cannot be decoded
    #[error("Artifact {} is corrupt: {reason}", path.display())]
    ArtifactCorrupt { path: PathBuf, reason: String },

    /// Recorded graph diverged from the warmup run for the same signature
    #[error("Capture inconsistency for signature {signature}: {detail}")]
    CaptureInconsistency { signature: String, detail: String },

    /// Operation that is illegal while a stream is capturing
    #[error("Capture violation: {0}")]
    CaptureViolation(String),

    /// Two logically different call shapes mapped to the same cache entry
    #[error("Signature collision: {0}")]
    SignatureCollision(String),

    /// Device or stream error
    #[error("Device error: {0}")]
    Device(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// External service error
    #[error("External service error: {0}")]
    ExternalService(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for errors raised while building an artifact
    pub fn is_build_time(&self) -> bool {
        matches!(self, Error::Trace(_) | Error::Compile(_))
    }

    /// Returns true for errors raised while capturing or replaying a graph
    pub fn is_runtime(&self) -> bool {
        matches!(
            self,
            Error::CaptureInconsistency { .. } | Error::CaptureViolation(_) | Error::Device(_)
        )
    }

    /// Returns true if the error is an artifact not found error
    pub fn is_artifact_not_found(&self) -> bool {
        matches!(self, Error::ArtifactNotFound { .. })
    }

    /// Returns true if the error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Copy of the error for reporting a recorded failure again
    ///
    /// IO and serialization sources cannot be cloned and are carried over as
    /// their message.
    pub fn duplicate(&self) -> Error {
        match self {
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Serialization(e) => Error::Internal(format!("serialization failed: {}", e)),
            Error::Config(m) => Error::Config(m.clone()),
            Error::Trace(m) => Error::Trace(m.clone()),
            Error::Compile(m) => Error::Compile(m.clone()),
            Error::ArtifactNotFound { path } => Error::ArtifactNotFound { path: path.clone() },
            Error::ArtifactIncompatible { path, reason } => Error::ArtifactIncompatible {
                path: path.clone(),
                reason: reason.clone(),
            },
            Error::ArtifactCorrupt { path, reason } => Error::ArtifactCorrupt {
                path: path.clone(),
                reason: reason.clone(),
            },
            Error::CaptureInconsistency { signature, detail } => Error::CaptureInconsistency {
                signature: signature.clone(),
                detail: detail.clone(),
            },
            Error::CaptureViolation(m) => Error::CaptureViolation(m.clone()),
            Error::SignatureCollision(m) => Error::SignatureCollision(m.clone()),
            Error::Device(m) => Error::Device(m.clone()),
            Error::InvalidArgument(m) => Error::InvalidArgument(m.clone()),
            Error::NotFound(m) => Error::NotFound(m.clone()),
            Error::ExternalService(m) => Error::ExternalService(m.clone()),
            Error::Internal(m) => Error::Internal(m.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::Trace("branch".into()).is_build_time());
        assert!(Error::Compile("lowering".into()).is_build_time());
        assert!(!Error::Compile("lowering".into()).is_runtime());

        let capture = Error::CaptureInconsistency {
            signature: "x:[2, 3]".into(),
            detail: "launch 0 differs".into(),
        };
        assert!(capture.is_runtime());
        assert!(!capture.is_build_time());

        let missing = Error::ArtifactNotFound {
            path: PathBuf::from("/tmp/none.pkg"),
        };
        assert!(missing.is_artifact_not_found());
        assert!(!missing.is_build_time());
    }

    #[test]
    fn test_incompatibility_display() {
        let err = Error::ArtifactIncompatible {
            path: PathBuf::from("a.pkg"),
            reason: IncompatibilityReason::Capability {
                required: (9, 0),
                available: (8, 6),
            },
        };
        assert_eq!(
            err.to_string(),
            "Artifact a.pkg is incompatible: requires compute capability 9.0, device provides 8.6"
        );
    }

    #[test]
    fn test_duplicate_keeps_variant() {
        let original = Error::CaptureViolation("read during capture".into());
        let copy = original.duplicate();
        assert!(matches!(copy, Error::CaptureViolation(_)));
        assert_eq!(copy.to_string(), original.to_string());

        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(matches!(io.duplicate(), Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound));
    }
}
