//! VR-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, VrError>;

/// Top-level error type for vreserve.
#[derive(Debug, Error)]
pub enum VrError {
    #[error("[VR-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[VR-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[VR-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[VR-1101] unsupported platform: {details}")]
    UnsupportedPlatform { details: String },

    #[error("[VR-2001] invalid argument: {details}")]
    InvalidArgument { details: String },

    #[error(
        "[VR-2002] insufficient space on {mount_point}: requested {requested} bytes, {available} available"
    )]
    InsufficientSpace {
        mount_point: String,
        requested: u64,
        available: u64,
    },

    #[error("[VR-2101] cannot resolve mount point: {details}")]
    Resolution { details: String },

    #[error("[VR-2102] filesystem stats failure for {path}: {details}")]
    FsStats { path: PathBuf, details: String },

    #[error("[VR-2201] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[VR-3001] transport failure: {details}")]
    Transport { details: String },

    #[error("[VR-3003] service rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("[VR-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[VR-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl VrError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "VR-1001",
            Self::MissingConfig { .. } => "VR-1002",
            Self::ConfigParse { .. } => "VR-1003",
            Self::UnsupportedPlatform { .. } => "VR-1101",
            Self::InvalidArgument { .. } => "VR-2001",
            Self::InsufficientSpace { .. } => "VR-2002",
            Self::Resolution { .. } => "VR-2101",
            Self::FsStats { .. } => "VR-2102",
            Self::Serialization { .. } => "VR-2201",
            Self::Transport { .. } => "VR-3001",
            Self::Rejected { .. } => "VR-3003",
            Self::Io { .. } => "VR-3002",
            Self::Runtime { .. } => "VR-3900",
        }
    }

    /// Whether retrying later might resolve the failure.
    ///
    /// Nothing in this crate retries on its own; this is advice for callers.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        if let Self::Rejected { status, .. } = self {
            return *status == 409 || *status >= 500;
        }
        matches!(
            self,
            Self::InsufficientSpace { .. }
                | Self::Resolution { .. }
                | Self::FsStats { .. }
                | Self::Transport { .. }
                | Self::Io { .. }
                | Self::Runtime { .. }
        )
    }

    /// HTTP status the transport should answer with for this failure.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::InvalidArgument { .. } => 400,
            Self::InsufficientSpace { .. } => 409,
            Self::Rejected { status, .. } => *status,
            _ => 500,
        }
    }

    /// Convenience constructor for argument validation failures.
    #[must_use]
    pub fn invalid_argument(details: impl Into<String>) -> Self {
        Self::InvalidArgument {
            details: details.into(),
        }
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for VrError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for VrError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

impl From<ureq::Error> for VrError {
    fn from(value: ureq::Error) -> Self {
        Self::Transport {
            details: value.to_string(),
        }
    }
}
