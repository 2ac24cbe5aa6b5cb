//! ---
//! hatch_section: "05-networking"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Artifact downloads into the staging directory."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Fetches release artifacts to a staging path, streaming progress samples
//! on the `net` relay channel.

pub mod download;

/// Result alias for download operations.
pub type Result<T> = std::result::Result<T, DownloadError>;

/// Failures of a single download attempt.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// The descriptor does not say where to download from.
    #[error("release descriptor has no download url")]
    MissingUrl,
    /// Connection, timeout or mid-stream transport failure.
    #[error("network error: {0}")]
    Network(String),
    /// The server answered with a non-success status.
    #[error("{url} answered HTTP {status}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Requested location.
        url: String,
    },
    /// Fewer or more bytes than announced were received.
    #[error("size mismatch: expected {expected} bytes, received {actual}")]
    SizeMismatch {
        /// Announced size.
        expected: u64,
        /// Bytes actually written.
        actual: u64,
    },
    /// The shutdown signal fired before the transfer finished.
    #[error("download cancelled")]
    Cancelled,
    /// Staging filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DownloadError::Network(_) | DownloadError::SizeMismatch { .. } => true,
            DownloadError::Status { status, .. } => *status >= 500 || *status == 429,
            DownloadError::MissingUrl | DownloadError::Cancelled | DownloadError::Io(_) => false,
        }
    }
}

pub use download::{partial_path, ArtifactFetcher, HttpDownloader};
