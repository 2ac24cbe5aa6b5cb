//! ---
//! hatch_section: "04-release-governance"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Release descriptors and release source clients."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Release descriptors, semantic version ordering and the clients that look
//! up the latest release for the running platform.

pub mod asset;
pub mod feed;
pub mod github;
pub mod naming;
pub mod source;

/// Result alias used throughout the release crate.
pub type Result<T> = std::result::Result<T, ReleaseError>;

/// Failures of descriptor validation and release lookups.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    /// No release matches the requested platform, or the source has none.
    #[error("no matching release: {0}")]
    NotFound(String),
    /// Transport level failure, including timeouts and 5xx responses.
    #[error("network error: {0}")]
    Network(String),
    /// The descriptor or feed violates its invariants.
    #[error("invalid release descriptor: {0}")]
    InvalidDescriptor(String),
    /// Wrapper for IO errors while reading a local feed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub use asset::{
    compare_versions, parse_version, ChecksumAlgorithm, ReleaseAsset, ReleaseListing,
    ResolvedChecksum,
};
pub use feed::ReleaseSummary;
pub use github::GitHubSource;
pub use hatch_common::PlatformTarget;
pub use naming::{asset_name_guess, file_name_from_url, AssetGuess};
pub use source::{source_from_config, JsonFeedSource, LocalFeedSource, ReleaseSource};
