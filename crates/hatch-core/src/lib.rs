//! ---
//! hatch_section: "01-core-functionality"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Update coordinator and persisted updater state."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Update coordinator: check, download, verify, stage and hand over to the
//! apply helper, with the updater state persisted across the restart.

pub mod apply;
pub mod coordinator;
pub mod metrics;
pub mod retry;
pub mod staging;
pub mod state;

use hatch_net::DownloadError;
use hatch_release::ReleaseError;
use hatch_verify::VerifyError;

pub use apply::{
    make_executable, resolve_update_target, Applier, ApplyRequest, HelperCommandApplier,
    MissingHelperApplier, ProcessExit, Restarter,
};
pub use coordinator::{
    CheckOutcome, CleanupReport, CoordinatorParts, HydrateReport, RecoveryOutcome,
    UpdateCoordinator, APPLY_DELAY, SHUTDOWN_NOTICE,
};
pub use metrics::UpdateMetrics;
pub use retry::RetryPolicy;
pub use staging::StagingArea;
pub use state::{PersistedState, StagedArtifact, StateError, StateStore, UpdatePhase, UpdaterState};

/// Result alias for coordinator operations.
pub type Result<T> = std::result::Result<T, UpdateError>;

/// Errors surfaced by coordinator operations.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// Transient transport failure; eligible for retry.
    #[error("network error: {0}")]
    Network(String),
    /// No release matches the running target.
    #[error("no matching release: {0}")]
    NotFound(String),
    /// The artifact bytes do not hash to the descriptor checksum.
    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        /// Published digest.
        expected: String,
        /// Digest of the staged bytes.
        actual: String,
    },
    /// The artifact signature could not be verified.
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),
    /// A signature was declared or required but absent.
    #[error("signature missing: {0}")]
    SignatureMissing(String),
    /// Another operation holds the coordinator.
    #[error("updater is busy ({0})")]
    Busy(UpdatePhase),
    /// `start_update` without a newer release from a prior check.
    #[error("no update available")]
    NoUpdateAvailable,
    /// Staging or state filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The release descriptor violates its invariants.
    #[error("invalid release descriptor: {0}")]
    InvalidDescriptor(String),
    /// The shutdown signal interrupted the operation.
    #[error("operation cancelled")]
    Cancelled,
    /// Launching the apply step failed.
    #[error("apply failed: {0}")]
    Apply(String),
    /// The persisted state could not be read or written.
    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl UpdateError {
    /// Only transport failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UpdateError::Network(_))
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            UpdateError::Network(_) => "network",
            UpdateError::NotFound(_) => "not_found",
            UpdateError::ChecksumMismatch { .. } => "checksum_mismatch",
            UpdateError::SignatureInvalid(_) => "signature_invalid",
            UpdateError::SignatureMissing(_) => "signature_missing",
            UpdateError::Busy(_) => "busy",
            UpdateError::NoUpdateAvailable => "no_update_available",
            UpdateError::Io(_) => "io",
            UpdateError::InvalidDescriptor(_) => "invalid_descriptor",
            UpdateError::Cancelled => "cancelled",
            UpdateError::Apply(_) => "apply",
            UpdateError::State(_) => "state",
        }
    }

    /// Integrity failures discard the artifact and are never retried.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            UpdateError::ChecksumMismatch { .. }
                | UpdateError::SignatureInvalid(_)
                | UpdateError::SignatureMissing(_)
        )
    }
}

impl From<ReleaseError> for UpdateError {
    fn from(err: ReleaseError) -> Self {
        match err {
            ReleaseError::NotFound(msg) => UpdateError::NotFound(msg),
            ReleaseError::Network(msg) => UpdateError::Network(msg),
            ReleaseError::InvalidDescriptor(msg) => UpdateError::InvalidDescriptor(msg),
            ReleaseError::Io(err) => UpdateError::Io(err),
        }
    }
}

impl From<DownloadError> for UpdateError {
    fn from(err: DownloadError) -> Self {
        match err {
            DownloadError::MissingUrl => UpdateError::InvalidDescriptor(err.to_string()),
            DownloadError::Cancelled => UpdateError::Cancelled,
            DownloadError::Io(err) => UpdateError::Io(err),
            DownloadError::Status { status: 404 | 410, .. } => UpdateError::NotFound(err.to_string()),
            other => UpdateError::Network(other.to_string()),
        }
    }
}

impl From<VerifyError> for UpdateError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::ChecksumMismatch { expected, actual } => {
                UpdateError::ChecksumMismatch { expected, actual }
            }
            VerifyError::SignatureInvalid(msg) => UpdateError::SignatureInvalid(msg),
            VerifyError::SignatureMissing(msg) => UpdateError::SignatureMissing(msg),
            VerifyError::InvalidDescriptor(msg) => UpdateError::InvalidDescriptor(msg),
            VerifyError::Io(err) => UpdateError::Io(err),
        }
    }
}
