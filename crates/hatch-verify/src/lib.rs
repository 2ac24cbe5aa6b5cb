//! ---
//! hatch_section: "06-integrity"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Checksum and signature verification of staged artifacts."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Integrity checks a staged artifact must pass before it may be applied.
//! Every failure removes the artifact from the staging directory.

pub mod armor;
pub mod digest;
pub mod signature;
pub mod verifier;

/// Result alias for verification.
pub type Result<T> = std::result::Result<T, VerifyError>;

/// Reasons an artifact is rejected.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// The artifact bytes do not hash to the descriptor checksum.
    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        /// Digest published in the descriptor.
        expected: String,
        /// Digest of the staged bytes.
        actual: String,
    },
    /// The signature does not verify, is malformed, or no trusted key exists for it.
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),
    /// A signature was declared or required but not supplied.
    #[error("signature missing: {0}")]
    SignatureMissing(String),
    /// The descriptor checksum cannot be interpreted.
    #[error("invalid release descriptor: {0}")]
    InvalidDescriptor(String),
    /// Reading the staged artifact failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub use digest::{file_digest, DigestOutcome};
pub use signature::{verify_signature, SignatureScheme};
pub use verifier::Verifier;
