//! ---
//! hatch_section: "06-integrity"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Checksum and signature verification of staged artifacts."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use hatch_relay::{Channel, EventRelay, LogData};
use hatch_release::{ChecksumAlgorithm, ReleaseAsset};
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::digest::file_digest;
use crate::signature::{verify_signature, SignatureScheme};
use crate::{Result, VerifyError};

/// Verifies staged artifacts against their descriptors.
#[derive(Debug, Clone)]
pub struct Verifier {
    keys: IndexMap<String, String>,
    require_signature: bool,
    relay: EventRelay,
}

impl Verifier {
    /// Build a verifier trusting `keys`: signature type to a base64, PEM or
    /// armored OpenPGP public key.
    pub fn new(keys: IndexMap<String, String>, require_signature: bool, relay: EventRelay) -> Self {
        let keys = keys
            .into_iter()
            .map(|(kind, key)| (kind.trim().to_ascii_lowercase(), key))
            .collect();
        Self {
            keys,
            require_signature,
            relay,
        }
    }

    /// Check `path` against `asset`, deleting the file on any failure.
    ///
    /// Order: declared-but-absent signature, checksum, then signature.
    pub async fn verify(&self, path: &Path, asset: &ReleaseAsset) -> Result<()> {
        match self.check(path, asset).await {
            Ok(()) => {
                self.relay.info(
                    Channel::Updater,
                    LogData::new(format!("verified {}", asset.file_name()))
                        .with_field("version", asset.version.clone()),
                );
                Ok(())
            }
            Err(err) => {
                discard(path).await;
                self.relay.error(
                    Channel::Updater,
                    LogData::new(format!("verification of {} failed: {err}", asset.file_name()))
                        .with_field("version", asset.version.clone()),
                );
                Err(err)
            }
        }
    }

    async fn check(&self, path: &Path, asset: &ReleaseAsset) -> Result<()> {
        if !asset.has_signature() {
            if let Some(kind) = asset.signature_type() {
                return Err(VerifyError::SignatureMissing(format!(
                    "release {} declares {kind} but carries no signature",
                    asset.version
                )));
            }
            if self.require_signature {
                return Err(VerifyError::SignatureMissing(format!(
                    "release {} is unsigned and signatures are required",
                    asset.version
                )));
            }
        }

        self.check_checksum(path, asset).await?;

        if let Some(signature) = asset.signature() {
            let kind = asset.signature_type().ok_or_else(|| {
                VerifyError::InvalidDescriptor("signature without signature_type".into())
            })?;
            let scheme: SignatureScheme = kind.parse()?;
            let key = self.keys.get(scheme.as_str()).ok_or_else(|| {
                VerifyError::SignatureInvalid(format!("no trusted {} key configured", scheme.as_str()))
            })?;
            let payload = tokio::fs::read(path).await?;
            verify_signature(scheme, key, signature, &payload)?;
            debug!(scheme = scheme.as_str(), file = %path.display(), "signature verified");
        }
        Ok(())
    }

    async fn check_checksum(&self, path: &Path, asset: &ReleaseAsset) -> Result<()> {
        let resolved = asset
            .resolved_checksum()
            .map_err(|err| VerifyError::InvalidDescriptor(err.to_string()))?;
        if resolved.inferred {
            self.relay.warn(
                Channel::Updater,
                LogData::new(format!(
                    "release {} names no checksum algorithm; assuming {} from digest length",
                    asset.version, resolved.algorithm
                )),
            );
        }

        let actual = hash_blocking(path.to_path_buf(), resolved.algorithm).await?;
        if actual != resolved.digest {
            return Err(VerifyError::ChecksumMismatch {
                expected: resolved.digest,
                actual,
            });
        }
        Ok(())
    }
}

async fn hash_blocking(path: PathBuf, algorithm: ChecksumAlgorithm) -> Result<String> {
    let outcome = tokio::task::spawn_blocking(move || file_digest(&path, algorithm))
        .await
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))??;
    Ok(outcome.hex)
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(file = %path.display(), "rejected artifact removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(file = %path.display(), error = %err, "failed removing rejected artifact"),
    }
}
