//! ---
//! hatch_section: "04-release-governance"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Release descriptors and release source clients."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::naming::file_name_from_url;
use crate::{ReleaseError, Result};

/// Digest algorithm of a descriptor checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// SHA-256, 64 hex characters.
    Sha256,
    /// SHA-512, 128 hex characters.
    Sha512,
}

impl ChecksumAlgorithm {
    /// Length of the hex encoded digest.
    pub fn hex_len(self) -> usize {
        match self {
            ChecksumAlgorithm::Sha256 => 64,
            ChecksumAlgorithm::Sha512 => 128,
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Some(ChecksumAlgorithm::Sha256),
            "sha512" | "sha-512" => Some(ChecksumAlgorithm::Sha512),
            _ => None,
        }
    }

    fn from_hex_len(len: usize) -> Option<Self> {
        match len {
            64 => Some(ChecksumAlgorithm::Sha256),
            128 => Some(ChecksumAlgorithm::Sha512),
            _ => None,
        }
    }
}

/// Checksum of a descriptor with its algorithm settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedChecksum {
    /// Algorithm to hash the artifact with.
    pub algorithm: ChecksumAlgorithm,
    /// Lowercase hex digest.
    pub digest: String,
    /// True when neither the descriptor field nor a prefix named the algorithm.
    pub inferred: bool,
}

/// Descriptor of one candidate build.
///
/// Identity is (`platform`, `arch`, `variant`, `version`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    /// File name of the artifact; derived from `download_url` when empty.
    #[serde(default)]
    pub artefact_name: String,
    /// Operating system family (`linux`, `darwin`, `windows`, ...).
    pub platform: String,
    /// CPU architecture (`amd64`, `arm64`, ...).
    pub arch: String,
    /// Build flavour; empty for the default build.
    #[serde(default)]
    pub variant: String,
    /// Semantic version of the build.
    #[serde(default)]
    pub version: String,
    /// Where the artifact bytes are served.
    #[serde(default)]
    pub download_url: String,
    /// Hex digest, optionally prefixed with `sha256:` or `sha512:`.
    #[serde(default)]
    pub checksum: String,
    /// Explicit digest algorithm of `checksum`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_algorithm: Option<ChecksumAlgorithm>,
    /// Expected artifact size; zero when unknown.
    #[serde(default)]
    pub size_bytes: u64,
    /// Base64 signature over the artifact bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Signature scheme (`ed25519`, `ecdsa-p256`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_type: Option<String>,
}

impl ReleaseAsset {
    /// Start a descriptor for the given identity.
    pub fn new(
        platform: impl Into<String>,
        arch: impl Into<String>,
        variant: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            artefact_name: String::new(),
            platform: platform.into(),
            arch: arch.into(),
            variant: variant.into(),
            version: version.into(),
            download_url: String::new(),
            checksum: String::new(),
            checksum_algorithm: None,
            size_bytes: 0,
            signature: None,
            signature_type: None,
        }
    }

    /// Set the artifact file name.
    pub fn with_artefact_name(mut self, name: impl Into<String>) -> Self {
        self.artefact_name = name.into();
        self
    }

    /// Set the download location.
    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = url.into();
        self
    }

    /// Set the checksum and, optionally, its algorithm.
    pub fn with_checksum(
        mut self,
        checksum: impl Into<String>,
        algorithm: Option<ChecksumAlgorithm>,
    ) -> Self {
        self.checksum = checksum.into();
        self.checksum_algorithm = algorithm;
        self
    }

    /// Set the expected size.
    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    /// Set the signature and its scheme.
    pub fn with_signature(
        mut self,
        signature: impl Into<String>,
        signature_type: impl Into<String>,
    ) -> Self {
        self.signature = Some(signature.into());
        self.signature_type = Some(signature_type.into());
        self
    }

    /// Check the descriptor invariants.
    ///
    /// A declared `signature_type` without a signature passes here; the
    /// verifier reports it as a missing signature.
    pub fn validate(&self) -> Result<()> {
        self.semver()?;
        if self.platform.trim().is_empty() || self.arch.trim().is_empty() {
            return Err(ReleaseError::InvalidDescriptor(format!(
                "release {} lacks platform or arch",
                self.version
            )));
        }
        if !self.download_url.trim().is_empty() {
            if self.checksum.trim().is_empty() {
                return Err(ReleaseError::InvalidDescriptor(format!(
                    "release {} has a download url but no checksum",
                    self.version
                )));
            }
            self.resolved_checksum()?;
        }
        if self.has_signature() && self.signature_type().is_none() {
            return Err(ReleaseError::InvalidDescriptor(format!(
                "release {} carries a signature without a signature_type",
                self.version
            )));
        }
        Ok(())
    }

    /// Whether `other` describes the same build.
    pub fn same_identity(&self, other: &ReleaseAsset) -> bool {
        self.platform == other.platform
            && self.arch == other.arch
            && self.variant == other.variant
            && self.version == other.version
    }

    /// Parsed semantic version; a leading `v` is accepted.
    pub fn semver(&self) -> Result<Version> {
        parse_version(&self.version)
    }

    /// Whether this release is strictly newer than `current`.
    pub fn is_newer_than(&self, current: &str) -> Result<bool> {
        Ok(compare_versions(&self.version, current)? == Ordering::Greater)
    }

    /// Non-empty signature, if any.
    pub fn signature(&self) -> Option<&str> {
        self.signature
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Non-empty signature scheme, lowercased.
    pub fn signature_type(&self) -> Option<String> {
        self.signature_type
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_ascii_lowercase)
    }

    /// Whether the descriptor carries a signature.
    pub fn has_signature(&self) -> bool {
        self.signature().is_some()
    }

    /// Local file name for the staged artifact.
    pub fn file_name(&self) -> String {
        let explicit = self.artefact_name.trim();
        if !explicit.is_empty() {
            return sanitize_file_name(explicit);
        }
        file_name_from_url(&self.download_url)
            .map(|name| sanitize_file_name(&name))
            .unwrap_or_else(|| format!("update-{}-{}-{}", self.version, self.platform, self.arch))
    }

    /// Settle the digest algorithm: explicit field, then prefix, then length.
    pub fn resolved_checksum(&self) -> Result<ResolvedChecksum> {
        let raw = self.checksum.trim();
        let (prefixed, digest) = match raw.split_once(':') {
            Some((prefix, digest)) => {
                let algorithm = ChecksumAlgorithm::from_prefix(prefix).ok_or_else(|| {
                    ReleaseError::InvalidDescriptor(format!("unknown checksum prefix `{prefix}`"))
                })?;
                (Some(algorithm), digest.trim())
            }
            None => (None, raw),
        };
        let digest = digest.to_ascii_lowercase();
        if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ReleaseError::InvalidDescriptor(format!(
                "checksum of release {} is not a hex digest",
                self.version
            )));
        }

        if let (Some(explicit), Some(prefix)) = (self.checksum_algorithm, prefixed) {
            if explicit != prefix {
                return Err(ReleaseError::InvalidDescriptor(format!(
                    "checksum_algorithm {explicit} contradicts checksum prefix {prefix}"
                )));
            }
        }

        let (algorithm, inferred) = match self.checksum_algorithm.or(prefixed) {
            Some(algorithm) => (algorithm, false),
            None => {
                let algorithm = ChecksumAlgorithm::from_hex_len(digest.len()).ok_or_else(|| {
                    ReleaseError::InvalidDescriptor(format!(
                        "cannot infer digest algorithm from a {}-character checksum",
                        digest.len()
                    ))
                })?;
                (algorithm, true)
            }
        };
        if digest.len() != algorithm.hex_len() {
            return Err(ReleaseError::InvalidDescriptor(format!(
                "{algorithm} checksum must be {} hex characters, got {}",
                algorithm.hex_len(),
                digest.len()
            )));
        }
        Ok(ResolvedChecksum {
            algorithm,
            digest,
            inferred,
        })
    }
}

fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match base {
        "" | "." | ".." => "update.bin".to_owned(),
        other => other.to_owned(),
    }
}

/// Descriptor plus the release metadata displayed next to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseListing {
    /// Asset selected for the running target.
    pub asset: ReleaseAsset,
    /// Release notes.
    #[serde(default)]
    pub changelog: String,
    /// Publication time.
    #[serde(default)]
    pub released_at: Option<DateTime<Utc>>,
    /// Landing page of the release.
    #[serde(default)]
    pub release_url: Option<String>,
}

impl ReleaseListing {
    /// Listing without release metadata.
    pub fn bare(asset: ReleaseAsset) -> Self {
        Self {
            asset,
            changelog: String::new(),
            released_at: None,
            release_url: None,
        }
    }
}

/// Parse a version string, tolerating a leading `v`.
pub fn parse_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    Version::parse(trimmed)
        .map_err(|err| ReleaseError::InvalidDescriptor(format!("invalid semver `{raw}`: {err}")))
}

/// Semantic version ordering of two version strings.
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering> {
    Ok(parse_version(a)?.cmp(&parse_version(b)?))
}
