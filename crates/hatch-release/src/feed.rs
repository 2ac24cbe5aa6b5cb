//! ---
//! hatch_section: "04-release-governance"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Release descriptors and release source clients."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use hatch_common::PlatformTarget;
use serde::{Deserialize, Serialize};

use crate::asset::{ReleaseAsset, ReleaseListing};
use crate::{ReleaseError, Result};

/// Release summary document served by JSON feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseSummary {
    /// Version of the release; assets without their own version inherit it.
    pub version: String,
    #[serde(default)]
    pub changelog: String,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub release_url: Option<String>,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

impl ReleaseSummary {
    /// Parse a feed document.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|err| ReleaseError::InvalidDescriptor(format!("malformed release feed: {err}")))
    }

    /// Pick the asset built for `target` and validate it.
    pub fn select(&self, target: &PlatformTarget) -> Result<ReleaseListing> {
        let asset = self
            .assets
            .iter()
            .find(|asset| target.matches(&asset.platform, &asset.arch, &asset.variant))
            .ok_or_else(|| {
                ReleaseError::NotFound(format!(
                    "release {} has no asset for {target}",
                    self.version
                ))
            })?;

        let mut asset = asset.clone();
        if asset.version.trim().is_empty() {
            asset.version = self.version.clone();
        }
        asset.validate()?;

        Ok(ReleaseListing {
            asset,
            changelog: self.changelog.clone(),
            released_at: self.published_at,
            release_url: self.release_url.clone(),
        })
    }
}
