//! ---
//! hatch_section: "04-release-governance"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Release descriptors and release source clients."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use hatch_common::config::NetworkConfig;
use hatch_common::PlatformTarget;
use hatch_relay::{Channel, EventRelay};
use octocrab::models::repos::Release;
use octocrab::Octocrab;
use tracing::{debug, warn};

use crate::asset::{ChecksumAlgorithm, ReleaseAsset, ReleaseListing};
use crate::naming::{asset_name_guess, is_auxiliary_file, is_checksum_listing, is_source_archive};
use crate::source::{http_client, map_reqwest, ReleaseSource};
use crate::{ReleaseError, Result};

/// Signature scheme assumed for `<asset>.sig` companions.
pub const COMPANION_SIGNATURE_TYPE: &str = "ed25519";

/// Latest (or pinned) GitHub release of a repository.
#[derive(Clone)]
pub struct GitHubSource {
    octocrab: Octocrab,
    http: reqwest::Client,
    owner: String,
    repo: String,
    tag: Option<String>,
    allow_prerelease: bool,
    timeout: Duration,
    relay: EventRelay,
}

impl std::fmt::Debug for GitHubSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubSource")
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("tag", &self.tag)
            .field("allow_prerelease", &self.allow_prerelease)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Release asset reduced to what selection needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAsset {
    /// File name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Direct download location.
    pub download_url: String,
}

impl GitHubSource {
    /// `api_base` overrides `https://api.github.com` (GitHub Enterprise).
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        tag: Option<String>,
        allow_prerelease: bool,
        api_base: Option<&str>,
        network: &NetworkConfig,
        relay: EventRelay,
    ) -> Result<Self> {
        let mut builder = Octocrab::builder();
        if let Some(base) = api_base {
            builder = builder.base_uri(base).map_err(|err| {
                ReleaseError::InvalidDescriptor(format!("invalid GitHub API url `{base}`: {err}"))
            })?;
        }
        let octocrab = builder
            .build()
            .map_err(|err| ReleaseError::Network(format!("unable to construct GitHub client: {err}")))?;
        Ok(Self {
            octocrab,
            http: http_client(network)?,
            owner: owner.into(),
            repo: repo.into(),
            tag: tag.filter(|t| !t.trim().is_empty()),
            allow_prerelease,
            timeout: network.timeout,
            relay,
        })
    }

    async fn fetch_release(&self) -> Result<Release> {
        let repo = self.octocrab.repos(&self.owner, &self.repo);
        let releases = repo.releases();
        let lookup = async {
            match &self.tag {
                Some(tag) => releases.get_by_tag(tag).await,
                None => releases.get_latest().await,
            }
        };
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(result) => result.map_err(|err| self.map_octocrab(err)),
            Err(_) => Err(ReleaseError::Network(format!(
                "GitHub release lookup for {}/{} timed out after {:?}",
                self.owner, self.repo, self.timeout
            ))),
        }
    }

    fn map_octocrab(&self, err: octocrab::Error) -> ReleaseError {
        let subject = format!("{}/{}", self.owner, self.repo);
        match &err {
            octocrab::Error::GitHub { source, .. }
                if source.message.eq_ignore_ascii_case("not found") =>
            {
                ReleaseError::NotFound(format!("no release published for {subject}"))
            }
            _ => ReleaseError::Network(format!("GitHub release lookup for {subject} failed: {err}")),
        }
    }

    async fn fetch_text(&self, url: &str) -> Result<String> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| map_reqwest(url, err))?;
        if !response.status().is_success() {
            return Err(ReleaseError::Network(format!(
                "{url} answered {}",
                response.status()
            )));
        }
        response.text().await.map_err(|err| map_reqwest(url, err))
    }

    async fn checksum_for(
        &self,
        chosen: &RemoteAsset,
        assets: &[RemoteAsset],
    ) -> Result<(String, Option<ChecksumAlgorithm>)> {
        for (suffix, algorithm) in [
            (".sha256", ChecksumAlgorithm::Sha256),
            (".sha512", ChecksumAlgorithm::Sha512),
        ] {
            let wanted = format!("{}{suffix}", chosen.name);
            if let Some(companion) = assets.iter().find(|a| a.name == wanted) {
                let body = self.fetch_text(&companion.download_url).await?;
                if let Some(digest) = parse_checksum_listing(&body, &chosen.name) {
                    return Ok((digest, Some(algorithm)));
                }
            }
        }
        for listing in assets.iter().filter(|a| is_checksum_listing(&a.name)) {
            let body = self.fetch_text(&listing.download_url).await?;
            if let Some(digest) = parse_checksum_listing(&body, &chosen.name) {
                return Ok((digest, None));
            }
        }
        Err(ReleaseError::InvalidDescriptor(format!(
            "no checksum published for {}",
            chosen.name
        )))
    }

    async fn signature_for(&self, chosen: &RemoteAsset, assets: &[RemoteAsset]) -> Result<Option<String>> {
        let wanted = format!("{}.sig", chosen.name);
        match assets.iter().find(|a| a.name == wanted) {
            Some(companion) => {
                let body = self.fetch_text(&companion.download_url).await?;
                Ok(Some(body.trim().to_owned()))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ReleaseSource for GitHubSource {
    async fn fetch_latest(&self, target: &PlatformTarget) -> Result<ReleaseListing> {
        self.relay.debug(
            Channel::Releaser,
            format!("querying GitHub releases of {}/{}", self.owner, self.repo),
        );
        let release = self.fetch_release().await?;
        if release.prerelease && !self.allow_prerelease {
            warn!(tag = %release.tag_name, "latest GitHub release is a prerelease");
            return Err(ReleaseError::NotFound(format!(
                "latest release {} is a prerelease and prereleases are not allowed",
                release.tag_name
            )));
        }

        let assets: Vec<RemoteAsset> = release
            .assets
            .iter()
            .map(|asset| RemoteAsset {
                name: asset.name.clone(),
                size: u64::try_from(asset.size).unwrap_or_default(),
                download_url: asset.browser_download_url.to_string(),
            })
            .collect();
        let chosen = select_asset(&assets, target).ok_or_else(|| {
            ReleaseError::NotFound(format!(
                "release {} has no asset for {target}",
                release.tag_name
            ))
        })?;
        debug!(asset = %chosen.name, tag = %release.tag_name, "GitHub asset selected");

        let (checksum, algorithm) = self.checksum_for(chosen, &assets).await?;
        let mut asset = ReleaseAsset::new(
            target.platform.clone(),
            target.arch.clone(),
            target.variant.clone(),
            release.tag_name.trim_start_matches('v'),
        )
        .with_artefact_name(chosen.name.clone())
        .with_download_url(chosen.download_url.clone())
        .with_checksum(checksum, algorithm)
        .with_size(chosen.size);
        if let Some(signature) = self.signature_for(chosen, &assets).await? {
            asset = asset.with_signature(signature, COMPANION_SIGNATURE_TYPE);
        }
        asset.validate()?;

        Ok(ReleaseListing {
            asset,
            changelog: release.body.clone().unwrap_or_default(),
            released_at: release.published_at,
            release_url: Some(release.html_url.to_string()),
        })
    }

    fn name(&self) -> &'static str {
        "github"
    }
}

/// Pick the artifact for `target` by guessing platform and arch from names.
///
/// Checksum listings, signatures and source archives are skipped. A non-empty
/// variant must appear in the file name.
pub fn select_asset<'a>(assets: &'a [RemoteAsset], target: &PlatformTarget) -> Option<&'a RemoteAsset> {
    let variant = target.variant.to_ascii_lowercase();
    assets.iter().find(|asset| {
        if is_auxiliary_file(&asset.name) || is_source_archive(&asset.name) {
            return false;
        }
        let guess = asset_name_guess(&asset.name);
        let platform_ok = guess
            .platform
            .is_some_and(|p| p.eq_ignore_ascii_case(&target.platform));
        let arch_ok = guess
            .arch
            .is_some_and(|a| a.eq_ignore_ascii_case(&target.arch));
        let variant_ok = variant.is_empty() || asset.name.to_ascii_lowercase().contains(&variant);
        platform_ok && arch_ok && variant_ok
    })
}

/// Find the digest for `file_name` in `sha256sum`-style output.
///
/// Accepts `<digest>  <name>`, `<digest> *<name>` and a bare digest.
pub fn parse_checksum_listing(body: &str, file_name: &str) -> Option<String> {
    let mut bare = None;
    for line in body.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with('#')) {
        let mut parts = line.split_whitespace();
        let Some(digest) = parts.next() else { continue };
        match parts.next() {
            Some(name) if name.trim_start_matches('*') == file_name => {
                return Some(digest.to_owned());
            }
            Some(_) => {}
            None => bare = bare.or_else(|| Some(digest.to_owned())),
        }
    }
    bare
}
