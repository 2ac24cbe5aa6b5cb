//! ---
//! hatch_section: "04-release-governance"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Release descriptors and release source clients."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use hatch_common::config::{AppConfig, NetworkConfig, ReleaseSourceKind};
use hatch_common::PlatformTarget;
use hatch_relay::{Channel, EventRelay};
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use crate::asset::ReleaseListing;
use crate::feed::ReleaseSummary;
use crate::github::GitHubSource;
use crate::{ReleaseError, Result};

/// Looks up the latest release for a platform target.
///
/// Implementations apply a timeout, never retry and never cache: each call
/// reaches the remote end and failures surface to the caller.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Latest release built for `target`.
    async fn fetch_latest(&self, target: &PlatformTarget) -> Result<ReleaseListing>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Build the release source selected by `[release].source`.
pub fn source_from_config(config: &AppConfig, relay: EventRelay) -> Result<Arc<dyn ReleaseSource>> {
    let release = &config.release;
    let source: Arc<dyn ReleaseSource> = match release.source {
        ReleaseSourceKind::Json => {
            let url = release.feed_url.as_deref().ok_or_else(|| {
                ReleaseError::InvalidDescriptor("release.feed_url is not configured".to_owned())
            })?;
            Arc::new(JsonFeedSource::new(url, &config.network, relay)?)
        }
        ReleaseSourceKind::Local => Arc::new(LocalFeedSource::new(&release.feed_path, relay)),
        ReleaseSourceKind::Github => {
            let (owner, repo) = release.github().ok_or_else(|| {
                ReleaseError::InvalidDescriptor("github owner/repo are not configured".to_owned())
            })?;
            Arc::new(GitHubSource::new(
                owner,
                repo,
                release.github_tag.clone(),
                config.updater.allow_prerelease,
                release.github_api_url.as_deref(),
                &config.network,
                relay,
            )?)
        }
    };
    Ok(source)
}

/// HTTP client honouring the configured timeout and user agent.
pub fn http_client(network: &NetworkConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(network.timeout)
        .connect_timeout(network.timeout)
        .user_agent(network.user_agent.clone())
        .build()
        .map_err(|err| ReleaseError::Network(format!("unable to build http client: {err}")))
}

pub(crate) fn map_reqwest(url: &str, err: reqwest::Error) -> ReleaseError {
    if err.is_timeout() {
        ReleaseError::Network(format!("request to {url} timed out"))
    } else {
        ReleaseError::Network(format!("request to {url} failed: {err}"))
    }
}

/// Release summary JSON fetched over HTTP(S).
#[derive(Debug, Clone)]
pub struct JsonFeedSource {
    client: reqwest::Client,
    url: Url,
    relay: EventRelay,
}

impl JsonFeedSource {
    pub fn new(url: &str, network: &NetworkConfig, relay: EventRelay) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|err| ReleaseError::InvalidDescriptor(format!("invalid feed url `{url}`: {err}")))?;
        Ok(Self {
            client: http_client(network)?,
            url,
            relay,
        })
    }
}

#[async_trait]
impl ReleaseSource for JsonFeedSource {
    async fn fetch_latest(&self, target: &PlatformTarget) -> Result<ReleaseListing> {
        self.relay
            .debug(Channel::Releaser, format!("fetching release feed {}", self.url));
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|err| map_reqwest(self.url.as_str(), err))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ReleaseError::NotFound(format!("feed {} not found", self.url)));
        }
        if !status.is_success() {
            return Err(ReleaseError::Network(format!(
                "feed {} answered {status}",
                self.url
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| map_reqwest(self.url.as_str(), err))?;
        let summary = ReleaseSummary::from_json(&body)?;
        debug!(url = %self.url, version = %summary.version, "release feed fetched");
        summary.select(target)
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

/// Release summary JSON read from disk.
#[derive(Debug, Clone)]
pub struct LocalFeedSource {
    path: PathBuf,
    relay: EventRelay,
}

impl LocalFeedSource {
    pub fn new(path: impl AsRef<Path>, relay: EventRelay) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            relay,
        }
    }
}

#[async_trait]
impl ReleaseSource for LocalFeedSource {
    async fn fetch_latest(&self, target: &PlatformTarget) -> Result<ReleaseListing> {
        self.relay.debug(
            Channel::Releaser,
            format!("reading release feed {}", self.path.display()),
        );
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ReleaseError::NotFound(format!(
                    "feed {} does not exist",
                    self.path.display()
                )))
            }
            Err(err) => return Err(err.into()),
        };
        ReleaseSummary::from_json(&bytes)?.select(target)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use axum::Router;

    use super::*;

    const FEED: &str = r#"{
        "version": "1.2.0",
        "assets": [{
            "platform": "linux",
            "arch": "amd64",
            "download_url": "https://example.com/hatch",
            "checksum": "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08",
            "size_bytes": 4
        }]
    }"#;

    fn relay() -> EventRelay {
        EventRelay::new(32).unwrap()
    }

    fn network(timeout: Duration) -> NetworkConfig {
        NetworkConfig {
            timeout,
            ..NetworkConfig::default()
        }
    }

    async fn serve() -> String {
        let app = Router::new()
            .route("/latest.json", get(|| async { FEED }))
            .route(
                "/broken.json",
                get(|| async { AxumStatus::INTERNAL_SERVER_ERROR }),
            )
            .route(
                "/slow.json",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    FEED
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn json_feed_returns_matching_listing() {
        let base = serve().await;
        let source = JsonFeedSource::new(
            &format!("{base}/latest.json"),
            &network(Duration::from_secs(5)),
            relay(),
        )
        .unwrap();
        let listing = source
            .fetch_latest(&PlatformTarget::new("linux", "amd64", ""))
            .await
            .unwrap();
        assert_eq!(listing.asset.version, "1.2.0");
        assert_eq!(listing.asset.size_bytes, 4);
    }

    #[tokio::test]
    async fn json_feed_maps_http_failures() {
        let base = serve().await;
        let net = network(Duration::from_millis(300));
        let target = PlatformTarget::new("linux", "amd64", "");

        let missing = JsonFeedSource::new(&format!("{base}/missing.json"), &net, relay()).unwrap();
        assert!(matches!(
            missing.fetch_latest(&target).await,
            Err(ReleaseError::NotFound(_))
        ));

        let broken = JsonFeedSource::new(&format!("{base}/broken.json"), &net, relay()).unwrap();
        assert!(matches!(
            broken.fetch_latest(&target).await,
            Err(ReleaseError::Network(_))
        ));

        let slow = JsonFeedSource::new(&format!("{base}/slow.json"), &net, relay()).unwrap();
        assert!(matches!(
            slow.fetch_latest(&target).await,
            Err(ReleaseError::Network(_))
        ));
    }

    #[tokio::test]
    async fn local_feed_reads_file_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.json");
        std::fs::write(&path, FEED).unwrap();
        let target = PlatformTarget::new("linux", "amd64", "");

        let listing = LocalFeedSource::new(&path, relay())
            .fetch_latest(&target)
            .await
            .unwrap();
        assert_eq!(listing.asset.platform, "linux");

        let missing = LocalFeedSource::new(dir.path().join("nope.json"), relay());
        assert!(matches!(
            missing.fetch_latest(&target).await,
            Err(ReleaseError::NotFound(_))
        ));
    }

    #[test]
    fn config_selects_source_kind() {
        let mut config = AppConfig::default();
        config.release.source = ReleaseSourceKind::Local;
        let source = source_from_config(&config, relay()).unwrap();
        assert_eq!(source.name(), "local");

        config.release.source = ReleaseSourceKind::Json;
        config.release.feed_url = None;
        assert!(source_from_config(&config, relay()).is_err());
    }
}
