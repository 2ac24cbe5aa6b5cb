//! ---
//! hatch_section: "05-networking"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Artifact downloads into the staging directory."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hatch_common::config::NetworkConfig;
use hatch_relay::{Channel, DownloadProgress, EventRelay, LogLevel, RelayEvent};
use hatch_release::ReleaseAsset;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{DownloadError, Result};

/// Downloads the artifact of a descriptor to a local path.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Fetch `asset` into `dest`, returning the number of bytes written.
    ///
    /// `dest` only appears once every byte has arrived; a partial transfer
    /// never occupies it. Each call restarts from byte zero.
    async fn fetch(&self, asset: &ReleaseAsset, dest: &Path, cancel: &CancellationToken) -> Result<u64>;
}

/// Temporary path used while `dest` is being written.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut raw = dest.as_os_str().to_owned();
    raw.push(".part");
    PathBuf::from(raw)
}

/// Streaming HTTP downloader.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
    relay: EventRelay,
    timeout: Duration,
    progress_interval: Duration,
}

impl HttpDownloader {
    pub fn new(network: &NetworkConfig, relay: EventRelay) -> Result<Self> {
        // The overall request is unbounded; every read is bounded by `timeout`.
        let client = reqwest::Client::builder()
            .connect_timeout(network.timeout)
            .user_agent(network.user_agent.clone())
            .build()
            .map_err(|err| DownloadError::Network(format!("unable to build http client: {err}")))?;
        Ok(Self {
            client,
            relay,
            timeout: network.timeout,
            progress_interval: network.progress_interval,
        })
    }

    fn progress(&self, level: LogLevel, file: &str, written: u64, total: u64) {
        self.relay.publish(
            level,
            RelayEvent::NetDownload(DownloadProgress::new(file, written, total)),
        );
    }

    async fn stream_to(
        &self,
        asset: &ReleaseAsset,
        partial: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let url = asset.download_url.trim();
        let file_name = asset.file_name();

        let request = self.client.get(url).send();
        let mut response = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            sent = tokio::time::timeout(self.timeout, request) => match sent {
                Err(_) => return Err(DownloadError::Network(format!("request to {url} timed out"))),
                Ok(Err(err)) => return Err(DownloadError::Network(format!("request to {url} failed: {err}"))),
                Ok(Ok(response)) => response,
            },
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                status: status.as_u16(),
                url: url.to_owned(),
            });
        }

        let total = if asset.size_bytes > 0 {
            asset.size_bytes
        } else {
            response.content_length().unwrap_or(0)
        };

        let mut file = File::create(partial).await?;
        let mut written: u64 = 0;
        let mut last_sample = Instant::now();
        self.progress(LogLevel::Info, &file_name, 0, total);

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                next = tokio::time::timeout(self.timeout, response.chunk()) => match next {
                    Err(_) => return Err(DownloadError::Network(format!("read from {url} timed out"))),
                    Ok(Err(err)) => return Err(DownloadError::Network(format!("read from {url} failed: {err}"))),
                    Ok(Ok(chunk)) => chunk,
                },
            };
            let Some(chunk) = chunk else { break };

            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if total > 0 && written > total {
                return Err(DownloadError::SizeMismatch {
                    expected: total,
                    actual: written,
                });
            }
            if last_sample.elapsed() >= self.progress_interval {
                self.progress(LogLevel::Debug, &file_name, written, total);
                last_sample = Instant::now();
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        self.progress(LogLevel::Info, &file_name, written, total);

        if total > 0 && written != total {
            return Err(DownloadError::SizeMismatch {
                expected: total,
                actual: written,
            });
        }
        Ok(written)
    }
}

#[async_trait]
impl ArtifactFetcher for HttpDownloader {
    async fn fetch(&self, asset: &ReleaseAsset, dest: &Path, cancel: &CancellationToken) -> Result<u64> {
        if asset.download_url.trim().is_empty() {
            return Err(DownloadError::MissingUrl);
        }
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let partial = partial_path(dest);
        remove_if_present(&partial).await?;

        self.relay.info(
            Channel::Net,
            format!("downloading {} from {}", asset.file_name(), asset.download_url),
        );
        match self.stream_to(asset, &partial, cancel).await {
            Ok(written) => {
                fs::rename(&partial, dest).await?;
                debug!(dest = %dest.display(), bytes = written, "artifact downloaded");
                self.relay.info(
                    Channel::Net,
                    format!("downloaded {written} bytes to {}", dest.display()),
                );
                Ok(written)
            }
            Err(err) => {
                if let Err(cleanup) = remove_if_present(&partial).await {
                    warn!(path = %partial.display(), error = %cleanup, "failed removing partial download");
                }
                self.relay.error(Channel::Net, format!("download failed: {err}"));
                Err(err)
            }
        }
    }
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
