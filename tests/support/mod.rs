//! ---
//! hatch_section: "15-testing-qa-runbook"
//! hatch_subsection: "integration-tests"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Shared fixtures: local release server and coordinator wiring."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use hatch_common::config::{AppConfig, ReleaseSourceKind};
use hatch_core::{
    Applier, ApplyRequest, CoordinatorParts, Restarter, RetryPolicy, UpdateCoordinator,
};
use hatch_relay::EventRelay;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub const ARTIFACT_LEN: usize = 1024;
pub const ARTIFACT_NAME: &str = "hatch-1.2.0-linux-amd64.bin";

pub fn artifact() -> Vec<u8> {
    (0..ARTIFACT_LEN).map(|n| (n * 7 % 251) as u8).collect()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Local HTTP server publishing one feed document and one artifact.
pub struct ReleaseServer {
    pub base: String,
    feed: Arc<RwLock<Option<String>>>,
    downloads: Arc<AtomicUsize>,
}

impl ReleaseServer {
    pub async fn start(payload: Vec<u8>) -> Self {
        let feed: Arc<RwLock<Option<String>>> = Arc::new(RwLock::new(None));
        let downloads = Arc::new(AtomicUsize::new(0));
        let payload = Arc::new(payload);

        let app = Router::new()
            .route(
                "/latest.json",
                get({
                    let feed = feed.clone();
                    move || {
                        let body = feed.read().clone();
                        async move {
                            match body {
                                Some(body) => body.into_response(),
                                None => StatusCode::NOT_FOUND.into_response(),
                            }
                        }
                    }
                }),
            )
            .route(
                &format!("/artifacts/{ARTIFACT_NAME}"),
                get({
                    let downloads = downloads.clone();
                    let payload = payload.clone();
                    move || {
                        downloads.fetch_add(1, Ordering::SeqCst);
                        let body = payload.as_ref().clone();
                        async move { body }
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            feed,
            downloads,
        }
    }

    pub fn feed_url(&self) -> String {
        format!("{}/latest.json", self.base)
    }

    pub fn artifact_url(&self) -> String {
        format!("{}/artifacts/{ARTIFACT_NAME}", self.base)
    }

    pub fn publish(&self, feed: serde_json::Value) {
        *self.feed.write() = Some(feed.to_string());
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Publish `version` with the checksum of `payload` and an optional
    /// `(signature_type, signature)` pair.
    pub fn publish_release(&self, version: &str, payload: &[u8], signature: Option<(&str, &str)>) {
        let mut asset = json!({
            "artefact_name": ARTIFACT_NAME,
            "platform": "linux",
            "arch": "amd64",
            "download_url": self.artifact_url(),
            "checksum": format!("sha256:{}", sha256_hex(payload)),
            "size_bytes": payload.len(),
        });
        if let Some((kind, value)) = signature {
            asset["signature_type"] = json!(kind);
            asset["signature"] = json!(value);
        }
        self.publish(json!({
            "version": version,
            "changelog": format!("Release notes for {version}"),
            "published_at": "2026-09-30T12:00:00Z",
            "release_url": format!("{}/releases/{version}", self.base),
            "assets": [asset],
        }));
    }
}

pub fn config(dir: &Path, feed_url: &str, running: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.updater.version = Some(running.to_owned());
    config.updater.platform = Some("linux".into());
    config.updater.arch = Some("amd64".into());
    config.updater.staging_dir = dir.join("staging");
    config.updater.state_path = dir.join("state.json");
    config.updater.log_path = dir.join("update.log");
    config.release.source = ReleaseSourceKind::Json;
    config.release.feed_url = Some(feed_url.to_owned());
    config.network.timeout = Duration::from_secs(5);
    config.network.max_retries = 1;
    config.network.retry_base_delay = Duration::from_millis(1);
    config.network.progress_interval = Duration::from_millis(1);
    config
}

#[derive(Default)]
pub struct RecordingApplier {
    pub requests: Mutex<Vec<ApplyRequest>>,
}

#[async_trait]
impl Applier for RecordingApplier {
    async fn apply(&self, request: &ApplyRequest) -> hatch_core::Result<()> {
        self.requests.lock().push(request.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct NotifyRestarter {
    pub notify: Notify,
}

impl Restarter for NotifyRestarter {
    fn restart(&self) {
        self.notify.notify_one();
    }
}

pub struct Harness {
    pub coordinator: UpdateCoordinator,
    pub relay: EventRelay,
    pub applier: Arc<RecordingApplier>,
    pub restarter: Arc<NotifyRestarter>,
}

/// Production wiring from `config` with the apply and restart steps replaced.
pub fn harness(config: &AppConfig) -> Harness {
    let relay = EventRelay::new(1024).unwrap();
    let applier = Arc::new(RecordingApplier::default());
    let restarter = Arc::new(NotifyRestarter::default());
    let mut parts =
        CoordinatorParts::from_config(config, relay.clone(), CancellationToken::new()).unwrap();
    parts.applier = applier.clone();
    parts.restarter = restarter.clone();
    parts.apply_delay = Duration::from_millis(10);
    parts.retry = RetryPolicy::new(1, Duration::from_millis(1));
    Harness {
        coordinator: UpdateCoordinator::new(parts),
        relay,
        applier,
        restarter,
    }
}
