//! ---
//! hatch_section: "01-core-functionality"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Shared primitives and utilities for the updater runtime."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use path_absolutize::Absolutize;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use strum::Display;
use tracing::debug;

use crate::platform::PlatformTarget;

/// Candidate configuration paths inspected when no explicit path is supplied.
pub const DEFAULT_CONFIG_CANDIDATES: [&str; 2] = ["configs/hatch.toml", "/etc/hatch/hatch.toml"];

fn default_staging_dir() -> PathBuf {
    PathBuf::from("target/hatch/staging")
}

fn default_state_path() -> PathBuf {
    PathBuf::from("target/hatch/state.json")
}

fn default_update_log_path() -> PathBuf {
    PathBuf::from("target/hatch/update.log")
}

fn default_check_interval_minutes() -> u64 {
    2880
}

fn default_feed_path() -> PathBuf {
    PathBuf::from("configs/release_feed.json")
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> Duration {
    Duration::from_millis(2000)
}

fn default_progress_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_user_agent() -> String {
    format!("hatch/{}", env!("CARGO_PKG_VERSION"))
}

fn default_channel_capacity() -> usize {
    256
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for the Hatch updater.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub updater: UpdaterConfig,
    #[serde(default)]
    pub release: ReleaseConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "HATCH_CONFIG";

    /// Load configuration from disk, respecting the `HATCH_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Parse, absolutize and validate a single configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let mut config = Self::parse(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.absolutize_paths()?;
        config.validate()?;
        Ok(config)
    }

    fn parse(contents: &str) -> Result<Self> {
        let deserializer = toml::Deserializer::new(contents);
        let config: AppConfig = serde_path_to_error::deserialize(deserializer)
            .map_err(|err| anyhow!("{} (at `{}`)", err.inner(), err.path()))?;
        Ok(config)
    }

    /// Resolve relative updater paths against the working directory so they
    /// survive a relaunch from a different directory.
    pub fn absolutize_paths(&mut self) -> Result<()> {
        let updater = &mut self.updater;
        updater.staging_dir = absolutize(&updater.staging_dir)?;
        updater.state_path = absolutize(&updater.state_path)?;
        updater.log_path = absolutize(&updater.log_path)?;
        if let Some(helper) = &updater.apply_helper {
            updater.apply_helper = Some(absolutize(helper)?);
        }
        Ok(())
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.updater.validate()?;
        self.release.validate()?;
        self.network.validate()?;
        if self.relay.channel_capacity == 0 {
            return Err(anyhow!("relay.channel_capacity must be greater than zero"));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config = Self::parse(content).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    Ok(path
        .absolutize()
        .with_context(|| format!("unable to absolutize {}", path.display()))?
        .into_owned())
}

/// Settings describing the running build and where update artefacts live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Overrides the running version; defaults to the package version.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub variant: String,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_update_log_path")]
    pub log_path: PathBuf,
    #[serde(default = "default_check_interval_minutes")]
    pub check_interval_minutes: u64,
    #[serde(default)]
    pub apply_helper: Option<PathBuf>,
    #[serde(default)]
    pub allow_prerelease: bool,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            version: None,
            platform: None,
            arch: None,
            variant: String::new(),
            staging_dir: default_staging_dir(),
            state_path: default_state_path(),
            log_path: default_update_log_path(),
            check_interval_minutes: default_check_interval_minutes(),
            apply_helper: None,
            allow_prerelease: false,
        }
    }
}

impl UpdaterConfig {
    /// Version the coordinator compares release descriptors against.
    pub fn running_version(&self, fallback: &str) -> String {
        self.version
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(fallback)
            .trim_start_matches('v')
            .to_owned()
    }

    /// Platform triple used to select release assets.
    pub fn target(&self) -> PlatformTarget {
        let detected = PlatformTarget::detect();
        PlatformTarget::new(
            self.platform.clone().unwrap_or(detected.platform),
            self.arch.clone().unwrap_or(detected.arch),
            self.variant.clone(),
        )
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_minutes.saturating_mul(60))
    }

    fn validate(&self) -> Result<()> {
        if self.check_interval_minutes == 0 {
            return Err(anyhow!(
                "updater.check_interval_minutes must be greater than zero"
            ));
        }
        if let Some(version) = &self.version {
            if version.trim().is_empty() {
                return Err(anyhow!("updater.version must not be blank when set"));
            }
        }
        if self.staging_dir.as_os_str().is_empty() {
            return Err(anyhow!("updater.staging_dir must not be empty"));
        }
        Ok(())
    }
}

/// Which remote endpoint answers release checks.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReleaseSourceKind {
    /// Release summary JSON served over HTTP(S).
    #[default]
    Json,
    /// Release summary JSON read from the local filesystem.
    Local,
    /// GitHub releases of a repository.
    Github,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseConfig {
    #[serde(default)]
    pub source: ReleaseSourceKind,
    #[serde(default)]
    pub feed_url: Option<String>,
    #[serde(default = "default_feed_path")]
    pub feed_path: PathBuf,
    #[serde(default)]
    pub github_owner: Option<String>,
    #[serde(default)]
    pub github_repo: Option<String>,
    #[serde(default)]
    pub github_tag: Option<String>,
    #[serde(default)]
    pub github_api_url: Option<String>,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            source: ReleaseSourceKind::default(),
            feed_url: None,
            feed_path: default_feed_path(),
            github_owner: None,
            github_repo: None,
            github_tag: None,
            github_api_url: None,
        }
    }
}

impl ReleaseConfig {
    /// Owner and repository when both are configured.
    pub fn github(&self) -> Option<(&str, &str)> {
        self.github_owner
            .as_deref()
            .zip(self.github_repo.as_deref())
    }

    fn validate(&self) -> Result<()> {
        match self.source {
            ReleaseSourceKind::Json => {
                let raw = self
                    .feed_url
                    .as_deref()
                    .ok_or_else(|| anyhow!("release.feed_url is required for the json source"))?;
                let parsed = url::Url::parse(raw)
                    .with_context(|| format!("release.feed_url `{raw}` is not a valid url"))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(anyhow!(
                        "release.feed_url must use http or https, got `{}`",
                        parsed.scheme()
                    ));
                }
            }
            ReleaseSourceKind::Local => {
                if self.feed_path.as_os_str().is_empty() {
                    return Err(anyhow!("release.feed_path must not be empty"));
                }
            }
            ReleaseSourceKind::Github => {
                if self.github().is_none() {
                    return Err(anyhow!(
                        "release.github_owner and release.github_repo are required for the github source"
                    ));
                }
                if let Some(raw) = self.github_api_url.as_deref() {
                    url::Url::parse(raw)
                        .with_context(|| format!("release.github_api_url `{raw}` is not a valid url"))?;
                }
            }
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_timeout", rename = "timeout_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay", rename = "retry_base_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_base_delay: Duration,
    #[serde(default = "default_progress_interval", rename = "progress_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub progress_interval: Duration,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay: default_retry_base_delay(),
            progress_interval: default_progress_interval(),
            user_agent: default_user_agent(),
        }
    }
}

impl NetworkConfig {
    fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(anyhow!("network.timeout_secs must be greater than zero"));
        }
        if self.user_agent.trim().is_empty() {
            return Err(anyhow!("network.user_agent must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Trusted public keys keyed by signature type (`ed25519`, `ecdsa-p256`).
    #[serde(default)]
    pub public_keys: IndexMap<String, String>,
    /// Optional TOML file of additional `type = "base64 key"` entries.
    #[serde(default)]
    pub public_key_path: Option<PathBuf>,
    #[serde(default)]
    pub require_signature: bool,
}

impl VerificationConfig {
    /// Merge inline keys with the keys file; inline entries win.
    pub fn resolved_public_keys(&self) -> Result<IndexMap<String, String>> {
        let mut keys = IndexMap::new();
        if let Some(path) = &self.public_key_path {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("unable to read public key file {}", path.display()))?;
            let from_file: IndexMap<String, String> = toml::from_str(&raw)
                .with_context(|| format!("invalid public key file {}", path.display()))?;
            keys.extend(from_file);
        }
        for (kind, key) in &self.public_keys {
            keys.insert(kind.to_lowercase(), key.clone());
        }
        Ok(keys)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Available log formats for stdout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}
