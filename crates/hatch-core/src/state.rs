//! ---
//! hatch_section: "01-core-functionality"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Updater state model and durable state store."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use hatch_release::ReleaseAsset;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::Display;

/// Current state file envelope version.
pub const STATE_VERSION: u16 = 1;

/// Coordinator state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UpdatePhase {
    /// Initial and resting state.
    #[default]
    Idle,
    /// Asking the release source.
    Checking,
    /// The latest release is not newer than the running build.
    UpToDate,
    /// A newer release was found.
    UpdateAvailable,
    /// Fetching the artifact.
    Downloading,
    /// Checking checksum and signature.
    Verifying,
    /// Verified artifact waiting for the apply step.
    StagedForApply,
    /// Verification rejected the artifact.
    VerificationFailed,
    /// The apply helper is being launched.
    Applying,
    /// Terminal: the process is exiting into the new build.
    Restarting,
}

impl UpdatePhase {
    /// Phases during which another operation is rejected.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            UpdatePhase::Checking
                | UpdatePhase::Downloading
                | UpdatePhase::Verifying
                | UpdatePhase::StagedForApply
                | UpdatePhase::Applying
                | UpdatePhase::Restarting
        )
    }

    /// Phases that read or write the staging directory.
    pub fn owns_staging(self) -> bool {
        matches!(
            self,
            UpdatePhase::Downloading
                | UpdatePhase::Verifying
                | UpdatePhase::StagedForApply
                | UpdatePhase::Applying
                | UpdatePhase::Restarting
        )
    }
}

/// Observer-facing updater state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdaterState {
    /// Version of the running build.
    pub updater_version: String,
    /// Time of the last successful release check.
    #[serde(default)]
    pub updater_last_time_checked_update: Option<DateTime<Utc>>,
    /// Descriptor returned by the last successful check.
    #[serde(default)]
    pub updater_update_link: Option<ReleaseAsset>,
    /// Release notes of `updater_update_link`.
    #[serde(default)]
    pub updater_changelog: String,
    /// Publication time of `updater_update_link`.
    #[serde(default)]
    pub updater_released_at: Option<DateTime<Utc>>,
    /// Minutes between background checks.
    pub updater_check_interval: u64,
    /// Human readable transcript of coordinator activity.
    #[serde(default)]
    pub updater_log: Vec<String>,
    /// File the apply helper appends to.
    pub updater_log_path: PathBuf,
    /// Busy flag guarding check, download, verify and apply.
    #[serde(default)]
    pub updater_updating: bool,
    /// Current state machine position.
    #[serde(default)]
    pub updater_phase: UpdatePhase,
}

impl UpdaterState {
    /// Fresh state for the running build.
    pub fn new(version: impl Into<String>, check_interval_minutes: u64, log_path: PathBuf) -> Self {
        Self {
            updater_version: version.into(),
            updater_last_time_checked_update: None,
            updater_update_link: None,
            updater_changelog: String::new(),
            updater_released_at: None,
            updater_check_interval: check_interval_minutes,
            updater_log: Vec::new(),
            updater_log_path: log_path,
            updater_updating: false,
            updater_phase: UpdatePhase::Idle,
        }
    }

    /// Whether the last check is older than the check interval.
    pub fn check_due(&self, now: DateTime<Utc>) -> bool {
        match self.updater_last_time_checked_update {
            None => true,
            Some(last) => {
                let minutes = i64::try_from(self.updater_check_interval)
                    .unwrap_or(i64::MAX)
                    .min(i64::MAX / 60_000);
                last.checked_add_signed(chrono::Duration::minutes(minutes))
                    .is_some_and(|due| due <= now)
            }
        }
    }
}

/// Verified artifact waiting for the apply step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedArtifact {
    /// Location inside the staging directory.
    pub path: PathBuf,
    /// Descriptor the artifact was verified against.
    pub asset: ReleaseAsset,
    /// When verification finished.
    pub staged_at: DateTime<Utc>,
}

/// What survives a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Updater state; the transcript is not persisted.
    pub state: UpdaterState,
    /// Artifact staged but not yet handed to the apply helper.
    #[serde(default)]
    pub staged: Option<StagedArtifact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateEnvelope {
    version: u16,
    saved_at: DateTime<Utc>,
    hash: String,
    payload: PersistedState,
}

/// Failures of the state file.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Reading or writing the file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not a valid state envelope.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    /// The payload does not match its recorded hash.
    #[error("state hash mismatch")]
    HashMismatch,
    /// The envelope was written by an incompatible build.
    #[error("unsupported state version {0}")]
    UnsupportedVersion(u16),
}

/// JSON state file guarded by a content hash.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the state file; `None` when it does not exist.
    pub fn load(&self) -> Result<Option<PersistedState>, StateError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let envelope: StateEnvelope = serde_json::from_slice(&bytes)?;
        if envelope.version != STATE_VERSION {
            return Err(StateError::UnsupportedVersion(envelope.version));
        }
        if envelope.hash != compute_hash(&envelope.payload)? {
            return Err(StateError::HashMismatch);
        }
        Ok(Some(envelope.payload))
    }

    /// Write the state atomically through a sibling temporary file.
    pub fn save(&self, persisted: &PersistedState) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut payload = persisted.clone();
        payload.state.updater_log.clear();
        payload.state.updater_updating = false;
        let envelope = StateEnvelope {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            hash: compute_hash(&payload)?,
            payload,
        };

        let mut temp = self.path.as_os_str().to_owned();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        {
            let file = File::create(&temp)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&serde_json::to_vec_pretty(&envelope)?)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}

fn compute_hash(payload: &PersistedState) -> Result<String, StateError> {
    let serialized = serde_json::to_vec(payload)?;
    Ok(hex::encode(Sha256::digest(serialized)))
}
