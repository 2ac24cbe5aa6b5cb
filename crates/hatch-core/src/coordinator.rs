//! ---
//! hatch_section: "01-core-functionality"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Check, stage and apply state machine."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use hatch_common::config::AppConfig;
use hatch_common::{PlatformTarget, VersionInfo};
use hatch_logging::{hatch_debug, hatch_warn, log_system_event, LogContext, SystemEventOutcome};
use hatch_net::{ArtifactFetcher, HttpDownloader};
use hatch_relay::{Channel, EventRelay, LogData, LogLevel, RelayEvent, VersionAvailable};
use hatch_release::{source_from_config, ReleaseAsset, ReleaseListing, ReleaseSource};
use hatch_verify::Verifier;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::apply::{
    make_executable, resolve_update_target, Applier, ApplyRequest, HelperCommandApplier,
    MissingHelperApplier, ProcessExit, Restarter,
};
use crate::metrics::UpdateMetrics;
use crate::retry::RetryPolicy;
use crate::staging::StagingArea;
use crate::state::{PersistedState, StagedArtifact, StateStore, UpdatePhase, UpdaterState};
use crate::{Result, UpdateError};

/// Pause between staging an artifact and launching the apply step.
pub const APPLY_DELAY: Duration = Duration::from_secs(2);

/// Announced once an artifact is staged.
pub const SHUTDOWN_NOTICE: &str = "app will shut down and update shortly";

/// Collaborators and settings the coordinator is assembled from.
pub struct CoordinatorParts {
    /// Release lookup.
    pub source: Arc<dyn ReleaseSource>,
    /// Artifact download.
    pub fetcher: Arc<dyn ArtifactFetcher>,
    /// Integrity checks.
    pub verifier: Verifier,
    /// Launches the apply helper.
    pub applier: Arc<dyn Applier>,
    /// Ends the process after the helper started.
    pub restarter: Arc<dyn Restarter>,
    /// Durable state file.
    pub store: StateStore,
    /// Staging directory.
    pub staging: StagingArea,
    /// Event relay every step publishes on.
    pub relay: EventRelay,
    /// Retry policy for network steps.
    pub retry: RetryPolicy,
    /// Platform triple assets are selected for.
    pub target: PlatformTarget,
    /// Version of the running build.
    pub running_version: String,
    /// Period of background checks.
    pub check_interval: Duration,
    /// Log file shared with the apply helper.
    pub log_path: PathBuf,
    /// Executable or bundle the helper replaces.
    pub update_target: PathBuf,
    /// Pause before the apply step.
    pub apply_delay: Duration,
    /// Optional lifecycle counters.
    pub metrics: Option<UpdateMetrics>,
    /// Process shutdown signal; cancels checks and downloads.
    pub shutdown: CancellationToken,
}

impl CoordinatorParts {
    /// Assemble the production collaborators described by `config`.
    pub fn from_config(
        config: &AppConfig,
        relay: EventRelay,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        let source = source_from_config(config, relay.clone()).context("unable to build release source")?;
        let fetcher = HttpDownloader::new(&config.network, relay.clone())
            .context("unable to build artifact downloader")?;
        let keys = config
            .verification
            .resolved_public_keys()
            .context("unable to load trusted public keys")?;
        let verifier = Verifier::new(keys, config.verification.require_signature, relay.clone());
        let applier: Arc<dyn Applier> = match &config.updater.apply_helper {
            Some(helper) => Arc::new(HelperCommandApplier::new(helper)),
            None => Arc::new(MissingHelperApplier),
        };
        let target = config.updater.target();
        let executable = std::env::current_exe().context("unable to locate the running executable")?;
        let update_target = resolve_update_target(&executable, &target.platform);

        Ok(Self {
            source,
            fetcher: Arc::new(fetcher),
            verifier,
            applier,
            restarter: Arc::new(ProcessExit),
            store: StateStore::new(&config.updater.state_path),
            staging: StagingArea::new(&config.updater.staging_dir),
            relay,
            retry: RetryPolicy::from_config(&config.network),
            target,
            running_version: config
                .updater
                .running_version(&VersionInfo::current().semver),
            check_interval: config.updater.check_interval(),
            log_path: config.updater.log_path.clone(),
            update_target,
            apply_delay: APPLY_DELAY,
            metrics: None,
            shutdown,
        })
    }

    /// Attach lifecycle counters.
    pub fn with_metrics(mut self, metrics: UpdateMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Result of a release check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "release", rename_all = "snake_case")]
pub enum CheckOutcome {
    /// The release is strictly newer than the running build.
    UpdateAvailable(ReleaseListing),
    /// The release is not newer; returned for display.
    UpToDate(ReleaseListing),
}

impl CheckOutcome {
    pub fn listing(&self) -> &ReleaseListing {
        match self {
            CheckOutcome::UpdateAvailable(listing) | CheckOutcome::UpToDate(listing) => listing,
        }
    }

    pub fn asset(&self) -> &ReleaseAsset {
        &self.listing().asset
    }

    pub fn is_update_available(&self) -> bool {
        matches!(self, CheckOutcome::UpdateAvailable(_))
    }
}

/// What `post_install_cleanup` removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Entries removed from the staging directory.
    pub removed_entries: usize,
    /// Whether the helper log file existed and was removed.
    pub removed_log: bool,
}

/// Fate of an artifact found staged at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// No artifact was staged.
    NothingStaged,
    /// The staged version is already running; the artifact was removed.
    AlreadyApplied,
    /// The artifact still matches the latest release and is being applied.
    Resumed,
    /// The artifact is stale or could not be re-verified and was removed.
    Discarded,
}

/// Summary of `hydrate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HydrateReport {
    /// Crash recovery result.
    pub recovery: RecoveryOutcome,
    /// A helper log from a previous apply was read.
    pub previous_update_log: bool,
    /// A background check was started because the interval elapsed.
    pub background_check: bool,
}

struct Shared {
    state: UpdaterState,
    available: Option<ReleaseListing>,
    staged: Option<StagedArtifact>,
    cleaning: bool,
}

impl Shared {
    fn resting_phase(&self) -> UpdatePhase {
        if self.available.is_some() {
            UpdatePhase::UpdateAvailable
        } else {
            UpdatePhase::Idle
        }
    }
}

struct Inner {
    source: Arc<dyn ReleaseSource>,
    fetcher: Arc<dyn ArtifactFetcher>,
    verifier: Verifier,
    applier: Arc<dyn Applier>,
    restarter: Arc<dyn Restarter>,
    store: StateStore,
    staging: StagingArea,
    relay: EventRelay,
    retry: RetryPolicy,
    target: PlatformTarget,
    check_interval: Duration,
    update_target: PathBuf,
    apply_delay: Duration,
    metrics: Option<UpdateMetrics>,
    shutdown: CancellationToken,
    shared: Mutex<Shared>,
    // Serializes state file writes; they share one temp path.
    persist_lock: Mutex<()>,
    apply_task: Mutex<Option<JoinHandle<()>>>,
}

/// Holds the busy flag for the duration of one operation.
struct BusyGuard {
    inner: Arc<Inner>,
    previous: UpdatePhase,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut shared = self.inner.shared.lock();
        shared.state.updater_updating = false;
        let phase = shared.state.updater_phase;
        if phase.is_active() && phase != UpdatePhase::Restarting {
            shared.state.updater_phase = shared.resting_phase();
        }
    }
}

/// Holds the staging directory for a cleanup pass.
struct CleaningGuard {
    inner: Arc<Inner>,
}

impl Drop for CleaningGuard {
    fn drop(&mut self) {
        self.inner.shared.lock().cleaning = false;
    }
}

/// Single owner of the updater state. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct UpdateCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for UpdateCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateCoordinator")
            .field("source", &self.inner.source.name())
            .field("target", &self.inner.target)
            .finish_non_exhaustive()
    }
}

impl UpdateCoordinator {
    pub fn new(parts: CoordinatorParts) -> Self {
        let interval_minutes = parts.check_interval.as_secs() / 60;
        let state = UpdaterState::new(parts.running_version, interval_minutes, parts.log_path);
        Self {
            inner: Arc::new(Inner {
                source: parts.source,
                fetcher: parts.fetcher,
                verifier: parts.verifier,
                applier: parts.applier,
                restarter: parts.restarter,
                store: parts.store,
                staging: parts.staging,
                relay: parts.relay,
                retry: parts.retry,
                target: parts.target,
                check_interval: parts.check_interval,
                update_target: parts.update_target,
                apply_delay: parts.apply_delay,
                metrics: parts.metrics,
                shutdown: parts.shutdown,
                shared: Mutex::new(Shared {
                    state,
                    available: None,
                    staged: None,
                    cleaning: false,
                }),
                persist_lock: Mutex::new(()),
                apply_task: Mutex::new(None),
            }),
        }
    }

    /// Relay the coordinator publishes on.
    pub fn relay(&self) -> &EventRelay {
        &self.inner.relay
    }

    /// Snapshot of the current updater state.
    pub fn updater_state_get(&self) -> UpdaterState {
        self.inner.shared.lock().state.clone()
    }

    /// Artifact staged and awaiting the apply step, if any.
    pub fn staged(&self) -> Option<StagedArtifact> {
        self.inner.shared.lock().staged.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.shared.lock().state.updater_updating
    }

    fn running_version(&self) -> String {
        self.inner.shared.lock().state.updater_version.clone()
    }

    /// Ask the release source for the latest release and compare it with the
    /// running version.
    pub async fn check_for_update(&self) -> Result<CheckOutcome> {
        let (guard, ()) = self.acquire(Some(UpdatePhase::Checking), |_| Ok(()))?;
        self.note(LogLevel::Debug, "checking for updates");

        let listing = match self.fetch_listing().await {
            Ok(listing) => listing,
            Err(err) => {
                self.fail(&err, Some(guard.previous));
                return Err(err);
            }
        };
        let running = self.running_version();
        let newer = match listing.asset.is_newer_than(&running) {
            Ok(newer) => newer,
            Err(err) => {
                let err = UpdateError::from(err);
                self.fail(&err, Some(guard.previous));
                return Err(err);
            }
        };

        {
            let mut shared = self.inner.shared.lock();
            shared.state.updater_last_time_checked_update = Some(Utc::now());
            shared.state.updater_update_link = Some(listing.asset.clone());
            shared.state.updater_changelog = listing.changelog.clone();
            shared.state.updater_released_at = listing.released_at;
            shared.state.updater_phase = if newer {
                UpdatePhase::UpdateAvailable
            } else {
                UpdatePhase::UpToDate
            };
            shared.available = newer.then(|| listing.clone());
        }
        self.persist();
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_check(newer);
        }

        let version = listing.asset.version.clone();
        if newer {
            self.note(
                LogLevel::Info,
                format!("update available: {running} -> {version}"),
            );
            self.inner.relay.publish(
                LogLevel::Info,
                RelayEvent::VersionAvailable(VersionAvailable {
                    msg: format!("version {version} is available"),
                    version,
                    released_at: listing.released_at,
                    changelog: listing.changelog.clone(),
                    release_url: listing.release_url.clone(),
                }),
            );
            Ok(CheckOutcome::UpdateAvailable(listing))
        } else {
            self.note(
                LogLevel::Info,
                format!("up to date: running {running}, latest {version}"),
            );
            Ok(CheckOutcome::UpToDate(listing))
        }
    }

    /// Download, verify and stage the release found by the last check, then
    /// schedule the apply step after [`APPLY_DELAY`].
    pub async fn start_update(&self) -> Result<StagedArtifact> {
        let (guard, listing) = self.acquire(Some(UpdatePhase::Downloading), |shared| {
            shared
                .available
                .clone()
                .ok_or(UpdateError::NoUpdateAvailable)
        })?;

        match self.stage(&listing).await {
            Ok(staged) => {
                self.schedule_apply(guard, staged.clone());
                Ok(staged)
            }
            Err(err) => {
                let resting = if err.is_integrity_failure() {
                    self.set_phase(UpdatePhase::VerificationFailed);
                    self.inner.shared.lock().available = None;
                    UpdatePhase::Idle
                } else {
                    guard.previous
                };
                self.fail(&err, Some(resting));
                self.persist();
                Err(err)
            }
        }
    }

    /// Remove staging leftovers and the helper log. Safe to call repeatedly.
    ///
    /// Runs alongside a release check; rejected while a download, a staged
    /// artifact or an apply holds the staging directory.
    pub async fn post_install_cleanup(&self) -> Result<CleanupReport> {
        let _guard = self.acquire_staging()?;
        self.note(LogLevel::Debug, "post install cleanup");

        let removed_entries = match self.inner.staging.clear() {
            Ok(removed) => removed,
            Err(err) => {
                let err = UpdateError::from(err);
                self.fail(&err, None);
                return Err(err);
            }
        };
        let log_path = self.inner.shared.lock().state.updater_log_path.clone();
        let removed_log = match std::fs::remove_file(&log_path) {
            Ok(()) => true,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(err) => {
                self.note(
                    LogLevel::Warn,
                    format!("failed to remove log file {}: {err}", log_path.display()),
                );
                false
            }
        };
        self.inner.shared.lock().staged = None;
        self.persist();
        Ok(CleanupReport {
            removed_entries,
            removed_log,
        })
    }

    /// Restore persisted state, read a leftover helper log, recover a staged
    /// artifact and start a background check when one is due.
    pub async fn hydrate(&self) -> Result<HydrateReport> {
        self.note(LogLevel::Debug, "start: hydrate state");
        let running = self.running_version();

        let persisted = match self.inner.store.load() {
            Ok(persisted) => persisted,
            Err(err) => {
                self.note(
                    LogLevel::Warn,
                    format!(
                        "ignoring unreadable state file {}: {err}",
                        self.inner.store.path().display()
                    ),
                );
                None
            }
        };
        if let Some(persisted) = persisted {
            let previous = persisted.state.updater_version.clone();
            {
                let mut shared = self.inner.shared.lock();
                let state = &mut shared.state;
                state.updater_last_time_checked_update =
                    persisted.state.updater_last_time_checked_update;
                state.updater_update_link = persisted.state.updater_update_link;
                state.updater_changelog = persisted.state.updater_changelog;
                state.updater_released_at = persisted.state.updater_released_at;
                shared.staged = persisted.staged;
            }
            if previous != running {
                self.note(
                    LogLevel::Info,
                    format!("running {running}; previous run was {previous}"),
                );
            }
        }

        let log_path = self.inner.shared.lock().state.updater_log_path.clone();
        let previous_update_log = match tokio::fs::read_to_string(&log_path).await {
            Ok(contents) => {
                let mut shared = self.inner.shared.lock();
                shared
                    .state
                    .updater_log
                    .extend(contents.lines().filter(|l| !l.trim().is_empty()).map(str::to_owned));
                true
            }
            Err(_) => false,
        };
        if previous_update_log {
            self.note(
                LogLevel::Info,
                format!("found update log from a previous apply at {}", log_path.display()),
            );
        }

        let recovery = self.recover_staged().await;
        let background_check = recovery != RecoveryOutcome::Resumed
            && self.updater_state_get().check_due(Utc::now());
        if background_check {
            self.note(
                LogLevel::Debug,
                "update has crossed check interval, checking in background",
            );
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(err) = this.check_for_update().await {
                    hatch_debug!("background update check failed: {err}");
                }
            });
        } else {
            self.note(LogLevel::Debug, "no need to check for updates");
        }

        self.persist();
        self.note(LogLevel::Debug, "end: hydrate state");
        Ok(HydrateReport {
            recovery,
            previous_update_log,
            background_check,
        })
    }

    /// Re-check every check interval until shutdown. Ticks that find the
    /// coordinator busy are skipped, not queued.
    pub fn spawn_periodic_checks(&self) -> JoinHandle<()> {
        let this = self.clone();
        let period = self.inner.check_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = this.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if this.is_busy() {
                    this.note(LogLevel::Debug, "periodic check skipped; updater busy");
                    continue;
                }
                match this.check_for_update().await {
                    Ok(_) | Err(UpdateError::Busy(_)) => {}
                    Err(err) => hatch_debug!("periodic update check failed: {err}"),
                }
            }
            hatch_debug!("periodic update checks stopped");
        })
    }

    /// Wait for a scheduled apply step to finish.
    pub async fn join_apply(&self) {
        let handle = self.inner.apply_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn acquire<T>(
        &self,
        phase: Option<UpdatePhase>,
        precheck: impl FnOnce(&Shared) -> Result<T>,
    ) -> Result<(BusyGuard, T)> {
        let outcome = {
            let mut shared = self.inner.shared.lock();
            let current = shared.state.updater_phase;
            let staging_held = shared.cleaning && phase.is_some_and(UpdatePhase::owns_staging);
            if shared.state.updater_updating || current == UpdatePhase::Restarting || staging_held {
                Err(UpdateError::Busy(current))
            } else {
                precheck(&shared).map(|value| {
                    shared.state.updater_updating = true;
                    if let Some(phase) = phase {
                        shared.state.updater_phase = phase;
                    }
                    (current, value)
                })
            }
        };
        match outcome {
            Ok((previous, value)) => {
                if let Some(phase) = phase {
                    self.announce_phase(phase);
                }
                let guard = BusyGuard {
                    inner: self.inner.clone(),
                    previous,
                };
                Ok((guard, value))
            }
            Err(err) => Err(self.reject(err)),
        }
    }

    fn acquire_staging(&self) -> Result<CleaningGuard> {
        {
            let mut shared = self.inner.shared.lock();
            let current = shared.state.updater_phase;
            if shared.cleaning || current.owns_staging() {
                drop(shared);
                return Err(self.reject(UpdateError::Busy(current)));
            }
            shared.cleaning = true;
        }
        Ok(CleaningGuard {
            inner: self.inner.clone(),
        })
    }

    fn reject(&self, err: UpdateError) -> UpdateError {
        self.note(LogLevel::Error, format!("request rejected: {err}"));
        err
    }

    async fn fetch_listing(&self) -> Result<ReleaseListing> {
        let source = &self.inner.source;
        let target = &self.inner.target;
        self.inner
            .retry
            .run(
                &self.inner.shutdown,
                |_| async move { source.fetch_latest(target).await.map_err(UpdateError::from) },
                |attempt, err, delay| self.note_retry("release check", attempt, err, delay),
            )
            .await
    }

    async fn stage(&self, listing: &ReleaseListing) -> Result<StagedArtifact> {
        let asset = &listing.asset;
        self.inner.staging.ensure()?;
        let dest = self.inner.staging.artifact_path(asset);

        let fetcher = &self.inner.fetcher;
        let cancel = &self.inner.shutdown;
        let dest_path = dest.as_path();
        let bytes = self
            .inner
            .retry
            .run(
                cancel,
                |_| async move {
                    fetcher
                        .fetch(asset, dest_path, cancel)
                        .await
                        .map_err(UpdateError::from)
                },
                |attempt, err, delay| self.note_retry("download", attempt, err, delay),
            )
            .await?;
        self.note(
            LogLevel::Info,
            format!("downloaded {bytes} bytes of {} to {}", asset.version, dest.display()),
        );

        self.set_phase(UpdatePhase::Verifying);
        self.inner.verifier.verify(&dest, asset).await?;
        make_executable(&dest)?;

        let staged = StagedArtifact {
            path: dest,
            asset: asset.clone(),
            staged_at: Utc::now(),
        };
        {
            let mut shared = self.inner.shared.lock();
            shared.staged = Some(staged.clone());
            shared.state.updater_phase = UpdatePhase::StagedForApply;
        }
        self.persist();
        self.announce_phase(UpdatePhase::StagedForApply);
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_staged();
        }
        let ctx = LogContext::new()
            .with_channel(Channel::Updater.as_ref())
            .with_version(&asset.version)
            .with_phase("staged_for_apply");
        log_system_event(
            Some(&ctx),
            "update.staged",
            &format!("artifact staged at {}", staged.path.display()),
            SystemEventOutcome::Success,
        );
        self.note(LogLevel::Info, SHUTDOWN_NOTICE);
        Ok(staged)
    }

    fn schedule_apply(&self, guard: BusyGuard, staged: StagedArtifact) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(this.inner.apply_delay).await;
            if let Err(err) = this.apply_staged(&staged).await {
                this.discard_staged(&staged);
                this.fail(&err, Some(UpdatePhase::UpdateAvailable));
                this.persist();
            }
            drop(guard);
        });
        *self.inner.apply_task.lock() = Some(handle);
    }

    async fn apply_staged(&self, staged: &StagedArtifact) -> Result<()> {
        self.set_phase(UpdatePhase::Applying);
        let log_path = self.inner.shared.lock().state.updater_log_path.clone();
        let request = ApplyRequest {
            target: self.inner.update_target.clone(),
            artifact: staged.path.clone(),
            log_path,
        };
        let line = format!(
            "starting update to {}. replacing {} with {}",
            staged.asset.version,
            request.target.display(),
            request.artifact.display()
        );
        append_update_log(&request.log_path, &line)?;
        self.note(LogLevel::Info, line);

        self.inner.applier.apply(&request).await?;
        let ctx = LogContext::new()
            .with_channel(Channel::Updater.as_ref())
            .with_version(&staged.asset.version)
            .with_phase("applying");
        log_system_event(
            Some(&ctx),
            "update.applied",
            &format!("apply helper started for {}", request.target.display()),
            SystemEventOutcome::Success,
        );

        {
            let mut shared = self.inner.shared.lock();
            shared.staged = None;
            shared.state.updater_phase = UpdatePhase::Restarting;
        }
        self.persist();
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_applied();
        }
        self.announce_phase(UpdatePhase::Restarting);
        self.inner.restarter.restart();
        Ok(())
    }

    async fn recover_staged(&self) -> RecoveryOutcome {
        let Some(staged) = self.staged() else {
            return RecoveryOutcome::NothingStaged;
        };
        let version = staged.asset.version.clone();
        if !self.inner.staging.contains(&staged.path) {
            self.inner.shared.lock().staged = None;
            self.note(
                LogLevel::Warn,
                format!(
                    "ignoring staged record outside {}: {}",
                    self.inner.staging.root().display(),
                    staged.path.display()
                ),
            );
            return RecoveryOutcome::Discarded;
        }
        if !staged.path.exists() {
            self.inner.shared.lock().staged = None;
            self.note(
                LogLevel::Debug,
                format!("staged artifact for {version} no longer exists"),
            );
            return RecoveryOutcome::Discarded;
        }
        if !staged.asset.is_newer_than(&self.running_version()).unwrap_or(false) {
            self.discard_staged(&staged);
            self.note(LogLevel::Info, format!("update to {version} completed"));
            return RecoveryOutcome::AlreadyApplied;
        }

        let (guard, ()) = match self.acquire(Some(UpdatePhase::Verifying), |_| Ok(())) {
            Ok(acquired) => acquired,
            Err(_) => return RecoveryOutcome::NothingStaged,
        };
        self.note(
            LogLevel::Info,
            format!("found staged artifact for {version}; re-verifying against the latest release"),
        );
        let listing = match self.fetch_listing().await {
            Ok(listing) => listing,
            Err(err) => {
                self.note(
                    LogLevel::Warn,
                    format!("cannot confirm staged {version} is current ({err}); discarding it"),
                );
                self.discard_staged(&staged);
                return RecoveryOutcome::Discarded;
            }
        };
        if !listing.asset.same_identity(&staged.asset) {
            self.note(
                LogLevel::Warn,
                format!(
                    "staged {version} is stale; latest release is {}",
                    listing.asset.version
                ),
            );
            self.discard_staged(&staged);
            return RecoveryOutcome::Discarded;
        }
        if let Err(err) = self.inner.verifier.verify(&staged.path, &listing.asset).await {
            self.note(
                LogLevel::Warn,
                format!("staged {version} failed re-verification: {err}"),
            );
            self.discard_staged(&staged);
            return RecoveryOutcome::Discarded;
        }

        let resumed = StagedArtifact {
            asset: listing.asset.clone(),
            ..staged
        };
        {
            let mut shared = self.inner.shared.lock();
            shared.state.updater_update_link = Some(listing.asset.clone());
            shared.state.updater_changelog = listing.changelog.clone();
            shared.state.updater_released_at = listing.released_at;
            shared.state.updater_phase = UpdatePhase::StagedForApply;
            shared.available = Some(listing);
            shared.staged = Some(resumed.clone());
        }
        self.persist();
        self.announce_phase(UpdatePhase::StagedForApply);
        self.note(LogLevel::Info, SHUTDOWN_NOTICE);
        self.schedule_apply(guard, resumed);
        RecoveryOutcome::Resumed
    }

    fn discard_staged(&self, staged: &StagedArtifact) {
        match std::fs::remove_file(&staged.path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => hatch_warn!(
                "failed removing staged artifact {}: {err}",
                staged.path.display()
            ),
        }
        self.inner.shared.lock().staged = None;
        self.persist();
    }

    fn set_phase(&self, phase: UpdatePhase) {
        self.inner.shared.lock().state.updater_phase = phase;
        self.announce_phase(phase);
    }

    fn announce_phase(&self, phase: UpdatePhase) {
        self.inner.relay.publish(
            LogLevel::Debug,
            RelayEvent::UpdaterLog(
                LogData::new(format!("phase: {phase}")).with_field("phase", phase.to_string()),
            ),
        );
    }

    /// Publish a coordinator line and append it to the transcript.
    fn note(&self, level: LogLevel, msg: impl Into<String>) {
        let msg = msg.into();
        let phase = {
            let mut shared = self.inner.shared.lock();
            shared.state.updater_log.push(msg.clone());
            shared.state.updater_phase
        };
        self.inner.relay.publish(
            level,
            RelayEvent::UpdaterLog(LogData::new(msg).with_field("phase", phase.to_string())),
        );
    }

    fn note_retry(&self, step: &str, attempt: u32, err: &UpdateError, delay: Duration) {
        let ctx = LogContext::new()
            .with_channel(Channel::Updater.as_ref())
            .with_attempt(attempt);
        hatch_warn!(context = ctx, "{step} failed: {err}");
        self.note(
            LogLevel::Warn,
            format!(
                "{step} attempt {attempt} failed: {err}; retrying in {}ms",
                delay.as_millis()
            ),
        );
    }

    fn fail(&self, err: &UpdateError, resting: Option<UpdatePhase>) {
        let phase = {
            let mut shared = self.inner.shared.lock();
            let failed_in = shared.state.updater_phase;
            if let Some(resting) = resting {
                shared.state.updater_phase = resting;
            }
            failed_in.to_string()
        };
        let ctx = LogContext::new()
            .with_channel(Channel::Updater.as_ref())
            .with_phase(&phase);
        log_system_event(Some(&ctx), "update.failed", &err.to_string(), SystemEventOutcome::Fault);
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_failure(err.kind());
        }
        self.note(LogLevel::Error, err.to_string());
    }

    fn persist(&self) {
        let _writing = self.inner.persist_lock.lock();
        let snapshot = {
            let shared = self.inner.shared.lock();
            PersistedState {
                state: shared.state.clone(),
                staged: shared.staged.clone(),
            }
        };
        if let Err(err) = self.inner.store.save(&snapshot) {
            self.note(
                LogLevel::Warn,
                format!(
                    "failed to persist updater state to {}: {err}",
                    self.inner.store.path().display()
                ),
            );
        }
    }
}

fn append_update_log(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{} {line}", Utc::now().to_rfc3339())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use hatch_release::ReleaseError;
    use indexmap::IndexMap;
    use sha2::{Digest, Sha256};
    use tokio::sync::Notify;

    use super::*;

    const BODY_LEN: usize = 1024;

    fn body() -> Vec<u8> {
        (0..BODY_LEN).map(|n| (n % 256) as u8).collect()
    }

    fn listing(version: &str, payload: &[u8]) -> ReleaseListing {
        let asset = ReleaseAsset::new("linux", "amd64", "", version)
            .with_artefact_name("hatch.bin")
            .with_download_url("https://releases.example.com/hatch.bin")
            .with_checksum(hex::encode(Sha256::digest(payload)), None)
            .with_size(payload.len() as u64);
        ReleaseListing {
            changelog: format!("notes for {version}"),
            ..ReleaseListing::bare(asset)
        }
    }

    enum Reply {
        Listing(ReleaseListing),
        Network,
        NotFound,
    }

    struct FakeSource {
        replies: Mutex<VecDeque<Reply>>,
        last: Mutex<Option<ReleaseListing>>,
        calls: AtomicU32,
        delay: Duration,
    }

    impl FakeSource {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Self::slow(replies, Duration::ZERO)
        }

        fn slow(replies: Vec<Reply>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                last: Mutex::new(None),
                calls: AtomicU32::new(0),
                delay,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReleaseSource for FakeSource {
        async fn fetch_latest(&self, _target: &PlatformTarget) -> hatch_release::Result<ReleaseListing> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let reply = self.replies.lock().pop_front();
            match reply {
                Some(Reply::Listing(listing)) => {
                    *self.last.lock() = Some(listing.clone());
                    Ok(listing)
                }
                Some(Reply::Network) => Err(ReleaseError::Network("connection reset".into())),
                Some(Reply::NotFound) => Err(ReleaseError::NotFound("no release".into())),
                None => self
                    .last
                    .lock()
                    .clone()
                    .ok_or_else(|| ReleaseError::NotFound("no release".into())),
            }
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    struct FakeFetcher {
        payload: Vec<u8>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ArtifactFetcher for FakeFetcher {
        async fn fetch(
            &self,
            _asset: &ReleaseAsset,
            dest: &Path,
            _cancel: &CancellationToken,
        ) -> hatch_net::Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(dest, &self.payload).await?;
            Ok(self.payload.len() as u64)
        }
    }

    #[derive(Default)]
    struct FakeApplier {
        requests: Mutex<Vec<ApplyRequest>>,
    }

    #[async_trait]
    impl Applier for FakeApplier {
        async fn apply(&self, request: &ApplyRequest) -> Result<()> {
            self.requests.lock().push(request.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeRestarter {
        restarts: AtomicU32,
        notify: Notify,
    }

    impl Restarter for FakeRestarter {
        fn restart(&self) {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            self.notify.notify_one();
        }
    }

    struct Fixture {
        coordinator: UpdateCoordinator,
        source: Arc<FakeSource>,
        fetcher: Arc<FakeFetcher>,
        applier: Arc<FakeApplier>,
        restarter: Arc<FakeRestarter>,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn staging(&self) -> PathBuf {
            self.dir.path().join("staging")
        }

        fn state_path(&self) -> PathBuf {
            self.dir.path().join("state.json")
        }

        fn log_path(&self) -> PathBuf {
            self.dir.path().join("update.log")
        }
    }

    fn fixture(running: &str, source: Arc<FakeSource>, payload: Vec<u8>) -> Fixture {
        fixture_in(tempfile::tempdir().unwrap(), running, source, payload)
    }

    fn fixture_in(
        dir: tempfile::TempDir,
        running: &str,
        source: Arc<FakeSource>,
        payload: Vec<u8>,
    ) -> Fixture {
        let relay = EventRelay::new(256).unwrap();
        let fetcher = Arc::new(FakeFetcher {
            payload,
            calls: AtomicU32::new(0),
        });
        let applier = Arc::new(FakeApplier::default());
        let restarter = Arc::new(FakeRestarter::default());
        let coordinator = UpdateCoordinator::new(CoordinatorParts {
            source: source.clone(),
            fetcher: fetcher.clone(),
            verifier: Verifier::new(IndexMap::new(), false, relay.clone()),
            applier: applier.clone(),
            restarter: restarter.clone(),
            store: StateStore::new(dir.path().join("state.json")),
            staging: StagingArea::new(dir.path().join("staging")),
            relay,
            retry: RetryPolicy::new(2, Duration::from_millis(1)),
            target: PlatformTarget::new("linux", "amd64", ""),
            running_version: running.to_owned(),
            check_interval: Duration::from_secs(48 * 60 * 60),
            log_path: dir.path().join("update.log"),
            update_target: dir.path().join("bin").join("hatch"),
            apply_delay: Duration::from_millis(10),
            metrics: None,
            shutdown: CancellationToken::new(),
        });
        Fixture {
            coordinator,
            source,
            fetcher,
            applier,
            restarter,
            dir,
        }
    }

    #[tokio::test]
    async fn check_uses_semver_ordering() {
        let fx = fixture(
            "1.9.0",
            FakeSource::new(vec![
                Reply::Listing(listing("1.10.0", &body())),
                Reply::Listing(listing("1.9.0", &body())),
                Reply::Listing(listing("1.2.0", &body())),
            ]),
            body(),
        );

        let newer = fx.coordinator.check_for_update().await.unwrap();
        assert!(newer.is_update_available());
        assert_eq!(
            fx.coordinator.updater_state_get().updater_phase,
            UpdatePhase::UpdateAvailable
        );

        let equal = fx.coordinator.check_for_update().await.unwrap();
        assert!(!equal.is_update_available());
        assert_eq!(equal.asset().version, "1.9.0");

        let older = fx.coordinator.check_for_update().await.unwrap();
        assert!(!older.is_update_available());

        let state = fx.coordinator.updater_state_get();
        assert_eq!(state.updater_phase, UpdatePhase::UpToDate);
        assert!(state.updater_last_time_checked_update.is_some());
        assert_eq!(state.updater_update_link.unwrap().version, "1.2.0");
        assert_eq!(state.updater_changelog, "notes for 1.2.0");
        assert!(!state.updater_updating);
    }

    #[tokio::test]
    async fn start_without_available_update_touches_nothing() {
        let fx = fixture("1.1.0", FakeSource::new(vec![]), body());
        let err = fx.coordinator.start_update().await.unwrap_err();
        assert!(matches!(err, UpdateError::NoUpdateAvailable));
        assert_eq!(fx.source.calls(), 0);
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 0);
        assert!(!fx.staging().exists());
        assert_eq!(fx.coordinator.updater_state_get().updater_phase, UpdatePhase::Idle);
    }

    #[tokio::test]
    async fn concurrent_requests_are_rejected_as_busy() {
        let fx = fixture(
            "1.1.0",
            FakeSource::slow(
                vec![Reply::Listing(listing("1.2.0", &body()))],
                Duration::from_millis(300),
            ),
            body(),
        );
        let first = {
            let coordinator = fx.coordinator.clone();
            tokio::spawn(async move { coordinator.check_for_update().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(fx.coordinator.is_busy());
        assert!(matches!(
            fx.coordinator.check_for_update().await,
            Err(UpdateError::Busy(UpdatePhase::Checking))
        ));
        assert!(matches!(
            fx.coordinator.start_update().await,
            Err(UpdateError::Busy(_))
        ));
        assert_eq!(
            fx.coordinator.updater_state_get().updater_phase,
            UpdatePhase::Checking
        );

        assert!(first.await.unwrap().unwrap().is_update_available());
        assert_eq!(fx.source.calls(), 1);
        assert!(!fx.coordinator.is_busy());
    }

    #[tokio::test]
    async fn cleanup_runs_during_background_check() {
        let fx = fixture(
            "1.1.0",
            FakeSource::slow(
                vec![Reply::Listing(listing("1.2.0", &body()))],
                Duration::from_millis(300),
            ),
            body(),
        );
        std::fs::create_dir_all(fx.staging()).unwrap();
        std::fs::write(fx.staging().join("leftover.part"), b"old").unwrap();
        std::fs::write(fx.log_path(), b"helper output\n").unwrap();

        let report = fx.coordinator.hydrate().await.unwrap();
        assert!(report.background_check);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            fx.coordinator.updater_state_get().updater_phase,
            UpdatePhase::Checking
        );

        let cleaned = fx.coordinator.post_install_cleanup().await.unwrap();
        assert_eq!(cleaned.removed_entries, 1);
        assert!(cleaned.removed_log);
        assert_eq!(
            fx.coordinator.updater_state_get().updater_phase,
            UpdatePhase::Checking
        );

        for _ in 0..100 {
            if !fx.coordinator.is_busy() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            fx.coordinator.updater_state_get().updater_phase,
            UpdatePhase::UpdateAvailable
        );
    }

    #[tokio::test]
    async fn busy_rejection_is_published_as_error() {
        let fx = fixture(
            "1.1.0",
            FakeSource::slow(
                vec![Reply::Listing(listing("1.2.0", &body()))],
                Duration::from_millis(200),
            ),
            body(),
        );
        let mut updates = fx.coordinator.relay().subscribe(Channel::Updater);
        let first = {
            let coordinator = fx.coordinator.clone();
            tokio::spawn(async move { coordinator.check_for_update().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            fx.coordinator.check_for_update().await,
            Err(UpdateError::Busy(UpdatePhase::Checking))
        ));
        first.await.unwrap().unwrap();

        let rejected: Vec<LogLevel> = std::iter::from_fn(|| updates.try_recv())
            .filter(|event| event.msg().starts_with("request rejected"))
            .map(|event| event.level)
            .collect();
        assert_eq!(rejected, vec![LogLevel::Error]);
    }

    #[tokio::test]
    async fn full_update_stages_and_restarts() {
        let fx = fixture(
            "1.1.0",
            FakeSource::new(vec![Reply::Listing(listing("1.2.0", &body()))]),
            body(),
        );
        let mut updates = fx.coordinator.relay().subscribe(Channel::Updater);

        assert!(fx.coordinator.check_for_update().await.unwrap().is_update_available());
        let staged = fx.coordinator.start_update().await.unwrap();
        assert_eq!(staged.path, fx.staging().join("hatch.bin"));
        assert_eq!(std::fs::read(&staged.path).unwrap().len(), BODY_LEN);
        assert_eq!(
            fx.coordinator.updater_state_get().updater_phase,
            UpdatePhase::StagedForApply
        );
        assert!(fx.coordinator.is_busy());
        assert!(matches!(
            fx.coordinator.post_install_cleanup().await,
            Err(UpdateError::Busy(UpdatePhase::StagedForApply))
        ));
        assert!(staged.path.exists());

        fx.restarter.notify.notified().await;
        fx.coordinator.join_apply().await;

        let requests = fx.applier.requests.lock().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].artifact, staged.path);
        assert_eq!(requests[0].log_path, fx.log_path());
        assert_eq!(fx.restarter.restarts.load(Ordering::SeqCst), 1);
        assert_eq!(
            fx.coordinator.updater_state_get().updater_phase,
            UpdatePhase::Restarting
        );
        assert!(std::fs::read_to_string(fx.log_path())
            .unwrap()
            .contains("starting update to 1.2.0"));

        let messages: Vec<String> = std::iter::from_fn(|| updates.try_recv())
            .map(|event| event.msg().to_owned())
            .collect();
        assert!(messages.iter().any(|m| m == SHUTDOWN_NOTICE));
        assert!(matches!(
            fx.coordinator.check_for_update().await,
            Err(UpdateError::Busy(UpdatePhase::Restarting))
        ));
    }

    #[tokio::test]
    async fn failed_apply_discards_artifact_and_keeps_update_available() {
        let relay = EventRelay::new(64).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let restarter = Arc::new(FakeRestarter::default());
        let coordinator = UpdateCoordinator::new(CoordinatorParts {
            source: FakeSource::new(vec![Reply::Listing(listing("1.2.0", &body()))]),
            fetcher: Arc::new(FakeFetcher {
                payload: body(),
                calls: AtomicU32::new(0),
            }),
            verifier: Verifier::new(IndexMap::new(), false, relay.clone()),
            applier: Arc::new(MissingHelperApplier),
            restarter: restarter.clone(),
            store: StateStore::new(dir.path().join("state.json")),
            staging: StagingArea::new(dir.path().join("staging")),
            relay,
            retry: RetryPolicy::none(),
            target: PlatformTarget::new("linux", "amd64", ""),
            running_version: "1.1.0".into(),
            check_interval: Duration::from_secs(60 * 60),
            log_path: dir.path().join("update.log"),
            update_target: dir.path().join("hatch"),
            apply_delay: Duration::ZERO,
            metrics: None,
            shutdown: CancellationToken::new(),
        });

        coordinator.check_for_update().await.unwrap();
        let staged = coordinator.start_update().await.unwrap();
        coordinator.join_apply().await;

        assert!(!staged.path.exists());
        assert!(coordinator.staged().is_none());
        let state = coordinator.updater_state_get();
        assert_eq!(state.updater_phase, UpdatePhase::UpdateAvailable);
        assert!(!state.updater_updating);
        assert!(state
            .updater_log
            .iter()
            .any(|line| line.contains("no apply helper configured")));
        assert_eq!(restarter.restarts.load(Ordering::SeqCst), 0);
        let reloaded = StateStore::new(dir.path().join("state.json"))
            .load()
            .unwrap()
            .unwrap();
        assert!(reloaded.staged.is_none());
    }

    #[tokio::test]
    async fn checksum_mismatch_discards_and_returns_to_idle() {
        let fx = fixture(
            "1.1.0",
            FakeSource::new(vec![Reply::Listing(listing("1.2.0", &body()))]),
            b"tampered".to_vec(),
        );
        fx.coordinator.check_for_update().await.unwrap();

        let err = fx.coordinator.start_update().await.unwrap_err();
        assert!(matches!(err, UpdateError::ChecksumMismatch { .. }));
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(!fx.staging().join("hatch.bin").exists());
        let state = fx.coordinator.updater_state_get();
        assert_eq!(state.updater_phase, UpdatePhase::Idle);
        assert!(!state.updater_updating);
        assert!(fx.coordinator.staged().is_none());
        assert!(matches!(
            fx.coordinator.start_update().await,
            Err(UpdateError::NoUpdateAvailable)
        ));
    }

    #[tokio::test]
    async fn declared_signature_type_without_signature_fails_update() {
        let mut unsigned = listing("1.2.0", &body());
        unsigned.asset.signature_type = Some("ed25519".into());
        unsigned.asset.signature = Some(String::new());
        let fx = fixture("1.1.0", FakeSource::new(vec![Reply::Listing(unsigned)]), body());
        fx.coordinator.check_for_update().await.unwrap();

        let err = fx.coordinator.start_update().await.unwrap_err();
        assert!(matches!(err, UpdateError::SignatureMissing(_)));
        assert!(!fx.staging().join("hatch.bin").exists());
        assert_eq!(fx.applier.requests.lock().len(), 0);
    }

    #[tokio::test]
    async fn network_failures_are_retried_then_surface() {
        let fx = fixture(
            "1.1.0",
            FakeSource::new(vec![
                Reply::Network,
                Reply::Listing(listing("1.2.0", &body())),
            ]),
            body(),
        );
        assert!(fx.coordinator.check_for_update().await.unwrap().is_update_available());
        assert_eq!(fx.source.calls(), 2);

        let failing = fixture(
            "1.1.0",
            FakeSource::new(vec![Reply::Network, Reply::Network, Reply::Network, Reply::Network]),
            body(),
        );
        assert!(matches!(
            failing.coordinator.check_for_update().await,
            Err(UpdateError::Network(_))
        ));
        assert_eq!(failing.source.calls(), 3);
        let state = failing.coordinator.updater_state_get();
        assert_eq!(state.updater_phase, UpdatePhase::Idle);
        assert!(state.updater_last_time_checked_update.is_none());

        let missing = fixture("1.1.0", FakeSource::new(vec![Reply::NotFound]), body());
        assert!(matches!(
            missing.coordinator.check_for_update().await,
            Err(UpdateError::NotFound(_))
        ));
        assert_eq!(missing.source.calls(), 1);
    }

    #[tokio::test]
    async fn post_install_cleanup_is_idempotent() {
        let fx = fixture("1.2.0", FakeSource::new(vec![]), body());
        std::fs::create_dir_all(fx.staging()).unwrap();
        std::fs::write(fx.staging().join("hatch.bin"), b"old").unwrap();
        std::fs::write(fx.log_path(), b"helper output\n").unwrap();

        let first = fx.coordinator.post_install_cleanup().await.unwrap();
        assert_eq!(first.removed_entries, 1);
        assert!(first.removed_log);

        let second = fx.coordinator.post_install_cleanup().await.unwrap();
        assert_eq!(
            second,
            CleanupReport {
                removed_entries: 0,
                removed_log: false
            }
        );
        assert!(!fx.log_path().exists());
        assert_eq!(std::fs::read_dir(fx.staging()).unwrap().count(), 0);
    }

    fn persist_staged(fx: &Fixture, asset: ReleaseAsset, payload: &[u8]) -> PathBuf {
        std::fs::create_dir_all(fx.staging()).unwrap();
        let path = fx.staging().join("hatch.bin");
        std::fs::write(&path, payload).unwrap();
        let mut state = UpdaterState::new("1.1.0", 2880, fx.log_path());
        state.updater_last_time_checked_update = Some(Utc::now());
        StateStore::new(fx.state_path())
            .save(&PersistedState {
                state,
                staged: Some(StagedArtifact {
                    path: path.clone(),
                    asset,
                    staged_at: Utc::now(),
                }),
            })
            .unwrap();
        path
    }

    #[tokio::test]
    async fn crash_recovery_discards_stale_artifact() {
        let fx = fixture(
            "1.1.0",
            FakeSource::new(vec![Reply::Listing(listing("1.2.0", b"republished bytes"))]),
            body(),
        );
        let path = persist_staged(&fx, listing("1.2.0", &body()).asset, &body());

        let report = fx.coordinator.hydrate().await.unwrap();
        assert_eq!(report.recovery, RecoveryOutcome::Discarded);
        assert!(!path.exists());
        assert!(fx.coordinator.staged().is_none());
        let state = fx.coordinator.updater_state_get();
        assert_eq!(state.updater_phase, UpdatePhase::Idle);
        assert!(!state.updater_updating);
        assert_eq!(fx.applier.requests.lock().len(), 0);
        let reloaded = StateStore::new(fx.state_path()).load().unwrap().unwrap();
        assert!(reloaded.staged.is_none());
    }

    #[tokio::test]
    async fn crash_recovery_ignores_record_outside_staging() {
        let fx = fixture(
            "1.1.0",
            FakeSource::new(vec![Reply::Listing(listing("1.2.0", &body()))]),
            body(),
        );
        let staged = persist_staged(&fx, listing("1.2.0", &body()).asset, &body());
        let outside = fx.dir.path().join("hatch.bin");
        std::fs::rename(&staged, &outside).unwrap();
        let mut persisted = StateStore::new(fx.state_path()).load().unwrap().unwrap();
        if let Some(record) = persisted.staged.as_mut() {
            record.path = outside.clone();
        }
        StateStore::new(fx.state_path()).save(&persisted).unwrap();

        let report = fx.coordinator.hydrate().await.unwrap();
        assert_eq!(report.recovery, RecoveryOutcome::Discarded);
        assert!(outside.exists());
        assert!(fx.coordinator.staged().is_none());
        assert_eq!(fx.applier.requests.lock().len(), 0);
    }

    #[tokio::test]
    async fn crash_recovery_discards_when_source_unreachable() {
        let fx = fixture(
            "1.1.0",
            FakeSource::new(vec![Reply::Network, Reply::Network, Reply::Network]),
            body(),
        );
        let path = persist_staged(&fx, listing("1.2.0", &body()).asset, &body());

        let report = fx.coordinator.hydrate().await.unwrap();
        assert_eq!(report.recovery, RecoveryOutcome::Discarded);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn crash_recovery_resumes_verified_artifact() {
        let fx = fixture(
            "1.1.0",
            FakeSource::new(vec![Reply::Listing(listing("1.2.0", &body()))]),
            body(),
        );
        let path = persist_staged(&fx, listing("1.2.0", &body()).asset, &body());

        let report = fx.coordinator.hydrate().await.unwrap();
        assert_eq!(report.recovery, RecoveryOutcome::Resumed);
        assert!(!report.background_check);

        fx.restarter.notify.notified().await;
        fx.coordinator.join_apply().await;
        assert_eq!(fx.applier.requests.lock()[0].artifact, path);
    }

    #[tokio::test]
    async fn hydrate_after_apply_reads_log_and_drops_artifact() {
        let fx = fixture("1.2.0", FakeSource::new(vec![]), body());
        let path = persist_staged(&fx, listing("1.2.0", &body()).asset, &body());
        std::fs::write(fx.log_path(), "replaced binary\nrelaunched\n").unwrap();

        let report = fx.coordinator.hydrate().await.unwrap();
        assert_eq!(report.recovery, RecoveryOutcome::AlreadyApplied);
        assert!(report.previous_update_log);
        assert!(!report.background_check);
        assert!(!path.exists());

        let state = fx.coordinator.updater_state_get();
        assert_eq!(state.updater_version, "1.2.0");
        assert!(state.updater_log.iter().any(|line| line == "relaunched"));
        assert!(state.updater_last_time_checked_update.is_some());
    }

    #[tokio::test]
    async fn hydrate_checks_in_background_when_due() {
        let source = FakeSource::new(vec![Reply::Listing(listing("1.0.0", &body()))]);
        let fx = fixture("1.1.0", source, body());

        let report = fx.coordinator.hydrate().await.unwrap();
        assert_eq!(report.recovery, RecoveryOutcome::NothingStaged);
        assert!(report.background_check);

        for _ in 0..50 {
            if fx.coordinator.updater_state_get().updater_phase == UpdatePhase::UpToDate {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            fx.coordinator.updater_state_get().updater_phase,
            UpdatePhase::UpToDate
        );
    }

    #[tokio::test]
    async fn corrupt_state_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("state.json"), b"{not json").unwrap();
        let fx = fixture_in(
            dir,
            "1.1.0",
            FakeSource::new(vec![Reply::Listing(listing("1.0.0", &body()))]),
            body(),
        );
        let report = fx.coordinator.hydrate().await.unwrap();
        assert_eq!(report.recovery, RecoveryOutcome::NothingStaged);
        assert!(fx
            .coordinator
            .updater_state_get()
            .updater_log
            .iter()
            .any(|line| line.contains("ignoring unreadable state file")));
    }

    #[tokio::test]
    async fn periodic_checks_run_until_shutdown() {
        let relay = EventRelay::new(64).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::new(vec![Reply::Listing(listing("1.0.0", &body()))]);
        let shutdown = CancellationToken::new();
        let coordinator = UpdateCoordinator::new(CoordinatorParts {
            source: source.clone(),
            fetcher: Arc::new(FakeFetcher {
                payload: body(),
                calls: AtomicU32::new(0),
            }),
            verifier: Verifier::new(IndexMap::new(), false, relay.clone()),
            applier: Arc::new(FakeApplier::default()),
            restarter: Arc::new(FakeRestarter::default()),
            store: StateStore::new(dir.path().join("state.json")),
            staging: StagingArea::new(dir.path().join("staging")),
            relay,
            retry: RetryPolicy::none(),
            target: PlatformTarget::new("linux", "amd64", ""),
            running_version: "1.1.0".into(),
            check_interval: Duration::from_millis(20),
            log_path: dir.path().join("update.log"),
            update_target: dir.path().join("hatch"),
            apply_delay: Duration::ZERO,
            metrics: None,
            shutdown: shutdown.clone(),
        });

        let task = coordinator.spawn_periodic_checks();
        for _ in 0..100 {
            if source.calls() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        task.await.unwrap();
        assert!(source.calls() >= 2);
    }
}
