//! ---
//! hatch_section: "03-logging"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Structured logging adapters and sinks."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Operator-facing logging for the updater: subscriber setup for the CLI and
//! long-running processes plus context-enriched event macros.

use anyhow::Result;
use hatch_common::config::{LogFormat, LoggingConfig};
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

pub mod macros;

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "HATCH_LOG";

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Initialize a baseline stderr subscriber suitable for CLI invocations.
pub fn init() {
    let _ = Registry::default()
        .with(env_filter("info"))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Initialize stdout and daily-rolling file logging for a long-running process.
///
/// `HATCH_LOG` overrides the filter directive; when unset `RUST_LOG` is
/// honoured, finally defaulting to `debug`.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)?;
    let prefix = config
        .file_prefix
        .clone()
        .unwrap_or_else(|| service_name.to_owned());

    let file_appender = daily(&config.directory, format!("{prefix}-{service_name}.log"));
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer)
        .boxed();

    tracing_subscriber::registry()
        .with(env_filter("debug"))
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(service = %service_name, log_dir = %config.directory.display(), format = %config.format, "tracing initialised");
    Ok(())
}

fn env_filter(fallback: &str) -> EnvFilter {
    match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("invalid {LOG_ENV} directive ({err}); defaulting to {fallback}");
            EnvFilter::new(fallback)
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
    }
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Relay channel the event relates to.
    pub channel: Option<&'a str>,
    /// Release version under consideration.
    pub version: Option<&'a str>,
    /// Coordinator phase at the time of the event.
    pub phase: Option<&'a str>,
    /// Retry attempt number.
    pub attempt: Option<u32>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a relay channel name.
    pub fn with_channel(mut self, channel: &'a str) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Attach a release version.
    pub fn with_version(mut self, version: &'a str) -> Self {
        self.version = Some(version);
        self
    }

    /// Attach a coordinator phase.
    pub fn with_phase(mut self, phase: &'a str) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Attach a retry attempt.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

/// High-level outcome used when emitting lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEventOutcome {
    /// The operation completed successfully.
    Success,
    /// The operation failed or was aborted.
    Fault,
}

impl SystemEventOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            SystemEventOutcome::Success => "success",
            SystemEventOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized lifecycle event with a success/fault outcome.
pub fn log_system_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: SystemEventOutcome,
) {
    let ctx = context.cloned().unwrap_or_default();
    match outcome {
        SystemEventOutcome::Success => hatch_info!(
            context = ctx,
            "{event} outcome={} {message}",
            outcome.as_str()
        ),
        SystemEventOutcome::Fault => hatch_error!(
            context = ctx,
            "{event} outcome={} {message}",
            outcome.as_str()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_emit_without_panic() {
        init();
        let ctx = LogContext::new()
            .with_channel("updater")
            .with_version("1.2.0")
            .with_attempt(2);
        hatch_info!(context = ctx.clone(), "release staged");
        hatch_debug!("debug message");
        hatch_warn!(context = ctx.clone(), "retrying in {}ms", 250);
        hatch_error!(context = ctx, "error code: {}", 42);
    }

    #[test]
    fn system_event_helper_emits() {
        init();
        let ctx = LogContext::new().with_phase("staged_for_apply");
        log_system_event(
            Some(&ctx),
            "update.staged",
            "artifact verified",
            SystemEventOutcome::Success,
        );
        log_system_event(
            None,
            "update.staged",
            "verification failed",
            SystemEventOutcome::Fault,
        );
    }

    #[test]
    fn init_tracing_creates_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            directory: dir.path().join("logs"),
            format: LogFormat::Pretty,
            file_prefix: Some("test".to_owned()),
        };
        init_tracing("hatch-test", &config).unwrap();
        assert!(config.directory.is_dir());
    }
}
