//! ---
//! hatch_section: "05-networking"
//! hatch_subsection: "binary"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Control CLI driving the update coordinator."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use hatch_common::config::{AppConfig, DEFAULT_CONFIG_CANDIDATES};
use hatch_common::VersionInfo;
use hatch_core::{CoordinatorParts, StateStore, UpdateCoordinator, UpdateMetrics, UpdaterState};
use hatch_relay::metrics::RelayMetricsExporter;
use hatch_relay::transcript::TranscriptStore;
use hatch_relay::{Channel, EventRelay};
use prometheus::Registry;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod metrics;

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "Hatch self-update control utility",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", global = true, help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print extended version information and exit"
    )]
    version: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Print the persisted updater state")]
    State,
    #[command(about = "Check the release source for a newer version")]
    Check,
    #[command(about = "Stage the latest release and hand over to the apply helper")]
    Update,
    #[command(about = "Remove staging leftovers and the helper log")]
    Cleanup,
    #[command(about = "Recover state and check periodically until interrupted")]
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, value_name = "ADDR", help = "Serve Prometheus metrics on this address")]
    metrics_addr: Option<SocketAddr>,

    #[arg(long, help = "Print relay events to stdout as JSON lines")]
    events: bool,

    #[arg(long, value_name = "FILE", help = "Write the collected log transcript as JSON on shutdown")]
    transcript: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.version {
        println!("{}", VersionInfo::current().extended());
        return Ok(());
    }
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let config = load_config(cli.config.as_ref())?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("unable to start tokio runtime")?;
    runtime.block_on(execute(command, config))
}

fn load_config(explicit: Option<&PathBuf>) -> Result<AppConfig> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.clone());
    }
    candidates.extend(DEFAULT_CONFIG_CANDIDATES.iter().map(PathBuf::from));
    AppConfig::load(&candidates)
}

async fn execute(command: Commands, config: AppConfig) -> Result<()> {
    match command {
        Commands::Run(args) => run(config, args).await,
        Commands::State => {
            hatch_logging::init();
            print_state(&config)
        }
        Commands::Check => one_shot(OneShot::Check, config).await,
        Commands::Update => one_shot(OneShot::Update, config).await,
        Commands::Cleanup => one_shot(OneShot::Cleanup, config).await,
    }
}

#[derive(Debug, Clone, Copy)]
enum OneShot {
    Check,
    Update,
    Cleanup,
}

fn print_state(config: &AppConfig) -> Result<()> {
    let store = StateStore::new(&config.updater.state_path);
    let persisted = store
        .load()
        .with_context(|| format!("unable to read state file {}", store.path().display()))?;
    match persisted {
        Some(persisted) => print_json(&persisted),
        None => print_json(&UpdaterState::new(
            config.updater.running_version(&VersionInfo::current().semver),
            config.updater.check_interval_minutes,
            config.updater.log_path.clone(),
        )),
    }
}

async fn one_shot(action: OneShot, config: AppConfig) -> Result<()> {
    hatch_logging::init();
    let relay = EventRelay::new(config.relay.channel_capacity)?;
    let shutdown = CancellationToken::new();
    let coordinator =
        UpdateCoordinator::new(CoordinatorParts::from_config(&config, relay, shutdown.clone())?);
    let _ctrl_c = cancel_on_ctrl_c(shutdown);

    match action {
        OneShot::Check => print_json(&coordinator.check_for_update().await?),
        OneShot::Cleanup => print_json(&coordinator.post_install_cleanup().await?),
        OneShot::Update => {
            let outcome = coordinator.check_for_update().await?;
            if !outcome.is_update_available() {
                return print_json(&outcome);
            }
            let staged = coordinator.start_update().await?;
            print_json(&staged)?;
            coordinator.join_apply().await;
            // A successful apply exits the process before this point.
            let state = coordinator.updater_state_get();
            bail!(
                "update to {} was not applied (phase {})",
                staged.asset.version,
                state.updater_phase
            )
        }
    }
}

async fn run(config: AppConfig, args: RunArgs) -> Result<()> {
    hatch_logging::init_tracing("hatchctl", &config.logging)?;
    info!(banner = %VersionInfo::current().banner(), "hatchctl starting");

    let registry = Arc::new(Registry::new());
    let relay = EventRelay::with_metrics(
        config.relay.channel_capacity,
        RelayMetricsExporter::register(&registry)?,
    )?;
    let shutdown = CancellationToken::new();
    let parts = CoordinatorParts::from_config(&config, relay.clone(), shutdown.clone())?
        .with_metrics(UpdateMetrics::register(&registry)?);
    let coordinator = UpdateCoordinator::new(parts);

    if args.events {
        spawn_event_printers(&relay);
    }
    let transcript = args.transcript.as_ref().map(|_| {
        let store = TranscriptStore::new();
        store.attach(&relay);
        store
    });
    announce(
        &relay,
        format!(
            "hatchctl {} starting; release source {}",
            VersionInfo::current().semver,
            config.release.source
        ),
    );
    let server = match args.metrics_addr {
        Some(addr) => Some(metrics::spawn_http_server(registry.clone(), addr).await?),
        None => None,
    };
    if let Some(server) = &server {
        info!(address = %server.addr(), "metrics exposed at /metrics");
    }

    let report = coordinator.hydrate().await?;
    info!(
        recovery = ?report.recovery,
        previous_update_log = report.previous_update_log,
        background_check = report.background_check,
        "updater state restored"
    );
    let periodic = coordinator.spawn_periodic_checks();

    tokio::signal::ctrl_c()
        .await
        .context("unable to listen for shutdown signal")?;
    info!("shutdown requested");
    announce(&relay, "hatchctl shutting down");
    shutdown.cancel();
    if let Err(err) = periodic.await {
        warn!(error = %err, "periodic check task ended abnormally");
    }
    if let Some(server) = server {
        server.shutdown().await?;
    }
    if let (Some(store), Some(path)) = (&transcript, &args.transcript) {
        tokio::task::yield_now().await;
        write_transcript(store, path)?;
        info!(path = %path.display(), "log transcript written");
    }
    Ok(())
}

/// Publish a lifecycle line on the relay channel.
fn announce(relay: &EventRelay, msg: impl Into<String>) {
    relay.info(Channel::Relay, msg.into());
}

fn write_transcript(store: &TranscriptStore, path: &Path) -> Result<()> {
    let snapshot: BTreeMap<String, Vec<String>> = store
        .references()
        .into_iter()
        .map(|reference| {
            let entries = store.entries(&reference);
            (reference, entries)
        })
        .collect();
    let encoded = serde_json::to_string_pretty(&snapshot)?;
    std::fs::write(path, encoded)
        .with_context(|| format!("unable to write transcript {}", path.display()))
}

fn cancel_on_ctrl_c(shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    })
}

fn spawn_event_printers(relay: &EventRelay) -> Vec<JoinHandle<()>> {
    relay
        .subscribe_all()
        .into_iter()
        .map(|mut subscription| {
            tokio::spawn(async move {
                while let Some(event) = subscription.recv().await {
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(err) => warn!(error = %err, "unable to encode relay event"),
                    }
                }
            })
        })
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_subcommands() {
        Cli::command().debug_assert();
        let cli = Cli::parse_from(["hatchctl", "--config", "/tmp/h.toml", "run", "--events"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/h.toml")));
        match cli.command {
            Some(Commands::Run(args)) => {
                assert!(args.events);
                assert!(args.metrics_addr.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
        let cli = Cli::parse_from(["hatchctl", "-V"]);
        assert!(cli.version);
        assert!(cli.command.is_none());
    }

    #[tokio::test]
    async fn lifecycle_lines_reach_relay_channel_and_transcript() {
        let relay = EventRelay::new(16).unwrap();
        let mut lifecycle = relay.subscribe(Channel::Relay);
        let store = TranscriptStore::new();
        let handles = store.attach(&relay);

        announce(&relay, "hatchctl starting");
        announce(&relay, "hatchctl shutting down");
        let first = lifecycle.recv().await.unwrap();
        assert_eq!(first.channel, Channel::Relay);
        assert_eq!(first.msg(), "hatchctl starting");
        assert_eq!(lifecycle.recv().await.unwrap().msg(), "hatchctl shutting down");

        drop(relay);
        for handle in handles {
            handle.await.unwrap();
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.json");
        write_transcript(&store, &path).unwrap();
        let written: BTreeMap<String, Vec<String>> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let lines: Vec<&String> = written.values().flatten().collect();
        assert_eq!(lines, vec!["hatchctl starting", "hatchctl shutting down"]);
    }
}
