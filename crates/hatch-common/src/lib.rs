//! ---
//! hatch_section: "01-core-functionality"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Shared primitives and utilities for the updater runtime."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
//! Shared primitives for the Hatch workspace.
//! This crate exposes configuration loading, platform detection and
//! version metadata consumed by the updater crates and the CLI.

pub mod config;
pub mod platform;
pub mod version;

pub use config::{
    AppConfig, LoadedAppConfig, LogFormat, LoggingConfig, NetworkConfig, RelayConfig,
    ReleaseConfig, ReleaseSourceKind, UpdaterConfig, VerificationConfig,
};
pub use platform::PlatformTarget;
pub use version::VersionInfo;
