//! ---
//! hatch_section: "02-messaging-data-model"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Typed multi-channel event relay."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter};

/// Subsystem channels of the relay.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Channel {
    /// Base/system messages of the relay itself.
    Relay,
    /// Download progress and network diagnostics.
    Net,
    /// Release source lookups.
    Releaser,
    /// Update coordinator lifecycle.
    Updater,
}

impl Channel {
    /// Number of channels; used to size per-channel tables.
    pub const COUNT: usize = 4;

    pub(crate) fn index(self) -> usize {
        match self {
            Channel::Relay => 0,
            Channel::Net => 1,
            Channel::Releaser => 2,
            Channel::Updater => 3,
        }
    }
}

/// Severity carried by every event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    /// Very fine grained diagnostics.
    Trace,
    /// Diagnostics.
    Debug,
    /// Normal progress.
    Info,
    /// Recoverable anomalies.
    Warn,
    /// Failures surfaced to the caller.
    Error,
}
