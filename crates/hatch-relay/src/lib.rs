//! ---
//! hatch_section: "02-messaging-data-model"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Typed multi-channel event relay."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Observer-facing event stream of the updater.
//!
//! Every publisher receives an [`EventRelay`] handle explicitly; there is no
//! process-wide store. Observers subscribe per [`Channel`] and receive
//! [`LogEvent`]s in publish order for that channel.

pub mod bus;
pub mod channel;
pub mod event;
pub mod metrics;
pub mod transcript;

/// Shared result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors raised while constructing or consuming the relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Channel buffers must hold at least one event and stay within bounds.
    #[error("invalid relay channel capacity {0} (expected 1..={max})", max = bus::MAX_CHANNEL_CAPACITY)]
    InvalidCapacity(usize),
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub use bus::{EventRelay, Subscription};
pub use channel::{Channel, LogLevel};
pub use event::{DownloadProgress, LogData, LogEvent, RelayEvent, VersionAvailable};
pub use metrics::RelayMetricsExporter;
pub use transcript::TranscriptStore;
