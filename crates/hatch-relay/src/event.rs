//! ---
//! hatch_section: "02-messaging-data-model"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Typed multi-channel event relay."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::channel::{Channel, LogLevel};

/// Free-form log payload; `msg` is always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogData {
    /// Human readable message.
    pub msg: String,
    /// Additional structured fields.
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, JsonValue>,
}

impl LogData {
    /// Construct a payload carrying only a message.
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            fields: Map::new(),
        }
    }

    /// Attach an extra structured field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

impl From<&str> for LogData {
    fn from(msg: &str) -> Self {
        Self::new(msg)
    }
}

impl From<String> for LogData {
    fn from(msg: String) -> Self {
        Self::new(msg)
    }
}

/// One `(bytes_written, total_bytes)` sample of a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    /// Human readable progress line.
    pub msg: String,
    /// File name being downloaded.
    pub file: String,
    /// Bytes written to the staging file so far.
    pub bytes_written: u64,
    /// Expected size; zero when unknown.
    pub total_bytes: u64,
}

impl DownloadProgress {
    /// Build a sample and its message.
    pub fn new(file: impl Into<String>, bytes_written: u64, total_bytes: u64) -> Self {
        let file = file.into();
        let msg = if total_bytes > 0 {
            format!("{file}: {bytes_written}/{total_bytes} bytes")
        } else {
            format!("{file}: {bytes_written} bytes")
        };
        Self {
            msg,
            file,
            bytes_written,
            total_bytes,
        }
    }

    /// Whether this sample marks the end of the transfer.
    pub fn is_complete(&self) -> bool {
        self.total_bytes > 0 && self.bytes_written >= self.total_bytes
    }
}

/// Announcement that a strictly newer release exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionAvailable {
    /// Human readable announcement.
    pub msg: String,
    /// Version of the newer release.
    pub version: String,
    /// Publication time reported by the release source.
    #[serde(default)]
    pub released_at: Option<DateTime<Utc>>,
    /// Release notes.
    #[serde(default)]
    pub changelog: String,
    /// Landing page of the release.
    #[serde(default)]
    pub release_url: Option<String>,
}

/// Closed set of relay topics. Each topic belongs to exactly one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "relay", content = "data")]
pub enum RelayEvent {
    /// Base/system log line.
    #[serde(rename = "relay-log")]
    RelayLog(LogData),
    /// Download progress sample.
    #[serde(rename = "network-download-progress")]
    NetDownload(DownloadProgress),
    /// Network diagnostic line.
    #[serde(rename = "network-log")]
    NetLog(LogData),
    /// Release source diagnostic line.
    #[serde(rename = "release-log")]
    ReleaseLog(LogData),
    /// Coordinator lifecycle line.
    #[serde(rename = "coordinator-log")]
    UpdaterLog(LogData),
    /// A newer version was found.
    #[serde(rename = "version-available")]
    VersionAvailable(VersionAvailable),
}

impl RelayEvent {
    /// Plain log line on the given channel.
    pub fn log(channel: Channel, data: impl Into<LogData>) -> Self {
        let data = data.into();
        match channel {
            Channel::Relay => RelayEvent::RelayLog(data),
            Channel::Net => RelayEvent::NetLog(data),
            Channel::Releaser => RelayEvent::ReleaseLog(data),
            Channel::Updater => RelayEvent::UpdaterLog(data),
        }
    }

    /// Channel the topic is delivered on.
    pub fn channel(&self) -> Channel {
        match self {
            RelayEvent::RelayLog(_) => Channel::Relay,
            RelayEvent::NetDownload(_) | RelayEvent::NetLog(_) => Channel::Net,
            RelayEvent::ReleaseLog(_) => Channel::Releaser,
            RelayEvent::UpdaterLog(_) | RelayEvent::VersionAvailable(_) => Channel::Updater,
        }
    }

    /// Wire name of the sub-topic.
    pub fn topic(&self) -> &'static str {
        match self {
            RelayEvent::RelayLog(_) => "relay-log",
            RelayEvent::NetDownload(_) => "network-download-progress",
            RelayEvent::NetLog(_) => "network-log",
            RelayEvent::ReleaseLog(_) => "release-log",
            RelayEvent::UpdaterLog(_) => "coordinator-log",
            RelayEvent::VersionAvailable(_) => "version-available",
        }
    }

    /// Transcript key observers file the message under.
    pub fn reference(&self) -> &'static str {
        match self {
            RelayEvent::RelayLog(_) => "relay.log",
            RelayEvent::NetDownload(_) => "net.download",
            RelayEvent::NetLog(_) => "net.log",
            RelayEvent::ReleaseLog(_) => "release.log",
            RelayEvent::UpdaterLog(_) => "updater.log",
            RelayEvent::VersionAvailable(_) => "updater.new_version",
        }
    }

    /// The `msg` field of the payload.
    pub fn msg(&self) -> &str {
        match self {
            RelayEvent::RelayLog(data)
            | RelayEvent::NetLog(data)
            | RelayEvent::ReleaseLog(data)
            | RelayEvent::UpdaterLog(data) => &data.msg,
            RelayEvent::NetDownload(progress) => &progress.msg,
            RelayEvent::VersionAvailable(available) => &available.msg,
        }
    }
}

/// Envelope delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Unique identifier for deduplication by observers.
    pub id: Uuid,
    /// Channel the event was published on.
    pub channel: Channel,
    /// Severity.
    pub level: LogLevel,
    /// Publication time.
    pub timestamp: DateTime<Utc>,
    /// Topic and payload.
    #[serde(flatten)]
    pub event: RelayEvent,
}

impl LogEvent {
    /// Wrap a topic payload in a fresh envelope.
    pub fn new(level: LogLevel, event: RelayEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: event.channel(),
            level,
            timestamp: Utc::now(),
            event,
        }
    }

    /// Shortcut for the payload message.
    pub fn msg(&self) -> &str {
        self.event.msg()
    }
}
