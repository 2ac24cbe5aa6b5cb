//! ---
//! hatch_section: "02-messaging-data-model"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Typed multi-channel event relay."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use prometheus::{IntCounterVec, Opts, Registry};

use crate::channel::Channel;

/// Prometheus metric handles for relay activity.
#[derive(Clone)]
pub struct RelayMetricsExporter {
    published: IntCounterVec,
    dropped: IntCounterVec,
}

impl RelayMetricsExporter {
    /// Register relay metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let published = IntCounterVec::new(
            Opts::new(
                "hatch_relay_events_published_total",
                "Events published on the relay",
            ),
            &["channel"],
        )?;
        let dropped = IntCounterVec::new(
            Opts::new(
                "hatch_relay_events_dropped_total",
                "Events overwritten before a lagging subscriber received them",
            ),
            &["channel"],
        )?;

        registry.register(Box::new(published.clone()))?;
        registry.register(Box::new(dropped.clone()))?;

        Ok(Self { published, dropped })
    }

    /// Record a published event.
    pub fn observe_published(&self, channel: Channel) {
        self.published.with_label_values(&[channel.as_ref()]).inc();
    }

    /// Record events a subscriber lost to overflow.
    pub fn observe_dropped(&self, channel: Channel, count: u64) {
        self.dropped
            .with_label_values(&[channel.as_ref()])
            .inc_by(count);
    }
}

impl std::fmt::Debug for RelayMetricsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayMetricsExporter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_exporter_records_counts() {
        let registry = Registry::new();
        let metrics = RelayMetricsExporter::register(&registry).expect("register metrics");
        metrics.observe_published(Channel::Updater);
        metrics.observe_dropped(Channel::Net, 3);

        let families = registry.gather();
        let dropped = families
            .iter()
            .find(|f| f.get_name() == "hatch_relay_events_dropped_total")
            .expect("dropped family");
        assert_eq!(dropped.get_metric()[0].get_counter().get_value(), 3.0);
    }
}
