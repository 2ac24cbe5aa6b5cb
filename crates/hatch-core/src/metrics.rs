//! ---
//! hatch_section: "01-core-functionality"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Prometheus counters for the update lifecycle."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

/// Prometheus counters for the update lifecycle.
#[derive(Clone)]
pub struct UpdateMetrics {
    checks: IntCounterVec,
    staged: IntCounter,
    applied: IntCounter,
    failures: IntCounterVec,
}

impl UpdateMetrics {
    /// Register update metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let checks = IntCounterVec::new(
            Opts::new("hatch_update_checks_total", "Completed release checks"),
            &["outcome"],
        )?;
        let staged = IntCounter::new(
            "hatch_updates_staged_total",
            "Artifacts verified and staged for apply",
        )?;
        let applied = IntCounter::new(
            "hatch_updates_applied_total",
            "Apply helpers launched for a staged artifact",
        )?;
        let failures = IntCounterVec::new(
            Opts::new(
                "hatch_update_failures_total",
                "Coordinator operations that ended in an error",
            ),
            &["kind"],
        )?;

        registry.register(Box::new(checks.clone()))?;
        registry.register(Box::new(staged.clone()))?;
        registry.register(Box::new(applied.clone()))?;
        registry.register(Box::new(failures.clone()))?;

        Ok(Self {
            checks,
            staged,
            applied,
            failures,
        })
    }

    pub fn record_check(&self, update_available: bool) {
        let outcome = if update_available {
            "update_available"
        } else {
            "up_to_date"
        };
        self.checks.with_label_values(&[outcome]).inc();
    }

    pub fn record_staged(&self) {
        self.staged.inc();
    }

    pub fn record_applied(&self) {
        self.applied.inc();
    }

    pub fn record_failure(&self, kind: &str) {
        self.failures.with_label_values(&[kind]).inc();
    }
}

impl std::fmt::Debug for UpdateMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_exported() {
        let registry = Registry::new();
        let metrics = UpdateMetrics::register(&registry).expect("register metrics");
        metrics.record_check(true);
        metrics.record_staged();
        metrics.record_failure("checksum_mismatch");
        metrics.record_failure("checksum_mismatch");

        let families = registry.gather();
        let value = |name: &str| {
            families
                .iter()
                .find(|f| f.get_name() == name)
                .map(|f| f.get_metric()[0].get_counter().get_value())
        };
        assert_eq!(value("hatch_updates_staged_total"), Some(1.0));
        assert_eq!(value("hatch_update_failures_total"), Some(2.0));
        assert_eq!(value("hatch_update_checks_total"), Some(1.0));
        assert!(UpdateMetrics::register(&registry).is_err());
    }
}
