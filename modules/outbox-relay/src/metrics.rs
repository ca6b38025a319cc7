use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Relay counters, shared by every worker of one relay process
#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,

    pub records_claimed_total: IntCounterVec,
    pub records_published_total: IntCounterVec,
    pub publish_failures_total: IntCounterVec,
    pub cycle_errors_total: IntCounterVec,
}

impl RelayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let records_claimed_total = IntCounterVec::new(
            Opts::new("outbox_records_claimed_total", "Outbox records claimed"),
            &["worker"],
        )?;

        let records_published_total = IntCounterVec::new(
            Opts::new(
                "outbox_records_published_total",
                "Outbox records acknowledged by the broker and marked processed",
            ),
            &["worker", "aggregate_type"],
        )?;

        let publish_failures_total = IntCounterVec::new(
            Opts::new(
                "outbox_publish_failures_total",
                "Outbox records left pending after a failed publish",
            ),
            &["worker", "aggregate_type"],
        )?;

        let cycle_errors_total = IntCounterVec::new(
            Opts::new(
                "outbox_cycle_errors_total",
                "Poll cycles aborted by a storage error",
            ),
            &["worker"],
        )?;

        registry.register(Box::new(records_claimed_total.clone()))?;
        registry.register(Box::new(records_published_total.clone()))?;
        registry.register(Box::new(publish_failures_total.clone()))?;
        registry.register(Box::new(cycle_errors_total.clone()))?;

        Ok(Self {
            registry,
            records_claimed_total,
            records_published_total,
            publish_failures_total,
            cycle_errors_total,
        })
    }

    /// Text exposition format of every registered metric
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode relay metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
