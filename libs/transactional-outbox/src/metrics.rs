use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts};
use tracing::warn;

/// Relay-side publication metrics.
///
/// The backlog gauge growing without bound is the alert signal for a
/// permanently unreachable broker. Published rows are counted per event
/// type so a stalled follow-up stream (no OrderPaid/OrderFailed while
/// OrderCreated keeps flowing) is visible without log digging.
#[derive(Clone)]
pub struct RelayMetrics {
    backlog_size: IntGauge,
    backlog_oldest_age_seconds: IntGauge,
    published: IntCounterVec,
    publish_failures: IntCounter,
}

impl RelayMetrics {
    pub fn new(service: &str) -> Self {
        let backlog_size = IntGauge::with_opts(
            Opts::new(
                "relay_backlog_size",
                "Unpublished outbox rows waiting for the relay",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for relay_backlog_size");

        let backlog_oldest_age_seconds = IntGauge::with_opts(
            Opts::new(
                "relay_backlog_oldest_age_seconds",
                "Age in seconds of the oldest unpublished outbox row",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for relay_backlog_oldest_age_seconds");

        let published = IntCounterVec::new(
            Opts::new(
                "relay_events_published_total",
                "Outbox rows published to the broker, by event type",
            )
            .const_label("service", service.to_string()),
            &["event_type"],
        )
        .expect("valid metric opts for relay_events_published_total");

        let publish_failures = IntCounter::with_opts(
            Opts::new(
                "relay_publish_failures_total",
                "Relay ticks aborted by a publish or mark error",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for relay_publish_failures_total");

        let registry = prometheus::default_registry();
        register(registry, Box::new(backlog_size.clone()));
        register(registry, Box::new(backlog_oldest_age_seconds.clone()));
        register(registry, Box::new(published.clone()));
        register(registry, Box::new(publish_failures.clone()));

        Self {
            backlog_size,
            backlog_oldest_age_seconds,
            published,
            publish_failures,
        }
    }

    /// Record the current unpublished backlog.
    pub fn observe_backlog(&self, pending: i64, oldest_age_seconds: i64) {
        self.backlog_size.set(pending);
        self.backlog_oldest_age_seconds.set(oldest_age_seconds);
    }

    /// Count one successfully published row.
    pub fn observe_published(&self, event_type: &str) {
        self.published.with_label_values(&[event_type]).inc();
    }

    /// Count one aborted relay tick.
    pub fn observe_failure(&self) {
        self.publish_failures.inc();
    }
}

fn register(registry: &prometheus::Registry, collector: Box<dyn prometheus::core::Collector>) {
    if let Err(e) = registry.register(collector) {
        warn!("Failed to register relay metric: {}", e);
    }
}
