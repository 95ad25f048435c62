use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::{LazyLock, Once};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Paywalled requests by action and HTTP status
pub static REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("stage_requests_total", "Paywalled requests by action and status"),
        &["action", "status"],
    )
    .unwrap()
});

// Payment outcomes: settled, cached, challenge, or an error label
pub static PAYMENTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("stage_payments_total", "Payment outcomes by action"),
        &["action", "outcome"],
    )
    .unwrap()
});

pub static ORACLE_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new("stage_oracle_latency_seconds", "Oracle call latency")
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0]),
        &["call"],
    )
    .unwrap()
});

pub static EVENTS_PUBLISHED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("stage_events_published_total", "Realtime events published"),
        &["event"],
    )
    .unwrap()
});

pub static SSE_SUBSCRIBERS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("stage_sse_subscribers", "Live realtime stream connections").unwrap()
});

static REGISTER: Once = Once::new();

/// Register all metrics with the registry. Safe to call more than once.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        let collectors: [Box<dyn prometheus::core::Collector>; 5] = [
            Box::new(REQUESTS_TOTAL.clone()),
            Box::new(PAYMENTS_TOTAL.clone()),
            Box::new(ORACLE_LATENCY.clone()),
            Box::new(EVENTS_PUBLISHED.clone()),
            Box::new(SSE_SUBSCRIBERS.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::warn!(error = %e, "failed to register metric");
            }
        }
    });
}

/// Render the registry in Prometheus text format.
pub fn metrics_output() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
