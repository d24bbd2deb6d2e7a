use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::constants::CacheStatus;

/// Per-server metric set. Each [`crate::server::Server`] owns its own registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    requests_total: IntCounterVec,
    upstream_fetches_total: IntCounter,
    fills_inflight: IntGauge,
    published_bytes_total: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("hoard_requests_total", "Requests by cache disposition"),
            &["cache"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let upstream_fetches_total =
            IntCounter::new("hoard_upstream_fetches_total", "Requests sent to the origin")?;
        registry.register(Box::new(upstream_fetches_total.clone()))?;

        let fills_inflight = IntGauge::new("hoard_fills_inflight", "Cache fills currently running")?;
        registry.register(Box::new(fills_inflight.clone()))?;

        let published_bytes_total =
            IntCounter::new("hoard_published_bytes_total", "Bytes published into the store")?;
        registry.register(Box::new(published_bytes_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            upstream_fetches_total,
            fills_inflight,
            published_bytes_total,
        })
    }

    pub fn record_request(&self, status: CacheStatus) {
        self.requests_total.with_label_values(&[status.as_str()]).inc();
    }

    pub fn record_upstream_fetch(&self) {
        self.upstream_fetches_total.inc();
    }

    pub fn upstream_fetches(&self) -> u64 {
        self.upstream_fetches_total.get()
    }

    pub fn fill_started(&self) {
        self.fills_inflight.inc();
    }

    pub fn fill_finished(&self) {
        self.fills_inflight.dec();
    }

    pub fn record_published(&self, bytes: u64) {
        self.published_bytes_total.inc_by(bytes);
    }

    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        if let Err(err) = encoder.encode(&families, &mut buf) {
            log::warn!("encode metrics failed: {err}");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
