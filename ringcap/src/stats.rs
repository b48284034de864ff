use anyhow::Context as _;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::fs;
use std::path::Path;

// ── Prometheus Metrics ────────────────────────────────────────────────────────

/// Capture counters shared by `bench` and `attach`.
pub struct CaptureMetrics {
    registry: Registry,
    records_total: Counter,
    bytes_total: Counter,
    decode_errors_total: Counter,
    dropped: Gauge,
    pending_bytes: Gauge,
}

impl Default for CaptureMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let records_total = Counter::default();
        let bytes_total = Counter::default();
        let decode_errors_total = Counter::default();
        let dropped = Gauge::default();
        let pending_bytes = Gauge::default();

        registry.register(
            "ringcap_records",
            "Records read from the ring buffer",
            records_total.clone(),
        );
        registry.register(
            "ringcap_bytes",
            "Record bytes read from the ring buffer",
            bytes_total.clone(),
        );
        registry.register(
            "ringcap_decode_errors",
            "Records that could not be decoded",
            decode_errors_total.clone(),
        );
        registry.register(
            "ringcap_dropped",
            "Reservations refused for lack of ring space",
            dropped.clone(),
        );
        registry.register(
            "ringcap_pending_bytes",
            "Bytes committed but not yet consumed",
            pending_bytes.clone(),
        );

        Self {
            registry,
            records_total,
            bytes_total,
            decode_errors_total,
            dropped,
            pending_bytes,
        }
    }

    /// Accounts one record read from the ring.
    pub fn record(&self, len: usize) {
        self.records_total.inc();
        self.bytes_total.inc_by(len as u64);
    }

    pub fn decode_error(&self) {
        self.decode_errors_total.inc();
    }

    /// Latest total of refused reservations.
    pub fn set_dropped(&self, dropped: u64) {
        self.dropped.set(dropped as i64);
    }

    pub fn set_pending_bytes(&self, pending_bytes: u64) {
        self.pending_bytes.set(pending_bytes as i64);
    }

    pub fn records(&self) -> u64 {
        self.records_total.get()
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors_total.get()
    }

    /// OpenMetrics text exposition of every metric.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = String::new();
        encode(&mut buf, &self.registry).context("failed to encode metrics")?;
        Ok(buf)
    }

    pub fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        let text = self.encode()?;
        fs::write(path, text)
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;
        tracing::info!("metrics written to {}", path.display());
        Ok(())
    }
}
