//! Loads the kernel object, attaches the classifier for the configured
//! encoding and drains the kernel ring buffer until Ctrl-C.

use std::fmt;

use anyhow::Context as _;
use aya::maps::{MapData, PerCpuArray, RingBuf};
use aya::programs::{tc, SchedClassifier, TcAttachType};
use aya::EbpfLoader;
use serde::Serialize;
use tokio::time::{interval, Duration};

use crate::config::{Config, Direction, EncodingKind};
use crate::decode::{CaptureRecord, Decoder};
use crate::stats::CaptureMetrics;

/// Ring buffer map shared by all three classifiers.
pub const EVENTS_MAP: &str = "EVENTS";
/// Per-CPU counter of records the kernel could not reserve.
pub const DROPS_MAP: &str = "DROPS";
/// Read-only global holding the parameterized capture size.
pub const CAPTURE_SIZE_GLOBAL: &str = "CAPTURE_SIZE";

const EEXIST: i32 = 17;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Classifier implementing `encoding`.
pub fn program_name(encoding: EncodingKind) -> &'static str {
    match encoding {
        EncodingKind::Raw => "ringcap_raw",
        EncodingKind::Parameterized => "ringcap_param",
        EncodingKind::Structured => "ringcap_meta",
    }
}

pub fn attach_type(direction: Direction) -> TcAttachType {
    match direction {
        Direction::Ingress => TcAttachType::Ingress,
        Direction::Egress => TcAttachType::Egress,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachSummary {
    pub interface: String,
    pub program: &'static str,
    pub records: u64,
    pub decode_errors: u64,
    pub dropped: u64,
}

impl fmt::Display for AttachSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {}: {} records, {} decode errors, {} dropped in kernel",
            self.program, self.interface, self.records, self.decode_errors, self.dropped
        )
    }
}

/// Decodes one record and accounts it.
pub fn handle_record(
    decoder: &Decoder,
    metrics: &CaptureMetrics,
    record: &[u8],
) -> Option<CaptureRecord> {
    match decoder.decode(record) {
        Ok(decoded) => {
            metrics.record(record.len());
            Some(decoded)
        }
        Err(e) => {
            metrics.decode_error();
            tracing::debug!("dropping record: {}", e);
            None
        }
    }
}

pub async fn run(config: &Config, metrics: &CaptureMetrics) -> anyhow::Result<AttachSummary> {
    let iface = config.interface.as_deref().unwrap_or("eth0");
    let program_name = program_name(config.encoding);

    // ── eBPF setup ────────────────────────────────────────────────────
    let capture_size = config.capture_size();
    let mut bpf = EbpfLoader::new()
        .set_global(CAPTURE_SIZE_GLOBAL, &capture_size, true)
        .load_file(&config.ebpf_object)
        .with_context(|| format!("failed to load {}", config.ebpf_object.display()))?;

    // If the clsact qdisc already exists (EEXIST), that is fine.
    if let Err(e) = tc::qdisc_add_clsact(iface) {
        if e.raw_os_error() != Some(EEXIST) {
            return Err(e).with_context(|| format!("failed to add clsact qdisc to {}", iface));
        }
        tracing::debug!("clsact qdisc already exists on {}, reusing", iface);
    }

    let program: &mut SchedClassifier = bpf
        .program_mut(program_name)
        .with_context(|| format!("program {} not found", program_name))?
        .try_into()?;
    program.load()?;
    program.attach(iface, attach_type(config.direction))?;
    tracing::info!(
        "TC classifier {} attached to {} ({:?})",
        program_name,
        iface,
        config.direction
    );

    // ── RingBuf Poller ────────────────────────────────────────────────
    let mut ring_buf = RingBuf::try_from(
        bpf.take_map(EVENTS_MAP)
            .with_context(|| format!("map {} not found", EVENTS_MAP))?,
    )?;
    let drops: PerCpuArray<MapData, u64> = PerCpuArray::try_from(
        bpf.take_map(DROPS_MAP)
            .with_context(|| format!("map {} not found", DROPS_MAP))?,
    )?;

    let decoder = Decoder::new(config.encoding());
    let mut progress = interval(PROGRESS_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        while let Some(item) = ring_buf.next() {
            if let Some(record) = handle_record(&decoder, metrics, &item) {
                if config.json {
                    println!("{}", serde_json::to_string(&record)?);
                }
            }
        }

        tokio::select! {
            res = &mut shutdown => {
                res.context("failed to listen for Ctrl-C")?;
                tracing::info!("shutting down");
                break;
            }
            _ = progress.tick() => {
                let dropped = kernel_drops(&drops)?;
                metrics.set_dropped(dropped);
                tracing::info!(
                    records = metrics.records(),
                    decode_errors = metrics.decode_errors(),
                    dropped,
                    "capture progress"
                );
            }
            // Yield briefly to avoid busy-spinning when the ring buffer is empty.
            _ = tokio::time::sleep(Duration::from_millis(1)) => {}
        }
    }

    let dropped = kernel_drops(&drops)?;
    metrics.set_dropped(dropped);

    Ok(AttachSummary {
        interface: iface.to_string(),
        program: program_name,
        records: metrics.records(),
        decode_errors: metrics.decode_errors(),
        dropped,
    })
}

fn kernel_drops(drops: &PerCpuArray<MapData, u64>) -> anyhow::Result<u64> {
    let per_cpu = drops.get(&0, 0).context("failed to read drop counters")?;
    Ok(per_cpu.iter().sum())
}
