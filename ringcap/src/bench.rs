//! In-process benchmark: run the capture hook over a sample packet N times,
//! then drain and decode every record from the ring.

use std::fmt;
use std::thread::{self, ScopedJoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _};
use ringcap_common::{CaptureHook, Encoding, Outcome};
use serde::Serialize;

use crate::config::Config;
use crate::decode::Decoder;
use crate::packet::{ipv4_fields, sample_frame, ProcessingContext};
use crate::ringbuf::{footprint, RingBuffer, RingStats};
use crate::stats::CaptureMetrics;

/// Size of the packet every hook invocation sees.
pub const PACKET_DATA_SIZE: usize = 128;

const SAMPLE_IFINDEX: u32 = 1;

#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub encoding: Encoding,
    pub events: usize,
    pub received: usize,
    pub produce_secs: f64,
    pub consume_secs: f64,
    pub mevents_per_sec: f64,
    pub checksum: u64,
    pub ring: RingStats,
}

impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "parsed {} events in {:?} ({:.2} Mevents/s)",
            self.received,
            Duration::from_secs_f64(self.consume_secs),
            self.mevents_per_sec
        )?;
        write!(f, "checksum: {}", self.checksum)
    }
}

/// Ring bytes needed to hold `events` records of `record_len` bytes.
pub fn required_ring_bytes(events: usize, record_len: usize) -> usize {
    events.saturating_mul(footprint(record_len))
}

/// Joins the producer threads and sums their drop counts. A panicked
/// producer fails the run instead of showing up later as missing records.
fn join_producers(workers: Vec<ScopedJoinHandle<'_, usize>>) -> anyhow::Result<usize> {
    let mut dropped = 0;
    for (cpu, worker) in workers.into_iter().enumerate() {
        match worker.join() {
            Ok(n) => dropped += n,
            Err(_) => {
                tracing::error!(cpu, "producer thread panicked");
                bail!("producer thread {} panicked", cpu);
            }
        }
    }
    Ok(dropped)
}

pub fn run(config: &Config, metrics: &CaptureMetrics) -> anyhow::Result<BenchReport> {
    anyhow::ensure!(config.events > 0, "event count must be > 0 (got {})", config.events);

    let encoding = config.encoding();
    let hook = CaptureHook::new(encoding);
    let decoder = Decoder::new(encoding);

    let record_bytes = footprint(hook.record_len());
    let total_bytes = required_ring_bytes(config.events, hook.record_len());
    if total_bytes > config.ring_size {
        bail!(
            "ringbuf too small: need {} bytes ({} events * {} bytes) but buffer has {} bytes",
            total_bytes,
            config.events,
            record_bytes,
            config.ring_size
        );
    }

    let ring = RingBuffer::new(config.ring_size).context("failed to create ring buffer")?;
    tracing::debug!(
        ?encoding,
        events = config.events,
        producers = config.producers,
        "starting benchmark"
    );

    let frame = sample_frame(PACKET_DATA_SIZE);
    let fields = ipv4_fields(frame.len() as u32, SAMPLE_IFINDEX);

    let start = Instant::now();
    let dropped = thread::scope(|scope| {
        let producers = config.producers.max(1);
        let workers: Vec<_> = (0..producers)
            .map(|cpu| {
                let share = config.events / producers + usize::from(cpu < config.events % producers);
                let producer = ring.producer();
                let (hook, frame) = (&hook, &frame);
                scope.spawn(move || {
                    let mut ctx = ProcessingContext::new(cpu as u16);
                    let mut dropped = 0usize;
                    for _ in 0..share {
                        let packet = ctx.packet(frame, fields);
                        if hook.run(&packet, &producer) == Outcome::Dropped {
                            dropped += 1;
                        }
                    }
                    dropped
                })
            })
            .collect();
        join_producers(workers)
    })?;
    let produce_secs = start.elapsed().as_secs_f64();
    if dropped > 0 {
        tracing::warn!(dropped, "hook dropped records");
    }

    let consumer = ring.consumer();
    let timeout = Duration::from_millis(config.read_timeout_ms);
    let mut received = 0usize;
    let mut checksum = 0u64;

    let start = Instant::now();
    while received < config.events {
        if !consumer.wait(timeout) {
            bail!(
                "timeout waiting for events: received {}/{}",
                received,
                config.events
            );
        }
        let mut drain = consumer.drain();
        while let Some(item) = drain.next() {
            let sum = match decoder.checksum(&item[..]) {
                Ok(sum) => sum,
                Err(e) => {
                    metrics.decode_error();
                    return Err(e).context("consume ringbuf");
                }
            };
            metrics.record(item.len());
            checksum = checksum.wrapping_add(sum);
            received += 1;
        }
    }
    let consume_secs = start.elapsed().as_secs_f64();

    let ring_stats = ring.stats();
    metrics.set_dropped(ring_stats.dropped);
    metrics.set_pending_bytes(consumer.pending_bytes());

    Ok(BenchReport {
        encoding,
        events: config.events,
        received,
        produce_secs,
        consume_secs,
        mevents_per_sec: received as f64 / consume_secs.max(f64::MIN_POSITIVE) / 1e6,
        checksum,
        ring: ring_stats,
    })
}
