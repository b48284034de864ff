use ringcap::decode::{CaptureRecord, Decoder};
use ringcap::packet::{ipv4_fields, sample_frame, ProcessingContext, SimPacket};
use ringcap::ringbuf::{footprint, page_size, RingBuffer};
use ringcap_common::{
    CaptureHook, ContextHandle, Encoding, Outcome, SkbFields, Wakeup, RAW_PAYLOAD_LEN,
    RAW_RECORD_LEN,
};
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn drain_all(ring: &RingBuffer, decoder: &Decoder) -> Vec<CaptureRecord> {
    let mut out = Vec::new();
    ring.consumer()
        .consume(|record| out.push(decoder.decode(record).unwrap()));
    out
}

#[test]
fn concurrent_producers_keep_per_context_order() {
    let ring = RingBuffer::new(16 * page_size()).unwrap();
    let encoding = Encoding::Parameterized { capture_size: 100 };
    let hook = CaptureHook::new(encoding);
    let decoder = Decoder::new(encoding);
    let frame = sample_frame(128);

    let producers = 4u16;
    let per_producer = 5_000u64;
    let done = Arc::new(AtomicBool::new(false));

    let consumer = {
        let consumer = ring.consumer();
        let done = done.clone();
        let frame = frame.clone();
        thread::spawn(move || {
            let mut last: HashMap<u16, u64> = HashMap::new();
            let mut received = 0u64;
            loop {
                let finished = done.load(Ordering::Acquire);
                consumer.wait(Duration::from_millis(1));
                consumer.consume(|record| {
                    let CaptureRecord::Parameterized { handle, payload } =
                        decoder.decode(record).unwrap()
                    else {
                        panic!("unexpected record kind");
                    };
                    assert_eq!(payload, frame[..100]);
                    if let Some(prev) = last.insert(handle.cpu(), handle.sequence()) {
                        assert_eq!(handle.sequence(), prev + 1, "cpu {}", handle.cpu());
                    } else {
                        assert_eq!(handle.sequence(), 0);
                    }
                    received += 1;
                });
                if finished {
                    break;
                }
            }
            (received, last)
        })
    };

    thread::scope(|scope| {
        for cpu in 0..producers {
            let producer = ring.producer();
            let (hook, frame) = (&hook, &frame);
            scope.spawn(move || {
                let mut ctx = ProcessingContext::new(cpu);
                for _ in 0..per_producer {
                    let packet = ctx.packet(frame, ipv4_fields(128, 1));
                    // The ring is small on purpose: retry the same packet
                    // until the consumer frees space.
                    while hook.run(&packet, &producer) == Outcome::Dropped {
                        thread::yield_now();
                    }
                }
            });
        }
    });
    done.store(true, Ordering::Release);

    let (received, last) = consumer.join().unwrap();
    assert_eq!(received, u64::from(producers) * per_producer);
    for cpu in 0..producers {
        assert_eq!(last[&cpu], per_producer - 1);
    }
    let stats = ring.stats();
    assert_eq!(stats.committed, received);
    assert_eq!(stats.consumed, received);
    let (cons, prod) = ring.positions();
    assert_eq!(cons, prod);
}

#[test]
fn record_larger_than_ring_is_always_dropped() {
    let ring = RingBuffer::new(65536).unwrap();
    let hook = CaptureHook::new(Encoding::Parameterized {
        capture_size: u16::MAX,
    });
    assert_eq!(hook.record_len(), 65543);

    let frame = sample_frame(1500);
    let mut ctx = ProcessingContext::new(0);
    for _ in 0..3 {
        let packet = ctx.packet(&frame, ipv4_fields(1500, 2));
        assert_eq!(hook.run(&packet, &ring.producer()), Outcome::Dropped);
    }
    assert_eq!(ring.stats().dropped, 3);
    assert_eq!(ring.positions(), (0, 0));
}

#[test]
fn zero_capture_size_emits_handle_only() {
    let ring = RingBuffer::new(page_size()).unwrap();
    let encoding = Encoding::Parameterized { capture_size: 0 };
    let hook = CaptureHook::new(encoding);
    let frame = sample_frame(64);
    let mut ctx = ProcessingContext::new(2);

    let packet = ctx.packet(&frame, ipv4_fields(64, 1));
    assert_eq!(hook.run(&packet, &ring.producer()), Outcome::Emitted);
    assert_eq!(ring.positions().1, footprint(8) as u64);

    let mut lens = Vec::new();
    ring.consumer().consume(|record| lens.push(record.len()));
    assert_eq!(lens, vec![8]);
}

#[test]
fn structured_record_through_ring() {
    let ring = RingBuffer::new(page_size()).unwrap();
    let hook = CaptureHook::new(Encoding::Structured);
    let fields = SkbFields {
        len: 1500,
        protocol: 0x0800,
        ifindex: 2,
        ..Default::default()
    };
    let frame = sample_frame(1500);
    let packet = SimPacket::new(ContextHandle::new(5, 77), &frame, fields);

    assert_eq!(hook.run(&packet, &ring.producer()), Outcome::Emitted);

    let records = drain_all(&ring, &Decoder::new(Encoding::Structured));
    assert_eq!(
        records,
        vec![CaptureRecord::Structured {
            handle: ContextHandle::new(5, 77),
            fields,
        }]
    );
}

#[test]
fn short_packet_is_zero_filled() {
    let ring = RingBuffer::new(page_size()).unwrap();
    let hook = CaptureHook::new(Encoding::Raw);
    let frame = sample_frame(60);
    let mut ctx = ProcessingContext::new(0);
    let packet = ctx.packet(&frame, ipv4_fields(60, 1));

    assert_eq!(hook.run(&packet, &ring.producer()), Outcome::Emitted);

    let records = drain_all(&ring, &Decoder::new(Encoding::Raw));
    let CaptureRecord::Raw { payload, .. } = &records[0] else {
        panic!("expected a raw record");
    };
    assert_eq!(payload.len(), RAW_PAYLOAD_LEN);
    assert_eq!(&payload[..60], &frame[..]);
    assert!(payload[60..].iter().all(|&b| b == 0));
}

#[test]
fn full_ring_drops_without_touching_contents() {
    let capacity = page_size();
    let ring = RingBuffer::new(capacity).unwrap();
    let hook = CaptureHook::new(Encoding::Raw);
    let frame = sample_frame(128);
    let mut ctx = ProcessingContext::new(0);

    let fits = capacity / footprint(RAW_RECORD_LEN);
    for _ in 0..fits {
        let packet = ctx.packet(&frame, ipv4_fields(128, 1));
        assert_eq!(hook.run(&packet, &ring.producer()), Outcome::Emitted);
    }
    let before = ring.positions();

    let packet = ctx.packet(&frame, ipv4_fields(128, 1));
    assert_eq!(hook.run(&packet, &ring.producer()), Outcome::Dropped);
    assert_eq!(ring.positions(), before);
    assert_eq!(ring.stats().dropped, 1);

    let records = drain_all(&ring, &Decoder::new(Encoding::Raw));
    assert_eq!(records.len(), fits);
    let sequences: Vec<u64> = records.iter().map(|r| r.handle().sequence()).collect();
    assert_eq!(sequences, (0..fits as u64).collect::<Vec<_>>());
}

/// Record layout used below: producer id, sequence, then a body whose length
/// and bytes are derived from both.
fn tagged_record(producer: u16, seq: u64) -> Vec<u8> {
    let body_len = (seq % 57) as usize;
    let mut record = Vec::with_capacity(10 + body_len);
    record.extend_from_slice(&producer.to_ne_bytes());
    record.extend_from_slice(&seq.to_ne_bytes());
    record.extend((0..body_len).map(|i| (producer as u8) ^ (seq as u8) ^ (i as u8)));
    record
}

fn parse_tagged(record: &[u8]) -> (u16, u64) {
    let producer = u16::from_ne_bytes([record[0], record[1]]);
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&record[2..10]);
    let seq = u64::from_ne_bytes(seq);
    assert_eq!(record, tagged_record(producer, seq), "corrupted record");
    (producer, seq)
}

#[test]
fn concurrent_consumers_never_duplicate_records() {
    let ring = RingBuffer::new(page_size()).unwrap();
    let producers = 4u16;
    let per_producer = 20_000u64;
    let done = Arc::new(AtomicBool::new(false));

    let consumers: Vec<_> = (0..3)
        .map(|_| {
            let consumer = ring.consumer();
            let done = done.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                loop {
                    let finished = done.load(Ordering::Acquire);
                    consumer.wait(Duration::from_millis(1));
                    let n = consumer.consume(|record| seen.push(parse_tagged(record)));
                    // An empty drain that started after the producers were
                    // done means the ring is empty for good.
                    if finished && n == 0 {
                        break;
                    }
                }
                seen
            })
        })
        .collect();

    thread::scope(|scope| {
        for id in 0..producers {
            let producer = ring.producer();
            scope.spawn(move || {
                for seq in 0..per_producer {
                    let record = tagged_record(id, seq);
                    while !producer.output(&record, Wakeup::Adaptive) {
                        thread::yield_now();
                    }
                }
            });
        }
    });
    done.store(true, Ordering::Release);

    let mut all = HashSet::new();
    let mut counts = vec![0u64; producers as usize];
    for handle in consumers {
        let seen = handle.join().unwrap();
        // Drains are serialized, so each consumer sees every producer's
        // records in increasing order.
        let mut last: HashMap<u16, u64> = HashMap::new();
        for (producer, seq) in seen {
            if let Some(prev) = last.insert(producer, seq) {
                assert!(seq > prev, "producer {producer}: {seq} after {prev}");
            }
            assert!(all.insert((producer, seq)), "duplicate ({producer}, {seq})");
            counts[producer as usize] += 1;
        }
    }

    assert_eq!(counts, vec![per_producer; producers as usize]);
    assert_eq!(all.len() as u64, u64::from(producers) * per_producer);
    let stats = ring.stats();
    assert_eq!(stats.committed, u64::from(producers) * per_producer);
    assert_eq!(stats.consumed, stats.committed);
    let (cons, prod) = ring.positions();
    assert_eq!(cons, prod);
}
