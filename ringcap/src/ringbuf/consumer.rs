use std::ops::Deref;
use std::slice;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::MutexGuard;

use super::{footprint, Shared, BUSY_BIT, DISCARD_BIT, LEN_MASK};

/// Consumer side handle. Clones share the same read cursor; their drains
/// are serialized.
#[derive(Clone)]
pub struct Consumer {
    shared: Arc<Shared>,
}

impl Consumer {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Starts a drain over the records committed so far, blocking while
    /// another consumer is draining.
    pub fn drain(&self) -> Drain<'_> {
        Drain::new(&self.shared, self.shared.drain_lock.lock())
    }

    /// Like [`Consumer::drain`], but gives up if another drain is running.
    pub fn try_drain(&self) -> Option<Drain<'_>> {
        let guard = self.shared.drain_lock.try_lock()?;
        Some(Drain::new(&self.shared, guard))
    }

    /// Passes every available record to `f` in commit order and returns how
    /// many were consumed.
    pub fn consume<F: FnMut(&[u8])>(&self, mut f: F) -> usize {
        let mut drain = self.drain();
        let mut count = 0;
        while let Some(item) = drain.next() {
            f(&item[..]);
            count += 1;
        }
        count
    }

    /// Blocks until a record is ready, a producer sends a wake-up, or
    /// `timeout` elapses. Returns `true` unless it timed out with nothing
    /// ready.
    ///
    /// Producers committing with [`Wakeup::Suppress`](ringcap_common::Wakeup)
    /// never notify, so callers should keep the timeout short and poll.
    pub fn wait(&self, timeout: Duration) -> bool {
        let shared = &*self.shared;
        let deadline = Instant::now() + timeout;
        let mut epoch = shared.wake_epoch.lock();
        if shared.has_ready_record() {
            return true;
        }
        let seen = *epoch;
        while *epoch == seen {
            if shared.wake_cv.wait_until(&mut epoch, deadline).timed_out() {
                return shared.has_ready_record();
            }
        }
        true
    }

    /// Bytes between the read cursor and the publish cursor.
    pub fn pending_bytes(&self) -> u64 {
        let header = &self.shared.header;
        let prod = header.producer_pos.load(Acquire);
        let cons = header.consumer_pos.load(Acquire);
        prod.saturating_sub(cons)
    }
}

/// One pass over the ring, bounded by the publish cursor observed when the
/// drain started.
///
/// `Drain` hands out one [`RingBufItem`] at a time; dropping the item
/// releases its space to producers. A later drain resumes where this one
/// stopped.
pub struct Drain<'a> {
    shared: &'a Shared,
    limit: u64,
    _guard: MutexGuard<'a, ()>,
}

impl<'a> Drain<'a> {
    fn new(shared: &'a Shared, guard: MutexGuard<'a, ()>) -> Self {
        Self {
            shared,
            limit: shared.header.producer_pos.load(Acquire),
            _guard: guard,
        }
    }

    /// Next committed record, or `None` once the drain reaches its limit or
    /// a record that is still being written.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<RingBufItem<'_>> {
        let shared = self.shared;
        loop {
            // Only the drain holding the lock moves the read cursor.
            let cons = shared.header.consumer_pos.load(Relaxed);
            if cons >= self.limit {
                return None;
            }

            let word = shared.len_word(cons).load(Acquire);
            if word & BUSY_BIT != 0 {
                return None;
            }
            let len = (word & LEN_MASK) as usize;
            let next = cons + footprint(len) as u64;

            if word & DISCARD_BIT != 0 {
                shared.header.consumer_pos.store(next, Release);
                continue;
            }

            let data = unsafe { slice::from_raw_parts(shared.record_ptr(cons) as *const u8, len) };
            return Some(RingBufItem {
                shared,
                data,
                next,
            });
        }
    }
}

/// A committed record borrowed straight out of the ring.
pub struct RingBufItem<'a> {
    shared: &'a Shared,
    data: &'a [u8],
    next: u64,
}

impl Deref for RingBufItem<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data
    }
}

impl Drop for RingBufItem<'_> {
    fn drop(&mut self) {
        self.shared
            .header
            .consumer_pos
            .store(self.next, Release);
        self.shared.counters.consumed.fetch_add(1, Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ringbuf::{page_size, RingBuffer};
    use ringcap_common::Wakeup;
    use std::thread;

    fn records(consumer: &Consumer) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        consumer.consume(|record| out.push(record.to_vec()));
        out
    }

    #[test]
    fn test_fifo_order() {
        let ring = RingBuffer::new(page_size()).unwrap();
        let producer = ring.producer();
        for i in 0u8..10 {
            assert!(producer.output(&[i; 3], Wakeup::Suppress));
        }

        let got = records(&ring.consumer());
        let expected: Vec<Vec<u8>> = (0u8..10).map(|i| vec![i; 3]).collect();
        assert_eq!(got, expected);
        assert!(records(&ring.consumer()).is_empty());
        assert_eq!(ring.stats().consumed, 10);
    }

    #[test]
    fn test_stops_at_busy_record() {
        let ring = RingBuffer::new(page_size()).unwrap();
        let producer = ring.producer();
        let consumer = ring.consumer();

        producer.output(b"first", Wakeup::Suppress);
        let pending = producer.reserve(4).unwrap();
        producer.output(b"third", Wakeup::Suppress);

        // The third record is committed but must wait behind the second.
        assert_eq!(records(&consumer), vec![b"first".to_vec()]);

        pending.commit(Wakeup::Suppress);
        let rest = records(&consumer);
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1], b"third".to_vec());
    }

    #[test]
    fn test_discarded_records_are_skipped() {
        let ring = RingBuffer::new(page_size()).unwrap();
        let producer = ring.producer();
        producer.output(b"a", Wakeup::Suppress);
        producer.reserve(32).unwrap().discard(Wakeup::Suppress);
        producer.output(b"b", Wakeup::Suppress);

        assert_eq!(records(&ring.consumer()), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(ring.positions().0, ring.positions().1);
    }

    #[test]
    fn test_drain_is_finite_and_restartable() {
        let ring = RingBuffer::new(page_size()).unwrap();
        let producer = ring.producer();
        let consumer = ring.consumer();
        producer.output(&[1], Wakeup::Suppress);
        producer.output(&[2], Wakeup::Suppress);

        let mut drain = consumer.drain();
        let first = drain.next().unwrap().to_vec();
        // Committed after the drain started: not part of this pass.
        producer.output(&[3], Wakeup::Suppress);
        let second = drain.next().unwrap().to_vec();
        assert!(drain.next().is_none());
        drop(drain);

        assert_eq!((first, second), (vec![1], vec![2]));
        assert_eq!(records(&consumer), vec![vec![3]]);
    }

    #[test]
    fn test_consumption_frees_space() {
        let capacity = page_size();
        let ring = RingBuffer::new(capacity).unwrap();
        let producer = ring.producer();
        let consumer = ring.consumer();
        let size = capacity / 4 - 8;

        for round in 0..10u8 {
            for _ in 0..4 {
                let mut slot = producer.reserve(size).unwrap();
                slot.fill(round);
                slot.commit(Wakeup::Suppress);
            }
            assert!(producer.reserve(0).is_none());
            let got = records(&consumer);
            assert_eq!(got.len(), 4);
            assert!(got.iter().all(|r| r.len() == size && r.iter().all(|&b| b == round)));
        }
    }

    #[test]
    fn test_wrapped_record_is_contiguous() {
        let capacity = page_size();
        let ring = RingBuffer::new(capacity).unwrap();
        let producer = ring.producer();
        let consumer = ring.consumer();

        // Leave the cursors 24 bytes short of the end of the region.
        producer.reserve(capacity - 32).unwrap().discard(Wakeup::Suppress);
        assert!(records(&consumer).is_empty());

        let payload: Vec<u8> = (0..200).map(|i| i as u8).collect();
        assert!(producer.output(&payload, Wakeup::Suppress));
        assert_eq!(records(&consumer), vec![payload]);
    }

    #[test]
    fn test_pending_bytes() {
        let ring = RingBuffer::new(page_size()).unwrap();
        let consumer = ring.consumer();
        ring.producer().output(&[0; 10], Wakeup::Suppress);
        assert_eq!(consumer.pending_bytes(), 24);
        records(&consumer);
        assert_eq!(consumer.pending_bytes(), 0);
    }

    #[test]
    fn test_try_drain_while_draining() {
        let ring = RingBuffer::new(page_size()).unwrap();
        let consumer = ring.consumer();
        let other = consumer.clone();
        let drain = consumer.drain();
        assert!(other.try_drain().is_none());
        drop(drain);
        assert!(other.try_drain().is_some());
    }

    #[test]
    fn test_wait_times_out_without_data() {
        let ring = RingBuffer::new(page_size()).unwrap();
        assert!(!ring.consumer().wait(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_returns_when_data_is_ready() {
        let ring = RingBuffer::new(page_size()).unwrap();
        ring.producer().output(b"x", Wakeup::Suppress);
        assert!(ring.consumer().wait(Duration::from_secs(5)));
    }

    #[test]
    fn test_forced_wakeup_reaches_waiter() {
        let ring = RingBuffer::new(page_size()).unwrap();
        let consumer = ring.consumer();
        let producer = ring.producer();

        let waiter = thread::spawn(move || consumer.wait(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        producer.output(b"wake", Wakeup::Force);
        assert!(waiter.join().unwrap());
    }
}
