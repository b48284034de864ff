use std::ops::{Deref, DerefMut};
use std::slice;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::Arc;

use crossbeam_utils::Backoff;
use ringcap_common::{RecordSink, Reservation, Wakeup};

use super::{footprint, Shared, BUSY_BIT, DISCARD_BIT, MAX_RECORD_LEN};

/// Producer side handle. Cheap to clone; one per processing context.
#[derive(Clone)]
pub struct Producer {
    shared: Arc<Shared>,
}

impl Producer {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Reserves `size` bytes for one record.
    ///
    /// Returns `None` without side effects other than the drop counter when
    /// the ring lacks space. Never blocks on the consumer and never
    /// allocates.
    pub fn reserve(&self, size: usize) -> Option<Slot<'_>> {
        let shared = &*self.shared;
        let header = &shared.header;

        if size > MAX_RECORD_LEN || footprint(size) as u64 > shared.capacity {
            shared.counters.dropped.fetch_add(1, Relaxed);
            return None;
        }

        let total = footprint(size) as u64;
        let mut start = header.reserve_pos.load(Relaxed);
        loop {
            let cons = header.consumer_pos.load(Acquire);
            let end = start + total;
            if end.saturating_sub(cons) > shared.capacity {
                shared.counters.dropped.fetch_add(1, Relaxed);
                return None;
            }
            match header
                .reserve_pos
                .compare_exchange_weak(start, end, AcqRel, Relaxed)
            {
                Ok(_) => break,
                Err(current) => start = current,
            }
        }

        shared.offset_word(start).store(shared.data_offset(start), Relaxed);
        shared.len_word(start).store(size as u32 | BUSY_BIT, Relaxed);

        // Publish in reservation order. An earlier producer only has its
        // header left to write at this point.
        let backoff = Backoff::new();
        while header.producer_pos.load(Acquire) != start {
            backoff.snooze();
        }
        header.producer_pos.store(start + total, Release);

        shared.counters.reserved.fetch_add(1, Relaxed);
        Some(Slot {
            shared,
            pos: start,
            data: shared.record_ptr(start),
            len: size,
            finished: false,
        })
    }

    /// Copies `data` into a fresh record and commits it.
    pub fn output(&self, data: &[u8], wakeup: Wakeup) -> bool {
        match self.reserve(data.len()) {
            Some(mut slot) => {
                slot.copy_from_slice(data);
                slot.commit(wakeup);
                true
            }
            None => false,
        }
    }
}

/// A reserved record. Derefs to exactly the reserved bytes.
///
/// Dropping a slot without committing it discards the record so the
/// consumer never stalls behind it.
pub struct Slot<'a> {
    shared: &'a Shared,
    pos: u64,
    data: *mut u8,
    len: usize,
    finished: bool,
}

// The slot exclusively owns its byte range until it is committed.
unsafe impl Send for Slot<'_> {}

impl Slot<'_> {
    /// Publishes the record.
    pub fn commit(mut self, wakeup: Wakeup) {
        self.finish(0, wakeup);
    }

    /// Releases the space without publishing a record.
    pub fn discard(mut self, wakeup: Wakeup) {
        self.finish(DISCARD_BIT, wakeup);
    }

    fn finish(&mut self, flag: u32, wakeup: Wakeup) {
        self.finished = true;
        let shared = self.shared;
        shared
            .len_word(self.pos)
            .store(self.len as u32 | flag, Release);

        let counter = if flag == 0 {
            &shared.counters.committed
        } else {
            &shared.counters.discarded
        };
        counter.fetch_add(1, Relaxed);

        let wake = match wakeup {
            Wakeup::Suppress => false,
            Wakeup::Force => true,
            Wakeup::Adaptive => shared.header.consumer_pos.load(Acquire) == self.pos,
        };
        if wake {
            shared.notify();
        }
    }
}

impl Deref for Slot<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.data, self.len) }
    }
}

impl DerefMut for Slot<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.data, self.len) }
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(DISCARD_BIT, Wakeup::Suppress);
        }
    }
}

impl Reservation for Slot<'_> {
    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut **self
    }

    fn commit(self, wakeup: Wakeup) {
        Slot::commit(self, wakeup)
    }

    fn discard(self, wakeup: Wakeup) {
        Slot::discard(self, wakeup)
    }
}

impl RecordSink for Producer {
    type Slot<'a> = Slot<'a>;

    fn reserve(&self, size: usize) -> Option<Slot<'_>> {
        Producer::reserve(self, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ringbuf::{page_size, RingBuffer};

    #[test]
    fn test_reserve_sets_busy_header() {
        let ring = RingBuffer::new(page_size()).unwrap();
        let producer = ring.producer();
        let mut slot = producer.reserve(12).unwrap();
        assert_eq!(slot.len(), 12);
        slot.fill(7);

        let shared = &producer.shared;
        assert_eq!(shared.len_word(0).load(Acquire), 12 | BUSY_BIT);
        assert_eq!(shared.offset_word(0).load(Acquire), 0);
        assert_eq!(ring.positions(), (0, 24));

        slot.commit(Wakeup::Suppress);
        assert_eq!(shared.len_word(0).load(Acquire), 12);
        let stats = ring.stats();
        assert_eq!(stats.reserved, 1);
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.wakeups, 0);
    }

    #[test]
    fn test_reserve_fails_when_full() {
        let capacity = page_size();
        let ring = RingBuffer::new(capacity).unwrap();
        let producer = ring.producer();

        // Exactly fills the ring.
        let slot = producer.reserve(capacity - 8).unwrap();
        assert!(producer.reserve(0).is_none());
        slot.commit(Wakeup::Suppress);
        assert!(producer.reserve(0).is_none());

        let stats = ring.stats();
        assert_eq!(stats.dropped, 2);
        assert_eq!(ring.positions(), (0, capacity as u64));
    }

    #[test]
    fn test_oversized_record_is_refused() {
        let capacity = page_size();
        let ring = RingBuffer::new(capacity).unwrap();
        let producer = ring.producer();
        assert!(producer.reserve(capacity).is_none());
        assert!(producer.reserve(usize::MAX / 2).is_none());
        assert_eq!(ring.positions(), (0, 0));
        assert_eq!(ring.stats().dropped, 2);
    }

    #[test]
    fn test_dropped_slot_is_discarded() {
        let ring = RingBuffer::new(page_size()).unwrap();
        let producer = ring.producer();
        drop(producer.reserve(16).unwrap());
        assert_eq!(
            producer.shared.len_word(0).load(Acquire),
            16 | DISCARD_BIT
        );
        assert_eq!(ring.stats().discarded, 1);
    }

    #[test]
    fn test_force_and_adaptive_wakeups() {
        let ring = RingBuffer::new(page_size()).unwrap();
        let producer = ring.producer();

        // Consumer sits at 0, so the first record wakes it adaptively.
        producer.reserve(8).unwrap().commit(Wakeup::Adaptive);
        assert_eq!(ring.stats().wakeups, 1);

        // The consumer has not caught up with the second record.
        producer.reserve(8).unwrap().commit(Wakeup::Adaptive);
        assert_eq!(ring.stats().wakeups, 1);

        producer.reserve(8).unwrap().commit(Wakeup::Force);
        assert_eq!(ring.stats().wakeups, 2);
    }

    #[test]
    fn test_output_copies() {
        let ring = RingBuffer::new(page_size()).unwrap();
        let producer = ring.producer();
        assert!(producer.output(b"hello", Wakeup::Suppress));
        let mut seen = Vec::new();
        ring.consumer().consume(|record| seen.push(record.to_vec()));
        assert_eq!(seen, vec![b"hello".to_vec()]);
    }
}
