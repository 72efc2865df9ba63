//! Bounded MPMC circular queue.
//!
//! Each slot carries a four-state machine; a producer or consumer first
//! reserves the slot at its cursor with a CAS on the state, moves the data,
//! advances the shared cursor, and only then publishes the next state. The
//! thread holding a reservation is the only one allowed to advance the slot,
//! so slots never tear. FIFO order across concurrent producers is not
//! guaranteed.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const READY_PRODUCE: u32 = 0;
const RESERVED_PRODUCE: u32 = 1;
const READY_CONSUME: u32 = 2;
const RESERVED_CONSUME: u32 = 3;

pub struct LfCircularQueue<T> {
    capacity: u64,
    mask: u64,
    produce_cursor: AtomicU64,
    consume_cursor: AtomicU64,
    entry_state: Box<[AtomicU32]>,
    data: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

unsafe impl<T: Send> Send for LfCircularQueue<T> {}
unsafe impl<T: Send> Sync for LfCircularQueue<T> {}

impl<T> LfCircularQueue<T> {
    /// Capacity is rounded up to a power of two so the slot index is a mask.
    pub fn new(capacity: usize) -> LfCircularQueue<T> {
        let capacity = capacity.max(2).next_power_of_two() as u64;
        let entry_state = (0..capacity).map(|_| AtomicU32::new(READY_PRODUCE)).collect();
        let data = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        LfCircularQueue {
            capacity,
            mask: capacity - 1,
            produce_cursor: AtomicU64::new(0),
            consume_cursor: AtomicU64::new(0),
            entry_state,
            data,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn is_empty(&self) -> bool {
        self.consume_cursor.load(Ordering::SeqCst) == self.produce_cursor.load(Ordering::SeqCst)
    }

    pub fn is_full(&self) -> bool {
        self.produce_cursor
            .load(Ordering::SeqCst)
            .wrapping_sub(self.consume_cursor.load(Ordering::SeqCst))
            >= self.capacity
    }

    /// Approximate number of occupied slots.
    pub fn size(&self) -> usize {
        self.produce_cursor
            .load(Ordering::SeqCst)
            .wrapping_sub(self.consume_cursor.load(Ordering::SeqCst))
            .min(self.capacity) as usize
    }

    /// Push one item. Returns the item back when the queue is full.
    pub fn produce(&self, item: T) -> Result<(), T> {
        loop {
            if self.is_full() {
                return Err(item);
            }
            let cursor = self.produce_cursor.load(Ordering::SeqCst);
            let index = (cursor & self.mask) as usize;
            match self.entry_state[index].compare_exchange(
                READY_PRODUCE,
                RESERVED_PRODUCE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    unsafe {
                        (*self.data[index].get()).write(item);
                    }
                    // Advance the cursor we reserved at; a parallel producer
                    // may already have nudged it past us.
                    let _ = self.produce_cursor.compare_exchange(
                        cursor,
                        cursor.wrapping_add(1),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                    self.entry_state[index].store(READY_CONSUME, Ordering::Release);
                    return Ok(());
                }
                Err(RESERVED_PRODUCE) => {
                    // Another producer holds the slot but has not advanced
                    // the cursor yet. Nudge it so we stop spinning here.
                    let _ = self.produce_cursor.compare_exchange(
                        cursor,
                        cursor.wrapping_add(1),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                }
                Err(RESERVED_CONSUME) => {
                    // The slot one lap behind is still being drained; treat
                    // as full rather than risk an ABA overwrite.
                    return Err(item);
                }
                Err(_) => {
                    // READY_CONSUME: the cursor moved under us; retry.
                }
            }
        }
    }

    /// Pop one item, or `None` when the queue is empty (or its head is still
    /// mid-production).
    pub fn consume(&self) -> Option<T> {
        loop {
            if self.is_empty() {
                return None;
            }
            let cursor = self.consume_cursor.load(Ordering::SeqCst);
            let index = (cursor & self.mask) as usize;
            match self.entry_state[index].compare_exchange(
                READY_CONSUME,
                RESERVED_CONSUME,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let item = unsafe { (*self.data[index].get()).assume_init_read() };
                    let _ = self.consume_cursor.compare_exchange(
                        cursor,
                        cursor.wrapping_add(1),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                    self.entry_state[index].store(READY_PRODUCE, Ordering::Release);
                    return Some(item);
                }
                Err(RESERVED_CONSUME) => {
                    let _ = self.consume_cursor.compare_exchange(
                        cursor,
                        cursor.wrapping_add(1),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                }
                Err(RESERVED_PRODUCE) => {
                    // Head is still being produced; report empty.
                    return None;
                }
                Err(_) => {
                    // READY_PRODUCE: the cursor moved under us; retry.
                }
            }
        }
    }
}

impl<T> Drop for LfCircularQueue<T> {
    fn drop(&mut self) {
        while self.consume().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::LfCircularQueue;

    #[test]
    fn fills_to_capacity_then_rejects() {
        let queue = LfCircularQueue::new(4);
        for i in 1..=4 {
            assert!(queue.produce(i).is_ok());
        }
        assert_eq!(queue.produce(5), Err(5));

        let mut drained: Vec<i32> = std::iter::from_fn(|| queue.consume()).collect();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let queue = LfCircularQueue::<u8>::new(5);
        assert_eq!(queue.capacity(), 8);
    }

    #[test]
    fn produced_multiset_equals_consumed_multiset() {
        const PRODUCERS: u64 = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: u64 = 5_000;

        let queue = Arc::new(LfCircularQueue::new(64));
        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            producers.push(std::thread::spawn(move || {
                let mut produced = Vec::new();
                for i in 0..PER_PRODUCER {
                    let mut value = p * PER_PRODUCER + i;
                    loop {
                        match queue.produce(value) {
                            Ok(()) => break,
                            Err(back) => {
                                value = back;
                                std::thread::yield_now();
                            }
                        }
                    }
                    produced.push(p * PER_PRODUCER + i);
                }
                produced
            }));
        }

        let total = PRODUCERS * PER_PRODUCER;
        let consumed_target = total / CONSUMERS as u64;
        let mut consumers = Vec::new();
        for _ in 0..CONSUMERS {
            let queue = Arc::clone(&queue);
            consumers.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                while (seen.len() as u64) < consumed_target {
                    match queue.consume() {
                        Some(v) => seen.push(v),
                        None => std::thread::yield_now(),
                    }
                }
                seen
            }));
        }

        let mut produced: Vec<u64> = producers
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let mut consumed: Vec<u64> = consumers
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        produced.sort_unstable();
        consumed.sort_unstable();
        assert_eq!(produced, consumed);

        // No duplicates slipped through.
        let mut counts: BTreeMap<u64, usize> = BTreeMap::new();
        for v in consumed {
            *counts.entry(v).or_default() += 1;
        }
        assert!(counts.values().all(|&c| c == 1));
    }

    #[test]
    fn occupancy_never_exceeds_capacity() {
        let queue = Arc::new(LfCircularQueue::new(8));
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                for i in 0..10_000u32 {
                    while queue.produce(i).is_err() {
                        std::thread::yield_now();
                    }
                }
            })
        };
        let mut drained = 0u32;
        while drained < 10_000 {
            assert!(queue.size() <= queue.capacity());
            if queue.consume().is_some() {
                drained += 1;
            }
        }
        producer.join().unwrap();
    }
}
