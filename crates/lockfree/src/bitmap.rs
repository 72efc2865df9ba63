//! Slot bitmap used to hand out transaction-table entries without locking.

use std::sync::atomic::{AtomicUsize, Ordering};

const BITS: usize = usize::BITS as usize;

pub struct Bitmap {
    words: Box<[AtomicUsize]>,
    capacity: usize,
}

impl Bitmap {
    pub fn new(capacity: usize) -> Bitmap {
        let word_count = capacity.div_ceil(BITS);
        let words = (0..word_count).map(|_| AtomicUsize::new(0)).collect();
        Bitmap { words, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claim the first clear bit. Returns the claimed index, or `None` when
    /// every slot is taken.
    pub fn claim(&self) -> Option<usize> {
        for (w, word) in self.words.iter().enumerate() {
            loop {
                let current = word.load(Ordering::Acquire);
                if current == usize::MAX {
                    break;
                }
                let bit = (!current).trailing_zeros() as usize;
                let idx = w * BITS + bit;
                if idx >= self.capacity {
                    return None;
                }
                if word
                    .compare_exchange(
                        current,
                        current | (1 << bit),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return Some(idx);
                }
            }
        }
        None
    }

    /// Release a previously claimed index.
    pub fn release(&self, idx: usize) {
        assert!(idx < self.capacity);
        let mask = !(1usize << (idx % BITS));
        self.words[idx / BITS].fetch_and(mask, Ordering::AcqRel);
    }

    pub fn is_set(&self, idx: usize) -> bool {
        self.words[idx / BITS].load(Ordering::Acquire) & (1 << (idx % BITS)) != 0
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::Bitmap;

    #[test]
    fn claims_are_distinct_and_reusable() {
        let bitmap = Bitmap::new(3);
        let a = bitmap.claim().unwrap();
        let b = bitmap.claim().unwrap();
        let c = bitmap.claim().unwrap();
        assert_eq!(bitmap.claim(), None);
        let mut got = vec![a, b, c];
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2]);

        bitmap.release(b);
        assert_eq!(bitmap.claim(), Some(b));
    }

    #[test]
    fn concurrent_claims_never_collide() {
        use std::sync::Arc;

        let bitmap = Arc::new(Bitmap::new(64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let bitmap = Arc::clone(&bitmap);
            handles.push(std::thread::spawn(move || {
                (0..8).map(|_| bitmap.claim().unwrap()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 64);
    }
}
