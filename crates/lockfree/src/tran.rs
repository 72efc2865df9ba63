//! Transaction (epoch) system governing safe memory reclamation.
//!
//! Every worker that traverses a lock-free structure claims a transaction
//! entry and publishes the global transaction id on entry. A node removed
//! from a structure is stamped with the global id and may only be reclaimed
//! once the minimum published id of all workers has advanced past the stamp.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering, fence};

use squill_lib_core::errors::{Result, SquillError};

use crate::bitmap::Bitmap;

/// Sentinel for "no transaction published".
pub const NULL_TRAN_ID: u64 = u64::MAX;

struct TranSlot {
    /// Id of the transaction currently published by the owning worker, or
    /// [`NULL_TRAN_ID`].
    transaction_id: AtomicU64,
    /// Last id for which the owner performed retired-list cleanup.
    /// Owner-written only.
    last_cleanup_id: AtomicU64,
}

pub struct TranSystem {
    slots: Box<[TranSlot]>,
    bitmap: Bitmap,
    global_tran_id: AtomicU64,
    min_active_tran_id: AtomicU64,
    /// Transactions between recomputations of the minimum active id.
    mati_refresh_interval: u64,
    used_entry_count: AtomicUsize,
}

impl TranSystem {
    pub fn new(max_workers: usize, mati_refresh_interval: u64) -> Arc<TranSystem> {
        let slots = (0..max_workers)
            .map(|_| TranSlot {
                transaction_id: AtomicU64::new(NULL_TRAN_ID),
                last_cleanup_id: AtomicU64::new(0),
            })
            .collect();
        Arc::new(TranSystem {
            slots,
            bitmap: Bitmap::new(max_workers),
            global_tran_id: AtomicU64::new(1),
            min_active_tran_id: AtomicU64::new(0),
            mati_refresh_interval: mati_refresh_interval.max(1),
            used_entry_count: AtomicUsize::new(0),
        })
    }

    /// Claim a transaction entry for the calling worker. Exhaustion is an
    /// error the caller may retry after other workers return entries.
    pub fn request_entry(self: &Arc<TranSystem>) -> Result<TranEntry> {
        let idx = self
            .bitmap
            .claim()
            .ok_or(SquillError::TranEntriesExhausted)?;
        self.used_entry_count.fetch_add(1, Ordering::Relaxed);
        Ok(TranEntry {
            system: Arc::clone(self),
            idx,
        })
    }

    pub fn used_entry_count(&self) -> usize {
        self.used_entry_count.load(Ordering::Relaxed)
    }

    /// Total number of transaction-table slots.
    pub fn slot_capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn global_tran_id(&self) -> u64 {
        self.global_tran_id.load(Ordering::SeqCst)
    }

    /// Most recently computed lower bound on published ids.
    pub fn min_active_tran_id(&self) -> u64 {
        self.min_active_tran_id.load(Ordering::SeqCst)
    }

    /// Recompute the minimum published transaction id over all entries.
    /// Inactive entries publish [`NULL_TRAN_ID`] and drop out of the
    /// minimum naturally.
    pub fn compute_min_active_id(&self) {
        let mut min = self.global_tran_id.load(Ordering::SeqCst);
        for slot in &self.slots {
            let id = slot.transaction_id.load(Ordering::SeqCst);
            min = min.min(id);
        }
        self.min_active_tran_id.store(min, Ordering::SeqCst);
    }
}

/// A claimed transaction-table slot. Dropping the handle ends any open
/// transaction and returns the slot.
pub struct TranEntry {
    system: Arc<TranSystem>,
    idx: usize,
}

impl TranEntry {
    fn slot(&self) -> &TranSlot {
        &self.system.slots[self.idx]
    }

    pub fn system(&self) -> &Arc<TranSystem> {
        &self.system
    }

    pub fn index(&self) -> usize {
        self.idx
    }

    /// Currently published transaction id, [`NULL_TRAN_ID`] when inactive.
    pub fn transaction_id(&self) -> u64 {
        self.slot().transaction_id.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.transaction_id() != NULL_TRAN_ID
    }

    /// Publish the current global id. With `incr`, bump the global id first
    /// so writers order themselves against readers; every
    /// `mati_refresh_interval`-th increment also refreshes the minimum.
    pub fn start_tran_incr(&self, incr: bool) {
        let system = &*self.system;
        let id = if incr {
            let id = system.global_tran_id.fetch_add(1, Ordering::SeqCst) + 1;
            if id % system.mati_refresh_interval == 0 {
                system.compute_min_active_id();
            }
            id
        } else {
            system.global_tran_id.load(Ordering::SeqCst)
        };
        self.slot().transaction_id.store(id, Ordering::SeqCst);
    }

    pub fn start_tran(&self) {
        self.start_tran_incr(false);
    }

    /// `start_tran` followed by a full barrier: reads of the protected
    /// structure cannot be reordered before the id is published.
    pub fn start_tran_with_mb(&self, incr: bool) {
        self.start_tran_incr(incr);
        fence(Ordering::SeqCst);
    }

    pub fn end_tran(&self) {
        debug_assert!(self.is_active());
        self.slot()
            .transaction_id
            .store(NULL_TRAN_ID, Ordering::SeqCst);
    }

    /// Full barrier then `end_tran`: prior writes are visible before the
    /// entry exits.
    pub fn end_tran_with_mb(&self) {
        fence(Ordering::SeqCst);
        self.end_tran();
    }

    pub fn last_cleanup_id(&self) -> u64 {
        self.slot().last_cleanup_id.load(Ordering::Relaxed)
    }

    pub fn set_last_cleanup_id(&self, id: u64) {
        self.slot().last_cleanup_id.store(id, Ordering::Relaxed);
    }

    /// True when retired nodes stamped before the minimum active id exist,
    /// i.e. a cleanup pass can make progress.
    pub fn cleanup_necessary(&self) -> bool {
        self.system.min_active_tran_id() > self.last_cleanup_id()
    }
}

impl Drop for TranEntry {
    fn drop(&mut self) {
        if self.is_active() {
            self.end_tran();
        }
        self.system.used_entry_count.fetch_sub(1, Ordering::Relaxed);
        self.system.bitmap.release(self.idx);
    }
}
