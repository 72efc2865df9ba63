//! Recycling allocator for lock-free hash entries.
//!
//! Entries removed from a structure are not freed; they are stamped with the
//! global transaction id and parked on the removing worker's retired list.
//! Once the minimum active id advances past the stamp the entry moves back
//! to the shared available pool and can be claimed again. Entries are only
//! returned to the OS when the freelist is dropped.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use parking_lot::lock_api::RawMutex as _;

use crate::tran::{NULL_TRAN_ID, TranEntry, TranSystem};

/// Behavior on a key collision during `insert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateAction {
    /// Wait for the existing entry to disappear, then retry.
    SpinWait,
    /// The descriptor modified the key in place; restart the insert with it.
    ModifyKeyRestart,
}

/// Per-element-type descriptor: key ordering and hashing, data lifecycle
/// hooks, and the locking strategy, chosen statically.
pub trait EntryDescriptor: Sized + Send + Sync + 'static {
    type Key: Clone + Send + Sync + 'static;
    type Data: Send + Sync + 'static;

    /// Entry-locked strategy: a successful find returns with the embedded
    /// entry mutex held and the caller releases it by dropping the handle.
    /// Without it, readers are protected by their open transaction alone
    /// and entries must be immutable after insert.
    const USES_MUTEX: bool;

    fn alloc_data() -> Self::Data;
    /// Reset recycled data before the entry is published.
    fn init_data(_data: &Self::Data) {}
    /// Tear down data when the entry is retired.
    fn uninit_data(_data: &Self::Data) {}

    fn key_cmp(a: &Self::Key, b: &Self::Key) -> std::cmp::Ordering;
    fn key_hash(key: &Self::Key, table_size: usize) -> usize;

    /// Key collision policy for `insert`.
    fn on_duplicate(_key: &mut Self::Key) -> DuplicateAction {
        DuplicateAction::SpinWait
    }
}

/// An intrusive hash entry. `next` is the bucket chain (low pointer bit set
/// while the entry is being unlinked); `local_next` threads the freelist and
/// retired lists.
pub struct Node<D: EntryDescriptor> {
    pub(crate) next: AtomicPtr<Node<D>>,
    pub(crate) local_next: AtomicPtr<Node<D>>,
    /// Transaction id of the delete that removed this entry;
    /// [`NULL_TRAN_ID`] while the entry is live.
    pub(crate) del_tran_id: AtomicU64,
    pub(crate) mutex: parking_lot::RawMutex,
    pub(crate) key: UnsafeCell<Option<D::Key>>,
    pub(crate) data: D::Data,
}

unsafe impl<D: EntryDescriptor> Send for Node<D> {}
unsafe impl<D: EntryDescriptor> Sync for Node<D> {}

impl<D: EntryDescriptor> Node<D> {
    fn new_boxed() -> *mut Node<D> {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            local_next: AtomicPtr::new(ptr::null_mut()),
            del_tran_id: AtomicU64::new(NULL_TRAN_ID),
            mutex: parking_lot::RawMutex::INIT,
            key: UnsafeCell::new(None),
            data: D::alloc_data(),
        }))
    }

    /// # Safety
    /// The key must have been written and the node must be reachable only
    /// through a protected traversal or exclusive ownership.
    pub(crate) unsafe fn key(&self) -> &D::Key {
        unsafe { (*self.key.get()).as_ref().expect("node key not set") }
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.del_tran_id.load(Ordering::Acquire) != NULL_TRAN_ID
    }
}

pub struct Freelist<D: EntryDescriptor> {
    /// Shared pool of reusable entries, linked through `local_next`.
    available: AtomicPtr<Node<D>>,
    /// Retired-list head per transaction-table slot; each is owned by the
    /// worker currently holding that slot.
    retired: Box<[UnsafeCell<*mut Node<D>>]>,
    block_size: usize,
    max_alloc: usize,
    alloc_cnt: AtomicUsize,
    available_cnt: AtomicUsize,
    retired_cnt: AtomicUsize,
    tran_system: Arc<TranSystem>,
}

unsafe impl<D: EntryDescriptor> Send for Freelist<D> {}
unsafe impl<D: EntryDescriptor> Sync for Freelist<D> {}

impl<D: EntryDescriptor> Freelist<D> {
    pub fn new(
        tran_system: Arc<TranSystem>,
        initial_blocks: usize,
        block_size: usize,
        max_alloc: usize,
        tran_slots: usize,
    ) -> Freelist<D> {
        let retired = (0..tran_slots)
            .map(|_| UnsafeCell::new(ptr::null_mut()))
            .collect();
        let freelist = Freelist {
            available: AtomicPtr::new(ptr::null_mut()),
            retired,
            block_size: block_size.max(1),
            max_alloc,
            alloc_cnt: AtomicUsize::new(0),
            available_cnt: AtomicUsize::new(0),
            retired_cnt: AtomicUsize::new(0),
            tran_system,
        };
        for _ in 0..initial_blocks {
            freelist.alloc_block();
        }
        freelist
    }

    pub fn alloc_count(&self) -> usize {
        self.alloc_cnt.load(Ordering::Relaxed)
    }

    pub fn available_count(&self) -> usize {
        self.available_cnt.load(Ordering::Relaxed)
    }

    pub fn retired_count(&self) -> usize {
        self.retired_cnt.load(Ordering::Relaxed)
    }

    pub fn tran_system(&self) -> &Arc<TranSystem> {
        &self.tran_system
    }

    fn alloc_block(&self) {
        let mut head = ptr::null_mut();
        for _ in 0..self.block_size {
            let node = Node::<D>::new_boxed();
            unsafe {
                (*node).local_next.store(head, Ordering::Relaxed);
            }
            head = node;
        }
        self.alloc_cnt.fetch_add(self.block_size, Ordering::Relaxed);
        self.available_cnt
            .fetch_add(self.block_size, Ordering::Relaxed);
        self.push_chain(head);
        if self.alloc_cnt.load(Ordering::Relaxed) > self.max_alloc {
            log::warn!(
                "freelist exceeded soft allocation bound ({} > {})",
                self.alloc_cnt.load(Ordering::Relaxed),
                self.max_alloc
            );
        }
    }

    /// Push a `local_next`-linked chain onto the available pool. A plain CAS
    /// push is safe here; the ABA hazard only affects pops.
    fn push_chain(&self, chain: *mut Node<D>) {
        if chain.is_null() {
            return;
        }
        let mut tail = chain;
        unsafe {
            while !(*tail).local_next.load(Ordering::Relaxed).is_null() {
                tail = (*tail).local_next.load(Ordering::Relaxed);
            }
        }
        loop {
            let head = self.available.load(Ordering::Acquire);
            unsafe {
                (*tail).local_next.store(head, Ordering::Relaxed);
            }
            if self
                .available
                .compare_exchange(head, chain, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pop one entry from the available pool. The whole pool is detached
    /// with a single swap and the remainder spliced back, so no CAS ever
    /// acts on a stale `local_next` (the classic Treiber ABA).
    fn pop_available(&self) -> Option<*mut Node<D>> {
        let head = self.available.swap(ptr::null_mut(), Ordering::AcqRel);
        if head.is_null() {
            return None;
        }
        let rest = unsafe { (*head).local_next.load(Ordering::Relaxed) };
        unsafe {
            (*head).local_next.store(ptr::null_mut(), Ordering::Relaxed);
        }
        self.push_chain(rest);
        self.available_cnt.fetch_sub(1, Ordering::Relaxed);
        Some(head)
    }

    /// Claim a reusable entry, allocating a fresh block when the pool is
    /// dry. Runs an opportunistic retired-list cleanup first.
    pub fn claim(&self, tran: &TranEntry) -> *mut Node<D> {
        if tran.cleanup_necessary() {
            self.transport(tran);
        }
        loop {
            if let Some(node) = self.pop_available() {
                unsafe {
                    (*node).del_tran_id.store(NULL_TRAN_ID, Ordering::Release);
                    (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
                }
                D::init_data(unsafe { &(*node).data });
                return node;
            }
            self.alloc_block();
        }
    }

    /// Return a claimed-but-never-published entry directly to the pool.
    pub fn reclaim_unused(&self, node: *mut Node<D>) {
        unsafe {
            D::uninit_data(&(*node).data);
            *(*node).key.get() = None;
            (*node).local_next.store(ptr::null_mut(), Ordering::Relaxed);
        }
        self.available_cnt.fetch_add(1, Ordering::Relaxed);
        self.push_chain(node);
    }

    /// Park a removed entry on the caller's retired list, stamped with a
    /// fresh global transaction id.
    ///
    /// # Safety
    /// The node must have been unlinked from every bucket chain and must not
    /// be retired twice.
    pub unsafe fn retire(&self, tran: &TranEntry, node: *mut Node<D>) {
        // Stamp with the global id as of now, after the unlink: any reader
        // that could still reach the node holds an id <= the stamp, and
        // reclamation requires the minimum to move strictly past it.
        // Key and data stay intact until transport; readers that loaded the
        // node before the unlink may still be peeking at them.
        let stamp = self.tran_system.global_tran_id();
        unsafe {
            (*node).del_tran_id.store(stamp, Ordering::Release);
            let slot = self.retired[tran.index()].get();
            (*node).local_next.store(*slot, Ordering::Relaxed);
            *slot = node;
        }
        self.retired_cnt.fetch_add(1, Ordering::Relaxed);
    }

    /// Move the caller's reclaimable retired entries back to the available
    /// pool: everything stamped before the minimum active transaction id.
    pub fn transport(&self, tran: &TranEntry) {
        self.tran_system.compute_min_active_id();
        let min_active = self.tran_system.min_active_tran_id();
        let slot = self.retired[tran.index()].get();

        let mut keep: *mut Node<D> = ptr::null_mut();
        let mut reusable: *mut Node<D> = ptr::null_mut();
        let mut moved = 0usize;
        unsafe {
            let mut curr = *slot;
            while !curr.is_null() {
                let next = (*curr).local_next.load(Ordering::Relaxed);
                if (*curr).del_tran_id.load(Ordering::Acquire) < min_active {
                    // Unreachable by every live transaction; now it is safe
                    // to tear the entry down.
                    D::uninit_data(&(*curr).data);
                    *(*curr).key.get() = None;
                    (*curr).local_next.store(reusable, Ordering::Relaxed);
                    reusable = curr;
                    moved += 1;
                } else {
                    (*curr).local_next.store(keep, Ordering::Relaxed);
                    keep = curr;
                }
                curr = next;
            }
            *slot = keep;
        }
        if moved > 0 {
            self.retired_cnt.fetch_sub(moved, Ordering::Relaxed);
            self.available_cnt.fetch_add(moved, Ordering::Relaxed);
            self.push_chain(reusable);
        }
        tran.set_last_cleanup_id(min_active);
    }
}

impl<D: EntryDescriptor> Drop for Freelist<D> {
    fn drop(&mut self) {
        unsafe {
            let mut curr = self.available.swap(ptr::null_mut(), Ordering::AcqRel);
            while !curr.is_null() {
                let next = (*curr).local_next.load(Ordering::Relaxed);
                drop(Box::from_raw(curr));
                curr = next;
            }
            for slot in &self.retired {
                let mut curr = *slot.get();
                while !curr.is_null() {
                    let next = (*curr).local_next.load(Ordering::Relaxed);
                    drop(Box::from_raw(curr));
                    curr = next;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use pretty_assertions::assert_eq;

    use super::{EntryDescriptor, Freelist};
    use crate::tran::TranSystem;

    struct Plain;

    impl EntryDescriptor for Plain {
        type Key = u32;
        type Data = AtomicU32;

        const USES_MUTEX: bool = false;

        fn alloc_data() -> AtomicU32 {
            AtomicU32::new(0)
        }

        fn key_cmp(a: &u32, b: &u32) -> std::cmp::Ordering {
            a.cmp(b)
        }

        fn key_hash(key: &u32, table_size: usize) -> usize {
            *key as usize % table_size
        }
    }

    #[test]
    fn claim_draws_blocks_on_demand() {
        let system = TranSystem::new(2, 10);
        let freelist: Freelist<Plain> =
            Freelist::new(std::sync::Arc::clone(&system), 0, 4, usize::MAX, 2);
        assert_eq!(freelist.alloc_count(), 0);

        let tran = system.request_entry().unwrap();
        tran.start_tran_with_mb(true);
        let node = freelist.claim(&tran);
        tran.end_tran_with_mb();
        assert_eq!(freelist.alloc_count(), 4);
        assert_eq!(freelist.available_count(), 3);
        freelist.reclaim_unused(node);
        assert_eq!(freelist.available_count(), 4);
    }

    #[test]
    fn retired_nodes_return_once_readers_move_on() {
        let system = TranSystem::new(3, 1);
        let freelist: Freelist<Plain> =
            Freelist::new(std::sync::Arc::clone(&system), 1, 4, usize::MAX, 3);
        let writer = system.request_entry().unwrap();
        let reader = system.request_entry().unwrap();

        // A reader enters before the retire.
        reader.start_tran_with_mb(false);

        writer.start_tran_with_mb(true);
        let node = freelist.claim(&writer);
        unsafe { freelist.retire(&writer, node) };
        writer.end_tran_with_mb();
        assert_eq!(freelist.retired_count(), 1);

        // The reader still holds its transaction: nothing to transport.
        freelist.transport(&writer);
        assert_eq!(freelist.retired_count(), 1);

        // Reader exits; the id advances past the stamp and the node moves
        // back to the pool.
        reader.end_tran_with_mb();
        writer.start_tran_with_mb(true);
        writer.end_tran_with_mb();
        freelist.transport(&writer);
        assert_eq!(freelist.retired_count(), 0);
        assert_eq!(freelist.available_count(), 4);
    }
}
