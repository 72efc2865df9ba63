//! Lock-free hash map with sorted bucket chains.
//!
//! Collisions chain through the intrusive `next` pointer, kept sorted by key
//! so the insertion CAS point is deterministic. Removal is two-phase: the
//! victim's own `next` pointer is marked (low bit) and the predecessor is
//! then swung past it; traversals help complete the unlink. Memory safety is
//! provided by the transaction system — a traversal holds an open
//! transaction, and unlinked entries are only recycled once every
//! transaction that could have seen them has ended.

use std::ops::Deref;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::lock_api::RawMutex as _;

use crate::freelist::{DuplicateAction, EntryDescriptor, Freelist, Node};
use crate::tran::{TranEntry, TranSystem};

fn is_marked<D: EntryDescriptor>(p: *mut Node<D>) -> bool {
    (p as usize) & 1 == 1
}

fn marked<D: EntryDescriptor>(p: *mut Node<D>) -> *mut Node<D> {
    ((p as usize) | 1) as *mut Node<D>
}

fn unmarked<D: EntryDescriptor>(p: *mut Node<D>) -> *mut Node<D> {
    ((p as usize) & !1) as *mut Node<D>
}

/// A found entry. For entry-locked tables the embedded mutex is held and
/// released on drop; for pure lock-free tables the handle keeps the finder's
/// transaction open instead, so the data cannot be recycled underneath it.
pub struct FoundEntry<'t, D: EntryDescriptor> {
    node: *mut Node<D>,
    tran: &'t TranEntry,
    mutex_held: bool,
    tran_held: bool,
}

impl<'t, D: EntryDescriptor> FoundEntry<'t, D> {
    pub fn key(&self) -> &D::Key {
        unsafe { (*self.node).key() }
    }

    pub(crate) fn node_ptr(&self) -> *mut Node<D> {
        self.node
    }

    pub(crate) fn tran(&self) -> &'t TranEntry {
        self.tran
    }
}

impl<D: EntryDescriptor> Deref for FoundEntry<'_, D> {
    type Target = D::Data;

    fn deref(&self) -> &D::Data {
        unsafe { &(*self.node).data }
    }
}

impl<D: EntryDescriptor> Drop for FoundEntry<'_, D> {
    fn drop(&mut self) {
        if self.mutex_held {
            unsafe { (*self.node).mutex.unlock() };
        }
        if self.tran_held {
            self.tran.end_tran_with_mb();
        }
    }
}

enum WalkOutcome<D: EntryDescriptor> {
    Found(*mut Node<D>),
    NotFound {
        prev: *const AtomicPtr<Node<D>>,
        curr: *mut Node<D>,
    },
    Restart,
}

pub struct LfHashTable<D: EntryDescriptor> {
    buckets: Box<[AtomicPtr<Node<D>>]>,
    /// Same-size buffer the non-concurrent `clear` parks chains in, plus the
    /// mutex serializing such maintenance passes.
    backbuffer: Box<[AtomicPtr<Node<D>>]>,
    backbuffer_mutex: parking_lot::Mutex<()>,
    hash_size: usize,
    freelist: Freelist<D>,
    element_cnt: AtomicUsize,
}

unsafe impl<D: EntryDescriptor> Send for LfHashTable<D> {}
unsafe impl<D: EntryDescriptor> Sync for LfHashTable<D> {}

impl<D: EntryDescriptor> LfHashTable<D> {
    pub fn new(
        tran_system: Arc<TranSystem>,
        hash_size: usize,
        freelist_blocks: usize,
        freelist_block_size: usize,
        freelist_max_alloc: usize,
    ) -> LfHashTable<D> {
        let hash_size = hash_size.max(1);
        let buckets = (0..hash_size)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        let backbuffer = (0..hash_size)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        let slots = tran_system.slot_capacity();
        LfHashTable {
            buckets,
            backbuffer,
            backbuffer_mutex: parking_lot::Mutex::new(()),
            hash_size,
            freelist: Freelist::new(
                tran_system,
                freelist_blocks,
                freelist_block_size,
                freelist_max_alloc,
                slots,
            ),
            element_cnt: AtomicUsize::new(0),
        }
    }

    pub fn hash_size(&self) -> usize {
        self.hash_size
    }

    pub fn element_count(&self) -> usize {
        self.element_cnt.load(Ordering::Relaxed)
    }

    pub fn alloc_element_count(&self) -> usize {
        self.freelist.alloc_count()
    }

    pub fn freelist(&self) -> &Freelist<D> {
        &self.freelist
    }

    fn bucket(&self, key: &D::Key) -> &AtomicPtr<Node<D>> {
        &self.buckets[D::key_hash(key, self.hash_size) % self.hash_size]
    }

    /// Walk one sorted chain. Helps complete pending unlinks along the way;
    /// a failed help CAS forces a restart from the bucket head.
    fn walk(&self, head: &AtomicPtr<Node<D>>, key: &D::Key) -> WalkOutcome<D> {
        let mut prev: *const AtomicPtr<Node<D>> = head;
        let mut curr = unsafe { (*prev).load(Ordering::Acquire) };
        loop {
            debug_assert!(!is_marked::<D>(curr));
            if curr.is_null() {
                return WalkOutcome::NotFound { prev, curr };
            }
            let next = unsafe { (*curr).next.load(Ordering::Acquire) };
            if is_marked::<D>(next) {
                // A removal is in flight; swing the predecessor past it.
                match unsafe {
                    (*prev).compare_exchange(
                        curr,
                        unmarked::<D>(next),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                } {
                    Ok(_) => {
                        curr = unmarked::<D>(next);
                        continue;
                    }
                    Err(_) => return WalkOutcome::Restart,
                }
            }
            match D::key_cmp(unsafe { (*curr).key() }, key) {
                std::cmp::Ordering::Less => {
                    prev = unsafe { &(*curr).next };
                    curr = next;
                }
                std::cmp::Ordering::Equal => return WalkOutcome::Found(curr),
                std::cmp::Ordering::Greater => return WalkOutcome::NotFound { prev, curr },
            }
        }
    }

    /// Look up `key`. See [`FoundEntry`] for the protection the returned
    /// handle carries.
    pub fn find<'t>(&self, tran: &'t TranEntry, key: &D::Key) -> Option<FoundEntry<'t, D>> {
        loop {
            tran.start_tran_with_mb(false);
            let head = self.bucket(key);
            match self.walk(head, key) {
                WalkOutcome::Restart => {
                    tran.end_tran_with_mb();
                    continue;
                }
                WalkOutcome::NotFound { .. } => {
                    tran.end_tran_with_mb();
                    return None;
                }
                WalkOutcome::Found(node) => {
                    if D::USES_MUTEX {
                        unsafe { (*node).mutex.lock() };
                        if unsafe { (*node).is_deleted() } {
                            unsafe { (*node).mutex.unlock() };
                            tran.end_tran_with_mb();
                            continue;
                        }
                        tran.end_tran_with_mb();
                        return Some(FoundEntry {
                            node,
                            tran,
                            mutex_held: true,
                            tran_held: false,
                        });
                    }
                    return Some(FoundEntry {
                        node,
                        tran,
                        mutex_held: false,
                        tran_held: true,
                    });
                }
            }
        }
    }

    /// Insert `key` with a freshly initialized entry. On a collision the
    /// descriptor's duplicate policy runs: spin until the holder disappears,
    /// or modify the key in place and retry. Returns the published entry.
    pub fn insert<'t>(&self, tran: &'t TranEntry, key: &mut D::Key) -> FoundEntry<'t, D> {
        loop {
            match self.insert_internal(tran, key, false) {
                InsertOutcome::Inserted(entry) => return entry,
                InsertOutcome::Duplicate => match D::on_duplicate(key) {
                    DuplicateAction::ModifyKeyRestart => continue,
                    DuplicateAction::SpinWait => std::thread::yield_now(),
                },
            }
        }
    }

    /// Find `key`, inserting a fresh entry if absent. The boolean is true
    /// when this call performed the insert.
    pub fn find_or_insert<'t>(
        &self,
        tran: &'t TranEntry,
        key: &D::Key,
    ) -> (FoundEntry<'t, D>, bool) {
        let mut key = key.clone();
        loop {
            if let Some(existing) = self.find(tran, &key) {
                return (existing, false);
            }
            if let InsertOutcome::Inserted(entry) = self.insert_internal(tran, &mut key, true) {
                return (entry, true);
            }
            // Lost the race to a parallel insert of the same key.
        }
    }

    fn insert_internal<'t>(
        &self,
        tran: &'t TranEntry,
        key: &mut D::Key,
        _find_or_insert: bool,
    ) -> InsertOutcome<'t, D> {
        let mut claimed: *mut Node<D> = ptr::null_mut();
        loop {
            tran.start_tran_with_mb(true);
            let head = self.bucket(key);
            match self.walk(head, key) {
                WalkOutcome::Restart => {
                    tran.end_tran_with_mb();
                    continue;
                }
                WalkOutcome::Found(_) => {
                    tran.end_tran_with_mb();
                    if !claimed.is_null() {
                        if D::USES_MUTEX {
                            unsafe { (*claimed).mutex.unlock() };
                        }
                        self.freelist.reclaim_unused(claimed);
                    }
                    return InsertOutcome::Duplicate;
                }
                WalkOutcome::NotFound { prev, curr } => {
                    if claimed.is_null() {
                        claimed = self.freelist.claim(tran);
                        if D::USES_MUTEX {
                            // Publish the entry already locked, so nobody
                            // observes it before the caller fills it in.
                            unsafe { (*claimed).mutex.lock() };
                        }
                    }
                    unsafe {
                        *(*claimed).key.get() = Some(key.clone());
                        (*claimed).next.store(curr, Ordering::Relaxed);
                    }
                    let cas = unsafe {
                        (*prev).compare_exchange(curr, claimed, Ordering::AcqRel, Ordering::Acquire)
                    };
                    match cas {
                        Ok(_) => {
                            self.element_cnt.fetch_add(1, Ordering::Relaxed);
                            let node = claimed;
                            if D::USES_MUTEX {
                                tran.end_tran_with_mb();
                                return InsertOutcome::Inserted(FoundEntry {
                                    node,
                                    tran,
                                    mutex_held: true,
                                    tran_held: false,
                                });
                            }
                            return InsertOutcome::Inserted(FoundEntry {
                                node,
                                tran,
                                mutex_held: false,
                                tran_held: true,
                            });
                        }
                        Err(_) => {
                            tran.end_tran_with_mb();
                            // Chain moved; walk again with the claimed node
                            // in hand.
                        }
                    }
                }
            }
        }
    }

    /// Remove `key`. Returns false when absent.
    pub fn erase(&self, tran: &TranEntry, key: &D::Key) -> bool {
        loop {
            tran.start_tran_with_mb(true);
            let head = self.bucket(key);
            let node = match self.walk(head, key) {
                WalkOutcome::Restart => {
                    tran.end_tran_with_mb();
                    continue;
                }
                WalkOutcome::NotFound { .. } => {
                    tran.end_tran_with_mb();
                    return false;
                }
                WalkOutcome::Found(node) => node,
            };
            if D::USES_MUTEX {
                unsafe { (*node).mutex.lock() };
                if unsafe { (*node).is_deleted() } {
                    unsafe { (*node).mutex.unlock() };
                    tran.end_tran_with_mb();
                    continue;
                }
            }
            let removed = self.remove_node(tran, node);
            if D::USES_MUTEX {
                unsafe { (*node).mutex.unlock() };
            }
            tran.end_tran_with_mb();
            if removed {
                return true;
            }
            // Another eraser won the mark race; the key is gone either way.
            return false;
        }
    }

    /// Remove the entry behind a handle obtained from [`LfHashTable::find`]
    /// on an entry-locked table. The handle's mutex is released in the
    /// process.
    pub fn erase_locked(&self, entry: FoundEntry<'_, D>) -> bool {
        debug_assert!(D::USES_MUTEX);
        let node = entry.node_ptr();
        let tran = entry.tran();
        // The mutex transfers to us; drop must not unlock twice.
        std::mem::forget(entry);
        tran.start_tran_with_mb(true);
        let removed = self.remove_node(tran, node);
        unsafe { (*node).mutex.unlock() };
        tran.end_tran_with_mb();
        removed
    }

    /// Logically delete `node` (mark + stamp) and physically unlink it.
    /// Returns false when a parallel eraser already won the mark.
    fn remove_node(&self, tran: &TranEntry, node: *mut Node<D>) -> bool {
        // Win the right to unlink by marking the victim's next pointer.
        // Only the winner may touch the delete stamp: a late overwrite with
        // a smaller id would let reclamation run ahead of readers.
        loop {
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
            if is_marked::<D>(next) {
                return false;
            }
            if unsafe {
                (*node)
                    .next
                    .compare_exchange(
                        next,
                        marked::<D>(next),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            } {
                break;
            }
        }
        unsafe {
            (*node)
                .del_tran_id
                .store(tran.transaction_id(), Ordering::Release);
        }
        // Best-effort physical unlink; a traversal may already have helped.
        let key = unsafe { (*node).key().clone() };
        loop {
            match self.walk(self.bucket(&key), &key) {
                WalkOutcome::Restart => continue,
                _ => break,
            }
        }
        self.element_cnt.fetch_sub(1, Ordering::Relaxed);
        unsafe {
            self.freelist.retire(tran, node);
        }
        true
    }

    /// Drain every bucket. Not safe to run concurrently with other writers;
    /// serialized against other maintenance passes by the back-buffer mutex.
    pub fn clear(&self, tran: &TranEntry) {
        let _guard = self.backbuffer_mutex.lock();
        tran.start_tran_with_mb(true);
        for (bucket, park) in self.buckets.iter().zip(&self.backbuffer) {
            let head = bucket.swap(ptr::null_mut(), Ordering::AcqRel);
            park.store(head, Ordering::Relaxed);
        }
        for park in &self.backbuffer {
            let mut curr = park.swap(ptr::null_mut(), Ordering::Relaxed);
            while !curr.is_null() {
                let next = unmarked::<D>(unsafe { (*curr).next.load(Ordering::Acquire) });
                unsafe {
                    (*curr)
                        .del_tran_id
                        .store(tran.transaction_id(), Ordering::Release);
                    self.freelist.retire(tran, curr);
                }
                self.element_cnt.fetch_sub(1, Ordering::Relaxed);
                curr = next;
            }
        }
        tran.end_tran_with_mb();
    }

    pub fn iter<'a>(&'a self, tran: &'a TranEntry) -> LfHashIterator<'a, D> {
        tran.start_tran_with_mb(false);
        LfHashIterator {
            table: self,
            tran,
            bucket: 0,
            curr: ptr::null_mut(),
            started: false,
        }
    }
}

enum InsertOutcome<'t, D: EntryDescriptor> {
    Inserted(FoundEntry<'t, D>),
    Duplicate,
}

impl<D: EntryDescriptor> Drop for LfHashTable<D> {
    fn drop(&mut self) {
        for bucket in &self.buckets {
            let mut curr = unmarked::<D>(bucket.swap(ptr::null_mut(), Ordering::AcqRel));
            while !curr.is_null() {
                let next = unmarked::<D>(unsafe { (*curr).next.load(Ordering::Relaxed) });
                unsafe {
                    D::uninit_data(&(*curr).data);
                    drop(Box::from_raw(curr));
                }
                curr = next;
            }
        }
    }
}

/// Bucket-by-bucket cursor over the table. Holds a transaction open for the
/// life of the iteration; `restart` cycles the transaction so reclamation is
/// not held back on large tables, at the cost of revisiting the bucket it
/// was standing in.
pub struct LfHashIterator<'a, D: EntryDescriptor> {
    table: &'a LfHashTable<D>,
    tran: &'a TranEntry,
    bucket: usize,
    curr: *mut Node<D>,
    started: bool,
}

impl<D: EntryDescriptor> LfHashIterator<'_, D> {
    /// Advance to the next live entry, yielding its key and data.
    #[allow(clippy::should_implement_trait)]
    pub fn iterate(&mut self) -> Option<(&D::Key, &D::Data)> {
        loop {
            if !self.started || self.curr.is_null() {
                if self.started {
                    self.bucket += 1;
                }
                self.started = true;
                if self.bucket >= self.table.hash_size {
                    return None;
                }
                self.curr = unmarked::<D>(self.table.buckets[self.bucket].load(Ordering::Acquire));
                continue;
            }
            let node = self.curr;
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
            self.curr = unmarked::<D>(next);
            if is_marked::<D>(next) || unsafe { (*node).is_deleted() } {
                continue;
            }
            return Some(unsafe { ((*node).key(), &(*node).data) });
        }
    }

    /// Cycle the underlying transaction. The current bucket is rescanned
    /// from its head on the next call, since the position may be stale.
    pub fn restart(&mut self) {
        self.tran.end_tran_with_mb();
        self.tran.start_tran_with_mb(false);
        self.curr = if self.started && self.bucket < self.table.hash_size {
            unmarked::<D>(self.table.buckets[self.bucket].load(Ordering::Acquire))
        } else {
            ptr::null_mut()
        };
    }
}

impl<D: EntryDescriptor> Drop for LfHashIterator<'_, D> {
    fn drop(&mut self) {
        self.tran.end_tran_with_mb();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI64, Ordering};

    use pretty_assertions::assert_eq;

    use super::{EntryDescriptor, LfHashTable};
    use crate::freelist::DuplicateAction;
    use crate::tran::TranSystem;

    struct IntCounter;

    impl EntryDescriptor for IntCounter {
        type Key = u32;
        type Data = AtomicI64;

        const USES_MUTEX: bool = false;

        fn alloc_data() -> AtomicI64 {
            AtomicI64::new(0)
        }

        fn init_data(data: &AtomicI64) {
            data.store(0, Ordering::Relaxed);
        }

        fn key_cmp(a: &u32, b: &u32) -> std::cmp::Ordering {
            a.cmp(b)
        }

        fn key_hash(key: &u32, table_size: usize) -> usize {
            *key as usize % table_size
        }

        fn on_duplicate(key: &mut u32) -> DuplicateAction {
            *key += 1;
            DuplicateAction::ModifyKeyRestart
        }
    }

    fn new_table(workers: usize) -> (Arc<TranSystem>, LfHashTable<IntCounter>) {
        let system = TranSystem::new(workers, 10);
        let table = LfHashTable::new(Arc::clone(&system), 8, 1, 16, usize::MAX);
        (system, table)
    }

    #[test]
    fn insert_find_erase_round_trip() {
        let (system, table) = new_table(2);
        let tran = system.request_entry().unwrap();

        let mut key = 42u32;
        {
            let entry = table.insert(&tran, &mut key);
            entry.store(7, Ordering::Relaxed);
        }
        assert_eq!(key, 42);
        assert_eq!(table.element_count(), 1);

        {
            let found = table.find(&tran, &42).unwrap();
            assert_eq!(found.load(Ordering::Relaxed), 7);
        }

        assert!(table.erase(&tran, &42));
        assert!(table.find(&tran, &42).is_none());
        assert!(!table.erase(&tran, &42));
        assert_eq!(table.element_count(), 0);
    }

    #[test]
    fn duplicate_policy_modifies_key() {
        let (system, table) = new_table(2);
        let tran = system.request_entry().unwrap();

        let mut first = 5u32;
        drop(table.insert(&tran, &mut first));
        let mut second = 5u32;
        drop(table.insert(&tran, &mut second));
        assert_eq!(first, 5);
        assert_eq!(second, 6);
        assert!(table.find(&tran, &5).is_some());
        assert!(table.find(&tran, &6).is_some());
    }

    #[test]
    fn find_or_insert_reports_insertion() {
        let (system, table) = new_table(2);
        let tran = system.request_entry().unwrap();

        let (_, inserted) = table.find_or_insert(&tran, &9);
        assert!(inserted);
        let (_, inserted) = table.find_or_insert(&tran, &9);
        assert!(!inserted);
        assert_eq!(table.element_count(), 1);
    }

    #[test]
    fn iterator_sees_current_set() {
        let (system, table) = new_table(2);
        let tran = system.request_entry().unwrap();
        for k in [3u32, 11, 19, 4, 7] {
            let mut key = k;
            drop(table.insert(&tran, &mut key));
        }
        table.erase(&tran, &11);

        let iter_tran = system.request_entry().unwrap();
        let mut seen = Vec::new();
        let mut iter = table.iter(&iter_tran);
        while let Some((key, _)) = iter.iterate() {
            seen.push(*key);
        }
        drop(iter);
        seen.sort_unstable();
        assert_eq!(seen, vec![3, 4, 7, 19]);
    }

    #[test]
    fn clear_empties_the_table() {
        let (system, table) = new_table(2);
        let tran = system.request_entry().unwrap();
        for k in 0..20u32 {
            let mut key = k;
            drop(table.insert(&tran, &mut key));
        }
        assert_eq!(table.element_count(), 20);
        table.clear(&tran);
        assert_eq!(table.element_count(), 0);
        assert!(table.find(&tran, &0).is_none());
    }

    #[test]
    fn set_semantics_under_contention() {
        const THREADS: usize = 8;
        const KEYS: u32 = 128;

        let system = TranSystem::new(THREADS + 1, 16);
        let table = Arc::new(LfHashTable::<IntCounter>::new(
            Arc::clone(&system),
            16,
            2,
            64,
            usize::MAX,
        ));

        std::thread::scope(|scope| {
            for t in 0..THREADS {
                let table = Arc::clone(&table);
                let system = Arc::clone(&system);
                scope.spawn(move || {
                    let tran = system.request_entry().unwrap();
                    for round in 0..200u32 {
                        for k in (t as u32..KEYS).step_by(THREADS) {
                            if (round + k) % 3 == 0 {
                                table.erase(&tran, &k);
                            } else {
                                let (_, _) = table.find_or_insert(&tran, &k);
                            }
                        }
                    }
                    // Deterministic final pass: even keys in, odd keys out.
                    for k in (t as u32..KEYS).step_by(THREADS) {
                        if k % 2 == 0 {
                            let (_, _) = table.find_or_insert(&tran, &k);
                        } else {
                            table.erase(&tran, &k);
                        }
                    }
                });
            }
        });

        let tran = system.request_entry().unwrap();
        let mut present = Vec::new();
        let mut iter = table.iter(&tran);
        while let Some((key, _)) = iter.iterate() {
            present.push(*key);
        }
        drop(iter);
        present.sort_unstable();
        let expected: Vec<u32> = (0..KEYS).filter(|k| k % 2 == 0).collect();
        assert_eq!(present, expected);
    }
}
