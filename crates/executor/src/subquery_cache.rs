//! Correlated scalar-subquery result cache.
//!
//! One cache lives inside one XASL node. Before executing the subquery for
//! an outer tuple, the interpreter builds a key from the correlated outer
//! columns and asks the cache; on a miss it executes the plan and stores
//! the output. The cache polices itself: it stops caching permanently when
//! its hit ratio stays poor past a miss budget, or when the configured byte
//! bound would be exceeded.

use std::sync::Arc;

use parking_lot::RwLock;
use squill_lib_core::errors::{Result, SquillError};
use squill_lib_core::value::{DbValue, ListId, total_cmp, value_hash};
use squill_lockfree::freelist::EntryDescriptor;
use squill_lockfree::hash::LfHashTable;
use squill_lockfree::tran::{TranEntry, TranSystem};

/// Caching stays on only while `hit / miss >= SQ_CACHE_MIN_HIT_RATIO`
/// (integer division, evaluated once the miss budget is spent). The
/// division truncates, so small hit counts disable aggressively; this
/// matches long-standing tuning and is kept exactly.
const SQ_CACHE_MIN_HIT_RATIO: u64 = 9;

/// Assumed bytes per entry when sizing the miss budget.
const SQ_CACHE_EXPECTED_ENTRY_SIZE: u64 = 512;

/// Estimated bucket/chain overhead per stored entry.
const SQ_CACHE_ENTRY_OVERHEAD: u64 = 48;

const SQ_CACHE_HASH_SIZE: usize = 128;

/// Cache key: the correlated outer-column values, copied at evaluation
/// time. The length is fixed per XASL node.
#[derive(Debug, Clone, PartialEq)]
pub struct SqKey {
    pub values: Vec<DbValue>,
}

impl SqKey {
    pub fn from_values(correlation: &[&DbValue]) -> SqKey {
        SqKey {
            values: correlation.iter().map(|v| (*v).clone()).collect(),
        }
    }

    fn hash(&self) -> u64 {
        self.values.iter().map(value_hash).fold(0, |acc, h| acc ^ h)
    }

    fn memory_size(&self) -> u64 {
        self.values.iter().map(|v| v.memory_size() as u64).sum()
    }
}

/// Cached subquery output: an owned constant value or a handle to the
/// materialized sorted list.
#[derive(Debug, Clone, PartialEq)]
pub enum SqValue {
    Value(DbValue),
    List(ListId),
}

impl SqValue {
    fn memory_size(&self) -> u64 {
        match self {
            SqValue::Value(v) => v.memory_size() as u64,
            SqValue::List(_) => std::mem::size_of::<ListId>() as u64,
        }
    }
}

struct SqDescriptor;

impl EntryDescriptor for SqDescriptor {
    type Key = SqKey;
    type Data = RwLock<Option<SqValue>>;

    // Entries are write-once; readers are protected by their transaction.
    const USES_MUTEX: bool = false;

    fn alloc_data() -> Self::Data {
        RwLock::new(None)
    }

    fn init_data(data: &Self::Data) {
        *data.write() = None;
    }

    fn uninit_data(data: &Self::Data) {
        *data.write() = None;
    }

    fn key_cmp(a: &SqKey, b: &SqKey) -> std::cmp::Ordering {
        let len = a.values.len().cmp(&b.values.len());
        if len != std::cmp::Ordering::Equal {
            return len;
        }
        for (x, y) in a.values.iter().zip(&b.values) {
            let ord = total_cmp(x, y);
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    }

    fn key_hash(key: &SqKey, table_size: usize) -> usize {
        key.hash() as usize % table_size
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SqStats {
    pub hit: u64,
    pub miss: u64,
}

pub struct SubqueryCache {
    table: Option<LfHashTable<SqDescriptor>>,
    tran_system: Arc<TranSystem>,
    key_len: usize,
    size: u64,
    size_max: u64,
    enabled: bool,
    pub stats: SqStats,
}

impl SubqueryCache {
    /// The hash table itself is lazily built on first use, so a node whose
    /// subquery never runs pays nothing.
    pub fn new(tran_system: Arc<TranSystem>, key_len: usize, size_max: u64) -> SubqueryCache {
        SubqueryCache {
            table: None,
            tran_system,
            key_len,
            size: 0,
            size_max,
            enabled: true,
            stats: SqStats::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn key_len(&self) -> usize {
        self.key_len
    }

    fn initialize_table(&mut self) -> Result<()> {
        let table = LfHashTable::new(
            Arc::clone(&self.tran_system),
            SQ_CACHE_HASH_SIZE,
            1,
            64,
            usize::MAX,
        );
        self.table = Some(table);
        Ok(())
    }

    /// Look up the cached output for `key`.
    ///
    /// A disabled cache short-circuits to a miss without touching the
    /// table. Past the miss budget, a poor hit ratio disables the cache
    /// permanently for this node.
    pub fn get(&mut self, tran: &TranEntry, key: &SqKey) -> Option<SqValue> {
        debug_assert_eq!(key.values.len(), self.key_len);
        if !self.enabled {
            return None;
        }
        if self.table.is_some() {
            let miss_budget = self.size_max / SQ_CACHE_EXPECTED_ENTRY_SIZE;
            if self.stats.miss >= miss_budget
                && self.stats.miss > 0
                && self.stats.hit / self.stats.miss < SQ_CACHE_MIN_HIT_RATIO
            {
                log::debug!(
                    "subquery cache disabled: hit={} miss={}",
                    self.stats.hit,
                    self.stats.miss
                );
                self.enabled = false;
                return None;
            }
        } else {
            if self.initialize_table().is_err() {
                // Degrade gracefully: the subquery still executes.
                self.enabled = false;
                return None;
            }
            self.stats.miss += 1;
            return None;
        }

        let table = self.table.as_ref().unwrap();
        let found = table.find(tran, key).and_then(|entry| entry.read().clone());
        match found {
            Some(value) => {
                self.stats.hit += 1;
                Some(value)
            }
            None => {
                self.stats.miss += 1;
                None
            }
        }
    }

    /// Store the output for `key`. First writer wins; a collision is not an
    /// error because the subquery is deterministic for the key. Exceeding
    /// the size bound disables the cache instead of evicting.
    pub fn put(&mut self, tran: &TranEntry, key: SqKey, value: SqValue) -> Result<bool> {
        debug_assert_eq!(key.values.len(), self.key_len);
        if !self.enabled {
            return Ok(false);
        }
        if self.table.is_none() {
            if self.initialize_table().is_err() {
                self.enabled = false;
                return Ok(false);
            }
        }

        let new_entry_size = key.memory_size() + value.memory_size() + SQ_CACHE_ENTRY_OVERHEAD;
        if self.size_max < self.size + new_entry_size {
            log::debug!(
                "subquery cache size bound reached ({} + {} > {})",
                self.size,
                new_entry_size,
                self.size_max
            );
            self.enabled = false;
            return Err(SquillError::Failed);
        }

        let table = self.table.as_ref().unwrap();
        let (entry, inserted) = table.find_or_insert(tran, &key);
        if inserted {
            *entry.write() = Some(value);
            drop(entry);
            self.size += new_entry_size;
        }
        Ok(inserted)
    }

    /// Release every key vector and stored value. List handles are owned by
    /// the cursor engine; dropping the handle releases our reference.
    pub fn destroy(&mut self, tran: &TranEntry) {
        if let Some(table) = &self.table {
            table.clear(tran);
        }
        self.table = None;
        self.size = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use squill_lib_core::value::DbValue;
    use squill_lockfree::tran::TranSystem;

    use super::{SqKey, SqStats, SqValue, SubqueryCache};

    fn key(values: &[i32]) -> SqKey {
        SqKey {
            values: values.iter().map(|&v| DbValue::Int(v)).collect(),
        }
    }

    #[test]
    fn miss_then_put_then_hit() {
        let system = TranSystem::new(2, 100);
        let tran = system.request_entry().unwrap();
        let mut cache = SubqueryCache::new(Arc::clone(&system), 1, 1 << 20);

        assert_eq!(cache.get(&tran, &key(&[7])), None);
        assert!(cache.put(&tran, key(&[7]), SqValue::Value(DbValue::Int(42))).unwrap());
        assert_eq!(
            cache.get(&tran, &key(&[7])),
            Some(SqValue::Value(DbValue::Int(42)))
        );
        assert_eq!(cache.stats, SqStats { hit: 1, miss: 1 });
    }

    #[test]
    fn first_writer_wins_on_collision() {
        let system = TranSystem::new(2, 100);
        let tran = system.request_entry().unwrap();
        let mut cache = SubqueryCache::new(Arc::clone(&system), 1, 1 << 20);

        assert!(cache.put(&tran, key(&[1]), SqValue::Value(DbValue::Int(10))).unwrap());
        assert!(!cache.put(&tran, key(&[1]), SqValue::Value(DbValue::Int(99))).unwrap());
        assert_eq!(
            cache.get(&tran, &key(&[1])),
            Some(SqValue::Value(DbValue::Int(10)))
        );
    }

    #[test]
    fn size_bound_disables_instead_of_evicting() {
        let system = TranSystem::new(2, 100);
        let tran = system.request_entry().unwrap();
        // Budget fits roughly one entry.
        let mut cache = SubqueryCache::new(Arc::clone(&system), 1, 160);

        assert!(cache.put(&tran, key(&[1]), SqValue::Value(DbValue::Int(1))).unwrap());
        let err = cache.put(&tran, key(&[2]), SqValue::Value(DbValue::Int(2)));
        assert!(err.is_err());
        assert!(!cache.is_enabled());
        // Disabled cache answers miss without touching the table.
        assert_eq!(cache.get(&tran, &key(&[1])), None);
    }

    #[test]
    fn poor_hit_ratio_disables_past_the_miss_budget() {
        let system = TranSystem::new(2, 100);
        let tran = system.request_entry().unwrap();
        // size_max 1024 => miss budget = 2.
        let mut cache = SubqueryCache::new(Arc::clone(&system), 1, 1024);

        assert_eq!(cache.get(&tran, &key(&[1])), None); // init + miss
        assert_eq!(cache.get(&tran, &key(&[2])), None); // miss (budget hit)
        assert!(cache.is_enabled());
        // Third get evaluates 0/2 < 9 and turns the cache off for good.
        assert_eq!(cache.get(&tran, &key(&[3])), None);
        assert!(!cache.is_enabled());
        assert_eq!(cache.stats, SqStats { hit: 0, miss: 2 });
    }

    #[test]
    fn multi_column_keys_compare_structurally() {
        let system = TranSystem::new(2, 100);
        let tran = system.request_entry().unwrap();
        let mut cache = SubqueryCache::new(Arc::clone(&system), 2, 1 << 20);

        let k1 = SqKey {
            values: vec![DbValue::Int(1), DbValue::Varchar("x".to_owned())],
        };
        let k2 = SqKey {
            values: vec![DbValue::Int(1), DbValue::Varchar("y".to_owned())],
        };
        assert!(cache.put(&tran, k1.clone(), SqValue::Value(DbValue::Int(1))).unwrap());
        assert_eq!(cache.get(&tran, &k2), None);
        assert_eq!(
            cache.get(&tran, &k1),
            Some(SqValue::Value(DbValue::Int(1)))
        );
    }

    #[test]
    fn destroy_releases_entries() {
        let system = TranSystem::new(2, 100);
        let tran = system.request_entry().unwrap();
        let mut cache = SubqueryCache::new(Arc::clone(&system), 1, 1 << 20);
        for i in 0..10 {
            cache
                .put(&tran, key(&[i]), SqValue::Value(DbValue::Int(i)))
                .unwrap();
        }
        cache.destroy(&tran);
        // Table is gone; a fresh get reinitializes lazily and misses.
        assert_eq!(cache.get(&tran, &key(&[0])), None);
    }
}
