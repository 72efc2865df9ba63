//! Interfaces to the external collaborators the executor consumes:
//! the heap storage engine, the list-file cursor engine, and the XASL
//! runtime that drives nested subquery execution.

use std::cell::RefCell;

use squill_lib_core::errors::Result;
use squill_lib_core::oid::Oid;
use squill_lib_core::value::{DbValue, ListId};

use crate::regu::{AttrId, AttrInfoCache};
use crate::regu::ReguVariable;
use crate::xasl::XaslStatus;

/// Opaque heap record as handed to the data filter by the scan loop.
/// Decoding it into attribute values is the storage engine's job.
#[derive(Debug, Clone, Default)]
pub struct HeapRecord {
    pub bytes: Vec<u8>,
}

/// Heap/storage engine surface.
pub trait HeapStorage {
    /// Load the attribute values referenced by `cache` from `record`.
    fn read_attr_values(
        &self,
        oid: &Oid,
        record: &HeapRecord,
        cache: &RefCell<AttrInfoCache>,
    ) -> Result<()>;

    /// `IS NULL` on object references: does the oid point at a live object?
    fn is_object_not_null(&self, oid: &Oid) -> Result<bool>;
}

/// Identifier of an open list scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanId(pub u64);

/// Sort specification for [`ListCursorEngine::sort`].
#[derive(Debug, Clone)]
pub struct SortKey {
    pub columns: Vec<usize>,
}

/// Materialized-list cursor engine. Tuples are pulled one at a time; the
/// evaluator is a plain consumer.
pub trait ListCursorEngine {
    fn open_scan(&self, list: &ListId) -> Result<ScanId>;
    /// Next tuple of the scan, or `None` at end.
    fn next(&self, scan: ScanId) -> Result<Option<Vec<DbValue>>>;
    fn close_scan(&self, scan: ScanId);
    fn sort(&self, list: &ListId, key: &SortKey) -> Result<ListId>;
}

/// XASL runtime hooks for lazy subquery execution reached through a
/// `LIST_ID` register variable.
pub trait SubqueryRuntime {
    /// Execute the nested XASL behind `regu`, materializing its list id
    /// into the regu's list slot.
    fn execute_regu_variable_xasl(&self, regu: &ReguVariable) -> Result<()>;

    fn regu_variable_xasl_status(&self, regu: &ReguVariable) -> XaslStatus;
}

/// No-op collaborators for contexts that evaluate pure expressions only.
pub struct NoStorage;

impl HeapStorage for NoStorage {
    fn read_attr_values(
        &self,
        _oid: &Oid,
        _record: &HeapRecord,
        _cache: &RefCell<AttrInfoCache>,
    ) -> Result<()> {
        Ok(())
    }

    fn is_object_not_null(&self, oid: &Oid) -> Result<bool> {
        Ok(!oid.is_null())
    }
}

impl ListCursorEngine for NoStorage {
    fn open_scan(&self, _list: &ListId) -> Result<ScanId> {
        Err(squill_lib_core::errors::SquillError::Internal(
            "no cursor engine attached",
        ))
    }

    fn next(&self, _scan: ScanId) -> Result<Option<Vec<DbValue>>> {
        Ok(None)
    }

    fn close_scan(&self, _scan: ScanId) {}

    fn sort(&self, list: &ListId, _key: &SortKey) -> Result<ListId> {
        Ok(*list)
    }
}

impl SubqueryRuntime for NoStorage {
    fn execute_regu_variable_xasl(&self, _regu: &ReguVariable) -> Result<()> {
        Ok(())
    }

    fn regu_variable_xasl_status(&self, _regu: &ReguVariable) -> XaslStatus {
        XaslStatus::Cleared
    }
}

/// A trivial in-memory cursor engine. Production builds attach the real
/// list-file manager; unit tests and the standalone evaluator use this one.
#[derive(Default)]
pub struct MemoryCursorEngine {
    lists: RefCell<squill_helpers::HashMap<u64, Vec<Vec<DbValue>>>>,
    scans: RefCell<squill_helpers::HashMap<u64, (u64, usize)>>,
    next_scan: std::cell::Cell<u64>,
}

impl MemoryCursorEngine {
    pub fn new() -> MemoryCursorEngine {
        MemoryCursorEngine::default()
    }

    /// Register tuples under a fresh list id.
    pub fn add_list(&self, id: u64, tuples: Vec<Vec<DbValue>>) -> ListId {
        let mut list_id = ListId::new(id);
        list_id.tuple_cnt = tuples.len() as u64;
        self.lists.borrow_mut().insert(id, tuples);
        list_id
    }
}

impl ListCursorEngine for MemoryCursorEngine {
    fn open_scan(&self, list: &ListId) -> Result<ScanId> {
        let scan = self.next_scan.get();
        self.next_scan.set(scan + 1);
        self.scans.borrow_mut().insert(scan, (list.id, 0));
        Ok(ScanId(scan))
    }

    fn next(&self, scan: ScanId) -> Result<Option<Vec<DbValue>>> {
        let mut scans = self.scans.borrow_mut();
        let Some((list, pos)) = scans.get_mut(&scan.0) else {
            return Ok(None);
        };
        let lists = self.lists.borrow();
        let Some(tuples) = lists.get(list) else {
            return Ok(None);
        };
        if *pos >= tuples.len() {
            return Ok(None);
        }
        let tuple = tuples[*pos].clone();
        *pos += 1;
        Ok(Some(tuple))
    }

    fn close_scan(&self, scan: ScanId) {
        self.scans.borrow_mut().remove(&scan.0);
    }

    fn sort(&self, list: &ListId, key: &SortKey) -> Result<ListId> {
        let tuples = self
            .lists
            .borrow()
            .get(&list.id)
            .cloned()
            .unwrap_or_default();
        let mut sorted = tuples;
        sorted.sort_by(|a, b| {
            for &col in &key.columns {
                let ord = squill_lib_core::value::total_cmp(&a[col], &b[col]);
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
        let new_id = list.id | (1 << 63);
        let mut out = self.add_list(new_id, sorted);
        out.sorted = true;
        Ok(out)
    }
}

/// Attribute column projected out of a packed multi-column index key.
#[derive(Debug, Clone)]
pub struct MidxKey {
    pub attr_ids: Vec<AttrId>,
    pub values: Vec<DbValue>,
}
