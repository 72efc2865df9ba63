//! Minimal XASL node scaffolding.
//!
//! The full plan tree and its interpreter live outside this crate; the
//! executor only needs the node identity, its execution status, and the
//! per-node subquery cache slot that [`crate::subquery_cache`] manages.

use std::cell::{Cell, RefCell};

use crate::subquery_cache::SubqueryCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaslStatus {
    /// Not yet executed, or its results were decached.
    Cleared,
    Running,
    Success,
    Failed,
}

pub struct XaslNode {
    pub id: u64,
    pub status: Cell<XaslStatus>,
    /// Correlated-subquery result cache; lazily initialized on first use.
    pub sq_cache: RefCell<Option<SubqueryCache>>,
}

impl XaslNode {
    pub fn new(id: u64) -> XaslNode {
        XaslNode {
            id,
            status: Cell::new(XaslStatus::Cleared),
            sq_cache: RefCell::new(None),
        }
    }
}

impl std::fmt::Debug for XaslNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XaslNode")
            .field("id", &self.id)
            .field("status", &self.status.get())
            .finish()
    }
}
