//! The session registry.
//!
//! One lock-free hash map keyed by session id, with the entry-locked
//! strategy: a successful find returns with the entry mutex held, so every
//! mutation of a session record is serialized. Workers pin a session with
//! the ref count for the duration of a request; the reaper skips pinned
//! records.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use squill_lib_core::errors::{Result, SquillError};
use squill_lib_core::params::{SessionParam, SystemParameters};
use squill_lib_core::value::DbValue;
use squill_lockfree::freelist::{DuplicateAction, EntryDescriptor};
use squill_lockfree::hash::{FoundEntry, LfHashTable};
use squill_lockfree::tran::{TranEntry, TranSystem};

use crate::state::{
    HoldableQuery, PreparedStatement, SessionId, SessionState, TraceFormat, TzRegion,
};

const SESSIONS_HASH_SIZE: usize = 128;

/// How many private LRU partitions the buffer cache exposes; sessions are
/// spread across them round-robin for locality.
const PRIVATE_LRU_COUNT: i32 = 8;

/// Reaper batch bound: expired ids collected per epoch transaction.
pub(crate) const REAPER_BATCH: usize = 1024;

pub struct SessionDescriptor;

impl EntryDescriptor for SessionDescriptor {
    type Key = SessionId;
    type Data = SessionState;

    const USES_MUTEX: bool = true;

    fn alloc_data() -> SessionState {
        SessionState::default()
    }

    fn init_data(data: &SessionState) {
        data.reset();
    }

    fn uninit_data(data: &SessionState) {
        data.reset();
    }

    fn key_cmp(a: &SessionId, b: &SessionId) -> std::cmp::Ordering {
        a.cmp(b)
    }

    fn key_hash(key: &SessionId, table_size: usize) -> usize {
        *key as usize % table_size
    }

    /// Id collision on insert: claim the next id and restart.
    fn on_duplicate(key: &mut SessionId) -> DuplicateAction {
        *key = key.wrapping_add(1);
        DuplicateAction::ModifyKeyRestart
    }
}

/// The per-worker connection slot: which session the worker currently
/// holds a reference to.
#[derive(Debug, Default)]
pub struct ConnectionEntry {
    session_id: Option<SessionId>,
}

impl ConnectionEntry {
    pub fn new() -> ConnectionEntry {
        ConnectionEntry::default()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }
}

pub struct Sessions {
    params: Arc<SystemParameters>,
    table: LfHashTable<SessionDescriptor>,
    next_id: AtomicU32,
    holdable_count: AtomicUsize,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Sessions {
    pub fn new(params: Arc<SystemParameters>, tran_system: Arc<TranSystem>) -> Sessions {
        if !params.enable_new_lfhash {
            // The legacy chained registry is gone; the parameter survives
            // for configuration compatibility.
            log::warn!("enable_new_lfhash=no is ignored; using the lock-free registry");
        }
        let table = LfHashTable::new(
            tran_system,
            SESSIONS_HASH_SIZE,
            1,
            params.freelist_block_size,
            params.freelist_max_alloc,
        );
        Sessions {
            params,
            table,
            next_id: AtomicU32::new(0),
            holdable_count: AtomicUsize::new(0),
        }
    }

    pub fn params(&self) -> &Arc<SystemParameters> {
        &self.params
    }

    pub fn count(&self) -> usize {
        self.table.element_count()
    }

    pub fn holdable_count(&self) -> usize {
        self.holdable_count.load(Ordering::Relaxed)
    }

    /// Create a fresh session and pin it to the worker's connection entry.
    /// Any session the worker previously held is released first.
    pub fn create(&self, tran: &TranEntry, conn: &mut ConnectionEntry) -> Result<SessionId> {
        if conn.session_id.is_some() {
            self.release(tran, conn);
        }
        let mut id = self.next_id.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let entry = self.table.insert(tran, &mut id);
        entry.id.store(id, Ordering::Relaxed);
        entry.touch(unix_now());
        entry.ref_count.store(1, Ordering::Release);
        entry
            .private_lru_index
            .store(id as i32 % PRIVATE_LRU_COUNT, Ordering::Relaxed);
        drop(entry);
        // Keep the allocator ahead of ids claimed through collisions.
        self.next_id.fetch_max(id, Ordering::AcqRel);
        conn.session_id = Some(id);
        if self.params.er_log_debug {
            log::debug!("session {id} created");
        }
        Ok(id)
    }

    /// Per-request check: renew the activity stamp and pin the session.
    pub fn check(
        &self,
        tran: &TranEntry,
        conn: &mut ConnectionEntry,
        id: SessionId,
    ) -> Result<()> {
        let entry = self
            .table
            .find(tran, &id)
            .ok_or(SquillError::SessionExpired(id))?;
        entry.touch(unix_now());
        entry.ref_count.fetch_add(1, Ordering::AcqRel);
        drop(entry);
        if let Some(previous) = conn.session_id {
            if previous != id {
                self.unpin(tran, previous);
            }
        }
        conn.session_id = Some(id);
        Ok(())
    }

    /// Release the worker's pin at end of request.
    pub fn release(&self, tran: &TranEntry, conn: &mut ConnectionEntry) {
        if let Some(id) = conn.session_id.take() {
            self.unpin(tran, id);
        }
    }

    fn unpin(&self, tran: &TranEntry, id: SessionId) {
        if let Some(entry) = self.table.find(tran, &id) {
            let previous = entry.ref_count.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(previous > 0);
        }
    }

    /// Destroy a session on disconnect. If other requests still reference
    /// it, only the caller's pin is dropped and the record survives.
    pub fn destroy(
        &self,
        tran: &TranEntry,
        conn: &mut ConnectionEntry,
        id: SessionId,
    ) -> Result<()> {
        let held_here = conn.session_id == Some(id);
        let entry = self
            .table
            .find(tran, &id)
            .ok_or(SquillError::SessionExpired(id))?;
        if held_here {
            entry.ref_count.fetch_sub(1, Ordering::AcqRel);
            conn.session_id = None;
        }
        if entry.ref_count.load(Ordering::Acquire) == 0 {
            let holdable = entry.inner.lock().holdable_queries.len();
            self.holdable_count.fetch_sub(holdable, Ordering::Relaxed);
            self.table.erase_locked(entry);
            if self.params.er_log_debug {
                log::debug!("session {id} destroyed");
            }
        }
        Ok(())
    }

    /// Run `f` against a pinned session record.
    pub fn with_session<R>(
        &self,
        tran: &TranEntry,
        id: SessionId,
        f: impl FnOnce(&FoundEntry<'_, SessionDescriptor>) -> R,
    ) -> Result<R> {
        let entry = self
            .table
            .find(tran, &id)
            .ok_or(SquillError::SessionExpired(id))?;
        Ok(f(&entry))
    }

    pub fn set_prepared_statement(
        &self,
        tran: &TranEntry,
        id: SessionId,
        stmt: PreparedStatement,
    ) -> Result<()> {
        self.with_session(tran, id, |s| s.set_prepared_statement(stmt))?
    }

    pub fn get_prepared_statement(
        &self,
        tran: &TranEntry,
        id: SessionId,
        name: &str,
    ) -> Result<PreparedStatement> {
        self.with_session(tran, id, |s| s.get_prepared_statement(name))?
    }

    pub fn delete_prepared_statement(
        &self,
        tran: &TranEntry,
        id: SessionId,
        name: &str,
    ) -> Result<()> {
        self.with_session(tran, id, |s| s.delete_prepared_statement(name))?
    }

    pub fn set_variable(
        &self,
        tran: &TranEntry,
        id: SessionId,
        name: &str,
        value: &DbValue,
    ) -> Result<()> {
        self.with_session(tran, id, |s| s.set_variable(name, value))?
    }

    pub fn get_variable(&self, tran: &TranEntry, id: SessionId, name: &str) -> Result<DbValue> {
        self.with_session(tran, id, |s| s.get_variable(name))?
    }

    pub fn drop_variable(&self, tran: &TranEntry, id: SessionId, name: &str) -> Result<()> {
        self.with_session(tran, id, |s| s.drop_variable(name))?
    }

    /// Mark the worker as inside (or out of) a trigger body; generated
    /// insert ids are suppressed while set.
    pub fn set_trigger_state(
        &self,
        tran: &TranEntry,
        id: SessionId,
        in_trigger: bool,
    ) -> Result<()> {
        self.with_session(tran, id, |s| {
            s.is_trigger_involved.store(in_trigger, Ordering::Relaxed);
        })
    }

    pub fn set_row_count(&self, tran: &TranEntry, id: SessionId, rows: i32) -> Result<()> {
        self.with_session(tran, id, |s| {
            s.row_count.store(rows, Ordering::Relaxed);
        })
    }

    pub fn get_row_count(&self, tran: &TranEntry, id: SessionId) -> Result<i32> {
        self.with_session(tran, id, |s| s.row_count.load(Ordering::Relaxed))
    }

    pub fn set_trace_stats(
        &self,
        tran: &TranEntry,
        id: SessionId,
        stats: String,
        format: TraceFormat,
    ) -> Result<()> {
        self.with_session(tran, id, |s| s.set_trace_stats(stats, format))
    }

    pub fn get_trace_stats(
        &self,
        tran: &TranEntry,
        id: SessionId,
    ) -> Result<Option<(String, TraceFormat)>> {
        self.with_session(tran, id, |s| s.get_trace_stats())
    }

    pub fn clear_trace_stats(&self, tran: &TranEntry, id: SessionId) -> Result<()> {
        self.with_session(tran, id, |s| s.clear_trace_stats())
    }

    pub fn set_plan_string(
        &self,
        tran: &TranEntry,
        id: SessionId,
        plan: Option<String>,
    ) -> Result<()> {
        self.with_session(tran, id, |s| s.set_plan_string(plan))
    }

    pub fn get_plan_string(&self, tran: &TranEntry, id: SessionId) -> Result<Option<String>> {
        self.with_session(tran, id, |s| s.get_plan_string())
    }

    pub fn set_time_zone(&self, tran: &TranEntry, id: SessionId, region: TzRegion) -> Result<()> {
        self.with_session(tran, id, |s| s.set_tz_region(region))
    }

    pub fn get_time_zone(&self, tran: &TranEntry, id: SessionId) -> Result<TzRegion> {
        self.with_session(tran, id, |s| s.tz_region())
    }

    pub fn set_auto_commit(
        &self,
        tran: &TranEntry,
        id: SessionId,
        auto_commit: bool,
    ) -> Result<()> {
        self.with_session(tran, id, |s| s.set_auto_commit(auto_commit))
    }

    /// Attach (or with `None` detach) the loader session driving a bulk
    /// load through this connection.
    pub fn set_loader_handle(
        &self,
        tran: &TranEntry,
        id: SessionId,
        handle: Option<u64>,
    ) -> Result<()> {
        self.with_session(tran, id, |s| s.set_loader_handle(handle))
    }

    pub fn get_loader_handle(&self, tran: &TranEntry, id: SessionId) -> Result<Option<u64>> {
        self.with_session(tran, id, |s| s.loader_handle())
    }

    pub fn set_session_parameters(
        &self,
        tran: &TranEntry,
        id: SessionId,
        parameters: Vec<SessionParam>,
    ) -> Result<()> {
        self.with_session(tran, id, |s| {
            s.inner.lock().session_parameters = parameters;
        })
    }

    pub fn get_session_parameters(
        &self,
        tran: &TranEntry,
        id: SessionId,
    ) -> Result<Vec<SessionParam>> {
        self.with_session(tran, id, |s| s.inner.lock().session_parameters.clone())
    }

    /// Preserve a holdable query's result past transaction end. The temp
    /// files backing the list are flagged preserved so the transaction
    /// manager leaves them alone.
    pub fn store_query_entry_info(
        &self,
        tran: &TranEntry,
        id: SessionId,
        mut query: HoldableQuery,
    ) -> Result<()> {
        query.preserved = true;
        self.with_session(tran, id, |s| {
            let mut inner = s.inner.lock();
            if let Some(existing) = inner
                .holdable_queries
                .iter_mut()
                .find(|q| q.query_id == query.query_id)
            {
                *existing = query;
                return;
            }
            inner.holdable_queries.push(query);
            self.holdable_count.fetch_add(1, Ordering::Relaxed);
        })
    }

    pub fn load_query_entry_info(
        &self,
        tran: &TranEntry,
        id: SessionId,
        query_id: u64,
    ) -> Result<HoldableQuery> {
        self.with_session(tran, id, |s| {
            s.inner
                .lock()
                .holdable_queries
                .iter()
                .find(|q| q.query_id == query_id)
                .cloned()
                .ok_or(SquillError::Failed)
        })?
    }

    /// Close a holdable query: its preserved temp files are released.
    pub fn remove_query_entry_info(
        &self,
        tran: &TranEntry,
        id: SessionId,
        query_id: u64,
    ) -> Result<()> {
        self.with_session(tran, id, |s| {
            let mut inner = s.inner.lock();
            let before = inner.holdable_queries.len();
            inner.holdable_queries.retain(|q| q.query_id != query_id);
            if inner.holdable_queries.len() < before {
                self.holdable_count.fetch_sub(1, Ordering::Relaxed);
            }
        })
    }

    /// One reaper pass: remove sessions idle past the timeout that no live
    /// connection references. Ids are collected in bounded batches and the
    /// iterator's transaction is closed before the deletes run, so
    /// reclamation keeps flowing.
    pub fn remove_expired(&self, tran: &TranEntry, now: u64) -> usize {
        let timeout = self.params.session_state_timeout.as_secs();
        let mut removed = 0;
        loop {
            let mut batch: Vec<SessionId> = Vec::new();
            {
                let mut iter = self.table.iter(tran);
                while let Some((id, state)) = iter.iterate() {
                    let idle = now.saturating_sub(state.active_time.load(Ordering::Acquire));
                    if idle >= timeout && state.ref_count.load(Ordering::Acquire) == 0 {
                        batch.push(*id);
                        if batch.len() >= REAPER_BATCH {
                            break;
                        }
                    }
                }
            }
            if batch.is_empty() {
                return removed;
            }
            let full_batch = batch.len() >= REAPER_BATCH;
            for id in batch {
                // Re-validate under the entry mutex: a request may have
                // arrived since the scan.
                if let Some(entry) = self.table.find(tran, &id) {
                    let idle = now.saturating_sub(entry.active_time.load(Ordering::Acquire));
                    if idle >= timeout && entry.ref_count.load(Ordering::Acquire) == 0 {
                        let holdable = entry.inner.lock().holdable_queries.len();
                        self.holdable_count.fetch_sub(holdable, Ordering::Relaxed);
                        if self.table.erase_locked(entry) {
                            if self.params.er_log_debug {
                                log::debug!("session {id} reaped");
                            }
                            removed += 1;
                        }
                    }
                }
            }
            if !full_batch {
                return removed;
            }
        }
    }

    /// Textual dump of every session, for the periodic and on-demand
    /// diagnostics channel.
    pub fn dump(&self, tran: &TranEntry) -> String {
        let mut out = String::new();
        out.push_str("SESSION STATES\n");
        let mut count = 0usize;
        let mut iter = self.table.iter(tran);
        while let Some((_, state)) = iter.iterate() {
            state.dump(&mut out);
            count += 1;
        }
        drop(iter);
        out.push_str(&format!("{count} session(s), {} holdable quer(ies)\n",
            self.holdable_count(),
        ));
        out
    }
}
