//! The session record and its owned sub-state.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use squill_lib_core::errors::{Result, SquillError};
use squill_lib_core::params::SessionParam;
use squill_lib_core::value::{DbValue, ListId};

pub type SessionId = u32;

pub const MAX_SESSION_VARIABLES: usize = 20;
pub const MAX_PREPARED_STATEMENTS: usize = 20;

/// A prepared statement as the session stores it: the client-visible name,
/// the printable alias of the statement text, the digest keying the shared
/// XASL cache, and the packed prepare info the driver round-trips.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStatement {
    pub name: String,
    pub alias_print: Option<String>,
    pub sha1: [u8; 20],
    pub info: Vec<u8>,
}

impl PreparedStatement {
    /// Resolve the statement's plan id against the shared XASL cache.
    ///
    /// When the digest matches a cache entry but the statement has no alias
    /// print, no plan id is reported and no re-resolution is attempted; the
    /// caller falls back to recompilation. Long-standing behavior, kept.
    pub fn xasl_id<F>(&self, cache_lookup: F) -> Option<u64>
    where
        F: FnOnce(&[u8; 20]) -> Option<u64>,
    {
        let id = cache_lookup(&self.sha1)?;
        self.alias_print.as_ref()?;
        Some(id)
    }
}

/// A session variable. Character and bit values are deep-copied on store.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionVariable {
    pub name: String,
    pub value: DbValue,
}

/// A holdable query result: the materialized list survives the transaction
/// that produced it because its temp files are flagged preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct HoldableQuery {
    pub query_id: u64,
    pub list_id: ListId,
    pub temp_file_count: u32,
    pub total_count: u64,
    pub query_flag: u32,
    pub preserved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceFormat {
    Text,
    Json,
}

/// Per-statement execution trace captured by the XASL runtime. The session
/// stores the rendered buffer; this is the shape it is rendered from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryTraceStats {
    pub elapsed_ms: u64,
    pub fetches: u64,
    pub ioreads: u64,
    pub rows_scanned: u64,
    pub rows_qualified: u64,
}

impl QueryTraceStats {
    pub fn render(&self, format: TraceFormat) -> String {
        match format {
            TraceFormat::Json => serde_json::to_string(self).unwrap_or_default(),
            TraceFormat::Text => format!(
                "elapsed: {}ms, fetches: {}, ioreads: {}, rows: {}/{}",
                self.elapsed_ms, self.fetches, self.ioreads, self.rows_qualified, self.rows_scanned
            ),
        }
    }
}

/// Timezone region owned by the session; all time/date conversions issued
/// from the session use this copy.
#[derive(Debug, Clone, PartialEq)]
pub struct TzRegion {
    pub name: String,
    pub offset_secs: i32,
}

impl Default for TzRegion {
    fn default() -> TzRegion {
        TzRegion {
            name: "UTC".to_owned(),
            offset_secs: 0,
        }
    }
}

/// Mutex-guarded portion of a session.
#[derive(Debug, Default)]
pub struct SessionInner {
    pub variables: Vec<SessionVariable>,
    pub statements: Vec<PreparedStatement>,
    pub holdable_queries: Vec<HoldableQuery>,
    pub session_parameters: Vec<SessionParam>,
    pub cur_insert_id: DbValue,
    pub last_insert_id: DbValue,
    pub trace_stats: Option<String>,
    pub trace_format: Option<TraceFormat>,
    pub plan_string: Option<String>,
    pub tz_region: TzRegion,
    pub attached_loader_handle: Option<u64>,
}

/// One session record, stored as the data of a registry entry. Fields the
/// reaper and dump read without holding the entry mutex are atomics; the
/// rest lives behind the inner mutex.
#[derive(Debug, Default)]
pub struct SessionState {
    pub id: AtomicU32,
    pub ref_count: AtomicU32,
    /// Unix seconds of the last request touching this session.
    pub active_time: AtomicU64,
    pub auto_commit: AtomicBool,
    pub is_trigger_involved: AtomicBool,
    pub is_last_insert_id_generated: AtomicBool,
    pub row_count: AtomicI32,
    pub private_lru_index: AtomicI32,
    pub inner: Mutex<SessionInner>,
}

impl SessionState {
    /// Reset a (possibly recycled) record to blank.
    pub fn reset(&self) {
        self.id.store(0, Ordering::Relaxed);
        self.ref_count.store(0, Ordering::Relaxed);
        self.active_time.store(0, Ordering::Relaxed);
        self.auto_commit.store(false, Ordering::Relaxed);
        self.is_trigger_involved.store(false, Ordering::Relaxed);
        self.is_last_insert_id_generated.store(false, Ordering::Relaxed);
        self.row_count.store(-1, Ordering::Relaxed);
        self.private_lru_index.store(-1, Ordering::Relaxed);
        *self.inner.lock() = SessionInner::default();
    }

    pub fn touch(&self, now: u64) {
        self.active_time.store(now, Ordering::Release);
    }

    /// Store or update a variable. Updates follow the coercion rule: a
    /// numeric value is cloned as-is, anything else is stored through its
    /// text form. Character and bit values are deep-copied.
    pub fn set_variable(&self, name: &str, value: &DbValue) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(var) = inner.variables.iter_mut().find(|v| v.name == name) {
            var.value = coerce_variable_value(value);
            return Ok(());
        }
        if inner.variables.len() >= MAX_SESSION_VARIABLES {
            return Err(SquillError::TooManyVariables(MAX_SESSION_VARIABLES));
        }
        inner.variables.push(SessionVariable {
            name: name.to_owned(),
            value: deep_copy_value(value),
        });
        Ok(())
    }

    pub fn get_variable(&self, name: &str) -> Result<DbValue> {
        self.inner
            .lock()
            .variables
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.value.clone())
            .ok_or_else(|| SquillError::VariableNotFound(name.to_owned()))
    }

    pub fn drop_variable(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let before = inner.variables.len();
        inner.variables.retain(|v| v.name != name);
        if inner.variables.len() == before {
            return Err(SquillError::VariableNotFound(name.to_owned()));
        }
        Ok(())
    }

    /// Store a prepared statement. A same-name statement is replaced
    /// silently; a 21st distinct name is refused. Names compare
    /// case-insensitively.
    pub fn set_prepared_statement(&self, stmt: PreparedStatement) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner
            .statements
            .iter_mut()
            .find(|s| s.name.eq_ignore_ascii_case(&stmt.name))
        {
            *existing = stmt;
            return Ok(());
        }
        if inner.statements.len() >= MAX_PREPARED_STATEMENTS {
            return Err(SquillError::TooManyStatements(MAX_PREPARED_STATEMENTS));
        }
        inner.statements.push(stmt);
        Ok(())
    }

    pub fn get_prepared_statement(&self, name: &str) -> Result<PreparedStatement> {
        self.inner
            .lock()
            .statements
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| SquillError::PreparedNameNotFound(name.to_owned()))
    }

    pub fn delete_prepared_statement(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let before = inner.statements.len();
        inner
            .statements
            .retain(|s| !s.name.eq_ignore_ascii_case(name));
        if inner.statements.len() == before {
            return Err(SquillError::PreparedNameNotFound(name.to_owned()));
        }
        Ok(())
    }

    /// Mark the start of a value-generating statement.
    pub fn begin_insert_values(&self) {
        self.is_last_insert_id_generated.store(false, Ordering::Relaxed);
    }

    /// Record a generated insert id. Suppressed inside trigger bodies
    /// unless forced, so triggers do not clobber the outer statement's id.
    pub fn set_cur_insert_id(&self, value: DbValue, force: bool) {
        if self.is_trigger_involved.load(Ordering::Relaxed) && !force {
            return;
        }
        let mut inner = self.inner.lock();
        inner.cur_insert_id = value;
        self.is_last_insert_id_generated.store(true, Ordering::Relaxed);
    }

    /// Read LAST_INSERT_ID. With `update_last`, the current id rolls over
    /// into the committed one (statement end).
    pub fn get_last_insert_id(&self, update_last: bool) -> DbValue {
        let mut inner = self.inner.lock();
        if update_last && self.is_last_insert_id_generated.load(Ordering::Relaxed) {
            inner.last_insert_id = std::mem::take(&mut inner.cur_insert_id);
            self.is_last_insert_id_generated.store(false, Ordering::Relaxed);
        }
        inner.last_insert_id.clone()
    }

    pub fn reset_cur_insert_id(&self) {
        let mut inner = self.inner.lock();
        inner.cur_insert_id = DbValue::Null;
        self.is_last_insert_id_generated.store(false, Ordering::Relaxed);
    }

    pub fn set_trace_stats(&self, stats: String, format: TraceFormat) {
        let mut inner = self.inner.lock();
        inner.trace_stats = Some(stats);
        inner.trace_format = Some(format);
    }

    /// The session keeps the last stats buffer until it is read here.
    pub fn get_trace_stats(&self) -> Option<(String, TraceFormat)> {
        let inner = self.inner.lock();
        match (&inner.trace_stats, inner.trace_format) {
            (Some(stats), Some(format)) => Some((stats.clone(), format)),
            _ => None,
        }
    }

    pub fn clear_trace_stats(&self) {
        let mut inner = self.inner.lock();
        inner.trace_stats = None;
        inner.trace_format = None;
    }

    /// Keep the printed plan of the last traced statement; `None` clears it.
    pub fn set_plan_string(&self, plan: Option<String>) {
        self.inner.lock().plan_string = plan;
    }

    pub fn get_plan_string(&self) -> Option<String> {
        self.inner.lock().plan_string.clone()
    }

    /// Install the session's timezone copy; every time/date conversion the
    /// session issues uses it from here on.
    pub fn set_tz_region(&self, region: TzRegion) {
        self.inner.lock().tz_region = region;
    }

    pub fn tz_region(&self) -> TzRegion {
        self.inner.lock().tz_region.clone()
    }

    pub fn set_auto_commit(&self, auto_commit: bool) {
        self.auto_commit.store(auto_commit, Ordering::Relaxed);
    }

    pub fn is_auto_commit(&self) -> bool {
        self.auto_commit.load(Ordering::Relaxed)
    }

    /// Attach a loader (bulk-load) session; `None` detaches it.
    pub fn set_loader_handle(&self, handle: Option<u64>) {
        self.inner.lock().attached_loader_handle = handle;
    }

    pub fn loader_handle(&self) -> Option<u64> {
        self.inner.lock().attached_loader_handle
    }

    /// One dump line per session: id, last insert id as text, row count,
    /// variables and prepared-statement aliases.
    pub fn dump(&self, out: &mut String) {
        use std::fmt::Write;

        let inner = self.inner.lock();
        let _ = writeln!(
            out,
            "SESSION {} (refs {}, last_insert_id {}, row_count {}, tz {})",
            self.id.load(Ordering::Relaxed),
            self.ref_count.load(Ordering::Relaxed),
            inner.last_insert_id.to_text(),
            self.row_count.load(Ordering::Relaxed),
            inner.tz_region.name,
        );
        if let Some(plan) = &inner.plan_string {
            let _ = writeln!(out, "  plan: {plan}");
        }
        for var in &inner.variables {
            let _ = writeln!(out, "  var {} = {}", var.name, var.value.to_text());
        }
        for stmt in &inner.statements {
            let _ = writeln!(
                out,
                "  stmt {} :: {}",
                stmt.name,
                stmt.alias_print.as_deref().unwrap_or("(no alias)")
            );
        }
        for query in &inner.holdable_queries {
            let _ = writeln!(
                out,
                "  holdable query {} ({} rows)",
                query.query_id, query.total_count
            );
        }
    }
}

fn deep_copy_value(value: &DbValue) -> DbValue {
    // Owned representation already deep-copies strings and bit arrays on
    // clone; this exists to keep the storage rule in one place.
    value.clone()
}

fn coerce_variable_value(value: &DbValue) -> DbValue {
    if value.db_type().is_numeric() || value.is_null() {
        value.clone()
    } else if value.db_type().is_char_family() || value.db_type().is_bit_family() {
        deep_copy_value(value)
    } else {
        DbValue::Varchar(value.to_text())
    }
}
