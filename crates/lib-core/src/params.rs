//! System parameters consulted by the execution substrate.

use std::time::Duration;

use strum_macros::{Display, EnumIter, EnumString};

use crate::value::DbValue;

/// Identifier of a tunable system parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum ParamId {
    SessionStateTimeout,
    MaxRecursionSqlDepth,
    MaxSubqueryCacheSize,
    ErLogDebug,
    EnableNewLfhash,
    OracleStyleEmptyString,
}

/// One per-session parameter override.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParam {
    pub id: ParamId,
    pub value: DbValue,
}

/// Server-wide parameter values, shared read-only once the server boots.
/// Sessions carry their own override lists.
#[derive(Debug, Clone)]
pub struct SystemParameters {
    /// Seconds of inactivity before the reaper removes a session.
    pub session_state_timeout: Duration,
    /// Predicate-evaluation recursion guard.
    pub max_recursion_sql_depth: usize,
    /// Soft byte cap for a single subquery cache.
    pub max_subquery_cache_size: u64,
    /// Enables debug logging in core components.
    pub er_log_debug: bool,
    /// Selects the new-style lock-free hash map implementation.
    pub enable_new_lfhash: bool,
    /// Compatibility: coerce NULL char/bit into an empty string at filter
    /// time. Default off.
    pub oracle_style_empty_string: bool,
    /// Transactions between recomputations of the minimum active id.
    pub mati_refresh_interval: u64,
    /// Freelist slab size, in entries.
    pub freelist_block_size: usize,
    /// Soft upper bound on entries a freelist may allocate.
    pub freelist_max_alloc: usize,
    /// Cadence of the session reaper daemon.
    pub session_reaper_interval: Duration,
}

impl Default for SystemParameters {
    fn default() -> SystemParameters {
        SystemParameters {
            session_state_timeout: Duration::from_secs(21_600),
            max_recursion_sql_depth: 400,
            max_subquery_cache_size: 2 * 1024 * 1024,
            er_log_debug: false,
            enable_new_lfhash: true,
            oracle_style_empty_string: false,
            mati_refresh_interval: 100,
            freelist_block_size: 64,
            freelist_max_alloc: i32::MAX as usize,
            session_reaper_interval: Duration::from_secs(60),
        }
    }
}

impl SystemParameters {
    /// Read one parameter as a value, honoring a session override list.
    /// Overrides win; unknown ids fall through to the server value.
    pub fn get(&self, id: ParamId, overrides: &[SessionParam]) -> DbValue {
        if let Some(over) = overrides.iter().find(|p| p.id == id) {
            return over.value.clone();
        }
        match id {
            ParamId::SessionStateTimeout => {
                DbValue::Bigint(self.session_state_timeout.as_secs() as i64)
            }
            ParamId::MaxRecursionSqlDepth => DbValue::Int(self.max_recursion_sql_depth as i32),
            ParamId::MaxSubqueryCacheSize => DbValue::Bigint(self.max_subquery_cache_size as i64),
            ParamId::ErLogDebug => DbValue::Int(self.er_log_debug as i32),
            ParamId::EnableNewLfhash => DbValue::Int(self.enable_new_lfhash as i32),
            ParamId::OracleStyleEmptyString => DbValue::Int(self.oracle_style_empty_string as i32),
        }
    }
}
