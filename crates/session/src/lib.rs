//! Per-connection server state.
//!
//! Sessions outlive single requests: they carry prepared statements,
//! session variables, holdable cursors, the LAST_INSERT_ID pair, row
//! counts, trace output and per-session parameter overrides. The registry
//! is a lock-free hash map with a per-entry mutex; an inactivity reaper
//! removes abandoned sessions on a fixed cadence.

pub mod manager;
pub mod reaper;
pub mod state;

pub use manager::{ConnectionEntry, Sessions};
pub use reaper::SessionReaper;
pub use state::{
    HoldableQuery, MAX_PREPARED_STATEMENTS, MAX_SESSION_VARIABLES, PreparedStatement, SessionId,
    SessionState, TraceFormat, TzRegion,
};
