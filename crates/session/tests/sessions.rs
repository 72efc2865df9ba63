use std::sync::Arc;

use pretty_assertions::assert_eq;
use squill_lib_core::errors::SquillError;
use squill_lib_core::params::SystemParameters;
use squill_lib_core::value::{DbValue, ListId};
use squill_lockfree::tran::TranSystem;
use squill_session::state::QueryTraceStats;
use squill_session::{
    ConnectionEntry, HoldableQuery, PreparedStatement, Sessions, TraceFormat, TzRegion,
};

fn setup() -> (Arc<SystemParameters>, Arc<TranSystem>, Arc<Sessions>) {
    let params = Arc::new(SystemParameters::default());
    let tran_system = TranSystem::new(8, 100);
    let sessions = Arc::new(Sessions::new(Arc::clone(&params), Arc::clone(&tran_system)));
    (params, tran_system, sessions)
}

fn stmt(name: &str, alias: &str) -> PreparedStatement {
    PreparedStatement {
        name: name.to_owned(),
        alias_print: Some(alias.to_owned()),
        sha1: [7; 20],
        info: vec![1, 2, 3],
    }
}

#[test]
fn create_check_destroy_round_trip() {
    let (_, tran_system, sessions) = setup();
    let tran = tran_system.request_entry().unwrap();
    let mut conn = ConnectionEntry::new();

    let id = sessions.create(&tran, &mut conn).unwrap();
    assert_eq!(conn.session_id(), Some(id));
    assert_eq!(sessions.count(), 1);

    sessions.check(&tran, &mut conn, id).unwrap();
    sessions.release(&tran, &mut conn);

    sessions.destroy(&tran, &mut conn, id).unwrap();
    assert_eq!(sessions.count(), 0);
    assert_eq!(
        sessions.check(&tran, &mut conn, id).unwrap_err(),
        SquillError::SessionExpired(id)
    );
}

#[test]
fn ids_are_distinct_across_creates() {
    let (_, tran_system, sessions) = setup();
    let tran = tran_system.request_entry().unwrap();

    let mut ids = Vec::new();
    for _ in 0..10 {
        // A fresh connection per create, so previous sessions stay alive.
        let mut conn = ConnectionEntry::new();
        ids.push(sessions.create(&tran, &mut conn).unwrap());
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 10);
    assert_eq!(sessions.count(), 10);
}

/// Session variables: set, read back, drop, then read fails.
#[test]
fn session_variable_lifecycle() {
    let (_, tran_system, sessions) = setup();
    let tran = tran_system.request_entry().unwrap();
    let mut conn = ConnectionEntry::new();
    let id = sessions.create(&tran, &mut conn).unwrap();

    sessions.set_variable(&tran, id, "x", &DbValue::Int(7)).unwrap();
    assert_eq!(sessions.get_variable(&tran, id, "x").unwrap(), DbValue::Int(7));
    sessions.drop_variable(&tran, id, "x").unwrap();
    assert_eq!(
        sessions.get_variable(&tran, id, "x").unwrap_err(),
        SquillError::VariableNotFound("x".to_owned())
    );
}

/// PREPARE twice under the same name replaces the statement.
#[test]
fn prepared_statement_replacement() {
    let (_, tran_system, sessions) = setup();
    let tran = tran_system.request_entry().unwrap();
    let mut conn = ConnectionEntry::new();
    let id = sessions.create(&tran, &mut conn).unwrap();

    sessions
        .set_prepared_statement(&tran, id, stmt("p1", "SELECT 1"))
        .unwrap();
    sessions
        .set_prepared_statement(&tran, id, stmt("p1", "SELECT 2"))
        .unwrap();
    let got = sessions.get_prepared_statement(&tran, id, "p1").unwrap();
    assert_eq!(got.alias_print, Some("SELECT 2".to_owned()));

    sessions.delete_prepared_statement(&tran, id, "p1").unwrap();
    assert_eq!(
        sessions
            .delete_prepared_statement(&tran, id, "p1")
            .unwrap_err(),
        SquillError::PreparedNameNotFound("p1".to_owned())
    );
}

#[test]
fn row_count_and_trace_stats() {
    let (_, tran_system, sessions) = setup();
    let tran = tran_system.request_entry().unwrap();
    let mut conn = ConnectionEntry::new();
    let id = sessions.create(&tran, &mut conn).unwrap();

    sessions.set_row_count(&tran, id, 42).unwrap();
    assert_eq!(sessions.get_row_count(&tran, id).unwrap(), 42);

    let stats = QueryTraceStats {
        elapsed_ms: 12,
        fetches: 5,
        ioreads: 2,
        rows_scanned: 100,
        rows_qualified: 7,
    };
    let json = stats.render(TraceFormat::Json);
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed["rows_qualified"], 7);

    sessions
        .set_trace_stats(&tran, id, json.clone(), TraceFormat::Json)
        .unwrap();
    assert_eq!(
        sessions.get_trace_stats(&tran, id).unwrap(),
        Some((json, TraceFormat::Json))
    );
    sessions.clear_trace_stats(&tran, id).unwrap();
    assert_eq!(sessions.get_trace_stats(&tran, id).unwrap(), None);
}

#[test]
fn holdable_queries_survive_and_count_globally() {
    let (_, tran_system, sessions) = setup();
    let tran = tran_system.request_entry().unwrap();
    let mut conn = ConnectionEntry::new();
    let id = sessions.create(&tran, &mut conn).unwrap();

    let query = HoldableQuery {
        query_id: 900,
        list_id: ListId::new(31),
        temp_file_count: 2,
        total_count: 128,
        query_flag: 0,
        preserved: false,
    };
    sessions.store_query_entry_info(&tran, id, query).unwrap();
    assert_eq!(sessions.holdable_count(), 1);

    let loaded = sessions.load_query_entry_info(&tran, id, 900).unwrap();
    assert!(loaded.preserved);
    assert_eq!(loaded.total_count, 128);

    sessions.remove_query_entry_info(&tran, id, 900).unwrap();
    assert_eq!(sessions.holdable_count(), 0);
    assert!(sessions.load_query_entry_info(&tran, id, 900).is_err());
}

/// An expired, unreferenced session is removed by a reaper pass; a pinned
/// one survives until its reference is dropped.
#[test]
fn reaper_removes_only_unreferenced_expired_sessions() {
    let (params, tran_system, sessions) = setup();
    let tran = tran_system.request_entry().unwrap();

    let mut idle_conn = ConnectionEntry::new();
    let idle = sessions.create(&tran, &mut idle_conn).unwrap();
    sessions.release(&tran, &mut idle_conn);

    let mut pinned_conn = ConnectionEntry::new();
    let pinned = sessions.create(&tran, &mut pinned_conn).unwrap();

    let long_after = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + params.session_state_timeout.as_secs()
        + 10;

    let removed = sessions.remove_expired(&tran, long_after);
    assert_eq!(removed, 1);
    assert!(sessions.check(&tran, &mut idle_conn, idle).is_err());
    assert_eq!(sessions.count(), 1);

    // Dropping the pin lets the next pass take it.
    sessions.release(&tran, &mut pinned_conn);
    let removed = sessions.remove_expired(&tran, long_after);
    assert_eq!(removed, 1);
    assert!(sessions.check(&tran, &mut pinned_conn, pinned).is_err());
}

#[test]
fn destroy_with_concurrent_reference_defers_removal() {
    let (_, tran_system, sessions) = setup();
    let tran = tran_system.request_entry().unwrap();

    let mut conn_a = ConnectionEntry::new();
    let id = sessions.create(&tran, &mut conn_a).unwrap();

    // A second worker pins the same session.
    let mut conn_b = ConnectionEntry::new();
    sessions.check(&tran, &mut conn_b, id).unwrap();

    // Worker A disconnects; the record must survive for B.
    sessions.destroy(&tran, &mut conn_a, id).unwrap();
    assert_eq!(sessions.count(), 1);

    sessions.release(&tran, &mut conn_b);
    sessions.destroy(&tran, &mut conn_b, id).unwrap_or_default();
    assert_eq!(sessions.count(), 0);
}

#[test]
fn dump_lists_sessions_and_state() {
    let (_, tran_system, sessions) = setup();
    let tran = tran_system.request_entry().unwrap();
    let mut conn = ConnectionEntry::new();
    let id = sessions.create(&tran, &mut conn).unwrap();
    sessions.set_variable(&tran, id, "greeting", &DbValue::Varchar("hi".to_owned())).unwrap();
    sessions
        .set_prepared_statement(&tran, id, stmt("p9", "SELECT 9"))
        .unwrap();
    sessions
        .set_time_zone(
            &tran,
            id,
            TzRegion {
                name: "Europe/Berlin".to_owned(),
                offset_secs: 3600,
            },
        )
        .unwrap();
    sessions
        .set_plan_string(&tran, id, Some("iscan(items.pk)".to_owned()))
        .unwrap();

    let dump = sessions.dump(&tran);
    assert!(dump.contains(&format!("SESSION {id}")));
    assert!(dump.contains("tz Europe/Berlin"));
    assert!(dump.contains("plan: iscan(items.pk)"));
    assert!(dump.contains("var greeting = hi"));
    assert!(dump.contains("stmt p9 :: SELECT 9"));
    assert!(dump.contains("1 session(s)"));
}

#[test]
fn plan_timezone_and_connection_flags_round_trip() {
    let (_, tran_system, sessions) = setup();
    let tran = tran_system.request_entry().unwrap();
    let mut conn = ConnectionEntry::new();
    let id = sessions.create(&tran, &mut conn).unwrap();

    assert_eq!(sessions.get_time_zone(&tran, id).unwrap().name, "UTC");
    sessions
        .set_time_zone(
            &tran,
            id,
            TzRegion {
                name: "Asia/Seoul".to_owned(),
                offset_secs: 32_400,
            },
        )
        .unwrap();
    assert_eq!(
        sessions.get_time_zone(&tran, id).unwrap().name,
        "Asia/Seoul"
    );

    assert_eq!(sessions.get_plan_string(&tran, id).unwrap(), None);
    sessions
        .set_plan_string(&tran, id, Some("sscan(orders)".to_owned()))
        .unwrap();
    assert_eq!(
        sessions.get_plan_string(&tran, id).unwrap(),
        Some("sscan(orders)".to_owned())
    );

    sessions.set_auto_commit(&tran, id, true).unwrap();
    assert!(
        sessions
            .with_session(&tran, id, |s| s.is_auto_commit())
            .unwrap()
    );

    sessions.set_loader_handle(&tran, id, Some(3)).unwrap();
    assert_eq!(sessions.get_loader_handle(&tran, id).unwrap(), Some(3));
    sessions.set_loader_handle(&tran, id, None).unwrap();
    assert_eq!(sessions.get_loader_handle(&tran, id).unwrap(), None);
}

#[test]
fn reaper_daemon_runs_and_stops() {
    let (_, tran_system, sessions) = setup();
    let reaper = squill_session::SessionReaper::spawn(
        Arc::clone(&sessions),
        Arc::clone(&tran_system),
    );
    // Nothing to reap; just make sure the daemon starts and shuts down
    // promptly despite the 60s cadence.
    reaper.stop();
}

#[test]
fn concurrent_checks_keep_refcounts_consistent() {
    let (_, tran_system, sessions) = setup();
    let tran = tran_system.request_entry().unwrap();
    let mut conn = ConnectionEntry::new();
    let id = sessions.create(&tran, &mut conn).unwrap();
    sessions.release(&tran, &mut conn);

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let sessions = Arc::clone(&sessions);
            let tran_system = Arc::clone(&tran_system);
            scope.spawn(move || {
                let tran = tran_system.request_entry().unwrap();
                let mut conn = ConnectionEntry::new();
                for _ in 0..100 {
                    sessions.check(&tran, &mut conn, id).unwrap();
                    sessions.release(&tran, &mut conn);
                }
            });
        }
    });

    // All pins released: destroy removes the record.
    let mut closer = ConnectionEntry::new();
    sessions.destroy(&tran, &mut closer, id).unwrap();
    assert_eq!(sessions.count(), 0);
}
