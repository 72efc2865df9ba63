//! Lazy subquery execution through the XASL hooks, and the per-node result
//! cache as the interpreter drives it.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use squill_executor::context::ExecContext;
use squill_executor::eval::eval_pred;
use squill_executor::external::{
    ListCursorEngine, MemoryCursorEngine, NoStorage, ScanId, SortKey, SubqueryRuntime,
};
use squill_executor::pred::PredExpr;
use squill_executor::regu::{ReguSpec, ReguVariable, ValueDescriptor};
use squill_executor::subquery_cache::{SqKey, SqValue, SubqueryCache};
use squill_executor::xasl::{XaslNode, XaslStatus};
use squill_lib_core::errors::Result;
use squill_lib_core::logical::Logical;
use squill_lib_core::params::SystemParameters;
use squill_lib_core::value::{DbValue, ListId};
use squill_lockfree::tran::TranSystem;

/// Runtime stub: "executing" the nested plan materializes a two-row list
/// into the regu's list slot and flips the node status.
struct CountingRuntime {
    engine: MemoryCursorEngine,
    executions: Cell<u32>,
}

impl CountingRuntime {
    fn new() -> CountingRuntime {
        CountingRuntime {
            engine: MemoryCursorEngine::new(),
            executions: Cell::new(0),
        }
    }
}

impl ListCursorEngine for CountingRuntime {
    fn open_scan(&self, list: &ListId) -> Result<ScanId> {
        self.engine.open_scan(list)
    }

    fn next(&self, scan: ScanId) -> Result<Option<Vec<DbValue>>> {
        self.engine.next(scan)
    }

    fn close_scan(&self, scan: ScanId) {
        self.engine.close_scan(scan)
    }

    fn sort(&self, list: &ListId, key: &SortKey) -> Result<ListId> {
        self.engine.sort(list, key)
    }
}

impl SubqueryRuntime for CountingRuntime {
    fn execute_regu_variable_xasl(&self, regu: &ReguVariable) -> Result<()> {
        self.executions.set(self.executions.get() + 1);
        let materialized = self.engine.add_list(
            u64::from(self.executions.get()),
            vec![vec![DbValue::Int(1)], vec![DbValue::Int(2)]],
        );
        if let ReguSpec::ListId(slot) = &regu.spec {
            *slot.borrow_mut() = materialized;
        }
        if let Some(xasl) = &regu.xasl {
            xasl.status.set(XaslStatus::Success);
        }
        Ok(())
    }

    fn regu_variable_xasl_status(&self, regu: &ReguVariable) -> XaslStatus {
        regu.xasl
            .as_ref()
            .map(|x| x.status.get())
            .unwrap_or(XaslStatus::Cleared)
    }
}

#[test]
fn exists_executes_the_subquery_lazily_and_once() {
    let params = SystemParameters::default();
    let runtime = CountingRuntime::new();
    let storage = NoStorage;
    let mut ctx = ExecContext::new(&params, &storage, &runtime, &runtime);

    let xasl = Rc::new(XaslNode::new(1));
    let pred = PredExpr::exists(
        ReguVariable::list(ListId::new(0)).with_xasl(Rc::clone(&xasl)),
    );
    let vd = ValueDescriptor::default();

    assert_eq!(eval_pred(&mut ctx, &pred, &vd, None), Logical::True);
    assert_eq!(runtime.executions.get(), 1);
    assert_eq!(xasl.status.get(), XaslStatus::Success);

    // Already materialized: the second evaluation reuses the list.
    assert_eq!(eval_pred(&mut ctx, &pred, &vd, None), Logical::True);
    assert_eq!(runtime.executions.get(), 1);
}

/// The interpreter's per-outer-tuple flow: build the key from the
/// correlated columns, consult the cache, execute on miss, publish on put.
#[test]
fn correlated_subquery_results_are_cached_per_key() {
    let tran_system = TranSystem::new(2, 100);
    let tran = tran_system.request_entry().unwrap();

    let xasl = XaslNode::new(9);
    xasl.sq_cache
        .borrow_mut()
        .replace(SubqueryCache::new(Arc::clone(&tran_system), 1, 1 << 20));

    let mut executions = 0;
    let mut run_subquery = |outer: i64| -> DbValue {
        // Deterministic stand-in for the nested plan.
        executions += 1;
        DbValue::Bigint(outer * 6)
    };

    let outer_rows = [7i64, 7, 3, 7, 3];
    let mut results = Vec::new();
    for outer in outer_rows {
        let mut cache_slot = xasl.sq_cache.borrow_mut();
        let cache = cache_slot.as_mut().unwrap();
        let key = SqKey::from_values(&[&DbValue::Bigint(outer)]);
        let value = match cache.get(&tran, &key) {
            Some(SqValue::Value(v)) => v,
            Some(SqValue::List(_)) => unreachable!("scalar subquery"),
            None => {
                let v = run_subquery(outer);
                cache.put(&tran, key, SqValue::Value(v.clone())).unwrap();
                v
            }
        };
        results.push(value);
    }

    assert_eq!(executions, 2);
    let cache_slot = xasl.sq_cache.borrow();
    let cache = cache_slot.as_ref().unwrap();
    assert_eq!(cache.stats.hit, 3);
    assert_eq!(cache.stats.miss, 2);
    assert_eq!(
        results,
        vec![
            DbValue::Bigint(42),
            DbValue::Bigint(42),
            DbValue::Bigint(18),
            DbValue::Bigint(42),
            DbValue::Bigint(18),
        ]
    );
}
