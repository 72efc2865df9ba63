//! The statement-preparation-to-scan pipeline: normalize a predicate,
//! push conjuncts down to the scopes they reference, then drive the data
//! filter over heap rows the way a scan loop does.

use std::cell::RefCell;
use std::rc::Rc;

use pretty_assertions::assert_eq;
use squill_executor::cnf::cnf;
use squill_executor::context::ExecContext;
use squill_executor::eval::filter::{
    FilterInfo, Qualification, eval_data_filter, update_logical_result,
};
use squill_executor::external::{HeapRecord, HeapStorage, NoStorage};
use squill_executor::pred::{PredExpr, RelOp};
use squill_executor::regu::{AttrDescr, AttrInfoCache, ReguVariable, ValueDescriptor};
use squill_lib_core::domain::DbType;
use squill_lib_core::errors::Result;
use squill_lib_core::logical::Logical;
use squill_lib_core::oid::Oid;
use squill_lib_core::params::SystemParameters;
use squill_lib_core::value::DbValue;

/// Heap stub decoding records from an in-memory row table.
struct RowStorage {
    rows: Vec<(Oid, i32, Option<i32>)>, // (oid, price, discount)
}

impl HeapStorage for RowStorage {
    fn read_attr_values(
        &self,
        oid: &Oid,
        _record: &HeapRecord,
        cache: &RefCell<AttrInfoCache>,
    ) -> Result<()> {
        let mut cache = cache.borrow_mut();
        for (row_oid, price, discount) in &self.rows {
            if row_oid == oid {
                cache.set_value(0, DbValue::Int(*price));
                cache.set_value(
                    1,
                    discount.map(DbValue::Int).unwrap_or(DbValue::Null),
                );
            }
        }
        Ok(())
    }

    fn is_object_not_null(&self, oid: &Oid) -> Result<bool> {
        Ok(!oid.is_null())
    }
}

const ITEMS_SPEC: u32 = 4;
const ORDERS_SPEC: u32 = 5;

#[test]
fn prepared_predicate_filters_a_scan() {
    // WHERE NOT (price < 100 OR discount IS NULL) AND orders.total > 0
    // normalizes to three conjuncts; only the first two belong to the
    // items scope and feed its scan filter.
    let cache = Rc::new(RefCell::new(AttrInfoCache::new()));
    let price = || {
        ReguVariable::attr(AttrDescr::new(0, DbType::Int, ITEMS_SPEC, Rc::clone(&cache)))
    };
    let discount = || {
        ReguVariable::attr(AttrDescr::new(1, DbType::Int, ITEMS_SPEC, Rc::clone(&cache)))
    };
    let orders_cache = Rc::new(RefCell::new(AttrInfoCache::new()));
    let orders_total =
        ReguVariable::attr(AttrDescr::new(9, DbType::Int, ORDERS_SPEC, orders_cache));

    let where_clause = PredExpr::and(
        PredExpr::or(
            PredExpr::comp(price(), RelOp::Lt, ReguVariable::constant(DbValue::Int(100))),
            PredExpr::is_null(discount()),
        )
        .negated(),
        PredExpr::comp(orders_total, RelOp::Gt, ReguVariable::constant(DbValue::Int(0))),
    );

    let normalized = cnf(where_clause).unwrap();
    assert_eq!(normalized.conjuncts.len(), 3);

    let push_down = normalized.push_down(&[ITEMS_SPEC, ORDERS_SPEC]);
    let items_conjuncts = &push_down.per_spec[0].1;
    assert_eq!(items_conjuncts.len(), 2);
    assert_eq!(push_down.per_spec[1].1.len(), 1);
    assert!(push_down.residual.is_empty());

    // Rebuild the pushed-down filter the way the plan generator would.
    let mut filter_pred = None;
    for conjunct in items_conjuncts.iter().rev() {
        let disjunction = conjunct.to_pred_expr();
        filter_pred = Some(match filter_pred {
            None => disjunction,
            Some(rest) => PredExpr::and(disjunction, rest),
        });
    }
    let filter_pred = filter_pred.unwrap();

    let storage = RowStorage {
        rows: vec![
            (Oid::new(0, 1, 0), 150, Some(10)), // passes
            (Oid::new(0, 1, 1), 50, Some(5)),   // price too low
            (Oid::new(0, 1, 2), 200, None),     // discount NULL
        ],
    };
    let cursors = NoStorage;
    let subq = NoStorage;
    let params = SystemParameters::default();
    let mut ctx = ExecContext::new(&params, &storage, &cursors, &subq);

    let filter = FilterInfo::new(
        Some(&filter_pred),
        Rc::clone(&cache),
        vec![(0, DbType::Int), (1, DbType::Int)],
    );
    let vd = ValueDescriptor::default();

    let mut qualified = Vec::new();
    for (oid, _, _) in &storage.rows {
        let raw = eval_data_filter(&mut ctx, oid, &HeapRecord::default(), &filter, &vd);
        let result = update_logical_result(raw, Qualification::Qualified);
        assert!(result != Logical::Error);
        if result == Logical::True {
            qualified.push(*oid);
        }
    }
    assert_eq!(qualified, vec![Oid::new(0, 1, 0)]);
}
