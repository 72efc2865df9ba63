//! Scan-side filter entry points: evaluate a predicate against a heap
//! record or a multi-column index key, and fold the scan's qualification
//! mode into the 3VL result.

use std::cell::RefCell;
use std::rc::Rc;

use squill_lib_core::domain::DbType;
use squill_lib_core::logical::Logical;
use squill_lib_core::oid::Oid;
use squill_lib_core::value::DbValue;

use crate::context::ExecContext;
use crate::eval::eval_pred;
use crate::external::{HeapRecord, MidxKey};
use crate::pred::PredExpr;
use crate::regu::{AttrId, AttrInfoCache, ValueDescriptor};

/// Scan qualification: which truth value lets a tuple through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualification {
    /// Keep tuples the predicate accepts.
    Qualified,
    /// Keep tuples the predicate rejects.
    NotQualified,
    /// Keep every tuple regardless of the predicate.
    QualifiedOrNot,
}

/// Everything a scan filter needs: the predicate, the attribute cache the
/// storage engine fills, and the declared types of the filtered attributes.
pub struct FilterInfo<'p> {
    pub pred: Option<&'p PredExpr>,
    pub cache: Rc<RefCell<AttrInfoCache>>,
    pub attrs: Vec<(AttrId, DbType)>,
}

impl<'p> FilterInfo<'p> {
    pub fn new(
        pred: Option<&'p PredExpr>,
        cache: Rc<RefCell<AttrInfoCache>>,
        attrs: Vec<(AttrId, DbType)>,
    ) -> FilterInfo<'p> {
        FilterInfo { pred, cache, attrs }
    }
}

/// Compatibility: a NULL char/bit attribute reads as an empty string when
/// `oracle_style_empty_string` is set. Default semantics leave NULLs alone.
fn apply_empty_string_compat(ctx: &ExecContext, filter: &FilterInfo) {
    if !ctx.params.oracle_style_empty_string {
        return;
    }
    let mut cache = filter.cache.borrow_mut();
    for (attr_id, db_type) in &filter.attrs {
        if !(db_type.is_char_family() || db_type.is_bit_family()) {
            continue;
        }
        if cache.value(*attr_id).is_some_and(DbValue::is_null) {
            let replacement = if db_type.is_char_family() {
                DbValue::Varchar(String::new())
            } else {
                DbValue::Varbit(Vec::new())
            };
            cache.set_value(*attr_id, replacement);
        }
    }
}

/// Evaluate the filter against a heap record, loading the referenced
/// attribute values through the storage engine first.
pub fn eval_data_filter(
    ctx: &mut ExecContext,
    oid: &Oid,
    record: &HeapRecord,
    filter: &FilterInfo,
    vd: &ValueDescriptor,
) -> Logical {
    let Some(pred) = filter.pred else {
        return Logical::True;
    };
    if let Err(err) = ctx.heap.read_attr_values(oid, record, &filter.cache) {
        return ctx.error(err);
    }
    apply_empty_string_compat(ctx, filter);
    eval_pred(ctx, pred, vd, Some(oid))
}

/// Evaluate the filter against a multi-column index key, projecting the
/// referenced columns out of the packed key.
pub fn eval_key_filter(
    ctx: &mut ExecContext,
    key: &MidxKey,
    filter: &FilterInfo,
    vd: &ValueDescriptor,
) -> Logical {
    let Some(pred) = filter.pred else {
        return Logical::True;
    };
    {
        let mut cache = filter.cache.borrow_mut();
        for (attr_id, value) in key.attr_ids.iter().zip(&key.values) {
            let needed = filter.attrs.iter().any(|(id, _)| id == attr_id);
            if needed {
                cache.set_value(*attr_id, value.clone());
            }
        }
    }
    apply_empty_string_compat(ctx, filter);
    eval_pred(ctx, pred, vd, None)
}

/// Fold the scan's qualification mode into an evaluation result. Errors
/// pass through untouched.
pub fn update_logical_result(result: Logical, qualification: Qualification) -> Logical {
    if result == Logical::Error {
        return result;
    }
    match qualification {
        Qualification::Qualified => {
            if result == Logical::True {
                Logical::True
            } else {
                Logical::False
            }
        }
        Qualification::NotQualified => {
            if result == Logical::False {
                Logical::True
            } else {
                Logical::False
            }
        }
        Qualification::QualifiedOrNot => Logical::True,
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use pretty_assertions::assert_eq;
    use squill_lib_core::domain::DbType;
    use squill_lib_core::errors::Result;
    use squill_lib_core::logical::Logical;
    use squill_lib_core::oid::Oid;
    use squill_lib_core::params::SystemParameters;
    use squill_lib_core::value::DbValue;

    use super::{FilterInfo, Qualification, eval_data_filter, eval_key_filter, update_logical_result};
    use crate::context::ExecContext;
    use crate::external::{HeapRecord, HeapStorage, MidxKey};
    use crate::pred::{PredExpr, RelOp};
    use crate::regu::{AttrDescr, AttrInfoCache, ReguVariable};

    /// Storage stub that decodes records as `id:value` integer pairs.
    struct MapStorage {
        rows: Vec<(Oid, Vec<(i32, DbValue)>)>,
    }

    impl HeapStorage for MapStorage {
        fn read_attr_values(
            &self,
            oid: &Oid,
            _record: &HeapRecord,
            cache: &RefCell<AttrInfoCache>,
        ) -> Result<()> {
            let mut cache = cache.borrow_mut();
            for (row_oid, attrs) in &self.rows {
                if row_oid == oid {
                    for (id, value) in attrs {
                        cache.set_value(*id, value.clone());
                    }
                }
            }
            Ok(())
        }

        fn is_object_not_null(&self, oid: &Oid) -> Result<bool> {
            Ok(!oid.is_null())
        }
    }

    fn age_filter(cache: Rc<RefCell<AttrInfoCache>>) -> PredExpr {
        PredExpr::comp(
            ReguVariable::attr(AttrDescr::new(1, DbType::Int, 0, cache)),
            RelOp::Gt,
            ReguVariable::constant(DbValue::Int(10)),
        )
    }

    #[test]
    fn data_filter_loads_attributes_then_evaluates() {
        let params = SystemParameters::default();
        let oid = Oid::new(0, 4, 2);
        let storage = MapStorage {
            rows: vec![(oid, vec![(1, DbValue::Int(20))])],
        };
        let cursors = crate::external::NoStorage;
        let subq = crate::external::NoStorage;
        let mut ctx = ExecContext::new(&params, &storage, &cursors, &subq);

        let cache = Rc::new(RefCell::new(AttrInfoCache::new()));
        let pred = age_filter(Rc::clone(&cache));
        let filter = FilterInfo::new(Some(&pred), cache, vec![(1, DbType::Int)]);
        let vd = crate::regu::ValueDescriptor::default();
        let result = eval_data_filter(&mut ctx, &oid, &HeapRecord::default(), &filter, &vd);
        assert_eq!(result, Logical::True);
    }

    #[test]
    fn key_filter_projects_packed_columns() {
        let params = SystemParameters::default();
        let mut ctx = ExecContext::detached(&params);
        let cache = Rc::new(RefCell::new(AttrInfoCache::new()));
        let pred = age_filter(Rc::clone(&cache));
        let filter = FilterInfo::new(Some(&pred), cache, vec![(1, DbType::Int)]);
        let key = MidxKey {
            attr_ids: vec![0, 1],
            values: vec![DbValue::Int(99), DbValue::Int(5)],
        };
        let vd = crate::regu::ValueDescriptor::default();
        assert_eq!(eval_key_filter(&mut ctx, &key, &filter, &vd), Logical::False);
    }

    #[test]
    fn empty_filter_qualifies_everything() {
        let params = SystemParameters::default();
        let mut ctx = ExecContext::detached(&params);
        let cache = Rc::new(RefCell::new(AttrInfoCache::new()));
        let filter = FilterInfo::new(None, cache, vec![]);
        let key = MidxKey {
            attr_ids: vec![],
            values: vec![],
        };
        let vd = crate::regu::ValueDescriptor::default();
        assert_eq!(eval_key_filter(&mut ctx, &key, &filter, &vd), Logical::True);
    }

    #[test]
    fn qualification_state_machine() {
        use Logical::*;
        assert_eq!(update_logical_result(True, Qualification::Qualified), True);
        assert_eq!(update_logical_result(Unknown, Qualification::Qualified), False);
        assert_eq!(update_logical_result(False, Qualification::NotQualified), True);
        assert_eq!(
            update_logical_result(Unknown, Qualification::NotQualified),
            False
        );
        assert_eq!(
            update_logical_result(False, Qualification::QualifiedOrNot),
            True
        );
        assert_eq!(update_logical_result(Error, Qualification::QualifiedOrNot), Error);
    }

    #[test]
    fn oracle_style_empty_string_compat() {
        use squill_helpers::Config;
        let params = SystemParameters::default().config(|p| p.oracle_style_empty_string = true);
        let oid = Oid::new(0, 7, 1);
        let storage = MapStorage {
            rows: vec![(oid, vec![(2, DbValue::Null)])],
        };
        let cursors = crate::external::NoStorage;
        let subq = crate::external::NoStorage;
        let mut ctx = ExecContext::new(&params, &storage, &cursors, &subq);

        let cache = Rc::new(RefCell::new(AttrInfoCache::new()));
        let pred = PredExpr::comp(
            ReguVariable::attr(AttrDescr::new(2, DbType::Varchar, 0, Rc::clone(&cache))),
            RelOp::Eq,
            ReguVariable::constant(DbValue::Varchar(String::new())),
        );
        let filter = FilterInfo::new(Some(&pred), cache, vec![(2, DbType::Varchar)]);
        let vd = crate::regu::ValueDescriptor::default();
        // With the flag, NULL reads as '' and the comparison is TRUE rather
        // than UNKNOWN.
        let result = eval_data_filter(&mut ctx, &oid, &HeapRecord::default(), &filter, &vd);
        assert_eq!(result, Logical::True);
    }
}
