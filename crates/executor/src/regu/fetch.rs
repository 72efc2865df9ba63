//! Value fetch over the register-variable tree.
//!
//! `fetch_peek_dbval` hands back a borrowed view of a value owned by the
//! tree, the tuple, or the attribute cache — callers must not mutate a
//! peeked value. Only object identifiers are materialized on the fly.

use std::cell::Ref;
use std::ops::Deref;

use squill_lib_core::errors::{Result, SquillError};
use squill_lib_core::oid::Oid;
use squill_lib_core::value::{DbSet, DbValue, SetKind};

use crate::context::ExecContext;
use crate::regu::arith::eval_arith;
use crate::regu::{FuncKind, FuncSpec, FuncTemp, ReguSpec, ReguVariable};

/// Bindings the scan loop supplies for one tuple evaluation.
#[derive(Default)]
pub struct ValueDescriptor<'v> {
    /// Host-variable values, indexed by `POS_VALUE` slots.
    pub host_vars: &'v [DbValue],
    /// Current tuple of the driving list scan, for `POSITION` variables.
    pub tuple: Option<&'v [DbValue]>,
    /// Current instance and class identifiers.
    pub oid: Option<Oid>,
    pub class_oid: Option<Oid>,
}

/// A zero-copy view of a fetched value.
pub enum Peek<'a> {
    Plain(&'a DbValue),
    Slot(Ref<'a, DbValue>),
    /// Materialized on the fly (object identifiers only).
    Owned(DbValue),
}

impl Deref for Peek<'_> {
    type Target = DbValue;

    fn deref(&self) -> &DbValue {
        match self {
            Peek::Plain(v) => v,
            Peek::Slot(r) => r,
            Peek::Owned(v) => v,
        }
    }
}

impl std::fmt::Debug for Peek<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        (**self).fmt(f)
    }
}

/// Produce the value of `regu` for the current tuple.
pub fn fetch_peek_dbval<'a>(
    ctx: &mut ExecContext,
    regu: &'a ReguVariable,
    vd: &'a ValueDescriptor<'a>,
    obj_oid: Option<&Oid>,
) -> Result<Peek<'a>> {
    match &regu.spec {
        ReguSpec::Value(slot) => Ok(Peek::Slot(slot.borrow())),
        ReguSpec::Constant(shared) => Ok(Peek::Slot(shared.borrow())),
        ReguSpec::Arith(arith) => {
            eval_arith(ctx, arith, vd, obj_oid)?;
            Ok(Peek::Slot(arith.value.borrow()))
        }
        ReguSpec::Attr(descr) | ReguSpec::ClassAttr(descr) | ReguSpec::SharedAttr(descr) => {
            let cache = descr.cache.borrow();
            if cache.value(descr.id).is_none() {
                return Err(SquillError::Internal("attribute value not in cache"));
            }
            Ok(Peek::Slot(Ref::map(cache, |c| c.value(descr.id).unwrap())))
        }
        ReguSpec::Position(pos) => {
            let tuple = vd
                .tuple
                .ok_or(SquillError::Internal("no current tuple for position fetch"))?;
            tuple
                .get(*pos)
                .map(Peek::Plain)
                .ok_or(SquillError::Internal("tuple position out of range"))
        }
        ReguSpec::PosValue(index) => vd
            .host_vars
            .get(*index)
            .map(Peek::Plain)
            .ok_or(SquillError::Internal("host variable slot out of range")),
        ReguSpec::Oid => {
            let oid = obj_oid.copied().or(vd.oid).unwrap_or(Oid::NULL);
            Ok(Peek::Owned(DbValue::Oid(oid)))
        }
        ReguSpec::ClassOid => Ok(Peek::Owned(DbValue::Oid(vd.class_oid.unwrap_or(Oid::NULL)))),
        ReguSpec::ListId(_) => Err(SquillError::InvalidDatatype("list fetch", "scalar value")),
        ReguSpec::Func(func) => {
            eval_function(ctx, func, vd, obj_oid)?;
            Ok(Peek::Slot(func.value.borrow()))
        }
        ReguSpec::ReguValList(list) => {
            let current = list.current.get();
            let item = list
                .items
                .get(current)
                .ok_or(SquillError::Internal("VALUES row cursor out of range"))?;
            fetch_peek_dbval(ctx, item, vd, obj_oid)
        }
        ReguSpec::ReguVarList(_) => Err(SquillError::InvalidDatatype(
            "variable list fetch",
            "scalar value",
        )),
    }
}

/// Evaluate a FUNC node into its result slot.
fn eval_function(
    ctx: &mut ExecContext,
    func: &FuncSpec,
    vd: &ValueDescriptor,
    obj_oid: Option<&Oid>,
) -> Result<()> {
    let result = match func.kind {
        FuncKind::SetOf | FuncKind::MultisetOf | FuncKind::SequenceOf => {
            let mut values = Vec::with_capacity(func.operands.len());
            for operand in &func.operands {
                values.push(fetch_peek_dbval(ctx, operand, vd, obj_oid)?.clone());
            }
            let kind = match func.kind {
                FuncKind::SetOf => SetKind::Set,
                FuncKind::MultisetOf => SetKind::Multiset,
                _ => SetKind::Sequence,
            };
            if kind == SetKind::Set {
                // Sets are duplicate-free; drop repeats on construction.
                let mut unique: Vec<DbValue> = Vec::with_capacity(values.len());
                for v in values {
                    let dup = unique.iter().any(|u| {
                        squill_lib_core::value::total_cmp(u, &v) == std::cmp::Ordering::Equal
                    });
                    if !dup {
                        unique.push(v);
                    }
                }
                values = unique;
            }
            DbValue::Set(DbSet::new(kind, values))
        }
        FuncKind::RegexpCount => {
            let src = fetch_peek_dbval(ctx, &func.operands[0], vd, obj_oid)?.clone();
            let pattern = fetch_peek_dbval(ctx, &func.operands[1], vd, obj_oid)?.clone();
            if src.is_null() || pattern.is_null() {
                DbValue::Null
            } else {
                let src = src
                    .as_str()
                    .ok_or(SquillError::InvalidDatatype("REGEXP_COUNT", "string"))?;
                let pattern = pattern
                    .as_str()
                    .ok_or(SquillError::InvalidDatatype("REGEXP_COUNT", "string"))?;
                let count = {
                    let regex = memoized_regex(func, pattern, true)?;
                    regex.find_iter(src).filter_map(|m| m.ok()).count()
                };
                DbValue::Int(count as i32)
            }
        }
        FuncKind::MethodCall => {
            return Err(SquillError::Internal("method dispatch is external"));
        }
    };
    *func.value.borrow_mut() = result;
    Ok(())
}

/// Fetch the compiled regex from the FUNC temp slot, compiling (and
/// memoizing) when the pattern or case mode changed.
fn memoized_regex<'f>(
    func: &'f FuncSpec,
    pattern: &str,
    case_sensitive: bool,
) -> Result<Ref<'f, fancy_regex::Regex>> {
    let needs_compile = match &*func.temp.borrow() {
        Some(FuncTemp::Regex {
            pattern: cached,
            case_sensitive: cached_cs,
            ..
        }) => cached != pattern || *cached_cs != case_sensitive,
        None => true,
    };
    if needs_compile {
        let source = if case_sensitive {
            pattern.to_owned()
        } else {
            format!("(?i){pattern}")
        };
        let regex = fancy_regex::Regex::new(&source)
            .map_err(|_| SquillError::InvalidDatatype("regular expression", "pattern"))?;
        *func.temp.borrow_mut() = Some(FuncTemp::Regex {
            pattern: pattern.to_owned(),
            case_sensitive,
            regex,
        });
    }
    Ok(Ref::map(func.temp.borrow(), |t| match t {
        Some(FuncTemp::Regex { regex, .. }) => regex,
        None => unreachable!(),
    }))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use pretty_assertions::assert_eq;
    use squill_lib_core::domain::{DbType, Domain};
    use squill_lib_core::params::SystemParameters;
    use squill_lib_core::value::{DbValue, SetKind};

    use super::{ValueDescriptor, fetch_peek_dbval};
    use crate::context::ExecContext;
    use crate::regu::{
        AttrDescr, AttrInfoCache, FuncKind, FuncSpec, ReguSpec, ReguVariable,
    };

    #[test]
    fn position_fetch_reads_the_current_tuple() {
        let params = SystemParameters::default();
        let mut ctx = ExecContext::detached(&params);
        let tuple = [DbValue::Int(10), DbValue::Varchar("x".to_owned())];
        let vd = ValueDescriptor {
            tuple: Some(&tuple),
            ..ValueDescriptor::default()
        };
        let regu = ReguVariable::position(1, Domain::new(DbType::Varchar));
        let peek = fetch_peek_dbval(&mut ctx, &regu, &vd, None).unwrap();
        assert_eq!(&*peek, &DbValue::Varchar("x".to_owned()));
    }

    #[test]
    fn attr_fetch_reads_the_cache() {
        let params = SystemParameters::default();
        let mut ctx = ExecContext::detached(&params);
        let cache = Rc::new(RefCell::new(AttrInfoCache::new()));
        cache.borrow_mut().set_value(3, DbValue::Int(77));
        let regu = ReguVariable::attr(AttrDescr::new(3, DbType::Int, 0, cache));
        let vd = ValueDescriptor::default();
        let peek = fetch_peek_dbval(&mut ctx, &regu, &vd, None).unwrap();
        assert_eq!(&*peek, &DbValue::Int(77));
    }

    #[test]
    fn set_constructor_deduplicates() {
        let params = SystemParameters::default();
        let mut ctx = ExecContext::detached(&params);
        let func = FuncSpec {
            kind: FuncKind::SetOf,
            operands: vec![
                ReguVariable::constant(DbValue::Int(1)),
                ReguVariable::constant(DbValue::Int(1)),
                ReguVariable::constant(DbValue::Int(2)),
            ],
            value: RefCell::new(DbValue::Null),
            temp: RefCell::new(None),
        };
        let regu = ReguVariable::new(
            ReguSpec::Func(Box::new(func)),
            Domain::new(DbType::Set),
        );
        let vd = ValueDescriptor::default();
        let peek = fetch_peek_dbval(&mut ctx, &regu, &vd, None).unwrap();
        match &*peek {
            DbValue::Set(s) => {
                assert_eq!(s.kind, SetKind::Set);
                assert_eq!(s.len(), 2);
            }
            other => panic!("expected set, got {other:?}"),
        }
    }

    #[test]
    fn regexp_count_memoizes_compiled_pattern() {
        let params = SystemParameters::default();
        let mut ctx = ExecContext::detached(&params);
        let func = FuncSpec {
            kind: FuncKind::RegexpCount,
            operands: vec![
                ReguVariable::constant(DbValue::Varchar("abcabcab".to_owned())),
                ReguVariable::constant(DbValue::Varchar("ab".to_owned())),
            ],
            value: RefCell::new(DbValue::Null),
            temp: RefCell::new(None),
        };
        let regu = ReguVariable::new(
            ReguSpec::Func(Box::new(func)),
            Domain::new(DbType::Int),
        );
        let vd = ValueDescriptor::default();
        {
            let peek = fetch_peek_dbval(&mut ctx, &regu, &vd, None).unwrap();
            assert_eq!(&*peek, &DbValue::Int(3));
        }
        // Second evaluation reuses the compiled regex.
        if let ReguSpec::Func(func) = &regu.spec {
            assert!(func.temp.borrow().is_some());
        }
        let peek = fetch_peek_dbval(&mut ctx, &regu, &vd, None).unwrap();
        assert_eq!(&*peek, &DbValue::Int(3));
    }
}
