//! Quantified and collection-valued comparisons: ALL/SOME over sets and
//! materialized lists, multiset containment, and the dispatch for
//! comparisons where one or both operands are sorted-list handles.

use squill_lib_core::errors::SquillError;
use squill_lib_core::logical::Logical;
use squill_lib_core::oid::Oid;
use squill_lib_core::value::{DbSet, DbValue, ListId, compare_values, CompareResult};

use crate::context::ExecContext;
use crate::eval::{eval_value_rel_cmp, lazy_execute_list};
use crate::pred::{CompTerm, RelOp};
use crate::regu::{ReguSpec, ValueDescriptor, fetch_peek_dbval};

/// `item op SOME set`: TRUE on the first satisfying element, UNKNOWN when
/// nothing satisfies but some comparison was unknowable, FALSE otherwise.
pub fn eval_some_set(ctx: &mut ExecContext, item: &DbValue, set: &DbSet, op: RelOp) -> Logical {
    if item.is_null() {
        return Logical::Unknown;
    }
    let mut unknown = false;
    for member in &set.values {
        match eval_value_rel_cmp(ctx, item, member, op, true) {
            Logical::True => return Logical::True,
            Logical::Unknown => unknown = true,
            Logical::Error => return Logical::Error,
            Logical::False => {}
        }
    }
    if unknown { Logical::Unknown } else { Logical::False }
}

/// `item op ALL set`, the dual: negate the operator, ask SOME, negate the
/// answer. The caller has already handled the empty set.
pub fn eval_all_set(ctx: &mut ExecContext, item: &DbValue, set: &DbSet, op: RelOp) -> Logical {
    let Some(negated) = op.complement() else {
        return ctx.error(SquillError::Internal("quantifier operator has no complement"));
    };
    eval_some_set(ctx, item, set, negated).negate()
}

/// Number of set members equal to `item`. `None` when a comparison against
/// a NULL member makes the cardinality unknowable.
pub fn item_card_set(ctx: &mut ExecContext, item: &DbValue, set: &DbSet) -> Option<usize> {
    let mut card = 0;
    for member in &set.values {
        if member.is_null() {
            return None;
        }
        match eval_value_rel_cmp(ctx, item, member, RelOp::Eq, true) {
            Logical::True => card += 1,
            Logical::Error => return None,
            _ => {}
        }
    }
    Some(card)
}

/// Pull the first column of every tuple of a materialized list. Multiset
/// comparison wants the rows in order; an unsorted list is sorted through
/// the cursor engine first.
pub(crate) fn list_column(
    ctx: &mut ExecContext,
    list: &ListId,
) -> Result<Vec<DbValue>, SquillError> {
    let sorted;
    let list = if list.sorted {
        list
    } else {
        sorted = ctx.cursors.sort(list, &crate::external::SortKey { columns: vec![0] })?;
        &sorted
    };
    let scan = ctx.cursors.open_scan(list)?;
    let mut out = Vec::new();
    loop {
        match ctx.cursors.next(scan) {
            Ok(Some(tuple)) => {
                out.push(tuple.into_iter().next().unwrap_or(DbValue::Null));
            }
            Ok(None) => break,
            Err(err) => {
                ctx.cursors.close_scan(scan);
                return Err(err);
            }
        }
    }
    ctx.cursors.close_scan(scan);
    Ok(out)
}

/// `item op SOME (list)`. The list rows are scanned in storage order.
pub fn eval_some_list(
    ctx: &mut ExecContext,
    item: &DbValue,
    list: &ListId,
    op: RelOp,
) -> Logical {
    if list.tuple_cnt == 0 {
        return Logical::False;
    }
    if item.is_null() {
        return Logical::Unknown;
    }
    let scan = match ctx.cursors.open_scan(list) {
        Ok(scan) => scan,
        Err(err) => return ctx.error(err),
    };
    let mut unknown = false;
    let result = loop {
        match ctx.cursors.next(scan) {
            Ok(Some(tuple)) => {
                let member = tuple.into_iter().next().unwrap_or(DbValue::Null);
                match eval_value_rel_cmp(ctx, item, &member, op, true) {
                    Logical::True => break Logical::True,
                    Logical::Unknown => unknown = true,
                    Logical::Error => break Logical::Error,
                    Logical::False => {}
                }
            }
            Ok(None) => {
                break if unknown { Logical::Unknown } else { Logical::False };
            }
            Err(err) => break ctx.error(err),
        }
    };
    ctx.cursors.close_scan(scan);
    result
}

pub fn eval_all_list(
    ctx: &mut ExecContext,
    item: &DbValue,
    list: &ListId,
    op: RelOp,
) -> Logical {
    let Some(negated) = op.complement() else {
        return ctx.error(SquillError::Internal("quantifier operator has no complement"));
    };
    eval_some_list(ctx, item, list, negated).negate()
}

/// Number of list rows whose first column equals `item`.
pub fn item_card_list(
    ctx: &mut ExecContext,
    item: &DbValue,
    list: &ListId,
) -> Option<usize> {
    let members = list_column(ctx, list).ok()?;
    let set = DbSet::new(squill_lib_core::value::SetKind::Multiset, members);
    item_card_set(ctx, item, &set)
}

/// Containment relation between two multisets, by per-value cardinality.
enum Containment {
    Equal,
    ProperSubset,
    ProperSuperset,
    Incomparable,
    /// A NULL member makes containment unknowable.
    Unknown,
}

fn multiset_containment(a: &[DbValue], b: &[DbValue]) -> Containment {
    if a.iter().any(DbValue::is_null) || b.iter().any(DbValue::is_null) {
        return Containment::Unknown;
    }
    let card = |of: &[DbValue], item: &DbValue| {
        of.iter()
            .filter(|m| compare_values(m, item, true, false) == CompareResult::Eq)
            .count()
    };
    let mut a_le_b = true;
    let mut b_le_a = true;
    for item in a.iter().chain(b.iter()) {
        let ca = card(a, item);
        let cb = card(b, item);
        if ca > cb {
            a_le_b = false;
        }
        if cb > ca {
            b_le_a = false;
        }
    }
    match (a_le_b, b_le_a) {
        (true, true) => Containment::Equal,
        (true, false) => Containment::ProperSubset,
        (false, true) => Containment::ProperSuperset,
        (false, false) => Containment::Incomparable,
    }
}

/// Collection comparison. The ordinal operators take their containment
/// meanings here: `<` is proper subset, `<=` is subset-or-equal, and the
/// `>` family mirrors them.
pub fn eval_set_cmp(a: &DbSet, b: &DbSet, op: RelOp) -> Logical {
    let containment = multiset_containment(&a.values, &b.values);
    if matches!(containment, Containment::Unknown) {
        return Logical::Unknown;
    }
    let result = match op {
        RelOp::Eq | RelOp::EqTorder | RelOp::NullsafeEq => {
            matches!(containment, Containment::Equal)
        }
        RelOp::Ne => !matches!(containment, Containment::Equal),
        RelOp::Lt | RelOp::Subset => matches!(containment, Containment::ProperSubset),
        RelOp::Le | RelOp::SubsetEq => {
            matches!(containment, Containment::ProperSubset | Containment::Equal)
        }
        RelOp::Gt | RelOp::Superset => matches!(containment, Containment::ProperSuperset),
        RelOp::Ge | RelOp::SupersetEq => {
            matches!(containment, Containment::ProperSuperset | Containment::Equal)
        }
        _ => return Logical::Error,
    };
    Logical::from_bool(result)
}

/// Comparison where at least one operand is a sorted-list handle: execute
/// lazily, materialize the column, and compare as multisets. Swapping the
/// operands swaps the operator.
pub fn eval_set_list_cmp(
    ctx: &mut ExecContext,
    comp: &CompTerm,
    vd: &ValueDescriptor,
    obj_oid: Option<&Oid>,
) -> Logical {
    let (Some(lhs), Some(rhs)) = (comp.lhs.as_deref(), comp.rhs.as_deref()) else {
        return ctx.error(SquillError::Internal("comparison without operands"));
    };

    let fetch_collection = |ctx: &mut ExecContext,
                                regu: &crate::regu::ReguVariable|
     -> Result<Option<Vec<DbValue>>, SquillError> {
        if matches!(regu.spec, ReguSpec::ListId(_)) {
            let list = lazy_execute_list(ctx, regu)?;
            return Ok(Some(list_column(ctx, &list)?));
        }
        let value = fetch_peek_dbval(ctx, regu, vd, obj_oid)?;
        match &*value {
            DbValue::Set(set) => Ok(Some(set.values.clone())),
            DbValue::Null => Ok(None),
            _ => Err(SquillError::InvalidDatatype("collection operand", "set")),
        }
    };

    let left = match fetch_collection(ctx, lhs) {
        Ok(Some(values)) => values,
        Ok(None) => return Logical::Unknown,
        Err(err) => return ctx.error(err),
    };
    let right = match fetch_collection(ctx, rhs) {
        Ok(Some(values)) => values,
        Ok(None) => return Logical::Unknown,
        Err(err) => return ctx.error(err),
    };

    let kind = squill_lib_core::value::SetKind::Multiset;
    eval_set_cmp(&DbSet::new(kind, left), &DbSet::new(kind, right), comp.op)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use squill_lib_core::logical::Logical;
    use squill_lib_core::params::SystemParameters;
    use squill_lib_core::value::{DbSet, DbValue, SetKind};

    use super::{eval_all_set, eval_set_cmp, eval_some_set, item_card_set};
    use crate::context::ExecContext;
    use crate::pred::RelOp;

    fn int_set(values: &[i32]) -> DbSet {
        DbSet::new(
            SetKind::Multiset,
            values.iter().map(|&v| DbValue::Int(v)).collect(),
        )
    }

    #[test]
    fn some_finds_a_satisfying_member() {
        let params = SystemParameters::default();
        let mut ctx = ExecContext::detached(&params);
        let set = int_set(&[1, 5, 9]);
        assert_eq!(
            eval_some_set(&mut ctx, &DbValue::Int(5), &set, RelOp::Eq),
            Logical::True
        );
        assert_eq!(
            eval_some_set(&mut ctx, &DbValue::Int(4), &set, RelOp::Eq),
            Logical::False
        );
    }

    #[test]
    fn some_with_null_member_is_unknown_not_false() {
        let params = SystemParameters::default();
        let mut ctx = ExecContext::detached(&params);
        let set = DbSet::new(
            SetKind::Multiset,
            vec![DbValue::Int(1), DbValue::Null, DbValue::Int(3)],
        );
        assert_eq!(
            eval_some_set(&mut ctx, &DbValue::Int(4), &set, RelOp::Eq),
            Logical::Unknown
        );
    }

    #[test]
    fn all_is_the_dual_of_some() {
        let params = SystemParameters::default();
        let mut ctx = ExecContext::detached(&params);
        let set = int_set(&[2, 4, 6]);
        assert_eq!(
            eval_all_set(&mut ctx, &DbValue::Int(1), &set, RelOp::Lt),
            Logical::True
        );
        assert_eq!(
            eval_all_set(&mut ctx, &DbValue::Int(3), &set, RelOp::Lt),
            Logical::False
        );
    }

    #[test]
    fn cardinality_counts_duplicates() {
        let params = SystemParameters::default();
        let mut ctx = ExecContext::detached(&params);
        let set = int_set(&[7, 7, 2]);
        assert_eq!(item_card_set(&mut ctx, &DbValue::Int(7), &set), Some(2));
    }

    #[test]
    fn list_cardinality_counts_matching_rows() {
        use squill_lib_core::value::DbValue;

        let params = SystemParameters::default();
        let cursors = crate::external::MemoryCursorEngine::new();
        let list = cursors.add_list(
            1,
            vec![
                vec![DbValue::Int(7)],
                vec![DbValue::Int(3)],
                vec![DbValue::Int(7)],
            ],
        );
        let mut ctx = ExecContext::with_cursors(&params, &cursors);
        assert_eq!(
            super::item_card_list(&mut ctx, &DbValue::Int(7), &list),
            Some(2)
        );
    }

    #[test]
    fn containment_operators() {
        let a = int_set(&[1, 2]);
        let b = int_set(&[1, 2, 3]);
        assert_eq!(eval_set_cmp(&a, &b, RelOp::Subset), Logical::True);
        assert_eq!(eval_set_cmp(&a, &b, RelOp::SubsetEq), Logical::True);
        assert_eq!(eval_set_cmp(&b, &a, RelOp::Superset), Logical::True);
        assert_eq!(eval_set_cmp(&a, &a, RelOp::Subset), Logical::False);
        assert_eq!(eval_set_cmp(&a, &a, RelOp::SubsetEq), Logical::True);
        assert_eq!(eval_set_cmp(&a, &b, RelOp::Eq), Logical::False);
        // Multisets respect duplicate counts.
        let c = int_set(&[1, 1]);
        let d = int_set(&[1]);
        assert_eq!(eval_set_cmp(&d, &c, RelOp::Subset), Logical::True);
        assert_eq!(eval_set_cmp(&c, &d, RelOp::SubsetEq), Logical::False);
    }
}
