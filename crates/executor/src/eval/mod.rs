//! The predicate evaluator.
//!
//! Three-valued logic over [`crate::pred::PredExpr`] trees. Connective
//! chains are right-linear as emitted by the planner; AND/OR walk them
//! iteratively and short-circuit on the first decisive child. Errors are
//! out-of-band: the evaluator returns [`Logical::Error`] and parks the
//! concrete failure in the worker's error slot.

pub mod fast;
pub mod filter;
pub mod like;
pub mod set_ops;

use squill_lib_core::domain::{CoercionTarget, coercion_target};
use squill_lib_core::errors::SquillError;
use squill_lib_core::logical::Logical;
use squill_lib_core::oid::Oid;
use squill_lib_core::value::{
    CompareResult, DbValue, ListId, coerce_value, compare_values,
};

use crate::context::ExecContext;
use crate::pred::{
    AlsmTerm, BoolOp, CompTerm, EvalTerm, LikeTerm, Pred, PredExpr, QuantKind, RelOp, RlikeTerm,
};
use crate::regu::{Peek, ReguSpec, ReguVariable, ValueDescriptor, fetch_peek_dbval};
use crate::xasl::XaslStatus;

/// Evaluate a predicate for the current tuple.
pub fn eval_pred(
    ctx: &mut ExecContext,
    pred: &PredExpr,
    vd: &ValueDescriptor,
    obj_oid: Option<&Oid>,
) -> Logical {
    let max_depth = ctx.params.max_recursion_sql_depth;
    if ctx.recursion_depth() > max_depth {
        return ctx.error(SquillError::MaxRecursionSqlDepth(max_depth));
    }
    if ctx.is_interrupted() {
        return ctx.error(SquillError::Interrupted);
    }
    ctx.inc_recursion_depth();
    let result = match pred {
        PredExpr::Pred(p) => match p.bool_op {
            BoolOp::And => eval_and_chain(ctx, p, vd, obj_oid),
            BoolOp::Or => eval_or_chain(ctx, p, vd, obj_oid),
            BoolOp::Xor => {
                let lhs = eval_pred(ctx, &p.lhs, vd, obj_oid);
                let rhs = eval_pred(ctx, &p.rhs, vd, obj_oid);
                lhs.xor_result(rhs)
            }
            BoolOp::Is | BoolOp::IsNot => {
                // Two-valued comparison of truth values; UNKNOWN is a legal
                // operand here, not a contagious one.
                let lhs = eval_pred(ctx, &p.lhs, vd, obj_oid);
                let rhs = eval_pred(ctx, &p.rhs, vd, obj_oid);
                if lhs == Logical::Error || rhs == Logical::Error {
                    Logical::Error
                } else {
                    Logical::from_bool((lhs == rhs) == (p.bool_op == BoolOp::Is))
                }
            }
        },
        PredExpr::Not(child) => eval_pred(ctx, child, vd, obj_oid).negate(),
        PredExpr::Term(term) => eval_term(ctx, term, vd, obj_oid),
    };
    ctx.dec_recursion_depth();
    result
}

/// Right-linear AND chain: FALSE or ERROR ends the walk immediately;
/// UNKNOWN is sticky unless a later child is decisive.
fn eval_and_chain(
    ctx: &mut ExecContext,
    pred: &Pred,
    vd: &ValueDescriptor,
    obj_oid: Option<&Oid>,
) -> Logical {
    let mut result = Logical::True;
    let mut current = pred;
    loop {
        let lhs = eval_pred(ctx, &current.lhs, vd, obj_oid);
        result = result.and_result(lhs);
        if result == Logical::False || result == Logical::Error {
            return result;
        }
        match &*current.rhs {
            PredExpr::Pred(p) if p.bool_op == BoolOp::And => current = p,
            tail => {
                let rhs = eval_pred(ctx, tail, vd, obj_oid);
                return result.and_result(rhs);
            }
        }
    }
}

fn eval_or_chain(
    ctx: &mut ExecContext,
    pred: &Pred,
    vd: &ValueDescriptor,
    obj_oid: Option<&Oid>,
) -> Logical {
    let mut result = Logical::False;
    let mut current = pred;
    loop {
        let lhs = eval_pred(ctx, &current.lhs, vd, obj_oid);
        result = result.or_result(lhs);
        if result == Logical::True || result == Logical::Error {
            return result;
        }
        match &*current.rhs {
            PredExpr::Pred(p) if p.bool_op == BoolOp::Or => current = p,
            tail => {
                let rhs = eval_pred(ctx, tail, vd, obj_oid);
                return result.or_result(rhs);
            }
        }
    }
}

pub(crate) fn eval_term(
    ctx: &mut ExecContext,
    term: &EvalTerm,
    vd: &ValueDescriptor,
    obj_oid: Option<&Oid>,
) -> Logical {
    match term {
        EvalTerm::Comp(comp) => eval_comp_term(ctx, comp, vd, obj_oid),
        EvalTerm::Alsm(alsm) => eval_alsm_term(ctx, alsm, vd, obj_oid),
        EvalTerm::Like(like) => eval_like_term(ctx, like, vd, obj_oid),
        EvalTerm::Rlike(rlike) => eval_rlike_term(ctx, rlike, vd, obj_oid),
    }
}

/// Map a comparison outcome onto a relational operator.
fn rel_result(cmp: CompareResult, op: RelOp) -> Logical {
    let b = match (op, cmp) {
        (RelOp::Eq | RelOp::EqTorder | RelOp::NullsafeEq, c) => c == CompareResult::Eq,
        (RelOp::Ne, c) => c != CompareResult::Eq,
        (RelOp::Lt, c) => c == CompareResult::Lt,
        (RelOp::Le, c) => matches!(c, CompareResult::Lt | CompareResult::Eq),
        (RelOp::Gt, c) => c == CompareResult::Gt,
        (RelOp::Ge, c) => matches!(c, CompareResult::Gt | CompareResult::Eq),
        _ => return Logical::Error,
    };
    Logical::from_bool(b)
}

/// Ordinal comparison of two fetched values. `Unknown` from the comparator
/// with two non-null operands means the domains cannot meet: an error.
pub fn eval_value_rel_cmp(
    ctx: &mut ExecContext,
    lhs: &DbValue,
    rhs: &DbValue,
    op: RelOp,
    coercion: bool,
) -> Logical {
    let total_order = op == RelOp::EqTorder;
    let cmp = compare_values(lhs, rhs, coercion, total_order);
    if cmp == CompareResult::Unknown {
        if lhs.is_null() || rhs.is_null() {
            return Logical::Unknown;
        }
        return ctx.error(SquillError::DomainConflict(lhs.db_type(), rhs.db_type()));
    }
    rel_result(cmp, op)
}

fn regu_is_list(regu: &Option<Box<ReguVariable>>) -> bool {
    matches!(
        regu.as_deref(),
        Some(ReguVariable {
            spec: ReguSpec::ListId(_),
            ..
        })
    )
}

/// Drive the lazy execution of the subquery behind a LIST_ID variable and
/// return the (possibly refreshed) list handle.
pub(crate) fn lazy_execute_list(
    ctx: &mut ExecContext,
    regu: &ReguVariable,
) -> Result<ListId, SquillError> {
    let ReguSpec::ListId(slot) = &regu.spec else {
        return Err(SquillError::InvalidDatatype("list operand", "list"));
    };
    if regu.xasl.is_some() {
        let needs_run = regu
            .xasl
            .as_ref()
            .is_some_and(|x| x.status.get() != XaslStatus::Success);
        if needs_run {
            ctx.subquery.execute_regu_variable_xasl(regu)?;
        }
        if ctx.subquery.regu_variable_xasl_status(regu) == XaslStatus::Failed {
            return Err(SquillError::Failed);
        }
    }
    Ok(*slot.borrow())
}

fn eval_comp_term(
    ctx: &mut ExecContext,
    comp: &CompTerm,
    vd: &ValueDescriptor,
    obj_oid: Option<&Oid>,
) -> Logical {
    match comp.op {
        RelOp::Null => {
            let Some(lhs) = comp.lhs.as_deref() else {
                return ctx.error(SquillError::Internal("NULL test without operand"));
            };
            let value = match fetch_peek_dbval(ctx, lhs, vd, obj_oid) {
                Ok(v) => v,
                Err(err) => return ctx.error(err),
            };
            match &*value {
                DbValue::Null => Logical::True,
                DbValue::Oid(oid) => {
                    if oid.is_null() {
                        return Logical::True;
                    }
                    match ctx.heap.is_object_not_null(oid) {
                        Ok(not_null) => Logical::from_bool(!not_null),
                        Err(err) => ctx.error(err),
                    }
                }
                _ => Logical::False,
            }
        }
        RelOp::Exists => {
            let Some(lhs) = comp.lhs.as_deref() else {
                return ctx.error(SquillError::Internal("EXISTS without operand"));
            };
            if matches!(lhs.spec, ReguSpec::ListId(_)) {
                let list = match lazy_execute_list(ctx, lhs) {
                    Ok(list) => list,
                    Err(err) => return ctx.error(err),
                };
                return Logical::from_bool(list.tuple_cnt > 0);
            }
            let value = match fetch_peek_dbval(ctx, lhs, vd, obj_oid) {
                Ok(v) => v,
                Err(err) => return ctx.error(err),
            };
            match &*value {
                DbValue::Set(set) => Logical::from_bool(!set.is_empty()),
                DbValue::Null => Logical::Unknown,
                _ => ctx.error(SquillError::InvalidDatatype("EXISTS operand", "set")),
            }
        }
        _ => {
            if regu_is_list(&comp.lhs) || regu_is_list(&comp.rhs) {
                return set_ops::eval_set_list_cmp(ctx, comp, vd, obj_oid);
            }
            eval_comp_values(ctx, comp, vd, obj_oid)
        }
    }
}

/// Fetch one side of a comparison, preferring a previously folded constant
/// coercion.
fn fetch_side<'a>(
    ctx: &mut ExecContext,
    regu: &'a ReguVariable,
    folded: &'a std::cell::RefCell<Option<DbValue>>,
    vd: &'a ValueDescriptor<'a>,
    obj_oid: Option<&Oid>,
) -> Result<Peek<'a>, SquillError> {
    if folded.borrow().is_some() {
        return Ok(Peek::Slot(std::cell::Ref::map(folded.borrow(), |f| {
            f.as_ref().unwrap()
        })));
    }
    fetch_peek_dbval(ctx, regu, vd, obj_oid)
}

fn eval_comp_values(
    ctx: &mut ExecContext,
    comp: &CompTerm,
    vd: &ValueDescriptor,
    obj_oid: Option<&Oid>,
) -> Logical {
    let (Some(lhs_regu), Some(rhs_regu)) = (comp.lhs.as_deref(), comp.rhs.as_deref()) else {
        return ctx.error(SquillError::Internal("comparison without operands"));
    };

    let lhs = match fetch_side(ctx, lhs_regu, &comp.coerced_lhs, vd, obj_oid) {
        Ok(v) => v,
        Err(err) => return ctx.error(err),
    };
    let rhs = match fetch_side(ctx, rhs_regu, &comp.coerced_rhs, vd, obj_oid) {
        Ok(v) => v,
        Err(err) => return ctx.error(err),
    };

    // NULL operands: only the total-order and null-safe flavors survive.
    if lhs.is_null() || rhs.is_null() {
        return match comp.op {
            RelOp::EqTorder => {
                eval_value_rel_cmp(ctx, &lhs, &rhs, RelOp::EqTorder, false)
            }
            RelOp::NullsafeEq => Logical::from_bool(lhs.is_null() && rhs.is_null()),
            _ => Logical::Unknown,
        };
    }

    // Collection comparison.
    if comp.op.is_set_comparison()
        || (matches!(&*lhs, DbValue::Set(_)) && matches!(&*rhs, DbValue::Set(_)))
    {
        let (DbValue::Set(a), DbValue::Set(b)) = (&*lhs, &*rhs) else {
            return ctx.error(SquillError::InvalidDatatype("set comparison operand", "set"));
        };
        return set_ops::eval_set_cmp(a, b, comp.op);
    }

    // One-shot constant coercion, then the (cached) coercion-target
    // decision for the live side.
    let lt = lhs.db_type();
    let rt = rhs.db_type();
    let target = match comp.last_domains.get() {
        Some((clt, crt, target)) if clt == lt && crt == rt => target,
        _ => {
            let target = coercion_target(lhs.domain(), rhs.domain());
            comp.last_domains.set(Some((lt, rt, target)));
            target
        }
    };

    if let CoercionTarget::Rhs(domain) = target {
        if can_fold(rhs_regu) && comp.coerced_rhs.borrow().is_none() {
            match coerce_value(&rhs, &unbounded(domain)) {
                Ok(folded) => {
                    drop(rhs);
                    *comp.coerced_rhs.borrow_mut() = Some(folded);
                    rhs_regu.set_flag(crate::regu::ReguFlags::CLEAR_AT_CLONE_DECACHE);
                    let rhs = Peek::Slot(std::cell::Ref::map(comp.coerced_rhs.borrow(), |f| {
                        f.as_ref().unwrap()
                    }));
                    return eval_value_rel_cmp(ctx, &lhs, &rhs, comp.op, false);
                }
                Err(err) => return ctx.error(err),
            }
        }
    } else if let CoercionTarget::None = target {
        // The symmetric direction may still apply when the left side is the
        // constant one.
        if can_fold(lhs_regu) && comp.coerced_lhs.borrow().is_none() {
            if let CoercionTarget::Rhs(domain) = coercion_target(rhs.domain(), lhs.domain()) {
                match coerce_value(&lhs, &unbounded(domain)) {
                    Ok(folded) => {
                        drop(lhs);
                        *comp.coerced_lhs.borrow_mut() = Some(folded);
                        lhs_regu.set_flag(crate::regu::ReguFlags::CLEAR_AT_CLONE_DECACHE);
                        let lhs = Peek::Slot(std::cell::Ref::map(
                            comp.coerced_lhs.borrow(),
                            |f| f.as_ref().unwrap(),
                        ));
                        return eval_value_rel_cmp(ctx, &lhs, &rhs, comp.op, false);
                    }
                    Err(err) => return ctx.error(err),
                }
            }
        }
    }

    eval_value_rel_cmp(ctx, &lhs, &rhs, comp.op, true)
}

fn can_fold(regu: &ReguVariable) -> bool {
    use crate::regu::ReguFlags;
    regu.is_flagged(ReguFlags::ALL_CONST) && !regu.is_flagged(ReguFlags::NOT_CONST)
}

/// Folded coercion targets are derived from the values at hand; their
/// incidental char precision is not a declared limit.
fn unbounded(mut domain: squill_lib_core::domain::Domain) -> squill_lib_core::domain::Domain {
    if domain.db_type.is_char_family() {
        domain.precision = 0;
    }
    domain
}

fn eval_alsm_term(
    ctx: &mut ExecContext,
    alsm: &AlsmTerm,
    vd: &ValueDescriptor,
    obj_oid: Option<&Oid>,
) -> Logical {
    // List-backed quantification executes the subquery lazily, then scans.
    if matches!(alsm.elemset.spec, ReguSpec::ListId(_)) {
        let list = match lazy_execute_list(ctx, &alsm.elemset) {
            Ok(list) => list,
            Err(err) => return ctx.error(err),
        };
        if list.tuple_cnt == 0 {
            return match alsm.kind {
                QuantKind::All => Logical::True,
                QuantKind::Some => Logical::False,
            };
        }
        let elem = match fetch_peek_dbval(ctx, &alsm.elem, vd, obj_oid) {
            Ok(v) => v.clone(),
            Err(err) => return ctx.error(err),
        };
        if elem.is_null() {
            return Logical::Unknown;
        }
        return match alsm.kind {
            QuantKind::Some => set_ops::eval_some_list(ctx, &elem, &list, alsm.op),
            QuantKind::All => set_ops::eval_all_list(ctx, &elem, &list, alsm.op),
        };
    }

    let set_value = match fetch_peek_dbval(ctx, &alsm.elemset, vd, obj_oid) {
        Ok(v) => v.clone(),
        Err(err) => return ctx.error(err),
    };
    if set_value.is_null() {
        return Logical::Unknown;
    }
    let DbValue::Set(set) = &set_value else {
        return ctx.error(SquillError::InvalidDatatype("quantifier operand", "set"));
    };
    if set.is_empty() {
        return match alsm.kind {
            QuantKind::All => Logical::True,
            QuantKind::Some => Logical::False,
        };
    }
    let elem = match fetch_peek_dbval(ctx, &alsm.elem, vd, obj_oid) {
        Ok(v) => v.clone(),
        Err(err) => return ctx.error(err),
    };
    match alsm.kind {
        QuantKind::Some => set_ops::eval_some_set(ctx, &elem, set, alsm.op),
        QuantKind::All => set_ops::eval_all_set(ctx, &elem, set, alsm.op),
    }
}

fn eval_like_term(
    ctx: &mut ExecContext,
    term: &LikeTerm,
    vd: &ValueDescriptor,
    obj_oid: Option<&Oid>,
) -> Logical {
    let src = match fetch_peek_dbval(ctx, &term.src, vd, obj_oid) {
        Ok(v) => v.clone(),
        Err(err) => return ctx.error(err),
    };
    let pattern = match fetch_peek_dbval(ctx, &term.pattern, vd, obj_oid) {
        Ok(v) => v.clone(),
        Err(err) => return ctx.error(err),
    };
    if src.is_null() || pattern.is_null() {
        return Logical::Unknown;
    }
    let (Some(src), Some(pattern)) = (src.as_str(), pattern.as_str()) else {
        return ctx.error(SquillError::InvalidDatatype("LIKE operand", "string"));
    };
    let esc = match &term.esc_char {
        None => None,
        Some(esc_regu) => {
            let esc = match fetch_peek_dbval(ctx, esc_regu, vd, obj_oid) {
                Ok(v) => v.clone(),
                Err(err) => return ctx.error(err),
            };
            if esc.is_null() {
                None
            } else {
                match esc.as_str().and_then(|s| {
                    let mut chars = s.chars();
                    let c = chars.next();
                    if chars.next().is_none() { c } else { None }
                }) {
                    Some(c) => Some(c),
                    None => {
                        return ctx.error(SquillError::InvalidDatatype(
                            "LIKE escape",
                            "single character",
                        ));
                    }
                }
            }
        }
    };
    match like::match_like(src, pattern, esc) {
        Ok(matched) => Logical::from_bool(matched),
        Err(err) => ctx.error(err),
    }
}

fn eval_rlike_term(
    ctx: &mut ExecContext,
    term: &RlikeTerm,
    vd: &ValueDescriptor,
    obj_oid: Option<&Oid>,
) -> Logical {
    let src = match fetch_peek_dbval(ctx, &term.src, vd, obj_oid) {
        Ok(v) => v.clone(),
        Err(err) => return ctx.error(err),
    };
    let pattern = match fetch_peek_dbval(ctx, &term.pattern, vd, obj_oid) {
        Ok(v) => v.clone(),
        Err(err) => return ctx.error(err),
    };
    let case_flag = match fetch_peek_dbval(ctx, &term.case_sensitive, vd, obj_oid) {
        Ok(v) => v.clone(),
        Err(err) => return ctx.error(err),
    };
    if src.is_null() || pattern.is_null() {
        return Logical::Unknown;
    }
    let (Some(src), Some(pattern)) = (src.as_str(), pattern.as_str()) else {
        return ctx.error(SquillError::InvalidDatatype("RLIKE operand", "string"));
    };
    let case_sensitive = case_flag.as_i64().map(|v| v != 0).unwrap_or(true);

    let needs_compile = match &*term.compiled.borrow() {
        Some((cached, cached_cs, _)) => cached != pattern || *cached_cs != case_sensitive,
        None => true,
    };
    if needs_compile {
        let source = if case_sensitive {
            pattern.to_owned()
        } else {
            format!("(?i){pattern}")
        };
        match fancy_regex::Regex::new(&source) {
            Ok(regex) => {
                *term.compiled.borrow_mut() =
                    Some((pattern.to_owned(), case_sensitive, regex));
            }
            Err(_) => {
                return ctx.error(SquillError::InvalidDatatype(
                    "regular expression",
                    "pattern",
                ));
            }
        }
    }
    let compiled = term.compiled.borrow();
    let (_, _, regex) = compiled.as_ref().unwrap();
    match regex.is_match(src) {
        Ok(matched) => Logical::from_bool(matched),
        Err(_) => ctx.error(SquillError::InvalidDatatype("regular expression", "pattern")),
    }
}
