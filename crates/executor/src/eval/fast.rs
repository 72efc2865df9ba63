//! Fast-path predicate specialization.
//!
//! Scan loops evaluate the same predicate for every tuple; when the tree is
//! a single recognized leaf shape, dispatch can skip the general walk. The
//! specialization table is small and closed: six leaf shapes plus the
//! general evaluator.

use squill_lib_core::domain::DbType;
use squill_lib_core::logical::Logical;
use squill_lib_core::oid::Oid;

use crate::context::ExecContext;
use crate::eval::{eval_pred, eval_term};
use crate::pred::{EvalTerm, PredExpr, RelOp};
use crate::regu::{ReguSpec, ValueDescriptor};

/// Signature of a specialized predicate evaluator.
pub type PredEvalFn =
    fn(&mut ExecContext, &PredExpr, &ValueDescriptor, Option<&Oid>) -> Logical;

/// Pick the evaluator for `pred`'s shape. Also reports the operand type of
/// a recognized single leaf, which index scans use to pre-validate domains.
pub fn eval_fnc(pred: &PredExpr) -> (PredEvalFn, Option<DbType>) {
    match pred {
        PredExpr::Term(term) => {
            let db_type = match term {
                EvalTerm::Comp(c) => Some(c.db_type),
                EvalTerm::Alsm(a) => Some(a.item_type),
                _ => None,
            };
            let f: PredEvalFn = match term {
                EvalTerm::Comp(comp) => match comp.op {
                    RelOp::Null => eval_single_null,
                    RelOp::Exists => eval_single_exists,
                    _ if operand_is_list(&comp.lhs) || operand_is_list(&comp.rhs) => {
                        eval_single_set_list
                    }
                    _ => eval_single_comp,
                },
                EvalTerm::Alsm(alsm) => {
                    if matches!(alsm.elemset.spec, ReguSpec::ListId(_)) {
                        eval_single_alsm_list
                    } else {
                        eval_single_alsm_set
                    }
                }
                EvalTerm::Like(_) => eval_single_like,
                EvalTerm::Rlike(_) => eval_single_rlike,
            };
            (f, db_type)
        }
        _ => (eval_pred, None),
    }
}

fn operand_is_list(regu: &Option<Box<crate::regu::ReguVariable>>) -> bool {
    matches!(
        regu.as_deref(),
        Some(crate::regu::ReguVariable {
            spec: ReguSpec::ListId(_),
            ..
        })
    )
}

macro_rules! single_term_eval {
    ($name:ident, $expects:pat) => {
        fn $name(
            ctx: &mut ExecContext,
            pred: &PredExpr,
            vd: &ValueDescriptor,
            obj_oid: Option<&Oid>,
        ) -> Logical {
            match pred {
                PredExpr::Term(term @ $expects) => eval_term(ctx, term, vd, obj_oid),
                // Shape changed under us; fall back to the general walk.
                other => eval_pred(ctx, other, vd, obj_oid),
            }
        }
    };
}

single_term_eval!(eval_single_comp, EvalTerm::Comp(_));
single_term_eval!(eval_single_null, EvalTerm::Comp(_));
single_term_eval!(eval_single_exists, EvalTerm::Comp(_));
single_term_eval!(eval_single_set_list, EvalTerm::Comp(_));
single_term_eval!(eval_single_alsm_set, EvalTerm::Alsm(_));
single_term_eval!(eval_single_alsm_list, EvalTerm::Alsm(_));
single_term_eval!(eval_single_like, EvalTerm::Like(_));
single_term_eval!(eval_single_rlike, EvalTerm::Rlike(_));

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use squill_lib_core::domain::DbType;
    use squill_lib_core::logical::Logical;
    use squill_lib_core::params::SystemParameters;
    use squill_lib_core::value::DbValue;

    use super::eval_fnc;
    use crate::context::ExecContext;
    use crate::pred::{PredExpr, RelOp};
    use crate::regu::{ReguVariable, ValueDescriptor};

    #[test]
    fn comparison_leaf_gets_a_specialized_evaluator() {
        let pred = PredExpr::comp(
            ReguVariable::constant(DbValue::Int(2)),
            RelOp::Gt,
            ReguVariable::constant(DbValue::Int(1)),
        );
        let (f, db_type) = eval_fnc(&pred);
        assert_eq!(db_type, Some(DbType::Int));

        let params = SystemParameters::default();
        let mut ctx = ExecContext::detached(&params);
        let vd = ValueDescriptor::default();
        assert_eq!(f(&mut ctx, &pred, &vd, None), Logical::True);
    }

    #[test]
    fn connective_trees_fall_back_to_the_general_walk() {
        let pred = PredExpr::and(
            PredExpr::comp(
                ReguVariable::constant(DbValue::Int(1)),
                RelOp::Eq,
                ReguVariable::constant(DbValue::Int(1)),
            ),
            PredExpr::comp(
                ReguVariable::constant(DbValue::Int(2)),
                RelOp::Eq,
                ReguVariable::constant(DbValue::Int(2)),
            ),
        );
        let (f, db_type) = eval_fnc(&pred);
        assert_eq!(db_type, None);

        let params = SystemParameters::default();
        let mut ctx = ExecContext::detached(&params);
        let vd = ValueDescriptor::default();
        assert_eq!(f(&mut ctx, &pred, &vd, None), Logical::True);
    }
}
