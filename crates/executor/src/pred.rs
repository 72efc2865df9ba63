//! Predicate expression trees.
//!
//! Three variants, mirroring what the planner emits: boolean connectives
//! over two children, leaf evaluation terms (comparison, quantified
//! comparison, LIKE, regex), and single-child negation. Connective chains
//! are right-linear; the evaluator walks them iteratively.

use std::cell::{Cell, RefCell};

use squill_lib_core::domain::{CoercionTarget, DbType};
use squill_lib_core::value::DbValue;
use strum_macros::Display;

use crate::regu::ReguVariable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BoolOp {
    #[strum(serialize = "AND")]
    And,
    #[strum(serialize = "OR")]
    Or,
    #[strum(serialize = "XOR")]
    Xor,
    #[strum(serialize = "IS")]
    Is,
    #[strum(serialize = "IS NOT")]
    IsNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RelOp {
    #[strum(serialize = "=")]
    Eq,
    /// Total-order equality: NULL equals NULL.
    #[strum(serialize = "==")]
    EqTorder,
    #[strum(serialize = "<>")]
    Ne,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Ge,
    #[strum(serialize = "IS NULL")]
    Null,
    #[strum(serialize = "EXISTS")]
    Exists,
    #[strum(serialize = "SUBSET")]
    Subset,
    #[strum(serialize = "SUBSETEQ")]
    SubsetEq,
    #[strum(serialize = "SUPERSET")]
    Superset,
    #[strum(serialize = "SUPERSETEQ")]
    SupersetEq,
    #[strum(serialize = "<=>")]
    NullsafeEq,
}

impl RelOp {
    /// The operator `NOT (a op b)` rewrites to, when one exists.
    pub fn complement(self) -> Option<RelOp> {
        match self {
            RelOp::Eq => Some(RelOp::Ne),
            RelOp::Ne => Some(RelOp::Eq),
            RelOp::Lt => Some(RelOp::Ge),
            RelOp::Ge => Some(RelOp::Lt),
            RelOp::Gt => Some(RelOp::Le),
            RelOp::Le => Some(RelOp::Gt),
            _ => None,
        }
    }

    /// The operator with its arguments swapped: `a op b == b op.swapped a`.
    pub fn swapped(self) -> RelOp {
        match self {
            RelOp::Lt => RelOp::Gt,
            RelOp::Gt => RelOp::Lt,
            RelOp::Le => RelOp::Ge,
            RelOp::Ge => RelOp::Le,
            RelOp::Subset => RelOp::Superset,
            RelOp::Superset => RelOp::Subset,
            RelOp::SubsetEq => RelOp::SupersetEq,
            RelOp::SupersetEq => RelOp::SubsetEq,
            other => other,
        }
    }

    pub fn is_ordinal(self) -> bool {
        matches!(
            self,
            RelOp::Eq
                | RelOp::EqTorder
                | RelOp::Ne
                | RelOp::Lt
                | RelOp::Le
                | RelOp::Gt
                | RelOp::Ge
                | RelOp::NullsafeEq
        )
    }

    pub fn is_set_comparison(self) -> bool {
        matches!(
            self,
            RelOp::Subset | RelOp::SubsetEq | RelOp::Superset | RelOp::SupersetEq
        )
    }
}

/// ALL vs SOME quantification of an [`AlsmTerm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum QuantKind {
    #[strum(serialize = "ALL")]
    All,
    #[strum(serialize = "SOME")]
    Some,
}

#[derive(Clone)]
pub struct Pred {
    pub lhs: Box<PredExpr>,
    pub rhs: Box<PredExpr>,
    pub bool_op: BoolOp,
}

/// Comparison term. Single-operand tests (`IS NULL`, `EXISTS`) leave `rhs`
/// empty. The `coerced_*` slots hold one-shot constant coercions; they are
/// released when the owning XASL clone is decached. `last_domains` is the
/// validation cache that skips re-deriving the coercion target while
/// consecutive tuples keep the same domains.
#[derive(Clone)]
pub struct CompTerm {
    pub lhs: Option<Box<ReguVariable>>,
    pub rhs: Option<Box<ReguVariable>>,
    pub op: RelOp,
    pub db_type: DbType,
    pub coerced_lhs: RefCell<Option<DbValue>>,
    pub coerced_rhs: RefCell<Option<DbValue>>,
    pub last_domains: Cell<Option<(DbType, DbType, CoercionTarget)>>,
}

impl CompTerm {
    pub fn new(lhs: ReguVariable, op: RelOp, rhs: ReguVariable) -> CompTerm {
        let db_type = lhs.domain.db_type;
        CompTerm {
            lhs: Some(Box::new(lhs)),
            rhs: Some(Box::new(rhs)),
            op,
            db_type,
            coerced_lhs: RefCell::new(None),
            coerced_rhs: RefCell::new(None),
            last_domains: Cell::new(None),
        }
    }

    pub fn unary(lhs: ReguVariable, op: RelOp) -> CompTerm {
        debug_assert!(matches!(op, RelOp::Null | RelOp::Exists));
        let db_type = lhs.domain.db_type;
        CompTerm {
            lhs: Some(Box::new(lhs)),
            rhs: None,
            op,
            db_type,
            coerced_lhs: RefCell::new(None),
            coerced_rhs: RefCell::new(None),
            last_domains: Cell::new(None),
        }
    }
}

/// Quantified comparison: `elem op ALL/SOME elemset`.
#[derive(Clone)]
pub struct AlsmTerm {
    pub elem: Box<ReguVariable>,
    pub elemset: Box<ReguVariable>,
    pub kind: QuantKind,
    pub op: RelOp,
    pub item_type: DbType,
}

#[derive(Clone)]
pub struct LikeTerm {
    pub src: Box<ReguVariable>,
    pub pattern: Box<ReguVariable>,
    pub esc_char: Option<Box<ReguVariable>>,
}

/// Regex match term. The compiled pattern is memoized in place and
/// recompiled when the pattern text or case mode changes.
#[derive(Clone)]
pub struct RlikeTerm {
    pub src: Box<ReguVariable>,
    pub pattern: Box<ReguVariable>,
    pub case_sensitive: Box<ReguVariable>,
    pub compiled: RefCell<Option<(String, bool, fancy_regex::Regex)>>,
}

#[derive(Clone)]
pub enum EvalTerm {
    Comp(CompTerm),
    Alsm(AlsmTerm),
    Like(LikeTerm),
    Rlike(RlikeTerm),
}

#[derive(Clone)]
pub enum PredExpr {
    Pred(Pred),
    Term(EvalTerm),
    Not(Box<PredExpr>),
}

impl PredExpr {
    pub fn and(lhs: PredExpr, rhs: PredExpr) -> PredExpr {
        PredExpr::Pred(Pred {
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            bool_op: BoolOp::And,
        })
    }

    pub fn or(lhs: PredExpr, rhs: PredExpr) -> PredExpr {
        PredExpr::Pred(Pred {
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            bool_op: BoolOp::Or,
        })
    }

    pub fn xor(lhs: PredExpr, rhs: PredExpr) -> PredExpr {
        PredExpr::Pred(Pred {
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            bool_op: BoolOp::Xor,
        })
    }

    pub fn negated(self) -> PredExpr {
        PredExpr::Not(Box::new(self))
    }

    pub fn comp(lhs: ReguVariable, op: RelOp, rhs: ReguVariable) -> PredExpr {
        PredExpr::Term(EvalTerm::Comp(CompTerm::new(lhs, op, rhs)))
    }

    pub fn is_null(operand: ReguVariable) -> PredExpr {
        PredExpr::Term(EvalTerm::Comp(CompTerm::unary(operand, RelOp::Null)))
    }

    pub fn exists(operand: ReguVariable) -> PredExpr {
        PredExpr::Term(EvalTerm::Comp(CompTerm::unary(operand, RelOp::Exists)))
    }

    /// Release per-execution state: folded coercions, compiled regexes and
    /// the scratch slots of embedded register variables.
    pub fn clear_xasl(&mut self) {
        match self {
            PredExpr::Pred(p) => {
                p.lhs.clear_xasl();
                p.rhs.clear_xasl();
            }
            PredExpr::Not(child) => child.clear_xasl(),
            PredExpr::Term(term) => match term {
                EvalTerm::Comp(comp) => {
                    *comp.coerced_lhs.borrow_mut() = None;
                    *comp.coerced_rhs.borrow_mut() = None;
                    comp.last_domains.set(None);
                    if let Some(lhs) = &mut comp.lhs {
                        lhs.clear_xasl();
                    }
                    if let Some(rhs) = &mut comp.rhs {
                        rhs.clear_xasl();
                    }
                }
                EvalTerm::Alsm(alsm) => {
                    alsm.elem.clear_xasl();
                    alsm.elemset.clear_xasl();
                }
                EvalTerm::Like(like) => {
                    like.src.clear_xasl();
                    like.pattern.clear_xasl();
                    if let Some(esc) = &mut like.esc_char {
                        esc.clear_xasl();
                    }
                }
                EvalTerm::Rlike(rlike) => {
                    *rlike.compiled.borrow_mut() = None;
                    rlike.src.clear_xasl();
                    rlike.pattern.clear_xasl();
                    rlike.case_sensitive.clear_xasl();
                }
            },
        }
    }
}

impl std::fmt::Display for PredExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PredExpr::Pred(p) => write!(f, "({} {} {})", p.lhs, p.bool_op, p.rhs),
            PredExpr::Not(child) => write!(f, "(NOT {child})"),
            PredExpr::Term(term) => match term {
                EvalTerm::Comp(c) => match (&c.lhs, &c.rhs) {
                    (Some(lhs), Some(rhs)) => write!(f, "({} {} {})", lhs, c.op, rhs),
                    (Some(lhs), None) => write!(f, "({} {})", lhs, c.op),
                    _ => write!(f, "(? {})", c.op),
                },
                EvalTerm::Alsm(a) => {
                    write!(f, "({} {} {} {})", a.elem, a.op, a.kind, a.elemset)
                }
                EvalTerm::Like(l) => match &l.esc_char {
                    Some(esc) => write!(f, "({} LIKE {} ESCAPE {})", l.src, l.pattern, esc),
                    None => write!(f, "({} LIKE {})", l.src, l.pattern),
                },
                EvalTerm::Rlike(r) => write!(f, "({} RLIKE {})", r.src, r.pattern),
            },
        }
    }
}
