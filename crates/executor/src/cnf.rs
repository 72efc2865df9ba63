//! Boolean-tree normalization at statement preparation time.
//!
//! Three phases: push negations inward (De Morgan plus operator
//! complements), pick a strategy from the estimated expansion size, then
//! distribute AND over OR into conjunctive normal form. The result is a
//! linear list of conjuncts, each holding its list of disjuncts, tagged
//! with the table scope (spec) its columns reference so the scanner can
//! evaluate every conjunct exactly where it belongs.

use itertools::Itertools;
use squill_helpers::IndexSet;
use squill_lib_core::errors::{Result, SquillError};

use crate::pred::{AlsmTerm, BoolOp, EvalTerm, Pred, PredExpr, QuantKind};
use crate::regu::{FuncKind, ReguSpec, SpecId};

/// Above this estimated conjunct × disjunct product, full CNF expansion is
/// abandoned in favor of factoring common conjuncts out of the OR tree.
const CNF_EXPANSION_LIMIT: usize = 100;

/// One conjunct of the normal form: a disjunction of leaves.
pub struct Conjunct {
    pub disjuncts: Vec<PredExpr>,
    /// The single table scope every column in this conjunct belongs to,
    /// when there is one; such conjuncts are push-down candidates.
    pub spec_ident: Option<SpecId>,
    /// Marks the head of the normalized conjunction chain.
    pub is_cnf_start: bool,
}

impl Conjunct {
    /// Rebuild the disjunct chain as a right-linear OR tree.
    pub fn to_pred_expr(&self) -> PredExpr {
        let mut iter = self.disjuncts.iter().rev().cloned();
        let mut expr = iter.next().expect("conjunct with no disjuncts");
        for lhs in iter {
            expr = PredExpr::or(lhs, expr);
        }
        expr
    }
}

pub struct CnfResult {
    pub conjuncts: Vec<Conjunct>,
}

impl CnfResult {
    /// Rebuild the whole normal form as a right-linear AND tree, the shape
    /// the evaluator walks.
    pub fn to_pred_expr(&self) -> Option<PredExpr> {
        let mut iter = self.conjuncts.iter().rev().map(Conjunct::to_pred_expr);
        let mut expr = iter.next()?;
        for lhs in iter {
            expr = PredExpr::and(lhs, expr);
        }
        Some(expr)
    }
}

/// Result of splitting a normal form across scan scopes.
pub struct PushDown {
    /// Conjuncts evaluable entirely at one requested scope.
    pub per_spec: Vec<(SpecId, Vec<Conjunct>)>,
    /// Everything else: joins, outer references, method calls.
    pub residual: Vec<Conjunct>,
}

/// Scopes and method usage referenced by a subtree.
#[derive(Default)]
struct SpecRefs {
    specs: IndexSet<SpecId>,
    has_method_call: bool,
}

fn visit_regu(regu: &crate::regu::ReguVariable, refs: &mut SpecRefs) {
    regu.map(&mut |node, _| match &node.spec {
        ReguSpec::Attr(d) | ReguSpec::ClassAttr(d) | ReguSpec::SharedAttr(d) => {
            refs.specs.insert(d.spec_id);
        }
        ReguSpec::Func(func) if func.kind == FuncKind::MethodCall => {
            refs.has_method_call = true;
        }
        _ => {}
    });
}

fn collect_spec_refs(expr: &PredExpr, refs: &mut SpecRefs) {
    match expr {
        PredExpr::Pred(p) => {
            collect_spec_refs(&p.lhs, refs);
            collect_spec_refs(&p.rhs, refs);
        }
        PredExpr::Not(child) => collect_spec_refs(child, refs),
        PredExpr::Term(term) => match term {
            EvalTerm::Comp(c) => {
                if let Some(lhs) = &c.lhs {
                    visit_regu(lhs, refs);
                }
                if let Some(rhs) = &c.rhs {
                    visit_regu(rhs, refs);
                }
            }
            EvalTerm::Alsm(a) => {
                visit_regu(&a.elem, refs);
                visit_regu(&a.elemset, refs);
            }
            EvalTerm::Like(l) => {
                visit_regu(&l.src, refs);
                visit_regu(&l.pattern, refs);
                if let Some(esc) = &l.esc_char {
                    visit_regu(esc, refs);
                }
            }
            EvalTerm::Rlike(r) => {
                visit_regu(&r.src, refs);
                visit_regu(&r.pattern, refs);
                visit_regu(&r.case_sensitive, refs);
            }
        },
    }
}

/// Phase 1: push NOT inward until negations sit on leaves that have no
/// operator complement. `NOT NOT x` collapses, De Morgan splits the
/// connectives, comparisons flip to their complements, quantifiers flip to
/// their duals, XOR expands into its AND/OR form.
pub fn and_or_form(expr: PredExpr) -> PredExpr {
    match expr {
        PredExpr::Pred(p) => match p.bool_op {
            BoolOp::And | BoolOp::Or => PredExpr::Pred(Pred {
                lhs: Box::new(and_or_form(*p.lhs)),
                rhs: Box::new(and_or_form(*p.rhs)),
                bool_op: p.bool_op,
            }),
            BoolOp::Xor => {
                // a XOR b == (a OR b) AND (NOT a OR NOT b)
                let (a, b) = (and_or_form(*p.lhs), and_or_form(*p.rhs));
                let not_a = negate_expr(a.clone());
                let not_b = negate_expr(b.clone());
                PredExpr::and(PredExpr::or(a, b), PredExpr::or(not_a, not_b))
            }
            BoolOp::Is | BoolOp::IsNot => PredExpr::Pred(p),
        },
        PredExpr::Not(child) => negate_expr(and_or_form(*child)),
        leaf @ PredExpr::Term(_) => leaf,
    }
}

/// Negate an already and/or-formed tree, pushing the negation as deep as it
/// will go.
fn negate_expr(expr: PredExpr) -> PredExpr {
    match expr {
        PredExpr::Not(child) => *child,
        PredExpr::Pred(p) => match p.bool_op {
            BoolOp::And => PredExpr::or(negate_expr(*p.lhs), negate_expr(*p.rhs)),
            BoolOp::Or => PredExpr::and(negate_expr(*p.lhs), negate_expr(*p.rhs)),
            BoolOp::Is => PredExpr::Pred(Pred {
                bool_op: BoolOp::IsNot,
                ..p
            }),
            BoolOp::IsNot => PredExpr::Pred(Pred {
                bool_op: BoolOp::Is,
                ..p
            }),
            BoolOp::Xor => PredExpr::Not(Box::new(PredExpr::Pred(p))),
        },
        PredExpr::Term(term) => match term {
            EvalTerm::Comp(mut comp) => match comp.op.complement() {
                Some(complement) => {
                    comp.op = complement;
                    PredExpr::Term(EvalTerm::Comp(comp))
                }
                None => PredExpr::Not(Box::new(PredExpr::Term(EvalTerm::Comp(comp)))),
            },
            EvalTerm::Alsm(alsm) => match alsm.op.complement() {
                // NOT (x op SOME s) == x (NOT op) ALL s, and dually.
                Some(complement) => PredExpr::Term(EvalTerm::Alsm(AlsmTerm {
                    op: complement,
                    kind: match alsm.kind {
                        QuantKind::All => QuantKind::Some,
                        QuantKind::Some => QuantKind::All,
                    },
                    ..alsm
                })),
                None => PredExpr::Not(Box::new(PredExpr::Term(EvalTerm::Alsm(alsm)))),
            },
            other => PredExpr::Not(Box::new(PredExpr::Term(other))),
        },
    }
}

/// Estimated number of conjuncts a full CNF expansion would produce.
fn cnf_size_estimate(expr: &PredExpr) -> usize {
    match expr {
        PredExpr::Pred(p) => match p.bool_op {
            BoolOp::And => cnf_size_estimate(&p.lhs).saturating_add(cnf_size_estimate(&p.rhs)),
            BoolOp::Or => cnf_size_estimate(&p.lhs).saturating_mul(cnf_size_estimate(&p.rhs)),
            _ => 1,
        },
        _ => 1,
    }
}

/// Distribute AND over OR. Operates on conjunct lists: each conjunct is a
/// list of disjuncts.
fn distribute(expr: PredExpr) -> Vec<Vec<PredExpr>> {
    match expr {
        PredExpr::Pred(p) if p.bool_op == BoolOp::And => {
            let mut conjuncts = distribute(*p.lhs);
            conjuncts.extend(distribute(*p.rhs));
            conjuncts
        }
        PredExpr::Pred(p) if p.bool_op == BoolOp::Or => {
            let left = distribute(*p.lhs);
            let right = distribute(*p.rhs);
            left.iter()
                .cartesian_product(right.iter())
                .map(|(l, r)| l.iter().chain(r).cloned().collect())
                .collect()
        }
        leaf => vec![vec![leaf]],
    }
}

/// Fallback for trees whose expansion would blow up: flatten the top-level
/// AND, and inside each OR factor out conjuncts common to every branch.
fn compact(expr: PredExpr) -> Vec<Vec<PredExpr>> {
    match expr {
        PredExpr::Pred(p) if p.bool_op == BoolOp::And => {
            let mut conjuncts = compact(*p.lhs);
            conjuncts.extend(compact(*p.rhs));
            conjuncts
        }
        PredExpr::Pred(p) if p.bool_op == BoolOp::Or => {
            let branches = flatten_or(PredExpr::Pred(p));
            let branch_conjuncts: Vec<Vec<PredExpr>> = branches
                .into_iter()
                .map(|b| flatten_and(b).into_iter().collect())
                .collect();

            // A conjunct common to every branch can be hoisted above the OR.
            let keys: Vec<Vec<String>> = branch_conjuncts
                .iter()
                .map(|c| c.iter().map(|e| e.to_string()).collect())
                .collect();
            let mut common: Vec<usize> = Vec::new();
            for (i, key) in keys[0].iter().enumerate() {
                if keys[1..].iter().all(|k| k.contains(key)) {
                    common.push(i);
                }
            }

            let mut out: Vec<Vec<PredExpr>> = common
                .iter()
                .map(|&i| vec![branch_conjuncts[0][i].clone()])
                .collect();
            let hoisted: Vec<&String> = common.iter().map(|&i| &keys[0][i]).collect();

            // Residual OR over the trimmed branches stays one conjunct.
            let mut residual_branches = Vec::new();
            for (branch, branch_keys) in branch_conjuncts.iter().zip(&keys) {
                let rest: Vec<PredExpr> = branch
                    .iter()
                    .zip(branch_keys)
                    .filter(|(_, k)| !hoisted.contains(k))
                    .map(|(e, _)| e.clone())
                    .collect();
                if rest.is_empty() {
                    // One branch fully covered by the common part: the OR
                    // imposes nothing further.
                    residual_branches.clear();
                    break;
                }
                residual_branches.push(rebuild_and(rest));
            }
            if !residual_branches.is_empty() {
                out.push(residual_branches);
            }
            if out.is_empty() {
                vec![vec![rebuild_and(branch_conjuncts[0].clone())]]
            } else {
                out
            }
        }
        leaf => vec![vec![leaf]],
    }
}

fn flatten_or(expr: PredExpr) -> Vec<PredExpr> {
    match expr {
        PredExpr::Pred(p) if p.bool_op == BoolOp::Or => {
            let mut out = flatten_or(*p.lhs);
            out.extend(flatten_or(*p.rhs));
            out
        }
        other => vec![other],
    }
}

fn flatten_and(expr: PredExpr) -> Vec<PredExpr> {
    match expr {
        PredExpr::Pred(p) if p.bool_op == BoolOp::And => {
            let mut out = flatten_and(*p.lhs);
            out.extend(flatten_and(*p.rhs));
            out
        }
        other => vec![other],
    }
}

fn rebuild_and(mut exprs: Vec<PredExpr>) -> PredExpr {
    let mut expr = exprs.pop().expect("empty conjunction");
    while let Some(lhs) = exprs.pop() {
        expr = PredExpr::and(lhs, expr);
    }
    expr
}

fn tag(conjuncts: Vec<Vec<PredExpr>>) -> CnfResult {
    let conjuncts = conjuncts
        .into_iter()
        .enumerate()
        .map(|(i, disjuncts)| {
            let mut refs = SpecRefs::default();
            for d in &disjuncts {
                collect_spec_refs(d, &mut refs);
            }
            let spec_ident = if refs.specs.len() == 1 && !refs.has_method_call {
                refs.specs.first().copied()
            } else {
                None
            };
            Conjunct {
                disjuncts,
                spec_ident,
                is_cnf_start: i == 0,
            }
        })
        .collect();
    CnfResult { conjuncts }
}

/// Normalize `expr` to conjunctive normal form.
pub fn cnf(expr: PredExpr) -> Result<CnfResult> {
    let aof = and_or_form(expr);
    let estimate = cnf_size_estimate(&aof);
    if estimate == 0 {
        return Err(SquillError::Internal("empty predicate tree"));
    }
    let conjuncts = if estimate > CNF_EXPANSION_LIMIT {
        log::debug!("cnf expansion estimate {estimate} over limit; compacting");
        compact(aof)
    } else {
        distribute(aof)
    };
    Ok(tag(conjuncts))
}

/// Normalize `expr` to disjunctive normal form: a list of disjuncts, each a
/// list of conjunct leaves. Used by index-range analysis.
pub fn dnf(expr: PredExpr) -> Result<Vec<Vec<PredExpr>>> {
    fn distribute_dnf(expr: PredExpr) -> Vec<Vec<PredExpr>> {
        match expr {
            PredExpr::Pred(p) if p.bool_op == BoolOp::Or => {
                let mut out = distribute_dnf(*p.lhs);
                out.extend(distribute_dnf(*p.rhs));
                out
            }
            PredExpr::Pred(p) if p.bool_op == BoolOp::And => {
                let left = distribute_dnf(*p.lhs);
                let right = distribute_dnf(*p.rhs);
                let mut out = Vec::with_capacity(left.len() * right.len());
                for l in &left {
                    for r in &right {
                        let mut merged = l.clone();
                        merged.extend(r.iter().cloned());
                        out.push(merged);
                    }
                }
                out
            }
            leaf => vec![vec![leaf]],
        }
    }
    let aof = and_or_form(expr);
    Ok(distribute_dnf(aof))
}

impl CnfResult {
    /// Split the conjuncts across the given scan scopes. A conjunct moves
    /// to a scope's local filter when every column it references belongs to
    /// that scope and no method call is involved; everything else stays in
    /// the residual (join) predicate.
    pub fn push_down(self, specs: &[SpecId]) -> PushDown {
        let mut per_spec: Vec<(SpecId, Vec<Conjunct>)> =
            specs.iter().map(|&s| (s, Vec::new())).collect();
        let mut residual = Vec::new();
        for conjunct in self.conjuncts {
            match conjunct.spec_ident {
                Some(spec) if specs.contains(&spec) => {
                    per_spec
                        .iter_mut()
                        .find(|(s, _)| *s == spec)
                        .unwrap()
                        .1
                        .push(conjunct);
                }
                _ => residual.push(conjunct),
            }
        }
        PushDown { per_spec, residual }
    }
}
