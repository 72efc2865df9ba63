//! Arithmetic nodes of the register-variable tree.

use std::cell::RefCell;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use squill_lib_core::domain::{DbType, Domain};
use squill_lib_core::errors::{Result, SquillError};
use squill_lib_core::logical::Logical;
use squill_lib_core::value::{CompareResult, DbDate, DbValue, Numeric, compare_values};

use crate::context::ExecContext;
use crate::pred::PredExpr;
use crate::regu::fetch::{ValueDescriptor, fetch_peek_dbval};
use crate::regu::ReguVariable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    UnaryMinus,
    Abs,
    Floor,
    Ceil,
    Sign,
    Power,
    Concat,
    /// `CASE WHEN pred THEN left ELSE right`; the predicate hangs off the
    /// arith node.
    Case,
    /// `NULLIF(left, right)`.
    NullIf,
    /// `COALESCE(left, right)`.
    Coalesce,
    /// 32-bit pseudo-random integer; seeded per node.
    Random,
    /// Pseudo-random double in `[0, 1)`.
    DRandom,
}

#[derive(Clone)]
pub struct ArithSpec {
    pub op: ArithOp,
    pub domain: Domain,
    pub original_domain: Domain,
    /// Result slot; the fetch peeks it after evaluation.
    pub value: RefCell<DbValue>,
    pub left: Option<ReguVariable>,
    pub right: Option<ReguVariable>,
    pub third: Option<ReguVariable>,
    pub pred: Option<Box<PredExpr>>,
    pub rand_seed: RefCell<Option<StdRng>>,
}

impl ArithSpec {
    pub fn unary(op: ArithOp, domain: Domain, operand: ReguVariable) -> ArithSpec {
        ArithSpec {
            op,
            domain,
            original_domain: domain,
            value: RefCell::new(DbValue::Null),
            left: Some(operand),
            right: None,
            third: None,
            pred: None,
            rand_seed: RefCell::new(None),
        }
    }

    pub fn binary(op: ArithOp, domain: Domain, left: ReguVariable, right: ReguVariable) -> ArithSpec {
        ArithSpec {
            op,
            domain,
            original_domain: domain,
            value: RefCell::new(DbValue::Null),
            left: Some(left),
            right: Some(right),
            third: None,
            pred: None,
            rand_seed: RefCell::new(None),
        }
    }

    pub fn case_when(
        domain: Domain,
        pred: PredExpr,
        then: ReguVariable,
        otherwise: ReguVariable,
    ) -> ArithSpec {
        ArithSpec {
            op: ArithOp::Case,
            domain,
            original_domain: domain,
            value: RefCell::new(DbValue::Null),
            left: Some(then),
            right: Some(otherwise),
            third: None,
            pred: Some(Box::new(pred)),
            rand_seed: RefCell::new(None),
        }
    }

    pub fn nullary(op: ArithOp, domain: Domain) -> ArithSpec {
        ArithSpec {
            op,
            domain,
            original_domain: domain,
            value: RefCell::new(DbValue::Null),
            left: None,
            right: None,
            third: None,
            pred: None,
            rand_seed: RefCell::new(None),
        }
    }
}

/// Evaluate an arith node into its result slot.
pub fn eval_arith(
    ctx: &mut ExecContext,
    arith: &ArithSpec,
    vd: &ValueDescriptor,
    obj_oid: Option<&squill_lib_core::oid::Oid>,
) -> Result<()> {
    let result = compute(ctx, arith, vd, obj_oid)?;
    *arith.value.borrow_mut() = result;
    Ok(())
}

fn fetch_operand(
    ctx: &mut ExecContext,
    operand: &Option<ReguVariable>,
    vd: &ValueDescriptor,
    obj_oid: Option<&squill_lib_core::oid::Oid>,
) -> Result<DbValue> {
    match operand {
        Some(regu) => Ok(fetch_peek_dbval(ctx, regu, vd, obj_oid)?.clone()),
        None => Err(SquillError::Internal("missing arith operand")),
    }
}

fn compute(
    ctx: &mut ExecContext,
    arith: &ArithSpec,
    vd: &ValueDescriptor,
    obj_oid: Option<&squill_lib_core::oid::Oid>,
) -> Result<DbValue> {
    match arith.op {
        ArithOp::Random | ArithOp::DRandom => {
            let mut seed = arith.rand_seed.borrow_mut();
            let rng = seed.get_or_insert_with(StdRng::from_entropy);
            return Ok(match arith.op {
                ArithOp::Random => DbValue::Int(rng.gen_range(0..i32::MAX)),
                _ => DbValue::Double(rng.r#gen::<f64>()),
            });
        }
        ArithOp::Case => {
            let pred = arith
                .pred
                .as_deref()
                .ok_or(SquillError::Internal("CASE without predicate"))?;
            let cond = crate::eval::eval_pred(ctx, pred, vd, obj_oid);
            if cond == Logical::Error {
                return Err(ctx.error.take().unwrap_or(SquillError::Failed));
            }
            let branch = if cond == Logical::True {
                &arith.left
            } else {
                &arith.right
            };
            return fetch_operand(ctx, branch, vd, obj_oid);
        }
        ArithOp::Coalesce => {
            let left = fetch_operand(ctx, &arith.left, vd, obj_oid)?;
            if !left.is_null() {
                return Ok(left);
            }
            return fetch_operand(ctx, &arith.right, vd, obj_oid);
        }
        ArithOp::NullIf => {
            let left = fetch_operand(ctx, &arith.left, vd, obj_oid)?;
            let right = fetch_operand(ctx, &arith.right, vd, obj_oid)?;
            if compare_values(&left, &right, true, false) == CompareResult::Eq {
                return Ok(DbValue::Null);
            }
            return Ok(left);
        }
        _ => {}
    }

    let left = fetch_operand(ctx, &arith.left, vd, obj_oid)?;
    if left.is_null() {
        return Ok(DbValue::Null);
    }

    match arith.op {
        ArithOp::UnaryMinus => negate(&left),
        ArithOp::Abs => abs(&left),
        ArithOp::Floor => round_toward(&left, f64::floor),
        ArithOp::Ceil => round_toward(&left, f64::ceil),
        ArithOp::Sign => {
            let v = left
                .as_f64()
                .ok_or(SquillError::InvalidDatatype("SIGN", "number"))?;
            Ok(DbValue::Int(if v > 0.0 {
                1
            } else if v < 0.0 {
                -1
            } else {
                0
            }))
        }
        op => {
            let right = fetch_operand(ctx, &arith.right, vd, obj_oid)?;
            if right.is_null() {
                return Ok(DbValue::Null);
            }
            binary_op(op, &left, &right, arith.domain)
        }
    }
}

fn negate(v: &DbValue) -> Result<DbValue> {
    Ok(match v {
        DbValue::Short(x) => DbValue::Short(
            x.checked_neg()
                .ok_or(SquillError::ArithOverflow("unary minus"))?,
        ),
        DbValue::Int(x) => DbValue::Int(
            x.checked_neg()
                .ok_or(SquillError::ArithOverflow("unary minus"))?,
        ),
        DbValue::Bigint(x) => DbValue::Bigint(
            x.checked_neg()
                .ok_or(SquillError::ArithOverflow("unary minus"))?,
        ),
        DbValue::Float(x) => DbValue::Float(-x),
        DbValue::Double(x) => DbValue::Double(-x),
        DbValue::Numeric(n) => DbValue::Numeric(Numeric::new(-n.unscaled, n.scale)),
        _ => return Err(SquillError::InvalidDatatype("unary minus", "number")),
    })
}

fn abs(v: &DbValue) -> Result<DbValue> {
    Ok(match v {
        DbValue::Short(x) => DbValue::Short(x.checked_abs().ok_or(SquillError::ArithOverflow("ABS"))?),
        DbValue::Int(x) => DbValue::Int(x.checked_abs().ok_or(SquillError::ArithOverflow("ABS"))?),
        DbValue::Bigint(x) => {
            DbValue::Bigint(x.checked_abs().ok_or(SquillError::ArithOverflow("ABS"))?)
        }
        DbValue::Float(x) => DbValue::Float(x.abs()),
        DbValue::Double(x) => DbValue::Double(x.abs()),
        DbValue::Numeric(n) => DbValue::Numeric(Numeric::new(n.unscaled.abs(), n.scale)),
        _ => return Err(SquillError::InvalidDatatype("ABS", "number")),
    })
}

fn round_toward(v: &DbValue, f: fn(f64) -> f64) -> Result<DbValue> {
    Ok(match v {
        DbValue::Short(_) | DbValue::Int(_) | DbValue::Bigint(_) => v.clone(),
        DbValue::Float(x) => DbValue::Float(f(*x as f64) as f32),
        DbValue::Double(x) => DbValue::Double(f(*x)),
        DbValue::Numeric(n) => {
            let pow = 10i128.pow(n.scale as u32);
            let truncated = n.unscaled.div_euclid(pow);
            let exact = truncated * pow == n.unscaled;
            // div_euclid already floors; ceiling bumps any inexact quotient.
            let adjusted = if !exact && f(0.5) > 0.0 {
                truncated + 1
            } else {
                truncated
            };
            DbValue::Numeric(Numeric::new(adjusted, 0))
        }
        _ => return Err(SquillError::InvalidDatatype("FLOOR/CEIL", "number")),
    })
}

fn binary_op(op: ArithOp, left: &DbValue, right: &DbValue, domain: Domain) -> Result<DbValue> {
    // String concatenation and date arithmetic first; everything else is
    // numeric with the usual promotion ladder.
    if op == ArithOp::Concat {
        return match (left.as_str(), right.as_str()) {
            (Some(a), Some(b)) => Ok(DbValue::Varchar(format!("{a}{b}"))),
            _ => Err(SquillError::InvalidDatatype("concatenation", "string")),
        };
    }
    match (left, right, op) {
        (DbValue::Date(d), _, ArithOp::Add) if right.as_i64().is_some() => {
            return Ok(DbValue::Date(DbDate(d.0 + right.as_i64().unwrap() as i32)));
        }
        (_, DbValue::Date(d), ArithOp::Add) if left.as_i64().is_some() => {
            return Ok(DbValue::Date(DbDate(d.0 + left.as_i64().unwrap() as i32)));
        }
        (DbValue::Date(d), _, ArithOp::Sub) if right.as_i64().is_some() => {
            return Ok(DbValue::Date(DbDate(d.0 - right.as_i64().unwrap() as i32)));
        }
        (DbValue::Date(a), DbValue::Date(b), ArithOp::Sub) => {
            return Ok(DbValue::Int(a.0 - b.0));
        }
        _ => {}
    }

    let lt = left.db_type();
    let rt = right.db_type();
    if !lt.is_numeric() || !rt.is_numeric() {
        return Err(SquillError::InvalidDatatype("arithmetic", "number"));
    }

    let approximate = matches!(lt, DbType::Float | DbType::Double)
        || matches!(rt, DbType::Float | DbType::Double)
        || matches!(op, ArithOp::Div | ArithOp::Power);
    let result = if approximate {
        let (a, b) = (left.as_f64().unwrap(), right.as_f64().unwrap());
        let v = match op {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
            ArithOp::Div => {
                if b == 0.0 {
                    return Err(SquillError::ZeroDivide);
                }
                a / b
            }
            ArithOp::Mod => {
                if b == 0.0 {
                    return Err(SquillError::ZeroDivide);
                }
                a % b
            }
            ArithOp::Power => a.powf(b),
            _ => return Err(SquillError::Internal("unexpected arithmetic opcode")),
        };
        if !v.is_finite() {
            return Err(SquillError::ArithOverflow("arithmetic"));
        }
        DbValue::Double(v)
    } else if let (DbValue::Numeric(_), _) | (_, DbValue::Numeric(_)) = (left, right) {
        let a = as_numeric(left);
        let b = as_numeric(right);
        match op {
            ArithOp::Add | ArithOp::Sub => {
                let (x, y) = a.align(b);
                let scale = a.scale.max(b.scale);
                let v = if op == ArithOp::Add {
                    x.checked_add(y)
                } else {
                    x.checked_sub(y)
                };
                DbValue::Numeric(Numeric::new(
                    v.ok_or(SquillError::ArithOverflow("numeric arithmetic"))?,
                    scale,
                ))
            }
            ArithOp::Mul => DbValue::Numeric(Numeric::new(
                a.unscaled
                    .checked_mul(b.unscaled)
                    .ok_or(SquillError::ArithOverflow("numeric arithmetic"))?,
                a.scale + b.scale,
            )),
            ArithOp::Mod => {
                let (x, y) = a.align(b);
                if y == 0 {
                    return Err(SquillError::ZeroDivide);
                }
                DbValue::Numeric(Numeric::new(x % y, a.scale.max(b.scale)))
            }
            _ => return Err(SquillError::Internal("unexpected arithmetic opcode")),
        }
    } else {
        let (a, b) = (left.as_i64().unwrap(), right.as_i64().unwrap());
        let v = match op {
            ArithOp::Add => a.checked_add(b),
            ArithOp::Sub => a.checked_sub(b),
            ArithOp::Mul => a.checked_mul(b),
            ArithOp::Mod => {
                if b == 0 {
                    return Err(SquillError::ZeroDivide);
                }
                a.checked_rem(b)
            }
            _ => return Err(SquillError::Internal("unexpected arithmetic opcode")),
        };
        DbValue::Bigint(v.ok_or(SquillError::ArithOverflow("integer arithmetic"))?)
    };

    // Narrow back into the compiled result domain where possible.
    if domain.db_type.is_numeric() && result.db_type() != domain.db_type {
        if let Ok(cast) = squill_lib_core::value::coerce_value(&result, &domain) {
            return Ok(cast);
        }
    }
    Ok(result)
}

fn as_numeric(v: &DbValue) -> Numeric {
    match v {
        DbValue::Numeric(n) => *n,
        _ => Numeric::new(v.as_i64().unwrap_or(0) as i128, 0),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use squill_lib_core::domain::{DbType, Domain};
    use squill_lib_core::errors::SquillError;
    use squill_lib_core::params::SystemParameters;
    use squill_lib_core::value::{DbValue, Numeric};

    use super::{ArithOp, ArithSpec, eval_arith};
    use crate::context::ExecContext;
    use crate::regu::fetch::ValueDescriptor;
    use crate::regu::ReguVariable;

    fn eval(arith: &ArithSpec) -> Result<DbValue, SquillError> {
        let params = SystemParameters::default();
        let mut ctx = ExecContext::detached(&params);
        let vd = ValueDescriptor::default();
        eval_arith(&mut ctx, arith, &vd, None)?;
        Ok(arith.value.borrow().clone())
    }

    #[test]
    fn integer_addition_stays_exact() {
        let arith = ArithSpec::binary(
            ArithOp::Add,
            Domain::new(DbType::Int),
            ReguVariable::constant(DbValue::Int(40)),
            ReguVariable::constant(DbValue::Int(2)),
        );
        assert_eq!(eval(&arith).unwrap(), DbValue::Int(42));
    }

    #[test]
    fn null_operand_yields_null() {
        let arith = ArithSpec::binary(
            ArithOp::Mul,
            Domain::new(DbType::Int),
            ReguVariable::constant(DbValue::Null),
            ReguVariable::constant(DbValue::Int(2)),
        );
        assert_eq!(eval(&arith).unwrap(), DbValue::Null);
    }

    #[test]
    fn division_is_approximate_and_checked() {
        let arith = ArithSpec::binary(
            ArithOp::Div,
            Domain::new(DbType::Double),
            ReguVariable::constant(DbValue::Int(1)),
            ReguVariable::constant(DbValue::Int(4)),
        );
        assert_eq!(eval(&arith).unwrap(), DbValue::Double(0.25));

        let by_zero = ArithSpec::binary(
            ArithOp::Div,
            Domain::new(DbType::Double),
            ReguVariable::constant(DbValue::Int(1)),
            ReguVariable::constant(DbValue::Int(0)),
        );
        assert_eq!(eval(&by_zero).unwrap_err(), SquillError::ZeroDivide);
    }

    #[test]
    fn numeric_multiplication_adds_scales() {
        let arith = ArithSpec::binary(
            ArithOp::Mul,
            Domain::numeric(38, 3),
            ReguVariable::constant(DbValue::Numeric(Numeric::new(15, 1))), // 1.5
            ReguVariable::constant(DbValue::Numeric(Numeric::new(25, 2))), // 0.25
        );
        assert_eq!(
            eval(&arith).unwrap(),
            DbValue::Numeric(Numeric::new(375, 3)) // 0.375
        );
    }

    #[test]
    fn overflow_is_an_error_not_a_wrap() {
        let arith = ArithSpec::binary(
            ArithOp::Add,
            Domain::new(DbType::Bigint),
            ReguVariable::constant(DbValue::Bigint(i64::MAX)),
            ReguVariable::constant(DbValue::Bigint(1)),
        );
        assert_eq!(
            eval(&arith).unwrap_err(),
            SquillError::ArithOverflow("integer arithmetic")
        );
    }

    #[test]
    fn coalesce_skips_null() {
        let arith = ArithSpec::binary(
            ArithOp::Coalesce,
            Domain::new(DbType::Int),
            ReguVariable::constant(DbValue::Null),
            ReguVariable::constant(DbValue::Int(9)),
        );
        assert_eq!(eval(&arith).unwrap(), DbValue::Int(9));
    }

    #[test]
    fn date_offset_arithmetic() {
        let date = squill_lib_core::value::parse_date("2024-01-31").unwrap();
        let arith = ArithSpec::binary(
            ArithOp::Add,
            Domain::new(DbType::Date),
            ReguVariable::constant(DbValue::Date(date)),
            ReguVariable::constant(DbValue::Int(1)),
        );
        let got = eval(&arith).unwrap();
        match got {
            DbValue::Date(d) => {
                assert_eq!(squill_lib_core::value::format_date(d), "2024-02-01");
            }
            other => panic!("expected date, got {other:?}"),
        }
    }
}
