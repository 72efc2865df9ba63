//! Data types and domains.
//!
//! A domain is a data type plus the precision/scale attributes a column or
//! expression result carries. Coercion between domains follows a fixed
//! promotion table; see [`coercion_target`].

use strum_macros::{Display, EnumIter, IntoStaticStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "UPPERCASE")]
pub enum DbType {
    Null,
    Short,
    Int,
    Bigint,
    Float,
    Double,
    Numeric,
    Char,
    Varchar,
    Bit,
    Varbit,
    Date,
    Time,
    Datetime,
    Timestamp,
    Set,
    Multiset,
    Sequence,
    Oid,
}

impl DbType {
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            DbType::Short
                | DbType::Int
                | DbType::Bigint
                | DbType::Float
                | DbType::Double
                | DbType::Numeric
        )
    }

    pub fn is_char_family(self) -> bool {
        matches!(self, DbType::Char | DbType::Varchar)
    }

    pub fn is_bit_family(self) -> bool {
        matches!(self, DbType::Bit | DbType::Varbit)
    }

    pub fn is_date_family(self) -> bool {
        matches!(
            self,
            DbType::Date | DbType::Time | DbType::Datetime | DbType::Timestamp
        )
    }

    pub fn is_set_family(self) -> bool {
        matches!(self, DbType::Set | DbType::Multiset | DbType::Sequence)
    }

    /// Rank inside the numeric family, used to pick the wider operand.
    /// Exact types rank below approximate types.
    pub fn numeric_rank(self) -> Option<u8> {
        match self {
            DbType::Short => Some(0),
            DbType::Int => Some(1),
            DbType::Bigint => Some(2),
            DbType::Numeric => Some(3),
            DbType::Float => Some(4),
            DbType::Double => Some(5),
            _ => None,
        }
    }
}

/// Resolved domain of a column, host variable or expression result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Domain {
    pub db_type: DbType,
    pub precision: u16,
    pub scale: u8,
}

impl Domain {
    pub const NULL: Domain = Domain::new(DbType::Null);

    pub const fn new(db_type: DbType) -> Domain {
        Domain {
            db_type,
            precision: 0,
            scale: 0,
        }
    }

    pub const fn with_precision(db_type: DbType, precision: u16) -> Domain {
        Domain {
            db_type,
            precision,
            scale: 0,
        }
    }

    pub const fn numeric(precision: u16, scale: u8) -> Domain {
        Domain {
            db_type: DbType::Numeric,
            precision,
            scale,
        }
    }

    pub fn is_null(&self) -> bool {
        self.db_type == DbType::Null
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.db_type {
            DbType::Numeric => write!(f, "NUMERIC({},{})", self.precision, self.scale),
            DbType::Char | DbType::Varchar | DbType::Bit | DbType::Varbit if self.precision > 0 => {
                write!(f, "{}({})", self.db_type, self.precision)
            }
            t => write!(f, "{t}"),
        }
    }
}

/// Which side of a comparison gets coerced, and into what.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoercionTarget {
    /// No coercion is possible or necessary.
    None,
    /// Coerce the right-hand side to the given domain.
    Rhs(Domain),
}

/// Promotion rules for comparison operands of differing families.
///
/// * char vs numeric: the numeric side takes the string form of the char side;
///   when the char side is on the left the comparison stays in the char
///   domain, otherwise both sides meet at DOUBLE.
/// * date vs char: the char side is parsed into the date-family domain.
/// * numeric vs numeric: the lower-ranked side widens to the higher rank.
/// * object identity never coerces.
pub fn coercion_target(lhs: Domain, rhs: Domain) -> CoercionTarget {
    let (lt, rt) = (lhs.db_type, rhs.db_type);
    if lt == rt {
        return CoercionTarget::None;
    }
    if lt == DbType::Oid || rt == DbType::Oid {
        return CoercionTarget::None;
    }
    if lt.is_char_family() && rt.is_numeric() {
        return CoercionTarget::Rhs(lhs);
    }
    if lt.is_numeric() && rt.is_char_family() {
        return CoercionTarget::Rhs(Domain::new(DbType::Double));
    }
    if lt.is_date_family() && rt.is_char_family() {
        return CoercionTarget::Rhs(lhs);
    }
    if lt.is_numeric() && rt.is_numeric() {
        let (lr, rr) = (lt.numeric_rank().unwrap(), rt.numeric_rank().unwrap());
        if rr < lr {
            return CoercionTarget::Rhs(lhs);
        }
        return CoercionTarget::None;
    }
    CoercionTarget::None
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{CoercionTarget, DbType, Domain, coercion_target};

    #[test]
    fn char_vs_numeric_keeps_the_char_side() {
        let target = coercion_target(
            Domain::with_precision(DbType::Varchar, 32),
            Domain::new(DbType::Int),
        );
        assert_eq!(
            target,
            CoercionTarget::Rhs(Domain::with_precision(DbType::Varchar, 32))
        );
    }

    #[test]
    fn numeric_vs_char_meets_at_double() {
        let target = coercion_target(
            Domain::new(DbType::Int),
            Domain::with_precision(DbType::Varchar, 8),
        );
        assert_eq!(target, CoercionTarget::Rhs(Domain::new(DbType::Double)));
    }

    #[test]
    fn date_vs_char_parses_the_char_side() {
        let target = coercion_target(
            Domain::new(DbType::Date),
            Domain::with_precision(DbType::Varchar, 10),
        );
        assert_eq!(target, CoercionTarget::Rhs(Domain::new(DbType::Date)));
    }

    #[test]
    fn lower_numeric_widens() {
        let target = coercion_target(Domain::new(DbType::Bigint), Domain::new(DbType::Short));
        assert_eq!(target, CoercionTarget::Rhs(Domain::new(DbType::Bigint)));
        // Already the wider side; nothing to do.
        let target = coercion_target(Domain::new(DbType::Short), Domain::new(DbType::Double));
        assert_eq!(target, CoercionTarget::None);
    }

    #[test]
    fn object_identity_never_coerces() {
        let target = coercion_target(Domain::new(DbType::Oid), Domain::new(DbType::Int));
        assert_eq!(target, CoercionTarget::None);
    }
}
