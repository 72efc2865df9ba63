//! Three-valued logic with an out-of-band error state.

use std::ops::Not;

use strum_macros::{Display, EnumIter};

/// Result of a predicate evaluation. SQL boolean logic is three-valued;
/// `Error` is the fourth, out-of-band state that aborts the enclosing scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum Logical {
    True,
    False,
    Unknown,
    Error,
}

impl Logical {
    pub fn from_bool(b: bool) -> Logical {
        if b { Logical::True } else { Logical::False }
    }

    pub fn is_true(self) -> bool {
        self == Logical::True
    }

    pub fn is_known(self) -> bool {
        matches!(self, Logical::True | Logical::False)
    }

    /// Negation. `Unknown` and `Error` are preserved.
    pub fn negate(self) -> Logical {
        match self {
            Logical::True => Logical::False,
            Logical::False => Logical::True,
            other => other,
        }
    }

    /// Combine two results under conjunction, without short-circuit: an
    /// `Error` on either side wins, then `False`, then `Unknown`.
    pub fn and_result(self, other: Logical) -> Logical {
        if self == Logical::Error || other == Logical::Error {
            Logical::Error
        } else if self == Logical::False || other == Logical::False {
            Logical::False
        } else if self == Logical::Unknown || other == Logical::Unknown {
            Logical::Unknown
        } else {
            Logical::True
        }
    }

    /// Dual of [`Logical::and_result`].
    pub fn or_result(self, other: Logical) -> Logical {
        if self == Logical::Error || other == Logical::Error {
            Logical::Error
        } else if self == Logical::True || other == Logical::True {
            Logical::True
        } else if self == Logical::Unknown || other == Logical::Unknown {
            Logical::Unknown
        } else {
            Logical::False
        }
    }

    /// Exclusive or. Both operands must be known for a known answer.
    pub fn xor_result(self, other: Logical) -> Logical {
        if self == Logical::Error || other == Logical::Error {
            Logical::Error
        } else if self == Logical::Unknown || other == Logical::Unknown {
            Logical::Unknown
        } else {
            Logical::from_bool(self != other)
        }
    }
}

impl Not for Logical {
    type Output = Logical;

    fn not(self) -> Logical {
        self.negate()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use strum::IntoEnumIterator;

    use super::Logical;

    #[test]
    fn negation_is_involutive_on_known_values() {
        assert_eq!(Logical::True.negate(), Logical::False);
        assert_eq!(Logical::False.negate(), Logical::True);
        assert_eq!(Logical::Unknown.negate(), Logical::Unknown);
        assert_eq!(Logical::Error.negate(), Logical::Error);
        for v in Logical::iter() {
            assert_eq!(v.negate().negate(), v);
        }
    }

    #[test]
    fn conjunction_truth_table() {
        use Logical::*;
        assert_eq!(True.and_result(True), True);
        assert_eq!(True.and_result(Unknown), Unknown);
        assert_eq!(False.and_result(Unknown), False);
        assert_eq!(Unknown.and_result(Unknown), Unknown);
        assert_eq!(Error.and_result(True), Error);
        assert_eq!(False.and_result(Error), Error);
    }

    #[test]
    fn disjunction_is_the_dual_of_conjunction() {
        use strum::IntoEnumIterator;
        for a in Logical::iter() {
            for b in Logical::iter() {
                assert_eq!(a.or_result(b), a.negate().and_result(b.negate()).negate());
            }
        }
    }

    #[test]
    fn xor_requires_both_known() {
        use Logical::*;
        assert_eq!(True.xor_result(False), True);
        assert_eq!(True.xor_result(True), False);
        assert_eq!(Unknown.xor_result(True), Unknown);
        assert_eq!(Error.xor_result(Unknown), Error);
    }
}
