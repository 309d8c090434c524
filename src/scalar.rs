//! The combined numeric abstract value: a [`Tnum`] plus [`Bounds`], kept
//! mutually consistent by [`deduce`](crate::bounds::deduce) after every
//! transfer function.

use crate::bounds::{deduce, Bounds};
use crate::tnum::Tnum;
use crate::types::Word;

/// A fully abstracted 64-bit scalar value: the top of the domain is
/// `Scalar::unknown()`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scalar {
    pub tnum: Tnum,
    pub bounds: Bounds,
}

impl Scalar {
    /// The top of the domain: nothing known.
    pub fn unknown() -> Self {
        Scalar { tnum: Tnum::UNKNOWN, bounds: Bounds::UNBOUNDED }.deduced()
    }

    /// A single concrete value.
    pub fn constant(v: Word) -> Self {
        Scalar { tnum: Tnum::constant(v), bounds: Bounds::constant(v) }
    }

    fn deduced(self) -> Self {
        let (bounds, tnum) = deduce(self.bounds, self.tnum);
        Scalar { tnum, bounds }
    }

    /// `true` iff this scalar is a known constant.
    pub fn as_const(&self) -> Option<Word> {
        self.tnum.as_const()
    }

    /// Addition transfer function (§4.1: interval arithmetic with overflow
    /// detection, `var_off` via the bitwise add transfer function).
    pub fn add(self, other: Scalar) -> Scalar {
        Scalar { tnum: self.tnum.add(other.tnum), bounds: self.bounds.add(other.bounds) }.deduced()
    }

    /// Subtraction transfer function.
    pub fn sub(self, other: Scalar) -> Scalar {
        Scalar { tnum: self.tnum.sub(other.tnum), bounds: self.bounds.sub(other.bounds) }.deduced()
    }

    /// Multiplication: only sound to call when both operands are
    /// non-negative and fit in 32 bits; callers otherwise collapse to
    /// `unknown()` and fold the `var_off` through the caller's own
    /// bitwise reasoning, per §4.1.
    pub fn mul(self, other: Scalar) -> Scalar {
        match self.bounds.mul_small_nonneg(other.bounds) {
            Some(bounds) => Scalar { tnum: Tnum::UNKNOWN, bounds }.deduced(),
            None => Scalar::unknown(),
        }
    }

    /// Bitwise AND.
    pub fn and(self, other: Scalar) -> Scalar {
        let tnum = self.tnum.and(other.tnum);
        let mut bounds = Bounds::UNBOUNDED;
        if !self.bounds.may_be_negative() && !other.bounds.may_be_negative() {
            bounds.smin = 0;
        }
        Scalar { tnum, bounds }.deduced()
    }

    /// Bitwise OR.
    pub fn or(self, other: Scalar) -> Scalar {
        let tnum = self.tnum.or(other.tnum);
        let mut bounds = Bounds::UNBOUNDED;
        if !self.bounds.may_be_negative() && !other.bounds.may_be_negative() {
            bounds.smin = 0;
        }
        Scalar { tnum, bounds }.deduced()
    }

    /// Bitwise XOR.
    pub fn xor(self, other: Scalar) -> Scalar {
        let tnum = self.tnum.xor(other.tnum);
        let mut bounds = Bounds::UNBOUNDED;
        if !self.bounds.may_be_negative() && !other.bounds.may_be_negative() {
            bounds.smin = 0;
        }
        Scalar { tnum, bounds }.deduced()
    }

    /// Left shift by a known amount in `[0, 63]`; `None` if `shift >= 64`.
    pub fn lsh(self, shift: u32) -> Option<Scalar> {
        if shift >= 64 {
            return None;
        }
        let tnum = self.tnum.lsh(shift);
        Some(Scalar { tnum, bounds: Bounds::UNBOUNDED }.deduced())
    }

    /// Logical right shift by a known amount in `[0, 63]`; `None` if `shift >= 64`.
    pub fn rsh(self, shift: u32) -> Option<Scalar> {
        if shift >= 64 {
            return None;
        }
        let tnum = self.tnum.rsh(shift);
        let mut bounds = Bounds::UNBOUNDED;
        bounds.smin = 0;
        Some(Scalar { tnum, bounds }.deduced())
    }

    /// Arithmetic right shift by a known amount in `[0, 63]`; `None` if `shift >= 64`.
    pub fn arsh(self, shift: u32) -> Option<Scalar> {
        if shift >= 64 {
            return None;
        }
        let tnum = self.tnum.arsh(shift);
        Some(Scalar { tnum, bounds: Bounds::UNBOUNDED }.deduced())
    }

    /// Narrow both the tnum and bounds to 32 bits (32-bit ALU ops must
    /// narrow operands and results before and after, per §4.1).
    pub fn narrow_to_32(self) -> Scalar {
        let tnum = self.tnum.subreg();
        let bounds = Bounds {
            smin: 0,
            smax: u32::MAX as i64,
            umin: 0,
            umax: u32::MAX as u64,
        };
        Scalar { tnum, bounds }.deduced()
    }

    /// `true` iff `self`'s modelled set is a subset of `other`'s: used by
    /// `regsafe` to check that a register refines a previously-recorded one.
    pub fn refines(&self, other: &Scalar) -> bool {
        self.bounds.refines(&other.bounds)
            && (self.tnum.mask() | other.tnum.mask()) == other.tnum.mask()
            && (self.tnum.value() & !other.tnum.mask()) == (other.tnum.value() & !other.tnum.mask())
    }
}

impl Default for Scalar {
    fn default() -> Self {
        Scalar::unknown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn add_contains_concrete_sum(a: u64, b: u64) -> bool {
        let sa = Scalar::constant(a);
        let sb = Scalar::constant(b);
        let sum = sa.add(sb);
        let expected = a.wrapping_add(b);
        sum.tnum.contains(expected)
    }

    #[quickcheck]
    fn refines_is_reflexive(v: u64) -> bool {
        let s = Scalar::constant(v);
        s.refines(&s)
    }

    #[test]
    fn unknown_refines_nothing_but_itself() {
        let u = Scalar::unknown();
        let c = Scalar::constant(5);
        assert!(c.refines(&u));
        assert!(!u.refines(&c));
    }

    #[test]
    fn narrow_to_32_clears_upper_bits() {
        let s = Scalar::constant(0xffff_ffff_0000_0001);
        let n = s.narrow_to_32();
        assert_eq!(n.tnum.value() & !0xffff_ffffu64, 0);
    }
}
