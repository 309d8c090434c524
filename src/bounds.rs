//! Signed/unsigned interval bounds, and the combined scalar abstract value
//! that ties bounds together with a [`Tnum`](crate::tnum::Tnum).

use crate::tnum::Tnum;
use crate::types::Word;

/// Signed and unsigned interval bounds over a 64-bit word. Both readings of
/// the same bit pattern are tracked simultaneously because the verifier
/// cannot know in general whether a value will be used as signed or unsigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub smin: i64,
    pub smax: i64,
    pub umin: u64,
    pub umax: u64,
}

impl Bounds {
    /// No information: the full range in both readings.
    pub const UNBOUNDED: Bounds = Bounds { smin: i64::MIN, smax: i64::MAX, umin: 0, umax: u64::MAX };

    /// A single concrete value.
    pub fn constant(v: Word) -> Self {
        Bounds { smin: v as i64, smax: v as i64, umin: v, umax: v }
    }

    /// `true` iff these bounds pin down a single concrete value in both readings.
    pub fn is_const(&self) -> bool {
        self.smin == self.smax && self.umin == self.umax
    }

    /// `true` iff the modelled set might include values whose sign bit
    /// differs, i.e. the interval straddles the signed/unsigned boundary.
    pub fn may_be_negative(&self) -> bool {
        self.smin < 0
    }

    /// `true` iff every value is non-negative when read as signed.
    pub fn always_non_negative(&self) -> bool {
        self.smin >= 0
    }

    fn collapse_signed(&mut self) {
        self.smin = i64::MIN;
        self.smax = i64::MAX;
    }

    fn collapse_unsigned(&mut self) {
        self.umin = 0;
        self.umax = u64::MAX;
    }

    /// Collapse to the top of the domain (sound over-approximation of any
    /// operation we cannot otherwise bound).
    pub fn collapse(&mut self) {
        self.collapse_signed();
        self.collapse_unsigned();
    }

    /// Add another bound with overflow detection; on overflow, the affected
    /// reading (signed, unsigned, or both) collapses to the full range.
    pub fn add(mut self, other: Bounds) -> Bounds {
        match (self.smin.checked_add(other.smin), self.smax.checked_add(other.smax)) {
            (Some(smin), Some(smax)) => {
                self.smin = smin;
                self.smax = smax;
            }
            _ => self.collapse_signed(),
        }
        match (self.umin.checked_add(other.umin), self.umax.checked_add(other.umax)) {
            (Some(umin), Some(umax)) => {
                self.umin = umin;
                self.umax = umax;
            }
            _ => self.collapse_unsigned(),
        }
        self
    }

    /// Subtract another bound with overflow detection.
    pub fn sub(mut self, other: Bounds) -> Bounds {
        match (self.smin.checked_sub(other.smax), self.smax.checked_sub(other.smin)) {
            (Some(smin), Some(smax)) => {
                self.smin = smin;
                self.smax = smax;
            }
            _ => self.collapse_signed(),
        }
        if self.umin >= other.umax && self.umax >= other.umin && other.umax <= self.umax {
            self.umin = self.umin.saturating_sub(other.umax);
            self.umax = match self.umax.checked_sub(other.umin) {
                Some(v) => v,
                None => {
                    self.collapse_unsigned();
                    return self;
                }
            };
        } else {
            self.collapse_unsigned();
        }
        self
    }

    /// Multiply, valid only when both operands are non-negative and fit in
    /// 32 bits (per §4.1); otherwise the caller should collapse instead of
    /// calling this.
    pub fn mul_small_nonneg(self, other: Bounds) -> Option<Bounds> {
        if self.smin < 0 || other.smin < 0 {
            return None;
        }
        if self.umax > u32::MAX as u64 || other.umax > u32::MAX as u64 {
            return None;
        }
        let smin = self.smin.checked_mul(other.smin)?;
        let smax = self.smax.checked_mul(other.smax)?;
        let umin = self.umin.checked_mul(other.umin)?;
        let umax = self.umax.checked_mul(other.umax)?;
        Some(Bounds { smin, smax, umin, umax })
    }

    /// Tighten bounds against a `tnum`'s known bits (bits→bounds deduction).
    pub fn tighten_with_tnum(mut self, t: Tnum) -> Bounds {
        // Known-zero high bits bound umax from above; known-one bits bound
        // umin from below. Only meaningful for fully-known high bits, so we
        // derive a conservative unsigned range from the known bits directly.
        let known_ones = t.value();
        let known_mask = !t.mask();
        let lower = known_ones & known_mask;
        let upper = known_ones | t.mask();
        self.umin = self.umin.max(lower);
        self.umax = self.umax.min(upper);
        if self.umin > self.umax {
            // Conflicting information is unreachable in a sound caller; stay
            // conservative rather than panic.
            self.umin = 0;
            self.umax = u64::MAX;
        }
        self
    }

    /// Tighten a `tnum`'s known bits against already-known bounds
    /// (bounds→bits deduction): bits above the highest set bit of `umax`
    /// that are constant across `[umin, umax]` become known.
    pub fn tighten_tnum(&self, t: Tnum) -> Tnum {
        if self.umin == self.umax {
            return t.intersect(Tnum::constant(self.umin));
        }
        let differing = self.umin ^ self.umax;
        let highest_differing_bit = 63 - differing.leading_zeros();
        if highest_differing_bit >= 63 {
            // The topmost bit is the one that varies, so nothing above it
            // is pinned down.
            return t;
        }
        let high_mask = !0u64 << (highest_differing_bit + 1);
        let known_high_bits = self.umin & high_mask;
        t.intersect(Tnum::new(known_high_bits, !high_mask))
    }

    /// Infer signed bounds from unsigned bounds (or vice versa) when the
    /// interval cannot cross the sign boundary.
    pub fn cross_infer(mut self) -> Bounds {
        // unsigned -> signed: if [umin, umax] doesn't straddle the sign bit.
        if (self.umin <= i64::MAX as u64) == (self.umax <= i64::MAX as u64) {
            self.smin = self.smin.max(self.umin as i64);
            self.smax = self.smax.min(self.umax as i64);
        }
        // signed -> unsigned: if [smin, smax] doesn't straddle zero.
        if self.smin >= 0 {
            self.umin = self.umin.max(self.smin as u64);
            self.umax = self.umax.min(self.smax as u64);
        }
        self
    }

    /// `true` iff `self` is at least as tight as (a refinement of) `other`:
    /// the set `self` models is a subset of the set `other` models.
    pub fn refines(&self, other: &Bounds) -> bool {
        self.smin >= other.smin
            && self.smax <= other.smax
            && self.umin >= other.umin
            && self.umax <= other.umax
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Bounds::UNBOUNDED
    }
}

/// Apply the three mutually-reinforcing deductions described in §4.1,
/// returning the tightened `(bounds, tnum)` pair. Never widens either input.
pub fn deduce(bounds: Bounds, tnum: Tnum) -> (Bounds, Tnum) {
    let bounds = bounds.tighten_with_tnum(tnum);
    let bounds = bounds.cross_infer();
    let tnum = bounds.tighten_tnum(tnum);
    let bounds = bounds.tighten_with_tnum(tnum);
    (bounds, tnum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn add_is_sound(a: i64, b: i64) -> bool {
        let ba = Bounds::constant(a as u64);
        let bb = Bounds::constant(b as u64);
        let r = ba.add(bb);
        let expected = a.wrapping_add(b);
        expected >= r.smin && expected <= r.smax || r.smin == i64::MIN
    }

    #[quickcheck]
    fn deduce_never_widens(v: u64) -> bool {
        let b0 = Bounds::constant(v);
        let t0 = Tnum::constant(v);
        let (b1, t1) = deduce(b0, t0);
        b1.refines(&b0) && t1.mask() <= t0.mask()
    }

    #[quickcheck]
    fn deduce_is_idempotent(v: u64, mask: u64) -> bool {
        let t0 = Tnum::new(v, mask);
        let b0 = Bounds::UNBOUNDED;
        let (b1, t1) = deduce(b0, t0);
        let (b2, t2) = deduce(b1, t1);
        b1 == b2 && t1 == t2
    }

    #[test]
    fn refines_is_reflexive() {
        assert!(Bounds::UNBOUNDED.refines(&Bounds::UNBOUNDED));
        assert!(Bounds::constant(5).refines(&Bounds::UNBOUNDED));
        assert!(!Bounds::UNBOUNDED.refines(&Bounds::constant(5)));
    }
}
