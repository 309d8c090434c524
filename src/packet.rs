//! Packet-range refinement (§4.5): widening `range` on a `packet_end`
//! comparison, and downgrading it whenever packet data could move.

use crate::reg::{Register, RegKind};

/// A proven-safe distance from `reg`'s current position to the end of the
/// packet, established by comparing it against a `packet_end` register on
/// the taken branch of a conditional jump (§4.5 item 1).
///
/// `reg` and `end` must be [`RegKind::Packet`]/[`RegKind::PacketMeta`] and
/// [`RegKind::PacketEnd`] respectively, sharing the same provenance `id`
/// (i.e. derived from the same `packet_end` load).
pub fn refine_range_on_compare(reg: &mut Register, end: &Register, strictly_less: bool) {
    if end.kind != RegKind::PacketEnd || reg.id != end.id {
        return;
    }
    if !matches!(reg.kind, RegKind::Packet | RegKind::PacketMeta) {
        return;
    }
    let Some(delta) = end.fixed_off.checked_sub(reg.fixed_off) else { return };
    let proven = if strictly_less { delta - 1 } else { delta };
    if proven > 0 && proven as u32 > reg.range {
        reg.range = proven as u32;
    }
}

/// Any helper whose prototype sets `changes_pkt_data` invalidates every
/// outstanding packet pointer's proven range (§4.5 item 2): the packet may
/// have been reallocated, so byte offsets already checked are no longer
/// trustworthy.
pub fn invalidate_all_packet_ranges(regs: &mut [Register]) {
    for r in regs.iter_mut() {
        if r.kind.is_packet() {
            r.range = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::Bounds;
    use crate::tnum::Tnum;

    fn packet_reg(id: u32, fixed_off: i32) -> Register {
        Register {
            kind: RegKind::Packet,
            fixed_off,
            var_off: Tnum::constant(0),
            bounds: Bounds::constant(0),
            range: 0,
            id,
            frame_no: 0,
            live: Default::default(),
        }
    }

    fn end_reg(id: u32, fixed_off: i32) -> Register {
        Register { kind: RegKind::PacketEnd, ..packet_reg(id, fixed_off) }
    }

    #[test]
    fn compare_widens_range_when_ids_match() {
        let mut r = packet_reg(7, 0);
        let end = end_reg(7, 20);
        refine_range_on_compare(&mut r, &end, false);
        assert_eq!(r.range, 20);
    }

    #[test]
    fn compare_is_noop_when_ids_differ() {
        let mut r = packet_reg(7, 0);
        let end = end_reg(9, 20);
        refine_range_on_compare(&mut r, &end, false);
        assert_eq!(r.range, 0);
    }

    #[test]
    fn helper_that_changes_pkt_data_resets_range() {
        let mut regs = vec![packet_reg(7, 0)];
        regs[0].range = 40;
        invalidate_all_packet_ranges(&mut regs);
        assert_eq!(regs[0].range, 0);
    }
}
