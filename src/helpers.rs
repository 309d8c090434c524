//! Helper-call checking (§4.6) and the narrow interface the verifier
//! consumes from the (external, out-of-scope) helper catalog (§6).

use crate::error::RejectReason;
use crate::reg::RegKind;

/// The kind an argument slot expects, used to type-check a helper call's
/// actual register against its declared prototype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// This argument slot is unused by the helper.
    None,
    /// Any scalar.
    AnyScalar,
    /// A constant-size scalar known at verification time.
    ConstSize,
    /// A pointer to the start of a `(ptr, size)` memory region, where `size`
    /// is given by the *next* argument slot.
    MemPtr,
    /// The `size` half of a `(ptr, size)` pair; validated together with the
    /// preceding `MemPtr` slot (§4.6 item 1).
    MemSize,
    /// A pointer to memory the helper will write without having read it
    /// first ("raw mode" / uninitialized-output, §4.6 item 3).
    UninitMemPtr,
    /// A pointer to a map (first argument of every map helper).
    MapPtr,
    /// A pointer to a buffer sized like the map's key.
    MapKeyPtr,
    /// A pointer to a buffer sized like the map's value.
    MapValuePtr,
    /// A reference-typed argument (consumed by a release helper).
    ReleasableRef,
    /// A specific concrete register kind.
    Exact(RegKindFamily),
}

/// A family of register kinds collapsing the `_or_null` distinction, since
/// argument checks only care about the pointee identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegKindFamily {
    Ctx,
    Socket,
    SockCommon,
    TcpSock,
    FlowKeys,
    TpBuffer,
}

impl RegKindFamily {
    pub fn matches(self, kind: &RegKind) -> bool {
        matches!(
            (self, kind),
            (RegKindFamily::Ctx, RegKind::Ctx)
                | (RegKindFamily::Socket, RegKind::Socket | RegKind::SocketOrNull)
                | (RegKindFamily::SockCommon, RegKind::SockCommon | RegKind::SockCommonOrNull)
                | (RegKindFamily::TcpSock, RegKind::TcpSock | RegKind::TcpSockOrNull)
                | (RegKindFamily::FlowKeys, RegKind::FlowKeys)
                | (RegKindFamily::TpBuffer, RegKind::TpBuffer)
        )
    }
}

/// What a helper returns in R0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetKind {
    /// No meaningful return value (R0 becomes an unbounded scalar).
    Scalar,
    /// A fresh map-value pointer, possibly null.
    MapValueOrNull,
    /// A fresh, acquired reference, possibly null (added to `refs` on success).
    AcquiredSocketOrNull,
}

/// A helper function's prototype, exactly the shape described in §6's
/// "Helper interface (consumed)".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelperProto {
    pub ret: RetKind,
    pub args: [ArgKind; 5],
    pub changes_pkt_data: bool,
    pub pkt_access: bool,
    pub gpl_only: bool,
}

/// Well-known helper ids the verifier treats specially beyond generic
/// argument checking.
pub mod ids {
    pub const MAP_LOOKUP_ELEM: u32 = 1;
    pub const MAP_UPDATE_ELEM: u32 = 2;
    pub const MAP_DELETE_ELEM: u32 = 3;
    pub const TAIL_CALL: u32 = 12;
    pub const SK_LOOKUP_TCP: u32 = 84;
    pub const SK_LOOKUP_UDP: u32 = 85;
    pub const SK_RELEASE: u32 = 86;
    pub const SPIN_LOCK: u32 = 93;
    pub const SPIN_UNLOCK: u32 = 94;
}

/// The catalog of helper prototypes, consumed narrowly (§6): "per-program-type
/// helper catalogs" live outside the verifier proper.
pub trait HelperCatalog {
    fn proto(&self, func_id: u32) -> Option<HelperProto>;
}

/// `true` iff `func_id` is one of the two reference-acquiring helpers (§4.4).
pub fn is_acquire_helper(func_id: u32) -> bool {
    matches!(func_id, ids::SK_LOOKUP_TCP | ids::SK_LOOKUP_UDP)
}

/// `true` iff `func_id` is the release helper (§4.4).
pub fn is_release_helper(func_id: u32) -> bool {
    func_id == ids::SK_RELEASE
}

/// Validate that an actual register's kind satisfies a declared `ArgKind`
/// (§4.6 item 1). Returns `Ok(())` or the taxonomy reason to reject with.
pub fn check_arg_kind(reg_idx: u8, expected: ArgKind, actual: &RegKind) -> Result<(), RejectReason> {
    let ok = match expected {
        ArgKind::None => true,
        ArgKind::AnyScalar | ArgKind::ConstSize => matches!(actual, RegKind::Scalar),
        ArgKind::MemPtr | ArgKind::UninitMemPtr => actual.is_pointer() && !actual.is_nullable(),
        ArgKind::MemSize => matches!(actual, RegKind::Scalar),
        ArgKind::MapPtr => matches!(actual, RegKind::ConstMap { .. }),
        ArgKind::MapKeyPtr | ArgKind::MapValuePtr => {
            matches!(actual, RegKind::Stack | RegKind::MapValue { .. })
        }
        ArgKind::ReleasableRef => matches!(actual, RegKind::Socket),
        ArgKind::Exact(family) => family.matches(actual),
    };
    if ok {
        Ok(())
    } else {
        Err(RejectReason::KindMismatch {
            reg: reg_idx,
            expected: expected_name(expected),
            got: kind_name(actual),
        })
    }
}

fn expected_name(k: ArgKind) -> &'static str {
    match k {
        ArgKind::None => "unused",
        ArgKind::AnyScalar => "scalar",
        ArgKind::ConstSize => "constant scalar",
        ArgKind::MemPtr => "memory pointer",
        ArgKind::MemSize => "size scalar",
        ArgKind::UninitMemPtr => "uninitialized memory pointer",
        ArgKind::MapPtr => "map pointer",
        ArgKind::MapKeyPtr => "map key pointer",
        ArgKind::MapValuePtr => "map value pointer",
        ArgKind::ReleasableRef => "acquired reference",
        ArgKind::Exact(_) => "specific pointer kind",
    }
}

fn kind_name(k: &RegKind) -> &'static str {
    match k {
        RegKind::Uninit => "uninit",
        RegKind::Scalar => "scalar",
        RegKind::Ctx => "ctx",
        RegKind::ConstMap { .. } => "const_map",
        RegKind::MapValue { .. } => "map_value",
        RegKind::MapValueOrNull { .. } => "map_value_or_null",
        RegKind::Stack => "stack",
        RegKind::Packet => "packet",
        RegKind::PacketMeta => "packet_meta",
        RegKind::PacketEnd => "packet_end",
        RegKind::FlowKeys => "flow_keys",
        RegKind::Socket => "socket",
        RegKind::SocketOrNull => "socket_or_null",
        RegKind::SockCommon => "sock_common",
        RegKind::SockCommonOrNull => "sock_common_or_null",
        RegKind::TcpSock => "tcp_sock",
        RegKind::TcpSockOrNull => "tcp_sock_or_null",
        RegKind::TpBuffer => "tp_buffer",
    }
}

/// Helpers may declare at most one raw-mode and one reference-typed
/// argument (§4.6 item 3).
pub fn check_arity_rules(proto: &HelperProto) -> Result<(), RejectReason> {
    let raw_count = proto.args.iter().filter(|a| matches!(a, ArgKind::UninitMemPtr)).count();
    let ref_count = proto.args.iter().filter(|a| matches!(a, ArgKind::ReleasableRef)).count();
    if raw_count > 1 || ref_count > 1 {
        return Err(RejectReason::MalformedInstruction);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_matches_any_scalar() {
        assert!(check_arg_kind(1, ArgKind::AnyScalar, &RegKind::Scalar).is_ok());
        assert!(check_arg_kind(1, ArgKind::AnyScalar, &RegKind::Ctx).is_err());
    }

    #[test]
    fn releasable_ref_requires_non_null_socket() {
        assert!(check_arg_kind(1, ArgKind::ReleasableRef, &RegKind::Socket).is_ok());
        assert!(check_arg_kind(1, ArgKind::ReleasableRef, &RegKind::SocketOrNull).is_err());
    }

    #[test]
    fn at_most_one_raw_and_one_ref_argument() {
        let proto = HelperProto {
            ret: RetKind::Scalar,
            args: [ArgKind::UninitMemPtr, ArgKind::UninitMemPtr, ArgKind::None, ArgKind::None, ArgKind::None],
            changes_pkt_data: false,
            pkt_access: false,
            gpl_only: false,
        };
        assert!(check_arity_rules(&proto).is_err());
    }
}
