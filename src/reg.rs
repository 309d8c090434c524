//! Register kinds and the per-register abstract state (§3 "Register kind").

use bitflags::bitflags;

use crate::scalar::Scalar;
use crate::tnum::Tnum;
use crate::types::Word;

bitflags! {
    /// Liveness flags recorded per register and per stack slot, consumed by
    /// pruning (§4.8) and by liveness propagation up the parent chain.
    #[derive(Default)]
    pub struct Liveness: u8 {
        /// The register/slot has been read since it was last written in this state.
        const READ = 0b01;
        /// The register/slot has been written in this state.
        const WRITTEN = 0b10;
    }
}

/// The sum type of everything a register can hold. Each non-scalar variant
/// carries exactly the payload it needs; there is no "optional field that
/// only matters for some kinds" the way a tagged C union would force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::EnumDiscriminants)]
#[strum_discriminants(name(RegKindTag))]
pub enum RegKind {
    /// Never written; reading it is always a reject.
    Uninit,
    /// An ordinary numeric value: see [`Register::scalar`] for its payload.
    Scalar,
    /// Pointer to the program-type-defined context structure.
    Ctx,
    /// Pointer to map metadata (returned by a map-lookup helper's first half).
    ConstMap { map_id: u32 },
    /// Pointer to a map value slot, proven non-null.
    MapValue { map_id: u32 },
    /// Pointer to a map value slot, possibly null (fresh lookup result).
    MapValueOrNull { map_id: u32 },
    /// Pointer into this frame's stack.
    Stack,
    /// Pointer into packet data.
    Packet,
    /// Pointer into packet metadata.
    PacketMeta,
    /// One-past-the-end packet pointer; opaque, only comparable.
    PacketEnd,
    /// Pointer to a flow-keys structure.
    FlowKeys,
    /// Acquired socket reference, proven non-null.
    Socket,
    /// Fresh acquire-helper result, possibly null.
    SocketOrNull,
    /// Read-only socket-common pointer.
    SockCommon,
    /// Read-only socket-common pointer, possibly null.
    SockCommonOrNull,
    /// Read-only TCP socket pointer.
    TcpSock,
    /// Read-only TCP socket pointer, possibly null.
    TcpSockOrNull,
    /// Pointer to a temporary trace buffer.
    TpBuffer,
}

impl RegKind {
    /// `true` for any pointer-shaped kind (i.e. everything but scalar/uninit).
    pub fn is_pointer(&self) -> bool {
        !matches!(self, RegKind::Uninit | RegKind::Scalar)
    }

    /// `true` iff a null value is a live possibility for this kind.
    pub fn is_nullable(&self) -> bool {
        matches!(
            self,
            RegKind::MapValueOrNull { .. }
                | RegKind::SocketOrNull
                | RegKind::SockCommonOrNull
                | RegKind::TcpSockOrNull
        )
    }

    /// The non-null counterpart of a nullable kind, reached by the
    /// not-null branch of a null check; identical otherwise.
    pub fn narrow_not_null(self) -> RegKind {
        match self {
            RegKind::MapValueOrNull { map_id } => RegKind::MapValue { map_id },
            RegKind::SocketOrNull => RegKind::Socket,
            RegKind::SockCommonOrNull => RegKind::SockCommon,
            RegKind::TcpSockOrNull => RegKind::TcpSock,
            other => other,
        }
    }

    /// `true` iff pointer arithmetic on this kind is ever legal (§4.3):
    /// stack, map value, and packet kinds only.
    pub fn allows_arithmetic(&self) -> bool {
        matches!(self, RegKind::Stack | RegKind::MapValue { .. } | RegKind::Packet | RegKind::PacketMeta)
    }

    /// `true` iff this kind is one of the packet-family kinds whose `range`
    /// field is meaningful.
    pub fn is_packet(&self) -> bool {
        matches!(self, RegKind::Packet | RegKind::PacketMeta)
    }

    /// `true` iff a register of this kind is safe to spill in full (§4.2
    /// item 5): any pointer kind that is part of the spillable set.
    pub fn is_spillable(&self) -> bool {
        matches!(
            self,
            RegKind::MapValue { .. }
                | RegKind::MapValueOrNull { .. }
                | RegKind::ConstMap { .. }
                | RegKind::Stack
                | RegKind::Ctx
                | RegKind::Packet
                | RegKind::PacketMeta
                | RegKind::PacketEnd
                | RegKind::FlowKeys
                | RegKind::Socket
                | RegKind::SocketOrNull
                | RegKind::SockCommon
                | RegKind::SockCommonOrNull
                | RegKind::TcpSock
                | RegKind::TcpSockOrNull
                | RegKind::TpBuffer
        )
    }
}

/// Per-register abstract state (§3 "Register kind" payload).
#[derive(Debug, Clone, PartialEq)]
pub struct Register {
    pub kind: RegKind,
    /// Accumulated constant part of a pointer offset.
    pub fixed_off: i32,
    /// Variable part of a pointer offset, or the value itself for scalars.
    pub var_off: Tnum,
    /// Numeric bounds, meaningful for scalars and as the variable-offset
    /// bound for pointer kinds.
    pub bounds: crate::bounds::Bounds,
    /// Proven-readable bytes from a packet pointer's current position,
    /// widened only by `packet_end` comparisons.
    pub range: u32,
    /// Provenance id correlating copies of the same lookup/acquire/base.
    pub id: u32,
    /// Which call frame's stack this pointer addresses (stack kind only).
    pub frame_no: usize,
    pub live: Liveness,
}

impl Register {
    /// A fresh, never-written register.
    pub fn uninit() -> Self {
        Register {
            kind: RegKind::Uninit,
            fixed_off: 0,
            var_off: Tnum::UNKNOWN,
            bounds: crate::bounds::Bounds::UNBOUNDED,
            range: 0,
            id: 0,
            frame_no: 0,
            live: Liveness::empty(),
        }
    }

    /// A scalar register holding the given abstract numeric value.
    pub fn from_scalar(s: Scalar) -> Self {
        Register {
            kind: RegKind::Scalar,
            fixed_off: 0,
            var_off: s.tnum,
            bounds: s.bounds,
            range: 0,
            id: 0,
            frame_no: 0,
            live: Liveness::empty(),
        }
    }

    /// A scalar holding a known constant.
    pub fn scalar_const(v: Word) -> Self {
        Register::from_scalar(Scalar::constant(v))
    }

    /// A scalar with no known information (top of the domain).
    pub fn scalar_unknown() -> Self {
        Register::from_scalar(Scalar::unknown())
    }

    /// The read-only frame-pointer register R10 for a given frame.
    pub fn frame_pointer(frame_no: usize) -> Self {
        Register {
            kind: RegKind::Stack,
            fixed_off: 0,
            var_off: Tnum::constant(0),
            bounds: crate::bounds::Bounds::constant(0),
            range: 0,
            id: 0,
            frame_no,
            live: Liveness::empty(),
        }
    }

    /// View this register's numeric payload as a [`Scalar`] (meaningful for
    /// scalar kind, and for the variable-offset part of pointer kinds).
    pub fn as_scalar(&self) -> Scalar {
        Scalar { tnum: self.var_off, bounds: self.bounds }
    }

    /// Overwrite the numeric payload from a [`Scalar`], keeping `kind`.
    pub fn set_scalar(&mut self, s: Scalar) {
        self.var_off = s.tnum;
        self.bounds = s.bounds;
    }

    pub fn mark_read(&mut self) {
        self.live |= Liveness::READ;
    }

    pub fn mark_written(&mut self) {
        self.live = Liveness::WRITTEN;
    }

    /// `true` iff this register is definitely null (for nullable kinds with
    /// a constant-zero variable offset and zero fixed offset) — used by the
    /// null-check transition in reference tracking (§4.4) and map-value
    /// null checks.
    pub fn is_definitely_null(&self) -> bool {
        self.kind.is_nullable() && self.fixed_off == 0 && self.var_off.as_const() == Some(0)
    }
}

impl Default for Register {
    fn default() -> Self {
        Register::uninit()
    }
}
