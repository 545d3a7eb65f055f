//! Subgraph and port state machine primitives.
//!
//! Subgraphs move STOPPED → PREPARED → STARTED and back to STOPPED or
//! SUSPENDED. Ports carry the same set of states, downgraded against their
//! peer and against state propagated from boundary modules.

use core::ops::{BitOr, BitOrAssign};

/// State of a subgraph or a data/control port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TopoState {
    /// Not yet evaluated. Never wins a downgrade against a valid state.
    #[default]
    Invalid,
    /// Stopped. Lowest rank.
    Stopped,
    /// Prepared, buffers and formats may be set up.
    Prepared,
    /// Suspended, resources kept but no data flows.
    Suspended,
    /// Started. Highest rank.
    Started,
}

impl TopoState {
    /// Rank under the total order STARTED > PREPARED > SUSPENDED > STOPPED.
    ///
    /// Returns `None` for [`TopoState::Invalid`].
    pub fn rank(self) -> Option<u8> {
        match self {
            Self::Invalid => None,
            Self::Stopped => Some(0),
            Self::Suspended => Some(1),
            Self::Prepared => Some(2),
            Self::Started => Some(3),
        }
    }

    /// True for STOPPED and SUSPENDED, the two states in which a subgraph
    /// neither processes nor propagates.
    #[inline]
    pub fn is_stopped_or_suspended(self) -> bool {
        matches!(self, Self::Stopped | Self::Suspended)
    }

    /// Returns the downgraded state of `self` and `other`.
    ///
    /// Equal states return themselves. If either side is INVALID the result is
    /// INVALID. Otherwise the lower-ranked state wins.
    pub fn downgrade(self, other: Self) -> Self {
        if self == other {
            return self;
        }
        match (self.rank(), other.rank()) {
            (Some(a), Some(b)) => {
                if a <= b {
                    self
                } else {
                    other
                }
            }
            _ => Self::Invalid,
        }
    }

    /// Wire value used in port-state set-params sent to modules.
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Invalid => 0,
            Self::Stopped => 1,
            Self::Prepared => 2,
            Self::Started => 3,
            Self::Suspended => 4,
        }
    }

    /// Inverse of [`as_u32`](Self::as_u32). Unknown values map to INVALID.
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Stopped,
            2 => Self::Prepared,
            3 => Self::Started,
            4 => Self::Suspended,
            _ => Self::Invalid,
        }
    }
}

/// OR-able set of graph-management operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SgOps(u32);

impl SgOps {
    /// No operation.
    pub const NONE: Self = Self(0);
    /// Flush buffered data.
    pub const FLUSH: Self = Self(0x1);
    /// Start processing.
    pub const START: Self = Self(0x4);
    /// Prepare buffers and formats.
    pub const PREPARE: Self = Self(0x8);
    /// Stop processing.
    pub const STOP: Self = Self(0x10);
    /// Free resources.
    pub const CLOSE: Self = Self(0x20);
    /// Drop peer references without freeing memory.
    pub const DISCONNECT: Self = Self(0x40);
    /// Suspend processing while keeping resources.
    pub const SUSPEND: Self = Self(0x80);

    /// Builds a set from its raw bits.
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True if every bit of `other` is set.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        other.0 != 0 && (self.0 & other.0) == other.0
    }

    /// True if any bit of `other` is set.
    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    /// Port state an operation drives ports to.
    ///
    /// START wins over STOP, STOP over PREPARE, PREPARE over SUSPEND. Anything
    /// else (flush, close, disconnect) does not name a state.
    pub fn to_port_state(self) -> TopoState {
        if self.intersects(Self::START) {
            TopoState::Started
        } else if self.intersects(Self::STOP) {
            TopoState::Stopped
        } else if self.intersects(Self::PREPARE) {
            TopoState::Prepared
        } else if self.intersects(Self::SUSPEND) {
            TopoState::Suspended
        } else {
            TopoState::Invalid
        }
    }
}

impl BitOr for SgOps {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for SgOps {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Data flow state of an input port, driven by EOS and data arrival.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DataFlowState {
    /// Waiting for first data, or after a flushing EOS went through.
    #[default]
    AtGap,
    /// Steady flow.
    Flowing,
}

/// Graph-utility bookkeeping status of a module, port or subgraph.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GuStatus {
    /// Nothing pending.
    #[default]
    Default,
    /// Created by the current command, not initialized by the container yet.
    New,
    /// Changed by the current command.
    Updated,
    /// Scheduled for destruction by the current command.
    Closing,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TopoState; 5] = [
        TopoState::Invalid,
        TopoState::Stopped,
        TopoState::Prepared,
        TopoState::Suspended,
        TopoState::Started,
    ];

    #[test]
    fn downgrade_equal_is_identity() {
        for s in ALL {
            assert_eq!(s.downgrade(s), s);
        }
    }

    #[test]
    fn downgrade_with_invalid_is_invalid() {
        assert_eq!(TopoState::Started.downgrade(TopoState::Invalid), TopoState::Invalid);
        assert_eq!(TopoState::Invalid.downgrade(TopoState::Stopped), TopoState::Invalid);
    }

    #[test]
    fn downgrade_picks_lower_rank() {
        assert_eq!(TopoState::Started.downgrade(TopoState::Prepared), TopoState::Prepared);
        assert_eq!(TopoState::Prepared.downgrade(TopoState::Suspended), TopoState::Suspended);
        assert_eq!(TopoState::Suspended.downgrade(TopoState::Stopped), TopoState::Stopped);
        assert_eq!(TopoState::Stopped.downgrade(TopoState::Started), TopoState::Stopped);
    }

    #[test]
    fn sg_op_to_port_state_priority() {
        assert_eq!((SgOps::START | SgOps::STOP).to_port_state(), TopoState::Started);
        assert_eq!((SgOps::STOP | SgOps::PREPARE).to_port_state(), TopoState::Stopped);
        assert_eq!((SgOps::PREPARE | SgOps::SUSPEND).to_port_state(), TopoState::Prepared);
        assert_eq!(SgOps::SUSPEND.to_port_state(), TopoState::Suspended);
        assert_eq!(SgOps::CLOSE.to_port_state(), TopoState::Invalid);
        assert_eq!(SgOps::NONE.to_port_state(), TopoState::Invalid);
    }

    #[test]
    fn sg_ops_bit_queries() {
        let ops = SgOps::STOP | SgOps::CLOSE;
        assert!(ops.contains(SgOps::STOP));
        assert!(!ops.contains(SgOps::STOP | SgOps::START));
        assert!(ops.intersects(SgOps::STOP | SgOps::START));
        assert_eq!(ops.bits(), 0x30);
        assert!(!ops.contains(SgOps::NONE));
    }

    #[test]
    fn wire_value_roundtrip() {
        for s in ALL {
            assert_eq!(TopoState::from_u32(s.as_u32()), s);
        }
    }
}
