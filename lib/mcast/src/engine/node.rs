// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The RDM node codec.
//!
//! An RDM line is 128 bits, addressed as two half-lines of an 8-bit
//! type tag plus a 64-bit body; `address & 1` selects the half. A
//! node occupies either one half-line or, for the wide variants, a
//! full even-aligned line whose upper half repeats the tag with
//! [`TAG_UPPER`] set -- so a walk that lands mid-node decodes as
//! corruption instead of garbage.
//!
//! All pointer fields are 20-bit half-line addresses; zero is the
//! "no next node" sentinel. A stored tag of zero ("invalid") decodes
//! as a corruption error, never as end-of-chain: end-of-chain is only
//! ever an explicit null pointer or an END-variant node.

use super::Result;
use super::hw::WriteOp;
use mcast_api::McError;
use mcast_api::RdmAddr;

pub const TAG_INVALID: u8 = 0;
pub const TAG_L1_RID: u8 = 1;
pub const TAG_L1_END: u8 = 2;
pub const TAG_L1_XID: u8 = 3;
pub const TAG_L1_ECMP: u8 = 4;
pub const TAG_L1_ECMP_XID: u8 = 5;
pub const TAG_ECMP_VEC: u8 = 6;
pub const TAG_L2_PORT18: u8 = 7;
pub const TAG_L2_PORT72: u8 = 8;
pub const TAG_L2_LAG: u8 = 9;

/// Set on the upper half-line of a full-line node.
pub const TAG_UPPER: u8 = 0x80;

/// A decoded RDM node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RdmNode {
    /// L1 with a successor in the MGID chain.
    L1Rid { next_l1: RdmAddr, next_l2: RdmAddr, rid: u16 },
    /// L1 at the tail of the MGID chain.
    L1RidEnd { next_l2: RdmAddr, rid: u16 },
    /// L1 carrying an exclusion id (full line).
    L1RidXid { next_l1: RdmAddr, next_l2: RdmAddr, rid: u16, xid: u16 },
    /// L1 selecting an ECMP member via the per-version vectors.
    L1Ecmp { next_l1: RdmAddr, vec0: RdmAddr, vec1: RdmAddr },
    /// ECMP pointer carrying an exclusion id (full line).
    L1EcmpXid { next_l1: RdmAddr, vec0: RdmAddr, vec1: RdmAddr, xid: u16 },
    /// ECMP member-selection vector (full line): member block base,
    /// slot count and validity bits.
    EcmpVec { base: RdmAddr, len: u8, vector: u32 },
    /// L2 fan-out over one 18-port segment of the pipe.
    L2Port18 { next_l2: RdmAddr, seg: u8, ports: u32 },
    /// L2 fan-out over all 72 local ports (full line).
    L2Port72 { next_l2: RdmAddr, ports: u128 },
    /// L2 LAG member.
    L2Lag { next_l2: RdmAddr, lag: u8 },
}

fn bits(word: u64, lo: u32, len: u32) -> u64 {
    (word >> lo) & ((1u64 << len) - 1)
}

fn put(word: &mut u64, lo: u32, len: u32, val: u64) {
    debug_assert!(val < (1u64 << len));
    *word |= val << lo;
}

fn addr20(word: u64, lo: u32) -> RdmAddr {
    RdmAddr(bits(word, lo, 20) as u32)
}

impl RdmNode {
    pub fn tag(&self) -> u8 {
        match self {
            Self::L1Rid { .. } => TAG_L1_RID,
            Self::L1RidEnd { .. } => TAG_L1_END,
            Self::L1RidXid { .. } => TAG_L1_XID,
            Self::L1Ecmp { .. } => TAG_L1_ECMP,
            Self::L1EcmpXid { .. } => TAG_L1_ECMP_XID,
            Self::EcmpVec { .. } => TAG_ECMP_VEC,
            Self::L2Port18 { .. } => TAG_L2_PORT18,
            Self::L2Port72 { .. } => TAG_L2_PORT72,
            Self::L2Lag { .. } => TAG_L2_LAG,
        }
    }

    /// Does this node occupy a full line (both halves)?
    pub fn full_line(&self) -> bool {
        matches!(
            self,
            Self::L1RidXid { .. }
                | Self::L1EcmpXid { .. }
                | Self::EcmpVec { .. }
                | Self::L2Port72 { .. }
        )
    }

    pub fn next_l1(&self) -> Option<RdmAddr> {
        match *self {
            Self::L1Rid { next_l1, .. }
            | Self::L1RidXid { next_l1, .. }
            | Self::L1Ecmp { next_l1, .. }
            | Self::L1EcmpXid { next_l1, .. } => Some(next_l1),
            Self::L1RidEnd { .. } => Some(RdmAddr::NULL),
            _ => None,
        }
    }

    pub fn next_l2(&self) -> Option<RdmAddr> {
        match *self {
            Self::L1Rid { next_l2, .. }
            | Self::L1RidEnd { next_l2, .. }
            | Self::L1RidXid { next_l2, .. }
            | Self::L2Port18 { next_l2, .. }
            | Self::L2Port72 { next_l2, .. }
            | Self::L2Lag { next_l2, .. } => Some(next_l2),
            _ => None,
        }
    }

    /// Encode into the write descriptor for `addr`. Full-line nodes
    /// must sit on an even address.
    pub fn write_op(&self, addr: RdmAddr) -> WriteOp {
        let (mut lo, mut hi) = (0u64, 0u64);

        match *self {
            Self::L1Rid { next_l1, next_l2, rid } => {
                put(&mut lo, 0, 20, next_l1.0 as u64);
                put(&mut lo, 20, 20, next_l2.0 as u64);
                put(&mut lo, 40, 16, rid as u64);
            }
            Self::L1RidEnd { next_l2, rid } => {
                put(&mut lo, 20, 20, next_l2.0 as u64);
                put(&mut lo, 40, 16, rid as u64);
            }
            Self::L1RidXid { next_l1, next_l2, rid, xid } => {
                put(&mut lo, 0, 20, next_l1.0 as u64);
                put(&mut lo, 20, 20, next_l2.0 as u64);
                put(&mut lo, 40, 16, rid as u64);
                put(&mut hi, 0, 16, xid as u64);
            }
            Self::L1Ecmp { next_l1, vec0, vec1 } => {
                put(&mut lo, 0, 20, next_l1.0 as u64);
                put(&mut lo, 20, 20, vec0.0 as u64);
                put(&mut lo, 40, 20, vec1.0 as u64);
            }
            Self::L1EcmpXid { next_l1, vec0, vec1, xid } => {
                put(&mut lo, 0, 20, next_l1.0 as u64);
                put(&mut lo, 20, 20, vec0.0 as u64);
                put(&mut lo, 40, 20, vec1.0 as u64);
                put(&mut hi, 0, 16, xid as u64);
            }
            Self::EcmpVec { base, len, vector } => {
                put(&mut lo, 0, 20, base.0 as u64);
                put(&mut lo, 20, 7, len as u64);
                put(&mut hi, 0, 32, vector as u64);
            }
            Self::L2Port18 { next_l2, seg, ports } => {
                put(&mut lo, 0, 20, next_l2.0 as u64);
                put(&mut lo, 20, 3, seg as u64);
                put(&mut lo, 24, 18, ports as u64);
            }
            Self::L2Port72 { next_l2, ports } => {
                put(&mut lo, 0, 20, next_l2.0 as u64);
                put(&mut lo, 24, 8, (ports >> 64) as u64);
                hi = ports as u64;
            }
            Self::L2Lag { next_l2, lag } => {
                put(&mut lo, 0, 20, next_l2.0 as u64);
                put(&mut lo, 20, 8, lag as u64);
            }
        }

        if self.full_line() {
            debug_assert_eq!(addr.0 & 1, 0);
            WriteOp::RdmLine {
                addr,
                tag: [self.tag(), self.tag() | TAG_UPPER],
                body: [lo, hi],
            }
        } else {
            WriteOp::RdmHalf { addr, tag: self.tag(), body: lo }
        }
    }

    /// Does decoding `tag` require the upper half-line as well?
    pub fn tag_full_line(tag: u8) -> bool {
        matches!(
            tag,
            TAG_L1_XID | TAG_L1_ECMP_XID | TAG_ECMP_VEC | TAG_L2_PORT72
        )
    }

    /// Decode the node at `addr` from its lower half and, for
    /// full-line tags, its upper half.
    pub fn decode(
        addr: RdmAddr,
        lower: (u8, u64),
        upper: Option<(u8, u64)>,
    ) -> Result<RdmNode> {
        let (tag, lo) = lower;

        if tag == TAG_INVALID {
            return Err(McError::Unexpected(format!(
                "invalid rdm node type at {}",
                addr
            )));
        }
        if tag & TAG_UPPER != 0 {
            return Err(McError::Unexpected(format!(
                "walk landed on upper half of a wide node at {}",
                addr
            )));
        }

        let hi = if Self::tag_full_line(tag) {
            let Some((utag, hi)) = upper else {
                return Err(McError::Unexpected(format!(
                    "wide node at {} missing upper half",
                    addr
                )));
            };
            if utag != tag | TAG_UPPER {
                return Err(McError::Unexpected(format!(
                    "torn wide node at {}: tags {:#x}/{:#x}",
                    addr, tag, utag
                )));
            }
            hi
        } else {
            0
        };

        let node = match tag {
            TAG_L1_RID => Self::L1Rid {
                next_l1: addr20(lo, 0),
                next_l2: addr20(lo, 20),
                rid: bits(lo, 40, 16) as u16,
            },
            TAG_L1_END => Self::L1RidEnd {
                next_l2: addr20(lo, 20),
                rid: bits(lo, 40, 16) as u16,
            },
            TAG_L1_XID => Self::L1RidXid {
                next_l1: addr20(lo, 0),
                next_l2: addr20(lo, 20),
                rid: bits(lo, 40, 16) as u16,
                xid: bits(hi, 0, 16) as u16,
            },
            TAG_L1_ECMP => Self::L1Ecmp {
                next_l1: addr20(lo, 0),
                vec0: addr20(lo, 20),
                vec1: addr20(lo, 40),
            },
            TAG_L1_ECMP_XID => Self::L1EcmpXid {
                next_l1: addr20(lo, 0),
                vec0: addr20(lo, 20),
                vec1: addr20(lo, 40),
                xid: bits(hi, 0, 16) as u16,
            },
            TAG_ECMP_VEC => Self::EcmpVec {
                base: addr20(lo, 0),
                len: bits(lo, 20, 7) as u8,
                vector: bits(hi, 0, 32) as u32,
            },
            TAG_L2_PORT18 => Self::L2Port18 {
                next_l2: addr20(lo, 0),
                seg: bits(lo, 20, 3) as u8,
                ports: bits(lo, 24, 18) as u32,
            },
            TAG_L2_PORT72 => Self::L2Port72 {
                next_l2: addr20(lo, 0),
                ports: ((bits(lo, 24, 8) as u128) << 64) | hi as u128,
            },
            TAG_L2_LAG => Self::L2Lag {
                next_l2: addr20(lo, 0),
                lag: bits(lo, 20, 8) as u8,
            },
            _ => {
                return Err(McError::Unexpected(format!(
                    "unknown rdm node type {:#x} at {}",
                    tag, addr
                )));
            }
        };

        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(node: RdmNode, addr: RdmAddr) {
        match node.write_op(addr) {
            WriteOp::RdmHalf { addr: a, tag, body } => {
                assert_eq!(a, addr);
                let got = RdmNode::decode(addr, (tag, body), None).unwrap();
                assert_eq!(got, node);
            }
            WriteOp::RdmLine { addr: a, tag, body } => {
                assert_eq!(a, addr);
                let got = RdmNode::decode(
                    addr,
                    (tag[0], body[0]),
                    Some((tag[1], body[1])),
                )
                .unwrap();
                assert_eq!(got, node);
            }
            op => panic!("unexpected descriptor: {:?}", op),
        }
    }

    #[test]
    fn codec_round_trips() {
        let a = |v| RdmAddr(v);
        round_trip(
            RdmNode::L1Rid { next_l1: a(0x2), next_l2: a(0xffff0), rid: 9 },
            a(0x10),
        );
        round_trip(RdmNode::L1RidEnd { next_l2: a(0x4), rid: 0xffff }, a(0x11));
        round_trip(
            RdmNode::L1RidXid {
                next_l1: a(0x8),
                next_l2: a(0xa),
                rid: 7,
                xid: 0x1234,
            },
            a(0x20),
        );
        round_trip(
            RdmNode::L1Ecmp { next_l1: a(0), vec0: a(0x30), vec1: a(0x32) },
            a(0x15),
        );
        round_trip(
            RdmNode::L1EcmpXid {
                next_l1: a(0x6),
                vec0: a(0x30),
                vec1: a(0x32),
                xid: 0xffff,
            },
            a(0x22),
        );
        round_trip(
            RdmNode::EcmpVec { base: a(0x40), len: 32, vector: 0xdead_beef },
            a(0x24),
        );
        round_trip(
            RdmNode::L2Port18 { next_l2: a(0x9), seg: 3, ports: 0x3ffff },
            a(0x17),
        );
        round_trip(
            RdmNode::L2Port72 {
                next_l2: a(0xb),
                ports: (0xffu128 << 64) | 0x8000_0000_0000_0001,
            },
            a(0x26),
        );
        round_trip(RdmNode::L2Lag { next_l2: a(0), lag: 255 }, a(0x19));
    }

    #[test]
    fn invalid_tag_is_corruption_not_eoc() {
        let err =
            RdmNode::decode(RdmAddr(5), (TAG_INVALID, 0), None).unwrap_err();
        assert!(matches!(err, McError::Unexpected(_)));

        let err = RdmNode::decode(RdmAddr(5), (0x7f, 0), None).unwrap_err();
        assert!(matches!(err, McError::Unexpected(_)));
    }

    #[test]
    fn upper_half_landing_is_corruption() {
        let err = RdmNode::decode(
            RdmAddr(7),
            (TAG_ECMP_VEC | TAG_UPPER, 0),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, McError::Unexpected(_)));
    }

    #[test]
    fn torn_wide_node_detected() {
        let err = RdmNode::decode(
            RdmAddr(8),
            (TAG_L1_XID, 0),
            Some((TAG_L2_LAG | TAG_UPPER, 0)),
        )
        .unwrap_err();
        assert!(matches!(err, McError::Unexpected(_)));
    }
}
