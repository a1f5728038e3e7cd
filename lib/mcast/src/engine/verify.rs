// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The consistency verifier.
//!
//! Walks live hardware state and compares it against the shadow,
//! entry by entry: the MIT root, every L1 line, the L2 chain reached
//! from each L1, ECMP vectors and member blocks, and each mirror
//! table. The walk follows hardware pointers wherever the hardware
//! has them, so a dangling or torn node surfaces as a mismatch, and
//! is bounded by the RDM size so a corrupt cycle cannot hang it.
//!
//! Mismatch indexes pack the subdevice into bits 24 and up; the low
//! bits are the half-line address for RDM compares, or a
//! table-specific sub-address for table compares.

use super::Result;
use super::addr::AddrMap;
use super::ecmp::EcmpMgr;
use super::hw::PortMask;
use super::hw::Transport;
use super::hw::WriteOp;
use super::node::RdmNode;
use super::tables::MirrorTables;
use super::tree::ReplTree;
use mcast_api::LagId;
use mcast_api::McError;
use mcast_api::Mgid;
use mcast_api::NodeHdl;
use mcast_api::Pipe;
use mcast_api::PortId;
use mcast_api::RdmAddr;
use mcast_api::TableId;
use mcast_api::VerifyMismatch;
use mcast_api::VerifyResp;
use mcast_api::Yid;

fn half_u128((tag, body): (u8, u64)) -> u128 {
    ((tag as u128) << 64) | body as u128
}

struct Check {
    compared: u32,
    mismatches: Vec<VerifyMismatch>,
}

impl Check {
    fn new() -> Self {
        Self { compared: 0, mismatches: Vec::new() }
    }

    fn cmp(&mut self, index: u32, shadow: u128, hw: u128) {
        self.compared += 1;
        if shadow != hw {
            self.mismatches.push(VerifyMismatch { index, shadow, hw });
        }
    }

    fn into_resp(self, name: String) -> VerifyResp {
        VerifyResp {
            name,
            compared: self.compared,
            mismatches: self.mismatches,
        }
    }
}

fn sd_index(sd: u8, low: u32) -> u32 {
    ((sd as u32) << 24) | low
}

/// Compare one staged-image descriptor against the half-lines the
/// hardware holds at its address.
fn cmp_image(
    chk: &mut Check,
    hw: &dyn Transport,
    sd: u8,
    op: &WriteOp,
) -> Result<()> {
    match *op {
        WriteOp::RdmHalf { addr, tag, body } => {
            let read = hw.read_rdm_half(sd, addr)?;
            chk.cmp(
                sd_index(sd, addr.0),
                half_u128((tag, body)),
                half_u128(read),
            );
        }
        WriteOp::RdmLine { addr, tag, body } => {
            for half in 0..2u32 {
                let a = RdmAddr(addr.0 + half);
                let read = hw.read_rdm_half(sd, a)?;
                chk.cmp(
                    sd_index(sd, a.0),
                    half_u128((tag[half as usize], body[half as usize])),
                    half_u128(read),
                );
            }
        }
        _ => unreachable!("rdm image descriptors only"),
    }
    Ok(())
}

fn read_node(hw: &dyn Transport, sd: u8, addr: RdmAddr) -> Result<RdmNode> {
    let lower = hw.read_rdm_half(sd, addr)?;
    let upper = if RdmNode::tag_full_line(lower.0) {
        Some(hw.read_rdm_half(sd, RdmAddr(addr.0 + 1))?)
    } else {
        None
    };
    RdmNode::decode(addr, lower, upper)
}

/// Follow the hardware L1 chain from the root the hardware holds,
/// counting nodes, and compare against the software member count.
/// Bounded by the RDM size, so a pointer cycle shows up as a count
/// mismatch instead of a hang.
fn walk_l1(
    chk: &mut Check,
    map: &AddrMap,
    hw: &dyn Transport,
    sd: u8,
    root: RdmAddr,
    expect: u32,
) -> Result<()> {
    let mut found = 0u32;
    let mut cur = root;
    while !cur.is_null() && found <= map.rdm_half_lines() {
        let Ok(node) = read_node(hw, sd, cur) else {
            found += 1;
            break;
        };
        match node {
            RdmNode::L1Rid { .. }
            | RdmNode::L1RidEnd { .. }
            | RdmNode::L1RidXid { .. }
            | RdmNode::L1Ecmp { .. }
            | RdmNode::L1EcmpXid { .. } => {
                found += 1;
                cur = node.next_l1().unwrap_or(RdmAddr::NULL);
            }
            _ => {
                found += 1;
                break;
            }
        }
    }
    chk.cmp(sd_index(sd, root.0), expect as u128, found as u128);
    Ok(())
}

/// Follow the hardware L2 chain from `head`, counting nodes. Decode
/// failures and over-long chains are mismatches, not errors.
fn walk_l2(
    chk: &mut Check,
    map: &AddrMap,
    hw: &dyn Transport,
    sd: u8,
    head: RdmAddr,
    expect: u32,
) -> Result<()> {
    let mut found = 0u32;
    let mut cur = head;
    while !cur.is_null() && found <= map.rdm_half_lines() {
        // An undecodable or non-L2 node in an L2 chain is corruption;
        // count it as a divergent node and stop.
        let Ok(node) = read_node(hw, sd, cur) else {
            found += 1;
            break;
        };
        match node {
            RdmNode::L2Port18 { .. }
            | RdmNode::L2Port72 { .. }
            | RdmNode::L2Lag { .. } => {
                found += 1;
                cur = node.next_l2().unwrap_or(RdmAddr::NULL);
            }
            _ => {
                found += 1;
                break;
            }
        }
    }
    chk.cmp(sd_index(sd, head.0), expect as u128, found as u128);
    Ok(())
}

/// Verify one L1 node's line image and its L2 chain in one pipe.
fn check_l1(
    chk: &mut Check,
    map: &AddrMap,
    tree: &ReplTree,
    hw: &dyn Transport,
    sd: u8,
    hdl: NodeHdl,
    pipe: Pipe,
) -> Result<()> {
    let mut expected = Vec::with_capacity(1);
    tree.reencode_l1(hdl, pipe, &mut expected)?;
    for op in &expected {
        cmp_image(chk, hw, sd, op)?;
    }

    let node = tree.node(hdl)?;
    if let Some(hw_rec) = node.hw_pipe(pipe) {
        if let Some((head, _)) = hw_rec.l2.first() {
            walk_l2(chk, map, hw, sd, *head, hw_rec.l2.len() as u32)?;
        }
    }
    Ok(())
}

/// Walk one MGID's replication tree as the hardware sees it and
/// compare every node against the shadow.
pub fn verify_mgid(
    map: &AddrMap,
    tree: &ReplTree,
    ecmp: &EcmpMgr,
    hw: &dyn Transport,
    mgid: Mgid,
) -> Result<VerifyResp> {
    let entry = tree.mgid_entry(mgid).ok_or_else(|| {
        McError::InvalidArgument(format!("no such mgid: {:?}", mgid))
    })?;

    let mut chk = Check::new();
    for sd in 0..hw.subdevs() {
        for pipe in (0..map.pipes).map(Pipe) {
            // The MIT root.
            let expected = tree.mit_root(pipe, mgid);
            let row = hw.read_mit_row(sd, pipe.0, map.mit_row(mgid))?;
            let actual = row.0[map.mit_slot(mgid) as usize];
            chk.cmp(
                sd_index(sd, expected.0),
                expected.0 as u128,
                actual as u128,
            );

            // Every L1 on this pipe's chain, in chain order.
            let mut count = 0u32;
            let mut cur = entry.heads[pipe.0 as usize];
            while let Some(hdl) = cur {
                count += 1;
                check_l1(&mut chk, map, tree, hw, sd, hdl, pipe)?;

                let node = tree.node(hdl)?;
                if let Some(grp) = node.ecmp_ptr {
                    check_ecmp(
                        &mut chk, map, tree, ecmp, hw, sd, grp, pipe,
                    )?;
                }
                cur = node.hw_pipe(pipe).and_then(|h| h.next);
            }

            // Independent reachability count from the root the
            // hardware actually holds.
            walk_l1(&mut chk, map, hw, sd, RdmAddr(actual), count)?;
        }
    }

    Ok(chk.into_resp(format!("mgid {:#x}", mgid.0)))
}

/// Verify an ECMP group's vectors, member block and member chains in
/// one pipe.
fn check_ecmp(
    chk: &mut Check,
    map: &AddrMap,
    tree: &ReplTree,
    ecmp: &EcmpMgr,
    hw: &dyn Transport,
    sd: u8,
    grp: mcast_api::EcmpHdl,
    pipe: Pipe,
) -> Result<()> {
    let g = ecmp.grp(grp)?;
    let p = &g.pipes[pipe.0 as usize];

    let image = RdmNode::EcmpVec {
        base: p.base,
        len: g.slots(),
        vector: g.bitmap(),
    };
    for vec in p.vec {
        cmp_image(chk, hw, sd, &image.write_op(vec))?;
    }

    for (slot, mbr) in g.mbrs.iter().enumerate() {
        let Some(mbr) = *mbr else { continue };
        // The member line sits in the group block; its image and
        // chain verify like any L1.
        debug_assert_eq!(
            tree.node(mbr)?.hw_pipe(pipe).map(|h| h.addr),
            Some(RdmAddr(p.base.0 + 2 * slot as u32))
        );
        check_l1(chk, map, tree, hw, sd, mbr, pipe)?;
    }
    Ok(())
}

/// Compare one table's shadow against every subdevice, entry by
/// entry.
pub fn verify_table(
    map: &AddrMap,
    tables: &MirrorTables,
    tree: &ReplTree,
    hw: &dyn Transport,
    tbl: TableId,
) -> Result<VerifyResp> {
    let mut chk = Check::new();
    for sd in 0..hw.subdevs() {
        match tbl {
            TableId::Pvt => {
                for ver in 0..2u8 {
                    for mgid in 0..map.mgids {
                        let m = Mgid(mgid as u16);
                        let read = hw.read_pvt(sd, ver, m.0)?;
                        chk.cmp(
                            sd_index(sd, (mgid << 1) | ver as u32),
                            tables.pvt(ver, m) as u128,
                            read as u128,
                        );
                    }
                }
            }
            TableId::Tvt => {
                for mgid in 0..map.mgids {
                    let m = Mgid(mgid as u16);
                    let read = hw.read_tvt(sd, m.0)?;
                    chk.cmp(
                        sd_index(sd, mgid),
                        tables.tvt(m) as u128,
                        read as u128,
                    );
                }
            }
            TableId::Pmt => {
                for ver in 0..2u8 {
                    for yid in 0..map.yids {
                        let shadow = tables.pmt(ver, Yid(yid));
                        let read = hw.read_pmt(sd, ver, yid)?;
                        cmp_mask(
                            &mut chk,
                            sd,
                            ((yid as u32) << 4) | ((ver as u32) << 3),
                            &shadow,
                            &read,
                        );
                    }
                }
            }
            TableId::Lit => {
                for ver in 0..2u8 {
                    for lag in 0..map.lags {
                        let shadow = tables.lit(ver, LagId(lag as u8));
                        let read = hw.read_lit(sd, ver, lag as u8)?;
                        cmp_mask(
                            &mut chk,
                            sd,
                            ((lag as u32) << 4) | ((ver as u32) << 3),
                            &shadow,
                            &read,
                        );
                    }
                }
            }
            TableId::LitNp => {
                for lag in 0..map.lags {
                    let (left, right) = tables.lit_np(LagId(lag as u8));
                    let (hl, hr) = hw.read_lit_np(sd, lag as u8)?;
                    chk.cmp(
                        sd_index(sd, lag as u32),
                        ((left as u128) << 16) | right as u128,
                        ((hl as u128) << 16) | hr as u128,
                    );
                }
            }
            TableId::Mit => {
                // Every root slot, live MGID or not: a stale root
                // left behind by a destroy is divergence too.
                for pipe in (0..map.pipes).map(Pipe) {
                    for mgid in (0..map.mgids).map(|m| Mgid(m as u16)) {
                        let shadow = tree.mit_root(pipe, mgid);
                        let row =
                            hw.read_mit_row(sd, pipe.0, map.mit_row(mgid))?;
                        let actual = row.0[map.mit_slot(mgid) as usize];
                        chk.cmp(
                            sd_index(
                                sd,
                                ((pipe.0 as u32) << 16) | mgid.0 as u32,
                            ),
                            shadow.0 as u128,
                            actual as u128,
                        );
                    }
                }
            }
            TableId::BackupPort => {
                for port in 0..map.ports() {
                    let shadow = tables.backup(PortId(port));
                    let read = hw.read_backup_port(sd, port)?;
                    chk.cmp(
                        sd_index(sd, port as u32),
                        shadow.0 as u128,
                        read as u128,
                    );
                }
            }
            TableId::PortMask => {
                for ver in 0..2u8 {
                    let shadow = tables.port_mask(ver);
                    let read = hw.read_port_mask(sd, ver)?;
                    cmp_mask(&mut chk, sd, (ver as u32) << 3, &shadow, &read);
                }
            }
            TableId::GlobalRid => {
                let read = hw.read_global_rid(sd)?;
                chk.cmp(
                    sd_index(sd, 0),
                    tables.global_rid().0 as u128,
                    read as u128,
                );
            }
        }
    }

    Ok(chk.into_resp(tbl.name().to_string()))
}

/// Masks are wider than a mismatch record; compare per 64-bit word,
/// with the word index in the low bits.
fn cmp_mask(
    chk: &mut Check,
    sd: u8,
    base: u32,
    shadow: &PortMask,
    read: &PortMask,
) {
    for (word, (s, h)) in shadow.0.iter().zip(read.0.iter()).enumerate() {
        chk.cmp(sd_index(sd, base | word as u32), *s as u128, *h as u128);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::addr::Family;
    use crate::engine::hw::FakeTransport;
    use crate::engine::hw::LagMask;
    use crate::engine::rdm::RdmAllocator;
    use mcast_api::Rid;

    struct Fix {
        map: AddrMap,
        tree: ReplTree,
        ecmp: EcmpMgr,
        alloc: RdmAllocator,
        tables: MirrorTables,
        hw: FakeTransport,
    }

    fn fixture(family: Family) -> Fix {
        let map = AddrMap::new(family);
        Fix {
            tree: ReplTree::new(&map),
            ecmp: EcmpMgr::new(&map),
            alloc: RdmAllocator::new(&map),
            tables: MirrorTables::new(&map),
            hw: FakeTransport::new(&map),
            map,
        }
    }

    fn flush(fix: &Fix, wrl: &mut Vec<WriteOp>) {
        use crate::engine::hw::Transport;
        for op in wrl.drain(..) {
            for sd in 0..fix.hw.subdevs() {
                fix.hw.write(sd, &op).unwrap();
            }
        }
    }

    fn assoc_node(fix: &mut Fix, mgid: Mgid, rid: u16, port: u16) -> NodeHdl {
        let mut wrl = Vec::new();
        let mut ports = crate::engine::hw::PortMask::new();
        ports.set(port, true);
        let n =
            fix.tree.node_create(Rid(rid), ports, LagMask::new()).unwrap();
        fix.tree
            .associate(n, mgid, None, false, None, &mut fix.alloc, &mut wrl)
            .unwrap();
        flush(fix, &mut wrl);
        n
    }

    #[test]
    fn clean_tree_verifies_clean() {
        let mut fix = fixture(Family::Gen1);
        fix.tree.mgrp_create(Mgid(0x10)).unwrap();
        assoc_node(&mut fix, Mgid(0x10), 1, 3);
        assoc_node(&mut fix, Mgid(0x10), 2, 100);

        let resp =
            verify_mgid(&fix.map, &fix.tree, &fix.ecmp, &fix.hw, Mgid(0x10))
                .unwrap();
        assert!(resp.clean(), "mismatches: {:?}", resp.mismatches);
        assert!(resp.compared > 0);
    }

    #[test]
    fn corrupted_line_is_reported() {
        let mut fix = fixture(Family::Gen1);
        fix.tree.mgrp_create(Mgid(7)).unwrap();
        let n = assoc_node(&mut fix, Mgid(7), 1, 3);

        // Scribble over the node's L1 line behind the shadow's back.
        use crate::engine::hw::Transport;
        let addr = fix.tree.node(n).unwrap().hw_pipe(Pipe(0)).unwrap().addr;
        fix.hw
            .write(0, &WriteOp::RdmHalf { addr, tag: 0x7f, body: 0 })
            .unwrap();

        let resp =
            verify_mgid(&fix.map, &fix.tree, &fix.ecmp, &fix.hw, Mgid(7))
                .unwrap();
        assert!(!resp.clean());
        assert_eq!(resp.mismatches[0].index, addr.0);
    }

    #[test]
    fn table_divergence_is_reported() {
        let fix = fixture(Family::Gen2);
        use crate::engine::hw::Transport;

        // Shadow says zero; scribble one entry on one die only.
        fix.hw
            .write(1, &WriteOp::BackupPort { port: 12, backup: 9 })
            .unwrap();

        let resp = verify_table(
            &fix.map,
            &fix.tables,
            &fix.tree,
            &fix.hw,
            TableId::BackupPort,
        )
        .unwrap();
        assert_eq!(resp.mismatches.len(), 1);
        let mm = &resp.mismatches[0];
        assert_eq!(mm.index, (1 << 24) | 12);
        assert_eq!(mm.shadow, 0);
        assert_eq!(mm.hw, 9);
        assert_eq!(resp.compared, 2 * fix.map.ports() as u32);
    }

    #[test]
    fn stale_mit_root_is_reported() {
        let mut fix = fixture(Family::Gen1);
        fix.tree.mgrp_create(Mgid(0x10)).unwrap();
        let n = assoc_node(&mut fix, Mgid(0x10), 1, 3);
        let root = fix.tree.mit_root(Pipe(0), Mgid(0x10));
        assert!(!root.is_null());

        // Tear the association down but never flush: the hardware
        // keeps the old root.
        let mut wrl = Vec::new();
        fix.tree.dissociate(n, Mgid(0x10), &mut fix.alloc, &mut wrl).unwrap();

        let resp = verify_table(
            &fix.map,
            &fix.tables,
            &fix.tree,
            &fix.hw,
            TableId::Mit,
        )
        .unwrap();
        assert!(!resp.clean());
        let mm = &resp.mismatches[0];
        assert_eq!(mm.index, 0x10);
        assert_eq!(mm.shadow, 0);
        assert_eq!(mm.hw, root.0 as u128);
    }

    #[test]
    fn l1_pointer_cycle_is_bounded_and_reported() {
        let mut fix = fixture(Family::Gen1);
        fix.tree.mgrp_create(Mgid(9)).unwrap();
        let n = assoc_node(&mut fix, Mgid(9), 1, 3);

        // Point the node's line back at itself behind the shadow's
        // back; the reachability walk must terminate and report.
        use crate::engine::hw::Transport;
        let addr = fix.tree.node(n).unwrap().hw_pipe(Pipe(0)).unwrap().addr;
        let op =
            RdmNode::L1Rid { next_l1: addr, next_l2: RdmAddr::NULL, rid: 1 }
                .write_op(addr);
        fix.hw.write(0, &op).unwrap();

        let resp =
            verify_mgid(&fix.map, &fix.tree, &fix.ecmp, &fix.hw, Mgid(9))
                .unwrap();
        assert!(!resp.clean());
    }

    #[test]
    fn verify_covers_ecmp_members() {
        let mut fix = fixture(Family::Gen1);
        let mut wrl = Vec::new();
        fix.tree.mgrp_create(Mgid(3)).unwrap();
        let grp = fix.ecmp.alloc(&mut fix.alloc, &mut wrl).unwrap();

        let mut ports = crate::engine::hw::PortMask::new();
        ports.set(5, true);
        let m =
            fix.tree.node_create(Rid(9), ports, LagMask::new()).unwrap();
        fix.ecmp
            .mbr_add(grp, m, &mut fix.tree, &mut fix.alloc, &mut wrl)
            .unwrap();
        fix.ecmp
            .associate(
                grp,
                Mgid(3),
                None,
                false,
                &mut fix.tree,
                &mut fix.alloc,
                &mut wrl,
            )
            .unwrap();
        flush(&fix, &mut wrl);

        let resp =
            verify_mgid(&fix.map, &fix.tree, &fix.ecmp, &fix.hw, Mgid(3))
                .unwrap();
        assert!(resp.clean(), "mismatches: {:?}", resp.mismatches);
    }
}
