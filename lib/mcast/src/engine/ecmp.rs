// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The ECMP group manager.
//!
//! A group is a bounded member set materialized, per pipe, as a
//! contiguous block of member L1 lines plus a selection vector the
//! hardware indexes by packet hash. Every membership change rebuilds
//! the vector (and, on growth, the member block) in fresh RDM and
//! then re-points each associating L1 node with a single line write,
//! so a walker sees either the whole old or the whole new selection
//! state -- the RDM itself is never double-buffered.

use super::ECMP_MAX_MBRS;
use super::Result;
use super::addr::AddrMap;
use super::arena::Arena;
use super::hw::WriteOp;
use super::node::RdmNode;
use super::rdm::RdmAllocator;
use super::tree::EcmpMbrLink;
use super::tree::L1Hw;
use super::tree::L2Run;
use super::tree::ReplTree;
use mcast_api::EcmpHdl;
use mcast_api::McError;
use mcast_api::Mgid;
use mcast_api::NodeHdl;
use mcast_api::Pipe;
use mcast_api::RdmAddr;
use mcast_api::Xid;

/// Vector lines are full lines.
const VEC_RUN_LOG2: u8 = 1;

/// A group's per-pipe RDM state.
#[derive(Clone, Debug)]
pub struct EcmpPipe {
    /// Member-block base: `1 << slots_log2` member lines.
    pub base: RdmAddr,
    pub slots_log2: u8,
    /// Per-version selection vector addresses.
    pub vec: [RdmAddr; 2],
}

impl EcmpPipe {
    fn block_log2(&self) -> u8 {
        // Each slot is a full line (two half-lines).
        self.slots_log2 + 1
    }

    fn slot_addr(&self, slot: u8) -> RdmAddr {
        RdmAddr(self.base.0 + 2 * slot as u32)
    }
}

pub struct EcmpGroup {
    pub mbrs: [Option<NodeHdl>; ECMP_MAX_MBRS],
    pub head: Option<NodeHdl>,
    pub count: u8,
    pub pipes: Vec<EcmpPipe>,
    /// The association pointer nodes, one per bound MGID.
    pub assoc: Vec<NodeHdl>,
}

impl EcmpGroup {
    pub fn slots(&self) -> u8 {
        1 << self.pipes[0].slots_log2
    }

    /// The validity bitmap: bit per occupied slot.
    pub fn bitmap(&self) -> u32 {
        let mut bits = 0u32;
        for (slot, mbr) in self.mbrs.iter().enumerate() {
            if mbr.is_some() {
                bits |= 1 << slot;
            }
        }
        bits
    }

    pub fn vec_addrs(&self) -> Vec<[RdmAddr; 2]> {
        self.pipes.iter().map(|p| p.vec).collect()
    }
}

pub struct EcmpMgr {
    map: AddrMap,
    grps: Arena<EcmpGroup>,
}

/// A member's list linkage. Its absence on a node the group still
/// names is torn internal state, reported rather than panicked on.
fn mbr_link(tree: &ReplTree, node: NodeHdl) -> Result<EcmpMbrLink> {
    tree.node(node)?.ecmp_mbr.ok_or_else(|| {
        McError::Unexpected(format!("member {:?} without link", node))
    })
}

impl EcmpMgr {
    pub fn new(map: &AddrMap) -> Self {
        Self { map: map.clone(), grps: Arena::new() }
    }

    pub fn grp(&self, hdl: EcmpHdl) -> Result<&EcmpGroup> {
        self.grps.get(hdl.0).ok_or_else(|| {
            McError::InvalidArgument(format!("no such ecmp group: {:?}", hdl))
        })
    }

    fn grp_mut(&mut self, hdl: EcmpHdl) -> Result<&mut EcmpGroup> {
        self.grps.get_mut(hdl.0).ok_or_else(|| {
            McError::InvalidArgument(format!("no such ecmp group: {:?}", hdl))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (EcmpHdl, &EcmpGroup)> + '_ {
        self.grps.iter().map(|(i, g)| (EcmpHdl(i), g))
    }

    // ----------------------------------------------------------------
    // Lifecycle
    // ----------------------------------------------------------------

    /// Allocate a group with an initial two-slot member block and
    /// empty vectors in every pipe.
    pub fn alloc(
        &mut self,
        alloc: &mut RdmAllocator,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<EcmpHdl> {
        let slots_log2 = 1u8;
        let mut pipes = Vec::with_capacity(self.map.pipes as usize);
        for pipe in (0..self.map.pipes).map(Pipe) {
            let base = alloc.alloc(pipe, slots_log2 + 1, wrl)?;
            let vec = [
                alloc.alloc(pipe, VEC_RUN_LOG2, wrl)?,
                alloc.alloc(pipe, VEC_RUN_LOG2, wrl)?,
            ];
            let image = RdmNode::EcmpVec {
                base,
                len: 1 << slots_log2,
                vector: 0,
            };
            wrl.push(image.write_op(vec[0]));
            wrl.push(image.write_op(vec[1]));
            pipes.push(EcmpPipe { base, slots_log2, vec });
        }

        let hdl = self.grps.insert(EcmpGroup {
            mbrs: [None; ECMP_MAX_MBRS],
            head: None,
            count: 0,
            pipes,
            assoc: Vec::new(),
        });
        Ok(EcmpHdl(hdl))
    }

    /// Release a group. Fails while the group is still associated
    /// with any MGID; remaining members are detached.
    pub fn free(
        &mut self,
        hdl: EcmpHdl,
        tree: &mut ReplTree,
        alloc: &mut RdmAllocator,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        let grp = self.grp(hdl)?;
        if !grp.assoc.is_empty() {
            return Err(McError::InvalidArgument(format!(
                "ecmp group {:?} still associated with {} mgids",
                hdl,
                grp.assoc.len()
            )));
        }

        let mbrs = grp.mbrs;
        for mbr in mbrs.into_iter().flatten() {
            self.detach_mbr(hdl, mbr, tree, alloc, wrl)?;
        }

        let grp = self.grp_mut(hdl)?;
        let pipes = std::mem::take(&mut grp.pipes);
        for pipe in &pipes {
            alloc.free(pipe.base, pipe.block_log2(), wrl)?;
            alloc.free(pipe.vec[0], VEC_RUN_LOG2, wrl)?;
            alloc.free(pipe.vec[1], VEC_RUN_LOG2, wrl)?;
        }
        self.grps.remove(hdl.0);
        Ok(())
    }

    // ----------------------------------------------------------------
    // Membership
    // ----------------------------------------------------------------

    fn check_addable(&self, tree: &ReplTree, node: NodeHdl) -> Result<()> {
        let n = tree.node(node)?;
        if n.mgid.is_some() {
            return Err(McError::InvalidArgument(format!(
                "node {:?} is directly associated",
                node
            )));
        }
        if n.ecmp_mbr.is_some() || n.ecmp_ptr.is_some() {
            return Err(McError::InvalidArgument(format!(
                "node {:?} already ecmp-linked",
                node
            )));
        }
        Ok(())
    }

    pub fn mbr_add(
        &mut self,
        hdl: EcmpHdl,
        node: NodeHdl,
        tree: &mut ReplTree,
        alloc: &mut RdmAllocator,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        self.check_addable(tree, node)?;
        let grp = self.grp(hdl)?;
        if grp.count as usize >= ECMP_MAX_MBRS {
            return Err(McError::NoSysResources(format!(
                "ecmp group {:?} at member limit {}",
                hdl, ECMP_MAX_MBRS
            )));
        }
        let slot = (0..ECMP_MAX_MBRS as u8)
            .find(|s| grp.mbrs[*s as usize].is_none())
            .ok_or_else(|| {
                McError::Unexpected(format!(
                    "ecmp group {:?} under limit with no free slot",
                    hdl
                ))
            })?;

        let mut to_free: Vec<L2Run> = Vec::new();
        if slot >= self.grp(hdl)?.slots() {
            self.grow(hdl, tree, alloc, wrl, &mut to_free)?;
        }

        // Stage the member's line and fan-out in every pipe; the
        // vector still hides this slot.
        self.stage_mbr(hdl, node, slot, tree, alloc, wrl)?;

        let tail = self.tail(tree, hdl)?;
        let grp = self.grp_mut(hdl)?;
        grp.mbrs[slot as usize] = Some(node);
        grp.count += 1;
        if grp.head.is_none() {
            grp.head = Some(node);
        }
        tree.set_ecmp_mbr(
            node,
            Some(EcmpMbrLink { grp: hdl, slot, prev: tail, next: None }),
        )?;
        if let Some(tail) = tail {
            let mut link = mbr_link(tree, tail)?;
            link.next = Some(node);
            tree.set_ecmp_mbr(tail, Some(link))?;
        }

        // Reveal: fresh vectors carrying the new bit, then re-point
        // every associating L1, then drop the old structures.
        self.refresh_vectors(hdl, tree, alloc, wrl, &mut to_free)?;
        for (addr, log2) in to_free {
            alloc.free(addr, log2, wrl)?;
        }
        Ok(())
    }

    pub fn mbr_rem(
        &mut self,
        hdl: EcmpHdl,
        node: NodeHdl,
        tree: &mut ReplTree,
        alloc: &mut RdmAllocator,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        let link = tree.node(node)?.ecmp_mbr;
        match link {
            Some(link) if link.grp == hdl => {}
            _ => {
                return Err(McError::InvalidArgument(format!(
                    "node {:?} not a member of {:?}",
                    node, hdl
                )));
            }
        }

        // Hide the slot first, then release the member's hardware.
        let mut to_free: Vec<L2Run> = Vec::new();
        self.unlink_mbr(hdl, node, tree)?;
        self.refresh_vectors(hdl, tree, alloc, wrl, &mut to_free)?;
        self.release_mbr_hw(node, tree, alloc, wrl)?;
        for (addr, log2) in to_free {
            alloc.free(addr, log2, wrl)?;
        }
        Ok(())
    }

    /// Atomic full-set replace.
    pub fn mbr_mod(
        &mut self,
        hdl: EcmpHdl,
        nodes: &[NodeHdl],
        tree: &mut ReplTree,
        alloc: &mut RdmAllocator,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        if nodes.len() > ECMP_MAX_MBRS {
            return Err(McError::NoSysResources(format!(
                "{} members exceeds ecmp limit {}",
                nodes.len(),
                ECMP_MAX_MBRS
            )));
        }
        let current = self.grp(hdl)?.mbrs;
        for node in nodes {
            if nodes.iter().filter(|n| *n == node).count() > 1 {
                return Err(McError::InvalidArgument(format!(
                    "duplicate member {:?}",
                    node
                )));
            }
            if !current.contains(&Some(*node)) {
                self.check_addable(tree, *node)?;
            }
        }

        // Detach the old set (no interim vector churn), stage the new
        // set, publish once.
        let mut to_free: Vec<L2Run> = Vec::new();
        for mbr in current.into_iter().flatten() {
            self.unlink_mbr(hdl, mbr, tree)?;
            self.release_mbr_hw(mbr, tree, alloc, wrl)?;
        }

        while (nodes.len() as u8) > self.grp(hdl)?.slots() {
            self.grow(hdl, tree, alloc, wrl, &mut to_free)?;
        }

        let mut prev: Option<NodeHdl> = None;
        for (slot, node) in nodes.iter().enumerate() {
            self.stage_mbr(hdl, *node, slot as u8, tree, alloc, wrl)?;
            tree.set_ecmp_mbr(
                *node,
                Some(EcmpMbrLink {
                    grp: hdl,
                    slot: slot as u8,
                    prev,
                    next: None,
                }),
            )?;
            if let Some(prev) = prev {
                let mut link = mbr_link(tree, prev)?;
                link.next = Some(*node);
                tree.set_ecmp_mbr(prev, Some(link))?;
            }
            let grp = self.grp_mut(hdl)?;
            grp.mbrs[slot] = Some(*node);
            prev = Some(*node);
        }
        let grp = self.grp_mut(hdl)?;
        grp.count = nodes.len() as u8;
        grp.head = nodes.first().copied();

        self.refresh_vectors(hdl, tree, alloc, wrl, &mut to_free)?;
        for (addr, log2) in to_free {
            alloc.free(addr, log2, wrl)?;
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Association
    // ----------------------------------------------------------------

    /// Bind the group to an MGID by inserting an ECMP-pointer L1 node
    /// into its chains.
    pub fn associate(
        &mut self,
        hdl: EcmpHdl,
        mgid: Mgid,
        xid: Option<Xid>,
        use_xid: bool,
        tree: &mut ReplTree,
        alloc: &mut RdmAllocator,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        for ptr in &self.grp(hdl)?.assoc {
            if tree.node(*ptr)?.mgid == Some(mgid) {
                return Err(McError::InvalidArgument(format!(
                    "ecmp group {:?} already associated with {:?}",
                    hdl, mgid
                )));
            }
        }

        let vecs = self.grp(hdl)?.vec_addrs();
        let ptr = tree.node_create(
            mcast_api::Rid(0),
            super::hw::PortMask::new(),
            super::hw::LagMask::new(),
        )?;
        tree.set_ecmp_ptr(ptr, Some(hdl))?;
        if let Err(e) =
            tree.associate(ptr, mgid, xid, use_xid, Some(&vecs), alloc, wrl)
        {
            tree.set_ecmp_ptr(ptr, None)?;
            tree.node_destroy(ptr)?;
            return Err(e);
        }
        self.grp_mut(hdl)?.assoc.push(ptr);
        Ok(())
    }

    pub fn dissociate(
        &mut self,
        hdl: EcmpHdl,
        mgid: Mgid,
        tree: &mut ReplTree,
        alloc: &mut RdmAllocator,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        let assoc = self.grp(hdl)?.assoc.clone();
        let Some(ptr) = assoc
            .into_iter()
            .find(|p| tree.node(*p).map(|n| n.mgid) == Ok(Some(mgid)))
        else {
            return Err(McError::InvalidArgument(format!(
                "ecmp group {:?} not associated with {:?}",
                hdl, mgid
            )));
        };

        tree.dissociate(ptr, mgid, alloc, wrl)?;
        tree.set_ecmp_ptr(ptr, None)?;
        tree.node_destroy(ptr)?;
        self.grp_mut(hdl)?.assoc.retain(|p| *p != ptr);
        Ok(())
    }

    /// The MGIDs this group is bound to.
    pub fn assoc_mgids(&self, hdl: EcmpHdl, tree: &ReplTree) -> Vec<Mgid> {
        let Ok(grp) = self.grp(hdl) else {
            return Vec::new();
        };
        grp.assoc
            .iter()
            .filter_map(|p| tree.node(*p).ok().and_then(|n| n.mgid))
            .collect()
    }

    /// Stable member iteration: the insertion-ordered list.
    pub fn first_mbr(&self, hdl: EcmpHdl) -> Result<Option<NodeHdl>> {
        Ok(self.grp(hdl)?.head)
    }

    pub fn next_mbr(
        &self,
        hdl: EcmpHdl,
        node: NodeHdl,
        tree: &ReplTree,
    ) -> Result<Option<NodeHdl>> {
        match tree.node(node)?.ecmp_mbr {
            Some(link) if link.grp == hdl => Ok(link.next),
            _ => Err(McError::InvalidArgument(format!(
                "node {:?} not a member of {:?}",
                node, hdl
            ))),
        }
    }

    // ----------------------------------------------------------------
    // Internals
    // ----------------------------------------------------------------

    fn tail(&self, tree: &ReplTree, hdl: EcmpHdl) -> Result<Option<NodeHdl>> {
        let mut cur = self.grp(hdl)?.head;
        let mut tail = None;
        while let Some(n) = cur {
            tail = Some(n);
            cur = tree.node(n)?.ecmp_mbr.and_then(|l| l.next);
        }
        Ok(tail)
    }

    /// Write one member's L1 line and fan-out chains into the group
    /// block, in every pipe.
    fn stage_mbr(
        &mut self,
        hdl: EcmpHdl,
        node: NodeHdl,
        slot: u8,
        tree: &mut ReplTree,
        alloc: &mut RdmAllocator,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        let (ports, lags) = {
            let n = tree.node(node)?;
            (n.ports, n.lags)
        };
        for pipe in (0..self.map.pipes).map(Pipe) {
            let addr = self.grp(hdl)?.pipes[pipe.0 as usize].slot_addr(slot);
            let l2 =
                tree.build_l2_for(&ports, &lags, pipe, alloc, wrl)?;
            tree.set_mbr_hw(
                node,
                pipe,
                Some(L1Hw { addr, prev: None, next: None, l2, vecs: None }),
            )?;
            tree.reencode_l1(node, pipe, wrl)?;
        }
        Ok(())
    }

    /// Clear a member's slot and list linkage (software only).
    fn unlink_mbr(
        &mut self,
        hdl: EcmpHdl,
        node: NodeHdl,
        tree: &mut ReplTree,
    ) -> Result<()> {
        let link = mbr_link(tree, node)?;
        if let Some(prev) = link.prev {
            let mut plink = mbr_link(tree, prev)?;
            plink.next = link.next;
            tree.set_ecmp_mbr(prev, Some(plink))?;
        }
        if let Some(next) = link.next {
            let mut nlink = mbr_link(tree, next)?;
            nlink.prev = link.prev;
            tree.set_ecmp_mbr(next, Some(nlink))?;
        }
        let grp = self.grp_mut(hdl)?;
        grp.mbrs[link.slot as usize] = None;
        grp.count -= 1;
        if grp.head == Some(node) {
            grp.head = link.next;
        }
        tree.set_ecmp_mbr(node, None)?;
        Ok(())
    }

    /// Free a detached member's per-pipe chains. The member line
    /// itself belongs to the group block.
    fn release_mbr_hw(
        &self,
        node: NodeHdl,
        tree: &mut ReplTree,
        alloc: &mut RdmAllocator,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        for pipe in (0..self.map.pipes).map(Pipe) {
            let Some(hw) = tree.node(node)?.hw_pipe(pipe).cloned() else {
                continue;
            };
            for (addr, log2) in &hw.l2 {
                alloc.free(*addr, *log2, wrl)?;
            }
            tree.set_mbr_hw(node, pipe, None)?;
        }
        Ok(())
    }

    fn detach_mbr(
        &mut self,
        hdl: EcmpHdl,
        node: NodeHdl,
        tree: &mut ReplTree,
        alloc: &mut RdmAllocator,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        self.unlink_mbr(hdl, node, tree)?;
        self.release_mbr_hw(node, tree, alloc, wrl)
    }

    /// Double the member block in every pipe: stage every occupied
    /// slot's line at its new address and queue the old runs for
    /// release after the vectors publish.
    fn grow(
        &mut self,
        hdl: EcmpHdl,
        tree: &mut ReplTree,
        alloc: &mut RdmAllocator,
        wrl: &mut Vec<WriteOp>,
        to_free: &mut Vec<L2Run>,
    ) -> Result<()> {
        let mbrs = self.grp(hdl)?.mbrs;
        for pipe in (0..self.map.pipes).map(Pipe) {
            let (old_base, old_log2, new_log2) = {
                let p = &self.grp(hdl)?.pipes[pipe.0 as usize];
                (p.base, p.block_log2(), p.slots_log2 + 1)
            };
            let new_base = alloc.alloc(pipe, new_log2 + 1, wrl)?;
            {
                let p =
                    &mut self.grp_mut(hdl)?.pipes[pipe.0 as usize];
                p.base = new_base;
                p.slots_log2 = new_log2;
            }
            for (slot, mbr) in mbrs.iter().enumerate() {
                let Some(mbr) = *mbr else { continue };
                let addr = self.grp(hdl)?.pipes[pipe.0 as usize]
                    .slot_addr(slot as u8);
                let mut hw = tree
                    .node(mbr)?
                    .hw_pipe(pipe)
                    .cloned()
                    .ok_or_else(|| {
                        McError::Unexpected(format!(
                            "member {:?} missing hw in pipe {}",
                            mbr, pipe.0
                        ))
                    })?;
                hw.addr = addr;
                tree.set_mbr_hw(mbr, pipe, Some(hw))?;
                tree.reencode_l1(mbr, pipe, wrl)?;
            }
            to_free.push((old_base, old_log2));
        }
        Ok(())
    }

    /// Allocate and stage fresh selection vectors for both versions
    /// in every pipe, re-point the association L1 nodes, and queue
    /// the old vector lines for release.
    fn refresh_vectors(
        &mut self,
        hdl: EcmpHdl,
        tree: &mut ReplTree,
        alloc: &mut RdmAllocator,
        wrl: &mut Vec<WriteOp>,
        to_free: &mut Vec<L2Run>,
    ) -> Result<()> {
        let bitmap = self.grp(hdl)?.bitmap();
        for pipe in (0..self.map.pipes).map(Pipe) {
            let (base, slots, old_vec) = {
                let p = &self.grp(hdl)?.pipes[pipe.0 as usize];
                (p.base, 1u8 << p.slots_log2, p.vec)
            };
            let new_vec = [
                alloc.alloc(pipe, VEC_RUN_LOG2, wrl)?,
                alloc.alloc(pipe, VEC_RUN_LOG2, wrl)?,
            ];
            let image =
                RdmNode::EcmpVec { base, len: slots, vector: bitmap };
            wrl.push(image.write_op(new_vec[0]));
            wrl.push(image.write_op(new_vec[1]));

            self.grp_mut(hdl)?.pipes[pipe.0 as usize].vec = new_vec;
            to_free.push((old_vec[0], VEC_RUN_LOG2));
            to_free.push((old_vec[1], VEC_RUN_LOG2));
        }

        let vecs = self.grp(hdl)?.vec_addrs();
        let assoc = self.grp(hdl)?.assoc.clone();
        for ptr in assoc {
            tree.repoint_ecmp_ptr(ptr, &vecs, wrl)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::addr::Family;
    use crate::engine::hw::LagMask;
    use crate::engine::hw::PortMask;
    use mcast_api::Rid;

    struct Fix {
        tree: ReplTree,
        alloc: RdmAllocator,
        mgr: EcmpMgr,
        wrl: Vec<WriteOp>,
    }

    fn fixture() -> Fix {
        let map = AddrMap::new(Family::Gen1);
        Fix {
            tree: ReplTree::new(&map),
            alloc: RdmAllocator::new(&map),
            mgr: EcmpMgr::new(&map),
            wrl: Vec::new(),
        }
    }

    fn node(fix: &mut Fix, rid: u16, port: u16) -> NodeHdl {
        let mut ports = PortMask::new();
        ports.set(port, true);
        fix.tree.node_create(Rid(rid), ports, LagMask::new()).unwrap()
    }

    #[test]
    fn add_then_rem_restores_state() {
        let mut fix = fixture();
        let grp =
            fix.mgr.alloc(&mut fix.alloc, &mut fix.wrl).unwrap();
        let n = node(&mut fix, 1, 7);

        let before_bitmap = fix.mgr.grp(grp).unwrap().bitmap();
        let before_used = fix.alloc.used_halves();

        fix.mgr
            .mbr_add(grp, n, &mut fix.tree, &mut fix.alloc, &mut fix.wrl)
            .unwrap();
        assert_eq!(fix.mgr.grp(grp).unwrap().bitmap(), 0b1);
        assert_eq!(fix.mgr.first_mbr(grp).unwrap(), Some(n));

        fix.mgr
            .mbr_rem(grp, n, &mut fix.tree, &mut fix.alloc, &mut fix.wrl)
            .unwrap();
        assert_eq!(fix.mgr.grp(grp).unwrap().bitmap(), before_bitmap);
        assert_eq!(fix.alloc.used_halves(), before_used);
        assert!(fix.tree.node(n).unwrap().ecmp_mbr.is_none());
    }

    #[test]
    fn member_limit_is_no_sys_resources() {
        let mut fix = fixture();
        let grp =
            fix.mgr.alloc(&mut fix.alloc, &mut fix.wrl).unwrap();
        for i in 0..ECMP_MAX_MBRS as u16 {
            let n = node(&mut fix, i, i);
            fix.mgr
                .mbr_add(grp, n, &mut fix.tree, &mut fix.alloc, &mut fix.wrl)
                .unwrap();
        }
        assert_eq!(fix.mgr.grp(grp).unwrap().slots(), 32);

        let extra = node(&mut fix, 99, 99);
        let err = fix
            .mgr
            .mbr_add(grp, extra, &mut fix.tree, &mut fix.alloc, &mut fix.wrl)
            .unwrap_err();
        assert!(matches!(err, McError::NoSysResources(_)));
    }

    #[test]
    fn growth_relocates_block() {
        let mut fix = fixture();
        let grp =
            fix.mgr.alloc(&mut fix.alloc, &mut fix.wrl).unwrap();
        let base0 = fix.mgr.grp(grp).unwrap().pipes[0].base;

        for i in 0..3 {
            let n = node(&mut fix, i, i);
            fix.mgr
                .mbr_add(grp, n, &mut fix.tree, &mut fix.alloc, &mut fix.wrl)
                .unwrap();
        }
        let grp_ref = fix.mgr.grp(grp).unwrap();
        assert_eq!(grp_ref.slots(), 4);
        assert_ne!(grp_ref.pipes[0].base, base0);
        assert_eq!(grp_ref.bitmap(), 0b111);
    }

    #[test]
    fn mod_replaces_set() {
        let mut fix = fixture();
        let grp =
            fix.mgr.alloc(&mut fix.alloc, &mut fix.wrl).unwrap();
        let a = node(&mut fix, 1, 1);
        let b = node(&mut fix, 2, 2);
        let c = node(&mut fix, 3, 3);
        fix.mgr
            .mbr_add(grp, a, &mut fix.tree, &mut fix.alloc, &mut fix.wrl)
            .unwrap();

        fix.mgr
            .mbr_mod(grp, &[b, c], &mut fix.tree, &mut fix.alloc, &mut fix.wrl)
            .unwrap();
        assert!(fix.tree.node(a).unwrap().ecmp_mbr.is_none());
        assert_eq!(fix.mgr.grp(grp).unwrap().bitmap(), 0b11);
        assert_eq!(fix.mgr.first_mbr(grp).unwrap(), Some(b));
        assert_eq!(
            fix.mgr.next_mbr(grp, b, &fix.tree).unwrap(),
            Some(c)
        );
    }

    #[test]
    fn torn_member_link_reports_unexpected() {
        let mut fix = fixture();
        let grp = fix.mgr.alloc(&mut fix.alloc, &mut fix.wrl).unwrap();
        let a = node(&mut fix, 1, 1);
        let b = node(&mut fix, 2, 2);
        fix.mgr
            .mbr_add(grp, a, &mut fix.tree, &mut fix.alloc, &mut fix.wrl)
            .unwrap();
        fix.mgr
            .mbr_add(grp, b, &mut fix.tree, &mut fix.alloc, &mut fix.wrl)
            .unwrap();

        // Sever a's linkage behind the manager's back; removing b
        // then finds its predecessor without a link and must report,
        // not panic.
        fix.tree.set_ecmp_mbr(a, None).unwrap();
        let err = fix
            .mgr
            .mbr_rem(grp, b, &mut fix.tree, &mut fix.alloc, &mut fix.wrl)
            .unwrap_err();
        assert!(matches!(err, McError::Unexpected(_)));
    }

    #[test]
    fn associate_inserts_pointer_node() {
        let mut fix = fixture();
        let grp =
            fix.mgr.alloc(&mut fix.alloc, &mut fix.wrl).unwrap();
        fix.tree.mgrp_create(Mgid(7)).unwrap();
        fix.mgr
            .associate(
                grp,
                Mgid(7),
                None,
                false,
                &mut fix.tree,
                &mut fix.alloc,
                &mut fix.wrl,
            )
            .unwrap();
        assert_eq!(fix.mgr.assoc_mgids(grp, &fix.tree), vec![Mgid(7)]);
        // Pointer nodes materialize in every pipe.
        assert_ne!(fix.tree.fanout_pipes(Mgid(7)), 0);

        // Freeing an associated group must fail.
        let err = fix
            .mgr
            .free(grp, &mut fix.tree, &mut fix.alloc, &mut fix.wrl)
            .unwrap_err();
        assert!(matches!(err, McError::InvalidArgument(_)));

        fix.mgr
            .dissociate(
                grp,
                Mgid(7),
                &mut fix.tree,
                &mut fix.alloc,
                &mut fix.wrl,
            )
            .unwrap();
        fix.mgr
            .free(grp, &mut fix.tree, &mut fix.alloc, &mut fix.wrl)
            .unwrap();
    }
}
