// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The replication tree.
//!
//! Per device, maps MGID to a per-pipe chain of L1 nodes rooted in
//! the MIT. Every L1 node owns a full RDM line per materialized pipe,
//! so re-encoding a node (chain tail changes, xid toggles, ECMP
//! vector moves) is always a single in-place line write and never a
//! reallocation.
//!
//! Ordering discipline: when a node is inserted, its own line and its
//! entire L2 chain are staged before the MIT root (or predecessor
//! pointer) write that reveals it, so a hardware walker never
//! observes a dangling address. Removal reverses this: the unlink
//! write goes first, the frees follow.

use super::Result;
use super::addr::AddrMap;
use super::arena::Arena;
use super::hw::LagMask;
use super::hw::MitRow;
use super::hw::PortMask;
use super::hw::WriteOp;
use super::node::RdmNode;
use super::rdm::RdmAllocator;
use mcast_api::EcmpHdl;
use mcast_api::McError;
use mcast_api::Mgid;
use mcast_api::NodeHdl;
use mcast_api::Pipe;
use mcast_api::RdmAddr;
use mcast_api::Rid;
use mcast_api::Xid;
use std::collections::BTreeMap;

/// L1 lines are full lines: two half-lines, run class 1.
pub const L1_RUN_LOG2: u8 = 1;

/// One materialized RDM node of an L2 chain: address plus the run
/// class it was allocated with.
pub type L2Run = (RdmAddr, u8);

/// The per-pipe hardware record of an L1 node.
#[derive(Clone, Debug)]
pub struct L1Hw {
    pub addr: RdmAddr,
    pub prev: Option<NodeHdl>,
    pub next: Option<NodeHdl>,
    /// Materialized L2 chain, in walk order. Empty for ECMP pointer
    /// nodes.
    pub l2: Vec<L2Run>,
    /// For ECMP pointer nodes: the group's per-version vector
    /// addresses in this pipe.
    pub vecs: Option<[RdmAddr; 2]>,
}

impl L1Hw {
    fn l2_head(&self) -> RdmAddr {
        self.l2.first().map(|(a, _)| *a).unwrap_or(RdmAddr::NULL)
    }
}

/// ECMP membership linkage of an L1 node.
#[derive(Clone, Copy, Debug)]
pub struct EcmpMbrLink {
    pub grp: EcmpHdl,
    pub slot: u8,
    pub prev: Option<NodeHdl>,
    pub next: Option<NodeHdl>,
}

/// The software image of an L1 node.
#[derive(Clone, Debug)]
pub struct L1Node {
    pub rid: Rid,
    pub xid: Option<Xid>,
    pub mgid: Option<Mgid>,
    pub ports: PortMask,
    pub lags: LagMask,
    /// Indexed by pipe; `None` where the node is not materialized.
    pub hw: Vec<Option<L1Hw>>,
    pub ecmp_mbr: Option<EcmpMbrLink>,
    /// Set when this node is the association pointer of an ECMP
    /// group.
    pub ecmp_ptr: Option<EcmpHdl>,
}

impl L1Node {
    pub fn hw_pipe(&self, pipe: Pipe) -> Option<&L1Hw> {
        self.hw.get(pipe.0 as usize).and_then(|h| h.as_ref())
    }
}

/// One multicast group: stable-order member list plus per-pipe chain
/// heads.
#[derive(Clone, Debug, Default)]
pub struct MgidEntry {
    /// Association order; the order first/next iteration reports.
    pub members: Vec<NodeHdl>,
    /// Per-pipe chain head (most recent association first).
    pub heads: Vec<Option<NodeHdl>>,
}

pub struct ReplTree {
    map: AddrMap,
    nodes: Arena<L1Node>,
    mgids: BTreeMap<u16, MgidEntry>,
}

impl ReplTree {
    pub fn new(map: &AddrMap) -> Self {
        Self { map: map.clone(), nodes: Arena::new(), mgids: BTreeMap::new() }
    }

    pub fn node(&self, hdl: NodeHdl) -> Result<&L1Node> {
        self.nodes.get(hdl.0).ok_or_else(|| {
            McError::InvalidArgument(format!("no such node: {:?}", hdl))
        })
    }

    fn node_mut(&mut self, hdl: NodeHdl) -> Result<&mut L1Node> {
        self.nodes.get_mut(hdl.0).ok_or_else(|| {
            McError::InvalidArgument(format!("no such node: {:?}", hdl))
        })
    }

    pub fn mgid_entry(&self, mgid: Mgid) -> Option<&MgidEntry> {
        self.mgids.get(&mgid.0)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // ----------------------------------------------------------------
    // Group lifecycle
    // ----------------------------------------------------------------

    pub fn mgrp_create(&mut self, mgid: Mgid) -> Result<()> {
        if mgid.0 as u32 >= self.map.mgids {
            return Err(McError::InvalidArgument(format!(
                "mgid out of range: {:?}",
                mgid
            )));
        }
        if self.mgids.contains_key(&mgid.0) {
            return Err(McError::InvalidArgument(format!(
                "mgid already exists: {:?}",
                mgid
            )));
        }
        self.mgids.insert(
            mgid.0,
            MgidEntry {
                members: Vec::new(),
                heads: vec![None; self.map.pipes as usize],
            },
        );
        Ok(())
    }

    pub fn mgrp_destroy(&mut self, mgid: Mgid) -> Result<()> {
        let entry = self.mgids.get(&mgid.0).ok_or_else(|| {
            McError::InvalidArgument(format!("no such mgid: {:?}", mgid))
        })?;
        if !entry.members.is_empty() {
            return Err(McError::InvalidArgument(format!(
                "mgid {:?} still has {} members",
                mgid,
                entry.members.len()
            )));
        }
        self.mgids.remove(&mgid.0);
        Ok(())
    }

    pub fn mgrp_exists(&self, mgid: Mgid) -> bool {
        self.mgids.contains_key(&mgid.0)
    }

    // ----------------------------------------------------------------
    // Node lifecycle
    // ----------------------------------------------------------------

    pub fn node_create(
        &mut self,
        rid: Rid,
        ports: PortMask,
        lags: LagMask,
    ) -> Result<NodeHdl> {
        for port in ports.iter_ones() {
            if port >= self.map.ports() {
                return Err(McError::InvalidArgument(format!(
                    "port {} beyond device port count {}",
                    port,
                    self.map.ports()
                )));
            }
        }
        for lag in lags.iter_ones() {
            if lag >= self.map.lags {
                return Err(McError::InvalidArgument(format!(
                    "lag {} beyond device lag count {}",
                    lag, self.map.lags
                )));
            }
        }
        let hdl = self.nodes.insert(L1Node {
            rid,
            xid: None,
            mgid: None,
            ports,
            lags,
            hw: vec![None; self.map.pipes as usize],
            ecmp_mbr: None,
            ecmp_ptr: None,
        });
        Ok(NodeHdl(hdl))
    }

    pub fn node_destroy(&mut self, hdl: NodeHdl) -> Result<()> {
        let node = self.node(hdl)?;
        if let Some(mgid) = node.mgid {
            return Err(McError::InvalidArgument(format!(
                "node {:?} still associated with {:?}",
                hdl, mgid
            )));
        }
        if node.ecmp_mbr.is_some() || node.ecmp_ptr.is_some() {
            return Err(McError::InvalidArgument(format!(
                "node {:?} still referenced by an ecmp group",
                hdl
            )));
        }
        self.nodes.remove(hdl.0);
        Ok(())
    }

    // ----------------------------------------------------------------
    // Encoding
    // ----------------------------------------------------------------

    fn addr_of(&self, hdl: NodeHdl, pipe: Pipe) -> RdmAddr {
        self.nodes
            .get(hdl.0)
            .and_then(|n| n.hw_pipe(pipe))
            .map(|hw| hw.addr)
            .unwrap_or(RdmAddr::NULL)
    }

    /// Encode the current variant of a node's line in one pipe.
    fn l1_node_image(&self, hdl: NodeHdl, pipe: Pipe) -> Result<RdmNode> {
        let node = self.node(hdl)?;
        let hw = node.hw_pipe(pipe).ok_or_else(|| {
            McError::Unexpected(format!(
                "node {:?} not materialized in pipe {}",
                hdl, pipe.0
            ))
        })?;
        let next_l1 =
            hw.next.map(|n| self.addr_of(n, pipe)).unwrap_or(RdmAddr::NULL);

        let image = match (hw.vecs, node.xid) {
            (Some([vec0, vec1]), None) => {
                RdmNode::L1Ecmp { next_l1, vec0, vec1 }
            }
            (Some([vec0, vec1]), Some(xid)) => {
                RdmNode::L1EcmpXid { next_l1, vec0, vec1, xid: xid.0 }
            }
            (None, Some(xid)) => RdmNode::L1RidXid {
                next_l1,
                next_l2: hw.l2_head(),
                rid: node.rid.0,
                xid: xid.0,
            },
            (None, None) if next_l1.is_null() => RdmNode::L1RidEnd {
                next_l2: hw.l2_head(),
                rid: node.rid.0,
            },
            (None, None) => RdmNode::L1Rid {
                next_l1,
                next_l2: hw.l2_head(),
                rid: node.rid.0,
            },
        };
        Ok(image)
    }

    /// Stage a rewrite of a node's (already revealed) line in `pipe`.
    /// Single-line writes are atomic to in-flight walkers.
    pub fn reencode_l1(
        &self,
        hdl: NodeHdl,
        pipe: Pipe,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        let addr = self.addr_of(hdl, pipe);
        wrl.push(self.l1_node_image(hdl, pipe)?.write_op(addr));
        Ok(())
    }

    /// The MIT row write covering `mgid` in `pipe`, packed from the
    /// current shadow roots.
    pub fn mit_row_op(&self, pipe: Pipe, mgid: Mgid) -> WriteOp {
        let row = self.map.mit_row(mgid);
        let base = row * self.map.mit_per_row;
        let mut roots = MitRow::default();
        for slot in 0..self.map.mit_per_row {
            roots.0[slot as usize] =
                self.mit_root(pipe, Mgid((base + slot) as u16)).0;
        }
        WriteOp::MitRow { pipe: pipe.0, row, roots }
    }

    /// The software MIT root for `(pipe, mgid)`.
    pub fn mit_root(&self, pipe: Pipe, mgid: Mgid) -> RdmAddr {
        self.mgids
            .get(&mgid.0)
            .and_then(|e| e.heads[pipe.0 as usize])
            .map(|h| self.addr_of(h, pipe))
            .unwrap_or(RdmAddr::NULL)
    }

    /// The pipes in which `mgid` currently has fan-out, as a bit
    /// mask. This is what the PVT must hold.
    pub fn fanout_pipes(&self, mgid: Mgid) -> u8 {
        let Some(entry) = self.mgids.get(&mgid.0) else {
            return 0;
        };
        let mut mask = 0u8;
        for (pipe, head) in entry.heads.iter().enumerate() {
            if head.is_some() {
                mask |= 1 << pipe;
            }
        }
        mask
    }

    // ----------------------------------------------------------------
    // L2 chains
    // ----------------------------------------------------------------

    /// The local ports of `pipe` from a device-global mask, as a
    /// 72-bit value.
    fn local_ports(&self, ports: &PortMask, pipe: Pipe) -> u128 {
        let base = pipe.0 as u16 * self.map.ports_per_pipe;
        let mut local = 0u128;
        for port in ports.iter_ones() {
            if port >= base && port < base + self.map.ports_per_pipe {
                local |= 1u128 << (port - base);
            }
        }
        local
    }

    /// Build and stage one pipe's L2 chain for a fan-out. The chain
    /// is fully written before anything points at it.
    fn build_l2_chain(
        &self,
        ports: u128,
        lags: &LagMask,
        pipe: Pipe,
        alloc: &mut RdmAllocator,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<Vec<L2Run>> {
        enum Desc {
            Port18 { seg: u8, ports: u32 },
            Port72 { ports: u128 },
            Lag { lag: u8 },
        }

        let mut descs = Vec::new();
        if ports != 0 {
            let segs = self.map.segs_per_pipe() as u32;
            let one_seg =
                (0..segs).find(|seg| ports & !(0x3ffffu128 << (seg * 18)) == 0);
            match one_seg {
                Some(seg) => descs.push(Desc::Port18 {
                    seg: seg as u8,
                    ports: (ports >> (seg * 18)) as u32 & 0x3ffff,
                }),
                None => descs.push(Desc::Port72 { ports }),
            }
        }
        for lag in lags.iter_ones() {
            descs.push(Desc::Lag { lag: lag as u8 });
        }

        // Allocate every node, then encode tail-first so each next
        // pointer names an already staged node.
        let runs = descs
            .iter()
            .map(|d| {
                let log2 = match d {
                    Desc::Port72 { .. } => 1,
                    _ => 0,
                };
                Ok((alloc.alloc(pipe, log2, wrl)?, log2))
            })
            .collect::<Result<Vec<L2Run>>>()?;

        let mut staged = Vec::with_capacity(runs.len());
        for (i, desc) in descs.iter().enumerate().rev() {
            let next_l2 =
                runs.get(i + 1).map(|(a, _)| *a).unwrap_or(RdmAddr::NULL);
            let image = match *desc {
                Desc::Port18 { seg, ports } => {
                    RdmNode::L2Port18 { next_l2, seg, ports }
                }
                Desc::Port72 { ports } => RdmNode::L2Port72 { next_l2, ports },
                Desc::Lag { lag } => RdmNode::L2Lag { next_l2, lag },
            };
            staged.push(image.write_op(runs[i].0));
        }
        wrl.extend(staged);

        Ok(runs)
    }

    /// Stage one pipe's L2 chain for an externally owned L1 line
    /// (an ECMP member slot).
    pub fn build_l2_for(
        &self,
        ports: &PortMask,
        lags: &LagMask,
        pipe: Pipe,
        alloc: &mut RdmAllocator,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<Vec<L2Run>> {
        let local = self.local_ports(ports, pipe);
        self.build_l2_chain(local, lags, pipe, alloc, wrl)
    }

    fn free_l2_chain(
        &self,
        runs: &[L2Run],
        alloc: &mut RdmAllocator,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        for (addr, log2) in runs {
            alloc.free(*addr, *log2, wrl)?;
        }
        Ok(())
    }

    /// The L2 node count this fan-out materializes in `pipe`; what a
    /// hardware walk of a consistent chain must find.
    pub fn l2_len(&self, hdl: NodeHdl, pipe: Pipe) -> usize {
        self.node(hdl)
            .ok()
            .and_then(|n| n.hw_pipe(pipe).map(|hw| hw.l2.len()))
            .unwrap_or(0)
    }

    // ----------------------------------------------------------------
    // Associate / dissociate
    // ----------------------------------------------------------------

    /// The pipes in which a node materializes: those with local
    /// ports, every pipe when LAG members are present (the LIT prunes
    /// at replication time), every pipe for ECMP pointer nodes.
    fn materialize_mask(&self, node: &L1Node) -> u8 {
        if node.ecmp_ptr.is_some() || !node.lags.is_empty() {
            return self.map.pipe_mask_all();
        }
        let mut mask = 0u8;
        for pipe in 0..self.map.pipes {
            if self.local_ports(&node.ports, Pipe(pipe)) != 0 {
                mask |= 1 << pipe;
            }
        }
        mask
    }

    /// Insert `hdl` at the head of `mgid`'s chain in every pipe it
    /// materializes in. `vecs`, indexed by pipe, carries the ECMP
    /// vector addresses when `hdl` is a group pointer node.
    pub fn associate(
        &mut self,
        hdl: NodeHdl,
        mgid: Mgid,
        xid: Option<Xid>,
        use_xid: bool,
        vecs: Option<&[[RdmAddr; 2]]>,
        alloc: &mut RdmAllocator,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        if !self.mgrp_exists(mgid) {
            return Err(McError::InvalidArgument(format!(
                "no such mgid: {:?}",
                mgid
            )));
        }
        if use_xid && xid.is_none() {
            return Err(McError::InvalidArgument(
                "use_xid set without an xid".to_string(),
            ));
        }
        let node = self.node(hdl)?;
        if node.mgid.is_some() {
            return Err(McError::InvalidArgument(format!(
                "node {:?} already associated",
                hdl
            )));
        }
        if node.ecmp_mbr.is_some() {
            return Err(McError::InvalidArgument(format!(
                "node {:?} is an ecmp member; associate the group",
                hdl
            )));
        }

        let mask = self.materialize_mask(node);
        let ports = node.ports;
        let lags = node.lags;
        let is_ptr = node.ecmp_ptr.is_some();
        let xid = if use_xid { xid } else { None };

        // Stage the new node (line + chain) pipe by pipe, then reveal
        // it via the MIT root.
        for pipe in (0..self.map.pipes).map(Pipe) {
            if mask & (1 << pipe.0) == 0 {
                continue;
            }
            let l2 = if is_ptr {
                Vec::new()
            } else {
                let local = self.local_ports(&ports, pipe);
                self.build_l2_chain(local, &lags, pipe, alloc, wrl)?
            };
            let addr = alloc.alloc(pipe, L1_RUN_LOG2, wrl)?;

            let old_head = self
                .mgids
                .get(&mgid.0)
                .and_then(|e| e.heads[pipe.0 as usize]);

            {
                let node = self.node_mut(hdl)?;
                node.xid = xid;
                node.hw[pipe.0 as usize] = Some(L1Hw {
                    addr,
                    prev: None,
                    next: old_head,
                    l2,
                    vecs: vecs.map(|v| v[pipe.0 as usize]),
                });
            }

            // The node's own line, before anything reveals it.
            self.reencode_l1(hdl, pipe, wrl)?;

            if let Some(old) = old_head {
                if let Some(hw) =
                    self.node_mut(old)?.hw[pipe.0 as usize].as_mut()
                {
                    hw.prev = Some(hdl);
                }
            }
            let entry = self.mgids.get_mut(&mgid.0).unwrap();
            entry.heads[pipe.0 as usize] = Some(hdl);

            // Reveal.
            wrl.push(self.mit_row_op(pipe, mgid));
        }

        let node = self.node_mut(hdl)?;
        node.mgid = Some(mgid);
        node.xid = xid;
        self.mgids.get_mut(&mgid.0).unwrap().members.push(hdl);
        Ok(())
    }

    /// Unlink `hdl` from `mgid` and release its per-pipe hardware.
    pub fn dissociate(
        &mut self,
        hdl: NodeHdl,
        mgid: Mgid,
        alloc: &mut RdmAllocator,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        let node = self.node(hdl)?;
        if node.mgid != Some(mgid) {
            return Err(McError::InvalidArgument(format!(
                "node {:?} not associated with {:?}",
                hdl, mgid
            )));
        }

        for pipe in (0..self.map.pipes).map(Pipe) {
            let Some(hw) = self.node(hdl)?.hw_pipe(pipe).cloned() else {
                continue;
            };

            // Hide the node first: repoint the predecessor (or the
            // MIT root), then release its memory.
            if let Some(next) = hw.next {
                if let Some(next_hw) =
                    self.node_mut(next)?.hw[pipe.0 as usize].as_mut()
                {
                    next_hw.prev = hw.prev;
                }
            }
            match hw.prev {
                Some(prev) => {
                    if let Some(prev_hw) =
                        self.node_mut(prev)?.hw[pipe.0 as usize].as_mut()
                    {
                        prev_hw.next = hw.next;
                    }
                    self.reencode_l1(prev, pipe, wrl)?;
                }
                None => {
                    let entry = self.mgids.get_mut(&mgid.0).unwrap();
                    entry.heads[pipe.0 as usize] = hw.next;
                    wrl.push(self.mit_row_op(pipe, mgid));
                }
            }

            self.node_mut(hdl)?.hw[pipe.0 as usize] = None;
            alloc.free(hw.addr, L1_RUN_LOG2, wrl)?;
            self.free_l2_chain(&hw.l2, alloc, wrl)?;
        }

        let node = self.node_mut(hdl)?;
        node.mgid = None;
        node.xid = None;
        let entry = self.mgids.get_mut(&mgid.0).unwrap();
        entry.members.retain(|m| *m != hdl);
        Ok(())
    }

    /// Replace a node's fan-out. An associated node is re-staged
    /// under its current group and exclusion id.
    pub fn node_update(
        &mut self,
        hdl: NodeHdl,
        ports: PortMask,
        lags: LagMask,
        alloc: &mut RdmAllocator,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        let node = self.node(hdl)?;
        if node.ecmp_mbr.is_some() || node.ecmp_ptr.is_some() {
            return Err(McError::InvalidArgument(format!(
                "node {:?} is ecmp-linked; use mbr_mod",
                hdl
            )));
        }
        let assoc = node.mgid.map(|m| (m, node.xid));

        if let Some((mgid, xid)) = assoc {
            self.dissociate(hdl, mgid, alloc, wrl)?;
            let node = self.node_mut(hdl)?;
            node.ports = ports;
            node.lags = lags;
            self.associate(hdl, mgid, xid, xid.is_some(), None, alloc, wrl)?;
        } else {
            let node = self.node_mut(hdl)?;
            node.ports = ports;
            node.lags = lags;
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // ECMP support
    // ----------------------------------------------------------------

    pub fn set_ecmp_ptr(
        &mut self,
        hdl: NodeHdl,
        grp: Option<EcmpHdl>,
    ) -> Result<()> {
        self.node_mut(hdl)?.ecmp_ptr = grp;
        Ok(())
    }

    pub fn set_ecmp_mbr(
        &mut self,
        hdl: NodeHdl,
        link: Option<EcmpMbrLink>,
    ) -> Result<()> {
        self.node_mut(hdl)?.ecmp_mbr = link;
        Ok(())
    }

    /// Install a member node's hardware record inside a group-owned
    /// member block (the line belongs to the block's run, not to the
    /// node).
    pub fn set_mbr_hw(
        &mut self,
        hdl: NodeHdl,
        pipe: Pipe,
        hw: Option<L1Hw>,
    ) -> Result<()> {
        self.node_mut(hdl)?.hw[pipe.0 as usize] = hw;
        Ok(())
    }

    /// Re-point an ECMP pointer node's vectors in every pipe and
    /// stage the rewrites.
    pub fn repoint_ecmp_ptr(
        &mut self,
        hdl: NodeHdl,
        vecs: &[[RdmAddr; 2]],
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        for pipe in (0..self.map.pipes).map(Pipe) {
            let node = self.node_mut(hdl)?;
            let Some(hw) = node.hw[pipe.0 as usize].as_mut() else {
                continue;
            };
            hw.vecs = Some(vecs[pipe.0 as usize]);
            self.reencode_l1(hdl, pipe, wrl)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::addr::Family;

    fn fixture() -> (AddrMap, ReplTree, RdmAllocator) {
        let map = AddrMap::new(Family::Gen1);
        let tree = ReplTree::new(&map);
        let alloc = RdmAllocator::new(&map);
        (map, tree, alloc)
    }

    fn ports(bits: &[u16]) -> PortMask {
        let mut mask = PortMask::new();
        for b in bits {
            mask.set(*b, true);
        }
        mask
    }

    #[test]
    fn create_destroy_group() {
        let (_, mut tree, _) = fixture();
        tree.mgrp_create(Mgid(0x10)).unwrap();
        let err = tree.mgrp_create(Mgid(0x10)).unwrap_err();
        assert!(matches!(err, McError::InvalidArgument(_)));
        tree.mgrp_destroy(Mgid(0x10)).unwrap();
        let err = tree.mgrp_destroy(Mgid(0x10)).unwrap_err();
        assert!(matches!(err, McError::InvalidArgument(_)));
    }

    #[test]
    fn destroy_fails_with_members() {
        let (_, mut tree, mut alloc) = fixture();
        let mut wrl = Vec::new();
        tree.mgrp_create(Mgid(1)).unwrap();
        let n = tree
            .node_create(Rid(5), ports(&[3, 7]), LagMask::new())
            .unwrap();
        tree.associate(n, Mgid(1), None, false, None, &mut alloc, &mut wrl)
            .unwrap();

        let err = tree.mgrp_destroy(Mgid(1)).unwrap_err();
        assert!(matches!(err, McError::InvalidArgument(_)));

        // And the node cannot be destroyed while associated.
        let err = tree.node_destroy(n).unwrap_err();
        assert!(matches!(err, McError::InvalidArgument(_)));

        tree.dissociate(n, Mgid(1), &mut alloc, &mut wrl).unwrap();
        tree.mgrp_destroy(Mgid(1)).unwrap();
        tree.node_destroy(n).unwrap();
    }

    #[test]
    fn associate_orders_child_before_reveal() {
        let (_, mut tree, mut alloc) = fixture();
        let mut wrl = Vec::new();
        tree.mgrp_create(Mgid(0x10)).unwrap();
        let n = tree
            .node_create(Rid(1), ports(&[3, 7]), LagMask::new())
            .unwrap();
        tree.associate(n, Mgid(0x10), None, false, None, &mut alloc, &mut wrl)
            .unwrap();

        // Ports 3 and 7 are both pipe 0: one chain, one L1, one MIT
        // write. The MIT write must come after every RDM write.
        let mit_pos = wrl
            .iter()
            .position(|op| matches!(op, WriteOp::MitRow { .. }))
            .unwrap();
        assert_eq!(mit_pos, wrl.len() - 1);
        let root = tree.mit_root(Pipe(0), Mgid(0x10));
        assert!(!root.is_null());
        assert_eq!(tree.fanout_pipes(Mgid(0x10)), 0b0001);
        assert_eq!(tree.l2_len(n, Pipe(0)), 1);
    }

    #[test]
    fn associate_dissociate_round_trip() {
        let (_, mut tree, mut alloc) = fixture();
        let mut wrl = Vec::new();
        tree.mgrp_create(Mgid(2)).unwrap();

        let used_before = alloc.used_halves();
        let n = tree
            .node_create(Rid(1), ports(&[3, 100]), LagMask::new())
            .unwrap();
        tree.associate(n, Mgid(2), None, false, None, &mut alloc, &mut wrl)
            .unwrap();
        assert_eq!(tree.fanout_pipes(Mgid(2)), 0b0011);

        tree.dissociate(n, Mgid(2), &mut alloc, &mut wrl).unwrap();
        assert!(tree.mit_root(Pipe(0), Mgid(2)).is_null());
        assert!(tree.mit_root(Pipe(1), Mgid(2)).is_null());
        assert_eq!(tree.fanout_pipes(Mgid(2)), 0);
        assert_eq!(alloc.used_halves(), used_before);
    }

    #[test]
    fn chain_linkage_survives_middle_removal() {
        let (_, mut tree, mut alloc) = fixture();
        let mut wrl = Vec::new();
        tree.mgrp_create(Mgid(9)).unwrap();

        let mk = |tree: &mut ReplTree, rid, port| {
            tree.node_create(Rid(rid), ports(&[port]), LagMask::new())
                .unwrap()
        };
        let a = mk(&mut tree, 1, 0);
        let b = mk(&mut tree, 2, 1);
        let c = mk(&mut tree, 3, 2);
        for n in [a, b, c] {
            tree.associate(n, Mgid(9), None, false, None, &mut alloc, &mut wrl)
                .unwrap();
        }
        // Head insertion: chain is c -> b -> a.
        assert_eq!(
            tree.mit_root(Pipe(0), Mgid(9)),
            tree.node(c).unwrap().hw_pipe(Pipe(0)).unwrap().addr
        );

        tree.dissociate(b, Mgid(9), &mut alloc, &mut wrl).unwrap();
        let c_hw = tree.node(c).unwrap().hw_pipe(Pipe(0)).unwrap();
        assert_eq!(c_hw.next, Some(a));
        let a_hw = tree.node(a).unwrap().hw_pipe(Pipe(0)).unwrap();
        assert_eq!(a_hw.prev, Some(c));

        // Iteration order is association order.
        assert_eq!(
            tree.mgid_entry(Mgid(9)).unwrap().members,
            vec![a, c]
        );
    }

    #[test]
    fn lag_members_materialize_everywhere() {
        let (map, mut tree, mut alloc) = fixture();
        let mut wrl = Vec::new();
        tree.mgrp_create(Mgid(4)).unwrap();
        let mut lags = LagMask::new();
        lags.set(11, true);
        let n = tree.node_create(Rid(1), PortMask::new(), lags).unwrap();
        tree.associate(n, Mgid(4), None, false, None, &mut alloc, &mut wrl)
            .unwrap();
        assert_eq!(tree.fanout_pipes(Mgid(4)), map.pipe_mask_all());
        for pipe in 0..map.pipes {
            assert_eq!(tree.l2_len(n, Pipe(pipe)), 1);
        }
    }

    #[test]
    fn wide_port_spread_uses_port72() {
        let (_, mut tree, mut alloc) = fixture();
        let mut wrl = Vec::new();
        tree.mgrp_create(Mgid(5)).unwrap();
        // Ports 0 and 40 span two segments of pipe 0.
        let n = tree
            .node_create(Rid(1), ports(&[0, 40]), LagMask::new())
            .unwrap();
        tree.associate(n, Mgid(5), None, false, None, &mut alloc, &mut wrl)
            .unwrap();
        assert!(wrl.iter().any(|op| matches!(
            op,
            WriteOp::RdmLine { tag, .. }
                if tag[0] == crate::engine::node::TAG_L2_PORT72
        )));
    }
}
