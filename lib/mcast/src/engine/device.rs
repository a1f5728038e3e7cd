// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The device registry and the public operation surface.
//!
//! An [`Mcast`] holds every attached device and the global session
//! table. Each mutating operation runs as: enter the device's session
//! gate, reserve write-list descriptors for the worst case, mutate
//! the shadow state while staging descriptors, commit them to the
//! session's write-list, and (outside a batch) flush. The reservation
//! comes first, so descriptor exhaustion is `NoSysResources` with
//! nothing staged.
//!
//! A flush applies each descriptor to every subdevice in order; a
//! write failure leaves the hardware behind the shadow, so the device
//! is marked `needs_resync` and refuses further mutation. Reads that
//! return hardware state consult every subdevice and fail with
//! `Unexpected` when the dies disagree.

use super::Result;
use super::addr::AddrMap;
use super::addr::Family;
use super::ecmp::EcmpMgr;
use super::hw::CommonCtrl;
use super::hw::LagMask;
use super::hw::PipeCtrl;
use super::hw::PortMask;
use super::hw::Transport;
use super::hw::WriteOp;
use super::rdm::RdmAllocator;
use super::session::SessionState;
use super::session::SessionTable;
use super::session::Wrl;
use super::tables::MirrorTables;
use super::tree::L1Node;
use super::tree::ReplTree;
use super::verify;
use mcast_api::Dev;
use mcast_api::EcmpDumpResp;
use mcast_api::EcmpHdl;
use mcast_api::L1Dump;
use mcast_api::L1PipeDump;
use mcast_api::LagId;
use mcast_api::McError;
use mcast_api::MgrpDumpResp;
use mcast_api::Mgid;
use mcast_api::NodeHdl;
use mcast_api::Pipe;
use mcast_api::PortId;
use mcast_api::RdmAddr;
use mcast_api::RdmDumpResp;
use mcast_api::Rid;
use mcast_api::SessionHdl;
use mcast_api::TableId;
use mcast_api::VerifyResp;
use mcast_api::Xid;
use mcast_api::Yid;
use slog::Logger;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::sync::SessionGate;

/// The shadow state of one device, guarded by the device mutex.
pub(crate) struct DevInner {
    pub alloc: RdmAllocator,
    pub tree: ReplTree,
    pub ecmp: EcmpMgr,
    pub tables: MirrorTables,
    /// Set when a flush failed partway: hardware no longer matches
    /// the shadow and only a detach/reattach recovers.
    pub needs_resync: bool,
}

pub struct Device {
    dev: Dev,
    map: AddrMap,
    hw: Arc<dyn Transport>,
    gate: SessionGate,
    inner: Mutex<DevInner>,
    log: Logger,
}

impl Device {
    fn new(
        dev: Dev,
        family: Family,
        hw: Arc<dyn Transport>,
        log: &Logger,
    ) -> Self {
        let map = AddrMap::new(family);
        let inner = DevInner {
            alloc: RdmAllocator::new(&map),
            tree: ReplTree::new(&map),
            ecmp: EcmpMgr::new(&map),
            tables: MirrorTables::new(&map),
            needs_resync: false,
        };
        let log = log.new(o!("dev" => dev.0));
        Self { dev, map, hw, gate: SessionGate::new(), inner: Mutex::new(inner), log }
    }

    pub fn family(&self) -> Family {
        self.map.family
    }

    fn lock(&self) -> MutexGuard<'_, DevInner> {
        // Lock poisoning means a panic with the shadow state in an
        // unknown condition; nothing useful survives it.
        self.inner.lock().unwrap()
    }

    /// Apply the session's staged writes to every subdevice, in
    /// order.
    fn flush(&self, inner: &mut DevInner, wrl: &mut Wrl) -> Result<()> {
        let ops = wrl.take();
        for op in &ops {
            for sd in 0..self.hw.subdevs() {
                if let Err(e) = self.hw.write(sd, op) {
                    inner.needs_resync = true;
                    error!(
                        self.log,
                        "flush failed, device needs resync";
                        "sd" => sd,
                        "err" => %e,
                    );
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Read one value from every subdevice; the dies must agree.
    fn read_agree<T, F>(&self, what: &str, f: F) -> Result<T>
    where
        T: PartialEq + core::fmt::Debug,
        F: Fn(u8) -> Result<T>,
    {
        let mut agreed: Option<T> = None;
        for sd in 0..self.hw.subdevs() {
            let val = f(sd)?;
            match &agreed {
                None => agreed = Some(val),
                Some(prev) if *prev == val => {}
                Some(prev) => {
                    error!(
                        self.log,
                        "subdevice divergence";
                        "what" => what,
                        "sd" => sd,
                    );
                    return Err(McError::Unexpected(format!(
                        "subdevice divergence reading {}: sd0 {:?}, sd{} {:?}",
                        what, prev, sd, val
                    )));
                }
            }
        }
        agreed
            .ok_or_else(|| McError::Unexpected("no subdevices".to_string()))
    }
}

/// The engine entry point: attached devices plus the session table.
pub struct Mcast {
    devices: Mutex<BTreeMap<u16, Arc<Device>>>,
    sessions: Mutex<SessionTable>,
    log: Logger,
}

impl Mcast {
    pub fn new(log: Logger) -> Self {
        Self {
            devices: Mutex::new(BTreeMap::new()),
            sessions: Mutex::new(SessionTable::new()),
            log,
        }
    }

    // ----------------------------------------------------------------
    // Device lifecycle
    // ----------------------------------------------------------------

    pub fn attach(
        &self,
        dev: Dev,
        family: Family,
        hw: Arc<dyn Transport>,
    ) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        if devices.contains_key(&dev.0) {
            return Err(McError::InvalidArgument(format!(
                "device {} already attached",
                dev.0
            )));
        }
        let device = Device::new(dev, family, hw, &self.log);
        info!(device.log, "attached"; "family" => ?family);
        devices.insert(dev.0, Arc::new(device));
        Ok(())
    }

    pub fn detach(&self, dev: Dev) -> Result<()> {
        let sessions = self.sessions.lock().unwrap();
        if sessions.iter().any(|(_, s)| s.dev == dev) {
            return Err(McError::InvalidArgument(format!(
                "device {} has open sessions",
                dev.0
            )));
        }
        let mut devices = self.devices.lock().unwrap();
        let device = devices.remove(&dev.0).ok_or_else(|| {
            McError::InvalidArgument(format!("no such device: {}", dev.0))
        })?;
        info!(device.log, "detached");
        drop(sessions);
        Ok(())
    }

    fn device(&self, dev: Dev) -> Result<Arc<Device>> {
        self.devices.lock().unwrap().get(&dev.0).cloned().ok_or_else(|| {
            McError::InvalidArgument(format!("no such device: {}", dev.0))
        })
    }

    fn session_device(&self, sess: SessionHdl) -> Result<Arc<Device>> {
        let dev = self.sessions.lock().unwrap().get(sess)?.dev;
        self.device(dev)
    }

    pub fn needs_resync(&self, dev: Dev) -> Result<bool> {
        Ok(self.device(dev)?.lock().needs_resync)
    }

    // ----------------------------------------------------------------
    // Sessions and batching
    // ----------------------------------------------------------------

    pub fn session_create(&self, dev: Dev) -> Result<SessionHdl> {
        // Existence check first; a handle must name a live device.
        let _ = self.device(dev)?;
        self.sessions.lock().unwrap().create(dev)
    }

    /// Tear down a session. An open batch is discarded unflushed and
    /// the device gate released.
    pub fn session_destroy(&self, sess: SessionHdl) -> Result<()> {
        let device = self.session_device(sess)?;
        let session = self.sessions.lock().unwrap().destroy(sess)?;
        if session.state == SessionState::Batching {
            warn!(
                device.log,
                "session destroyed with an open batch; writes discarded";
                "staged" => session.wrl.len(),
            );
            device.gate.exit(sess);
        }
        Ok(())
    }

    /// Open a batch: staged writes accumulate until `batch_end`. The
    /// session holds the device gate for the whole batch.
    pub fn batch_begin(&self, sess: SessionHdl) -> Result<()> {
        let device = self.session_device(sess)?;
        device.gate.enter(sess);
        let mut sessions = self.sessions.lock().unwrap();
        let res = sessions.get_mut(sess).and_then(|session| {
            if session.state == SessionState::Batching {
                return Err(McError::InvalidArgument(
                    "batch already open".to_string(),
                ));
            }
            session.state = SessionState::Batching;
            Ok(())
        });
        if res.is_err() {
            device.gate.exit(sess);
        }
        res
    }

    /// Flush everything staged so far without closing the batch. The
    /// session keeps the device gate.
    pub fn batch_flush(&self, sess: SessionHdl) -> Result<()> {
        let device = self.session_device(sess)?;
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(sess)?;
        if session.state != SessionState::Batching {
            return Err(McError::InvalidArgument(
                "no batch open".to_string(),
            ));
        }
        let mut inner = device.lock();
        device.flush(&mut inner, &mut session.wrl)
    }

    /// Whether the session currently has a batch open.
    pub fn in_batch(&self, sess: SessionHdl) -> Result<bool> {
        Ok(self.sessions.lock().unwrap().get(sess)?.state
            == SessionState::Batching)
    }

    /// Close the batch and flush everything staged since
    /// `batch_begin` as one ordered burst.
    pub fn batch_end(&self, sess: SessionHdl) -> Result<()> {
        let device = self.session_device(sess)?;
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(sess)?;
        if session.state != SessionState::Batching {
            return Err(McError::InvalidArgument(
                "no batch open".to_string(),
            ));
        }
        let mut inner = device.lock();
        let res = device.flush(&mut inner, &mut session.wrl);
        session.state = SessionState::Idle;
        drop(inner);
        drop(sessions);
        device.gate.exit(sess);
        res
    }

    /// The common mutating-operation path: gate, reserve, mutate,
    /// commit, flush (unless batching).
    fn mutate<R>(
        &self,
        sess: SessionHdl,
        est: impl FnOnce(&DevInner, &AddrMap) -> usize,
        f: impl FnOnce(
            &mut DevInner,
            &AddrMap,
            &mut Vec<WriteOp>,
        ) -> Result<R>,
    ) -> Result<R> {
        let device = self.session_device(sess)?;
        device.gate.enter(sess);
        let res = (|| {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions.get_mut(sess)?;
            let mut inner = device.lock();
            if inner.needs_resync {
                return Err(McError::Unexpected(format!(
                    "device {} needs resync",
                    device.dev.0
                )));
            }
            session.wrl.reserve(est(&inner, &device.map))?;

            let mut ops = Vec::new();
            match f(&mut inner, &device.map, &mut ops) {
                Ok(r) => {
                    session.wrl.commit(ops);
                    if session.state == SessionState::Idle {
                        device.flush(&mut inner, &mut session.wrl)?;
                    }
                    Ok(r)
                }
                Err(e) => {
                    session.wrl.abandon();
                    // A failure after staging began means the shadow
                    // may have partially advanced.
                    if !ops.is_empty() {
                        inner.needs_resync = true;
                        warn!(
                            device.log,
                            "operation failed mid-mutation, device needs \
                             resync";
                            "err" => %e,
                        );
                    }
                    Err(e)
                }
            }
        })();
        device.gate.exit(sess);
        res
    }

    // ----------------------------------------------------------------
    // Groups and nodes
    // ----------------------------------------------------------------

    pub fn mgrp_create(&self, sess: SessionHdl, mgid: Mgid) -> Result<()> {
        self.mutate(sess, |_, _| 0, |inner, _, _| inner.tree.mgrp_create(mgid))
    }

    pub fn mgrp_destroy(&self, sess: SessionHdl, mgid: Mgid) -> Result<()> {
        self.mutate(sess, |_, _| 0, |inner, _, _| inner.tree.mgrp_destroy(mgid))
    }

    pub fn node_create(
        &self,
        sess: SessionHdl,
        rid: Rid,
        ports: &[PortId],
        lags: &[LagId],
    ) -> Result<NodeHdl> {
        self.mutate(
            sess,
            |_, _| 0,
            |inner, map, _| {
                let ports = port_mask(map, ports)?;
                let lags = lag_mask(lags);
                inner.tree.node_create(rid, ports, lags)
            },
        )
    }

    pub fn node_destroy(&self, sess: SessionHdl, node: NodeHdl) -> Result<()> {
        self.mutate(sess, |_, _| 0, |inner, _, _| inner.tree.node_destroy(node))
    }

    /// Replace a node's fan-out, re-staging it under its current
    /// association if it has one.
    pub fn node_update(
        &self,
        sess: SessionHdl,
        node: NodeHdl,
        ports: &[PortId],
        lags: &[LagId],
    ) -> Result<()> {
        self.mutate(
            sess,
            |inner, map| {
                // Teardown of the old fan-out plus build of the new.
                let l2_new = 1 + lags.len();
                est_materialize_node(inner, map, node)
                    + map.pipes as usize * (3 * (l2_new + 1) + 2)
                    + 2 * PVT_OPS
            },
            |inner, map, ops| {
                let mgid = inner.tree.node(node)?.mgid;
                let ports = port_mask(map, ports)?;
                let lags = lag_mask(lags);
                inner.tree.node_update(
                    node,
                    ports,
                    lags,
                    &mut inner.alloc,
                    ops,
                )?;
                if let Some(mgid) = mgid {
                    let mask = inner.tree.fanout_pipes(mgid);
                    inner.tables.pvt_set(mgid, mask, ops)?;
                }
                Ok(())
            },
        )
    }

    pub fn associate(
        &self,
        sess: SessionHdl,
        mgid: Mgid,
        node: NodeHdl,
        xid: Option<Xid>,
        use_xid: bool,
    ) -> Result<()> {
        self.mutate(
            sess,
            |inner, map| est_materialize_node(inner, map, node) + PVT_OPS,
            |inner, _, ops| {
                inner.tree.associate(
                    node,
                    mgid,
                    xid,
                    use_xid,
                    None,
                    &mut inner.alloc,
                    ops,
                )?;
                let mask = inner.tree.fanout_pipes(mgid);
                inner.tables.pvt_set(mgid, mask, ops)
            },
        )
    }

    pub fn dissociate(
        &self,
        sess: SessionHdl,
        mgid: Mgid,
        node: NodeHdl,
    ) -> Result<()> {
        self.mutate(
            sess,
            |inner, map| est_materialize_node(inner, map, node) + PVT_OPS,
            |inner, _, ops| {
                inner.tree.dissociate(node, mgid, &mut inner.alloc, ops)?;
                let mask = inner.tree.fanout_pipes(mgid);
                inner.tables.pvt_set(mgid, mask, ops)
            },
        )
    }

    // ----------------------------------------------------------------
    // ECMP
    // ----------------------------------------------------------------

    pub fn ecmp_alloc(&self, sess: SessionHdl) -> Result<EcmpHdl> {
        self.mutate(
            sess,
            |_, map| map.pipes as usize * 9,
            |inner, _, ops| inner.ecmp.alloc(&mut inner.alloc, ops),
        )
    }

    pub fn ecmp_free(&self, sess: SessionHdl, grp: EcmpHdl) -> Result<()> {
        self.mutate(
            sess,
            |inner, map| est_ecmp_teardown(inner, map, grp),
            |inner, _, ops| {
                inner.ecmp.free(grp, &mut inner.tree, &mut inner.alloc, ops)
            },
        )
    }

    pub fn ecmp_mbr_add(
        &self,
        sess: SessionHdl,
        grp: EcmpHdl,
        node: NodeHdl,
    ) -> Result<()> {
        self.mutate(
            sess,
            |inner, map| {
                est_ecmp_grow(inner, map, grp)
                    + est_materialize_node(inner, map, node)
                    + est_vec_refresh(inner, map, grp)
            },
            |inner, _, ops| {
                inner.ecmp.mbr_add(
                    grp,
                    node,
                    &mut inner.tree,
                    &mut inner.alloc,
                    ops,
                )
            },
        )
    }

    pub fn ecmp_mbr_rem(
        &self,
        sess: SessionHdl,
        grp: EcmpHdl,
        node: NodeHdl,
    ) -> Result<()> {
        self.mutate(
            sess,
            |inner, map| {
                est_materialize_node(inner, map, node)
                    + est_vec_refresh(inner, map, grp)
            },
            |inner, _, ops| {
                inner.ecmp.mbr_rem(
                    grp,
                    node,
                    &mut inner.tree,
                    &mut inner.alloc,
                    ops,
                )
            },
        )
    }

    /// Replace the whole member set in one publish.
    pub fn ecmp_mbr_mod(
        &self,
        sess: SessionHdl,
        grp: EcmpHdl,
        nodes: &[NodeHdl],
    ) -> Result<()> {
        self.mutate(
            sess,
            |inner, map| {
                let new: usize = nodes
                    .iter()
                    .map(|n| est_materialize_node(inner, map, *n))
                    .sum();
                est_ecmp_teardown(inner, map, grp)
                    + 5 * est_ecmp_grow(inner, map, grp)
                    + new
                    + est_vec_refresh(inner, map, grp)
            },
            |inner, _, ops| {
                inner.ecmp.mbr_mod(
                    grp,
                    nodes,
                    &mut inner.tree,
                    &mut inner.alloc,
                    ops,
                )
            },
        )
    }

    pub fn ecmp_associate(
        &self,
        sess: SessionHdl,
        mgid: Mgid,
        grp: EcmpHdl,
        xid: Option<Xid>,
        use_xid: bool,
    ) -> Result<()> {
        self.mutate(
            sess,
            |_, map| map.pipes as usize * 5 + PVT_OPS,
            |inner, _, ops| {
                inner.ecmp.associate(
                    grp,
                    mgid,
                    xid,
                    use_xid,
                    &mut inner.tree,
                    &mut inner.alloc,
                    ops,
                )?;
                let mask = inner.tree.fanout_pipes(mgid);
                inner.tables.pvt_set(mgid, mask, ops)
            },
        )
    }

    pub fn ecmp_dissociate(
        &self,
        sess: SessionHdl,
        mgid: Mgid,
        grp: EcmpHdl,
    ) -> Result<()> {
        self.mutate(
            sess,
            |_, map| map.pipes as usize * 5 + PVT_OPS,
            |inner, _, ops| {
                inner.ecmp.dissociate(
                    grp,
                    mgid,
                    &mut inner.tree,
                    &mut inner.alloc,
                    ops,
                )?;
                let mask = inner.tree.fanout_pipes(mgid);
                inner.tables.pvt_set(mgid, mask, ops)
            },
        )
    }

    // ----------------------------------------------------------------
    // Mirror tables and control registers
    // ----------------------------------------------------------------

    pub fn tvt_set(
        &self,
        sess: SessionHdl,
        mgid: Mgid,
        mask: u8,
    ) -> Result<()> {
        self.mutate(
            sess,
            |_, _| 1,
            |inner, _, ops| inner.tables.tvt_set(mgid, mask, ops),
        )
    }

    pub fn pmt_set(
        &self,
        sess: SessionHdl,
        yid: Yid,
        ports: &[PortId],
    ) -> Result<()> {
        self.mutate(
            sess,
            |_, _| 2,
            |inner, map, ops| {
                let mask = port_mask(map, ports)?;
                inner.tables.pmt_set(yid, mask, ops)
            },
        )
    }

    pub fn lag_set(
        &self,
        sess: SessionHdl,
        lag: LagId,
        ports: &[PortId],
    ) -> Result<()> {
        self.mutate(
            sess,
            |_, _| 2,
            |inner, map, ops| {
                let mask = port_mask(map, ports)?;
                inner.tables.lit_set(lag, mask, ops)
            },
        )
    }

    /// Left/right remote member counts for one LAG, used by the
    /// hardware's hash spread across a multi-chip fabric.
    pub fn lag_remote_count_set(
        &self,
        sess: SessionHdl,
        lag: LagId,
        left: u16,
        right: u16,
    ) -> Result<()> {
        self.mutate(
            sess,
            |_, _| 1,
            |inner, _, ops| inner.tables.lit_np_set(lag, left, right, ops),
        )
    }

    pub fn backup_port_set(
        &self,
        sess: SessionHdl,
        port: PortId,
        backup: PortId,
    ) -> Result<()> {
        self.mutate(
            sess,
            |_, _| 1,
            |inner, _, ops| inner.tables.backup_set(port, backup, ops),
        )
    }

    /// Replace the global liveness mask atomically (inactive-version
    /// write plus selector flip).
    pub fn port_mask_set(
        &self,
        sess: SessionHdl,
        ports: &[PortId],
    ) -> Result<()> {
        self.mutate(
            sess,
            |_, _| 3,
            |inner, map, ops| {
                let mask = port_mask(map, ports)?;
                inner.tables.port_mask_set(mask, ops)
            },
        )
    }

    /// Clear one sticky hardware port-down bit after the controller
    /// has handled the failover.
    pub fn port_down_clear(
        &self,
        sess: SessionHdl,
        port: PortId,
    ) -> Result<()> {
        self.mutate(
            sess,
            |_, _| 1,
            |_, map, ops| {
                if port.0 >= map.ports() {
                    return Err(McError::InvalidArgument(format!(
                        "port {} beyond device port count {}",
                        port.0,
                        map.ports()
                    )));
                }
                ops.push(WriteOp::PortDownClr { port: port.0 });
                Ok(())
            },
        )
    }

    pub fn global_rid_set(&self, sess: SessionHdl, rid: Rid) -> Result<()> {
        self.mutate(
            sess,
            |_, _| 1,
            |inner, _, ops| inner.tables.global_rid_set(rid, ops),
        )
    }

    pub fn fast_failover_set(
        &self,
        sess: SessionHdl,
        en: bool,
    ) -> Result<()> {
        self.common_ctrl_flag(sess, CommonCtrl::FAST_FAILOVER, en)
    }

    pub fn backup_port_en_set(
        &self,
        sess: SessionHdl,
        en: bool,
    ) -> Result<()> {
        self.common_ctrl_flag(sess, CommonCtrl::BACKUP_PORT_EN, en)
    }

    fn common_ctrl_flag(
        &self,
        sess: SessionHdl,
        flag: CommonCtrl,
        en: bool,
    ) -> Result<()> {
        self.mutate(
            sess,
            |_, _| 1,
            |inner, _, ops| {
                let mut ctrl = inner.tables.common_ctrl();
                ctrl.set(flag, en);
                inner.tables.common_ctrl_set(ctrl, ops)
            },
        )
    }

    pub fn pipe_ctrl_set(
        &self,
        sess: SessionHdl,
        pipe: Pipe,
        ctrl: PipeCtrl,
    ) -> Result<()> {
        self.mutate(
            sess,
            |_, _| 1,
            |inner, _, ops| inner.tables.pipe_ctrl_set(pipe.0, ctrl, ops),
        )
    }

    pub fn max_nodes_set(
        &self,
        sess: SessionHdl,
        l1: u32,
        l2: u32,
    ) -> Result<()> {
        self.mutate(
            sess,
            |_, _| 1,
            |inner, _, ops| inner.tables.max_nodes_set(l1, l2, ops),
        )
    }

    // ----------------------------------------------------------------
    // Getters
    // ----------------------------------------------------------------

    pub fn tvt_get(&self, dev: Dev, mgid: Mgid) -> Result<u8> {
        Ok(self.device(dev)?.lock().tables.tvt(mgid))
    }

    pub fn pvt_get(&self, dev: Dev, mgid: Mgid) -> Result<u8> {
        Ok(self.device(dev)?.lock().tables.pvt_active(mgid))
    }

    pub fn pmt_get(&self, dev: Dev, yid: Yid) -> Result<PortMask> {
        let device = self.device(dev)?;
        if yid.0 >= device.map.yids {
            return Err(McError::InvalidArgument(format!(
                "yid {} beyond device yid count {}",
                yid.0, device.map.yids
            )));
        }
        Ok(device.lock().tables.pmt_active(yid))
    }

    pub fn lag_get(&self, dev: Dev, lag: LagId) -> Result<PortMask> {
        Ok(self.device(dev)?.lock().tables.lit_active(lag))
    }

    pub fn lag_remote_count_get(
        &self,
        dev: Dev,
        lag: LagId,
    ) -> Result<(u16, u16)> {
        Ok(self.device(dev)?.lock().tables.lit_np(lag))
    }

    pub fn backup_port_get(&self, dev: Dev, port: PortId) -> Result<PortId> {
        let device = self.device(dev)?;
        if port.0 >= device.map.ports() {
            return Err(McError::InvalidArgument(format!(
                "port {} beyond device port count {}",
                port.0,
                device.map.ports()
            )));
        }
        Ok(device.lock().tables.backup(port))
    }

    pub fn port_mask_get(&self, dev: Dev) -> Result<PortMask> {
        Ok(self.device(dev)?.lock().tables.port_mask_active())
    }

    /// The sticky port-down bits, read live from the hardware. The
    /// subdevices must agree.
    pub fn port_down_get(&self, dev: Dev) -> Result<PortMask> {
        let device = self.device(dev)?;
        device.read_agree("port-down", |sd| device.hw.read_port_down(sd))
    }

    pub fn global_rid_get(&self, dev: Dev) -> Result<Rid> {
        Ok(self.device(dev)?.lock().tables.global_rid())
    }

    pub fn common_ctrl_get(&self, dev: Dev) -> Result<CommonCtrl> {
        Ok(self.device(dev)?.lock().tables.common_ctrl())
    }

    pub fn pipe_ctrl_get(&self, dev: Dev, pipe: Pipe) -> Result<PipeCtrl> {
        let device = self.device(dev)?;
        if pipe.0 >= device.map.pipes {
            return Err(McError::InvalidArgument(format!(
                "pipe {} beyond device pipe count {}",
                pipe.0, device.map.pipes
            )));
        }
        Ok(device.lock().tables.pipe_ctrl(pipe.0))
    }

    pub fn max_nodes_get(&self, dev: Dev) -> Result<(u32, u32)> {
        Ok(self.device(dev)?.lock().tables.max_nodes())
    }

    // ----------------------------------------------------------------
    // Dumps
    // ----------------------------------------------------------------

    pub fn mgrp_dump(&self, dev: Dev, mgid: Mgid) -> Result<MgrpDumpResp> {
        let device = self.device(dev)?;
        let inner = device.lock();
        let entry = inner.tree.mgid_entry(mgid).ok_or_else(|| {
            McError::InvalidArgument(format!("no such mgid: {:?}", mgid))
        })?;

        let mit_roots = (0..device.map.pipes)
            .map(|p| inner.tree.mit_root(Pipe(p), mgid))
            .collect();

        let mut l1 = Vec::with_capacity(entry.members.len());
        for hdl in &entry.members {
            let node = inner.tree.node(*hdl)?;
            let mut pipes = Vec::new();
            for p in (0..device.map.pipes).map(Pipe) {
                let Some(hw) = node.hw_pipe(p) else { continue };
                let next = hw
                    .next
                    .and_then(|n| {
                        inner.tree.node(n).ok().and_then(|n| n.hw_pipe(p))
                    })
                    .map(|h| h.addr)
                    .unwrap_or(RdmAddr::NULL);
                pipes.push(L1PipeDump {
                    pipe: p.0,
                    addr: hw.addr,
                    next,
                    l2_nodes: hw.l2.len() as u32,
                });
            }
            l1.push(L1Dump {
                node: *hdl,
                rid: node.rid.0,
                xid: node.xid.map(|x| x.0),
                ecmp: node.ecmp_ptr,
                ports: node.ports.iter_ones().collect(),
                lags: node.lags.iter_ones().map(|l| l as u8).collect(),
                pipes,
            });
        }
        Ok(MgrpDumpResp { mgid, mit_roots, l1 })
    }

    pub fn ecmp_dump(&self, dev: Dev, grp: EcmpHdl) -> Result<EcmpDumpResp> {
        let device = self.device(dev)?;
        let inner = device.lock();
        let g = inner.ecmp.grp(grp)?;

        let mut mbrs = Vec::with_capacity(g.count as usize);
        let mut cur = g.head;
        while let Some(n) = cur {
            mbrs.push(n);
            cur = inner.tree.node(n)?.ecmp_mbr.and_then(|l| l.next);
        }

        Ok(EcmpDumpResp {
            hdl: grp,
            mbrs,
            bases: g.pipes.iter().map(|p| p.base).collect(),
            vectors: g.pipes.iter().map(|p| (p.vec[0], p.vec[1])).collect(),
            assoc_mgids: inner.ecmp.assoc_mgids(grp, &inner.tree),
        })
    }

    pub fn rdm_dump(&self, dev: Dev) -> Result<RdmDumpResp> {
        let device = self.device(dev)?;
        let inner = device.lock();
        Ok(RdmDumpResp {
            free: inner.alloc.free_runs(),
            used_halves: inner.alloc.used_halves(),
            owners: inner.alloc.owners().map(|(b, p)| (b, p.0 as u16)).collect(),
        })
    }

    // ----------------------------------------------------------------
    // Verification
    // ----------------------------------------------------------------

    /// Walk one MGID's hardware tree and compare it against the
    /// shadow.
    pub fn verify_mgid(&self, dev: Dev, mgid: Mgid) -> Result<VerifyResp> {
        let device = self.device(dev)?;
        let inner = device.lock();
        let resp = verify::verify_mgid(
            &device.map,
            &inner.tree,
            &inner.ecmp,
            device.hw.as_ref(),
            mgid,
        )?;
        if !resp.clean() {
            error!(
                device.log,
                "mgid verify found divergence";
                "mgid" => mgid.0,
                "mismatches" => resp.mismatches.len(),
            );
        }
        Ok(resp)
    }

    /// Compare one table's shadow against every subdevice.
    pub fn verify_table(&self, dev: Dev, tbl: TableId) -> Result<VerifyResp> {
        let device = self.device(dev)?;
        let inner = device.lock();
        let resp = verify::verify_table(
            &device.map,
            &inner.tables,
            &inner.tree,
            device.hw.as_ref(),
            tbl,
        )?;
        if !resp.clean() {
            error!(
                device.log,
                "table verify found divergence";
                "table" => tbl.name(),
                "mismatches" => resp.mismatches.len(),
            );
        }
        Ok(resp)
    }
}

/// Descriptors a PVT point update stages.
const PVT_OPS: usize = 2;

fn port_mask(map: &AddrMap, ports: &[PortId]) -> Result<PortMask> {
    let mut mask = PortMask::new();
    for port in ports {
        if port.0 >= map.ports() {
            return Err(McError::InvalidArgument(format!(
                "port {} beyond device port count {}",
                port.0,
                map.ports()
            )));
        }
        mask.set(port.0, true);
    }
    Ok(mask)
}

fn lag_mask(lags: &[LagId]) -> LagMask {
    let mut mask = LagMask::new();
    for lag in lags {
        mask.set(lag.0 as u16, true);
    }
    mask
}

// Worst-case descriptor counts, reserved before mutation. Every
// formula over-counts; the unused remainder returns to the pool at
// commit.

fn l2_worst(node: &L1Node) -> usize {
    1 + node.lags.count() as usize
}

/// Materializing (or tearing down) one node across every pipe: the
/// L2 chain, the L1 line, block-ownership churn and the MIT or
/// predecessor write.
fn est_materialize_node(
    inner: &DevInner,
    map: &AddrMap,
    node: NodeHdl,
) -> usize {
    let l2 = inner.tree.node(node).map(|n| l2_worst(n)).unwrap_or(1);
    map.pipes as usize * (3 * (l2 + 1) + 2)
}

fn est_vec_refresh(inner: &DevInner, map: &AddrMap, grp: EcmpHdl) -> usize {
    let assoc =
        inner.ecmp.grp(grp).map(|g| g.assoc.len()).unwrap_or(0);
    map.pipes as usize * (10 + assoc)
}

fn est_ecmp_grow(inner: &DevInner, map: &AddrMap, grp: EcmpHdl) -> usize {
    let count = inner.ecmp.grp(grp).map(|g| g.count as usize).unwrap_or(0);
    map.pipes as usize * (count + 4)
}

fn est_ecmp_teardown(inner: &DevInner, map: &AddrMap, grp: EcmpHdl) -> usize {
    let Ok(g) = inner.ecmp.grp(grp) else {
        return 0;
    };
    let mbrs: usize = g
        .mbrs
        .iter()
        .flatten()
        .map(|n| est_materialize_node(inner, map, *n))
        .sum();
    mbrs + map.pipes as usize * 6
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::hw::FakeTransport;

    fn harness(family: Family) -> (Mcast, Dev, SessionHdl, Arc<FakeTransport>)
    {
        let log = Logger::root(slog::Discard, o!());
        let mcast = Mcast::new(log);
        let dev = Dev(0);
        let hw = Arc::new(FakeTransport::new(&AddrMap::new(family)));
        mcast
            .attach(dev, family, Arc::clone(&hw) as Arc<dyn Transport>)
            .unwrap();
        let sess = mcast.session_create(dev).unwrap();
        (mcast, dev, sess, hw)
    }

    #[test]
    fn associate_updates_pvt_and_mit() {
        let (mcast, dev, sess, hw) = harness(Family::Gen1);
        mcast.mgrp_create(sess, Mgid(0x10)).unwrap();
        let n = mcast
            .node_create(sess, Rid(1), &[PortId(3), PortId(7)], &[])
            .unwrap();
        mcast.associate(sess, Mgid(0x10), n, None, false).unwrap();

        // Ports 3 and 7 live in pipe 0: PVT must show exactly pipe 0.
        assert_eq!(mcast.pvt_get(dev, Mgid(0x10)).unwrap(), 0b0001);
        assert_eq!(hw.read_pvt(0, 0, 0x10).unwrap(), 0b0001);
        assert_eq!(hw.read_pvt(0, 1, 0x10).unwrap(), 0b0001);

        // The hardware MIT row carries a root for the group.
        let row = hw.read_mit_row(0, 0, 0x10 / 4).unwrap();
        assert_ne!(row.0[0], 0);

        mcast.dissociate(sess, Mgid(0x10), n).unwrap();
        assert_eq!(mcast.pvt_get(dev, Mgid(0x10)).unwrap(), 0);
        let row = hw.read_mit_row(0, 0, 0x10 / 4).unwrap();
        assert_eq!(row.0[0], 0);
    }

    #[test]
    fn batch_defers_flush() {
        let (mcast, _, sess, hw) = harness(Family::Gen1);
        mcast.batch_begin(sess).unwrap();
        mcast.global_rid_set(sess, Rid(0x42)).unwrap();
        assert_eq!(hw.read_global_rid(0).unwrap(), 0);

        mcast.batch_end(sess).unwrap();
        assert_eq!(hw.read_global_rid(0).unwrap(), 0x42);
    }

    #[test]
    fn flush_failure_marks_resync() {
        let (mcast, dev, sess, hw) = harness(Family::Gen1);
        hw.fail_from(1);
        let err = mcast.global_rid_set(sess, Rid(1)).unwrap_err();
        assert!(matches!(err, McError::HwCommFail(_)));
        assert!(mcast.needs_resync(dev).unwrap());

        // Further mutation is refused.
        let err = mcast.mgrp_create(sess, Mgid(1)).unwrap_err();
        assert!(matches!(err, McError::Unexpected(_)));
    }

    #[test]
    fn writes_fan_out_to_all_subdevs() {
        let (mcast, _, sess, hw) = harness(Family::Gen2);
        mcast.global_rid_set(sess, Rid(0x77)).unwrap();
        assert_eq!(hw.read_global_rid(0).unwrap(), 0x77);
        assert_eq!(hw.read_global_rid(1).unwrap(), 0x77);
    }

    #[test]
    fn session_destroy_discards_open_batch() {
        let (mcast, dev, sess, hw) = harness(Family::Gen1);
        mcast.batch_begin(sess).unwrap();
        mcast.global_rid_set(sess, Rid(9)).unwrap();
        mcast.session_destroy(sess).unwrap();
        assert_eq!(hw.read_global_rid(0).unwrap(), 0);

        // The gate was released: a new session can mutate.
        let sess2 = mcast.session_create(dev).unwrap();
        mcast.global_rid_set(sess2, Rid(1)).unwrap();
        assert_eq!(hw.read_global_rid(0).unwrap(), 1);
    }

    #[test]
    fn detach_refused_with_open_sessions() {
        let (mcast, dev, sess, _) = harness(Family::Gen1);
        let err = mcast.detach(dev).unwrap_err();
        assert!(matches!(err, McError::InvalidArgument(_)));
        mcast.session_destroy(sess).unwrap();
        mcast.detach(dev).unwrap();
    }
}
