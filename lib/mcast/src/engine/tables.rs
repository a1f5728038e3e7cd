// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Software shadows of the mirror tables.
//!
//! Four tables are double-buffered in hardware (PVT, PMT, LIT,
//! port-mask), each behind its own version selector. A point update
//! writes the same entry into both versions, so the selector position
//! never matters. A bulk update writes the whole new image into the
//! inactive version, flips the selector (one register write, atomic
//! to readers), then brings the stale version back in sync so point
//! updates stay version-blind.
//!
//! The remaining tables (TVT, LIT backup pairs, backup ports,
//! global RID, control registers) are single-copy.

use super::Result;
use super::addr::AddrMap;
use super::hw::CommonCtrl;
use super::hw::PipeCtrl;
use super::hw::PortMask;
use super::hw::VersionedTable;
use super::hw::WriteOp;
use mcast_api::LagId;
use mcast_api::McError;
use mcast_api::Mgid;
use mcast_api::PortId;
use mcast_api::Rid;
use mcast_api::Yid;

pub struct MirrorTables {
    map: AddrMap,
    pvt: [Vec<u8>; 2],
    tvt: Vec<u8>,
    pmt: [Vec<PortMask>; 2],
    lit: [Vec<PortMask>; 2],
    lit_np: Vec<(u16, u16)>,
    backup: Vec<u16>,
    port_mask: [PortMask; 2],
    global_rid: Rid,
    common_ctrl: CommonCtrl,
    pipe_ctrl: Vec<PipeCtrl>,
    max_l1: u32,
    max_l2: u32,
    /// Active version per mirrored table.
    ver: [u8; 4],
}

impl MirrorTables {
    pub fn new(map: &AddrMap) -> Self {
        Self {
            map: map.clone(),
            pvt: [vec![0; map.mgids as usize], vec![0; map.mgids as usize]],
            tvt: vec![0; map.mgids as usize],
            pmt: [
                vec![PortMask::new(); map.yids as usize],
                vec![PortMask::new(); map.yids as usize],
            ],
            lit: [
                vec![PortMask::new(); map.lags as usize],
                vec![PortMask::new(); map.lags as usize],
            ],
            lit_np: vec![(0, 0); map.lags as usize],
            backup: vec![0; map.ports() as usize],
            port_mask: [PortMask::new(); 2],
            global_rid: Rid(0),
            common_ctrl: CommonCtrl::default(),
            pipe_ctrl: vec![PipeCtrl::default(); map.pipes as usize],
            max_l1: 0,
            max_l2: 0,
            ver: [0; 4],
        }
    }

    fn check_lag(&self, lag: LagId) -> Result<()> {
        if lag.0 as u16 >= self.map.lags {
            return Err(McError::InvalidArgument(format!(
                "lag {} beyond device lag count {}",
                lag.0, self.map.lags
            )));
        }
        Ok(())
    }

    fn check_port(&self, port: PortId) -> Result<()> {
        if port.0 >= self.map.ports() {
            return Err(McError::InvalidArgument(format!(
                "port {} beyond device port count {}",
                port.0,
                self.map.ports()
            )));
        }
        Ok(())
    }

    fn check_ports(&self, mask: &PortMask) -> Result<()> {
        for port in mask.iter_ones() {
            self.check_port(PortId(port))?;
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Version selectors
    // ----------------------------------------------------------------

    pub fn active_ver(&self, tbl: VersionedTable) -> u8 {
        self.ver[tbl.index()]
    }

    fn inactive_ver(&self, tbl: VersionedTable) -> u8 {
        self.ver[tbl.index()] ^ 1
    }

    /// Stage the selector flip for one table.
    fn flip(&mut self, tbl: VersionedTable, wrl: &mut Vec<WriteOp>) {
        let ver = self.inactive_ver(tbl);
        self.ver[tbl.index()] = ver;
        wrl.push(WriteOp::TblVer { tbl, ver });
    }

    // ----------------------------------------------------------------
    // PVT: mgid -> pipe fan-out vector
    // ----------------------------------------------------------------

    pub fn pvt_set(
        &mut self,
        mgid: Mgid,
        mask: u8,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        if mask & !self.map.pipe_mask_all() != 0 {
            return Err(McError::InvalidArgument(format!(
                "pvt mask {:#x} names pipes beyond the device",
                mask
            )));
        }
        for ver in 0..2u8 {
            self.pvt[ver as usize][mgid.0 as usize] = mask;
            wrl.push(WriteOp::Pvt { ver, mgid: mgid.0, mask });
        }
        Ok(())
    }

    pub fn pvt(&self, ver: u8, mgid: Mgid) -> u8 {
        self.pvt[ver as usize][mgid.0 as usize]
    }

    pub fn pvt_active(&self, mgid: Mgid) -> u8 {
        self.pvt(self.active_ver(VersionedTable::Pvt), mgid)
    }

    // ----------------------------------------------------------------
    // TVT: mgid -> CPU/tunnel copy control
    // ----------------------------------------------------------------

    pub fn tvt_set(
        &mut self,
        mgid: Mgid,
        mask: u8,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        self.tvt[mgid.0 as usize] = mask;
        wrl.push(WriteOp::Tvt { mgid: mgid.0, mask });
        Ok(())
    }

    pub fn tvt(&self, mgid: Mgid) -> u8 {
        self.tvt[mgid.0 as usize]
    }

    // ----------------------------------------------------------------
    // PMT: yid -> prune mask
    // ----------------------------------------------------------------

    pub fn pmt_set(
        &mut self,
        yid: Yid,
        mask: PortMask,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        if yid.0 >= self.map.yids {
            return Err(McError::InvalidArgument(format!(
                "yid {} beyond device yid count {}",
                yid.0, self.map.yids
            )));
        }
        self.check_ports(&mask)?;
        for ver in 0..2u8 {
            self.pmt[ver as usize][yid.0 as usize] = mask;
            wrl.push(WriteOp::Pmt { ver, yid: yid.0, mask });
        }
        Ok(())
    }

    pub fn pmt(&self, ver: u8, yid: Yid) -> PortMask {
        self.pmt[ver as usize][yid.0 as usize]
    }

    pub fn pmt_active(&self, yid: Yid) -> PortMask {
        self.pmt(self.active_ver(VersionedTable::Pmt), yid)
    }

    // ----------------------------------------------------------------
    // LIT: lag -> member ports, plus the left/right remote counts
    // ----------------------------------------------------------------

    pub fn lit_set(
        &mut self,
        lag: LagId,
        mask: PortMask,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        self.check_lag(lag)?;
        self.check_ports(&mask)?;
        for ver in 0..2u8 {
            self.lit[ver as usize][lag.0 as usize] = mask;
            wrl.push(WriteOp::Lit { ver, lag: lag.0, mask });
        }
        Ok(())
    }

    /// Replace every LIT entry at once: stage the full image into the
    /// inactive version, flip, then re-sync the stale version.
    pub fn lit_bulk_set(
        &mut self,
        masks: &[PortMask],
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        if masks.len() != self.map.lags as usize {
            return Err(McError::InvalidArgument(format!(
                "lit image has {} entries, device has {} lags",
                masks.len(),
                self.map.lags
            )));
        }
        for mask in masks {
            self.check_ports(mask)?;
        }
        let stale = self.inactive_ver(VersionedTable::Lit);
        for ver in [stale, stale ^ 1] {
            for (lag, mask) in masks.iter().enumerate() {
                self.lit[ver as usize][lag] = *mask;
                wrl.push(WriteOp::Lit { ver, lag: lag as u8, mask: *mask });
            }
            if ver == stale {
                self.flip(VersionedTable::Lit, wrl);
            }
        }
        Ok(())
    }

    pub fn lit(&self, ver: u8, lag: LagId) -> PortMask {
        self.lit[ver as usize][lag.0 as usize]
    }

    pub fn lit_active(&self, lag: LagId) -> PortMask {
        self.lit(self.active_ver(VersionedTable::Lit), lag)
    }

    pub fn lit_np_set(
        &mut self,
        lag: LagId,
        left: u16,
        right: u16,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        self.check_lag(lag)?;
        self.lit_np[lag.0 as usize] = (left, right);
        wrl.push(WriteOp::LitNp { lag: lag.0, left, right });
        Ok(())
    }

    pub fn lit_np(&self, lag: LagId) -> (u16, u16) {
        self.lit_np[lag.0 as usize]
    }

    // ----------------------------------------------------------------
    // Backup ports
    // ----------------------------------------------------------------

    pub fn backup_set(
        &mut self,
        port: PortId,
        backup: PortId,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        self.check_port(port)?;
        self.check_port(backup)?;
        self.backup[port.0 as usize] = backup.0;
        wrl.push(WriteOp::BackupPort { port: port.0, backup: backup.0 });
        Ok(())
    }

    pub fn backup(&self, port: PortId) -> PortId {
        PortId(self.backup[port.0 as usize])
    }

    // ----------------------------------------------------------------
    // Global port liveness mask
    // ----------------------------------------------------------------

    pub fn port_mask_set(
        &mut self,
        mask: PortMask,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        self.check_ports(&mask)?;
        let stale = self.inactive_ver(VersionedTable::PortMask);
        for ver in [stale, stale ^ 1] {
            self.port_mask[ver as usize] = mask;
            wrl.push(WriteOp::PortMaskTbl { ver, mask });
            if ver == stale {
                self.flip(VersionedTable::PortMask, wrl);
            }
        }
        Ok(())
    }

    pub fn port_mask(&self, ver: u8) -> PortMask {
        self.port_mask[ver as usize]
    }

    pub fn port_mask_active(&self) -> PortMask {
        self.port_mask(self.active_ver(VersionedTable::PortMask))
    }

    // ----------------------------------------------------------------
    // Control registers
    // ----------------------------------------------------------------

    pub fn global_rid_set(
        &mut self,
        rid: Rid,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        self.global_rid = rid;
        wrl.push(WriteOp::GlobalRid { rid: rid.0 });
        Ok(())
    }

    pub fn global_rid(&self) -> Rid {
        self.global_rid
    }

    pub fn common_ctrl_set(
        &mut self,
        ctrl: CommonCtrl,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        self.common_ctrl = ctrl;
        wrl.push(WriteOp::CommonCtrl { ctrl });
        Ok(())
    }

    pub fn common_ctrl(&self) -> CommonCtrl {
        self.common_ctrl
    }

    pub fn pipe_ctrl_set(
        &mut self,
        pipe: u8,
        ctrl: PipeCtrl,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        if pipe >= self.map.pipes {
            return Err(McError::InvalidArgument(format!(
                "pipe {} beyond device pipe count {}",
                pipe, self.map.pipes
            )));
        }
        if ctrl.cpu_copy_en {
            self.check_port(PortId(ctrl.cpu_port))?;
        }
        self.pipe_ctrl[pipe as usize] = ctrl;
        wrl.push(WriteOp::PipeCtrl { pipe, ctrl });
        Ok(())
    }

    pub fn pipe_ctrl(&self, pipe: u8) -> PipeCtrl {
        self.pipe_ctrl[pipe as usize]
    }

    pub fn max_nodes_set(
        &mut self,
        l1: u32,
        l2: u32,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        self.max_l1 = l1;
        self.max_l2 = l2;
        wrl.push(WriteOp::MaxNodes { l1, l2 });
        Ok(())
    }

    pub fn max_nodes(&self) -> (u32, u32) {
        (self.max_l1, self.max_l2)
    }
}
