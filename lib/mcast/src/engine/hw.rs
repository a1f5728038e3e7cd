// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The hardware accessor boundary.
//!
//! Every hardware mutation is a typed [`WriteOp`] descriptor; the
//! engine stages descriptors through the session write-list and a
//! [`Transport`] applies them, in order, to one subdevice (die).
//! Synchronous typed reads exist only for values that must be
//! returned to a caller immediately: read-back verification and the
//! consistency verifier.
//!
//! [`FakeTransport`] is the in-memory implementation backing tests
//! and the `mcastadm` simulator. A real implementation would sit on
//! MMIO/DMA and use the same descriptors.

use super::Result;
use super::addr::AddrMap;
use bitflags::bitflags;
use core::fmt;
use mcast_api::McError;
use mcast_api::Pipe;
use mcast_api::RdmAddr;
use serde::Deserialize;
use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::Relaxed;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

macro_rules! bitset {
    ($name:ident, $words:expr, $bits:expr) => {
        /// A fixed-width hardware bit vector.
        #[derive(
            Clone, Copy, Eq, PartialEq, FromBytes, Immutable, IntoBytes,
            KnownLayout,
        )]
        pub struct $name(pub [u64; $words]);

        impl $name {
            pub const BITS: u16 = $bits;

            pub fn new() -> Self {
                Self([0; $words])
            }

            pub fn get(&self, bit: u16) -> bool {
                debug_assert!(bit < $bits);
                self.0[usize::from(bit) / 64] & (1 << (bit % 64)) != 0
            }

            pub fn set(&mut self, bit: u16, val: bool) {
                debug_assert!(bit < $bits);
                let word = &mut self.0[usize::from(bit) / 64];
                if val {
                    *word |= 1 << (bit % 64);
                } else {
                    *word &= !(1 << (bit % 64));
                }
            }

            pub fn is_empty(&self) -> bool {
                self.0.iter().all(|w| *w == 0)
            }

            pub fn count(&self) -> u32 {
                self.0.iter().map(|w| w.count_ones()).sum()
            }

            pub fn iter_ones(&self) -> impl Iterator<Item = u16> + '_ {
                (0..$bits).filter(|b| self.get(*b))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, concat!(stringify!($name), "["))?;
                let mut first = true;
                for bit in self.iter_ones() {
                    if !first {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", bit)?;
                    first = false;
                }
                write!(f, "]")
            }
        }
    };
}

// 288 device-global port bits, every family.
bitset!(PortMask, 5, 288);
// 256 LAG bits.
bitset!(LagMask, 4, 256);

/// One MIT row as the hardware stores it: four packed MGID roots.
/// Families that pack fewer roots per row leave the tail slots zero.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable,
    IntoBytes, KnownLayout,
)]
pub struct MitRow(pub [u32; 4]);

bitflags! {
    /// The common-control register.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct CommonCtrl: u32 {
        /// Selects which version of the pipe memories a CPU read
        /// observes.
        const PIPE_MEM_READ_SEL = 1 << 0;
        /// Enables hardware fast-failover on port-down.
        const FAST_FAILOVER = 1 << 1;
        /// Enables backup-port substitution.
        const BACKUP_PORT_EN = 1 << 2;
    }
}

/// Per-pipe control state.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct PipeCtrl {
    pub cpu_copy_en: bool,
    pub cpu_port: u16,
    /// L1 nodes processed per scheduling slice.
    pub l1_per_slice: u8,
}

/// The double-buffered mirror tables, each selected by its own
/// version register.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VersionedTable {
    Pvt,
    Pmt,
    Lit,
    PortMask,
}

impl VersionedTable {
    pub const ALL: [Self; 4] =
        [Self::Pvt, Self::Pmt, Self::Lit, Self::PortMask];

    pub fn index(self) -> usize {
        match self {
            Self::Pvt => 0,
            Self::Pmt => 1,
            Self::Lit => 2,
            Self::PortMask => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Pvt => "pvt",
            Self::Pmt => "pmt",
            Self::Lit => "lit",
            Self::PortMask => "port-mask",
        }
    }
}

/// A staged hardware mutation. Order within a write-list is the order
/// the hardware sees.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WriteOp {
    /// One RDM half-line: type tag plus 64-bit body.
    RdmHalf { addr: RdmAddr, tag: u8, body: u64 },
    /// One full RDM line (both halves, even-aligned address).
    RdmLine { addr: RdmAddr, tag: [u8; 2], body: [u64; 2] },
    /// Block-ownership register; `None` releases the block.
    BlockOwner { block: u16, owner: Option<Pipe> },
    MitRow { pipe: u8, row: u32, roots: MitRow },
    Pvt { ver: u8, mgid: u16, mask: u8 },
    Tvt { mgid: u16, mask: u8 },
    Pmt { ver: u8, yid: u16, mask: PortMask },
    Lit { ver: u8, lag: u8, mask: PortMask },
    LitNp { lag: u8, left: u16, right: u16 },
    BackupPort { port: u16, backup: u16 },
    PortMaskTbl { ver: u8, mask: PortMask },
    /// Clear one sticky port-down bit.
    PortDownClr { port: u16 },
    GlobalRid { rid: u16 },
    CommonCtrl { ctrl: CommonCtrl },
    PipeCtrl { pipe: u8, ctrl: PipeCtrl },
    MaxNodes { l1: u32, l2: u32 },
    /// Flip the version selector of one mirrored table.
    TblVer { tbl: VersionedTable, ver: u8 },
}

/// Per-subdevice typed access to the hardware.
///
/// Writes apply one descriptor at a time; a flush is a loop over the
/// staged list. Reads are synchronous. An implementation must apply a
/// single descriptor atomically with respect to concurrent readers --
/// in particular [`WriteOp::TblVer`], which is what makes the
/// double-buffer flip torn-read-free.
pub trait Transport: Send + Sync {
    fn subdevs(&self) -> u8;

    fn write(&self, sd: u8, op: &WriteOp) -> Result<()>;

    fn read_rdm_half(&self, sd: u8, addr: RdmAddr) -> Result<(u8, u64)>;
    fn read_mit_row(&self, sd: u8, pipe: u8, row: u32) -> Result<MitRow>;
    fn read_block_owner(&self, sd: u8, block: u16) -> Result<Option<Pipe>>;
    fn read_pvt(&self, sd: u8, ver: u8, mgid: u16) -> Result<u8>;
    fn read_tvt(&self, sd: u8, mgid: u16) -> Result<u8>;
    fn read_pmt(&self, sd: u8, ver: u8, yid: u16) -> Result<PortMask>;
    fn read_lit(&self, sd: u8, ver: u8, lag: u8) -> Result<PortMask>;
    fn read_lit_np(&self, sd: u8, lag: u8) -> Result<(u16, u16)>;
    fn read_backup_port(&self, sd: u8, port: u16) -> Result<u16>;
    fn read_port_mask(&self, sd: u8, ver: u8) -> Result<PortMask>;
    fn read_port_down(&self, sd: u8) -> Result<PortMask>;
    fn read_global_rid(&self, sd: u8) -> Result<u16>;
    fn read_common_ctrl(&self, sd: u8) -> Result<CommonCtrl>;
    fn read_tbl_ver(&self, sd: u8, tbl: VersionedTable) -> Result<u8>;
}

const BLOCK_UNOWNED: u8 = 0xff;

struct FakeState {
    rdm: Vec<(u8, u64)>,
    block_owner: Vec<u8>,
    mit: Vec<Vec<MitRow>>,
    pvt: [Vec<u8>; 2],
    tvt: Vec<u8>,
    pmt: [Vec<PortMask>; 2],
    lit: [Vec<PortMask>; 2],
    lit_np: Vec<(u16, u16)>,
    backup: Vec<u16>,
    port_mask: [PortMask; 2],
    port_down: PortMask,
    global_rid: u16,
    common_ctrl: CommonCtrl,
    pipe_ctrl: Vec<PipeCtrl>,
    max_l1: u32,
    max_l2: u32,
    tbl_ver: [u8; 4],
}

impl FakeState {
    fn new(map: &AddrMap) -> Self {
        let rows = map.mit_rows() as usize;
        Self {
            rdm: vec![(0, 0); map.rdm_half_lines() as usize],
            block_owner: vec![BLOCK_UNOWNED; map.rdm_blocks as usize],
            mit: vec![vec![MitRow::default(); rows]; map.pipes as usize],
            pvt: [
                vec![0; map.mgids as usize],
                vec![0; map.mgids as usize],
            ],
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
            port_down: PortMask::new(),
            global_rid: 0,
            common_ctrl: CommonCtrl::default(),
            pipe_ctrl: vec![PipeCtrl::default(); map.pipes as usize],
            max_l1: 0,
            max_l2: 0,
            tbl_ver: [0; 4],
        }
    }

    fn apply(&mut self, op: &WriteOp) {
        match *op {
            WriteOp::RdmHalf { addr, tag, body } => {
                self.rdm[addr.0 as usize] = (tag, body);
            }
            WriteOp::RdmLine { addr, tag, body } => {
                self.rdm[addr.0 as usize] = (tag[0], body[0]);
                self.rdm[addr.0 as usize + 1] = (tag[1], body[1]);
            }
            WriteOp::BlockOwner { block, owner } => {
                self.block_owner[block as usize] =
                    owner.map(|p| p.0).unwrap_or(BLOCK_UNOWNED);
            }
            WriteOp::MitRow { pipe, row, roots } => {
                self.mit[pipe as usize][row as usize] = roots;
            }
            WriteOp::Pvt { ver, mgid, mask } => {
                self.pvt[ver as usize][mgid as usize] = mask;
            }
            WriteOp::Tvt { mgid, mask } => {
                self.tvt[mgid as usize] = mask;
            }
            WriteOp::Pmt { ver, yid, mask } => {
                self.pmt[ver as usize][yid as usize] = mask;
            }
            WriteOp::Lit { ver, lag, mask } => {
                self.lit[ver as usize][lag as usize] = mask;
            }
            WriteOp::LitNp { lag, left, right } => {
                self.lit_np[lag as usize] = (left, right);
            }
            WriteOp::BackupPort { port, backup } => {
                self.backup[port as usize] = backup;
            }
            WriteOp::PortMaskTbl { ver, mask } => {
                self.port_mask[ver as usize] = mask;
            }
            WriteOp::PortDownClr { port } => {
                self.port_down.set(port, false);
            }
            WriteOp::GlobalRid { rid } => {
                self.global_rid = rid;
            }
            WriteOp::CommonCtrl { ctrl } => {
                self.common_ctrl = ctrl;
            }
            WriteOp::PipeCtrl { pipe, ctrl } => {
                self.pipe_ctrl[pipe as usize] = ctrl;
            }
            WriteOp::MaxNodes { l1, l2 } => {
                self.max_l1 = l1;
                self.max_l2 = l2;
            }
            WriteOp::TblVer { tbl, ver } => {
                self.tbl_ver[tbl.index()] = ver;
            }
        }
    }
}

/// The in-memory hardware model. One lock guards each subdevice, so
/// every descriptor applies atomically with respect to concurrent
/// readers, as real register writes do.
pub struct FakeTransport {
    subdevs: Vec<Mutex<FakeState>>,
    writes: AtomicU32,
    /// Fail the nth write and every one after it (test hook for the
    /// flush-failure path). 0 disables.
    fail_from: AtomicU32,
}

impl FakeTransport {
    pub fn new(map: &AddrMap) -> Self {
        let subdevs =
            (0..map.subdevs).map(|_| Mutex::new(FakeState::new(map))).collect();
        Self { subdevs, writes: AtomicU32::new(0), fail_from: AtomicU32::new(0) }
    }

    /// Fail every write starting with the `n`th one from now.
    pub fn fail_from(&self, n: u32) {
        self.writes.store(0, Relaxed);
        self.fail_from.store(n, Relaxed);
    }

    /// Total writes applied, across subdevices.
    pub fn writes_applied(&self) -> u32 {
        self.writes.load(Relaxed)
    }

    /// Simulate a link-down event: hardware sets the sticky bit.
    pub fn set_port_down(&self, sd: u8, port: u16) {
        self.subdevs[sd as usize].lock().unwrap().port_down.set(port, true);
    }

    fn state(&self, sd: u8) -> Result<&Mutex<FakeState>> {
        self.subdevs.get(sd as usize).ok_or_else(|| {
            McError::HwCommFail(format!("no such subdevice: {}", sd))
        })
    }
}

impl Transport for FakeTransport {
    fn subdevs(&self) -> u8 {
        self.subdevs.len() as u8
    }

    fn write(&self, sd: u8, op: &WriteOp) -> Result<()> {
        let n = self.writes.fetch_add(1, Relaxed) + 1;
        let fail_from = self.fail_from.load(Relaxed);
        if fail_from != 0 && n >= fail_from {
            return Err(McError::HwCommFail(format!(
                "write {} refused by fault injection",
                n
            )));
        }
        self.state(sd)?.lock().unwrap().apply(op);
        Ok(())
    }

    fn read_rdm_half(&self, sd: u8, addr: RdmAddr) -> Result<(u8, u64)> {
        let state = self.state(sd)?.lock().unwrap();
        state.rdm.get(addr.0 as usize).copied().ok_or_else(|| {
            McError::HwCommFail(format!("rdm read out of range: {}", addr))
        })
    }

    fn read_mit_row(&self, sd: u8, pipe: u8, row: u32) -> Result<MitRow> {
        Ok(self.state(sd)?.lock().unwrap().mit[pipe as usize][row as usize])
    }

    fn read_block_owner(&self, sd: u8, block: u16) -> Result<Option<Pipe>> {
        let owner =
            self.state(sd)?.lock().unwrap().block_owner[block as usize];
        Ok((owner != BLOCK_UNOWNED).then_some(Pipe(owner)))
    }

    fn read_pvt(&self, sd: u8, ver: u8, mgid: u16) -> Result<u8> {
        Ok(self.state(sd)?.lock().unwrap().pvt[ver as usize][mgid as usize])
    }

    fn read_tvt(&self, sd: u8, mgid: u16) -> Result<u8> {
        Ok(self.state(sd)?.lock().unwrap().tvt[mgid as usize])
    }

    fn read_pmt(&self, sd: u8, ver: u8, yid: u16) -> Result<PortMask> {
        Ok(self.state(sd)?.lock().unwrap().pmt[ver as usize][yid as usize])
    }

    fn read_lit(&self, sd: u8, ver: u8, lag: u8) -> Result<PortMask> {
        Ok(self.state(sd)?.lock().unwrap().lit[ver as usize][lag as usize])
    }

    fn read_lit_np(&self, sd: u8, lag: u8) -> Result<(u16, u16)> {
        Ok(self.state(sd)?.lock().unwrap().lit_np[lag as usize])
    }

    fn read_backup_port(&self, sd: u8, port: u16) -> Result<u16> {
        Ok(self.state(sd)?.lock().unwrap().backup[port as usize])
    }

    fn read_port_mask(&self, sd: u8, ver: u8) -> Result<PortMask> {
        Ok(self.state(sd)?.lock().unwrap().port_mask[ver as usize])
    }

    fn read_port_down(&self, sd: u8) -> Result<PortMask> {
        Ok(self.state(sd)?.lock().unwrap().port_down)
    }

    fn read_global_rid(&self, sd: u8) -> Result<u16> {
        Ok(self.state(sd)?.lock().unwrap().global_rid)
    }

    fn read_common_ctrl(&self, sd: u8) -> Result<CommonCtrl> {
        Ok(self.state(sd)?.lock().unwrap().common_ctrl)
    }

    fn read_tbl_ver(&self, sd: u8, tbl: VersionedTable) -> Result<u8> {
        Ok(self.state(sd)?.lock().unwrap().tbl_ver[tbl.index()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::addr::Family;

    #[test]
    fn bitset_ops() {
        let mut mask = PortMask::new();
        assert!(mask.is_empty());
        mask.set(3, true);
        mask.set(287, true);
        assert!(mask.get(3) && mask.get(287));
        assert_eq!(mask.count(), 2);
        assert_eq!(mask.iter_ones().collect::<Vec<_>>(), vec![3, 287]);
        mask.set(3, false);
        assert_eq!(mask.count(), 1);
    }

    #[test]
    fn fake_write_read_round_trip() {
        let map = AddrMap::new(Family::Gen1);
        let hw = FakeTransport::new(&map);

        hw.write(0, &WriteOp::GlobalRid { rid: 0xbeef }).unwrap();
        assert_eq!(hw.read_global_rid(0).unwrap(), 0xbeef);

        let mut mask = PortMask::new();
        mask.set(7, true);
        hw.write(0, &WriteOp::Lit { ver: 1, lag: 4, mask }).unwrap();
        assert_eq!(hw.read_lit(0, 1, 4).unwrap(), mask);
        assert!(hw.read_lit(0, 0, 4).unwrap().is_empty());
    }

    #[test]
    fn fault_injection() {
        let map = AddrMap::new(Family::Gen1);
        let hw = FakeTransport::new(&map);
        hw.fail_from(2);

        hw.write(0, &WriteOp::GlobalRid { rid: 1 }).unwrap();
        let err = hw.write(0, &WriteOp::GlobalRid { rid: 2 }).unwrap_err();
        assert_eq!(err.code(), 2);
        assert_eq!(hw.read_global_rid(0).unwrap(), 1);
    }
}
