// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The device-family axis.
//!
//! Three hardware generations share one replication engine but differ
//! in geometry and address computation: pipe/port/segment counts, the
//! RDM block layout, subdevice (die) count and the MIT row packing.
//! An [`AddrMap`] is selected once at device-attach; everything above
//! this module is family-agnostic.

use mcast_api::Mgid;
use mcast_api::Pipe;
use mcast_api::PortId;
use mcast_api::RdmAddr;

/// The hardware generation of an attached device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Family {
    Gen1,
    Gen2,
    Gen3,
}

/// Per-family geometry and address computation, fixed at attach.
#[derive(Clone, Debug)]
pub struct AddrMap {
    pub family: Family,
    /// Logical pipes per device.
    pub pipes: u8,
    /// Local ports per pipe. The device-global port space is
    /// `pipes * ports_per_pipe` and is 288 for every family.
    pub ports_per_pipe: u16,
    /// LAG table depth.
    pub lags: u16,
    /// Prune-table (PMT) depth.
    pub yids: u16,
    /// Dies per package. Writes fan out to all of them; reads must
    /// agree across all of them.
    pub subdevs: u8,
    /// RDM geometry: `rdm_blocks * lines_per_block` 128-bit lines,
    /// addressed in half-lines.
    pub rdm_blocks: u16,
    pub lines_per_block: u32,
    /// Number of MGIDs (MIT depth per pipe).
    pub mgids: u32,
    /// MGID roots packed per MIT row.
    pub mit_per_row: u32,
}

impl AddrMap {
    pub fn new(family: Family) -> Self {
        match family {
            Family::Gen1 => Self {
                family,
                pipes: 4,
                ports_per_pipe: 72,
                lags: 256,
                yids: 288,
                subdevs: 1,
                rdm_blocks: 128,
                lines_per_block: 4096,
                mgids: 0x1_0000,
                mit_per_row: 4,
            },
            Family::Gen2 => Self {
                family,
                pipes: 4,
                ports_per_pipe: 72,
                lags: 256,
                yids: 288,
                subdevs: 2,
                rdm_blocks: 256,
                lines_per_block: 2048,
                mgids: 0x1_0000,
                mit_per_row: 4,
            },
            Family::Gen3 => Self {
                family,
                pipes: 8,
                ports_per_pipe: 36,
                lags: 256,
                yids: 288,
                subdevs: 1,
                rdm_blocks: 192,
                lines_per_block: 2048,
                mgids: 0x1_0000,
                mit_per_row: 2,
            },
        }
    }

    /// Total device-global ports.
    pub fn ports(&self) -> u16 {
        self.pipes as u16 * self.ports_per_pipe
    }

    /// 18-port segments per pipe (the PORT18 node granularity).
    pub fn segs_per_pipe(&self) -> u16 {
        self.ports_per_pipe / 18
    }

    pub fn port_pipe(&self, port: PortId) -> Pipe {
        Pipe((port.0 / self.ports_per_pipe) as u8)
    }

    pub fn port_local(&self, port: PortId) -> u16 {
        port.0 % self.ports_per_pipe
    }

    /// Half-lines per RDM block.
    pub fn halves_per_block(&self) -> u32 {
        self.lines_per_block * 2
    }

    /// The RDM half-line address space. Node pointer fields are 20
    /// bits wide; every family's geometry fits.
    pub fn rdm_half_lines(&self) -> u32 {
        self.rdm_blocks as u32 * self.halves_per_block()
    }

    pub fn rdm_addr(&self, block: u16, half: u32) -> RdmAddr {
        RdmAddr(block as u32 * self.halves_per_block() + half)
    }

    pub fn block_of(&self, addr: RdmAddr) -> u16 {
        (addr.0 / self.halves_per_block()) as u16
    }

    pub fn mit_row(&self, mgid: Mgid) -> u32 {
        mgid.0 as u32 / self.mit_per_row
    }

    pub fn mit_slot(&self, mgid: Mgid) -> u32 {
        mgid.0 as u32 % self.mit_per_row
    }

    pub fn mit_rows(&self) -> u32 {
        self.mgids / self.mit_per_row
    }

    pub fn pipe_mask_all(&self) -> u8 {
        if self.pipes >= 8 { 0xff } else { (1u8 << self.pipes) - 1 }
    }
}
