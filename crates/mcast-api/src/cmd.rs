// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Dump and verify response types for the diagnostic surface.

use super::EcmpHdl;
use super::Mgid;
use super::NodeHdl;
use super::RdmAddr;
use alloc::string::String;
use alloc::vec::Vec;
use serde::Deserialize;
use serde::Serialize;

/// One L1 node's per-pipe hardware record, as seen by a dump.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct L1PipeDump {
    pub pipe: u8,
    pub addr: RdmAddr,
    pub next: RdmAddr,
    /// Number of L2 nodes materialized for this pipe.
    pub l2_nodes: u32,
}

/// One L1 node within a group dump.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct L1Dump {
    pub node: NodeHdl,
    pub rid: u16,
    pub xid: Option<u16>,
    pub ecmp: Option<EcmpHdl>,
    pub ports: Vec<u16>,
    pub lags: Vec<u8>,
    pub pipes: Vec<L1PipeDump>,
}

/// The response to a group dump: the software view of one MGID's
/// replication tree.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MgrpDumpResp {
    pub mgid: Mgid,
    /// Per-pipe MIT roots, `RdmAddr::NULL` where the group has no
    /// fan-out.
    pub mit_roots: Vec<RdmAddr>,
    pub l1: Vec<L1Dump>,
}

/// The response to an ECMP group dump.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EcmpDumpResp {
    pub hdl: EcmpHdl,
    pub mbrs: Vec<NodeHdl>,
    /// Per-pipe member-block base addresses.
    pub bases: Vec<RdmAddr>,
    /// Per-pipe vector addresses, one pair per pipe (version 0, 1).
    pub vectors: Vec<(RdmAddr, RdmAddr)>,
    pub assoc_mgids: Vec<Mgid>,
}

/// Allocator diagnostics: free runs per size class plus the block
/// ownership map.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RdmDumpResp {
    /// `(size_class_log2, free_runs)` pairs.
    pub free: Vec<(u8, u32)>,
    /// Half-lines currently allocated.
    pub used_halves: u32,
    /// `(block, owner-pipe)` pairs for owned blocks.
    pub owners: Vec<(u16, u16)>,
}

/// A hardware table addressable by the verify surface.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum TableId {
    Pvt,
    Tvt,
    Pmt,
    Lit,
    LitNp,
    Mit,
    BackupPort,
    PortMask,
    GlobalRid,
}

impl TableId {
    pub const ALL: [Self; 9] = [
        Self::Pvt,
        Self::Tvt,
        Self::Pmt,
        Self::Lit,
        Self::LitNp,
        Self::Mit,
        Self::BackupPort,
        Self::PortMask,
        Self::GlobalRid,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Pvt => "pvt",
            Self::Tvt => "tvt",
            Self::Pmt => "pmt",
            Self::Lit => "lit",
            Self::LitNp => "lit-np",
            Self::Mit => "mit",
            Self::BackupPort => "backup-port",
            Self::PortMask => "port-mask",
            Self::GlobalRid => "global-rid",
        }
    }
}

/// A single divergent entry found by a verify pass.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VerifyMismatch {
    pub index: u32,
    pub shadow: u128,
    pub hw: u128,
}

/// The outcome of verifying one table (or one MGID walk) against
/// live hardware state.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VerifyResp {
    pub name: String,
    pub compared: u32,
    pub mismatches: Vec<VerifyMismatch>,
}

impl VerifyResp {
    pub fn clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}
