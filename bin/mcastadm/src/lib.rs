// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The mcastadm simulator harness.
//!
//! There is no kernel driver to talk to here: mcastadm runs the full
//! engine in-process over the in-memory hardware model, driven by a
//! RON scenario file, then answers dump and verify commands against
//! the resulting state. Scenarios name nodes and ECMP groups with
//! strings; the harness maps those to the engine's opaque handles.

use mcast::engine::addr::AddrMap;
use mcast::engine::addr::Family;
use mcast::engine::device::Mcast;
use mcast::engine::hw::FakeTransport;
use mcast::engine::hw::Transport;
use mcast_api::Dev;
use mcast_api::EcmpHdl;
use mcast_api::LagId;
use mcast_api::McError;
use mcast_api::Mgid;
use mcast_api::NodeHdl;
use mcast_api::PortId;
use mcast_api::Rid;
use mcast_api::SessionHdl;
use mcast_api::Xid;
use mcast_api::Yid;
use serde::Deserialize;
use slog::Logger;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("unknown node name: {0}")]
    UnknownNode(String),

    #[error("unknown ecmp group name: {0}")]
    UnknownGroup(String),

    #[error("engine error: {0}")]
    Engine(#[from] McError),
}

/// The hardware generation a scenario runs against.
#[derive(Clone, Copy, Debug, Deserialize)]
pub enum FamilySpec {
    Gen1,
    Gen2,
    Gen3,
}

impl From<FamilySpec> for Family {
    fn from(spec: FamilySpec) -> Self {
        match spec {
            FamilySpec::Gen1 => Family::Gen1,
            FamilySpec::Gen2 => Family::Gen2,
            FamilySpec::Gen3 => Family::Gen3,
        }
    }
}

/// One scenario step. Nodes and groups are referred to by the names
/// given at their creation steps.
#[derive(Clone, Debug, Deserialize)]
pub enum Step {
    MgrpCreate { mgid: u16 },
    MgrpDestroy { mgid: u16 },
    NodeCreate { name: String, rid: u16, ports: Vec<u16>, lags: Vec<u8> },
    NodeDestroy { name: String },
    NodeUpdate { name: String, ports: Vec<u16>, lags: Vec<u8> },
    Associate { mgid: u16, node: String, xid: Option<u16> },
    Dissociate { mgid: u16, node: String },
    EcmpAlloc { name: String },
    EcmpFree { name: String },
    EcmpMbrAdd { grp: String, node: String },
    EcmpMbrRem { grp: String, node: String },
    EcmpMbrMod { grp: String, nodes: Vec<String> },
    EcmpAssociate { mgid: u16, grp: String, xid: Option<u16> },
    EcmpDissociate { mgid: u16, grp: String },
    BatchBegin,
    BatchFlush,
    BatchEnd,
    TvtSet { mgid: u16, mask: u8 },
    PmtSet { yid: u16, ports: Vec<u16> },
    LagSet { lag: u8, ports: Vec<u16> },
    LagRemoteCountSet { lag: u8, left: u16, right: u16 },
    BackupPortSet { port: u16, backup: u16 },
    PortMaskSet { ports: Vec<u16> },
    /// Simulate a link-down event on every subdevice.
    PortDown { port: u16 },
    PortDownClear { port: u16 },
    GlobalRidSet { rid: u16 },
    FastFailoverSet { en: bool },
    BackupPortEnSet { en: bool },
    MaxNodesSet { l1: u32, l2: u32 },
}

#[derive(Clone, Debug, Deserialize)]
pub struct Scenario {
    pub family: FamilySpec,
    pub steps: Vec<Step>,
}

/// An attached simulated device plus the name maps a running
/// scenario builds up.
pub struct Sim {
    pub mcast: Mcast,
    pub dev: Dev,
    pub sess: SessionHdl,
    pub hw: Arc<FakeTransport>,
    nodes: HashMap<String, NodeHdl>,
    grps: HashMap<String, EcmpHdl>,
    mgids: BTreeSet<u16>,
}

impl Sim {
    pub fn new(family: Family, log: Logger) -> Result<Self, ScenarioError> {
        let mcast = Mcast::new(log);
        let dev = Dev(0);
        let hw = Arc::new(FakeTransport::new(&AddrMap::new(family)));
        mcast.attach(dev, family, Arc::clone(&hw) as Arc<dyn Transport>)?;
        let sess = mcast.session_create(dev)?;
        Ok(Self {
            mcast,
            dev,
            sess,
            hw,
            nodes: HashMap::new(),
            grps: HashMap::new(),
            mgids: BTreeSet::new(),
        })
    }

    pub fn node(&self, name: &str) -> Result<NodeHdl, ScenarioError> {
        self.nodes
            .get(name)
            .copied()
            .ok_or_else(|| ScenarioError::UnknownNode(name.to_string()))
    }

    pub fn grp(&self, name: &str) -> Result<EcmpHdl, ScenarioError> {
        self.grps
            .get(name)
            .copied()
            .ok_or_else(|| ScenarioError::UnknownGroup(name.to_string()))
    }

    /// The MGIDs the scenario created, for verify-all.
    pub fn mgids(&self) -> impl Iterator<Item = Mgid> + '_ {
        self.mgids.iter().map(|m| Mgid(*m))
    }

    pub fn run(&mut self, scenario: &Scenario) -> Result<(), ScenarioError> {
        for step in &scenario.steps {
            self.step(step)?;
        }
        Ok(())
    }

    fn step(&mut self, step: &Step) -> Result<(), ScenarioError> {
        let sess = self.sess;
        match step {
            Step::MgrpCreate { mgid } => {
                self.mcast.mgrp_create(sess, Mgid(*mgid))?;
                self.mgids.insert(*mgid);
            }
            Step::MgrpDestroy { mgid } => {
                self.mcast.mgrp_destroy(sess, Mgid(*mgid))?;
                self.mgids.remove(mgid);
            }
            Step::NodeCreate { name, rid, ports, lags } => {
                let hdl = self.mcast.node_create(
                    sess,
                    Rid(*rid),
                    &to_ports(ports),
                    &to_lags(lags),
                )?;
                self.nodes.insert(name.clone(), hdl);
            }
            Step::NodeDestroy { name } => {
                self.mcast.node_destroy(sess, self.node(name)?)?;
                self.nodes.remove(name);
            }
            Step::NodeUpdate { name, ports, lags } => {
                self.mcast.node_update(
                    sess,
                    self.node(name)?,
                    &to_ports(ports),
                    &to_lags(lags),
                )?;
            }
            Step::Associate { mgid, node, xid } => {
                self.mcast.associate(
                    sess,
                    Mgid(*mgid),
                    self.node(node)?,
                    xid.map(Xid),
                    xid.is_some(),
                )?;
            }
            Step::Dissociate { mgid, node } => {
                self.mcast.dissociate(sess, Mgid(*mgid), self.node(node)?)?;
            }
            Step::EcmpAlloc { name } => {
                let hdl = self.mcast.ecmp_alloc(sess)?;
                self.grps.insert(name.clone(), hdl);
            }
            Step::EcmpFree { name } => {
                self.mcast.ecmp_free(sess, self.grp(name)?)?;
                self.grps.remove(name);
            }
            Step::EcmpMbrAdd { grp, node } => {
                self.mcast.ecmp_mbr_add(
                    sess,
                    self.grp(grp)?,
                    self.node(node)?,
                )?;
            }
            Step::EcmpMbrRem { grp, node } => {
                self.mcast.ecmp_mbr_rem(
                    sess,
                    self.grp(grp)?,
                    self.node(node)?,
                )?;
            }
            Step::EcmpMbrMod { grp, nodes } => {
                let nodes = nodes
                    .iter()
                    .map(|n| self.node(n))
                    .collect::<Result<Vec<_>, _>>()?;
                self.mcast.ecmp_mbr_mod(sess, self.grp(grp)?, &nodes)?;
            }
            Step::EcmpAssociate { mgid, grp, xid } => {
                self.mcast.ecmp_associate(
                    sess,
                    Mgid(*mgid),
                    self.grp(grp)?,
                    xid.map(Xid),
                    xid.is_some(),
                )?;
            }
            Step::EcmpDissociate { mgid, grp } => {
                self.mcast.ecmp_dissociate(
                    sess,
                    Mgid(*mgid),
                    self.grp(grp)?,
                )?;
            }
            Step::BatchBegin => self.mcast.batch_begin(sess)?,
            Step::BatchFlush => self.mcast.batch_flush(sess)?,
            Step::BatchEnd => self.mcast.batch_end(sess)?,
            Step::TvtSet { mgid, mask } => {
                self.mcast.tvt_set(sess, Mgid(*mgid), *mask)?;
            }
            Step::PmtSet { yid, ports } => {
                self.mcast.pmt_set(sess, Yid(*yid), &to_ports(ports))?;
            }
            Step::LagSet { lag, ports } => {
                self.mcast.lag_set(sess, LagId(*lag), &to_ports(ports))?;
            }
            Step::LagRemoteCountSet { lag, left, right } => {
                self.mcast.lag_remote_count_set(
                    sess,
                    LagId(*lag),
                    *left,
                    *right,
                )?;
            }
            Step::BackupPortSet { port, backup } => {
                self.mcast.backup_port_set(
                    sess,
                    PortId(*port),
                    PortId(*backup),
                )?;
            }
            Step::PortMaskSet { ports } => {
                self.mcast.port_mask_set(sess, &to_ports(ports))?;
            }
            Step::PortDown { port } => {
                for sd in 0..self.hw.subdevs() {
                    self.hw.set_port_down(sd, *port);
                }
            }
            Step::PortDownClear { port } => {
                self.mcast.port_down_clear(sess, PortId(*port))?;
            }
            Step::GlobalRidSet { rid } => {
                self.mcast.global_rid_set(sess, Rid(*rid))?;
            }
            Step::FastFailoverSet { en } => {
                self.mcast.fast_failover_set(sess, *en)?;
            }
            Step::BackupPortEnSet { en } => {
                self.mcast.backup_port_en_set(sess, *en)?;
            }
            Step::MaxNodesSet { l1, l2 } => {
                self.mcast.max_nodes_set(sess, *l1, *l2)?;
            }
        }
        Ok(())
    }
}

fn to_ports(ports: &[u16]) -> Vec<PortId> {
    ports.iter().map(|p| PortId(*p)).collect()
}

fn to_lags(lags: &[u8]) -> Vec<LagId> {
    lags.iter().map(|l| LagId(*l)).collect()
}
