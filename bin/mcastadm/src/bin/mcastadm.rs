// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use mcast::print::print_ecmp;
use mcast::print::print_mgrp;
use mcast::print::print_rdm;
use mcast::print::print_verify;
use mcast_api::Mgid;
use mcast_api::TableId;
use mcastadm::Scenario;
use mcastadm::Sim;
use slog::Drain;
use slog::o;
use std::path::PathBuf;

/// Administer a simulated multicast replication engine.
///
/// Runs the RON scenario against an in-process engine over the
/// in-memory hardware model, then executes the given command against
/// the resulting state.
#[derive(Debug, Parser)]
#[command(version)]
struct Opts {
    /// The RON scenario file to run.
    #[arg(short, long)]
    scenario: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scenario and report success.
    Run,

    /// Dump one multicast group's replication tree.
    DumpMgrp {
        #[arg(value_parser = parse_u16)]
        mgid: u16,
    },

    /// Dump one ECMP group, by its scenario name.
    DumpEcmp { grp: String },

    /// Dump the RDM allocator state.
    DumpRdm,

    /// Walk one group's hardware tree and compare it to the shadow.
    VerifyMgid {
        #[arg(value_parser = parse_u16)]
        mgid: u16,
    },

    /// Compare one table's shadow to the hardware.
    VerifyTable { table: TableArg },

    /// Verify every table and every group the scenario created.
    VerifyAll,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TableArg {
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

impl From<TableArg> for TableId {
    fn from(arg: TableArg) -> Self {
        match arg {
            TableArg::Pvt => TableId::Pvt,
            TableArg::Tvt => TableId::Tvt,
            TableArg::Pmt => TableId::Pmt,
            TableArg::Lit => TableId::Lit,
            TableArg::LitNp => TableId::LitNp,
            TableArg::Mit => TableId::Mit,
            TableArg::BackupPort => TableId::BackupPort,
            TableArg::PortMask => TableId::PortMask,
            TableArg::GlobalRid => TableId::GlobalRid,
        }
    }
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let res = match s.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    res.map_err(|e| e.to_string())
}

fn build_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, o!())
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let text = std::fs::read_to_string(&opts.scenario).with_context(|| {
        format!("read scenario {}", opts.scenario.display())
    })?;
    let scenario: Scenario =
        ron::from_str(&text).context("parse scenario")?;

    let mut sim = Sim::new(scenario.family.into(), build_logger())?;
    sim.run(&scenario)?;

    match opts.cmd {
        Command::Run => {
            println!("scenario ok ({} steps)", scenario.steps.len());
        }

        Command::DumpMgrp { mgid } => {
            let resp = sim.mcast.mgrp_dump(sim.dev, Mgid(mgid))?;
            print_mgrp(&resp)?;
        }

        Command::DumpEcmp { grp } => {
            let hdl = sim.grp(&grp)?;
            let resp = sim.mcast.ecmp_dump(sim.dev, hdl)?;
            print_ecmp(&resp)?;
        }

        Command::DumpRdm => {
            let resp = sim.mcast.rdm_dump(sim.dev)?;
            print_rdm(&resp)?;
        }

        Command::VerifyMgid { mgid } => {
            let resp = sim.mcast.verify_mgid(sim.dev, Mgid(mgid))?;
            print_verify(&resp)?;
            if !resp.clean() {
                anyhow::bail!("verify failed");
            }
        }

        Command::VerifyTable { table } => {
            let resp = sim.mcast.verify_table(sim.dev, table.into())?;
            print_verify(&resp)?;
            if !resp.clean() {
                anyhow::bail!("verify failed");
            }
        }

        Command::VerifyAll => {
            let mut dirty = false;
            for tbl in TableId::ALL {
                let resp = sim.mcast.verify_table(sim.dev, tbl)?;
                dirty |= !resp.clean();
                print_verify(&resp)?;
            }
            for mgid in sim.mgids().collect::<Vec<_>>() {
                let resp = sim.mcast.verify_mgid(sim.dev, mgid)?;
                dirty |= !resp.clean();
                print_verify(&resp)?;
            }
            if dirty {
                anyhow::bail!("verify failed");
            }
        }
    }

    Ok(())
}
