// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print command responses in human-friendly manner.
//!
//! This is mostly just a place to hang printing routines so that they
//! can be used by both mcastadm and integration tests.

use crate::api::EcmpDumpResp;
use crate::api::MgrpDumpResp;
use crate::api::RdmDumpResp;
use crate::api::VerifyResp;
use std::io::Write;
use tabwriter::TabWriter;

/// Print a [`MgrpDumpResp`].
pub fn print_mgrp(resp: &MgrpDumpResp) -> std::io::Result<()> {
    print_mgrp_into(&mut std::io::stdout(), resp)
}

/// Print a [`MgrpDumpResp`] into a given writer.
pub fn print_mgrp_into(
    writer: &mut impl Write,
    resp: &MgrpDumpResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "MGID {:#x}", resp.mgid.0)?;
    write_hrb(&mut t)?;
    write!(t, "MIT roots:")?;
    for (pipe, root) in resp.mit_roots.iter().enumerate() {
        write!(t, " pipe{}={}", pipe, root)?;
    }
    writeln!(t)?;
    t.flush()?;

    writeln!(t, "\nL1 Nodes")?;
    write_hr(&mut t)?;
    writeln!(t, "NODE\tRID\tXID\tECMP\tPORTS\tLAGS\tPIPES (addr,next,l2)")?;
    for l1 in &resp.l1 {
        let pipes = l1
            .pipes
            .iter()
            .map(|p| {
                format!("{}:({},{},{})", p.pipe, p.addr, p.next, p.l2_nodes)
            })
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(
            t,
            "{}\t{:#x}\t{}\t{}\t{}\t{}\t{}",
            l1.node.0,
            l1.rid,
            l1.xid.map(|x| format!("{:#x}", x)).unwrap_or_else(|| "-".into()),
            l1.ecmp.map(|e| e.0.to_string()).unwrap_or_else(|| "-".into()),
            csv(&l1.ports),
            csv(&l1.lags),
            pipes,
        )?;
    }
    writeln!(t)?;
    t.flush()
}

/// Print an [`EcmpDumpResp`].
pub fn print_ecmp(resp: &EcmpDumpResp) -> std::io::Result<()> {
    print_ecmp_into(&mut std::io::stdout(), resp)
}

/// Print an [`EcmpDumpResp`] into a given writer.
pub fn print_ecmp_into(
    writer: &mut impl Write,
    resp: &EcmpDumpResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "ECMP group {}", resp.hdl.0)?;
    write_hrb(&mut t)?;
    writeln!(
        t,
        "members: {}",
        csv(&resp.mbrs.iter().map(|m| m.0).collect::<Vec<_>>())
    )?;
    writeln!(
        t,
        "mgids: {}",
        csv(&resp.assoc_mgids.iter().map(|m| m.0).collect::<Vec<_>>())
    )?;
    t.flush()?;

    writeln!(t, "\nPIPE\tBASE\tVEC0\tVEC1")?;
    write_hr(&mut t)?;
    for (pipe, (base, (v0, v1))) in
        resp.bases.iter().zip(resp.vectors.iter()).enumerate()
    {
        writeln!(t, "{}\t{}\t{}\t{}", pipe, base, v0, v1)?;
    }
    writeln!(t)?;
    t.flush()
}

/// Print an [`RdmDumpResp`].
pub fn print_rdm(resp: &RdmDumpResp) -> std::io::Result<()> {
    print_rdm_into(&mut std::io::stdout(), resp)
}

/// Print an [`RdmDumpResp`] into a given writer.
pub fn print_rdm_into(
    writer: &mut impl Write,
    resp: &RdmDumpResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "RDM: {} half-lines in use", resp.used_halves)?;
    write_hrb(&mut t)?;
    writeln!(t, "RUN SIZE\tFREE RUNS")?;
    for (log2, count) in &resp.free {
        writeln!(t, "{}\t{}", 1u32 << log2, count)?;
    }
    t.flush()?;

    writeln!(t, "\nBLOCK\tOWNER PIPE")?;
    write_hr(&mut t)?;
    for (block, pipe) in &resp.owners {
        writeln!(t, "{}\t{}", block, pipe)?;
    }
    writeln!(t)?;
    t.flush()
}

/// Print a [`VerifyResp`].
pub fn print_verify(resp: &VerifyResp) -> std::io::Result<()> {
    print_verify_into(&mut std::io::stdout(), resp)
}

/// Print a [`VerifyResp`] into a given writer.
pub fn print_verify_into(
    writer: &mut impl Write,
    resp: &VerifyResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    if resp.clean() {
        writeln!(t, "{}: clean ({} compared)", resp.name, resp.compared)?;
        return t.flush();
    }

    writeln!(
        t,
        "{}: {} mismatches ({} compared)",
        resp.name,
        resp.mismatches.len(),
        resp.compared
    )?;
    write_hrb(&mut t)?;
    writeln!(t, "INDEX\tSHADOW\tHARDWARE")?;
    for mm in &resp.mismatches {
        writeln!(t, "{:#x}\t{:#x}\t{:#x}", mm.index, mm.shadow, mm.hw)?;
    }
    writeln!(t)?;
    t.flush()
}

fn csv<T: ToString>(vals: &[T]) -> String {
    if vals.is_empty() {
        return "-".into();
    }
    vals.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

/// Print a horizontal rule in bold.
pub fn write_hrb(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:=<70}", "=")
}

/// Print a horizontal rule.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}
