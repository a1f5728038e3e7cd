// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! End-to-end scenarios over the in-memory hardware model.
//!
//! Each test drives the full control surface (sessions, staged write
//! lists, flush) and then asks the verifier to walk the hardware image
//! back against the shadow. A scenario only passes if the walk comes
//! back clean.

use itertools::Itertools;
use itertools::iproduct;
use mcast::api::Dev;
use mcast::api::LagId;
use mcast::api::McError;
use mcast::api::Mgid;
use mcast::api::PortId;
use mcast::api::RdmAddr;
use mcast::api::Rid;
use mcast::api::SessionHdl;
use mcast::api::TableId;
use mcast::api::Yid;
use mcast::engine::addr::AddrMap;
use mcast::engine::addr::Family;
use mcast::engine::device::Mcast;
use mcast::engine::hw::FakeTransport;
use mcast::engine::hw::Transport;
use mcast::engine::hw::WriteOp;
use slog::Drain;
use slog::Logger;
use slog::o;
use std::sync::Arc;

fn test_logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}

struct Harness {
    mcast: Mcast,
    dev: Dev,
    sess: SessionHdl,
    hw: Arc<FakeTransport>,
}

fn harness(family: Family) -> Harness {
    let mcast = Mcast::new(test_logger());
    let dev = Dev(0);
    let hw = Arc::new(FakeTransport::new(&AddrMap::new(family)));
    mcast
        .attach(dev, family, Arc::clone(&hw) as Arc<dyn Transport>)
        .unwrap();
    let sess = mcast.session_create(dev).unwrap();
    Harness { mcast, dev, sess, hw }
}

fn assert_clean(h: &Harness, mgid: Mgid) {
    let resp = h.mcast.verify_mgid(h.dev, mgid).unwrap();
    assert!(
        resp.clean(),
        "{}: {} mismatches (first: {:?})",
        resp.name,
        resp.mismatches.len(),
        resp.mismatches.first(),
    );
    for tbl in TableId::ALL {
        let resp = h.mcast.verify_table(h.dev, tbl).unwrap();
        assert!(resp.clean(), "table {} diverged", resp.name);
    }
}

// Build one group with one node on every hardware generation, over a
// few different fan-out shapes, and check the hardware image walks
// back clean each time.
#[test]
fn group_build_verifies_clean_on_every_family() {
    let families = [Family::Gen1, Family::Gen2, Family::Gen3];
    let shapes: [(&[u16], &[u8]); 3] = [
        (&[3, 7], &[]),
        (&[3, 100, 287], &[]),
        (&[3], &[0, 5]),
    ];

    for (family, (ports, lags)) in iproduct!(families, shapes) {
        let h = harness(family);
        let mgid = Mgid(0x10);
        let ports = ports.iter().map(|p| PortId(*p)).collect_vec();
        let lags = lags.iter().map(|l| LagId(*l)).collect_vec();

        h.mcast.mgrp_create(h.sess, mgid).unwrap();
        let node =
            h.mcast.node_create(h.sess, Rid(0x1), &ports, &lags).unwrap();
        h.mcast.associate(h.sess, mgid, node, None, false).unwrap();

        let dump = h.mcast.mgrp_dump(h.dev, mgid).unwrap();
        assert_eq!(dump.l1.len(), 1);
        assert_eq!(dump.l1[0].rid, 0x1);
        assert!(
            dump.mit_roots.iter().any(|r| !r.is_null()),
            "{family:?}: no MIT root materialized",
        );

        assert_clean(&h, mgid);
    }
}

// Dropping the last association tears the whole tree down: the MIT
// roots go null and every half-line the build took comes back.
#[test]
fn dissociate_last_frees_tree_and_clears_roots() {
    let h = harness(Family::Gen1);
    let mgid = Mgid(0x10);
    let baseline = h.mcast.rdm_dump(h.dev).unwrap().used_halves;

    h.mcast.mgrp_create(h.sess, mgid).unwrap();
    let node = h
        .mcast
        .node_create(h.sess, Rid(0x1), &[PortId(3), PortId(7)], &[])
        .unwrap();
    h.mcast.associate(h.sess, mgid, node, None, false).unwrap();
    assert!(h.mcast.rdm_dump(h.dev).unwrap().used_halves > baseline);

    h.mcast.dissociate(h.sess, mgid, node).unwrap();

    let dump = h.mcast.mgrp_dump(h.dev, mgid).unwrap();
    assert!(dump.l1.is_empty());
    assert!(dump.mit_roots.iter().all(|r| r.is_null()));
    assert_eq!(h.mcast.rdm_dump(h.dev).unwrap().used_halves, baseline);
    assert_clean(&h, mgid);
}

#[test]
fn backup_port_beyond_port_count_is_invalid_argument() {
    let h = harness(Family::Gen1);
    let res = h.mcast.backup_port_set(h.sess, PortId(288), PortId(0));
    assert!(matches!(res, Err(McError::InvalidArgument(_))), "{res:?}");
    let res = h.mcast.backup_port_set(h.sess, PortId(0), PortId(288));
    assert!(matches!(res, Err(McError::InvalidArgument(_))), "{res:?}");

    // The query direction rejects the same ranges instead of
    // touching the shadow.
    let res = h.mcast.backup_port_get(h.dev, PortId(288));
    assert!(matches!(res, Err(McError::InvalidArgument(_))), "{res:?}");
    let res = h.mcast.pmt_get(h.dev, Yid(20000));
    assert!(matches!(res, Err(McError::InvalidArgument(_))), "{res:?}");

    // In range is fine, and readable back from the shadow.
    h.mcast.backup_port_set(h.sess, PortId(7), PortId(9)).unwrap();
    assert_eq!(h.mcast.backup_port_get(h.dev, PortId(7)).unwrap(), PortId(9));
}

// Membership churn on an associated ECMP group, including a growth
// past the initial two-slot block, keeps hardware and shadow in step.
#[test]
fn ecmp_membership_churn_stays_consistent() {
    let h = harness(Family::Gen1);
    let mgid = Mgid(0x20);
    h.mcast.mgrp_create(h.sess, mgid).unwrap();

    let mk = |ports: &[u16]| {
        let ports = ports.iter().map(|p| PortId(*p)).collect_vec();
        h.mcast.node_create(h.sess, Rid(0x1), &ports, &[]).unwrap()
    };
    let a = mk(&[1]);
    let b = mk(&[2]);
    let c = mk(&[3]);

    let grp = h.mcast.ecmp_alloc(h.sess).unwrap();
    h.mcast.ecmp_mbr_add(h.sess, grp, a).unwrap();
    h.mcast.ecmp_mbr_add(h.sess, grp, b).unwrap();
    h.mcast.ecmp_associate(h.sess, mgid, grp, None, false).unwrap();
    assert_clean(&h, mgid);

    // Third member forces the member block to double.
    h.mcast.ecmp_mbr_add(h.sess, grp, c).unwrap();
    assert_clean(&h, mgid);

    h.mcast.ecmp_mbr_rem(h.sess, grp, b).unwrap();
    assert_clean(&h, mgid);
    let dump = h.mcast.ecmp_dump(h.dev, grp).unwrap();
    assert_eq!(dump.mbrs, vec![a, c]);
    assert_eq!(dump.assoc_mgids, vec![mgid]);

    h.mcast.ecmp_dissociate(h.sess, mgid, grp).unwrap();
    h.mcast.ecmp_free(h.sess, grp).unwrap();
    assert_clean(&h, mgid);
}

// Inside a batch nothing reaches the hardware; batch_end flushes the
// whole sequence and the result walks back clean.
#[test]
fn batch_defers_hardware_writes_until_end() {
    let h = harness(Family::Gen1);
    let mgid = Mgid(0x30);
    let before = h.hw.writes_applied();

    assert!(!h.mcast.in_batch(h.sess).unwrap());
    h.mcast.batch_begin(h.sess).unwrap();
    assert!(h.mcast.in_batch(h.sess).unwrap());
    h.mcast.mgrp_create(h.sess, mgid).unwrap();
    let node = h
        .mcast
        .node_create(h.sess, Rid(0x2), &[PortId(4), PortId(80)], &[])
        .unwrap();
    h.mcast.associate(h.sess, mgid, node, None, false).unwrap();
    assert_eq!(h.hw.writes_applied(), before);

    // A mid-batch flush pushes what is staged but keeps the batch
    // open.
    h.mcast.batch_flush(h.sess).unwrap();
    let flushed = h.hw.writes_applied();
    assert!(flushed > before);
    assert!(h.mcast.in_batch(h.sess).unwrap());

    h.mcast.global_rid_set(h.sess, Rid(0x11)).unwrap();
    assert_eq!(h.hw.writes_applied(), flushed);

    h.mcast.batch_end(h.sess).unwrap();
    assert!(!h.mcast.in_batch(h.sess).unwrap());
    assert!(h.hw.writes_applied() > flushed);
    assert_clean(&h, mgid);
}

// On a two-subdevice part the verifier must catch one die disagreeing
// with the other, and name the divergent subdevice in the index.
#[test]
fn subdevice_divergence_is_reported() {
    let h = harness(Family::Gen2);
    h.mcast.global_rid_set(h.sess, Rid(0x42)).unwrap();

    let resp = h.mcast.verify_table(h.dev, TableId::GlobalRid).unwrap();
    assert!(resp.clean());
    assert_eq!(resp.compared, 2);

    h.hw.write(1, &WriteOp::GlobalRid { rid: 0x7 }).unwrap();

    let resp = h.mcast.verify_table(h.dev, TableId::GlobalRid).unwrap();
    assert_eq!(resp.mismatches.len(), 1);
    assert_eq!(resp.mismatches[0].index >> 24, 1);
    assert_eq!(resp.mismatches[0].shadow, 0x42);
    assert_eq!(resp.mismatches[0].hw, 0x7);
}

// A write failure mid-flush leaves the device refusing mutation until
// resync; reads and dumps stay available.
#[test]
fn flush_failure_poisons_device_for_mutation() {
    let h = harness(Family::Gen1);
    let mgid = Mgid(0x40);
    h.mcast.mgrp_create(h.sess, mgid).unwrap();
    let node = h
        .mcast
        .node_create(h.sess, Rid(0x3), &[PortId(5)], &[])
        .unwrap();

    h.hw.fail_from(1);
    let res = h.mcast.associate(h.sess, mgid, node, None, false);
    assert!(matches!(res, Err(McError::HwCommFail(_))), "{res:?}");
    assert!(h.mcast.needs_resync(h.dev).unwrap());

    let res = h.mcast.mgrp_create(h.sess, Mgid(0x41));
    assert!(matches!(res, Err(McError::Unexpected(_))), "{res:?}");

    // Diagnostics still work on a poisoned device.
    h.mcast.rdm_dump(h.dev).unwrap();
    h.mcast.mgrp_dump(h.dev, mgid).unwrap();
}

// The XID variant rides along the L1 node and survives an update of
// the node's fan-out.
#[test]
fn xid_association_survives_node_update() {
    let h = harness(Family::Gen3);
    let mgid = Mgid(0x50);
    h.mcast.mgrp_create(h.sess, mgid).unwrap();
    let node = h
        .mcast
        .node_create(h.sess, Rid(0x9), &[PortId(10), PortId(40)], &[])
        .unwrap();
    h.mcast
        .associate(h.sess, mgid, node, Some(mcast::api::Xid(0x123)), true)
        .unwrap();
    assert_clean(&h, mgid);

    h.mcast
        .node_update(h.sess, node, &[PortId(10), PortId(200)], &[LagId(2)])
        .unwrap();
    assert_clean(&h, mgid);

    let dump = h.mcast.mgrp_dump(h.dev, mgid).unwrap();
    assert_eq!(dump.l1[0].xid, Some(0x123));
    assert_eq!(dump.l1[0].lags, vec![2]);
}

// Allocator accounting: block ownership shows up in the dump while a
// tree is up and drains when it comes down.
#[test]
fn rdm_ownership_tracks_tree_lifetime() {
    let h = harness(Family::Gen1);
    let mgid = Mgid(0x60);
    h.mcast.mgrp_create(h.sess, mgid).unwrap();
    assert!(h.mcast.rdm_dump(h.dev).unwrap().owners.is_empty());

    let node = h
        .mcast
        .node_create(h.sess, Rid(0x4), &[PortId(1), PortId(73)], &[])
        .unwrap();
    h.mcast.associate(h.sess, mgid, node, None, false).unwrap();

    let dump = h.mcast.rdm_dump(h.dev).unwrap();
    let owner_pipes =
        dump.owners.iter().map(|(_, pipe)| *pipe).sorted().collect_vec();
    assert_eq!(owner_pipes, vec![0, 1]);

    h.mcast.dissociate(h.sess, mgid, node).unwrap();
    h.mcast.node_destroy(h.sess, node).unwrap();
    h.mcast.mgrp_destroy(h.sess, mgid).unwrap();
    assert!(h.mcast.rdm_dump(h.dev).unwrap().owners.is_empty());
}

// A reader racing the versioned-table flip must observe a fully-old
// or fully-new port mask, never a blend, and never a mask older than
// the one already seen. The writer publishes a distinct single-port
// mask per iteration so a stale or torn read is distinguishable.
#[test]
fn port_mask_flip_is_atomic_to_readers() {
    use mcast::engine::hw::VersionedTable;

    let h = harness(Family::Gen1);
    let hw = Arc::clone(&h.hw);

    std::thread::scope(|s| {
        let reader = s.spawn(move || {
            let mut last = 0u16;
            for _ in 0..4000 {
                let ver =
                    hw.read_tbl_ver(0, VersionedTable::PortMask).unwrap();
                let mask = hw.read_port_mask(0, ver).unwrap();
                let ones = mask.iter_ones().collect_vec();
                assert!(ones.len() <= 1, "torn port mask: {ones:?}");
                if let Some(port) = ones.first() {
                    assert!(
                        *port >= last,
                        "stale version exposed: {port} after {last}",
                    );
                    last = *port;
                }
            }
        });

        for port in 0..288 {
            h.mcast.port_mask_set(h.sess, &[PortId(port)]).unwrap();
        }
        reader.join().unwrap();
    });
}

// Address zero is a sentinel: no allocation may ever hand it out, so
// the dump never shows half-line 0 or 1 free either.
#[test]
fn rdm_address_zero_stays_reserved() {
    let h = harness(Family::Gen1);
    let mgid = Mgid(0x70);
    h.mcast.mgrp_create(h.sess, mgid).unwrap();
    let node = h
        .mcast
        .node_create(h.sess, Rid(0x5), &[PortId(0)], &[])
        .unwrap();
    h.mcast.associate(h.sess, mgid, node, None, false).unwrap();

    let dump = h.mcast.mgrp_dump(h.dev, mgid).unwrap();
    // Pipes without fan-out carry the null root; the live pipe's
    // root and every materialized line must be a real address.
    assert!(dump.mit_roots.iter().any(|r| !r.is_null()));
    assert!(!dump.l1.is_empty());
    for l1 in &dump.l1 {
        assert!(!l1.pipes.is_empty());
        for pd in &l1.pipes {
            assert_ne!(pd.addr, RdmAddr::NULL);
        }
    }
}
