// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The multicast (packet replication) engine.
//!
//! This crate is the control-plane driver for the replication engine
//! of a programmable switch ASIC. A controller creates multicast
//! groups, attaches port/LAG/ECMP members to them, and the engine
//! drives the resulting replication tree into the Replication Data
//! Memory (RDM) that the hardware walks at line rate. All hardware
//! access goes through the [`engine::hw::Transport`] boundary; tests
//! and the `mcastadm` simulator run the full engine over the
//! in-memory [`engine::hw::FakeTransport`].

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub use mcast_api as api;

pub mod engine;
pub mod print;
pub mod sync;
