// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The replication engine, bottom up: address geometry, the hardware
//! transport boundary, the RDM block allocator, the node codec, the
//! replication tree, the ECMP group manager, the mirror tables, the
//! session/write-list batcher, the device registry and the
//! consistency verifier.

use core::result;
use mcast_api::McError;

pub mod addr;
pub mod arena;
pub mod device;
pub mod ecmp;
pub mod hw;
pub mod node;
pub mod rdm;
pub mod session;
pub mod tables;
pub mod tree;
pub mod verify;

pub type Result<T> = result::Result<T, McError>;

/// The fixed upper bound on ECMP group membership.
pub const ECMP_MAX_MBRS: usize = 32;

/// The number of concurrently open sessions supported.
pub const MAX_SESSIONS: usize = 16;

/// The size of the shared write-descriptor pool. Exhaustion is
/// reported as `NoSysResources` before any hardware I/O.
pub const WRL_POOL_DESCS: usize = 16384;
