// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! API types shared between the multicast engine and its tooling.
//!
//! Everything in this crate crosses the engine boundary: identifiers,
//! the status taxonomy, and the dump/verify response types consumed by
//! `mcastadm` and the integration tests.

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

use alloc::string::String;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod cmd;

pub use cmd::*;

/// The overall version of the API. Anytime an API is added, removed,
/// or modified, this number should increment. We attach no semantic
/// meaning to the number other than as a means to verify that a tool
/// and the engine it drives were compiled for the same API.
pub const API_VERSION: u64 = 3;

/// A device (chip) identifier assigned at attach.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub struct Dev(pub u16);

/// A multicast group id, the external handle for a replication-tree
/// root. The valid range is family-dependent.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub struct Mgid(pub u16);

/// A device-global port bit index: `pipe * ports_per_pipe + local`.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct PortId(pub u16);

/// A link-aggregation group index.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct LagId(pub u8);

/// The replication id tag carried on replicated copies.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Rid(pub u16);

/// The exclusion id used to suppress replication back to a source.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Xid(pub u16);

/// A prune-table (PMT) row index, historically "YID".
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Yid(pub u16);

/// A logical pipe within one device.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct Pipe(pub u8);

/// An opaque session handle issued by `session_create`.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub struct SessionHdl(pub u16);

/// An opaque L1 node handle issued by `node_create`.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub struct NodeHdl(pub u32);

/// An opaque ECMP group handle issued by `ecmp_alloc`.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub struct EcmpHdl(pub u32);

/// An RDM half-line address. Address zero is permanently reserved as
/// the universal "no next node" sentinel and is never allocated.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
    PartialOrd, Serialize,
)]
pub struct RdmAddr(pub u32);

impl RdmAddr {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl Display for RdmAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The status taxonomy for every fallible engine operation.
///
/// Callers must inspect the status before trusting output parameters.
/// The numeric code is stable for tooling; the `Display` impl prints
/// the status string alongside it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum McError {
    /// A bad handle, range or id. Checked before any hardware is
    /// touched.
    InvalidArgument(String),

    /// A register or memory I/O failure, surfaced immediately with no
    /// automatic retry.
    HwCommFail(String),

    /// A multi-subdevice read-back mismatch or an internal invariant
    /// violation. Always a driver or hardware bug.
    Unexpected(String),

    /// Allocator or write-descriptor exhaustion, always detected
    /// before any hardware write is staged.
    NoSysResources(String),
}

impl McError {
    /// The stable numeric code for this status.
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidArgument(_) => 1,
            Self::HwCommFail(_) => 2,
            Self::Unexpected(_) => 3,
            Self::NoSysResources(_) => 4,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::HwCommFail(_) => "HW_COMM_FAIL",
            Self::Unexpected(_) => "UNEXPECTED",
            Self::NoSysResources(_) => "NO_SYS_RESOURCES",
        }
    }
}

impl Display for McError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            Self::InvalidArgument(m)
            | Self::HwCommFail(m)
            | Self::Unexpected(m)
            | Self::NoSysResources(m) => m,
        };

        write!(f, "{} ({}): {}", self.label(), self.code(), msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for McError {}
