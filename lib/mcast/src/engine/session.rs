// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Sessions and the write-list.
//!
//! Every mutating operation runs under a session. Outside a batch the
//! session's write-list is flushed at the end of each operation;
//! between `batch_begin` and `batch_end` it accumulates, so a caller
//! can make a compound update visible to the hardware as one ordered
//! burst.
//!
//! The write-list draws from a bounded per-session descriptor pool.
//! Capacity is reserved with [`Wrl::reserve`] before any shadow state
//! mutates, so exhaustion surfaces as `NoSysResources` with nothing
//! staged and nothing to roll back.

use super::MAX_SESSIONS;
use super::Result;
use super::WRL_POOL_DESCS;
use super::hw::WriteOp;
use mcast_api::Dev;
use mcast_api::McError;
use mcast_api::SessionHdl;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    Batching,
}

/// A bounded, ordered list of staged hardware writes.
pub struct Wrl {
    ops: Vec<WriteOp>,
    /// Descriptors promised by [`Self::reserve`] but not yet staged.
    reserved: usize,
}

impl Wrl {
    fn new() -> Self {
        Self { ops: Vec::new(), reserved: 0 }
    }

    /// Reserve room for `n` more descriptors. Fails without staging
    /// anything when the pool cannot cover the request.
    pub fn reserve(&mut self, n: usize) -> Result<()> {
        if self.ops.len() + self.reserved + n > WRL_POOL_DESCS {
            return Err(McError::NoSysResources(format!(
                "write-list pool exhausted: {} staged, {} reserved, {} more \
                 requested",
                self.ops.len(),
                self.reserved,
                n
            )));
        }
        self.reserved += n;
        Ok(())
    }

    /// Stage ops against the current reservation, preserving order.
    /// A reservation is a worst case; the unused remainder returns to
    /// the pool.
    pub fn commit(&mut self, ops: Vec<WriteOp>) {
        debug_assert!(ops.len() <= self.reserved);
        self.reserved = 0;
        self.ops.extend(ops);
    }

    /// Drop the current reservation without staging (failed op).
    pub fn abandon(&mut self) {
        self.reserved = 0;
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Take the staged list for flushing.
    pub fn take(&mut self) -> Vec<WriteOp> {
        std::mem::take(&mut self.ops)
    }
}

pub struct Session {
    pub dev: Dev,
    pub state: SessionState,
    pub wrl: Wrl,
}

/// The global session table. Handles encode the slot index; a slot is
/// reusable as soon as its session is destroyed.
pub struct SessionTable {
    slots: Vec<Option<Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self { slots: (0..MAX_SESSIONS).map(|_| None).collect() }
    }

    pub fn create(&mut self, dev: Dev) -> Result<SessionHdl> {
        let Some(slot) = self.slots.iter().position(|s| s.is_none()) else {
            return Err(McError::NoSysResources(format!(
                "all {} sessions in use",
                MAX_SESSIONS
            )));
        };
        self.slots[slot] = Some(Session {
            dev,
            state: SessionState::Idle,
            wrl: Wrl::new(),
        });
        Ok(SessionHdl(slot as u16))
    }

    /// Tear down a session. Writes still staged (an abandoned batch)
    /// are discarded, never flushed.
    pub fn destroy(&mut self, hdl: SessionHdl) -> Result<Session> {
        self.slots
            .get_mut(hdl.0 as usize)
            .and_then(Option::take)
            .ok_or_else(|| {
                McError::InvalidArgument(format!("no such session: {:?}", hdl))
            })
    }

    pub fn get(&self, hdl: SessionHdl) -> Result<&Session> {
        self.slots
            .get(hdl.0 as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                McError::InvalidArgument(format!("no such session: {:?}", hdl))
            })
    }

    pub fn get_mut(&mut self, hdl: SessionHdl) -> Result<&mut Session> {
        self.slots
            .get_mut(hdl.0 as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| {
                McError::InvalidArgument(format!("no such session: {:?}", hdl))
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = (SessionHdl, &Session)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.as_ref().map(|s| (SessionHdl(i as u16), s))
        })
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_limit() {
        let mut tbl = SessionTable::new();
        let first = tbl.create(Dev(0)).unwrap();
        for _ in 1..MAX_SESSIONS {
            tbl.create(Dev(0)).unwrap();
        }
        let err = tbl.create(Dev(0)).unwrap_err();
        assert!(matches!(err, McError::NoSysResources(_)));

        // Destroying one frees its slot for reuse.
        tbl.destroy(first).unwrap();
        assert_eq!(tbl.create(Dev(0)).unwrap(), first);
    }

    #[test]
    fn reserve_before_stage() {
        let mut tbl = SessionTable::new();
        let hdl = tbl.create(Dev(0)).unwrap();
        let sess = tbl.get_mut(hdl).unwrap();

        let err = sess.wrl.reserve(WRL_POOL_DESCS + 1).unwrap_err();
        assert!(matches!(err, McError::NoSysResources(_)));
        assert!(sess.wrl.is_empty());

        sess.wrl.reserve(4).unwrap();
        sess.wrl.commit(vec![WriteOp::GlobalRid { rid: 1 }]);
        assert_eq!(sess.wrl.len(), 1);

        // The unused remainder of the reservation is back in the
        // pool.
        sess.wrl.reserve(WRL_POOL_DESCS - 1).unwrap();
        sess.wrl.abandon();
    }

    #[test]
    fn destroy_discards_staged_writes() {
        let mut tbl = SessionTable::new();
        let hdl = tbl.create(Dev(0)).unwrap();
        let sess = tbl.get_mut(hdl).unwrap();
        sess.state = SessionState::Batching;
        sess.wrl.reserve(1).unwrap();
        sess.wrl.commit(vec![WriteOp::GlobalRid { rid: 7 }]);

        let sess = tbl.destroy(hdl).unwrap();
        assert_eq!(sess.wrl.len(), 1);
        assert!(tbl.get(hdl).is_err());
    }
}
