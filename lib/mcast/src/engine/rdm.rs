// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The RDM block allocator.
//!
//! RDM is carved into a family-fixed set of hardware blocks; each
//! block is usable by exactly one pipe's walker at a time, recorded in
//! the block-ownership registers. The allocator hands out power-of-two
//! aligned runs of half-lines from blocks owned by (or claimable for)
//! the requesting pipe. Ownership changes are never written
//! synchronously: they are appended to the caller's op buffer so they
//! flush atomically with the tree mutation they accompany.
//!
//! Half-line address zero is permanently reserved; it is the
//! universal "no next node" sentinel.

use super::Result;
use super::addr::AddrMap;
use super::hw::WriteOp;
use mcast_api::McError;
use mcast_api::Pipe;
use mcast_api::RdmAddr;

/// The largest supported allocation, as a power of two: 64 half-lines
/// covers a full ECMP member block.
pub const MAX_RUN_LOG2: u8 = 6;

struct Block {
    owner: Option<Pipe>,
    /// Bit set = half-line in use.
    used_map: Vec<u64>,
    used: u32,
}

impl Block {
    fn new(halves: u32) -> Self {
        Self {
            owner: None,
            used_map: vec![0; halves.div_ceil(64) as usize],
            used: 0,
        }
    }

    fn run_free(&self, off: u32, len: u32) -> bool {
        (off..off + len)
            .all(|h| self.used_map[h as usize / 64] & (1 << (h % 64)) == 0)
    }

    fn run_used(&self, off: u32, len: u32) -> bool {
        (off..off + len)
            .all(|h| self.used_map[h as usize / 64] & (1 << (h % 64)) != 0)
    }

    fn mark(&mut self, off: u32, len: u32, used: bool) {
        for h in off..off + len {
            let word = &mut self.used_map[h as usize / 64];
            if used {
                *word |= 1 << (h % 64);
            } else {
                *word &= !(1 << (h % 64));
            }
        }
        if used {
            self.used += len;
        } else {
            self.used -= len;
        }
    }

    /// First free `len`-aligned run of `len` half-lines, if any.
    fn find_run(&self, halves: u32, len: u32) -> Option<u32> {
        (0..halves).step_by(len as usize).find(|&off| self.run_free(off, len))
    }
}

pub struct RdmAllocator {
    halves_per_block: u32,
    blocks: Vec<Block>,
    /// Half-lines permanently reserved (the sentinel line).
    reserved: u32,
}

impl RdmAllocator {
    pub fn new(map: &AddrMap) -> Self {
        let halves = map.halves_per_block();
        let mut blocks = (0..map.rdm_blocks)
            .map(|_| Block::new(halves))
            .collect::<Vec<_>>();

        // Line zero of block zero holds address zero; burn the whole
        // line so no allocation can ever produce it.
        blocks[0].mark(0, 2, true);

        Self { halves_per_block: halves, blocks, reserved: 2 }
    }

    /// Allocate an aligned run of `1 << log2` half-lines for `pipe`.
    /// If a previously unowned block is claimed, the ownership write
    /// is appended to `wrl` ahead of the caller's own writes.
    pub fn alloc(
        &mut self,
        pipe: Pipe,
        log2: u8,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<RdmAddr> {
        if log2 > MAX_RUN_LOG2 {
            return Err(McError::InvalidArgument(format!(
                "rdm run class out of range: {}",
                log2
            )));
        }
        let len = 1u32 << log2;

        // Prefer blocks this pipe already owns.
        for claim_new in [false, true] {
            for (bi, block) in self.blocks.iter_mut().enumerate() {
                let eligible = if claim_new {
                    block.owner.is_none()
                } else {
                    block.owner == Some(pipe)
                };
                if !eligible {
                    continue;
                }
                let Some(off) = block.find_run(self.halves_per_block, len)
                else {
                    continue;
                };
                block.mark(off, len, true);
                if claim_new {
                    block.owner = Some(pipe);
                    wrl.push(WriteOp::BlockOwner {
                        block: bi as u16,
                        owner: Some(pipe),
                    });
                }
                let addr =
                    RdmAddr(bi as u32 * self.halves_per_block + off);
                debug_assert!(!addr.is_null());
                debug_assert_eq!(addr.0 % len, 0);
                return Ok(addr);
            }
        }

        Err(McError::NoSysResources(format!(
            "no rdm run of {} half-lines for pipe {}",
            len, pipe.0
        )))
    }

    /// Return a run obtained from [`Self::alloc`]. A block whose last
    /// run is freed is released back to the unowned pool, with the
    /// ownership clear staged through `wrl`.
    pub fn free(
        &mut self,
        addr: RdmAddr,
        log2: u8,
        wrl: &mut Vec<WriteOp>,
    ) -> Result<()> {
        let len = 1u32 << log2;
        let bi = (addr.0 / self.halves_per_block) as usize;
        let off = addr.0 % self.halves_per_block;
        let Some(block) = self.blocks.get_mut(bi) else {
            return Err(McError::InvalidArgument(format!(
                "rdm free out of range: {}",
                addr
            )));
        };
        if addr.0 % len != 0 {
            return Err(McError::InvalidArgument(format!(
                "misaligned rdm free at {}",
                addr
            )));
        }
        if !block.run_used(off, len) {
            return Err(McError::Unexpected(format!(
                "double free of rdm run at {}",
                addr
            )));
        }
        block.mark(off, len, false);

        let owner_done = bi == 0 && block.used == self.reserved
            || bi != 0 && block.used == 0;
        if owner_done && block.owner.is_some() {
            block.owner = None;
            wrl.push(WriteOp::BlockOwner { block: bi as u16, owner: None });
        }
        Ok(())
    }

    /// Half-lines currently allocated (excluding the reserved line).
    pub fn used_halves(&self) -> u32 {
        self.blocks.iter().map(|b| b.used).sum::<u32>() - self.reserved
    }

    /// Free aligned runs of each size class, for diagnostics.
    pub fn free_runs(&self) -> Vec<(u8, u32)> {
        (0..=MAX_RUN_LOG2)
            .map(|log2| {
                let len = 1u32 << log2;
                let count = self
                    .blocks
                    .iter()
                    .map(|b| {
                        (0..self.halves_per_block)
                            .step_by(len as usize)
                            .filter(|&off| b.run_free(off, len))
                            .count() as u32
                    })
                    .sum();
                (log2, count)
            })
            .collect()
    }

    /// `(block, owner-pipe)` for every owned block.
    pub fn owners(&self) -> impl Iterator<Item = (u16, Pipe)> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(bi, b)| b.owner.map(|p| (bi as u16, p)))
    }

    pub fn owner_of(&self, block: u16) -> Option<Pipe> {
        self.blocks.get(block as usize).and_then(|b| b.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::addr::Family;

    fn alloc() -> RdmAllocator {
        RdmAllocator::new(&AddrMap::new(Family::Gen1))
    }

    #[test]
    fn never_issues_address_zero() {
        let mut rdm = alloc();
        let mut wrl = Vec::new();
        for _ in 0..64 {
            let addr = rdm.alloc(Pipe(0), 1, &mut wrl).unwrap();
            assert!(!addr.is_null());
        }
    }

    #[test]
    fn runs_are_aligned() {
        let mut rdm = alloc();
        let mut wrl = Vec::new();
        for log2 in 0..=MAX_RUN_LOG2 {
            let addr = rdm.alloc(Pipe(1), log2, &mut wrl).unwrap();
            assert_eq!(addr.0 % (1 << log2), 0, "class {}", log2);
        }
    }

    #[test]
    fn ownership_staged_not_written() {
        let mut rdm = alloc();
        let mut wrl = Vec::new();

        let addr = rdm.alloc(Pipe(2), 1, &mut wrl).unwrap();
        // Claiming a fresh block stages exactly one ownership write.
        assert_eq!(
            wrl,
            vec![WriteOp::BlockOwner { block: 0, owner: Some(Pipe(2)) }]
        );

        // A second run from the same block stages nothing new.
        wrl.clear();
        rdm.alloc(Pipe(2), 1, &mut wrl).unwrap();
        assert!(wrl.is_empty());

        // Another pipe cannot share the owned block; it claims the
        // next one.
        wrl.clear();
        let other = rdm.alloc(Pipe(3), 1, &mut wrl).unwrap();
        assert_eq!(rdm.owner_of(0), Some(Pipe(2)));
        assert_eq!(rdm.owner_of(1), Some(Pipe(3)));
        assert_ne!(addr.0 / 8192, other.0 / 8192);

        // Freeing the last run releases the block.
        wrl.clear();
        rdm.free(other, 1, &mut wrl).unwrap();
        assert_eq!(
            wrl,
            vec![WriteOp::BlockOwner { block: 1, owner: None }]
        );
    }

    #[test]
    fn exhaustion_is_no_sys_resources() {
        let map = AddrMap::new(Family::Gen1);
        let mut rdm = RdmAllocator::new(&map);
        let mut wrl = Vec::new();

        let runs_per_block = map.halves_per_block() >> MAX_RUN_LOG2;
        let mut total = 0;
        loop {
            match rdm.alloc(Pipe(0), MAX_RUN_LOG2, &mut wrl) {
                Ok(_) => total += 1,
                Err(e) => {
                    assert!(matches!(e, McError::NoSysResources(_)));
                    break;
                }
            }
        }
        // Every run except the one overlapping the reserved line.
        assert_eq!(
            total,
            map.rdm_blocks as u32 * runs_per_block - 1
        );

        // Nothing was consumed by the failing call.
        let used = rdm.used_halves();
        rdm.alloc(Pipe(0), MAX_RUN_LOG2, &mut wrl).unwrap_err();
        assert_eq!(rdm.used_halves(), used);
    }

    #[test]
    fn double_free_detected() {
        let mut rdm = alloc();
        let mut wrl = Vec::new();
        let addr = rdm.alloc(Pipe(0), 2, &mut wrl).unwrap();
        rdm.free(addr, 2, &mut wrl).unwrap();
        let err = rdm.free(addr, 2, &mut wrl).unwrap_err();
        assert!(matches!(err, McError::Unexpected(_)));
    }
}
