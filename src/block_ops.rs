/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! The non-arena half of the engine (§2 layer 4, §4.3): the block chain, the
//! free histogram, and the four counters that don't depend on the OS
//! collaborator. Split, coalesce-lower, coalesce-upper, and maximal coalesce
//! all live here. Wilderness enlargement needs the arena, so it lives
//! alongside the allocation surface instead.

use crate::chain::Chain;
use crate::constants::MIN_SPLIT_PAYLOAD;
use crate::header::{BlockHeader, HEADER_SIZE};
use crate::histogram::Histogram;
use std::ptr::NonNull;

pub(crate) struct Engine {
    pub(crate) chain: Chain,
    pub(crate) histogram: Histogram,
    pub(crate) free_blocks: usize,
    pub(crate) free_bytes: usize,
    pub(crate) allocated_blocks: usize,
    pub(crate) allocated_bytes: usize,
}

impl Engine {
    pub(crate) const fn new() -> Self {
        Self {
            chain: Chain::new(),
            histogram: Histogram::new(),
            free_blocks: 0,
            free_bytes: 0,
            allocated_blocks: 0,
            allocated_bytes: 0,
        }
    }

    unsafe fn size_of(block: NonNull<BlockHeader>) -> usize {
        unsafe { (*block.as_ptr()).size }
    }

    unsafe fn set_size(block: NonNull<BlockHeader>, size: usize) {
        unsafe { (*block.as_ptr()).size = size };
    }

    unsafe fn is_free(block: NonNull<BlockHeader>) -> bool {
        unsafe { (*block.as_ptr()).free }
    }

    unsafe fn set_free(block: NonNull<BlockHeader>, free: bool) {
        unsafe { (*block.as_ptr()).free = free };
    }

    /// Insert a free block into the histogram, keeping `free_blocks` and
    /// `free_bytes` in lock-step with histogram membership.
    pub(crate) unsafe fn hist_insert(&mut self, block: NonNull<BlockHeader>) {
        let size = unsafe { Self::size_of(block) };
        unsafe { self.histogram.insert(block) };
        self.free_blocks += 1;
        self.free_bytes += size;
    }

    /// Remove a free block from the histogram.
    pub(crate) unsafe fn hist_remove(&mut self, block: NonNull<BlockHeader>) {
        let size = unsafe { Self::size_of(block) };
        unsafe { self.histogram.remove(block) };
        self.free_blocks -= 1;
        self.free_bytes -= size;
    }

    /// Remove from an explicitly named bin, for a block whose size field
    /// has already moved on from the one that put it there.
    pub(crate) unsafe fn hist_remove_from_bin(&mut self, i: usize, block: NonNull<BlockHeader>) {
        let size = unsafe { Self::size_of(block) };
        unsafe { self.histogram.remove_from_bin(i, block) };
        self.free_blocks -= 1;
        self.free_bytes -= size;
    }

    /// Split `block` (currently allocated, payload `s`) down to payload `r`
    /// if the leftover is large enough to be worth a header of its own.
    /// Leaves `block` at exactly payload `r` either way.
    pub(crate) unsafe fn maybe_split(&mut self, block: NonNull<BlockHeader>, r: usize) {
        let s = unsafe { Self::size_of(block) };
        debug_assert!(r <= s);
        if s - r < MIN_SPLIT_PAYLOAD + HEADER_SIZE {
            return;
        }
        unsafe { Self::set_size(block, r) };

        let fragment_addr = block.as_ptr() as usize + HEADER_SIZE + r;
        let fragment_size = s - r - HEADER_SIZE;
        let mut fragment = unsafe { NonNull::new_unchecked(fragment_addr as *mut BlockHeader) };
        unsafe {
            fragment.as_mut().size = fragment_size;
            fragment.as_mut().free = true;
            fragment.as_mut().bin_prev = None;
            fragment.as_mut().bin_next = None;
        }

        // Read before insert_after mutates block's chain_next.
        unsafe { self.chain.insert_after(block, fragment) };
        unsafe { self.hist_insert(fragment) };

        self.allocated_blocks += 1;
        self.allocated_bytes -= HEADER_SIZE;
    }

    /// Merge `block`'s predecessor into it if the predecessor is free.
    /// Returns the merged block (the predecessor's identity) on success.
    pub(crate) unsafe fn coalesce_lower(
        &mut self,
        block: NonNull<BlockHeader>,
    ) -> Option<NonNull<BlockHeader>> {
        let prev = unsafe { (*block.as_ptr()).chain_prev }?;
        if !unsafe { Self::is_free(prev) } {
            return None;
        }
        unsafe { self.hist_remove(prev) };
        let merged_free = unsafe { Self::is_free(block) };
        let new_size = unsafe { Self::size_of(prev) + HEADER_SIZE + Self::size_of(block) };
        unsafe {
            Self::set_size(prev, new_size);
            Self::set_free(prev, merged_free);
            self.chain.unlink(block);
        }
        self.allocated_blocks -= 1;
        self.allocated_bytes += HEADER_SIZE;
        Some(prev)
    }

    /// Merge `block`'s successor into it if the successor is free. `block`
    /// keeps its own identity and free flag; only the successor is absorbed.
    pub(crate) unsafe fn coalesce_upper(
        &mut self,
        block: NonNull<BlockHeader>,
    ) -> Option<NonNull<BlockHeader>> {
        let next = unsafe { (*block.as_ptr()).chain_next }?;
        if !unsafe { Self::is_free(next) } {
            return None;
        }
        unsafe { self.hist_remove(next) };
        let new_size = unsafe { Self::size_of(block) + HEADER_SIZE + Self::size_of(next) };
        unsafe {
            Self::set_size(block, new_size);
            self.chain.unlink(next);
        }
        self.allocated_blocks -= 1;
        self.allocated_bytes += HEADER_SIZE;
        Some(block)
    }

    /// Coalesce `block` (already marked free, not yet in the histogram)
    /// with both neighbours until neither is free. The address-order
    /// no-two-adjacent-free invariant means at most two passes are ever
    /// needed. Returns the final merged block, still outside the histogram.
    pub(crate) unsafe fn maximal_coalesce(&mut self, block: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
        let mut current = block;
        loop {
            let mut merged_any = false;
            if let Some(merged) = unsafe { self.coalesce_lower(current) } {
                current = merged;
                merged_any = true;
            }
            if let Some(merged) = unsafe { self.coalesce_upper(current) } {
                current = merged;
                merged_any = true;
            }
            if !merged_any {
                break;
            }
        }
        current
    }
}
