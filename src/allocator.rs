/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! The allocation surface (§2 layer 5, §4.4-§4.8): `alloc`, `alloc_zeroed`,
//! `free`, `realloc`, and the six introspection counters, plus wilderness
//! enlargement, the one block operator that needs the OS collaborator.

use crate::arena::{page_size, ArenaSource, PosixArena};
use crate::block_ops::Engine;
use crate::constants::{LARGE_THRESHOLD, MAX_SIZE};
use crate::header::{BlockHeader, HEADER_SIZE};
use crate::histogram::bin_index;
use crate::mapped::{alloc_mapped, free_mapped};
use log::warn;
use std::ptr;
use std::ptr::NonNull;

fn validate_size(size: usize) -> bool {
    size != 0 && size <= MAX_SIZE
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// The allocator engine: a histogram-backed arena allocator plus a
/// large-allocation mmap path, parameterized over its OS collaborator so it
/// can be driven by [`crate::arena::VecArena`] in tests.
pub struct Allocator<A: ArenaSource = PosixArena> {
    engine: Engine,
    arena: A,
}

impl Allocator<PosixArena> {
    pub fn new() -> Self {
        Self {
            engine: Engine::new(),
            arena: PosixArena::new(),
        }
    }
}

impl Default for Allocator<PosixArena> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: ArenaSource> Allocator<A> {
    /// Construct an allocator over an explicit OS collaborator. Every test
    /// case gets its own arena this way, so no state leaks between them.
    pub fn with_arena(arena: A) -> Self {
        Self {
            engine: Engine::new(),
            arena,
        }
    }

    // ---- §4.4 alloc --------------------------------------------------

    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if !validate_size(size) {
            return ptr::null_mut();
        }
        if size >= LARGE_THRESHOLD {
            return match unsafe { alloc_mapped(&mut self.arena, size) } {
                Ok(payload) => {
                    self.engine.allocated_blocks += 1;
                    self.engine.allocated_bytes += size;
                    payload.as_ptr()
                }
                Err(e) => {
                    warn!("large allocation of {size} bytes failed: {e}");
                    ptr::null_mut()
                }
            };
        }

        if let Some(block) = self.engine.histogram.find_first_fit(size) {
            unsafe {
                self.engine.hist_remove(block);
                (*block.as_ptr()).free = false;
                self.engine.maybe_split(block, size);
                return BlockHeader::payload_ptr(block).as_ptr();
            }
        }

        match self.engine.chain.wilderness {
            None => self.grow_fresh(size),
            Some(w) if unsafe { (*w.as_ptr()).free } => self.grow_wilderness(w, size),
            Some(_) => self.extend_past_wilderness(size),
        }
    }

    fn grow_fresh(&mut self, size: usize) -> *mut u8 {
        let total = HEADER_SIZE + size;
        let base = match self.arena.grow_break(total) {
            Ok(addr) => addr,
            Err(e) => {
                warn!("failed to grow a fresh arena by {total} bytes: {e}");
                return ptr::null_mut();
            }
        };
        let mut block = unsafe { NonNull::new_unchecked(base as *mut BlockHeader) };
        unsafe {
            block.as_mut().size = size;
            block.as_mut().free = false;
            block.as_mut().bin_prev = None;
            block.as_mut().bin_next = None;
            self.engine.chain.install_first(block);
        }
        self.engine.allocated_blocks += 1;
        self.engine.allocated_bytes += size;
        unsafe { BlockHeader::payload_ptr(block).as_ptr() }
    }

    fn grow_wilderness(&mut self, w: NonNull<BlockHeader>, size: usize) -> *mut u8 {
        let old_size = unsafe { (*w.as_ptr()).size };
        let deficit = size - old_size;
        if let Err(e) = self.arena.grow_break(deficit) {
            warn!("failed to enlarge the wilderness by {deficit} bytes: {e}");
            return ptr::null_mut();
        }
        let old_bin = bin_index(old_size);
        unsafe { self.engine.hist_remove_from_bin(old_bin, w) };
        unsafe {
            (*w.as_ptr()).size = size;
            (*w.as_ptr()).free = false;
        }
        self.engine.allocated_bytes += deficit;
        unsafe { BlockHeader::payload_ptr(w).as_ptr() }
    }

    fn extend_past_wilderness(&mut self, size: usize) -> *mut u8 {
        let total = HEADER_SIZE + size;
        let addr = match self.arena.grow_break(total) {
            Ok(a) => a,
            Err(e) => {
                warn!("failed to extend past the wilderness by {total} bytes: {e}");
                return ptr::null_mut();
            }
        };
        let mut block = unsafe { NonNull::new_unchecked(addr as *mut BlockHeader) };
        unsafe {
            block.as_mut().size = size;
            block.as_mut().free = false;
            block.as_mut().bin_prev = None;
            block.as_mut().bin_next = None;
            self.engine.chain.append_after_wilderness(block);
        }
        self.engine.allocated_blocks += 1;
        self.engine.allocated_bytes += size;
        unsafe { BlockHeader::payload_ptr(block).as_ptr() }
    }

    // ---- §4.5 alloc_zeroed --------------------------------------------

    pub fn alloc_zeroed(&mut self, n: usize, size: usize) -> *mut u8 {
        let Some(total) = n.checked_mul(size) else {
            return ptr::null_mut();
        };
        let payload = self.alloc(total);
        if !payload.is_null() {
            unsafe { ptr::write_bytes(payload, 0, total) };
        }
        payload
    }

    // ---- §4.6 free ------------------------------------------------------

    pub fn free(&mut self, ptr: *mut u8) {
        let Some(payload) = NonNull::new(ptr) else {
            return;
        };
        let header = unsafe { BlockHeader::from_payload(payload) };
        let size = unsafe { (*header.as_ptr()).size };

        if size >= LARGE_THRESHOLD {
            self.engine.allocated_blocks -= 1;
            self.engine.allocated_bytes -= size;
            unsafe { free_mapped(&mut self.arena, header) };
            return;
        }

        if unsafe { (*header.as_ptr()).free } {
            return;
        }

        unsafe {
            (*header.as_ptr()).free = true;
            let merged = self.engine.maximal_coalesce(header);
            self.engine.hist_insert(merged);
        }
    }

    // ---- §4.7 realloc ----------------------------------------------------

    pub fn realloc(&mut self, ptr: *mut u8, r: usize) -> *mut u8 {
        let Some(old_payload) = NonNull::new(ptr) else {
            return self.alloc(r);
        };
        if !validate_size(r) {
            return ptr::null_mut();
        }

        let old_header = unsafe { BlockHeader::from_payload(old_payload) };
        let old_size = unsafe { (*old_header.as_ptr()).size };

        if old_size >= r {
            return self.realloc_shrink(old_header, old_payload, old_size, r);
        }
        if old_size >= LARGE_THRESHOLD {
            return self.realloc_grow_mapped(old_header, old_payload, old_size, r);
        }
        if self.engine.chain.is_wilderness(old_header) {
            return self.realloc_wilderness(old_header, old_payload, old_size, r);
        }

        let prev = unsafe { (*old_header.as_ptr()).chain_prev };
        let next = unsafe { (*old_header.as_ptr()).chain_next };
        let prev_free = prev.is_some_and(|p| unsafe { (*p.as_ptr()).free });
        let next_free = next.is_some_and(|n| unsafe { (*n.as_ptr()).free });

        if prev_free {
            let prev_size = unsafe { (*prev.unwrap().as_ptr()).size };
            if prev_size + HEADER_SIZE + old_size >= r {
                return self.realloc_via_lower(old_header, old_payload, old_size, r);
            }
        }
        if next_free {
            let next_size = unsafe { (*next.unwrap().as_ptr()).size };
            if old_size + HEADER_SIZE + next_size >= r {
                return self.realloc_via_upper(old_header, old_payload, old_size, r);
            }
        }
        if prev_free && next_free {
            let prev_size = unsafe { (*prev.unwrap().as_ptr()).size };
            let next_size = unsafe { (*next.unwrap().as_ptr()).size };
            if prev_size + 2 * HEADER_SIZE + old_size + next_size >= r {
                return self.realloc_via_both(old_header, old_payload, old_size, r);
            }
        }

        self.realloc_fallback(old_payload, old_size, r)
    }

    fn realloc_shrink(
        &mut self,
        header: NonNull<BlockHeader>,
        payload: NonNull<u8>,
        old_size: usize,
        r: usize,
    ) -> *mut u8 {
        if old_size >= LARGE_THRESHOLD {
            let page = page_size();
            let old_total = HEADER_SIZE + old_size;
            let new_total = round_up(HEADER_SIZE + r, page);
            if new_total < old_total {
                let tail_addr = header.as_ptr() as usize + new_total;
                let tail_len = old_total - new_total;
                unsafe {
                    self.arena
                        .unmap(NonNull::new_unchecked(tail_addr as *mut u8), tail_len);
                }
            }
            self.engine.allocated_bytes -= old_size - r;
            unsafe { (*header.as_ptr()).size = r };
            return payload.as_ptr();
        }
        unsafe { self.engine.maybe_split(header, r) };
        payload.as_ptr()
    }

    fn realloc_grow_mapped(
        &mut self,
        header: NonNull<BlockHeader>,
        payload: NonNull<u8>,
        old_size: usize,
        r: usize,
    ) -> *mut u8 {
        match unsafe { alloc_mapped(&mut self.arena, r) } {
            Ok(new_payload) => {
                unsafe {
                    ptr::copy_nonoverlapping(payload.as_ptr(), new_payload.as_ptr(), old_size);
                    free_mapped(&mut self.arena, header);
                }
                self.engine.allocated_bytes += r - old_size;
                new_payload.as_ptr()
            }
            Err(e) => {
                warn!("failed to grow a mapped allocation to {r} bytes: {e}");
                ptr::null_mut()
            }
        }
    }

    fn realloc_wilderness(
        &mut self,
        header: NonNull<BlockHeader>,
        payload: NonNull<u8>,
        old_size: usize,
        r: usize,
    ) -> *mut u8 {
        let mut wilderness = header;
        if let Some(prev) = unsafe { (*wilderness.as_ptr()).chain_prev } {
            if unsafe { (*prev.as_ptr()).free } {
                wilderness = unsafe { self.engine.coalesce_lower(wilderness) }.unwrap();
            }
        }

        let cur_size = unsafe { (*wilderness.as_ptr()).size };
        if cur_size >= r {
            let new_payload = unsafe { BlockHeader::payload_ptr(wilderness) };
            unsafe { ptr::copy(payload.as_ptr(), new_payload.as_ptr(), old_size) };
            unsafe { self.engine.maybe_split(wilderness, r) };
            return new_payload.as_ptr();
        }

        let deficit = r - cur_size;
        if let Err(e) = self.arena.grow_break(deficit) {
            warn!("failed to grow the wilderness by {deficit} bytes during realloc: {e}");
            return ptr::null_mut();
        }
        unsafe { (*wilderness.as_ptr()).size = r };
        self.engine.allocated_bytes += deficit;
        let new_payload = unsafe { BlockHeader::payload_ptr(wilderness) };
        unsafe { ptr::copy(payload.as_ptr(), new_payload.as_ptr(), old_size) };
        new_payload.as_ptr()
    }

    fn realloc_via_lower(
        &mut self,
        header: NonNull<BlockHeader>,
        payload: NonNull<u8>,
        old_size: usize,
        r: usize,
    ) -> *mut u8 {
        let merged = unsafe { self.engine.coalesce_lower(header) }
            .expect("lower neighbour was already checked free");
        let new_payload = unsafe { BlockHeader::payload_ptr(merged) };
        unsafe { ptr::copy(payload.as_ptr(), new_payload.as_ptr(), old_size) };
        unsafe { self.engine.maybe_split(merged, r) };
        new_payload.as_ptr()
    }

    fn realloc_via_upper(
        &mut self,
        header: NonNull<BlockHeader>,
        payload: NonNull<u8>,
        _old_size: usize,
        r: usize,
    ) -> *mut u8 {
        let merged = unsafe { self.engine.coalesce_upper(header) }
            .expect("upper neighbour was already checked free");
        unsafe { self.engine.maybe_split(merged, r) };
        payload.as_ptr()
    }

    fn realloc_via_both(
        &mut self,
        header: NonNull<BlockHeader>,
        payload: NonNull<u8>,
        old_size: usize,
        r: usize,
    ) -> *mut u8 {
        let merged = unsafe { self.engine.coalesce_lower(header) }
            .expect("lower neighbour was already checked free");
        let merged = unsafe { self.engine.coalesce_upper(merged) }
            .expect("upper neighbour was already checked free");
        let new_payload = unsafe { BlockHeader::payload_ptr(merged) };
        unsafe { ptr::copy(payload.as_ptr(), new_payload.as_ptr(), old_size) };
        unsafe { self.engine.maybe_split(merged, r) };
        new_payload.as_ptr()
    }

    fn realloc_fallback(&mut self, payload: NonNull<u8>, old_size: usize, r: usize) -> *mut u8 {
        let new_ptr = self.alloc(r);
        if new_ptr.is_null() {
            return ptr::null_mut();
        }
        let copy_len = old_size.min(r);
        unsafe { ptr::copy_nonoverlapping(payload.as_ptr(), new_ptr, copy_len) };
        self.free(payload.as_ptr());
        new_ptr
    }

    // ---- §4.8 counters --------------------------------------------------

    pub fn num_free_blocks(&self) -> usize {
        self.engine.free_blocks
    }

    pub fn num_free_bytes(&self) -> usize {
        self.engine.free_bytes
    }

    pub fn num_allocated_blocks(&self) -> usize {
        self.engine.allocated_blocks
    }

    pub fn num_allocated_bytes(&self) -> usize {
        self.engine.allocated_bytes
    }

    pub fn num_meta_bytes(&self) -> usize {
        self.engine.allocated_blocks * HEADER_SIZE
    }

    pub fn size_meta(&self) -> usize {
        HEADER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::VecArena;

    fn fresh() -> Allocator<VecArena> {
        Allocator::with_arena(VecArena::new(1024 * 1024))
    }

    #[test]
    fn alloc_zero_rejected() {
        let mut a = fresh();
        assert!(a.alloc(0).is_null());
    }

    #[test]
    fn alloc_above_cap_rejected() {
        let mut a = fresh();
        assert!(a.alloc(MAX_SIZE + 1).is_null());
    }

    #[test]
    fn fresh_alloc_then_free_returns_counters_to_zero() {
        let mut a = fresh();
        let p = a.alloc(64);
        assert!(!p.is_null());
        assert_eq!(a.num_allocated_blocks(), 1);
        assert_eq!(a.num_allocated_bytes(), 64);
        assert_eq!(a.num_free_blocks(), 0);

        a.free(p);
        assert_eq!(a.num_allocated_blocks(), 1);
        assert_eq!(a.num_free_blocks(), 1);
        assert_eq!(a.num_free_bytes(), 64);
    }

    #[test]
    fn double_free_is_a_no_op() {
        let mut a = fresh();
        let p = a.alloc(32);
        a.free(p);
        let free_blocks_after_first = a.num_free_blocks();
        a.free(p);
        assert_eq!(a.num_free_blocks(), free_blocks_after_first);
    }

    #[test]
    fn adjacent_frees_coalesce_into_one_wilderness_block() {
        let mut a = fresh();
        let p1 = a.alloc(100);
        let p2 = a.alloc(200);
        assert_eq!(a.num_allocated_blocks(), 2);

        a.free(p1);
        a.free(p2);

        assert_eq!(a.num_free_blocks(), 1);
        assert_eq!(a.num_allocated_blocks(), 1);
        assert_eq!(a.num_free_bytes(), 100 + HEADER_SIZE + 200);
    }

    #[test]
    fn alloc_zeroed_zeroes_the_payload() {
        let mut a = fresh();
        let p = a.alloc(32);
        unsafe { ptr::write_bytes(p, 0xAB, 32) };
        a.free(p);

        let q = a.alloc_zeroed(8, 4);
        assert!(!q.is_null());
        let bytes = unsafe { std::slice::from_raw_parts(q, 32) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn alloc_zeroed_overflow_rejected() {
        let mut a = fresh();
        assert!(a.alloc_zeroed(usize::MAX, 2).is_null());
    }

    #[test]
    fn realloc_null_acts_like_alloc() {
        let mut a = fresh();
        let p = a.realloc(ptr::null_mut(), 16);
        assert!(!p.is_null());
        assert_eq!(a.num_allocated_blocks(), 1);
    }

    #[test]
    fn realloc_shrink_keeps_same_pointer() {
        let mut a = fresh();
        let p = a.alloc(1024);
        let q = a.realloc(p, 32);
        assert_eq!(p, q);
    }

    #[test]
    fn realloc_grow_via_fallback_preserves_bytes() {
        let mut a = fresh();
        let p = a.alloc(16);
        unsafe {
            ptr::write_bytes(p, 0x42, 16);
        }
        // force a second allocation so p's successor can't absorb it.
        let _keep_alive = a.alloc(16);

        let q = a.realloc(p, 256);
        assert!(!q.is_null());
        let bytes = unsafe { std::slice::from_raw_parts(q, 16) };
        assert!(bytes.iter().all(|&b| b == 0x42));
    }

    #[test]
    fn realloc_grows_wilderness_in_place() {
        let mut a = fresh();
        let p = a.alloc(16);
        unsafe { ptr::write_bytes(p, 0x7, 16) };

        let q = a.realloc(p, 4096);
        assert!(!q.is_null());
        let bytes = unsafe { std::slice::from_raw_parts(q, 16) };
        assert!(bytes.iter().all(|&b| b == 0x7));
    }

    #[test]
    fn large_allocation_round_trips_through_mapped_path() {
        let mut a = fresh();
        let size = LARGE_THRESHOLD + 10;
        let p = a.alloc(size);
        assert!(!p.is_null());
        assert_eq!(a.num_allocated_bytes(), size);
        unsafe { ptr::write_bytes(p, 0x99, size) };
        a.free(p);
        assert_eq!(a.num_allocated_bytes(), 0);
    }

    #[test]
    fn size_meta_matches_header_size() {
        let a = fresh();
        assert_eq!(a.size_meta(), HEADER_SIZE);
        assert_eq!(a.num_meta_bytes(), 0);
    }

    #[test]
    fn realloc_shrink_on_mapped_region_unmaps_the_tail_in_place() {
        let mut a = fresh();
        let page = page_size();
        let big = LARGE_THRESHOLD + 4 * page;
        let p = a.alloc(big);
        assert!(!p.is_null());
        unsafe { ptr::write_bytes(p, 0x5C, big) };

        let smaller = LARGE_THRESHOLD + page;
        let q = a.realloc(p, smaller);
        assert_eq!(p, q, "a mapped shrink stays at the same address");
        assert_eq!(a.num_allocated_bytes(), smaller);
        let bytes = unsafe { std::slice::from_raw_parts(q, smaller) };
        assert!(bytes.iter().all(|&b| b == 0x5C));

        a.free(q);
        assert_eq!(a.num_allocated_blocks(), 0);
    }

    #[test]
    fn realloc_grow_mapped_copies_into_a_fresh_mapping() {
        let mut a = fresh();
        let size = LARGE_THRESHOLD + 16;
        let p = a.alloc(size);
        assert!(!p.is_null());
        unsafe { ptr::write_bytes(p, 0x7E, size) };

        let grown = LARGE_THRESHOLD * 2;
        let q = a.realloc(p, grown);
        assert!(!q.is_null());
        assert_eq!(a.num_allocated_bytes(), grown);
        let bytes = unsafe { std::slice::from_raw_parts(q, size) };
        assert!(bytes.iter().all(|&b| b == 0x7E));

        a.free(q);
        assert_eq!(a.num_allocated_blocks(), 0);
    }
}
