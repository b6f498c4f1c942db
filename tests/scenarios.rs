/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! Scenario-level tests exercising the allocator end to end, each one
//! mirroring a named behavior from the design rather than a single
//! operator in isolation.

use breakheap::arena::VecArena;
use breakheap::constants::LARGE_THRESHOLD;
use breakheap::Allocator;
use std::ptr;

const PADDING_SEED: u64 = 0xCDEF_0123_4567_89AB;

fn fill(ptr: *mut u8, size: usize, tag: u8) {
    unsafe { std::slice::from_raw_parts_mut(ptr, size) }.fill(tag);
}

fn check(ptr: *mut u8, size: usize, tag: u8) {
    let bytes = unsafe { std::slice::from_raw_parts(ptr, size) };
    assert!(bytes.iter().all(|&b| b == tag));
}

fn fresh() -> Allocator<VecArena> {
    Allocator::with_arena(VecArena::new(64 * 1024 * 1024))
}

#[test]
fn small_sizes_round_trip_with_a_fill_pattern() {
    let mut a = fresh();
    for size in 1..=64usize {
        let tag = (PADDING_SEED ^ size as u64) as u8;
        let p = a.alloc(size);
        assert!(!p.is_null(), "alloc({size}) returned null");
        fill(p, size, tag);
        check(p, size, tag);
        a.free(p);
    }
}

#[test]
fn bundle_of_live_allocations_round_trip_independently() {
    let mut a = fresh();
    let mut ptrs = [ptr::null_mut::<u8>(); 16];
    for (i, slot) in ptrs.iter_mut().enumerate() {
        let size = i + 16;
        let p = a.alloc(size);
        assert!(!p.is_null());
        fill(p, size, (PADDING_SEED ^ size as u64) as u8);
        *slot = p;
    }
    for (i, &p) in ptrs.iter().enumerate() {
        let size = i + 16;
        check(p, size, (PADDING_SEED ^ size as u64) as u8);
        a.free(p);
    }
    assert_eq!(a.num_allocated_blocks(), 1);
    assert_eq!(a.num_free_blocks(), 1);
}

#[test]
fn freeing_two_neighbours_coalesces_into_a_single_free_block() {
    let mut a = fresh();
    let p1 = a.alloc(40);
    let p2 = a.alloc(60);
    let p3 = a.alloc(80);
    assert_eq!(a.num_allocated_blocks(), 3);

    a.free(p2);
    assert_eq!(a.num_free_blocks(), 1);

    a.free(p1);
    assert_eq!(a.num_free_blocks(), 1, "p1 should coalesce with p2's fragment");
    assert_eq!(a.num_allocated_blocks(), 2);

    a.free(p3);
    assert_eq!(a.num_free_blocks(), 1);
    assert_eq!(a.num_allocated_blocks(), 1);
}

#[test]
fn allocation_larger_than_any_free_block_grows_the_wilderness() {
    let mut a = fresh();
    let p1 = a.alloc(32);
    a.free(p1);
    assert_eq!(a.num_free_blocks(), 1);

    let before = a.num_allocated_bytes();
    let p2 = a.alloc(4096);
    assert!(!p2.is_null());
    assert_eq!(a.num_free_blocks(), 0, "the wilderness was consumed, not split off");
    assert_eq!(a.num_allocated_bytes(), before - 32 + 4096);
}

#[test]
fn split_leaves_a_reusable_fragment_behind() {
    let mut a = fresh();
    let p = a.alloc(4096);
    a.free(p);
    assert_eq!(a.num_free_bytes(), 4096);

    let small = a.alloc(32);
    assert!(!small.is_null());
    assert!(a.num_free_blocks() >= 1, "the leftover should still be free");
    assert!(a.num_free_bytes() < 4096);
}

#[test]
fn realloc_into_lower_free_neighbour_moves_the_payload_down() {
    let mut a = fresh();
    let p1 = a.alloc(64);
    let p2 = a.alloc(64);
    fill(p2, 64, 0x5A);
    // p3 keeps p2 from being the wilderness, so growth must come from p1.
    let _p3 = a.alloc(64);

    a.free(p1);
    let grown = a.realloc(p2, 150);
    assert!(!grown.is_null());
    check(grown, 64, 0x5A);
}

#[test]
fn realloc_shrink_is_idempotent_on_the_pointer() {
    let mut a = fresh();
    let p = a.alloc(512);
    fill(p, 512, 0x11);
    let q = a.realloc(p, 512);
    assert_eq!(p, q);
    check(q, 512, 0x11);
}

#[test]
fn large_allocation_bypasses_the_histogram_entirely() {
    let mut a = fresh();
    let size = LARGE_THRESHOLD + 4096;
    let p = a.alloc(size);
    assert!(!p.is_null());
    fill(p, size, 0xEE);
    check(p, size, 0xEE);
    assert_eq!(a.num_free_blocks(), 0);
    a.free(p);
    assert_eq!(a.num_allocated_blocks(), 0);
}

#[test]
fn realloc_shrinks_a_mapped_region_in_place() {
    let mut a = fresh();
    let big = LARGE_THRESHOLD + 8192;
    let p = a.alloc(big);
    assert!(!p.is_null());
    fill(p, big, 0x5C);

    let smaller = LARGE_THRESHOLD + 512;
    let q = a.realloc(p, smaller);
    assert_eq!(p, q, "shrinking a mapping keeps the same address");
    check(q, smaller, 0x5C);
    assert_eq!(a.num_allocated_bytes(), smaller);
}

#[test]
fn realloc_grows_a_mapped_region_into_a_new_one() {
    let mut a = fresh();
    let size = LARGE_THRESHOLD + 4096;
    let p = a.alloc(size);
    assert!(!p.is_null());
    fill(p, size, 0x7E);

    let grown = LARGE_THRESHOLD * 2;
    let q = a.realloc(p, grown);
    assert!(!q.is_null());
    check(q, size, 0x7E);
    assert_eq!(a.num_allocated_bytes(), grown);
}

#[test]
fn zero_and_oversize_requests_return_null() {
    let mut a = fresh();
    assert!(a.alloc(0).is_null());
    assert!(a.alloc(breakheap::constants::MAX_SIZE + 1).is_null());
}

#[test]
fn free_of_null_is_a_no_op() {
    let mut a = fresh();
    let before = a.num_allocated_blocks();
    a.free(ptr::null_mut());
    assert_eq!(a.num_allocated_blocks(), before);
}

#[test]
fn global_surface_smoke_test() {
    let p = breakheap::alloc(48);
    assert!(!p.is_null());
    fill(p, 48, 0x33);
    check(p, 48, 0x33);
    let q = breakheap::realloc(p, 96);
    assert!(!q.is_null());
    check(q, 48, 0x33);
    breakheap::free(q);
    assert!(breakheap::size_meta() > 0);
}
