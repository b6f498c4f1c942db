/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! A user-space, single-threaded dynamic memory allocator.
//!
//! Requests below [`constants::LARGE_THRESHOLD`] are served from a
//! contiguous arena grown on demand from the program break, tracked as a
//! doubly linked, address-ordered chain of blocks with a segregated
//! free-list histogram for first-fit lookup. Requests at or above the
//! threshold bypass the arena entirely and are served from their own
//! anonymous mapping.
//!
//! The engine itself, [`Allocator`], is generic over its OS collaborator
//! ([`arena::ArenaSource`]) so it can be exercised deterministically in
//! tests without touching the real process. [`arena::PosixArena`] is the
//! production collaborator. A process-wide instance is exposed through the
//! free functions at the crate root, guarded by a [`spin::Mutex`] since the
//! engine itself carries no internal synchronization.

pub mod arena;
mod block_ops;
mod chain;
pub mod constants;
mod errors;
mod header;
mod histogram;
mod mapped;

mod allocator;
pub use allocator::Allocator;

use arena::PosixArena;
use spin::Mutex;
use std::sync::OnceLock;

static GLOBAL: OnceLock<Mutex<Allocator<PosixArena>>> = OnceLock::new();

fn global() -> &'static Mutex<Allocator<PosixArena>> {
    GLOBAL.get_or_init(|| Mutex::new(Allocator::new()))
}

/// Allocate `size` bytes. Returns null on a zero/oversize request or if the
/// OS collaborator refuses to supply more memory.
pub fn alloc(size: usize) -> *mut u8 {
    global().lock().alloc(size)
}

/// Allocate space for `n` elements of `size` bytes each, zero-initialized.
pub fn alloc_zeroed(n: usize, size: usize) -> *mut u8 {
    global().lock().alloc_zeroed(n, size)
}

/// Release a pointer previously returned by [`alloc`], [`alloc_zeroed`], or
/// [`realloc`]. A null pointer, or a pointer already freed, is a no-op.
pub fn free(ptr: *mut u8) {
    global().lock().free(ptr)
}

/// Resize a previously allocated block to `size` bytes, preserving its
/// contents up to the smaller of the old and new sizes. A null `ptr` behaves
/// like [`alloc`].
pub fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    global().lock().realloc(ptr, size)
}

/// Number of blocks currently sitting in the free histogram.
pub fn num_free_blocks() -> usize {
    global().lock().num_free_blocks()
}

/// Total payload bytes across every block in the free histogram.
pub fn num_free_bytes() -> usize {
    global().lock().num_free_bytes()
}

/// Number of blocks currently carved out of the arena, free or not,
/// including mapped large allocations.
pub fn num_allocated_blocks() -> usize {
    global().lock().num_allocated_blocks()
}

/// Total payload bytes across every block currently carved out of the
/// arena, free or not, including mapped large allocations.
pub fn num_allocated_bytes() -> usize {
    global().lock().num_allocated_bytes()
}

/// Total header overhead across every live block: `num_allocated_blocks()`
/// times `size_meta()`.
pub fn num_meta_bytes() -> usize {
    global().lock().num_meta_bytes()
}

/// Size in bytes of a single block header.
pub fn size_meta() -> usize {
    global().lock().size_meta()
}
