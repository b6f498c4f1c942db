/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! The OS arena primitive (§2 layer 1, external interfaces): extending the
//! contiguous heap and creating/destroying anonymous mappings.
//!
//! [`PosixArena`] is the production collaborator. It reserves a single large
//! range of address space up front with `PROT_NONE` and commits pages into
//! it as the program break grows, rather than calling `sbrk(2)` against the
//! real process break. The real break is already owned by the system
//! allocator backing every ordinary `Box`/`Vec`/`String` in this binary
//! (including the ones `log` and `thiserror` use under the hood), so driving
//! it directly from here would race that allocator for the same resource.
//! Reserve-then-commit gives the same "contiguous, append-only" arena the
//! design calls for without that conflict.
//!
//! [`VecArena`] is a syscall-free stand-in backed by a fixed buffer, useful
//! for exercising the engine's invariants deterministically in tests.

use crate::errors::ArenaError;
use log::{debug, warn};
use std::ffi::c_void;
use std::ptr;
use std::ptr::NonNull;
use std::sync::OnceLock;

/// Bytes of address space reserved up front by [`PosixArena`]. This bounds
/// how far the arena can ever grow; it is virtual address space, not memory.
const RESERVATION_BYTES: usize = 1 << 30;

/// Collaborator the engine grows its arena and large mappings through.
///
/// # Safety
/// Implementations must return addresses that stay valid and exclusively
/// owned by the caller until explicitly unmapped, and `grow_break` must
/// always extend the same contiguous region rather than relocate it.
pub trait ArenaSource {
    /// Extend the break-tracked region by `delta` bytes, returning the
    /// previous end-of-arena address, or an error if the OS refused.
    fn grow_break(&mut self, delta: usize) -> Result<usize, ArenaError>;

    /// Create a private anonymous read/write mapping of `len` bytes.
    fn map(&mut self, len: usize) -> Result<NonNull<u8>, ArenaError>;

    /// Destroy a mapping previously returned by [`ArenaSource::map`].
    ///
    /// # Safety
    /// `addr` and `len` must exactly match a prior, still-live `map` call.
    unsafe fn unmap(&mut self, addr: NonNull<u8>, len: usize);
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// Production [`ArenaSource`], backed by a reserved virtual memory range
/// for the contiguous arena and `mmap`/`munmap` for the large-allocation
/// path.
pub struct PosixArena {
    base: NonNull<u8>,
    committed: usize,
}

impl PosixArena {
    pub fn new() -> Self {
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                RESERVATION_BYTES,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(
            addr,
            libc::MAP_FAILED,
            "failed to reserve arena address space"
        );
        debug!(
            "reserved {RESERVATION_BYTES} bytes of arena address space at {:p}",
            addr
        );
        Self {
            base: unsafe { NonNull::new_unchecked(addr as *mut u8) },
            committed: 0,
        }
    }
}

impl Default for PosixArena {
    fn default() -> Self {
        Self::new()
    }
}

// Only ever touched from behind the crate's global mutex.
unsafe impl Send for PosixArena {}

impl ArenaSource for PosixArena {
    fn grow_break(&mut self, delta: usize) -> Result<usize, ArenaError> {
        let new_committed = self.committed + delta;
        if new_committed > RESERVATION_BYTES {
            warn!(
                "arena exhausted: {new_committed} bytes requested, {RESERVATION_BYTES} reserved"
            );
            return Err(ArenaError::BreakExhausted);
        }
        let protect_len = round_up(new_committed, page_size());
        let rc = unsafe {
            libc::mprotect(
                self.base.as_ptr() as *mut c_void,
                protect_len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            warn!("mprotect failed while growing the arena");
            return Err(ArenaError::BreakExhausted);
        }
        let prev_end = unsafe { self.base.as_ptr().add(self.committed) } as usize;
        self.committed = new_committed;
        Ok(prev_end)
    }

    fn map(&mut self, len: usize) -> Result<NonNull<u8>, ArenaError> {
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            warn!("mmap failed for a {len}-byte mapping");
            return Err(ArenaError::MapFailed);
        }
        Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) })
    }

    unsafe fn unmap(&mut self, addr: NonNull<u8>, len: usize) {
        let rc = unsafe { libc::munmap(addr.as_ptr() as *mut c_void, len) };
        if rc != 0 {
            warn!("munmap failed for {:p} ({len} bytes)", addr.as_ptr());
        }
    }
}

/// A syscall-free [`ArenaSource`] backed by a fixed buffer that is never
/// reallocated, so addresses handed out remain stable for the arena's
/// lifetime. Intended for tests: deterministic, fast, and free of the
/// reserve/commit dance [`PosixArena`] needs to coexist with the system
/// allocator.
pub struct VecArena {
    buf: Vec<u8>,
    committed: usize,
    mappings: std::collections::HashMap<usize, Box<[u8]>>,
}

impl VecArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            committed: 0,
            mappings: std::collections::HashMap::new(),
        }
    }
}

impl Default for VecArena {
    fn default() -> Self {
        Self::new(16 * 1024 * 1024)
    }
}

impl ArenaSource for VecArena {
    fn grow_break(&mut self, delta: usize) -> Result<usize, ArenaError> {
        if self.committed + delta > self.buf.len() {
            return Err(ArenaError::BreakExhausted);
        }
        let prev_end = unsafe { self.buf.as_ptr().add(self.committed) } as usize;
        self.committed += delta;
        Ok(prev_end)
    }

    fn map(&mut self, len: usize) -> Result<NonNull<u8>, ArenaError> {
        let mut block = vec![0u8; len].into_boxed_slice();
        let ptr = unsafe { NonNull::new_unchecked(block.as_mut_ptr()) };
        self.mappings.insert(ptr.as_ptr() as usize, block);
        Ok(ptr)
    }

    unsafe fn unmap(&mut self, addr: NonNull<u8>, _len: usize) {
        self.mappings.remove(&(addr.as_ptr() as usize));
    }
}
