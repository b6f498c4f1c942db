/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! The large-allocation path (§3 "Mapped region", §4.4 step 2): requests at
//! or above `LARGE_THRESHOLD` bypass the arena and are served from their own
//! anonymous mapping. Mapped regions carry the same header layout so `free`
//! and `realloc` can recognize one by its payload size, but they never join
//! the chain or the histogram.

use crate::arena::ArenaSource;
use crate::errors::ArenaError;
use crate::header::{BlockHeader, HEADER_SIZE};
use std::ptr::NonNull;

pub(crate) unsafe fn alloc_mapped<A: ArenaSource>(
    arena: &mut A,
    size: usize,
) -> Result<NonNull<u8>, ArenaError> {
    let total = HEADER_SIZE + size;
    let mut header = unsafe { arena.map(total)?.cast::<BlockHeader>() };
    unsafe {
        header.as_mut().size = size;
        header.as_mut().free = false;
        header.as_mut().chain_prev = None;
        header.as_mut().chain_next = None;
        header.as_mut().bin_prev = None;
        header.as_mut().bin_next = None;
    }
    Ok(unsafe { BlockHeader::payload_ptr(header) })
}

pub(crate) unsafe fn free_mapped<A: ArenaSource>(arena: &mut A, header: NonNull<BlockHeader>) {
    let total = HEADER_SIZE + unsafe { (*header.as_ptr()).size };
    unsafe { arena.unmap(header.cast::<u8>(), total) };
}
