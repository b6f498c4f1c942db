/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! The in-band block header (§2 data model): every block in the chain, and
//! every mapped region, starts with one of these immediately before its
//! payload.

use std::mem;
use std::ptr::NonNull;

#[repr(C)]
pub(crate) struct BlockHeader {
    /// Payload size in bytes, not counting this header.
    pub(crate) size: usize,
    /// Whether the block currently sits in the free histogram.
    pub(crate) free: bool,
    /// Neighbour in the address-ordered block chain, toward lower addresses.
    pub(crate) chain_prev: Option<NonNull<BlockHeader>>,
    /// Neighbour in the address-ordered block chain, toward higher addresses.
    pub(crate) chain_next: Option<NonNull<BlockHeader>>,
    /// Neighbour in this block's histogram bin, toward the bin head.
    pub(crate) bin_prev: Option<NonNull<BlockHeader>>,
    /// Neighbour in this block's histogram bin, away from the bin head.
    pub(crate) bin_next: Option<NonNull<BlockHeader>>,
}

pub(crate) const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

impl BlockHeader {
    /// The address immediately after this header, where the payload begins.
    pub(crate) fn payload_ptr(this: NonNull<BlockHeader>) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked((this.as_ptr() as *mut u8).add(HEADER_SIZE)) }
    }

    /// Recover the header belonging to a payload pointer handed back to us.
    ///
    /// # Safety
    /// `ptr` must be a payload pointer previously returned by this crate's
    /// allocation surface and not yet freed.
    pub(crate) unsafe fn from_payload(ptr: NonNull<u8>) -> NonNull<BlockHeader> {
        unsafe { NonNull::new_unchecked(ptr.as_ptr().sub(HEADER_SIZE) as *mut BlockHeader) }
    }
}
