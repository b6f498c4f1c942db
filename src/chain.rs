/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! The block chain (§2 layer 2): a doubly linked, address-ordered list of
//! every block currently carved out of the contiguous arena. The
//! highest-address block is always the wilderness; it is the only block
//! that can ever be extended by growing the program break.

use crate::header::BlockHeader;
use std::ptr::NonNull;

pub(crate) struct Chain {
    pub(crate) head: Option<NonNull<BlockHeader>>,
    pub(crate) wilderness: Option<NonNull<BlockHeader>>,
}

impl Chain {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            wilderness: None,
        }
    }

    pub(crate) fn is_wilderness(&self, block: NonNull<BlockHeader>) -> bool {
        self.wilderness == Some(block)
    }

    /// Install the very first block the arena has ever held.
    pub(crate) unsafe fn install_first(&mut self, block: NonNull<BlockHeader>) {
        unsafe {
            (*block.as_ptr()).chain_prev = None;
            (*block.as_ptr()).chain_next = None;
        }
        self.head = Some(block);
        self.wilderness = Some(block);
    }

    /// Append a freshly grown block directly after the current wilderness,
    /// which makes `block` the new wilderness.
    pub(crate) unsafe fn append_after_wilderness(&mut self, block: NonNull<BlockHeader>) {
        let old_wilderness = self
            .wilderness
            .expect("append requires an existing wilderness");
        unsafe {
            (*old_wilderness.as_ptr()).chain_next = Some(block);
            (*block.as_ptr()).chain_prev = Some(old_wilderness);
            (*block.as_ptr()).chain_next = None;
        }
        self.wilderness = Some(block);
    }

    /// Splice `fresh` into the chain immediately after `after`, adopting
    /// whatever followed `after` beforehand. If `after` was the wilderness,
    /// `fresh` becomes the new wilderness.
    pub(crate) unsafe fn insert_after(&mut self, after: NonNull<BlockHeader>, fresh: NonNull<BlockHeader>) {
        unsafe {
            let next = (*after.as_ptr()).chain_next;
            (*fresh.as_ptr()).chain_prev = Some(after);
            (*fresh.as_ptr()).chain_next = next;
            (*after.as_ptr()).chain_next = Some(fresh);
            match next {
                Some(n) => (*n.as_ptr()).chain_prev = Some(fresh),
                None => self.wilderness = Some(fresh),
            }
        }
    }

    /// Splice `block` out of the chain, e.g. when a coalesce swallows it.
    /// Updates `head`/`wilderness` automatically if `block` was either.
    pub(crate) unsafe fn unlink(&mut self, block: NonNull<BlockHeader>) {
        unsafe {
            let prev = (*block.as_ptr()).chain_prev;
            let next = (*block.as_ptr()).chain_next;
            match prev {
                Some(p) => (*p.as_ptr()).chain_next = next,
                None => self.head = next,
            }
            match next {
                Some(n) => (*n.as_ptr()).chain_prev = prev,
                None => self.wilderness = prev,
            }
        }
    }
}
