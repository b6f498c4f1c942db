/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! Internal error taxonomy for the OS collaborator boundary.
//!
//! The allocation surface never exposes these: callers only ever see a null
//! pointer on failure. This type exists so the plumbing between
//! [`crate::arena::ArenaSource`] and the allocation surface has something
//! more structured than a bare `Option` to propagate before it collapses to
//! `None` at the boundary.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum ArenaError {
    #[error("the OS refused to extend the program break")]
    BreakExhausted,
    #[error("the OS refused to create an anonymous mapping")]
    MapFailed,
}
