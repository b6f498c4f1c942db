/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! Size constants shared by the histogram, the block operators, and the
//! allocation surface.

/// Number of bins in the free-list histogram.
pub const N_BINS: usize = 128;

/// Width of a single histogram bin, in payload bytes.
pub const BIN_RANGE: usize = 1024;

/// Payloads at or above this size bypass the arena and are served from an
/// independent anonymous mapping instead of the chain/histogram.
pub const LARGE_THRESHOLD: usize = N_BINS * BIN_RANGE;

/// A split only happens if the leftover free payload would be at least this
/// many bytes, on top of the header it also needs.
pub const MIN_SPLIT_PAYLOAD: usize = 128;

/// Largest payload size any single request may ask for.
pub const MAX_SIZE: usize = 100_000_000;
