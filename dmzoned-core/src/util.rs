// vim: tw=80
//! Common utility functions used throughout dmzoned

use crate::types::*;
use divbuf::DivBufShared;
use lazy_static::lazy_static;
use std::ops::{Add, Div, Sub};

/// LBAs always use 4K LBAs, even if the underlying device supports smaller.
pub const BYTES_PER_LBA: usize = 4096;

/// Number of bits in one LBA, as used by the on-disk validity bitmaps.
pub const BITS_PER_LBA: u64 = 8 * BYTES_PER_LBA as u64;

/// Length of the global read-only `ZERO_REGION`
pub const ZERO_REGION_LEN: usize = 8 * BYTES_PER_LBA;

lazy_static! {
    /// A read-only buffer of zeros, useful for padding.
    ///
    /// The length is pretty arbitrary.  Code should be able to cope with a
    /// smaller-than-desired `ZERO_REGION`.
    pub static ref ZERO_REGION: DivBufShared =
        DivBufShared::from(vec![0u8; ZERO_REGION_LEN]);
}

/// Divide two unsigned numbers (usually integers), rounding up.
pub fn div_roundup<T>(dividend: T, divisor: T) -> T
    where T: Add<Output=T> + Copy + Div<Output=T> + From<u8> + Sub<Output=T>
{
    (dividend + divisor - T::from(1u8)) / divisor
}

/// Create an SGList full of zeros, with the requested total length
pub fn zero_sglist(len: usize) -> Vec<IoVec> {
    let zero_region_len = ZERO_REGION.len();
    let zero_bufs = div_roundup(len, zero_region_len);
    let mut sglist = Vec::with_capacity(zero_bufs);
    let mut remaining = len;
    while remaining > 0 {
        let l = remaining.min(zero_region_len);
        sglist.push(ZERO_REGION.try_const().unwrap().slice_to(l));
        remaining -= l;
    }
    sglist
}

// LCOV_EXCL_STOP
