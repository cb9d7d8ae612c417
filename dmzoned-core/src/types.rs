// vim: tw=80
//! Common type definitions used throughout dmzoned

use divbuf::{DivBuf, DivBufMut};
use enum_primitive_derive::Primitive;
use num_traits::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use std::io;

/// Indexes a logical chunk of the translated device.  A chunk is exactly one
/// zone long.
pub type ChunkT = u32;

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so it
/// can have more than one owner.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// Indexes an LBA.  LBAs are always 4096 bytes
pub type LbaT = u64;

/// Indexes a metadata block within one metadata set.  Block 0 is the
/// superblock.
pub type MblkT = u64;

/// dmzoned's error type.  Each value is an errno, so it can be handed
/// straight back to the block layer.
#[derive(Clone, Copy, Debug, Deserialize, Error, Eq, PartialEq, Primitive, Serialize)]
pub enum Error {
    /// No metadata set could be found
    #[error("No such file or directory")]
    ENOENT          = libc::ENOENT as isize,
    #[error("Input/output error")]
    EIO             = libc::EIO as isize,
    /// The device's zone layout can't be used
    #[error("Device not configured")]
    ENXIO           = libc::ENXIO as isize,
    #[error("Invalid argument")]
    EINVAL          = libc::EINVAL as isize,
    /// The device has too many zones for the on-disk format
    #[error("File too large")]
    EFBIG           = libc::EFBIG as isize,
    /// No free zone, even after waiting for reclaim
    #[error("No space left on device")]
    ENOSPC          = libc::ENOSPC as isize,
    /// The target was opened read-only
    #[error("Read-only file system")]
    EROFS           = libc::EROFS as isize,
    /// The target is suspended
    #[error("Resource temporarily unavailable")]
    EAGAIN          = libc::EAGAIN as isize,
    /// The target has been shut down
    #[error("Can't send after socket shutdown")]
    ESHUTDOWN       = libc::ESHUTDOWN as isize,
    #[error("Operation not supported")]
    EOPNOTSUPP      = libc::EOPNOTSUPP as isize,

    //// dmzoned custom error types below
    #[error("Unknown error")]
    EUNKNOWN        = 256,
    /// On-disk metadata failed a checksum or is otherwise corrupt
    #[error("Integrity check failed")]
    EINTEGRITY      = 257,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        e.raw_os_error()
            .and_then(Error::from_i32)
            .unwrap_or(Error::EUNKNOWN)
    }
}

/// Only used when decoding on-disk structures, so any failure means corrupt
/// metadata.
impl From<bincode::Error> for Error {
    fn from(_e: bincode::Error) -> Self {
        Error::EINTEGRITY
    }
}

impl From<serde_yaml_ng::Error> for Error {
    fn from(_e: serde_yaml_ng::Error) -> Self {
        Error::EINVAL
    }
}

impl From<Error> for i32 {
    fn from(e: Error) -> Self {
        match e {
            Error::EUNKNOWN =>
                panic!("Unknown error codes should never be exposed"),
            Error::EINTEGRITY => libc::EIO,
            _ => e.to_i32().unwrap()
        }
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

/// Indexes a device's Zones.  A Zone is the smallest allocation unit that can
/// be independently erased.
pub type ZoneT = u32;

// LCOV_EXCL_STOP
