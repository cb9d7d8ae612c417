// vim: tw=80
//! A host-managed zoned block device translation layer.
//!
//! Presents a zoned device, which must be written sequentially within most of
//! its zones, as a conventional device that may be written at any offset.

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

// Futures in this crate may nest deeply
#![recursion_limit="256"]

pub mod cache;
pub mod config;
pub mod metadata;
pub mod reclaim;
pub mod superblock;
pub mod target;
pub mod types;
pub mod util;
pub mod vdev;
pub mod vdev_mem;
pub mod zone;

pub use crate::types::*;
pub use crate::util::*;
