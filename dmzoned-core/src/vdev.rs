// vim: tw=80
//! Interface to the zoned block device underneath the translation layer

use std::{fmt, pin::Pin};
use serde_derive::{Deserialize, Serialize};
#[cfg(test)] use mockall::automock;
use crate::types::*;

/// Future representing an operation on a vdev.
pub type VdevFut = dyn futures::Future<Output = Result<()>> + Send + Sync;

/// Boxed `VdevFut`
pub type BoxVdevFut = Pin<Box<VdevFut>>;

/// Boxed future returned by [`ZonedVdev::report_zones`]
pub type BoxReportFut =
    Pin<Box<dyn futures::Future<Output = Result<Vec<ZoneReport>>> + Send + Sync>>;

/// Write rules of a zone, as reported by the device.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ZoneType {
    /// Accepts writes at any offset
    Conventional,
    /// Host-managed: writes must land exactly on the write pointer
    SeqRequired,
    /// Host-aware: sequential writes are preferred, but random writes work
    SeqPreferred,
}

/// Health of a single zone, as reported by the device.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ZoneCond {
    Online,
    /// Readable but not writable.  Never reset.
    ReadOnly,
    /// Neither readable nor writable
    Offline,
}

impl fmt::Display for ZoneCond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Online => "Online".fmt(f),
            Self::ReadOnly => "ReadOnly".fmt(f),
            Self::Offline => "Offline".fmt(f),
        }
    }
}

/// One entry of a device zone report.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ZoneReport {
    /// First LBA of the zone
    pub start: LbaT,
    /// Length of the zone in LBAs
    pub len: LbaT,
    /// Absolute LBA of the write pointer.  Meaningless for conventional
    /// zones.
    pub wp: LbaT,
    pub zone_type: ZoneType,
    pub cond: ZoneCond,
}

/// A zoned block device.
///
/// All addresses are in 4 KiB LBAs.  Each operation either succeeds or fails
/// as a whole for the blocks submitted.
#[cfg_attr(test, automock)]
pub trait ZonedVdev: Send + Sync {
    /// Report at most `max` zones, beginning with the zone that contains
    /// `start`.
    ///
    /// An empty report means that `start` is beyond the end of the device.
    fn report_zones(&self, start: LbaT, max: usize) -> BoxReportFut;

    /// Reset the write pointer of the zone that starts at `start`, discarding
    /// all of its contents.
    fn reset_zone(&self, start: LbaT) -> BoxVdevFut;

    /// Asynchronously read a contiguous portion of the device.
    ///
    /// The buffer's length must be a multiple of the LBA size.
    fn read_at(&self, buf: IoVecMut, lba: LbaT) -> BoxVdevFut;

    /// Asynchronously write a contiguous portion of the device.
    ///
    /// In a sequential-required zone, `lba` must equal the zone's write
    /// pointer.
    fn write_at(&self, buf: IoVec, lba: LbaT) -> BoxVdevFut;

    /// Sync the device, ensuring that all data written so far reaches stable
    /// storage.
    fn sync_all(&self) -> BoxVdevFut;

    /// Usable size of the device in LBAs.
    fn size(&self) -> LbaT;

    /// Nominal size of each zone in LBAs.  The last zone may be smaller.
    fn lbas_per_zone(&self) -> LbaT;
}
