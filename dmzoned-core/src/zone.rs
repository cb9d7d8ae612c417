// vim: tw=80
//! The Zone Directory: static description of every zone on the device
//!
//! Zones are discovered from the device's zone report when the target is
//! opened.  Their start, type, and usage class never change afterwards, so the
//! directory is immutable and may be shared without locking.  The mutable part
//! of each zone's state (condition, write pointer, mapping) lives in
//! [`crate::metadata`] under the mapping lock.

use crate::{
    types::*,
    vdev::*
};
use tracing::{debug, warn};

/// Maximum number of zones to request in a single zone report
const REPORT_NR_ZONES: usize = 4096;

/// How the translation layer uses a zone.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZoneUse {
    /// Writable at any offset.  Used for metadata, small chunks, and
    /// buffer zones.
    Random,
    /// Writable only at the write pointer.
    Sequential,
}

/// Immutable description of one zone.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ZoneDesc {
    pub start: LbaT,
    pub zone_type: ZoneType,
    pub usage: ZoneUse,
    /// Holds one of the two metadata sets
    pub meta: bool,
}

impl ZoneDesc {
    pub fn is_rnd(&self) -> bool {
        self.usage == ZoneUse::Random
    }

    pub fn is_seq(&self) -> bool {
        self.usage == ZoneUse::Sequential
    }
}

/// Runtime state of a zone as most recently reported by the device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ZoneHealth {
    pub cond: ZoneCond,
    /// Write pointer, relative to the zone's start.  Always 0 for random
    /// zones.
    pub wp: LbaT,
}

/// Registry of all usable zones, indexed by id.
#[derive(Debug)]
pub struct ZoneDirectory {
    zones: Vec<ZoneDesc>,
    zone_nr_blocks: LbaT,
    nr_rnd: u32,
    nr_useable: u32,
    sb_zone: ZoneT,
}

impl ZoneDirectory {
    /// Fetch the complete zone report of a device
    pub async fn report_all(vdev: &dyn ZonedVdev) -> Result<Vec<ZoneReport>> {
        let capacity = vdev.size();
        let mut reports = Vec::new();
        let mut lba = 0;
        while lba < capacity {
            let r = vdev.report_zones(lba, REPORT_NR_ZONES).await?;
            let Some(last) = r.last() else {
                break;
            };
            lba = last.start + last.len;
            reports.extend(r);
        }
        if lba < capacity {
            warn!(lba, capacity, "Failed to get zone information");
            return Err(Error::ENXIO);
        }
        Ok(reports)
    }

    /// Build the directory from a complete zone report.
    ///
    /// Returns the directory and the initial health of every zone.
    pub fn from_reports(reports: &[ZoneReport], zone_nr_blocks: LbaT)
        -> Result<(Self, Vec<ZoneHealth>)>
    {
        let capacity = reports.last().map(|r| r.start + r.len).unwrap_or(0);
        let mut zones = Vec::with_capacity(reports.len());
        let mut health = Vec::with_capacity(reports.len());
        let mut nr_useable = 0;
        for r in reports {
            if r.len != zone_nr_blocks {
                if r.start + r.len == capacity {
                    debug!(start = r.start, len = r.len, "Ignoring runt zone");
                    continue;
                }
                return Err(Error::ENXIO);
            }
            if r.start != zones.len() as LbaT * zone_nr_blocks {
                return Err(Error::ENXIO);
            }
            let usage = match r.zone_type {
                ZoneType::Conventional => ZoneUse::Random,
                _ => ZoneUse::Sequential
            };
            zones.push(ZoneDesc {
                start: r.start,
                zone_type: r.zone_type,
                usage,
                meta: false
            });
            health.push(ZoneHealth {
                cond: r.cond,
                wp: r.wp.saturating_sub(r.start).min(zone_nr_blocks)
            });
            if r.cond == ZoneCond::Online {
                nr_useable += 1;
            }
        }

        // Conventional zones are always random.  On host-aware drives, also
        // use sequential-preferred zones as random zones until random zones
        // make up 1% of the drive.
        let nr_zones = zones.len() as u32;
        let mut nr_rnd = zones.iter().filter(|z| z.is_rnd()).count() as u32;
        let mut sb_zone = None;
        for (i, z) in zones.iter_mut().enumerate() {
            if z.zone_type == ZoneType::SeqPreferred && nr_rnd < nr_zones / 100
            {
                z.usage = ZoneUse::Random;
                nr_rnd += 1;
            }
            if z.is_rnd() {
                health[i].wp = 0;
                if sb_zone.is_none() {
                    sb_zone = Some(i as ZoneT);
                }
            }
        }
        let sb_zone = sb_zone.ok_or_else(|| {
            warn!("No random zone to hold metadata");
            Error::ENXIO
        })?;

        let dir = ZoneDirectory {
            zones,
            zone_nr_blocks,
            nr_rnd,
            nr_useable,
            sb_zone
        };
        Ok((dir, health))
    }

    /// Mark `nr` consecutive zones starting with the superblock zone as
    /// metadata zones.  They must all be random.
    pub fn set_meta_zones(&mut self, nr: u32) -> Result<()> {
        let first = self.sb_zone as usize;
        let end = first + nr as usize;
        if end > self.zones.len() {
            return Err(Error::ENXIO);
        }
        for z in &mut self.zones[first..end] {
            if !z.is_rnd() {
                warn!("Metadata zones are not consecutive random zones");
                return Err(Error::ENXIO);
            }
            z.meta = true;
        }
        Ok(())
    }

    pub fn get(&self, zone: ZoneT) -> &ZoneDesc {
        &self.zones[zone as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item=(ZoneT, &ZoneDesc)> {
        self.zones.iter().enumerate().map(|(i, z)| (i as ZoneT, z))
    }

    pub fn nr_zones(&self) -> u32 {
        self.zones.len() as u32
    }

    pub fn nr_rnd(&self) -> u32 {
        self.nr_rnd
    }

    /// Number of zones that are neither offline nor read-only
    pub fn nr_useable(&self) -> u32 {
        self.nr_useable
    }

    /// The first random zone, which holds the primary superblock.
    pub fn sb_zone(&self) -> ZoneT {
        self.sb_zone
    }

    pub fn zone_nr_blocks(&self) -> LbaT {
        self.zone_nr_blocks
    }

    /// First LBA of a zone
    pub fn zone_start(&self, zone: ZoneT) -> LbaT {
        self.zones[zone as usize].start
    }
}

// LCOV_EXCL_STOP
