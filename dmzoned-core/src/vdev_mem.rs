// vim: tw=80
//! A zoned block device emulated in memory
//!
//! `VdevMem` follows the write rules of real zoned devices closely enough to
//! exercise the translation layer: sequential-required zones only accept
//! writes at their write pointer, resets discard data, and offline zones fail
//! all I/O.  It can also inject faults and take crash-consistent snapshots.

use crate::{
    types::*,
    util::*,
    vdev::*
};
use futures::future;
use std::{
    ops::Range,
    sync::{Arc, Mutex},
};

#[derive(Clone, Debug)]
struct MemZone {
    start: LbaT,
    len: LbaT,
    zone_type: ZoneType,
    cond: ZoneCond,
    /// Absolute write pointer
    wp: LbaT,
}

impl MemZone {
    fn report(&self) -> ZoneReport {
        ZoneReport {
            start: self.start,
            len: self.len,
            wp: self.wp,
            zone_type: self.zone_type,
            cond: self.cond
        }
    }
}

#[derive(Clone, Debug, Default)]
struct Inner {
    data: Vec<u8>,
    zones: Vec<MemZone>,
    read_faults: Vec<Range<LbaT>>,
    write_faults: Vec<Range<LbaT>>,
    resets: u64,
    syncs: u64,
}

impl Inner {
    fn zone_of(&self, lba: LbaT, lbas_per_zone: LbaT) -> Option<usize> {
        let z = (lba / lbas_per_zone) as usize;
        self.zones.get(z)
            .filter(|mz| lba < mz.start + mz.len)
            .map(|_| z)
    }

    /// Validate an I/O range, returning the index of the single zone it lies
    /// in.
    fn check_range(&self, lba: LbaT, len: usize, lbas_per_zone: LbaT)
        -> Result<usize>
    {
        if len % BYTES_PER_LBA != 0 || len == 0 {
            return Err(Error::EINVAL);
        }
        let nlbas = (len / BYTES_PER_LBA) as LbaT;
        let z = self.zone_of(lba, lbas_per_zone).ok_or(Error::EINVAL)?;
        let mz = &self.zones[z];
        if lba + nlbas > mz.start + mz.len {
            // I/O may not cross zone boundaries
            return Err(Error::EINVAL);
        }
        if mz.cond == ZoneCond::Offline {
            return Err(Error::EIO);
        }
        Ok(z)
    }

    fn faulted(faults: &[Range<LbaT>], lba: LbaT, nlbas: LbaT) -> bool {
        faults.iter().any(|r| r.start < lba + nlbas && lba < r.end)
    }
}

/// In-memory zoned block device.
///
/// Clones share the same storage, like multiple handles to one disk.
#[derive(Clone, Debug)]
pub struct VdevMem {
    inner: Arc<Mutex<Inner>>,
    lbas_per_zone: LbaT,
    size: LbaT,
}

impl VdevMem {
    /// Create a device with one zone of type `zone_types[i]` per entry, each
    /// `lbas_per_zone` long.
    pub fn new(zone_types: &[ZoneType], lbas_per_zone: LbaT) -> Self {
        Self::with_runt(zone_types, lbas_per_zone, 0)
    }

    /// Like [`VdevMem::new`], but append a trailing sequential zone of only
    /// `runt` LBAs, as some drives have.  A `runt` of 0 adds nothing.
    pub fn with_runt(zone_types: &[ZoneType], lbas_per_zone: LbaT, runt: LbaT)
        -> Self
    {
        assert!(runt < lbas_per_zone);
        let mut zones = zone_types.iter()
            .enumerate()
            .map(|(i, zt)| {
                let start = i as LbaT * lbas_per_zone;
                MemZone {
                    start,
                    len: lbas_per_zone,
                    zone_type: *zt,
                    cond: ZoneCond::Online,
                    wp: start
                }
            }).collect::<Vec<_>>();
        if runt > 0 {
            let start = zones.len() as LbaT * lbas_per_zone;
            zones.push(MemZone {
                start,
                len: runt,
                zone_type: ZoneType::SeqRequired,
                cond: ZoneCond::Online,
                wp: start
            });
        }
        let size = zones.iter().map(|mz| mz.len).sum::<LbaT>();
        let inner = Inner {
            data: vec![0u8; size as usize * BYTES_PER_LBA],
            zones,
            ..Default::default()
        };
        VdevMem {
            inner: Arc::new(Mutex::new(inner)),
            lbas_per_zone,
            size
        }
    }

    /// Make every read touching `lbas` fail with `EIO`.
    pub fn fail_reads(&self, lbas: Range<LbaT>) {
        self.inner.lock().unwrap().read_faults.push(lbas);
    }

    /// Make every write touching `lbas` fail with `EIO`.
    pub fn fail_writes(&self, lbas: Range<LbaT>) {
        self.inner.lock().unwrap().write_faults.push(lbas);
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.read_faults.clear();
        inner.write_faults.clear();
    }

    /// Change the reported condition of a zone
    pub fn set_zone_cond(&self, zone: ZoneT, cond: ZoneCond) {
        self.inner.lock().unwrap().zones[zone as usize].cond = cond;
    }

    /// Move a zone's write pointer to `offset` LBAs from its start, as if
    /// writes had been lost or performed behind the translation layer's back.
    pub fn set_write_pointer(&self, zone: ZoneT, offset: LbaT) {
        let mut inner = self.inner.lock().unwrap();
        let mz = &mut inner.zones[zone as usize];
        assert!(offset <= mz.len);
        mz.wp = mz.start + offset;
    }

    /// Write pointer of a zone, relative to its start
    pub fn write_pointer(&self, zone: ZoneT) -> LbaT {
        let inner = self.inner.lock().unwrap();
        let mz = &inner.zones[zone as usize];
        mz.wp - mz.start
    }

    /// Copy raw data out of the device, bypassing all checks.
    pub fn peek(&self, lba: LbaT, nlbas: LbaT) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let start = lba as usize * BYTES_PER_LBA;
        let end = start + nlbas as usize * BYTES_PER_LBA;
        inner.data[start..end].to_vec()
    }

    /// Overwrite raw data, bypassing all checks.  Useful for simulating
    /// corruption.
    pub fn poke(&self, lba: LbaT, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let start = lba as usize * BYTES_PER_LBA;
        inner.data[start..start + data.len()].copy_from_slice(data);
    }

    /// Number of zone resets performed so far
    pub fn resets(&self) -> u64 {
        self.inner.lock().unwrap().resets
    }

    /// Number of cache flushes performed so far
    pub fn syncs(&self) -> u64 {
        self.inner.lock().unwrap().syncs
    }

    /// Take an independent copy of the device's current contents.
    ///
    /// Since every write completes synchronously, the snapshot is exactly
    /// what a power loss at this instant would leave on stable storage.
    pub fn snapshot(&self) -> Self {
        let inner = self.inner.lock().unwrap().clone();
        VdevMem {
            inner: Arc::new(Mutex::new(inner)),
            lbas_per_zone: self.lbas_per_zone,
            size: self.size
        }
    }

    fn do_read(&self, mut buf: IoVecMut, lba: LbaT) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        inner.check_range(lba, buf.len(), self.lbas_per_zone)?;
        let nlbas = (buf.len() / BYTES_PER_LBA) as LbaT;
        if Inner::faulted(&inner.read_faults, lba, nlbas) {
            return Err(Error::EIO);
        }
        let start = lba as usize * BYTES_PER_LBA;
        let len = buf.len();
        buf[..].copy_from_slice(&inner.data[start..start + len]);
        Ok(())
    }

    fn do_write(&self, buf: IoVec, lba: LbaT) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let z = inner.check_range(lba, buf.len(), self.lbas_per_zone)?;
        let nlbas = (buf.len() / BYTES_PER_LBA) as LbaT;
        if Inner::faulted(&inner.write_faults, lba, nlbas) {
            return Err(Error::EIO);
        }
        let mz = &mut inner.zones[z];
        if mz.cond == ZoneCond::ReadOnly {
            return Err(Error::EIO);
        }
        match mz.zone_type {
            ZoneType::SeqRequired if lba != mz.wp => {
                return Err(Error::EIO);
            }
            ZoneType::SeqRequired | ZoneType::SeqPreferred => {
                mz.wp = mz.wp.max(lba + nlbas);
            }
            ZoneType::Conventional => ()
        }
        let start = lba as usize * BYTES_PER_LBA;
        inner.data[start..start + buf.len()].copy_from_slice(&buf[..]);
        Ok(())
    }

    fn do_reset(&self, start: LbaT) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let z = inner.zone_of(start, self.lbas_per_zone)
            .filter(|z| inner.zones[*z].start == start)
            .ok_or(Error::EINVAL)?;
        let mz = inner.zones[z].clone();
        match (mz.zone_type, mz.cond) {
            (ZoneType::Conventional, _) => return Err(Error::EOPNOTSUPP),
            (_, ZoneCond::Online) => (),
            _ => return Err(Error::EIO)
        }
        let s = mz.start as usize * BYTES_PER_LBA;
        let e = s + mz.len as usize * BYTES_PER_LBA;
        inner.data[s..e].fill(0);
        inner.zones[z].wp = mz.start;
        inner.resets += 1;
        Ok(())
    }
}

impl ZonedVdev for VdevMem {
    fn report_zones(&self, start: LbaT, max: usize) -> BoxReportFut {
        let inner = self.inner.lock().unwrap();
        let r = match inner.zone_of(start, self.lbas_per_zone) {
            Some(z) => inner.zones[z..].iter()
                .take(max)
                .map(MemZone::report)
                .collect(),
            None => Vec::new()
        };
        Box::pin(future::ok(r))
    }

    fn reset_zone(&self, start: LbaT) -> BoxVdevFut {
        Box::pin(future::ready(self.do_reset(start)))
    }

    fn read_at(&self, buf: IoVecMut, lba: LbaT) -> BoxVdevFut {
        Box::pin(future::ready(self.do_read(buf, lba)))
    }

    fn write_at(&self, buf: IoVec, lba: LbaT) -> BoxVdevFut {
        Box::pin(future::ready(self.do_write(buf, lba)))
    }

    fn sync_all(&self) -> BoxVdevFut {
        self.inner.lock().unwrap().syncs += 1;
        Box::pin(future::ok(()))
    }

    fn size(&self) -> LbaT {
        self.size
    }

    fn lbas_per_zone(&self) -> LbaT {
        self.lbas_per_zone
    }
}

// LCOV_EXCL_STOP
