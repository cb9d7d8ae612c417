// vim: tw=80
//! Persistent metadata of the translation layer
//!
//! `Metadata` owns everything that describes where chunks live: the Zone
//! Directory, the cached metadata blocks, the Chunk Map, the free zone lists,
//! and the validity bitmaps.  It also implements mounting, formatting, and the
//! flush that commits all of the above to disk.
//!
//! Zone life cycle:
//!
//! ```text
//!          alloc                  last block invalidated
//!  Free ---------> Data/Buffer ---------------------------> PendingFree
//!   ^                                                           |
//!   |             next successful flush, then reset             |
//!   +-----------------------------------------------------------+
//! ```
//!
//! A freed zone may still be referenced by the last committed metadata, so it
//! is neither reset nor reused until the next flush has committed its release.
//!
//! Locking:
//!
//! * The mapping lock (a `std::sync::Mutex<MapState>`) protects zone roles,
//!   write pointers, weights, the free lists, and the chunk mapping blocks.
//!   It is never held across an `.await`.
//! * The metadata lock (a `futures_locks::RwLock`) is held shared by
//!   foreground I/O and reclaim while they do device I/O and update bitmaps,
//!   and exclusively by flush.
//! * Each zone has an active count, for in-flight foreground requests, and an
//!   in-reclaim flag.  The two are mutually exclusive.

use crate::{
    cache::{LruList, MblockCache, MblockRef},
    config::{Config, FormatOptions},
    superblock::*,
    types::*,
    util::*,
    vdev::*,
    zone::*,
};
use divbuf::DivBufShared;
use futures::{
    TryStreamExt,
    stream::FuturesUnordered,
};
use serde_derive::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};
use tracing::{error, info, instrument, warn};

mod bitmap;
mod flush;
mod mapping;

pub use self::flush::Syncer;
pub use self::mapping::{ActiveZone, AllocKind};

/// What a zone is currently used for
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// Unmapped and ready for allocation, unless offline or read-only
    Free,
    /// Unmapped, but not reusable until the next flush commits that fact
    PendingFree,
    /// Holds part of a metadata set
    Meta,
    /// Primary storage for a chunk
    Data {
        chunk: ChunkT,
        bzone: Option<ZoneT>,
    },
    /// Absorbs unaligned writes for a sequential data zone
    Buffer {
        chunk: ChunkT,
        dzone: ZoneT,
    },
}

/// Mutable state of a zone, protected by the mapping lock
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ZoneState {
    pub cond: ZoneCond,
    /// Write pointer relative to the zone's start.  Only meaningful for
    /// sequential zones.
    pub wp: LbaT,
    /// Number of valid blocks
    pub weight: LbaT,
    pub role: Role,
    /// Number of in-flight foreground requests
    pub active: u32,
    /// Currently being garbage collected
    pub reclaim: bool,
}

/// Everything protected by the mapping lock
#[derive(Debug)]
struct MapState {
    zones: Vec<ZoneState>,
    unmap_rnd: VecDeque<ZoneT>,
    unmap_seq: VecDeque<ZoneT>,
    /// Sequential zones that only reclaim may use
    reserved_seq: VecDeque<ZoneT>,
    pending_free: Vec<ZoneT>,
    /// Mapped random zones (data and buffer), in LRU order
    map_rnd: LruList<ZoneT>,
    /// Mapped sequential zones, in LRU order
    map_seq: LruList<ZoneT>,
    /// Random zones available for data, excluding metadata zones
    nr_rnd: u32,
    /// Sequential zones available for data, excluding reserved zones
    nr_seq: u32,
}

/// Summary of the target's space usage
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Status {
    pub nr_zones: u32,
    pub nr_chunks: u32,
    pub nr_mapped_chunks: u32,
    pub nr_rnd: u32,
    pub nr_unmap_rnd: u32,
    pub nr_seq: u32,
    pub nr_unmap_seq: u32,
    /// Reserved sequential zones that are currently free
    pub nr_reserved_seq: u32,
    /// Zones waiting for the next flush before they can be reused
    pub nr_pending_free: u32,
    pub nr_dirty_blocks: u32,
    pub gen: u64,
}

/// The translation layer's metadata
pub struct Metadata {
    vdev: Arc<dyn ZonedVdev>,
    dir: ZoneDirectory,
    layout: Layout,
    cache: Arc<MblockCache>,
    /// The chunk mapping blocks, pinned for the lifetime of the target
    map_blocks: Vec<MblockRef>,
    /// The mapping lock
    map: Mutex<MapState>,
    /// The metadata lock
    mlock: futures_locks::RwLock<()>,
    /// Serializes foreground requests to each chunk
    chunk_locks: Vec<futures_locks::Mutex<()>>,
    /// Generation of the last committed metadata
    gen: AtomicU64,
    /// The metadata set that a flush writes first.  Normally set 1; set 0
    /// after a flush failed to update it.
    log_set: AtomicUsize,
    config: Config,
    /// Woken whenever zones become free
    free_wq: Notify,
    /// Woken whenever a zone finishes reclaim
    reclaim_wq: Notify,
    /// Asks the reclaim task to run
    reclaim_trigger: Arc<Notify>,
    shutdown: AtomicBool,
    epoch: Instant,
    /// Milliseconds since `epoch` of the latest foreground request
    last_io: AtomicU64,
}

/// Read one block from the device
async fn read_lba(vdev: &dyn ZonedVdev, lba: LbaT) -> Result<Vec<u8>> {
    let dbs = DivBufShared::from(vec![0u8; BYTES_PER_LBA]);
    vdev.read_at(dbs.try_mut().unwrap(), lba).await?;
    let block = Vec::from(&dbs.try_const().unwrap()[..]);
    Ok(block)
}

/// Write several blocks to the device concurrently
async fn write_lbas<I>(vdev: &dyn ZonedVdev, blocks: I) -> Result<()>
    where I: IntoIterator<Item=(LbaT, Vec<u8>)>
{
    let dbses = blocks.into_iter()
        .map(|(lba, data)| (lba, DivBufShared::from(data)))
        .collect::<Vec<_>>();
    dbses.iter()
        .map(|(lba, dbs)| vdev.write_at(dbs.try_const().unwrap(), *lba))
        .collect::<FuturesUnordered<_>>()
        .try_collect::<Vec<_>>()
        .await
        .map(drop)
}

/// Does this zone need a write pointer reset before it can be reused?
fn needs_reset(desc: &ZoneDesc, zs: &ZoneState) -> bool {
    match desc.zone_type {
        ZoneType::Conventional => false,
        _ if zs.cond != ZoneCond::Online => false,
        ZoneType::SeqRequired => zs.wp > 0,
        // Random use of a sequential-preferred zone moves its write pointer
        // without our knowledge.
        ZoneType::SeqPreferred => desc.is_rnd() || zs.wp > 0,
    }
}

impl Metadata {
    /// Create fresh metadata on a device, destroying any existing contents.
    #[instrument(skip(vdev))]
    pub async fn format(vdev: Arc<dyn ZonedVdev>, opts: &FormatOptions)
        -> Result<()>
    {
        let reports = ZoneDirectory::report_all(&*vdev).await?;
        let (mut dir, health) = ZoneDirectory::from_reports(&reports,
            vdev.lbas_per_zone())?;
        let layout = Layout::compute(&dir, opts.nr_reserved_seq)?;
        dir.set_meta_zones(2 * layout.nr_meta_zones)?;

        // Start with every data zone empty
        let resets = dir.iter()
            .filter(|(i, desc)| {
                let h = &health[*i as usize];
                let zs = ZoneState {
                    cond: h.cond,
                    wp: h.wp,
                    weight: 0,
                    role: Role::Free,
                    active: 0,
                    reclaim: false
                };
                !desc.meta && needs_reset(desc, &zs)
            }).map(|(_, desc)| vdev.reset_zone(desc.start))
            .collect::<FuturesUnordered<_>>();
        resets.try_collect::<Vec<_>>().await?;

        let unmapped = vec![0xFFu8; BYTES_PER_LBA];
        let clear = vec![0u8; BYTES_PER_LBA];
        for set in 0..SET_COUNT {
            let base = layout.set_base[set];
            let blocks = (1..layout.nr_meta_blocks).map(|b| {
                let data = if b <= MblkT::from(layout.nr_map_blocks) {
                    unmapped.clone()
                } else {
                    clear.clone()
                };
                (base + b, data)
            });
            write_lbas(&*vdev, blocks).await?;
            let sb = layout.superblock(set, 0).to_block()?;
            write_lbas(&*vdev, [(base, sb)]).await?;
        }
        vdev.sync_all().await?;
        info!(nr_chunks = layout.nr_chunks,
              nr_meta_zones = layout.nr_meta_zones,
              nr_reserved_seq = layout.nr_reserved_seq,
              "Formatted device");
        Ok(())
    }

    /// Read and validate the superblock at `lba`.
    async fn read_sb(vdev: &dyn ZonedVdev, dir: &ZoneDirectory, lba: LbaT)
        -> Result<(Superblock, Layout)>
    {
        let block = read_lba(vdev, lba).await?;
        let sb = Superblock::from_block(&block)?;
        if sb.sb_block != lba {
            warn!(lba, sb_block = sb.sb_block, "Misplaced superblock");
            return Err(Error::EINVAL);
        }
        let layout = Layout::from_superblock(&sb, dir)?;
        Ok((sb, layout))
    }

    /// Find the secondary superblock without help from the primary: it's at
    /// the start of the first zone after the superblock zone that has the
    /// magic.
    async fn lookup_secondary_sb(vdev: &dyn ZonedVdev, dir: &ZoneDirectory)
        -> Result<LbaT>
    {
        for zone in (dir.sb_zone() + 1)..dir.nr_zones() {
            let desc = dir.get(zone);
            if !desc.is_rnd() {
                break;
            }
            let block = read_lba(vdev, desc.start).await?;
            if Superblock::has_magic(&block) {
                return Ok(desc.start);
            }
        }
        Err(Error::ENOENT)
    }

    /// Copy a whole metadata set over the other one.
    async fn recover_set(vdev: &dyn ZonedVdev, layout: &Layout, from: usize,
                         gen: u64) -> Result<()>
    {
        let to = 1 - from;
        warn!(from, to, gen, "Rebuilding metadata set");
        for b in 1..layout.nr_meta_blocks {
            let block = read_lba(vdev, layout.set_base[from] + b).await?;
            write_lbas(vdev, [(layout.set_base[to] + b, block)]).await?;
        }
        vdev.sync_all().await?;
        let sb = layout.superblock(to, gen).to_block()?;
        write_lbas(vdev, [(layout.set_base[to], sb)]).await?;
        vdev.sync_all().await
    }

    /// Open the metadata of a formatted device, recovering from an
    /// interrupted flush if necessary.
    #[instrument(skip(vdev, config))]
    pub async fn open(vdev: Arc<dyn ZonedVdev>, config: &Config)
        -> Result<Self>
    {
        let reports = ZoneDirectory::report_all(&*vdev).await?;
        let (mut dir, health) = ZoneDirectory::from_reports(&reports,
            vdev.lbas_per_zone())?;

        // Load both superblocks and pick the newest valid one.
        let base0 = dir.zone_start(dir.sb_zone());
        let sb0 = Self::read_sb(&*vdev, &dir, base0).await;
        let base1 = match &sb0 {
            Ok((_, layout)) => Ok(layout.set_base[1]),
            Err(_) => Self::lookup_secondary_sb(&*vdev, &dir).await
        };
        let sb1 = match base1 {
            Ok(lba) => Self::read_sb(&*vdev, &dir, lba).await,
            Err(e) => Err(e)
        };
        let (primary, sb, layout) = match (sb0, sb1) {
            (Ok((s0, _)), Ok((s1, l1))) if s1.gen > s0.gen => (1, s1, l1),
            (Ok((s0, l0)), _) => (0, s0, l0),
            (Err(e), Ok((s1, l1))) => {
                warn!(error = ?e, "Primary superblock is invalid");
                if l1.set_base[1] != s1.sb_block {
                    return Err(Error::ENXIO);
                }
                (1, s1, l1)
            }
            (Err(e), Err(e1)) => {
                error!(error = ?e, secondary_error = ?e1,
                       "No valid superblock found");
                return Err(e);
            }
        };
        dir.set_meta_zones(2 * layout.nr_meta_zones)?;
        info!(set = primary, gen = sb.gen, "Using superblock");

        // Make both sets identical.  The other set may contain a partial log
        // from an interrupted flush, so it is always rebuilt.
        let cache_base = if config.read_only {
            layout.set_base[primary]
        } else {
            Self::recover_set(&*vdev, &layout, primary, sb.gen).await?;
            layout.set_base[0]
        };

        let cache = Arc::new(MblockCache::new(vdev.clone(), cache_base,
            layout.nr_meta_blocks, layout.cache_max()));
        let mut map_blocks = Vec::with_capacity(layout.nr_map_blocks as usize);
        for b in 0..layout.nr_map_blocks {
            map_blocks.push(cache.get(1 + MblkT::from(b)).await?);
        }

        let zones = dir.iter().map(|(i, desc)| {
            let h = health[i as usize];
            ZoneState {
                cond: h.cond,
                wp: if desc.is_seq() { h.wp } else { 0 },
                weight: 0,
                role: if desc.meta { Role::Meta } else { Role::Free },
                active: 0,
                reclaim: false
            }
        }).collect::<Vec<_>>();
        let ms = MapState {
            zones,
            unmap_rnd: VecDeque::new(),
            unmap_seq: VecDeque::new(),
            reserved_seq: VecDeque::new(),
            pending_free: Vec::new(),
            map_rnd: LruList::default(),
            map_seq: LruList::default(),
            nr_rnd: 0,
            nr_seq: 0,
        };
        let chunk_locks = (0..layout.nr_chunks)
            .map(|_| futures_locks::Mutex::new(()))
            .collect();
        let md = Metadata {
            vdev,
            dir,
            layout,
            cache,
            map_blocks,
            map: Mutex::new(ms),
            mlock: futures_locks::RwLock::new(()),
            chunk_locks,
            gen: AtomicU64::new(sb.gen),
            log_set: AtomicUsize::new(1),
            config: config.clone(),
            free_wq: Notify::new(),
            reclaim_wq: Notify::new(),
            reclaim_trigger: Arc::new(Notify::new()),
            shutdown: AtomicBool::new(false),
            epoch: Instant::now(),
            last_io: AtomicU64::new(0),
        };
        md.load_mapping()?;
        md.load_weights().await?;
        md.init_free_zones().await?;
        let status = md.status();
        info!(nr_zones = status.nr_zones, nr_chunks = status.nr_chunks,
              mapped = status.nr_mapped_chunks, free_rnd = status.nr_unmap_rnd,
              free_seq = status.nr_unmap_seq, "Opened metadata");
        Ok(md)
    }

    /// Read the Chunk Map and set up the roles of all mapped zones.
    fn load_mapping(&self) -> Result<()> {
        let mut guard = self.map.lock().unwrap();
        let ms = &mut *guard;
        for chunk in 0..self.layout.nr_chunks {
            let (dz, bz) = self.map_entry(chunk);
            let Some(dzone) = dz else {
                if bz.is_some() {
                    error!(chunk, "Buffer zone without data zone");
                    return Err(Error::EINTEGRITY);
                }
                continue;
            };
            self.check_mappable(ms, chunk, dzone)?;
            ms.zones[dzone as usize].role = Role::Data { chunk, bzone: bz };
            if self.dir.get(dzone).is_rnd() {
                ms.map_rnd.push_mru(dzone);
            } else {
                ms.map_seq.push_mru(dzone);
            }
            if let Some(bzone) = bz {
                self.check_mappable(ms, chunk, bzone)?;
                if !self.dir.get(bzone).is_rnd() {
                    error!(chunk, bzone, "Sequential buffer zone");
                    return Err(Error::EINTEGRITY);
                }
                ms.zones[bzone as usize].role = Role::Buffer { chunk, dzone };
                ms.map_rnd.push_mru(bzone);
            }
        }
        Ok(())
    }

    fn check_mappable(&self, ms: &MapState, chunk: ChunkT, zone: ZoneT)
        -> Result<()>
    {
        if zone >= self.dir.nr_zones() ||
            ms.zones[zone as usize].role != Role::Free
        {
            error!(chunk, zone, "Invalid chunk mapping");
            return Err(Error::EINTEGRITY);
        }
        Ok(())
    }

    /// Compute every zone's weight from its bitmap, and reconcile bitmaps
    /// with the device's write pointers.
    async fn load_weights(&self) -> Result<()> {
        let nr_blocks = self.layout.zone_nr_blocks;
        for (zone, desc) in self.dir.iter() {
            if desc.meta {
                continue;
            }
            let weight = self.count_valid(zone).await?;
            let zs = self.zone_state(zone);
            self.map.lock().unwrap().zones[zone as usize].weight = weight;
            if zs.role == Role::Free && weight > 0 {
                warn!(zone, weight, "Unmapped zone has valid blocks");
                if !self.config.read_only {
                    self.invalidate_blocks(zone, 0, nr_blocks).await?;
                }
            } else if desc.is_seq() && zs.wp < nr_blocks && weight > 0 &&
                !self.config.read_only
            {
                // Nothing can be valid past the write pointer
                let n = self.invalidate_blocks(zone, zs.wp, nr_blocks - zs.wp)
                    .await?;
                if n > 0 {
                    warn!(zone, wp = zs.wp, invalidated = n,
                          "Valid blocks past the write pointer");
                }
            }
        }
        Ok(())
    }

    /// Put every unmapped zone on the appropriate free list, resetting it
    /// first if needed.
    async fn init_free_zones(&self) -> Result<()> {
        for (zone, desc) in self.dir.iter() {
            if desc.meta {
                continue;
            }
            let zs = self.zone_state(zone);
            if zs.cond != ZoneCond::Online {
                continue;
            }
            {
                let mut ms = self.map.lock().unwrap();
                if desc.is_rnd() {
                    ms.nr_rnd += 1;
                } else {
                    ms.nr_seq += 1;
                }
            }
            if zs.role != Role::Free {
                continue;
            }
            if needs_reset(desc, &zs) && !self.config.read_only {
                self.vdev.reset_zone(desc.start).await?;
            }
            let mut ms = self.map.lock().unwrap();
            ms.zones[zone as usize].wp = 0;
            self.push_free(&mut ms, zone);
        }
        Ok(())
    }

    /// Compare write pointers with the device, as after a resume.
    ///
    /// Blocks past a zone's real write pointer can't be valid, so they are
    /// invalidated.  Zones left empty are freed.
    #[instrument(skip(self))]
    pub async fn check_zones(&self) -> Result<()> {
        let reports = ZoneDirectory::report_all(&*self.vdev).await?;
        let nr_blocks = self.layout.zone_nr_blocks;
        let _guard = self.mlock.write().await;
        for (zone, desc) in self.dir.iter() {
            let Some(r) = reports.get(zone as usize) else {
                error!(zone, "Zone missing from report");
                return Err(Error::EIO);
            };
            let old = {
                let mut ms = self.map.lock().unwrap();
                let zs = &mut ms.zones[zone as usize];
                let old = *zs;
                zs.cond = r.cond;
                if desc.is_seq() {
                    zs.wp = (r.wp - r.start).min(nr_blocks);
                }
                old
            };
            if desc.meta {
                continue;
            }
            if old.role == Role::Free {
                let mut ms = self.map.lock().unwrap();
                if r.cond != ZoneCond::Online {
                    warn!(zone, cond = %r.cond, "Free zone is unusable");
                    Self::unlist_free(&mut ms, zone);
                } else if desc.is_seq() && ms.zones[zone as usize].wp > 0 {
                    // It must be reset before it can be allocated
                    Self::unlist_free(&mut ms, zone);
                    ms.zones[zone as usize].role = Role::PendingFree;
                    ms.pending_free.push(zone);
                }
                continue;
            }
            if r.cond == ZoneCond::Offline {
                warn!(zone, "Zone is offline");
                continue;
            }
            if !desc.is_seq() {
                continue;
            }
            let wp = (r.wp - r.start).min(nr_blocks);
            if wp != old.wp {
                warn!(zone, wp, expected = old.wp, "Invalid write pointer");
                let from = wp.min(old.wp);
                self.invalidate_blocks(zone, from, nr_blocks - from).await?;
                let mut ms = self.map.lock().unwrap();
                if ms.zones[zone as usize].active == 0 {
                    self.validate_zone(&mut ms, zone);
                }
            }
        }
        Ok(())
    }

    /// Stop waiting for free zones and for reclaim.  Waiters will get
    /// `ESHUTDOWN`.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.free_wq.notify_waiters();
        self.reclaim_wq.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Serialize foreground requests to one chunk.
    pub async fn lock_chunk(&self, chunk: ChunkT)
        -> futures_locks::MutexGuard<()>
    {
        self.chunk_locks[chunk as usize].lock().await
    }

    /// Acquire the metadata lock in shared mode, for device I/O and bitmap
    /// updates.
    pub async fn io_guard(&self) -> futures_locks::RwLockReadGuard<()> {
        self.mlock.read().await
    }

    /// Record foreground activity, for idle detection.
    pub fn mark_io(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_io.store(now, Ordering::Relaxed);
    }

    /// Has there been no foreground I/O for a whole idle period?
    pub fn is_idle(&self) -> bool {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_io.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last)) >=
            self.config.idle_period()
    }

    /// Percentage of data-capable random zones that are free
    pub fn unmap_rnd_percent(&self) -> u32 {
        self.map.lock().unwrap().unmap_rnd_percent()
    }

    /// Should the reclaim engine run now?
    pub fn should_reclaim(&self, idle: bool) -> bool {
        let threshold = if idle {
            self.config.reclaim_idle_low
        } else {
            self.config.reclaim_low
        };
        self.unmap_rnd_percent() <= threshold
    }

    /// A `Notify` that fires whenever the reclaim engine should run
    pub fn reclaim_trigger(&self) -> Arc<Notify> {
        self.reclaim_trigger.clone()
    }

    /// A `Notify` that fires whenever the metadata cache needs a flush
    pub fn flush_trigger(&self) -> Arc<Notify> {
        self.cache.pressure()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dir(&self) -> &ZoneDirectory {
        &self.dir
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn vdev(&self) -> &Arc<dyn ZonedVdev> {
        &self.vdev
    }

    /// Generation of the last committed metadata
    pub fn gen(&self) -> u64 {
        self.gen.load(Ordering::Relaxed)
    }

    /// LBA of a block within a zone
    pub fn zone_lba(&self, zone: ZoneT, block: LbaT) -> LbaT {
        self.dir.zone_start(zone) + block
    }

    /// Snapshot of a zone's mutable state
    pub fn zone_state(&self, zone: ZoneT) -> ZoneState {
        self.map.lock().unwrap().zones[zone as usize]
    }

    pub fn status(&self) -> Status {
        let ms = self.map.lock().unwrap();
        let nr_mapped_chunks = ms.zones.iter()
            .filter(|zs| matches!(zs.role, Role::Data{..}))
            .count() as u32;
        Status {
            nr_zones: self.dir.nr_zones(),
            nr_chunks: self.layout.nr_chunks,
            nr_mapped_chunks,
            nr_rnd: ms.nr_rnd,
            nr_unmap_rnd: ms.unmap_rnd.len() as u32,
            nr_seq: ms.nr_seq,
            nr_unmap_seq: ms.unmap_seq.len() as u32,
            nr_reserved_seq: ms.reserved_seq.len() as u32,
            nr_pending_free: ms.pending_free.len() as u32,
            nr_dirty_blocks: self.cache.nr_dirty() as u32,
            gen: self.gen(),
        }
    }
}

// LCOV_EXCL_STOP
