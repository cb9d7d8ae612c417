// vim: tw=80
//! Chunk Map and Zone Allocator

use byteorder::{ByteOrder, LittleEndian};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};
use super::*;

/// Which free list to allocate from
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AllocKind {
    /// A random zone, for new chunks and for buffers
    Rnd,
    /// A sequential zone for foreground use
    Seq,
    /// A sequential zone for reclaim, which may dip into the reserve once
    /// the others are exhausted
    Reclaim,
}

/// A chunk's data zone, pinned against reclaim for as long as this lives
pub struct ActiveZone<'a> {
    md: &'a Metadata,
    zone: ZoneT,
}

impl ActiveZone<'_> {
    pub fn zone(&self) -> ZoneT {
        self.zone
    }

    /// Current state of the data zone
    pub fn state(&self) -> ZoneState {
        self.md.zone_state(self.zone)
    }

    /// The chunk's buffer zone, if it has one
    pub fn bzone(&self) -> Option<ZoneT> {
        match self.state().role {
            Role::Data{bzone, ..} => bzone,
            _ => None
        }
    }
}

impl Drop for ActiveZone<'_> {
    fn drop(&mut self) {
        self.md.put_chunk_mapping(self.zone);
    }
}

fn mapped(raw: u32) -> Option<ZoneT> {
    if raw == UNMAPPED { None } else { Some(raw) }
}

impl MapState {
    pub(super) fn unmap_rnd_percent(&self) -> u32 {
        if self.nr_rnd == 0 {
            0
        } else {
            (self.unmap_rnd.len() as u32 * 100) / self.nr_rnd
        }
    }
}

impl Metadata {
    /// Read a chunk's entry from the Chunk Map: its data zone and buffer
    /// zone.
    pub fn map_entry(&self, chunk: ChunkT) -> (Option<ZoneT>, Option<ZoneT>) {
        let (mblk, idx) = self.layout.map_block(chunk);
        let data = self.map_blocks[mblk as usize - 1].data();
        let off = idx * 8;
        let dzone = LittleEndian::read_u32(&data[off..off + 4]);
        let bzone = LittleEndian::read_u32(&data[off + 4..off + 8]);
        (mapped(dzone), mapped(bzone))
    }

    /// Update a chunk's entry in the Chunk Map.  Must be called with the
    /// mapping lock held.
    fn set_map_entry(&self, chunk: ChunkT, dzone: Option<ZoneT>,
                     bzone: Option<ZoneT>)
    {
        let (mblk, idx) = self.layout.map_block(chunk);
        let mref = &self.map_blocks[mblk as usize - 1];
        {
            let mut data = mref.data_mut();
            let off = idx * 8;
            LittleEndian::write_u32(&mut data[off..off + 4],
                dzone.unwrap_or(UNMAPPED));
            LittleEndian::write_u32(&mut data[off + 4..off + 8],
                bzone.unwrap_or(UNMAPPED));
        }
        mref.mark_dirty();
    }

    fn lru_list<'a>(&self, ms: &'a mut MapState, zone: ZoneT)
        -> &'a mut LruList<ZoneT>
    {
        if self.dir.get(zone).is_rnd() {
            &mut ms.map_rnd
        } else {
            &mut ms.map_seq
        }
    }

    /// Put a free zone on the right free list.  Unusable zones go nowhere.
    pub(super) fn push_free(&self, ms: &mut MapState, zone: ZoneT) {
        let zs = &mut ms.zones[zone as usize];
        zs.role = Role::Free;
        if zs.cond != ZoneCond::Online {
            return;
        }
        if self.dir.get(zone).is_rnd() {
            ms.unmap_rnd.push_back(zone);
        } else if (ms.reserved_seq.len() as u32) < self.layout.nr_reserved_seq
        {
            ms.reserved_seq.push_back(zone);
        } else {
            ms.unmap_seq.push_back(zone);
        }
    }

    /// Remove a zone from whichever free list it's on.
    pub(super) fn unlist_free(ms: &mut MapState, zone: ZoneT) {
        ms.unmap_rnd.retain(|z| *z != zone);
        ms.unmap_seq.retain(|z| *z != zone);
        ms.reserved_seq.retain(|z| *z != zone);
    }

    /// Take a zone from a free list.  Must be called with the mapping lock
    /// held.
    fn alloc_locked(&self, ms: &mut MapState, kind: AllocKind)
        -> Option<ZoneT>
    {
        let zone = match kind {
            AllocKind::Rnd => ms.unmap_rnd.pop_front(),
            AllocKind::Seq => ms.unmap_seq.pop_front(),
            AllocKind::Reclaim => ms.unmap_seq.pop_front()
                .or_else(|| ms.reserved_seq.pop_front())
        };
        if ms.unmap_rnd_percent() <= self.config.reclaim_low {
            self.reclaim_trigger.notify_one();
        }
        let zone = zone?;
        debug_assert_eq!(ms.zones[zone as usize].role, Role::Free);
        debug_assert_eq!(ms.zones[zone as usize].weight, 0);
        // Claim it, so it won't be freed twice
        ms.zones[zone as usize].role = Role::PendingFree;
        Some(zone)
    }

    /// Allocate a free zone.  The caller must either map it or release it
    /// with [`Metadata::free_zone`].
    pub fn alloc_zone(&self, kind: AllocKind) -> Option<ZoneT> {
        let mut ms = self.map.lock().unwrap();
        self.alloc_locked(&mut ms, kind)
    }

    /// Make `zone` the data zone of `chunk`.
    fn map_zone(&self, ms: &mut MapState, zone: ZoneT, chunk: ChunkT) {
        ms.zones[zone as usize].role = Role::Data { chunk, bzone: None };
        self.set_map_entry(chunk, Some(zone), None);
        self.lru_list(ms, zone).push_mru(zone);
    }

    /// Release a zone that no longer holds valid data.  It won't be reused
    /// until the next flush commits its release.
    fn free_locked(&self, ms: &mut MapState, zone: ZoneT) {
        let zs = &mut ms.zones[zone as usize];
        if zs.weight > 0 {
            warn!(zone, weight = zs.weight, "Freeing a zone with valid blocks");
        }
        zs.role = Role::PendingFree;
        ms.map_rnd.remove(&zone);
        ms.map_seq.remove(&zone);
        ms.pending_free.push(zone);
    }

    /// Release an allocated zone that was never mapped.
    pub fn free_zone(&self, zone: ZoneT) {
        let mut ms = self.map.lock().unwrap();
        self.free_locked(&mut ms, zone);
    }

    /// Detach a chunk's buffer zone and free it.
    fn unmap_buffer(&self, ms: &mut MapState, dzone: ZoneT) {
        let Role::Data { chunk, bzone: Some(bzone) } =
            ms.zones[dzone as usize].role else
        {
            return;
        };
        ms.zones[dzone as usize].role = Role::Data { chunk, bzone: None };
        self.set_map_entry(chunk, Some(dzone), None);
        self.free_locked(ms, bzone);
    }

    /// Unmap a chunk's data zone and free it.  The chunk must have no buffer.
    fn unmap_data(&self, ms: &mut MapState, dzone: ZoneT) {
        let Role::Data { chunk, bzone } = ms.zones[dzone as usize].role else {
            return;
        };
        debug_assert!(bzone.is_none());
        self.set_map_entry(chunk, None, None);
        self.free_locked(ms, dzone);
    }

    /// Free whatever parts of a chunk's mapping hold no valid data, once the
    /// chunk has no more active requests.
    pub(super) fn validate_zone(&self, ms: &mut MapState, dzone: ZoneT) {
        let Role::Data { bzone, .. } = ms.zones[dzone as usize].role else {
            return;
        };
        if let Some(bzone) = bzone {
            if ms.zones[bzone as usize].weight == 0 {
                debug!(dzone, bzone, "Freeing empty buffer zone");
                self.unmap_buffer(ms, dzone);
            } else {
                ms.map_rnd.push_mru(bzone);
            }
        }
        let Role::Data { bzone, .. } = ms.zones[dzone as usize].role else {
            return;
        };
        if bzone.is_none() && ms.zones[dzone as usize].weight == 0 {
            debug!(dzone, "Freeing empty data zone");
            self.unmap_data(ms, dzone);
        } else {
            self.lru_list(ms, dzone).push_mru(dzone);
        }
    }

    /// Wait for something to change, with the configured timeout.  Returns
    /// `ENOSPC` if the total time spent waiting exceeds the limit.
    async fn wait_on<F>(&self, notified: F, waited: &mut Duration)
        -> Result<()>
        where F: std::future::Future<Output=()>
    {
        let period = self.config.zone_wait();
        if let Some(limit) = self.config.zone_wait_timeout() {
            if *waited >= limit {
                warn!(waited = ?*waited, "Timed out waiting for a free zone");
                return Err(Error::ENOSPC);
            }
        }
        // A timeout is harmless; the caller simply rechecks.
        let _ = timeout(period, notified).await;
        *waited += period;
        if self.is_shutdown() {
            Err(Error::ESHUTDOWN)
        } else {
            Ok(())
        }
    }

    /// Ask for more free zones: wake the reclaim engine, and the flusher if
    /// zones are waiting on a commit.
    fn kick_space(&self, ms: &MapState) {
        self.reclaim_trigger.notify_one();
        if !ms.pending_free.is_empty() {
            self.cache.pressure().notify_one();
        }
    }

    /// Look up a chunk's data zone and pin it against reclaim.
    ///
    /// If the chunk is unmapped and `for_write` is set, map it to a fresh
    /// random zone, waiting for one to be freed if necessary.  If it's
    /// unmapped and `for_write` is clear, return `None`.
    ///
    /// Must not be called with the metadata lock held, since waiting for a
    /// zone may require a flush.
    pub async fn get_chunk_mapping(&self, chunk: ChunkT, for_write: bool)
        -> Result<Option<ActiveZone<'_>>>
    {
        if chunk >= self.layout.nr_chunks {
            return Err(Error::EINVAL);
        }
        let mut waited = Duration::ZERO;
        loop {
            if self.is_shutdown() {
                return Err(Error::ESHUTDOWN);
            }
            let notified = {
                let mut ms = self.map.lock().unwrap();
                match self.map_entry(chunk).0 {
                    Some(dzone) if ms.zones[dzone as usize].reclaim => {
                        debug!(chunk, dzone, "Waiting for reclaim");
                        self.reclaim_wq.notified()
                    }
                    Some(dzone) => return Ok(Some(self.activate(&mut ms, dzone))),
                    None if !for_write => return Ok(None),
                    None => match self.alloc_locked(&mut ms, AllocKind::Rnd) {
                        Some(dzone) => {
                            debug!(chunk, dzone, "Mapped chunk");
                            self.map_zone(&mut ms, dzone, chunk);
                            return Ok(Some(self.activate(&mut ms, dzone)));
                        }
                        None => {
                            debug!(chunk, "Waiting for a free random zone");
                            self.kick_space(&ms);
                            self.free_wq.notified()
                        }
                    }
                }
            };
            self.wait_on(notified, &mut waited).await?;
        }
    }

    fn activate(&self, ms: &mut MapState, dzone: ZoneT) -> ActiveZone<'_> {
        ms.zones[dzone as usize].active += 1;
        self.lru_list(ms, dzone).push_mru(dzone);
        ActiveZone { md: self, zone: dzone }
    }

    /// Drop a reference acquired by [`Metadata::get_chunk_mapping`].
    fn put_chunk_mapping(&self, dzone: ZoneT) {
        let mut ms = self.map.lock().unwrap();
        let zs = &mut ms.zones[dzone as usize];
        debug_assert!(zs.active > 0);
        zs.active -= 1;
        if zs.active == 0 {
            self.validate_zone(&mut ms, dzone);
        }
    }

    /// Get the buffer zone of an active sequential data zone, allocating one
    /// if necessary.
    pub async fn get_chunk_buffer(&self, az: &ActiveZone<'_>) -> Result<ZoneT>
    {
        let dzone = az.zone();
        let mut waited = Duration::ZERO;
        loop {
            if self.is_shutdown() {
                return Err(Error::ESHUTDOWN);
            }
            let notified = {
                let mut ms = self.map.lock().unwrap();
                let Role::Data { chunk, bzone } = ms.zones[dzone as usize].role
                else {
                    return Err(Error::EIO);
                };
                if let Some(bzone) = bzone {
                    return Ok(bzone);
                }
                match self.alloc_locked(&mut ms, AllocKind::Rnd) {
                    Some(bzone) => {
                        debug!(chunk, dzone, bzone, "Mapped buffer zone");
                        ms.zones[dzone as usize].role =
                            Role::Data { chunk, bzone: Some(bzone) };
                        ms.zones[bzone as usize].role =
                            Role::Buffer { chunk, dzone };
                        self.set_map_entry(chunk, Some(dzone), Some(bzone));
                        ms.map_rnd.push_mru(bzone);
                        return Ok(bzone);
                    }
                    None => {
                        debug!(chunk, dzone, "Waiting for a free buffer zone");
                        self.kick_space(&ms);
                        self.free_wq.notified()
                    }
                }
            };
            self.wait_on(notified, &mut waited).await?;
        }
    }

    /// Advance a sequential zone's write pointer after a successful write.
    pub fn advance_wp(&self, zone: ZoneT, nblocks: LbaT) {
        let mut ms = self.map.lock().unwrap();
        let zs = &mut ms.zones[zone as usize];
        zs.wp = (zs.wp + nblocks).min(self.layout.zone_nr_blocks);
    }

    /// Choose a zone to garbage collect, and mark it as being reclaimed.
    ///
    /// Random data zones are preferred while sequential zones are available
    /// to copy them into.  Otherwise, sequential zones with buffers are
    /// chosen, since merging them frees random zones without needing a
    /// sequential one.  Either way, least recently used zones go first.
    pub fn pick_reclaim_victim(&self) -> Option<ZoneT> {
        self.pick_reclaim_victim_except(&[])
    }

    /// Like [`Metadata::pick_reclaim_victim`], but never choose a zone in
    /// `skip`.
    pub fn pick_reclaim_victim_except(&self, skip: &[ZoneT]) -> Option<ZoneT>
    {
        let mut ms = self.map.lock().unwrap();
        let have_seq = !ms.unmap_seq.is_empty() || !ms.reserved_seq.is_empty();
        let victim = if have_seq {
            Self::rnd_victim(&ms, skip).or_else(|| Self::seq_victim(&ms, skip))
        } else {
            Self::seq_victim(&ms, skip).or_else(|| Self::rnd_victim(&ms, skip))
        }?;
        ms.zones[victim as usize].reclaim = true;
        Some(victim)
    }

    fn reclaimable(ms: &MapState, dzone: ZoneT, skip: &[ZoneT]) -> bool {
        let zs = &ms.zones[dzone as usize];
        zs.active == 0 && !zs.reclaim && !skip.contains(&dzone)
    }

    fn rnd_victim(ms: &MapState, skip: &[ZoneT]) -> Option<ZoneT> {
        ms.map_rnd.iter()
            .filter_map(|zone| match ms.zones[zone as usize].role {
                Role::Data{..} => Some(zone),
                Role::Buffer{dzone, ..} => Some(dzone),
                _ => None
            }).find(|dzone| Self::reclaimable(ms, *dzone, skip))
    }

    fn seq_victim(ms: &MapState, skip: &[ZoneT]) -> Option<ZoneT> {
        ms.map_seq.iter()
            .filter(|zone| matches!(ms.zones[*zone as usize].role,
                                    Role::Data{bzone: Some(_), ..}))
            .find(|dzone| Self::reclaimable(ms, *dzone, skip))
    }

    /// Clear a zone's reclaim mark, waking anybody waiting for it.
    pub fn finish_reclaim(&self, dzone: ZoneT) {
        {
            let mut ms = self.map.lock().unwrap();
            ms.zones[dzone as usize].reclaim = false;
        }
        self.reclaim_wq.notify_waiters();
    }

    /// Unmap and free a data zone, along with its buffer, after reclaim has
    /// invalidated all of their blocks.
    pub fn reclaim_unmap(&self, dzone: ZoneT) {
        let mut ms = self.map.lock().unwrap();
        self.unmap_buffer(&mut ms, dzone);
        self.unmap_data(&mut ms, dzone);
    }

    /// Move a chunk from `dzone` to the freshly allocated sequential zone
    /// `szone`, which already holds all of its valid data, and free `dzone`.
    pub fn reclaim_remap(&self, dzone: ZoneT, szone: ZoneT) {
        let mut ms = self.map.lock().unwrap();
        let Role::Data { chunk, bzone } = ms.zones[dzone as usize].role else {
            return;
        };
        debug_assert!(bzone.is_none());
        self.map_zone(&mut ms, szone, chunk);
        self.free_locked(&mut ms, dzone);
    }

    /// Detach and free a chunk's buffer zone after its data was merged into
    /// the data zone.
    pub fn reclaim_drop_buffer(&self, dzone: ZoneT) {
        let mut ms = self.map.lock().unwrap();
        self.unmap_buffer(&mut ms, dzone);
    }

    /// Make a chunk's buffer zone its data zone, after all valid data from
    /// the data zone was copied into it, and free the old data zone.
    ///
    /// Returns the new data zone.
    pub fn reclaim_promote_buffer(&self, dzone: ZoneT) -> Option<ZoneT> {
        let mut ms = self.map.lock().unwrap();
        let Role::Data { chunk, bzone: Some(bzone) } =
            ms.zones[dzone as usize].role else
        {
            return None;
        };
        ms.zones[bzone as usize].role = Role::Data { chunk, bzone: None };
        self.set_map_entry(chunk, Some(bzone), None);
        ms.map_rnd.push_mru(bzone);
        self.free_locked(&mut ms, dzone);
        Some(bzone)
    }

    /// Are there free zones waiting for a flush?
    pub fn has_pending_free(&self) -> bool {
        !self.map.lock().unwrap().pending_free.is_empty()
    }
}

// LCOV_EXCL_STOP
