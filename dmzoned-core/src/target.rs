// vim: tw=80
//! I/O Translator and target life cycle
//!
//! A `Target` exposes the device as an array of chunks, each the size of a
//! zone, that can be read and written at any block offset.  Writes to a
//! random data zone, or at the write pointer of a sequential one, go straight
//! to the data zone.  Other writes to a sequential data zone go to the same
//! offset in the chunk's random buffer zone.  Reads take each block from the
//! buffer zone if it's valid there, otherwise from the data zone if it's valid
//! there, otherwise they return zeros.

use atomic_enum::atomic_enum;
use crate::{
    config::{Config, FormatOptions},
    metadata::{Metadata, Status, Syncer},
    reclaim::{self, Reclaimer},
    types::*,
    util::*,
    vdev::ZonedVdev,
};
use std::sync::{Arc, atomic::Ordering};
use tracing::{info, instrument, warn};

#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum TargetState {
    /// Serving requests, with background tasks running
    Running = 0,
    /// Background tasks stopped.  Requests fail with `EAGAIN`.
    Suspended,
    /// Permanently stopped.  Requests fail with `ESHUTDOWN`.
    Shutdown,
}

/// The background tasks of a running target
struct Tasks {
    syncer: Syncer,
    reclaimer: Reclaimer,
}

impl Tasks {
    fn start(md: &Arc<Metadata>) -> Option<Self> {
        if md.config().read_only {
            return None;
        }
        let syncer = Syncer::new(md.clone());
        let reclaimer = Reclaimer::new(md.clone());
        Some(Tasks { syncer, reclaimer })
    }

    async fn stop(self) {
        self.reclaimer.shutdown().await;
        self.syncer.shutdown().await;
    }
}

pub struct Target {
    md: Arc<Metadata>,
    state: AtomicTargetState,
    tasks: futures_locks::Mutex<Option<Tasks>>,
}

impl Target {
    /// Format a device, destroying its contents.
    pub async fn format(vdev: Arc<dyn ZonedVdev>, opts: &FormatOptions)
        -> Result<()>
    {
        if opts.nr_reserved_seq == 0 {
            return Err(Error::EINVAL);
        }
        Metadata::format(vdev, opts).await
    }

    /// Mount a formatted device and start its background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    #[instrument(skip(vdev))]
    pub async fn open(vdev: Arc<dyn ZonedVdev>, config: Config)
        -> Result<Self>
    {
        let config = config.sanitize()?;
        let md = Arc::new(Metadata::open(vdev, &config).await?);
        let tasks = futures_locks::Mutex::new(Tasks::start(&md));
        let state = AtomicTargetState::new(TargetState::Running);
        Ok(Target { md, state, tasks })
    }

    /// Number of chunks
    pub fn nr_chunks(&self) -> ChunkT {
        self.md.layout().nr_chunks
    }

    /// Number of blocks in each chunk
    pub fn chunk_blocks(&self) -> LbaT {
        self.md.layout().zone_nr_blocks
    }

    /// Size of the target, in blocks
    pub fn capacity(&self) -> LbaT {
        LbaT::from(self.nr_chunks()) * self.chunk_blocks()
    }

    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.md
    }

    pub fn state(&self) -> TargetState {
        self.state.load(Ordering::Relaxed)
    }

    fn check_state(&self, write: bool) -> Result<()> {
        match self.state() {
            TargetState::Running => (),
            TargetState::Suspended => return Err(Error::EAGAIN),
            TargetState::Shutdown => return Err(Error::ESHUTDOWN),
        }
        if write && self.md.config().read_only {
            return Err(Error::EROFS);
        }
        Ok(())
    }

    /// Check that `nblocks` blocks starting at `block` lie within the chunk.
    fn check_range(&self, chunk: ChunkT, block: LbaT, nblocks: LbaT)
        -> Result<()>
    {
        let chunk_blocks = self.chunk_blocks();
        if nblocks == 0 || chunk >= self.nr_chunks() || block >= chunk_blocks ||
            chunk_blocks - block < nblocks
        {
            return Err(Error::EINVAL);
        }
        Ok(())
    }

    fn check_request(&self, write: bool, chunk: ChunkT, block: LbaT,
                     len: usize) -> Result<LbaT>
    {
        self.check_state(write)?;
        if len % BYTES_PER_LBA != 0 {
            return Err(Error::EINVAL);
        }
        let nblocks = (len / BYTES_PER_LBA) as LbaT;
        self.check_range(chunk, block, nblocks)?;
        Ok(nblocks)
    }

    /// Read whole blocks from a chunk into `buf`.
    pub async fn read(&self, chunk: ChunkT, block: LbaT, buf: IoVecMut)
        -> Result<()>
    {
        let nblocks = self.check_request(false, chunk, block, buf.len())?;
        let _chunk_guard = self.md.lock_chunk(chunk).await;
        self.md.mark_io();
        let mut rest = buf;
        let Some(az) = self.md.get_chunk_mapping(chunk, false).await? else {
            rest[..].fill(0);
            return Ok(());
        };
        let dzone = az.zone();
        let bzone = az.bzone();
        let _guard = self.md.io_guard().await;
        let end = block + nblocks;
        let mut b = block;
        while b < end {
            // The buffer zone has the newest copy of every block valid there
            let mut limit = end;
            if let Some(bzone) = bzone {
                match self.md.first_valid_run(bzone, b, end).await? {
                    Some((first, len)) if first == b => {
                        let piece = rest.split_to(len as usize * BYTES_PER_LBA);
                        self.md.vdev().read_at(piece, self.md.zone_lba(bzone, b))
                            .await?;
                        b += len;
                        continue;
                    }
                    Some((first, _)) => limit = first,
                    None => ()
                }
            }
            let (from_dzone, len) =
                match self.md.first_valid_run(dzone, b, limit).await? {
                    Some((first, len)) if first == b => (true, len),
                    Some((first, _)) => (false, first - b),
                    None => (false, limit - b)
                };
            let mut piece = rest.split_to(len as usize * BYTES_PER_LBA);
            if from_dzone {
                self.md.vdev().read_at(piece, self.md.zone_lba(dzone, b))
                    .await?;
            } else {
                piece[..].fill(0);
            }
            b += len;
        }
        Ok(())
    }

    /// Write whole blocks to a chunk.
    pub async fn write(&self, chunk: ChunkT, block: LbaT, buf: IoVec)
        -> Result<()>
    {
        let nblocks = self.check_request(true, chunk, block, buf.len())?;
        let _chunk_guard = self.md.lock_chunk(chunk).await;
        self.md.mark_io();
        let az = self.md.get_chunk_mapping(chunk, true).await?
            .ok_or(Error::EIO)?;
        let dzone = az.zone();
        let zs = az.state();
        if self.md.dir().get(dzone).is_rnd() || block == zs.wp {
            let _guard = self.md.io_guard().await;
            self.md.vdev().write_at(buf, self.md.zone_lba(dzone, block))
                .await?;
            if self.md.dir().get(dzone).is_seq() {
                self.md.advance_wp(dzone, nblocks);
            }
            self.md.validate_blocks(dzone, block, nblocks).await?;
            // Anything in the buffer zone is now stale
            if let Some(bzone) = az.bzone() {
                self.md.invalidate_blocks(bzone, block, nblocks).await?;
            }
        } else {
            let bzone = self.md.get_chunk_buffer(&az).await?;
            let _guard = self.md.io_guard().await;
            self.md.vdev().write_at(buf, self.md.zone_lba(bzone, block))
                .await?;
            self.md.validate_blocks(bzone, block, nblocks).await?;
            self.md.invalidate_blocks(dzone, block, nblocks).await?;
        }
        Ok(())
    }

    /// Discard `nblocks` blocks of a chunk.  They will read as zeros.
    pub async fn discard(&self, chunk: ChunkT, block: LbaT, nblocks: LbaT)
        -> Result<()>
    {
        self.check_state(true)?;
        self.check_range(chunk, block, nblocks)?;
        let _chunk_guard = self.md.lock_chunk(chunk).await;
        self.md.mark_io();
        let Some(az) = self.md.get_chunk_mapping(chunk, false).await? else {
            return Ok(());
        };
        let _guard = self.md.io_guard().await;
        self.md.invalidate_blocks(az.zone(), block, nblocks).await?;
        if let Some(bzone) = az.bzone() {
            self.md.invalidate_blocks(bzone, block, nblocks).await?;
        }
        Ok(())
    }

    /// Commit all metadata changes to disk.
    pub async fn flush(&self) -> Result<()> {
        if self.state() == TargetState::Shutdown {
            return Err(Error::ESHUTDOWN);
        }
        self.md.flush().await?;
        if let Some(tasks) = self.tasks.lock().await.as_ref() {
            tasks.syncer.kick().await;
        }
        Ok(())
    }

    /// Run a reclaim pass right now, returning the number of zones
    /// reclaimed.
    pub async fn reclaim(&self) -> Result<u32> {
        if self.state() != TargetState::Running {
            return Err(Error::EAGAIN);
        }
        if self.md.config().read_only {
            return Err(Error::EROFS);
        }
        reclaim::reclaim_pass(&self.md).await
    }

    pub fn status(&self) -> Status {
        self.md.status()
    }

    /// Stop the background tasks and commit the metadata.
    #[instrument(skip(self))]
    pub async fn suspend(&self) -> Result<()> {
        if self.state.compare_exchange(TargetState::Running,
            TargetState::Suspended, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::EINVAL);
        }
        if let Some(tasks) = self.tasks.lock().await.take() {
            tasks.stop().await;
        }
        self.md.flush().await
    }

    /// Check the zones for changes made while suspended, and restart the
    /// background tasks.
    #[instrument(skip(self))]
    pub async fn resume(&self) -> Result<()> {
        if self.state() != TargetState::Suspended {
            return Err(Error::EINVAL);
        }
        if !self.md.config().read_only {
            self.md.check_zones().await?;
        }
        *self.tasks.lock().await = Tasks::start(&self.md);
        self.state.store(TargetState::Running, Ordering::Release);
        Ok(())
    }

    /// Stop the target for good, committing the metadata.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        if self.state.swap(TargetState::Shutdown, Ordering::AcqRel) ==
            TargetState::Shutdown
        {
            return Ok(());
        }
        self.md.begin_shutdown();
        if let Some(tasks) = self.tasks.lock().await.take() {
            tasks.stop().await;
        }
        let r = self.md.flush().await;
        match &r {
            Ok(()) => info!(gen = self.md.gen(), "Target shut down"),
            Err(e) => warn!(error = ?e, "Final flush failed"),
        }
        r
    }
}

// LCOV_EXCL_STOP
