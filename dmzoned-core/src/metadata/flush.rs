// vim: tw=80
//! Flush Coordinator
//!
//! A flush commits every dirty metadata block using the two metadata sets as
//! a write-ahead log:
//!
//! 1. Write the dirty blocks to set 1, then sync.
//! 2. Write set 1's superblock with the next generation, then sync.  From
//!    here on, set 1 is authoritative.
//! 3. Write the dirty blocks to set 0, then sync.
//! 4. Write set 0's superblock with the same generation, then sync.
//!
//! A crash before step 2 completes leaves set 0 authoritative and untouched.
//! A crash afterwards leaves set 1 with a higher generation, and mounting
//! copies it over set 0.
//!
//! If step 3 or 4 fails, the new generation is committed but set 0 lags
//! behind.  The blocks stay dirty, and the next flush writes them to the
//! lagging set first, so the authoritative set is never overwritten in place.

use futures::{
    FutureExt,
    SinkExt,
    StreamExt,
    channel::mpsc,
    select,
};
use std::mem;
use tokio::{
    task::JoinHandle,
    time::sleep_until,
};
use tracing::{debug, error, info_span, warn};
use tracing_futures::Instrument;
use super::*;
use crate::cache::DirtyBlock;

impl Metadata {
    /// Write a copy of the dirty blocks to one metadata set, and sync.
    async fn write_set(&self, set: usize, blocks: &[DirtyBlock]) -> Result<()>
    {
        let base = self.layout.set_base[set];
        let blocks = blocks.iter()
            .map(|b| (base + b.no, b.data.to_vec()));
        write_lbas(&*self.vdev, blocks).await?;
        self.vdev.sync_all().await
    }

    async fn write_sb(&self, set: usize, gen: u64) -> Result<()> {
        let sb = self.layout.superblock(set, gen).to_block()?;
        write_lbas(&*self.vdev, [(self.layout.set_base[set], sb)]).await?;
        self.vdev.sync_all().await
    }

    /// Write the blocks to both sets, starting with the log set.
    ///
    /// Returns the new generation once the log set's superblock is durable,
    /// along with the result of updating the other set.
    async fn commit(&self, blocks: &[DirtyBlock]) -> Result<(u64, Result<()>)>
    {
        let gen = self.gen() + 1;
        let first = self.log_set.load(Ordering::Relaxed);
        let second = 1 - first;
        self.write_set(first, blocks).await?;
        self.write_sb(first, gen).await?;
        let r = match self.write_set(second, blocks).await {
            Ok(()) => self.write_sb(second, gen).await,
            Err(e) => Err(e)
        };
        Ok((gen, r))
    }

    /// Commit all dirty metadata to disk.
    ///
    /// Zones freed before the flush become reusable once it succeeds.
    #[tracing::instrument(skip(self))]
    pub async fn flush(&self) -> Result<()> {
        if self.config.read_only {
            return Ok(());
        }
        let (pending, r) = {
            let _guard = self.mlock.write().await;
            let (blocks, pending) = {
                let mut ms = self.map.lock().unwrap();
                (self.cache.take_dirty(), mem::take(&mut ms.pending_free))
            };
            if blocks.is_empty() {
                if let Err(e) = self.vdev.sync_all().await {
                    self.map.lock().unwrap().pending_free.extend(&pending);
                    return Err(e);
                }
                (pending, Ok(()))
            } else {
                match self.commit(&blocks).await {
                    Ok((gen, Ok(()))) => {
                        self.gen.store(gen, Ordering::Relaxed);
                        self.log_set.store(1, Ordering::Relaxed);
                        self.cache.finish_flush(&blocks);
                        debug!(gen, nr_blocks = blocks.len(),
                               "Committed metadata");
                        (pending, Ok(()))
                    }
                    Ok((gen, Err(e))) => {
                        // The generation is committed, but the other set is
                        // now stale.  Keep the blocks dirty so it catches up
                        // first at the next flush.
                        let lagging = 1 - self.log_set.load(Ordering::Relaxed);
                        error!(error = ?e, gen, set = lagging,
                               "Failed to update metadata set");
                        self.gen.store(gen, Ordering::Relaxed);
                        self.log_set.store(lagging, Ordering::Relaxed);
                        self.cache.abort_flush(&blocks);
                        (pending, Err(e))
                    }
                    Err(e) => {
                        error!(error = ?e, gen = self.gen(),
                               "Metadata flush failed");
                        self.cache.abort_flush(&blocks);
                        self.map.lock().unwrap().pending_free.extend(&pending);
                        return Err(e);
                    }
                }
            }
        };
        self.release_zones(pending).await;
        r
    }

    /// Reset zones whose release has been committed, and return them to the
    /// free lists.
    async fn release_zones(&self, pending: Vec<ZoneT>) {
        if pending.is_empty() {
            return;
        }
        for zone in pending {
            let desc = self.dir.get(zone);
            let zs = self.zone_state(zone);
            if zs.weight > 0 {
                // Left over from a failed reclaim or discard
                let _guard = self.mlock.read().await;
                if let Err(e) = self.invalidate_zone(zone).await {
                    warn!(zone, error = ?e, "Failed to invalidate zone");
                    self.map.lock().unwrap().pending_free.push(zone);
                    continue;
                }
            }
            if needs_reset(desc, &zs) {
                if let Err(e) = self.vdev.reset_zone(desc.start).await {
                    // Try again after the next flush
                    warn!(zone, error = ?e, "Failed to reset zone");
                    self.map.lock().unwrap().pending_free.push(zone);
                    continue;
                }
            }
            let mut ms = self.map.lock().unwrap();
            ms.zones[zone as usize].wp = 0;
            self.push_free(&mut ms, zone);
        }
        self.free_wq.notify_waiters();
    }
}

#[derive(Debug)]
enum SyncerMsg {
    /// Tell the Syncer that we manually flushed, and it can reset its timer
    Kick,
    /// Tell the Syncer to shut down, and wait for it to do so
    Shutdown,
}

/// Background task that flushes the metadata periodically, and whenever the
/// cache fills up with dirty blocks.
pub struct Syncer {
    jh: JoinHandle<()>,
    tx: mpsc::Sender<SyncerMsg>
}

impl Syncer {
    /// Restart the Syncer's timer, after a manual flush.
    pub async fn kick(&self) {
        let mut tx = self.tx.clone();
        // An error means the Syncer already exited
        let _ = tx.send(SyncerMsg::Kick).await;
    }

    pub fn new(md: Arc<Metadata>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let jh = Syncer::run(md, rx);
        Syncer{jh, tx}
    }

    // Start a task that will flush the metadata at a fixed interval, but will
    // reset the timer if it gets a message on a channel.
    fn run(md: Arc<Metadata>, mut rx: mpsc::Receiver<SyncerMsg>)
        -> JoinHandle<()>
    {
        let period = md.config().flush_period();
        let pressure = md.flush_trigger();
        let taskfut = async move {
            let mut deadline = Instant::now() + period;
            loop {
                let mut delay_fut = Box::pin(sleep_until(deadline).fuse());
                let mut pressure_fut = Box::pin(pressure.notified().fuse());
                select! {
                    _ = delay_fut => {
                        // Time's up.  Flush the metadata.
                        if let Err(e) = md.flush().await {
                            error!(error = ?e, "Periodic flush failed");
                        }
                        deadline = Instant::now() + period;
                    },
                    _ = pressure_fut => {
                        if let Err(e) = md.flush().await {
                            error!(error = ?e, "Flush under pressure failed");
                        }
                        deadline = Instant::now() + period;
                    },
                    sm = rx.select_next_some() => {
                        match sm {
                            SyncerMsg::Kick => {
                                // We got kicked.  Restart the wait
                                deadline = Instant::now() + period;
                            },
                            SyncerMsg::Shutdown => {
                                break;
                            }
                        }
                    },
                    complete => break,
                };
            }
        }.instrument(info_span!("syncer"));
        tokio::spawn(taskfut)
    }

    pub async fn shutdown(mut self) {
        // An error indicates that the task already exited
        let _ = self.tx.send(SyncerMsg::Shutdown).await;
        if let Err(e) = self.jh.await {
            error!(error = ?e, "Syncer task failed");
        }
    }
}

// LCOV_EXCL_STOP
