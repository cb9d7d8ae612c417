// vim: tw=80
//! Reclaim Engine
//!
//! Random zones are scarce, so the reclaim engine keeps a supply of them free
//! by garbage collecting mapped zones:
//!
//! * A random data zone has its valid blocks copied to the same offsets of a
//!   free sequential zone, which becomes the chunk's new data zone.
//! * A sequential data zone with a buffer zone is merged.  If nothing in the
//!   buffer lies below the data zone's write pointer, the buffer's valid
//!   blocks are appended to the data zone.  Otherwise the data zone's valid
//!   blocks are copied into the buffer zone, which becomes the data zone.
//!
//! Holes in a sequential destination are filled with zeros, since a
//! sequential zone can't be written out of order.

use crate::{
    metadata::{AllocKind, Metadata, Role},
    types::*,
    util::*,
};
use divbuf::DivBufShared;
use futures::{
    FutureExt,
    SinkExt,
    StreamExt,
    channel::mpsc,
    select,
};
use std::sync::Arc;
use tokio::{
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::{debug, error, info, info_span, instrument, warn};
use tracing_futures::Instrument;

/// Maximum number of blocks to copy with a single read and write
const COPY_BLOCKS: LbaT = 64;

/// Copy `n` blocks from `src` to the same offsets in `dst`.
async fn copy_blocks(md: &Metadata, src: ZoneT, dst: ZoneT, block: LbaT,
                     n: LbaT) -> Result<()>
{
    let seq = md.dir().get(dst).is_seq();
    let mut done = 0;
    while done < n {
        let count = (n - done).min(COPY_BLOCKS);
        let dbs = DivBufShared::from(vec![0u8; count as usize * BYTES_PER_LBA]);
        md.vdev().read_at(dbs.try_mut().unwrap(),
                          md.zone_lba(src, block + done)).await?;
        md.vdev().write_at(dbs.try_const().unwrap(),
                           md.zone_lba(dst, block + done)).await?;
        if seq {
            md.advance_wp(dst, count);
        }
        done += count;
    }
    Ok(())
}

/// Fill a sequential zone with zeros from its write pointer up to `target`.
async fn pad_to(md: &Metadata, zone: ZoneT, target: LbaT) -> Result<()> {
    let wp = md.zone_state(zone).wp;
    if wp >= target {
        return Ok(());
    }
    let mut lba = md.zone_lba(zone, wp);
    for iovec in zero_sglist((target - wp) as usize * BYTES_PER_LBA) {
        let n = (iovec.len() / BYTES_PER_LBA) as LbaT;
        md.vdev().write_at(iovec, lba).await?;
        md.advance_wp(zone, n);
        lba += n;
    }
    Ok(())
}

/// Copy every valid block of `src` at or after `start` into the sequential
/// zone `dst`, whose write pointer must not be past `start`.
async fn copy_to_seq(md: &Metadata, src: ZoneT, dst: ZoneT, start: LbaT)
    -> Result<()>
{
    let nr_blocks = md.layout().zone_nr_blocks;
    let mut block = start;
    while let Some((first, len)) =
        md.first_valid_run(src, block, nr_blocks).await?
    {
        pad_to(md, dst, first).await?;
        copy_blocks(md, src, dst, first, len).await?;
        block = first + len;
    }
    Ok(())
}

/// Copy every valid block of `src` into the random zone `dst`, unless `dst`
/// already has a valid block at the same offset.
async fn copy_to_rnd(md: &Metadata, src: ZoneT, dst: ZoneT) -> Result<LbaT> {
    let nr_blocks = md.layout().zone_nr_blocks;
    let mut copied = 0;
    let mut block = 0;
    while let Some((first, len)) =
        md.first_valid_run(src, block, nr_blocks).await?
    {
        let end = first + len;
        let mut b = first;
        while let Some((hole, hlen)) = md.first_invalid_run(dst, b, end).await?
        {
            copy_blocks(md, src, dst, hole, hlen).await?;
            md.validate_blocks(dst, hole, hlen).await?;
            copied += hlen;
            b = hole + hlen;
        }
        block = end;
    }
    Ok(copied)
}

/// Move a random data zone's chunk to a sequential zone.
async fn reclaim_rnd(md: &Metadata, dzone: ZoneT, weight: LbaT) -> Result<()>
{
    if weight == 0 {
        debug!(dzone, "Unmapping empty zone");
        md.reclaim_unmap(dzone);
        return Ok(());
    }
    let Some(szone) = md.alloc_zone(AllocKind::Reclaim) else {
        debug!(dzone, "No sequential zone available");
        return Err(Error::ENOSPC);
    };
    debug!(dzone, szone, weight, "Moving random zone");
    let copied = async {
        copy_to_seq(md, dzone, szone, 0).await?;
        md.merge_valid(dzone, szone).await
    }.await;
    if let Err(e) = copied {
        // Abandon the copy.  The chunk stays where it was.
        warn!(dzone, szone, error = ?e, "Abandoning zone move");
        if let Err(e) = md.invalidate_zone(szone).await {
            debug!(szone, error = ?e, "Failed to invalidate scratch zone");
        }
        md.free_zone(szone);
        return Err(e);
    }
    // szone holds everything now.  If dzone can't be invalidated here, that
    // happens again before it is reused.
    let r = md.invalidate_zone(dzone).await;
    md.reclaim_remap(dzone, szone);
    r.map(drop)
}

/// Merge a sequential data zone with its buffer zone.
async fn reclaim_seq(md: &Metadata, dzone: ZoneT, wp: LbaT, bzone: ZoneT)
    -> Result<()>
{
    let nr_blocks = md.layout().zone_nr_blocks;
    let first = md.first_valid_run(bzone, 0, nr_blocks).await?;
    if first.map_or(true, |(b, _)| b >= wp) {
        debug!(dzone, bzone, wp, "Merging buffer into data zone");
        copy_to_seq(md, bzone, dzone, wp).await?;
        md.merge_valid(bzone, dzone).await?;
        md.invalidate_zone(bzone).await?;
        md.reclaim_drop_buffer(dzone);
    } else {
        debug!(dzone, bzone, wp, "Promoting buffer to data zone");
        copy_to_rnd(md, dzone, bzone).await?;
        md.invalidate_zone(dzone).await?;
        md.reclaim_promote_buffer(dzone);
    }
    Ok(())
}

/// Garbage collect one zone, which must have been chosen by
/// [`Metadata::pick_reclaim_victim`].
#[instrument(skip(md))]
pub async fn reclaim_zone(md: &Metadata, dzone: ZoneT) -> Result<()> {
    let r = {
        let _guard = md.io_guard().await;
        let zs = md.zone_state(dzone);
        match zs.role {
            Role::Data { bzone: None, .. } if md.dir().get(dzone).is_rnd() =>
                reclaim_rnd(md, dzone, zs.weight).await,
            Role::Data { bzone: Some(bzone), .. } =>
                reclaim_seq(md, dzone, zs.wp, bzone).await,
            // Nothing to do
            _ => Ok(())
        }
    };
    md.finish_reclaim(dzone);
    r
}

/// Reclaim zones until there are enough free random zones, or nothing more
/// can be done.  Returns the number of zones reclaimed.
///
/// A zone that can't be reclaimed is skipped for the rest of the pass.  The
/// pass fails only if no zone could be reclaimed.
pub async fn reclaim_pass(md: &Metadata) -> Result<u32> {
    let mut reclaimed = 0;
    let mut failed = Vec::new();
    let mut first_err = None;
    while !md.is_shutdown() && md.should_reclaim(md.is_idle()) {
        let Some(dzone) = md.pick_reclaim_victim_except(&failed) else {
            debug!("No zone to reclaim");
            break;
        };
        if let Err(e) = reclaim_zone(md, dzone).await {
            debug!(dzone, error = ?e, "Skipping zone");
            failed.push(dzone);
            first_err.get_or_insert(e);
            continue;
        }
        reclaimed += 1;
        // Make the freed zones reusable
        md.flush().await?;
    }
    if reclaimed > 0 {
        let status = md.status();
        info!(reclaimed, free_rnd = status.nr_unmap_rnd,
              free_seq = status.nr_unmap_seq, "Reclaimed zones");
    } else if let Some(e) = first_err {
        return Err(e);
    }
    Ok(reclaimed)
}

#[derive(Debug)]
enum ReclaimMsg {
    /// Tell the Reclaimer to shut down, and wait for it to do so
    Shutdown,
}

/// Background garbage collector.
///
/// Runs a reclaim pass periodically, and whenever the metadata's reclaim
/// trigger fires because random zones are running low.
pub struct Reclaimer {
    jh: JoinHandle<()>,
    tx: mpsc::Sender<ReclaimMsg>
}

impl Reclaimer {
    pub fn new(md: Arc<Metadata>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let jh = Reclaimer::run(md, rx);
        Reclaimer{jh, tx}
    }

    fn run(md: Arc<Metadata>, mut rx: mpsc::Receiver<ReclaimMsg>)
        -> JoinHandle<()>
    {
        let period = md.config().reclaim_period();
        let trigger = md.reclaim_trigger();
        let taskfut = async move {
            loop {
                let wakeup = Instant::now() + period;
                let mut delay_fut = Box::pin(sleep_until(wakeup).fuse());
                let mut trigger_fut = Box::pin(trigger.notified().fuse());
                select! {
                    _ = delay_fut => (),
                    _ = trigger_fut => (),
                    sm = rx.select_next_some() => {
                        match sm {
                            ReclaimMsg::Shutdown => break
                        }
                    },
                    complete => break,
                };
                match reclaim_pass(&md).await {
                    Ok(_) => (),
                    // Not an error for the target as a whole; a later pass
                    // will try again.
                    Err(Error::ENOSPC) => debug!("Reclaim is out of space"),
                    Err(Error::ESHUTDOWN) => break,
                    Err(e) => error!(error = ?e, "Reclaim failed"),
                }
            }
        }.instrument(info_span!("reclaim"));
        tokio::spawn(taskfut)
    }

    pub async fn shutdown(mut self) {
        // An error indicates that the task already exited
        let _ = self.tx.send(ReclaimMsg::Shutdown).await;
        if let Err(e) = self.jh.await {
            error!(error = ?e, "Reclaimer task failed");
        }
    }
}

// LCOV_EXCL_STOP
