// vim: tw=80
//! The metadata block cache
//!
//! Caches 4 KiB blocks of the primary metadata set: chunk mapping blocks and
//! validity bitmap blocks.  Blocks are reference counted through
//! [`MblockRef`].  Unreferenced clean blocks sit on an LRU list and may be
//! evicted at any time.  Dirty blocks stay resident until the flush
//! coordinator has committed them to both metadata sets.

use crate::{
    types::*,
    util::*,
    vdev::*
};
use divbuf::DivBufShared;
use fixedbitset::FixedBitSet;
use futures::channel::oneshot;
use metrohash::MetroBuildHasher;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tokio::sync::Notify;
use tracing::{debug, warn};

mod lru;

pub use self::lru::LruList;

/// One cached metadata block
#[derive(Debug)]
pub struct Mblock {
    no: MblkT,
    data: RwLock<Box<[u8]>>,
}

#[derive(Debug)]
struct Entry {
    blk: Arc<Mblock>,
    refs: u32,
    /// Part of a flush that has not completed yet.  May not be evicted.
    flushing: bool,
}

#[derive(Debug)]
struct Inner {
    /// All resident blocks, ordered by block number
    entries: BTreeMap<MblkT, Entry>,
    /// Clean, unreferenced blocks that may be evicted
    lru: LruList<MblkT>,
    /// Blocks modified since they were last snapshotted for a flush
    dirty: FixedBitSet,
    /// Reads in progress, and the tasks waiting for them
    pending: HashMap<MblkT, Vec<oneshot::Sender<Result<()>>>, MetroBuildHasher>,
}

/// Snapshot of one dirty block, taken at the start of a flush
#[derive(Clone, Debug)]
pub struct DirtyBlock {
    pub no: MblkT,
    pub data: Box<[u8]>,
}

/// Reference-counted cache of metadata blocks.
pub struct MblockCache {
    vdev: Arc<dyn ZonedVdev>,
    /// LBA of block 0 of the primary metadata set
    base: LbaT,
    /// Soft limit on the number of resident blocks
    max: usize,
    inner: Mutex<Inner>,
    /// Signalled when the cache is over its limit and only a flush can help
    pressure: Arc<Notify>,
}

impl MblockCache {
    /// Create an empty cache for a metadata set of `nr_blocks` blocks
    /// starting at `base`.
    pub fn new(vdev: Arc<dyn ZonedVdev>, base: LbaT, nr_blocks: MblkT,
               max: usize) -> Self
    {
        let inner = Inner {
            entries: BTreeMap::new(),
            lru: LruList::default(),
            dirty: FixedBitSet::with_capacity(nr_blocks as usize),
            pending: HashMap::with_hasher(MetroBuildHasher::default())
        };
        MblockCache {
            vdev,
            base,
            max,
            inner: Mutex::new(inner),
            pressure: Arc::new(Notify::new())
        }
    }

    /// Fetch a block, reading it from disk if it isn't resident.
    ///
    /// If another task is already reading the same block, wait for it rather
    /// than issuing a second read.  Read errors are returned to every waiter,
    /// and the failed block is not cached.  If the reading task is cancelled,
    /// its waiters retry.
    pub async fn get(self: &Arc<Self>, no: MblkT) -> Result<MblockRef> {
        loop {
            let rx = {
                let mut guard = self.inner.lock().unwrap();
                let inner = &mut *guard;
                if let Some(e) = inner.entries.get_mut(&no) {
                    e.refs += 1;
                    let blk = e.blk.clone();
                    inner.lru.remove(&no);
                    return Ok(MblockRef{cache: self.clone(), blk});
                }
                if let Some(v) = inner.pending.get_mut(&no) {
                    let (tx, rx) = oneshot::channel();
                    v.push(tx);
                    rx
                } else {
                    inner.pending.insert(no, Vec::new());
                    break;
                }
            };
            // A cancelled reader drops the sender without answering
            if let Ok(r) = rx.await {
                r?;
            }
        }

        let mut reader = PendingRead { cache: self, no, armed: true };
        let dbs = DivBufShared::from(vec![0u8; BYTES_PER_LBA]);
        let r = self.vdev.read_at(dbs.try_mut().unwrap(), self.base + no)
            .await;
        reader.armed = false;
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let waiters = inner.pending.remove(&no).unwrap_or_default();
        for w in waiters {
            // The waiter may have been dropped
            let _ = w.send(r);
        }
        if let Err(e) = r {
            warn!(block = no, error = ?e, "Metadata block read failed");
            return Err(e);
        }
        let data = Vec::from(&dbs.try_const().unwrap()[..]).into_boxed_slice();
        let blk = Arc::new(Mblock { no, data: RwLock::new(data) });
        let entry = Entry { blk: blk.clone(), refs: 1, flushing: false };
        inner.entries.insert(no, entry);
        self.shrink(inner);
        Ok(MblockRef{cache: self.clone(), blk})
    }

    /// Add `no` to the dirty set.  Idempotent.
    pub fn mark_dirty(&self, no: MblkT) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.entries.contains_key(&no));
        inner.lru.remove(&no);
        inner.dirty.insert(no as usize);
    }

    fn release(&self, no: MblkT) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let dirty = inner.dirty.contains(no as usize);
        let e = inner.entries.get_mut(&no)
            .expect("Released a block that isn't cached");
        e.refs -= 1;
        if e.refs == 0 && !dirty && !e.flushing {
            inner.lru.push_mru(no);
            self.shrink(inner);
        }
    }

    /// Evict clean blocks until the cache is back under its limit.
    fn shrink(&self, inner: &mut Inner) {
        while inner.entries.len() > self.max {
            match inner.lru.pop_lru() {
                Some(no) => {
                    inner.entries.remove(&no);
                }
                None => {
                    // Everything is dirty or in use.
                    debug!(resident = inner.entries.len(), max = self.max,
                           "metadata cache full; requesting flush");
                    self.pressure.notify_one();
                    break;
                }
            }
        }
    }

    /// Copy every dirty block and clear the dirty set.
    ///
    /// The copied blocks are pinned until [`MblockCache::finish_flush`] or
    /// [`MblockCache::abort_flush`].  Blocks dirtied again after this call
    /// will be part of the next flush.
    pub fn take_dirty(&self) -> Vec<DirtyBlock> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let mut snapshot = Vec::with_capacity(inner.dirty.count_ones(..));
        for i in inner.dirty.ones() {
            let no = i as MblkT;
            let e = inner.entries.get_mut(&no)
                .expect("Dirty block was evicted");
            e.flushing = true;
            let data = e.blk.data.read().unwrap().clone();
            snapshot.push(DirtyBlock{no, data});
        }
        inner.dirty.clear();
        snapshot
    }

    /// The flush of these blocks failed.  Return them to the dirty set.
    pub fn abort_flush(&self, blocks: &[DirtyBlock]) {
        let mut inner = self.inner.lock().unwrap();
        for b in blocks {
            inner.dirty.insert(b.no as usize);
            if let Some(e) = inner.entries.get_mut(&b.no) {
                e.flushing = false;
            }
        }
    }

    /// These blocks are now durable.  Those that weren't dirtied again and
    /// aren't referenced become eligible for eviction.
    pub fn finish_flush(&self, blocks: &[DirtyBlock]) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        for b in blocks {
            let dirty = inner.dirty.contains(b.no as usize);
            if let Some(e) = inner.entries.get_mut(&b.no) {
                e.flushing = false;
                if e.refs == 0 && !dirty {
                    inner.lru.push_mru(b.no);
                }
            }
        }
        self.shrink(inner);
    }

    /// Are there any blocks waiting to be flushed?
    pub fn is_dirty(&self) -> bool {
        !self.inner.lock().unwrap().dirty.is_clear()
    }

    /// Number of blocks waiting to be flushed
    pub fn nr_dirty(&self) -> usize {
        self.inner.lock().unwrap().dirty.count_ones(..)
    }

    /// Number of resident blocks
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Soft limit on the number of resident blocks
    pub fn max(&self) -> usize {
        self.max
    }

    /// A `Notify` that fires whenever the cache needs a flush to make room.
    pub fn pressure(&self) -> Arc<Notify> {
        self.pressure.clone()
    }
}

impl fmt::Debug for MblockCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MblockCache")
            .field("base", &self.base)
            .field("max", &self.max)
            .field("inner", &self.inner)
            .finish()
    }
}

/// Owns a block's entry in the pending table while its read is in flight.
///
/// If the read is cancelled, dropping this removes the entry, waking the
/// waiters so one of them can read the block instead.
struct PendingRead<'a> {
    cache: &'a MblockCache,
    no: MblkT,
    armed: bool,
}

impl Drop for PendingRead<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.inner.lock().unwrap().pending.remove(&self.no);
        }
    }
}

/// A counted reference to a cached metadata block.
///
/// As long as the reference lives, the block will not be evicted.
pub struct MblockRef {
    cache: Arc<MblockCache>,
    blk: Arc<Mblock>,
}

impl MblockRef {
    pub fn no(&self) -> MblkT {
        self.blk.no
    }

    /// Read-only access to the block's contents
    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.blk.data.read().unwrap()
    }

    /// Mutable access to the block's contents.  Callers must also call
    /// [`MblockRef::mark_dirty`].
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.blk.data.write().unwrap()
    }

    pub fn mark_dirty(&self) {
        self.cache.mark_dirty(self.blk.no)
    }
}

impl fmt::Debug for MblockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MblockRef({})", self.blk.no)
    }
}

impl Drop for MblockRef {
    fn drop(&mut self) {
        self.cache.release(self.blk.no)
    }
}

// LCOV_EXCL_STOP
