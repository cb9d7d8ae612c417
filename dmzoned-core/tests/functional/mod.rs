// vim: tw=80
//! Whole-engine tests on an emulated zoned device

use std::sync::Arc;

use divbuf::DivBufShared;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use dmzoned_core::{
    BYTES_PER_LBA,
    ChunkT,
    Error,
    LbaT,
    Result,
    config::{Config, FormatOptions},
    target::Target,
    vdev::ZoneType,
    vdev_mem::VdevMem,
};

macro_rules! t {
    ($e:expr) => (match $e {
        Ok(e) => e,
        Err(e) => panic!("{} failed with {:?}", stringify!($e), e),
    })
}

mod invariants;
mod io;
mod reclaim;
mod recovery;

/// Blocks per zone in most tests
const LPZ: LbaT = 64;

/// Helper to create a freshly formatted device
#[derive(Clone, Debug)]
struct Harness {
    /// Number of conventional zones
    nconv: usize,
    /// Number of sequential-required zones
    nseq: usize,
    /// Blocks per zone
    lpz: LbaT,
    nr_reserved_seq: u32,
    config: Config,
}

impl Default for Harness {
    fn default() -> Self {
        // Only reclaim when the random zones run out, so tests control when
        // chunks move to sequential zones.
        let config = Config {
            reclaim_low: 10,
            reclaim_idle_low: 10,
            zone_wait_ms: 10,
            zone_wait_timeout_ms: Some(30_000),
            ..Default::default()
        };
        Harness {
            nconv: 6,
            nseq: 12,
            lpz: LPZ,
            nr_reserved_seq: 1,
            config
        }
    }
}

impl Harness {
    async fn format(&self) -> VdevMem {
        let mut types = vec![ZoneType::Conventional; self.nconv];
        types.extend(std::iter::repeat(ZoneType::SeqRequired).take(self.nseq));
        let vd = VdevMem::new(&types, self.lpz);
        let opts = FormatOptions { nr_reserved_seq: self.nr_reserved_seq };
        t!(Target::format(Arc::new(vd.clone()), &opts).await);
        vd
    }

    async fn open(&self, vd: &VdevMem) -> Target {
        t!(Target::open(Arc::new(vd.clone()), self.config.clone()).await)
    }

    async fn build(&self) -> (VdevMem, Target) {
        let vd = self.format().await;
        let target = self.open(&vd).await;
        (vd, target)
    }
}

/// Write `data`, which must be a whole number of blocks.
async fn write_data(target: &Target, chunk: ChunkT, block: LbaT, data: &[u8])
    -> Result<()>
{
    let dbs = DivBufShared::from(data.to_vec());
    target.write(chunk, block, dbs.try_const().unwrap()).await
}

async fn read_data(target: &Target, chunk: ChunkT, block: LbaT, nblocks: LbaT)
    -> Result<Vec<u8>>
{
    let dbs = DivBufShared::from(vec![0xa5u8; nblocks as usize * BYTES_PER_LBA]);
    target.read(chunk, block, dbs.try_mut().unwrap()).await?;
    let v = dbs.try_const().unwrap()[..].to_vec();
    Ok(v)
}

/// Random payload of `nblocks` blocks
fn payload(rng: &mut XorShiftRng, nblocks: LbaT) -> Vec<u8> {
    let mut v = vec![0u8; nblocks as usize * BYTES_PER_LBA];
    rng.fill(&mut v[..]);
    v
}

fn rng(seed: u64) -> XorShiftRng {
    XorShiftRng::seed_from_u64(seed)
}

/// Expected contents of the target, for comparison
struct Shadow {
    data: Vec<u8>,
    chunk_blocks: LbaT,
}

impl Shadow {
    fn new(target: &Target) -> Self {
        let len = target.capacity() as usize * BYTES_PER_LBA;
        Shadow { data: vec![0; len], chunk_blocks: target.chunk_blocks() }
    }

    fn range(&self, chunk: ChunkT, block: LbaT, nblocks: LbaT)
        -> std::ops::Range<usize>
    {
        let start = (LbaT::from(chunk) * self.chunk_blocks + block) as usize *
            BYTES_PER_LBA;
        start..start + nblocks as usize * BYTES_PER_LBA
    }

    fn write(&mut self, chunk: ChunkT, block: LbaT, data: &[u8]) {
        let r = self.range(chunk, block, (data.len() / BYTES_PER_LBA) as LbaT);
        self.data[r].copy_from_slice(data);
    }

    fn discard(&mut self, chunk: ChunkT, block: LbaT, nblocks: LbaT) {
        let r = self.range(chunk, block, nblocks);
        self.data[r].fill(0);
    }

    fn get(&self, chunk: ChunkT, block: LbaT, nblocks: LbaT) -> &[u8] {
        &self.data[self.range(chunk, block, nblocks)]
    }

    /// Check every chunk of the target against the shadow copy.
    async fn verify(&self, target: &Target) {
        for chunk in 0..target.nr_chunks() {
            let actual = t!(read_data(target, chunk, 0, self.chunk_blocks)
                            .await);
            assert!(actual == self.get(chunk, 0, self.chunk_blocks),
                    "chunk {} differs", chunk);
        }
    }
}

/// Issue `n` random writes, overwrites and discards confined to the first
/// `nchunks` chunks, recording them in `shadow`.
async fn random_workload(target: &Target, shadow: &mut Shadow,
                         rng: &mut XorShiftRng, nchunks: ChunkT, n: usize)
{
    let cb = target.chunk_blocks();
    for _ in 0..n {
        let chunk = rng.gen_range(0..nchunks);
        let block = rng.gen_range(0..cb);
        let nblocks = rng.gen_range(1..=(cb - block).min(8));
        if rng.gen_ratio(1, 10) {
            t!(target.discard(chunk, block, nblocks).await);
            shadow.discard(chunk, block, nblocks);
        } else {
            let data = payload(rng, nblocks);
            t!(write_data(target, chunk, block, &data).await);
            shadow.write(chunk, block, &data);
        }
    }
}
