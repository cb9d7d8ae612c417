// vim: tw=80
//! Validity Bitmaps
//!
//! Every zone has one bit per block, set if the block holds live data for the
//! zone's chunk.  Bit `n` of a bitmap block is stored in byte `n / 8` with
//! mask `1 << (n % 8)`.  A zone's weight is its number of set bits.
//!
//! Callers must hold the metadata lock in shared mode.

use byteorder::{ByteOrder, LittleEndian};
use tracing::warn;
use super::*;

const WORD_BITS: usize = 64;

/// Set or clear `n` bits starting at `bit`.  Returns the number of bits that
/// actually changed.
fn update_bits(bytes: &mut [u8], mut bit: usize, n: usize, set: bool) -> LbaT
{
    let end = bit + n;
    let mut changed = 0;
    while bit < end {
        if bit % WORD_BITS == 0 && end - bit >= WORD_BITS {
            let off = bit / 8;
            let word = LittleEndian::read_u64(&bytes[off..off + 8]);
            let new = if set { u64::MAX } else { 0 };
            changed += LbaT::from((word ^ new).count_ones());
            LittleEndian::write_u64(&mut bytes[off..off + 8], new);
            bit += WORD_BITS;
        } else {
            let mask = 1u8 << (bit % 8);
            let byte = &mut bytes[bit / 8];
            if (*byte & mask != 0) != set {
                *byte ^= mask;
                changed += 1;
            }
            bit += 1;
        }
    }
    changed
}

fn test_bit(bytes: &[u8], bit: usize) -> bool {
    bytes[bit / 8] & (1 << (bit % 8)) != 0
}

/// Search `n` bits starting at `bit` for the first one equal to `value`.
fn find_bit(bytes: &[u8], mut bit: usize, n: usize, value: bool)
    -> Option<usize>
{
    let end = bit + n;
    // Whole words that can't contain a match are skipped
    let skip = if value { 0 } else { u64::MAX };
    while bit < end {
        if bit % WORD_BITS == 0 && end - bit >= WORD_BITS {
            let off = bit / 8;
            if LittleEndian::read_u64(&bytes[off..off + 8]) == skip {
                bit += WORD_BITS;
                continue;
            }
        }
        if test_bit(bytes, bit) == value {
            return Some(bit);
        }
        bit += 1;
    }
    None
}

impl Metadata {
    /// Set or clear validity bits, and adjust the zone's weight.
    async fn set_valid(&self, zone: ZoneT, mut block: LbaT, mut n: LbaT,
                       set: bool) -> Result<LbaT>
    {
        let nr_blocks = self.layout.zone_nr_blocks;
        if block + n > nr_blocks {
            warn!(zone, block, n, "Bitmap range exceeds the zone");
            return Err(Error::EINVAL);
        }
        let mut changed = 0;
        while n > 0 {
            let (mblk, bit) = self.layout.bitmap_block(zone, block);
            let mref = self.cache.get(mblk).await?;
            let nbits = n.min(BITS_PER_LBA - bit as LbaT);
            let c = update_bits(&mut mref.data_mut(), bit, nbits as usize,
                                set);
            if c > 0 {
                mref.mark_dirty();
            }
            changed += c;
            block += nbits;
            n -= nbits;
        }
        if changed > 0 {
            let mut ms = self.map.lock().unwrap();
            let zs = &mut ms.zones[zone as usize];
            if set {
                if zs.weight + changed > nr_blocks {
                    warn!(zone, weight = zs.weight, changed,
                          "Zone weight overflow");
                    zs.weight = nr_blocks;
                } else {
                    zs.weight += changed;
                }
            } else if changed > zs.weight {
                warn!(zone, weight = zs.weight, changed,
                      "Zone weight underflow");
                zs.weight = 0;
            } else {
                zs.weight -= changed;
            }
        }
        Ok(changed)
    }

    /// Mark `n` blocks starting at `block` as valid.  Returns the number of
    /// blocks that weren't already valid.
    pub async fn validate_blocks(&self, zone: ZoneT, block: LbaT, n: LbaT)
        -> Result<LbaT>
    {
        self.set_valid(zone, block, n, true).await
    }

    /// Mark `n` blocks starting at `block` as invalid.  Returns the number of
    /// blocks that were valid.
    pub async fn invalidate_blocks(&self, zone: ZoneT, block: LbaT, n: LbaT)
        -> Result<LbaT>
    {
        self.set_valid(zone, block, n, false).await
    }

    /// Invalidate every block of a zone
    pub async fn invalidate_zone(&self, zone: ZoneT) -> Result<LbaT> {
        self.invalidate_blocks(zone, 0, self.layout.zone_nr_blocks).await
    }

    pub async fn is_valid(&self, zone: ZoneT, block: LbaT) -> Result<bool> {
        let (mblk, bit) = self.layout.bitmap_block(zone, block);
        let mref = self.cache.get(mblk).await?;
        let valid = test_bit(&mref.data(), bit);
        Ok(valid)
    }

    /// Find the first run of blocks in `start..end` whose validity is
    /// `value`.  Returns its first block and length.
    async fn find_run(&self, zone: ZoneT, start: LbaT, end: LbaT, value: bool)
        -> Result<Option<(LbaT, LbaT)>>
    {
        let mut block = start;
        let mut run_start = None;
        while block < end {
            let (mblk, bit) = self.layout.bitmap_block(zone, block);
            let mref = self.cache.get(mblk).await?;
            let limit = (end - block).min(BITS_PER_LBA - bit as LbaT);
            let found = {
                let data = mref.data();
                // While looking for the start of the run, look for `value`.
                // Afterwards, look for its end.
                let target = run_start.is_none() == value;
                find_bit(&data, bit, limit as usize, target)
            };
            match (run_start, found) {
                (None, Some(b)) => {
                    let first = block + (b - bit) as LbaT;
                    run_start = Some(first);
                    // Resume the search from the run's first block
                    block = first + 1;
                    continue;
                }
                (Some(s), Some(b)) => {
                    let last = block + (b - bit) as LbaT;
                    return Ok(Some((s, last - s)));
                }
                _ => ()
            }
            block += limit;
        }
        Ok(run_start.map(|s| (s, end - s)))
    }

    /// Find the first run of valid blocks in `start..end`
    pub async fn first_valid_run(&self, zone: ZoneT, start: LbaT, end: LbaT)
        -> Result<Option<(LbaT, LbaT)>>
    {
        self.find_run(zone, start, end, true).await
    }

    /// Find the first run of invalid blocks in `start..end`
    pub async fn first_invalid_run(&self, zone: ZoneT, start: LbaT, end: LbaT)
        -> Result<Option<(LbaT, LbaT)>>
    {
        self.find_run(zone, start, end, false).await
    }

    /// Count a zone's valid blocks directly from its bitmap.
    pub async fn count_valid(&self, zone: ZoneT) -> Result<LbaT> {
        let nr_blocks = self.layout.zone_nr_blocks;
        let mut count = 0;
        let mut block = 0;
        while block < nr_blocks {
            let (mblk, _) = self.layout.bitmap_block(zone, block);
            let mref = self.cache.get(mblk).await?;
            let nbits = (nr_blocks - block).min(BITS_PER_LBA) as usize;
            let data = mref.data();
            count += data[..nbits / 8].iter()
                .map(|b| LbaT::from(b.count_ones()))
                .sum::<LbaT>();
            count += (nbits / 8 * 8..nbits)
                .filter(|&bit| test_bit(&data, bit))
                .count() as LbaT;
            block += nbits as LbaT;
        }
        Ok(count)
    }

    /// Mark as valid in `dst` every block that is valid in `src`.
    pub async fn merge_valid(&self, src: ZoneT, dst: ZoneT) -> Result<LbaT> {
        let nr_blocks = self.layout.zone_nr_blocks;
        let mut merged = 0;
        let mut block = 0;
        while let Some((first, len)) =
            self.first_valid_run(src, block, nr_blocks).await?
        {
            merged += self.validate_blocks(dst, first, len).await?;
            block = first + len;
        }
        Ok(merged)
    }
}

// LCOV_EXCL_STOP
