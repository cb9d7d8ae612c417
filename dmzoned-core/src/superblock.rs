// vim: tw=80
//! On-disk metadata format

use byteorder::{ByteOrder, LittleEndian};
use crate::{
    types::*,
    util::*,
    zone::ZoneDirectory
};
use serde_derive::{Deserialize, Serialize};
use tracing::warn;

/*
 * On-disk Metadata Set Format (all blocks 4 KiB):
 *
 * Superblock   1 block     bincode-encoded Superblock, zero-padded
 * Mapping      variable    (dzone, bzone) pairs, little-endian u32 each,
 *                          512 per block, one per chunk
 * Bitmaps      variable    One bit per block of every zone, zone-major
 *
 * There are two identical sets.  Set 0 begins in the first random zone, and
 * set 1 begins nr_meta_zones zones later.
 *
 * Superblock Format:
 *
 * Magic:           4 bytes
 * Version:         4 bytes
 * Generation:      8 bytes
 * Self block:      8 bytes     LBA of this superblock
 * Meta blocks:     8 bytes     Total blocks in one set
 * Reserved seq:    4 bytes     Zones reserved for reclaim
 * Chunks:          4 bytes
 * Map blocks:      4 bytes
 * Bitmap blocks:   4 bytes
 * CRC:             4 bytes     CRC32C of the whole block with this field
 *                              zeroed, seeded with the generation
 * Pad:             variable
 */

/// The magic is "DZBD"
pub const MAGIC: u32 = (b'D' as u32) << 24 | (b'Z' as u32) << 16 |
                       (b'B' as u32) << 8 | b'D' as u32;
pub const META_VERSION: u32 = 1;
/// Offset of the CRC field within the encoded superblock
const CRC_OFFSET: usize = 48;
/// Number of redundant metadata sets
pub const SET_COUNT: usize = 2;
/// Chunk mapping entries per metadata block
pub const MAP_ENTRIES_PER_BLOCK: u32 = (BYTES_PER_LBA / 8) as u32;
/// Marks an unused half of a chunk mapping entry
pub const UNMAPPED: u32 = u32::MAX;

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Superblock {
    pub magic: u32,
    pub version: u32,
    pub gen: u64,
    pub sb_block: LbaT,
    pub nr_meta_blocks: u64,
    pub nr_reserved_seq: u32,
    pub nr_chunks: u32,
    pub nr_map_blocks: u32,
    pub nr_bitmap_blocks: u32,
    pub crc: u32,
}

impl Superblock {
    /// The CRC field holds a CRC-32C (Castagnoli) of the block, so this
    /// format is not interchangeable with an IEEE CRC-32 one.
    fn checksum(gen: u64, block: &[u8]) -> u32 {
        // The on-disk seed is only 32 bits wide
        crc32c::crc32c_append(gen as u32, block)
    }

    /// Decode and verify a superblock.
    pub fn from_block(block: &[u8]) -> Result<Self> {
        let sb: Superblock = bincode::deserialize(block)?;
        let mut copy = block.to_vec();
        LittleEndian::write_u32(&mut copy[CRC_OFFSET..CRC_OFFSET + 4], 0);
        if Self::checksum(sb.gen, &copy) != sb.crc {
            return Err(Error::EINTEGRITY);
        }
        if sb.magic != MAGIC {
            return Err(Error::EINVAL);
        }
        if sb.version != META_VERSION {
            warn!(version = sb.version, "Unsupported metadata version");
            return Err(Error::EINVAL);
        }
        Ok(sb)
    }

    /// Does this block even look like a superblock?
    pub fn has_magic(block: &[u8]) -> bool {
        LittleEndian::read_u32(&block[0..4]) == MAGIC
    }

    /// Encode into a full block, computing the checksum.
    pub fn to_block(&self) -> Result<Vec<u8>> {
        let mut block = vec![0u8; BYTES_PER_LBA];
        let sb = Superblock { crc: 0, ..self.clone() };
        bincode::serialize_into(&mut block[..], &sb)?;
        let crc = Self::checksum(self.gen, &block);
        LittleEndian::write_u32(&mut block[CRC_OFFSET..CRC_OFFSET + 4], crc);
        Ok(block)
    }
}

/// Geometry of the metadata, derived from the superblock and the zone
/// directory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Layout {
    pub zone_nr_blocks: LbaT,
    /// Bitmap blocks used by each zone
    pub zone_nr_bitmap_blocks: u64,
    pub nr_zones: u32,
    pub nr_map_blocks: u32,
    pub nr_bitmap_blocks: u32,
    /// Blocks in one metadata set, including the superblock
    pub nr_meta_blocks: MblkT,
    /// Zones used by one metadata set
    pub nr_meta_zones: u32,
    pub nr_reserved_seq: u32,
    pub nr_chunks: u32,
    /// LBA of the superblock of each set
    pub set_base: [LbaT; SET_COUNT],
}

impl Layout {
    fn zone_nr_bitmap_blocks(zone_nr_blocks: LbaT) -> u64 {
        div_roundup(zone_nr_blocks, BITS_PER_LBA)
    }

    /// Choose the geometry for a freshly formatted device.
    pub fn compute(dir: &ZoneDirectory, nr_reserved_seq: u32) -> Result<Self>
    {
        let zone_nr_blocks = dir.zone_nr_blocks();
        let zbb = Self::zone_nr_bitmap_blocks(zone_nr_blocks);
        let nr_zones = dir.nr_zones();
        let nr_bitmap_blocks = u32::try_from(u64::from(nr_zones) * zbb)
            .map_err(|_| Error::EFBIG)?;
        // Size the map for every usable zone, then shrink it once the real
        // chunk count is known.
        let map_blocks =
            div_roundup(dir.nr_useable(), MAP_ENTRIES_PER_BLOCK);
        let meta_blocks = 1 + u64::from(map_blocks) + u64::from(nr_bitmap_blocks);
        let meta_zones = div_roundup(meta_blocks, zone_nr_blocks) as u32;
        let overhead = 2 * meta_zones + nr_reserved_seq;
        if nr_reserved_seq == 0 || dir.nr_useable() <= overhead {
            warn!(useable = dir.nr_useable(), meta_zones, nr_reserved_seq,
                  "Not enough zones to format");
            return Err(Error::ENOSPC);
        }
        let nr_chunks = dir.nr_useable() - overhead;
        let nr_map_blocks = div_roundup(nr_chunks, MAP_ENTRIES_PER_BLOCK);
        let sb = Superblock {
            magic: MAGIC,
            version: META_VERSION,
            nr_meta_blocks: 1 + u64::from(nr_map_blocks) +
                u64::from(nr_bitmap_blocks),
            nr_reserved_seq,
            nr_chunks,
            nr_map_blocks,
            nr_bitmap_blocks,
            ..Default::default()
        };
        Self::from_superblock(&sb, dir)
    }

    /// Validate a superblock's geometry against the device.
    pub fn from_superblock(sb: &Superblock, dir: &ZoneDirectory)
        -> Result<Self>
    {
        let zone_nr_blocks = dir.zone_nr_blocks();
        let zbb = Self::zone_nr_bitmap_blocks(zone_nr_blocks);
        let nr_meta_zones = div_roundup(sb.nr_meta_blocks, zone_nr_blocks);
        if nr_meta_zones == 0 || nr_meta_zones >= u64::from(dir.nr_rnd()) {
            warn!(nr_meta_zones, nr_rnd = dir.nr_rnd(),
                  "Invalid number of metadata blocks");
            return Err(Error::ENXIO);
        }
        let nr_meta_zones = nr_meta_zones as u32;
        let useable = dir.nr_useable();
        if sb.nr_reserved_seq == 0 ||
            sb.nr_reserved_seq >= useable.saturating_sub(nr_meta_zones)
        {
            warn!(nr_reserved_seq = sb.nr_reserved_seq,
                  "Invalid number of reserved sequential zones");
            return Err(Error::ENXIO);
        }
        let max_chunks = useable
            .saturating_sub(2 * nr_meta_zones + sb.nr_reserved_seq);
        if sb.nr_chunks == 0 || sb.nr_chunks > max_chunks {
            warn!(nr_chunks = sb.nr_chunks, max_chunks,
                  "Invalid number of chunks");
            return Err(Error::ENXIO);
        }
        let nr_map_blocks = div_roundup(sb.nr_chunks, MAP_ENTRIES_PER_BLOCK);
        let nr_bitmap_blocks = u64::from(dir.nr_zones()) * zbb;
        if u64::from(sb.nr_map_blocks) != u64::from(nr_map_blocks) ||
            u64::from(sb.nr_bitmap_blocks) != nr_bitmap_blocks ||
            sb.nr_meta_blocks != 1 + u64::from(nr_map_blocks) + nr_bitmap_blocks
        {
            warn!(?sb, "Metadata block counts do not match the device");
            return Err(Error::ENXIO);
        }
        let base0 = dir.zone_start(dir.sb_zone());
        let base1 = base0 + u64::from(nr_meta_zones) * zone_nr_blocks;
        Ok(Layout {
            zone_nr_blocks,
            zone_nr_bitmap_blocks: zbb,
            nr_zones: dir.nr_zones(),
            nr_map_blocks,
            nr_bitmap_blocks: nr_bitmap_blocks as u32,
            nr_meta_blocks: sb.nr_meta_blocks,
            nr_meta_zones,
            nr_reserved_seq: sb.nr_reserved_seq,
            nr_chunks: sb.nr_chunks,
            set_base: [base0, base1]
        })
    }

    /// Build the superblock for a metadata set
    pub fn superblock(&self, set: usize, gen: u64) -> Superblock {
        Superblock {
            magic: MAGIC,
            version: META_VERSION,
            gen,
            sb_block: self.set_base[set],
            nr_meta_blocks: self.nr_meta_blocks,
            nr_reserved_seq: self.nr_reserved_seq,
            nr_chunks: self.nr_chunks,
            nr_map_blocks: self.nr_map_blocks,
            nr_bitmap_blocks: self.nr_bitmap_blocks,
            crc: 0
        }
    }

    /// Metadata block holding a chunk's mapping entry, and the entry's index
    /// within it.
    pub fn map_block(&self, chunk: ChunkT) -> (MblkT, usize) {
        (1 + MblkT::from(chunk / MAP_ENTRIES_PER_BLOCK),
         (chunk % MAP_ENTRIES_PER_BLOCK) as usize)
    }

    /// Metadata block holding the validity bit of `block` within `zone`,
    /// and the bit's index within it.
    pub fn bitmap_block(&self, zone: ZoneT, block: LbaT) -> (MblkT, usize) {
        let mblk = 1 + MblkT::from(self.nr_map_blocks) +
            u64::from(zone) * self.zone_nr_bitmap_blocks + block / BITS_PER_LBA;
        (mblk, (block % BITS_PER_LBA) as usize)
    }

    /// Maximum number of resident metadata blocks in the cache
    pub fn cache_max(&self) -> usize {
        2 + self.nr_map_blocks as usize + 64 * self.zone_nr_bitmap_blocks as usize
    }
}

// LCOV_EXCL_STOP
