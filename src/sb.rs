use std::convert::TryInto;

use crate::fs::FsError;
use crate::node::IPB;
use crate::BLOCK_SIZE;

pub const SB_MAGIC: u32 = 0x4546_5342; // EFSB

/// Bits tracked by one bitmap block.
const BITS_PER_BLOCK: u32 = (BLOCK_SIZE * 8) as u32;

/// Encoded length of the superblock fields within block 0.
const SB_ENCODED_LEN: usize = 16;

/// The first block of the disk, written once at format time and read-only
/// afterwards. It pins the geometry every other region is computed from:
///
/// ```text
/// | SuperBlock | Free-block bitmap | Inode table | Data region |
/// ```
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct SuperBlock {
    /// A 32-bit identifying string, in this case EFSB.
    pub sb_magic: u32,
    /// Total formatted capacity in bytes (`nblocks * BLOCK_SIZE`).
    pub size: u32,
    /// Number of addressable blocks on the device.
    pub nblocks: u32,
    /// Number of slots in the inode table.
    pub ninodes: u32,
}

impl SuperBlock {
    pub fn new(nblocks: u32, ninodes: u32) -> Self {
        Self {
            sb_magic: SB_MAGIC,
            size: nblocks * BLOCK_SIZE as u32,
            nblocks,
            ninodes,
        }
    }

    /// Decodes the superblock from the contents of block 0. The encoding is
    /// a series of struct fields with big endian alignment.
    pub fn parse(buf: &[u8]) -> Result<Self, FsError> {
        if buf.len() < SB_ENCODED_LEN {
            return Err(FsError::InvalidLayout("superblock truncated"));
        }

        let read_magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if read_magic != SB_MAGIC {
            return Err(FsError::InvalidLayout("superblock magic mismatch"));
        }

        Ok(Self {
            sb_magic: read_magic,
            size: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            nblocks: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            ninodes: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
        })
    }

    /// Serializes the superblock fields for writing into block 0. The caller
    /// copies the result into a zeroed block buffer.
    pub fn serialize(&self) -> [u8; SB_ENCODED_LEN] {
        let mut encoded = [0_u8; SB_ENCODED_LEN];
        encoded[0..4].copy_from_slice(&self.sb_magic.to_be_bytes());
        encoded[4..8].copy_from_slice(&self.size.to_be_bytes());
        encoded[8..12].copy_from_slice(&self.nblocks.to_be_bytes());
        encoded[12..16].copy_from_slice(&self.ninodes.to_be_bytes());
        encoded
    }

    /// First block of the free-block bitmap.
    pub fn bitmap_start(&self) -> usize {
        1
    }

    /// Blocks occupied by the free-block bitmap.
    pub fn bitmap_blocks(&self) -> usize {
        ((self.nblocks + BITS_PER_BLOCK - 1) / BITS_PER_BLOCK) as usize
    }

    /// First block of the inode table.
    pub fn inode_start(&self) -> usize {
        self.bitmap_start() + self.bitmap_blocks()
    }

    /// Blocks occupied by the inode table.
    pub fn inode_blocks(&self) -> usize {
        (self.ninodes as usize + IPB - 1) / IPB
    }

    /// First data block; every block below this is statically reserved and
    /// marked allocated at format time.
    pub fn data_start(&self) -> usize {
        self.inode_start() + self.inode_blocks()
    }

    /// The inode-table block owning the slot for `inum`.
    pub fn iblock(&self, inum: u32) -> usize {
        self.inode_start() + inum as usize / IPB
    }
}
