use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};
use thiserror::Error;

use crate::alloc::{Bitmap, BlockAllocator};
use crate::io::BlockStorage;
use crate::node::{Attr, FileKind, Inode, DIRECT_CAP, IPB, NDIRECT, NODE_SIZE};
use crate::sb::SuperBlock;
use crate::BLOCK_SIZE;

/// Inode number of the root directory, allocated once at format time.
/// Inode number 0 is never used.
pub const ROOT_INUM: u32 = 1;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("inode {0} does not exist")]
    NotFound(u32),
    #[error("not enough free space to satisfy request")]
    OutOfSpace,
    #[error("system clock unavailable")]
    ClockUnavailable,
    #[error("invalid file system layout: {0}")]
    InvalidLayout(&'static str),
    #[error("block device i/o failed")]
    Device(#[from] std::io::Error),
}

/// The storage engine: a free-space bitmap allocator and an inode table over
/// a block device, mapping each file's byte stream onto direct blocks plus a
/// continuation-inode chain for the overflow.
///
/// # Layout
/// ===========================================================
/// | SuperBlock | Free-block bitmap | Inode table | Data      |
/// ===========================================================
///
/// The engine assumes a single caller; the upstream layer serializes
/// requests. Every operation runs to completion synchronously.
pub struct ExtentFs<T: BlockStorage> {
    dev: T,
    sb: SuperBlock,
    alloc: BlockAllocator,
    /// Monotonic inode-number counter. Numbers are never recycled, which
    /// bounds total file creations over the filesystem's lifetime to
    /// `ninodes`.
    last_inum: u32,
}

impl<T: BlockStorage> ExtentFs<T> {
    /// Formats the device and mounts the fresh filesystem. All blocks
    /// belonging to the superblock, bitmap, and inode-table regions are
    /// marked allocated and never freed; the root directory is created as
    /// inode [`ROOT_INUM`].
    pub fn format(mut dev: T, nblocks: u32, ninodes: u32) -> Result<Self, FsError> {
        let sb = SuperBlock::new(nblocks, ninodes);
        if sb.bitmap_blocks() > 1 {
            return Err(FsError::InvalidLayout(
                "block count exceeds single-bitmap capacity",
            ));
        }
        if ninodes < 2 {
            return Err(FsError::InvalidLayout("inode table too small for root"));
        }
        if sb.data_start() as u32 >= nblocks {
            return Err(FsError::InvalidLayout(
                "device too small for reserved regions",
            ));
        }

        let mut block_buf = [0_u8; BLOCK_SIZE];
        block_buf[..16].copy_from_slice(&sb.serialize());
        dev.write_block(0, &block_buf)?;

        let alloc = BlockAllocator::format(nblocks, sb.data_start() as u32);
        dev.write_block(sb.bitmap_start(), alloc.map().serialize())?;

        let zero = [0_u8; BLOCK_SIZE];
        for blocknr in sb.inode_start()..sb.data_start() {
            dev.write_block(blocknr, &zero)?;
        }

        let mut fs = ExtentFs {
            dev,
            sb,
            alloc,
            last_inum: 0,
        };
        let root = fs.allocate_inode(FileKind::Dir)?;
        debug_assert_eq!(root, ROOT_INUM);
        fs.dev.sync_disk()?;
        info!("formatted device: {} blocks, {} inodes", nblocks, ninodes);
        Ok(fs)
    }

    /// Mounts an already-formatted device: re-reads the superblock and the
    /// free-block bitmap, and recovers the inode counter by scanning the
    /// table for the highest live slot.
    pub fn open(mut dev: T) -> Result<Self, FsError> {
        let mut block_buf = [0_u8; BLOCK_SIZE];
        dev.read_block(0, &mut block_buf)?;
        let sb = SuperBlock::parse(&block_buf)?;

        dev.read_block(sb.bitmap_start(), &mut block_buf)?;
        let map = Bitmap::parse(&block_buf);
        let alloc = BlockAllocator::open(map, sb.nblocks, sb.data_start() as u32);

        let mut last_inum = 0;
        for blocknr in sb.inode_start()..sb.data_start() {
            dev.read_block(blocknr, &mut block_buf)?;
            let base = (blocknr - sb.inode_start()) * IPB;
            for slot in 0..IPB {
                let inum = (base + slot) as u32;
                if inum >= sb.ninodes {
                    break;
                }
                let ino = Inode::parse(&block_buf[slot * NODE_SIZE..]);
                if !ino.is_free() && inum > last_inum {
                    last_inum = inum;
                }
            }
        }
        if last_inum == 0 {
            return Err(FsError::InvalidLayout("root inode missing"));
        }

        info!(
            "mounted device: {} blocks, {} inodes, last inum {}",
            sb.nblocks, sb.ninodes, last_inum
        );
        Ok(ExtentFs {
            dev,
            sb,
            alloc,
            last_inum,
        })
    }

    /// Creates a fresh inode of the given kind and returns its number. The
    /// record is persisted before the number is handed out.
    pub fn allocate_inode(&mut self, kind: FileKind) -> Result<u32, FsError> {
        let now = unix_now()?;
        if self.last_inum + 1 >= self.sb.ninodes {
            return Err(FsError::OutOfSpace);
        }
        self.last_inum += 1;
        let inum = self.last_inum;

        let ino = Inode::new(kind, now);
        self.put_inode(inum, &ino)?;
        debug!("alloc_inode {} ({:?})", inum, kind);
        Ok(inum)
    }

    /// Releases an inode: its continuation chain first, then every direct
    /// data block, then the record itself is cleared on disk. Freeing a slot
    /// that is already clear is a safe no-op.
    pub fn free_inode(&mut self, inum: u32) -> Result<(), FsError> {
        let ino = match self.get_inode(inum) {
            Ok(ino) => ino,
            Err(FsError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        if let Some(next) = ino.chain() {
            self.free_inode(next)?;
        }
        for &blocknr in ino.direct() {
            self.alloc.free(blocknr);
        }
        self.put_inode(inum, &Inode::empty())?;
        self.sync_alloc()?;
        debug!("free_inode {}", inum);
        Ok(())
    }

    /// Returns an independent copy of the inode record, or `NotFound` when
    /// the number is out of range or the slot is clear.
    pub fn get_inode(&mut self, inum: u32) -> Result<Inode, FsError> {
        if inum >= self.sb.ninodes {
            debug!("get_inode {}: out of range", inum);
            return Err(FsError::NotFound(inum));
        }

        let mut block_buf = [0_u8; BLOCK_SIZE];
        self.dev.read_block(self.sb.iblock(inum), &mut block_buf)?;
        let ino = Inode::parse(&block_buf[Inode::slot_offset(inum)..]);
        if ino.is_free() {
            debug!("get_inode {}: slot clear", inum);
            return Err(FsError::NotFound(inum));
        }
        Ok(ino)
    }

    /// Overwrites the inode's table slot with the given record.
    pub fn put_inode(&mut self, inum: u32, ino: &Inode) -> Result<(), FsError> {
        if inum >= self.sb.ninodes {
            return Err(FsError::NotFound(inum));
        }

        let blocknr = self.sb.iblock(inum);
        let mut block_buf = [0_u8; BLOCK_SIZE];
        self.dev.read_block(blocknr, &mut block_buf)?;
        let offset = Inode::slot_offset(inum);
        block_buf[offset..offset + NODE_SIZE].copy_from_slice(ino.serialize());
        self.dev.write_block(blocknr, &block_buf)?;
        debug!("put_inode {}", inum);
        Ok(())
    }

    /// Projection of the inode's metadata.
    pub fn getattr(&mut self, inum: u32) -> Result<Attr, FsError> {
        let ino = self.get_inode(inum)?;
        let kind = ino
            .kind()
            .ok_or(FsError::InvalidLayout("unknown inode kind"))?;
        Ok(Attr {
            size: ino.size,
            atime: ino.atime,
            mtime: ino.mtime,
            ctime: ino.ctime,
            kind,
        })
    }

    /// Reads the whole file back: walks the direct slots of each record in
    /// the chain in order and trims the final block's padding to the logical
    /// size. An inode holding no blocks reads as empty.
    pub fn read_file(&mut self, inum: u32) -> Result<Vec<u8>, FsError> {
        let mut top = self.get_inode(inum)?;
        let size = top.size as usize;

        let mut out = Vec::with_capacity(size);
        let mut node = top;
        let mut block_buf = [0_u8; BLOCK_SIZE];
        loop {
            for &blocknr in node.direct() {
                self.dev.read_block(blocknr as usize, &mut block_buf)?;
                out.extend_from_slice(&block_buf);
            }
            match node.chain() {
                Some(next) => node = self.get_inode(next)?,
                None => break,
            }
        }
        out.truncate(size);

        top.atime = unix_now()?;
        self.put_inode(inum, &top)?;
        debug!("read_file {}: {} bytes", inum, size);
        Ok(out)
    }

    /// Replaces the file's content with `data`. Prior content is released
    /// first; a write never appends. When the payload needs more blocks than
    /// remain free (or more continuation records than the table has slots),
    /// the write is refused up front and the inode and free-block accounting
    /// are left exactly as they were.
    pub fn write_file(&mut self, inum: u32, data: &[u8]) -> Result<(), FsError> {
        let mut ino = self.get_inode(inum)?;

        let need = blocks_for(data.len());
        let owned = self.owned_blocks(&ino)?;
        if need > self.alloc.free_count() + owned {
            return Err(FsError::OutOfSpace);
        }
        // Continuation records consume inode numbers too.
        let chains = if need > NDIRECT as u32 {
            (need - NDIRECT as u32 + NDIRECT as u32 - 1) / NDIRECT as u32
        } else {
            0
        };
        if self.last_inum + chains >= self.sb.ninodes {
            return Err(FsError::OutOfSpace);
        }

        self.release_content(&mut ino)?;
        self.write_segment(inum, ino, data)?;
        self.sync_alloc()?;
        debug!("write_file {}: {} bytes in {} blocks", inum, data.len(), need);
        Ok(())
    }

    /// Removes the file: the record, its continuation chain, and every data
    /// block return to the free pool. The inode number itself is not reused.
    pub fn remove_file(&mut self, inum: u32) -> Result<(), FsError> {
        debug!("remove_file {}", inum);
        self.free_inode(inum)
    }

    /// Free blocks remaining on the device.
    pub fn free_blocks(&self) -> u32 {
        self.alloc.free_count()
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    /// Writes one chain segment: up to `NDIRECT` freshly-allocated data
    /// blocks, recursing into a new continuation inode for the remainder.
    /// Callers have already verified the block and inode budgets.
    fn write_segment(&mut self, inum: u32, mut ino: Inode, data: &[u8]) -> Result<(), FsError> {
        let need = blocks_for(data.len()) as usize;
        let direct = need.min(NDIRECT);

        for (slot, chunk) in data.chunks(BLOCK_SIZE).take(direct).enumerate() {
            let blocknr = self.alloc.allocate().ok_or(FsError::OutOfSpace)?;
            let mut block_buf = [0_u8; BLOCK_SIZE];
            block_buf[..chunk.len()].copy_from_slice(chunk);
            self.dev.write_block(blocknr as usize, &block_buf)?;
            ino.blocks[slot] = blocknr;
        }

        if need > NDIRECT {
            let cont = self.allocate_inode(FileKind::File)?;
            let cont_ino = self.get_inode(cont)?;
            self.write_segment(cont, cont_ino, &data[NDIRECT * BLOCK_SIZE..])?;
            ino.blocks[NDIRECT] = cont;
            ino.used_blocks = DIRECT_CAP as u32;
        } else {
            ino.used_blocks = need as u32;
        }

        ino.size = data.len() as u32;
        let now = unix_now()?;
        ino.mtime = now;
        ino.ctime = now;
        self.put_inode(inum, &ino)
    }

    /// Frees everything the inode references, leaving the record itself live
    /// but empty. Used by `write_file` to drop prior content.
    fn release_content(&mut self, ino: &mut Inode) -> Result<(), FsError> {
        if let Some(next) = ino.chain() {
            self.free_inode(next)?;
        }
        for &blocknr in ino.direct() {
            self.alloc.free(blocknr);
        }
        ino.blocks = [0; DIRECT_CAP];
        ino.used_blocks = 0;
        ino.size = 0;
        Ok(())
    }

    /// Data blocks currently owned by the inode, across its whole chain.
    fn owned_blocks(&mut self, ino: &Inode) -> Result<u32, FsError> {
        let mut total = 0_u32;
        let mut node = *ino;
        loop {
            total += node.direct().len() as u32;
            match node.chain() {
                Some(next) => node = self.get_inode(next)?,
                None => break,
            }
        }
        Ok(total)
    }

    /// Persists the free-block bitmap to its disk block.
    fn sync_alloc(&mut self) -> Result<(), FsError> {
        self.dev
            .write_block(self.sb.bitmap_start(), self.alloc.map().serialize())?;
        Ok(())
    }
}

fn blocks_for(len: usize) -> u32 {
    ((len + BLOCK_SIZE - 1) / BLOCK_SIZE) as u32
}

fn unix_now() -> Result<u32, FsError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .map_err(|_| FsError::ClockUnavailable)
}
