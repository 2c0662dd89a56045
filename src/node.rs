use zerocopy::{AsBytes, FromBytes};

use crate::BLOCK_SIZE;

/// On-disk footprint of one inode record.
pub const NODE_SIZE: usize = 256;

/// Inodes packed per table block.
pub const IPB: usize = BLOCK_SIZE / NODE_SIZE;

/// Block slots carried by one inode record.
pub const DIRECT_CAP: usize = 15;

/// Direct data blocks per record; the final slot is reserved for the
/// continuation-inode number once a file outgrows the direct capacity.
pub const NDIRECT: usize = DIRECT_CAP - 1;

/// What an inode describes. On disk the kind is a `u32` code where `0` marks
/// the slot free, so a free slot has no `FileKind` at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Dir,
    File,
}

impl FileKind {
    pub fn code(self) -> u32 {
        match self {
            FileKind::Dir => 1,
            FileKind::File => 2,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(FileKind::Dir),
            2 => Some(FileKind::File),
            _ => None,
        }
    }
}

/// Metadata projection returned by `getattr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub size: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub kind: FileKind,
}

/// Tagged view of one entry in an inode's block-slot array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// A data block holding file bytes.
    Data(u32),
    /// The inode number of the continuation record holding the overflow.
    Chain(u32),
}

#[repr(C)]
#[derive(AsBytes, FromBytes, Copy, Clone)]
/// On-disk inode record. __Must not exceed 256 bytes.__
pub struct Inode {
    /// File kind code; `0` marks the slot free.
    pub ftype: u32,
    /// Logical byte length of the file, independent of block granularity.
    pub size: u32,
    /// Last access, seconds since epoch.
    pub atime: u32,
    /// Last status change, seconds since epoch.
    pub ctime: u32,
    /// Last content change, seconds since epoch.
    pub mtime: u32,
    /// Direct blocks held, plus one when the final slot chains onward.
    pub used_blocks: u32,
    /// Data block ids in slot order. Once the file exceeds `NDIRECT` blocks
    /// the final slot holds a continuation inode number instead.
    pub blocks: [u32; DIRECT_CAP],
    /// Reserved up to the 256-byte record limit.
    padding: [u32; 43],
}

impl Inode {
    /// A live record with fresh timestamps and no content.
    pub fn new(kind: FileKind, now: u32) -> Self {
        Self {
            ftype: kind.code(),
            size: 0,
            atime: now,
            ctime: now,
            mtime: now,
            used_blocks: 0,
            blocks: [0; DIRECT_CAP],
            padding: [0; 43],
        }
    }

    /// The cleared record written back when an inode is freed.
    pub fn empty() -> Self {
        Self {
            ftype: 0,
            size: 0,
            atime: 0,
            ctime: 0,
            mtime: 0,
            used_blocks: 0,
            blocks: [0; DIRECT_CAP],
            padding: [0; 43],
        }
    }

    pub fn is_free(&self) -> bool {
        self.ftype == 0
    }

    pub fn kind(&self) -> Option<FileKind> {
        FileKind::from_code(self.ftype)
    }

    /// Direct data blocks referenced by this record, in slot order.
    pub fn direct(&self) -> &[u32] {
        let count = (self.used_blocks as usize).min(NDIRECT);
        &self.blocks[..count]
    }

    /// Continuation inode number, when the file outgrew the direct slots.
    pub fn chain(&self) -> Option<u32> {
        if self.used_blocks as usize > NDIRECT {
            Some(self.blocks[NDIRECT])
        } else {
            None
        }
    }

    /// The slot array with every entry tagged as data or chain.
    pub fn slots(&self) -> Vec<Slot> {
        let mut slots: Vec<Slot> = self.direct().iter().map(|&b| Slot::Data(b)).collect();
        if let Some(inum) = self.chain() {
            slots.push(Slot::Chain(inum));
        }
        slots
    }

    /// Decodes one record from its table slot.
    pub fn parse(buf: &[u8]) -> Self {
        assert!(
            buf.len() >= NODE_SIZE,
            "inode buffer must span a whole slot"
        );
        unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const Inode) }
    }

    pub fn serialize(&self) -> &[u8] {
        self.as_bytes()
    }

    /// Byte offset of the slot for `inum` within its table block.
    pub fn slot_offset(inum: u32) -> usize {
        (inum as usize % IPB) * NODE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_fits_its_table_slot_exactly() {
        assert_eq!(std::mem::size_of::<Inode>(), NODE_SIZE);
    }

    #[test]
    fn can_serialize_and_parse_records() {
        let mut ino = Inode::new(FileKind::File, 1000);
        ino.size = 4242;
        ino.used_blocks = 2;
        ino.blocks[0] = 20;
        ino.blocks[1] = 21;

        let parsed = Inode::parse(ino.serialize());
        assert_eq!(parsed.ftype, FileKind::File.code());
        assert_eq!(parsed.size, 4242);
        assert_eq!(parsed.atime, 1000);
        assert_eq!(parsed.direct(), &[20, 21]);
        assert_eq!(parsed.chain(), None);
    }

    #[test]
    fn zeroed_slot_parses_as_free() {
        let buf = [0_u8; NODE_SIZE];
        let ino = Inode::parse(&buf);
        assert!(ino.is_free());
        assert_eq!(ino.kind(), None);
    }

    #[test]
    fn slots_tag_the_final_entry_as_chain_past_direct_capacity() {
        let mut ino = Inode::new(FileKind::File, 0);
        for slot in 0..NDIRECT {
            ino.blocks[slot] = 100 + slot as u32;
        }

        // Exactly NDIRECT blocks: all data, no chain.
        ino.used_blocks = NDIRECT as u32;
        assert_eq!(ino.direct().len(), NDIRECT);
        assert_eq!(ino.chain(), None);

        // One past: the final slot is a continuation reference.
        ino.used_blocks = DIRECT_CAP as u32;
        ino.blocks[NDIRECT] = 7;
        assert_eq!(ino.direct().len(), NDIRECT);
        assert_eq!(ino.chain(), Some(7));
        assert_eq!(ino.slots().last(), Some(&Slot::Chain(7)));
    }

    #[test]
    fn slot_offsets_pack_ipb_records_per_block() {
        assert_eq!(Inode::slot_offset(0), 0);
        assert_eq!(Inode::slot_offset(1), NODE_SIZE);
        assert_eq!(Inode::slot_offset(IPB as u32), 0);
        assert_eq!(Inode::slot_offset(IPB as u32 + 3), 3 * NODE_SIZE);
    }
}
