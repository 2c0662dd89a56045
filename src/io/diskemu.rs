use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};
use std::path::Path;

use crate::io::{BlockNumber, BlockStorage};
use crate::BLOCK_SIZE;

/// Emulates block disk/flash storage in userspace using a file as block
/// storage. This is only meant to be used for file system development and
/// testing.
pub struct FileBlockEmulator {
    /// The file must be a fixed-size file some exact multiple of the size of
    /// a block.
    fd: File,
    /// The total number of blocks available in the file store.
    block_count: usize,
}

impl FileBlockEmulator {
    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }
}

impl BlockStorage for FileBlockEmulator {
    fn open_disk<P: AsRef<Path>>(dest: P, nblocks: usize) -> std::io::Result<Self> {
        // Return an error if the file does not exist rather than create one.
        let fd = OpenOptions::new().read(true).write(true).open(dest)?;
        Ok(FileBlockEmulator {
            fd,
            block_count: nblocks,
        })
    }

    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        if blocknr >= self.block_count {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block out of range",
            ));
        }
        if buf.len() < BLOCK_SIZE {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read block",
            ));
        }

        self.fd
            .seek(SeekFrom::Start((blocknr * BLOCK_SIZE) as u64))?;
        self.fd.read_exact(&mut buf[0..BLOCK_SIZE])?;
        Ok(())
    }

    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        if blocknr >= self.block_count {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block out of range",
            ));
        }

        self.fd
            .seek(SeekFrom::Start((blocknr * BLOCK_SIZE) as u64))?;
        // Truncate writes that exceed the block size.
        let max = BLOCK_SIZE.min(buf.len());
        self.fd.write_all(&buf[0..max])?;
        Ok(())
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()?;
        Ok(())
    }
}

pub struct FileBlockEmulatorBuilder {
    fd: File,
    block_count: usize,
    clear_medium: bool,
}

impl From<File> for FileBlockEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileBlockEmulatorBuilder {
            fd,
            // A better default here might be the size of the file rounded
            // down to the nearest block.
            block_count: 0,
            clear_medium: true,
        }
    }
}

impl FileBlockEmulatorBuilder {
    /// Sets the number of desired blocks in the block store device.
    pub fn with_block_size(mut self, blocks: usize) -> Self {
        self.block_count = blocks;
        self
    }

    /// Whether to zero the backing file before use. Disable when reopening a
    /// medium that already carries a formatted filesystem.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear_medium = clear;
        self
    }

    /// This builder assumes ownership of the file descriptor used and does
    /// destructive things to prepare the file for use. Additionally,
    /// ownership of the file is transferred to the emulator meaning this
    /// builder can only be used to create one emulator.
    pub fn build(mut self) -> std::io::Result<FileBlockEmulator> {
        debug_assert!(self.block_count > 0);
        if self.clear_medium {
            self.zero_medium()?;
        }
        Ok(FileBlockEmulator {
            fd: self.fd,
            block_count: self.block_count,
        })
    }

    fn zero_medium(&mut self) -> std::io::Result<()> {
        let mut bfd = BufWriter::new(&self.fd);
        // Zero out the "disk" blocks, buffering each write to prevent
        // excessive syscalls.
        for _ in 0..self.block_count {
            bfd.write_all(vec![0x00; BLOCK_SIZE].as_slice())?;
        }
        bfd.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emulator(blocks: usize) -> FileBlockEmulator {
        let fs_block = tempfile::tempfile().unwrap();
        FileBlockEmulatorBuilder::from(fs_block)
            .with_block_size(blocks)
            .build()
            .expect("failed to allocate file block")
    }

    #[test]
    fn file_emulator_allocates_correct_num_bytes() {
        let mut disk_emu = emulator(4);
        disk_emu.sync_disk().unwrap();
        assert_eq!(
            disk_emu.into_file().metadata().unwrap().len(),
            (4 * BLOCK_SIZE) as u64
        );
    }

    #[test]
    fn can_read_and_write_blocks() {
        let mut disk_emu = emulator(4);

        let block = vec![0x55; BLOCK_SIZE];
        disk_emu.write_block(2, &block).unwrap();
        disk_emu.sync_disk().unwrap();

        // A block that was never written reads back zeroed.
        let mut read_block = vec![0x00; BLOCK_SIZE];
        disk_emu.read_block(3, read_block.as_mut_slice()).unwrap();
        assert_eq!(read_block, vec![0x00; BLOCK_SIZE]);

        let mut filled_block = vec![0x00; BLOCK_SIZE];
        disk_emu.read_block(2, filled_block.as_mut_slice()).unwrap();
        assert_eq!(filled_block, vec![0x55; BLOCK_SIZE]);
    }

    #[test]
    fn can_read_and_write_start_and_end_blocks() {
        let mut disk_emu = emulator(2);

        for blocknr in &[0, 1] {
            let block = vec![0x55; BLOCK_SIZE];
            disk_emu.write_block(*blocknr, &block).unwrap();
            disk_emu.sync_disk().unwrap();

            let mut read_block = vec![0x00; BLOCK_SIZE];
            disk_emu
                .read_block(*blocknr, read_block.as_mut_slice())
                .unwrap();
            assert_eq!(read_block, vec![0x55; BLOCK_SIZE]);
        }
    }

    #[test]
    fn block_access_beyond_range_returns_error() {
        let mut disk_emu = emulator(1);

        let block = vec![0x55; BLOCK_SIZE];
        assert!(disk_emu.write_block(1, &block).is_err());

        let mut read_block = vec![0x00; BLOCK_SIZE];
        assert!(disk_emu.read_block(1, read_block.as_mut_slice()).is_err());
    }

    #[test]
    fn writing_partial_buffer_leaves_block_tail_intact() {
        let mut disk_emu = emulator(1);

        // Fill half the block with meaningful data.
        let half = vec![0x55; BLOCK_SIZE / 2];
        disk_emu.write_block(0, &half).unwrap();
        disk_emu.sync_disk().unwrap();

        let mut read_block = vec![0xff; BLOCK_SIZE];
        disk_emu.read_block(0, read_block.as_mut_slice()).unwrap();
        assert_eq!(&read_block[0..BLOCK_SIZE / 2], half.as_slice());
        assert_eq!(&read_block[BLOCK_SIZE / 2..], &vec![0x00; BLOCK_SIZE / 2][..]);
    }
}
