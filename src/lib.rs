//! A minimal block-addressable storage engine: a free-space bitmap allocator
//! and an inode table mapping logical byte streams onto fixed-size blocks,
//! with continuation-inode chaining for files that outgrow the direct slots.
//!
//! The engine is the persistence core an upper file-service layer delegates
//! to; it owns the on-disk layout and talks to the raw device only through
//! the [`io::BlockStorage`] trait.

mod alloc;
mod node;
mod sb;

pub mod fs;
pub mod io;

pub use crate::fs::{ExtentFs, FsError, ROOT_INUM};
pub use crate::node::{Attr, FileKind, Inode, Slot, DIRECT_CAP, NDIRECT};
pub use crate::sb::SuperBlock;

/// Filesystem block size in bytes. The device emulator, the bitmap, and all
/// region arithmetic assume this granularity.
pub const BLOCK_SIZE: usize = 4096;
