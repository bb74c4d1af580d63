//! A user-space FAT12/16/32 filesystem core.
//!
//! This crate implements the on-disk format and filesystem operations of
//! FAT12, FAT16, and FAT32 — the block device and sector cache, the BIOS
//! Parameter Block, the FAT chain engine, 8.3/VFAT long-name codecs,
//! directory entry traversal, and the inode and mount lifecycle built on top
//! of them. It does not itself speak FUSE, NBD, or any other adapter
//! protocol: an adapter crate serializes calls into [`fs::FileSystem`] one
//! at a time (see [`fs`]'s module docs for the concurrency model this
//! assumes).
//!
//! Grounded on the teacher's `lib.rs` (shared constants: `ATTR_*`,
//! `DIRENT_SIZE`, the cluster sentinel values), generalized from FAT32-only
//! sentinels to the per-[`bpb::FatType`] values in [`bpb::FatType`] itself,
//! since FAT12/16 end-of-chain and bad-cluster markers differ in width.

pub mod bpb;
pub mod config;
pub mod device;
pub mod dir;
pub mod error;
pub mod fat;
pub mod fs;
pub mod inode;
pub mod name;
pub mod time;

pub use error::{FatError, Result};

use bitflags::bitflags;

bitflags! {
    /// The `DIR_Attr` byte of a short directory entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileAttr: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN    = 0x02;
        const SYSTEM    = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE   = 0x20;
        /// `READ_ONLY | HIDDEN | SYSTEM | VOLUME_ID`: the "this is actually
        /// a long-name entry" sentinel attribute byte.
        const LONG_NAME = Self::READ_ONLY.bits() | Self::HIDDEN.bits() | Self::SYSTEM.bits() | Self::VOLUME_ID.bits();
    }
}

/// Size in bytes of every on-disk directory entry, short or long.
pub const DIRENT_SIZE: usize = 32;

/// Unicode characters held by one long-name directory entry.
pub const LFN_CHARS_PER_ENTRY: usize = 13;

/// `DIR_Name[0]` marking a deleted (but reusable) slot.
pub const DIR_ENTRY_DELETED: u8 = 0xE5;

/// `DIR_Name[0]` marking the first unused slot, and a promise that every
/// slot after it in the directory is unused too.
pub const DIR_ENTRY_END: u8 = 0x00;

/// Mask OR'd into a long entry's ordinal to mark it the first (highest
/// address, i.e. logically last-written) entry in its set.
pub const LAST_LONG_ENTRY: u8 = 0x40;
