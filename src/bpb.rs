//! BIOS Parameter Block and FSInfo (spec.md §4.C, component C).
//!
//! Grounded on the teacher's `bpb.rs` (`BIOSParameterBlock`, `BasicBPB`,
//! `BPB32`, `FSInfo`, `fat_type()`, `offset()`, `first_data_sector()`), which
//! the teacher itself documents as FAT32-only ("we don't need to care about
//! fat12 and fat16... but we still reserve the fields... for future
//! maybe" — see its module doc comment and the unused `BPB12_16` struct).
//! This module is that "future maybe": full FAT12/16/32 classification and
//! validation.
//!
//! The teacher overlays `#[repr(packed)]` structs directly onto the sector
//! buffer and reads through raw pointers — a pattern its own comments flag
//! as capable of "unpredictable results" on misaligned access. We instead
//! parse fields out of the raw byte slice with `from_le_bytes`, which is the
//! same information with no unsafe code, and additionally lets one function
//! handle all three FAT flavors' differing tail layout.

use log::warn;

use crate::error::{FatError, Result};

/// Which of the three on-disk FAT flavors a volume is, determined solely by
/// its cluster count (spec.md §4.C), never by a label or marketing string
/// in the boot sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    /// End-of-chain sentinel (bottom bits set, top nibble reserved on
    /// FAT32) used when terminating a cluster chain.
    pub fn eoc_marker(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FFF,
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFFFFFF,
        }
    }

    /// The bad-cluster sentinel value.
    pub fn bad_cluster_marker(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FF7,
            FatType::Fat16 => 0xFFF7,
            FatType::Fat32 => 0x0FFFFFF7,
        }
    }

    /// True once a raw FAT entry value (already masked to this type's
    /// width) should be treated as "end of chain" — Microsoft's drivers
    /// accept any value >= the marker, not just the canonical one.
    pub fn is_eoc(self, raw: u32) -> bool {
        raw >= match self {
            FatType::Fat12 => 0x0FF8,
            FatType::Fat16 => 0xFFF8,
            FatType::Fat32 => 0x0FFFFFF8,
        }
    }

    pub fn is_bad(self, raw: u32) -> bool {
        raw == self.bad_cluster_marker()
    }

    /// Bits used per FAT entry.
    pub fn entry_bits(self) -> u32 {
        match self {
            FatType::Fat12 => 12,
            FatType::Fat16 => 16,
            FatType::Fat32 => 28,
        }
    }
}

/// A parsed and validated BIOS Parameter Block, FAT-type-agnostic.
#[derive(Debug, Clone)]
pub struct Bpb {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sector_count: u16,
    pub num_fats: u8,
    pub root_entry_count: u16,
    pub total_sectors: u32,
    pub fat_size_sectors: u32,
    pub media: u8,
    /// FAT32 only; 0 for FAT12/16 (root is a fixed region, not a chain).
    pub root_cluster: u32,
    /// FAT32 only FSInfo sector number; `None` for FAT12/16.
    pub fs_info_sector: Option<u16>,
    pub volume_label: [u8; 11],
}

impl Bpb {
    /// Parse and validate a boot sector, per spec.md §4.C: boot signature
    /// `0x55AA`, a plausible jump opcode, power-of-two `bytes_per_sector`/
    /// `sectors_per_cluster`, and `num_fats >= 1`.
    pub fn parse(sector: &[u8]) -> Result<Bpb> {
        if sector.len() < 512 {
            return Err(FatError::Corrupted);
        }
        if sector[510] != 0x55 || sector[511] != 0xAA {
            warn!("boot sector missing 0x55AA signature");
            return Err(FatError::Corrupted);
        }
        if sector[0] != 0xEB && sector[0] != 0xE9 {
            warn!(
                "boot sector jump opcode {:#04x} is not a recognized x86 jump",
                sector[0]
            );
            return Err(FatError::Corrupted);
        }
        if sector[0] == 0xEB && sector[2] != 0x90 {
            warn!("short jump's third byte {:#04x} is not the expected NOP (0x90)", sector[2]);
            return Err(FatError::Corrupted);
        }

        let u16_at = |o: usize| u16::from_le_bytes([sector[o], sector[o + 1]]);
        let u32_at =
            |o: usize| u32::from_le_bytes([sector[o], sector[o + 1], sector[o + 2], sector[o + 3]]);

        let bytes_per_sector = u16_at(0x0B);
        let sectors_per_cluster = sector[0x0D];
        let reserved_sector_count = u16_at(0x0E);
        let num_fats = sector[0x10];
        let root_entry_count = u16_at(0x11);
        let tot_sec16 = u16_at(0x13);
        let media = sector[0x15];
        let fat_sz16 = u16_at(0x16);
        let tot_sec32 = u32_at(0x20);

        if !bytes_per_sector.is_power_of_two() || !(512..=4096).contains(&bytes_per_sector) {
            warn!("bytes_per_sector {bytes_per_sector} is not a valid power of two in [512, 4096]");
            return Err(FatError::Corrupted);
        }
        if !sectors_per_cluster.is_power_of_two() {
            warn!("sectors_per_cluster {sectors_per_cluster} is not a power of two");
            return Err(FatError::Corrupted);
        }
        if reserved_sector_count < 1 {
            warn!("reserved_sector_count is zero");
            return Err(FatError::Corrupted);
        }
        if num_fats == 0 {
            warn!("num_fats is zero");
            return Err(FatError::Corrupted);
        }

        let total_sectors = if tot_sec16 != 0 { tot_sec16 as u32 } else { tot_sec32 };
        if total_sectors == 0 {
            warn!("both tot_sec16 and tot_sec32 are zero");
            return Err(FatError::Corrupted);
        }

        let (fat_size_sectors, root_cluster, fs_info_sector) = if fat_sz16 != 0 {
            (fat_sz16 as u32, 0, None)
        } else {
            // FAT32 tail starting at offset 0x24.
            let fat_sz32 = u32_at(0x24);
            let root_clus = u32_at(0x2C);
            let fs_info = u16_at(0x30);
            let version = u16_at(0x2A);
            if version != 0x0000 {
                warn!("FAT32 filesystem version {version:#06x} is not the supported 0.0");
                return Err(FatError::Corrupted);
            }
            (fat_sz32, root_clus, Some(fs_info))
        };
        if fat_size_sectors == 0 {
            warn!("FAT size is zero");
            return Err(FatError::Corrupted);
        }
        if fat_sz16 == 0 {
            if root_entry_count != 0 {
                warn!("FAT32 volume has a nonzero legacy root_entry_count");
                return Err(FatError::Corrupted);
            }
        } else if root_entry_count == 0
            || (root_entry_count as u32 * 32) % bytes_per_sector as u32 != 0
        {
            warn!("FAT12/16 root_entry_count {root_entry_count} is zero or not sector-aligned");
            return Err(FatError::Corrupted);
        }

        let volume_label_offset = if fs_info_sector.is_some() { 0x47 } else { 0x2B };
        let mut volume_label = [0u8; 11];
        if volume_label_offset + 11 <= sector.len() {
            volume_label.copy_from_slice(&sector[volume_label_offset..volume_label_offset + 11]);
        }

        let bpb = Bpb {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sector_count,
            num_fats,
            root_entry_count,
            total_sectors,
            fat_size_sectors,
            media,
            root_cluster,
            fs_info_sector,
            volume_label,
        };

        let clusters = bpb.data_cluster_count();
        if clusters < 1 || clusters >= 0x0FFF_FFF5 {
            warn!("computed cluster count {clusters} is outside the valid FAT range");
            return Err(FatError::Corrupted);
        }
        if let Some(fs_info) = bpb.fs_info_sector {
            if bpb.root_cluster < 2 || bpb.root_cluster >= clusters + 2 {
                warn!("FAT32 root_cluster {} is out of range", bpb.root_cluster);
                return Err(FatError::Corrupted);
            }
            // 0x0000 and 0xFFFF both mean "no FSInfo sector"; any other
            // value must land inside the reserved region.
            if fs_info != 0x0000 && fs_info != 0xFFFF && fs_info as u32 >= bpb.reserved_sector_count as u32 {
                warn!("FAT32 FSInfo sector {fs_info} is out of the reserved region");
                return Err(FatError::Corrupted);
            }
        }

        Ok(bpb)
    }

    pub fn cluster_size(&self) -> usize {
        self.bytes_per_sector as usize * self.sectors_per_cluster as usize
    }

    pub fn root_dir_sectors(&self) -> u32 {
        ((self.root_entry_count as u32 * 32) + (self.bytes_per_sector as u32 - 1))
            / self.bytes_per_sector as u32
    }

    pub fn fat_region_sectors(&self) -> u32 {
        self.num_fats as u32 * self.fat_size_sectors
    }

    pub fn first_fat_sector(&self, fat_index: u32) -> u32 {
        self.reserved_sector_count as u32 + fat_index * self.fat_size_sectors
    }

    pub fn first_root_dir_sector(&self) -> u32 {
        self.reserved_sector_count as u32 + self.fat_region_sectors()
    }

    pub fn first_data_sector(&self) -> u32 {
        self.first_root_dir_sector() + self.root_dir_sectors()
    }

    pub fn data_sectors(&self) -> u32 {
        self.total_sectors - self.first_data_sector()
    }

    pub fn data_cluster_count(&self) -> u32 {
        self.data_sectors() / self.sectors_per_cluster as u32
    }

    /// Classify the volume by cluster count, per spec.md §4.C's thresholds:
    /// < 4085 is FAT12, < 65525 is FAT16, otherwise FAT32.
    pub fn fat_type(&self) -> FatType {
        let clusters = self.data_cluster_count();
        if clusters < 4085 {
            FatType::Fat12
        } else if clusters < 65525 {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    /// First sector of cluster `n` (`n >= 2`).
    pub fn first_sector_of_cluster(&self, cluster: u32) -> u32 {
        debug_assert!(cluster >= 2);
        self.first_data_sector() + (cluster - 2) * self.sectors_per_cluster as u32
    }
}

/// FAT32's FSInfo sector (spec.md §4.C, §3). Absent on FAT12/16.
#[derive(Debug, Clone, Copy)]
pub struct FsInfo {
    pub free_count: u32,
    pub next_free: u32,
}

const LEAD_SIGNATURE: u32 = 0x4161_5252;
const STRUCT_SIGNATURE: u32 = 0x6141_7272;
const TRAIL_SIGNATURE: u32 = 0xAA55_0000;

/// Sentinel meaning "value unknown, must be recomputed" for both FSInfo
/// fields, per `original_source/fat/filesystem.cpp`'s FSINFO validation
/// (SPEC_FULL.md's supplemented-features section).
pub const FSINFO_UNKNOWN: u32 = 0xFFFF_FFFF;

impl FsInfo {
    /// Parse the FSInfo sector, validating its three signatures. A bad
    /// signature is not fatal on its own (spec.md treats stale hints as
    /// just that — hints); the caller falls back to [`FSINFO_UNKNOWN`] for
    /// both fields.
    pub fn parse(sector: &[u8]) -> FsInfo {
        let u32_at =
            |o: usize| u32::from_le_bytes([sector[o], sector[o + 1], sector[o + 2], sector[o + 3]]);
        let lead = u32_at(0);
        let strucsig = u32_at(484);
        let trail = u32_at(508);
        if lead != LEAD_SIGNATURE || strucsig != STRUCT_SIGNATURE || trail != TRAIL_SIGNATURE {
            warn!("FSInfo signature mismatch, treating hints as unknown");
            return FsInfo {
                free_count: FSINFO_UNKNOWN,
                next_free: FSINFO_UNKNOWN,
            };
        }
        FsInfo {
            free_count: u32_at(488),
            next_free: u32_at(492),
        }
    }

    /// Serialize into a fresh, zeroed 512-byte (or larger) sector buffer.
    pub fn write_into(&self, sector: &mut [u8]) {
        sector[0..4].copy_from_slice(&LEAD_SIGNATURE.to_le_bytes());
        sector[484..488].copy_from_slice(&STRUCT_SIGNATURE.to_le_bytes());
        sector[488..492].copy_from_slice(&self.free_count.to_le_bytes());
        sector[492..496].copy_from_slice(&self.next_free.to_le_bytes());
        sector[508..512].copy_from_slice(&TRAIL_SIGNATURE.to_le_bytes());
    }
}
