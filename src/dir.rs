//! Directory entry traversal (spec.md §4.F, component F).
//!
//! Grounded on the teacher's `dir.rs` (`find_by_lfn`/`find_by_sfn`,
//! `empty_entry_index`, `ls_with_attr`) and `vfs.rs`'s root bootstrap. The
//! teacher walks entries through a `VirtFile::read_at`/`write_at`
//! byte-stream abstraction over a single FAT32 cluster chain; here the
//! cursor instead addresses the [`Device`] cache directly, since spec.md
//! §4.F requires supporting FAT12/16's fixed-size root region (a flat run of
//! sectors with no cluster chain at all), not just FAT32's chain-based root.

use std::rc::Rc;

use log::warn;

use crate::bpb::Bpb;
use crate::device::Device;
use crate::error::Result;
use crate::fat::FatTable;
use crate::name::{checksum_name, decode_8_3, decode_lfn_chunks};
use crate::{FileAttr, DIRENT_SIZE, DIR_ENTRY_DELETED, DIR_ENTRY_END, LAST_LONG_ENTRY};

/// Where a directory's entries live on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirRegion {
    /// FAT12/16's fixed-size root directory: a flat run of sectors outside
    /// the data cluster area, which cannot grow.
    FixedRoot { first_sector: u32, sector_count: u32 },
    /// Any other directory (FAT32's root included): an ordinary cluster
    /// chain, growable like a file's.
    Chain { first_cluster: u32 },
}

/// The on-disk location of one 32-byte directory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirEntryPos {
    pub sector: u64,
    pub offset: usize,
}

/// A fully decoded directory entry: its display name (short or
/// long-reconstructed), attributes, and the slot positions that make it up
/// — needed by a caller that wants to delete or rewrite it in place.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub attr: FileAttr,
    pub first_cluster: u32,
    pub file_size: u32,
    pub created_date: u16,
    pub created_time: u16,
    pub created_tenths: u8,
    pub accessed_date: u16,
    pub written_date: u16,
    pub written_time: u16,
    pub short_pos: DirEntryPos,
    /// On-disk order (ascending offset), i.e. logically reversed from the
    /// name order since the last-written LFN entry holds the first
    /// characters of the name.
    pub long_positions: Vec<DirEntryPos>,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.attr.contains(FileAttr::DIRECTORY)
    }

    /// Every slot (long entries, then the short entry) this entry occupies,
    /// in on-disk order — the run to delete or relocate as a unit.
    pub fn all_positions(&self) -> Vec<DirEntryPos> {
        let mut v = self.long_positions.clone();
        v.push(self.short_pos);
        v
    }
}

/// A contiguous run of free slots, long enough to hold a new entry.
#[derive(Debug, Clone, Copy)]
pub struct FreeRun {
    pub start: DirEntryPos,
    pub available: usize,
}

fn region_sectors(bpb: &Bpb, fat: &FatTable, region: &DirRegion) -> Result<Vec<u64>> {
    match *region {
        DirRegion::FixedRoot { first_sector, sector_count } => {
            Ok((first_sector as u64..first_sector as u64 + sector_count as u64).collect())
        }
        DirRegion::Chain { first_cluster } => {
            let clusters = fat.read_chain(first_cluster)?;
            let mut sectors = Vec::with_capacity(clusters.len() * bpb.sectors_per_cluster as usize);
            for c in clusters {
                let first = bpb.first_sector_of_cluster(c) as u64;
                for s in 0..bpb.sectors_per_cluster as u64 {
                    sectors.push(first + s);
                }
            }
            Ok(sectors)
        }
    }
}

/// The raw slots of a directory, read up to (not including) the first
/// `DIR_ENTRY_END` marker — everything past that point is guaranteed free
/// by the on-disk invariant, so it is never read. `total_slots` is the
/// region's full capacity, which [`find_free_run`] needs to report trailing
/// free space without reading it.
pub struct DirScan {
    pub slots: Vec<(DirEntryPos, [u8; DIRENT_SIZE])>,
    pub total_slots: usize,
}

pub fn scan(device: &Device, bpb: &Bpb, fat: &FatTable, region: &DirRegion) -> Result<DirScan> {
    let sectors = region_sectors(bpb, fat, region)?;
    let per_sector = bpb.bytes_per_sector as usize / DIRENT_SIZE;
    let total_slots = sectors.len() * per_sector;

    let mut slots = Vec::new();
    'scan: for &lba in &sectors {
        let block = device.get(lba)?;
        let data = block.borrow();
        for offset in (0..bpb.bytes_per_sector as usize).step_by(DIRENT_SIZE) {
            let mut raw = [0u8; DIRENT_SIZE];
            raw.copy_from_slice(&data.data()[offset..offset + DIRENT_SIZE]);
            if raw[0] == DIR_ENTRY_END {
                break 'scan;
            }
            slots.push((DirEntryPos { sector: lba, offset }, raw));
        }
    }
    Ok(DirScan { slots, total_slots })
}

/// Reassemble [`DirEntry`] records from a raw scan, validating and
/// discarding orphaned long-name chains (a checksum mismatch or broken
/// ordinal sequence) by falling back to the short name alone — matching
/// spec.md §4.F's "log and treat as orphan" handling, grounded on the
/// teacher's `find_by_lfn` ordinal/checksum checks.
pub fn parse_entries(scan: &DirScan) -> Vec<DirEntry> {
    let mut entries = Vec::new();
    let mut pending_lfn: Vec<(DirEntryPos, [u16; 13])> = Vec::new();
    let mut pending_checksum: Option<u8> = None;
    let mut pending_order: Option<u8> = None;

    for (pos, raw) in &scan.slots {
        if raw[0] == DIR_ENTRY_DELETED {
            pending_lfn.clear();
            pending_checksum = None;
            pending_order = None;
            continue;
        }
        let attr = FileAttr::from_bits_truncate(raw[11]);
        if attr == FileAttr::LONG_NAME {
            let ord_byte = raw[0];
            let checksum = raw[13];
            let is_last = ord_byte & LAST_LONG_ENTRY != 0;
            let ord = ord_byte & !LAST_LONG_ENTRY;

            let mut chunk = [0u16; 13];
            for i in 0..5 {
                chunk[i] = u16::from_le_bytes([raw[1 + i * 2], raw[2 + i * 2]]);
            }
            for i in 0..6 {
                chunk[5 + i] = u16::from_le_bytes([raw[14 + i * 2], raw[15 + i * 2]]);
            }
            for i in 0..2 {
                chunk[11 + i] = u16::from_le_bytes([raw[28 + i * 2], raw[29 + i * 2]]);
            }

            if is_last {
                pending_lfn.clear();
                pending_checksum = Some(checksum);
                pending_order = Some(ord);
                pending_lfn.push((*pos, chunk));
            } else if pending_order == Some(ord + 1) && pending_checksum == Some(checksum) {
                pending_lfn.push((*pos, chunk));
                pending_order = Some(ord);
            } else {
                warn!("orphaned long-name entry at sector {} offset {}", pos.sector, pos.offset);
                pending_lfn.clear();
                pending_checksum = None;
                pending_order = None;
            }
            continue;
        }

        // Short entry. Use the reconstructed long name only if the pending
        // chain is complete (down to ordinal 1) and its checksum matches
        // this short entry's name bytes; otherwise it's an orphan.
        let mut short_name = [0u8; 11];
        short_name.copy_from_slice(&raw[0..11]);
        let has_valid_lfn =
            pending_order == Some(1) && pending_checksum == Some(checksum_name(&short_name));

        let (name, long_positions) = if has_valid_lfn {
            let chunks: Vec<[u16; 13]> = pending_lfn.iter().rev().map(|(_, c)| *c).collect();
            let positions: Vec<DirEntryPos> = pending_lfn.iter().rev().map(|(p, _)| *p).collect();
            (decode_lfn_chunks(&chunks), positions)
        } else {
            if !pending_lfn.is_empty() {
                warn!(
                    "long-name chain before sector {} offset {} failed checksum validation",
                    pos.sector, pos.offset
                );
            }
            (decode_8_3(&short_name).to_ascii_lowercase(), Vec::new())
        };

        let first_cluster = ((u16::from_le_bytes([raw[20], raw[21]]) as u32) << 16)
            | u16::from_le_bytes([raw[26], raw[27]]) as u32;
        let file_size = u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]);

        entries.push(DirEntry {
            name,
            attr,
            first_cluster,
            file_size,
            created_date: u16::from_le_bytes([raw[16], raw[17]]),
            created_time: u16::from_le_bytes([raw[14], raw[15]]),
            created_tenths: raw[13],
            accessed_date: u16::from_le_bytes([raw[18], raw[19]]),
            written_date: u16::from_le_bytes([raw[24], raw[25]]),
            written_time: u16::from_le_bytes([raw[22], raw[23]]),
            short_pos: *pos,
            long_positions,
        });
        pending_lfn.clear();
        pending_checksum = None;
        pending_order = None;
    }
    entries
}

/// Find the first free run of at least `needed` contiguous slots, searching
/// gaps left by deleted entries first and falling back to the trailing free
/// space past the last occupied slot. Unlike the teacher's
/// `empty_entry_index` (which returns a single offset and lets the caller
/// discover mid-write that it doesn't have room for every long-name entry),
/// this reports the run's full length so the caller can grow the chain
/// before writing anything.
pub fn find_free_run(bpb: &Bpb, scan: &DirScan, needed: usize) -> Option<FreeRun> {
    let mut run_start: Option<usize> = None;
    let mut run_len = 0usize;
    for (i, (_, raw)) in scan.slots.iter().enumerate() {
        if raw[0] == DIR_ENTRY_DELETED {
            if run_start.is_none() {
                run_start = Some(i);
            }
            run_len += 1;
            if run_len >= needed {
                let start_idx = run_start.unwrap();
                return Some(FreeRun { start: scan.slots[start_idx].0, available: run_len });
            }
        } else {
            run_start = None;
            run_len = 0;
        }
    }
    let trailing_available = scan.total_slots - scan.slots.len();
    if trailing_available > 0 {
        if let Some(start) = next_region_slot(bpb, scan) {
            return Some(FreeRun { start, available: trailing_available });
        }
    }
    None
}

/// The slot immediately following the last scanned one — where trailing
/// free space begins. `None` only if the region has zero capacity.
pub fn next_region_slot(bpb: &Bpb, scan: &DirScan) -> Option<DirEntryPos> {
    let bytes_per_sector = bpb.bytes_per_sector as usize;
    match scan.slots.last() {
        Some((pos, _)) => {
            let next_offset = pos.offset + DIRENT_SIZE;
            if next_offset < bytes_per_sector {
                Some(DirEntryPos { sector: pos.sector, offset: next_offset })
            } else {
                Some(DirEntryPos { sector: pos.sector + 1, offset: 0 })
            }
        }
        None => None,
    }
}

/// Write a run of slots (long entries first, short entry last) starting at
/// `start`, wrapping to the next sector in the region as needed.
pub fn write_slots(
    device: &Device,
    bytes_per_sector: u32,
    start: DirEntryPos,
    slots: &[[u8; DIRENT_SIZE]],
) -> Result<()> {
    let mut sector = start.sector;
    let mut offset = start.offset;
    for raw in slots {
        let block = device.begin_write(sector, false)?;
        block.borrow_mut().data_mut()[offset..offset + DIRENT_SIZE].copy_from_slice(raw);
        device.finish_write(&block);
        offset += DIRENT_SIZE;
        if offset >= bytes_per_sector as usize {
            offset = 0;
            sector += 1;
        }
    }
    Ok(())
}

/// Mark every slot of a directory entry free (`0xE5`), without compacting
/// the directory — matching the teacher's delete (`name[0] =
/// DIR_ENTRY_UNUSED`), generalized to the whole long-entry run instead of
/// just the short entry.
pub fn mark_deleted(device: &Device, entry: &DirEntry) -> Result<()> {
    for pos in entry.all_positions() {
        let block = device.begin_write(pos.sector, false)?;
        block.borrow_mut().data_mut()[pos.offset] = DIR_ENTRY_DELETED;
        device.finish_write(&block);
    }
    Ok(())
}

/// Build the synthetic `.`/`..` entries a non-root directory's first
/// cluster is initialized with (spec.md §4.F; the root directory never has
/// these, on any FAT type). Returns the two 32-byte slots in on-disk order.
pub fn make_dot_entries(
    self_cluster: u32,
    parent_cluster: u32,
    date: u16,
    time: u16,
) -> [[u8; DIRENT_SIZE]; 2] {
    let build = |name: &[u8; 11], cluster: u32| -> [u8; DIRENT_SIZE] {
        let mut raw = [0u8; DIRENT_SIZE];
        raw[0..11].copy_from_slice(name);
        raw[11] = FileAttr::DIRECTORY.bits();
        raw[14..16].copy_from_slice(&time.to_le_bytes());
        raw[16..18].copy_from_slice(&date.to_le_bytes());
        raw[18..20].copy_from_slice(&date.to_le_bytes());
        raw[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
        raw[22..24].copy_from_slice(&time.to_le_bytes());
        raw[24..26].copy_from_slice(&date.to_le_bytes());
        raw[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
        raw
    };
    [
        build(b".          ", self_cluster),
        build(b"..         ", parent_cluster),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountOptions;
    use crate::device::MemoryBlockDevice;
    use crate::name::{encode_8_3, split_lfn_chunks};

    fn setup() -> (Device, Bpb) {
        let backend: Rc<dyn crate::device::BlockDevice> = Rc::new(MemoryBlockDevice::new(512, 64));
        let device = Device::new(backend, &MountOptions::default());
        let mut sector = vec![0u8; 512];
        sector[0] = 0xEB;
        sector[1] = 0x00;
        sector[2] = 0x90;
        sector[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
        sector[0x0D] = 1;
        sector[0x0E..0x10].copy_from_slice(&1u16.to_le_bytes());
        sector[0x10] = 1;
        sector[0x11..0x13].copy_from_slice(&16u16.to_le_bytes());
        sector[0x13..0x15].copy_from_slice(&1000u16.to_le_bytes());
        sector[0x16..0x18].copy_from_slice(&2u16.to_le_bytes());
        sector[510] = 0x55;
        sector[511] = 0xAA;
        let bpb = Bpb::parse(&sector).unwrap();
        (device, bpb)
    }

    fn fresh_fat(bpb: &Bpb) -> FatTable {
        let backend: Rc<dyn crate::device::BlockDevice> = Rc::new(MemoryBlockDevice::new(512, 64));
        let device = Rc::new(Device::new(backend, &MountOptions::default()));
        FatTable::new(device, bpb, bpb.fat_type())
    }

    fn write_short_entry(device: &Device, sector: u64, offset: usize, name: &str, attr: FileAttr) {
        let raw11 = encode_8_3(name);
        let block = device.begin_write(sector, false).unwrap();
        {
            let mut b = block.borrow_mut();
            let d = b.data_mut();
            d[offset..offset + 11].copy_from_slice(&raw11);
            d[offset + 11] = attr.bits();
        }
        device.finish_write(&block);
    }

    #[test]
    fn scan_stops_at_terminal_marker() {
        let (device, bpb) = setup();
        let region = DirRegion::FixedRoot {
            first_sector: bpb.first_root_dir_sector(),
            sector_count: bpb.root_dir_sectors(),
        };
        write_short_entry(&device, bpb.first_root_dir_sector() as u64, 0, "ONE.TXT", FileAttr::ARCHIVE);
        write_short_entry(&device, bpb.first_root_dir_sector() as u64, 32, "TWO.TXT", FileAttr::ARCHIVE);
        let fat = fresh_fat(&bpb);

        let s = scan(&device, &bpb, &fat, &region).unwrap();
        assert_eq!(s.slots.len(), 2);
        let entries = parse_entries(&s);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "one.txt");
        assert_eq!(entries[1].name, "two.txt");
    }

    #[test]
    fn find_free_run_prefers_deleted_gap() {
        let (device, bpb) = setup();
        let region = DirRegion::FixedRoot {
            first_sector: bpb.first_root_dir_sector(),
            sector_count: bpb.root_dir_sectors(),
        };
        write_short_entry(&device, bpb.first_root_dir_sector() as u64, 0, "ONE.TXT", FileAttr::ARCHIVE);
        {
            let block = device.begin_write(bpb.first_root_dir_sector() as u64, false).unwrap();
            block.borrow_mut().data_mut()[32] = DIR_ENTRY_DELETED;
            device.finish_write(&block);
        }
        write_short_entry(&device, bpb.first_root_dir_sector() as u64, 64, "THREE.TXT", FileAttr::ARCHIVE);

        let fat = fresh_fat(&bpb);
        let s = scan(&device, &bpb, &fat, &region).unwrap();
        let run = find_free_run(&bpb, &s, 1).unwrap();
        assert_eq!(run.start.offset, 32);
    }

    #[test]
    fn long_name_chain_reconstructs_full_name() {
        let (device, bpb) = setup();
        let name = "a long file name.txt";
        let basis = crate::name::numeric_tail_basis(name, 1);
        let checksum = checksum_name(&basis);
        let chunks = split_lfn_chunks(name);

        let sector = bpb.first_root_dir_sector() as u64;
        let mut offset = 0usize;
        for (i, chunk) in chunks.iter().enumerate().rev() {
            let mut raw = [0u8; DIRENT_SIZE];
            let mut ord = (i + 1) as u8;
            if i == chunks.len() - 1 {
                ord |= LAST_LONG_ENTRY;
            }
            raw[0] = ord;
            for j in 0..5 {
                raw[1 + j * 2..3 + j * 2].copy_from_slice(&chunk[j].to_le_bytes());
            }
            raw[11] = FileAttr::LONG_NAME.bits();
            raw[13] = checksum;
            for j in 0..6 {
                raw[14 + j * 2..16 + j * 2].copy_from_slice(&chunk[5 + j].to_le_bytes());
            }
            for j in 0..2 {
                raw[28 + j * 2..30 + j * 2].copy_from_slice(&chunk[11 + j].to_le_bytes());
            }
            let block = device.begin_write(sector, false).unwrap();
            block.borrow_mut().data_mut()[offset..offset + DIRENT_SIZE].copy_from_slice(&raw);
            device.finish_write(&block);
            offset += DIRENT_SIZE;
        }
        write_short_entry(&device, sector, offset, "AVERYLO~1.TXT", FileAttr::ARCHIVE);

        let fat = fresh_fat(&bpb);
        let region = DirRegion::FixedRoot {
            first_sector: bpb.first_root_dir_sector(),
            sector_count: bpb.root_dir_sectors(),
        };
        let s = scan(&device, &bpb, &fat, &region).unwrap();
        let entries = parse_entries(&s);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, name);
    }
}
