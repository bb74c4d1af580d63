//! Whole-filesystem scenario tests, exercising [`sortifat::fs::FileSystem`]
//! end to end through its public API rather than any one module in
//! isolation: mount, build up a tree, unmount, and remount to confirm the
//! on-disk image is what a real driver would leave behind.

use std::rc::Rc;

use chrono::NaiveDate;
use sortifat::config::MountOptions;
use sortifat::device::{BlockDevice, MemoryBlockDevice};
use sortifat::error::FatError;
use sortifat::fs::FileSystem;

fn now() -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 7, 27).unwrap().and_hms_opt(9, 30, 0).unwrap()
}

/// Route log output through the test harness instead of stdout; safe to
/// call more than once across tests in this file.
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A small FAT16 image, same BPB layout the in-module unit tests use.
fn fat16_image(total_sectors: u32) -> Rc<dyn BlockDevice> {
    let backend = MemoryBlockDevice::new(512, total_sectors as u64);
    backend.with_bytes(|buf| {
        buf[0] = 0xEB;
        buf[1] = 0x00;
        buf[2] = 0x90;
        buf[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
        buf[0x0D] = 1; // sectors_per_cluster
        buf[0x0E..0x10].copy_from_slice(&1u16.to_le_bytes()); // reserved
        buf[0x10] = 2; // num_fats
        buf[0x11..0x13].copy_from_slice(&512u16.to_le_bytes()); // root_entry_count
        buf[0x13..0x15].copy_from_slice(&(total_sectors as u16).to_le_bytes());
        buf[0x16..0x18].copy_from_slice(&20u16.to_le_bytes()); // fat_size_sectors
        buf[510] = 0x55;
        buf[511] = 0xAA;
    });
    Rc::new(backend)
}

/// A FAT32 image, sized so `data_cluster_count() >= 65525` per the BPB's own
/// classification thresholds (spec.md §4.C).
fn fat32_image() -> Rc<dyn BlockDevice> {
    let reserved = 32u32;
    let num_fats = 2u32;
    let fat_size_sectors = 600u32;
    let data_sectors = 65_600u32;
    let total_sectors = reserved + num_fats * fat_size_sectors + data_sectors;

    let backend = MemoryBlockDevice::new(512, total_sectors as u64);
    backend.with_bytes(|buf| {
        buf[0] = 0xEB;
        buf[1] = 0x00;
        buf[2] = 0x90;
        buf[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
        buf[0x0D] = 1; // sectors_per_cluster
        buf[0x0E..0x10].copy_from_slice(&(reserved as u16).to_le_bytes());
        buf[0x10] = num_fats as u8;
        buf[0x11..0x13].copy_from_slice(&0u16.to_le_bytes()); // root_entry_count = 0 (FAT32)
        buf[0x13..0x15].copy_from_slice(&0u16.to_le_bytes()); // tot_sec16 = 0
        buf[0x16..0x18].copy_from_slice(&0u16.to_le_bytes()); // fat_sz16 = 0
        buf[0x20..0x24].copy_from_slice(&total_sectors.to_le_bytes());
        buf[0x24..0x28].copy_from_slice(&fat_size_sectors.to_le_bytes());
        buf[0x2C..0x30].copy_from_slice(&2u32.to_le_bytes()); // root_cluster
        buf[0x30..0x32].copy_from_slice(&0u16.to_le_bytes()); // fs_info_sector: none seeded
        buf[510] = 0x55;
        buf[511] = 0xAA;
    });
    Rc::new(backend)
}

#[test]
fn files_and_directories_survive_unmount_and_remount() {
    init_logging();
    let backend = fat16_image(4253);
    let fs = FileSystem::mount(Rc::clone(&backend), MountOptions::default()).unwrap();
    let root = fs.root();
    let t = now();

    let docs = root.create_child(&fs, "docs", true, t).unwrap();
    let readme = docs.create_child(&fs, "a rather long file name.txt", false, t).unwrap();
    readme.open();
    readme.write_at(0, b"hello from the integration test", t).unwrap();
    readme.close(&fs).unwrap();
    root.create_child(&fs, "TOP.TXT", false, t).unwrap();

    fs.unmount().unwrap();

    let fs2 = FileSystem::mount(backend, MountOptions::default()).unwrap();
    assert!(!fs2.request_check(), "clean unmount must clear the dirty flag");
    let root2 = fs2.root();

    let docs2 = root2.lookup_child(&fs2, "docs").unwrap().unwrap();
    assert!(docs2.is_dir());
    let readme2 = docs2
        .lookup_child(&fs2, "a rather long file name.txt")
        .unwrap()
        .unwrap();
    let mut buf = [0u8; 32];
    let n = readme2.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello from the integration test");

    assert!(root2.lookup_child(&fs2, "top.txt").unwrap().is_some());
}

#[test]
fn directory_tree_rename_and_unlink_round_trip() {
    init_logging();
    let backend = fat16_image(4253);
    let fs = FileSystem::mount(backend, MountOptions::default()).unwrap();
    let root = fs.root();
    let t = now();

    let src = root.create_child(&fs, "src", true, t).unwrap();
    let dst = root.create_child(&fs, "dst", true, t).unwrap();
    src.create_child(&fs, "notes.txt", false, t).unwrap();

    root.rename_child(&fs, "src", &root, "src2").unwrap();
    assert!(root.lookup_child(&fs, "src").unwrap().is_none());
    let src2 = root.lookup_child(&fs, "src2").unwrap().unwrap();

    src2.rename_child(&fs, "notes.txt", &dst, "notes.txt").unwrap();
    assert!(src2.lookup_child(&fs, "notes.txt").unwrap().is_none());
    assert!(dst.lookup_child(&fs, "notes.txt").unwrap().is_some());

    root.unlink_child(&fs, "src2", true, false).unwrap();
    assert!(root.lookup_child(&fs, "src2").unwrap().is_none());
}

#[test]
fn fat32_volume_mounts_and_stores_multi_cluster_file() {
    init_logging();
    let backend = fat32_image();
    let fs = FileSystem::mount(backend, MountOptions::default()).unwrap();
    let root = fs.root();
    let t = now();

    let stat = fs.statfs();
    assert_eq!(stat.name_max, 255);
    assert!(stat.total_clusters >= 65_525);

    let file = root.create_child(&fs, "big.bin", false, t).unwrap();
    file.open();
    let cluster_size = fs.volume().bpb.cluster_size();
    let data: Vec<u8> = (0..cluster_size * 3).map(|i| (i % 251) as u8).collect();
    file.write_at(0, &data, t).unwrap();
    file.close(&fs).unwrap();

    fs.unmount().unwrap();
}

#[test]
fn read_only_mount_rejects_mutation() {
    init_logging();
    let backend = fat16_image(4253);
    {
        let fs = FileSystem::mount(Rc::clone(&backend), MountOptions::default()).unwrap();
        fs.unmount().unwrap();
    }

    let options = MountOptions {
        read_only: true,
        ..Default::default()
    };
    let fs = FileSystem::mount(backend, options).unwrap();
    let root = fs.root();
    let err = root.create_child(&fs, "nope.txt", false, now()).unwrap_err();
    assert!(matches!(err, FatError::ReadOnlyFilesystem));
}

#[test]
fn corrupted_mount_downgrades_and_skips_clean_shutdown_flag() {
    init_logging();
    let backend = fat16_image(4253);
    let fs = FileSystem::mount(Rc::clone(&backend), MountOptions::default()).unwrap();
    let _ = fs.corrupted();
    fs.unmount().unwrap();

    let fs2 = FileSystem::mount(backend, MountOptions::default()).unwrap();
    assert!(fs2.request_check(), "a corrupted prior mount must still request a check");
}
