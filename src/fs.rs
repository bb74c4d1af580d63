//! Mount/unmount lifecycle and the open-inode cache (spec.md §4.H, component H).
//!
//! Grounded on the teacher's `fs.rs` (`FileSystem::open`, `alloc_cluster`,
//! `dealloc_cluster`), which never models unmounting, corruption, or the
//! clean-shutdown flag — `open()` just parses the BPB and builds a
//! `FATManager`, full stop. The mount/unmount lifecycle, the clean-shutdown
//! flag, `request_check`, and `statfs` are new here, patterned on
//! `original_source/fat/filesystem.cpp`'s mount/unmount handling
//! (SPEC_FULL.md's supplemented-features section).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use log::{info, warn};

use crate::bpb::{Bpb, FsInfo, FSINFO_UNKNOWN};
use crate::config::MountOptions;
use crate::device::{BlockDevice, Device};
use crate::error::{FatError, Result};
use crate::fat::FatTable;
use crate::inode::{Inode, InodeKey};

/// Shared, read-mostly volume state every cached [`Inode`] borrows from.
pub struct Volume {
    pub device: Rc<Device>,
    pub fat: FatTable,
    pub bpb: Bpb,
    pub mount: MountOptions,
}

/// Snapshot of the volume's capacity, for the adapter's `statfs`/`statvfs`.
#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub total_clusters: u32,
    pub free_clusters: u32,
    /// Longest filename component FAT's long-name entries can represent.
    pub name_max: u32,
}

/// Longest filename component FAT's long-name entries can represent.
const FAT_NAME_MAX: u32 = 255;

/// A mounted filesystem: the shared [`Volume`], the root inode, the
/// cluster-keyed inode cache, and the lifecycle operations (mount, unmount,
/// corruption, `statfs`) spec.md §4.H describes.
pub struct FileSystem {
    volume: Rc<Volume>,
    root: Rc<Inode>,
    inodes: RefCell<HashMap<InodeKey, Rc<Inode>>>,
    request_check: Cell<bool>,
    corrupted: Cell<bool>,
}

impl FileSystem {
    /// Mount a volume: parse the BPB, build the FAT table, adopt FSInfo's
    /// cached hints (FAT32 only), check and clear the clean-shutdown flag,
    /// and bootstrap the root directory inode.
    pub fn mount(backend: Rc<dyn BlockDevice>, options: MountOptions) -> Result<Self> {
        let device = Rc::new(Device::new(backend, &options));
        let bpb = {
            let boot = device.get(0)?;
            let sector = boot.borrow().data().to_vec();
            Bpb::parse(&sector)?
        };
        if bpb.total_sectors as u64 > device.sector_count() {
            warn!(
                "BPB reports {} sectors but the device only has {}",
                bpb.total_sectors,
                device.sector_count()
            );
            return Err(FatError::Corrupted);
        }

        let fat_type = bpb.fat_type();
        let fat = FatTable::new(Rc::clone(&device), &bpb, fat_type);

        if let Some(sector) = bpb.fs_info_sector {
            let block = device.get(sector as u64)?;
            let info = FsInfo::parse(block.borrow().data());
            let free = (info.free_count != FSINFO_UNKNOWN).then_some(info.free_count);
            let next_free = (info.next_free != FSINFO_UNKNOWN).then_some(info.next_free);
            fat.adopt_hints(free, next_free);
        }

        let mut request_check = false;
        if let Some((clean, _)) = fat.read_dirty_flags()? {
            if !clean {
                warn!("volume was not cleanly unmounted, flagging for check");
                request_check = true;
            }
            if !options.read_only {
                fat.write_clean_shutdown_flag(false)?;
                device.sync()?;
            }
        }

        let volume = Rc::new(Volume {
            device,
            fat,
            bpb,
            mount: options,
        });
        let root = Inode::bootstrap_root(Rc::clone(&volume));

        let mut inodes = HashMap::new();
        inodes.insert(root.key(), Rc::clone(&root));

        Ok(FileSystem {
            volume,
            root,
            inodes: RefCell::new(inodes),
            request_check: Cell::new(request_check),
            corrupted: Cell::new(false),
        })
    }

    pub fn root(&self) -> Rc<Inode> {
        Rc::clone(&self.root)
    }

    pub fn volume(&self) -> &Rc<Volume> {
        &self.volume
    }

    /// Whether a prior mount ended uncleanly, or an in-session corruption
    /// was flagged — an adapter can surface this as `fsck`-needed state.
    pub fn request_check(&self) -> bool {
        self.request_check.get()
    }

    /// Look up a cached inode by key without creating one.
    pub(crate) fn lookup_cached(&self, key: &InodeKey) -> Option<Rc<Inode>> {
        self.inodes.borrow().get(key).map(Rc::clone)
    }

    /// Look up a cached inode by key, or insert a freshly built one.
    pub(crate) fn get_or_insert(&self, key: InodeKey, build: impl FnOnce() -> Rc<Inode>) -> Rc<Inode> {
        if let Some(existing) = self.inodes.borrow().get(&key) {
            return Rc::clone(existing);
        }
        let inode = build();
        self.inodes.borrow_mut().insert(key, Rc::clone(&inode));
        inode
    }

    /// Drop an inode from the cache — called once its last open handle
    /// closes after it was unlinked. A no-op if nothing is cached under
    /// `key` (e.g. it was never looked up after being unlinked).
    pub(crate) fn forget(&self, key: &InodeKey) {
        self.inodes.borrow_mut().remove(key);
    }

    /// Downgrade the mount to read-only and flag it for an offline check,
    /// per spec.md §4.H's corruption handling. Irreversible for the
    /// lifetime of this mount.
    pub fn corrupted(&self) -> FatError {
        warn!("filesystem marked corrupted, downgrading to read-only");
        self.request_check.set(true);
        self.corrupted.set(true);
        FatError::Corrupted
    }

    /// Capacity snapshot built from the FAT's cached free-count hint. Never
    /// triggers a full recount — see [`FileSystem::recalculate_free_count`]
    /// (spec.md §9's open question decision).
    pub fn statfs(&self) -> StatFs {
        StatFs {
            bytes_per_sector: self.volume.bpb.bytes_per_sector as u32,
            sectors_per_cluster: self.volume.bpb.sectors_per_cluster as u32,
            total_clusters: self.volume.fat.max_cluster() - 1,
            free_clusters: self.volume.fat.free_count_hint().unwrap_or(0),
            name_max: FAT_NAME_MAX,
        }
    }

    /// Recompute the free cluster count with a full FAT scan, updating the
    /// cached hint. An explicit fsck-style recovery path, never called
    /// implicitly.
    pub fn recalculate_free_count(&self) -> Result<u32> {
        self.volume.fat.calculate_free_count()
    }

    /// Flush every dirty sector to the backend without unmounting —
    /// distinct from a single inode's [`Inode::fsync`], which only
    /// guarantees its own dirent is flushed, and from [`FileSystem::unmount`],
    /// which also persists FSInfo and the clean-shutdown flag and consumes
    /// the filesystem.
    pub fn fsync_fs(&self) -> Result<()> {
        self.volume.device.sync()
    }

    /// Flush all dirty sectors, persist FSInfo and the clean-shutdown flag,
    /// and sync the backend. Consumes `self`: the filesystem must not be
    /// used after unmounting.
    pub fn unmount(self) -> Result<()> {
        if !self.volume.mount.read_only {
            if let Some(sector) = self.volume.bpb.fs_info_sector {
                let info = FsInfo {
                    free_count: self.volume.fat.free_count_hint().unwrap_or(FSINFO_UNKNOWN),
                    next_free: self.volume.fat.free_search_hint(),
                };
                let block = self.volume.device.begin_write(sector as u64, false)?;
                info.write_into(block.borrow_mut().data_mut());
                self.volume.device.finish_write(&block);
            }
            if !self.corrupted.get() {
                self.volume.fat.write_clean_shutdown_flag(true)?;
            }
        }
        self.volume.device.sync()?;
        info!("filesystem unmounted cleanly");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryBlockDevice;

    fn make_fat16_image(total_sectors: u32) -> Rc<dyn BlockDevice> {
        let backend = MemoryBlockDevice::new(512, total_sectors as u64);
        backend.with_bytes(|buf| {
            buf[0] = 0xEB;
            buf[1] = 0x00;
            buf[2] = 0x90;
            buf[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
            buf[0x0D] = 1; // sectors_per_cluster
            buf[0x0E..0x10].copy_from_slice(&1u16.to_le_bytes()); // reserved
            buf[0x10] = 1; // num_fats
            buf[0x11..0x13].copy_from_slice(&512u16.to_le_bytes()); // root_entry_count
            buf[0x13..0x15].copy_from_slice(&(total_sectors as u16).to_le_bytes());
            buf[0x16..0x18].copy_from_slice(&20u16.to_le_bytes()); // fat_size_sectors
            buf[510] = 0x55;
            buf[511] = 0xAA;
        });
        Rc::new(backend)
    }

    #[test]
    fn mount_bootstraps_root_and_flags_unclean_shutdown() {
        let backend = make_fat16_image(4253);
        let fs = FileSystem::mount(backend, MountOptions::default()).unwrap();
        // A never-before-mounted image has a zeroed FAT entry 1, which reads
        // as "not cleanly shut down" until this mount's own unmount.
        assert!(fs.request_check());
        assert!(fs.root().is_dir());
    }

    #[test]
    fn clean_unmount_clears_the_check_flag_on_remount() {
        let backend = make_fat16_image(4253);
        let fs = FileSystem::mount(Rc::clone(&backend), MountOptions::default()).unwrap();
        fs.unmount().unwrap();

        let fs2 = FileSystem::mount(backend, MountOptions::default()).unwrap();
        assert!(!fs2.request_check());
    }

    #[test]
    fn mount_rejects_bpb_larger_than_the_device() {
        let backend = MemoryBlockDevice::new(512, 100);
        backend.with_bytes(|buf| {
            buf[0] = 0xEB;
            buf[1] = 0x00;
            buf[2] = 0x90;
            buf[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
            buf[0x0D] = 1;
            buf[0x0E..0x10].copy_from_slice(&1u16.to_le_bytes());
            buf[0x10] = 1;
            buf[0x11..0x13].copy_from_slice(&512u16.to_le_bytes());
            buf[0x13..0x15].copy_from_slice(&4253u16.to_le_bytes());
            buf[0x16..0x18].copy_from_slice(&20u16.to_le_bytes());
            buf[510] = 0x55;
            buf[511] = 0xAA;
        });
        let backend: Rc<dyn BlockDevice> = Rc::new(backend);
        assert!(matches!(FileSystem::mount(backend, MountOptions::default()), Err(FatError::Corrupted)));
    }

    #[test]
    fn fsync_fs_flushes_without_consuming_the_filesystem() {
        let backend = make_fat16_image(4253);
        let fs = FileSystem::mount(backend, MountOptions::default()).unwrap();
        fs.fsync_fs().unwrap();
        assert!(fs.root().is_dir());
    }

    #[test]
    fn corrupted_flags_request_check() {
        let backend = make_fat16_image(4253);
        let fs = FileSystem::mount(backend, MountOptions::default()).unwrap();
        let err = fs.corrupted();
        assert!(matches!(err, FatError::Corrupted));
        assert!(fs.request_check());
    }
}
