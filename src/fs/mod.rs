//! Filesystem engine.
//!
//! [`Nvfuse`] is the public handle: it owns the block transport and, while
//! mounted, the [`NvfuseFs`] mount instance carrying the superblock, the
//! block group manager, the buffer and inode-context caches and the open
//! file table. Every public entry point takes the handle's lock for its
//! duration; the mount instance itself is plain single-owner data, per the
//! cooperative single-threaded model.

use bytemuck::Zeroable;
use hashbrown::HashSet;
use log::{error, info, warn};
use parking_lot::RwLock;

use crate::drivers::block::{create_device, BlockDevice, DeviceKind, DeviceParams};
use crate::errors::{CanFail, Error, FsResult};

pub mod alloc;
pub mod bitmap;
pub mod block_grp;
pub mod btree;
pub mod buffer;
pub mod dir;
pub mod dirhash;
pub mod file;
pub mod inode;
pub mod layout;
pub mod path;
pub mod sb;

pub use file::{OpenFlags, Whence};
pub use layout::InodeNumber;
pub use path::FileAttr;
pub use sb::StatVfs;

use block_grp::{BgDescriptor, BgManager};
use buffer::{BufKey, BufferCache};
use file::FileTable;
use inode::{IctxCache, Inode};
use layout::{
    BlkId, BlockGroupNumber, InodeType, CLUSTER_SIZE, DEFAULT_CLUSTERS_PER_BG, NVFUSE_BD_OFFSET,
    NVFUSE_DBITMAP_OFFSET, NVFUSE_IBITMAP_OFFSET, NVFUSE_ITABLE_OFFSET, NUM_RESV_INO,
    SECTORS_PER_CLUSTER,
};
use sb::{Superblock, NVFUSE_UMOUNT_CLEAN, NVFUSE_UMOUNT_DIRTY};

/// Mount-time tunables.
#[derive(Clone, Debug)]
pub struct MountParams {
    /// Buffer cache pool size, in clusters.
    pub buffer_pool_clusters: usize,

    /// Inode context cache budget.
    pub ictx_cache_size: usize,

    /// Clusters per block group (used by format). Capped by the bits of
    /// one bitmap cluster.
    pub clusters_per_bg: u32,

    /// Inodes per block group (used by format).
    pub inodes_per_bg: u32,
}

impl Default for MountParams {
    fn default() -> Self {
        MountParams {
            // 64 MiB of cache
            buffer_pool_clusters: (64 << 20) / CLUSTER_SIZE,
            ictx_cache_size: 1024,
            clusters_per_bg: DEFAULT_CLUSTERS_PER_BG,
            inodes_per_bg: DEFAULT_CLUSTERS_PER_BG / 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MountState {
    Mounted,

    /// Write-back failed permanently or an invariant violation was seen;
    /// mutations are refused, cached reads still work.
    Errored,
}

/// One mounted filesystem instance.
pub struct NvfuseFs {
    pub(crate) sb: Superblock,
    pub(crate) bgs: BgManager,
    pub(crate) bcache: BufferCache,
    pub(crate) ictxs: IctxCache,
    pub(crate) ftable: FileTable,
    pub(crate) dev: Box<dyn BlockDevice>,
    pub(crate) cwd_ino: InodeNumber,
    pub(crate) pending_delete: HashSet<InodeNumber>,
    pub(crate) state: MountState,
}

impl NvfuseFs {
    fn assemble(
        dev: Box<dyn BlockDevice>,
        sb: Superblock,
        descriptors: Vec<BgDescriptor>,
        params: &MountParams,
    ) -> Self {
        NvfuseFs {
            cwd_ino: sb.sb_root_ino,
            sb,
            bgs: BgManager::new(descriptors),
            bcache: BufferCache::new(params.buffer_pool_clusters),
            ictxs: IctxCache::new(params.ictx_cache_size),
            ftable: FileTable::new(),
            dev,
            pending_delete: HashSet::new(),
            state: MountState::Mounted,
        }
    }

    // ---- ordered write-back ------------------------------------------

    /// Flushes the global metadata in the crash-detectable order: the
    /// remaining data/indirect/itable buffers, then the bitmaps, then the
    /// group descriptors, then the superblock. On a dirty remount a torn
    /// operation therefore leaves orphan blocks, never dangling pointers.
    pub(crate) fn sync_metadata(&mut self) -> CanFail<Error> {
        let dirty = self.bcache.dirty_buffers();
        let mut plain = Vec::new();
        let mut bitmaps = Vec::new();
        for bid in dirty {
            let key = self.bcache.key(bid);
            if key.ino == InodeNumber::DBITMAP || key.ino == InodeNumber::IBITMAP {
                bitmaps.push(bid);
            } else {
                plain.push(bid);
            }
        }
        self.bcache.sync_buffers(self.dev.as_mut(), &plain)?;
        self.bcache.sync_buffers(self.dev.as_mut(), &bitmaps)?;

        // descriptors next
        let dirty_bds = self.bgs.take_dirty();
        let mut bd_buffers = Vec::with_capacity(dirty_bds.len());
        for bd in dirty_bds {
            let blk = BlkId(bd.bd_bd_start);
            let key = BufKey::meta(InodeNumber::BD, blk);
            let bid = self.bcache.get(self.dev.as_mut(), key, blk)?;
            bd.write_to_cluster(self.bcache.data_mut(bid));
            self.bcache.put(bid, true);
            bd_buffers.push(bid);
        }
        self.bcache.sync_buffers(self.dev.as_mut(), &bd_buffers)?;

        // the superblock goes last
        self.write_superblock()
    }

    fn write_superblock(&mut self) -> CanFail<Error> {
        let mut cluster = vec![0u8; CLUSTER_SIZE];
        self.sb.write_to_cluster(&mut cluster);
        self.dev.write_clusters(BlkId(0), 1, &cluster)
    }

    /// Flushes every dirty inode context, then the global metadata.
    pub(crate) fn flush_all(&mut self) -> CanFail<Error> {
        for ino in self.ictxs.dirty_inodes() {
            self.sync_inode(ino)?;
        }
        self.sync_metadata()
    }

    /// Write-back policy hook: explicit sync points force a flush, and a
    /// breached dirty watermark triggers one on the way.
    pub(crate) fn check_flush_dirty(&mut self, force: bool) -> CanFail<Error> {
        if force || self.bcache.over_watermark() {
            self.flush_all()?;
        }
        Ok(())
    }

    fn statvfs(&self) -> StatVfs {
        StatVfs {
            f_bsize: CLUSTER_SIZE as u64,
            f_blocks: self.sb.sb_no_of_blocks as u64,
            f_bfree: self.sb.sb_free_blocks as u64,
            f_bavail: self.sb.sb_free_blocks as u64,
            f_files: u64::from(self.sb.sb_bg_num) * u64::from(self.sb.sb_no_of_inodes_per_bg),
            f_ffree: self.sb.sb_free_inodes as u64,
            f_namemax: (layout::FNAME_SIZE - 1) as u64,
        }
    }

    /// Recomputes free counters from the bitmaps (which are authoritative)
    /// after a dirty shutdown, repairing descriptors and superblock
    /// totals.
    fn scan_consistency(&mut self) -> CanFail<Error> {
        info!(target: "nvfuse", "unclean shutdown detected, scanning bitmaps");
        let mut cluster = vec![0u8; CLUSTER_SIZE];

        for bg in self.bgs.groups().to_vec() {
            let bd = *self.bgs.descriptor(bg)?;
            let clusters_in_group = bd.dtable_offset() + bd.bd_dtable_size;

            self.dev
                .read_clusters(BlkId(bd.bd_dbitmap_start), 1, &mut cluster)?;
            let free_blocks = bitmap::count_zero_bits(&cluster, clusters_in_group);

            self.dev
                .read_clusters(BlkId(bd.bd_ibitmap_start), 1, &mut cluster)?;
            let free_inodes = bitmap::count_zero_bits(&cluster, self.sb.sb_no_of_inodes_per_bg);

            if free_blocks != bd.bd_free_blocks || free_inodes != bd.bd_free_inodes {
                warn!(
                    target: "nvfuse",
                    "group {bg}: descriptor counters diverge (blocks {} -> {}, inodes {} -> {})",
                    bd.bd_free_blocks, free_blocks, bd.bd_free_inodes, free_inodes
                );
                let bd = self.bgs.descriptor_mut(bg)?;
                bd.bd_free_blocks = free_blocks;
                bd.bd_free_inodes = free_inodes;
            }
        }

        self.sb.sb_free_blocks = self.bgs.total_free_blocks();
        self.sb.sb_free_inodes = self.bgs.total_free_inodes() as i32;
        self.sb.sb_no_of_used_blocks = self.sb.sb_no_of_blocks - self.sb.sb_free_blocks;
        Ok(())
    }

    fn opendir_path(&mut self, path: &str) -> FsResult<u32> {
        let ino = self.resolve_path(path, true)?;
        self.open_ictx(ino)?;
        if !self.inode_of(ino)?.is_directory() {
            self.release_ictx(ino, false);
            return Err(Error::NotDirectory);
        }

        match self.ftable_alloc_dir(ino) {
            Ok(fd) => Ok(fd),
            Err(e) => {
                self.release_ictx(ino, false);
                Err(e)
            }
        }
    }

    fn ftable_alloc_dir(&mut self, ino: InodeNumber) -> FsResult<u32> {
        use file::FileTableEntry;
        for fd in layout::START_OPEN_FILE..layout::MAX_OPEN_FILE {
            if !self.ftable.entries[fd].used {
                self.ftable.entries[fd] = FileTableEntry {
                    ino,
                    rw_offset: 0,
                    flags: OpenFlags::empty(),
                    used: true,
                };
                return Ok(fd as u32);
            }
        }
        Err(Error::Busy)
    }

    fn readdir_fd(&mut self, fd: u32) -> FsResult<Option<DirEntryInfo>> {
        let entry = self
            .ftable
            .entries
            .get(fd as usize)
            .filter(|e| e.used)
            .copied()
            .ok_or(Error::Invalid)?;
        if !self.inode_of(entry.ino)?.is_directory() {
            return Err(Error::NotDirectory);
        }
        let cursor = entry.rw_offset as u64;

        match self.dir_next_entry(entry.ino, cursor)? {
            Some((slot, dirent)) => {
                self.ftable.entries[fd as usize].rw_offset = (slot + 1) as i64;
                Ok(Some(DirEntryInfo {
                    ino: dirent.d_ino.0,
                    name: String::from_utf8_lossy(dirent.name()).into_owned(),
                }))
            }
            None => Ok(None),
        }
    }
}

/// Groups laid out over a device, with a device smaller than one full
/// group getting a single truncated group. Covered clusters beyond the
/// last full group are left unused.
fn device_groups(total_clusters: u64, clusters_per_bg: u32) -> Vec<(BlockGroupNumber, u32)> {
    let mut groups = Vec::new();
    let full = total_clusters / u64::from(clusters_per_bg);
    for g in 0..full {
        groups.push((BlockGroupNumber(g as u32), clusters_per_bg));
    }
    if groups.is_empty() && total_clusters > 0 {
        groups.push((BlockGroupNumber(0), total_clusters as u32));
    }
    groups
}

struct HandleInner {
    /// Held while unmounted; moves into the mount instance on mount.
    dev: Option<Box<dyn BlockDevice>>,
    fs: Option<NvfuseFs>,
    params: MountParams,
}

/// Public filesystem handle.
pub struct Nvfuse {
    inner: RwLock<HandleInner>,
}

impl Nvfuse {
    /// Opens the selected transport and wraps it in a handle. The device
    /// is opened here; [`Nvfuse::mount`] (after [`Nvfuse::format`] for a
    /// fresh device) makes the filesystem usable.
    pub fn create_handle(
        kind: DeviceKind,
        dev_params: DeviceParams,
        params: MountParams,
    ) -> FsResult<Self> {
        let mut dev = create_device(kind, dev_params)?;
        dev.open()?;
        Ok(Nvfuse {
            inner: RwLock::new(HandleInner {
                dev: Some(dev),
                fs: None,
                params,
            }),
        })
    }

    /// Unmounts if needed and releases the device.
    pub fn destroy_handle(self) -> CanFail<Error> {
        let _ = self.umount();
        let mut inner = self.inner.write();
        if let Some(mut dev) = inner.dev.take() {
            dev.close()?;
        }
        Ok(())
    }

    // ---- mount lifecycle ---------------------------------------------

    /// Writes a fresh filesystem over the device: block group descriptors,
    /// bitmaps with the metadata clusters pre-marked, zeroed inode tables,
    /// the root directory with its index, and finally the superblock.
    pub fn format(&self) -> CanFail<Error> {
        let mut inner = self.inner.write();
        if inner.fs.is_some() {
            return Err(Error::Busy);
        }
        let params = inner.params.clone();
        let mut dev = inner.dev.take().ok_or(Error::Invalid)?;

        let res = format_device(&mut dev, &params);
        inner.dev = Some(dev);
        res
    }

    /// Reads and verifies the on-disk structures and installs the caches.
    /// A dirty clean-unmount flag triggers the bitmap scan.
    pub fn mount(&self) -> CanFail<Error> {
        let mut inner = self.inner.write();
        if inner.fs.is_some() {
            return Err(Error::Busy);
        }
        let params = inner.params.clone();
        let mut dev = inner.dev.take().ok_or(Error::Invalid)?;

        match mount_device(&mut dev, &params) {
            Ok(mut fs) => {
                if fs.sb.sb_umount != NVFUSE_UMOUNT_CLEAN {
                    if let Err(e) = fs.scan_consistency() {
                        inner.dev = Some(fs.dev);
                        return Err(e);
                    }
                }

                // mark the mount on disk before handing out operations
                fs.sb.sb_umount = NVFUSE_UMOUNT_DIRTY;
                fs.sb.sb_mount_cnt += 1;
                if let Err(e) = fs.write_superblock() {
                    inner.dev = Some(fs.dev);
                    return Err(e);
                }

                info!(
                    target: "nvfuse",
                    "mounted: {} clusters, {} groups, {} free blocks, {} free inodes",
                    fs.sb.sb_no_of_blocks, fs.sb.sb_bg_num,
                    fs.sb.sb_free_blocks, fs.sb.sb_free_inodes
                );
                inner.fs = Some(fs);
                Ok(())
            }
            Err(e) => {
                inner.dev = Some(dev);
                Err(e)
            }
        }
    }

    /// Flushes everything in order, sets the clean flag and releases the
    /// mount instance.
    pub fn umount(&self) -> CanFail<Error> {
        let mut inner = self.inner.write();
        let Some(mut fs) = inner.fs.take() else {
            return Err(Error::Invalid);
        };

        let flush = if fs.state == MountState::Errored {
            // nothing more can be written safely
            Err(Error::Errored)
        } else {
            fs.flush_all().and_then(|()| {
                fs.sb.sb_umount = NVFUSE_UMOUNT_CLEAN;
                fs.write_superblock()?;
                fs.dev.flush()
            })
        };

        fs.bcache.drop_clean();
        inner.dev = Some(fs.dev);
        flush
    }

    /// Persists all dirty state without tearing the mount down.
    pub fn checkpoint(&self) -> CanFail<Error> {
        self.with_fs(true, |fs| fs.check_flush_dirty(true))
    }

    pub fn statvfs(&self) -> FsResult<StatVfs> {
        self.with_fs(false, |fs| Ok(fs.statvfs()))
    }

    // ---- files --------------------------------------------------------

    pub fn openfile_path(&self, path: &str, flags: OpenFlags, mode: u16) -> FsResult<u32> {
        let mutating = flags.intersects(OpenFlags::CREAT | OpenFlags::TRUNC);
        self.with_fs(mutating, |fs| fs.openfile_path(path, flags, mode))
    }

    pub fn closefile(&self, fd: u32) -> CanFail<Error> {
        self.with_fs(false, |fs| fs.closefile(fd))
    }

    pub fn readfile(&self, fd: u32, buf: &mut [u8]) -> FsResult<usize> {
        self.with_fs(false, |fs| fs.readfile(fd, buf))
    }

    pub fn writefile(&self, fd: u32, data: &[u8]) -> FsResult<usize> {
        self.with_fs(true, |fs| {
            let n = fs.writefile(fd, data)?;
            fs.check_flush_dirty(false)?;
            Ok(n)
        })
    }

    pub fn lseek(&self, fd: u32, offset: i64, whence: Whence) -> FsResult<i64> {
        self.with_fs(false, |fs| fs.lseek(fd, offset, whence))
    }

    pub fn ftruncate(&self, fd: u32, size: i64) -> CanFail<Error> {
        self.with_fs(true, |fs| fs.ftruncate(fd, size))
    }

    pub fn fsync(&self, fd: u32) -> CanFail<Error> {
        self.with_fs(true, |fs| fs.fsync(fd))
    }

    pub fn fallocate(&self, path: &str, offset: i64, len: i64) -> CanFail<Error> {
        self.with_fs(true, |fs| fs.fallocate_path(path, offset, len))
    }

    /// Creates a file of the given size (preallocated, zero-filled).
    pub fn mkfile(&self, path: &str, size: i64) -> CanFail<Error> {
        self.with_fs(true, |fs| {
            let fd = fs.openfile_path(path, OpenFlags::CREAT | OpenFlags::RDWR, 0o644)?;
            let res = if size > 0 {
                fs.fallocate_path(path, 0, size)
            } else {
                Ok(())
            };
            fs.closefile(fd)?;
            res
        })
    }

    // ---- directories --------------------------------------------------

    pub fn mkdir_path(&self, path: &str, mode: u16) -> CanFail<Error> {
        self.with_fs(true, |fs| {
            fs.mkdir_path(path, mode)?;
            fs.check_flush_dirty(false)
        })
    }

    pub fn rmdir_path(&self, path: &str) -> CanFail<Error> {
        self.with_fs(true, |fs| fs.rmdir_path(path))
    }

    /// Opens a directory stream; the returned descriptor feeds
    /// [`Nvfuse::readdir`].
    pub fn opendir(&self, path: &str) -> FsResult<u32> {
        self.with_fs(false, |fs| fs.opendir_path(path))
    }

    /// Returns the next live entry of the stream, skipping deleted and
    /// empty slots.
    pub fn readdir(&self, fd: u32) -> FsResult<Option<DirEntryInfo>> {
        self.with_fs(false, |fs| fs.readdir_fd(fd))
    }

    pub fn closedir(&self, fd: u32) -> CanFail<Error> {
        self.with_fs(false, |fs| fs.closefile(fd))
    }

    // ---- namespace ----------------------------------------------------

    pub fn unlink(&self, path: &str) -> CanFail<Error> {
        self.with_fs(true, |fs| fs.unlink_path(path))
    }

    /// Alias of [`Nvfuse::unlink`], matching the historical API surface.
    pub fn rmfile_path(&self, path: &str) -> CanFail<Error> {
        self.unlink(path)
    }

    pub fn rename_path(&self, old: &str, new: &str) -> CanFail<Error> {
        self.with_fs(true, |fs| fs.rename_path(old, new))
    }

    pub fn hardlink_path(&self, target: &str, linkpath: &str) -> CanFail<Error> {
        self.with_fs(true, |fs| fs.hardlink_path(target, linkpath))
    }

    pub fn symlink_path(&self, target: &str, linkpath: &str) -> CanFail<Error> {
        self.with_fs(true, |fs| fs.symlink_path(target, linkpath))
    }

    pub fn readlink(&self, path: &str) -> FsResult<Vec<u8>> {
        self.with_fs(false, |fs| fs.readlink_path(path))
    }

    pub fn access(&self, path: &str, mode: u16) -> CanFail<Error> {
        self.with_fs(false, |fs| fs.access_path(path, mode))
    }

    pub fn getattr(&self, path: &str) -> FsResult<FileAttr> {
        self.with_fs(false, |fs| fs.getattr_path(path))
    }

    pub fn chmod(&self, path: &str, mode: u16) -> CanFail<Error> {
        self.with_fs(true, |fs| fs.chmod_path(path, mode))
    }

    pub fn chdir(&self, path: &str) -> CanFail<Error> {
        self.with_fs(false, |fs| fs.chdir_path(path))
    }

    // ---- plumbing -----------------------------------------------------

    fn with_fs<T>(
        &self,
        mutating: bool,
        f: impl FnOnce(&mut NvfuseFs) -> FsResult<T>,
    ) -> FsResult<T> {
        let mut inner = self.inner.write();
        let fs = inner.fs.as_mut().ok_or(Error::Invalid)?;
        if mutating && fs.state == MountState::Errored {
            return Err(Error::Errored);
        }

        let res = f(fs);
        match &res {
            Err(Error::Corrupt) => {
                error!(target: "nvfuse", "invariant violation, mount goes read-only");
                fs.state = MountState::Errored;
            }
            Err(Error::Io(_)) if mutating => {
                error!(target: "nvfuse", "write path failed, mount goes read-only");
                fs.state = MountState::Errored;
            }
            _ => {}
        }
        res
    }
}

impl Drop for Nvfuse {
    fn drop(&mut self) {
        let needs_umount = self.inner.write().fs.is_some();
        if needs_umount {
            warn!(target: "nvfuse", "handle dropped while mounted, unmounting");
            let _ = self.umount();
        }
    }
}

/// One live entry returned by `readdir`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub ino: u32,
    pub name: String,
}

// ---- format / mount internals ----------------------------------------

fn format_device(dev: &mut Box<dyn BlockDevice>, params: &MountParams) -> CanFail<Error> {
    let total = dev.total_clusters();
    // both bitmaps are one cluster, which bounds the per-group capacities
    let clusters_per_bg = params.clusters_per_bg.clamp(64, (CLUSTER_SIZE * 8) as u32);
    let inodes_per_bg = params
        .inodes_per_bg
        .clamp(layout::INODE_ENTRY_NUM as u32, (CLUSTER_SIZE * 8) as u32)
        .next_multiple_of(layout::INODE_ENTRY_NUM as u32);

    let groups = device_groups(total, clusters_per_bg);
    if groups.is_empty() {
        return Err(Error::Invalid);
    }
    let covered: u64 = groups.iter().map(|&(_, n)| u64::from(n)).sum();

    let mut sb = Superblock::zeroed();
    sb.sb_signature = layout::NVFUSE_SB_SIGNATURE;
    sb.sb_umount = NVFUSE_UMOUNT_CLEAN;
    sb.sb_no_of_sectors = (covered * SECTORS_PER_CLUSTER as u64) as i64;
    sb.sb_no_of_blocks = covered as i64;
    sb.sb_no_of_inodes_per_bg = inodes_per_bg;
    sb.sb_no_of_blocks_per_bg = clusters_per_bg;
    sb.sb_root_ino = InodeNumber::ROOT;
    sb.sb_bg_num = groups.len() as u32;

    // the minimum viable group: header clusters, inode table and at least
    // one data cluster
    let itable_size = sb.itable_size();
    let min_clusters = NVFUSE_ITABLE_OFFSET + itable_size + 1;
    if groups[0].1 < min_clusters {
        return Err(Error::Invalid);
    }

    info!(
        target: "nvfuse",
        "format: {} clusters, {} groups of {} ({} inodes each)",
        covered, groups.len(), clusters_per_bg, inodes_per_bg
    );

    let zero = vec![0u8; CLUSTER_SIZE];
    let mut descriptors = Vec::with_capacity(groups.len());
    let mut cluster = vec![0u8; CLUSTER_SIZE];

    for &(bg, clusters_in_group) in &groups {
        let mut bd = BgDescriptor::init(&sb, bg, clusters_in_group);
        let start = sb.bg_start(bg);

        // inode bitmap: reserved numbers live in group 0
        cluster.fill(0);
        if bg == BlockGroupNumber::INITIAL {
            for ino in 0..NUM_RESV_INO {
                bitmap::set_bit(&mut cluster, ino);
            }
            bd.bd_free_inodes -= NUM_RESV_INO;
        }
        dev.write_clusters(BlkId(start + NVFUSE_IBITMAP_OFFSET), 1, &cluster)?;

        // data bitmap: metadata clusters and the bits past the group's
        // real extent are pre-marked used
        cluster.fill(0);
        for off in 0..bd.dtable_offset() {
            bitmap::set_bit(&mut cluster, off);
        }
        for off in clusters_in_group..(CLUSTER_SIZE * 8) as u32 {
            bitmap::set_bit(&mut cluster, off);
        }
        dev.write_clusters(BlkId(start + NVFUSE_DBITMAP_OFFSET), 1, &cluster)?;

        // zeroed inode table
        for n in 0..bd.bd_itable_size {
            dev.write_clusters(BlkId(bd.bd_itable_start + n), 1, &zero)?;
        }

        cluster.fill(0);
        bd.write_to_cluster(&mut cluster);
        dev.write_clusters(BlkId(start + NVFUSE_BD_OFFSET), 1, &cluster)?;
        descriptors.push(bd);
    }

    sb.sb_free_blocks = descriptors
        .iter()
        .map(|bd| i64::from(bd.bd_free_blocks))
        .sum();
    sb.sb_free_inodes = descriptors
        .iter()
        .map(|bd| i64::from(bd.bd_free_inodes))
        .sum::<i64>() as i32;
    sb.sb_no_of_used_blocks = sb.sb_no_of_blocks - sb.sb_free_blocks;
    sb.sb_last_allocated_ino = NUM_RESV_INO;

    sb.write_to_cluster(&mut cluster);
    dev.write_clusters(BlkId(0), 1, &cluster)?;

    // build the root directory through the regular machinery
    let tmp_dev: Box<dyn BlockDevice> = std::mem::replace(dev, Box::new(NullDevice));
    let mut fs = NvfuseFs::assemble(tmp_dev, sb, descriptors, params);

    let res = (|| -> CanFail<Error> {
        let root = InodeNumber::ROOT;
        let bpino = fs.create_bptree()?;

        let mut inode = Inode::init(root, InodeType::Directory, 0o755);
        inode.i_bpino = bpino;
        inode.i_links_count = 2;
        fs.install_ictx(root, inode);

        fs.dir_link_entry(root, bpino, b".", root)?;
        fs.dir_link_entry(root, bpino, b"..", root)?;

        fs.release_ictx(bpino, false);
        fs.release_ictx(root, true);
        fs.flush_all()?;
        fs.sb.sb_umount = NVFUSE_UMOUNT_CLEAN;
        fs.write_superblock()
    })();

    *dev = fs.dev;
    res
}

fn mount_device(dev: &mut Box<dyn BlockDevice>, params: &MountParams) -> FsResult<NvfuseFs> {
    let mut cluster = vec![0u8; CLUSTER_SIZE];
    dev.read_clusters(BlkId(0), 1, &mut cluster)?;
    let sb = Superblock::from_cluster(&cluster);
    if !sb.is_valid() {
        error!(target: "nvfuse", "bad superblock signature");
        return Err(Error::Corrupt);
    }

    let mut descriptors = Vec::with_capacity(sb.sb_bg_num as usize);
    for g in 0..sb.sb_bg_num {
        let bg = BlockGroupNumber(g);
        let blk = BlkId(sb.bg_start(bg) + NVFUSE_BD_OFFSET);
        dev.read_clusters(blk, 1, &mut cluster)?;
        let bd = BgDescriptor::from_cluster(&cluster);
        if !bd.is_valid() || bd.bd_id != bg {
            error!(target: "nvfuse", "bad descriptor signature in group {bg}");
            return Err(Error::Corrupt);
        }
        descriptors.push(bd);
    }

    let tmp_dev = std::mem::replace(dev, Box::new(NullDevice));
    Ok(NvfuseFs::assemble(tmp_dev, sb, descriptors, params))
}

/// Placeholder device standing in while ownership moves between the handle
/// and a mount instance.
struct NullDevice;

impl BlockDevice for NullDevice {
    fn open(&mut self) -> CanFail<Error> {
        Err(Error::Invalid)
    }

    fn close(&mut self) -> CanFail<Error> {
        Ok(())
    }

    fn read_clusters(&mut self, _: BlkId, _: usize, _: &mut [u8]) -> CanFail<Error> {
        Err(Error::Invalid)
    }

    fn write_clusters(&mut self, _: BlkId, _: usize, _: &[u8]) -> CanFail<Error> {
        Err(Error::Invalid)
    }

    fn total_clusters(&self) -> u64 {
        0
    }

    fn flush(&mut self) -> CanFail<Error> {
        Err(Error::Invalid)
    }

    fn submit(
        &mut self,
        _: Vec<crate::drivers::block::queue::IoJob>,
        _: &mut Vec<crate::drivers::block::queue::IoJob>,
    ) -> FsResult<usize> {
        Err(Error::Invalid)
    }

    fn poll_complete(&mut self) -> FsResult<usize> {
        Err(Error::Invalid)
    }

    fn next_completion(&mut self) -> Option<crate::drivers::block::queue::IoJob> {
        None
    }

    fn pending(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Routes `log` output through the test harness; `RUST_LOG` selects
    /// the level.
    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// 16 MiB RAM device, two 8 MiB groups, small caches.
    fn test_handle() -> Nvfuse {
        init_logger();
        let nvh = Nvfuse::create_handle(
            DeviceKind::Mem,
            DeviceParams {
                size_bytes: 4096 * CLUSTER_SIZE as u64,
                ..Default::default()
            },
            MountParams {
                buffer_pool_clusters: 256,
                ictx_cache_size: 64,
                clusters_per_bg: 2048,
                inodes_per_bg: 512,
            },
        )
        .unwrap();
        nvh.format().unwrap();
        nvh.mount().unwrap();
        nvh
    }

    #[test]
    fn format_and_remount_round_trip() {
        let nvh = test_handle();
        let before = nvh.statvfs().unwrap();
        assert_eq!(before.f_bsize, CLUSTER_SIZE as u64);
        assert!(before.f_bfree > 0);
        assert_eq!(before.f_files, 2 * 512);

        nvh.umount().unwrap();
        nvh.mount().unwrap();
        let after = nvh.statvfs().unwrap();
        assert_eq!(before, after);
        nvh.destroy_handle().unwrap();
    }

    #[test]
    fn root_directory_lists_dot_entries() {
        let nvh = test_handle();
        let fd = nvh.opendir("/").unwrap();
        let mut names = Vec::new();
        while let Some(entry) = nvh.readdir(fd).unwrap() {
            names.push(entry.name);
        }
        nvh.closedir(fd).unwrap();
        assert_eq!(names, vec![".".to_string(), "..".to_string()]);
    }

    #[test]
    fn write_read_round_trip_unaligned() {
        let nvh = test_handle();
        let fd = nvh
            .openfile_path("/data", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
            .unwrap();

        // an awkward length crossing three clusters, at an unaligned start
        let payload: Vec<u8> = (0..CLUSTER_SIZE * 2 + 777).map(|i| (i % 251) as u8).collect();
        nvh.lseek(fd, 123, Whence::Set).unwrap();
        assert_eq!(nvh.writefile(fd, &payload).unwrap(), payload.len());

        nvh.lseek(fd, 123, Whence::Set).unwrap();
        let mut back = vec![0u8; payload.len()];
        assert_eq!(nvh.readfile(fd, &mut back).unwrap(), payload.len());
        assert_eq!(back, payload);

        let attr = nvh.getattr("/data").unwrap();
        assert_eq!(attr.size, 123 + payload.len() as i64);
        nvh.closefile(fd).unwrap();
        nvh.destroy_handle().unwrap();
    }

    #[test]
    fn create_is_exclusive_and_unlink_removes() {
        let nvh = test_handle();
        let fd = nvh
            .openfile_path("/once", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
            .unwrap();
        nvh.closefile(fd).unwrap();
        assert!(nvh.getattr("/once").is_ok());

        // creation is exclusive over an existing name
        assert_eq!(
            nvh.openfile_path("/once", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
                .unwrap_err(),
            Error::Exists
        );

        nvh.unlink("/once").unwrap();
        assert_eq!(nvh.getattr("/once").unwrap_err(), Error::NotFound);
        assert_eq!(nvh.unlink("/once").unwrap_err(), Error::NotFound);

        // the name is free again
        let fd = nvh
            .openfile_path("/once", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
            .unwrap();
        nvh.closefile(fd).unwrap();
        nvh.destroy_handle().unwrap();
    }

    #[test]
    fn mkdir_rmdir_restores_counters() {
        let nvh = test_handle();
        let before = nvh.statvfs().unwrap();

        nvh.mkdir_path("/sub", 0o755).unwrap();
        assert!(nvh.getattr("/sub").unwrap().is_dir);
        let during = nvh.statvfs().unwrap();
        assert!(during.f_bfree < before.f_bfree);
        assert_eq!(during.f_ffree, before.f_ffree - 2); // dir + index inode

        nvh.rmdir_path("/sub").unwrap();
        let after = nvh.statvfs().unwrap();
        assert_eq!(after.f_bfree, before.f_bfree);
        assert_eq!(after.f_ffree, before.f_ffree);
        nvh.destroy_handle().unwrap();
    }

    #[test]
    fn rmdir_refuses_non_empty_directories() {
        let nvh = test_handle();
        nvh.mkdir_path("/d", 0o755).unwrap();
        let fd = nvh
            .openfile_path("/d/f", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
            .unwrap();
        nvh.closefile(fd).unwrap();

        assert_eq!(nvh.rmdir_path("/d").unwrap_err(), Error::NotEmpty);
        nvh.unlink("/d/f").unwrap();
        nvh.rmdir_path("/d").unwrap();
        nvh.destroy_handle().unwrap();
    }

    #[test]
    fn sparse_files_read_zeros_in_holes() {
        let nvh = test_handle();
        let fd = nvh
            .openfile_path("/sparse", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
            .unwrap();

        let block = vec![0xABu8; CLUSTER_SIZE];
        nvh.writefile(fd, &block).unwrap();

        // land in the double-indirect range: (11 + 1024 + 5) clusters in
        let far = (11 + 1024 + 5) * CLUSTER_SIZE as i64;
        nvh.lseek(fd, far, Whence::Set).unwrap();
        nvh.writefile(fd, &block).unwrap();

        let attr = nvh.getattr("/sparse").unwrap();
        assert_eq!(attr.size, far + CLUSTER_SIZE as i64);

        // a hole in the middle reads as zeros
        nvh.lseek(fd, far / 2, Whence::Set).unwrap();
        let mut hole = vec![0xFFu8; 512];
        assert_eq!(nvh.readfile(fd, &mut hole).unwrap(), 512);
        assert!(hole.iter().all(|&b| b == 0));

        // the two written extents read back intact
        nvh.lseek(fd, far, Whence::Set).unwrap();
        let mut back = vec![0u8; CLUSTER_SIZE];
        nvh.readfile(fd, &mut back).unwrap();
        assert_eq!(back, block);

        nvh.closefile(fd).unwrap();
        nvh.destroy_handle().unwrap();
    }

    #[test]
    fn rename_refuses_existing_target() {
        let nvh = test_handle();
        for p in ["/x", "/y"] {
            let fd = nvh
                .openfile_path(p, OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
                .unwrap();
            nvh.closefile(fd).unwrap();
        }

        assert_eq!(nvh.rename_path("/x", "/y").unwrap_err(), Error::Exists);
        nvh.unlink("/y").unwrap();
        nvh.rename_path("/x", "/y").unwrap();
        assert_eq!(nvh.getattr("/x").unwrap_err(), Error::NotFound);
        assert!(nvh.getattr("/y").is_ok());
        nvh.destroy_handle().unwrap();
    }

    #[test]
    fn rename_across_directories_moves_the_entry() {
        let nvh = test_handle();
        nvh.mkdir_path("/a", 0o755).unwrap();
        nvh.mkdir_path("/b", 0o755).unwrap();
        let fd = nvh
            .openfile_path("/a/f", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
            .unwrap();
        nvh.writefile(fd, b"payload").unwrap();
        nvh.closefile(fd).unwrap();

        nvh.rename_path("/a/f", "/b/g").unwrap();
        assert_eq!(nvh.getattr("/a/f").unwrap_err(), Error::NotFound);
        assert_eq!(nvh.getattr("/b/g").unwrap().size, 7);
        nvh.destroy_handle().unwrap();
    }

    #[test]
    fn nested_directories_resolve() {
        let nvh = test_handle();
        nvh.mkdir_path("/a", 0o755).unwrap();
        nvh.mkdir_path("/a/b", 0o755).unwrap();
        nvh.mkdir_path("/a/b/c", 0o755).unwrap();

        let fd = nvh
            .openfile_path("/a/b/c/leaf", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
            .unwrap();
        nvh.writefile(fd, b"deep").unwrap();
        nvh.closefile(fd).unwrap();

        assert_eq!(nvh.getattr("/a/b/c/leaf").unwrap().size, 4);
        // dot components collapse
        assert_eq!(nvh.getattr("/a/./b/./c/leaf").unwrap().size, 4);
        // dot-dot walks up through the stored entries
        assert_eq!(nvh.getattr("/a/b/c/../c/leaf").unwrap().size, 4);
        nvh.destroy_handle().unwrap();
    }

    #[test]
    fn hardlinks_share_the_inode() {
        let nvh = test_handle();
        let fd = nvh
            .openfile_path("/orig", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
            .unwrap();
        nvh.writefile(fd, b"shared").unwrap();
        nvh.closefile(fd).unwrap();

        nvh.hardlink_path("/orig", "/alias").unwrap();
        let a = nvh.getattr("/orig").unwrap();
        let b = nvh.getattr("/alias").unwrap();
        assert_eq!(a.ino, b.ino);
        assert_eq!(a.nlink, 2);

        // data survives dropping the original name
        nvh.unlink("/orig").unwrap();
        let fd = nvh.openfile_path("/alias", OpenFlags::RDWR, 0).unwrap();
        let mut back = [0u8; 6];
        nvh.readfile(fd, &mut back).unwrap();
        assert_eq!(&back, b"shared");
        nvh.closefile(fd).unwrap();
        nvh.destroy_handle().unwrap();
    }

    #[test]
    fn symlinks_resolve_and_readlink_reports_target() {
        let nvh = test_handle();
        nvh.mkdir_path("/real", 0o755).unwrap();
        let fd = nvh
            .openfile_path("/real/f", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
            .unwrap();
        nvh.writefile(fd, b"via-link").unwrap();
        nvh.closefile(fd).unwrap();

        nvh.symlink_path("/real", "/link").unwrap();
        assert_eq!(nvh.readlink("/link").unwrap(), b"/real".to_vec());
        assert_eq!(nvh.getattr("/link/f").unwrap().size, 8);
        // getattr follows the trailing link to the directory
        assert!(nvh.getattr("/link").unwrap().is_dir);
        nvh.destroy_handle().unwrap();
    }

    #[test]
    fn long_names_hit_the_limit_exactly()
    {
        let nvh = test_handle();
        let ok_name = format!("/{}", "n".repeat(layout::FNAME_SIZE - 1));
        let fd = nvh
            .openfile_path(&ok_name, OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
            .unwrap();
        nvh.closefile(fd).unwrap();
        assert!(nvh.getattr(&ok_name).is_ok());

        let too_long = format!("/{}", "n".repeat(layout::FNAME_SIZE));
        assert_eq!(
            nvh.openfile_path(&too_long, OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
                .unwrap_err(),
            Error::Invalid
        );
        nvh.destroy_handle().unwrap();
    }

    #[test]
    fn write_past_max_file_size_is_too_large() {
        let nvh = test_handle();
        let fd = nvh
            .openfile_path("/big", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
            .unwrap();
        nvh.lseek(fd, layout::MAX_FILE_SIZE as i64, Whence::Set).unwrap();
        assert_eq!(nvh.writefile(fd, b"x").unwrap_err(), Error::TooLarge);
        nvh.closefile(fd).unwrap();
        nvh.destroy_handle().unwrap();
    }

    #[test]
    fn ftruncate_releases_blocks() {
        let nvh = test_handle();
        let before = nvh.statvfs().unwrap();

        let fd = nvh
            .openfile_path("/t", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
            .unwrap();
        let chunk = vec![7u8; CLUSTER_SIZE * 20];
        nvh.writefile(fd, &chunk).unwrap();
        assert!(nvh.statvfs().unwrap().f_bfree < before.f_bfree);

        nvh.ftruncate(fd, 0).unwrap();
        assert_eq!(nvh.getattr("/t").unwrap().size, 0);
        nvh.closefile(fd).unwrap();
        nvh.unlink("/t").unwrap();

        let after = nvh.statvfs().unwrap();
        assert_eq!(after.f_bfree, before.f_bfree);
        assert_eq!(after.f_ffree, before.f_ffree);
        nvh.destroy_handle().unwrap();
    }

    #[test]
    fn many_files_exercise_the_directory_index() {
        let nvh = test_handle();
        nvh.mkdir_path("/pile", 0o755).unwrap();
        let before = nvh.statvfs().unwrap();

        // enough names to split B+tree leaves and span several entry
        // clusters
        for n in 0..600 {
            let path = format!("/pile/file{n}");
            let fd = nvh
                .openfile_path(&path, OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
                .unwrap();
            nvh.closefile(fd).unwrap();
        }
        for n in 0..600 {
            let attr = nvh.getattr(&format!("/pile/file{n}")).unwrap();
            assert!(!attr.is_dir);
        }
        for n in 0..600 {
            nvh.unlink(&format!("/pile/file{n}")).unwrap();
        }

        let after = nvh.statvfs().unwrap();
        assert_eq!(after.f_ffree, before.f_ffree);
        nvh.destroy_handle().unwrap();
    }

    #[test]
    fn contents_survive_umount_and_remount() {
        let nvh = test_handle();
        let payload: Vec<u8> = (0..CLUSTER_SIZE * 5 + 31).map(|i| (i * 7 % 256) as u8).collect();

        nvh.mkdir_path("/keep", 0o755).unwrap();
        let fd = nvh
            .openfile_path("/keep/blob", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
            .unwrap();
        nvh.writefile(fd, &payload).unwrap();
        nvh.fsync(fd).unwrap();
        nvh.closefile(fd).unwrap();

        nvh.umount().unwrap();
        nvh.mount().unwrap();

        let fd = nvh.openfile_path("/keep/blob", OpenFlags::RDWR, 0).unwrap();
        let mut back = vec![0u8; payload.len()];
        assert_eq!(nvh.readfile(fd, &mut back).unwrap(), payload.len());
        assert_eq!(back, payload);
        nvh.closefile(fd).unwrap();
        nvh.destroy_handle().unwrap();
    }

    #[test]
    fn dirty_remount_recovers_counters_from_bitmaps() {
        init_logger();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crash.img");
        let dev_params = DeviceParams {
            path: path.to_str().unwrap().into(),
            size_bytes: 4096 * CLUSTER_SIZE as u64,
            ..Default::default()
        };
        let mount_params = MountParams {
            buffer_pool_clusters: 256,
            ictx_cache_size: 64,
            clusters_per_bg: 2048,
            inodes_per_bg: 512,
        };

        let nvh = Nvfuse::create_handle(
            DeviceKind::File,
            dev_params.clone(),
            mount_params.clone(),
        )
        .unwrap();
        nvh.format().unwrap();
        nvh.mount().unwrap();

        let fd = nvh
            .openfile_path("/f", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
            .unwrap();
        let payload = vec![0x3Cu8; CLUSTER_SIZE * 8];
        nvh.writefile(fd, &payload).unwrap();
        nvh.fsync(fd).unwrap();

        // crash: never unmount, never flush again
        std::mem::forget(nvh);

        let nvh =
            Nvfuse::create_handle(DeviceKind::File, dev_params, mount_params).unwrap();
        nvh.mount().unwrap();

        // the scrubbed counters must balance against the descriptors
        let stat = nvh.statvfs().unwrap();
        assert!(stat.f_bfree > 0);

        // and the synced file survived intact
        let fd = nvh.openfile_path("/f", OpenFlags::RDWR, 0).unwrap();
        let mut back = vec![0u8; payload.len()];
        nvh.readfile(fd, &mut back).unwrap();
        assert_eq!(back, payload);
        nvh.closefile(fd).unwrap();
        nvh.destroy_handle().unwrap();
    }

    #[test]
    fn fallocate_preallocates_and_extends() {
        let nvh = test_handle();
        let fd = nvh
            .openfile_path("/pre", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
            .unwrap();
        nvh.closefile(fd).unwrap();

        let before = nvh.statvfs().unwrap();
        nvh.fallocate("/pre", 0, 10 * CLUSTER_SIZE as i64).unwrap();
        let after = nvh.statvfs().unwrap();

        assert_eq!(nvh.getattr("/pre").unwrap().size, 10 * CLUSTER_SIZE as i64);
        assert!(after.f_bfree <= before.f_bfree - 10);

        // preallocated space reads as zeros
        let fd = nvh.openfile_path("/pre", OpenFlags::RDWR, 0).unwrap();
        let mut back = vec![0xEEu8; CLUSTER_SIZE];
        nvh.readfile(fd, &mut back).unwrap();
        assert!(back.iter().all(|&b| b == 0));
        nvh.closefile(fd).unwrap();
        nvh.destroy_handle().unwrap();
    }

    #[test]
    fn chmod_updates_permission_bits() {
        let nvh = test_handle();
        let fd = nvh
            .openfile_path("/m", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
            .unwrap();
        nvh.closefile(fd).unwrap();

        nvh.chmod("/m", 0o600).unwrap();
        assert_eq!(nvh.getattr("/m").unwrap().mode & 0o777, 0o600);
        nvh.access("/m", 0o600).unwrap();
        nvh.destroy_handle().unwrap();
    }

    #[test]
    fn unlinked_open_files_keep_their_data_until_close() {
        let nvh = test_handle();
        let fd = nvh
            .openfile_path("/tmpfile", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
            .unwrap();
        nvh.writefile(fd, b"still-here").unwrap();

        nvh.unlink("/tmpfile").unwrap();
        assert_eq!(nvh.getattr("/tmpfile").unwrap_err(), Error::NotFound);

        // the open descriptor still reads the data
        nvh.lseek(fd, 0, Whence::Set).unwrap();
        let mut back = [0u8; 10];
        nvh.readfile(fd, &mut back).unwrap();
        assert_eq!(&back, b"still-here");

        let before = nvh.statvfs().unwrap();
        nvh.closefile(fd).unwrap();
        let after = nvh.statvfs().unwrap();
        assert!(after.f_ffree > before.f_ffree);
        nvh.destroy_handle().unwrap();
    }
}
