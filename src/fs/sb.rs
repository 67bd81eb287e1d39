//! On-disk superblock.
//!
//! The superblock lives in cluster 0 of the device and carries the global
//! geometry plus the cached free counters. The authoritative free counts
//! are the per-block-group descriptors; the superblock copies are restored
//! from them during the dirty-mount scan.

use bytemuck::{Pod, Zeroable};

use crate::fs::layout::{
    BlockGroupNumber, InodeNumber, CLUSTER_SIZE, INODE_ENTRY_NUM, NVFUSE_SB_SIGNATURE,
};

/// Filesystem state: unmounted cleanly.
pub const NVFUSE_UMOUNT_CLEAN: u32 = 1;

/// Filesystem state: mounted, or torn down without an unmount.
pub const NVFUSE_UMOUNT_DIRTY: u32 = 0;

/// The on-disk superblock structure, located in cluster 0.
///
/// All fields are stored little-endian. The layout is padding-free so the
/// structure can be cast directly over the first bytes of the cluster.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Superblock {
    /// Superblock signature ([`NVFUSE_SB_SIGNATURE`]).
    pub sb_signature: u32,

    /// Clean-unmount flag ([`NVFUSE_UMOUNT_CLEAN`] after a proper unmount).
    pub sb_umount: u32,

    /// Total number of 512-byte sectors on the device.
    pub sb_no_of_sectors: i64,

    /// Total number of clusters on the device.
    pub sb_no_of_blocks: i64,

    /// Clusters currently allocated (filesystem view).
    pub sb_no_of_used_blocks: i64,

    /// Free cluster count (cached; descriptors are authoritative).
    pub sb_free_blocks: i64,

    /// Inodes per block group.
    pub sb_no_of_inodes_per_bg: u32,

    /// Clusters per block group.
    pub sb_no_of_blocks_per_bg: u32,

    /// Root directory inode.
    pub sb_root_ino: InodeNumber,

    /// Free inode count (cached; descriptors are authoritative).
    pub sb_free_inodes: i32,

    /// Number of block groups.
    pub sb_bg_num: u32,

    /// Mounts since format.
    pub sb_mount_cnt: i32,

    /// Allocation hint: last inode number handed out.
    pub sb_last_allocated_ino: u32,

    /// Allocation hint: block group of the last data allocation.
    pub sb_last_allocated_bgid: u32,

    /// Allocation hint: block group of the last inode allocation.
    pub sb_last_allocated_bgid_by_ino: u32,

    reserved: [u8; 52],
}

impl Superblock {
    /// Checks the superblock signature.
    pub fn is_valid(&self) -> bool {
        self.sb_signature == NVFUSE_SB_SIGNATURE
    }

    /// Number of inode table clusters in every block group.
    pub fn itable_size(&self) -> u32 {
        self.sb_no_of_inodes_per_bg / INODE_ENTRY_NUM as u32
    }

    /// Block group containing the given inode number.
    pub fn bg_of_inode(&self, ino: InodeNumber) -> BlockGroupNumber {
        BlockGroupNumber(ino.0 / self.sb_no_of_inodes_per_bg)
    }

    /// Slot of the given inode within its block group's inode table.
    pub fn inode_slot_in_bg(&self, ino: InodeNumber) -> u32 {
        ino.0 % self.sb_no_of_inodes_per_bg
    }

    /// Block group containing the given physical cluster.
    pub fn bg_of_block(&self, blk: u32) -> BlockGroupNumber {
        BlockGroupNumber(blk / self.sb_no_of_blocks_per_bg)
    }

    /// First cluster of the given block group.
    pub fn bg_start(&self, bg: BlockGroupNumber) -> u32 {
        bg.0 * self.sb_no_of_blocks_per_bg
    }

    /// Decodes the superblock from the first cluster of the device.
    pub fn from_cluster(buf: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(&buf[..core::mem::size_of::<Self>()])
    }

    /// Encodes the superblock into the first bytes of a cluster buffer.
    pub fn write_to_cluster(&self, buf: &mut [u8]) {
        buf[..core::mem::size_of::<Self>()].copy_from_slice(bytemuck::bytes_of(self));
        buf[core::mem::size_of::<Self>()..].fill(0);
    }
}

/// Filesystem statistics reported by `statvfs`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatVfs {
    /// Filesystem block size.
    pub f_bsize: u64,

    /// Total data clusters.
    pub f_blocks: u64,

    /// Free clusters.
    pub f_bfree: u64,

    /// Free clusters available to unprivileged users.
    pub f_bavail: u64,

    /// Total inodes.
    pub f_files: u64,

    /// Free inodes.
    pub f_ffree: u64,

    /// Maximum filename length.
    pub f_namemax: u64,
}

const _: () = assert!(core::mem::size_of::<Superblock>() == 128);
const _: () = assert!(core::mem::size_of::<Superblock>() <= CLUSTER_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_round_trip_preserves_fields() {
        let mut sb = Superblock::zeroed();
        sb.sb_signature = NVFUSE_SB_SIGNATURE;
        sb.sb_no_of_blocks = 32768;
        sb.sb_no_of_blocks_per_bg = 32768;
        sb.sb_no_of_inodes_per_bg = 8192;
        sb.sb_root_ino = InodeNumber::ROOT;
        sb.sb_free_blocks = 1000;

        let mut cluster = vec![0u8; CLUSTER_SIZE];
        sb.write_to_cluster(&mut cluster);
        let back = Superblock::from_cluster(&cluster);
        assert!(back.is_valid());
        assert_eq!(back.sb_free_blocks, 1000);
        assert_eq!(back.sb_root_ino, InodeNumber::ROOT);
    }

    #[test]
    fn inode_geometry_maps_into_groups() {
        let mut sb = Superblock::zeroed();
        sb.sb_no_of_inodes_per_bg = 8192;
        sb.sb_no_of_blocks_per_bg = 32768;

        assert_eq!(sb.bg_of_inode(InodeNumber(2)), BlockGroupNumber(0));
        assert_eq!(sb.bg_of_inode(InodeNumber(8192 + 7)), BlockGroupNumber(1));
        assert_eq!(sb.inode_slot_in_bg(InodeNumber(8192 + 7)), 7);
        assert_eq!(sb.itable_size(), 256);
    }
}
