//! On-disk layout constants and identifier newtypes.
//!
//! Everything here describes fixed properties of the disk format: cluster
//! geometry, reserved inode numbers, per-block-group offsets and the
//! indirect addressing limits. The identifier newtypes keep inode numbers,
//! physical cluster ids, file-relative block ids and block group numbers
//! from being mixed up at compile time.

use bytemuck::{Pod, Zeroable};
use core::fmt::{self, Display};

/// Filesystem-level allocation unit, in bytes.
pub const CLUSTER_SIZE: usize = 4096;

/// `log2(CLUSTER_SIZE)`
pub const CLUSTER_SIZE_BITS: u32 = 12;

/// Device-level sector size, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sectors per cluster.
pub const SECTORS_PER_CLUSTER: usize = CLUSTER_SIZE / SECTOR_SIZE;

/// Superblock signature.
pub const NVFUSE_SB_SIGNATURE: u32 = 0x756c_6673;

/// Block group descriptor signature.
pub const NVFUSE_BD_SIGNATURE: u32 = 0x709d_2233;

/// Size of an on-disk inode entry, in bytes.
pub const INODE_ENTRY_SIZE: usize = 128;

/// Inode entries per cluster.
pub const INODE_ENTRY_NUM: usize = CLUSTER_SIZE / INODE_ENTRY_SIZE;

/// Size of an on-disk directory entry, in bytes.
pub const DIR_ENTRY_SIZE: usize = 128;

/// Directory entries per cluster.
pub const DIR_ENTRY_NUM: usize = CLUSTER_SIZE / DIR_ENTRY_SIZE;

/// Maximum filename length (the on-disk field keeps one byte for the NUL).
pub const FNAME_SIZE: usize = 116;

/// Direct block pointers per inode.
pub const DIRECT_BLOCKS: usize = 11;

/// Index of the single-indirect pointer in `i_blocks`.
pub const INDIRECT_BLOCKS: usize = 11;

/// Index of the double-indirect pointer in `i_blocks`.
pub const DINDIRECT_BLOCKS: usize = 12;

/// Index of the triple-indirect pointer in `i_blocks`.
pub const TINDIRECT_BLOCKS: usize = 13;

/// Physical block pointers held by one indirect cluster.
pub const PTRS_PER_BLOCK: usize = CLUSTER_SIZE / core::mem::size_of::<u32>();

/// `log2(PTRS_PER_BLOCK)`
pub const PTRS_PER_BLOCK_BITS: u32 = 10;

/// Largest addressable file size, in bytes.
pub const MAX_FILE_SIZE: u64 = (DIRECT_BLOCKS as u64
    + (1 << PTRS_PER_BLOCK_BITS)
    + (1 << (PTRS_PER_BLOCK_BITS * 2))
    + (1 << (PTRS_PER_BLOCK_BITS * 3)))
    * CLUSTER_SIZE as u64;

/// Cluster offset of the descriptor within its block group.
pub const NVFUSE_BD_OFFSET: u32 = 1;

/// Cluster offset of the inode bitmap within its block group.
pub const NVFUSE_IBITMAP_OFFSET: u32 = 2;

/// Cluster offset of the data bitmap within its block group.
pub const NVFUSE_DBITMAP_OFFSET: u32 = 3;

/// Cluster offset of the inode table within its block group.
pub const NVFUSE_ITABLE_OFFSET: u32 = 4;

/// Default clusters per block group (128 MiB). One 4 KiB data bitmap
/// addresses exactly this many clusters.
pub const DEFAULT_CLUSTERS_PER_BG: u32 = (CLUSTER_SIZE * 8) as u32;

/// Number of reserved inode numbers at the bottom of the namespace.
pub const NUM_RESV_INO: u32 = 8;

/// Bits of a directory index key reserved for hash collision chaining.
pub const BP_COLLISION_BITS: u32 = 2;

/// Maximum number of simultaneously open files per mount.
pub const MAX_OPEN_FILE: usize = 16;

/// First usable open file table index (0-2 mirror stdio).
pub const START_OPEN_FILE: usize = 3;

/// Bound on symbolic link resolution depth during a path walk.
pub const SYMLINK_MAX_DEPTH: usize = 8;

/// An inode number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct InodeNumber(pub u32);

impl InodeNumber {
    /// Marks an unused inode slot or directory entry.
    pub const NULL: Self = Self(0);

    /// The root directory.
    pub const ROOT: Self = Self(2);

    /// Identity under which raw metadata block I/O is cached.
    pub const BLOCK_IO: Self = Self(3);

    /// Identity under which block group descriptor clusters are cached.
    pub const BD: Self = Self(4);

    /// Identity under which inode table clusters are cached.
    pub const ITABLE: Self = Self(5);

    /// Identity under which data bitmap clusters are cached.
    pub const DBITMAP: Self = Self(6);

    /// Identity under which inode bitmap clusters are cached.
    pub const IBITMAP: Self = Self(7);

    /// Whether this number is one of the reserved metadata identities used
    /// as buffer cache key classes rather than a real on-disk inode.
    pub fn is_meta_class(self) -> bool {
        self.0 >= Self::BLOCK_IO.0 && self.0 <= Self::IBITMAP.0
    }
}

impl Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<InodeNumber> for u32 {
    fn from(value: InodeNumber) -> Self {
        value.0
    }
}

/// A physical cluster number on the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct BlkId(pub u32);

impl BlkId {
    /// The sparse / unallocated marker in block pointer slots.
    pub const NULL: Self = Self(0);

    /// Byte offset of this cluster on the device.
    pub fn byte_offset(self) -> u64 {
        u64::from(self.0) << CLUSTER_SIZE_BITS
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl Display for BlkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl core::ops::Add<u32> for BlkId {
    type Output = BlkId;

    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

/// A block id relative to the start of an inode's data (logical block).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct LbnId(pub u32);

impl Display for LbnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl LbnId {
    /// Logical block containing the given byte offset.
    pub fn containing(offset: u64) -> Self {
        Self((offset >> CLUSTER_SIZE_BITS) as u32)
    }
}

impl core::ops::Add<u32> for LbnId {
    type Output = LbnId;

    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

/// A number representing a block group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct BlockGroupNumber(pub u32);

impl BlockGroupNumber {
    /// First block group of a filesystem.
    pub const INITIAL: Self = Self(0);
}

impl Display for BlockGroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl core::ops::Add<u32> for BlockGroupNumber {
    type Output = BlockGroupNumber;

    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0.saturating_add(rhs))
    }
}

/// On-disk inode type discriminants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum InodeType {
    Unknown = 1,
    Special = 2,
    Inode = 3,
    File = 4,
    Indirect = 5,
    Directory = 6,
    Time = 7,
    BpTree = 8,
}

impl InodeType {
    /// Decodes the on-disk `i_type` field.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => InodeType::Unknown,
            2 => InodeType::Special,
            3 => InodeType::Inode,
            4 => InodeType::File,
            5 => InodeType::Indirect,
            6 => InodeType::Directory,
            7 => InodeType::Time,
            8 => InodeType::BpTree,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_file_size_matches_addressing_limits() {
        let clusters = DIRECT_BLOCKS as u64
            + PTRS_PER_BLOCK as u64
            + (PTRS_PER_BLOCK * PTRS_PER_BLOCK) as u64
            + (PTRS_PER_BLOCK * PTRS_PER_BLOCK * PTRS_PER_BLOCK) as u64;
        assert_eq!(MAX_FILE_SIZE, clusters * CLUSTER_SIZE as u64);
    }

    #[test]
    fn meta_class_covers_reserved_cache_identities() {
        assert!(InodeNumber::ITABLE.is_meta_class());
        assert!(InodeNumber::IBITMAP.is_meta_class());
        assert!(!InodeNumber::ROOT.is_meta_class());
        assert!(!InodeNumber(NUM_RESV_INO).is_meta_class());
    }
}
