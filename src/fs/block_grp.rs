//! Block group descriptors and the block group manager.
//!
//! A block group is a contiguous, aligned run of clusters carrying its own
//! descriptor, bitmaps, inode table and data table at fixed offsets from
//! the group start. The manager owns the ordered list of groups belonging
//! to this mount, plus the two rotating allocation cursors (one for inode
//! allocation, one for data allocation). In multi-tenant deployments the
//! list would grow and shrink through a coordinator process; this mount
//! model owns every group on the device, and the issue/reclaim entry
//! points act on the local list only.

use bytemuck::{Pod, Zeroable};

use crate::errors::{Error, FsResult};
use crate::fs::layout::{
    BlockGroupNumber, CLUSTER_SIZE, NVFUSE_BD_OFFSET, NVFUSE_BD_SIGNATURE, NVFUSE_DBITMAP_OFFSET,
    NVFUSE_IBITMAP_OFFSET, NVFUSE_ITABLE_OFFSET,
};
use crate::fs::sb::Superblock;

/// Block group descriptor, located at the second cluster of its group.
///
/// Start fields are absolute cluster ids; size fields are cluster counts.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct BgDescriptor {
    /// Descriptor signature ([`NVFUSE_BD_SIGNATURE`]).
    pub bd_magic: u32,

    /// Owning tenant id (0 for a single-tenant mount).
    pub bd_owner: u32,

    /// Group id.
    pub bd_id: BlockGroupNumber,

    /// First cluster of the group.
    pub bd_bg_start: u32,

    /// Cluster holding this descriptor.
    pub bd_bd_start: u32,

    /// Inode capacity of the group.
    pub bd_max_inodes: u32,

    /// Data cluster capacity of the group (data table only).
    pub bd_max_blocks: u32,

    /// Inode bitmap location.
    pub bd_ibitmap_start: u32,
    pub bd_ibitmap_size: u32,

    /// Data bitmap location.
    pub bd_dbitmap_start: u32,
    pub bd_dbitmap_size: u32,

    /// Inode table location.
    pub bd_itable_start: u32,
    pub bd_itable_size: u32,

    /// Data table location.
    pub bd_dtable_start: u32,
    pub bd_dtable_size: u32,

    /// Free inode count for this group.
    pub bd_free_inodes: u32,

    /// Free data cluster count for this group.
    pub bd_free_blocks: u32,

    /// Rotor: next in-group offset to try for data allocation.
    pub bd_next_block: u32,
}

const _: () = assert!(core::mem::size_of::<BgDescriptor>() == 72);
const _: () = assert!(core::mem::size_of::<BgDescriptor>() <= CLUSTER_SIZE);

impl BgDescriptor {
    /// Checks the descriptor signature.
    pub fn is_valid(&self) -> bool {
        self.bd_magic == NVFUSE_BD_SIGNATURE
    }

    /// Lays out a fresh descriptor for group `bg` of the filesystem
    /// described by `sb`. The last group of a device may be truncated;
    /// `clusters_in_group` carries its real extent.
    pub fn init(sb: &Superblock, bg: BlockGroupNumber, clusters_in_group: u32) -> Self {
        let start = sb.bg_start(bg);
        let itable_size = sb.itable_size();
        let dtable_start_off = NVFUSE_ITABLE_OFFSET + itable_size;
        let dtable_size = clusters_in_group.saturating_sub(dtable_start_off);

        BgDescriptor {
            bd_magic: NVFUSE_BD_SIGNATURE,
            bd_owner: 0,
            bd_id: bg,
            bd_bg_start: start,
            bd_bd_start: start + NVFUSE_BD_OFFSET,
            bd_max_inodes: sb.sb_no_of_inodes_per_bg,
            bd_max_blocks: dtable_size,
            bd_ibitmap_start: start + NVFUSE_IBITMAP_OFFSET,
            bd_ibitmap_size: 1,
            bd_dbitmap_start: start + NVFUSE_DBITMAP_OFFSET,
            bd_dbitmap_size: 1,
            bd_itable_start: start + NVFUSE_ITABLE_OFFSET,
            bd_itable_size: itable_size,
            bd_dtable_start: start + dtable_start_off,
            bd_dtable_size: dtable_size,
            bd_free_inodes: sb.sb_no_of_inodes_per_bg,
            bd_free_blocks: dtable_size,
            bd_next_block: 0,
        }
    }

    /// In-group cluster offset where the data table begins.
    pub fn dtable_offset(&self) -> u32 {
        self.bd_dtable_start - self.bd_bg_start
    }

    /// Decodes a descriptor from its cluster.
    pub fn from_cluster(buf: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(&buf[..core::mem::size_of::<Self>()])
    }

    /// Encodes the descriptor into the head of a cluster buffer.
    pub fn write_to_cluster(&self, buf: &mut [u8]) {
        buf[..core::mem::size_of::<Self>()].copy_from_slice(bytemuck::bytes_of(self));
    }
}

/// Which allocation stream a cursor operation concerns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocCursor {
    Inode,
    Data,
}

/// Owner of the mount's block group descriptors and allocation cursors.
pub struct BgManager {
    descriptors: Vec<BgDescriptor>,
    dirty: Vec<bool>,

    /// Ordered ids of the groups this mount owns.
    list: Vec<BlockGroupNumber>,

    inode_cursor: usize,
    data_cursor: usize,
}

impl BgManager {
    pub fn new(descriptors: Vec<BgDescriptor>) -> Self {
        let list = descriptors.iter().map(|bd| bd.bd_id).collect();
        let count = descriptors.len();
        BgManager {
            descriptors,
            dirty: vec![false; count],
            list,
            inode_cursor: 0,
            data_cursor: 0,
        }
    }

    pub fn group_count(&self) -> usize {
        self.list.len()
    }

    /// Ordered group ids owned by this mount.
    pub fn groups(&self) -> &[BlockGroupNumber] {
        &self.list
    }

    pub fn descriptor(&self, bg: BlockGroupNumber) -> FsResult<&BgDescriptor> {
        self.descriptors.get(bg.0 as usize).ok_or(Error::Corrupt)
    }

    /// Mutable descriptor access; the group is marked for write-back.
    pub fn descriptor_mut(&mut self, bg: BlockGroupNumber) -> FsResult<&mut BgDescriptor> {
        let bd = self
            .descriptors
            .get_mut(bg.0 as usize)
            .ok_or(Error::Corrupt)?;
        self.dirty[bg.0 as usize] = true;
        Ok(bd)
    }

    /// Group the given cursor currently points at.
    pub fn cursor_bg(&self, cursor: AllocCursor) -> BlockGroupNumber {
        let idx = match cursor {
            AllocCursor::Inode => self.inode_cursor,
            AllocCursor::Data => self.data_cursor,
        };
        self.list[idx % self.list.len()]
    }

    /// Advances the given cursor one group, wrapping at the end of the
    /// list, and returns the new group.
    pub fn advance_cursor(&mut self, cursor: AllocCursor) -> BlockGroupNumber {
        let len = self.list.len();
        let idx = match cursor {
            AllocCursor::Inode => {
                self.inode_cursor = (self.inode_cursor + 1) % len;
                self.inode_cursor
            }
            AllocCursor::Data => {
                self.data_cursor = (self.data_cursor + 1) % len;
                self.data_cursor
            }
        };
        self.list[idx]
    }

    /// Points the given cursor at a specific group (allocation hint).
    pub fn set_cursor(&mut self, cursor: AllocCursor, bg: BlockGroupNumber) {
        if let Some(idx) = self.list.iter().position(|&g| g == bg) {
            match cursor {
                AllocCursor::Inode => self.inode_cursor = idx,
                AllocCursor::Data => self.data_cursor = idx,
            }
        }
    }

    /// Takes the set of descriptors needing write-back, clearing their
    /// dirty marks.
    pub fn take_dirty(&mut self) -> Vec<BgDescriptor> {
        let mut out = Vec::new();
        for (idx, dirty) in self.dirty.iter_mut().enumerate() {
            if *dirty {
                out.push(self.descriptors[idx]);
                *dirty = false;
            }
        }
        out
    }

    /// Whether any descriptor is waiting for write-back.
    pub fn has_dirty(&self) -> bool {
        self.dirty.iter().any(|&d| d)
    }

    /// Sum of per-group free data clusters. Must equal the superblock's
    /// cached counter at all times.
    pub fn total_free_blocks(&self) -> i64 {
        self.descriptors
            .iter()
            .map(|bd| i64::from(bd.bd_free_blocks))
            .sum()
    }

    /// Sum of per-group free inodes.
    pub fn total_free_inodes(&self) -> i64 {
        self.descriptors
            .iter()
            .map(|bd| i64::from(bd.bd_free_inodes))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::layout::InodeNumber;

    fn test_sb() -> Superblock {
        let mut sb = Superblock::zeroed();
        sb.sb_no_of_blocks_per_bg = 32768;
        sb.sb_no_of_inodes_per_bg = 8192;
        sb.sb_root_ino = InodeNumber::ROOT;
        sb
    }

    #[test]
    fn descriptor_layout_is_contiguous() {
        let sb = test_sb();
        let bd = BgDescriptor::init(&sb, BlockGroupNumber(1), 32768);

        assert!(bd.is_valid());
        assert_eq!(bd.bd_bg_start, 32768);
        assert_eq!(bd.bd_bd_start, 32768 + 1);
        assert_eq!(bd.bd_ibitmap_start, 32768 + 2);
        assert_eq!(bd.bd_dbitmap_start, 32768 + 3);
        assert_eq!(bd.bd_itable_start, 32768 + 4);
        assert_eq!(bd.bd_itable_size, 256);
        assert_eq!(bd.bd_dtable_start, 32768 + 4 + 256);
        assert_eq!(bd.bd_dtable_size, 32768 - 260);
        assert_eq!(bd.bd_free_blocks, bd.bd_max_blocks);
    }

    #[test]
    fn cursors_rotate_through_groups() {
        let sb = test_sb();
        let descriptors = (0..3)
            .map(|g| BgDescriptor::init(&sb, BlockGroupNumber(g), 32768))
            .collect();
        let mut mgr = BgManager::new(descriptors);

        assert_eq!(mgr.cursor_bg(AllocCursor::Data), BlockGroupNumber(0));
        assert_eq!(mgr.advance_cursor(AllocCursor::Data), BlockGroupNumber(1));
        assert_eq!(mgr.advance_cursor(AllocCursor::Data), BlockGroupNumber(2));
        assert_eq!(mgr.advance_cursor(AllocCursor::Data), BlockGroupNumber(0));
        // the inode cursor is independent
        assert_eq!(mgr.cursor_bg(AllocCursor::Inode), BlockGroupNumber(0));
    }

    #[test]
    fn dirty_descriptors_are_drained_once() {
        let sb = test_sb();
        let descriptors = (0..2)
            .map(|g| BgDescriptor::init(&sb, BlockGroupNumber(g), 32768))
            .collect();
        let mut mgr = BgManager::new(descriptors);

        mgr.descriptor_mut(BlockGroupNumber(1)).unwrap().bd_free_blocks -= 1;
        assert!(mgr.has_dirty());
        let dirty = mgr.take_dirty();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].bd_id, BlockGroupNumber(1));
        assert!(!mgr.has_dirty());
    }
}
