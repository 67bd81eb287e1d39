//! Inodes.
//!
//! The on-disk inode is a fixed 128-byte record addressing file data
//! through 11 direct pointers and single/double/triple indirect clusters.
//! In-memory access goes through reference-counted inode contexts that
//! carry a working copy of the record plus the dirty buffer lists used by
//! the ordered write-back path: data clusters first, then indirect
//! clusters, then the inode cluster itself.

use bytemuck::{Pod, Zeroable};
use hashbrown::HashMap;
use log::warn;

use crate::errors::{CanFail, Error, FsResult};
use crate::fs::buffer::{BufId, BufKey};
use crate::fs::layout::{
    BlkId, InodeNumber, InodeType, LbnId, CLUSTER_SIZE, CLUSTER_SIZE_BITS, DINDIRECT_BLOCKS,
    DIRECT_BLOCKS, INODE_ENTRY_NUM, INODE_ENTRY_SIZE, MAX_FILE_SIZE, PTRS_PER_BLOCK,
    TINDIRECT_BLOCKS,
};
use crate::fs::NvfuseFs;

/// The on-disk inode record. 32 of these fill one inode table cluster.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Inode {
    pub i_ino: InodeNumber,

    /// One of the [`InodeType`] discriminants.
    pub i_type: u32,

    /// Companion B+tree inode (directories only).
    pub i_bpino: InodeNumber,

    resv0: u32,

    /// File size in bytes.
    pub i_size: i64,

    /// Bumped on every durable change to the record.
    pub i_version: u32,

    pub i_deleted: u32,

    pub i_links_count: u32,

    /// Next directory entry slot to try (directories only).
    pub i_ptr: u32,

    pub i_atime: u32,
    pub i_ctime: u32,
    pub i_mtime: u32,
    pub i_dtime: u32,

    pub i_gid: u16,
    pub i_uid: u16,
    pub i_mode: u16,
    resv1: u16,

    /// Block pointers: 0..=10 direct, 11 single-, 12 double-, 13
    /// triple-indirect.
    pub i_blocks: [u32; 14],

    resv2: [u32; 2],
}

const _: () = assert!(core::mem::size_of::<Inode>() == INODE_ENTRY_SIZE);

impl Inode {
    /// A blank record of the given type.
    pub fn init(ino: InodeNumber, typ: InodeType, mode: u16) -> Self {
        let now = unix_now();
        let mut inode = Inode::zeroed();
        inode.i_ino = ino;
        inode.i_type = typ as u32;
        inode.i_version = 1;
        inode.i_links_count = 1;
        inode.i_atime = now;
        inode.i_ctime = now;
        inode.i_mtime = now;
        inode.i_mode = mode;
        inode
    }

    pub fn inode_type(&self) -> Option<InodeType> {
        InodeType::from_raw(self.i_type)
    }

    pub fn is_directory(&self) -> bool {
        self.i_type == InodeType::Directory as u32
    }

    pub fn is_symlink(&self) -> bool {
        self.i_type == InodeType::Special as u32 && (self.i_mode & 0xF000) == 0xA000
    }

    /// Number of logical blocks covered by the current size.
    pub fn block_count(&self) -> u32 {
        ((self.i_size as u64 + CLUSTER_SIZE as u64 - 1) >> CLUSTER_SIZE_BITS) as u32
    }
}

/// Seconds since the epoch, saturated into the on-disk field width.
pub fn unix_now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs().min(u64::from(u32::MAX)) as u32)
        .unwrap_or(0)
}

/// In-memory, reference-counted inode context.
pub struct InodeCtx {
    /// Working copy of the on-disk record.
    pub inode: Inode,

    /// The record differs from its on-disk image.
    pub dirty: bool,

    /// Dirty data buffers of this inode, in dirtying order.
    pub data_dirty: Vec<BufId>,

    /// Dirty metadata (indirect cluster) buffers, in dirtying order.
    pub meta_dirty: Vec<BufId>,

    pub ref_count: u32,
}

/// Cache of inode contexts, keyed by inode number. Contexts are destroyed
/// when their reference count reaches zero and the cache is over budget.
pub struct IctxCache {
    map: HashMap<InodeNumber, InodeCtx>,
    limit: usize,
}

impl IctxCache {
    pub fn new(limit: usize) -> Self {
        IctxCache {
            map: HashMap::new(),
            limit: limit.max(16),
        }
    }

    pub fn get(&self, ino: InodeNumber) -> Option<&InodeCtx> {
        self.map.get(&ino)
    }

    pub fn get_mut(&mut self, ino: InodeNumber) -> Option<&mut InodeCtx> {
        self.map.get_mut(&ino)
    }

    pub fn insert(&mut self, ino: InodeNumber, ctx: InodeCtx) {
        self.map.insert(ino, ctx);
    }

    pub fn remove(&mut self, ino: InodeNumber) -> Option<InodeCtx> {
        self.map.remove(&ino)
    }

    /// Inode numbers of every context with dirty state, in no particular
    /// order (the flush path orders the buffers, not the inodes).
    pub fn dirty_inodes(&self) -> Vec<InodeNumber> {
        self.map
            .iter()
            .filter(|(_, ctx)| {
                ctx.dirty || !ctx.data_dirty.is_empty() || !ctx.meta_dirty.is_empty()
            })
            .map(|(&ino, _)| ino)
            .collect()
    }

    /// Evicts unreferenced, fully clean contexts while the cache is over
    /// budget.
    pub fn shrink(&mut self) {
        if self.map.len() <= self.limit {
            return;
        }
        let victims: Vec<InodeNumber> = self
            .map
            .iter()
            .filter(|(_, ctx)| {
                ctx.ref_count == 0
                    && !ctx.dirty
                    && ctx.data_dirty.is_empty()
                    && ctx.meta_dirty.is_empty()
            })
            .map(|(&ino, _)| ino)
            .collect();
        let excess = self.map.len().saturating_sub(self.limit);
        for ino in victims.into_iter().take(excess) {
            self.map.remove(&ino);
        }
    }
}

/// Where a logical block lives in the inode's pointer tree.
enum BlockPath {
    Direct(usize),
    /// `slot` is the inode pointer index; `idx` the per-level entry
    /// indices from the top indirect cluster down.
    Indirect { slot: usize, idx: Vec<usize> },
}

fn block_path(lbn: LbnId) -> FsResult<BlockPath> {
    let n = lbn.0 as usize;
    let p = PTRS_PER_BLOCK;
    if n < DIRECT_BLOCKS {
        return Ok(BlockPath::Direct(n));
    }
    let n = n - DIRECT_BLOCKS;
    if n < p {
        return Ok(BlockPath::Indirect {
            slot: DIRECT_BLOCKS,
            idx: vec![n],
        });
    }
    let n = n - p;
    if n < p * p {
        return Ok(BlockPath::Indirect {
            slot: DINDIRECT_BLOCKS,
            idx: vec![n / p, n % p],
        });
    }
    let n = n - p * p;
    if n < p * p * p {
        return Ok(BlockPath::Indirect {
            slot: TINDIRECT_BLOCKS,
            idx: vec![n / (p * p), (n / p) % p, n % p],
        });
    }
    Err(Error::TooLarge)
}

impl NvfuseFs {
    // ---- inode context lifecycle -------------------------------------

    /// Itable cluster and byte offset of an inode record.
    fn inode_location(&self, ino: InodeNumber) -> FsResult<(BlkId, usize)> {
        let bg = self.sb.bg_of_inode(ino);
        let slot = self.sb.inode_slot_in_bg(ino);
        let bd = self.bgs.descriptor(bg)?;
        let cluster = bd.bd_itable_start + slot / INODE_ENTRY_NUM as u32;
        let offset = (slot as usize % INODE_ENTRY_NUM) * INODE_ENTRY_SIZE;
        Ok((BlkId(cluster), offset))
    }

    /// Loads (or references) the context of `ino`.
    pub(crate) fn open_ictx(&mut self, ino: InodeNumber) -> FsResult<()> {
        if let Some(ctx) = self.ictxs.get_mut(ino) {
            ctx.ref_count += 1;
            return Ok(());
        }

        let (cluster, offset) = self.inode_location(ino)?;
        let key = BufKey::meta(InodeNumber::ITABLE, cluster);
        let bid = self.bcache.get(self.dev.as_mut(), key, cluster)?;
        let inode: Inode =
            bytemuck::pod_read_unaligned(&self.bcache.data(bid)[offset..offset + INODE_ENTRY_SIZE]);
        self.bcache.put(bid, false);

        if inode.i_deleted != 0 || inode.inode_type().is_none() {
            return Err(Error::Corrupt);
        }

        self.ictxs.insert(
            ino,
            InodeCtx {
                inode,
                dirty: false,
                data_dirty: Vec::new(),
                meta_dirty: Vec::new(),
                ref_count: 1,
            },
        );
        Ok(())
    }

    /// Installs a freshly allocated inode record into the context cache.
    pub(crate) fn install_ictx(&mut self, ino: InodeNumber, inode: Inode) {
        self.ictxs.insert(
            ino,
            InodeCtx {
                inode,
                dirty: true,
                data_dirty: Vec::new(),
                meta_dirty: Vec::new(),
                ref_count: 1,
            },
        );
    }

    /// Drops a context reference taken with [`NvfuseFs::open_ictx`].
    pub(crate) fn release_ictx(&mut self, ino: InodeNumber, dirty: bool) {
        if let Some(ctx) = self.ictxs.get_mut(ino) {
            if dirty {
                ctx.dirty = true;
                ctx.inode.i_version = ctx.inode.i_version.wrapping_add(1);
            }
            ctx.ref_count = ctx.ref_count.saturating_sub(1);
        }
        self.ictxs.shrink();
    }

    /// Working copy of an opened inode record.
    pub(crate) fn inode_of(&self, ino: InodeNumber) -> FsResult<Inode> {
        Ok(self.ictxs.get(ino).ok_or(Error::Corrupt)?.inode)
    }

    /// Replaces the working copy and marks the context dirty.
    pub(crate) fn update_inode(&mut self, ino: InodeNumber, inode: Inode) -> CanFail<Error> {
        let ctx = self.ictxs.get_mut(ino).ok_or(Error::Corrupt)?;
        ctx.inode = inode;
        ctx.dirty = true;
        Ok(())
    }

    /// Registers a dirty data buffer with its owning context.
    pub(crate) fn put_data_dirty(&mut self, ino: InodeNumber, bid: BufId) {
        let newly = self.bcache.put(bid, true);
        if newly {
            if let Some(ctx) = self.ictxs.get_mut(ino) {
                ctx.data_dirty.push(bid);
            }
        }
    }

    /// Registers a dirty indirect-cluster buffer with its owning context.
    pub(crate) fn put_meta_dirty(&mut self, ino: InodeNumber, bid: BufId) {
        let newly = self.bcache.put(bid, true);
        if newly {
            if let Some(ctx) = self.ictxs.get_mut(ino) {
                ctx.meta_dirty.push(bid);
            }
        }
    }

    // ---- indirect addressing -----------------------------------------

    /// Resolves a logical block without allocating. Returns the null block
    /// for sparse (unmapped) ranges.
    pub(crate) fn get_pbn(&mut self, ino: InodeNumber, lbn: LbnId) -> FsResult<BlkId> {
        let inode = self.inode_of(ino)?;
        match block_path(lbn)? {
            BlockPath::Direct(slot) => Ok(BlkId(inode.i_blocks[slot])),
            BlockPath::Indirect { slot, idx } => {
                let mut cur = BlkId(inode.i_blocks[slot]);
                for &entry in &idx {
                    if cur.is_null() {
                        return Ok(BlkId::NULL);
                    }
                    cur = self.read_indirect_entry(cur, entry)?;
                }
                Ok(cur)
            }
        }
    }

    fn read_indirect_entry(&mut self, cluster: BlkId, entry: usize) -> FsResult<BlkId> {
        let key = BufKey::meta(InodeNumber::BLOCK_IO, cluster);
        let bid = self.bcache.get(self.dev.as_mut(), key, cluster)?;
        let raw = u32::from_le_bytes(
            self.bcache.data(bid)[entry * 4..entry * 4 + 4]
                .try_into()
                .expect("entry slice is four bytes"),
        );
        self.bcache.put(bid, false);
        Ok(BlkId(raw))
    }

    fn write_indirect_entry(
        &mut self,
        ino: InodeNumber,
        cluster: BlkId,
        entry: usize,
        value: BlkId,
    ) -> CanFail<Error> {
        let key = BufKey::meta(InodeNumber::BLOCK_IO, cluster);
        let bid = self.bcache.get(self.dev.as_mut(), key, cluster)?;
        self.bcache.data_mut(bid)[entry * 4..entry * 4 + 4]
            .copy_from_slice(&value.0.to_le_bytes());
        self.put_meta_dirty(ino, bid);
        Ok(())
    }

    /// Resolves a logical block, allocating the data cluster and any
    /// missing indirect clusters. Fresh indirect clusters are zero-filled
    /// before any pointer to them is written, and pointers are installed
    /// bottom-up, so a torn operation leaves orphan blocks rather than
    /// dangling pointers.
    pub(crate) fn ensure_mapped(&mut self, ino: InodeNumber, lbn: LbnId) -> FsResult<BlkId> {
        let mut inode = self.inode_of(ino)?;
        let hint_bg = self.sb.bg_of_inode(ino);

        match block_path(lbn)? {
            BlockPath::Direct(slot) => {
                let cur = BlkId(inode.i_blocks[slot]);
                if !cur.is_null() {
                    return Ok(cur);
                }
                let blk = self.alloc_one_block(hint_bg)?;
                inode.i_blocks[slot] = blk.0;
                self.update_inode(ino, inode)?;
                Ok(blk)
            }
            BlockPath::Indirect { slot, idx } => {
                // walk the existing chain top-down until a hole appears;
                // chain[d] is the indirect cluster whose entries idx[d]
                // indexes into
                let mut chain: Vec<BlkId> = Vec::with_capacity(idx.len());
                let mut cur = BlkId(inode.i_blocks[slot]);
                while chain.len() < idx.len() && !cur.is_null() {
                    chain.push(cur);
                    cur = self.read_indirect_entry(cur, idx[chain.len() - 1])?;
                }
                if chain.len() == idx.len() && !cur.is_null() {
                    return Ok(cur);
                }

                // allocate the data cluster first, then materialize the
                // missing indirect levels from the bottom up; each fresh
                // cluster is zeroed and points at its child before
                // anything points at it
                let data_blk = self.alloc_one_block(hint_bg)?;
                let mut child = data_blk;
                for depth in (chain.len()..idx.len()).rev() {
                    let fresh = self.alloc_one_block(hint_bg)?;
                    self.zero_fresh_cluster(ino, fresh, idx[depth], child)?;
                    child = fresh;
                }

                // install the topmost new pointer last
                if chain.is_empty() {
                    inode.i_blocks[slot] = child.0;
                    self.update_inode(ino, inode)?;
                } else {
                    let parent = *chain.last().expect("chain verified non-empty");
                    self.write_indirect_entry(ino, parent, idx[chain.len() - 1], child)?;
                }

                Ok(data_blk)
            }
        }
    }

    /// Initializes a fresh indirect cluster: zero-filled, with a single
    /// entry pointing at `child`, and queued behind the data it indexes.
    fn zero_fresh_cluster(
        &mut self,
        ino: InodeNumber,
        cluster: BlkId,
        entry: usize,
        child: BlkId,
    ) -> CanFail<Error> {
        let key = BufKey::meta(InodeNumber::BLOCK_IO, cluster);
        let bid = self.bcache.get_zeroed(self.dev.as_mut(), key, cluster)?;
        self.bcache.data_mut(bid)[entry * 4..entry * 4 + 4]
            .copy_from_slice(&child.0.to_le_bytes());
        self.put_meta_dirty(ino, bid);
        Ok(())
    }

    // ---- truncate / delete -------------------------------------------

    /// Truncates the inode's data to `new_size` bytes, releasing data
    /// clusters and collapsing indirect clusters that become empty. The
    /// recorded size changes only after every release has reached the
    /// bitmaps.
    pub(crate) fn truncate_ino(&mut self, ino: InodeNumber, new_size: i64) -> CanFail<Error> {
        let mut inode = self.inode_of(ino)?;
        if new_size < 0 || new_size > MAX_FILE_SIZE as i64 {
            return Err(Error::TooLarge);
        }
        let keep_blocks =
            ((new_size as u64 + CLUSTER_SIZE as u64 - 1) >> CLUSTER_SIZE_BITS) as usize;

        // direct pointers
        for slot in (keep_blocks.min(DIRECT_BLOCKS)..DIRECT_BLOCKS).rev() {
            let blk = BlkId(inode.i_blocks[slot]);
            if !blk.is_null() {
                self.drop_cached_block(ino, LbnId(slot as u32), blk);
                self.free_blocks(blk, 1)?;
                inode.i_blocks[slot] = 0;
            }
        }

        // indirect trees, deepest span last
        let p = PTRS_PER_BLOCK;
        let spans: [(usize, usize, usize); 3] = [
            (DIRECT_BLOCKS, DIRECT_BLOCKS, p),
            (DINDIRECT_BLOCKS, DIRECT_BLOCKS + p, p * p),
            (TINDIRECT_BLOCKS, DIRECT_BLOCKS + p + p * p, p * p * p),
        ];
        for (slot, first_lbn, span) in spans {
            let top = BlkId(inode.i_blocks[slot]);
            if top.is_null() {
                continue;
            }
            let keep_rel = keep_blocks.saturating_sub(first_lbn).min(span);
            let level = match slot {
                s if s == DIRECT_BLOCKS => 1,
                s if s == DINDIRECT_BLOCKS => 2,
                _ => 3,
            };
            let now_empty =
                self.truncate_tree(ino, top, level, keep_rel, first_lbn as u32)?;
            if now_empty {
                self.free_blocks(top, 1)?;
                inode.i_blocks[slot] = 0;
            }
        }

        inode.i_size = new_size;
        inode.i_mtime = unix_now();
        self.update_inode(ino, inode)?;
        Ok(())
    }

    /// Frees every block of the indirect subtree rooted at `cluster`
    /// beyond `keep_rel` logical blocks. Returns whether the subtree is
    /// now entirely empty (the caller releases the cluster itself).
    fn truncate_tree(
        &mut self,
        ino: InodeNumber,
        cluster: BlkId,
        level: usize,
        keep_rel: usize,
        first_lbn: u32,
    ) -> FsResult<bool> {
        let child_span = PTRS_PER_BLOCK.pow(level as u32 - 1);
        let key = BufKey::meta(InodeNumber::BLOCK_IO, cluster);
        let bid = self.bcache.get(self.dev.as_mut(), key, cluster)?;
        let mut entries: Vec<u32> = self
            .bcache
            .data(bid)
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes(b.try_into().expect("chunk is four bytes")))
            .collect();
        self.bcache.put(bid, false);

        let mut changed = false;
        let mut all_empty = true;
        for (i, entry) in entries.iter_mut().enumerate() {
            if *entry == 0 {
                continue;
            }
            let child = BlkId(*entry);
            let child_first = i * child_span;
            let child_keep = keep_rel.saturating_sub(child_first).min(child_span);
            if child_keep == child_span {
                all_empty = false;
                continue;
            }

            let child_empty = if level == 1 {
                if child_keep == 0 {
                    self.drop_cached_block(
                        ino,
                        LbnId(first_lbn + child_first as u32),
                        child,
                    );
                    self.free_blocks(child, 1)?;
                    true
                } else {
                    // a partially kept data block stays mapped
                    false
                }
            } else {
                let empty = self.truncate_tree(
                    ino,
                    child,
                    level - 1,
                    child_keep,
                    first_lbn + child_first as u32,
                )?;
                if empty {
                    self.free_blocks(child, 1)?;
                }
                empty
            };

            if child_empty {
                *entry = 0;
                changed = true;
            } else {
                all_empty = false;
            }
        }

        if changed && !all_empty {
            let bid = self.bcache.get(self.dev.as_mut(), key, cluster)?;
            let data = self.bcache.data_mut(bid);
            for (i, entry) in entries.iter().enumerate() {
                data[i * 4..i * 4 + 4].copy_from_slice(&entry.to_le_bytes());
            }
            self.put_meta_dirty(ino, bid);
        }
        Ok(all_empty)
    }

    /// Forgets the cached buffer of a freed data block so a later sparse
    /// read does not resurrect stale bytes.
    fn drop_cached_block(&mut self, ino: InodeNumber, lbn: LbnId, _blk: BlkId) {
        let key = BufKey::data(ino, lbn);
        self.bcache.discard(key);
        if let Some(ctx) = self.ictxs.get_mut(ino) {
            ctx.data_dirty.retain(|&bid| self.bcache.key(bid) != key);
        }
    }

    /// Truncates to zero, releases the inode bitmap bit and zeroes the
    /// on-disk slot.
    pub(crate) fn delete_inode(&mut self, ino: InodeNumber) -> CanFail<Error> {
        self.truncate_ino(ino, 0)?;

        let mut inode = self.inode_of(ino)?;
        inode.i_deleted = 1;
        inode.i_dtime = unix_now();
        self.update_inode(ino, inode)?;

        // zero the slot directly; the context is gone after this
        let (cluster, offset) = self.inode_location(ino)?;
        let key = BufKey::meta(InodeNumber::ITABLE, cluster);
        let bid = self.bcache.get(self.dev.as_mut(), key, cluster)?;
        self.bcache.data_mut(bid)[offset..offset + INODE_ENTRY_SIZE].fill(0);
        self.bcache.put(bid, true);

        self.free_inode_bit(ino)?;
        if let Some(ctx) = self.ictxs.remove(ino) {
            if !ctx.data_dirty.is_empty() || !ctx.meta_dirty.is_empty() {
                warn!(
                    target: "nvfuse",
                    "inode {ino} deleted with dirty buffers still queued"
                );
            }
        }
        Ok(())
    }

    // ---- write-back ---------------------------------------------------

    /// Writes an inode context back in the crash-detectable order: data
    /// clusters, indirect clusters, then the inode record itself.
    pub(crate) fn sync_inode(&mut self, ino: InodeNumber) -> CanFail<Error> {
        let (data, meta, dirty) = match self.ictxs.get_mut(ino) {
            Some(ctx) => (
                core::mem::take(&mut ctx.data_dirty),
                core::mem::take(&mut ctx.meta_dirty),
                ctx.dirty,
            ),
            None => return Ok(()),
        };

        self.bcache.sync_buffers(self.dev.as_mut(), &data)?;
        self.bcache.sync_buffers(self.dev.as_mut(), &meta)?;

        if dirty {
            let inode = self.inode_of(ino)?;
            let (cluster, offset) = self.inode_location(ino)?;
            let key = BufKey::meta(InodeNumber::ITABLE, cluster);
            let bid = self.bcache.get(self.dev.as_mut(), key, cluster)?;
            self.bcache.data_mut(bid)[offset..offset + INODE_ENTRY_SIZE]
                .copy_from_slice(bytemuck::bytes_of(&inode));
            self.bcache.put(bid, true);
            self.bcache.sync_buffers(self.dev.as_mut(), &[bid])?;
            if let Some(ctx) = self.ictxs.get_mut(ino) {
                ctx.dirty = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_paths_cover_the_addressing_ranges() {
        assert!(matches!(block_path(LbnId(0)).unwrap(), BlockPath::Direct(0)));
        assert!(matches!(
            block_path(LbnId(10)).unwrap(),
            BlockPath::Direct(10)
        ));
        match block_path(LbnId(11)).unwrap() {
            BlockPath::Indirect { slot, idx } => {
                assert_eq!(slot, DIRECT_BLOCKS);
                assert_eq!(idx, vec![0]);
            }
            _ => panic!("expected single indirect"),
        }
        match block_path(LbnId(11 + 1024)).unwrap() {
            BlockPath::Indirect { slot, idx } => {
                assert_eq!(slot, DINDIRECT_BLOCKS);
                assert_eq!(idx, vec![0, 0]);
            }
            _ => panic!("expected double indirect"),
        }
        match block_path(LbnId(11 + 1024 + 1024 * 1024)).unwrap() {
            BlockPath::Indirect { slot, idx } => {
                assert_eq!(slot, TINDIRECT_BLOCKS);
                assert_eq!(idx, vec![0, 0, 0]);
            }
            _ => panic!("expected triple indirect"),
        }
        // one block past the triple-indirect range
        let max_blocks = 11 + 1024 + 1024 * 1024 + 1024u64 * 1024 * 1024;
        assert!(block_path(LbnId(max_blocks as u32)).is_err());
    }

    #[test]
    fn inode_record_is_one_slot_wide() {
        assert_eq!(core::mem::size_of::<Inode>(), 128);
        let inode = Inode::init(InodeNumber(42), InodeType::File, 0o644);
        assert_eq!(inode.i_links_count, 1);
        assert_eq!(inode.inode_type(), Some(InodeType::File));
    }
}
