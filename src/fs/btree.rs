//! B+tree directory index.
//!
//! Each directory owns a companion inode whose data clusters hold a B+tree
//! mapping 64-bit filename hash keys to directory entry offsets. One node
//! fills one cluster; the root is always the companion inode's logical
//! block 0 and node ids are logical blocks within that inode, so the tree
//! needs no allocator of its own beyond the regular block mapping.
//!
//! Insertion splits full nodes preemptively on the way down, which keeps
//! every split local to a parent with free room. Deletion removes the key
//! from its leaf without rebalancing; directory indexes shrink rarely and
//! a sparse leaf stays correct.

use bytemuck::{Pod, Zeroable};

use crate::errors::{CanFail, Error, FsResult};
use crate::fs::buffer::BufKey;
use crate::fs::inode::Inode;
use crate::fs::layout::{InodeNumber, InodeType, LbnId, CLUSTER_SIZE};
use crate::fs::NvfuseFs;

/// Node signature, first field of every tree cluster.
pub const BP_NODE_MAGIC: u32 = 0x6273_7462;

/// Keys per node.
pub const BP_ORDER: usize = 255;

const SPLIT_POINT: usize = BP_ORDER / 2;

/// One B+tree node. Leaves (`level == 0`) store directory entry offsets in
/// `vals`; branches store child node ids (logical blocks of the companion
/// inode). `keys[i]` of a branch is the smallest key that routed into
/// child `i` when it was created.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct BpNode {
    pub magic: u32,
    pub level: u32,
    pub nkeys: u32,
    resv: u32,
    pub keys: [u64; BP_ORDER],
    pub vals: [u64; BP_ORDER],
}

const _: () = assert!(core::mem::size_of::<BpNode>() == CLUSTER_SIZE);

impl BpNode {
    fn new(level: u32) -> Self {
        let mut node = BpNode::zeroed();
        node.magic = BP_NODE_MAGIC;
        node.level = level;
        node
    }

    fn is_full(&self) -> bool {
        self.nkeys as usize == BP_ORDER
    }

    /// Index of the child a key routes to (branches only).
    fn route(&self, key: u64) -> usize {
        let n = self.nkeys as usize;
        let mut idx = 0;
        for i in 0..n {
            if self.keys[i] <= key {
                idx = i;
            } else {
                break;
            }
        }
        idx
    }

    /// Exact position of `key` in this node, if present.
    fn find(&self, key: u64) -> Option<usize> {
        let n = self.nkeys as usize;
        self.keys[..n].binary_search(&key).ok()
    }

    /// Inserts `(key, val)` at its sorted position. The node must not be
    /// full.
    fn insert_at_sorted(&mut self, key: u64, val: u64) {
        let n = self.nkeys as usize;
        let pos = self.keys[..n].partition_point(|&k| k < key);
        for i in (pos..n).rev() {
            self.keys[i + 1] = self.keys[i];
            self.vals[i + 1] = self.vals[i];
        }
        self.keys[pos] = key;
        self.vals[pos] = val;
        self.nkeys += 1;
    }

    fn remove_at(&mut self, pos: usize) {
        let n = self.nkeys as usize;
        for i in pos..n - 1 {
            self.keys[i] = self.keys[i + 1];
            self.vals[i] = self.vals[i + 1];
        }
        self.keys[n - 1] = 0;
        self.vals[n - 1] = 0;
        self.nkeys -= 1;
    }

    /// Moves the upper half of this node into `right`, returning the
    /// separator key.
    fn split_into(&mut self, right: &mut BpNode) -> u64 {
        let n = self.nkeys as usize;
        let moved = n - SPLIT_POINT;
        right.keys[..moved].copy_from_slice(&self.keys[SPLIT_POINT..n]);
        right.vals[..moved].copy_from_slice(&self.vals[SPLIT_POINT..n]);
        right.nkeys = moved as u32;
        for i in SPLIT_POINT..n {
            self.keys[i] = 0;
            self.vals[i] = 0;
        }
        self.nkeys = SPLIT_POINT as u32;
        right.keys[0]
    }
}

impl NvfuseFs {
    // ---- node I/O -----------------------------------------------------

    fn bp_read_node(&mut self, bpino: InodeNumber, lbn: LbnId) -> FsResult<BpNode> {
        let pblk = self.get_pbn(bpino, lbn)?;
        if pblk.is_null() {
            return Err(Error::Corrupt);
        }
        let bid = self
            .bcache
            .get(self.dev.as_mut(), BufKey::data(bpino, lbn), pblk)?;
        let node: BpNode = bytemuck::pod_read_unaligned(self.bcache.data(bid));
        self.bcache.put(bid, false);
        if node.magic != BP_NODE_MAGIC {
            return Err(Error::Corrupt);
        }
        Ok(node)
    }

    fn bp_write_node(&mut self, bpino: InodeNumber, lbn: LbnId, node: &BpNode) -> CanFail<Error> {
        let pblk = self.ensure_mapped(bpino, lbn)?;
        let bid = self
            .bcache
            .get_zeroed(self.dev.as_mut(), BufKey::data(bpino, lbn), pblk)?;
        self.bcache
            .data_mut(bid)
            .copy_from_slice(bytemuck::bytes_of(node));
        self.put_data_dirty(bpino, bid);
        Ok(())
    }

    /// Extends the companion inode by one cluster and returns its node id.
    fn bp_alloc_node(&mut self, bpino: InodeNumber) -> FsResult<LbnId> {
        let mut inode = self.inode_of(bpino)?;
        let lbn = LbnId((inode.i_size as u64 / CLUSTER_SIZE as u64) as u32);
        self.ensure_mapped(bpino, lbn)?;
        inode.i_size += CLUSTER_SIZE as i64;
        self.update_inode(bpino, inode)?;
        Ok(lbn)
    }

    /// Creates a directory index inode with an empty root leaf. The
    /// returned context carries one reference.
    pub(crate) fn create_bptree(&mut self) -> FsResult<InodeNumber> {
        let bpino = self.alloc_inode()?;
        let mut inode = Inode::init(bpino, InodeType::BpTree, 0);
        inode.i_size = 0;
        self.install_ictx(bpino, inode);

        let root = self.bp_alloc_node(bpino)?;
        debug_assert_eq!(root, LbnId(0));
        self.bp_write_node(bpino, root, &BpNode::new(0))?;
        Ok(bpino)
    }

    // ---- index operations ---------------------------------------------

    /// Looks a key up, returning the stored directory entry offset.
    pub(crate) fn bp_lookup(&mut self, bpino: InodeNumber, key: u64) -> FsResult<Option<u64>> {
        let mut lbn = LbnId(0);
        let mut node = self.bp_read_node(bpino, lbn)?;
        while node.level > 0 {
            if node.nkeys == 0 {
                return Ok(None);
            }
            lbn = LbnId(node.vals[node.route(key)] as u32);
            node = self.bp_read_node(bpino, lbn)?;
        }
        Ok(node.find(key).map(|pos| node.vals[pos]))
    }

    /// Inserts `(key, offset)`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Exists`] if the key is already indexed.
    pub(crate) fn bp_insert(&mut self, bpino: InodeNumber, key: u64, val: u64) -> CanFail<Error> {
        // a full root splits in place: its halves move into two fresh
        // nodes and the root becomes a two-entry branch one level up
        let mut root = self.bp_read_node(bpino, LbnId(0))?;
        if root.is_full() {
            let left_lbn = self.bp_alloc_node(bpino)?;
            let right_lbn = self.bp_alloc_node(bpino)?;
            let mut left = root;
            let mut right = BpNode::new(root.level);
            let sep = left.split_into(&mut right);

            let mut new_root = BpNode::new(root.level + 1);
            new_root.keys[0] = left.keys[0];
            new_root.vals[0] = left_lbn.0 as u64;
            new_root.keys[1] = sep;
            new_root.vals[1] = right_lbn.0 as u64;
            new_root.nkeys = 2;

            self.bp_write_node(bpino, left_lbn, &left)?;
            self.bp_write_node(bpino, right_lbn, &right)?;
            self.bp_write_node(bpino, LbnId(0), &new_root)?;
            root = new_root;
        }

        let mut lbn = LbnId(0);
        let mut node = root;
        loop {
            if node.level == 0 {
                if node.find(key).is_some() {
                    return Err(Error::Exists);
                }
                node.insert_at_sorted(key, val);
                return self.bp_write_node(bpino, lbn, &node);
            }

            let idx = node.route(key);
            let child_lbn = LbnId(node.vals[idx] as u32);
            let mut child = self.bp_read_node(bpino, child_lbn)?;

            if child.is_full() {
                // split before descending; the parent has room by
                // construction
                let right_lbn = self.bp_alloc_node(bpino)?;
                let mut right = BpNode::new(child.level);
                let sep = child.split_into(&mut right);
                self.bp_write_node(bpino, child_lbn, &child)?;
                self.bp_write_node(bpino, right_lbn, &right)?;

                node.insert_at_sorted(sep, right_lbn.0 as u64);
                self.bp_write_node(bpino, lbn, &node)?;

                if key >= sep {
                    lbn = right_lbn;
                    node = right;
                } else {
                    lbn = child_lbn;
                    node = child;
                }
            } else {
                lbn = child_lbn;
                node = child;
            }
        }
    }

    /// Removes a key from the index.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotFound`] if the key is not indexed.
    pub(crate) fn bp_delete(&mut self, bpino: InodeNumber, key: u64) -> CanFail<Error> {
        let mut lbn = LbnId(0);
        let mut node = self.bp_read_node(bpino, lbn)?;
        while node.level > 0 {
            if node.nkeys == 0 {
                return Err(Error::NotFound);
            }
            lbn = LbnId(node.vals[node.route(key)] as u32);
            node = self.bp_read_node(bpino, lbn)?;
        }

        let pos = node.find(key).ok_or(Error::NotFound)?;
        node.remove_at(pos);
        self.bp_write_node(bpino, lbn, &node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_insert_and_remove_keep_order() {
        let mut node = BpNode::new(0);
        for key in [40u64, 10, 30, 20] {
            node.insert_at_sorted(key, key * 100);
        }
        assert_eq!(&node.keys[..4], &[10, 20, 30, 40]);
        assert_eq!(node.find(30), Some(2));

        node.remove_at(1);
        assert_eq!(&node.keys[..3], &[10, 30, 40]);
        assert_eq!(node.find(20), None);
        assert_eq!(node.vals[1], 3000);
    }

    #[test]
    fn split_moves_the_upper_half() {
        let mut node = BpNode::new(0);
        for key in 0..BP_ORDER as u64 {
            node.insert_at_sorted(key, key);
        }
        assert!(node.is_full());

        let mut right = BpNode::new(0);
        let sep = node.split_into(&mut right);
        assert_eq!(sep, SPLIT_POINT as u64);
        assert_eq!(node.nkeys as usize, SPLIT_POINT);
        assert_eq!(node.nkeys + right.nkeys, BP_ORDER as u32);
        assert_eq!(right.keys[0], SPLIT_POINT as u64);
    }

    #[test]
    fn routing_picks_the_rightmost_bounding_child() {
        let mut branch = BpNode::new(1);
        branch.insert_at_sorted(0, 10);
        branch.insert_at_sorted(100, 11);
        branch.insert_at_sorted(200, 12);

        assert_eq!(branch.route(5), 0);
        assert_eq!(branch.route(100), 1);
        assert_eq!(branch.route(150), 1);
        assert_eq!(branch.route(999), 2);
    }
}
