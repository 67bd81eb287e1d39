//! Block and inode allocation.
//!
//! Allocation state lives in the per-group bitmaps, mutated through the
//! buffer cache so write-back ordering covers them. Free counts are kept
//! redundantly in the group descriptors and the superblock; updates happen
//! bitmap first, then descriptor, then superblock, within one operation.

use log::{debug, error};

use crate::errors::{CanFail, Error, FsResult};
use crate::fs::bitmap;
use crate::fs::block_grp::AllocCursor;
use crate::fs::buffer::BufKey;
use crate::fs::layout::{BlkId, BlockGroupNumber, InodeNumber, NUM_RESV_INO};
use crate::fs::NvfuseFs;

impl NvfuseFs {
    /// Single-cluster convenience wrapper over [`NvfuseFs::alloc_data_blocks`].
    pub(crate) fn alloc_one_block(&mut self, hint_bg: BlockGroupNumber) -> FsResult<BlkId> {
        let blks = self.alloc_data_blocks(hint_bg, 1)?;
        Ok(blks[0])
    }

    /// Allocates up to `count` data clusters, preferring a contiguous run
    /// in the hint group and falling back to the remaining groups in list
    /// order. Returns the clusters actually allocated (possibly fewer than
    /// requested when the device is nearly full).
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NoSpace`] when no group has a single free
    /// cluster left.
    pub(crate) fn alloc_data_blocks(
        &mut self,
        hint_bg: BlockGroupNumber,
        count: u32,
    ) -> FsResult<Vec<BlkId>> {
        let group_count = self.bgs.group_count();
        let mut allocated: Vec<BlkId> = Vec::with_capacity(count as usize);
        let mut remaining = count;

        for pass in 0..group_count {
            if remaining == 0 {
                break;
            }
            let bg = BlockGroupNumber((hint_bg.0 as usize + pass) as u32 % group_count as u32);
            let got = self.alloc_in_group(bg, remaining, pass == 0)?;
            remaining -= got.len() as u32;
            allocated.extend(got);
        }

        if allocated.is_empty() {
            return Err(Error::NoSpace);
        }
        self.sb.sb_last_allocated_bgid = self.sb.bg_of_block(allocated[0].0).0;
        self.bgs.set_cursor(
            AllocCursor::Data,
            BlockGroupNumber(self.sb.sb_last_allocated_bgid),
        );
        Ok(allocated)
    }

    /// Claims up to `want` clusters from one group's bitmap. `use_rotor`
    /// starts the search at the group's next-block rotor instead of the
    /// data table base.
    fn alloc_in_group(
        &mut self,
        bg: BlockGroupNumber,
        want: u32,
        use_rotor: bool,
    ) -> FsResult<Vec<BlkId>> {
        let bd = *self.bgs.descriptor(bg)?;
        if bd.bd_free_blocks == 0 {
            return Ok(Vec::new());
        }
        let clusters_in_group = bd.dtable_offset() + bd.bd_dtable_size;
        let hint = if use_rotor && bd.bd_next_block != 0 {
            bd.bd_next_block
        } else {
            bd.dtable_offset()
        };

        let bitmap_blk = BlkId(bd.bd_dbitmap_start);
        let key = BufKey::meta(InodeNumber::DBITMAP, bitmap_blk);
        let bid = self.bcache.get(self.dev.as_mut(), key, bitmap_blk)?;

        let run = match bitmap::find_free_run(
            self.bcache.data(bid),
            clusters_in_group,
            hint,
            want,
        ) {
            Some(run) => run,
            None => {
                self.bcache.put(bid, false);
                // descriptor said there was room
                error!(target: "nvfuse-alloc", "group {bg} free count disagrees with bitmap");
                return Err(Error::Corrupt);
            }
        };

        let take = run.len.min(want).min(bd.bd_free_blocks);
        for off in run.start..run.start + take {
            if bitmap::set_bit(self.bcache.data_mut(bid), off) {
                self.bcache.put(bid, false);
                return Err(Error::Corrupt);
            }
        }
        self.bcache.put(bid, true);

        // bitmap, then descriptor, then superblock
        let bd = self.bgs.descriptor_mut(bg)?;
        bd.bd_free_blocks -= take;
        bd.bd_next_block = (run.start + take) % clusters_in_group;
        self.sb.sb_free_blocks -= i64::from(take);
        self.sb.sb_no_of_used_blocks += i64::from(take);

        let base = self.sb.bg_start(bg);
        debug!(
            target: "nvfuse-alloc",
            "group {bg}: {take} clusters at offset {}",
            run.start
        );
        Ok((run.start..run.start + take)
            .map(|off| BlkId(base + off))
            .collect())
    }

    /// Releases `count` contiguous clusters starting at `start`.
    ///
    /// # Errors
    ///
    /// Freeing an already-free cluster is an on-disk inconsistency and
    /// fails with [`Error::Corrupt`].
    pub(crate) fn free_blocks(&mut self, start: BlkId, count: u32) -> CanFail<Error> {
        for n in 0..count {
            let blk = start + n;
            let bg = self.sb.bg_of_block(blk.0);
            let bd = *self.bgs.descriptor(bg)?;
            let offset = blk.0 - bd.bd_bg_start;
            if offset < bd.dtable_offset() {
                error!(target: "nvfuse-alloc", "refusing to free metadata cluster {blk}");
                return Err(Error::Corrupt);
            }

            let bitmap_blk = BlkId(bd.bd_dbitmap_start);
            let key = BufKey::meta(InodeNumber::DBITMAP, bitmap_blk);
            let bid = self.bcache.get(self.dev.as_mut(), key, bitmap_blk)?;
            if !bitmap::clear_bit(self.bcache.data_mut(bid), offset) {
                self.bcache.put(bid, false);
                error!(target: "nvfuse-alloc", "double free of cluster {blk}");
                return Err(Error::Corrupt);
            }
            self.bcache.put(bid, true);

            let bd = self.bgs.descriptor_mut(bg)?;
            bd.bd_free_blocks += 1;
            self.sb.sb_free_blocks += 1;
            self.sb.sb_no_of_used_blocks -= 1;

            // a stale cached image of the freed cluster must not survive
            // into its next life
            self.bcache
                .discard(BufKey::meta(InodeNumber::BLOCK_IO, blk));
        }
        Ok(())
    }

    /// Allocates an inode number, scanning the inode bitmaps from the
    /// inode-allocation cursor.
    pub(crate) fn alloc_inode(&mut self) -> FsResult<InodeNumber> {
        let group_count = self.bgs.group_count();
        let start_bg = self.bgs.cursor_bg(AllocCursor::Inode);

        for pass in 0..group_count {
            let bg = BlockGroupNumber((start_bg.0 as usize + pass) as u32 % group_count as u32);
            let bd = *self.bgs.descriptor(bg)?;
            if bd.bd_free_inodes == 0 {
                continue;
            }

            let bitmap_blk = BlkId(bd.bd_ibitmap_start);
            let key = BufKey::meta(InodeNumber::IBITMAP, bitmap_blk);
            let bid = self.bcache.get(self.dev.as_mut(), key, bitmap_blk)?;

            let hint = if bg.0 == self.sb.sb_last_allocated_ino / self.sb.sb_no_of_inodes_per_bg
            {
                self.sb.sb_last_allocated_ino % self.sb.sb_no_of_inodes_per_bg
            } else {
                0
            };
            let slot = match bitmap::find_next_zero_bit(
                self.bcache.data(bid),
                self.sb.sb_no_of_inodes_per_bg,
                hint,
            ) {
                Some(slot) => slot,
                None => {
                    self.bcache.put(bid, false);
                    error!(target: "nvfuse-alloc", "group {bg} inode count disagrees with bitmap");
                    return Err(Error::Corrupt);
                }
            };

            if bitmap::set_bit(self.bcache.data_mut(bid), slot) {
                self.bcache.put(bid, false);
                return Err(Error::Corrupt);
            }
            self.bcache.put(bid, true);

            let bd = self.bgs.descriptor_mut(bg)?;
            bd.bd_free_inodes -= 1;
            self.sb.sb_free_inodes -= 1;

            let ino = InodeNumber(bg.0 * self.sb.sb_no_of_inodes_per_bg + slot);
            self.sb.sb_last_allocated_ino = ino.0;
            self.sb.sb_last_allocated_bgid_by_ino = bg.0;
            self.bgs.set_cursor(AllocCursor::Inode, bg);
            return Ok(ino);
        }

        Err(Error::NoInode)
    }

    /// Releases an inode number back to its group's bitmap.
    pub(crate) fn free_inode_bit(&mut self, ino: InodeNumber) -> CanFail<Error> {
        if ino.0 < NUM_RESV_INO {
            return Err(Error::Corrupt);
        }
        let bg = self.sb.bg_of_inode(ino);
        let slot = self.sb.inode_slot_in_bg(ino);
        let bd = *self.bgs.descriptor(bg)?;

        let bitmap_blk = BlkId(bd.bd_ibitmap_start);
        let key = BufKey::meta(InodeNumber::IBITMAP, bitmap_blk);
        let bid = self.bcache.get(self.dev.as_mut(), key, bitmap_blk)?;
        if !bitmap::clear_bit(self.bcache.data_mut(bid), slot) {
            self.bcache.put(bid, false);
            error!(target: "nvfuse-alloc", "double free of inode {ino}");
            return Err(Error::Corrupt);
        }
        self.bcache.put(bid, true);

        let bd = self.bgs.descriptor_mut(bg)?;
        bd.bd_free_inodes += 1;
        self.sb.sb_free_inodes += 1;
        Ok(())
    }
}
