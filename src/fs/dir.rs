//! Directory entry array operations.
//!
//! A directory's data is a flat array of fixed 128-byte entries, 32 per
//! cluster. Entries are never compacted: deletion flips the slot's flag
//! and the slot is found again by the free-slot scan on a later create.
//! The companion B+tree index maps filename hashes to slot numbers; every
//! mutation here keeps the two views consistent.

use bytemuck::{Pod, Zeroable};

use crate::errors::{CanFail, Error, FsResult};
use crate::fs::buffer::BufKey;
use crate::fs::dirhash::dir_hash;
use crate::fs::layout::{
    InodeNumber, LbnId, BP_COLLISION_BITS, CLUSTER_SIZE, DIR_ENTRY_NUM, DIR_ENTRY_SIZE,
    FNAME_SIZE,
};
use crate::fs::NvfuseFs;

/// Slot has never held an entry.
pub const DIR_EMPTY: u32 = 0;

/// Slot holds a live entry.
pub const DIR_USED: u32 = 1 << 1;

/// Slot held an entry that was unlinked.
pub const DIR_DELETED: u32 = 1 << 2;

const COLLISION_MASK: u64 = (1 << BP_COLLISION_BITS) - 1;

/// On-disk directory entry.
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
#[repr(C)]
pub struct DirEntry {
    pub d_ino: InodeNumber,
    pub d_flag: u32,
    pub d_version: u32,
    pub d_filename: [u8; FNAME_SIZE],
}

const _: () = assert!(core::mem::size_of::<DirEntry>() == DIR_ENTRY_SIZE);

impl DirEntry {
    /// Builds a live entry. The name must leave room for the NUL
    /// terminator.
    pub fn new(ino: InodeNumber, name: &[u8], version: u32) -> FsResult<Self> {
        if name.is_empty() || name.len() >= FNAME_SIZE {
            return Err(Error::Invalid);
        }
        let mut entry = DirEntry::zeroed();
        entry.d_ino = ino;
        entry.d_flag = DIR_USED;
        entry.d_version = version;
        entry.d_filename[..name.len()].copy_from_slice(name);
        Ok(entry)
    }

    /// The stored name, without the NUL terminator.
    pub fn name(&self) -> &[u8] {
        let len = self
            .d_filename
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FNAME_SIZE);
        &self.d_filename[..len]
    }

    pub fn is_used(&self) -> bool {
        self.d_flag == DIR_USED
    }
}

/// Index key of a filename: major hash in the high word, minor hash in the
/// low word, with the collision-chain bits cleared.
pub fn dir_index_key(name: &[u8]) -> u64 {
    let (h1, h2) = dir_hash(name);
    ((u64::from(h1) << 32) | u64::from(h2)) & !COLLISION_MASK
}

/// A located directory entry: slot number, index key actually used (with
/// its collision suffix) and the decoded entry.
pub(crate) struct FoundEntry {
    pub slot: u64,
    pub key: u64,
    pub entry: DirEntry,
}

impl NvfuseFs {
    fn dir_entry_location(slot: u64) -> (LbnId, usize) {
        (
            LbnId((slot / DIR_ENTRY_NUM as u64) as u32),
            (slot as usize % DIR_ENTRY_NUM) * DIR_ENTRY_SIZE,
        )
    }

    /// Reads one entry slot of an opened directory.
    pub(crate) fn read_dir_entry(
        &mut self,
        dir_ino: InodeNumber,
        slot: u64,
    ) -> FsResult<DirEntry> {
        let (lbn, offset) = Self::dir_entry_location(slot);
        let pblk = self.get_pbn(dir_ino, lbn)?;
        if pblk.is_null() {
            return Err(Error::Corrupt);
        }
        let bid = self
            .bcache
            .get(self.dev.as_mut(), BufKey::data(dir_ino, lbn), pblk)?;
        let entry =
            bytemuck::pod_read_unaligned(&self.bcache.data(bid)[offset..offset + DIR_ENTRY_SIZE]);
        self.bcache.put(bid, false);
        Ok(entry)
    }

    fn write_dir_entry(
        &mut self,
        dir_ino: InodeNumber,
        slot: u64,
        entry: &DirEntry,
    ) -> CanFail<Error> {
        let (lbn, offset) = Self::dir_entry_location(slot);
        let pblk = self.get_pbn(dir_ino, lbn)?;
        if pblk.is_null() {
            return Err(Error::Corrupt);
        }
        let bid = self
            .bcache
            .get(self.dev.as_mut(), BufKey::data(dir_ino, lbn), pblk)?;
        self.bcache.data_mut(bid)[offset..offset + DIR_ENTRY_SIZE]
            .copy_from_slice(bytemuck::bytes_of(entry));
        self.put_data_dirty(dir_ino, bid);
        Ok(())
    }

    /// Finds a reusable slot starting at the directory's free-slot hint,
    /// extending the entry array by one cluster when every slot is live.
    fn dir_find_free_slot(&mut self, dir_ino: InodeNumber) -> FsResult<u64> {
        let inode = self.inode_of(dir_ino)?;
        let total = inode.i_size as u64 / DIR_ENTRY_SIZE as u64;
        let hint = u64::from(inode.i_ptr).min(total);

        for n in 0..total {
            let slot = (hint + n) % total;
            let entry = self.read_dir_entry(dir_ino, slot)?;
            if !entry.is_used() {
                return Ok(slot);
            }
        }

        // every slot is live: grow by one cluster of empty entries
        let lbn = LbnId((total as usize / DIR_ENTRY_NUM) as u32);
        self.ensure_mapped(dir_ino, lbn)?;
        let pblk = self.get_pbn(dir_ino, lbn)?;
        let bid = self
            .bcache
            .get_zeroed(self.dev.as_mut(), BufKey::data(dir_ino, lbn), pblk)?;
        self.put_data_dirty(dir_ino, bid);

        let mut inode = self.inode_of(dir_ino)?;
        inode.i_size += CLUSTER_SIZE as i64;
        self.update_inode(dir_ino, inode)?;
        Ok(total)
    }

    /// Looks a name up through the index, verifying candidates byte for
    /// byte against the entry array (hash collisions chain through the low
    /// key bits).
    pub(crate) fn dir_lookup_entry(
        &mut self,
        dir_ino: InodeNumber,
        bpino: InodeNumber,
        name: &[u8],
    ) -> FsResult<Option<FoundEntry>> {
        let base = dir_index_key(name);
        // deletions may leave holes in the chain, so every suffix is tried
        for chain in 0..=COLLISION_MASK {
            let key = base | chain;
            let Some(slot) = self.bp_lookup(bpino, key)? else {
                continue;
            };
            let entry = self.read_dir_entry(dir_ino, slot)?;
            if !entry.is_used() {
                return Err(Error::Corrupt);
            }
            if entry.name() == name {
                return Ok(Some(FoundEntry { slot, key, entry }));
            }
        }
        Ok(None)
    }

    /// Adds a `(name, ino)` entry to a directory and indexes it.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Exists`] if the name is present, and with
    /// [`Error::NoSpace`] if the collision chain of the name's hash is
    /// saturated.
    pub(crate) fn dir_link_entry(
        &mut self,
        dir_ino: InodeNumber,
        bpino: InodeNumber,
        name: &[u8],
        ino: InodeNumber,
    ) -> CanFail<Error> {
        if self.dir_lookup_entry(dir_ino, bpino, name)?.is_some() {
            return Err(Error::Exists);
        }

        let slot = self.dir_find_free_slot(dir_ino)?;
        let mut inode = self.inode_of(dir_ino)?;
        inode.i_version = inode.i_version.wrapping_add(1);
        let entry = DirEntry::new(ino, name, inode.i_version)?;
        self.write_dir_entry(dir_ino, slot, &entry)?;

        // chain through the collision bits until the index takes the key
        let base = dir_index_key(name);
        let mut indexed = false;
        for chain in 0..=COLLISION_MASK {
            match self.bp_insert(bpino, base | chain, slot) {
                Ok(()) => {
                    indexed = true;
                    break;
                }
                Err(Error::Exists) => continue,
                Err(e) => return Err(e),
            }
        }
        if !indexed {
            // roll the entry back; the name simply cannot be indexed
            let mut dead = entry;
            dead.d_flag = DIR_DELETED;
            self.write_dir_entry(dir_ino, slot, &dead)?;
            return Err(Error::NoSpace);
        }

        inode.i_ptr = (slot + 1) as u32;
        inode.i_mtime = crate::fs::inode::unix_now();
        self.update_inode(dir_ino, inode)?;
        Ok(())
    }

    /// Removes a name from a directory, returning the entry it held. The
    /// slot is flagged deleted and offered back to the free-slot scan.
    pub(crate) fn dir_unlink_entry(
        &mut self,
        dir_ino: InodeNumber,
        bpino: InodeNumber,
        name: &[u8],
    ) -> FsResult<DirEntry> {
        let found = self
            .dir_lookup_entry(dir_ino, bpino, name)?
            .ok_or(Error::NotFound)?;

        let mut entry = found.entry;
        entry.d_flag = DIR_DELETED;
        self.write_dir_entry(dir_ino, found.slot, &entry)?;
        self.bp_delete(bpino, found.key)?;

        let mut inode = self.inode_of(dir_ino)?;
        inode.i_ptr = inode.i_ptr.min(found.slot as u32);
        inode.i_version = inode.i_version.wrapping_add(1);
        inode.i_mtime = crate::fs::inode::unix_now();
        self.update_inode(dir_ino, inode)?;
        Ok(found.entry)
    }

    /// Renames an entry in place: same slot, new name, re-keyed index.
    pub(crate) fn dir_rename_entry(
        &mut self,
        dir_ino: InodeNumber,
        bpino: InodeNumber,
        old_name: &[u8],
        new_name: &[u8],
    ) -> CanFail<Error> {
        let found = self
            .dir_lookup_entry(dir_ino, bpino, old_name)?
            .ok_or(Error::NotFound)?;

        let mut inode = self.inode_of(dir_ino)?;
        inode.i_version = inode.i_version.wrapping_add(1);
        let entry = DirEntry::new(found.entry.d_ino, new_name, inode.i_version)?;

        let base = dir_index_key(new_name);
        let mut indexed = false;
        for chain in 0..=COLLISION_MASK {
            match self.bp_insert(bpino, base | chain, found.slot) {
                Ok(()) => {
                    indexed = true;
                    break;
                }
                Err(Error::Exists) => continue,
                Err(e) => return Err(e),
            }
        }
        if !indexed {
            return Err(Error::NoSpace);
        }

        self.bp_delete(bpino, found.key)?;
        self.write_dir_entry(dir_ino, found.slot, &entry)?;
        inode.i_mtime = crate::fs::inode::unix_now();
        self.update_inode(dir_ino, inode)?;
        Ok(())
    }

    /// Whether the directory holds nothing but `.` and `..`.
    pub(crate) fn dir_is_empty(&mut self, dir_ino: InodeNumber) -> FsResult<bool> {
        let inode = self.inode_of(dir_ino)?;
        let total = inode.i_size as u64 / DIR_ENTRY_SIZE as u64;
        for slot in 0..total {
            let entry = self.read_dir_entry(dir_ino, slot)?;
            if entry.is_used() && entry.name() != b"." && entry.name() != b".." {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Returns the next live entry at or after `slot`, with its slot
    /// number, skipping empty and deleted slots.
    pub(crate) fn dir_next_entry(
        &mut self,
        dir_ino: InodeNumber,
        slot: u64,
    ) -> FsResult<Option<(u64, DirEntry)>> {
        let inode = self.inode_of(dir_ino)?;
        let total = inode.i_size as u64 / DIR_ENTRY_SIZE as u64;
        for s in slot..total {
            let entry = self.read_dir_entry(dir_ino, s)?;
            if entry.is_used() {
                return Ok(Some((s, entry)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_names_are_nul_bounded() {
        let entry = DirEntry::new(InodeNumber(9), b"hello", 1).unwrap();
        assert_eq!(entry.name(), b"hello");
        assert!(entry.is_used());
    }

    #[test]
    fn oversized_names_are_rejected() {
        let name = [b'x'; FNAME_SIZE];
        assert_eq!(
            DirEntry::new(InodeNumber(9), &name, 1).unwrap_err(),
            Error::Invalid
        );
        // the longest legal name still leaves the NUL in place
        let name = [b'x'; FNAME_SIZE - 1];
        let entry = DirEntry::new(InodeNumber(9), &name, 1).unwrap();
        assert_eq!(entry.name().len(), FNAME_SIZE - 1);
    }

    #[test]
    fn index_keys_reserve_collision_bits() {
        let key = dir_index_key(b"some-name");
        assert_eq!(key & COLLISION_MASK, 0);
    }
}
