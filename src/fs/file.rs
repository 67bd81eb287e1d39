//! Open file table and file I/O.
//!
//! The file table is a small per-mount pool of descriptors handed to
//! callers as plain indexes, the first three of which are reserved to
//! mirror stdio. A descriptor caches the inode number, open flags and the
//! read/write offset; file size is always taken from the inode, so
//! descriptors sharing an inode observe truncation and extension
//! immediately.

use bitflags::bitflags;

use crate::errors::{CanFail, Error, FsResult};
use crate::fs::buffer::BufKey;
use crate::fs::inode::unix_now;
use crate::fs::layout::{
    InodeNumber, LbnId, CLUSTER_SIZE, MAX_FILE_SIZE, MAX_OPEN_FILE, START_OPEN_FILE,
};
use crate::fs::NvfuseFs;

bitflags! {
    /// Open flags understood by `openfile_path`. Read-only is the absence
    /// of the write bits, as in the POSIX encoding.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenFlags: i32 {
        const WRONLY = libc::O_WRONLY;
        const RDWR = libc::O_RDWR;
        const CREAT = libc::O_CREAT;
        const TRUNC = libc::O_TRUNC;
        const APPEND = libc::O_APPEND;
    }
}

impl OpenFlags {
    pub fn writable(self) -> bool {
        self.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
    }
}

/// Seek origins for `lseek`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct FileTableEntry {
    pub ino: InodeNumber,
    pub rw_offset: i64,
    pub flags: OpenFlags,
    pub used: bool,
}

impl FileTableEntry {
    const EMPTY: Self = FileTableEntry {
        ino: InodeNumber::NULL,
        rw_offset: 0,
        flags: OpenFlags::empty(),
        used: false,
    };
}

/// Bounded pool of open file descriptors.
pub(crate) struct FileTable {
    pub(crate) entries: [FileTableEntry; MAX_OPEN_FILE],
}

impl FileTable {
    pub fn new() -> Self {
        FileTable {
            entries: [FileTableEntry::EMPTY; MAX_OPEN_FILE],
        }
    }

    /// Claims the first free slot at or above the reserved range.
    fn alloc(&mut self) -> FsResult<usize> {
        for fd in START_OPEN_FILE..MAX_OPEN_FILE {
            if !self.entries[fd].used {
                return Ok(fd);
            }
        }
        Err(Error::Busy)
    }

    fn get(&self, fd: u32) -> FsResult<&FileTableEntry> {
        let entry = self
            .entries
            .get(fd as usize)
            .filter(|e| e.used)
            .ok_or(Error::Invalid)?;
        if (fd as usize) < START_OPEN_FILE {
            return Err(Error::Invalid);
        }
        Ok(entry)
    }

    fn get_mut(&mut self, fd: u32) -> FsResult<&mut FileTableEntry> {
        if (fd as usize) < START_OPEN_FILE {
            return Err(Error::Invalid);
        }
        self.entries
            .get_mut(fd as usize)
            .filter(|e| e.used)
            .ok_or(Error::Invalid)
    }

    fn release(&mut self, fd: u32) {
        self.entries[fd as usize] = FileTableEntry::EMPTY;
    }

    /// Whether any open descriptor still references `ino`.
    pub fn references(&self, ino: InodeNumber) -> bool {
        self.entries.iter().any(|e| e.used && e.ino == ino)
    }
}

impl NvfuseFs {
    // ---- byte-granular inode I/O -------------------------------------

    /// Reads from an opened inode's data at `offset`, clamped to the
    /// inode size. Sparse holes read as zeros.
    pub(crate) fn read_ino_bytes(
        &mut self,
        ino: InodeNumber,
        offset: i64,
        buf: &mut [u8],
    ) -> FsResult<usize> {
        let inode = self.inode_of(ino)?;
        if offset < 0 {
            return Err(Error::Invalid);
        }
        if offset >= inode.i_size {
            return Ok(0);
        }
        let count = buf.len().min((inode.i_size - offset) as usize);

        let mut done = 0usize;
        while done < count {
            let pos = offset as u64 + done as u64;
            let lbn = LbnId::containing(pos);
            let intra = (pos % CLUSTER_SIZE as u64) as usize;
            let chunk = (CLUSTER_SIZE - intra).min(count - done);

            let pblk = self.get_pbn(ino, lbn)?;
            if pblk.is_null() {
                buf[done..done + chunk].fill(0);
            } else {
                let bid = self
                    .bcache
                    .get(self.dev.as_mut(), BufKey::data(ino, lbn), pblk)?;
                buf[done..done + chunk]
                    .copy_from_slice(&self.bcache.data(bid)[intra..intra + chunk]);
                self.bcache.put(bid, false);
            }
            done += chunk;
        }
        Ok(done)
    }

    /// Writes into an opened inode's data at `offset`, allocating clusters
    /// as needed and extending the size past end-of-file writes.
    pub(crate) fn write_ino_bytes(
        &mut self,
        ino: InodeNumber,
        offset: i64,
        data: &[u8],
    ) -> FsResult<usize> {
        if offset < 0 {
            return Err(Error::Invalid);
        }
        let end = offset as u64 + data.len() as u64;
        if end > MAX_FILE_SIZE {
            return Err(Error::TooLarge);
        }

        let mut done = 0usize;
        while done < data.len() {
            let pos = offset as u64 + done as u64;
            let lbn = LbnId::containing(pos);
            let intra = (pos % CLUSTER_SIZE as u64) as usize;
            let chunk = (CLUSTER_SIZE - intra).min(data.len() - done);

            let was_sparse = self.get_pbn(ino, lbn)?.is_null();
            let pblk = self.ensure_mapped(ino, lbn)?;
            let key = BufKey::data(ino, lbn);
            // a freshly allocated cluster must not leak its previous
            // on-disk contents around a partial write
            let bid = if was_sparse || chunk == CLUSTER_SIZE {
                self.bcache.get_zeroed(self.dev.as_mut(), key, pblk)?
            } else {
                self.bcache.get(self.dev.as_mut(), key, pblk)?
            };
            self.bcache.data_mut(bid)[intra..intra + chunk]
                .copy_from_slice(&data[done..done + chunk]);
            self.put_data_dirty(ino, bid);
            done += chunk;
        }

        let mut inode = self.inode_of(ino)?;
        if end as i64 > inode.i_size {
            inode.i_size = end as i64;
        }
        inode.i_mtime = unix_now();
        self.update_inode(ino, inode)?;
        Ok(done)
    }

    // ---- descriptor operations ---------------------------------------

    /// Opens a file by path, creating it when `O_CREAT` is given.
    pub(crate) fn openfile_path(
        &mut self,
        path: &str,
        flags: OpenFlags,
        mode: u16,
    ) -> FsResult<u32> {
        let ino = match self.resolve_path(path, true) {
            Ok(_) if flags.contains(OpenFlags::CREAT) => {
                // creation is exclusive: a taken name is an error
                return Err(Error::Exists);
            }
            Ok(ino) => {
                // existing file: take the table's context reference
                self.open_ictx(ino)?;
                ino
            }
            Err(Error::NotFound) if flags.contains(OpenFlags::CREAT) => {
                // the fresh context already carries our reference
                self.create_file_at(path, mode)?
            }
            Err(e) => return Err(e),
        };

        let inode = self.inode_of(ino)?;
        if inode.is_directory() {
            self.release_ictx(ino, false);
            return Err(Error::IsDirectory);
        }

        if flags.contains(OpenFlags::TRUNC) && flags.writable() && inode.i_size > 0 {
            if let Err(e) = self.truncate_ino(ino, 0) {
                self.release_ictx(ino, false);
                return Err(e);
            }
        }

        let fd = match self.ftable.alloc() {
            Ok(fd) => fd,
            Err(e) => {
                self.release_ictx(ino, false);
                return Err(e);
            }
        };
        self.ftable.entries[fd] = FileTableEntry {
            ino,
            rw_offset: 0,
            flags,
            used: true,
        };
        Ok(fd as u32)
    }

    /// Closes a descriptor, completing any deferred deletion of an
    /// unlinked inode.
    pub(crate) fn closefile(&mut self, fd: u32) -> CanFail<Error> {
        let ino = self.ftable.get(fd)?.ino;
        self.ftable.release(fd);
        self.release_ictx(ino, false);

        if self.pending_delete.contains(&ino) && !self.ftable.references(ino) {
            self.pending_delete.remove(&ino);
            self.open_ictx(ino)?;
            self.delete_inode(ino)?;
        }
        Ok(())
    }

    pub(crate) fn readfile(&mut self, fd: u32, buf: &mut [u8]) -> FsResult<usize> {
        let entry = *self.ftable.get(fd)?;
        let n = self.read_ino_bytes(entry.ino, entry.rw_offset, buf)?;
        self.ftable.get_mut(fd)?.rw_offset += n as i64;
        Ok(n)
    }

    pub(crate) fn writefile(&mut self, fd: u32, data: &[u8]) -> FsResult<usize> {
        let entry = *self.ftable.get(fd)?;
        if !entry.flags.writable() {
            return Err(Error::Invalid);
        }
        let offset = if entry.flags.contains(OpenFlags::APPEND) {
            self.inode_of(entry.ino)?.i_size
        } else {
            entry.rw_offset
        };
        let n = self.write_ino_bytes(entry.ino, offset, data)?;
        self.ftable.get_mut(fd)?.rw_offset = offset + n as i64;
        Ok(n)
    }

    pub(crate) fn lseek(&mut self, fd: u32, offset: i64, whence: Whence) -> FsResult<i64> {
        let entry = *self.ftable.get(fd)?;
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => entry.rw_offset,
            Whence::End => self.inode_of(entry.ino)?.i_size,
        };
        let target = base.checked_add(offset).ok_or(Error::Invalid)?;
        if target < 0 {
            return Err(Error::Invalid);
        }
        self.ftable.get_mut(fd)?.rw_offset = target;
        Ok(target)
    }

    pub(crate) fn ftruncate(&mut self, fd: u32, size: i64) -> CanFail<Error> {
        let entry = *self.ftable.get(fd)?;
        if !entry.flags.writable() {
            return Err(Error::Invalid);
        }
        self.truncate_ino(entry.ino, size)
    }

    /// Flushes a descriptor's inode (data, indirect clusters, record) and
    /// then the global metadata in the crash-detectable order.
    pub(crate) fn fsync(&mut self, fd: u32) -> CanFail<Error> {
        let ino = self.ftable.get(fd)?.ino;
        self.sync_inode(ino)?;
        self.sync_metadata()?;
        self.dev.flush()
    }

    /// Preallocates clusters for `[offset, offset + len)` and extends the
    /// file size over the range.
    pub(crate) fn fallocate_path(&mut self, path: &str, offset: i64, len: i64) -> CanFail<Error> {
        if offset < 0 || len <= 0 {
            return Err(Error::Invalid);
        }
        let end = offset as u64 + len as u64;
        if end > MAX_FILE_SIZE {
            return Err(Error::TooLarge);
        }

        let ino = self.resolve_path(path, true)?;
        self.open_ictx(ino)?;
        let res = (|| -> CanFail<Error> {
            let first = LbnId::containing(offset as u64);
            let last = LbnId::containing(end - 1);
            for lbn in first.0..=last.0 {
                if self.get_pbn(ino, LbnId(lbn))?.is_null() {
                    let pblk = self.ensure_mapped(ino, LbnId(lbn))?;
                    // preallocated clusters read back as zeros
                    let bid = self.bcache.get_zeroed(
                        self.dev.as_mut(),
                        BufKey::data(ino, LbnId(lbn)),
                        pblk,
                    )?;
                    self.put_data_dirty(ino, bid);
                }
            }
            let mut inode = self.inode_of(ino)?;
            if end as i64 > inode.i_size {
                inode.i_size = end as i64;
            }
            self.update_inode(ino, inode)
        })();
        self.release_ictx(ino, res.is_ok());
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_hands_out_slots_above_the_reserved_range() {
        let mut table = FileTable::new();
        let fd = table.alloc().unwrap();
        assert_eq!(fd, START_OPEN_FILE);
        table.entries[fd].used = true;
        assert_eq!(table.alloc().unwrap(), START_OPEN_FILE + 1);

        table.release(fd as u32);
        assert_eq!(table.alloc().unwrap(), START_OPEN_FILE);
    }

    #[test]
    fn table_exhaustion_is_reported_as_busy() {
        let mut table = FileTable::new();
        for _ in START_OPEN_FILE..MAX_OPEN_FILE {
            let fd = table.alloc().unwrap();
            table.entries[fd].used = true;
        }
        assert_eq!(table.alloc().unwrap_err(), Error::Busy);
    }

    #[test]
    fn descriptors_below_the_reserved_range_are_invalid() {
        let table = FileTable::new();
        assert_eq!(table.get(0).unwrap_err(), Error::Invalid);
        assert_eq!(table.get(2).unwrap_err(), Error::Invalid);
    }
}
