//! Path resolution and namespace operations.
//!
//! Paths split on `/` and resolve component by component from the root (or
//! the mount's current directory), each step going through the parent's
//! B+tree index. Symbolic links resolve up to a bounded depth. The
//! operations here own the link-count bookkeeping; entry-array and index
//! consistency is the directory layer's job.

use log::debug;

use crate::errors::{CanFail, Error, FsResult};
use crate::fs::inode::{unix_now, Inode};
use crate::fs::layout::{InodeNumber, InodeType, FNAME_SIZE, SYMLINK_MAX_DEPTH};
use crate::fs::NvfuseFs;

/// Mode bits marking a symbolic link in `i_mode`.
pub const S_IFLNK: u16 = 0xA000;

/// Attributes reported by `getattr`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileAttr {
    pub ino: u32,
    pub mode: u16,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub nlink: u32,
    pub size: i64,
    pub uid: u16,
    pub gid: u16,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
}

fn components(path: &str) -> FsResult<Vec<&[u8]>> {
    if path.is_empty() {
        return Err(Error::Invalid);
    }
    let mut out = Vec::new();
    for comp in path.split('/') {
        if comp.is_empty() {
            continue;
        }
        if comp.len() >= FNAME_SIZE {
            return Err(Error::Invalid);
        }
        out.push(comp.as_bytes());
    }
    Ok(out)
}

impl NvfuseFs {
    /// Opens a directory context together with its index inode. Returns
    /// the index inode number.
    pub(crate) fn open_dir(&mut self, ino: InodeNumber) -> FsResult<InodeNumber> {
        self.open_ictx(ino)?;
        let inode = self.inode_of(ino)?;
        if !inode.is_directory() {
            self.release_ictx(ino, false);
            return Err(Error::NotDirectory);
        }
        let bpino = inode.i_bpino;
        if let Err(e) = self.open_ictx(bpino) {
            self.release_ictx(ino, false);
            return Err(e);
        }
        Ok(bpino)
    }

    pub(crate) fn close_dir(&mut self, ino: InodeNumber, bpino: InodeNumber) {
        self.release_ictx(bpino, false);
        self.release_ictx(ino, false);
    }

    /// Looks one component up inside a directory.
    fn lookup_component(
        &mut self,
        dir_ino: InodeNumber,
        name: &[u8],
    ) -> FsResult<Option<InodeNumber>> {
        let bpino = self.open_dir(dir_ino)?;
        let found = self.dir_lookup_entry(dir_ino, bpino, name);
        self.close_dir(dir_ino, bpino);
        Ok(found?.map(|f| f.entry.d_ino))
    }

    /// Resolves a path to an inode number. `follow_last` controls whether
    /// a trailing symbolic link is chased.
    pub(crate) fn resolve_path(&mut self, path: &str, follow_last: bool) -> FsResult<InodeNumber> {
        self.resolve_from(self.walk_start(path), path, follow_last, 0)
    }

    fn walk_start(&self, path: &str) -> InodeNumber {
        if path.starts_with('/') {
            self.sb.sb_root_ino
        } else {
            self.cwd_ino
        }
    }

    fn resolve_from(
        &mut self,
        start: InodeNumber,
        path: &str,
        follow_last: bool,
        depth: usize,
    ) -> FsResult<InodeNumber> {
        if depth > SYMLINK_MAX_DEPTH {
            return Err(Error::Invalid);
        }

        let comps = components(path)?;
        let mut cur = start;
        for (i, name) in comps.iter().enumerate() {
            let last = i == comps.len() - 1;
            if *name == b"." {
                continue;
            }
            let next = self
                .lookup_component(cur, name)?
                .ok_or(Error::NotFound)?;

            // chase symlinks in the middle of the walk, and at the end
            // when the caller asked for it
            let target = {
                self.open_ictx(next)?;
                let inode = self.inode_of(next)?;
                let target = if inode.is_symlink() && (!last || follow_last) {
                    Some(self.read_symlink_target(next)?)
                } else {
                    None
                };
                self.release_ictx(next, false);
                target
            };

            cur = if let Some(target) = target {
                let target = String::from_utf8(target).map_err(|_| Error::Invalid)?;
                let base = if target.starts_with('/') {
                    self.sb.sb_root_ino
                } else {
                    cur
                };
                self.resolve_from(base, &target, true, depth + 1)?
            } else {
                next
            };
        }
        Ok(cur)
    }

    /// Resolves everything but the final component. Returns the parent
    /// directory and the final name.
    pub(crate) fn resolve_parent(&mut self, path: &str) -> FsResult<(InodeNumber, Vec<u8>)> {
        let comps = components(path)?;
        let Some((&name, parents)) = comps.split_last() else {
            return Err(Error::Invalid);
        };
        if name == b"." || name == b".." {
            return Err(Error::Invalid);
        }

        let mut cur = self.walk_start(path);
        for parent in parents {
            if *parent == b"." {
                continue;
            }
            cur = self
                .lookup_component(cur, parent)?
                .ok_or(Error::NotFound)?;
        }

        // the parent leg must land on a directory
        self.open_ictx(cur)?;
        let is_dir = self.inode_of(cur)?.is_directory();
        self.release_ictx(cur, false);
        if !is_dir {
            return Err(Error::NotDirectory);
        }
        Ok((cur, name.to_vec()))
    }

    // ---- create / remove ---------------------------------------------

    /// Creates a regular file. The new context keeps one reference for the
    /// caller.
    pub(crate) fn create_file_at(&mut self, path: &str, mode: u16) -> FsResult<InodeNumber> {
        let (parent, name) = self.resolve_parent(path)?;

        let bpino = self.open_dir(parent)?;
        if let Err(e) = self.check_absent(parent, bpino, &name) {
            self.close_dir(parent, bpino);
            return Err(e);
        }

        let ino = match self.alloc_inode() {
            Ok(ino) => ino,
            Err(e) => {
                self.close_dir(parent, bpino);
                return Err(e);
            }
        };
        self.install_ictx(ino, Inode::init(ino, InodeType::File, mode));

        let res = self.dir_link_entry(parent, bpino, &name, ino);
        self.close_dir(parent, bpino);
        if let Err(e) = res {
            self.release_ictx(ino, false);
            let _ = self.delete_inode(ino);
            return Err(e);
        }
        debug!(target: "nvfuse", "create {path} -> ino {ino}");
        Ok(ino)
    }

    fn check_absent(
        &mut self,
        parent: InodeNumber,
        bpino: InodeNumber,
        name: &[u8],
    ) -> CanFail<Error> {
        match self.dir_lookup_entry(parent, bpino, name)? {
            Some(_) => Err(Error::Exists),
            None => Ok(()),
        }
    }

    /// Creates a directory with its companion index and the `.`/`..`
    /// entries.
    pub(crate) fn mkdir_path(&mut self, path: &str, mode: u16) -> CanFail<Error> {
        let (parent, name) = self.resolve_parent(path)?;

        let parent_bp = self.open_dir(parent)?;
        if let Err(e) = self.check_absent(parent, parent_bp, &name) {
            self.close_dir(parent, parent_bp);
            return Err(e);
        }

        let res = (|| -> FsResult<InodeNumber> {
            let ino = self.alloc_inode()?;
            let bpino = self.create_bptree()?;

            let mut inode = Inode::init(ino, InodeType::Directory, mode);
            inode.i_bpino = bpino;
            inode.i_links_count = 2; // "." and the parent entry
            self.install_ictx(ino, inode);

            self.dir_link_entry(ino, bpino, b".", ino)?;
            self.dir_link_entry(ino, bpino, b"..", parent)?;
            self.dir_link_entry(parent, parent_bp, &name, ino)?;

            // ".." in the child counts against the parent
            let mut pinode = self.inode_of(parent)?;
            pinode.i_links_count += 1;
            self.update_inode(parent, pinode)?;

            self.release_ictx(bpino, false);
            self.release_ictx(ino, false);
            Ok(ino)
        })();

        self.close_dir(parent, parent_bp);
        res.map(|_| ())
    }

    /// Removes an empty directory.
    pub(crate) fn rmdir_path(&mut self, path: &str) -> CanFail<Error> {
        let (parent, name) = self.resolve_parent(path)?;
        let ino = self
            .lookup_component(parent, &name)?
            .ok_or(Error::NotFound)?;

        let bpino = self.open_dir(ino)?;
        let empty = self.dir_is_empty(ino);
        self.close_dir(ino, bpino);
        if !empty? {
            return Err(Error::NotEmpty);
        }

        let parent_bp = self.open_dir(parent)?;
        let res = self.dir_unlink_entry(parent, parent_bp, &name);
        if res.is_ok() {
            let _ = (|| -> CanFail<Error> {
                let mut pinode = self.inode_of(parent)?;
                pinode.i_links_count = pinode.i_links_count.saturating_sub(1);
                self.update_inode(parent, pinode)
            })();
        }
        self.close_dir(parent, parent_bp);
        res?;

        // tear down the index inode first, then the directory itself
        self.open_ictx(ino)?;
        let dir_bpino = self.inode_of(ino)?.i_bpino;
        self.release_ictx(ino, false);

        self.open_ictx(dir_bpino)?;
        self.delete_inode(dir_bpino)?;
        self.open_ictx(ino)?;
        self.delete_inode(ino)?;
        Ok(())
    }

    /// Unlinks a non-directory name. The inode is deleted when its link
    /// count reaches zero and no open file references it.
    pub(crate) fn unlink_path(&mut self, path: &str) -> CanFail<Error> {
        let (parent, name) = self.resolve_parent(path)?;

        let parent_bp = self.open_dir(parent)?;
        let looked = self.dir_lookup_entry(parent, parent_bp, &name);
        let found = match looked {
            Ok(Some(found)) => found,
            Ok(None) => {
                self.close_dir(parent, parent_bp);
                return Err(Error::NotFound);
            }
            Err(e) => {
                self.close_dir(parent, parent_bp);
                return Err(e);
            }
        };
        let ino = found.entry.d_ino;

        self.open_ictx(ino)?;
        let is_dir = self.inode_of(ino)?.is_directory();
        if is_dir {
            self.release_ictx(ino, false);
            self.close_dir(parent, parent_bp);
            return Err(Error::IsDirectory);
        }

        let res = self.dir_unlink_entry(parent, parent_bp, &name);
        self.close_dir(parent, parent_bp);
        res?;

        let mut inode = self.inode_of(ino)?;
        inode.i_links_count = inode.i_links_count.saturating_sub(1);
        inode.i_ctime = unix_now();
        let gone = inode.i_links_count == 0;
        self.update_inode(ino, inode)?;
        self.release_ictx(ino, true);

        if gone {
            if self.ftable.references(ino) {
                // deletion happens on the last close
                self.pending_delete.insert(ino);
            } else {
                self.open_ictx(ino)?;
                self.delete_inode(ino)?;
            }
        }
        Ok(())
    }

    /// Renames a name. The target must not exist; a same-parent rename
    /// rewrites the entry in place without moving data.
    pub(crate) fn rename_path(&mut self, old: &str, new: &str) -> CanFail<Error> {
        let (old_parent, old_name) = self.resolve_parent(old)?;
        let (new_parent, new_name) = self.resolve_parent(new)?;

        if self.lookup_component(new_parent, &new_name)?.is_some() {
            return Err(Error::Exists);
        }
        let ino = self
            .lookup_component(old_parent, &old_name)?
            .ok_or(Error::NotFound)?;

        if old_parent == new_parent {
            let bpino = self.open_dir(old_parent)?;
            let res = self.dir_rename_entry(old_parent, bpino, &old_name, &new_name);
            self.close_dir(old_parent, bpino);
            return res;
        }

        // cross-directory: add the new entry before dropping the old one
        let new_bp = self.open_dir(new_parent)?;
        let res = self.dir_link_entry(new_parent, new_bp, &new_name, ino);
        self.close_dir(new_parent, new_bp);
        res?;

        let old_bp = self.open_dir(old_parent)?;
        let res = self.dir_unlink_entry(old_parent, old_bp, &old_name);
        self.close_dir(old_parent, old_bp);
        res?;

        // a moved directory re-parents its ".." entry
        self.open_ictx(ino)?;
        let inode = self.inode_of(ino)?;
        let moved_dir = inode.is_directory();
        let bpino = inode.i_bpino;
        self.release_ictx(ino, false);
        if moved_dir {
            let child_bp = self.open_dir(ino)?;
            debug_assert_eq!(child_bp, bpino);
            self.dir_unlink_entry(ino, child_bp, b"..")?;
            self.dir_link_entry(ino, child_bp, b"..", new_parent)?;
            self.close_dir(ino, child_bp);

            for (dir, delta) in [(old_parent, -1i32), (new_parent, 1)] {
                self.open_ictx(dir)?;
                let mut pinode = self.inode_of(dir)?;
                pinode.i_links_count = pinode.i_links_count.wrapping_add(delta as u32);
                self.update_inode(dir, pinode)?;
                self.release_ictx(dir, true);
            }
        }
        Ok(())
    }

    /// Adds a hard link to an existing non-directory inode.
    pub(crate) fn hardlink_path(&mut self, target: &str, linkpath: &str) -> CanFail<Error> {
        let ino = self.resolve_path(target, true)?;

        self.open_ictx(ino)?;
        let mut inode = self.inode_of(ino)?;
        if inode.is_directory() {
            self.release_ictx(ino, false);
            return Err(Error::IsDirectory);
        }

        let (parent, name) = match self.resolve_parent(linkpath) {
            Ok(v) => v,
            Err(e) => {
                self.release_ictx(ino, false);
                return Err(e);
            }
        };
        let bpino = match self.open_dir(parent) {
            Ok(v) => v,
            Err(e) => {
                self.release_ictx(ino, false);
                return Err(e);
            }
        };
        let res = self.dir_link_entry(parent, bpino, &name, ino);
        self.close_dir(parent, bpino);

        match res {
            Ok(()) => {
                inode.i_links_count += 1;
                inode.i_ctime = unix_now();
                self.update_inode(ino, inode)?;
                self.release_ictx(ino, true);
                Ok(())
            }
            Err(e) => {
                self.release_ictx(ino, false);
                Err(e)
            }
        }
    }

    /// Creates a symbolic link whose data is the target path bytes.
    pub(crate) fn symlink_path(&mut self, target: &str, linkpath: &str) -> CanFail<Error> {
        if target.is_empty() || target.len() >= FNAME_SIZE {
            return Err(Error::Invalid);
        }
        let (parent, name) = self.resolve_parent(linkpath)?;

        let bpino = self.open_dir(parent)?;
        if let Err(e) = self.check_absent(parent, bpino, &name) {
            self.close_dir(parent, bpino);
            return Err(e);
        }

        let res = (|| -> CanFail<Error> {
            let ino = self.alloc_inode()?;
            self.install_ictx(ino, Inode::init(ino, InodeType::Special, S_IFLNK | 0o777));
            self.write_ino_bytes(ino, 0, target.as_bytes())?;
            self.dir_link_entry(parent, bpino, &name, ino)?;
            self.release_ictx(ino, true);
            Ok(())
        })();
        self.close_dir(parent, bpino);
        res
    }

    /// Reads the target of a symbolic link inode (context must be open).
    pub(crate) fn read_symlink_target(&mut self, ino: InodeNumber) -> FsResult<Vec<u8>> {
        let inode = self.inode_of(ino)?;
        if !inode.is_symlink() {
            return Err(Error::Invalid);
        }
        let mut buf = vec![0u8; inode.i_size as usize];
        self.read_ino_bytes(ino, 0, &mut buf)?;
        Ok(buf)
    }

    /// Resolves a path to the target stored in its final symlink.
    pub(crate) fn readlink_path(&mut self, path: &str) -> FsResult<Vec<u8>> {
        let ino = self.resolve_path(path, false)?;
        self.open_ictx(ino)?;
        let res = self.read_symlink_target(ino);
        self.release_ictx(ino, false);
        res
    }

    // ---- attributes ---------------------------------------------------

    pub(crate) fn getattr_path(&mut self, path: &str) -> FsResult<FileAttr> {
        let ino = self.resolve_path(path, true)?;
        self.open_ictx(ino)?;
        let inode = self.inode_of(ino)?;
        let attr = FileAttr {
            ino: ino.0,
            mode: inode.i_mode,
            is_dir: inode.is_directory(),
            is_symlink: inode.is_symlink(),
            nlink: inode.i_links_count,
            size: inode.i_size,
            uid: inode.i_uid,
            gid: inode.i_gid,
            atime: inode.i_atime,
            mtime: inode.i_mtime,
            ctime: inode.i_ctime,
        };
        self.release_ictx(ino, false);
        Ok(attr)
    }

    /// Existence (and rough permission) check.
    pub(crate) fn access_path(&mut self, path: &str, mode: u16) -> CanFail<Error> {
        let attr = self.getattr_path(path)?;
        if mode != 0 && attr.mode & mode == 0 {
            return Err(Error::Invalid);
        }
        Ok(())
    }

    pub(crate) fn chmod_path(&mut self, path: &str, mode: u16) -> CanFail<Error> {
        let ino = self.resolve_path(path, true)?;
        self.open_ictx(ino)?;
        let mut inode = self.inode_of(ino)?;
        inode.i_mode = (inode.i_mode & 0xF000) | (mode & 0x0FFF);
        inode.i_ctime = unix_now();
        self.update_inode(ino, inode)?;
        self.release_ictx(ino, true);
        Ok(())
    }

    /// Changes the mount's working directory.
    pub(crate) fn chdir_path(&mut self, path: &str) -> CanFail<Error> {
        let ino = self.resolve_path(path, true)?;
        self.open_ictx(ino)?;
        let is_dir = self.inode_of(ino)?.is_directory();
        self.release_ictx(ino, false);
        if !is_dir {
            return Err(Error::NotDirectory);
        }
        self.cwd_ino = ino;
        Ok(())
    }
}
