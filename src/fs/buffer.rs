//! Buffer cache.
//!
//! Caches cluster-sized buffers keyed by `(inode, logical block)` for file
//! data and `(metadata class, physical block)` for metadata. Buffer heads
//! live in an arena and are addressed by integer handles; the hash table
//! and the replacement lists index into the arena rather than holding
//! pointers. Every head belongs to exactly one of the CLEAN, DIRTY, LOCKED
//! or FREE lists at any time.
//!
//! Interface:
//! * [`BufferCache::get`] returns a referenced, loaded buffer handle,
//!   reading from the backend on a miss.
//! * [`BufferCache::put`] drops the reference and optionally marks the
//!   buffer dirty. The dirty bit is sticky until a successful write-back.
//! * [`BufferCache::sync_buffers`] drives write-back through the backend's
//!   async submission path, preserving submission order.
//! * [`BufferCache::evict_clean`] reclaims the oldest clean buffers.

use hashbrown::HashMap;
use log::{error, warn};

use crate::drivers::block::queue::{IoJob, JobTag, AIO_RETRY_COUNT};
use crate::drivers::block::BlockDevice;
use crate::errors::{CanFail, Error, FsResult};
use crate::fs::layout::{BlkId, InodeNumber, LbnId, CLUSTER_SIZE};

/// Handle of a buffer head within the cache arena.
pub type BufId = u32;

const NIL: BufId = BufId::MAX;

/// Cache key. File data keys on `(inode, logical block)`; metadata keys on
/// one of the reserved metadata identities plus the physical block id, so
/// the physical translation of file data is never baked into the key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufKey {
    pub ino: InodeNumber,
    pub lbn: LbnId,
}

impl BufKey {
    /// Key for a metadata cluster cached under the reserved identity `ino`.
    pub fn meta(ino: InodeNumber, blk: BlkId) -> Self {
        BufKey {
            ino,
            lbn: LbnId(blk.0),
        }
    }

    /// Key for file data.
    pub fn data(ino: InodeNumber, lbn: LbnId) -> Self {
        BufKey { ino, lbn }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ListKind {
    Free,
    Clean,
    Dirty,
    Locked,
}

struct BufferHead {
    key: BufKey,

    /// Physical cluster backing this buffer, re-resolved on every load.
    pblk: BlkId,

    data: Box<[u8]>,

    /// Data has been loaded (or initialized) since the head was keyed.
    valid: bool,

    /// Sticky until a successful write-back completion.
    dirty: bool,

    ref_count: u32,

    /// Consecutive failed write-back attempts.
    retries: u32,

    list: ListKind,
    prev: BufId,
    next: BufId,
}

#[derive(Clone, Copy, Default)]
struct ListHead {
    head: Option<BufId>,
    tail: Option<BufId>,
    len: usize,
}

pub struct BufferCache {
    arena: Vec<BufferHead>,
    hash: HashMap<BufKey, BufId>,

    free: ListHead,
    clean: ListHead,
    dirty: ListHead,
    locked: ListHead,

    /// Maximum number of buffer heads the cache will materialize.
    pool_size: usize,
}

impl BufferCache {
    pub fn new(pool_clusters: usize) -> Self {
        BufferCache {
            arena: Vec::new(),
            hash: HashMap::new(),
            free: ListHead::default(),
            clean: ListHead::default(),
            dirty: ListHead::default(),
            locked: ListHead::default(),
            pool_size: pool_clusters.max(8),
        }
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len + self.count_locked_dirty()
    }

    fn count_locked_dirty(&self) -> usize {
        let mut n = 0;
        let mut cur = self.locked.head;
        while let Some(id) = cur {
            if self.arena[id as usize].dirty {
                n += 1;
            }
            cur = opt(self.arena[id as usize].next);
        }
        n
    }

    /// Whether the dirty fraction of the pool breached the write-back
    /// watermark.
    pub fn over_watermark(&self) -> bool {
        self.dirty.len * 2 >= self.pool_size
    }

    // ---- intrusive list plumbing -------------------------------------

    fn list_mut(&mut self, kind: ListKind) -> &mut ListHead {
        match kind {
            ListKind::Free => &mut self.free,
            ListKind::Clean => &mut self.clean,
            ListKind::Dirty => &mut self.dirty,
            ListKind::Locked => &mut self.locked,
        }
    }

    fn detach(&mut self, id: BufId) {
        let (kind, prev, next) = {
            let bh = &self.arena[id as usize];
            (bh.list, bh.prev, bh.next)
        };
        if prev != NIL {
            self.arena[prev as usize].next = next;
        }
        if next != NIL {
            self.arena[next as usize].prev = prev;
        }
        let list = self.list_mut(kind);
        if list.head == Some(id) {
            list.head = opt(next);
        }
        if list.tail == Some(id) {
            list.tail = opt(prev);
        }
        list.len -= 1;
        let bh = &mut self.arena[id as usize];
        bh.prev = NIL;
        bh.next = NIL;
    }

    fn push_tail(&mut self, kind: ListKind, id: BufId) {
        let old_tail = self.list_mut(kind).tail;
        {
            let bh = &mut self.arena[id as usize];
            bh.list = kind;
            bh.prev = old_tail.unwrap_or(NIL);
            bh.next = NIL;
        }
        if let Some(t) = old_tail {
            self.arena[t as usize].next = id;
        }
        let list = self.list_mut(kind);
        if list.head.is_none() {
            list.head = Some(id);
        }
        list.tail = Some(id);
        list.len += 1;
    }

    // ---- buffer acquisition ------------------------------------------

    /// Returns a referenced handle for `key`, loading the cluster at
    /// `pblk` from the backend on a miss. A null `pblk` yields a zeroed
    /// buffer (sparse read, fresh allocation).
    pub fn get(
        &mut self,
        dev: &mut dyn BlockDevice,
        key: BufKey,
        pblk: BlkId,
    ) -> FsResult<BufId> {
        if let Some(&id) = self.hash.get(&key) {
            let (list, dirty) = {
                let bh = &mut self.arena[id as usize];
                bh.ref_count += 1;
                bh.pblk = pblk;
                (bh.list, bh.dirty)
            };
            // dirty buffers keep their dirty-list position while referenced
            // so write-back order stays keyed on first insertion
            if list != ListKind::Locked && !dirty {
                self.detach(id);
                self.push_tail(ListKind::Locked, id);
            }
            return Ok(id);
        }

        let id = self.grab_head(dev)?;
        {
            let bh = &mut self.arena[id as usize];
            bh.key = key;
            bh.pblk = pblk;
            bh.ref_count = 1;
            bh.dirty = false;
            bh.retries = 0;
            bh.valid = false;
        }
        self.hash.insert(key, id);
        self.push_tail(ListKind::Locked, id);

        if pblk.is_null() {
            self.arena[id as usize].data.fill(0);
        } else if let Err(e) = dev.read_clusters(pblk, 1, &mut self.arena[id as usize].data) {
            // an unreadable block must not linger in the cache as clean
            self.hash.remove(&key);
            self.detach(id);
            self.push_tail(ListKind::Free, id);
            return Err(e);
        }
        self.arena[id as usize].valid = true;
        Ok(id)
    }

    /// Returns a referenced handle whose contents are zeroed without
    /// touching the backend.
    pub fn get_zeroed(
        &mut self,
        dev: &mut dyn BlockDevice,
        key: BufKey,
        pblk: BlkId,
    ) -> FsResult<BufId> {
        let id = self.get(dev, key, BlkId::NULL)?;
        self.arena[id as usize].pblk = pblk;
        self.arena[id as usize].data.fill(0);
        Ok(id)
    }

    /// Materializes or reclaims a buffer head.
    fn grab_head(&mut self, dev: &mut dyn BlockDevice) -> FsResult<BufId> {
        if let Some(id) = self.free.head {
            self.detach(id);
            return Ok(id);
        }

        if self.arena.len() < self.pool_size {
            let id = self.arena.len() as BufId;
            self.arena.push(BufferHead {
                key: BufKey::data(InodeNumber::NULL, LbnId(0)),
                pblk: BlkId::NULL,
                data: vec![0u8; CLUSTER_SIZE].into_boxed_slice(),
                valid: false,
                dirty: false,
                ref_count: 0,
                retries: 0,
                list: ListKind::Free,
                prev: NIL,
                next: NIL,
            });
            // not threaded on any list yet; the caller files it
            return Ok(id);
        }

        // reclaim the oldest clean entry
        if let Some(id) = self.clean.head {
            self.hash.remove(&self.arena[id as usize].key);
            self.detach(id);
            return Ok(id);
        }

        // nothing clean: synchronously write back the oldest unreferenced
        // dirty entry
        let mut cur = self.dirty.head;
        while let Some(id) = cur {
            cur = opt(self.arena[id as usize].next);
            if self.arena[id as usize].ref_count > 0 {
                continue;
            }
            let pblk = self.arena[id as usize].pblk;
            if pblk.is_null() {
                return Err(Error::Corrupt);
            }
            dev.write_clusters(pblk, 1, &self.arena[id as usize].data)?;
            self.arena[id as usize].dirty = false;
            self.hash.remove(&self.arena[id as usize].key);
            self.detach(id);
            return Ok(id);
        }

        warn!(target: "nvfuse-cache", "buffer pool exhausted, all heads referenced");
        Err(Error::Busy)
    }

    // ---- release and dirty tracking ----------------------------------

    /// Drops a reference. `dirty` moves the buffer onto the dirty list (at
    /// the tail, preserving insertion order for write-back). Returns
    /// whether this call turned a clean buffer dirty, so callers can keep
    /// their per-inode dirty lists in step.
    pub fn put(&mut self, id: BufId, dirty: bool) -> bool {
        let bh = &mut self.arena[id as usize];
        debug_assert!(bh.ref_count > 0, "buffer released more times than taken");
        bh.ref_count = bh.ref_count.saturating_sub(1);

        let was_dirty = bh.dirty;
        if dirty {
            bh.dirty = true;
        }
        let now_dirty = bh.dirty;
        let refs = bh.ref_count;

        match (refs, now_dirty, was_dirty) {
            (0, true, true) => {
                // already on the dirty list in its original position
                if self.arena[id as usize].list != ListKind::Dirty {
                    self.detach(id);
                    self.push_tail(ListKind::Dirty, id);
                }
            }
            (0, true, false) => {
                self.detach(id);
                self.push_tail(ListKind::Dirty, id);
            }
            (0, false, _) => {
                self.detach(id);
                self.push_tail(ListKind::Clean, id);
            }
            _ => {
                // still referenced: dirty membership is settled on the
                // final release
            }
        }

        now_dirty && !was_dirty
    }

    /// Drops a cached buffer outright (its backing block was freed). The
    /// dirty bit is cleared without write-back; referenced buffers are
    /// left alone.
    pub fn discard(&mut self, key: BufKey) {
        let Some(&id) = self.hash.get(&key) else {
            return;
        };
        if self.arena[id as usize].ref_count > 0 {
            return;
        }
        self.hash.remove(&key);
        self.arena[id as usize].dirty = false;
        self.arena[id as usize].valid = false;
        self.detach(id);
        self.push_tail(ListKind::Free, id);
    }

    /// Read access to a referenced buffer's contents.
    pub fn data(&self, id: BufId) -> &[u8] {
        let bh = &self.arena[id as usize];
        debug_assert!(bh.valid, "access to an unloaded buffer");
        &bh.data
    }

    /// Write access to a referenced buffer's contents.
    pub fn data_mut(&mut self, id: BufId) -> &mut [u8] {
        let bh = &mut self.arena[id as usize];
        debug_assert!(bh.valid, "access to an unloaded buffer");
        &mut bh.data
    }

    /// Physical block a buffer is currently bound to.
    pub fn pblk(&self, id: BufId) -> BlkId {
        self.arena[id as usize].pblk
    }

    /// Rebinds the physical block of a referenced buffer (allocation of a
    /// previously sparse cluster).
    pub fn set_pblk(&mut self, id: BufId, pblk: BlkId) {
        self.arena[id as usize].pblk = pblk;
    }

    pub fn is_dirty(&self, id: BufId) -> bool {
        self.arena[id as usize].dirty
    }

    pub fn key(&self, id: BufId) -> BufKey {
        self.arena[id as usize].key
    }

    /// Handles of every dirty buffer in insertion order.
    pub fn dirty_buffers(&self) -> Vec<BufId> {
        let mut out = Vec::with_capacity(self.dirty.len);
        let mut cur = self.dirty.head;
        while let Some(id) = cur {
            out.push(id);
            cur = opt(self.arena[id as usize].next);
        }
        out
    }

    // ---- write-back ---------------------------------------------------

    /// Writes the given buffers back through the backend's async
    /// submission path, in the order given. Buffers whose write completes
    /// move to the clean LRU; a buffer that keeps failing past the retry
    /// budget leaves the filesystem errored.
    pub fn sync_buffers(
        &mut self,
        dev: &mut dyn BlockDevice,
        ids: &[BufId],
    ) -> CanFail<Error> {
        let mut batch: Vec<IoJob> = Vec::new();
        for &id in ids {
            let bh = &self.arena[id as usize];
            if !bh.dirty {
                continue;
            }
            if bh.pblk.is_null() {
                error!(target: "nvfuse-cache", "dirty buffer without a physical block");
                return Err(Error::Corrupt);
            }
            batch.push(IoJob::write(
                bh.pblk,
                bh.data.clone(),
                JobTag {
                    ino: bh.key.ino,
                    lbn: bh.key.lbn,
                    buf_id: id,
                },
            ));
        }

        let mut stalled_rounds = 0;
        while !batch.is_empty() {
            let mut rejected = Vec::new();
            let submitted = dev.submit(batch, &mut rejected)?;
            batch = rejected;

            if submitted == 0 {
                stalled_rounds += 1;
                if stalled_rounds >= AIO_RETRY_COUNT {
                    error!(target: "nvfuse-cache", "backend refuses submissions, giving up");
                    return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EAGAIN)));
                }
            } else {
                stalled_rounds = 0;
            }

            let mut outstanding = submitted;
            let mut expirations = 0;
            while outstanding > 0 {
                if dev.poll_complete()? == 0 {
                    if dev.pending() == 0 {
                        // completions lost without a terminal state
                        return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EIO)));
                    }
                    expirations += 1;
                    if expirations >= AIO_RETRY_COUNT {
                        error!(target: "nvfuse-cache", "aio completion timer expired repeatedly");
                        // best effort: ask the backend to cancel whatever
                        // is stuck; the jobs stay unfinished either way
                        for &id in ids {
                            let bh = &self.arena[id as usize];
                            if bh.dirty {
                                let _ = dev.cancel(JobTag {
                                    ino: bh.key.ino,
                                    lbn: bh.key.lbn,
                                    buf_id: id,
                                });
                            }
                        }
                        return Err(Error::Io(std::io::Error::from_raw_os_error(
                            libc::ETIMEDOUT,
                        )));
                    }
                    warn!(target: "nvfuse-cache", "aio completion timer expired, retrying");
                    continue;
                }
                expirations = 0;
                while let Some(job) = dev.next_completion() {
                    outstanding -= 1;
                    let id = job.tag.buf_id;
                    if job.succeeded() {
                        self.mark_written(id);
                    } else {
                        let bh = &mut self.arena[id as usize];
                        bh.retries += 1;
                        if bh.retries >= AIO_RETRY_COUNT {
                            error!(
                                target: "nvfuse-cache",
                                "write-back of block {} failed {} times",
                                bh.pblk, bh.retries
                            );
                            return Err(Error::Io(std::io::Error::from_raw_os_error(
                                job.result.and_then(|r| r.err()).unwrap_or(libc::EIO),
                            )));
                        }
                        let mut retry_job = job;
                        retry_job.result = None;
                        retry_job.retries += 1;
                        batch.push(retry_job);
                    }
                }
            }
        }

        Ok(())
    }

    /// Clears the dirty bit after an observed write completion and files
    /// the buffer on the appropriate list.
    fn mark_written(&mut self, id: BufId) {
        let bh = &mut self.arena[id as usize];
        bh.dirty = false;
        bh.retries = 0;
        if bh.ref_count == 0 && bh.list == ListKind::Dirty {
            self.detach(id);
            self.push_tail(ListKind::Clean, id);
        }
    }

    /// Reclaims up to `n` of the oldest clean buffers, dropping them from
    /// the hash. Dirty and referenced buffers are never touched.
    pub fn evict_clean(&mut self, n: usize) -> usize {
        let mut evicted = 0;
        while evicted < n {
            let Some(id) = self.clean.head else { break };
            self.hash.remove(&self.arena[id as usize].key);
            self.detach(id);
            self.push_tail(ListKind::Free, id);
            evicted += 1;
        }
        evicted
    }

    /// Drops every clean cached buffer (unmount teardown).
    pub fn drop_clean(&mut self) {
        self.evict_clean(usize::MAX);
    }
}

fn opt(id: BufId) -> Option<BufId> {
    (id != NIL).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::block::mem::MemDevice;
    use crate::drivers::block::{BlockDevice, DeviceParams};

    fn device(clusters: u64) -> MemDevice {
        let mut dev = MemDevice::new(DeviceParams {
            size_bytes: clusters * CLUSTER_SIZE as u64,
            ..Default::default()
        });
        dev.open().unwrap();
        dev
    }

    #[test]
    fn miss_loads_from_backend_and_hit_joins() {
        let mut dev = device(16);
        let payload = vec![0x42u8; CLUSTER_SIZE];
        dev.write_clusters(BlkId(7), 1, &payload).unwrap();

        let mut cache = BufferCache::new(32);
        let key = BufKey::meta(InodeNumber::BLOCK_IO, BlkId(7));
        let id = cache.get(&mut dev, key, BlkId(7)).unwrap();
        assert_eq!(cache.data(id)[0], 0x42);
        cache.put(id, false);

        // second lookup hits the same head
        let id2 = cache.get(&mut dev, key, BlkId(7)).unwrap();
        assert_eq!(id, id2);
        cache.put(id2, false);
    }

    #[test]
    fn dirty_buffers_write_back_in_insertion_order() {
        let mut dev = device(16);
        let mut cache = BufferCache::new(32);

        for blk in [3u32, 5, 1] {
            let key = BufKey::meta(InodeNumber::BLOCK_IO, BlkId(blk));
            let id = cache.get(&mut dev, key, BlkId(blk)).unwrap();
            cache.data_mut(id).fill(blk as u8);
            cache.put(id, true);
        }

        let order: Vec<u32> = cache
            .dirty_buffers()
            .iter()
            .map(|&id| cache.pblk(id).0)
            .collect();
        assert_eq!(order, vec![3, 5, 1]);

        let ids = cache.dirty_buffers();
        cache.sync_buffers(&mut dev, &ids).unwrap();
        assert_eq!(cache.dirty_count(), 0);

        let mut back = vec![0u8; CLUSTER_SIZE];
        dev.read_clusters(BlkId(5), 1, &mut back).unwrap();
        assert!(back.iter().all(|&b| b == 5));
    }

    #[test]
    fn eviction_spares_dirty_buffers() {
        let mut dev = device(64);
        let mut cache = BufferCache::new(8);

        let dirty_key = BufKey::meta(InodeNumber::BLOCK_IO, BlkId(0));
        let id = cache.get(&mut dev, dirty_key, BlkId(0)).unwrap();
        cache.data_mut(id).fill(0xEE);
        cache.put(id, true);

        // cycle enough clean buffers through the pool to force reclaim
        for blk in 1..20u32 {
            let key = BufKey::meta(InodeNumber::BLOCK_IO, BlkId(blk));
            let id = cache.get(&mut dev, key, BlkId(blk)).unwrap();
            cache.put(id, false);
        }

        // the dirty buffer is still cached and still dirty
        let id = cache.get(&mut dev, dirty_key, BlkId(0)).unwrap();
        assert!(cache.is_dirty(id));
        assert_eq!(cache.data(id)[0], 0xEE);
        cache.put(id, true);
    }

    #[test]
    fn pool_exhaustion_falls_back_to_sync_writeback() {
        let mut dev = device(64);
        let mut cache = BufferCache::new(8);

        // dirty the whole pool
        for blk in 0..8u32 {
            let key = BufKey::meta(InodeNumber::BLOCK_IO, BlkId(blk));
            let id = cache.get(&mut dev, key, BlkId(blk)).unwrap();
            cache.data_mut(id).fill(blk as u8 + 1);
            cache.put(id, true);
        }

        // the next miss must reclaim the oldest dirty buffer by writing it
        let key = BufKey::meta(InodeNumber::BLOCK_IO, BlkId(40));
        let id = cache.get(&mut dev, key, BlkId(40)).unwrap();
        cache.put(id, false);

        let mut back = vec![0u8; CLUSTER_SIZE];
        dev.read_clusters(BlkId(0), 1, &mut back).unwrap();
        assert!(back.iter().all(|&b| b == 1));
    }
}
