//! Standard API to interact with block backends, regardless of their
//! physical specificities (RAM region, backing file, kernel AIO).
//!
//! The `BlockDevice` trait specifies the synchronous cluster transfer
//! methods and the asynchronous submission/completion set every transport
//! must provide. Transports are selected at mount time through
//! [`DeviceKind`]; the user-space NVMe driver is an external collaborator
//! and only its discriminant is reserved here.

use crate::errors::{CanFail, Error, FsResult};
use crate::fs::layout::{BlkId, CLUSTER_SIZE};

pub mod aio;
pub mod file;
pub mod mem;
pub mod queue;

use queue::{IoJob, JobTag, AIO_MAX_QDEPTH};

/// Available block transport types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    /// RAM region.
    Mem,

    /// Backing file driven through synchronous positioned I/O.
    File,

    /// Kernel block device (or file) driven through kernel AIO.
    Aio,

    /// User-space NVMe driver (external; selecting it fails with
    /// [`Error::Unsupported`]).
    Nvme,
}

/// Transport construction parameters.
#[derive(Clone, Debug)]
pub struct DeviceParams {
    /// Path of the backing file or block device. Ignored by [`DeviceKind::Mem`].
    pub path: String,

    /// Capacity in bytes for transports that create their own backing store
    /// (RAM region, fresh backing file).
    pub size_bytes: u64,

    /// Queue depth of the async submission path and completion ring.
    pub qdepth: usize,
}

impl Default for DeviceParams {
    fn default() -> Self {
        DeviceParams {
            path: String::new(),
            size_bytes: 0,
            qdepth: AIO_MAX_QDEPTH,
        }
    }
}

/// A trait to represent a cluster-addressed block backend.
///
/// All offsets are cluster ids; transfers are multiples of the cluster
/// size. A successfully completed write is visible to subsequent reads of
/// the same cluster issued after the completion is observed; durability
/// across crashes additionally requires [`BlockDevice::flush`].
pub trait BlockDevice {
    /// Opens the backing store and initializes the per-device async
    /// context.
    fn open(&mut self) -> CanFail<Error>;

    /// Releases the backing store. In-flight jobs are abandoned.
    fn close(&mut self) -> CanFail<Error>;

    /// Reads `count` clusters starting at `blk` into `buf`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Invalid`] if `buf` is shorter than the transfer
    /// or the range exceeds the device, and [`Error::Io`] on a backend
    /// failure.
    fn read_clusters(&mut self, blk: BlkId, count: usize, buf: &mut [u8]) -> CanFail<Error>;

    /// Writes `count` clusters starting at `blk` from `buf`.
    fn write_clusters(&mut self, blk: BlkId, count: usize, buf: &[u8]) -> CanFail<Error>;

    /// Total device capacity, in clusters.
    fn total_clusters(&self) -> u64;

    /// Transfer granularity in bytes. Currently fixed crate-wide.
    fn cluster_size(&self) -> usize {
        CLUSTER_SIZE
    }

    /// Forces device-level durability of previously completed writes.
    fn flush(&mut self) -> CanFail<Error>;

    /// Enqueues up to `jobs.len()` prepared jobs; returns how many were
    /// accepted. Jobs beyond the queue depth are handed back untouched in
    /// `rejected`.
    fn submit(&mut self, jobs: Vec<IoJob>, rejected: &mut Vec<IoJob>) -> FsResult<usize>;

    /// Blocks until at least one in-flight job reaches a terminal state or
    /// the bounded timeout elapses, depositing completions on the ring.
    /// Returns the number of newly completed jobs (0 on timeout).
    fn poll_complete(&mut self) -> FsResult<usize>;

    /// Takes the oldest observed completion off the ring.
    fn next_completion(&mut self) -> Option<IoJob>;

    /// Number of submitted jobs without an observed terminal completion.
    fn pending(&self) -> usize;

    /// Best-effort cancellation of an in-flight job. The caller must still
    /// await a terminal completion for it.
    fn cancel(&mut self, tag: JobTag) -> CanFail<Error> {
        let _ = tag;
        Err(Error::Unsupported)
    }
}

/// Builds the transport selected by `kind`.
///
/// # Errors
///
/// Fails with [`Error::Unsupported`] for [`DeviceKind::Nvme`], which is
/// provided by an external driver process.
pub fn create_device(kind: DeviceKind, params: DeviceParams) -> FsResult<Box<dyn BlockDevice>> {
    match kind {
        DeviceKind::Mem => Ok(Box::new(mem::MemDevice::new(params))),
        DeviceKind::File => Ok(Box::new(file::FileDevice::new(params))),
        DeviceKind::Aio => Ok(Box::new(aio::AioDevice::new(params))),
        DeviceKind::Nvme => Err(Error::Unsupported),
    }
}

/// Bounds check shared by the transports.
pub(crate) fn check_range(
    blk: BlkId,
    count: usize,
    buf_len: usize,
    total_clusters: u64,
) -> CanFail<Error> {
    let bytes = count * CLUSTER_SIZE;
    if buf_len < bytes {
        return Err(Error::Invalid);
    }
    if u64::from(blk.0) + count as u64 > total_clusters {
        return Err(Error::Invalid);
    }
    Ok(())
}
