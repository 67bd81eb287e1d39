//! Backing-file transport.
//!
//! Drives a regular file through positioned reads and writes. A missing
//! backing file is created and zero-extended to the requested capacity on
//! first open. As with the RAM transport, async submissions complete at
//! submit time.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;

use log::info;

use crate::drivers::block::queue::{CompletionRing, IoDirection, IoJob};
use crate::drivers::block::{check_range, BlockDevice, DeviceParams};
use crate::errors::{CanFail, Error, FsResult};
use crate::fs::layout::{BlkId, CLUSTER_SIZE};

pub struct FileDevice {
    path: String,
    size_bytes: u64,
    fp: Option<File>,
    total_clusters: u64,
    ring: CompletionRing,
}

impl FileDevice {
    pub fn new(params: DeviceParams) -> Self {
        FileDevice {
            path: params.path,
            size_bytes: params.size_bytes,
            fp: None,
            total_clusters: 0,
            ring: CompletionRing::new(params.qdepth),
        }
    }

    fn file(&self) -> FsResult<&File> {
        self.fp.as_ref().ok_or(Error::Invalid)
    }
}

impl BlockDevice for FileDevice {
    fn open(&mut self) -> CanFail<Error> {
        let fp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;

        let mut len = fp.metadata()?.len();
        if len < self.size_bytes {
            // zero-extend a fresh (or shrunken) backing file up front
            fp.set_len(self.size_bytes)?;
            len = self.size_bytes;
        }

        self.total_clusters = len / CLUSTER_SIZE as u64;
        self.fp = Some(fp);
        info!(
            target: "nvfuse-io",
            "file disk init, path = {}, {} clusters",
            self.path, self.total_clusters
        );
        Ok(())
    }

    fn close(&mut self) -> CanFail<Error> {
        if let Some(fp) = self.fp.take() {
            fp.sync_all()?;
        }
        Ok(())
    }

    fn read_clusters(&mut self, blk: BlkId, count: usize, buf: &mut [u8]) -> CanFail<Error> {
        check_range(blk, count, buf.len(), self.total_clusters)?;
        let bytes = count * CLUSTER_SIZE;
        self.file()?
            .read_exact_at(&mut buf[..bytes], blk.byte_offset())?;
        Ok(())
    }

    fn write_clusters(&mut self, blk: BlkId, count: usize, buf: &[u8]) -> CanFail<Error> {
        check_range(blk, count, buf.len(), self.total_clusters)?;
        let bytes = count * CLUSTER_SIZE;
        self.file()?.write_all_at(&buf[..bytes], blk.byte_offset())?;
        Ok(())
    }

    fn total_clusters(&self) -> u64 {
        self.total_clusters
    }

    fn flush(&mut self) -> CanFail<Error> {
        self.file()?.sync_all()?;
        Ok(())
    }

    fn submit(&mut self, jobs: Vec<IoJob>, rejected: &mut Vec<IoJob>) -> FsResult<usize> {
        let mut accepted = 0;
        for mut job in jobs {
            if self.ring.is_full() {
                rejected.push(job);
                continue;
            }
            let res = match job.direction {
                IoDirection::Read => self.file()?.read_exact_at(&mut job.buf, job.offset),
                IoDirection::Write => self.file()?.write_all_at(&job.buf, job.offset),
            };
            job.result = Some(match res {
                Ok(()) => Ok(job.bytes),
                Err(e) => Err(e.raw_os_error().unwrap_or(libc::EIO)),
            });
            self.ring
                .push(job)
                .expect("completion ring overflow on sync transport");
            accepted += 1;
        }
        Ok(accepted)
    }

    fn poll_complete(&mut self) -> FsResult<usize> {
        Ok(self.ring.len())
    }

    fn next_completion(&mut self) -> Option<IoJob> {
        self.ring.pop()
    }

    fn pending(&self) -> usize {
        self.ring.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_and_round_trips_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut dev = FileDevice::new(DeviceParams {
            path: path.to_str().unwrap().into(),
            size_bytes: 64 * CLUSTER_SIZE as u64,
            ..Default::default()
        });
        dev.open().unwrap();
        assert_eq!(dev.total_clusters(), 64);

        let data = vec![0x5Au8; CLUSTER_SIZE];
        dev.write_clusters(BlkId(17), 1, &data).unwrap();
        let mut back = vec![0u8; CLUSTER_SIZE];
        dev.read_clusters(BlkId(17), 1, &mut back).unwrap();
        assert_eq!(back, data);
        dev.close().unwrap();

        // contents survive a reopen
        let mut dev = FileDevice::new(DeviceParams {
            path: path.to_str().unwrap().into(),
            size_bytes: 0,
            ..Default::default()
        });
        dev.open().unwrap();
        let mut back = vec![0u8; CLUSTER_SIZE];
        dev.read_clusters(BlkId(17), 1, &mut back).unwrap();
        assert_eq!(back, data);
    }
}
