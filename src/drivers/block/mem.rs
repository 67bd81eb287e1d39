//! RAM region transport.
//!
//! Keeps the whole device in a single heap allocation. Async submissions
//! are satisfied at submit time and their completions deposited directly on
//! the ring, which keeps the submission/completion contract identical to
//! the real asynchronous transports.

use log::info;

use crate::drivers::block::queue::{CompletionRing, IoDirection, IoJob};
use crate::drivers::block::{check_range, BlockDevice, DeviceParams};
use crate::errors::{CanFail, Error, FsResult};
use crate::fs::layout::{BlkId, CLUSTER_SIZE};

pub struct MemDevice {
    ramdisk: Vec<u8>,
    total_clusters: u64,
    ring: CompletionRing,
}

impl MemDevice {
    pub fn new(params: DeviceParams) -> Self {
        let size = params.size_bytes & !((CLUSTER_SIZE as u64) - 1);
        MemDevice {
            ramdisk: Vec::new(),
            total_clusters: size / CLUSTER_SIZE as u64,
            ring: CompletionRing::new(params.qdepth),
        }
    }
}

impl BlockDevice for MemDevice {
    fn open(&mut self) -> CanFail<Error> {
        if self.total_clusters == 0 {
            return Err(Error::Invalid);
        }
        self.ramdisk = vec![0u8; (self.total_clusters as usize) * CLUSTER_SIZE];
        info!(
            target: "nvfuse-io",
            "ram disk init, {} clusters ({} MiB)",
            self.total_clusters,
            self.ramdisk.len() >> 20
        );
        Ok(())
    }

    fn close(&mut self) -> CanFail<Error> {
        self.ramdisk = Vec::new();
        Ok(())
    }

    fn read_clusters(&mut self, blk: BlkId, count: usize, buf: &mut [u8]) -> CanFail<Error> {
        check_range(blk, count, buf.len(), self.total_clusters)?;
        let bytes = count * CLUSTER_SIZE;
        let location = blk.byte_offset() as usize;
        buf[..bytes].copy_from_slice(&self.ramdisk[location..location + bytes]);
        Ok(())
    }

    fn write_clusters(&mut self, blk: BlkId, count: usize, buf: &[u8]) -> CanFail<Error> {
        check_range(blk, count, buf.len(), self.total_clusters)?;
        let bytes = count * CLUSTER_SIZE;
        let location = blk.byte_offset() as usize;
        self.ramdisk[location..location + bytes].copy_from_slice(&buf[..bytes]);
        Ok(())
    }

    fn total_clusters(&self) -> u64 {
        self.total_clusters
    }

    fn flush(&mut self) -> CanFail<Error> {
        Ok(())
    }

    fn submit(&mut self, jobs: Vec<IoJob>, rejected: &mut Vec<IoJob>) -> FsResult<usize> {
        let mut accepted = 0;
        for mut job in jobs {
            if self.ring.is_full() {
                rejected.push(job);
                continue;
            }
            let location = job.offset as usize;
            let end = location + job.bytes;
            if end > self.ramdisk.len() {
                job.result = Some(Err(libc::EINVAL));
            } else {
                match job.direction {
                    IoDirection::Read => {
                        job.buf.copy_from_slice(&self.ramdisk[location..end]);
                    }
                    IoDirection::Write => {
                        self.ramdisk[location..end].copy_from_slice(&job.buf);
                    }
                }
                job.result = Some(Ok(job.bytes));
            }
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
    use crate::drivers::block::queue::JobTag;

    fn device(clusters: u64) -> MemDevice {
        let mut dev = MemDevice::new(DeviceParams {
            size_bytes: clusters * CLUSTER_SIZE as u64,
            ..Default::default()
        });
        dev.open().unwrap();
        dev
    }

    #[test]
    fn sync_write_read_round_trip() {
        let mut dev = device(8);
        let data = vec![0xA5u8; CLUSTER_SIZE];
        dev.write_clusters(BlkId(3), 1, &data).unwrap();

        let mut back = vec![0u8; CLUSTER_SIZE];
        dev.read_clusters(BlkId(3), 1, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn out_of_range_transfer_is_invalid() {
        let mut dev = device(4);
        let data = vec![0u8; CLUSTER_SIZE];
        assert_eq!(
            dev.write_clusters(BlkId(4), 1, &data).unwrap_err(),
            Error::Invalid
        );
    }

    #[test]
    fn submitted_jobs_complete_in_order() {
        let mut dev = device(8);
        let jobs = (0..4)
            .map(|n| {
                IoJob::write(
                    BlkId(n),
                    vec![n as u8; CLUSTER_SIZE].into_boxed_slice(),
                    JobTag {
                        buf_id: n,
                        ..Default::default()
                    },
                )
            })
            .collect();
        let mut rejected = Vec::new();
        assert_eq!(dev.submit(jobs, &mut rejected).unwrap(), 4);
        assert!(rejected.is_empty());
        assert_eq!(dev.poll_complete().unwrap(), 4);
        for n in 0..4 {
            let job = dev.next_completion().unwrap();
            assert_eq!(job.tag.buf_id, n);
            assert!(job.succeeded());
        }

        let mut back = vec![0u8; CLUSTER_SIZE];
        dev.read_clusters(BlkId(2), 1, &mut back).unwrap();
        assert!(back.iter().all(|&b| b == 2));
    }
}
