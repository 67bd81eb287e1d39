//! NVFUSE — a userspace filesystem engine built directly on a block
//! device.
//!
//! The crate provides POSIX-style file and directory semantics above an
//! on-disk layout organized into block groups: indirect-addressed file
//! data, a B+tree directory index, a buffered write-back cache and an
//! asynchronous submission/completion path against a pluggable block
//! transport (RAM region, backing file, or kernel AIO).
//!
//! ```no_run
//! use nvfuse::drivers::block::{DeviceKind, DeviceParams};
//! use nvfuse::fs::{MountParams, Nvfuse, OpenFlags};
//!
//! let nvh = Nvfuse::create_handle(
//!     DeviceKind::File,
//!     DeviceParams {
//!         path: "/tmp/disk.img".into(),
//!         size_bytes: 1 << 30,
//!         ..Default::default()
//!     },
//!     MountParams::default(),
//! )?;
//! nvh.format()?;
//! nvh.mount()?;
//!
//! let fd = nvh.openfile_path("/hello", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)?;
//! nvh.writefile(fd, b"hello, world")?;
//! nvh.closefile(fd)?;
//! nvh.umount()?;
//! # Ok::<(), nvfuse::errors::Error>(())
//! ```

pub mod drivers;
pub mod errors;
pub mod fs;

pub use errors::{Error, FsResult};
pub use fs::{MountParams, Nvfuse, OpenFlags, StatVfs, Whence};
