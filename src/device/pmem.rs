//! Physical-memory device control.
//!
//! The pmem device exposes one physically contiguous pool. The allocator
//! opens a master descriptor once per process, queries the pool size, and
//! maps the whole pool. Each buffer then gets its own descriptor,
//! connected to the master and restricted to its sub-range, so a client
//! process receiving the handle can map exactly that sub-range and no
//! other.

use crate::error::{Error, Result};
use rustix::fd::{AsRawFd, BorrowedFd, OwnedFd};
use rustix::fs::{Mode, OFlags};
use std::path::{Path, PathBuf};

/// Pool size assumed when the size query fails (limp mode).
pub const DEFAULT_PMEM_SIZE: usize = 8 << 20;

/// Control operations on the physical-memory device.
///
/// One master descriptor per process plus one descriptor per buffer; all
/// sub-range bookkeeping happens in the driver.
pub trait PmemDevice: Send + Sync {
    /// Open the master descriptor for the pool.
    fn open_master(&self) -> Result<OwnedFd>;

    /// Query the total pool size through the master descriptor.
    fn total_size(&self, master: BorrowedFd<'_>) -> Result<usize>;

    /// Open a fresh per-buffer descriptor.
    fn open_buffer(&self) -> Result<OwnedFd>;

    /// Associate a per-buffer descriptor with the master pool.
    fn connect(&self, buffer: BorrowedFd<'_>, master: BorrowedFd<'_>) -> Result<()>;

    /// Restrict a connected descriptor to one sub-range of the pool.
    fn map_subrange(&self, buffer: BorrowedFd<'_>, offset: usize, len: usize) -> Result<()>;

    /// Release a descriptor's sub-range mapping.
    ///
    /// Failure here matters: the free path must not recycle the region
    /// while another process may still have it mapped.
    fn unmap_subrange(&self, buffer: BorrowedFd<'_>, offset: usize, len: usize) -> Result<()>;
}

// Request codes for the pmem driver. The driver takes a two-word
// {offset, len} region record by pointer, except for connect, which
// passes the master descriptor by value.

/// `_IOW('p', 7, struct pmem_region)`
const PMEM_GET_TOTAL_SIZE: libc::c_ulong = 0x4010_7007;
/// `_IOW('p', 6, unsigned int)`
const PMEM_CONNECT: libc::c_ulong = 0x4004_7006;
/// `_IOW('p', 2, struct pmem_region)`
const PMEM_MAP: libc::c_ulong = 0x4010_7002;
/// `_IOW('p', 4, struct pmem_region)`
const PMEM_UNMAP: libc::c_ulong = 0x4010_7004;

/// Region record passed to the pmem map/unmap/size controls.
#[repr(C)]
struct PmemRegion {
    offset: libc::c_ulong,
    len: libc::c_ulong,
}

/// [`PmemDevice`] backed by a real pmem device node.
#[derive(Debug, Clone)]
pub struct LinuxPmemDevice {
    path: PathBuf,
}

impl LinuxPmemDevice {
    /// Use the device node at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The device node this instance opens.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<OwnedFd> {
        rustix::fs::open(&self.path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())
            .map_err(Error::DeviceUnavailable)
    }
}

impl Default for LinuxPmemDevice {
    fn default() -> Self {
        Self::new("/dev/pmem")
    }
}

impl PmemDevice for LinuxPmemDevice {
    fn open_master(&self) -> Result<OwnedFd> {
        self.open()
    }

    fn total_size(&self, master: BorrowedFd<'_>) -> Result<usize> {
        let mut region = PmemRegion { offset: 0, len: 0 };
        // SAFETY: PMEM_GET_TOTAL_SIZE fills in the region record; the fd
        // is a valid pmem master descriptor and the record outlives the
        // call.
        let ret = unsafe { libc::ioctl(master.as_raw_fd(), PMEM_GET_TOTAL_SIZE, &mut region) };
        if ret < 0 {
            return Err(last_errno().into());
        }
        Ok(region.len as usize)
    }

    fn open_buffer(&self) -> Result<OwnedFd> {
        self.open()
    }

    fn connect(&self, buffer: BorrowedFd<'_>, master: BorrowedFd<'_>) -> Result<()> {
        // SAFETY: PMEM_CONNECT takes the master descriptor by value; both
        // descriptors are valid for the duration of the call.
        let ret = unsafe {
            libc::ioctl(
                buffer.as_raw_fd(),
                PMEM_CONNECT,
                master.as_raw_fd() as libc::c_ulong,
            )
        };
        if ret < 0 {
            return Err(last_errno().into());
        }
        Ok(())
    }

    fn map_subrange(&self, buffer: BorrowedFd<'_>, offset: usize, len: usize) -> Result<()> {
        let region = PmemRegion {
            offset: offset as libc::c_ulong,
            len: len as libc::c_ulong,
        };
        // SAFETY: PMEM_MAP reads the region record; the fd is a connected
        // pmem descriptor.
        let ret = unsafe { libc::ioctl(buffer.as_raw_fd(), PMEM_MAP, &region) };
        if ret < 0 {
            return Err(last_errno().into());
        }
        Ok(())
    }

    fn unmap_subrange(&self, buffer: BorrowedFd<'_>, offset: usize, len: usize) -> Result<()> {
        let region = PmemRegion {
            offset: offset as libc::c_ulong,
            len: len as libc::c_ulong,
        };
        // SAFETY: PMEM_UNMAP reads the region record; the fd is a
        // connected pmem descriptor.
        let ret = unsafe { libc::ioctl(buffer.as_raw_fd(), PMEM_UNMAP, &region) };
        if ret < 0 {
            return Err(last_errno().into());
        }
        Ok(())
    }
}

pub(crate) fn last_errno() -> rustix::io::Errno {
    rustix::io::Errno::from_raw_os_error(
        std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO),
    )
}
