//! Hardware-3D device control.
//!
//! The 3D device exposes a fixed set of named memory regions. The
//! allocator maps a reserved window of the EBI region once per process
//! and sub-allocates GPU buffers inside it by offset; no per-buffer
//! descriptor or connect step exists on this path. A placeholder
//! descriptor is opened per buffer purely so the handle's marshalling
//! contract (one descriptor slot) holds.

use crate::error::{Error, Result};
use rustix::fd::{AsRawFd, BorrowedFd, OwnedFd};
use rustix::fs::{Mode, OFlags};
use std::path::{Path, PathBuf};

use super::pmem::last_errno;

/// Size of the GPU-reserved window carved out of the EBI region.
///
/// Must match the platform's reserved carve-out; the rest of the EBI
/// region belongs to the driver.
pub const GPU_RESERVED_SIZE: usize = 1200 << 10;

/// The named memory regions the 3D device reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hw3dRegionKind {
    /// Stacked memory interface.
    Smi,
    /// External bus interface, host of the GPU-reserved arena.
    Ebi,
    /// Register window.
    Regs,
}

/// One named region as reported by the device.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Hw3dRegion {
    /// Physical address of the region.
    pub phys: libc::c_ulong,
    /// Offset to pass to `mmap` on the device descriptor.
    pub map_offset: libc::c_ulong,
    /// Region length in bytes.
    pub len: libc::c_ulong,
}

/// The full set of named regions.
#[derive(Clone, Copy, Debug, Default)]
pub struct Hw3dRegions {
    regions: [Hw3dRegion; 3],
}

impl Hw3dRegions {
    /// Create from the device's region array, ordered SMI, EBI, REGS.
    pub fn new(regions: [Hw3dRegion; 3]) -> Self {
        Self { regions }
    }

    /// Look up one named region.
    #[inline]
    pub fn get(&self, kind: Hw3dRegionKind) -> Hw3dRegion {
        match kind {
            Hw3dRegionKind::Smi => self.regions[0],
            Hw3dRegionKind::Ebi => self.regions[1],
            Hw3dRegionKind::Regs => self.regions[2],
        }
    }
}

/// Control operations on the hardware-3D device.
pub trait Hw3dDevice: Send + Sync {
    /// Open the device descriptor.
    fn open(&self) -> Result<OwnedFd>;

    /// Query the named memory regions.
    fn regions(&self, fd: BorrowedFd<'_>) -> Result<Hw3dRegions>;

    /// Open a placeholder descriptor for a GPU buffer handle.
    ///
    /// GPU buffers are addressed by offset within the arena mapping; the
    /// descriptor exists only to keep the handle's fixed wire shape.
    fn placeholder_fd(&self) -> Result<OwnedFd>;
}

/// `_IOR('h', 0, struct hw3d_region[3])`
const HW3D_GET_REGIONS: libc::c_ulong = 0x8030_6800;

/// [`Hw3dDevice`] backed by a real hardware-3D device node.
#[derive(Debug, Clone)]
pub struct LinuxHw3dDevice {
    path: PathBuf,
}

impl LinuxHw3dDevice {
    /// Use the device node at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The device node this instance opens.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for LinuxHw3dDevice {
    fn default() -> Self {
        Self::new("/dev/hw3dm")
    }
}

impl Hw3dDevice for LinuxHw3dDevice {
    fn open(&self) -> Result<OwnedFd> {
        rustix::fs::open(&self.path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())
            .map_err(Error::DeviceUnavailable)
    }

    fn regions(&self, fd: BorrowedFd<'_>) -> Result<Hw3dRegions> {
        let mut regions = [Hw3dRegion::default(); 3];
        // SAFETY: HW3D_GET_REGIONS fills in the three-region array; the
        // fd is a valid device descriptor and the array outlives the
        // call.
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), HW3D_GET_REGIONS, regions.as_mut_ptr()) };
        if ret < 0 {
            return Err(last_errno().into());
        }
        Ok(Hw3dRegions::new(regions))
    }

    fn placeholder_fd(&self) -> Result<OwnedFd> {
        Ok(rustix::fs::open(
            "/dev/null",
            OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
        )?)
    }
}
