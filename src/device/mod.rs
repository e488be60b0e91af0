//! Device-control collaborators for the physical memory backends.
//!
//! The allocator talks to two device nodes: the physical-memory device
//! (one large physically contiguous pool, sub-ranges mapped per buffer)
//! and the hardware-3D device (a fixed set of named memory regions, one of
//! which hosts the GPU-reserved arena). Each operation can fail
//! independently; a failure is fatal only to that backend, never to the
//! allocator as a whole.
//!
//! The traits here are the seam: production code uses the Linux
//! implementations against real device nodes, tests substitute
//! memfd-backed fakes.

mod hw3d;
mod pmem;

pub(crate) use pmem::last_errno;

pub use hw3d::{
    GPU_RESERVED_SIZE, Hw3dDevice, Hw3dRegion, Hw3dRegionKind, Hw3dRegions, LinuxHw3dDevice,
};
pub use pmem::{DEFAULT_PMEM_SIZE, LinuxPmemDevice, PmemDevice};
