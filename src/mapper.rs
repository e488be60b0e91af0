//! Client-side mapping collaborator.
//!
//! Mapping a handle into a process's address space (and the full
//! register/lock/unlock accessor protocol built on top of it) lives
//! outside the allocator. The allocator itself consumes exactly two
//! operations: `map`, to give the allocating process a view of an
//! anonymous buffer before the handle is returned, and `terminate`, to
//! tear that view down on free.

use crate::error::Result;
use crate::handle::BufferHandle;
use rustix::mm::{MapFlags, ProtFlags};

/// The two mapping operations the allocator consumes.
///
/// Implementations must tolerate `terminate` on a handle that was never
/// mapped (`base() == 0`).
pub trait BufferMapper: Send + Sync {
    /// Map the handle's memory into this process, returning the base
    /// address.
    fn map(&self, handle: &BufferHandle) -> Result<usize>;

    /// Unmap the handle's process-local view.
    fn terminate(&self, handle: &BufferHandle) -> Result<()>;
}

/// Default mapper: a plain shared read-write `mmap` of the handle's
/// descriptor.
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapBufferMapper;

impl BufferMapper for MmapBufferMapper {
    fn map(&self, handle: &BufferHandle) -> Result<usize> {
        // SAFETY: fresh anonymous mapping of a descriptor the handle owns;
        // the mapping is torn down in `terminate` before the fd closes.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                handle.size(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &handle.fd(),
                0,
            )?
        };
        Ok(ptr as usize)
    }

    fn terminate(&self, handle: &BufferHandle) -> Result<()> {
        if handle.base() == 0 {
            return Ok(());
        }
        // SAFETY: base/size describe the mapping `map` created in this
        // process; nothing else unmaps it.
        unsafe {
            rustix::mm::munmap(handle.base() as *mut _, handle.size())?;
        }
        Ok(())
    }
}
