//! Anonymous shared memory, the backend of last resort.
//!
//! Buffers with no hardware usage bits (and fallback allocations when a
//! physical backend is unavailable) are plain anonymous shared memory:
//! a sized memfd the client maps into its own address space. The kernel
//! hands these pages out zeroed, so no explicit scrub is needed before a
//! buffer crosses a process boundary.

use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use std::ffi::CString;

/// Create an anonymous shared-memory buffer of `size` bytes.
///
/// The name is only a debugging label (visible in `/proc/self/fd/`).
pub fn create_buffer(name: &str, size: usize) -> Result<OwnedFd> {
    if size == 0 {
        return Err(Error::Unsupported("zero-sized buffer"));
    }

    let cname = CString::new(name).map_err(|_| Error::Unsupported("buffer name"))?;
    let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;
    rustix::fs::ftruncate(&fd, size as u64)?;
    Ok(fd)
}
