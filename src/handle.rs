//! Buffer handles: the opaque, self-describing records returned by the
//! allocator.
//!
//! A [`BufferHandle`] is the in-process form: it owns its file descriptor
//! and knows which backend its memory came from. At a process boundary the
//! handle is flattened into a [`RawHandle`], a fixed-layout record of
//! exactly one descriptor slot and eight integers guarded by a magic tag.
//! Any process receiving a raw handle must run [`RawHandle::validate`]
//! before trusting a single field; a handle failing validation is never
//! dereferenced further.

use crate::error::{Error, Result};
use bitflags::bitflags;
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

bitflags! {
    /// Backend discriminant bits carried by a handle.
    ///
    /// At most one backend is described: `FRAMEBUFFER` (which implies
    /// `USES_PMEM`, since framebuffer slots live in physically contiguous
    /// memory), `USES_PMEM`, `USES_GPU`, or none of them for anonymous
    /// shared memory.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct HandleFlags: u32 {
        /// The buffer is a page-flippable framebuffer slot.
        const FRAMEBUFFER = 1 << 0;
        /// The buffer lives in the physically contiguous memory arena.
        const USES_PMEM = 1 << 1;
        /// The buffer lives in the GPU-reserved arena.
        const USES_GPU = 1 << 2;
    }
}

/// The physical memory source backing a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Anonymous shared memory.
    Anonymous,
    /// Physically contiguous memory arena.
    Pmem,
    /// GPU-reserved memory arena.
    Gpu,
    /// Page-flippable framebuffer slot.
    Framebuffer,
}

impl Backend {
    /// The flag bits describing this backend on the wire.
    pub fn flags(self) -> HandleFlags {
        match self {
            Backend::Anonymous => HandleFlags::empty(),
            Backend::Pmem => HandleFlags::USES_PMEM,
            Backend::Gpu => HandleFlags::USES_GPU,
            Backend::Framebuffer => HandleFlags::FRAMEBUFFER | HandleFlags::USES_PMEM,
        }
    }

    /// Decode the backend from wire flags.
    ///
    /// `FRAMEBUFFER` wins over the other bits, matching the dispatch order
    /// of the free path. Unknown bits reject the handle.
    pub fn from_flags(flags: HandleFlags) -> Option<Self> {
        if flags.contains(HandleFlags::FRAMEBUFFER) {
            Some(Backend::Framebuffer)
        } else if flags.contains(HandleFlags::USES_PMEM) {
            Some(Backend::Pmem)
        } else if flags.contains(HandleFlags::USES_GPU) {
            Some(Backend::Gpu)
        } else if flags.is_empty() {
            Some(Backend::Anonymous)
        } else {
            None
        }
    }
}

/// Magic tag stamped into every marshalled handle (`"pgbh"`).
pub const HANDLE_MAGIC: i64 = 0x7067_6268;

/// Number of descriptor slots in the wire form.
pub const HANDLE_NUM_FDS: i32 = 1;

/// Number of integer slots in the wire form.
pub const HANDLE_NUM_INTS: i32 = 8;

/// Fixed-layout wire form of a buffer handle.
///
/// Produced and consumed at the process boundary only. The shape is frozen:
/// one descriptor slot and eight integers. Changing it breaks cross-process
/// compatibility, which is why [`validate`](Self::validate) checks the
/// embedded counts as well as the magic tag.
///
/// ```text
/// ┌─────────┬──────────┬────┬───────┬───────┬──────┬────────┬──────┬────────────┬─────┬──────────┐
/// │ num_fds │ num_ints │ fd │ magic │ flags │ size │ offset │ base │ map_offset │ pid │ reserved │
/// └─────────┴──────────┴────┴───────┴───────┴──────┴────────┴──────┴────────────┴─────┴──────────┘
/// ```
///
/// The descriptor value itself travels out of band (`SCM_RIGHTS`); the
/// `fd` slot only records the sender's descriptor number. `reserved` holds
/// the slot where the allocator's process-local GPU descriptor shadow
/// sits; it is always zero on the wire.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawHandle {
    /// Descriptor slot count, always [`HANDLE_NUM_FDS`].
    pub num_fds: i32,
    /// Integer slot count, always [`HANDLE_NUM_INTS`].
    pub num_ints: i32,
    /// The sender's descriptor number.
    pub fd: i32,
    /// Magic tag, always [`HANDLE_MAGIC`].
    pub magic: i64,
    /// Backend flag bits ([`HandleFlags`]).
    pub flags: i64,
    /// Buffer size in bytes.
    pub size: i64,
    /// Byte offset within the backing arena.
    pub offset: i64,
    /// Mapped base address in the owning process, zero if unmapped.
    pub base: i64,
    /// Device-relative offset for client-side re-mapping.
    pub map_offset: i64,
    /// Process id of the allocating process.
    pub pid: i64,
    /// Always zero on the wire.
    pub reserved: i64,
}

impl RawHandle {
    /// Check that this record is a handle this allocator produced.
    ///
    /// Verifies the embedded descriptor and integer counts and the magic
    /// tag. Every process receiving a handle runs this before reading any
    /// other field.
    pub fn validate(&self) -> Result<()> {
        if self.num_fds != HANDLE_NUM_FDS
            || self.num_ints != HANDLE_NUM_INTS
            || self.magic != HANDLE_MAGIC
        {
            tracing::warn!(
                num_fds = self.num_fds,
                num_ints = self.num_ints,
                magic = self.magic,
                "rejecting invalid buffer handle"
            );
            return Err(Error::InvalidHandle);
        }
        Ok(())
    }
}

/// An allocated graphics buffer.
///
/// Owns its descriptor exclusively until freed. Immutable by contract once
/// shared: receiving processes may read geometry and invoke the mapping
/// collaborator, never mutate allocator bookkeeping fields.
pub struct BufferHandle {
    fd: OwnedFd,
    backend: Backend,
    size: usize,
    offset: usize,
    base: usize,
    map_offset: u64,
    owner_pid: i32,
    /// Raw descriptor of the GPU arena, shadowed process-locally so the
    /// free path can reach the arena without marshalling a second fd.
    gpu_fd_shadow: i32,
}

impl BufferHandle {
    pub(crate) fn new(fd: OwnedFd, size: usize, backend: Backend) -> Self {
        Self {
            fd,
            backend,
            size,
            offset: 0,
            base: 0,
            map_offset: 0,
            owner_pid: std::process::id() as i32,
            gpu_fd_shadow: -1,
        }
    }

    /// The backend this buffer was allocated from.
    #[inline]
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// The wire flag bits for this handle.
    #[inline]
    pub fn flags(&self) -> HandleFlags {
        self.backend.flags()
    }

    /// Buffer size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Byte offset within the backing arena (zero for anonymous buffers).
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Mapped base address in the owning process, zero if not yet mapped.
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Device-relative offset used for client-side re-mapping.
    #[inline]
    pub fn map_offset(&self) -> u64 {
        self.map_offset
    }

    /// Process id of the allocating process.
    #[inline]
    pub fn owner_pid(&self) -> i32 {
        self.owner_pid
    }

    /// Borrow the handle's descriptor.
    #[inline]
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub(crate) fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    pub(crate) fn set_base(&mut self, base: usize) {
        self.base = base;
    }

    pub(crate) fn set_map_offset(&mut self, map_offset: u64) {
        self.map_offset = map_offset;
    }

    pub(crate) fn set_gpu_fd_shadow(&mut self, fd: i32) {
        self.gpu_fd_shadow = fd;
    }

    /// Raw descriptor of the GPU arena in the allocating process, `-1`
    /// for every other backend and for handles received over IPC.
    ///
    /// Never marshalled; only the process-local mapping path reads it.
    #[inline]
    pub fn gpu_fd_shadow(&self) -> i32 {
        self.gpu_fd_shadow
    }

    /// Flatten into the wire form.
    ///
    /// The descriptor itself must travel out of band; the GPU descriptor
    /// shadow is deliberately excluded from the marshalled record.
    pub fn as_raw(&self) -> RawHandle {
        RawHandle {
            num_fds: HANDLE_NUM_FDS,
            num_ints: HANDLE_NUM_INTS,
            fd: self.fd.as_raw_fd(),
            magic: HANDLE_MAGIC,
            flags: self.flags().bits() as i64,
            size: self.size as i64,
            offset: self.offset as i64,
            base: self.base as i64,
            map_offset: self.map_offset as i64,
            pid: self.owner_pid as i64,
            reserved: 0,
        }
    }

    /// Rebuild a handle from its wire form and the descriptor received out
    /// of band.
    ///
    /// Validates the record first; the receiving process's view has no
    /// local mapping yet, so `base` is cleared.
    pub fn from_raw(raw: &RawHandle, fd: OwnedFd) -> Result<Self> {
        raw.validate()?;
        let flags = u32::try_from(raw.flags)
            .ok()
            .and_then(HandleFlags::from_bits)
            .ok_or(Error::InvalidHandle)?;
        let backend = Backend::from_flags(flags).ok_or(Error::InvalidHandle)?;
        Ok(Self {
            fd,
            backend,
            size: raw.size as usize,
            offset: raw.offset as usize,
            base: 0,
            map_offset: raw.map_offset as u64,
            owner_pid: raw.pid as i32,
            gpu_fd_shadow: -1,
        })
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("fd", &self.fd.as_raw_fd())
            .field("backend", &self.backend)
            .field("size", &self.size)
            .field("offset", &self.offset)
            .field("base", &format_args!("{:#x}", self.base))
            .field("map_offset", &self.map_offset)
            .field("owner_pid", &self.owner_pid)
            .finish()
    }
}
