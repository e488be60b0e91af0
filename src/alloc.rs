//! The buffer-allocation decision engine and shared module state.
//!
//! One [`BufferAllocator`] per process coordinates every backend: it owns
//! the module lock (framebuffer state plus both arena states), the two
//! region allocators, and the collaborator objects that talk to devices
//! and to the client-side mapper. Arena initialization is lazy, happens at
//! most once per process per arena, and records failure stickily: a
//! backend that could not come up is never re-probed, later requests take
//! a fallback path instead.
//!
//! # Backend selection
//!
//! In priority order: framebuffer slots for `HW_FB`, the GPU-reserved
//! arena for `HW_RENDER` (with a bounded retry while the compositor
//! reclaims a dead client's buffers), the physically contiguous arena for
//! `HW_TEXTURE`/`HW_2D`, and anonymous shared memory for everything else
//! and as the fallback when a device is gone.

use std::ptr::NonNull;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};

use crate::device::{
    GPU_RESERVED_SIZE, Hw3dDevice, Hw3dRegionKind, LinuxHw3dDevice, LinuxPmemDevice, PmemDevice,
};
use crate::error::{Error, Result};
use crate::format::{PixelFormat, Usage, buffer_layout, round_up_to_page};
use crate::framebuffer::{FramebufferInfo, FramebufferMapper, LinuxFramebufferMapper};
use crate::handle::{Backend, BufferHandle};
use crate::mapper::{BufferMapper, MmapBufferMapper};
use crate::region::RegionAllocator;
use crate::shmem;

/// Attempts made against a full GPU arena before giving up.
pub const GPU_ALLOC_ATTEMPTS: u32 = 8;

/// Increment added to the sleep between consecutive GPU attempts.
pub const GPU_RETRY_STEP: Duration = Duration::from_millis(250);

/// A successful allocation.
#[derive(Debug)]
pub struct Allocation {
    /// The buffer handle.
    pub handle: BufferHandle,
    /// Row stride actually used, in pixels.
    pub stride: usize,
}

/// A process-lifetime shared mapping of one arena.
struct ArenaMapping {
    base: NonNull<u8>,
    len: usize,
}

impl ArenaMapping {
    fn map(fd: BorrowedFd<'_>, len: usize, offset: u64) -> Result<Self> {
        // SAFETY: fresh mapping of a device or memfd descriptor; unmapped
        // only in Drop.
        let base = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                offset,
            )?
        };
        let base = NonNull::new(base.cast::<u8>()).ok_or(Error::OutOfMemory("arena mapping"))?;
        Ok(Self { base, len })
    }

    #[inline]
    fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Scrub a sub-range before it is handed to a new owner, so a buffer
    /// never leaks a previous occupant's contents across processes.
    fn zero(&self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.len);
        // SAFETY: offset/len are within the mapping and the region was
        // just reserved for a single owner.
        unsafe {
            std::ptr::write_bytes(self.base.as_ptr().add(offset), 0, len);
        }
    }
}

impl Drop for ArenaMapping {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: the mapping is shared memory; all sub-range bookkeeping goes
// through the internally synchronized region allocators.
unsafe impl Send for ArenaMapping {}
unsafe impl Sync for ArenaMapping {}

/// The physically contiguous arena once it is up.
struct PmemArena {
    master: OwnedFd,
    mapping: ArenaMapping,
}

impl PmemArena {
    #[inline]
    fn master_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    #[inline]
    fn base_addr(&self) -> usize {
        self.mapping.base_addr()
    }
}

/// The GPU-reserved arena once it is up.
struct GpuArena {
    device: OwnedFd,
    mapping: ArenaMapping,
    map_offset: u64,
}

impl GpuArena {
    #[inline]
    fn base_addr(&self) -> usize {
        self.mapping.base_addr()
    }
}

/// Per-arena lifecycle: probe at most once, remember the outcome forever.
enum ArenaState<T> {
    Uninitialized,
    Ready(Arc<T>),
    Failed(rustix::io::Errno),
}

struct FramebufferState {
    info: FramebufferInfo,
    /// Bit *i* set ⇔ slot *i* is assigned to a live handle.
    slot_mask: u32,
}

impl FramebufferState {
    fn full_mask(&self) -> u32 {
        let n = self.info.num_buffers;
        if n >= 32 { u32::MAX } else { (1u32 << n) - 1 }
    }
}

struct ModuleState {
    framebuffer: Option<FramebufferState>,
    pmem: ArenaState<PmemArena>,
    gpu: ArenaState<GpuArena>,
}

/// External collaborators and hooks wired into a [`BufferAllocator`].
pub struct Collaborators {
    /// Physical-memory device control.
    pub pmem_device: Box<dyn PmemDevice>,
    /// Hardware-3D device control.
    pub hw3d_device: Box<dyn Hw3dDevice>,
    /// Framebuffer initialization/mapping.
    pub framebuffer_mapper: Box<dyn FramebufferMapper>,
    /// Client-side buffer mapping.
    pub buffer_mapper: Box<dyn BufferMapper>,
    /// Sleep hook used by the GPU retry loop.
    pub sleep: Box<dyn Fn(Duration) + Send + Sync>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            pmem_device: Box::new(LinuxPmemDevice::default()),
            hw3d_device: Box::new(LinuxHw3dDevice::default()),
            framebuffer_mapper: Box::new(LinuxFramebufferMapper::default()),
            buffer_mapper: Box::new(MmapBufferMapper),
            sleep: Box::new(std::thread::sleep),
        }
    }
}

/// The allocator: decision engine plus all shared state.
pub struct BufferAllocator {
    state: Mutex<ModuleState>,
    pmem_region: RegionAllocator,
    gpu_region: RegionAllocator,
    pmem_device: Box<dyn PmemDevice>,
    hw3d_device: Box<dyn Hw3dDevice>,
    framebuffer_mapper: Box<dyn FramebufferMapper>,
    buffer_mapper: Box<dyn BufferMapper>,
    sleep: Box<dyn Fn(Duration) + Send + Sync>,
}

static GLOBAL: OnceLock<BufferAllocator> = OnceLock::new();

impl BufferAllocator {
    /// Create an allocator wired to the real Linux device nodes.
    pub fn new() -> Self {
        Self::with_collaborators(Collaborators::default())
    }

    /// Create an allocator with explicit collaborators.
    pub fn with_collaborators(collaborators: Collaborators) -> Self {
        Self {
            state: Mutex::new(ModuleState {
                framebuffer: None,
                pmem: ArenaState::Uninitialized,
                gpu: ArenaState::Uninitialized,
            }),
            pmem_region: RegionAllocator::new(),
            gpu_region: RegionAllocator::with_capacity(GPU_RESERVED_SIZE),
            pmem_device: collaborators.pmem_device,
            hw3d_device: collaborators.hw3d_device,
            framebuffer_mapper: collaborators.framebuffer_mapper,
            buffer_mapper: collaborators.buffer_mapper,
            sleep: collaborators.sleep,
        }
    }

    /// The process-wide allocator, constructed on first use and never torn
    /// down.
    pub fn global() -> &'static BufferAllocator {
        GLOBAL.get_or_init(BufferAllocator::new)
    }

    /// Allocate a buffer for the given geometry and usage.
    ///
    /// Returns the handle and the row stride actually used; the stride may
    /// exceed the requested width to satisfy hardware alignment.
    pub fn allocate(
        &self,
        width: usize,
        height: usize,
        format: PixelFormat,
        usage: Usage,
    ) -> Result<Allocation> {
        let layout = buffer_layout(width, height, format, usage)?;
        let handle = if usage.contains(Usage::HW_FB) {
            self.allocate_framebuffer(layout.size, usage)?
        } else {
            self.allocate_buffer(layout.size, usage)?
        };
        Ok(Allocation {
            handle,
            stride: layout.stride,
        })
    }

    /// Release a buffer and return its memory to the owning backend.
    ///
    /// Handles received from another process are validated when they are
    /// rebuilt via [`BufferHandle::from_raw`]; a record that fails the
    /// magic/count check never reaches this point.
    pub fn free(&self, handle: BufferHandle) -> Result<()> {
        match handle.backend() {
            Backend::Framebuffer => {
                let mut state = self.state.lock().unwrap();
                let fb = state.framebuffer.as_mut().ok_or(Error::InvalidHandle)?;
                let buffer_size = fb.info.buffer_size();
                let slot = handle
                    .base()
                    .checked_sub(fb.info.base)
                    .map(|delta| delta / buffer_size)
                    .filter(|slot| *slot < fb.info.num_buffers as usize)
                    .ok_or(Error::InvalidHandle)?;
                fb.slot_mask &= !(1u32 << slot);
                // The framebuffer's memory itself is never released.
            }
            Backend::Pmem => {
                match self
                    .pmem_device
                    .unmap_subrange(handle.fd(), handle.offset(), handle.size())
                {
                    Ok(()) => self.pmem_region.deallocate(handle.offset()),
                    Err(err) => {
                        // Recycling a region another process may still
                        // have mapped would hand it that process's
                        // surfaces; leaking the reservation is the safe
                        // outcome.
                        tracing::error!(
                            %err,
                            offset = handle.offset(),
                            size = handle.size(),
                            "sub-range unmap failed, leaking region reservation"
                        );
                    }
                }
            }
            Backend::Gpu => {
                tracing::debug!(offset = handle.offset(), "freeing GPU buffer");
                self.gpu_region.deallocate(handle.offset());
            }
            Backend::Anonymous => {
                self.buffer_mapper.terminate(&handle)?;
            }
        }
        // Dropping the handle closes its descriptor last.
        drop(handle);
        Ok(())
    }

    fn allocate_framebuffer(&self, size: usize, usage: Usage) -> Result<BufferHandle> {
        let mut state = self.state.lock().unwrap();

        if state.framebuffer.is_none() {
            // Mapped once and forever.
            let info = self.framebuffer_mapper.map_framebuffer()?;
            state.framebuffer = Some(FramebufferState { info, slot_mask: 0 });
        }
        let fb = state.framebuffer.as_mut().ok_or(Error::InvalidHandle)?;
        let buffer_size = fb.info.buffer_size();

        if fb.info.num_buffers == 1 {
            // A single physical buffer cannot page-flip; serve a regular
            // 2D-capable shared buffer that the display engine copies to
            // the screen on post.
            drop(state);
            let usage = (usage - Usage::HW_FB) | Usage::HW_2D;
            return self.allocate_buffer(buffer_size, usage);
        }

        if fb.slot_mask == fb.full_mask() {
            return Err(Error::OutOfMemory("framebuffer slots"));
        }
        let slot = (0..fb.info.num_buffers)
            .find(|i| fb.slot_mask & (1u32 << i) == 0)
            .ok_or(Error::OutOfMemory("framebuffer slots"))?;
        fb.slot_mask |= 1u32 << slot;

        let vaddr = fb.info.base + slot as usize * buffer_size;
        let fd = rustix::io::fcntl_dupfd_cloexec(&fb.info.fd, 0)?;
        let mut handle = BufferHandle::new(fd, size, Backend::Framebuffer);
        handle.set_offset(vaddr - fb.info.base);
        handle.set_base(vaddr);
        Ok(handle)
    }

    fn allocate_buffer(&self, size: usize, usage: Usage) -> Result<BufferHandle> {
        let size = round_up_to_page(size);

        if usage.contains(Usage::HW_RENDER) {
            match self.allocate_gpu(size) {
                Err(err) if err.is_sticky() => {
                    tracing::debug!(%err, "GPU arena unavailable, using anonymous memory");
                    self.allocate_anonymous(size)
                }
                other => other,
            }
        } else if usage.intersects(Usage::HW_TEXTURE | Usage::HW_2D) {
            match self.allocate_pmem(size) {
                Err(err) if err.is_sticky() && !usage.contains(Usage::HW_2D) => {
                    // Texture-only callers can live with anonymous memory;
                    // software GL keeps working without the copybit path.
                    tracing::debug!(%err, "pmem arena unavailable, using anonymous memory");
                    self.allocate_anonymous(size)
                }
                other => other,
            }
        } else {
            self.allocate_anonymous(size)
        }
    }

    fn allocate_anonymous(&self, size: usize) -> Result<BufferHandle> {
        let fd = shmem::create_buffer("pigment-buffer", size)?;
        let mut handle = BufferHandle::new(fd, size, Backend::Anonymous);
        let base = self.buffer_mapper.map(&handle)?;
        handle.set_base(base);
        Ok(handle)
    }

    fn allocate_pmem(&self, size: usize) -> Result<BufferHandle> {
        let arena = self.ensure_pmem()?;

        let offset = self
            .pmem_region
            .allocate(size)
            .ok_or(Error::OutOfMemory("pmem arena"))?;

        // Give the buffer its own restricted descriptor. Any failure past
        // this point must hand the reservation back before propagating.
        let fd = match self.connect_pmem_buffer(&arena, offset, size) {
            Ok(fd) => fd,
            Err(err) => {
                self.pmem_region.deallocate(offset);
                return Err(err);
            }
        };

        arena.mapping.zero(offset, size);

        let mut handle = BufferHandle::new(fd, size, Backend::Pmem);
        handle.set_offset(offset);
        handle.set_base(arena.base_addr() + offset);
        Ok(handle)
    }

    fn connect_pmem_buffer(
        &self,
        arena: &PmemArena,
        offset: usize,
        size: usize,
    ) -> Result<OwnedFd> {
        let fd = self.pmem_device.open_buffer()?;
        self.pmem_device.connect(fd.as_fd(), arena.master_fd())?;
        self.pmem_device.map_subrange(fd.as_fd(), offset, size)?;
        Ok(fd)
    }

    fn allocate_gpu(&self, size: usize) -> Result<BufferHandle> {
        let arena = self.ensure_gpu()?;

        // A process holding GPU surfaces may have just been killed; the
        // compositor can take a few seconds to notice and release its
        // buffers, so full-arena failures are retried on an increasing
        // schedule before giving up.
        let mut offset = None;
        let mut delay = Duration::ZERO;
        for attempt in 1..=GPU_ALLOC_ATTEMPTS {
            if let Some(found) = self.gpu_region.allocate(size) {
                offset = Some(found);
                break;
            }
            tracing::warn!(
                size_kib = size / 1024,
                attempt,
                "GPU arena allocation failed, retrying"
            );
            if attempt < GPU_ALLOC_ATTEMPTS {
                delay += GPU_RETRY_STEP;
                (self.sleep)(delay);
            }
        }
        let offset = offset.ok_or(Error::OutOfMemory("GPU arena"))?;

        let fd = match self.hw3d_device.placeholder_fd() {
            Ok(fd) => fd,
            Err(err) => {
                self.gpu_region.deallocate(offset);
                return Err(err);
            }
        };

        tracing::debug!(size, offset, "allocating GPU buffer");
        arena.mapping.zero(offset, size);

        let mut handle = BufferHandle::new(fd, size, Backend::Gpu);
        handle.set_offset(offset);
        handle.set_base(arena.base_addr() + offset);
        handle.set_map_offset(arena.map_offset);
        handle.set_gpu_fd_shadow(arena.device.as_raw_fd());
        Ok(handle)
    }

    fn ensure_pmem(&self) -> Result<Arc<PmemArena>> {
        let mut state = self.state.lock().unwrap();
        match &state.pmem {
            ArenaState::Ready(arena) => return Ok(Arc::clone(arena)),
            ArenaState::Failed(errno) => return Err(Error::DeviceUnavailable(*errno)),
            ArenaState::Uninitialized => {}
        }

        match self.init_pmem_locked() {
            Ok(arena) => {
                let arena = Arc::new(arena);
                state.pmem = ArenaState::Ready(Arc::clone(&arena));
                Ok(arena)
            }
            Err(err) => {
                let errno = sticky_errno(&err);
                tracing::warn!(%err, "pmem arena initialization failed");
                state.pmem = ArenaState::Failed(errno);
                Err(Error::DeviceUnavailable(errno))
            }
        }
    }

    fn init_pmem_locked(&self) -> Result<PmemArena> {
        let master = self.pmem_device.open_master()?;
        let size = match self.pmem_device.total_size(master.as_fd()) {
            Ok(size) => size,
            Err(err) => {
                tracing::warn!(%err, "pmem size query failed, limp mode");
                crate::device::DEFAULT_PMEM_SIZE
            }
        };
        self.pmem_region.set_size(size);
        let mapping = ArenaMapping::map(master.as_fd(), size, 0)?;
        Ok(PmemArena { master, mapping })
    }

    fn ensure_gpu(&self) -> Result<Arc<GpuArena>> {
        let mut state = self.state.lock().unwrap();
        match &state.gpu {
            ArenaState::Ready(arena) => return Ok(Arc::clone(arena)),
            ArenaState::Failed(errno) => return Err(Error::DeviceUnavailable(*errno)),
            ArenaState::Uninitialized => {}
        }

        match self.init_gpu_locked() {
            Ok(arena) => {
                let arena = Arc::new(arena);
                state.gpu = ArenaState::Ready(Arc::clone(&arena));
                Ok(arena)
            }
            Err(err) => {
                let errno = sticky_errno(&err);
                tracing::warn!(%err, "GPU arena initialization failed");
                state.gpu = ArenaState::Failed(errno);
                Err(Error::DeviceUnavailable(errno))
            }
        }
    }

    fn init_gpu_locked(&self) -> Result<GpuArena> {
        let device = self.hw3d_device.open()?;
        let regions = self.hw3d_device.regions(device.as_fd())?;

        for kind in [
            Hw3dRegionKind::Smi,
            Hw3dRegionKind::Ebi,
            Hw3dRegionKind::Regs,
        ] {
            let region = regions.get(kind);
            tracing::debug!(
                ?kind,
                map_offset = region.map_offset,
                len = region.len,
                phys = region.phys,
                "3D device region"
            );
        }

        let ebi = regions.get(Hw3dRegionKind::Ebi);
        let mapping = ArenaMapping::map(device.as_fd(), GPU_RESERVED_SIZE, ebi.map_offset as u64)?;
        Ok(GpuArena {
            device,
            mapping,
            map_offset: ebi.map_offset as u64,
        })
    }
}

impl Default for BufferAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn sticky_errno(err: &Error) -> rustix::io::Errno {
    match err {
        Error::DeviceUnavailable(errno) | Error::System(errno) => *errno,
        Error::Io(io) => {
            rustix::io::Errno::from_raw_os_error(io.raw_os_error().unwrap_or(libc::EIO))
        }
        _ => rustix::io::Errno::IO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mapping(len: usize) -> ArenaMapping {
        let name = std::ffi::CString::new("pigment-test-arena").unwrap();
        let fd = rustix::fs::memfd_create(&name, rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, len as u64).unwrap();
        ArenaMapping::map(fd.as_fd(), len, 0).unwrap()
    }

    #[test]
    fn test_arena_mapping_zero_scrubs_subrange() {
        let mapping = test_mapping(8192);
        // SAFETY: the mapping is live and 8192 bytes long.
        let slice = unsafe {
            std::slice::from_raw_parts_mut(mapping.base.as_ptr(), 8192)
        };
        slice.fill(0xAB);

        mapping.zero(4096, 4096);
        assert!(slice[..4096].iter().all(|&b| b == 0xAB));
        assert!(slice[4096..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_full_mask_covers_slot_count() {
        let info = FramebufferInfo {
            fd: shmem_fd(),
            base: 0,
            line_length: 64,
            yres: 4,
            num_buffers: 2,
        };
        let fb = FramebufferState { info, slot_mask: 0 };
        assert_eq!(fb.full_mask(), 0b11);
    }

    #[test]
    fn test_full_mask_saturates_at_32_slots() {
        let info = FramebufferInfo {
            fd: shmem_fd(),
            base: 0,
            line_length: 64,
            yres: 4,
            num_buffers: 32,
        };
        let fb = FramebufferState { info, slot_mask: 0 };
        assert_eq!(fb.full_mask(), u32::MAX);
    }

    fn shmem_fd() -> OwnedFd {
        crate::shmem::create_buffer("pigment-test-fb", 4096).unwrap()
    }

    #[test]
    fn test_sticky_errno_extraction() {
        let errno = rustix::io::Errno::NOENT;
        assert_eq!(sticky_errno(&Error::DeviceUnavailable(errno)), errno);
        assert_eq!(sticky_errno(&Error::System(errno)), errno);
        assert_eq!(
            sticky_errno(&Error::OutOfMemory("x")),
            rustix::io::Errno::IO
        );
    }

    #[test]
    fn test_anonymous_allocation_needs_no_devices() {
        let allocator = BufferAllocator::new();
        let allocation = allocator
            .allocate(64, 64, PixelFormat::Rgba8888, Usage::empty())
            .unwrap();

        assert_eq!(allocation.handle.backend(), Backend::Anonymous);
        assert_eq!(allocation.stride, 64);
        assert_ne!(allocation.handle.base(), 0);
        assert_eq!(allocation.handle.size(), round_up_to_page(64 * 64 * 4));

        allocator.free(allocation.handle).unwrap();
    }

    #[test]
    fn test_anonymous_buffer_is_page_rounded_and_mapped() {
        let allocator = BufferAllocator::new();
        let allocation = allocator
            .allocate(3, 3, PixelFormat::Rgb565, Usage::empty())
            .unwrap();

        let page = rustix::param::page_size();
        assert_eq!(allocation.handle.size(), page);

        // The mapping is usable by the allocating process.
        // SAFETY: base points at a live mapping of handle.size() bytes.
        unsafe {
            let slice = std::slice::from_raw_parts_mut(
                allocation.handle.base() as *mut u8,
                allocation.handle.size(),
            );
            slice[0] = 7;
            assert_eq!(slice[0], 7);
        }

        allocator.free(allocation.handle).unwrap();
    }
}
