//! # pigment
//!
//! A graphics-buffer allocator for embedded display stacks.
//!
//! pigment sits between an application-facing display stack and the
//! heterogeneous physical memory of an embedded device. Given a buffer's
//! geometry, pixel format, and usage, it picks the right backend (a
//! page-flippable framebuffer slot, the physically contiguous memory
//! arena, the GPU-reserved arena, or anonymous shared memory) and returns
//! an opaque, self-describing handle that can be marshalled across process
//! boundaries and later freed deterministically.
//!
//! ## Features
//!
//! - **Best-fit arenas**: both physical pools are mapped once per process
//!   and sub-allocated by internally synchronized best-fit allocators
//! - **Sticky device probing**: each arena is probed at most once; an
//!   unavailable device silently downgrades future requests to a fallback
//! - **Marshallable handles**: a fixed wire shape (one descriptor, eight
//!   integers) guarded by a magic/count validation check
//! - **Pressure tolerance**: GPU allocation retries on an increasing
//!   schedule while a dead client's buffers are being reclaimed
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pigment::prelude::*;
//!
//! let allocator = BufferAllocator::global();
//! let allocation = allocator.allocate(
//!     1280,
//!     720,
//!     PixelFormat::Rgb565,
//!     Usage::HW_TEXTURE,
//! )?;
//! // hand allocation.handle across to the display stack ...
//! allocator.free(allocation.handle)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod alloc;
pub mod device;
pub mod error;
pub mod format;
pub mod framebuffer;
pub mod handle;
pub mod mapper;
pub mod region;
pub mod shmem;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::alloc::{Allocation, BufferAllocator, Collaborators};
    pub use crate::error::{Error, Result};
    pub use crate::format::{PixelFormat, Usage};
    pub use crate::handle::{Backend, BufferHandle, HandleFlags, RawHandle};
}

pub use error::{Error, Result};
