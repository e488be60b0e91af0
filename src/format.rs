//! Pixel formats, usage flags, and buffer geometry.
//!
//! The allocator accepts a small, fixed set of pixel formats. Geometry is
//! computed up front: the row stride obeys the rendering hardware's
//! alignment constraint, and the final byte size is rounded up to the
//! platform page size before it reaches any region allocator.

use crate::error::{Error, Result};
use bitflags::bitflags;

/// Pixel formats accepted by the allocator.
///
/// Four 32-bit formats, one 24-bit format, and three 16-bit formats. All
/// other formats are rejected at the allocation boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 32-bit RGBA.
    Rgba8888,
    /// 32-bit RGB with ignored alpha byte.
    Rgbx8888,
    /// 32-bit BGRA.
    Bgra8888,
    /// 32-bit BGR with ignored alpha byte.
    Bgrx8888,
    /// 24-bit packed RGB.
    Rgb888,
    /// 16-bit RGB, 5-6-5.
    Rgb565,
    /// 16-bit RGBA, 5-5-5-1.
    Rgba5551,
    /// 16-bit RGBA, 4-4-4-4.
    Rgba4444,
}

impl PixelFormat {
    /// Bytes per pixel for this format.
    #[inline]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8888
            | PixelFormat::Rgbx8888
            | PixelFormat::Bgra8888
            | PixelFormat::Bgrx8888 => 4,
            PixelFormat::Rgb888 => 3,
            PixelFormat::Rgb565 | PixelFormat::Rgba5551 | PixelFormat::Rgba4444 => 2,
        }
    }

    /// Decode a raw format code from an untyped client.
    ///
    /// Unknown codes are rejected, never mapped to a nearest match.
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            1 => Ok(PixelFormat::Rgba8888),
            2 => Ok(PixelFormat::Rgbx8888),
            3 => Ok(PixelFormat::Bgra8888),
            4 => Ok(PixelFormat::Bgrx8888),
            5 => Ok(PixelFormat::Rgb888),
            6 => Ok(PixelFormat::Rgb565),
            7 => Ok(PixelFormat::Rgba5551),
            8 => Ok(PixelFormat::Rgba4444),
            _ => Err(Error::Unsupported("pixel format")),
        }
    }

    /// The raw format code for untyped clients.
    #[inline]
    pub fn as_raw(self) -> i32 {
        match self {
            PixelFormat::Rgba8888 => 1,
            PixelFormat::Rgbx8888 => 2,
            PixelFormat::Bgra8888 => 3,
            PixelFormat::Bgrx8888 => 4,
            PixelFormat::Rgb888 => 5,
            PixelFormat::Rgb565 => 6,
            PixelFormat::Rgba5551 => 7,
            PixelFormat::Rgba4444 => 8,
        }
    }
}

bitflags! {
    /// How the requested buffer will be used.
    ///
    /// Usage drives backend selection: `HW_FB` requests a page-flippable
    /// framebuffer slot, `HW_RENDER` requests GPU-reserved memory,
    /// `HW_TEXTURE`/`HW_2D` request physically contiguous memory, and no
    /// hardware bits at all yields anonymous shared memory.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Usage: u32 {
        /// Sampled as a texture by the blit/copybit hardware.
        const HW_TEXTURE = 1 << 0;
        /// Target of the 2D blit hardware.
        const HW_2D = 1 << 1;
        /// Render target of the 3D hardware.
        const HW_RENDER = 1 << 2;
        /// Posted directly to the framebuffer via page flipping.
        const HW_FB = 1 << 3;
    }
}

/// Computed geometry for a buffer request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferLayout {
    /// Row stride in pixels.
    pub stride: usize,
    /// Buffer size in bytes, not yet rounded to the page size.
    pub size: usize,
}

/// Compute row stride and byte size for a buffer request.
///
/// Render targets must be aligned to the next multiple of 8 pixels; any
/// other alignment fails in the 3D driver. Everything else rounds the byte
/// row up to 4 bytes and converts back to a pixel stride.
pub fn buffer_layout(
    width: usize,
    height: usize,
    format: PixelFormat,
    usage: Usage,
) -> Result<BufferLayout> {
    if width == 0 || height == 0 {
        return Err(Error::Unsupported("zero-sized buffer"));
    }

    let bpp = format.bytes_per_pixel();
    if usage.contains(Usage::HW_RENDER) {
        const PIXEL_ALIGNMENT: usize = 8;
        let stride = (width + PIXEL_ALIGNMENT - 1) & !(PIXEL_ALIGNMENT - 1);
        Ok(BufferLayout {
            stride,
            size: stride * height * bpp,
        })
    } else {
        const ROW_ALIGNMENT: usize = 4;
        let bytes_per_row = (width * bpp + ROW_ALIGNMENT - 1) & !(ROW_ALIGNMENT - 1);
        Ok(BufferLayout {
            stride: bytes_per_row / bpp,
            size: bytes_per_row * height,
        })
    }
}

/// Round a byte size up to the platform page size.
#[inline]
pub fn round_up_to_page(size: usize) -> usize {
    let page = rustix::param::page_size();
    (size + page - 1) & !(page - 1)
}
