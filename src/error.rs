//! Error types for pigment.

use thiserror::Error;

/// Result type alias using pigment's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for allocator operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Unsupported pixel format or invalid argument. Fatal to the call.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// A backend ran out of memory and no fallback remained.
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    /// A device backend failed to initialize. The failure is sticky: the
    /// arena is never re-probed within this process's lifetime.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(rustix::io::Errno),

    /// A handle failed the magic/count validation check.
    #[error("invalid buffer handle")]
    InvalidHandle,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Whether this error marks a backend as permanently unavailable.
    ///
    /// Sticky failures downgrade future requests to a fallback backend
    /// instead of re-probing the device.
    #[inline]
    pub fn is_sticky(&self) -> bool {
        matches!(self, Error::DeviceUnavailable(_))
    }
}
