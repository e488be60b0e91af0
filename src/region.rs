//! Best-fit region allocator for a fixed linear byte range.
//!
//! Each physical memory arena is carved up by one `RegionAllocator`. The
//! allocator tracks an ordered list of chunks covering the whole range;
//! allocation picks the smallest free chunk that fits and splits off the
//! remainder, deallocation re-merges neighbours so free space never
//! fragments into adjacent entries.
//!
//! Callers round sizes up to the page size before they get here. Failure
//! is a `None` offset, not an error: arena exhaustion is a recoverable
//! condition the decision engine answers with fallback or retry.

use std::sync::Mutex;

/// One contiguous chunk of the managed range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Chunk {
    offset: usize,
    size: usize,
    free: bool,
}

#[derive(Debug)]
struct Inner {
    /// Chunks sorted by offset, contiguous, covering `[0, size)`.
    chunks: Vec<Chunk>,
    size: usize,
    /// Set once the first allocation has been attempted; `set_size` is
    /// refused from then on.
    touched: bool,
}

/// Best-fit free-list allocator over `[0, size)`.
///
/// Internally synchronized: concurrent `allocate`/`deallocate` calls from
/// multiple threads are safe and serialize on the chunk list.
#[derive(Debug)]
pub struct RegionAllocator {
    inner: Mutex<Inner>,
}

impl RegionAllocator {
    /// Create an allocator whose capacity is not yet known.
    ///
    /// All allocations fail until [`set_size`](Self::set_size) is called.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create an allocator managing `size` bytes.
    pub fn with_capacity(size: usize) -> Self {
        let chunks = if size > 0 {
            vec![Chunk {
                offset: 0,
                size,
                free: true,
            }]
        } else {
            Vec::new()
        };
        Self {
            inner: Mutex::new(Inner {
                chunks,
                size,
                touched: false,
            }),
        }
    }

    /// Set the managed size, once, before the first allocation.
    ///
    /// Calls after the capacity is already set or after any allocation
    /// attempt are ignored.
    pub fn set_size(&self, size: usize) {
        let mut inner = self.inner.lock().unwrap();
        if inner.size != 0 || inner.touched || size == 0 {
            return;
        }
        inner.size = size;
        inner.chunks = vec![Chunk {
            offset: 0,
            size,
            free: true,
        }];
    }

    /// The total number of bytes managed.
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().size
    }

    /// Number of free bytes remaining.
    pub fn free_bytes(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .chunks
            .iter()
            .filter(|c| c.free)
            .map(|c| c.size)
            .sum()
    }

    /// Allocate `size` bytes, returning the offset of the reservation.
    ///
    /// Best-fit: the smallest free chunk of at least `size` bytes wins,
    /// ties broken by lowest offset. Returns `None` when no free chunk is
    /// large enough.
    pub fn allocate(&self, size: usize) -> Option<usize> {
        let mut inner = self.inner.lock().unwrap();
        inner.touched = true;
        if size == 0 {
            return None;
        }

        let mut best: Option<usize> = None;
        for (idx, chunk) in inner.chunks.iter().enumerate() {
            if !chunk.free || chunk.size < size {
                continue;
            }
            match best {
                Some(b) if inner.chunks[b].size <= chunk.size => {}
                _ => best = Some(idx),
            }
        }

        let idx = best?;
        let chunk = inner.chunks[idx];
        inner.chunks[idx].free = false;
        if chunk.size > size {
            inner.chunks[idx].size = size;
            inner.chunks.insert(
                idx + 1,
                Chunk {
                    offset: chunk.offset + size,
                    size: chunk.size - size,
                    free: true,
                },
            );
        }
        Some(chunk.offset)
    }

    /// Release the reservation starting at `offset`.
    ///
    /// The chunk is marked free and merged with an immediately preceding
    /// and/or following free chunk. Offsets that do not name a live
    /// reservation are ignored.
    pub fn deallocate(&self, offset: usize) {
        let mut inner = self.inner.lock().unwrap();
        let Some(idx) = inner
            .chunks
            .iter()
            .position(|c| c.offset == offset && !c.free)
        else {
            return;
        };

        inner.chunks[idx].free = true;

        // Merge with the following free chunk first so indices stay valid.
        if idx + 1 < inner.chunks.len() && inner.chunks[idx + 1].free {
            inner.chunks[idx].size += inner.chunks[idx + 1].size;
            inner.chunks.remove(idx + 1);
        }
        if idx > 0 && inner.chunks[idx - 1].free {
            inner.chunks[idx - 1].size += inner.chunks[idx].size;
            inner.chunks.remove(idx);
        }
    }

    #[cfg(test)]
    fn chunk_snapshot(&self) -> Vec<(usize, usize, bool)> {
        self.inner
            .lock()
            .unwrap()
            .chunks
            .iter()
            .map(|c| (c.offset, c.size, c.free))
            .collect()
    }
}

impl Default for RegionAllocator {
    fn default() -> Self {
        Self::new()
    }
}
