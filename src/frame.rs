//! Frame buffers and the bounded pool they are leased from.
//!
//! The camera driver owns a small fixed number of frame slots (one without
//! PSRAM, two with). Every acquired `FrameBuffer` holds one slot until it is
//! released; a caller that forgets to release starves the sensor.
//!
//! - `FramePool`: fixed-capacity slot accounting.
//! - `FrameBuffer`: one encoded image plus the slot lease backing it.
//! - `FrameSource`: acquire/release contract implemented by camera backends.
//!
//! Release is tied to ownership: dropping a `FrameBuffer` returns its slot, so
//! early returns and `?` paths release exactly once without extra bookkeeping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::FrameError;

/// Frame slots allocated when the board has external PSRAM.
pub const DEFAULT_FRAME_BUFFERS: usize = 2;

// ----------------------------------------------------------------------------
// PixelFormat
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Jpeg,
    Rgb565,
    Grayscale,
}

impl PixelFormat {
    /// Label reported by the camera self-test.
    pub fn label(self) -> &'static str {
        match self {
            PixelFormat::Jpeg => "JPEG",
            _ => "Unknown",
        }
    }
}

// ----------------------------------------------------------------------------
// FramePool: bounded slot accounting
// ----------------------------------------------------------------------------

struct PoolInner {
    capacity: usize,
    outstanding: AtomicUsize,
}

/// Fixed-capacity pool of frame slots.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Reserve one slot, or `None` when every slot is leased out.
    pub fn try_reserve(&self) -> Option<PoolSlot> {
        let capacity = self.inner.capacity;
        self.inner
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .ok()?;
        Some(PoolSlot {
            pool: Arc::clone(&self.inner),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Slots currently leased to callers.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }
}

/// Lease on one pool slot. Dropping it returns the slot.
pub struct PoolSlot {
    pool: Arc<PoolInner>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer
// ----------------------------------------------------------------------------

/// One encoded image from the sensor pipeline.
///
/// Exclusively owned by the caller between acquire and release.
pub struct FrameBuffer {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    slot: Option<PoolSlot>,
}

impl FrameBuffer {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat, slot: PoolSlot) -> Self {
        Self {
            data,
            width,
            height,
            format,
            slot: Some(slot),
        }
    }

    /// Encoded length in bytes. Zero once released.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn is_released(&self) -> bool {
        self.slot.is_none()
    }

    /// Return the backing slot to the pool. A second call is a no-op.
    pub fn release(&mut self) {
        if self.slot.take().is_some() {
            self.data = Vec::new();
        }
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("len", &self.data.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("released", &self.is_released())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// FrameSource: acquire/release contract
// ----------------------------------------------------------------------------

/// Produces frame buffers from a sensor pipeline.
///
/// Callers must not retry `acquire` in a tight loop after `NoBuffer`; the
/// driver needs a pause between attempts.
pub trait FrameSource {
    fn acquire(&mut self) -> Result<FrameBuffer, FrameError>;

    fn release(&mut self, mut frame: FrameBuffer) {
        frame.release();
    }
}
