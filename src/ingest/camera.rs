//! Camera frame source.
//!
//! This module provides `CameraSource`, the board's only `FrameSource`.
//!
//! The camera source is responsible for:
//! - Leasing a slot from the bounded frame pool before producing a frame
//! - Producing JPEG-encoded `FrameBuffer` instances
//! - Reporting "no frame ready" as `FrameError::NoBuffer` instead of blocking
//!
//! Backends:
//! - `stub://` URLs render synthetic JPEG frames in-process
//! - `http(s)://` URLs pull snapshots or MJPEG from a networked camera board
//!   (feature: camera-http)

use anyhow::Result;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

#[cfg(feature = "camera-http")]
use super::http::HttpCamera;
use crate::error::FrameError;
use crate::frame::{FrameBuffer, FramePool, FrameSource, PixelFormat, DEFAULT_FRAME_BUFFERS};

/// Configuration for the camera source.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Source URL. `stub://<name>` for synthetic frames, `http(s)://` for a networked camera.
    pub url: String,
    /// Number of frame slots in the pool.
    pub frame_buffers: usize,
    /// Acquisitions answered with `NoBuffer` after connect, simulating sensor warm-up.
    pub warmup_frames: u32,
    /// Frame width (synthetic frames only).
    pub width: u32,
    /// Frame height (synthetic frames only).
    pub height: u32,
    /// JPEG quality 1-100 (synthetic frames only).
    pub jpeg_quality: u8,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera".to_string(),
            frame_buffers: DEFAULT_FRAME_BUFFERS,
            warmup_frames: 0,
            width: 800,
            height: 600,
            jpeg_quality: 80,
        }
    }
}

/// An encoded frame as produced by a backend, before it is bound to a pool slot.
pub(crate) struct EncodedFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Statistics for the camera source.
#[derive(Clone, Debug)]
pub struct CameraStats {
    pub frames_captured: u64,
    pub misses: u64,
    pub url: String,
}

/// Camera frame source backed by a bounded frame pool.
pub struct CameraSource {
    backend: CameraBackend,
    pool: FramePool,
    frames_captured: u64,
    misses: u64,
    url: String,
}

enum CameraBackend {
    Synthetic(SyntheticCamera),
    #[cfg(feature = "camera-http")]
    Http(HttpCamera),
}

impl CameraSource {
    pub fn new(config: CameraConfig) -> Result<Self> {
        if config.frame_buffers == 0 {
            anyhow::bail!("camera needs at least one frame buffer");
        }
        let pool = FramePool::new(config.frame_buffers);
        let url = config.url.clone();
        let backend = if config.url.starts_with("stub://") {
            CameraBackend::Synthetic(SyntheticCamera::new(config))
        } else {
            #[cfg(feature = "camera-http")]
            {
                CameraBackend::Http(HttpCamera::new(config)?)
            }
            #[cfg(not(feature = "camera-http"))]
            {
                anyhow::bail!("camera url '{}' requires the camera-http feature", url)
            }
        };
        Ok(Self {
            backend,
            pool,
            frames_captured: 0,
            misses: 0,
            url,
        })
    }

    /// Bring up the sensor pipeline.
    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            CameraBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "camera-http")]
            CameraBackend::Http(source) => source.connect(),
        }
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    pub fn stats(&self) -> CameraStats {
        CameraStats {
            frames_captured: self.frames_captured,
            misses: self.misses,
            url: self.url.clone(),
        }
    }

    fn next_encoded(&mut self) -> Result<Option<EncodedFrame>> {
        match &mut self.backend {
            CameraBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "camera-http")]
            CameraBackend::Http(source) => source.next_frame(),
        }
    }
}

impl FrameSource for CameraSource {
    fn acquire(&mut self) -> Result<FrameBuffer, FrameError> {
        let Some(slot) = self.pool.try_reserve() else {
            self.misses += 1;
            log::debug!("camera: frame pool exhausted ({} slots)", self.pool.capacity());
            return Err(FrameError::NoBuffer);
        };
        match self.next_encoded() {
            Ok(Some(frame)) => {
                self.frames_captured += 1;
                Ok(FrameBuffer::new(
                    frame.data,
                    frame.width,
                    frame.height,
                    PixelFormat::Jpeg,
                    slot,
                ))
            }
            Ok(None) => {
                self.misses += 1;
                Err(FrameError::NoBuffer)
            }
            Err(err) => {
                self.misses += 1;
                Err(FrameError::Source(err.to_string()))
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

struct SyntheticCamera {
    config: CameraConfig,
    frame_count: u64,
    warmup_remaining: u32,
}

impl SyntheticCamera {
    fn new(config: CameraConfig) -> Self {
        let warmup_remaining = config.warmup_frames;
        Self {
            config,
            frame_count: 0,
            warmup_remaining,
        }
    }

    fn connect(&mut self) -> Result<()> {
        self.warmup_remaining = self.config.warmup_frames;
        log::info!(
            "CameraSource: connected to {} (synthetic {}x{})",
            self.config.url,
            self.config.width,
            self.config.height
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<EncodedFrame>> {
        if self.warmup_remaining > 0 {
            self.warmup_remaining -= 1;
            return Ok(None);
        }
        self.frame_count += 1;

        // Diagonal gradient that drifts one step per frame.
        let shift = (self.frame_count % 256) as u32;
        let image = RgbImage::from_fn(self.config.width, self.config.height, |x, y| {
            Rgb([
                ((x + shift) % 256) as u8,
                ((y + shift) % 256) as u8,
                ((x + y) % 256) as u8,
            ])
        });

        let mut data = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut data, self.config.jpeg_quality);
        encoder.encode_image(&image)?;

        Ok(Some(EncodedFrame {
            data,
            width: self.config.width,
            height: self.config.height,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> CameraConfig {
        CameraConfig {
            url: "stub://test".to_string(),
            frame_buffers: 1,
            warmup_frames: 0,
            width: 32,
            height: 24,
            jpeg_quality: 70,
        }
    }

    #[test]
    fn synthetic_source_produces_jpeg_frames() -> Result<()> {
        let mut source = CameraSource::new(stub_config())?;
        source.connect()?;
        let frame = source.acquire()?;
        assert_eq!(frame.format, PixelFormat::Jpeg);
        assert_eq!((frame.width, frame.height), (32, 24));
        assert_eq!(&frame.bytes()[..2], &[0xFF, 0xD8]);
        source.release(frame);
        assert_eq!(source.stats().frames_captured, 1);
        Ok(())
    }

    #[test]
    fn unreleased_frame_exhausts_single_slot_pool() -> Result<()> {
        let mut source = CameraSource::new(stub_config())?;
        let held = source.acquire()?;
        assert_eq!(source.acquire().unwrap_err(), FrameError::NoBuffer);
        source.release(held);
        assert!(source.acquire().is_ok());
        Ok(())
    }

    #[test]
    fn warmup_reports_no_buffer() -> Result<()> {
        let mut source = CameraSource::new(CameraConfig {
            warmup_frames: 2,
            ..stub_config()
        })?;
        source.connect()?;
        assert_eq!(source.acquire().unwrap_err(), FrameError::NoBuffer);
        assert_eq!(source.acquire().unwrap_err(), FrameError::NoBuffer);
        assert!(source.acquire().is_ok());
        assert_eq!(source.pool().outstanding(), 0);
        assert_eq!(source.stats().misses, 2);
        Ok(())
    }

    #[test]
    fn zero_frame_buffers_rejected() {
        let cfg = CameraConfig {
            frame_buffers: 0,
            ..stub_config()
        };
        assert!(CameraSource::new(cfg).is_err());
    }
}
