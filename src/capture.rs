//! Capture service: one frame from the camera, persisted as one file.
//!
//! Every step is a hard gate. The frame is released on every path out of
//! `capture`, including the storage-unavailable and short-write paths.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::CaptureError;
use crate::frame::FrameSource;
use crate::transport::StorageTransport;

pub const DEFAULT_CAPTURE_PREFIX: &str = "CAPTURE";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Filename prefix; files are named `<prefix>_<millis>.jpg`.
    pub prefix: String,
    /// Card directory captures are written into.
    pub directory: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_CAPTURE_PREFIX.to_string(),
            directory: "/".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CaptureRecord {
    pub filename: String,
    pub path: String,
    #[serde(skip)]
    pub bytes: usize,
}

/// Camera self-test result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FrameProbe {
    pub width: u32,
    pub height: u32,
    pub size: usize,
    pub format: &'static str,
}

pub struct CaptureService {
    config: CaptureConfig,
}

impl CaptureService {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn capture<S: FrameSource + ?Sized>(
        &self,
        camera: &mut S,
        transport: &mut StorageTransport,
    ) -> Result<CaptureRecord, CaptureError> {
        let frame = match camera.acquire() {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("capture: camera acquire failed: {}", err);
                return Err(CaptureError::CameraUnavailable);
            }
        };

        if !transport.ensure_healthy() {
            camera.release(frame);
            return Err(CaptureError::StorageUnavailable);
        }

        let filename = format!("{}_{}.jpg", self.config.prefix, epoch_millis());
        let path = join_path(&self.config.directory, &filename);
        let expected = frame.len();
        let written = transport.write_file(&path, frame.bytes());
        camera.release(frame);

        if written != expected {
            log::error!(
                "capture: short write to {} ({}/{} bytes)",
                path,
                written,
                expected
            );
            return Err(CaptureError::WriteIncomplete {
                path,
                written,
                expected,
            });
        }

        log::info!("capture: saved {} ({} bytes)", path, written);
        Ok(CaptureRecord {
            filename,
            path,
            bytes: written,
        })
    }

    /// Grab one frame and report its shape without storing it.
    pub fn camera_test<S: FrameSource + ?Sized>(
        &self,
        camera: &mut S,
    ) -> Result<FrameProbe, CaptureError> {
        let frame = camera.acquire().map_err(|err| {
            log::warn!("camera test: acquire failed: {}", err);
            CaptureError::CameraUnavailable
        })?;
        let probe = FrameProbe {
            width: frame.width,
            height: frame.height,
            size: frame.len(),
            format: frame.format.label(),
        };
        camera.release(frame);
        Ok(probe)
    }
}

fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0)
}

fn join_path(directory: &str, name: &str) -> String {
    let directory = directory.trim_end_matches('/');
    if directory.is_empty() {
        format!("/{}", name)
    } else if directory.starts_with('/') {
        format!("{}/{}", directory, name)
    } else {
        format!("/{}/{}", directory, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FrameError;
    use crate::frame::{FrameBuffer, FramePool, PixelFormat};
    use crate::transport::{MemCard, MemMedium, TransportMode, TransportPolicy};

    struct FixedCamera {
        pool: FramePool,
        payload: Vec<u8>,
    }

    impl FrameSource for FixedCamera {
        fn acquire(&mut self) -> Result<FrameBuffer, FrameError> {
            let slot = self.pool.try_reserve().ok_or(FrameError::NoBuffer)?;
            Ok(FrameBuffer::new(
                self.payload.clone(),
                4,
                3,
                PixelFormat::Jpeg,
                slot,
            ))
        }
    }

    fn camera() -> FixedCamera {
        FixedCamera {
            pool: FramePool::new(1),
            payload: vec![0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9],
        }
    }

    fn transport(medium: &MemMedium) -> (StorageTransport, crate::transport::MemFaults) {
        let bus = MemCard::new(TransportMode::Bus, medium.clone());
        let faults = bus.faults();
        let serial = MemCard::new(TransportMode::Serial, medium.clone());
        (
            StorageTransport::new(
                Box::new(bus),
                Box::new(serial),
                TransportPolicy::default().without_delays(),
            ),
            faults,
        )
    }

    #[test]
    fn join_path_uses_single_separator() {
        assert_eq!(join_path("/", "a.jpg"), "/a.jpg");
        assert_eq!(join_path("/photos/", "a.jpg"), "/photos/a.jpg");
        assert_eq!(join_path("photos", "a.jpg"), "/photos/a.jpg");
    }

    #[test]
    fn capture_writes_frame_and_releases_slot() {
        let medium = MemMedium::new();
        let (mut transport, _) = transport(&medium);
        let mut cam = camera();
        let service = CaptureService::new(CaptureConfig::default());
        let record = service.capture(&mut cam, &mut transport).unwrap();
        assert!(record.filename.starts_with("CAPTURE_"));
        assert_eq!(record.path, format!("/{}", record.filename));
        assert_eq!(medium.file(&record.path).unwrap(), cam.payload);
        assert_eq!(cam.pool.outstanding(), 0);
    }

    #[test]
    fn absent_card_releases_frame() {
        let medium = MemMedium::new();
        medium.set_present(false);
        let (mut transport, _) = transport(&medium);
        let mut cam = camera();
        let service = CaptureService::new(CaptureConfig::default());
        let err = service.capture(&mut cam, &mut transport).unwrap_err();
        assert_eq!(err, CaptureError::StorageUnavailable);
        assert_eq!(cam.pool.outstanding(), 0);
    }

    #[test]
    fn short_write_is_reported() {
        let medium = MemMedium::new();
        let (mut transport, faults) = transport(&medium);
        faults.limit_writes(Some(3));
        let mut cam = camera();
        let service = CaptureService::new(CaptureConfig::default());
        match service.capture(&mut cam, &mut transport) {
            Err(CaptureError::WriteIncomplete {
                written, expected, ..
            }) => {
                assert_eq!(written, 3);
                assert_eq!(expected, 7);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(cam.pool.outstanding(), 0);
    }

    #[test]
    fn camera_test_reports_shape() {
        let mut cam = camera();
        let service = CaptureService::new(CaptureConfig::default());
        let probe = service.camera_test(&mut cam).unwrap();
        assert_eq!(
            probe,
            FrameProbe {
                width: 4,
                height: 3,
                size: 7,
                format: "JPEG"
            }
        );
    }
}
