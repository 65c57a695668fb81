//! The board: camera, card transport and the services built on them.
//!
//! A `Device` is owned by exactly one request context; every operation that
//! touches the transport goes through `&mut Device`, which is how the
//! single-caller rule for `TransportState` is enforced.

use anyhow::{Context, Result};

use crate::capture::CaptureService;
use crate::config::{SdcamConfig, MEMORY_CARD_ROOT};
use crate::files::FileManager;
use crate::ingest::CameraSource;
use crate::stream::StreamService;
use crate::transport::{
    CardInterface, DirCard, MemCard, MemMedium, StorageTransport, TransportMode,
};

pub struct Device {
    pub camera: CameraSource,
    pub transport: StorageTransport,
    pub capture: CaptureService,
    pub streamer: StreamService,
    pub files: FileManager,
}

impl Device {
    pub fn new(
        camera: CameraSource,
        transport: StorageTransport,
        capture: CaptureService,
        streamer: StreamService,
    ) -> Self {
        Self {
            camera,
            transport,
            capture,
            streamer,
            files: FileManager::new(),
        }
    }

    /// Build the board from configuration and connect the camera.
    ///
    /// The card is not touched here; callers decide when to initialize it.
    pub fn from_config(cfg: &SdcamConfig) -> Result<Self> {
        let mut camera = CameraSource::new(cfg.camera.clone()).context("create camera source")?;
        camera.connect().context("connect camera")?;

        let (bus, serial): (Box<dyn CardInterface>, Box<dyn CardInterface>) =
            if cfg.uses_memory_card() {
                log::warn!(
                    "card roots set to {}: using volatile in-memory card",
                    MEMORY_CARD_ROOT
                );
                let medium = MemMedium::new();
                (
                    Box::new(MemCard::new(TransportMode::Bus, medium.clone())),
                    Box::new(MemCard::new(TransportMode::Serial, medium)),
                )
            } else {
                (
                    Box::new(DirCard::bus(&cfg.card.bus_root, cfg.card.bus_pins)),
                    Box::new(DirCard::serial(&cfg.card.serial_root, cfg.card.serial_pins)),
                )
            };
        let transport = StorageTransport::new(bus, serial, cfg.policy);

        Ok(Self::new(
            camera,
            transport,
            CaptureService::new(cfg.capture.clone()),
            StreamService::new(cfg.stream.clone()),
        ))
    }

    /// Plain-text status report.
    pub fn system_info(&mut self) -> String {
        let stats = self.camera.stats();
        let mut info = String::from("SD Camera System\n");
        info.push_str(&format!("Camera: {}\n", stats.url));
        info.push_str(&format!("Frames Captured: {}\n", stats.frames_captured));
        info.push_str(&format!("Frame Misses: {}\n", stats.misses));
        info.push_str("SD Card: ");
        match self.transport.active_mode() {
            Some(mode) if self.transport.health_check() => {
                // The check may have recovered into the other mode.
                let mode = self.transport.active_mode().unwrap_or(mode);
                info.push_str(&format!("Available ({} mode)\n", mode));
                if let Some(card) = self.transport.card_info() {
                    info.push_str(&format!("SD Card Size: {} MB\n", card.total_mb()));
                    info.push_str(&format!("SD Card Used: {} MB\n", card.used_mb()));
                }
            }
            _ => info.push_str("Not Available\n"),
        }
        info
    }
}
