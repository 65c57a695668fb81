//! SD camera board
//!
//! This crate runs a camera board that streams live MJPEG, captures frames to
//! an attached SD card, and exposes the card's files over HTTP.
//!
//! # Architecture
//!
//! The card is the only component with real failure modes, so everything
//! that touches it goes through one `StorageTransport`:
//!
//! 1. **Dual-mode access**: SD/MMC bus first, SPI as fallback, never both mounted.
//! 2. **Verified mounts**: a mount counts only once `/` opens as a directory.
//! 3. **Throttled health**: at most one physical probe per health interval;
//!    a failed probe triggers a full re-initialization.
//! 4. **Explicit recovery**: file primitives never initialize on their own.
//! 5. **Frame leases**: every acquired frame returns its pool slot exactly once.
//!
//! # Module Structure
//!
//! - `transport`: card interfaces, the transport state machine
//! - `frame`: frame buffers, the bounded pool, the `FrameSource` contract
//! - `ingest`: camera backends
//! - `capture`, `stream`, `files`: services built on the above
//! - `device`, `api`, `config`: wiring for the `sdcamd` daemon

pub mod api;
pub mod capture;
pub mod config;
pub mod device;
pub mod error;
pub mod files;
pub mod frame;
pub mod ingest;
pub mod stream;
pub mod transport;

pub use capture::{CaptureConfig, CaptureRecord, CaptureService, FrameProbe};
pub use config::SdcamConfig;
pub use device::Device;
pub use error::{CaptureError, ErrorKind, FileError, FrameError};
pub use files::{Download, FileManager, Listing, StoredFile, UploadReport, UploadState};
pub use frame::{FrameBuffer, FramePool, FrameSource, PixelFormat};
pub use ingest::{CameraConfig, CameraSource};
pub use stream::{FrameSink, StreamConfig, StreamService, StreamSummary, WriterSink};
pub use transport::{
    CardInterface, DirCard, MemCard, MemFaults, MemMedium, StorageTransport, TransportMode,
    TransportPolicy, TransportState,
};
