//! Camera ingestion.
//!
//! This module provides the frame sources the board can run with:
//! - Synthetic JPEG frames (`stub://`, bring-up and tests)
//! - Networked camera boards over HTTP (feature: camera-http)
//!
//! All sources hand out `FrameBuffer`s leased from a bounded pool. The
//! ingestion layer MUST NOT:
//! - Block waiting for a frame (report `NoBuffer` instead)
//! - Log frame payloads

pub mod camera;
#[cfg(feature = "camera-http")]
mod http;

pub use camera::{CameraConfig, CameraSource, CameraStats};
