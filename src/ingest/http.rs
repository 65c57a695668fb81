//! Networked camera backend.
//!
//! Pulls JPEG frames from a camera board over HTTP, either from an MJPEG
//! `multipart/x-mixed-replace` stream or one snapshot per request.
//!
//! The HTTP backend MUST NOT:
//! - Decode more than needed to learn frame dimensions
//! - Retain frames beyond handoff to the frame pool

use anyhow::{anyhow, Context, Result};
use std::io::{Cursor, Read};

use url::Url;

use super::camera::{CameraConfig, EncodedFrame};

/// Upper bound for one frame; larger spans are treated as stream corruption.
const MAX_JPEG_BYTES: usize = 4 * 1024 * 1024;

pub(crate) struct HttpCamera {
    config: CameraConfig,
    feed: Option<Feed>,
}

enum Feed {
    Mjpeg(MjpegStream),
    Snapshot,
}

impl HttpCamera {
    pub(crate) fn new(config: CameraConfig) -> Result<Self> {
        let url = Url::parse(&config.url).context("parse camera url")?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported camera scheme '{}'; expected http(s) or stub",
                    other
                ))
            }
        }
        Ok(Self {
            config,
            feed: None,
        })
    }

    pub(crate) fn connect(&mut self) -> Result<()> {
        let response = ureq::get(&self.config.url)
            .call()
            .with_context(|| format!("connect to camera at {}", self.config.url))?;
        let is_multipart = response
            .header("Content-Type")
            .map(|ct| ct.to_ascii_lowercase().starts_with("multipart/"))
            .unwrap_or(false);
        self.feed = Some(if is_multipart {
            Feed::Mjpeg(MjpegStream::new(response.into_reader()))
        } else {
            Feed::Snapshot
        });
        log::info!("CameraSource: connected to {}", self.config.url);
        Ok(())
    }

    /// Next frame, or `Ok(None)` while the remote camera is unreachable.
    pub(crate) fn next_frame(&mut self) -> Result<Option<EncodedFrame>> {
        if self.feed.is_none() {
            if let Err(err) = self.connect() {
                log::debug!("camera reconnect failed: {:#}", err);
                return Ok(None);
            }
        }
        let fetched = match self.feed.as_mut() {
            Some(Feed::Mjpeg(stream)) => stream.read_next_jpeg(),
            Some(Feed::Snapshot) => fetch_single_jpeg(&self.config.url),
            None => return Ok(None),
        };
        // A broken feed is dropped so the next acquire reconnects.
        let data = fetched.inspect_err(|_| self.feed = None)?;
        let (width, height) = jpeg_dimensions(&data)?;
        Ok(Some(EncodedFrame {
            data,
            width,
            height,
        }))
    }
}

/// Splits a multipart MJPEG body into JPEG payloads by marker scanning.
///
/// Part headers are skipped implicitly: everything outside an SOI..EOI span
/// is discarded.
struct MjpegStream {
    reader: Box<dyn Read + Send>,
    pending: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            pending: Vec::new(),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut scratch = [0u8; 16 * 1024];
        loop {
            if let Some((soi, eoi)) = find_jpeg_bounds(&self.pending) {
                let jpeg: Vec<u8> = self.pending.drain(..eoi).skip(soi).collect();
                return Ok(jpeg);
            }
            if self.pending.len() > MAX_JPEG_BYTES {
                // Oversized or corrupt frame: resynchronize on the next SOI.
                log::warn!("mjpeg frame exceeded {} bytes; resyncing", MAX_JPEG_BYTES);
                let tail = self.pending.len() - 1;
                self.pending.drain(..tail);
            }
            let n = self
                .reader
                .read(&mut scratch)
                .context("read camera stream")?;
            if n == 0 {
                return Err(anyhow!("camera stream closed by peer"));
            }
            self.pending.extend_from_slice(&scratch[..n]);
        }
    }
}

fn fetch_single_jpeg(url: &str) -> Result<Vec<u8>> {
    let mut snapshot = Vec::new();
    ureq::get(url)
        .call()
        .with_context(|| format!("request snapshot from {}", url))?
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut snapshot)
        .context("read snapshot body")?;
    if snapshot.is_empty() {
        return Err(anyhow!("camera returned an empty snapshot"));
    }
    Ok(snapshot)
}

/// Frame size from the JPEG header; pixel data is not decoded.
fn jpeg_dimensions(bytes: &[u8]) -> Result<(u32, u32)> {
    image::ImageReader::with_format(Cursor::new(bytes), image::ImageFormat::Jpeg)
        .into_dimensions()
        .context("read jpeg header")
}

/// First complete SOI..EOI span as `(soi, end_exclusive)`.
fn find_jpeg_bounds(buf: &[u8]) -> Option<(usize, usize)> {
    let soi = buf.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let eoi = soi + 2 + buf[soi + 2..].windows(2).position(|w| w == [0xFF, 0xD9])?;
    Some((soi, eoi + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::{Rgb, RgbImage};

    #[test]
    fn dimensions_come_from_jpeg_header() {
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, 80)
            .encode_image(&RgbImage::from_pixel(40, 30, Rgb([10, 20, 30])))
            .unwrap();
        assert_eq!(jpeg_dimensions(&jpeg).unwrap(), (40, 30));
        assert!(jpeg_dimensions(&jpeg[..4]).is_err());
    }

    #[test]
    fn finds_jpeg_between_markers() {
        let buffer = [0x00, 0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9, 0x03];
        assert_eq!(find_jpeg_bounds(&buffer), Some((1, 7)));
    }

    #[test]
    fn incomplete_jpeg_is_not_found() {
        let buffer = [0xFF, 0xD8, 0x01, 0x02];
        assert_eq!(find_jpeg_bounds(&buffer), None);
    }

    #[test]
    fn rejects_non_http_scheme() {
        let cfg = CameraConfig {
            url: "udp://127.0.0.1:5000".to_string(),
            ..CameraConfig::default()
        };
        assert!(HttpCamera::new(cfg).is_err());
    }
}
