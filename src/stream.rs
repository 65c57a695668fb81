//! MJPEG streaming over a single output channel.
//!
//! One `StreamService::run` call serves one viewer until its channel closes.
//! Sensor misses are transient: the loop backs off and retries without ever
//! surfacing an error to the viewer.

use std::io::{self, Write};
use std::time::Duration;

use crate::frame::FrameSource;
use crate::transport::pause;

pub const DEFAULT_CHUNK_SIZE: usize = 1024;
pub const DEFAULT_BOUNDARY: &str = "frame";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    /// Payload bytes per write; the final chunk carries the remainder.
    pub chunk_size: usize,
    /// Pause after each delivered frame (~20 fps at 50 ms).
    pub frame_interval: Duration,
    /// Pause after a failed acquire before trying again.
    pub miss_delay: Duration,
    pub boundary: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            frame_interval: Duration::from_millis(50),
            miss_delay: Duration::from_millis(1000),
            boundary: DEFAULT_BOUNDARY.to_string(),
        }
    }
}

/// Output channel for a stream.
pub trait FrameSink {
    /// `false` once the viewer has gone away.
    fn is_connected(&mut self) -> bool;

    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// Sink over any writer; a failed write marks it disconnected.
pub struct WriterSink<W: Write> {
    writer: W,
    connected: bool,
}

impl<W: Write> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            connected: true,
        }
    }
}

impl<W: Write> FrameSink for WriterSink<W> {
    fn is_connected(&mut self) -> bool {
        self.connected
    }

    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let result = self.writer.write_all(bytes);
        if result.is_err() {
            self.connected = false;
        }
        result
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub frames_sent: u64,
    pub misses: u64,
}

pub struct StreamService {
    config: StreamConfig,
}

impl StreamService {
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn content_type(&self) -> String {
        format!(
            "multipart/x-mixed-replace; boundary={}",
            self.config.boundary
        )
    }

    /// Serve frames until the sink disconnects.
    ///
    /// `extra_headers` are appended to the response head (cross-origin set).
    pub fn run<S, K>(
        &self,
        camera: &mut S,
        sink: &mut K,
        extra_headers: &[(&str, &str)],
    ) -> StreamSummary
    where
        S: FrameSource + ?Sized,
        K: FrameSink + ?Sized,
    {
        let mut summary = StreamSummary::default();

        let mut head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\n",
            self.content_type()
        );
        for (name, value) in extra_headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");
        if let Err(err) = sink.send(head.as_bytes()) {
            log::debug!("stream: viewer gone before head: {}", err);
            return summary;
        }
        log::info!("stream: viewer connected");

        while sink.is_connected() {
            let frame = match camera.acquire() {
                Ok(frame) => frame,
                Err(err) => {
                    summary.misses += 1;
                    log::warn!("stream: camera capture failed: {}", err);
                    pause(self.config.miss_delay);
                    continue;
                }
            };

            let sent = if frame.is_empty() {
                Ok(())
            } else {
                self.send_part(sink, frame.bytes())
            };
            let delivered = !frame.is_empty();
            camera.release(frame);

            match sent {
                Ok(()) if delivered => summary.frames_sent += 1,
                Ok(()) => {}
                Err(err) => {
                    log::debug!("stream: write failed: {}", err);
                    break;
                }
            }
            if !sink.is_connected() {
                break;
            }
            pause(self.config.frame_interval);
        }

        log::info!(
            "stream: viewer disconnected after {} frames ({} misses)",
            summary.frames_sent,
            summary.misses
        );
        summary
    }

    fn send_part<K: FrameSink + ?Sized>(&self, sink: &mut K, payload: &[u8]) -> io::Result<()> {
        let header = format!(
            "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            self.config.boundary,
            payload.len()
        );
        sink.send(header.as_bytes())?;
        for chunk in payload.chunks(self.config.chunk_size.max(1)) {
            sink.send(chunk)?;
        }
        sink.send(b"\r\n")
    }
}
