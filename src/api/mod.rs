//! HTTP surface of the board.
//!
//! One accept loop on one thread serves one connection at a time, so every
//! card-touching operation is serialized through the same `Device`. A live
//! stream holds that thread until the viewer disconnects or the server stops.

use anyhow::{anyhow, Result};
use serde_json::json;
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::device::Device;
use crate::error::FileError;
use crate::stream::FrameSink;

pub mod multipart;

use multipart::{boundary_from_content_type, MultipartReader};

const MAX_HEADER_BYTES: usize = 8192;
const MAX_FORM_BYTES: usize = 8192;
const MAX_FIELD_BYTES: usize = 1024;
const MAX_DISCARD_BYTES: usize = 64 * 1024;

const CORS_HEADERS: [(&str, &str); 3] = [
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS"),
    ("Access-Control-Allow-Headers", "Content-Type"),
];

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Read timeout for request bodies; a stalled upload is aborted after it.
    pub read_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            read_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    device: Device,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, device: Device) -> Self {
        Self { cfg, device }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg;
        let mut device = self.device;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, &cfg, &mut device, shutdown_thread) {
                log::error!("http api stopped: {}", err);
            }
        });
        log::info!("http api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: &ApiConfig,
    device: &mut Device,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = handle_connection(stream, cfg, device, &shutdown) {
                    log::warn!("request from {} failed: {:#}", peer, err);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Routing
// ----------------------------------------------------------------------------

fn handle_connection(
    mut stream: TcpStream,
    cfg: &ApiConfig,
    device: &mut Device,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(cfg.read_timeout))?;
    stream.set_write_timeout(Some(cfg.read_timeout))?;

    let mut request = read_request(&mut stream)?;
    log::debug!("{} {}", request.method, request.path);

    // Bodies are framed by Content-Length only.
    if let Some(coding) = request.header("transfer-encoding") {
        log::warn!("rejecting {} with transfer-encoding '{}'", request.path, coding);
        write_json_response(
            &mut stream,
            501,
            &json!({"success": false, "error": "Transfer-Encoding not supported; send Content-Length"}),
        )?;
        discard_unread(&mut stream);
        return Ok(());
    }

    if request.method == "OPTIONS" {
        return write_response(&mut stream, 200, "text/plain", b"", &[]);
    }

    let allowed: &[&str] = match request.path.as_str() {
        "/stream" | "/camera_test" | "/files" | "/download" | "/system_info" => &["GET"],
        "/capture" | "/upload" | "/create_folder" | "/sd_reconnect" => &["POST"],
        "/delete" => &["DELETE"],
        _ => {
            return write_json_response(
                &mut stream,
                404,
                &json!({"success": false, "error": "Not found"}),
            )
        }
    };
    if !allowed.contains(&request.method.as_str()) {
        return write_json_response(
            &mut stream,
            405,
            &json!({"success": false, "error": "Method not allowed"}),
        );
    }

    match request.path.as_str() {
        "/stream" => handle_stream(stream, device, shutdown),
        "/capture" => handle_capture(&mut stream, device),
        "/camera_test" => handle_camera_test(&mut stream, device),
        "/files" => handle_files(&mut stream, &request, device),
        "/download" => handle_download(&mut stream, &request, device),
        "/system_info" => {
            let info = device.system_info();
            write_response(&mut stream, 200, "text/plain", info.as_bytes(), &[])
        }
        "/sd_reconnect" => handle_reconnect(&mut stream, device),
        "/upload" => handle_upload(&mut stream, &mut request, device),
        "/delete" => {
            request.merge_form_body(&mut stream)?;
            handle_delete(&mut stream, &request, device)
        }
        "/create_folder" => {
            request.merge_form_body(&mut stream)?;
            handle_create_folder(&mut stream, &request, device)
        }
        _ => Ok(()),
    }
}

fn handle_stream(stream: TcpStream, device: &mut Device, shutdown: &Arc<AtomicBool>) -> Result<()> {
    let mut sink = TcpSink::new(stream, shutdown.clone());
    let summary = device
        .streamer
        .run(&mut device.camera, &mut sink, &CORS_HEADERS);
    log::debug!(
        "stream closed: {} frames, {} misses",
        summary.frames_sent,
        summary.misses
    );
    Ok(())
}

fn handle_capture(stream: &mut TcpStream, device: &mut Device) -> Result<()> {
    match device
        .capture
        .capture(&mut device.camera, &mut device.transport)
    {
        Ok(record) => write_json_response(
            stream,
            200,
            &json!({"success": true, "filename": record.filename, "path": record.path}),
        ),
        Err(err) => write_json_response(
            stream,
            err.http_status(),
            &json!({"success": false, "error": err.to_string()}),
        ),
    }
}

fn handle_camera_test(stream: &mut TcpStream, device: &mut Device) -> Result<()> {
    match device.capture.camera_test(&mut device.camera) {
        Ok(probe) => write_json_response(
            stream,
            200,
            &json!({
                "success": true,
                "width": probe.width,
                "height": probe.height,
                "size": probe.size,
                "format": probe.format,
            }),
        ),
        Err(err) => write_json_response(
            stream,
            err.http_status(),
            &json!({"success": false, "error": err.to_string()}),
        ),
    }
}

fn handle_files(stream: &mut TcpStream, request: &HttpRequest, device: &mut Device) -> Result<()> {
    let path = request.param("path").unwrap_or("/");
    match device.files.list(&mut device.transport, path) {
        Ok(listing) => write_json_response(
            stream,
            200,
            &json!({
                "success": true,
                "path": listing.path,
                "files": listing.files,
                "count": listing.count,
            }),
        ),
        Err(err) => write_file_error(stream, &err),
    }
}

fn handle_download(
    stream: &mut TcpStream,
    request: &HttpRequest,
    device: &mut Device,
) -> Result<()> {
    let Some(file) = request.param("file") else {
        return write_response(stream, 400, "text/plain", b"Missing file parameter", &[]);
    };
    let mut download = match device.files.download(&mut device.transport, file) {
        Ok(download) => download,
        Err(err) => {
            return write_response(
                stream,
                err.http_status(),
                "text/plain",
                err.to_string().as_bytes(),
                &[],
            )
        }
    };
    let disposition = format!("attachment; filename=\"{}\"", download.filename);
    write_head(
        stream,
        200,
        download.content_type,
        Some(download.size),
        &[("Content-Disposition", disposition.as_str())],
    )?;
    let sent = io::copy(&mut download.reader, stream)?;
    if sent != download.size {
        log::warn!(
            "download {} sent {} of {} bytes",
            download.path,
            sent,
            download.size
        );
    }
    Ok(())
}

fn handle_delete(stream: &mut TcpStream, request: &HttpRequest, device: &mut Device) -> Result<()> {
    let Some(file) = request.param("file") else {
        return write_json_response(
            stream,
            400,
            &json!({"success": false, "error": "Missing file parameter"}),
        );
    };
    match device.files.delete(&mut device.transport, file) {
        Ok(()) => write_json_response(
            stream,
            200,
            &json!({"success": true, "message": "File deleted successfully"}),
        ),
        Err(err) => write_file_error(stream, &err),
    }
}

fn handle_create_folder(
    stream: &mut TcpStream,
    request: &HttpRequest,
    device: &mut Device,
) -> Result<()> {
    let (Some(base), Some(name)) = (request.param("path"), request.param("name")) else {
        return write_json_response(
            stream,
            400,
            &json!({"success": false, "error": "Missing parameters"}),
        );
    };
    match device
        .files
        .create_folder(&mut device.transport, base, name)
    {
        Ok(path) => write_json_response(stream, 200, &json!({"success": true, "path": path})),
        Err(err) => write_file_error(stream, &err),
    }
}

fn handle_reconnect(stream: &mut TcpStream, device: &mut Device) -> Result<()> {
    log::info!("manual card reconnect requested");
    if device.transport.force_reinitialize() {
        let mode = device
            .transport
            .active_mode()
            .map(|mode| mode.label())
            .unwrap_or("none");
        write_json_response(
            stream,
            200,
            &json!({
                "success": true,
                "message": "SD card reconnected successfully",
                "mode": mode,
            }),
        )
    } else {
        write_json_response(
            stream,
            500,
            &json!({"success": false, "error": "Failed to reconnect SD card"}),
        )
    }
}

fn handle_upload(
    stream: &mut TcpStream,
    request: &mut HttpRequest,
    device: &mut Device,
) -> Result<()> {
    let boundary = request
        .header("content-type")
        .and_then(boundary_from_content_type);
    let Some(boundary) = boundary else {
        return write_json_response(
            stream,
            400,
            &json!({"success": false, "error": "Expected multipart/form-data"}),
        );
    };

    let mut directory = request.param("path").unwrap_or("/").to_string();
    request.send_continue(stream)?;
    let body = request.take_body(stream.try_clone()?);
    let mut parts = MultipartReader::new(body, &boundary);
    let mut outcome = None;

    let result: io::Result<()> = (|| {
        while let Some(part) = parts.next_part()? {
            match part.filename {
                None => {
                    let value = parts.read_text(MAX_FIELD_BYTES)?;
                    if part.name.as_deref() == Some("path") {
                        directory = value;
                    }
                }
                // One file per request; extra file parts are skipped.
                Some(_) if outcome.is_some() => {}
                Some(filename) => {
                    log::debug!(
                        "upload part {} ({})",
                        filename,
                        part.content_type.as_deref().unwrap_or("no content type")
                    );
                    outcome = Some(upload_part(&mut parts, device, &directory, &filename)?);
                }
            }
        }
        Ok(())
    })();

    if let Err(err) = result {
        if let Some(path) = device.files.upload_abort() {
            log::warn!("upload of {} aborted: {}", path, err);
        }
        return write_json_response(
            stream,
            400,
            &json!({"success": false, "error": format!("Upload aborted: {}", err)}),
        );
    }

    match outcome {
        None => write_json_response(
            stream,
            400,
            &json!({"success": false, "error": "Missing file part"}),
        ),
        Some(Ok(report)) => write_json_response(
            stream,
            200,
            &json!({
                "success": true,
                "message": "File uploaded successfully",
                "path": report.path,
                "size": report.bytes,
                "sha256": report.sha256,
            }),
        ),
        Some(Err(err)) => write_file_error(stream, &err),
    }
}

/// Feed one file part through the upload session.
///
/// The outer `io::Result` is a broken request body; the inner result is the
/// upload's own outcome.
fn upload_part<R: Read>(
    parts: &mut MultipartReader<R>,
    device: &mut Device,
    directory: &str,
    filename: &str,
) -> io::Result<Result<crate::files::UploadReport, FileError>> {
    if let Err(err) = device
        .files
        .upload_start(&mut device.transport, directory, filename)
    {
        while parts.next_chunk()?.is_some() {}
        return Ok(Err(err));
    }
    let mut total = 0u64;
    while let Some(chunk) = parts.next_chunk()? {
        total += chunk.len() as u64;
        device.files.upload_chunk(&chunk);
    }
    Ok(device.files.upload_end(&mut device.transport, total))
}

fn write_file_error(stream: &mut TcpStream, err: &FileError) -> Result<()> {
    write_json_response(
        stream,
        err.http_status(),
        &json!({"success": false, "error": err.to_string()}),
    )
}

// ----------------------------------------------------------------------------
// Stream sink
// ----------------------------------------------------------------------------

/// Viewer connection; disconnects on peer close, write error or shutdown.
struct TcpSink {
    stream: TcpStream,
    shutdown: Arc<AtomicBool>,
    connected: bool,
}

impl TcpSink {
    fn new(stream: TcpStream, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            stream,
            shutdown,
            connected: true,
        }
    }

    fn peer_closed(&self) -> bool {
        if self.stream.set_nonblocking(true).is_err() {
            return true;
        }
        let mut probe = [0u8; 1];
        let closed = match self.stream.peek(&mut probe) {
            Ok(0) => true,
            Ok(_) => false,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        };
        closed || self.stream.set_nonblocking(false).is_err()
    }
}

impl FrameSink for TcpSink {
    fn is_connected(&mut self) -> bool {
        if self.shutdown.load(Ordering::SeqCst) || self.peer_closed() {
            self.connected = false;
        }
        self.connected
    }

    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let result = self.stream.write_all(bytes);
        if result.is_err() {
            self.connected = false;
        }
        result
    }
}

// ----------------------------------------------------------------------------
// Request parsing
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    params: HashMap<String, String>,
    headers: HashMap<String, String>,
    /// Body bytes that arrived together with the headers.
    body_prefix: Vec<u8>,
}

impl HttpRequest {
    fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.trim().parse().ok()
    }

    /// The request body; without a Content-Length it runs to end of stream.
    fn take_body<R: Read>(&mut self, rest: R) -> impl Read {
        let prefix = std::mem::take(&mut self.body_prefix);
        let remaining = match self.content_length() {
            Some(len) => len.saturating_sub(prefix.len() as u64),
            None => u64::MAX,
        };
        let limit = self.content_length().unwrap_or(u64::MAX);
        Cursor::new(prefix).chain(rest.take(remaining)).take(limit)
    }

    /// Interim reply for clients that wait before sending the body.
    fn send_continue(&self, stream: &mut TcpStream) -> Result<()> {
        let expects = self
            .header("expect")
            .map(|value| value.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false);
        if expects && self.body_prefix.is_empty() {
            stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
        }
        Ok(())
    }

    /// Add url-encoded form fields from the body; query values win.
    fn merge_form_body(&mut self, stream: &mut TcpStream) -> Result<()> {
        let is_form = self
            .header("content-type")
            .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);
        let Some(len) = self.content_length() else {
            return Ok(());
        };
        if !is_form || len == 0 {
            return Ok(());
        }
        if len as usize > MAX_FORM_BYTES {
            return Err(anyhow!("form body too large"));
        }
        self.send_continue(stream)?;
        let mut body = Vec::new();
        self.take_body(stream.try_clone()?)
            .read_to_end(&mut body)?;
        for (key, value) in url::form_urlencoded::parse(&body) {
            self.params
                .entry(key.into_owned())
                .or_insert_with(|| value.into_owned());
        }
        Ok(())
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
    };
    let body_prefix = data[header_end + 4..].to_vec();
    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    };
    let params = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    Ok(HttpRequest {
        method: method.to_uppercase(),
        path: path.to_string(),
        params,
        headers,
        body_prefix,
    })
}

// ----------------------------------------------------------------------------
// Responses
// ----------------------------------------------------------------------------

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        501 => "HTTP/1.1 501 Not Implemented",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

/// Read and drop what the client is still sending so closing does not reset
/// the connection before the response is read.
fn discard_unread(stream: &mut TcpStream) {
    let _ = stream.shutdown(Shutdown::Write);
    if stream
        .set_read_timeout(Some(Duration::from_millis(200)))
        .is_err()
    {
        return;
    }
    let mut sink = [0u8; 1024];
    let mut left = MAX_DISCARD_BYTES;
    while left > 0 {
        match stream.read(&mut sink) {
            Ok(0) | Err(_) => break,
            Ok(n) => left = left.saturating_sub(n),
        }
    }
}

fn write_head(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    content_length: Option<u64>,
    extra: &[(&str, &str)],
) -> Result<()> {
    let mut head = format!(
        "{}\r\nContent-Type: {}\r\nConnection: close\r\n",
        status_line(status),
        content_type
    );
    if let Some(len) = content_length {
        head.push_str(&format!("Content-Length: {}\r\n", len));
    }
    for (name, value) in CORS_HEADERS.iter().chain(extra.iter()) {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes())?;
    Ok(())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
    extra: &[(&str, &str)],
) -> Result<()> {
    write_head(stream, status, content_type, Some(body.len() as u64), extra)?;
    stream.write_all(body)?;
    Ok(())
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &serde_json::Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload, &[])
}
