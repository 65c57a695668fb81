//! Chunked upload session.
//!
//! An upload arrives as three kinds of calls: start, any number of chunks,
//! then end (or abort when the body is cut short). One session slot exists;
//! a second start while it is occupied is refused with `ConflictingUpload`.
//!
//! Failures inside the session are sticky: once errored, later chunks are
//! dropped and end reports the failure. Bytes already on the card stay there.
//!
//! After end or abort the slot is free again, and `upload_state` reports how
//! the last session finished (`Closed` or `Errored`) until the next start.

use std::io::{Read, Write};

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::{normalize_path, FileManager};
use crate::error::FileError;
use crate::transport::{pause, write_fully, StorageTransport};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum UploadState {
    Idle,
    Writing,
    Closed,
    Errored,
}

/// Outcome of a verified upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    pub path: String,
    pub bytes: u64,
    pub sha256: String,
}

pub(crate) struct UploadSession {
    path: String,
    writer: Option<Box<dyn Write + Send>>,
    bytes_written: u64,
    hasher: Sha256,
    state: UploadState,
    error: Option<String>,
}

impl UploadSession {
    fn new(path: String) -> Self {
        Self {
            path,
            writer: None,
            bytes_written: 0,
            hasher: Sha256::new(),
            state: UploadState::Writing,
            error: None,
        }
    }

    fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        log::warn!("upload {}: {}", self.path, reason);
        self.state = UploadState::Errored;
        self.error.get_or_insert(reason);
        self.writer = None;
    }
}

/// Destination for `filename` uploaded into `directory`.
///
/// Anything up to the last `/` or `\` in the filename is dropped.
fn destination(directory: &str, filename: &str) -> Option<String> {
    let clean = match filename.rfind(['/', '\\']) {
        Some(idx) => &filename[idx + 1..],
        None => filename,
    };
    if clean.is_empty() || clean == "." || clean == ".." {
        return None;
    }
    let mut directory = normalize_path(directory);
    if !directory.ends_with('/') {
        directory.push('/');
    }
    Some(format!("{}{}", directory, clean))
}

impl FileManager {
    pub fn upload_state(&self) -> UploadState {
        match &self.upload {
            Some(session) => session.state,
            None => self.last_upload.unwrap_or(UploadState::Idle),
        }
    }

    /// Path of the session in progress, if any.
    pub fn upload_path(&self) -> Option<&str> {
        self.upload.as_ref().map(|session| session.path.as_str())
    }

    /// Open the session.
    ///
    /// Card trouble does not fail the call; it leaves the session errored and
    /// is reported at `upload_end`.
    pub fn upload_start(
        &mut self,
        transport: &mut StorageTransport,
        directory: &str,
        filename: &str,
    ) -> Result<UploadState, FileError> {
        if let Some(active) = &self.upload {
            return Err(FileError::ConflictingUpload {
                active_path: active.path.clone(),
            });
        }

        self.last_upload = None;
        let path = destination(directory, filename);
        let mut session = UploadSession::new(path.clone().unwrap_or_else(|| {
            format!("{}/{}", normalize_path(directory).trim_end_matches('/'), filename)
        }));
        log::info!("upload: starting {}", session.path);

        if !transport.ensure_healthy() {
            session.fail("SD Card not available");
        } else if path.is_none() {
            session.fail("invalid filename");
        } else {
            let attempts = transport.policy().attempts.max(1);
            let retry_delay = transport.policy().open_retry_delay;
            for attempt in 1..=attempts {
                if let Some(writer) = transport.open_write(&session.path) {
                    session.writer = Some(writer);
                    break;
                }
                if attempt < attempts {
                    log::warn!(
                        "upload: failed to create {}, retrying ({} left)",
                        session.path,
                        attempts - attempt
                    );
                    pause(retry_delay);
                    if !transport.health_check() {
                        transport.force_reinitialize();
                    }
                }
            }
            if session.writer.is_none() {
                session.fail("failed to create upload file");
            }
        }

        let state = session.state;
        self.upload = Some(session);
        Ok(state)
    }

    /// Append one chunk. Dropped silently when there is no open handle.
    pub fn upload_chunk(&mut self, data: &[u8]) -> UploadState {
        let Some(session) = self.upload.as_mut() else {
            return UploadState::Idle;
        };
        if session.state != UploadState::Writing {
            return session.state;
        }
        let Some(writer) = session.writer.as_mut() else {
            return session.state;
        };
        let written = write_fully(writer.as_mut(), data);
        session.hasher.update(&data[..written]);
        session.bytes_written += written as u64;
        if written != data.len() {
            session.fail(format!("write error: {}/{} bytes", written, data.len()));
        }
        session.state
    }

    /// Close the session and verify what landed on the card.
    ///
    /// `declared_total` is the upload size as counted by the request layer.
    pub fn upload_end(
        &mut self,
        transport: &mut StorageTransport,
        declared_total: u64,
    ) -> Result<UploadReport, FileError> {
        let Some(mut session) = self.upload.take() else {
            return Err(FileError::UploadFailed {
                path: String::new(),
                reason: "no upload in progress".to_string(),
            });
        };

        if let Some(mut writer) = session.writer.take() {
            if let Err(err) = writer.flush() {
                session.fail(format!("flush failed: {}", err));
            }
        } else if session.state == UploadState::Writing {
            session.fail("no file handle");
        }

        if session.state == UploadState::Writing {
            let digest = hex::encode(session.hasher.clone().finalize());
            match verify(transport, &session.path, declared_total, &digest) {
                Ok(()) if session.bytes_written == declared_total => {
                    self.last_upload = Some(UploadState::Closed);
                    log::info!(
                        "upload: {} complete ({} bytes, sha256 {})",
                        session.path,
                        declared_total,
                        digest
                    );
                    return Ok(UploadReport {
                        path: session.path,
                        bytes: declared_total,
                        sha256: digest,
                    });
                }
                Ok(()) => session.fail(format!(
                    "wrote {} of {} bytes",
                    session.bytes_written, declared_total
                )),
                Err(reason) => session.fail(reason),
            }
        }

        self.last_upload = Some(UploadState::Errored);
        Err(FileError::UploadFailed {
            reason: session
                .error
                .take()
                .unwrap_or_else(|| "upload failed".to_string()),
            path: session.path,
        })
    }

    /// Drop the session after a truncated body. Returns the abandoned path.
    pub fn upload_abort(&mut self) -> Option<String> {
        let mut session = self.upload.take()?;
        if let Some(mut writer) = session.writer.take() {
            if let Err(err) = writer.flush() {
                log::debug!("upload {}: flush on abort failed: {}", session.path, err);
            }
        }
        session.fail("upload aborted");
        self.last_upload = Some(UploadState::Errored);
        Some(session.path)
    }
}

/// Re-open the finished file and check its size and content digest.
fn verify(
    transport: &StorageTransport,
    path: &str,
    expected_size: u64,
    expected_digest: &str,
) -> Result<(), String> {
    let meta = transport
        .stat(path)
        .ok_or_else(|| "verification failed: file missing".to_string())?;
    if meta.size != expected_size {
        return Err(format!(
            "verification failed: size {} != {}",
            meta.size, expected_size
        ));
    }
    let mut reader = transport
        .open_read(path)
        .ok_or_else(|| "verification failed: cannot reopen file".to_string())?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 4096];
    loop {
        let read = reader
            .read(&mut buf)
            .map_err(|err| format!("verification read failed: {}", err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    if hex::encode(hasher.finalize()) != expected_digest {
        return Err("verification failed: content digest mismatch".to_string());
    }
    Ok(())
}
