//! Error taxonomy shared by the camera, capture and file-manager layers.
//!
//! Every component error maps onto one coarse [`ErrorKind`] and an HTTP status
//! so the request layer can answer without knowing component internals. The
//! `Display` text is what ends up in the `error` field of JSON responses.

use thiserror::Error;

/// Coarse failure classes surfaced to callers once local retries are exhausted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Sensor or card not responding.
    HardwareUnavailable,
    /// Path or file absent.
    NotFound,
    /// Malformed name or path.
    InvalidInput,
    /// Short read or write.
    IoIncomplete,
    /// Re-entrant upload.
    Conflict,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::HardwareUnavailable => 500,
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidInput => 400,
            ErrorKind::IoIncomplete => 500,
            ErrorKind::Conflict => 409,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The sensor pipeline has no frame ready (warming up or pool exhausted).
    #[error("no frame buffer available")]
    NoBuffer,
    #[error("camera source failed: {0}")]
    Source(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Camera capture failed")]
    CameraUnavailable,
    #[error("SD Card not available for saving image")]
    StorageUnavailable,
    #[error("Failed to save image to SD card ({written}/{expected} bytes written to {path})")]
    WriteIncomplete {
        path: String,
        written: usize,
        expected: usize,
    },
}

impl CaptureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::CameraUnavailable | CaptureError::StorageUnavailable => {
                ErrorKind::HardwareUnavailable
            }
            CaptureError::WriteIncomplete { .. } => ErrorKind::IoIncomplete,
        }
    }

    pub fn http_status(&self) -> u16 {
        self.kind().http_status()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FileError {
    #[error("SD Card not available")]
    StorageUnavailable,
    #[error("Directory not found or SD card error")]
    DirectoryNotFound { path: String },
    #[error("Path is not a directory")]
    NotADirectory { path: String },
    #[error("File not found")]
    FileNotFound { path: String },
    #[error("Cannot download directory")]
    IsDirectory { path: String },
    // remove() only reports a flat boolean, so absence is not distinguished here.
    #[error("Failed to delete file")]
    DeleteFailed { path: String },
    #[error("Invalid folder name")]
    InvalidName { name: String },
    #[error("Failed to create folder")]
    CreateFailed { path: String },
    #[error("Another upload is already in progress")]
    ConflictingUpload { active_path: String },
    #[error("Upload failed: {reason}")]
    UploadFailed { path: String, reason: String },
}

impl FileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FileError::StorageUnavailable
            | FileError::DeleteFailed { .. }
            | FileError::CreateFailed { .. } => ErrorKind::HardwareUnavailable,
            FileError::DirectoryNotFound { .. }
            | FileError::NotADirectory { .. }
            | FileError::FileNotFound { .. } => ErrorKind::NotFound,
            FileError::IsDirectory { .. } | FileError::InvalidName { .. } => {
                ErrorKind::InvalidInput
            }
            FileError::ConflictingUpload { .. } => ErrorKind::Conflict,
            FileError::UploadFailed { .. } => ErrorKind::IoIncomplete,
        }
    }

    pub fn http_status(&self) -> u16 {
        self.kind().http_status()
    }
}
