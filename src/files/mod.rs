//! File manager over the storage transport.
//!
//! Responsible for:
//! - Listing directories with hidden entries filtered out
//! - Opening files for download with a content type from the extension
//! - Deleting files and creating folders
//! - Driving the chunked upload session (see `upload`)
//!
//! Every operation establishes transport health itself before touching the
//! card; transport primitives never do.

use std::io::Read;

use serde::Serialize;

use crate::error::FileError;
use crate::transport::{pause, StorageTransport};

pub mod upload;

pub use upload::{UploadReport, UploadState};

/// One directory entry as reported to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StoredFile {
    pub name: String,
    #[serde(rename = "isDir")]
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Listing {
    pub path: String,
    pub files: Vec<StoredFile>,
    /// Always `files.len()`.
    pub count: usize,
}

/// An opened file ready to be streamed to a client.
pub struct Download {
    pub path: String,
    pub filename: String,
    pub content_type: &'static str,
    pub size: u64,
    pub reader: Box<dyn Read + Send>,
}

#[derive(Default)]
pub struct FileManager {
    upload: Option<upload::UploadSession>,
    /// How the last finished session ended.
    last_upload: Option<UploadState>,
}

impl FileManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(
        &self,
        transport: &mut StorageTransport,
        path: &str,
    ) -> Result<Listing, FileError> {
        let path = normalize_path(path);
        log::debug!("files: listing {}", path);
        if !transport.ensure_healthy() {
            log::error!("files: card reconnection failed");
            return Err(FileError::StorageUnavailable);
        }

        let attempts = transport.policy().attempts.max(1);
        let retry_delay = transport.policy().open_retry_delay;
        let mut meta = None;
        for attempt in 1..=attempts {
            meta = transport.stat(&path);
            if meta.is_some() {
                break;
            }
            if attempt < attempts {
                log::warn!(
                    "files: failed to open {}, retrying ({} left)",
                    path,
                    attempts - attempt
                );
                pause(retry_delay);
                transport.force_reinitialize();
            }
        }

        let Some(meta) = meta else {
            return Err(FileError::DirectoryNotFound { path });
        };
        if !meta.is_dir() {
            return Err(FileError::NotADirectory { path });
        }
        let Some(entries) = transport.read_dir(&path) else {
            return Err(FileError::DirectoryNotFound { path });
        };

        let files: Vec<StoredFile> = entries
            .into_iter()
            .filter_map(|entry| {
                let name = bare_name(&entry.name);
                if name.is_empty() || name.starts_with('.') {
                    return None;
                }
                Some(StoredFile {
                    name: name.to_string(),
                    is_dir: entry.kind == crate::transport::EntryKind::Directory,
                    size: entry.size,
                })
            })
            .collect();

        log::info!("files: listed {} entries in {}", files.len(), path);
        Ok(Listing {
            count: files.len(),
            path,
            files,
        })
    }

    pub fn download(
        &self,
        transport: &mut StorageTransport,
        path: &str,
    ) -> Result<Download, FileError> {
        if !transport.initialize() {
            return Err(FileError::StorageUnavailable);
        }
        let path = normalize_path(path);
        let meta = transport
            .stat(&path)
            .ok_or_else(|| FileError::FileNotFound { path: path.clone() })?;
        if meta.is_dir() {
            return Err(FileError::IsDirectory { path });
        }
        let reader = transport
            .open_read(&path)
            .ok_or_else(|| FileError::FileNotFound { path: path.clone() })?;
        let filename = bare_name(&path).to_string();
        log::info!("files: download {} ({} bytes)", path, meta.size);
        Ok(Download {
            content_type: content_type_for(&filename),
            filename,
            size: meta.size,
            path,
            reader,
        })
    }

    /// Remove a file or empty directory.
    ///
    /// A missing path is reported as `DeleteFailed`, same as any other remove
    /// failure; the card driver only answers yes or no.
    pub fn delete(&self, transport: &mut StorageTransport, path: &str) -> Result<(), FileError> {
        if !transport.initialize() {
            return Err(FileError::StorageUnavailable);
        }
        let path = normalize_path(path);
        if transport.remove(&path) {
            log::info!("files: deleted {}", path);
            Ok(())
        } else {
            log::warn!("files: failed to delete {}", path);
            Err(FileError::DeleteFailed { path })
        }
    }

    /// Create `name` under `base`; returns the new folder's path.
    pub fn create_folder(
        &self,
        transport: &mut StorageTransport,
        base: &str,
        name: &str,
    ) -> Result<String, FileError> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(FileError::InvalidName {
                name: name.to_string(),
            });
        }
        let base = normalize_path(base);
        if !transport.ensure_healthy() {
            return Err(FileError::StorageUnavailable);
        }
        let path = if base.ends_with('/') {
            format!("{}{}", base, name)
        } else {
            format!("{}/{}", base, name)
        };
        if transport.mkdir(&path) {
            log::info!("files: created folder {}", path);
            Ok(path)
        } else {
            Err(FileError::CreateFailed { path })
        }
    }
}

/// Ensure a leading `/`; empty means the root.
pub fn normalize_path(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() {
        "/".to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Name after the last `/`; drivers differ on whether they report full paths.
fn bare_name(name: &str) -> &str {
    match name.rfind('/') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}

pub fn content_type_for(filename: &str) -> &'static str {
    let extension = match filename.rfind('.') {
        Some(idx) => filename[idx + 1..].to_ascii_lowercase(),
        None => return "application/octet-stream",
    };
    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemCard, MemMedium, TransportMode, TransportPolicy};

    fn transport(medium: &MemMedium, mode: TransportMode) -> StorageTransport {
        let bus = MemCard::new(TransportMode::Bus, medium.clone());
        let serial = MemCard::new(TransportMode::Serial, medium.clone());
        if mode == TransportMode::Serial {
            bus.faults().break_mounts(true);
        }
        StorageTransport::new(
            Box::new(bus),
            Box::new(serial),
            TransportPolicy::default().without_delays(),
        )
    }

    #[test]
    fn normalize_adds_leading_slash() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("photos"), "/photos");
        assert_eq!(normalize_path("/photos"), "/photos");
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type_for("A.JPG"), "image/jpeg");
        assert_eq!(content_type_for("index.htm"), "text/html");
        assert_eq!(content_type_for("app.js"), "application/javascript");
        assert_eq!(content_type_for("data.bin"), "application/octet-stream");
        assert_eq!(content_type_for("README"), "application/octet-stream");
    }

    #[test]
    fn serial_listing_strips_path_prefix() {
        let medium = MemMedium::new();
        medium.put_file("/photos/a.jpg", b"abc");
        medium.put_file("/photos/.hidden", b"x");
        let mut transport = transport(&medium, TransportMode::Serial);
        let listing = FileManager::new().list(&mut transport, "photos").unwrap();
        assert_eq!(transport.active_mode(), Some(TransportMode::Serial));
        assert_eq!(listing.path, "/photos");
        assert_eq!(
            listing.files,
            vec![StoredFile {
                name: "a.jpg".to_string(),
                is_dir: false,
                size: 3
            }]
        );
        assert_eq!(listing.count, 1);
    }

    #[test]
    fn all_hidden_directory_counts_zero() {
        let medium = MemMedium::new();
        medium.put_file("/.a", b"1");
        medium.put_file("/.b", b"2");
        let mut transport = transport(&medium, TransportMode::Bus);
        let listing = FileManager::new().list(&mut transport, "/").unwrap();
        assert!(listing.files.is_empty());
        assert_eq!(listing.count, 0);
    }

    #[test]
    fn listing_a_file_is_not_a_directory() {
        let medium = MemMedium::new();
        medium.put_file("/a.jpg", b"1");
        let mut transport = transport(&medium, TransportMode::Bus);
        let err = FileManager::new().list(&mut transport, "/a.jpg").unwrap_err();
        assert!(matches!(err, FileError::NotADirectory { .. }));
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn download_rejects_directory() {
        let medium = MemMedium::new();
        medium.create_dir_all("/photos");
        let mut transport = transport(&medium, TransportMode::Bus);
        let manager = FileManager::new();
        let err = manager.download(&mut transport, "/photos").err().unwrap();
        assert_eq!(err.to_string(), "Cannot download directory");
        let err = manager.download(&mut transport, "/nope.txt").err().unwrap();
        assert_eq!(err.to_string(), "File not found");
    }

    #[test]
    fn create_folder_joins_with_one_separator() {
        let medium = MemMedium::new();
        medium.create_dir_all("/photos");
        let mut transport = transport(&medium, TransportMode::Bus);
        let manager = FileManager::new();
        assert_eq!(
            manager.create_folder(&mut transport, "/photos/", "raw").unwrap(),
            "/photos/raw"
        );
        assert!(medium.has_dir("/photos/raw"));
        let err = manager
            .create_folder(&mut transport, "/photos", "raw")
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to create folder");
    }

    #[test]
    fn create_folder_rejects_separators_before_touching_card() {
        let medium = MemMedium::new();
        let mut transport = transport(&medium, TransportMode::Bus);
        let manager = FileManager::new();
        for name in ["", "a/b", "a\\b", ".."] {
            let err = manager.create_folder(&mut transport, "/", name).unwrap_err();
            assert!(matches!(err, FileError::InvalidName { .. }), "{}", name);
        }
        assert!(!transport.state().is_initialized());
    }
}
