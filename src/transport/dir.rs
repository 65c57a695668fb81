//! Directory-backed card interface.
//!
//! On a host deployment each access mode is exposed as a mount point: the
//! SD/MMC host and the SPI fallback each surface the card at their own
//! directory. "Mounting" checks that the mount point is a live directory;
//! capacity comes from the filesystem holding it.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use super::card::{
    BusPins, CardInfo, CardInterface, CardType, EntryKind, EntryMeta, RawDirEntry, SerialPins,
    TransportMode,
};

pub struct DirCard {
    mode: TransportMode,
    root: PathBuf,
    pins: String,
    configured: bool,
    mounted: bool,
}

impl DirCard {
    pub fn bus(root: impl Into<PathBuf>, pins: BusPins) -> Self {
        Self::new(TransportMode::Bus, root.into(), pins.to_string())
    }

    pub fn serial(root: impl Into<PathBuf>, pins: SerialPins) -> Self {
        Self::new(TransportMode::Serial, root.into(), pins.to_string())
    }

    fn new(mode: TransportMode, root: PathBuf, pins: String) -> Self {
        Self {
            mode,
            root,
            pins,
            configured: false,
            mounted: false,
        }
    }

    /// Map a card path onto the mount point. Rejects `..` components.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        if !self.mounted {
            return None;
        }
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(resolved)
    }

    /// Entry name as this mode's driver reports it.
    fn entry_name(&self, dir: &str, name: &str) -> String {
        match self.mode {
            TransportMode::Bus => name.to_string(),
            // The SPI driver reports full paths.
            TransportMode::Serial => {
                let dir = dir.trim_end_matches('/');
                format!("{}/{}", dir, name)
            }
        }
    }
}

impl CardInterface for DirCard {
    fn mode(&self) -> TransportMode {
        self.mode
    }

    fn pin_summary(&self) -> String {
        self.pins.clone()
    }

    fn configure(&mut self) -> bool {
        self.configured = true;
        log::debug!("{} pins configured - {}", self.mode, self.pins);
        true
    }

    fn mount(&mut self) -> bool {
        if !self.configured {
            return false;
        }
        self.mounted = self.root.is_dir();
        self.mounted
    }

    fn unmount(&mut self) {
        self.mounted = false;
        self.configured = false;
    }

    fn card_info(&self) -> Option<CardInfo> {
        if !self.mounted || !self.root.is_dir() {
            return None;
        }
        let total_bytes = fs2::total_space(&self.root).unwrap_or(0);
        let available = fs2::available_space(&self.root).unwrap_or(0);
        Some(CardInfo {
            card_type: CardType::Sdhc,
            total_bytes,
            used_bytes: total_bytes.saturating_sub(available),
        })
    }

    fn stat(&self, path: &str) -> Option<EntryMeta> {
        let meta = fs::metadata(self.resolve(path)?).ok()?;
        Some(EntryMeta {
            kind: if meta.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            },
            size: if meta.is_dir() { 0 } else { meta.len() },
        })
    }

    fn read_dir(&self, path: &str) -> Option<Vec<RawDirEntry>> {
        let dir = self.resolve(path)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir).ok()? {
            let entry = entry.ok()?;
            let meta = entry.metadata().ok()?;
            let name = entry.file_name().to_string_lossy().to_string();
            entries.push(RawDirEntry {
                name: self.entry_name(path, &name),
                kind: if meta.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                },
                size: if meta.is_dir() { 0 } else { meta.len() },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Some(entries)
    }

    fn open_read(&self, path: &str) -> Option<Box<dyn Read + Send>> {
        let resolved = self.resolve(path)?;
        if !resolved.is_file() {
            return None;
        }
        let file = File::open(resolved).ok()?;
        Some(Box::new(file))
    }

    fn open_write(&self, path: &str) -> Option<Box<dyn Write + Send>> {
        let file = File::create(self.resolve(path)?).ok()?;
        Some(Box::new(file))
    }

    fn remove(&self, path: &str) -> bool {
        let Some(resolved) = self.resolve(path) else {
            return false;
        };
        if resolved == self.root {
            return false;
        }
        match fs::metadata(&resolved) {
            Ok(meta) if meta.is_dir() => fs::remove_dir(&resolved).is_ok(),
            Ok(_) => fs::remove_file(&resolved).is_ok(),
            Err(_) => false,
        }
    }

    fn mkdir(&self, path: &str) -> bool {
        match self.resolve(path) {
            Some(resolved) => fs::create_dir(resolved).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn mounted_bus(root: &Path) -> DirCard {
        let mut card = DirCard::bus(root, BusPins::default());
        assert!(card.configure());
        assert!(card.mount());
        card
    }

    #[test]
    fn mount_requires_live_directory() {
        let dir = tempdir().unwrap();
        let mut card = DirCard::bus(dir.path().join("absent"), BusPins::default());
        card.configure();
        assert!(!card.mount());
        assert!(card.card_info().is_none());
    }

    #[test]
    fn unmounted_card_refuses_primitives() {
        let dir = tempdir().unwrap();
        let mut card = mounted_bus(dir.path());
        card.unmount();
        assert!(card.stat("/").is_none());
        assert!(card.open_write("/a.txt").is_none());
        assert!(!card.mkdir("/x"));
    }

    #[test]
    fn parent_components_are_rejected() {
        let dir = tempdir().unwrap();
        let card = mounted_bus(dir.path());
        assert!(card.resolve("/../etc/passwd").is_none());
        assert!(card.open_write("/../escape.txt").is_none());
    }

    #[test]
    fn serial_mode_reports_full_paths() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("photos")).unwrap();
        fs::write(dir.path().join("photos/a.jpg"), b"abc").unwrap();
        let mut card = DirCard::serial(dir.path(), SerialPins::default());
        card.configure();
        assert!(card.mount());
        let entries = card.read_dir("/photos").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "/photos/a.jpg");
        assert_eq!(entries[0].size, 3);
    }

    #[test]
    fn remove_refuses_non_empty_directory() {
        let dir = tempdir().unwrap();
        let card = mounted_bus(dir.path());
        assert!(card.mkdir("/full"));
        fs::write(dir.path().join("full/x"), b"1").unwrap();
        assert!(!card.remove("/full"));
        assert!(card.remove("/full/x"));
        assert!(card.remove("/full"));
        assert!(!card.remove("/full"));
    }
}
