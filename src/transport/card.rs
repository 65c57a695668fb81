//! Card interface contract.
//!
//! The card can be reached through exactly two physical access modes. Both
//! implement `CardInterface`; `StorageTransport` holds one of each and routes
//! every primitive to whichever is mounted.

use serde::Serialize;
use std::fmt;
use std::io::{Read, Write};

/// The two mutually exclusive access modes to the card.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum TransportMode {
    /// Built-in SD/MMC host, 1-bit bus width.
    Bus,
    /// SPI bus with a chip-select line.
    Serial,
}

impl TransportMode {
    /// Short label used in responses and logs.
    pub fn label(self) -> &'static str {
        match self {
            TransportMode::Bus => "MMC",
            TransportMode::Serial => "SPI",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CardType {
    Mmc,
    Sd,
    Sdhc,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CardInfo {
    pub card_type: CardType,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

impl CardInfo {
    pub fn total_mb(&self) -> u64 {
        self.total_bytes / (1024 * 1024)
    }

    pub fn used_mb(&self) -> u64 {
        self.used_bytes / (1024 * 1024)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Result of opening a path without reading it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryMeta {
    pub kind: EntryKind,
    pub size: u64,
}

impl EntryMeta {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// One directory entry as the mode's driver reports it.
///
/// Some drivers report the full path (`/photos/a.jpg`) rather than the bare
/// name; callers strip the prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawDirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
}

/// Pins and clock for the SD/MMC host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusPins {
    pub clk: u8,
    pub cmd: u8,
    pub d0: u8,
    pub one_bit: bool,
    pub freq_hz: u32,
}

impl Default for BusPins {
    fn default() -> Self {
        Self {
            clk: 39,
            cmd: 38,
            d0: 40,
            one_bit: true,
            freq_hz: 40_000_000,
        }
    }
}

impl fmt::Display for BusPins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CLK: {}, CMD: {}, DATA: {} ({}-bit, {} kHz)",
            self.clk,
            self.cmd,
            self.d0,
            if self.one_bit { 1 } else { 4 },
            self.freq_hz / 1000
        )
    }
}

/// Pins and clock for the SPI fallback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SerialPins {
    pub sck: u8,
    pub miso: u8,
    pub mosi: u8,
    pub cs: u8,
    pub freq_hz: u32,
}

impl Default for SerialPins {
    fn default() -> Self {
        Self {
            sck: 18,
            miso: 19,
            mosi: 23,
            cs: 5,
            freq_hz: 4_000_000,
        }
    }
}

impl fmt::Display for SerialPins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SCK: {}, MISO: {}, MOSI: {}, CS: {} ({} kHz)",
            self.sck,
            self.miso,
            self.mosi,
            self.cs,
            self.freq_hz / 1000
        )
    }
}

/// Capability set shared by both access modes.
///
/// Lifecycle methods (`configure`, `mount`, `unmount`) are only called by
/// `StorageTransport`. File primitives return `None`/`false` when the
/// interface is not mounted.
pub trait CardInterface: Send {
    fn mode(&self) -> TransportMode;

    /// Human-readable pin assignment for logs.
    fn pin_summary(&self) -> String;

    /// Claim the bus lines. Returns `false` if the pins cannot be configured.
    fn configure(&mut self) -> bool;

    /// Mount the card. Success here alone does not prove the card is usable.
    fn mount(&mut self) -> bool;

    fn unmount(&mut self);

    /// `None` when no card answers on the bus.
    fn card_info(&self) -> Option<CardInfo>;

    fn stat(&self, path: &str) -> Option<EntryMeta>;

    fn read_dir(&self, path: &str) -> Option<Vec<RawDirEntry>>;

    fn open_read(&self, path: &str) -> Option<Box<dyn Read + Send>>;

    /// Create or truncate `path` for writing.
    fn open_write(&self, path: &str) -> Option<Box<dyn Write + Send>>;

    fn remove(&self, path: &str) -> bool;

    fn mkdir(&self, path: &str) -> bool;
}

/// Write as much of `buf` as the sink accepts and report the count.
///
/// Stops at the first error or zero-length write, mirroring card drivers that
/// report a short count instead of failing.
pub fn write_fully(writer: &mut dyn Write, buf: &[u8]) -> usize {
    let mut written = 0;
    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                log::debug!("card write stopped after {} bytes: {}", written, err);
                break;
            }
        }
    }
    written
}
