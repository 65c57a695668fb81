use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::CaptureConfig;
use crate::ingest::CameraConfig;
use crate::stream::StreamConfig;
use crate::transport::{BusPins, SerialPins, TransportPolicy};

const DEFAULT_API_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_CARD_ROOT: &str = "sdcard";

/// Card root that selects the in-memory card instead of a mount point.
pub const MEMORY_CARD_ROOT: &str = "mem://";

#[derive(Debug, Deserialize, Default)]
struct SdcamConfigFile {
    server: Option<ServerConfigFile>,
    camera: Option<CameraConfigFile>,
    card: Option<CardConfigFile>,
    policy: Option<PolicyConfigFile>,
    capture: Option<CaptureConfigFile>,
    stream: Option<StreamConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    url: Option<String>,
    frame_buffers: Option<usize>,
    warmup_frames: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct CardConfigFile {
    bus_root: Option<PathBuf>,
    serial_root: Option<PathBuf>,
    bus: Option<BusPinsFile>,
    serial: Option<SerialPinsFile>,
}

#[derive(Debug, Deserialize, Default)]
struct BusPinsFile {
    clk: Option<u8>,
    cmd: Option<u8>,
    d0: Option<u8>,
    one_bit: Option<bool>,
    freq_hz: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SerialPinsFile {
    sck: Option<u8>,
    miso: Option<u8>,
    mosi: Option<u8>,
    cs: Option<u8>,
    freq_hz: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct PolicyConfigFile {
    attempts: Option<u32>,
    retry_backoff_ms: Option<u64>,
    settle_delay_ms: Option<u64>,
    mount_settle_ms: Option<u64>,
    health_interval_ms: Option<u64>,
    open_retry_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    prefix: Option<String>,
    directory: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    chunk_size: Option<usize>,
    frame_interval_ms: Option<u64>,
    miss_delay_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CardSettings {
    /// Mount point of the card in SD/MMC mode, or `mem://`.
    pub bus_root: PathBuf,
    /// Mount point of the card in SPI mode, or `mem://`.
    pub serial_root: PathBuf,
    pub bus_pins: BusPins,
    pub serial_pins: SerialPins,
}

#[derive(Debug, Clone)]
pub struct SdcamConfig {
    pub api_addr: String,
    pub camera: CameraConfig,
    pub card: CardSettings,
    pub policy: TransportPolicy,
    pub capture: CaptureConfig,
    pub stream: StreamConfig,
}

impl SdcamConfig {
    /// Defaults, then the file named by `SDCAM_CONFIG`, then `SDCAM_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SDCAM_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => SdcamConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SdcamConfigFile) -> Self {
        let server = file.server.unwrap_or_default();
        let camera = file.camera.unwrap_or_default();
        let card = file.card.unwrap_or_default();
        let policy = file.policy.unwrap_or_default();
        let capture = file.capture.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();

        let camera_defaults = CameraConfig::default();
        let policy_defaults = TransportPolicy::default();
        let capture_defaults = CaptureConfig::default();
        let stream_defaults = StreamConfig::default();
        let bus = card.bus.unwrap_or_default();
        let serial = card.serial.unwrap_or_default();
        let bus_defaults = BusPins::default();
        let serial_defaults = SerialPins::default();
        let millis = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_millis).unwrap_or(default)
        };

        Self {
            api_addr: server
                .addr
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            camera: CameraConfig {
                url: camera.url.unwrap_or(camera_defaults.url),
                frame_buffers: camera.frame_buffers.unwrap_or(camera_defaults.frame_buffers),
                warmup_frames: camera.warmup_frames.unwrap_or(camera_defaults.warmup_frames),
                width: camera.width.unwrap_or(camera_defaults.width),
                height: camera.height.unwrap_or(camera_defaults.height),
                jpeg_quality: camera.jpeg_quality.unwrap_or(camera_defaults.jpeg_quality),
            },
            card: CardSettings {
                bus_root: card
                    .bus_root
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_CARD_ROOT)),
                serial_root: card
                    .serial_root
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_CARD_ROOT)),
                bus_pins: BusPins {
                    clk: bus.clk.unwrap_or(bus_defaults.clk),
                    cmd: bus.cmd.unwrap_or(bus_defaults.cmd),
                    d0: bus.d0.unwrap_or(bus_defaults.d0),
                    one_bit: bus.one_bit.unwrap_or(bus_defaults.one_bit),
                    freq_hz: bus.freq_hz.unwrap_or(bus_defaults.freq_hz),
                },
                serial_pins: SerialPins {
                    sck: serial.sck.unwrap_or(serial_defaults.sck),
                    miso: serial.miso.unwrap_or(serial_defaults.miso),
                    mosi: serial.mosi.unwrap_or(serial_defaults.mosi),
                    cs: serial.cs.unwrap_or(serial_defaults.cs),
                    freq_hz: serial.freq_hz.unwrap_or(serial_defaults.freq_hz),
                },
            },
            policy: TransportPolicy {
                attempts: policy.attempts.unwrap_or(policy_defaults.attempts),
                retry_backoff: millis(policy.retry_backoff_ms, policy_defaults.retry_backoff),
                settle_delay: millis(policy.settle_delay_ms, policy_defaults.settle_delay),
                mount_settle: millis(policy.mount_settle_ms, policy_defaults.mount_settle),
                health_interval: millis(
                    policy.health_interval_ms,
                    policy_defaults.health_interval,
                ),
                open_retry_delay: millis(
                    policy.open_retry_delay_ms,
                    policy_defaults.open_retry_delay,
                ),
            },
            capture: CaptureConfig {
                prefix: capture.prefix.unwrap_or(capture_defaults.prefix),
                directory: capture.directory.unwrap_or(capture_defaults.directory),
            },
            stream: StreamConfig {
                chunk_size: stream.chunk_size.unwrap_or(stream_defaults.chunk_size),
                frame_interval: millis(stream.frame_interval_ms, stream_defaults.frame_interval),
                miss_delay: millis(stream.miss_delay_ms, stream_defaults.miss_delay),
                boundary: stream_defaults.boundary,
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("SDCAM_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(url) = std::env::var("SDCAM_CAMERA_URL") {
            if !url.trim().is_empty() {
                self.camera.url = url;
            }
        }
        if let Ok(root) = std::env::var("SDCAM_BUS_ROOT") {
            if !root.trim().is_empty() {
                self.card.bus_root = PathBuf::from(root);
            }
        }
        if let Ok(root) = std::env::var("SDCAM_SERIAL_ROOT") {
            if !root.trim().is_empty() {
                self.card.serial_root = PathBuf::from(root);
            }
        }
        if let Ok(interval) = std::env::var("SDCAM_HEALTH_INTERVAL_MS") {
            let millis: u64 = interval.parse().map_err(|_| {
                anyhow!("SDCAM_HEALTH_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.policy.health_interval = Duration::from_millis(millis);
        }
        if let Ok(prefix) = std::env::var("SDCAM_CAPTURE_PREFIX") {
            if !prefix.trim().is_empty() {
                self.capture.prefix = prefix;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.policy.attempts == 0 {
            return Err(anyhow!("policy.attempts must be greater than zero"));
        }
        if self.stream.chunk_size == 0 {
            return Err(anyhow!("stream.chunk_size must be greater than zero"));
        }
        if self.camera.frame_buffers == 0 {
            return Err(anyhow!("camera.frame_buffers must be greater than zero"));
        }
        if self.capture.prefix.trim().is_empty() {
            return Err(anyhow!("capture.prefix must not be empty"));
        }
        if self.capture.prefix.contains(['/', '\\']) {
            return Err(anyhow!("capture.prefix must not contain a path separator"));
        }
        Ok(())
    }

    pub fn uses_memory_card(&self) -> bool {
        is_memory_root(&self.card.bus_root) || is_memory_root(&self.card.serial_root)
    }
}

fn is_memory_root(path: &Path) -> bool {
    path.to_str() == Some(MEMORY_CARD_ROOT)
}

fn read_config_file(path: &Path) -> Result<SdcamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_board_constants() {
        let cfg = SdcamConfig::from_file(SdcamConfigFile::default());
        assert_eq!(cfg.policy, TransportPolicy::default());
        assert_eq!(cfg.card.bus_pins.clk, 39);
        assert_eq!(cfg.card.serial_pins.cs, 5);
        assert_eq!(cfg.capture.prefix, "CAPTURE");
        assert_eq!(cfg.stream.chunk_size, 1024);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn toml_sections_override_defaults() {
        let file: SdcamConfigFile = toml::from_str(
            r#"
            [policy]
            attempts = 5
            health_interval_ms = 250

            [card.serial]
            cs = 13
            "#,
        )
        .unwrap();
        let cfg = SdcamConfig::from_file(file);
        assert_eq!(cfg.policy.attempts, 5);
        assert_eq!(cfg.policy.health_interval, Duration::from_millis(250));
        assert_eq!(cfg.policy.retry_backoff, Duration::from_millis(1000));
        assert_eq!(cfg.card.serial_pins.cs, 13);
        assert_eq!(cfg.card.serial_pins.sck, 18);
    }

    #[test]
    fn prefix_with_separator_rejected() {
        let mut cfg = SdcamConfig::from_file(SdcamConfigFile::default());
        cfg.capture.prefix = "a/b".to_string();
        assert!(cfg.validate().is_err());
    }
}
