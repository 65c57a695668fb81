//! Storage transport: one logical card API over two physical access modes.
//!
//! The transport owns both card interfaces and the process-wide
//! `TransportState`. At most one interface is mounted at a time:
//! - `initialize` tries the SD/MMC bus first, then falls back to SPI, each
//!   with bounded retries and a fixed backoff.
//! - A mount is only trusted once the card answers and `/` opens as a directory.
//! - `health_check` is throttled and doubles as the recovery trigger.
//! - `force_reinitialize` tears down the active mode and starts over.
//!
//! File primitives dispatch on the active mode and never initialize on their
//! own; callers establish health first.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

pub mod card;
pub mod dir;
pub mod memory;

pub use card::{
    write_fully, BusPins, CardInfo, CardInterface, CardType, EntryKind, EntryMeta, RawDirEntry,
    SerialPins, TransportMode,
};
pub use dir::DirCard;
pub use memory::{MemCard, MemFaults, MemMedium};

/// Retry and timing policy for card bring-up and recovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportPolicy {
    /// Mount attempts per mode; also bounds directory-open and upload-open retries.
    pub attempts: u32,
    /// Pause between failed mount attempts.
    pub retry_backoff: Duration,
    /// Pause after tearing down a mode before remounting.
    pub settle_delay: Duration,
    /// Pause between a successful mount call and its verification.
    pub mount_settle: Duration,
    /// Minimum spacing between physical health probes.
    pub health_interval: Duration,
    /// Pause before retrying a failed open.
    pub open_retry_delay: Duration,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_backoff: Duration::from_millis(1000),
            settle_delay: Duration::from_millis(500),
            mount_settle: Duration::from_millis(100),
            health_interval: Duration::from_secs(5),
            open_retry_delay: Duration::from_millis(100),
        }
    }
}

impl TransportPolicy {
    /// Same retry counts and health interval, no sleeps.
    pub fn without_delays(self) -> Self {
        Self {
            retry_backoff: Duration::ZERO,
            settle_delay: Duration::ZERO,
            mount_settle: Duration::ZERO,
            open_retry_delay: Duration::ZERO,
            ..self
        }
    }
}

/// Fixed hardware-settling pause. Not interruptible.
pub(crate) fn pause(duration: Duration) {
    if !duration.is_zero() {
        std::thread::sleep(duration);
    }
}

/// How the process currently talks to the card.
///
/// Only two shapes exist: uninitialized with no mode, or initialized with
/// exactly one mode. Re-initialization replaces the whole value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportState {
    initialized: bool,
    active_mode: Option<TransportMode>,
    last_health_check: Option<Instant>,
}

impl TransportState {
    fn uninitialized() -> Self {
        Self {
            initialized: false,
            active_mode: None,
            last_health_check: None,
        }
    }

    fn mounted(mode: TransportMode, at: Instant) -> Self {
        Self {
            initialized: true,
            active_mode: Some(mode),
            last_health_check: Some(at),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn active_mode(&self) -> Option<TransportMode> {
        self.active_mode
    }

    pub fn last_health_check(&self) -> Option<Instant> {
        self.last_health_check
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub successful_mounts: u64,
    pub failed_initializations: u64,
    pub health_probes: u64,
    pub reinitializations: u64,
}

pub struct StorageTransport {
    bus: Box<dyn CardInterface>,
    serial: Box<dyn CardInterface>,
    policy: TransportPolicy,
    state: TransportState,
    stats: TransportStats,
}

impl StorageTransport {
    pub fn new(
        bus: Box<dyn CardInterface>,
        serial: Box<dyn CardInterface>,
        policy: TransportPolicy,
    ) -> Self {
        Self {
            bus,
            serial,
            policy,
            state: TransportState::uninitialized(),
            stats: TransportStats::default(),
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn active_mode(&self) -> Option<TransportMode> {
        self.state.active_mode
    }

    pub fn policy(&self) -> &TransportPolicy {
        &self.policy
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    pub fn pin_summary(&self, mode: TransportMode) -> String {
        self.interface(mode).pin_summary()
    }

    fn interface(&self, mode: TransportMode) -> &dyn CardInterface {
        match mode {
            TransportMode::Bus => self.bus.as_ref(),
            TransportMode::Serial => self.serial.as_ref(),
        }
    }

    fn interface_mut(&mut self, mode: TransportMode) -> &mut dyn CardInterface {
        match mode {
            TransportMode::Bus => self.bus.as_mut(),
            TransportMode::Serial => self.serial.as_mut(),
        }
    }

    fn active(&self) -> Option<&dyn CardInterface> {
        self.state.active_mode.map(|mode| self.interface(mode))
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Bring the card up, bus mode first, SPI as fallback.
    ///
    /// Returns immediately when already initialized and healthy. Returns
    /// `false` only after both modes exhaust their attempts.
    pub fn initialize(&mut self) -> bool {
        if self.state.initialized && self.health_check() {
            return true;
        }

        log::info!("initializing card transport");
        self.state = TransportState::uninitialized();
        let policy = self.policy;

        for mode in [TransportMode::Bus, TransportMode::Serial] {
            let card = self.interface_mut(mode);
            log::info!("trying {} mode - {}", mode, card.pin_summary());
            if mount_with_retries(card, &policy) {
                self.state = TransportState::mounted(mode, Instant::now());
                self.stats.successful_mounts += 1;
                if let Some(info) = self.interface(mode).card_info() {
                    log::info!(
                        "card ready in {} mode: {:?}, {} MB ({} MB used)",
                        mode,
                        info.card_type,
                        info.total_mb(),
                        info.used_mb()
                    );
                }
                return true;
            }
            if mode == TransportMode::Bus {
                log::warn!("{} mode failed, falling back to {}", mode, TransportMode::Serial);
            }
        }

        self.stats.failed_initializations += 1;
        log::error!("card initialization failed in every mode");
        false
    }

    /// Throttled liveness probe that also triggers recovery.
    ///
    /// Within `health_interval` of the last probe the last known state is
    /// reported as healthy without touching the card.
    pub fn health_check(&mut self) -> bool {
        let Some(mode) = self.state.active_mode else {
            return false;
        };
        let now = Instant::now();
        if let Some(last) = self.state.last_health_check {
            if now.duration_since(last) < self.policy.health_interval {
                return true;
            }
        }
        self.state.last_health_check = Some(now);
        self.stats.health_probes += 1;

        if root_is_directory(self.interface(mode)) {
            return true;
        }
        log::warn!("card connection lost in {} mode, attempting reconnection", mode);
        self.force_reinitialize()
    }

    /// Tear down whichever mode is active and initialize from scratch.
    pub fn force_reinitialize(&mut self) -> bool {
        log::info!("force re-initializing card transport");
        self.stats.reinitializations += 1;
        if let Some(mode) = self.state.active_mode {
            self.interface_mut(mode).unmount();
        }
        self.state = TransportState::uninitialized();
        pause(self.policy.settle_delay);
        self.initialize()
    }

    /// Make sure the card is usable, with one explicit reconnection attempt.
    ///
    /// The extra attempt matters when the throttled health check already ran
    /// its own recovery inside the current window and was skipped.
    pub fn ensure_healthy(&mut self) -> bool {
        if self.initialize() && self.health_check() {
            return true;
        }
        log::warn!("card not available - attempting reconnection");
        self.force_reinitialize()
    }

    // ------------------------------------------------------------------------
    // File primitives (no implicit initialization)
    // ------------------------------------------------------------------------

    pub fn card_info(&self) -> Option<CardInfo> {
        self.active()?.card_info()
    }

    pub fn stat(&self, path: &str) -> Option<EntryMeta> {
        self.active()?.stat(path)
    }

    pub fn read_dir(&self, path: &str) -> Option<Vec<RawDirEntry>> {
        self.active()?.read_dir(path)
    }

    pub fn open_read(&self, path: &str) -> Option<Box<dyn Read + Send>> {
        self.active()?.open_read(path)
    }

    pub fn open_write(&self, path: &str) -> Option<Box<dyn Write + Send>> {
        self.active()?.open_write(path)
    }

    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        let mut reader = self.open_read(path)?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data).ok()?;
        Some(data)
    }

    /// Create `path` and write `data`; returns the bytes the card accepted.
    pub fn write_file(&self, path: &str, data: &[u8]) -> usize {
        let Some(mut writer) = self.open_write(path) else {
            log::warn!("failed to open {} for writing", path);
            return 0;
        };
        let written = write_fully(writer.as_mut(), data);
        if let Err(err) = writer.flush() {
            log::warn!("flush of {} failed: {}", path, err);
        }
        written
    }

    pub fn remove(&self, path: &str) -> bool {
        self.active().map(|card| card.remove(path)).unwrap_or(false)
    }

    pub fn mkdir(&self, path: &str) -> bool {
        self.active().map(|card| card.mkdir(path)).unwrap_or(false)
    }
}

fn root_is_directory(card: &dyn CardInterface) -> bool {
    card.stat("/").map(|meta| meta.is_dir()).unwrap_or(false)
}

fn mount_with_retries(card: &mut dyn CardInterface, policy: &TransportPolicy) -> bool {
    let mode = card.mode();
    for attempt in 1..=policy.attempts {
        if mount_once(card, policy) {
            return true;
        }
        let remaining = policy.attempts - attempt;
        if remaining > 0 {
            log::warn!(
                "retrying {} initialization ({} attempts left)",
                mode,
                remaining
            );
            pause(policy.retry_backoff);
        }
    }
    false
}

fn mount_once(card: &mut dyn CardInterface, policy: &TransportPolicy) -> bool {
    let mode = card.mode();
    if !card.configure() {
        log::warn!("{} pin configuration failed", mode);
        return false;
    }
    if !card.mount() {
        log::warn!("{} mount failed", mode);
        return false;
    }
    pause(policy.mount_settle);

    // A successful mount call proves nothing about the card itself.
    if card.card_info().is_none() {
        log::warn!("{} card not detected", mode);
    } else if root_is_directory(card) {
        return true;
    } else {
        log::warn!("{} root directory test failed", mode);
    }
    card.unmount();
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_transport(medium: &MemMedium) -> (StorageTransport, MemFaults, MemFaults) {
        let bus = MemCard::new(TransportMode::Bus, medium.clone());
        let serial = MemCard::new(TransportMode::Serial, medium.clone());
        let (bus_faults, serial_faults) = (bus.faults(), serial.faults());
        let transport = StorageTransport::new(
            Box::new(bus),
            Box::new(serial),
            TransportPolicy::default().without_delays(),
        );
        (transport, bus_faults, serial_faults)
    }

    #[test]
    fn starts_uninitialized() {
        let (transport, _, _) = mem_transport(&MemMedium::new());
        let state = transport.state();
        assert!(!state.is_initialized());
        assert_eq!(state.active_mode(), None);
    }

    #[test]
    fn bus_mode_preferred() {
        let (mut transport, _, serial) = mem_transport(&MemMedium::new());
        assert!(transport.initialize());
        assert_eq!(transport.active_mode(), Some(TransportMode::Bus));
        assert_eq!(serial.mount_attempts(), 0);
    }

    #[test]
    fn falls_back_to_serial_after_three_bus_attempts() {
        let (mut transport, bus, _) = mem_transport(&MemMedium::new());
        bus.break_mounts(true);
        assert!(transport.initialize());
        assert_eq!(bus.mount_attempts(), 3);
        assert_eq!(transport.active_mode(), Some(TransportMode::Serial));
    }

    #[test]
    fn absent_card_fails_every_mode() {
        let medium = MemMedium::new();
        medium.set_present(false);
        let (mut transport, bus, serial) = mem_transport(&medium);
        assert!(!transport.initialize());
        assert_eq!(bus.mount_attempts(), 3);
        assert_eq!(serial.mount_attempts(), 3);
        // Every trusted-looking mount was torn down again.
        assert_eq!(bus.unmounts(), 3);
        assert_eq!(serial.unmounts(), 3);
        assert!(!transport.state().is_initialized());
        assert_eq!(transport.stats().failed_initializations, 1);
    }

    #[test]
    fn primitives_never_initialize() {
        let medium = MemMedium::new();
        medium.put_file("/a.txt", b"hi");
        let (transport, bus, _) = mem_transport(&medium);
        assert!(transport.stat("/a.txt").is_none());
        assert!(transport.read_file("/a.txt").is_none());
        assert!(!transport.remove("/a.txt"));
        assert_eq!(transport.write_file("/b.txt", b"x"), 0);
        assert_eq!(bus.mount_attempts(), 0);
        assert!(medium.file("/a.txt").is_some());
    }

    #[test]
    fn uninitialized_health_check_fails_without_probe() {
        let (mut transport, bus, _) = mem_transport(&MemMedium::new());
        assert!(!transport.health_check());
        assert_eq!(bus.root_probes(), 0);
    }
}
