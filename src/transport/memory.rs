//! In-memory card with fault injection.
//!
//! `MemMedium` is the card itself (files and directories); it is shared by
//! the two `MemCard` interfaces the way one physical card sits behind both
//! bus modes. `MemFaults` scripts per-interface failures and counts probes
//! so recovery behavior can be exercised without hardware.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use super::card::{
    CardInfo, CardInterface, CardType, EntryKind, EntryMeta, RawDirEntry, TransportMode,
};

const MEM_CARD_CAPACITY: u64 = 32 * 1024 * 1024 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

// ----------------------------------------------------------------------------
// MemMedium: the card contents
// ----------------------------------------------------------------------------

struct MediumState {
    present: bool,
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

/// Shared in-memory card contents.
#[derive(Clone)]
pub struct MemMedium {
    inner: Arc<Mutex<MediumState>>,
}

impl Default for MemMedium {
    fn default() -> Self {
        Self::new()
    }
}

impl MemMedium {
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());
        Self {
            inner: Arc::new(Mutex::new(MediumState {
                present: true,
                files: BTreeMap::new(),
                dirs,
            })),
        }
    }

    /// Physically insert or pull the card.
    pub fn set_present(&self, present: bool) {
        lock(&self.inner).present = present;
    }

    pub fn is_present(&self) -> bool {
        lock(&self.inner).present
    }

    /// Place a file, creating parent directories.
    pub fn put_file(&self, path: &str, bytes: &[u8]) {
        let path = normalize(path);
        let mut state = lock(&self.inner);
        let mut parent = parent_of(&path);
        while parent != "/" {
            state.dirs.insert(parent.clone());
            parent = parent_of(&parent);
        }
        state.files.insert(path, bytes.to_vec());
    }

    pub fn create_dir_all(&self, path: &str) {
        let mut path = normalize(path);
        let mut state = lock(&self.inner);
        while path != "/" {
            state.dirs.insert(path.clone());
            path = parent_of(&path);
        }
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.inner).files.get(&normalize(path)).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        lock(&self.inner).dirs.contains(&normalize(path))
    }

    pub fn file_count(&self) -> usize {
        lock(&self.inner).files.len()
    }
}

// ----------------------------------------------------------------------------
// MemFaults: scripted failures and counters
// ----------------------------------------------------------------------------

#[derive(Default)]
struct FaultState {
    configure_broken: bool,
    mounts_broken: bool,
    fail_next_mounts: u32,
    fail_next_root_probes: u32,
    fail_next_opens: u32,
    write_limit: Option<usize>,
    mount_attempts: u32,
    root_probes: u32,
    unmounts: u32,
}

/// Fault script and counters for one `MemCard` interface.
#[derive(Clone, Default)]
pub struct MemFaults {
    inner: Arc<Mutex<FaultState>>,
}

impl MemFaults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin configuration fails until cleared.
    pub fn break_configure(&self, broken: bool) {
        lock(&self.inner).configure_broken = broken;
    }

    /// Every mount fails until cleared.
    pub fn break_mounts(&self, broken: bool) {
        lock(&self.inner).mounts_broken = broken;
    }

    /// The next `count` mounts fail.
    pub fn fail_next_mounts(&self, count: u32) {
        lock(&self.inner).fail_next_mounts = count;
    }

    /// The next `count` opens of `/` fail as if the card dropped off the bus.
    pub fn fail_next_root_probes(&self, count: u32) {
        lock(&self.inner).fail_next_root_probes = count;
    }

    /// The next `count` opens for writing fail.
    pub fn fail_next_opens(&self, count: u32) {
        lock(&self.inner).fail_next_opens = count;
    }

    /// Cap the bytes any single writer accepts (simulates a full or flaky card).
    pub fn limit_writes(&self, limit: Option<usize>) {
        lock(&self.inner).write_limit = limit;
    }

    pub fn mount_attempts(&self) -> u32 {
        lock(&self.inner).mount_attempts
    }

    /// Number of times `/` was opened (health probes and mount verification).
    pub fn root_probes(&self) -> u32 {
        lock(&self.inner).root_probes
    }

    pub fn unmounts(&self) -> u32 {
        lock(&self.inner).unmounts
    }
}

// ----------------------------------------------------------------------------
// MemCard: one access mode onto a MemMedium
// ----------------------------------------------------------------------------

pub struct MemCard {
    mode: TransportMode,
    medium: MemMedium,
    faults: MemFaults,
    mounted: bool,
}

impl MemCard {
    pub fn new(mode: TransportMode, medium: MemMedium) -> Self {
        Self {
            mode,
            medium,
            faults: MemFaults::new(),
            mounted: false,
        }
    }

    /// Handle for scripting faults after the card is handed to a transport.
    pub fn faults(&self) -> MemFaults {
        self.faults.clone()
    }

    fn live(&self) -> bool {
        self.mounted && self.medium.is_present()
    }
}

impl CardInterface for MemCard {
    fn mode(&self) -> TransportMode {
        self.mode
    }

    fn pin_summary(&self) -> String {
        format!("in-memory ({})", self.mode)
    }

    fn configure(&mut self) -> bool {
        !lock(&self.faults.inner).configure_broken
    }

    fn mount(&mut self) -> bool {
        let mut faults = lock(&self.faults.inner);
        faults.mount_attempts += 1;
        if faults.mounts_broken {
            return false;
        }
        if faults.fail_next_mounts > 0 {
            faults.fail_next_mounts -= 1;
            return false;
        }
        // Like real hosts, mount reports success even with no card present.
        self.mounted = true;
        true
    }

    fn unmount(&mut self) {
        lock(&self.faults.inner).unmounts += 1;
        self.mounted = false;
    }

    fn card_info(&self) -> Option<CardInfo> {
        if !self.live() {
            return None;
        }
        let used_bytes = lock(&self.medium.inner)
            .files
            .values()
            .map(|data| data.len() as u64)
            .sum();
        Some(CardInfo {
            card_type: CardType::Sdhc,
            total_bytes: MEM_CARD_CAPACITY,
            used_bytes,
        })
    }

    fn stat(&self, path: &str) -> Option<EntryMeta> {
        let path = normalize(path);
        if path == "/" {
            let mut faults = lock(&self.faults.inner);
            faults.root_probes += 1;
            if faults.fail_next_root_probes > 0 {
                faults.fail_next_root_probes -= 1;
                return None;
            }
        }
        if !self.live() {
            return None;
        }
        let state = lock(&self.medium.inner);
        if state.dirs.contains(&path) {
            return Some(EntryMeta {
                kind: EntryKind::Directory,
                size: 0,
            });
        }
        state.files.get(&path).map(|data| EntryMeta {
            kind: EntryKind::File,
            size: data.len() as u64,
        })
    }

    fn read_dir(&self, path: &str) -> Option<Vec<RawDirEntry>> {
        if !self.live() {
            return None;
        }
        let path = normalize(path);
        let state = lock(&self.medium.inner);
        if !state.dirs.contains(&path) {
            return None;
        }
        let bare = |full: &str| full.rsplit('/').next().unwrap_or(full).to_string();
        let report = |full: &str| match self.mode {
            TransportMode::Bus => bare(full),
            TransportMode::Serial => full.to_string(),
        };
        let mut entries: Vec<RawDirEntry> = state
            .dirs
            .iter()
            .filter(|dir| dir.as_str() != "/" && parent_of(dir) == path)
            .map(|dir| RawDirEntry {
                name: report(dir),
                kind: EntryKind::Directory,
                size: 0,
            })
            .collect();
        entries.extend(
            state
                .files
                .iter()
                .filter(|(file, _)| parent_of(file) == path)
                .map(|(file, data)| RawDirEntry {
                    name: report(file),
                    kind: EntryKind::File,
                    size: data.len() as u64,
                }),
        );
        Some(entries)
    }

    fn open_read(&self, path: &str) -> Option<Box<dyn Read + Send>> {
        if !self.live() {
            return None;
        }
        let data = self.medium.file(path)?;
        Some(Box::new(Cursor::new(data)))
    }

    fn open_write(&self, path: &str) -> Option<Box<dyn Write + Send>> {
        if !self.live() {
            return None;
        }
        let write_limit = {
            let mut faults = lock(&self.faults.inner);
            if faults.fail_next_opens > 0 {
                faults.fail_next_opens -= 1;
                return None;
            }
            faults.write_limit
        };
        let path = normalize(path);
        {
            let mut state = lock(&self.medium.inner);
            if !state.dirs.contains(&parent_of(&path)) || state.dirs.contains(&path) {
                return None;
            }
            state.files.insert(path.clone(), Vec::new());
        }
        Some(Box::new(MemWriter {
            medium: self.medium.clone(),
            path,
            written: 0,
            limit: write_limit,
        }))
    }

    fn remove(&self, path: &str) -> bool {
        if !self.live() {
            return false;
        }
        let path = normalize(path);
        let mut state = lock(&self.medium.inner);
        if state.files.remove(&path).is_some() {
            return true;
        }
        let has_children = state.files.keys().any(|f| parent_of(f) == path)
            || state.dirs.iter().any(|d| d != "/" && parent_of(d) == path);
        if path != "/" && !has_children {
            return state.dirs.remove(&path);
        }
        false
    }

    fn mkdir(&self, path: &str) -> bool {
        if !self.live() {
            return false;
        }
        let path = normalize(path);
        let mut state = lock(&self.medium.inner);
        if !state.dirs.contains(&parent_of(&path))
            || state.dirs.contains(&path)
            || state.files.contains_key(&path)
        {
            return false;
        }
        state.dirs.insert(path)
    }
}

/// Writes land on the medium immediately, so a short write leaves the bytes
/// accepted so far in place.
struct MemWriter {
    medium: MemMedium,
    path: String,
    written: usize,
    limit: Option<usize>,
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let accept = match self.limit {
            Some(limit) => buf.len().min(limit.saturating_sub(self.written)),
            None => buf.len(),
        };
        if accept == 0 && !buf.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "card full"));
        }
        let mut state = lock(&self.medium.inner);
        let Some(file) = state.files.get_mut(&self.path) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "file removed"));
        };
        file.extend_from_slice(&buf[..accept]);
        self.written += accept;
        Ok(accept)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
