//! Language-slot preferences.
//! Two language tags and the active slot live under fixed keys, read once
//! at startup with defaults and written on every change. Writes go through
//! a write-behind flush thread that coalesces bursts, so the control
//! thread never waits on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel as cb;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

pub const KEY_PRIMARY_LANGUAGE: &str = "language.primary";
pub const KEY_SECONDARY_LANGUAGE: &str = "language.secondary";
pub const KEY_ACTIVE_SLOT: &str = "language.activeSlot";

pub const DEFAULT_PRIMARY_LANGUAGE: &str = "de-CH";
pub const DEFAULT_SECONDARY_LANGUAGE: &str = "en-US";

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "preference store IO error: {e}"),
            StoreError::Parse(e) => write!(f, "preference store parse error: {e}"),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Parse(e)
    }
}

/// Storage seam: a flat string key-value store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, entries: &[(String, String)]) -> Result<(), StoreError>;
}

/// JSON-file-backed store. The whole map loads once at open; reads are
/// served from memory.
pub struct JsonFileStore {
    path: PathBuf,
    cache: RwLock<HashMap<String, String>>,
}

impl JsonFileStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let cache = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(StoreError::Io(e)),
        };
        Ok(Self {
            path: path.to_path_buf(),
            cache: RwLock::new(cache),
        })
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.cache.read().get(key).cloned()
    }

    fn put(&self, entries: &[(String, String)]) -> Result<(), StoreError> {
        let snapshot = {
            let mut cache = self.cache.write();
            for (key, value) in entries {
                cache.insert(key.clone(), value.clone());
            }
            cache.clone()
        };
        let content = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

/// In-memory preferences with write-behind persistence.
pub struct Preferences {
    primary: String,
    secondary: String,
    active_slot: u8,
    writer: Option<cb::Sender<Vec<(String, String)>>>,
    flush_thread: Option<JoinHandle<()>>,
}

impl Preferences {
    /// Read the three keys (falling back to defaults) and start the flush
    /// thread.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let primary = store
            .get(KEY_PRIMARY_LANGUAGE)
            .unwrap_or_else(|| DEFAULT_PRIMARY_LANGUAGE.to_string());
        let secondary = store
            .get(KEY_SECONDARY_LANGUAGE)
            .unwrap_or_else(|| DEFAULT_SECONDARY_LANGUAGE.to_string());
        let active_slot = store
            .get(KEY_ACTIVE_SLOT)
            .and_then(|raw| raw.parse::<u8>().ok())
            .filter(|slot| (1..=2).contains(slot))
            .unwrap_or(1);

        let (tx, rx) = cb::unbounded();
        let flush_thread = std::thread::Builder::new()
            .name("prefs-flush".into())
            .spawn(move || run_flush_loop(rx, store))
            .expect("failed to spawn prefs flush thread");

        info!(primary = %primary, secondary = %secondary, active_slot, "preferences loaded");
        Self {
            primary,
            secondary,
            active_slot,
            writer: Some(tx),
            flush_thread: Some(flush_thread),
        }
    }

    pub fn active_language(&self) -> &str {
        if self.active_slot == 1 {
            &self.primary
        } else {
            &self.secondary
        }
    }

    pub fn inactive_language(&self) -> &str {
        if self.active_slot == 1 {
            &self.secondary
        } else {
            &self.primary
        }
    }

    pub fn active_slot(&self) -> u8 {
        self.active_slot
    }

    pub fn languages(&self) -> (&str, &str) {
        (&self.primary, &self.secondary)
    }

    /// Toggle the active slot; persisted immediately.
    pub fn switch_slot(&mut self) -> u8 {
        self.active_slot = if self.active_slot == 1 { 2 } else { 1 };
        self.enqueue(vec![(
            KEY_ACTIVE_SLOT.to_string(),
            self.active_slot.to_string(),
        )]);
        self.active_slot
    }

    /// Replace a slot's language tag; persisted immediately.
    pub fn set_language(&mut self, slot: u8, tag: &str) {
        let key = match slot {
            1 => {
                self.primary = tag.to_string();
                KEY_PRIMARY_LANGUAGE
            }
            2 => {
                self.secondary = tag.to_string();
                KEY_SECONDARY_LANGUAGE
            }
            _ => {
                warn!(slot, "ignoring unknown language slot");
                return;
            }
        };
        self.enqueue(vec![(key.to_string(), tag.to_string())]);
    }

    fn enqueue(&self, entries: Vec<(String, String)>) {
        if let Some(writer) = &self.writer {
            let _ = writer.send(entries);
        }
    }

    /// Drain pending writes and stop the flush thread.
    pub fn flush_and_close(&mut self) {
        self.writer.take();
        if let Some(handle) = self.flush_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Preferences {
    fn drop(&mut self) {
        self.flush_and_close();
    }
}

/// Flush loop: coalesces bursts of writes into one store put. Exits when
/// the sender side is dropped, after draining what is queued.
fn run_flush_loop(rx: cb::Receiver<Vec<(String, String)>>, store: Arc<dyn KeyValueStore>) {
    while let Ok(first) = rx.recv() {
        let mut batch = first;
        while let Ok(more) = rx.try_recv() {
            batch.extend(more);
        }
        match store.put(&batch) {
            Ok(()) => debug!(entries = batch.len(), "preferences_flushed"),
            Err(e) => warn!(error = %e, "preference write failed"),
        }
    }
}
