//! # Storage Module - State Persistence Layer
//!
//! Flat JSON/text files under one data directory, one file per concern:
//!
//! ```text
//! data/
//! ├── connections.json                     ← identity registry + manual disconnects
//! ├── transmission_status.json             ← per-record status
//! ├── medicine_transmission_status.json    ← per-record, per-item status
//! ├── prescription_path.txt                ← watched ingestion directory
//! ├── auto_dispensing_settings.json        ← auto-dispense flag + volume limit
//! └── backups/                             ← tar.gz snapshots of the above
//! ```
//!
//! Every file is optional. A missing file loads as the empty/default value, and a
//! file that no longer parses is logged and treated the same way, so a damaged
//! state file never keeps the service from starting.
//!
//! Writes go through [`write_file_locked`]: exclusive `fs2` lock on the target,
//! write to a temp file in the same directory, rename over the target, then
//! fsync the directory.

pub mod backup;
pub mod registry;
pub mod status;

use anyhow::{anyhow, Result};
use fs2::FileExt;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub use registry::{DeviceIdentity, IdentityRegistry, RegistryError};
pub use status::{ItemState, ItemStatus, StatusStore, TransmissionStatus};

pub const CONNECTIONS_FILE: &str = "connections.json";
pub const RECORD_STATUS_FILE: &str = "transmission_status.json";
pub const ITEM_STATUS_FILE: &str = "medicine_transmission_status.json";
pub const INGEST_PATH_FILE: &str = "prescription_path.txt";
pub const AUTO_DISPENSE_FILE: &str = "auto_dispensing_settings.json";

/// Files removed by a reset and captured by a backup.
pub const STATE_FILES: [&str; 5] = [
    CONNECTIONS_FILE,
    RECORD_STATUS_FILE,
    ITEM_STATUS_FILE,
    INGEST_PATH_FILE,
    AUTO_DISPENSE_FILE,
];

/// Handle on the state directory. Cheap to clone; every component that persists
/// something holds its own copy.
#[derive(Debug, Clone)]
pub struct Storage {
    data_dir: PathBuf,
}

/// Auto-dispatch switch and per-item volume ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoDispenseSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_volume")]
    pub max_volume: u32,
}

fn default_max_volume() -> u32 {
    100
}

impl Default for AutoDispenseSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_volume: default_max_volume(),
        }
    }
}

impl Storage {
    /// Open (creating if needed) the state directory.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir).map_err(|e| {
            anyhow!(
                "Failed to create data directory {}: {}",
                data_dir.display(),
                e
            )
        })?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    /// Read a JSON state file; missing or unparseable content yields `T::default()`.
    pub fn load_json<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T> {
        let path = self.path(name);
        match std::fs::read_to_string(&path) {
            Ok(data) => {
                // Guard against any accidental leading NULs
                let cleaned = data.trim_start_matches('\0');
                if cleaned.trim().is_empty() {
                    return Ok(T::default());
                }
                match serde_json::from_str(cleaned) {
                    Ok(v) => Ok(v),
                    Err(e) => {
                        warn!(
                            "Ignoring unreadable state file {}: {}",
                            path.display(),
                            e
                        );
                        Ok(T::default())
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(anyhow!("Failed reading {}: {}", path.display(), e)),
        }
    }

    pub fn save_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)
            .map_err(|e| anyhow!("Failed to serialize {}: {}", name, e))?;
        write_file_locked(&self.path(name), &content)
    }

    /// Watched ingestion directory chosen with `set-path`, if any.
    pub fn load_ingest_path(&self) -> Result<Option<PathBuf>> {
        let path = self.path(INGEST_PATH_FILE);
        match std::fs::read_to_string(&path) {
            Ok(data) => {
                let trimmed = data.trim_matches(|c: char| c == '\0' || c.is_whitespace());
                if trimmed.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(PathBuf::from(trimmed)))
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow!("Failed reading {}: {}", path.display(), e)),
        }
    }

    pub fn save_ingest_path(&self, dir: &Path) -> Result<()> {
        let text = dir
            .to_str()
            .ok_or_else(|| anyhow!("Ingestion path is not valid UTF-8: {}", dir.display()))?;
        write_file_locked(&self.path(INGEST_PATH_FILE), text)
    }

    /// Persisted settings, with `default_max_volume` applied when no file exists yet.
    pub fn load_auto_dispense(&self, default_max_volume: u32) -> Result<AutoDispenseSettings> {
        if !self.path(AUTO_DISPENSE_FILE).exists() {
            return Ok(AutoDispenseSettings {
                enabled: false,
                max_volume: default_max_volume,
            });
        }
        self.load_json(AUTO_DISPENSE_FILE)
    }

    pub fn save_auto_dispense(&self, settings: &AutoDispenseSettings) -> Result<()> {
        self.save_json(AUTO_DISPENSE_FILE, settings)
    }

    /// Delete every state file. Returns the ones that existed.
    pub fn reset_state(&self) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for name in STATE_FILES {
            let path = self.path(name);
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Removed {}", path.display());
                    removed.push(path);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(anyhow!("Failed to remove {}: {}", path.display(), e)),
            }
        }
        Ok(removed)
    }
}

/// Replace `path` with `content` atomically while holding an exclusive lock on it.
pub fn write_file_locked(path: &Path, content: &str) -> Result<()> {
    use std::fs::{self, File, OpenOptions};
    use std::io::Write;

    // Step 1: Open (or create) the destination file to acquire an exclusive lock
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| anyhow!("Failed to open {}: {}", path.display(), e))?;

    lock_file.lock_exclusive()?;

    // Step 2: Create a unique temp file in the same directory
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("state.json");
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                tmp.write_all(content.as_bytes())?;
                tmp.flush()?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
                continue;
            }
            Err(e) => return Err(anyhow!("Failed to create temp file for atomic write: {}", e)),
        }
    };

    // Step 3: Atomically replace the destination with the temp file
    fs::rename(&tmp_path, path)?;

    // Step 4: Fsync the directory to persist the rename (best-effort)
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }

    drop(lock_file);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn missing_files_load_as_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let map: BTreeMap<String, String> = storage.load_json(RECORD_STATUS_FILE).unwrap();
        assert!(map.is_empty());
        assert_eq!(storage.load_ingest_path().unwrap(), None);
        let s = storage.load_auto_dispense(80).unwrap();
        assert!(!s.enabled);
        assert_eq!(s.max_volume, 80);
    }

    #[test]
    fn corrupt_file_loads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        std::fs::write(storage.path(RECORD_STATUS_FILE), "{not json").unwrap();
        let map: BTreeMap<String, String> = storage.load_json(RECORD_STATUS_FILE).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn settings_and_path_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let settings = AutoDispenseSettings {
            enabled: true,
            max_volume: 60,
        };
        storage.save_auto_dispense(&settings).unwrap();
        assert_eq!(storage.load_auto_dispense(100).unwrap(), settings);

        let watched = dir.path().join("rx");
        storage.save_ingest_path(&watched).unwrap();
        assert_eq!(storage.load_ingest_path().unwrap(), Some(watched));
    }

    #[test]
    fn locked_write_replaces_content_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.json");
        write_file_locked(&path, "first").unwrap();
        write_file_locked(&path, "second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn reset_removes_only_existing_state_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage
            .save_auto_dispense(&AutoDispenseSettings::default())
            .unwrap();
        std::fs::write(dir.path().join("keep.txt"), "x").unwrap();
        let removed = storage.reset_state().unwrap();
        assert_eq!(removed, vec![storage.path(AUTO_DISPENSE_FILE)]);
        assert!(dir.path().join("keep.txt").exists());
    }
}
