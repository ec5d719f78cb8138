//! Snapshots of the state files.
//!
//! Each snapshot is a `tar.gz` of whichever [`STATE_FILES`] exist at the time,
//! with a SHA-256 checksum recorded in `backups.json` next to the archives.
//! `syrupnet reset` always takes one before deleting state.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use super::STATE_FILES;

const METADATA_FILE: &str = "backups.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub reason: BackupReason,
    pub checksum: String,
    pub verified: bool,
    /// State files captured in the archive.
    pub files: Vec<String>,
    /// Archive path relative to the backup directory.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupReason {
    Manual,
    PreReset,
}

pub struct BackupManager {
    data_dir: PathBuf,
    backup_dir: PathBuf,
    max_backups: usize,
    backups: HashMap<String, BackupMetadata>,
}

impl BackupManager {
    pub fn new(data_dir: PathBuf, backup_dir: PathBuf, max_backups: usize) -> io::Result<Self> {
        fs::create_dir_all(&backup_dir)?;
        let mut manager = Self {
            data_dir,
            backup_dir,
            max_backups,
            backups: HashMap::new(),
        };
        manager.load_metadata()?;
        Ok(manager)
    }

    fn load_metadata(&mut self) -> io::Result<()> {
        let metadata_path = self.backup_dir.join(METADATA_FILE);
        if metadata_path.exists() {
            let contents = fs::read_to_string(&metadata_path)?;
            self.backups = serde_json::from_str(&contents)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
        Ok(())
    }

    fn save_metadata(&self) -> io::Result<()> {
        let contents = serde_json::to_string_pretty(&self.backups)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        super::write_file_locked(&self.backup_dir.join(METADATA_FILE), &contents)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    pub fn create_backup(
        &mut self,
        name: Option<String>,
        reason: BackupReason,
    ) -> io::Result<BackupMetadata> {
        let timestamp = Utc::now();
        let base = format!("state_{}", timestamp.format("%Y%m%d_%H%M%S_%3f"));
        let mut id = base.clone();
        let mut n = 1;
        while self.backups.contains_key(&id) || self.backup_dir.join(format!("{}.tar.gz", id)).exists() {
            id = format!("{}_{}", base, n);
            n += 1;
        }
        let filename = format!("{}.tar.gz", id);
        let backup_file = self.backup_dir.join(&filename);

        log::info!("Creating state backup: {} ({:?})", id, reason);

        let tar_gz = File::create(&backup_file)?;
        let enc = GzEncoder::new(tar_gz, Compression::default());
        let mut tar = Builder::new(enc);
        let mut files = Vec::new();
        for name in STATE_FILES {
            let path = self.data_dir.join(name);
            if path.is_file() {
                tar.append_path_with_name(&path, name)?;
                files.push(name.to_string());
            }
        }
        // Finish the archive before hashing it.
        let enc = tar.into_inner()?;
        enc.finish()?;

        let checksum = calculate_checksum(&backup_file)?;
        let size_bytes = fs::metadata(&backup_file)?.len();
        let metadata = BackupMetadata {
            id: id.clone(),
            name,
            created_at: timestamp,
            size_bytes,
            reason,
            checksum,
            verified: false,
            files,
            path: PathBuf::from(&filename),
        };
        self.backups.insert(id.clone(), metadata.clone());
        self.save_metadata()?;

        log::info!(
            "State backup {} holds {} file(s), {} bytes",
            id,
            metadata.files.len(),
            size_bytes
        );
        Ok(metadata)
    }

    pub fn verify_backup(&mut self, backup_id: &str) -> io::Result<bool> {
        let metadata = self
            .backups
            .get(backup_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Backup not found"))?;
        let backup_file = self.backup_dir.join(&metadata.path);
        if !backup_file.exists() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "Backup file missing"));
        }

        let valid = calculate_checksum(&backup_file)? == metadata.checksum;
        if valid {
            if let Some(meta) = self.backups.get_mut(backup_id) {
                meta.verified = true;
            }
            self.save_metadata()?;
        } else {
            log::error!("Backup verification FAILED: {} (checksum mismatch)", backup_id);
        }
        Ok(valid)
    }

    /// Unpack a snapshot into `restore_path` (usually the data directory).
    pub fn restore_backup(&self, backup_id: &str, restore_path: &Path) -> io::Result<()> {
        let metadata = self
            .backups
            .get(backup_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Backup not found"))?;
        let backup_file = self.backup_dir.join(&metadata.path);
        if !backup_file.exists() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "Backup file missing"));
        }
        if calculate_checksum(&backup_file)? != metadata.checksum {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Backup checksum mismatch",
            ));
        }

        log::info!("Restoring state backup {} to {:?}", backup_id, restore_path);
        fs::create_dir_all(restore_path)?;
        let dec = GzDecoder::new(File::open(&backup_file)?);
        Archive::new(dec).unpack(restore_path)?;
        Ok(())
    }

    /// Keep only the newest `max_backups` snapshots. Returns the removed ids.
    pub fn prune(&mut self) -> io::Result<Vec<String>> {
        let mut all: Vec<_> = self.backups.values().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let doomed: Vec<String> = all
            .iter()
            .skip(self.max_backups)
            .map(|b| b.id.clone())
            .collect();

        for backup_id in &doomed {
            if let Some(metadata) = self.backups.remove(backup_id) {
                let backup_file = self.backup_dir.join(&metadata.path);
                if backup_file.exists() {
                    fs::remove_file(&backup_file)?;
                }
                log::info!("Pruned old state backup: {}", backup_id);
            }
        }
        if !doomed.is_empty() {
            self.save_metadata()?;
        }
        Ok(doomed)
    }

    /// Newest first.
    pub fn list_backups(&self) -> Vec<BackupMetadata> {
        let mut backups: Vec<_> = self.backups.values().cloned().collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        backups
    }

    pub fn get_backup(&self, backup_id: &str) -> Option<&BackupMetadata> {
        self.backups.get(backup_id)
    }
}

fn calculate_checksum(path: &Path) -> io::Result<String> {
    use sha2::{Digest, Sha256};

    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 8192];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CONNECTIONS_FILE, RECORD_STATUS_FILE};
    use tempfile::TempDir;

    fn seed_state(dir: &Path) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(CONNECTIONS_FILE), br#"{"devices":[]}"#).unwrap();
        fs::write(dir.join(RECORD_STATUS_FILE), br#"{"r1":"success"}"#).unwrap();
        fs::write(dir.join("unrelated.log"), b"not state").unwrap();
    }

    #[test]
    fn backup_captures_only_state_files() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("data");
        seed_state(&data);
        let mut manager =
            BackupManager::new(data.clone(), data.join("backups"), 5).unwrap();
        let meta = manager
            .create_backup(Some("before".into()), BackupReason::Manual)
            .unwrap();
        assert_eq!(meta.files, vec![CONNECTIONS_FILE, RECORD_STATUS_FILE]);
        assert!(meta.size_bytes > 0);
        assert!(manager.verify_backup(&meta.id).unwrap());
        assert!(manager.get_backup(&meta.id).unwrap().verified);
    }

    #[test]
    fn restore_brings_back_deleted_state() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("data");
        seed_state(&data);
        let mut manager =
            BackupManager::new(data.clone(), temp.path().join("backups"), 5).unwrap();
        let meta = manager.create_backup(None, BackupReason::PreReset).unwrap();
        fs::remove_file(data.join(RECORD_STATUS_FILE)).unwrap();

        manager.restore_backup(&meta.id, &data).unwrap();
        assert_eq!(
            fs::read_to_string(data.join(RECORD_STATUS_FILE)).unwrap(),
            r#"{"r1":"success"}"#
        );
    }

    #[test]
    fn tampered_archive_fails_verification() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("data");
        seed_state(&data);
        let backups = temp.path().join("backups");
        let mut manager = BackupManager::new(data, backups.clone(), 5).unwrap();
        let meta = manager.create_backup(None, BackupReason::Manual).unwrap();
        fs::write(backups.join(&meta.path), b"garbage").unwrap();
        assert!(!manager.verify_backup(&meta.id).unwrap());
    }

    #[test]
    fn prune_keeps_newest() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("data");
        seed_state(&data);
        let backups = temp.path().join("backups");
        let mut manager = BackupManager::new(data.clone(), backups.clone(), 2).unwrap();
        for i in 0..4 {
            manager
                .create_backup(Some(format!("b{}", i)), BackupReason::Manual)
                .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let removed = manager.prune().unwrap();
        assert_eq!(removed.len(), 2);
        let names: Vec<_> = manager
            .list_backups()
            .into_iter()
            .filter_map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["b3", "b2"]);

        // Metadata survives a reopen.
        let reopened = BackupManager::new(data, backups, 2).unwrap();
        assert_eq!(reopened.list_backups().len(), 2);
    }
}
