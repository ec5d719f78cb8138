//! Durable identity registry: normalized hardware address → nickname + item code.
//!
//! Persisted to `connections.json` together with the set of devices the user
//! disconnected by hand, which discovery must not silently reconnect.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use super::{Storage, CONNECTIONS_FILE};
use crate::device::normalize_address;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub normalized_address: String,
    pub nickname: String,
    pub item_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_network_address: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("hardware address is empty")]
    EmptyAddress,
    #[error("nickname is required")]
    EmptyNickname,
    #[error("item code is required")]
    EmptyItemCode,
    #[error("device {0} is not registered")]
    UnknownDevice(String),
    #[error("device {0} is connected; disconnect it first")]
    StillConnected(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    devices: Vec<DeviceIdentity>,
    #[serde(default)]
    manually_disconnected: Vec<String>,
}

#[derive(Debug, Default)]
pub struct IdentityRegistry {
    devices: BTreeMap<String, DeviceIdentity>,
    manually_disconnected: BTreeSet<String>,
    storage: Option<Storage>,
}

impl IdentityRegistry {
    /// Registry that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn load(storage: &Storage) -> anyhow::Result<Self> {
        let file: RegistryFile = storage.load_json(CONNECTIONS_FILE)?;
        let mut devices = BTreeMap::new();
        for mut d in file.devices {
            d.normalized_address = normalize_address(&d.normalized_address);
            if d.normalized_address.is_empty() {
                continue;
            }
            // Later duplicates of the same address overwrite earlier ones.
            devices.insert(d.normalized_address.clone(), d);
        }
        let manually_disconnected = file
            .manually_disconnected
            .iter()
            .map(|a| normalize_address(a))
            .filter(|a| !a.is_empty())
            .collect();
        Ok(Self {
            devices,
            manually_disconnected,
            storage: Some(storage.clone()),
        })
    }

    /// Write the registry; failures are logged and the in-memory copy stays authoritative.
    pub fn persist(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        let file = RegistryFile {
            devices: self.devices.values().cloned().collect(),
            manually_disconnected: self.manually_disconnected.iter().cloned().collect(),
        };
        if let Err(e) = storage.save_json(CONNECTIONS_FILE, &file) {
            warn!("Failed to persist device registry: {}", e);
        }
    }

    /// Create or update a binding. An existing last-known network address is kept
    /// unless a new one is supplied.
    pub fn save(
        &mut self,
        address: &str,
        nickname: &str,
        item_code: &str,
        network_address: Option<&str>,
    ) -> Result<DeviceIdentity, RegistryError> {
        let key = normalize_address(address);
        if key.is_empty() {
            return Err(RegistryError::EmptyAddress);
        }
        let nickname = nickname.trim();
        let item_code = item_code.trim();
        if nickname.is_empty() {
            return Err(RegistryError::EmptyNickname);
        }
        if item_code.is_empty() {
            return Err(RegistryError::EmptyItemCode);
        }
        let previous = self
            .devices
            .get(&key)
            .and_then(|d| d.last_known_network_address.clone());
        let identity = DeviceIdentity {
            normalized_address: key.clone(),
            nickname: nickname.to_string(),
            item_code: item_code.to_string(),
            last_known_network_address: network_address.map(str::to_string).or(previous),
        };
        info!(
            "Registered device {} as '{}' for item {}",
            key, identity.nickname, identity.item_code
        );
        self.devices.insert(key, identity.clone());
        self.persist();
        Ok(identity)
    }

    /// Remove a binding. Returns the removed identity.
    pub fn delete(&mut self, address: &str) -> Option<DeviceIdentity> {
        let key = normalize_address(address);
        let removed = self.devices.remove(&key);
        if removed.is_some() {
            self.manually_disconnected.remove(&key);
            info!("Forgot device {}", key);
            self.persist();
        }
        removed
    }

    pub fn get(&self, address: &str) -> Option<&DeviceIdentity> {
        self.devices.get(&normalize_address(address))
    }

    pub fn contains(&self, address: &str) -> bool {
        self.devices.contains_key(&normalize_address(address))
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceIdentity> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Registered devices serving `item_code`, in address order.
    pub fn devices_for_item<'a>(&'a self, item_code: &'a str) -> impl Iterator<Item = &'a DeviceIdentity> + 'a {
        self.devices.values().filter(move |d| d.item_code == item_code)
    }

    pub fn is_item_registered(&self, item_code: &str) -> bool {
        self.devices_for_item(item_code).next().is_some()
    }

    /// Record where a device was last seen. Persists only when the address changed.
    pub fn update_network_address(&mut self, address: &str, network_address: &str) -> bool {
        let key = normalize_address(address);
        let Some(device) = self.devices.get_mut(&key) else {
            return false;
        };
        if device.last_known_network_address.as_deref() == Some(network_address) {
            return false;
        }
        device.last_known_network_address = Some(network_address.to_string());
        self.persist();
        true
    }

    pub fn is_manually_disconnected(&self, address: &str) -> bool {
        self.manually_disconnected
            .contains(&normalize_address(address))
    }

    pub fn set_manually_disconnected(&mut self, address: &str, disconnected: bool) {
        let key = normalize_address(address);
        let changed = if disconnected {
            self.manually_disconnected.insert(key)
        } else {
            self.manually_disconnected.remove(&key)
        };
        if changed {
            self.persist();
        }
    }
}
