//! Shared fleet state: identity registry, connection table, status store and
//! reconnect bookkeeping behind one lock.
//!
//! The lock is a plain `std::sync::Mutex`. It is only ever held for short,
//! synchronous updates; network I/O happens with the lock released and the
//! results are applied afterwards.

use anyhow::Result;
use log::info;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::device::normalize_address;
use crate::network::{ConnectionTable, ReconnectTracker};
use crate::storage::{DeviceIdentity, IdentityRegistry, RegistryError, StatusStore, Storage};

pub struct FleetState {
    pub registry: IdentityRegistry,
    pub table: ConnectionTable,
    pub statuses: StatusStore,
    pub reconnect: ReconnectTracker,
}

pub struct Fleet {
    state: Mutex<FleetState>,
}

impl Fleet {
    pub fn new(state: FleetState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Fleet backed by the state files in `storage`.
    pub fn load(storage: &Storage, max_reconnect_attempts: u32) -> Result<Self> {
        let registry = IdentityRegistry::load(storage)?;
        let statuses = StatusStore::load(storage)?;
        info!("Loaded {} registered device(s)", registry.len());
        Ok(Self::new(FleetState {
            registry,
            table: ConnectionTable::new(),
            statuses,
            reconnect: ReconnectTracker::new(max_reconnect_attempts),
        }))
    }

    /// Fleet with no persistence.
    pub fn in_memory(max_reconnect_attempts: u32) -> Self {
        Self::new(FleetState {
            registry: IdentityRegistry::in_memory(),
            table: ConnectionTable::new(),
            statuses: StatusStore::in_memory(),
            reconnect: ReconnectTracker::new(max_reconnect_attempts),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, FleetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(
        &self,
        address: &str,
        nickname: &str,
        item_code: &str,
        network_address: Option<&str>,
    ) -> Result<DeviceIdentity, RegistryError> {
        self.lock()
            .registry
            .save(address, nickname, item_code, network_address)
    }

    /// Drop a binding. Refused while the device still has a connection entry.
    pub fn forget(&self, address: &str) -> Result<DeviceIdentity, RegistryError> {
        let key = normalize_address(address);
        let mut state = self.lock();
        if state.table.contains(&key) {
            return Err(RegistryError::StillConnected(key));
        }
        state.reconnect.reset(&key);
        state
            .registry
            .delete(&key)
            .ok_or(RegistryError::UnknownDevice(key))
    }

    /// Manual disconnect: drop the connection entry and keep discovery from
    /// reconnecting the device until the user connects it again.
    pub fn disconnect(&self, address: &str) -> bool {
        let key = normalize_address(address);
        let mut state = self.lock();
        let removed = state.table.remove(&key).is_some();
        if state.registry.contains(&key) {
            state.registry.set_manually_disconnected(&key, true);
        }
        if removed {
            info!("Disconnected {} by request", key);
        }
        removed
    }
}
