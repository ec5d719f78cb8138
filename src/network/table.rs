//! Live connection table, one entry per normalized hardware address.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    /// A dispense command is outstanding; health checks leave it alone.
    Busy,
    Unreachable,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Busy => "busy",
            ConnectionStatus::Unreachable => "unreachable",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionEntry {
    pub normalized_address: String,
    pub network_address: String,
    pub status: ConnectionStatus,
    pub updated_at: DateTime<Utc>,
    /// Bumped each time the entry turns busy, so a stale release timer cannot
    /// free a device that a later dispatch claimed again.
    #[serde(skip)]
    busy_token: u64,
}

#[derive(Debug, Default)]
pub struct ConnectionTable {
    entries: BTreeMap<String, ConnectionEntry>,
    next_token: u64,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &str) -> Option<&ConnectionEntry> {
        self.entries.get(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.entries.contains_key(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn status(&self, address: &str) -> Option<ConnectionStatus> {
        self.entries.get(address).map(|e| e.status)
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.status(address) == Some(ConnectionStatus::Connected)
    }

    /// Create the entry or point it at a new network address, marking it connected.
    pub fn upsert_connected(&mut self, address: &str, network_address: &str) {
        let now = Utc::now();
        self.entries
            .entry(address.to_string())
            .and_modify(|e| {
                e.network_address = network_address.to_string();
                e.status = ConnectionStatus::Connected;
                e.updated_at = now;
            })
            .or_insert_with(|| ConnectionEntry {
                normalized_address: address.to_string(),
                network_address: network_address.to_string(),
                status: ConnectionStatus::Connected,
                updated_at: now,
                busy_token: 0,
            });
    }

    pub fn set_network_address(&mut self, address: &str, network_address: &str) -> bool {
        match self.entries.get_mut(address) {
            Some(e) if e.network_address != network_address => {
                e.network_address = network_address.to_string();
                e.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Returns the previous status if the entry exists.
    pub fn set_status(
        &mut self,
        address: &str,
        status: ConnectionStatus,
    ) -> Option<ConnectionStatus> {
        let entry = self.entries.get_mut(address)?;
        let previous = entry.status;
        if previous != status {
            entry.status = status;
            entry.updated_at = Utc::now();
        }
        Some(previous)
    }

    /// Claim a connected device for a dispense. Returns its network address and
    /// the token that must be presented to release it.
    pub fn mark_busy(&mut self, address: &str) -> Option<(String, u64)> {
        let entry = self.entries.get_mut(address)?;
        if entry.status != ConnectionStatus::Connected {
            return None;
        }
        self.next_token += 1;
        entry.status = ConnectionStatus::Busy;
        entry.busy_token = self.next_token;
        entry.updated_at = Utc::now();
        Some((entry.network_address.clone(), self.next_token))
    }

    /// Busy → connected, only if the entry is still held under `token`.
    pub fn release_busy(&mut self, address: &str, token: u64) -> bool {
        match self.entries.get_mut(address) {
            Some(e) if e.status == ConnectionStatus::Busy && e.busy_token == token => {
                e.status = ConnectionStatus::Connected;
                e.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, address: &str) -> Option<ConnectionEntry> {
        self.entries.remove(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}
