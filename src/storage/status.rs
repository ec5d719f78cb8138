//! Restart-safe transmission status for records and their items.
//!
//! Record status lives in `transmission_status.json` (record id → status), item
//! status in `medicine_transmission_status.json` (record id → item code → state).
//! Every mutation is written through immediately.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::{Storage, ITEM_STATUS_FILE, RECORD_STATUS_FILE};
use crate::device::FailureReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmissionStatus {
    #[default]
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    InProgress,
    Success,
    Failed,
    Unregistered,
}

impl fmt::Display for TransmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransmissionStatus::Pending => "pending",
            TransmissionStatus::Success => "success",
            TransmissionStatus::Failed => "failed",
        })
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in-progress",
            ItemStatus::Success => "success",
            ItemStatus::Failed => "failed",
            ItemStatus::Unregistered => "unregistered",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemState {
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    /// Dispense commands the device accepted for this item.
    #[serde(default)]
    pub sends: u32,
    pub updated_at: DateTime<Utc>,
}

impl ItemState {
    fn new(status: ItemStatus) -> Self {
        Self {
            status,
            reason: None,
            sends: 0,
            updated_at: Utc::now(),
        }
    }
}

type ItemMap = BTreeMap<String, BTreeMap<String, ItemState>>;

#[derive(Debug, Default)]
pub struct StatusStore {
    records: BTreeMap<String, TransmissionStatus>,
    items: ItemMap,
    storage: Option<Storage>,
}

impl StatusStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load both maps. Items left in progress by an interrupted run come back as failed.
    pub fn load(storage: &Storage) -> anyhow::Result<Self> {
        let records: BTreeMap<String, TransmissionStatus> = storage.load_json(RECORD_STATUS_FILE)?;
        let mut items: ItemMap = storage.load_json(ITEM_STATUS_FILE)?;
        let mut interrupted = 0usize;
        for state in items.values_mut().flat_map(|m| m.values_mut()) {
            if state.status == ItemStatus::InProgress {
                state.status = ItemStatus::Failed;
                state.reason = Some(FailureReason::Interrupted);
                interrupted += 1;
            }
        }
        if interrupted > 0 {
            warn!(
                "{} item(s) were in flight when the last run stopped; marked failed",
                interrupted
            );
        }
        debug!(
            "Loaded status for {} record(s), {} with item detail",
            records.len(),
            items.len()
        );
        Ok(Self {
            records,
            items,
            storage: Some(storage.clone()),
        })
    }

    /// Write both maps; failures are logged and the in-memory state stays authoritative.
    pub fn persist(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        if let Err(e) = storage.save_json(RECORD_STATUS_FILE, &self.records) {
            warn!("Failed to persist record status: {}", e);
        }
        if let Err(e) = storage.save_json(ITEM_STATUS_FILE, &self.items) {
            warn!("Failed to persist item status: {}", e);
        }
    }

    pub fn record_status(&self, record_id: &str) -> TransmissionStatus {
        self.records.get(record_id).copied().unwrap_or_default()
    }

    pub fn set_record_status(&mut self, record_id: &str, status: TransmissionStatus) {
        self.records.insert(record_id.to_string(), status);
        self.persist();
    }

    pub fn item_state(&self, record_id: &str, item_code: &str) -> Option<&ItemState> {
        self.items.get(record_id).and_then(|m| m.get(item_code))
    }

    pub fn item_status(&self, record_id: &str, item_code: &str) -> ItemStatus {
        self.item_state(record_id, item_code)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    pub fn items(&self, record_id: &str) -> Option<&BTreeMap<String, ItemState>> {
        self.items.get(record_id)
    }

    pub fn records(&self) -> impl Iterator<Item = (&String, &TransmissionStatus)> {
        self.records.iter()
    }

    /// Unconditionally set an item's status. Does not count a send.
    pub fn set_item_status(
        &mut self,
        record_id: &str,
        item_code: &str,
        status: ItemStatus,
        reason: Option<FailureReason>,
    ) {
        let entry = self.entry(record_id, item_code);
        entry.status = status;
        entry.reason = if status == ItemStatus::Failed { reason } else { None };
        entry.updated_at = Utc::now();
        self.persist();
    }

    /// Apply a dispatch outcome. Without `force`, a failure never replaces an
    /// earlier success. A success counts one send. Returns whether the state changed.
    pub fn set_item_result(
        &mut self,
        record_id: &str,
        item_code: &str,
        status: ItemStatus,
        reason: Option<FailureReason>,
        force: bool,
    ) -> bool {
        let entry = self.entry(record_id, item_code);
        if !force && status == ItemStatus::Failed && entry.status == ItemStatus::Success {
            debug!(
                "Keeping success for {}/{} over a later failure",
                record_id, item_code
            );
            return false;
        }
        entry.status = status;
        entry.reason = if status == ItemStatus::Failed { reason } else { None };
        if status == ItemStatus::Success {
            entry.sends = entry.sends.saturating_add(1);
        }
        entry.updated_at = Utc::now();
        self.persist();
        true
    }

    fn entry(&mut self, record_id: &str, item_code: &str) -> &mut ItemState {
        self.items
            .entry(record_id.to_string())
            .or_default()
            .entry(item_code.to_string())
            .or_insert_with(|| ItemState::new(ItemStatus::Pending))
    }

    /// Put a record back to pending. `items` pairs each item code with whether it is
    /// currently registered; unregistered items are recomputed, not reset.
    pub fn reset_record<'a, I>(&mut self, record_id: &str, items: I)
    where
        I: IntoIterator<Item = (&'a str, bool)>,
    {
        let now = Utc::now();
        let map = self.items.entry(record_id.to_string()).or_default();
        for (code, registered) in items {
            let state = map
                .entry(code.to_string())
                .or_insert_with(|| ItemState::new(ItemStatus::Pending));
            state.status = if registered {
                ItemStatus::Pending
            } else {
                ItemStatus::Unregistered
            };
            state.reason = None;
            state.updated_at = now;
        }
        self.records
            .insert(record_id.to_string(), TransmissionStatus::Pending);
        self.persist();
    }
}
