//! # Dispense Module - Per-Item Dispatch State Machine
//!
//! Each targeted item moves through
//!
//! ```text
//! pending ─┬─> unregistered                (no device bound to the code)
//!          ├─> failed (no quantity)        (quantity read as zero)
//!          ├─> failed (over limit)         (quantity above the configured max)
//!          ├─> failed (not connected)      (bound device is not connected)
//!          └─> in-progress ─┬─> success    (device answered 200; busy for the hold)
//!                           └─> failed     (any other answer; released at once)
//! ```
//!
//! Lines sharing an item code are one item here: their quantities are summed
//! into a single command. Eligible items go out in parallel, one command per
//! item. Runs are serialized
//! so two dispatches never target the same item concurrently, and every run
//! (re)starts the health monitor cooldown.

use futures::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::device::{normalize_address, DeviceTransport, FailureReason, TransportError};
use crate::fleet::{Fleet, FleetState};
use crate::metrics;
use crate::network::Cooldown;
use crate::prescription::{ItemGroup, PrescriptionRecord};
use crate::storage::{ItemStatus, TransmissionStatus};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispenseError {
    #[error("device {0} is not registered")]
    UnknownDevice(String),
    #[error("device {0} is not connected")]
    NotConnected(String),
    #[error("amount {amount} exceeds the limit of {limit}")]
    OverLimit { amount: u32, limit: u32 },
    #[error("amount must be greater than zero")]
    InvalidAmount,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub code: String,
    pub name: String,
    /// Prescription lines merged into this item.
    pub lines: usize,
    pub total_quantity: u32,
    /// Normalized address of the device the command went to, if any.
    pub device: Option<String>,
    pub status: ItemStatus,
    pub reason: Option<FailureReason>,
}

/// Aggregate of one dispatch run.
#[derive(Debug, Clone, Serialize)]
pub struct DispenseReport {
    pub record_id: String,
    pub status: TransmissionStatus,
    pub succeeded: usize,
    /// Every failure, including items that were never sent.
    pub failed: usize,
    /// Failures because the bound device was not connected.
    pub not_connected: usize,
    pub unregistered: usize,
    pub items: Vec<ItemReport>,
}

impl DispenseReport {
    fn new(record_id: &str) -> Self {
        Self {
            record_id: record_id.to_string(),
            status: TransmissionStatus::Pending,
            succeeded: 0,
            failed: 0,
            not_connected: 0,
            unregistered: 0,
            items: Vec::new(),
        }
    }

    fn push(&mut self, item: &ItemGroup<'_>, device: Option<String>, status: ItemStatus, reason: Option<FailureReason>) {
        match status {
            ItemStatus::Success => self.succeeded += 1,
            ItemStatus::Failed => {
                self.failed += 1;
                if reason == Some(FailureReason::NotConnected) {
                    self.not_connected += 1;
                }
            }
            ItemStatus::Unregistered => self.unregistered += 1,
            _ => {}
        }
        self.items.push(ItemReport {
            code: item.code.to_string(),
            name: item.name.to_string(),
            lines: item.lines,
            total_quantity: item.total_quantity,
            device,
            status,
            reason,
        });
    }

    pub fn is_success(&self) -> bool {
        self.status == TransmissionStatus::Success
    }
}

impl fmt::Display for DispenseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} (success {}, failed {}, not connected {}, unregistered {})",
            self.record_id,
            self.status,
            self.succeeded,
            self.failed,
            self.not_connected,
            self.unregistered
        )?;
        for item in &self.items {
            write!(f, "  {:<12} {:>5}  {}", item.code, item.total_quantity, item.status)?;
            if let Some(reason) = item.reason {
                write!(f, " ({})", reason)?;
            }
            if let Some(device) = &item.device {
                write!(f, " via {}", device)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Which items of a record a run targets.
enum Selection<'a> {
    All,
    Failed,
    Codes(&'a HashSet<String>),
}

struct Job<'a> {
    item: ItemGroup<'a>,
    address: String,
    network_address: String,
    token: u64,
    prior: ItemStatus,
}

pub struct Dispenser {
    fleet: Arc<Fleet>,
    transport: Arc<dyn DeviceTransport>,
    cooldown: Arc<Cooldown>,
    busy_hold: Duration,
    max_volume: u32,
    run_lock: tokio::sync::Mutex<()>,
}

impl Dispenser {
    pub fn new(
        fleet: Arc<Fleet>,
        transport: Arc<dyn DeviceTransport>,
        cooldown: Arc<Cooldown>,
        busy_hold: Duration,
        max_volume: u32,
    ) -> Self {
        Self {
            fleet,
            transport,
            cooldown,
            busy_hold,
            max_volume,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn max_volume(&self) -> u32 {
        self.max_volume
    }

    /// First-pass dispatch of every item in the record.
    pub async fn dispense_record(&self, record: &PrescriptionRecord) -> DispenseReport {
        self.run(record, Selection::All, false).await
    }

    /// Re-send items currently marked failed.
    pub async fn retry_failed(&self, record: &PrescriptionRecord) -> DispenseReport {
        self.run(record, Selection::Failed, true).await
    }

    /// Re-send the chosen items whatever their current status.
    pub async fn retry_selected(&self, record: &PrescriptionRecord, codes: &[String]) -> DispenseReport {
        let codes: HashSet<String> = codes.iter().cloned().collect();
        self.run(record, Selection::Codes(&codes), true).await
    }

    /// One command to one device, outside any record.
    pub async fn dispense_manual(&self, address: &str, amount: u32) -> Result<(), DispenseError> {
        if amount == 0 {
            return Err(DispenseError::InvalidAmount);
        }
        if amount > self.max_volume {
            return Err(DispenseError::OverLimit {
                amount,
                limit: self.max_volume,
            });
        }
        let key = normalize_address(address);
        let _run = self.run_lock.lock().await;

        let (network_address, token) = {
            let mut state = self.fleet.lock();
            if !state.registry.contains(&key) {
                return Err(DispenseError::UnknownDevice(key));
            }
            state
                .table
                .mark_busy(&key)
                .ok_or_else(|| DispenseError::NotConnected(key.clone()))?
        };
        self.cooldown.start();

        metrics::inc_dispatch_sent();
        match self.transport.dispense(&network_address, amount).await {
            Ok(()) => {
                metrics::inc_dispatch_succeeded();
                info!("Manual dispense of {} accepted by {}", amount, key);
                self.schedule_release(key, token);
                Ok(())
            }
            Err(e) => {
                metrics::inc_dispatch_failed();
                warn!("Manual dispense to {} failed: {}", key, e);
                self.fleet.lock().table.release_busy(&key, token);
                Err(e.into())
            }
        }
    }

    async fn run(&self, record: &PrescriptionRecord, selection: Selection<'_>, force: bool) -> DispenseReport {
        let _run = self.run_lock.lock().await;
        self.cooldown.start();

        let rid = record.record_id.as_str();
        let mut report = DispenseReport::new(rid);
        let mut jobs: Vec<Job<'_>> = Vec::new();
        {
            let mut state = self.fleet.lock();
            for item in record.item_groups() {
                if !self.selected(&state, rid, &item, &selection) {
                    continue;
                }
                self.triage(&mut state, rid, item, force, &mut report, &mut jobs);
            }
        }

        if !jobs.is_empty() {
            info!("Dispatching {} item(s) of {}", jobs.len(), rid);
        }
        let transport = self.transport.as_ref();
        let outcomes = join_all(jobs.iter().map(|job| {
            metrics::inc_dispatch_sent();
            transport.dispense(&job.network_address, job.item.total_quantity)
        }))
        .await;

        let mut state = self.fleet.lock();
        for (job, outcome) in jobs.into_iter().zip(outcomes) {
            let code = job.item.code;
            match outcome {
                Ok(()) => {
                    metrics::inc_dispatch_succeeded();
                    state
                        .statuses
                        .set_item_result(rid, code, ItemStatus::Success, None, true);
                    debug!("{}/{} accepted by {}", rid, code, job.address);
                    report.push(&job.item, Some(job.address.clone()), ItemStatus::Success, None);
                    self.schedule_release(job.address, job.token);
                }
                Err(e) => {
                    metrics::inc_dispatch_failed();
                    let reason = e.reason();
                    warn!("{}/{} failed on {}: {}", rid, code, job.address, e);
                    state.table.release_busy(&job.address, job.token);
                    if !force && job.prior == ItemStatus::Success {
                        // An earlier success stands; the item is not failed.
                        state
                            .statuses
                            .set_item_status(rid, code, ItemStatus::Success, None);
                        report.push(&job.item, Some(job.address), ItemStatus::Success, Some(reason));
                    } else {
                        state
                            .statuses
                            .set_item_result(rid, code, ItemStatus::Failed, Some(reason), true);
                        report.push(&job.item, Some(job.address), ItemStatus::Failed, Some(reason));
                    }
                }
            }
        }

        if report.items.is_empty() {
            report.status = state.statuses.record_status(rid);
            debug!("{}: nothing selected, status stays {}", rid, report.status);
            return report;
        }
        let any_failed = record
            .items
            .iter()
            .any(|i| state.statuses.item_status(rid, &i.code) == ItemStatus::Failed);
        report.status = if any_failed {
            TransmissionStatus::Failed
        } else {
            TransmissionStatus::Success
        };
        state.statuses.set_record_status(rid, report.status);
        info!(
            "{} finished {}: {} success, {} failed, {} unregistered",
            rid, report.status, report.succeeded, report.failed, report.unregistered
        );
        report
    }

    fn selected(&self, state: &FleetState, rid: &str, item: &ItemGroup<'_>, selection: &Selection<'_>) -> bool {
        match selection {
            Selection::All => true,
            Selection::Codes(codes) => codes.contains(item.code),
            // Unregistered items are reported again so the caller sees them.
            Selection::Failed => {
                !state.registry.is_item_registered(item.code)
                    || state.statuses.item_status(rid, item.code) == ItemStatus::Failed
            }
        }
    }

    /// Settle an item that cannot be sent, or claim its device and queue it.
    fn triage<'a>(
        &self,
        state: &mut FleetState,
        rid: &str,
        item: ItemGroup<'a>,
        force: bool,
        report: &mut DispenseReport,
        jobs: &mut Vec<Job<'a>>,
    ) {
        let code = item.code;
        if !state.registry.is_item_registered(code) {
            state
                .statuses
                .set_item_status(rid, code, ItemStatus::Unregistered, None);
            report.push(&item, None, ItemStatus::Unregistered, None);
            return;
        }
        if item.total_quantity == 0 {
            warn!("{}/{} has no quantity to send", rid, code);
            self.settle_unsent(state, rid, &item, FailureReason::NoQuantity, force, report);
            return;
        }
        if item.total_quantity > self.max_volume {
            warn!(
                "{}/{} quantity {} exceeds limit {}",
                rid, code, item.total_quantity, self.max_volume
            );
            self.settle_unsent(state, rid, &item, FailureReason::OverLimit, force, report);
            return;
        }

        let device = state
            .registry
            .devices_for_item(code)
            .map(|d| d.normalized_address.clone())
            .find(|addr| state.table.is_connected(addr));
        let claimed = device.and_then(|addr| {
            state
                .table
                .mark_busy(&addr)
                .map(|(network_address, token)| (addr, network_address, token))
        });
        let Some((address, network_address, token)) = claimed else {
            self.settle_unsent(state, rid, &item, FailureReason::NotConnected, force, report);
            return;
        };

        let prior = state.statuses.item_status(rid, code);
        state
            .statuses
            .set_item_status(rid, code, ItemStatus::InProgress, None);
        jobs.push(Job {
            item,
            address,
            network_address,
            token,
            prior,
        });
    }

    /// Fail an item without sending it. On a first pass an earlier success stands.
    fn settle_unsent(
        &self,
        state: &mut FleetState,
        rid: &str,
        item: &ItemGroup<'_>,
        reason: FailureReason,
        force: bool,
        report: &mut DispenseReport,
    ) {
        let status = if state
            .statuses
            .set_item_result(rid, item.code, ItemStatus::Failed, Some(reason), force)
        {
            ItemStatus::Failed
        } else {
            ItemStatus::Success
        };
        report.push(item, None, status, Some(reason));
    }

    /// Busy → connected once the physical dispense should be over.
    fn schedule_release(&self, address: String, token: u64) {
        let fleet = Arc::clone(&self.fleet);
        let hold = self.busy_hold;
        tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            if fleet.lock().table.release_busy(&address, token) {
                debug!("{} back to connected after {:?}", address, hold);
            }
        });
    }
}
