//! Folding scan results into the connection table, explicit connects, and the
//! bounded reconnect budget for devices that dropped off.

use futures::future::join_all;
use log::{debug, info, warn};
use std::collections::HashMap;

use super::{scan_subnet, ConnectError, ConnectionStatus, ScanMap, SubnetPrefix};
use crate::device::{normalize_address, DeviceTransport};
use crate::fleet::{Fleet, FleetState};
use crate::metrics;

/// Explicit reconnect attempts per device. Counts live in memory only, so a
/// restart starts every device with a fresh budget.
#[derive(Debug)]
pub struct ReconnectTracker {
    max_attempts: u32,
    attempts: HashMap<String, u32>,
}

impl ReconnectTracker {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: HashMap::new(),
        }
    }

    pub fn attempts(&self, address: &str) -> u32 {
        self.attempts.get(address).copied().unwrap_or(0)
    }

    pub fn can_attempt(&self, address: &str) -> bool {
        self.attempts(address) < self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Count one attempt; returns the running total.
    pub fn record_attempt(&mut self, address: &str) -> u32 {
        let n = self.attempts.entry(address.to_string()).or_insert(0);
        *n += 1;
        *n
    }

    pub fn reset(&mut self, address: &str) {
        self.attempts.remove(address);
    }
}

/// What one reconciliation pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Registered devices that got a new connected entry.
    pub created: Vec<String>,
    /// Existing connected or busy entries seen again.
    pub refreshed: Vec<String>,
    /// Entries missing from the scan, now unreachable.
    pub downgraded: Vec<String>,
    /// Unreachable entries that answered the scan and are connected again.
    pub recovered: Vec<String>,
    /// Unreachable entries the scan missed; each gets an explicit connect at
    /// its last network address.
    pub reconnect: Vec<String>,
    /// Unreachable entries the scan missed whose reconnect budget is spent.
    pub exhausted: Vec<String>,
    /// Devices the user disconnected by hand.
    pub held_back: Vec<String>,
    /// Scanned devices nobody registered.
    pub unknown: Vec<String>,
}

/// Apply one scan pass to the table. Pure state transition; no I/O beyond the
/// registry persisting updated network addresses.
pub fn reconcile(state: &mut FleetState, scan: &ScanMap) -> ReconcileOutcome {
    let mut out = ReconcileOutcome::default();

    for (hw, hit) in scan {
        let known = state.registry.contains(hw);
        if known {
            state
                .registry
                .update_network_address(hw, &hit.network_address);
        }
        match state.table.status(hw) {
            Some(ConnectionStatus::Connected) | Some(ConnectionStatus::Busy) => {
                if state.table.set_network_address(hw, &hit.network_address) {
                    info!("{} moved to {}", hw, hit.network_address);
                }
                out.refreshed.push(hw.clone());
            }
            Some(ConnectionStatus::Unreachable) => {
                // The scan map is keyed by the reported identity, so this is a match.
                state.table.set_network_address(hw, &hit.network_address);
                state.table.set_status(hw, ConnectionStatus::Connected);
                state.reconnect.reset(hw);
                info!("{} answered at {}; connected again", hw, hit.network_address);
                out.recovered.push(hw.clone());
            }
            None if !known => out.unknown.push(hw.clone()),
            None if state.registry.is_manually_disconnected(hw) => out.held_back.push(hw.clone()),
            None => {
                state.table.upsert_connected(hw, &hit.network_address);
                state.reconnect.reset(hw);
                info!("Connected {} at {}", hw, hit.network_address);
                out.created.push(hw.clone());
            }
        }
    }

    for addr in state.table.addresses() {
        if scan.contains_key(&addr) {
            continue;
        }
        match state.table.status(&addr) {
            Some(ConnectionStatus::Connected) => {
                state.table.set_status(&addr, ConnectionStatus::Unreachable);
                info!("{} did not answer the scan; marked unreachable", addr);
                out.downgraded.push(addr);
            }
            Some(ConnectionStatus::Unreachable) if state.reconnect.can_attempt(&addr) => {
                out.reconnect.push(addr);
            }
            Some(ConnectionStatus::Unreachable) => out.exhausted.push(addr),
            _ => {}
        }
    }

    if !out.unknown.is_empty() {
        debug!("Ignoring unregistered devices: {:?}", out.unknown);
    }
    out
}

/// Probe a registered device where it was last seen and connect it if the
/// address still answers with the same hardware address.
///
/// `silent` marks background connects (startup, auto-reconnect). A non-silent
/// connect is user-initiated and also lifts a manual disconnect.
pub async fn connect_by_address(
    fleet: &Fleet,
    transport: &dyn DeviceTransport,
    address: &str,
    silent: bool,
) -> Result<String, ConnectError> {
    let key = normalize_address(address);
    let target = {
        let state = fleet.lock();
        let identity = state
            .registry
            .get(&key)
            .ok_or_else(|| ConnectError::UnknownDevice(key.clone()))?;
        state
            .table
            .get(&key)
            .map(|e| e.network_address.clone())
            .or_else(|| identity.last_known_network_address.clone())
            .ok_or_else(|| ConnectError::NoNetworkAddress(key.clone()))?
    };

    let result = match transport.probe(&target).await {
        Ok(report) => match report.normalized_address() {
            Some(found) if found == key => Ok(()),
            Some(found) => {
                metrics::inc_identity_mismatches();
                Err(ConnectError::IdentityMismatch {
                    expected: key.clone(),
                    found,
                })
            }
            None => Err(ConnectError::MissingIdentity),
        },
        Err(e) => Err(ConnectError::Transport(e)),
    };
    if let Err(e) = result {
        if silent {
            debug!("Connect {} at {} failed: {}", key, target, e);
        } else {
            warn!("Connect {} at {} failed: {}", key, target, e);
        }
        return Err(e);
    }

    let mut state = fleet.lock();
    if state.table.status(&key) == Some(ConnectionStatus::Busy) {
        state.table.set_network_address(&key, &target);
    } else {
        state.table.upsert_connected(&key, &target);
    }
    state.registry.update_network_address(&key, &target);
    state.reconnect.reset(&key);
    if !silent {
        state.registry.set_manually_disconnected(&key, false);
    }
    info!("Connected {} at {}", key, target);
    Ok(target)
}

/// Spend one reconnect attempt on each address, concurrently.
pub async fn run_reconnects(
    fleet: &Fleet,
    transport: &dyn DeviceTransport,
    addresses: &[String],
) -> Vec<(String, Result<String, ConnectError>)> {
    if addresses.is_empty() {
        return Vec::new();
    }
    let (counts, max) = {
        let mut state = fleet.lock();
        let counts: Vec<u32> = addresses
            .iter()
            .map(|a| state.reconnect.record_attempt(a))
            .collect();
        (counts, state.reconnect.max_attempts())
    };

    let results = join_all(addresses.iter().map(|addr| {
        metrics::inc_reconnect_attempts();
        connect_by_address(fleet, transport, addr, true)
    }))
    .await;

    addresses
        .iter()
        .zip(counts)
        .zip(results)
        .map(|((addr, n), result)| {
            match &result {
                Ok(_) => metrics::inc_reconnect_successes(),
                Err(e) if n >= max => warn!(
                    "Reconnect attempt {}/{} for {} failed ({}); waiting for a manual connect",
                    n, max, addr, e
                ),
                Err(e) => info!("Reconnect attempt {}/{} for {} failed: {}", n, max, addr, e),
            }
            (addr.clone(), result)
        })
        .collect()
}

/// Connect every registered device that was not disconnected by hand and is not
/// already connected, at its last known address.
pub async fn connect_registered(
    fleet: &Fleet,
    transport: &dyn DeviceTransport,
) -> Vec<(String, Result<String, ConnectError>)> {
    let targets: Vec<String> = {
        let state = fleet.lock();
        state
            .registry
            .iter()
            .filter(|d| !state.registry.is_manually_disconnected(&d.normalized_address))
            .filter(|d| d.last_known_network_address.is_some())
            .filter(|d| !state.table.is_connected(&d.normalized_address))
            .map(|d| d.normalized_address.clone())
            .collect()
    };
    let results = join_all(
        targets
            .iter()
            .map(|addr| connect_by_address(fleet, transport, addr, true)),
    )
    .await;
    let ok = results.iter().filter(|r| r.is_ok()).count();
    info!("Initial connection: {}/{} device(s) answered", ok, targets.len());
    targets.into_iter().zip(results).collect()
}

/// Scan, reconcile, and spend reconnect attempts on devices that reappeared.
pub async fn refresh(
    fleet: &Fleet,
    transport: &dyn DeviceTransport,
    prefix: &SubnetPrefix,
) -> ReconcileOutcome {
    let scan = scan_subnet(transport, prefix).await;
    let outcome = {
        let mut state = fleet.lock();
        reconcile(&mut state, &scan)
    };
    run_reconnects(fleet, transport, &outcome.reconnect).await;
    outcome
}
