//! Periodic re-probing of table entries.
//!
//! A cycle never overlaps another (single-flight via `try_lock`), never probes a
//! busy device, and does not run at all while the post-dispense [`Cooldown`]
//! is active.

use futures::future::join_all;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use super::ConnectionStatus;
use crate::device::{DeviceTransport, IdentityReport, TransportError};
use crate::fleet::Fleet;
use crate::metrics;

/// Cancelable suppression window. Starting it while active pushes the deadline
/// out to a full window from now.
#[derive(Debug)]
pub struct Cooldown {
    window: Duration,
    deadline: Mutex<Option<Instant>>,
}

impl Cooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut deadline = self.deadline.lock().unwrap_or_else(PoisonError::into_inner);
        if deadline.map_or(false, |d| d > Instant::now()) {
            debug!("Cooldown restarted");
        }
        *deadline = Some(Instant::now() + self.window);
    }

    pub fn cancel(&self) {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn remaining(&self) -> Option<Duration> {
        let deadline = *self.deadline.lock().unwrap_or_else(PoisonError::into_inner);
        deadline.and_then(|d| d.checked_duration_since(Instant::now()))
            .filter(|r| !r.is_zero())
    }

    pub fn is_active(&self) -> bool {
        self.remaining().is_some()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub checked: usize,
    pub skipped_busy: usize,
    pub connected: Vec<String>,
    pub unreachable: Vec<String>,
    /// Entries whose address now answers as a different device.
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Ran(HealthReport),
    CoolingDown,
    AlreadyRunning,
}

pub struct HealthMonitor {
    fleet: Arc<Fleet>,
    transport: Arc<dyn DeviceTransport>,
    backoff: Duration,
    cooldown: Arc<Cooldown>,
    running: tokio::sync::Mutex<()>,
}

impl HealthMonitor {
    pub fn new(
        fleet: Arc<Fleet>,
        transport: Arc<dyn DeviceTransport>,
        backoff: Duration,
        cooldown: Arc<Cooldown>,
    ) -> Self {
        Self {
            fleet,
            transport,
            backoff,
            cooldown,
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn cooldown(&self) -> &Arc<Cooldown> {
        &self.cooldown
    }

    pub async fn run_cycle(&self) -> CycleOutcome {
        if let Some(left) = self.cooldown.remaining() {
            debug!("Health check suppressed for another {:?}", left);
            return CycleOutcome::CoolingDown;
        }
        let Ok(_guard) = self.running.try_lock() else {
            debug!("Health check already running");
            return CycleOutcome::AlreadyRunning;
        };

        let mut report = HealthReport::default();
        let targets: Vec<(String, String)> = {
            let state = self.fleet.lock();
            state
                .table
                .iter()
                .filter(|e| {
                    let busy = e.status == ConnectionStatus::Busy;
                    if busy {
                        report.skipped_busy += 1;
                    }
                    !busy
                })
                .map(|e| (e.normalized_address.clone(), e.network_address.clone()))
                .collect()
        };
        report.checked = targets.len();

        let transport = self.transport.as_ref();
        let results = join_all(
            targets
                .iter()
                .map(|(_, net)| probe_with_retry(transport, net, self.backoff)),
        )
        .await;

        let mut state = self.fleet.lock();
        for ((hw, net), result) in targets.into_iter().zip(results) {
            let Some(entry) = state.table.get(&hw) else {
                continue;
            };
            // A dispatch or a scan may have touched the entry while we probed.
            if entry.status == ConnectionStatus::Busy || entry.network_address != net {
                continue;
            }
            let previous = entry.status;
            match result.as_ref().map(IdentityReport::normalized_address) {
                Ok(Some(found)) if found == hw => {
                    state.table.set_status(&hw, ConnectionStatus::Connected);
                    if previous == ConnectionStatus::Unreachable {
                        info!("{} answered again at {}", hw, net);
                    }
                    report.connected.push(hw);
                }
                Ok(Some(found)) => {
                    metrics::inc_identity_mismatches();
                    warn!(
                        "{} now answers as {}; dropping connection entry for {}",
                        net, found, hw
                    );
                    state.table.remove(&hw);
                    report.removed.push(hw);
                }
                Ok(None) | Err(_) => {
                    state.table.set_status(&hw, ConnectionStatus::Unreachable);
                    if previous == ConnectionStatus::Connected {
                        match &result {
                            Err(e) => info!("{} at {} stopped answering: {}", hw, net, e),
                            Ok(_) => info!("{} at {} answered without identity", hw, net),
                        }
                    }
                    report.unreachable.push(hw);
                }
            }
        }
        debug!(
            "Health check: {} checked, {} busy skipped, {} unreachable, {} removed",
            report.checked,
            report.skipped_busy,
            report.unreachable.len(),
            report.removed.len()
        );
        CycleOutcome::Ran(report)
    }
}

/// A timeout gets one more try after `backoff`; other errors are final.
async fn probe_with_retry(
    transport: &dyn DeviceTransport,
    network_address: &str,
    backoff: Duration,
) -> Result<IdentityReport, TransportError> {
    match transport.probe(network_address).await {
        Err(e) if e.is_timeout() => {
            debug!("{} timed out; retrying once", network_address);
            sleep(backoff).await;
            transport.probe(network_address).await
        }
        other => other,
    }
}
