//! # Service Module - Coordinator Loop
//!
//! [`Coordinator`] wires the shared fleet state to the recurring jobs and runs
//! them from a single `tokio::select!` loop:
//!
//! - scan tick: discovery pass, reconciliation and bounded reconnects
//! - health tick: one single-flight health cycle (skipped during cooldown)
//! - ingest tick: poll the prescription directory and queue auto-dispatch
//! - auto-dispatch completions: log the batch reports
//! - Ctrl-C: persist and stop
//!
//! Scans and health cycles run on spawned tasks so a slow subnet never holds
//! up ingestion.

pub mod auto;

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::Config;
use crate::device::DeviceTransport;
use crate::dispense::{DispenseReport, Dispenser};
use crate::fleet::Fleet;
use crate::metrics;
use crate::network::health::CycleOutcome;
use crate::network::reconcile::{connect_registered, refresh};
use crate::network::{Cooldown, HealthMonitor, ReconcileOutcome, SubnetPrefix};
use crate::prescription::{Ingestor, PrescriptionRecord};
use crate::storage::{AutoDispenseSettings, Storage, TransmissionStatus};

use auto::{start_auto_dispatcher, AutoDispatchHandle};

pub struct Coordinator {
    config: Config,
    storage: Storage,
    fleet: Arc<Fleet>,
    transport: Arc<dyn DeviceTransport>,
    health: Arc<HealthMonitor>,
    dispenser: Arc<Dispenser>,
    ingestor: Ingestor,
    auto_settings: AutoDispenseSettings,
    auto: AutoDispatchHandle,
    completions: mpsc::UnboundedReceiver<DispenseReport>,
    ingest_dir: Option<PathBuf>,
    selected_date: Option<NaiveDate>,
    prefix: Option<SubnetPrefix>,
    scan_running: Arc<tokio::sync::Mutex<()>>,
}

impl Coordinator {
    /// Load persisted state and build every component. Must be called inside a
    /// tokio runtime (the auto-dispatch task is spawned here).
    pub fn new(config: Config, storage: Storage, transport: Arc<dyn DeviceTransport>) -> Result<Self> {
        let fleet = Arc::new(Fleet::load(&storage, config.network.max_reconnect_attempts)?);
        let auto_settings = storage.load_auto_dispense(config.dispense.max_volume)?;
        let cooldown = Arc::new(Cooldown::new(config.health.cooldown()));

        let health = Arc::new(HealthMonitor::new(
            fleet.clone(),
            transport.clone(),
            config.health.timeout_backoff(),
            cooldown.clone(),
        ));
        let dispenser = Arc::new(Dispenser::new(
            fleet.clone(),
            transport.clone(),
            cooldown,
            config.dispense.busy_hold(),
            auto_settings.max_volume,
        ));
        let ingestor = Ingestor::from_config(&config.ingest)?;

        let (report_tx, completions) = mpsc::unbounded_channel();
        let auto = start_auto_dispatcher(dispenser.clone(), config.ingest.settle_delay(), report_tx);

        let ingest_dir = match storage.load_ingest_path()? {
            Some(dir) => Some(dir),
            None => config.ingest.directory.as_ref().map(PathBuf::from),
        };
        let prefix = if config.network.prefix.trim().is_empty() {
            SubnetPrefix::detect()
        } else {
            Some(
                config
                    .network
                    .prefix
                    .parse()
                    .map_err(|e| anyhow!("network.prefix: {}", e))?,
            )
        };

        Ok(Self {
            config,
            storage,
            fleet,
            transport,
            health,
            dispenser,
            ingestor,
            auto_settings,
            auto,
            completions,
            ingest_dir,
            selected_date: None,
            prefix,
            scan_running: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn fleet(&self) -> &Arc<Fleet> {
        &self.fleet
    }

    pub fn dispenser(&self) -> &Arc<Dispenser> {
        &self.dispenser
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    pub fn prefix(&self) -> Option<SubnetPrefix> {
        self.prefix
    }

    pub fn selected_date(&self) -> Option<NaiveDate> {
        self.selected_date
    }

    pub fn set_auto_dispatch(&mut self, enabled: bool) {
        self.auto_settings.enabled = enabled;
    }

    /// Connect every registered device at its last known address.
    pub async fn startup(&self) {
        let results = connect_registered(&self.fleet, self.transport.as_ref()).await;
        for (address, result) in results {
            if let Err(e) = result {
                debug!("Initial connect to {} failed: {}", address, e);
            }
        }
    }

    /// One discovery pass against the configured or detected prefix.
    pub async fn scan_once(&self) -> Option<ReconcileOutcome> {
        let prefix = self.prefix?;
        Some(refresh(&self.fleet, self.transport.as_ref(), &prefix).await)
    }

    /// Poll the ingest directory. New records for the selected date are queued
    /// for auto-dispatch when it is enabled. Returns the ids ingested.
    pub async fn poll_ingest(&mut self) -> Vec<String> {
        let Some(dir) = self.ingest_dir.clone() else {
            return Vec::new();
        };
        let added = match self.ingestor.poll(&dir).await {
            Ok(added) => added,
            Err(e) => {
                warn!("Prescription poll failed: {}", e);
                return Vec::new();
            }
        };
        if added.is_empty() {
            return added;
        }
        if let Some(date) = self.ingestor.latest_date(&added) {
            if self.selected_date != Some(date) {
                info!("Selected date is now {}", date);
            }
            self.selected_date = Some(date);
        }
        if self.auto_settings.enabled {
            self.queue_auto(&added);
        }
        added
    }

    fn queue_auto(&self, added: &[String]) {
        for id in added {
            let Some(record) = self.ingestor.record(id) else {
                continue;
            };
            if record.receipt_date.is_none() || record.receipt_date != self.selected_date {
                continue;
            }
            // Records dispatched before a restart are read again but not resent.
            let status = self.fleet.lock().statuses.record_status(id);
            if status != TransmissionStatus::Pending {
                debug!("{} already {}; not auto-dispatching", id, status);
                continue;
            }
            if !self.auto.enqueue(record.clone()) {
                error!("Auto-dispatch queue is closed; {} not sent", id);
            }
        }
    }

    /// Read `<record_id>.<ext>` from the ingest directory unless it is already
    /// loaded. Only that file is touched; nothing is queued for auto-dispatch.
    pub async fn load_record(&mut self, record_id: &str) -> Result<PrescriptionRecord> {
        if let Some(record) = self.ingestor.record(record_id) {
            return Ok(record.clone());
        }
        let dir = self
            .ingest_dir
            .clone()
            .ok_or_else(|| anyhow!("No prescription directory configured"))?;
        let path = dir.join(format!("{}.{}", record_id, self.ingestor.format().extension()));
        self.ingestor.ingest(&path).await?;
        self.ingestor
            .record(record_id)
            .cloned()
            .ok_or_else(|| anyhow!("Record {} not found", record_id))
    }

    /// Load a record by id and run a first-pass dispatch of it.
    pub async fn dispense_record_id(&mut self, record_id: &str) -> Result<DispenseReport> {
        let record = self.load_record(record_id).await?;
        Ok(self.dispenser.dispense_record(&record).await)
    }

    fn spawn_scan(&self) {
        let Some(prefix) = self.prefix else {
            return;
        };
        let Ok(guard) = self.scan_running.clone().try_lock_owned() else {
            debug!("Scan still running; skipping tick");
            return;
        };
        let fleet = self.fleet.clone();
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let outcome = refresh(&fleet, transport.as_ref(), &prefix).await;
            if !outcome.created.is_empty()
                || !outcome.recovered.is_empty()
                || !outcome.downgraded.is_empty()
            {
                info!(
                    "Scan {}.0/24: {} new, {} back, {} unreachable, {} unregistered",
                    prefix,
                    outcome.created.len(),
                    outcome.recovered.len(),
                    outcome.downgraded.len(),
                    outcome.unknown.len()
                );
            }
        });
    }

    fn spawn_health(&self) {
        let health = self.health.clone();
        tokio::spawn(async move {
            if let CycleOutcome::Ran(report) = health.run_cycle().await {
                if !report.removed.is_empty() || !report.unreachable.is_empty() {
                    info!(
                        "Health: {} checked, {} unreachable, {} removed",
                        report.checked,
                        report.unreachable.len(),
                        report.removed.len()
                    );
                }
            }
        });
    }

    fn log_report(report: &DispenseReport) {
        if report.is_success() {
            info!("Auto-dispatch {}", report.to_string().trim_end());
        } else {
            warn!("Auto-dispatch {}", report.to_string().trim_end());
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!(
            "syrupnet started (data dir {}, auto-dispatch {})",
            self.storage.data_dir().display(),
            if self.auto_settings.enabled { "on" } else { "off" }
        );
        match self.prefix {
            Some(prefix) => info!("Scanning {}.0/24", prefix),
            None => warn!("Could not determine the local subnet; discovery disabled"),
        }
        match &self.ingest_dir {
            Some(dir) => info!("Watching {}", dir.display()),
            None => warn!("No prescription directory configured"),
        }

        self.startup().await;

        let mut scan_tick = interval(self.config.network.scan_interval());
        scan_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health_tick = interval(self.config.health.interval());
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ingest_tick = interval(self.config.ingest.poll_interval());
        ingest_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = scan_tick.tick() => {
                    self.spawn_scan();
                    debug!("Metrics: {:?}", metrics::snapshot());
                }
                _ = health_tick.tick() => {
                    self.spawn_health();
                }
                _ = ingest_tick.tick() => {
                    self.poll_ingest().await;
                }
                report = self.completions.recv() => {
                    if let Some(report) = report {
                        Self::log_report(&report);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        let state = self.fleet.lock();
        state.registry.persist();
        state.statuses.persist();
        info!("syrupnet stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockTransport;
    use std::time::Duration;

    fn config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.network.prefix = "10.0.0".to_string();
        config.ingest.directory = Some(dir.to_string_lossy().into_owned());
        config.ingest.auto_dispatch_settle_ms = 1;
        config
    }

    #[tokio::test]
    async fn ingested_records_are_auto_dispatched_once() {
        let data = tempfile::tempdir().unwrap();
        let inbox = tempfile::tempdir().unwrap();
        let storage = Storage::open(data.path()).unwrap();
        let mock = Arc::new(MockTransport::new());
        mock.add_device("10.0.0.7", "AA:BB:CC:00:00:07");

        let mut coord = Coordinator::new(config(inbox.path()), storage.clone(), mock.clone()).unwrap();
        coord
            .fleet()
            .register("AABBCC000007", "left", "SYR1", Some("10.0.0.7"))
            .unwrap();
        coord.startup().await;
        coord.set_auto_dispatch(true);

        std::fs::write(
            inbox.path().join("20240105_0001.txt"),
            "Kim\nSYR1\\Syrup\\5\\3\\2\\30\\20240105\\1\n",
        )
        .unwrap();
        assert_eq!(coord.poll_ingest().await, vec!["20240105_0001"]);
        assert_eq!(coord.selected_date(), NaiveDate::from_ymd_opt(2024, 1, 5));

        let report = tokio::time::timeout(Duration::from_secs(5), coord.completions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(mock.dispense_log(), vec![("10.0.0.7".to_string(), 30)]);

        // A fresh coordinator re-reads the file but does not resend it.
        let mut again = Coordinator::new(config(inbox.path()), storage, mock.clone()).unwrap();
        again.set_auto_dispatch(true);
        assert_eq!(again.poll_ingest().await.len(), 1);
        assert!(again.completions.try_recv().is_err());
        assert_eq!(mock.dispense_log().len(), 1);
    }

    #[tokio::test]
    async fn one_shot_dispense_by_record_id() {
        let data = tempfile::tempdir().unwrap();
        let inbox = tempfile::tempdir().unwrap();
        let storage = Storage::open(data.path()).unwrap();
        let mock = Arc::new(MockTransport::new());
        let mut coord = Coordinator::new(config(inbox.path()), storage, mock).unwrap();

        std::fs::write(inbox.path().join("R1.txt"), "Park\nX\\n\\1\\1\\1\\4\\d\\1\n").unwrap();
        let report = coord.dispense_record_id("R1").await.unwrap();
        assert_eq!(report.unregistered, 1);
        assert!(coord.dispense_record_id("missing").await.is_err());
    }

    #[tokio::test]
    async fn loading_one_record_never_auto_dispatches_others() {
        let data = tempfile::tempdir().unwrap();
        let inbox = tempfile::tempdir().unwrap();
        let storage = Storage::open(data.path()).unwrap();
        storage
            .save_auto_dispense(&AutoDispenseSettings {
                enabled: true,
                max_volume: 100,
            })
            .unwrap();
        let mock = Arc::new(MockTransport::new());
        mock.add_device("10.0.0.7", "AA:BB:CC:00:00:07");
        for n in 1..=2 {
            std::fs::write(
                inbox.path().join(format!("20240105_000{}.txt", n)),
                "Kim\nSYR1\\Syrup\\5\\3\\2\\30\\20240105\\1\n",
            )
            .unwrap();
        }

        let mut coord = Coordinator::new(config(inbox.path()), storage, mock.clone()).unwrap();
        coord
            .fleet()
            .register("AABBCC000007", "left", "SYR1", Some("10.0.0.7"))
            .unwrap();
        coord.startup().await;

        let record = coord.load_record("20240105_0001").await.unwrap();
        assert_eq!(coord.ingestor().len(), 1);
        let report = coord.dispenser().retry_failed(&record).await;
        assert_eq!(report.succeeded + report.failed, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(coord.completions.try_recv().is_err());
        assert!(mock.dispense_log().is_empty());
    }
}
