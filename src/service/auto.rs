//! Auto-dispatch queue.
//!
//! Records handed over by the ingest poll are dispatched strictly one at a time
//! by a dedicated task, each after a short settle delay. Reports flow back to
//! the coordinator over a channel.

use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::dispense::{DispenseReport, Dispenser};
use crate::prescription::PrescriptionRecord;

#[derive(Clone)]
pub struct AutoDispatchHandle {
    tx: mpsc::UnboundedSender<PrescriptionRecord>,
}

impl AutoDispatchHandle {
    /// Queue a record. Returns false once the dispatcher task has stopped.
    pub fn enqueue(&self, record: PrescriptionRecord) -> bool {
        let id = record.record_id.clone();
        match self.tx.send(record) {
            Ok(()) => {
                debug!("Queued {} for auto-dispatch", id);
                true
            }
            Err(_) => false,
        }
    }
}

pub fn start_auto_dispatcher(
    dispenser: Arc<Dispenser>,
    settle: Duration,
    reports: mpsc::UnboundedSender<DispenseReport>,
) -> AutoDispatchHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<PrescriptionRecord>();

    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            tokio::time::sleep(settle).await;
            info!("Auto-dispatching {}", record.record_id);
            let report = dispenser.dispense_record(&record).await;
            if reports.send(report).is_err() {
                break;
            }
        }
        debug!("Auto-dispatch queue closed");
    });

    AutoDispatchHandle { tx }
}
