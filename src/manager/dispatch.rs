//! Event dispatch from drivers to the reconciliation engine.
//!
//! One consumer task drains the driver channel and routes each message to
//! a worker lane picked from its printer id. A lane applies its messages
//! one at a time, so a printer's events land in the order they were
//! emitted while different printers proceed in parallel. Each message is
//! applied in a single transaction, so a bulk unit-state message commits
//! or fails as a whole.

use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::DriverManager;
use crate::drivers::{DriverEvent, PrinterEvent};
use crate::error::Result;
use crate::slots::{ManualConflict, SlotReconciler};

/// Apply one driver message. Returns manual conflicts reported by a bulk update.
pub fn apply_event(conn: &Connection, event: &PrinterEvent) -> Result<Vec<ManualConflict>> {
    let engine = SlotReconciler::new(conn);
    let printer_id = event.printer_id;

    match &event.event {
        DriverEvent::SpoolInserted {
            slot,
            identifiers,
            meta,
        } => {
            engine.apply_spool_inserted(
                &slot.address(printer_id),
                event.event_at,
                identifiers.rfid_uid.as_deref(),
                identifiers.external_id.as_deref(),
                meta.clone(),
            )?;
            Ok(Vec::new())
        }
        DriverEvent::SpoolRemoved { slot, meta } => {
            engine.apply_spool_removed(&slot.address(printer_id), event.event_at, meta.clone())?;
            Ok(Vec::new())
        }
        DriverEvent::UnknownSpoolDetected {
            slot,
            identifiers,
            meta,
        } => {
            engine.apply_unknown_spool_detected(
                &slot.address(printer_id),
                event.event_at,
                identifiers.rfid_uid.as_deref(),
                identifiers.external_id.as_deref(),
                meta.clone(),
            )?;
            Ok(Vec::new())
        }
        DriverEvent::AmsState { ams_units } => {
            let outcome = engine.apply_ams_state(printer_id, ams_units, event.event_at)?;
            Ok(outcome.conflicts)
        }
    }
}

/// Messages buffered per lane before the router waits.
const LANE_CAPACITY: usize = 64;

/// Lane owning a printer's messages. Stable for the lifetime of the dispatcher.
fn lane_for(printer_id: i64, lanes: usize) -> usize {
    printer_id.rem_euclid(lanes as i64) as usize
}

/// Consume the driver channel until every sender is gone, then wait for
/// the lanes to finish what they hold.
pub(super) async fn run(manager: Arc<DriverManager>, mut events: mpsc::Receiver<PrinterEvent>, workers: usize) {
    let workers = workers.max(1);
    let mut lanes = Vec::with_capacity(workers);
    let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(workers);
    for lane in 0..workers {
        let (tx, rx) = mpsc::channel(LANE_CAPACITY);
        lanes.push(tx);
        handles.push(tokio::spawn(run_lane(Arc::clone(&manager), lane, rx)));
    }
    info!("Event dispatcher running with {} workers", workers);

    while let Some(event) = events.recv().await {
        let lane = lane_for(event.printer_id, workers);
        if let Err(e) = lanes[lane].send(event).await {
            error!(
                "Worker {} is gone, dropping {} event for printer {}",
                lane,
                e.0.event.event_type(),
                e.0.printer_id
            );
        }
    }

    debug!("Event channel closed, draining workers");
    drop(lanes);
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Event worker failed: {}", e);
        }
    }
    info!("Event dispatcher stopped");
}

async fn run_lane(manager: Arc<DriverManager>, lane: usize, mut events: mpsc::Receiver<PrinterEvent>) {
    while let Some(event) = events.recv().await {
        manager.handle_event(event).await;
    }
    debug!("Event worker {} stopped", lane);
}

impl DriverManager {
    /// Persist one message and run compensation for any manual conflicts.
    /// Failures are logged and never affect other messages.
    pub async fn handle_event(&self, event: PrinterEvent) {
        let printer_id = event.printer_id;
        let event_type = event.event.event_type();
        let db = self.db.clone();

        let applied =
            tokio::task::spawn_blocking(move || db.transaction(|tx| apply_event(tx, &event))).await;

        let conflicts = match applied {
            Ok(Ok(conflicts)) => conflicts,
            Ok(Err(e)) => {
                error!("Error persisting {} event for printer {}: {}", event_type, printer_id, e);
                return;
            }
            Err(e) => {
                error!("Event worker for printer {} failed: {}", printer_id, e);
                return;
            }
        };
        info!("Handled event {} for printer {}", event_type, printer_id);

        for conflict in conflicts {
            self.compensate(&conflict).await;
        }
    }
}
