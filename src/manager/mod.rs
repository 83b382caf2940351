//! Driver manager.
//!
//! Owns one driver per running printer, their health snapshots and the
//! manual-override cooldown. Built once by the composition root and shared
//! as `Arc<DriverManager>`.

mod cooldown;
mod dispatch;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{DriverSettings, ServiceConfig};
use crate::db::{records, Database, Printer};
use crate::drivers::{
    CameraConfig, Driver, DriverCommand, DriverContext, DriverHealth, DriverRegistry, DriverState, EventSink,
    PrinterEvent,
};
use crate::error::{Result, SyncError};
use crate::slots::ManualConflict;

pub use cooldown::ConflictCooldown;
pub use dispatch::apply_event;

pub struct DriverManager {
    db: Database,
    registry: DriverRegistry,
    settings: DriverSettings,
    workers: usize,
    events: Mutex<Option<mpsc::Sender<PrinterEvent>>>,
    drivers: Mutex<HashMap<i64, Arc<dyn Driver>>>,
    health: Mutex<HashMap<i64, DriverHealth>>,
    states: Mutex<HashMap<i64, DriverState>>,
    printer_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    cooldown: Mutex<ConflictCooldown>,
}

impl DriverManager {
    /// Build the manager and the receiving end of the driver event channel.
    /// Hand the receiver to `spawn_dispatcher`.
    pub fn new(
        db: Database,
        registry: DriverRegistry,
        config: &ServiceConfig,
    ) -> (Arc<Self>, mpsc::Receiver<PrinterEvent>) {
        let (tx, rx) = mpsc::channel(config.dispatch.queue_capacity.max(1));
        let manager = Self {
            db,
            registry,
            settings: config.driver_settings(),
            workers: config.dispatch.workers,
            events: Mutex::new(Some(tx)),
            drivers: Mutex::new(HashMap::new()),
            health: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            printer_locks: Mutex::new(HashMap::new()),
            cooldown: Mutex::new(ConflictCooldown::new(config.manager.conflict_cooldown())),
        };
        (Arc::new(manager), rx)
    }

    /// Start the consumer task for the driver event channel.
    pub fn spawn_dispatcher(self: &Arc<Self>, events: mpsc::Receiver<PrinterEvent>) -> JoinHandle<()> {
        tokio::spawn(dispatch::run(Arc::clone(self), events, self.workers))
    }

    fn printer_lock(&self, printer_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.printer_locks.lock().unwrap().entry(printer_id).or_default())
    }

    fn set_state(&self, printer_id: i64, state: DriverState) {
        self.states.lock().unwrap().insert(printer_id, state);
    }

    pub fn state(&self, printer_id: i64) -> DriverState {
        self.states
            .lock()
            .unwrap()
            .get(&printer_id)
            .copied()
            .unwrap_or(DriverState::Stopped)
    }

    fn driver(&self, printer_id: i64) -> Option<Arc<dyn Driver>> {
        self.drivers.lock().unwrap().get(&printer_id).cloned()
    }

    pub fn is_running(&self, printer_id: i64) -> bool {
        self.drivers.lock().unwrap().contains_key(&printer_id)
    }

    fn record_error(&self, printer: &Printer, message: String) {
        error!("Printer {} ({}): {}", printer.id, printer.driver_key, message);
        self.set_state(printer.id, DriverState::Error);
        self.health
            .lock()
            .unwrap()
            .insert(printer.id, DriverHealth::error(&printer.driver_key, printer.id, message));
    }

    /// Start the printer's driver. Never fails to the caller: problems are
    /// logged and recorded as an error health entry. No automatic retry.
    pub async fn start_printer(&self, printer: &Printer) -> bool {
        let lock = self.printer_lock(printer.id);
        let _guard = lock.lock().await;

        if self.is_running(printer.id) {
            return true;
        }

        let sender = self.events.lock().unwrap().clone();
        let Some(sender) = sender else {
            self.record_error(printer, "Manager is shutting down".to_string());
            return false;
        };

        self.set_state(printer.id, DriverState::Starting);
        let ctx = DriverContext {
            printer_id: printer.id,
            config: printer.driver_config.clone(),
            sink: EventSink::new(printer.id, sender),
            settings: self.settings.clone(),
        };

        let Some(driver) = self.registry.create(&printer.driver_key, ctx) else {
            self.record_error(printer, format!("Driver not found: {}", printer.driver_key));
            return false;
        };

        let started = match driver.validate_config() {
            Ok(()) => driver.start().await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            self.record_error(printer, e.to_string());
            return false;
        }

        self.set_state(printer.id, DriverState::Running);
        self.health.lock().unwrap().insert(printer.id, driver.health());
        self.drivers.lock().unwrap().insert(printer.id, driver);
        info!("Started driver {} for printer {}", printer.driver_key, printer.id);
        true
    }

    /// Stop and drop the printer's driver. Stop failures are logged only.
    pub async fn stop_printer(&self, printer_id: i64) {
        let lock = self.printer_lock(printer_id);
        let _guard = lock.lock().await;

        let driver = self.drivers.lock().unwrap().remove(&printer_id);
        let Some(driver) = driver else {
            return;
        };

        self.set_state(printer_id, DriverState::Stopping);
        match driver.stop().await {
            Ok(()) => info!("Stopped driver for printer {}", printer_id),
            Err(e) => error!("Error stopping driver for printer {}: {}", printer_id, e),
        }
        self.set_state(printer_id, DriverState::Stopped);
        self.health.lock().unwrap().insert(printer_id, driver.health());
        self.cooldown.lock().unwrap().forget_printer(printer_id);
    }

    /// Start drivers for every active, non-deleted printer.
    /// Returns how many are running afterwards.
    pub async fn start_all(&self) -> Result<usize> {
        let db = self.db.clone();
        let printers = tokio::task::spawn_blocking(move || db.with_conn(records::list_active_printers))
            .await
            .map_err(|e| SyncError::Driver(format!("Failed to list printers: {}", e)))??;

        let mut running = 0;
        for printer in &printers {
            if self.start_printer(printer).await {
                running += 1;
            }
        }
        info!("Started {}/{} printer drivers", running, printers.len());
        Ok(running)
    }

    pub async fn stop_all(&self) {
        let ids: Vec<i64> = self.drivers.lock().unwrap().keys().copied().collect();
        for printer_id in ids {
            self.stop_printer(printer_id).await;
        }
    }

    /// Stop every driver and close the event channel so the dispatcher can
    /// drain and exit.
    pub async fn shutdown(&self) {
        self.stop_all().await;
        self.events.lock().unwrap().take();
        info!("Driver manager shut down");
    }

    /// Health per printer, refreshed from running drivers.
    pub fn get_health(&self) -> BTreeMap<i64, DriverHealth> {
        let drivers: Vec<(i64, Arc<dyn Driver>)> = self
            .drivers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, d)| (*id, Arc::clone(d)))
            .collect();

        let mut health = self.health.lock().unwrap();
        for (printer_id, driver) in drivers {
            health.insert(printer_id, driver.health());
        }

        let states = self.states.lock().unwrap();
        health
            .iter()
            .map(|(id, h)| {
                let mut h = h.clone();
                if let Some(state) = states.get(id) {
                    h.state = *state;
                }
                (*id, h)
            })
            .collect()
    }

    /// Forward a command to the printer's driver. False when no driver runs.
    pub async fn send_command(&self, printer_id: i64, command: &DriverCommand) -> bool {
        match self.driver(printer_id) {
            Some(driver) => driver.send_command(command).await,
            None => {
                warn!("No running driver for printer {}, dropping '{}'", printer_id, command.name());
                false
            }
        }
    }

    pub fn camera_config(&self, printer_id: i64) -> Option<CameraConfig> {
        self.driver(printer_id)?.camera_config()
    }

    /// Push a manual assignment back to the printer, at most once per slot
    /// per cooldown window.
    pub async fn compensate(&self, conflict: &ManualConflict) -> bool {
        let Some(driver) = self.driver(conflict.printer_id) else {
            debug!("Printer {}: conflict without running driver", conflict.printer_id);
            return false;
        };
        let Some(command) = driver.compensation_command(conflict) else {
            debug!(
                "Printer {} slot {}: driver has no compensation command",
                conflict.printer_id, conflict.slot_no
            );
            return false;
        };

        let acquired = self
            .cooldown
            .lock()
            .unwrap()
            .try_acquire(conflict.address(), Instant::now());
        if !acquired {
            debug!(
                "Printer {} slot {:?}/{}: compensation on cooldown",
                conflict.printer_id, conflict.ams_unit_no, conflict.slot_no
            );
            return false;
        }

        info!(
            "Printer {} slot {:?}/{}: restoring manual assignment (spool={:?}) via '{}'",
            conflict.printer_id,
            conflict.ams_unit_no,
            conflict.slot_no,
            conflict.spool_id,
            command.name()
        );
        let sent = driver.send_command(&command).await;
        if !sent {
            warn!(
                "Printer {} slot {}: compensation command '{}' failed",
                conflict.printer_id,
                conflict.slot_no,
                command.name()
            );
        }
        sent
    }

    /// Wait (bounded) for the dispatcher to drain after `shutdown`.
    pub async fn join_dispatcher(handle: JoinHandle<()>, timeout: Duration) {
        if tokio::time::timeout(timeout, handle).await.is_err() {
            warn!("Event dispatcher did not drain within {:?}", timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;
    use crate::db::NewSpool;
    use crate::drivers::DriverEvent;
    use crate::slots::{AmsUnitState, SlotAddress, SlotReconciler, SlotState};
    use serde_json::json;

    fn manager() -> (Database, Arc<DriverManager>) {
        let db = Database::open_in_memory().unwrap();
        let (manager, _rx) = DriverManager::new(db.clone(), DriverRegistry::builtin(), &default_config());
        (db, manager)
    }

    fn printer(db: &Database, driver_key: &str, config: serde_json::Value) -> Printer {
        db.with_conn(|conn| {
            let id = records::create_printer(conn, "test", driver_key, &config)?;
            records::get_printer(conn, id)
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_driver_records_error_health() {
        let (db, manager) = manager();
        let p = printer(&db, "octoprint", json!({}));

        assert!(!manager.start_printer(&p).await);
        assert!(!manager.is_running(p.id));
        assert_eq!(manager.state(p.id), DriverState::Error);

        let health = manager.get_health();
        let entry = &health[&p.id];
        assert_eq!(entry.state, DriverState::Error);
        assert_eq!(entry.message.as_deref(), Some("Driver not found: octoprint"));
    }

    #[tokio::test]
    async fn test_invalid_config_is_not_retried() {
        let (db, manager) = manager();
        let p = printer(&db, "bambu", json!({"host": "192.168.1.40"}));

        assert!(!manager.start_printer(&p).await);
        let health = manager.get_health();
        assert_eq!(health[&p.id].state, DriverState::Error);
        assert!(health[&p.id].message.as_deref().unwrap().contains("access_code"));
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let (db, manager) = manager();
        let p = printer(&db, "dummy", json!({}));

        assert!(manager.start_printer(&p).await);
        assert!(manager.start_printer(&p).await);
        assert_eq!(manager.state(p.id), DriverState::Running);
        assert!(manager.get_health()[&p.id].running);

        manager.stop_printer(p.id).await;
        manager.stop_printer(p.id).await;
        assert!(!manager.is_running(p.id));
        assert_eq!(manager.state(p.id), DriverState::Stopped);
        assert!(!manager.get_health()[&p.id].running);
    }

    #[tokio::test]
    async fn test_start_all_skips_inactive_printers() {
        let (db, manager) = manager();
        let a = printer(&db, "dummy", json!({}));
        let b = printer(&db, "dummy", json!({}));
        db.with_conn(|conn| records::set_printer_active(conn, b.id, false)).unwrap();

        assert_eq!(manager.start_all().await.unwrap(), 1);
        assert!(manager.is_running(a.id));
        assert!(!manager.is_running(b.id));

        manager.shutdown().await;
        assert!(!manager.is_running(a.id));
        assert!(!manager.start_printer(&a).await);
    }

    /// Records every command it is asked to send.
    struct RecordingDriver {
        ctx: DriverContext,
        sent: Arc<Mutex<Vec<DriverCommand>>>,
    }

    #[async_trait::async_trait]
    impl Driver for RecordingDriver {
        fn driver_key(&self) -> &'static str {
            "recording"
        }

        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }

        fn health(&self) -> DriverHealth {
            DriverHealth::new("recording", self.ctx.printer_id, true, true)
        }

        async fn send_command(&self, command: &DriverCommand) -> bool {
            self.sent.lock().unwrap().push(command.clone());
            true
        }

        fn compensation_command(&self, conflict: &ManualConflict) -> Option<DriverCommand> {
            Some(DriverCommand::SetSpool {
                tool_index: conflict.slot_no - 1,
                spool_id: conflict.spool_id?,
            })
        }
    }

    fn recording_manager(
        sent: &Arc<Mutex<Vec<DriverCommand>>>,
    ) -> (Database, Arc<DriverManager>, mpsc::Receiver<PrinterEvent>) {
        let db = Database::open_in_memory().unwrap();
        let mut registry = DriverRegistry::empty();
        let sent = Arc::clone(sent);
        registry.register("recording", move |ctx| {
            Arc::new(RecordingDriver {
                ctx,
                sent: Arc::clone(&sent),
            }) as Arc<dyn Driver>
        });
        let (manager, rx) = DriverManager::new(db.clone(), registry, &default_config());
        (db, manager, rx)
    }

    /// A printer with a manually assigned spool in unit 0 slot 1 and a
    /// second, tagged spool the printer will report instead.
    fn manual_slot_fixture(db: &Database) -> (Printer, i64) {
        db.with_conn(|conn| {
            let printer_id = records::create_printer(conn, "bench", "recording", &json!({}))?;
            let fil = records::create_filament(conn, "PLA Basic", "PLA", Some("00AE42"), Some(250.0))?;
            let manual = records::create_spool(conn, &NewSpool::new(fil))?;
            let mut other = NewSpool::new(fil);
            other.rfid_uid = Some("OTHER-TAG".into());
            records::create_spool(conn, &other)?;

            SlotReconciler::new(conn).assign_manual(
                &SlotAddress::new(printer_id, Some(0), 1),
                Some(manual),
                chrono::Utc::now(),
            )?;
            Ok((records::get_printer(conn, printer_id)?, manual))
        })
        .unwrap()
    }

    fn conflicting_report(printer_id: i64) -> PrinterEvent {
        PrinterEvent {
            printer_id,
            event_at: chrono::Utc::now(),
            event: DriverEvent::AmsState {
                ams_units: vec![AmsUnitState {
                    ams_unit_no: 0,
                    slots_total: 4,
                    slots: vec![SlotState {
                        slot_no: 1,
                        present: true,
                        rfid_uid: Some("OTHER-TAG".into()),
                        external_id: None,
                        meta: None,
                    }],
                }],
            },
        }
    }

    #[tokio::test]
    async fn test_manual_conflict_compensates_once_per_window() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (db, manager, _rx) = recording_manager(&sent);
        let (printer, manual) = manual_slot_fixture(&db);
        assert!(manager.start_printer(&printer).await);

        manager.handle_event(conflicting_report(printer.id)).await;
        manager.handle_event(conflicting_report(printer.id)).await;

        let sent = sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![DriverCommand::SetSpool {
                tool_index: 0,
                spool_id: manual
            }]
        );

        // The manual assignment survives both reports.
        let assignment = db
            .with_conn(|conn| SlotReconciler::new(conn).assignment_at(&SlotAddress::new(printer.id, Some(0), 1)))
            .unwrap()
            .unwrap();
        assert_eq!(assignment.spool_id, Some(manual));
        assert!(assignment.is_manual());
    }

    #[tokio::test]
    async fn test_empty_report_on_manual_slot_compensates_once() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (db, manager, _rx) = recording_manager(&sent);
        let (printer, manual) = manual_slot_fixture(&db);
        assert!(manager.start_printer(&printer).await);

        let empty_report = || PrinterEvent {
            printer_id: printer.id,
            event_at: chrono::Utc::now(),
            event: DriverEvent::AmsState {
                ams_units: vec![AmsUnitState {
                    ams_unit_no: 0,
                    slots_total: 4,
                    slots: vec![SlotState::empty(1)],
                }],
            },
        };
        manager.handle_event(empty_report()).await;
        manager.handle_event(empty_report()).await;

        assert_eq!(
            sent.lock().unwrap().clone(),
            vec![DriverCommand::SetSpool {
                tool_index: 0,
                spool_id: manual
            }]
        );
        let assignment = db
            .with_conn(|conn| SlotReconciler::new(conn).assignment_at(&SlotAddress::new(printer.id, Some(0), 1)))
            .unwrap()
            .unwrap();
        assert!(assignment.present);
        assert_eq!(assignment.spool_id, Some(manual));
        assert!(assignment.is_manual());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_events_of_one_printer_apply_in_emit_order() {
        let db = Database::open_in_memory().unwrap();
        let (manager, rx) = DriverManager::new(db.clone(), DriverRegistry::builtin(), &default_config());
        let dispatcher = manager.spawn_dispatcher(rx);

        let printers: Vec<i64> = db
            .with_conn(|conn| {
                (0..200)
                    .map(|i| records::create_printer(conn, &format!("voron-{}", i), "klipper", &json!({})))
                    .collect()
            })
            .unwrap();

        let tx = manager.events.lock().unwrap().clone().unwrap();
        for &printer_id in &printers {
            let sink = EventSink::new(printer_id, tx.clone());
            let initial = AmsUnitState {
                ams_unit_no: 0,
                slots_total: 8,
                slots: (1..=8).map(SlotState::empty).collect(),
            };
            assert!(sink.emit(DriverEvent::AmsState { ams_units: vec![initial] }).await);
            assert!(
                sink.emit(DriverEvent::SpoolInserted {
                    slot: crate::drivers::SlotRef::in_unit(0, 1),
                    identifiers: crate::drivers::Identifiers::external("spoolman:3"),
                    meta: None,
                })
                .await
            );
        }
        drop(tx);

        manager.shutdown().await;
        DriverManager::join_dispatcher(dispatcher, Duration::from_secs(30)).await;

        let emptied: Vec<i64> = db
            .with_conn(|conn| {
                let engine = SlotReconciler::new(conn);
                let mut emptied = Vec::new();
                for &printer_id in &printers {
                    let slot = engine.assignment_at(&SlotAddress::new(printer_id, Some(0), 1))?;
                    if !slot.map(|a| a.present).unwrap_or(false) {
                        emptied.push(printer_id);
                    }
                }
                Ok(emptied)
            })
            .unwrap();
        assert!(emptied.is_empty(), "slot 1 left empty for printers {:?}", emptied);
    }

    #[tokio::test]
    async fn test_dispatcher_persists_driver_events() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (db, manager, rx) = recording_manager(&sent);
        let (printer, _manual) = manual_slot_fixture(&db);
        let dispatcher = manager.spawn_dispatcher(rx);
        assert!(manager.start_printer(&printer).await);

        let sink = {
            let tx = manager.events.lock().unwrap().clone().unwrap();
            EventSink::new(printer.id, tx)
        };
        assert!(
            sink.emit(DriverEvent::SpoolInserted {
                slot: crate::drivers::SlotRef::in_unit(0, 2),
                identifiers: crate::drivers::Identifiers {
                    rfid_uid: Some("OTHER-TAG".into()),
                    external_id: None,
                },
                meta: None,
            })
            .await
        );
        drop(sink);

        manager.shutdown().await;
        DriverManager::join_dispatcher(dispatcher, Duration::from_secs(5)).await;

        let assignment = db
            .with_conn(|conn| SlotReconciler::new(conn).assignment_at(&SlotAddress::new(printer.id, Some(0), 2)))
            .unwrap()
            .unwrap();
        assert!(assignment.present);
        assert_eq!(assignment.rfid_uid.as_deref(), Some("OTHER-TAG"));
        assert!(assignment.spool_id.is_some());
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_command_without_driver() {
        let (_db, manager) = manager();
        assert!(!manager.send_command(42, &DriverCommand::ClearSpool { tool_index: 0 }).await);
        assert!(manager.camera_config(42).is_none());
    }
}
