//! Printer drivers.
//!
//! A driver observes one printer, turns what it sees into `DriverEvent`s
//! and pushes them through its `EventSink`. Drivers never touch the
//! database; the manager's dispatcher does that.

pub mod bambu;
pub mod dummy;
pub mod klipper;
mod registry;
mod types;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::DriverSettings;
use crate::error::{Result, SyncError};
use crate::slots::ManualConflict;

pub use registry::{DriverFactory, DriverRegistry};
pub use types::*;

#[async_trait]
pub trait Driver: Send + Sync {
    fn driver_key(&self) -> &'static str;

    /// Fail fast on missing or malformed config keys.
    fn validate_config(&self) -> Result<()> {
        Ok(())
    }

    /// Begin background observation. Calling it while running is a no-op.
    async fn start(&self) -> Result<()>;

    /// End background observation within a bounded time. Safe when stopped.
    async fn stop(&self) -> Result<()>;

    fn health(&self) -> DriverHealth;

    async fn send_command(&self, command: &DriverCommand) -> bool {
        warn!(
            "Driver '{}' does not accept command '{}'",
            self.driver_key(),
            command.name()
        );
        false
    }

    fn camera_config(&self) -> Option<CameraConfig> {
        None
    }

    /// Command that pushes a manual assignment back onto the printer.
    fn compensation_command(&self, _conflict: &ManualConflict) -> Option<DriverCommand> {
        None
    }
}

/// Hands driver events to the dispatcher, tagged with printer id and time.
#[derive(Debug, Clone)]
pub struct EventSink {
    printer_id: i64,
    tx: mpsc::Sender<PrinterEvent>,
}

impl EventSink {
    pub fn new(printer_id: i64, tx: mpsc::Sender<PrinterEvent>) -> Self {
        Self { printer_id, tx }
    }

    pub fn printer_id(&self) -> i64 {
        self.printer_id
    }

    fn stamp(&self, event: DriverEvent) -> PrinterEvent {
        PrinterEvent {
            printer_id: self.printer_id,
            event_at: Utc::now(),
            event,
        }
    }

    /// Queue an event from async code. Waits while the queue is full.
    /// Returns false once the dispatcher has shut down.
    pub async fn emit(&self, event: DriverEvent) -> bool {
        match self.tx.send(self.stamp(event)).await {
            Ok(()) => true,
            Err(_) => {
                warn!("Printer {}: dispatcher closed, dropping event", self.printer_id);
                false
            }
        }
    }

    /// Queue an event from a plain OS thread. Must not be called from
    /// inside the async runtime.
    pub fn blocking_emit(&self, event: DriverEvent) -> bool {
        match self.tx.blocking_send(self.stamp(event)) {
            Ok(()) => true,
            Err(_) => {
                warn!("Printer {}: dispatcher closed, dropping event", self.printer_id);
                false
            }
        }
    }
}

/// Everything a driver factory needs to build a driver.
#[derive(Debug, Clone)]
pub struct DriverContext {
    pub printer_id: i64,
    /// Driver-specific config blob stored on the printer row.
    pub config: Value,
    pub sink: EventSink,
    pub settings: DriverSettings,
}

impl DriverContext {
    /// Non-empty string from the config blob.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key)?.as_str().filter(|s| !s.trim().is_empty())
    }

    /// Like `config_str`, but a missing key is a config error naming `what`.
    pub fn require_str(&self, key: &str, what: &str) -> Result<&str> {
        self.config_str(key).ok_or_else(|| {
            SyncError::Config(format!(
                "printer {}: '{}' ({}) is required in driver_config",
                self.printer_id, key, what
            ))
        })
    }

    /// Integer from the config blob; accepts numbers and numeric strings.
    pub fn config_i64(&self, key: &str) -> Option<i64> {
        match self.config.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Context with its receiving end, for driver unit tests.
    pub fn context(printer_id: i64, config: Value) -> (DriverContext, mpsc::Receiver<PrinterEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (
            DriverContext {
                printer_id,
                config,
                sink: EventSink::new(printer_id, tx),
                settings: DriverSettings::default(),
            },
            rx,
        )
    }
}
