use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::slots::{AmsUnitState, SlotAddress};

/// Slot reference carried by single-slot events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlotRef {
    pub slot_no: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ams_unit_no: Option<i64>,
}

impl SlotRef {
    pub fn standalone(slot_no: i64) -> Self {
        Self {
            slot_no,
            ams_unit_no: None,
        }
    }

    pub fn in_unit(ams_unit_no: i64, slot_no: i64) -> Self {
        Self {
            slot_no,
            ams_unit_no: Some(ams_unit_no),
        }
    }

    pub fn address(&self, printer_id: i64) -> SlotAddress {
        SlotAddress::new(printer_id, self.ams_unit_no, self.slot_no)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identifiers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rfid_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl Identifiers {
    pub fn external(external_id: impl Into<String>) -> Self {
        Self {
            rfid_uid: None,
            external_id: Some(external_id.into()),
        }
    }
}

/// Normalized event vocabulary shared by every driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DriverEvent {
    SpoolInserted {
        slot: SlotRef,
        #[serde(default)]
        identifiers: Identifiers,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
    },
    SpoolRemoved {
        slot: SlotRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
    },
    UnknownSpoolDetected {
        slot: SlotRef,
        #[serde(default)]
        identifiers: Identifiers,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
    },
    AmsState {
        ams_units: Vec<AmsUnitState>,
    },
}

impl DriverEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DriverEvent::SpoolInserted { .. } => "spool_inserted",
            DriverEvent::SpoolRemoved { .. } => "spool_removed",
            DriverEvent::UnknownSpoolDetected { .. } => "unknown_spool_detected",
            DriverEvent::AmsState { .. } => "ams_state",
        }
    }
}

/// A driver event after the sink tagged it with its printer and time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterEvent {
    pub printer_id: i64,
    pub event_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DriverEvent,
}

/// Outbound command accepted by `Driver::send_command`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DriverCommand {
    /// Program an AMS tray with a filament type and colour.
    SetFilament {
        ams_unit_no: i64,
        slot_no: i64,
        filament_type: String,
        /// RRGGBBAA
        color_hex: String,
        #[serde(default)]
        nozzle_temp_min: Option<i64>,
        #[serde(default)]
        nozzle_temp_max: Option<i64>,
    },
    /// Bind an external spool id to a tool (0-based).
    SetSpool { tool_index: i64, spool_id: i64 },
    ClearSpool { tool_index: i64 },
}

impl DriverCommand {
    pub fn name(&self) -> &'static str {
        match self {
            DriverCommand::SetFilament { .. } => "set_filament",
            DriverCommand::SetSpool { .. } => "set_spool",
            DriverCommand::ClearSpool { .. } => "clear_spool",
        }
    }
}

/// Lifecycle of one driver instance as tracked by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// Health snapshot of a printer's driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriverHealth {
    pub driver_key: String,
    pub printer_id: i64,
    pub running: bool,
    pub connected: bool,
    pub state: DriverState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Driver-specific connectivity and print-state fields.
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl DriverHealth {
    pub fn new(driver_key: &str, printer_id: i64, running: bool, connected: bool) -> Self {
        Self {
            driver_key: driver_key.to_string(),
            printer_id,
            running,
            connected,
            state: if running {
                DriverState::Running
            } else {
                DriverState::Stopped
            },
            message: None,
            details: Map::new(),
        }
    }

    /// Entry recorded when a driver could not be resolved or started.
    pub fn error(driver_key: &str, printer_id: i64, message: impl Into<String>) -> Self {
        let mut health = Self::new(driver_key, printer_id, false, false);
        health.state = DriverState::Error;
        health.message = Some(message.into());
        health.details.insert("status".to_string(), Value::from("error"));
        health
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraCredentials {
    pub username: String,
    pub password: String,
}

/// Where to find a printer's camera stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraConfig {
    #[serde(rename = "type")]
    pub camera_type: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CameraCredentials>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_contract_parses() {
        let event: DriverEvent = serde_json::from_value(json!({
            "event_type": "spool_inserted",
            "slot": {"slot_no": 2, "ams_unit_no": 0},
            "identifiers": {"rfid_uid": "C0FFEE"},
        }))
        .unwrap();
        assert_eq!(
            event,
            DriverEvent::SpoolInserted {
                slot: SlotRef::in_unit(0, 2),
                identifiers: Identifiers {
                    rfid_uid: Some("C0FFEE".into()),
                    external_id: None
                },
                meta: None,
            }
        );

        let event: DriverEvent = serde_json::from_value(json!({
            "event_type": "ams_state",
            "ams_units": [{"ams_unit_no": 1, "slots_total": 4, "slots": [{"slot_no": 1, "present": false}]}],
        }))
        .unwrap();
        assert_eq!(event.event_type(), "ams_state");
    }

    #[test]
    fn test_command_contract_tag() {
        let cmd: DriverCommand =
            serde_json::from_value(json!({"command": "set_spool", "tool_index": 1, "spool_id": 12})).unwrap();
        assert_eq!(cmd, DriverCommand::SetSpool { tool_index: 1, spool_id: 12 });
        assert_eq!(
            serde_json::to_value(DriverCommand::ClearSpool { tool_index: 0 }).unwrap(),
            json!({"command": "clear_spool", "tool_index": 0})
        );
    }

    #[test]
    fn test_health_flattens_details() {
        let health = DriverHealth::new("klipper", 3, true, true).with_detail("printer_state", "ready");
        let value = serde_json::to_value(&health).unwrap();
        assert_eq!(value["printer_state"], "ready");
        assert_eq!(value["state"], "running");
        assert!(value.get("message").is_none());

        let err = DriverHealth::error("nope", 3, "Driver not found: nope");
        assert_eq!(err.state, DriverState::Error);
        assert_eq!(err.details["status"], "error");
    }
}
