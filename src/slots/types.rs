use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Meta `source` value that marks an operator-entered assignment.
pub const MANUAL_SOURCE: &str = "manual";

/// Kinds of rows in the slot event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotEventType {
    SpoolInserted,
    SpoolRemoved,
    UnknownSpoolDetected,
}

impl SlotEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotEventType::SpoolInserted => "spool_inserted",
            SlotEventType::SpoolRemoved => "spool_removed",
            SlotEventType::UnknownSpoolDetected => "unknown_spool_detected",
        }
    }
}

/// Where a slot lives on a printer. `ams_unit_no = None` is a standalone printer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotAddress {
    pub printer_id: i64,
    pub ams_unit_no: Option<i64>,
    pub slot_no: i64,
}

impl SlotAddress {
    pub fn new(printer_id: i64, ams_unit_no: Option<i64>, slot_no: i64) -> Self {
        Self {
            printer_id,
            ams_unit_no,
            slot_no,
        }
    }
}

/// Current-state cache row for one slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotAssignment {
    pub slot_id: i64,
    pub spool_id: Option<i64>,
    pub present: bool,
    pub rfid_uid: Option<String>,
    pub external_id: Option<String>,
    pub inserted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub meta: Option<Value>,
}

impl SlotAssignment {
    /// True when an operator set this assignment by hand.
    pub fn is_manual(&self) -> bool {
        self.meta
            .as_ref()
            .and_then(|m| m.get("source"))
            .and_then(|s| s.as_str())
            == Some(MANUAL_SOURCE)
    }
}

/// Immutable slot history row.
#[derive(Debug, Clone, Serialize)]
pub struct SlotEvent {
    pub id: i64,
    pub printer_id: i64,
    pub slot_id: i64,
    pub event_type: String,
    pub event_at: DateTime<Utc>,
    pub spool_id: Option<i64>,
    pub rfid_uid: Option<String>,
    pub external_id: Option<String>,
    pub meta: Option<Value>,
}

/// One feeder unit as reported in a bulk `ams_state` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmsUnitState {
    pub ams_unit_no: i64,
    pub slots_total: i64,
    #[serde(default)]
    pub slots: Vec<SlotState>,
}

/// One slot inside an `AmsUnitState`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotState {
    pub slot_no: i64,
    #[serde(default)]
    pub present: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rfid_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl SlotState {
    pub fn empty(slot_no: i64) -> Self {
        Self {
            slot_no,
            present: false,
            rfid_uid: None,
            external_id: None,
            meta: None,
        }
    }
}

/// A bulk update tried to overwrite an operator-entered assignment.
/// Carries what is needed to push the manual state back to the printer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualConflict {
    pub printer_id: i64,
    pub slot_id: i64,
    pub ams_unit_no: Option<i64>,
    pub slot_no: i64,
    pub spool_id: Option<i64>,
    pub spool_external_id: Option<String>,
    /// Assignment meta at the time of the conflict (material, color_hex, ...).
    pub assignment_meta: Option<Value>,
    /// What the printer reported for the slot.
    pub reported: SlotState,
}

impl ManualConflict {
    pub fn address(&self) -> SlotAddress {
        SlotAddress::new(self.printer_id, self.ams_unit_no, self.slot_no)
    }

    /// String field from the manual assignment meta.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.assignment_meta.as_ref()?.get(key)?.as_str()
    }
}

/// Result of applying one bulk unit-state message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AmsStateOutcome {
    pub events: Vec<SlotEvent>,
    pub conflicts: Vec<ManualConflict>,
}
