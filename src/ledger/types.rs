use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};

pub const EVENT_MEASUREMENT: &str = "measurement";
pub const EVENT_MANUAL_ADJUST: &str = "manual_adjust";
pub const EVENT_PRINT_CONSUMPTION: &str = "print_consumption";
pub const EVENT_MOVE_LOCATION: &str = "move_location";

/// Source tag for events the ledger generates on its own.
pub const SOURCE_SYSTEM: &str = "system";

/// How a manual adjustment changes the remaining weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "adjustment_type", rename_all = "lowercase")]
pub enum Adjustment {
    /// Signed delta applied to the cached remaining weight.
    Relative { delta_weight_g: f64 },
    /// Gross weight from a scale; remaining is recomputed through the tare.
    Absolute { measured_weight_g: f64 },
}

impl Adjustment {
    /// Build an adjustment from loosely typed request fields.
    pub fn from_parts(
        adjustment_type: &str,
        delta_weight_g: Option<f64>,
        measured_weight_g: Option<f64>,
    ) -> Result<Self> {
        match adjustment_type {
            "relative" => delta_weight_g
                .map(|delta_weight_g| Adjustment::Relative { delta_weight_g })
                .ok_or_else(|| SyncError::Validation("delta_weight_g required for relative adjustment".into())),
            "absolute" => measured_weight_g
                .map(|measured_weight_g| Adjustment::Absolute { measured_weight_g })
                .ok_or_else(|| {
                    SyncError::Validation("measured_weight_g required for absolute adjustment".into())
                }),
            other => Err(SyncError::Validation(format!("Invalid adjustment_type: {}", other))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Adjustment::Relative { .. } => "relative",
            Adjustment::Absolute { .. } => "absolute",
        }
    }
}

/// Who/when metadata attached to every recorded event.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub event_at: DateTime<Utc>,
    /// "ui", "scale", "printer", "system", ...
    pub source: String,
    pub note: Option<String>,
}

impl EventContext {
    pub fn now(source: &str) -> Self {
        Self::at(Utc::now(), source)
    }

    pub fn at(event_at: DateTime<Utc>, source: &str) -> Self {
        Self {
            event_at,
            source: source.to_string(),
            note: None,
        }
    }

    pub fn with_note(mut self, note: &str) -> Self {
        self.note = Some(note.to_string());
        self
    }
}

/// Immutable spool history row.
#[derive(Debug, Clone, Serialize)]
pub struct SpoolEvent {
    pub id: i64,
    pub spool_id: i64,
    /// `measurement`, `manual_adjust`, `print_consumption`, `move_location`
    /// or a status key for status transitions.
    pub event_type: String,
    pub event_at: DateTime<Utc>,
    pub source: Option<String>,
    pub delta_weight_g: Option<f64>,
    pub measured_weight_g: Option<f64>,
    pub from_status_id: Option<i64>,
    pub to_status_id: Option<i64>,
    pub from_location_id: Option<i64>,
    pub to_location_id: Option<i64>,
    pub note: Option<String>,
    pub meta: Option<Value>,
}

impl SpoolEvent {
    /// Boolean flag from the event meta (`tara_missing`, `clamped_to_zero`, ...).
    pub fn flag(&self, key: &str) -> bool {
        self.meta
            .as_ref()
            .and_then(|m| m.get(key))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.as_ref()?.get(key)?.as_str()
    }
}

/// Result of a weight-affecting call: the stored event and the cached
/// remaining weight after it.
#[derive(Debug, Clone, Serialize)]
pub struct WeightOutcome {
    pub event: SpoolEvent,
    pub remaining_weight_g: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_adjustment_from_parts() {
        assert_eq!(
            Adjustment::from_parts("relative", Some(-20.0), None).unwrap(),
            Adjustment::Relative { delta_weight_g: -20.0 }
        );
        assert_eq!(
            Adjustment::from_parts("absolute", None, Some(900.0)).unwrap(),
            Adjustment::Absolute { measured_weight_g: 900.0 }
        );
        assert!(matches!(
            Adjustment::from_parts("relative", None, Some(1.0)),
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            Adjustment::from_parts("absolute", Some(1.0), None),
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            Adjustment::from_parts("sideways", Some(1.0), Some(1.0)),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn test_adjustment_deserialize_tagged() {
        let adj: Adjustment =
            serde_json::from_value(json!({"adjustment_type": "relative", "delta_weight_g": 12.5})).unwrap();
        assert_eq!(adj, Adjustment::Relative { delta_weight_g: 12.5 });
        assert_eq!(adj.kind(), "relative");
    }
}
