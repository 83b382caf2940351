//! Parsing of `device/<serial>/report` messages.

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::slots::{AmsUnitState, SlotState};

/// Slot count assumed for a unit that reports no trays.
const AMS_SLOTS_STANDARD: i64 = 4;

/// Print-job fields kept for health reporting.
const PRINT_STATE_KEYS: &[&str] = &[
    "gcode_state",
    "mc_percent",
    "mc_remaining_time",
    "layer_num",
    "total_layer_num",
    "nozzle_temper",
    "nozzle_target_temper",
    "bed_temper",
    "bed_target_temper",
    "subtask_name",
];

/// The raw AMS unit list, when the message carries a non-empty one.
pub fn ams_units_raw(payload: &Value) -> Option<&Vec<Value>> {
    payload["print"]["ams"]["ams"]
        .as_array()
        .filter(|units| !units.is_empty())
}

/// Stable digest of the unit list. Object keys serialize sorted.
pub fn ams_hash(units: &[Value]) -> String {
    let canonical = Value::Array(units.to_vec()).to_string();
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

/// Reports are incremental: only the fields present are copied over.
pub fn merge_print_state(state: &mut Map<String, Value>, payload: &Value) {
    let Some(print) = payload["print"].as_object() else {
        return;
    };
    for key in PRINT_STATE_KEYS {
        if let Some(value) = print.get(*key) {
            state.insert((*key).to_string(), value.clone());
        }
    }
}

/// Integer that may arrive as a number or as a numeric string.
fn int_field(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Non-empty identifier that is not all zeros.
fn real_id(value: &Value) -> Option<&str> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty() && s.chars().any(|c| c != '0'))
}

fn text(value: &Value) -> Value {
    json!(value.as_str().unwrap_or(""))
}

fn parse_tray(unit: &Value, tray: &Value) -> SlotState {
    let slot_no = int_field(&tray["id"]).unwrap_or(0) + 1;
    let tray_type = tray["tray_type"].as_str().unwrap_or("").trim();
    if tray_type.is_empty() {
        return SlotState::empty(slot_no);
    }

    let meta = json!({
        "material": tray_type,
        "sub_brand": text(&tray["tray_sub_brands"]),
        "color_hex": text(&tray["tray_color"]),
        "remain_percent": tray["remain"],
        "weight_g": tray["tray_weight"],
        "diameter_mm": tray["tray_diameter"],
        "nozzle_temp_min": tray["nozzle_temp_min"],
        "nozzle_temp_max": tray["nozzle_temp_max"],
        "bed_temp": tray["bed_temp"],
        "tray_id_name": text(&tray["tray_id_name"]),
        "humidity": unit["humidity"],
        "temperature": unit["temp"],
    });

    SlotState {
        slot_no,
        present: true,
        rfid_uid: real_id(&tray["tag_uid"]).map(str::to_string),
        external_id: real_id(&tray["tray_uuid"]).map(|uuid| format!("bambu:{}", uuid)),
        meta: Some(meta),
    }
}

/// Translate the vendor unit list into the bulk slot-state shape.
pub fn parse_ams_units(units: &[Value]) -> Vec<AmsUnitState> {
    units
        .iter()
        .map(|unit| {
            let trays = unit["tray"].as_array().map(Vec::as_slice).unwrap_or(&[]);
            AmsUnitState {
                ams_unit_no: int_field(&unit["id"]).unwrap_or(0),
                slots_total: if trays.is_empty() {
                    AMS_SLOTS_STANDARD
                } else {
                    trays.len() as i64
                },
                slots: trays.iter().map(|tray| parse_tray(unit, tray)).collect(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> Value {
        json!({
            "print": {
                "gcode_state": "RUNNING",
                "mc_percent": 37,
                "nozzle_temper": 219.8,
                "ams": {
                    "ams": [{
                        "id": "0",
                        "humidity": "4",
                        "temp": "24.1",
                        "tray": [
                            {
                                "id": "0",
                                "tray_type": "PLA",
                                "tray_sub_brands": "PLA Basic",
                                "tray_color": "00AE42FF",
                                "tag_uid": "5A2B9C1D00000000",
                                "tray_uuid": "8B4C2E77A1D54F0E9C3B0A1B2C3D4E5F",
                                "remain": 82,
                                "tray_weight": "1000",
                                "tray_diameter": "1.75",
                                "nozzle_temp_min": "190",
                                "nozzle_temp_max": "230"
                            },
                            {
                                "id": "1",
                                "tray_type": "PETG",
                                "tag_uid": "0000000000000000",
                                "tray_uuid": "00000000000000000000000000000000"
                            },
                            {"id": "2", "tray_type": ""},
                            {"id": "3"}
                        ]
                    }]
                }
            }
        })
    }

    #[test]
    fn test_parse_trays() {
        let payload = report();
        let units = parse_ams_units(ams_units_raw(&payload).unwrap());
        assert_eq!(units.len(), 1);
        let unit = &units[0];
        assert_eq!(unit.ams_unit_no, 0);
        assert_eq!(unit.slots_total, 4);

        let first = &unit.slots[0];
        assert_eq!(first.slot_no, 1);
        assert!(first.present);
        assert_eq!(first.rfid_uid.as_deref(), Some("5A2B9C1D00000000"));
        assert_eq!(
            first.external_id.as_deref(),
            Some("bambu:8B4C2E77A1D54F0E9C3B0A1B2C3D4E5F")
        );
        let meta = first.meta.as_ref().unwrap();
        assert_eq!(meta["material"], "PLA");
        assert_eq!(meta["remain_percent"], 82);
        assert_eq!(meta["humidity"], "4");

        // Zero tag and uuid count as absent identifiers.
        let second = &unit.slots[1];
        assert!(second.present);
        assert!(second.rfid_uid.is_none());
        assert!(second.external_id.is_none());

        assert_eq!(unit.slots[2], SlotState::empty(3));
        assert_eq!(unit.slots[3], SlotState::empty(4));
    }

    #[test]
    fn test_unit_without_trays_defaults_to_four_slots() {
        let units = parse_ams_units(&[json!({"id": 1})]);
        assert_eq!(units[0].ams_unit_no, 1);
        assert_eq!(units[0].slots_total, 4);
        assert!(units[0].slots.is_empty());
    }

    #[test]
    fn test_hash_ignores_key_order() {
        let a = vec![json!({"id": "0", "tray": [{"id": "0", "tray_type": "PLA"}]})];
        let b: Vec<Value> =
            vec![serde_json::from_str(r#"{"tray": [{"tray_type": "PLA", "id": "0"}], "id": "0"}"#).unwrap()];
        assert_eq!(ams_hash(&a), ams_hash(&b));

        let c = vec![json!({"id": "0", "tray": [{"id": "0", "tray_type": "PETG"}]})];
        assert_ne!(ams_hash(&a), ams_hash(&c));
    }

    #[test]
    fn test_messages_without_ams_are_ignored() {
        assert!(ams_units_raw(&json!({"print": {"gcode_state": "IDLE"}})).is_none());
        assert!(ams_units_raw(&json!({"print": {"ams": {"ams": []}}})).is_none());
        assert!(ams_units_raw(&json!({"info": {}})).is_none());
    }

    #[test]
    fn test_print_state_merges_incrementally() {
        let mut state = Map::new();
        merge_print_state(&mut state, &report());
        assert_eq!(state["gcode_state"], "RUNNING");
        assert_eq!(state["mc_percent"], 37);

        merge_print_state(&mut state, &json!({"print": {"mc_percent": 38}}));
        assert_eq!(state["gcode_state"], "RUNNING");
        assert_eq!(state["mc_percent"], 38);
    }
}
