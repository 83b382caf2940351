//! Filament type lookup for the `ams_filament_setting` command.

use serde_json::{json, Value};

/// (filament type, Bambu generic filament code, nozzle min, nozzle max)
const GENERIC_FILAMENTS: &[(&str, &str, i64, i64)] = &[
    ("PLA", "GFL99", 190, 230),
    ("PETG", "GFG99", 220, 260),
    ("ABS", "GFB99", 240, 270),
    ("ASA", "GFB98", 240, 270),
    ("TPU", "GFU99", 200, 240),
    ("PA", "GFN99", 260, 290),
    ("PC", "GFC99", 260, 290),
    ("PVA", "GFS99", 190, 230),
    ("PLA-CF", "GFL98", 210, 240),
    ("PETG-CF", "GFG98", 240, 270),
    ("PA-CF", "GFN98", 270, 300),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenericFilament {
    pub tray_type: &'static str,
    pub code: &'static str,
    pub nozzle_temp_min: i64,
    pub nozzle_temp_max: i64,
}

/// Case-insensitive lookup of a filament type such as "petg-cf".
pub fn lookup(filament_type: &str) -> Option<GenericFilament> {
    let wanted = filament_type.trim();
    GENERIC_FILAMENTS
        .iter()
        .find(|(name, ..)| name.eq_ignore_ascii_case(wanted))
        .map(|&(tray_type, code, nozzle_temp_min, nozzle_temp_max)| GenericFilament {
            tray_type,
            code,
            nozzle_temp_min,
            nozzle_temp_max,
        })
}

/// RRGGBBAA as the printer expects it. Six-digit colours get full alpha.
pub fn tray_color(color_hex: &str) -> String {
    let hex = color_hex.trim().trim_start_matches('#').to_uppercase();
    match hex.len() {
        6 => format!("{}FF", hex),
        8 => hex,
        _ => "FFFFFFFF".to_string(),
    }
}

/// Request payload programming one AMS tray.
pub fn filament_setting_payload(
    ams_unit_no: i64,
    slot_no: i64,
    filament: &GenericFilament,
    color_hex: &str,
    nozzle_temp_min: Option<i64>,
    nozzle_temp_max: Option<i64>,
) -> Value {
    json!({
        "print": {
            "sequence_id": "0",
            "command": "ams_filament_setting",
            "ams_id": ams_unit_no,
            "tray_id": slot_no - 1,
            "tray_info_idx": filament.code,
            "tray_color": tray_color(color_hex),
            "nozzle_temp_min": nozzle_temp_min.unwrap_or(filament.nozzle_temp_min),
            "nozzle_temp_max": nozzle_temp_max.unwrap_or(filament.nozzle_temp_max),
            "tray_type": filament.tray_type,
        }
    })
}

/// Ask the printer for a full status report.
pub fn pushall_payload() -> Value {
    json!({ "pushing": { "sequence_id": "0", "command": "pushall" } })
}
