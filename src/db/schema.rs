use rusqlite::{params, Connection};
use tracing::info;

use crate::error::Result;

/// Fixed spool status vocabulary: (key, label, sort_order).
pub const SPOOL_STATUSES: &[(&str, &str, i64)] = &[
    ("new", "New", 10),
    ("opened", "Opened", 20),
    ("drying", "Drying", 30),
    ("active", "Active", 40),
    ("empty", "Empty", 50),
    ("archived", "Archived", 60),
];

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS printers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    driver_key TEXT NOT NULL,
    driver_config TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    deleted_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS locations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    identifier TEXT
);

CREATE TABLE IF NOT EXISTS filaments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    designation TEXT NOT NULL,
    material TEXT NOT NULL,
    diameter_mm REAL NOT NULL DEFAULT 1.75,
    color_hex TEXT,
    default_spool_weight_g REAL
);

CREATE TABLE IF NOT EXISTS spool_statuses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    label TEXT NOT NULL,
    sort_order INTEGER NOT NULL DEFAULT 0,
    is_system INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS spools (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filament_id INTEGER NOT NULL REFERENCES filaments(id),
    status_id INTEGER NOT NULL REFERENCES spool_statuses(id),
    location_id INTEGER REFERENCES locations(id),
    rfid_uid TEXT UNIQUE,
    external_id TEXT UNIQUE,
    initial_total_weight_g REAL,
    empty_spool_weight_g REAL,
    remaining_weight_g REAL,
    last_used_at TEXT,
    deleted_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS spool_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    spool_id INTEGER NOT NULL REFERENCES spools(id) ON DELETE CASCADE,
    event_type TEXT NOT NULL,
    event_at TEXT NOT NULL,
    source TEXT,
    delta_weight_g REAL,
    measured_weight_g REAL,
    from_status_id INTEGER REFERENCES spool_statuses(id),
    to_status_id INTEGER REFERENCES spool_statuses(id),
    from_location_id INTEGER REFERENCES locations(id),
    to_location_id INTEGER REFERENCES locations(id),
    note TEXT,
    meta TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_spool_events_spool ON spool_events(spool_id, event_at, id);

CREATE TABLE IF NOT EXISTS printer_ams_units (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    printer_id INTEGER NOT NULL REFERENCES printers(id) ON DELETE CASCADE,
    ams_unit_no INTEGER NOT NULL,
    name TEXT,
    slots_total INTEGER NOT NULL,
    UNIQUE (printer_id, ams_unit_no)
);

CREATE TABLE IF NOT EXISTS printer_slots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    printer_id INTEGER NOT NULL REFERENCES printers(id) ON DELETE CASCADE,
    is_ams_slot INTEGER NOT NULL,
    ams_unit_id INTEGER REFERENCES printer_ams_units(id) ON DELETE SET NULL,
    slot_no INTEGER NOT NULL,
    name TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS uq_printer_slots_unique
    ON printer_slots(printer_id, is_ams_slot, IFNULL(ams_unit_id, -1), slot_no);

CREATE TABLE IF NOT EXISTS printer_slot_assignments (
    slot_id INTEGER PRIMARY KEY REFERENCES printer_slots(id) ON DELETE CASCADE,
    spool_id INTEGER REFERENCES spools(id) ON DELETE SET NULL,
    present INTEGER NOT NULL DEFAULT 0,
    rfid_uid TEXT,
    external_id TEXT,
    inserted_at TEXT,
    updated_at TEXT NOT NULL,
    meta TEXT
);

CREATE TABLE IF NOT EXISTS printer_slot_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    printer_id INTEGER NOT NULL REFERENCES printers(id) ON DELETE CASCADE,
    slot_id INTEGER NOT NULL REFERENCES printer_slots(id) ON DELETE CASCADE,
    event_type TEXT NOT NULL,
    event_at TEXT NOT NULL,
    spool_id INTEGER REFERENCES spools(id) ON DELETE SET NULL,
    rfid_uid TEXT,
    external_id TEXT,
    meta TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_slot_events_slot ON printer_slot_events(slot_id, event_at);
";

/// Create all tables and indexes if they don't exist, then seed the
/// status vocabulary. Safe to run on every open.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)?;

    for (key, label, sort_order) in SPOOL_STATUSES {
        conn.execute(
            "INSERT OR IGNORE INTO spool_statuses (key, label, sort_order, is_system)
             VALUES (?1, ?2, ?3, 1)",
            params![key, label, sort_order],
        )?;
    }

    info!("Database schema ready ({} spool statuses)", SPOOL_STATUSES.len());
    Ok(())
}
