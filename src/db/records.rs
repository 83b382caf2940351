//! Row types and registration helpers for the tables the engines read.
//!
//! Printer, filament, spool and location management belongs to the admin
//! layer; these helpers exist so the service and tests can seed data.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;

use super::{json_from_sql, opt_ts_from_sql, ts_to_sql};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Serialize)]
pub struct Printer {
    pub id: i64,
    pub name: String,
    pub driver_key: String,
    /// Driver-specific blob, opaque to everything except the driver.
    pub driver_config: Value,
    pub is_active: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Location {
    pub id: i64,
    pub name: String,
    pub identifier: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Filament {
    pub id: i64,
    pub designation: String,
    /// Material family, e.g. "PLA" or "PETG-CF".
    pub material: String,
    pub diameter_mm: f64,
    pub color_hex: Option<String>,
    pub default_spool_weight_g: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpoolStatus {
    pub id: i64,
    pub key: String,
    pub label: String,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Spool {
    pub id: i64,
    pub filament_id: i64,
    pub status_id: i64,
    pub location_id: Option<i64>,
    pub rfid_uid: Option<String>,
    pub external_id: Option<String>,
    pub initial_total_weight_g: Option<f64>,
    pub empty_spool_weight_g: Option<f64>,
    pub remaining_weight_g: Option<f64>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Fields for registering a spool.
#[derive(Debug, Clone)]
pub struct NewSpool {
    pub filament_id: i64,
    pub status_key: String,
    pub location_id: Option<i64>,
    pub rfid_uid: Option<String>,
    pub external_id: Option<String>,
    pub initial_total_weight_g: Option<f64>,
    pub empty_spool_weight_g: Option<f64>,
    pub remaining_weight_g: Option<f64>,
}

impl NewSpool {
    pub fn new(filament_id: i64) -> Self {
        Self {
            filament_id,
            status_key: "new".to_string(),
            location_id: None,
            rfid_uid: None,
            external_id: None,
            initial_total_weight_g: None,
            empty_spool_weight_g: None,
            remaining_weight_g: None,
        }
    }
}

// --- Printers ---

pub fn create_printer(conn: &Connection, name: &str, driver_key: &str, config: &Value) -> Result<i64> {
    conn.execute(
        "INSERT INTO printers (name, driver_key, driver_config, is_active, created_at)
         VALUES (?1, ?2, ?3, 1, ?4)",
        params![name, driver_key, serde_json::to_string(config)?, ts_to_sql(&Utc::now())],
    )?;
    Ok(conn.last_insert_rowid())
}

fn printer_from_row(row: &Row<'_>) -> rusqlite::Result<Printer> {
    Ok(Printer {
        id: row.get(0)?,
        name: row.get(1)?,
        driver_key: row.get(2)?,
        driver_config: json_from_sql(3, row.get(3)?)?.unwrap_or_else(|| Value::Object(Default::default())),
        is_active: row.get(4)?,
        deleted_at: opt_ts_from_sql(5, row.get(5)?)?,
    })
}

const PRINTER_COLUMNS: &str = "id, name, driver_key, driver_config, is_active, deleted_at";

pub fn get_printer(conn: &Connection, printer_id: i64) -> Result<Printer> {
    conn.query_row(
        &format!("SELECT {} FROM printers WHERE id = ?1", PRINTER_COLUMNS),
        params![printer_id],
        printer_from_row,
    )
    .optional()?
    .ok_or_else(|| SyncError::NotFound(format!("printer {}", printer_id)))
}

/// Printers that should have a running driver: active and not deleted.
pub fn list_active_printers(conn: &Connection) -> Result<Vec<Printer>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM printers WHERE is_active = 1 AND deleted_at IS NULL ORDER BY id",
        PRINTER_COLUMNS
    ))?;
    let rows = stmt.query_map([], printer_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn set_printer_active(conn: &Connection, printer_id: i64, active: bool) -> Result<()> {
    conn.execute(
        "UPDATE printers SET is_active = ?1 WHERE id = ?2",
        params![active, printer_id],
    )?;
    Ok(())
}

// --- Locations ---

pub fn create_location(conn: &Connection, name: &str, identifier: Option<&str>) -> Result<i64> {
    conn.execute(
        "INSERT INTO locations (name, identifier) VALUES (?1, ?2)",
        params![name, identifier],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_location(conn: &Connection, location_id: i64) -> Result<Location> {
    conn.query_row(
        "SELECT id, name, identifier FROM locations WHERE id = ?1",
        params![location_id],
        |row| {
            Ok(Location {
                id: row.get(0)?,
                name: row.get(1)?,
                identifier: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| SyncError::NotFound(format!("location {}", location_id)))
}

// --- Filaments ---

pub fn create_filament(
    conn: &Connection,
    designation: &str,
    material: &str,
    color_hex: Option<&str>,
    default_spool_weight_g: Option<f64>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO filaments (designation, material, color_hex, default_spool_weight_g)
         VALUES (?1, ?2, ?3, ?4)",
        params![designation, material, color_hex, default_spool_weight_g],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_filament(conn: &Connection, filament_id: i64) -> Result<Filament> {
    conn.query_row(
        "SELECT id, designation, material, diameter_mm, color_hex, default_spool_weight_g
         FROM filaments WHERE id = ?1",
        params![filament_id],
        |row| {
            Ok(Filament {
                id: row.get(0)?,
                designation: row.get(1)?,
                material: row.get(2)?,
                diameter_mm: row.get(3)?,
                color_hex: row.get(4)?,
                default_spool_weight_g: row.get(5)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| SyncError::NotFound(format!("filament {}", filament_id)))
}

// --- Statuses ---

fn status_from_row(row: &Row<'_>) -> rusqlite::Result<SpoolStatus> {
    Ok(SpoolStatus {
        id: row.get(0)?,
        key: row.get(1)?,
        label: row.get(2)?,
        sort_order: row.get(3)?,
    })
}

pub fn status_by_key(conn: &Connection, key: &str) -> Result<Option<SpoolStatus>> {
    Ok(conn
        .query_row(
            "SELECT id, key, label, sort_order FROM spool_statuses WHERE key = ?1",
            params![key],
            status_from_row,
        )
        .optional()?)
}

pub fn status_by_id(conn: &Connection, status_id: i64) -> Result<SpoolStatus> {
    conn.query_row(
        "SELECT id, key, label, sort_order FROM spool_statuses WHERE id = ?1",
        params![status_id],
        status_from_row,
    )
    .optional()?
    .ok_or_else(|| SyncError::NotFound(format!("spool status {}", status_id)))
}

// --- Spools ---

const SPOOL_COLUMNS: &str = "id, filament_id, status_id, location_id, rfid_uid, external_id,
    initial_total_weight_g, empty_spool_weight_g, remaining_weight_g, last_used_at, deleted_at";

fn spool_from_row(row: &Row<'_>) -> rusqlite::Result<Spool> {
    Ok(Spool {
        id: row.get(0)?,
        filament_id: row.get(1)?,
        status_id: row.get(2)?,
        location_id: row.get(3)?,
        rfid_uid: row.get(4)?,
        external_id: row.get(5)?,
        initial_total_weight_g: row.get(6)?,
        empty_spool_weight_g: row.get(7)?,
        remaining_weight_g: row.get(8)?,
        last_used_at: opt_ts_from_sql(9, row.get(9)?)?,
        deleted_at: opt_ts_from_sql(10, row.get(10)?)?,
    })
}

pub fn create_spool(conn: &Connection, spool: &NewSpool) -> Result<i64> {
    let status = status_by_key(conn, &spool.status_key)?
        .ok_or_else(|| SyncError::NotFound(format!("spool status '{}'", spool.status_key)))?;

    conn.execute(
        "INSERT INTO spools (filament_id, status_id, location_id, rfid_uid, external_id,
             initial_total_weight_g, empty_spool_weight_g, remaining_weight_g, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            spool.filament_id,
            status.id,
            spool.location_id,
            spool.rfid_uid,
            spool.external_id,
            spool.initial_total_weight_g,
            spool.empty_spool_weight_g,
            spool.remaining_weight_g,
            ts_to_sql(&Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Fetch a live (not soft-deleted) spool.
pub fn get_spool(conn: &Connection, spool_id: i64) -> Result<Spool> {
    conn.query_row(
        &format!(
            "SELECT {} FROM spools WHERE id = ?1 AND deleted_at IS NULL",
            SPOOL_COLUMNS
        ),
        params![spool_id],
        spool_from_row,
    )
    .optional()?
    .ok_or_else(|| SyncError::NotFound(format!("spool {}", spool_id)))
}

/// Resolve a spool by RFID first, then by external id. First match wins.
pub fn find_spool_by_identifier(
    conn: &Connection,
    rfid_uid: Option<&str>,
    external_id: Option<&str>,
) -> Result<Option<Spool>> {
    if let Some(rfid) = rfid_uid {
        let spool = conn
            .query_row(
                &format!(
                    "SELECT {} FROM spools WHERE rfid_uid = ?1 AND deleted_at IS NULL",
                    SPOOL_COLUMNS
                ),
                params![rfid],
                spool_from_row,
            )
            .optional()?;
        if spool.is_some() {
            return Ok(spool);
        }
    }

    if let Some(ext) = external_id {
        return Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM spools WHERE external_id = ?1 AND deleted_at IS NULL",
                    SPOOL_COLUMNS
                ),
                params![ext],
                spool_from_row,
            )
            .optional()?);
    }

    Ok(None)
}

pub fn soft_delete_spool(conn: &Connection, spool_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE spools SET deleted_at = ?1 WHERE id = ?2",
        params![ts_to_sql(&Utc::now()), spool_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    #[test]
    fn test_identifier_lookup_prefers_rfid() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let fil = create_filament(conn, "Basic PLA", "PLA", Some("FF0000"), Some(250.0))?;
            let mut a = NewSpool::new(fil);
            a.rfid_uid = Some("AABB".into());
            let a_id = create_spool(conn, &a)?;
            let mut b = NewSpool::new(fil);
            b.external_id = Some("spoolman:7".into());
            let b_id = create_spool(conn, &b)?;

            let hit = find_spool_by_identifier(conn, Some("AABB"), Some("spoolman:7"))?;
            assert_eq!(hit.map(|s| s.id), Some(a_id));

            let hit = find_spool_by_identifier(conn, Some("nope"), Some("spoolman:7"))?;
            assert_eq!(hit.map(|s| s.id), Some(b_id));

            assert!(find_spool_by_identifier(conn, None, None)?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_soft_deleted_spool_is_not_resolved() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let fil = create_filament(conn, "PETG", "PETG", None, None)?;
            let mut s = NewSpool::new(fil);
            s.rfid_uid = Some("DEAD".into());
            let id = create_spool(conn, &s)?;
            soft_delete_spool(conn, id)?;

            assert!(find_spool_by_identifier(conn, Some("DEAD"), None)?.is_none());
            assert!(matches!(get_spool(conn, id), Err(SyncError::NotFound(_))));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_active_printers_skip_inactive() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let a = create_printer(conn, "X1C", "bambu", &json!({"host": "10.0.0.2"}))?;
            let b = create_printer(conn, "Voron", "klipper", &json!({"host": "voron.local"}))?;
            set_printer_active(conn, b, false)?;

            let active = list_active_printers(conn)?;
            assert_eq!(active.len(), 1);
            assert_eq!(active[0].id, a);
            assert_eq!(active[0].driver_config["host"], "10.0.0.2");
            Ok(())
        })
        .unwrap();
    }
}
