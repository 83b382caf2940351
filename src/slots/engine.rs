//! Slot reconciliation engine.
//!
//! `SlotReconciler` applies normalized driver events to the slot tables.
//! It never commits: callers wrap a whole inbound message in one
//! transaction (see `Database::transaction`) and hand the transaction in.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::db::records::{self, Spool};
use crate::db::{json_from_sql, json_to_sql, opt_ts_from_sql, ts_from_sql, ts_to_sql};
use crate::error::Result;

use super::types::*;

/// Slot count assumed for a feeder unit first seen through a single-slot event.
const DEFAULT_UNIT_SLOTS: i64 = 4;

/// Desired assignment content, compared before writing so that
/// re-applying identical state leaves the row untouched.
#[derive(Debug, PartialEq)]
struct AssignmentState {
    present: bool,
    spool_id: Option<i64>,
    rfid_uid: Option<String>,
    external_id: Option<String>,
    meta: Option<Value>,
}

impl AssignmentState {
    fn empty() -> Self {
        Self {
            present: false,
            spool_id: None,
            rfid_uid: None,
            external_id: None,
            meta: None,
        }
    }

    fn of(assignment: &SlotAssignment) -> Self {
        Self {
            present: assignment.present,
            spool_id: assignment.spool_id,
            rfid_uid: assignment.rfid_uid.clone(),
            external_id: assignment.external_id.clone(),
            meta: assignment.meta.clone(),
        }
    }
}

pub struct SlotReconciler<'c> {
    conn: &'c Connection,
}

impl<'c> SlotReconciler<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    // --- Units and slots ---

    /// Find or create a feeder unit. `slots_total`/`name` update an
    /// existing row when given and different.
    pub fn get_or_create_ams_unit(
        &self,
        printer_id: i64,
        ams_unit_no: i64,
        slots_total: Option<i64>,
        name: Option<&str>,
    ) -> Result<i64> {
        let existing: Option<(i64, i64, Option<String>)> = self
            .conn
            .query_row(
                "SELECT id, slots_total, name FROM printer_ams_units
                 WHERE printer_id = ?1 AND ams_unit_no = ?2",
                params![printer_id, ams_unit_no],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        if let Some((id, current_total, current_name)) = existing {
            if let Some(total) = slots_total.filter(|t| *t != current_total) {
                self.conn.execute(
                    "UPDATE printer_ams_units SET slots_total = ?1 WHERE id = ?2",
                    params![total, id],
                )?;
            }
            if let Some(name) = name.filter(|n| current_name.as_deref() != Some(*n)) {
                self.conn.execute(
                    "UPDATE printer_ams_units SET name = ?1 WHERE id = ?2",
                    params![name, id],
                )?;
            }
            return Ok(id);
        }

        self.conn.execute(
            "INSERT INTO printer_ams_units (printer_id, ams_unit_no, name, slots_total)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                printer_id,
                ams_unit_no,
                name,
                slots_total.unwrap_or(DEFAULT_UNIT_SLOTS)
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!("Created AMS unit {} (#{}) for printer {}", id, ams_unit_no, printer_id);
        Ok(id)
    }

    fn find_ams_unit(&self, printer_id: i64, ams_unit_no: i64) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id FROM printer_ams_units WHERE printer_id = ?1 AND ams_unit_no = ?2",
                params![printer_id, ams_unit_no],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn find_slot_by_unit_id(
        &self,
        printer_id: i64,
        ams_unit_id: Option<i64>,
        slot_no: i64,
    ) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id FROM printer_slots
                 WHERE printer_id = ?1 AND is_ams_slot = ?2
                   AND IFNULL(ams_unit_id, -1) = IFNULL(?3, -1) AND slot_no = ?4",
                params![printer_id, ams_unit_id.is_some(), ams_unit_id, slot_no],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Find or create a slot and its (empty) assignment row.
    pub fn get_or_create_slot(
        &self,
        printer_id: i64,
        slot_no: i64,
        ams_unit_id: Option<i64>,
        name: Option<&str>,
    ) -> Result<i64> {
        if let Some(id) = self.find_slot_by_unit_id(printer_id, ams_unit_id, slot_no)? {
            if let Some(name) = name {
                self.conn.execute(
                    "UPDATE printer_slots SET name = ?1 WHERE id = ?2",
                    params![name, id],
                )?;
            }
            return Ok(id);
        }

        self.conn.execute(
            "INSERT INTO printer_slots (printer_id, is_ams_slot, ams_unit_id, slot_no, name)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![printer_id, ams_unit_id.is_some(), ams_unit_id, slot_no, name],
        )?;
        let slot_id = self.conn.last_insert_rowid();

        self.conn.execute(
            "INSERT INTO printer_slot_assignments (slot_id, present, updated_at)
             VALUES (?1, 0, ?2)",
            params![slot_id, ts_to_sql(&Utc::now())],
        )?;

        debug!("Created slot {} (no {}) for printer {}", slot_id, slot_no, printer_id);
        Ok(slot_id)
    }

    /// Resolve an address to a slot id, creating unit and slot when absent.
    fn ensure_slot(&self, address: &SlotAddress) -> Result<i64> {
        let unit_id = match address.ams_unit_no {
            Some(unit_no) => Some(self.get_or_create_ams_unit(address.printer_id, unit_no, None, None)?),
            None => None,
        };
        self.get_or_create_slot(address.printer_id, address.slot_no, unit_id, None)
    }

    /// Resolve an address to an existing slot id without creating anything.
    pub fn find_slot(&self, address: &SlotAddress) -> Result<Option<i64>> {
        let unit_id = match address.ams_unit_no {
            Some(unit_no) => match self.find_ams_unit(address.printer_id, unit_no)? {
                Some(id) => Some(id),
                None => return Ok(None),
            },
            None => None,
        };
        self.find_slot_by_unit_id(address.printer_id, unit_id, address.slot_no)
    }

    // --- Assignments and events ---

    pub fn assignment(&self, slot_id: i64) -> Result<Option<SlotAssignment>> {
        Ok(self
            .conn
            .query_row(
                "SELECT slot_id, spool_id, present, rfid_uid, external_id, inserted_at, updated_at, meta
                 FROM printer_slot_assignments WHERE slot_id = ?1",
                params![slot_id],
                assignment_from_row,
            )
            .optional()?)
    }

    /// Assignment for an address, if the slot exists.
    pub fn assignment_at(&self, address: &SlotAddress) -> Result<Option<SlotAssignment>> {
        match self.find_slot(address)? {
            Some(slot_id) => self.assignment(slot_id),
            None => Ok(None),
        }
    }

    /// All assignments of a printer, ordered by slot id.
    pub fn list_assignments(&self, printer_id: i64) -> Result<Vec<SlotAssignment>> {
        let mut stmt = self.conn.prepare(
            "SELECT a.slot_id, a.spool_id, a.present, a.rfid_uid, a.external_id,
                    a.inserted_at, a.updated_at, a.meta
             FROM printer_slot_assignments a
             JOIN printer_slots s ON s.id = a.slot_id
             WHERE s.printer_id = ?1
             ORDER BY a.slot_id",
        )?;
        let rows = stmt.query_map(params![printer_id], assignment_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Slot history, oldest first.
    pub fn list_events(&self, slot_id: i64) -> Result<Vec<SlotEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, printer_id, slot_id, event_type, event_at, spool_id, rfid_uid, external_id, meta
             FROM printer_slot_events WHERE slot_id = ?1 ORDER BY event_at, id",
        )?;
        let rows = stmt.query_map(params![slot_id], event_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count_events(&self, printer_id: i64) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM printer_slot_events WHERE printer_id = ?1",
            params![printer_id],
            |row| row.get(0),
        )?)
    }

    /// Write the assignment only when its content changes.
    fn write_assignment(&self, slot_id: i64, desired: AssignmentState, event_at: DateTime<Utc>) -> Result<()> {
        let current = self.assignment(slot_id)?;
        if current.as_ref().map(AssignmentState::of).as_ref() == Some(&desired) {
            return Ok(());
        }

        let inserted_at = if desired.present {
            // Keep the original insertion time when the same spool stays in the slot.
            match &current {
                Some(c) if c.present && c.spool_id == desired.spool_id && c.inserted_at.is_some() => c.inserted_at,
                _ => Some(event_at),
            }
        } else {
            None
        };

        self.conn.execute(
            "INSERT INTO printer_slot_assignments
                 (slot_id, spool_id, present, rfid_uid, external_id, inserted_at, updated_at, meta)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(slot_id) DO UPDATE SET
                 spool_id = excluded.spool_id,
                 present = excluded.present,
                 rfid_uid = excluded.rfid_uid,
                 external_id = excluded.external_id,
                 inserted_at = excluded.inserted_at,
                 updated_at = excluded.updated_at,
                 meta = excluded.meta",
            params![
                slot_id,
                desired.spool_id,
                desired.present,
                desired.rfid_uid,
                desired.external_id,
                inserted_at.as_ref().map(ts_to_sql),
                ts_to_sql(&event_at),
                json_to_sql(&desired.meta)?,
            ],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_event(
        &self,
        printer_id: i64,
        slot_id: i64,
        event_type: SlotEventType,
        event_at: DateTime<Utc>,
        spool_id: Option<i64>,
        rfid_uid: Option<&str>,
        external_id: Option<&str>,
        meta: Option<Value>,
    ) -> Result<SlotEvent> {
        self.conn.execute(
            "INSERT INTO printer_slot_events
                 (printer_id, slot_id, event_type, event_at, spool_id, rfid_uid, external_id, meta, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                printer_id,
                slot_id,
                event_type.as_str(),
                ts_to_sql(&event_at),
                spool_id,
                rfid_uid,
                external_id,
                json_to_sql(&meta)?,
                ts_to_sql(&Utc::now()),
            ],
        )?;

        Ok(SlotEvent {
            id: self.conn.last_insert_rowid(),
            printer_id,
            slot_id,
            event_type: event_type.as_str().to_string(),
            event_at,
            spool_id,
            rfid_uid: rfid_uid.map(str::to_string),
            external_id: external_id.map(str::to_string),
            meta,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn occupy_slot(
        &self,
        printer_id: i64,
        slot_id: i64,
        event_type: SlotEventType,
        spool: Option<&Spool>,
        rfid_uid: Option<&str>,
        external_id: Option<&str>,
        meta: Option<Value>,
        event_at: DateTime<Utc>,
    ) -> Result<SlotEvent> {
        let spool_id = spool.map(|s| s.id);
        self.write_assignment(
            slot_id,
            AssignmentState {
                present: true,
                spool_id,
                rfid_uid: rfid_uid.map(str::to_string),
                external_id: external_id.map(str::to_string),
                meta: meta.clone(),
            },
            event_at,
        )?;
        self.insert_event(
            printer_id, slot_id, event_type, event_at, spool_id, rfid_uid, external_id, meta,
        )
    }

    fn vacate_slot(
        &self,
        printer_id: i64,
        slot_id: i64,
        meta: Option<Value>,
        event_at: DateTime<Utc>,
    ) -> Result<SlotEvent> {
        self.write_assignment(slot_id, AssignmentState::empty(), event_at)?;
        self.insert_event(
            printer_id,
            slot_id,
            SlotEventType::SpoolRemoved,
            event_at,
            None,
            None,
            None,
            meta,
        )
    }

    // --- Public operations ---

    /// A spool was seen in a slot. An unresolvable spool is recorded as
    /// "occupied, unknown occupant", not as an error.
    pub fn apply_spool_inserted(
        &self,
        address: &SlotAddress,
        event_at: DateTime<Utc>,
        rfid_uid: Option<&str>,
        external_id: Option<&str>,
        meta: Option<Value>,
    ) -> Result<SlotEvent> {
        let slot_id = self.ensure_slot(address)?;
        let spool = records::find_spool_by_identifier(self.conn, rfid_uid, external_id)?;

        let event = self.occupy_slot(
            address.printer_id,
            slot_id,
            SlotEventType::SpoolInserted,
            spool.as_ref(),
            rfid_uid,
            external_id,
            meta,
            event_at,
        )?;

        info!(
            "Printer {} slot {} ({:?}/{}): spool inserted (spool={:?})",
            address.printer_id, slot_id, address.ams_unit_no, address.slot_no, event.spool_id
        );
        Ok(event)
    }

    /// A slot was reported empty. No-op when the slot was never seen.
    pub fn apply_spool_removed(
        &self,
        address: &SlotAddress,
        event_at: DateTime<Utc>,
        meta: Option<Value>,
    ) -> Result<Option<SlotEvent>> {
        let Some(slot_id) = self.find_slot(address)? else {
            debug!(
                "Printer {}: removal for unknown slot {:?}/{}, ignoring",
                address.printer_id, address.ams_unit_no, address.slot_no
            );
            return Ok(None);
        };

        let event = self.vacate_slot(address.printer_id, slot_id, meta, event_at)?;
        info!(
            "Printer {} slot {} ({:?}/{}): spool removed",
            address.printer_id, slot_id, address.ams_unit_no, address.slot_no
        );
        Ok(Some(event))
    }

    /// Something occupies the slot but must not be linked to a spool yet,
    /// even when identifiers are known.
    pub fn apply_unknown_spool_detected(
        &self,
        address: &SlotAddress,
        event_at: DateTime<Utc>,
        rfid_uid: Option<&str>,
        external_id: Option<&str>,
        meta: Option<Value>,
    ) -> Result<SlotEvent> {
        let slot_id = self.ensure_slot(address)?;
        let event = self.occupy_slot(
            address.printer_id,
            slot_id,
            SlotEventType::UnknownSpoolDetected,
            None,
            rfid_uid,
            external_id,
            meta,
            event_at,
        )?;
        info!(
            "Printer {} slot {}: unknown spool detected (rfid={:?}, external_id={:?})",
            address.printer_id, slot_id, rfid_uid, external_id
        );
        Ok(event)
    }

    /// Resync a printer's reported occupancy from one bulk message.
    /// Manually assigned slots that the report contradicts are left as they
    /// are and returned as conflicts.
    pub fn apply_ams_state(
        &self,
        printer_id: i64,
        units: &[AmsUnitState],
        event_at: DateTime<Utc>,
    ) -> Result<AmsStateOutcome> {
        let mut outcome = AmsStateOutcome::default();

        for unit in units {
            let unit_id =
                self.get_or_create_ams_unit(printer_id, unit.ams_unit_no, Some(unit.slots_total), None)?;

            for slot in &unit.slots {
                let slot_id = self.get_or_create_slot(printer_id, slot.slot_no, Some(unit_id), None)?;
                let current = self.assignment(slot_id)?;

                if let Some(manual) = current.as_ref().filter(|a| a.is_manual()) {
                    match self.manual_conflict(printer_id, unit.ams_unit_no, slot, manual)? {
                        Some(conflict) => {
                            info!(
                                "Printer {} slot {} ({}/{}): report conflicts with manual assignment (spool={:?})",
                                printer_id, slot_id, unit.ams_unit_no, slot.slot_no, manual.spool_id
                            );
                            outcome.conflicts.push(conflict);
                        }
                        None => debug!(
                            "Printer {} slot {}: report agrees with manual assignment",
                            printer_id, slot_id
                        ),
                    }
                    continue;
                }

                if slot.present {
                    let spool = records::find_spool_by_identifier(
                        self.conn,
                        slot.rfid_uid.as_deref(),
                        slot.external_id.as_deref(),
                    )?;
                    let event = self.occupy_slot(
                        printer_id,
                        slot_id,
                        SlotEventType::SpoolInserted,
                        spool.as_ref(),
                        slot.rfid_uid.as_deref(),
                        slot.external_id.as_deref(),
                        Some(bulk_meta(slot.meta.as_ref())),
                        event_at,
                    )?;
                    outcome.events.push(event);
                } else {
                    let event = self.vacate_slot(printer_id, slot_id, Some(bulk_meta(None)), event_at)?;
                    outcome.events.push(event);
                }
            }
        }

        info!(
            "Printer {}: applied ams_state ({} events, {} manual conflicts)",
            printer_id,
            outcome.events.len(),
            outcome.conflicts.len()
        );
        Ok(outcome)
    }

    /// A manual assignment is contradicted when the printer reports the slot
    /// empty, or reports identifiers that resolve to a different spool.
    fn manual_conflict(
        &self,
        printer_id: i64,
        ams_unit_no: i64,
        reported: &SlotState,
        manual: &SlotAssignment,
    ) -> Result<Option<ManualConflict>> {
        let contradicted = if !reported.present {
            manual.present
        } else if reported.rfid_uid.is_some() || reported.external_id.is_some() {
            let resolved = records::find_spool_by_identifier(
                self.conn,
                reported.rfid_uid.as_deref(),
                reported.external_id.as_deref(),
            )?;
            resolved.map(|s| s.id) != manual.spool_id
        } else {
            false
        };

        if !contradicted {
            return Ok(None);
        }

        let spool_external_id = match manual.spool_id {
            Some(id) => records::get_spool(self.conn, id).ok().and_then(|s| s.external_id),
            None => None,
        };

        Ok(Some(ManualConflict {
            printer_id,
            slot_id: manual.slot_id,
            ams_unit_no: Some(ams_unit_no),
            slot_no: reported.slot_no,
            spool_id: manual.spool_id,
            spool_external_id,
            assignment_meta: manual.meta.clone(),
            reported: reported.clone(),
        }))
    }

    /// Operator assignment of a spool to a slot (or clearing it with `None`).
    /// The assignment is marked manual, which protects it against bulk updates.
    pub fn assign_manual(
        &self,
        address: &SlotAddress,
        spool_id: Option<i64>,
        event_at: DateTime<Utc>,
    ) -> Result<SlotAssignment> {
        let slot_id = self.ensure_slot(address)?;

        match spool_id {
            Some(id) => {
                let spool = records::get_spool(self.conn, id)?;
                let meta = manual_meta(self.conn, &spool)?;
                self.occupy_slot(
                    address.printer_id,
                    slot_id,
                    SlotEventType::SpoolInserted,
                    Some(&spool),
                    spool.rfid_uid.as_deref(),
                    spool.external_id.as_deref(),
                    Some(meta),
                    event_at,
                )?;
                info!(
                    "Printer {} slot {}: spool {} assigned manually",
                    address.printer_id, slot_id, id
                );
            }
            None => {
                self.vacate_slot(
                    address.printer_id,
                    slot_id,
                    Some(json!({ "source": MANUAL_SOURCE })),
                    event_at,
                )?;
                info!("Printer {} slot {}: cleared manually", address.printer_id, slot_id);
            }
        }

        self.assignment(slot_id)?
            .ok_or_else(|| crate::error::SyncError::NotFound(format!("assignment for slot {}", slot_id)))
    }
}

/// Meta stored for a bulk update: the reported slot meta tagged with its source.
fn bulk_meta(reported: Option<&Value>) -> Value {
    let mut map = match reported {
        Some(Value::Object(m)) => m.clone(),
        _ => Map::new(),
    };
    map.insert("source".to_string(), json!("ams_state"));
    Value::Object(map)
}

/// Meta describing a manually assigned spool, also used to rebuild a
/// "set filament" command when the printer disagrees.
fn manual_meta(conn: &Connection, spool: &Spool) -> Result<Value> {
    let filament = records::get_filament(conn, spool.filament_id)?;

    let color_hex = filament
        .color_hex
        .as_deref()
        .map(|c| format!("{}FF", c.trim_start_matches('#').to_uppercase()))
        .unwrap_or_default();

    let remain_percent = match (spool.remaining_weight_g, spool.initial_total_weight_g) {
        (Some(remaining), Some(initial)) => {
            let net_initial = initial - spool.empty_spool_weight_g.unwrap_or(0.0);
            if net_initial > 0.0 {
                Some((remaining / net_initial * 100.0).round() as i64)
            } else {
                None
            }
        }
        _ => None,
    };

    Ok(json!({
        "source": MANUAL_SOURCE,
        "material": filament.material,
        "designation": filament.designation,
        "color_hex": color_hex,
        "remain_percent": remain_percent,
        "weight_g": spool.remaining_weight_g.map(|w| w.round() as i64),
    }))
}

fn assignment_from_row(row: &Row<'_>) -> rusqlite::Result<SlotAssignment> {
    let updated_at: String = row.get(6)?;
    Ok(SlotAssignment {
        slot_id: row.get(0)?,
        spool_id: row.get(1)?,
        present: row.get(2)?,
        rfid_uid: row.get(3)?,
        external_id: row.get(4)?,
        inserted_at: opt_ts_from_sql(5, row.get(5)?)?,
        updated_at: ts_from_sql(6, &updated_at)?,
        meta: json_from_sql(7, row.get(7)?)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<SlotEvent> {
    let event_at: String = row.get(4)?;
    Ok(SlotEvent {
        id: row.get(0)?,
        printer_id: row.get(1)?,
        slot_id: row.get(2)?,
        event_type: row.get(3)?,
        event_at: ts_from_sql(4, &event_at)?,
        spool_id: row.get(5)?,
        rfid_uid: row.get(6)?,
        external_id: row.get(7)?,
        meta: json_from_sql(8, row.get(8)?)?,
    })
}
