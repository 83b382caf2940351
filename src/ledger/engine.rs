//! Weight ledger engine.
//!
//! Every change to a spool's weight, status or location is appended to
//! `spool_events`; `spools.remaining_weight_g` is a cache derived from that
//! log and can be recomputed with `rebuild_remaining_weight`. Missing tare
//! and negative results never raise: they are encoded as meta flags.

use chrono::Utc;
use rusqlite::{params, Connection, Row};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::db::records::{self, Spool};
use crate::db::{json_from_sql, json_to_sql, ts_from_sql, ts_to_sql};
use crate::error::{Result, SyncError};

use super::types::*;

/// Columns of a new ledger row; everything except the spool/type/context is optional.
#[derive(Debug, Default)]
struct EventFields {
    delta_weight_g: Option<f64>,
    measured_weight_g: Option<f64>,
    from_status_id: Option<i64>,
    to_status_id: Option<i64>,
    from_location_id: Option<i64>,
    to_location_id: Option<i64>,
    meta: Option<Value>,
}

/// Result of pushing a raw remaining value through the floor-at-zero rule.
struct Clamped {
    remaining: f64,
    clamped: bool,
}

fn clamp_to_zero(raw: f64) -> Clamped {
    if raw < 0.0 {
        Clamped {
            remaining: 0.0,
            clamped: true,
        }
    } else {
        Clamped {
            remaining: raw,
            clamped: false,
        }
    }
}

fn meta_or_none(meta: Map<String, Value>) -> Option<Value> {
    if meta.is_empty() {
        None
    } else {
        Some(Value::Object(meta))
    }
}

pub struct WeightLedger<'c> {
    conn: &'c Connection,
}

impl<'c> WeightLedger<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Empty-spool weight: the spool's own override, else the filament default.
    pub fn tare(&self, spool: &Spool) -> Result<Option<f64>> {
        if spool.empty_spool_weight_g.is_some() {
            return Ok(spool.empty_spool_weight_g);
        }
        let filament = records::get_filament(self.conn, spool.filament_id)?;
        Ok(filament.default_spool_weight_g)
    }

    fn insert_event(
        &self,
        spool_id: i64,
        event_type: &str,
        ctx: &EventContext,
        fields: EventFields,
    ) -> Result<SpoolEvent> {
        self.conn.execute(
            "INSERT INTO spool_events
                 (spool_id, event_type, event_at, source, delta_weight_g, measured_weight_g,
                  from_status_id, to_status_id, from_location_id, to_location_id, note, meta, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                spool_id,
                event_type,
                ts_to_sql(&ctx.event_at),
                ctx.source,
                fields.delta_weight_g,
                fields.measured_weight_g,
                fields.from_status_id,
                fields.to_status_id,
                fields.from_location_id,
                fields.to_location_id,
                ctx.note,
                json_to_sql(&fields.meta)?,
                ts_to_sql(&Utc::now()),
            ],
        )?;

        Ok(SpoolEvent {
            id: self.conn.last_insert_rowid(),
            spool_id,
            event_type: event_type.to_string(),
            event_at: ctx.event_at,
            source: Some(ctx.source.clone()),
            delta_weight_g: fields.delta_weight_g,
            measured_weight_g: fields.measured_weight_g,
            from_status_id: fields.from_status_id,
            to_status_id: fields.to_status_id,
            from_location_id: fields.from_location_id,
            to_location_id: fields.to_location_id,
            note: ctx.note.clone(),
            meta: fields.meta,
        })
    }

    fn set_remaining(&self, spool_id: i64, remaining: Option<f64>) -> Result<()> {
        self.conn.execute(
            "UPDATE spools SET remaining_weight_g = ?1 WHERE id = ?2",
            params![remaining, spool_id],
        )?;
        Ok(())
    }

    fn set_status(&self, spool_id: i64, status_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE spools SET status_id = ?1 WHERE id = ?2",
            params![status_id, spool_id],
        )?;
        Ok(())
    }

    /// System transition to `status_key` unless the spool already has it.
    /// Returns the status event when a transition happened.
    fn auto_transition(
        &self,
        spool_id: i64,
        status_key: &str,
        meta: Value,
    ) -> Result<Option<SpoolEvent>> {
        let spool = records::get_spool(self.conn, spool_id)?;
        let current = records::status_by_id(self.conn, spool.status_id)?;
        if current.key == status_key {
            return Ok(None);
        }
        let Some(target) = records::status_by_key(self.conn, status_key)? else {
            warn!("Spool status '{}' missing, skipping auto transition", status_key);
            return Ok(None);
        };

        self.set_status(spool_id, target.id)?;
        let event = self.insert_event(
            spool_id,
            status_key,
            &EventContext::now(SOURCE_SYSTEM),
            EventFields {
                from_status_id: Some(current.id),
                to_status_id: Some(target.id),
                meta: Some(meta),
                ..Default::default()
            },
        )?;
        info!("Spool {}: auto status {} -> {}", spool_id, current.key, status_key);
        Ok(Some(event))
    }

    /// `new -> opened` on the first weight-affecting event.
    fn auto_opened(&self, spool_id: i64) -> Result<()> {
        let spool = records::get_spool(self.conn, spool_id)?;
        if records::status_by_id(self.conn, spool.status_id)?.key == "new" {
            self.auto_transition(
                spool_id,
                "opened",
                json!({ "auto": true, "reason": "weight_changed" }),
            )?;
        }
        Ok(())
    }

    /// Shared tail of every weight-affecting call that produced a value:
    /// store the event, update the cache, run the status side effects.
    fn commit_weight(
        &self,
        spool_id: i64,
        event_type: &str,
        ctx: &EventContext,
        mut fields: EventFields,
        mut meta: Map<String, Value>,
        raw_remaining: f64,
    ) -> Result<WeightOutcome> {
        let Clamped { remaining, clamped } = clamp_to_zero(raw_remaining);
        if clamped {
            meta.insert("clamped_to_zero".to_string(), json!(true));
        }
        fields.meta = meta_or_none(meta);

        let event = self.insert_event(spool_id, event_type, ctx, fields)?;
        self.set_remaining(spool_id, Some(remaining))?;
        self.auto_opened(spool_id)?;

        if remaining == 0.0 && !clamped {
            self.auto_transition(
                spool_id,
                "empty",
                json!({ "auto": true, "trigger_event_id": event.id }),
            )?;
        }

        Ok(WeightOutcome {
            event,
            remaining_weight_g: Some(remaining),
        })
    }

    /// Gross weight from a scale. Without a tare the event is kept with
    /// `tara_missing` and the cached remaining weight is left alone.
    pub fn record_measurement(
        &self,
        spool_id: i64,
        measured_weight_g: f64,
        ctx: &EventContext,
    ) -> Result<WeightOutcome> {
        let spool = records::get_spool(self.conn, spool_id)?;
        let fields = EventFields {
            measured_weight_g: Some(measured_weight_g),
            ..Default::default()
        };

        let Some(tare) = self.tare(&spool)? else {
            warn!("Spool {}: measurement {}g without tare", spool_id, measured_weight_g);
            let event = self.insert_event(
                spool_id,
                EVENT_MEASUREMENT,
                ctx,
                EventFields {
                    meta: Some(json!({ "tara_missing": true })),
                    ..fields
                },
            )?;
            return Ok(WeightOutcome {
                event,
                remaining_weight_g: spool.remaining_weight_g,
            });
        };

        let outcome = self.commit_weight(
            spool_id,
            EVENT_MEASUREMENT,
            ctx,
            fields,
            Map::new(),
            measured_weight_g - tare,
        )?;
        info!(
            "Spool {}: measured {}g, remaining {:?}g",
            spool_id, measured_weight_g, outcome.remaining_weight_g
        );
        Ok(outcome)
    }

    pub fn record_adjustment(
        &self,
        spool_id: i64,
        adjustment: Adjustment,
        ctx: &EventContext,
    ) -> Result<WeightOutcome> {
        let spool = records::get_spool(self.conn, spool_id)?;
        let mut meta = Map::new();
        meta.insert("adjustment_type".to_string(), json!(adjustment.kind()));

        match adjustment {
            Adjustment::Relative { delta_weight_g } => {
                let fields = EventFields {
                    delta_weight_g: Some(delta_weight_g),
                    ..Default::default()
                };
                match spool.remaining_weight_g {
                    Some(current) => self.commit_weight(
                        spool_id,
                        EVENT_MANUAL_ADJUST,
                        ctx,
                        fields,
                        meta,
                        current + delta_weight_g,
                    ),
                    None => {
                        let event = self.insert_event(
                            spool_id,
                            EVENT_MANUAL_ADJUST,
                            ctx,
                            EventFields {
                                meta: meta_or_none(meta),
                                ..fields
                            },
                        )?;
                        Ok(WeightOutcome {
                            event,
                            remaining_weight_g: None,
                        })
                    }
                }
            }
            Adjustment::Absolute { measured_weight_g } => {
                let fields = EventFields {
                    measured_weight_g: Some(measured_weight_g),
                    ..Default::default()
                };
                match self.tare(&spool)? {
                    Some(tare) => self.commit_weight(
                        spool_id,
                        EVENT_MANUAL_ADJUST,
                        ctx,
                        fields,
                        meta,
                        measured_weight_g - tare,
                    ),
                    None => {
                        warn!("Spool {}: absolute adjustment without tare", spool_id);
                        meta.insert("tara_missing".to_string(), json!(true));
                        let event = self.insert_event(
                            spool_id,
                            EVENT_MANUAL_ADJUST,
                            ctx,
                            EventFields {
                                meta: meta_or_none(meta),
                                ..fields
                            },
                        )?;
                        Ok(WeightOutcome {
                            event,
                            remaining_weight_g: spool.remaining_weight_g,
                        })
                    }
                }
            }
        }
    }

    /// Filament used by a print. The delta always reduces the remaining weight.
    pub fn record_consumption(
        &self,
        spool_id: i64,
        delta_weight_g: f64,
        ctx: &EventContext,
    ) -> Result<WeightOutcome> {
        let spool = records::get_spool(self.conn, spool_id)?;
        let delta = -delta_weight_g.abs();

        self.conn.execute(
            "UPDATE spools SET last_used_at = ?1 WHERE id = ?2",
            params![ts_to_sql(&ctx.event_at), spool_id],
        )?;

        let fields = EventFields {
            delta_weight_g: Some(delta),
            ..Default::default()
        };

        match spool.remaining_weight_g {
            Some(current) => self.commit_weight(
                spool_id,
                EVENT_PRINT_CONSUMPTION,
                ctx,
                fields,
                Map::new(),
                current + delta,
            ),
            None => {
                let event = self.insert_event(spool_id, EVENT_PRINT_CONSUMPTION, ctx, fields)?;
                Ok(WeightOutcome {
                    event,
                    remaining_weight_g: None,
                })
            }
        }
    }

    pub fn change_status(
        &self,
        spool_id: i64,
        status_key: &str,
        ctx: &EventContext,
        meta: Option<Value>,
    ) -> Result<SpoolEvent> {
        let spool = records::get_spool(self.conn, spool_id)?;
        let new_status = records::status_by_key(self.conn, status_key)?
            .ok_or_else(|| SyncError::NotFound(format!("Status not found: {}", status_key)))?;

        let event = self.insert_event(
            spool_id,
            status_key,
            ctx,
            EventFields {
                from_status_id: Some(spool.status_id),
                to_status_id: Some(new_status.id),
                meta,
                ..Default::default()
            },
        )?;
        self.set_status(spool_id, new_status.id)?;

        info!("Spool {}: status -> {}", spool_id, status_key);
        Ok(event)
    }

    pub fn move_location(
        &self,
        spool_id: i64,
        to_location_id: Option<i64>,
        ctx: &EventContext,
    ) -> Result<SpoolEvent> {
        let spool = records::get_spool(self.conn, spool_id)?;
        if let Some(location_id) = to_location_id {
            records::get_location(self.conn, location_id)?;
        }

        let event = self.insert_event(
            spool_id,
            EVENT_MOVE_LOCATION,
            ctx,
            EventFields {
                from_location_id: spool.location_id,
                to_location_id,
                ..Default::default()
            },
        )?;
        self.conn.execute(
            "UPDATE spools SET location_id = ?1 WHERE id = ?2",
            params![to_location_id, spool_id],
        )?;

        info!("Spool {}: moved {:?} -> {:?}", spool_id, spool.location_id, to_location_id);
        Ok(event)
    }

    /// Spool history, oldest first.
    pub fn list_events(&self, spool_id: i64) -> Result<Vec<SpoolEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, spool_id, event_type, event_at, source, delta_weight_g, measured_weight_g,
                    from_status_id, to_status_id, from_location_id, to_location_id, note, meta
             FROM spool_events WHERE spool_id = ?1 ORDER BY event_at, id",
        )?;
        let rows = stmt.query_map(params![spool_id], event_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Replay the whole event log to recompute the cached remaining weight.
    ///
    /// A measurement or absolute adjustment met while the tare is unknown
    /// aborts the replay: the cache is set to NULL and a system event records
    /// the last plausible value and the offending event.
    pub fn rebuild_remaining_weight(&self, spool_id: i64) -> Result<Option<f64>> {
        let spool = records::get_spool(self.conn, spool_id)?;
        let tare = self.tare(&spool)?;
        let events = self.list_events(spool_id)?;

        let mut remaining: Option<f64> = None;
        let mut last_plausible = spool.remaining_weight_g;

        for event in &events {
            let gross = match event.event_type.as_str() {
                EVENT_MEASUREMENT => event.measured_weight_g,
                EVENT_MANUAL_ADJUST if event.meta_str("adjustment_type") == Some("absolute") => {
                    event.measured_weight_g
                }
                _ => None,
            };

            if let Some(measured) = gross {
                let Some(tare) = tare else {
                    return self.abort_rebuild(spool_id, last_plausible, event.id);
                };
                remaining = Some(clamp_to_zero(measured - tare).remaining);
            } else {
                let delta = match event.event_type.as_str() {
                    EVENT_MANUAL_ADJUST if event.meta_str("adjustment_type") == Some("relative") => {
                        event.delta_weight_g
                    }
                    EVENT_PRINT_CONSUMPTION => event.delta_weight_g,
                    _ => None,
                };
                if let (Some(current), Some(delta)) = (remaining, delta) {
                    remaining = Some(clamp_to_zero(current + delta).remaining);
                }
            }

            if remaining.is_some() {
                last_plausible = remaining;
            }
        }

        self.set_remaining(spool_id, remaining)?;

        if remaining == Some(0.0) {
            self.auto_transition(
                spool_id,
                "empty",
                json!({
                    "auto": true,
                    "source": "rebuild",
                    "reason": "remaining_rebuilt_to_zero",
                }),
            )?;
        }

        info!(
            "Spool {}: rebuilt remaining weight from {} events -> {:?}g",
            spool_id,
            events.len(),
            remaining
        );
        Ok(remaining)
    }

    fn abort_rebuild(
        &self,
        spool_id: i64,
        last_plausible: Option<f64>,
        affected_event_id: i64,
    ) -> Result<Option<f64>> {
        warn!(
            "Spool {}: rebuild blocked by event {} (tare missing), remaining set to NULL",
            spool_id, affected_event_id
        );
        self.insert_event(
            spool_id,
            EVENT_MANUAL_ADJUST,
            &EventContext::now(SOURCE_SYSTEM)
                .with_note("Rebuild blocked: tara missing, remaining set to NULL"),
            EventFields {
                meta: Some(json!({
                    "source": "rebuild",
                    "warning": "tara_missing",
                    "last_plausible_remaining_g": last_plausible,
                    "affected_event_id": affected_event_id,
                })),
                ..Default::default()
            },
        )?;
        self.set_remaining(spool_id, None)?;
        Ok(None)
    }
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<SpoolEvent> {
    let event_at: String = row.get(3)?;
    Ok(SpoolEvent {
        id: row.get(0)?,
        spool_id: row.get(1)?,
        event_type: row.get(2)?,
        event_at: ts_from_sql(3, &event_at)?,
        source: row.get(4)?,
        delta_weight_g: row.get(5)?,
        measured_weight_g: row.get(6)?,
        from_status_id: row.get(7)?,
        to_status_id: row.get(8)?,
        from_location_id: row.get(9)?,
        to_location_id: row.get(10)?,
        note: row.get(11)?,
        meta: json_from_sql(12, row.get(12)?)?,
    })
}
