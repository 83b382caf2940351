//! Printer slot state reconciliation.
//!
//! Driver events become rows in two tables:
//!
//! - `printer_slot_events`: append-only history, the source of truth
//! - `printer_slot_assignments`: one current-state row per slot (a cache)
//!
//! Operator-entered ("manual") assignments win over automatic detection;
//! bulk updates that contradict them are reported as `ManualConflict`s.

mod engine;
mod types;

pub use engine::SlotReconciler;
pub use types::*;
