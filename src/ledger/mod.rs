//! Spool weight ledger.
//!
//! Measurements, adjustments, consumption, status changes and location moves
//! are appended to `spool_events`. `spools.remaining_weight_g` is derived
//! from that log and `WeightLedger::rebuild_remaining_weight` recomputes it.

mod engine;
mod types;

pub use engine::WeightLedger;
pub use types::*;
