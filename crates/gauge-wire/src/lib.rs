//! Run event wire schema (v1) and the flat-record codecs shared by both
//! sides of the platform boundary.
//!
//! Every event the engine streams to the platform is one NDJSON line holding
//! a [`RunEventV1`] envelope: schema version, a globally unique event id, a
//! per-run monotonic sequence number, the send timestamp, the run id, and a
//! type-tagged payload. The platform applies batches idempotently, keyed on
//! `(run_id, event_id)`, so any batch may be retried safely.
//!
//! The CSV codec lives here too because the same format crosses the
//! boundary twice: the engine writes checkpoint rows with it and the
//! platform's upload endpoint reads those files back.

mod csv;
mod event;
mod ndjson;

pub use csv::*;
pub use event::*;
pub use ndjson::*;
