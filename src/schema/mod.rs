//! Per-user event table schema
//!
//! This module defines the input contract handed over by the ingestion stage:
//! the raw row shape and the adapter that turns a CSV or JSON table into
//! typed events.

mod adapter;
mod record;

pub use adapter::*;
pub use record::*;
