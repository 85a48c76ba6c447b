//! Synheart Glyco - Regularization and rolling statistics for CGM and insulin data
//!
//! Glyco turns one user's irregular diabetes-device event table into a regular
//! 5-minute grid and computes trailing-window glycemic and insulin statistics
//! through a deterministic pipeline: classification → cleaning → duplicate
//! resolution → grid alignment → slot collapse → basal fill → rolling
//! statistics → daily snapshots → CSV encoding.
//!
//! ## Modules
//!
//! - **Per-user pipeline**: [`UserPipeline`] runs every stage for one user
//! - **Batch**: [`BatchOrchestrator`] fans many users' files out to a worker pool

pub mod basal;
pub mod batch;
pub mod classifier;
pub mod cleaner;
pub mod collapse;
pub mod config;
pub mod daily;
pub mod dedup;
pub mod encoder;
pub mod episodes;
pub mod error;
pub mod grid;
pub mod iob;
pub mod pipeline;
pub mod rolling;
pub mod schema;
pub mod types;

pub use batch::{discover_inputs, BatchOrchestrator, BatchSummary, FileOutcome, FileReport};
pub use classifier::RecordClassifier;
pub use config::{BasalFillStrategy, OutputMode, OutputModes, PipelineConfig, RoundingMode};
pub use encoder::RowEncoder;
pub use error::ComputeError;
pub use pipeline::{process_user, UserPipeline, UserReport};
pub use rolling::RollingStatisticsEngine;
pub use types::{DataClass, Event, EventType, WindowSpec};

// Schema exports
pub use schema::{EventTable, EventTableAdapter};

/// Glyco version recorded in every summary row
pub const GLYCO_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name recorded in every summary row
pub const PRODUCER_NAME: &str = "synheart-glyco";
