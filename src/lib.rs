//! CDR Indicators - mobility and connectivity aggregation engine
//!
//! Computes time-bucketed mobility indicators from standardized call
//! detail records through a deterministic pipeline: region enrichment →
//! home location inference → indicator aggregation → persisted, named
//! result tables.
//!
//! ## Modules
//!
//! - **Activity indicators**: transaction/subscriber counts, activity
//!   shares, travel distance statistics, new-SIM detection
//! - **Flow indicators**: origin→destination connection and duration
//!   matrices
//! - **Imported risk**: incidence-weighted exposure attributed to each
//!   traveler's destination region

pub mod activity;
pub mod enrichment;
pub mod error;
pub mod flow;
pub mod home_location;
pub mod persist;
pub mod risk;
pub mod runner;
pub mod schema;
pub mod stats;
pub mod types;

pub use enrichment::{CellRegionMap, EventEnrichment};
pub use error::AggregationError;
pub use home_location::{HomeLocation, HomeLocationResolver};
pub use persist::{MemorySink, NdjsonDirSink, ResultSink};
pub use runner::{AggregationConfig, AggregationContext, IndicatorRunner, RunReport};

// Schema exports
pub use schema::{RawCallRecord, RecordLoader};
pub use types::{
    CallEvent, DistanceMatrix, Frequency, IncidenceTable, IndicatorResult, PeriodFilter,
};

/// Engine version embedded in run reports
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for run provenance
pub const PRODUCER_NAME: &str = "cdr-indicators";
