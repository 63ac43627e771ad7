// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod config;
pub mod detector;
pub mod error;
pub mod identity;
pub mod ingest;
pub mod latency;
pub mod leader;
pub mod metrics;
pub mod pipeline;
pub mod resilience;
pub mod store;
pub mod timing;
pub mod watermark;

// ---- Re-exports for stable public API ----
pub use crate::config::RadarConfig;
pub use crate::error::{CoreError, Result};
pub use crate::identity::{build_event_id, EventFingerprint, ListingEvent};
pub use crate::ingest::{Notice, NoticeSource};
pub use crate::pipeline::{
    Pipeline, PipelineConfig, PipelineParts, ProcessOutcome, TradeDispatcher,
};
pub use crate::store::{BaseClaim, EventStore, InsertOutcome, SqliteStore};
