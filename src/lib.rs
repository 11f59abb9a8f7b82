//! Correlates detected price moves with nearby events and records how much
//! each event plausibly contributed.

pub mod analysis;
pub mod config;
pub mod feed;
pub mod logging;
pub mod model;
pub mod retry;
pub mod scoring;
pub mod sentiment;
pub mod storage;

pub use analysis::EventAnalyzer;
pub use config::Config;
pub use model::{Event, PriceChange, ScoredEvent};
pub use scoring::ImpactScorer;
pub use storage::{CorrelationStore, SaveSummary};
