//! # Omni Strategy Engine
//!
//! A multi-strategy opportunity orchestrator: it polls pluggable analysis
//! sources, ranks what they find, allocates bounded capital under risk
//! limits, and re-weights each source by its track record.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading, mode presets and startup invariants
//! - `error`: Typed errors for the orchestration core
//! - `feed`: Market-data snapshots, HTTP and simulated feeds, retry with backoff
//! - `strategy`: Opportunity sources, the registry and capital allocation
//! - `risk`: Position sizing, admission checks and the open-position book
//! - `engine`: The cycle state machine, scheduling, execution and telemetry
//! - `utils`: Shared decimal helpers

pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use engine::Orchestrator;
pub use error::EngineError;
