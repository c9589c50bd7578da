//! Opportunity sources and the bookkeeping around them.
//!
//! Contains:
//! - The `OpportunitySource` interface and the opportunities it reports
//! - The source registry with per-source performance records and ranking
//! - Capital allocation across sources
//! - Five built-in analysis policies and a factory that builds them from config

mod allocator;
mod arbitrage;
mod cross_chain;
mod factory;
mod liquidation;
mod registry;
mod source;
mod stat_arb;
mod yield_farming;

pub use allocator::CapitalAllocation;
pub use arbitrage::DexArbitrageSource;
pub use cross_chain::CrossChainSource;
pub use factory::{build_sources, describe_sources, BuiltSource, SourceDescription, BUILTIN_SOURCES};
pub use liquidation::LiquidationSource;
pub use registry::{PerformanceRecord, Ranking, Registry, RegistrySummary};
pub use source::{Opportunity, OpportunityKind, OpportunitySource, Signal, SignalAction};
pub use stat_arb::{correlation, z_score, StatisticalArbitrageSource};
pub use yield_farming::YieldOptimizerSource;
