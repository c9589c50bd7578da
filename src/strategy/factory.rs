//! Builds the built-in sources from configuration.

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

use super::arbitrage::DexArbitrageSource;
use super::cross_chain::CrossChainSource;
use super::liquidation::LiquidationSource;
use super::source::OpportunitySource;
use super::stat_arb::StatisticalArbitrageSource;
use super::yield_farming::YieldOptimizerSource;
use crate::config::StrategiesConfig;

/// Ids of every built-in source, in registration order.
pub const BUILTIN_SOURCES: [&str; 5] = [
    DexArbitrageSource::ID,
    CrossChainSource::ID,
    LiquidationSource::ID,
    StatisticalArbitrageSource::ID,
    YieldOptimizerSource::ID,
];

/// A built-in source with its configured starting rank.
pub struct BuiltSource {
    pub source: Arc<dyn OpportunitySource>,
    pub initial_rank: Decimal,
}

/// One line of the built-in catalogue.
#[derive(Debug, Clone, Serialize)]
pub struct SourceDescription {
    pub id: &'static str,
    pub enabled: bool,
    pub initial_rank: Decimal,
    pub min_confidence: Decimal,
}

/// Catalogue of built-ins with their effective settings.
pub fn describe_sources(config: &StrategiesConfig) -> Vec<SourceDescription> {
    vec![
        SourceDescription {
            id: DexArbitrageSource::ID,
            enabled: config.dex_arbitrage.enabled,
            initial_rank: config.dex_arbitrage.initial_rank,
            min_confidence: config.dex_arbitrage.min_confidence,
        },
        SourceDescription {
            id: CrossChainSource::ID,
            enabled: config.cross_chain.enabled,
            initial_rank: config.cross_chain.initial_rank,
            min_confidence: config.cross_chain.min_confidence,
        },
        SourceDescription {
            id: LiquidationSource::ID,
            enabled: config.liquidation.enabled,
            initial_rank: config.liquidation.initial_rank,
            min_confidence: config.liquidation.min_confidence,
        },
        SourceDescription {
            id: StatisticalArbitrageSource::ID,
            enabled: config.statistical_arbitrage.enabled,
            initial_rank: config.statistical_arbitrage.initial_rank,
            min_confidence: config.statistical_arbitrage.min_confidence,
        },
        SourceDescription {
            id: YieldOptimizerSource::ID,
            enabled: config.yield_optimizer.enabled,
            initial_rank: config.yield_optimizer.initial_rank,
            min_confidence: config.yield_optimizer.min_confidence,
        },
    ]
}

/// Build every enabled source, optionally restricted to `only`.
///
/// Names in `only` must be built-in ids; listing a source selects it even
/// when its config disables it.
pub fn build_sources(config: &StrategiesConfig, only: Option<&[String]>) -> Result<Vec<BuiltSource>> {
    if let Some(names) = only {
        for name in names {
            if !BUILTIN_SOURCES.contains(&name.as_str()) {
                bail!(
                    "unknown strategy '{}', expected one of: {}",
                    name,
                    BUILTIN_SOURCES.join(", ")
                );
            }
        }
    }

    let selected = |id: &str, enabled: bool| match only {
        Some(names) => names.iter().any(|n| n == id),
        None => enabled,
    };

    let mut sources = Vec::new();
    if selected(DexArbitrageSource::ID, config.dex_arbitrage.enabled) {
        sources.push(BuiltSource {
            source: Arc::new(DexArbitrageSource::new(config.dex_arbitrage.clone())),
            initial_rank: config.dex_arbitrage.initial_rank,
        });
    }
    if selected(CrossChainSource::ID, config.cross_chain.enabled) {
        sources.push(BuiltSource {
            source: Arc::new(CrossChainSource::new(config.cross_chain.clone())),
            initial_rank: config.cross_chain.initial_rank,
        });
    }
    if selected(LiquidationSource::ID, config.liquidation.enabled) {
        sources.push(BuiltSource {
            source: Arc::new(LiquidationSource::new(config.liquidation.clone())),
            initial_rank: config.liquidation.initial_rank,
        });
    }
    if selected(StatisticalArbitrageSource::ID, config.statistical_arbitrage.enabled) {
        sources.push(BuiltSource {
            source: Arc::new(StatisticalArbitrageSource::new(config.statistical_arbitrage.clone())),
            initial_rank: config.statistical_arbitrage.initial_rank,
        });
    }
    if selected(YieldOptimizerSource::ID, config.yield_optimizer.enabled) {
        sources.push(BuiltSource {
            source: Arc::new(YieldOptimizerSource::new(config.yield_optimizer.clone())),
            initial_rank: config.yield_optimizer.initial_rank,
        });
    }

    if sources.is_empty() {
        bail!("no strategies enabled");
    }
    Ok(sources)
}
