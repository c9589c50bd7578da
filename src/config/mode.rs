//! Trading mode presets.
//!
//! A mode is a bundle of risk settings applied on top of the loaded
//! configuration. Values per mode:
//!
//! | mode         | max position | max loss / trade | active sources | min profit |
//! |--------------|--------------|------------------|----------------|------------|
//! | conservative | 5%           | 1%               | 2              | 2%         |
//! | balanced     | 10%          | 2%               | 4              | 1%         |
//! | aggressive   | 20%          | 5%               | 6              | 0.5%       |

use clap::ValueEnum;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Risk appetite preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Conservative,
    Balanced,
    Aggressive,
}

/// Settings a mode overrides.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModePreset {
    pub max_position_fraction: Decimal,
    pub max_loss_fraction_per_trade: Decimal,
    pub max_active_sources: usize,
    pub min_profit_fraction: Decimal,
}

impl TradingMode {
    pub fn preset(self) -> ModePreset {
        match self {
            TradingMode::Conservative => ModePreset {
                max_position_fraction: dec!(0.05),
                max_loss_fraction_per_trade: dec!(0.01),
                max_active_sources: 2,
                min_profit_fraction: dec!(0.02),
            },
            TradingMode::Balanced => ModePreset {
                max_position_fraction: dec!(0.10),
                max_loss_fraction_per_trade: dec!(0.02),
                max_active_sources: 4,
                min_profit_fraction: dec!(0.01),
            },
            TradingMode::Aggressive => ModePreset {
                max_position_fraction: dec!(0.20),
                max_loss_fraction_per_trade: dec!(0.05),
                max_active_sources: 6,
                min_profit_fraction: dec!(0.005),
            },
        }
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TradingMode::Conservative => "conservative",
            TradingMode::Balanced => "balanced",
            TradingMode::Aggressive => "aggressive",
        };
        f.write_str(name)
    }
}
