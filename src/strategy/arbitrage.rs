//! Same-chain DEX arbitrage between venue pairs.
//!
//! Reads `exchanges: [{name, price, liquidity}]`, `gas_price` (gwei) and,
//! when present, `asset_prices.ETH` for gas valuation.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use tracing::debug;

use super::source::{Opportunity, OpportunityKind, OpportunitySource};
use crate::config::DexArbitrageConfig;
use crate::feed::snapshot::{number, text};
use crate::feed::Snapshot;
use crate::utils::{clamp_unit, decimal_from_json};

pub(crate) const DEFAULT_GAS_PRICE_GWEI: Decimal = dec!(50);
pub(crate) const DEFAULT_ETH_PRICE_USD: Decimal = dec!(2000);
const GWEI_PER_ETH: Decimal = dec!(1000000000);

/// Gas cost in USD for `gas_units` at the snapshot's gas and ETH prices.
/// `None` when the quoted prices are too large to multiply out.
pub(crate) fn gas_cost_usd(snapshot: &Snapshot, gas_units: u64) -> Option<Decimal> {
    let gas_price = snapshot.decimal("gas_price").unwrap_or(DEFAULT_GAS_PRICE_GWEI);
    gas_price
        .checked_div(GWEI_PER_ETH)?
        .checked_mul(Decimal::from(gas_units))?
        .checked_mul(eth_price_usd(snapshot))
}

pub(crate) fn eth_price_usd(snapshot: &Snapshot) -> Decimal {
    snapshot
        .object("asset_prices")
        .and_then(|prices| prices.get("ETH"))
        .and_then(decimal_from_json)
        .filter(|p| *p > Decimal::ZERO)
        .unwrap_or(DEFAULT_ETH_PRICE_USD)
}

struct Venue<'a> {
    name: &'a str,
    price: Decimal,
    liquidity: Decimal,
}

/// Buys on the cheaper venue and sells on the dearer one.
pub struct DexArbitrageSource {
    id: String,
    config: DexArbitrageConfig,
}

impl DexArbitrageSource {
    pub const ID: &'static str = "dex_arbitrage";

    pub fn new(config: DexArbitrageConfig) -> Self {
        Self {
            id: Self::ID.to_string(),
            config,
        }
    }

    /// Score combining gap size, depth and gas drag; 0 when not worth doing.
    /// `None` if the inputs overflow.
    fn score(&self, profit: Decimal, liquidity: Decimal, gas_cost: Decimal) -> Option<Decimal> {
        // A 2% gap is treated as certain to fill
        let execution_probability = profit.checked_div(dec!(0.02))?.min(Decimal::ONE);
        let liquidity_score = (liquidity / dec!(100000)).min(dec!(10));
        let gas_impact = if self.config.max_gas_cost_usd > Decimal::ZERO {
            gas_cost.checked_div(self.config.max_gas_cost_usd)?.min(Decimal::ONE)
        } else {
            Decimal::ONE
        };

        let score = profit
            .checked_mul(dec!(100))?
            .checked_mul(liquidity_score)?
            .checked_mul(execution_probability)?
            .checked_sub(gas_impact * dec!(10))?;
        Some(score.max(Decimal::ZERO))
    }
}

impl OpportunitySource for DexArbitrageSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> OpportunityKind {
        OpportunityKind::DexArbitrage
    }

    fn min_confidence(&self) -> Decimal {
        self.config.min_confidence
    }

    fn analyze(&self, snapshot: &Snapshot) -> Vec<Opportunity> {
        let venues: Vec<Venue> = snapshot
            .array("exchanges")
            .iter()
            .filter_map(|v| {
                Some(Venue {
                    name: text(v, "name")?,
                    price: number(v, "price")?,
                    liquidity: number(v, "liquidity").unwrap_or(Decimal::ZERO),
                })
            })
            .filter(|v| v.price > Decimal::ZERO)
            .collect();

        if venues.len() < 2 {
            return Vec::new();
        }

        let Some(gas_cost) = gas_cost_usd(snapshot, self.config.gas_units) else {
            debug!(source = %self.id, "Gas cost out of range, skipping snapshot");
            return Vec::new();
        };
        let mut found: Vec<(Decimal, Opportunity)> = Vec::new();

        for (i, a) in venues.iter().enumerate() {
            for b in &venues[i + 1..] {
                let (buy, sell) = if a.price < b.price { (a, b) } else { (b, a) };
                let liquidity = a.liquidity.min(b.liquidity);
                let Some((profit, score)) = (sell.price - buy.price)
                    .checked_div(buy.price)
                    .and_then(|profit| Some((profit, self.score(profit, liquidity, gas_cost)?)))
                else {
                    debug!(source = %self.id, buy = buy.name, sell = sell.name, "Price gap out of range, skipping pair");
                    continue;
                };

                if profit < self.config.min_profit_fraction
                    || liquidity < self.config.min_liquidity
                    || score <= Decimal::ZERO
                {
                    continue;
                }

                let context = json!({
                    "buy_exchange": buy.name,
                    "sell_exchange": sell.name,
                    "buy_price": buy.price,
                    "sell_price": sell.price,
                    "available_liquidity": liquidity,
                    "estimated_gas_cost": gas_cost.round_dp(2),
                    "score": score.round_dp(4),
                });
                let opportunity = Opportunity::new(
                    &self.id,
                    OpportunityKind::DexArbitrage,
                    profit,
                    clamp_unit(score / dec!(50)),
                    context,
                );
                found.push((score, opportunity));
            }
        }

        found.sort_by(|a, b| b.0.cmp(&a.0));
        found.into_iter().map(|(_, o)| o).collect()
    }
}
