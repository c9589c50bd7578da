//! Cross-chain arbitrage through a bridge.
//!
//! Reads `chains: {name: {price, liquidity}}`. A route is taken when the price
//! gap survives the bridge fee and swap fees and the bridge is fast enough.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use tracing::debug;

use super::source::{Opportunity, OpportunityKind, OpportunitySource};
use crate::config::CrossChainConfig;
use crate::feed::snapshot::number;
use crate::feed::Snapshot;
use crate::utils::clamp_unit;

/// Known bridge quotes, symmetric.
const BRIDGE_FEES: [(&str, &str, Decimal); 6] = [
    ("Ethereum", "BSC", dec!(0.001)),
    ("Ethereum", "Polygon", dec!(0.001)),
    ("Ethereum", "Arbitrum", dec!(0.0005)),
    ("Ethereum", "Optimism", dec!(0.0005)),
    ("BSC", "Polygon", dec!(0.002)),
    ("BSC", "Avalanche", dec!(0.002)),
];

const LAYER_TWOS: [&str; 3] = ["Arbitrum", "Optimism", "Polygon"];

struct ChainQuote<'a> {
    name: &'a str,
    price: Decimal,
    liquidity: Decimal,
}

pub struct CrossChainSource {
    id: String,
    config: CrossChainConfig,
}

impl CrossChainSource {
    pub const ID: &'static str = "cross_chain";

    pub fn new(config: CrossChainConfig) -> Self {
        Self {
            id: Self::ID.to_string(),
            config,
        }
    }

    fn bridge_fee(&self, a: &str, b: &str) -> Decimal {
        BRIDGE_FEES
            .iter()
            .find(|(x, y, _)| (*x == a && *y == b) || (*x == b && *y == a))
            .map(|(_, _, fee)| *fee)
            .unwrap_or(self.config.default_bridge_fee)
    }

    /// Seconds to bridge; L2-to-L2 is fastest, L1-to-L1 slowest.
    fn bridge_time_secs(a: &str, b: &str) -> u64 {
        match (LAYER_TWOS.contains(&a), LAYER_TWOS.contains(&b)) {
            (true, true) => 180,
            (true, false) | (false, true) => 420,
            (false, false) => 600,
        }
    }

    fn score(net_profit: Decimal, liquidity: Decimal, bridge_secs: u64, bridge_fee: Decimal) -> Option<Decimal> {
        let profit_score = net_profit.checked_mul(dec!(100))?;
        let liquidity_score = (liquidity / dec!(50000)).min(dec!(10));
        let speed_score = (dec!(10) - Decimal::from(bridge_secs) / dec!(60)).max(Decimal::ZERO);
        let fee_score = (dec!(10) - bridge_fee * dec!(500)).max(Decimal::ZERO);

        (profit_score * dec!(0.50)).checked_add(
            liquidity_score * dec!(0.25) + speed_score * dec!(0.15) + fee_score * dec!(0.10),
        )
    }

    /// Relative gap net of fees; `None` when the gap is unrepresentable.
    fn net_gap(&self, buy: &ChainQuote, sell: &ChainQuote) -> Option<(Decimal, Decimal, Decimal)> {
        let gross = (sell.price - buy.price).checked_div(buy.price)?;
        let bridge_fee = self.bridge_fee(buy.name, sell.name);
        let net = gross.checked_sub(bridge_fee)?.checked_sub(self.config.dex_fees)?;
        Some((gross, bridge_fee, net))
    }

    fn supports(&self, chain: &str) -> bool {
        self.config.supported_chains.iter().any(|c| c == chain)
    }
}

impl OpportunitySource for CrossChainSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> OpportunityKind {
        OpportunityKind::CrossChainArbitrage
    }

    fn min_confidence(&self) -> Decimal {
        self.config.min_confidence
    }

    fn analyze(&self, snapshot: &Snapshot) -> Vec<Opportunity> {
        let Some(chains) = snapshot.object("chains") else {
            return Vec::new();
        };

        let quotes: Vec<ChainQuote> = chains
            .iter()
            .filter(|(name, _)| self.supports(name))
            .filter_map(|(name, data)| {
                Some(ChainQuote {
                    name: name.as_str(),
                    price: number(data, "price")?,
                    liquidity: number(data, "liquidity").unwrap_or(Decimal::ZERO),
                })
            })
            .filter(|q| q.price > Decimal::ZERO)
            .collect();

        let mut found: Vec<(Decimal, Opportunity)> = Vec::new();
        for (i, a) in quotes.iter().enumerate() {
            for b in &quotes[i + 1..] {
                let (buy, sell) = if a.price < b.price { (a, b) } else { (b, a) };
                let Some((gross, bridge_fee, net)) = self.net_gap(buy, sell) else {
                    debug!(source = %self.id, buy = buy.name, sell = sell.name, "Price gap out of range, skipping route");
                    continue;
                };
                let bridge_secs = Self::bridge_time_secs(buy.name, sell.name);

                if net < self.config.min_profit_after_fees || bridge_secs > self.config.max_bridge_time_secs {
                    continue;
                }

                let liquidity = a.liquidity.min(b.liquidity);
                let Some(score) = Self::score(net, liquidity, bridge_secs, bridge_fee) else {
                    continue;
                };
                let context = json!({
                    "buy_chain": buy.name,
                    "sell_chain": sell.name,
                    "buy_price": buy.price,
                    "sell_price": sell.price,
                    "gross_profit": gross.round_dp(6),
                    "bridge_fee": bridge_fee,
                    "bridge_time_secs": bridge_secs,
                    "liquidity": liquidity,
                    "score": score.round_dp(4),
                });
                found.push((
                    score,
                    Opportunity::new(
                        &self.id,
                        OpportunityKind::CrossChainArbitrage,
                        net,
                        clamp_unit(score / dec!(30)),
                        context,
                    ),
                ));
            }
        }

        found.sort_by(|a, b| b.0.cmp(&a.0));
        found.into_iter().map(|(_, o)| o).collect()
    }
}
