//! Liquidation of under-collateralized lending positions.
//!
//! Reads `lending_positions`, `asset_prices` and `gas_price`. A position is a
//! candidate when its health factor is under the configured floor and the
//! liquidation bonus on the repayable debt still pays after gas.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::arbitrage::{gas_cost_usd, DEFAULT_GAS_PRICE_GWEI};
use super::source::{Opportunity, OpportunityKind, OpportunitySource};
use crate::config::LiquidationConfig;
use crate::feed::snapshot::{number, text};
use crate::feed::Snapshot;
use crate::utils::{clamp_unit, decimal_from_json};

const DEFAULT_LIQUIDATION_THRESHOLD: Decimal = dec!(0.8);
const DEFAULT_LIQUIDATION_BONUS: Decimal = dec!(0.05);

pub struct LiquidationSource {
    id: String,
    config: LiquidationConfig,
}

impl LiquidationSource {
    pub const ID: &'static str = "liquidation";

    pub fn new(config: LiquidationConfig) -> Self {
        Self {
            id: Self::ID.to_string(),
            config,
        }
    }

    /// Collateral value at the liquidation threshold over debt value.
    /// `None` without debt or when the values overflow.
    pub fn health_factor(
        collateral_amount: Decimal,
        collateral_price: Decimal,
        debt_amount: Decimal,
        debt_price: Decimal,
        threshold: Decimal,
    ) -> Option<Decimal> {
        let debt_value = debt_amount.checked_mul(debt_price)?;
        if debt_value <= Decimal::ZERO {
            return None;
        }
        collateral_amount
            .checked_mul(collateral_price)?
            .checked_mul(threshold)?
            .checked_div(debt_value)
    }

    /// 10 when liquidatable now, tapering to 1 above 1.03.
    pub fn urgency(health_factor: Decimal) -> Decimal {
        if health_factor < dec!(1.0) {
            dec!(10)
        } else if health_factor < dec!(1.01) {
            dec!(8)
        } else if health_factor < dec!(1.02) {
            dec!(5)
        } else if health_factor < dec!(1.03) {
            dec!(3)
        } else {
            dec!(1)
        }
    }

    fn evaluate(&self, position: &Value, prices: &Map<String, Value>, gas_cost: Decimal) -> Option<(Decimal, Opportunity)> {
        let collateral_asset = text(position, "collateral_asset")?;
        let debt_asset = text(position, "debt_asset")?;
        let collateral_amount = number(position, "collateral_amount")?;
        let debt_amount = number(position, "debt_amount")?;
        let collateral_price = prices.get(collateral_asset).and_then(decimal_from_json)?;
        let debt_price = prices.get(debt_asset).and_then(decimal_from_json)?;
        if collateral_price <= Decimal::ZERO || debt_price <= Decimal::ZERO {
            return None;
        }

        let threshold = number(position, "liquidation_threshold").unwrap_or(DEFAULT_LIQUIDATION_THRESHOLD);
        let bonus = number(position, "liquidation_bonus").unwrap_or(DEFAULT_LIQUIDATION_BONUS);
        let close_factor = number(position, "max_liquidation_pct").unwrap_or(self.config.max_liquidation_fraction);

        let health = Self::health_factor(collateral_amount, collateral_price, debt_amount, debt_price, threshold)?;
        if health >= self.config.min_health_factor {
            return None;
        }

        // Repay part of the debt, receive that value in collateral plus the bonus
        let repay_value = debt_amount.checked_mul(close_factor)?.checked_mul(debt_price)?;
        if repay_value <= Decimal::ZERO {
            return None;
        }
        let net_profit = repay_value.checked_mul(bonus)?.checked_sub(gas_cost)?;
        let profit_fraction = net_profit.checked_div(repay_value)?;
        if profit_fraction < self.config.min_profit_fraction {
            return None;
        }

        let urgency = Self::urgency(health);
        let confidence = clamp_unit(profit_fraction.checked_mul(dec!(10))?.checked_add(urgency / dec!(10))?);
        let priority = profit_fraction.checked_mul(urgency)?;
        let context = json!({
            "position_id": text(position, "id"),
            "protocol": text(position, "protocol").unwrap_or("unknown"),
            "collateral_asset": collateral_asset,
            "debt_asset": debt_asset,
            "health_factor": health.round_dp(4),
            "repay_value": repay_value.round_dp(2),
            "urgency": urgency,
        });

        Some((
            priority,
            Opportunity::new(&self.id, OpportunityKind::Liquidation, profit_fraction, confidence, context),
        ))
    }
}

impl OpportunitySource for LiquidationSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> OpportunityKind {
        OpportunityKind::Liquidation
    }

    fn min_confidence(&self) -> Decimal {
        self.config.min_confidence
    }

    fn analyze(&self, snapshot: &Snapshot) -> Vec<Opportunity> {
        let positions = snapshot.array("lending_positions");
        let Some(prices) = snapshot.object("asset_prices") else {
            return Vec::new();
        };
        let gas_price = snapshot.decimal("gas_price").unwrap_or(DEFAULT_GAS_PRICE_GWEI);
        if positions.is_empty() || gas_price > self.config.max_gas_price_gwei {
            return Vec::new();
        }

        let Some(gas_cost) = gas_cost_usd(snapshot, self.config.gas_units) else {
            debug!(source = %self.id, "Gas cost out of range, skipping snapshot");
            return Vec::new();
        };
        let mut found: Vec<(Decimal, Opportunity)> = positions
            .iter()
            .filter_map(|p| self.evaluate(p, prices, gas_cost))
            .collect();

        found.sort_by(|a, b| b.0.cmp(&a.0));
        found.into_iter().map(|(_, o)| o).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> LiquidationSource {
        LiquidationSource::new(LiquidationConfig::default())
    }

    fn snapshot(positions: Value) -> Snapshot {
        Snapshot::empty()
            .with_field("lending_positions", positions)
            .with_field("asset_prices", json!({"ETH": 2000, "USDC": 1}))
            .with_field("gas_price", json!(10))
    }

    #[test]
    fn test_health_factor() {
        let hf = LiquidationSource::health_factor(dec!(10), dec!(2000), dec!(16000), dec!(1), dec!(0.8));
        assert_eq!(hf, Some(dec!(1)));
        assert_eq!(
            LiquidationSource::health_factor(dec!(10), dec!(2000), Decimal::ZERO, dec!(1), dec!(0.8)),
            None
        );
    }

    #[test]
    fn test_urgency_tiers() {
        assert_eq!(LiquidationSource::urgency(dec!(0.95)), dec!(10));
        assert_eq!(LiquidationSource::urgency(dec!(1.005)), dec!(8));
        assert_eq!(LiquidationSource::urgency(dec!(1.015)), dec!(5));
        assert_eq!(LiquidationSource::urgency(dec!(1.025)), dec!(3));
        assert_eq!(LiquidationSource::urgency(dec!(1.04)), dec!(1));
    }

    #[test]
    fn test_underwater_position_is_found() {
        let snap = snapshot(json!([{
            "id": "loan-1",
            "protocol": "Aave",
            "collateral_asset": "ETH",
            "collateral_amount": 10,
            "debt_asset": "USDC",
            "debt_amount": 17000,
            "liquidation_bonus": 0.08,
        }]));

        let found = source().analyze(&snap);
        assert_eq!(found.len(), 1);

        let opp = &found[0];
        // Repay 8500, bonus 680, gas 300k * 10 gwei * 2000 = 6
        assert_eq!(
            opp.estimated_profit_fraction.round_dp(8),
            (dec!(674) / dec!(8500)).round_dp(8)
        );
        assert_eq!(opp.raw_context["position_id"], "loan-1");
        assert_eq!(opp.raw_context["urgency"], json!(dec!(10)));
        assert_eq!(opp.confidence, Decimal::ONE);
    }

    #[test]
    fn test_healthy_position_is_ignored() {
        let snap = snapshot(json!([{
            "collateral_asset": "ETH",
            "collateral_amount": 10,
            "debt_asset": "USDC",
            "debt_amount": 10000,
        }]));
        assert!(source().analyze(&snap).is_empty());
    }

    #[test]
    fn test_gas_above_ceiling_skips_snapshot() {
        let snap = snapshot(json!([{
            "collateral_asset": "ETH",
            "collateral_amount": 10,
            "debt_asset": "USDC",
            "debt_amount": 17000,
        }]))
        .with_field("gas_price", json!(500));
        assert!(source().analyze(&snap).is_empty());
    }

    #[test]
    fn test_oversized_amounts_skip_only_that_position() {
        let snap = snapshot(json!([
            {
                "id": "whale",
                "collateral_asset": "ETH",
                "collateral_amount": "100000000000000000000000000",
                "debt_asset": "USDC",
                "debt_amount": 17000,
            },
            {
                "id": "loan-1",
                "collateral_asset": "ETH",
                "collateral_amount": 10,
                "debt_asset": "USDC",
                "debt_amount": 17000,
            },
        ]));

        let found = source().analyze(&snap);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].raw_context["position_id"], "loan-1");
        assert_eq!(
            LiquidationSource::health_factor(
                dec!(100000000000000000000000000),
                dec!(2000),
                dec!(1),
                dec!(1),
                dec!(0.8)
            ),
            None
        );
    }

    #[test]
    fn test_missing_prices_degrade_to_nothing() {
        let snap = Snapshot::empty().with_field(
            "lending_positions",
            json!([{"collateral_asset": "ETH", "collateral_amount": 10, "debt_asset": "USDC", "debt_amount": 17000}]),
        );
        assert!(source().analyze(&snap).is_empty());

        let snap = snapshot(json!([
            {"collateral_asset": "DOGE", "collateral_amount": 10, "debt_asset": "USDC", "debt_amount": 17000},
            {"collateral_asset": "ETH", "debt_asset": "USDC"},
            42,
        ]));
        assert!(source().analyze(&snap).is_empty());
    }
}
