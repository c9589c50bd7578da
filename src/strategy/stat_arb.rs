//! Pairs trading on correlated assets.
//!
//! Reads `asset_pairs: [{asset_a, asset_b}]` and `price_history: {asset: [..]}`.
//! Over the last `lookback` points, a pair qualifies when the price series
//! are correlated and the current spread sits far from its mean.

use rust_decimal::prelude::MathematicalOps;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tracing::debug;

use super::source::{Opportunity, OpportunityKind, OpportunitySource};
use crate::config::StatArbConfig;
use crate::feed::snapshot::text;
use crate::feed::Snapshot;
use crate::utils::{clamp_unit, decimal_from_json};

fn mean(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    values.iter().copied().sum::<Decimal>() / Decimal::from(values.len())
}

/// Series divided by its largest magnitude, so every value lies in [-1, 1].
/// Correlation and z-score are unchanged by the rescale; the squares stay small.
fn normalized(series: &[Decimal]) -> Vec<Decimal> {
    let scale = series.iter().map(|v| v.abs()).max().unwrap_or(Decimal::ZERO);
    if scale.is_zero() {
        return vec![Decimal::ZERO; series.len()];
    }
    series.iter().map(|v| *v / scale).collect()
}

/// Pearson correlation; 0 when either series is flat.
pub fn correlation(a: &[Decimal], b: &[Decimal]) -> Decimal {
    let n = a.len().min(b.len());
    if n < 2 {
        return Decimal::ZERO;
    }
    let (a, b) = (normalized(&a[a.len() - n..]), normalized(&b[b.len() - n..]));
    let (a, b) = (a.as_slice(), b.as_slice());
    let (mean_a, mean_b) = (mean(a), mean(b));

    let mut covariance = Decimal::ZERO;
    let mut var_a = Decimal::ZERO;
    let mut var_b = Decimal::ZERO;
    for (x, y) in a.iter().zip(b) {
        let (dx, dy) = (*x - mean_a, *y - mean_b);
        covariance += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    match (var_a * var_b).sqrt() {
        Some(denominator) if denominator > Decimal::ZERO => covariance / denominator,
        _ => Decimal::ZERO,
    }
}

/// Distance of the last value from the mean, in population standard deviations.
pub fn z_score(series: &[Decimal]) -> Decimal {
    if series.len() < 2 {
        return Decimal::ZERO;
    }
    let series = normalized(series);
    let Some(last) = series.last() else {
        return Decimal::ZERO;
    };
    let m = mean(&series);
    let variance = series.iter().map(|x| (*x - m) * (*x - m)).sum::<Decimal>() / Decimal::from(series.len());

    match variance.sqrt() {
        Some(std_dev) if std_dev > Decimal::ZERO => (*last - m) / std_dev,
        _ => Decimal::ZERO,
    }
}

pub struct StatisticalArbitrageSource {
    id: String,
    config: StatArbConfig,
}

impl StatisticalArbitrageSource {
    pub const ID: &'static str = "statistical_arbitrage";

    pub fn new(config: StatArbConfig) -> Self {
        Self {
            id: Self::ID.to_string(),
            config,
        }
    }

    /// Last `lookback` points, or `None` if too short or not all numeric.
    fn window(&self, history: &Value) -> Option<Vec<Decimal>> {
        let points = history.as_array()?;
        if self.config.lookback < 2 || points.len() < self.config.lookback {
            return None;
        }
        points[points.len() - self.config.lookback..]
            .iter()
            .map(decimal_from_json)
            .collect()
    }
}

impl OpportunitySource for StatisticalArbitrageSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> OpportunityKind {
        OpportunityKind::StatisticalArbitrage
    }

    fn min_confidence(&self) -> Decimal {
        self.config.min_confidence
    }

    fn analyze(&self, snapshot: &Snapshot) -> Vec<Opportunity> {
        let Some(history) = snapshot.object("price_history") else {
            return Vec::new();
        };

        let mut found: Vec<(Decimal, Opportunity)> = Vec::new();
        for pair in snapshot.array("asset_pairs") {
            let (Some(asset_a), Some(asset_b)) = (text(pair, "asset_a"), text(pair, "asset_b")) else {
                continue;
            };
            let (Some(prices_a), Some(prices_b)) = (
                history.get(asset_a).and_then(|h| self.window(h)),
                history.get(asset_b).and_then(|h| self.window(h)),
            ) else {
                continue;
            };

            let corr = correlation(&prices_a, &prices_b);
            if corr.abs() < self.config.correlation_threshold {
                continue;
            }

            let Some(spread) = prices_a
                .iter()
                .zip(&prices_b)
                .map(|(a, b)| a.checked_sub(*b))
                .collect::<Option<Vec<Decimal>>>()
            else {
                debug!("Spread of {}/{} out of range, skipping", asset_a, asset_b);
                continue;
            };
            let z = z_score(&spread);
            if z.abs() < self.config.z_score_threshold {
                continue;
            }

            let expected_profit = (z.abs() * self.config.profit_per_z).min(self.config.max_expected_profit);
            let confidence = clamp_unit(z.abs() / dec!(3));
            let reversion_score = confidence * dec!(60) + corr.abs() * dec!(40);
            // Spread above its mean: short the rich leg
            let direction = if z < Decimal::ZERO { "long_a_short_b" } else { "short_a_long_b" };

            let context = json!({
                "asset_a": asset_a,
                "asset_b": asset_b,
                "correlation": corr.round_dp(4),
                "z_score": z.round_dp(4),
                "direction": direction,
                "mean_reversion_score": reversion_score.round_dp(4),
            });
            found.push((
                reversion_score,
                Opportunity::new(
                    &self.id,
                    OpportunityKind::StatisticalArbitrage,
                    expected_profit,
                    confidence,
                    context,
                ),
            ));
        }

        found.sort_by(|a, b| b.0.cmp(&a.0));
        found.into_iter().map(|(_, o)| o).collect()
    }
}
