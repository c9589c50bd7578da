//! Seeded synthetic market data for dry runs.
//!
//! Produces every field the built-in sources read:
//! - `exchanges`, `gas_price` for DEX arbitrage
//! - `chains` for cross-chain arbitrage
//! - `lending_positions`, `asset_prices` for liquidations
//! - `asset_pairs`, `price_history` for statistical arbitrage
//! - `yield_protocols` for yield optimization
//!
//! Prices follow a random walk across fetches so consecutive snapshots are
//! related, and a fixed seed reproduces the same sequence.

use anyhow::Result;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::Mutex;

use super::snapshot::Snapshot;
use super::traits::SnapshotFeed;

const EXCHANGES: [&str; 4] = ["Uniswap", "Sushiswap", "Curve", "Balancer"];
const CHAINS: [&str; 6] = ["Ethereum", "BSC", "Polygon", "Arbitrum", "Optimism", "Avalanche"];
const PROTOCOLS: [&str; 5] = ["Aave", "Compound", "Yearn", "Convex", "Beefy"];
const LENDING_PROTOCOLS: [&str; 2] = ["Aave", "Compound"];

/// Assets with their starting prices.
const ASSETS: [(&str, f64); 5] = [
    ("ETH", 2_000.0),
    ("WBTC", 40_000.0),
    ("LINK", 15.0),
    ("UNI", 6.0),
    ("USDC", 1.0),
];

const PAIRS: [(&str, &str); 3] = [("ETH", "WBTC"), ("LINK", "UNI"), ("ETH", "LINK")];

/// Points of price history kept per asset.
const HISTORY_LEN: usize = 40;

struct SimState {
    rng: StdRng,
    prices: BTreeMap<&'static str, f64>,
    history: BTreeMap<&'static str, VecDeque<f64>>,
}

impl SimState {
    fn new(seed: u64) -> Self {
        let mut state = Self {
            rng: StdRng::seed_from_u64(seed),
            prices: ASSETS.iter().copied().collect(),
            history: BTreeMap::new(),
        };
        // Warm up so statistical sources have a full window from the first fetch
        for _ in 0..HISTORY_LEN {
            state.step_prices();
        }
        state
    }

    /// Advance every non-stable asset by one correlated random-walk step.
    fn step_prices(&mut self) {
        let market_move: f64 = self.rng.gen_range(-0.01..0.01);
        for (asset, price) in self.prices.iter_mut() {
            if *asset != "USDC" {
                let idiosyncratic: f64 = self.rng.gen_range(-0.006..0.006);
                *price *= 1.0 + market_move + idiosyncratic;
            }
            let series = self.history.entry(*asset).or_default();
            series.push_back(round(*price, 4));
            if series.len() > HISTORY_LEN {
                series.pop_front();
            }
        }
    }

    fn price(&self, asset: &str) -> f64 {
        self.prices.get(asset).copied().unwrap_or(0.0)
    }

    fn exchanges(&mut self) -> Value {
        let eth = self.price("ETH");
        let venues: Vec<Value> = EXCHANGES
            .iter()
            .map(|name| {
                let skew: f64 = self.rng.gen_range(-0.008..0.008);
                let liquidity: f64 = self.rng.gen_range(20_000.0..2_000_000.0);
                json!({
                    "name": name,
                    "price": round(eth * (1.0 + skew), 2),
                    "liquidity": round(liquidity, 0),
                })
            })
            .collect();
        Value::Array(venues)
    }

    fn chains(&mut self) -> Value {
        let eth = self.price("ETH");
        let mut chains = Map::new();
        for name in CHAINS {
            let skew: f64 = self.rng.gen_range(-0.02..0.025);
            let liquidity: f64 = self.rng.gen_range(50_000.0..5_000_000.0);
            chains.insert(
                name.to_string(),
                json!({
                    "price": round(eth * (1.0 + skew), 2),
                    "liquidity": round(liquidity, 0),
                }),
            );
        }
        Value::Object(chains)
    }

    fn lending_positions(&mut self) -> Value {
        let count = self.rng.gen_range(2..6);
        let positions: Vec<Value> = (0..count)
            .map(|i| {
                let (collateral, _) = ASSETS[self.rng.gen_range(0..ASSETS.len() - 1)];
                let collateral_amount: f64 = self.rng.gen_range(1.0..50.0);
                // Health factor centred slightly above 1 so some positions are underwater
                let target_health: f64 = self.rng.gen_range(0.85..1.3);
                let collateral_value = collateral_amount * self.price(collateral);
                let debt_amount = collateral_value * 0.8 / target_health;
                json!({
                    "id": format!("loan-{i}"),
                    "protocol": LENDING_PROTOCOLS[i % LENDING_PROTOCOLS.len()],
                    "collateral_asset": collateral,
                    "collateral_amount": round(collateral_amount, 4),
                    "debt_asset": "USDC",
                    "debt_amount": round(debt_amount, 2),
                    "liquidation_threshold": 0.8,
                    "liquidation_bonus": round(self.rng.gen_range(0.05..0.12), 3),
                })
            })
            .collect();
        Value::Array(positions)
    }

    fn yield_protocols(&mut self) -> Value {
        let protocols: Vec<Value> = PROTOCOLS
            .iter()
            .map(|name| {
                json!({
                    "name": name,
                    "apy": round(self.rng.gen_range(0.02..0.6), 4),
                    "tvl": round(self.rng.gen_range(1_000_000.0..500_000_000.0), 0),
                    "risk_score": round(self.rng.gen_range(0.05..0.8), 3),
                })
            })
            .collect();
        Value::Array(protocols)
    }

    fn snapshot(&mut self) -> Snapshot {
        self.step_prices();

        let asset_prices: Map<String, Value> = self
            .prices
            .iter()
            .map(|(asset, price)| (asset.to_string(), json!(round(*price, 4))))
            .collect();
        let price_history: Map<String, Value> = self
            .history
            .iter()
            .map(|(asset, series)| (asset.to_string(), json!(series.iter().collect::<Vec<_>>())))
            .collect();
        let pairs: Vec<Value> = PAIRS
            .iter()
            .map(|(a, b)| json!({"asset_a": a, "asset_b": b}))
            .collect();

        let gas_price = round(self.rng.gen_range(10.0..80.0), 1);
        let exchanges = self.exchanges();
        let chains = self.chains();
        let lending_positions = self.lending_positions();
        let yield_protocols = self.yield_protocols();

        Snapshot::empty()
            .with_field("gas_price", json!(gas_price))
            .with_field("exchanges", exchanges)
            .with_field("chains", chains)
            .with_field("asset_prices", Value::Object(asset_prices))
            .with_field("lending_positions", lending_positions)
            .with_field("asset_pairs", Value::Array(pairs))
            .with_field("price_history", Value::Object(price_history))
            .with_field("yield_protocols", yield_protocols)
    }
}

fn round(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Deterministic synthetic feed.
pub struct SimulatedFeed {
    state: Mutex<SimState>,
}

impl SimulatedFeed {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(SimState::new(seed)),
        }
    }
}

#[async_trait]
impl SnapshotFeed for SimulatedFeed {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn fetch(&self) -> Result<Snapshot> {
        let mut state = self.state.lock().await;
        Ok(state.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_has_every_source_field() {
        let feed = SimulatedFeed::new(7);
        let snapshot = feed.fetch().await.unwrap();

        assert_eq!(snapshot.array("exchanges").len(), EXCHANGES.len());
        assert_eq!(snapshot.object("chains").unwrap().len(), CHAINS.len());
        assert!(!snapshot.array("lending_positions").is_empty());
        assert_eq!(snapshot.array("asset_pairs").len(), PAIRS.len());
        assert_eq!(snapshot.array("yield_protocols").len(), PROTOCOLS.len());
        assert!(snapshot.decimal("gas_price").is_some());

        let history = snapshot.object("price_history").unwrap();
        let eth = history.get("ETH").and_then(Value::as_array).unwrap();
        assert_eq!(eth.len(), HISTORY_LEN);
    }

    #[tokio::test]
    async fn test_same_seed_same_sequence() {
        let a = SimulatedFeed::new(42);
        let b = SimulatedFeed::new(42);
        for _ in 0..3 {
            let sa = a.fetch().await.unwrap();
            let sb = b.fetch().await.unwrap();
            assert_eq!(sa.get("exchanges"), sb.get("exchanges"));
            assert_eq!(sa.get("lending_positions"), sb.get("lending_positions"));
        }
    }

    #[tokio::test]
    async fn test_prices_move_between_fetches() {
        let feed = SimulatedFeed::new(1);
        let first = feed.fetch().await.unwrap();
        let second = feed.fetch().await.unwrap();
        assert_ne!(first.get("asset_prices"), second.get("asset_prices"));
    }

    #[test]
    fn test_round() {
        assert_eq!(round(1.23456, 2), 1.23);
        assert_eq!(round(1999.996, 2), 2000.0);
    }
}
