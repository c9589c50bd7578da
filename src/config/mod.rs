//! Configuration management for the strategy engine.
//!
//! Loads settings from an optional config file and `OMNI__*` environment
//! variables, then checks every startup invariant in [`Config::validate`].

mod mode;

pub use mode::{ModePreset, TradingMode};

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::EngineError;
use crate::feed::RetryPolicy;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Optional mode preset applied over the loaded values
    #[serde(default)]
    pub mode: Option<TradingMode>,
    /// Capital and cycle timing
    #[serde(default)]
    pub engine: EngineConfig,
    /// Risk governor limits
    #[serde(default)]
    pub risk: RiskConfig,
    /// Rank and priority weights, adaptive suppression
    #[serde(default)]
    pub ranking: RankingConfig,
    /// Per-source capital shares
    #[serde(default)]
    pub allocation: AllocationConfig,
    /// Built-in opportunity sources
    #[serde(default)]
    pub strategies: StrategiesConfig,
    /// Backoff for outbound calls
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Market-data feed
    #[serde(default)]
    pub feed: FeedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capital under management
    #[serde(default = "default_total_capital")]
    pub total_capital: Decimal,
    /// Time between cycle starts
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,
    /// Budget for fetching and analyzing one snapshot
    #[serde(default = "default_cycle_deadline_ms")]
    pub cycle_deadline_ms: u64,
    /// Budget for a single venue call (open, mark, close)
    #[serde(default = "default_venue_timeout_ms")]
    pub venue_timeout_ms: u64,
    /// Simulate execution instead of trading
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Share of a source's allocation committed per position (0.0-1.0)
    #[serde(default = "default_max_position_fraction")]
    pub max_position_fraction: Decimal,
    /// Ceiling on committed capital over total capital (0.0-1.0)
    #[serde(default = "default_max_exposure_fraction")]
    pub max_exposure_fraction: Decimal,
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: usize,
    /// Minimum take-profit / stop-loss ratio
    #[serde(default = "default_min_risk_reward_ratio")]
    pub min_risk_reward_ratio: Decimal,
    /// Loss fraction of entry value that closes a position
    #[serde(default = "default_stop_loss_fraction")]
    pub stop_loss_fraction: Decimal,
    /// Gain fraction of entry value that closes a position
    #[serde(default = "default_take_profit_fraction")]
    pub take_profit_fraction: Decimal,
    /// Largest loss a single trade may put at risk, over total capital
    #[serde(default = "default_max_loss_fraction_per_trade")]
    pub max_loss_fraction_per_trade: Option<Decimal>,
    /// Positions older than this are closed at their current mark
    #[serde(default)]
    pub max_position_age_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingConfig {
    /// Rank weight of the best recent opportunity's profit fraction
    #[serde(default = "default_profit_weight")]
    pub profit_weight: Decimal,
    /// Rank weight of the source's win rate
    #[serde(default = "default_win_rate_weight")]
    pub win_rate_weight: Decimal,
    /// Priority weight of a candidate's profit fraction
    #[serde(default = "default_profit_weight")]
    pub priority_profit_weight: Decimal,
    /// Priority weight of the candidate source's win rate
    #[serde(default = "default_win_rate_weight")]
    pub priority_win_rate_weight: Decimal,
    /// Trades required before a source can be disabled
    #[serde(default = "default_disable_min_trades")]
    pub disable_min_trades: u64,
    /// Win rate under which a source with enough trades is disabled
    #[serde(default = "default_disable_win_rate_floor")]
    pub disable_win_rate_floor: Decimal,
    /// Analyze only the top-N enabled sources (unset = all)
    #[serde(default)]
    pub max_active_sources: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocationConfig {
    /// Source id to share of total capital; empty = equal split
    #[serde(default)]
    pub percentages: BTreeMap<String, Decimal>,
    /// Rebalance shares by rank every N cycles (unset = fixed shares)
    #[serde(default)]
    pub rebalance_every_cycles: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategiesConfig {
    #[serde(default)]
    pub dex_arbitrage: DexArbitrageConfig,
    #[serde(default)]
    pub cross_chain: CrossChainConfig,
    #[serde(default)]
    pub liquidation: LiquidationConfig,
    #[serde(default)]
    pub statistical_arbitrage: StatArbConfig,
    #[serde(default)]
    pub yield_optimizer: YieldConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DexArbitrageConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_initial_rank")]
    pub initial_rank: Decimal,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: Decimal,
    /// Minimum price gap between venues
    #[serde(default = "default_dex_min_profit")]
    pub min_profit_fraction: Decimal,
    /// Minimum liquidity on the thinner venue (USD)
    #[serde(default = "default_dex_min_liquidity")]
    pub min_liquidity: Decimal,
    /// Gas cost at which the score penalty saturates (USD)
    #[serde(default = "default_dex_max_gas_cost")]
    pub max_gas_cost_usd: Decimal,
    #[serde(default = "default_dex_gas_units")]
    pub gas_units: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossChainConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_initial_rank")]
    pub initial_rank: Decimal,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: Decimal,
    /// Minimum gap after bridge and DEX fees
    #[serde(default = "default_cross_chain_min_profit")]
    pub min_profit_after_fees: Decimal,
    #[serde(default = "default_max_bridge_time_secs")]
    pub max_bridge_time_secs: u64,
    /// Bridge fee for routes without a known quote
    #[serde(default = "default_bridge_fee")]
    pub default_bridge_fee: Decimal,
    /// Combined swap fees on both sides
    #[serde(default = "default_dex_fees")]
    pub dex_fees: Decimal,
    #[serde(default = "default_supported_chains")]
    pub supported_chains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_initial_rank")]
    pub initial_rank: Decimal,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: Decimal,
    /// Positions at or above this health factor are ignored
    #[serde(default = "default_min_health_factor")]
    pub min_health_factor: Decimal,
    #[serde(default = "default_liquidation_min_profit")]
    pub min_profit_fraction: Decimal,
    /// Skip the snapshot entirely when gas is above this (gwei)
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: Decimal,
    #[serde(default = "default_liquidation_gas_units")]
    pub gas_units: u64,
    /// Share of a position's debt repaid per liquidation
    #[serde(default = "default_max_liquidation_fraction")]
    pub max_liquidation_fraction: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatArbConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_initial_rank")]
    pub initial_rank: Decimal,
    #[serde(default = "default_stat_arb_min_confidence")]
    pub min_confidence: Decimal,
    /// Price points required per asset
    #[serde(default = "default_lookback")]
    pub lookback: usize,
    #[serde(default = "default_z_score_threshold")]
    pub z_score_threshold: Decimal,
    #[serde(default = "default_correlation_threshold")]
    pub correlation_threshold: Decimal,
    /// Expected profit per unit of z-score
    #[serde(default = "default_profit_per_z")]
    pub profit_per_z: Decimal,
    #[serde(default = "default_max_expected_profit")]
    pub max_expected_profit: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YieldConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_initial_rank")]
    pub initial_rank: Decimal,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: Decimal,
    #[serde(default = "default_min_apy")]
    pub min_apy: Decimal,
    #[serde(default = "default_max_protocol_risk")]
    pub max_protocol_risk: Decimal,
    /// Horizon used to turn APY into a per-position profit fraction
    #[serde(default = "default_holding_period_days")]
    pub holding_period_days: u32,
}

/// Where snapshots come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    #[default]
    Simulated,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default)]
    pub kind: FeedKind,
    /// Snapshot endpoint (http feed only)
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Seed for the simulated feed
    #[serde(default = "default_seed")]
    pub seed: u64,
}

// Default value functions
fn default_total_capital() -> Decimal {
    Decimal::new(100_000, 0) // 100k
}

fn default_cycle_interval_ms() -> u64 {
    5_000
}

fn default_cycle_deadline_ms() -> u64 {
    10_000
}

fn default_venue_timeout_ms() -> u64 {
    2_000
}

fn default_dry_run() -> bool {
    true
}

fn default_max_position_fraction() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_max_exposure_fraction() -> Decimal {
    Decimal::new(80, 2) // 0.80
}

fn default_max_concurrent_positions() -> usize {
    4
}

fn default_min_risk_reward_ratio() -> Decimal {
    Decimal::new(2, 0) // 2.0
}

fn default_stop_loss_fraction() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_take_profit_fraction() -> Decimal {
    Decimal::new(5, 2) // 0.05 = 2.5x the stop
}

fn default_max_loss_fraction_per_trade() -> Option<Decimal> {
    Some(Decimal::new(2, 2)) // 0.02
}

fn default_profit_weight() -> Decimal {
    Decimal::new(100, 0)
}

fn default_win_rate_weight() -> Decimal {
    Decimal::new(50, 0)
}

fn default_disable_min_trades() -> u64 {
    20 // Fewer trades say too little about a source
}

fn default_disable_win_rate_floor() -> Decimal {
    Decimal::new(30, 2) // 0.30
}

fn default_enabled() -> bool {
    true
}

fn default_initial_rank() -> Decimal {
    Decimal::new(10, 0)
}

fn default_min_confidence() -> Decimal {
    Decimal::new(5, 1) // 0.5
}

fn default_stat_arb_min_confidence() -> Decimal {
    Decimal::new(6, 1) // 0.6, z-score of 1.8
}

fn default_dex_min_profit() -> Decimal {
    Decimal::new(5, 3) // 0.005
}

fn default_dex_min_liquidity() -> Decimal {
    Decimal::new(10_000, 0) // $10k
}

fn default_dex_max_gas_cost() -> Decimal {
    Decimal::new(500, 0) // $500
}

fn default_dex_gas_units() -> u64 {
    400_000 // Flash loan plus two swaps
}

fn default_cross_chain_min_profit() -> Decimal {
    Decimal::new(3, 2) // 0.03
}

fn default_max_bridge_time_secs() -> u64 {
    600
}

fn default_bridge_fee() -> Decimal {
    Decimal::new(2, 3) // 0.002
}

fn default_dex_fees() -> Decimal {
    Decimal::new(6, 3) // 0.006 = 0.3% each side
}

fn default_supported_chains() -> Vec<String> {
    ["Ethereum", "BSC", "Polygon", "Arbitrum", "Optimism", "Avalanche"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

fn default_min_health_factor() -> Decimal {
    Decimal::new(105, 2) // 1.05
}

fn default_liquidation_min_profit() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_max_gas_price_gwei() -> Decimal {
    Decimal::new(300, 0)
}

fn default_liquidation_gas_units() -> u64 {
    300_000
}

fn default_max_liquidation_fraction() -> Decimal {
    Decimal::new(5, 1) // 0.5 close factor
}

fn default_lookback() -> usize {
    30
}

fn default_z_score_threshold() -> Decimal {
    Decimal::new(2, 0)
}

fn default_correlation_threshold() -> Decimal {
    Decimal::new(70, 2) // 0.70
}

fn default_profit_per_z() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_max_expected_profit() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_min_apy() -> Decimal {
    Decimal::new(15, 2) // 0.15
}

fn default_max_protocol_risk() -> Decimal {
    Decimal::new(50, 2) // 0.50
}

fn default_holding_period_days() -> u32 {
    30
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_seed() -> u64 {
    42
}

impl Config {
    /// Load configuration from `config.*` and environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from("config")
    }

    /// Load configuration from the given file (extension optional) and
    /// environment variables. A missing file is not an error.
    pub fn load_from(path: &str) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::default().separator("__").prefix("OMNI"))
            .build()
            .context("Failed to build configuration")?;

        let mut loaded: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        if let Some(mode) = loaded.mode {
            loaded.apply_mode(mode);
        }
        Ok(loaded)
    }

    /// Overlay a mode preset.
    pub fn apply_mode(&mut self, mode: TradingMode) {
        let preset = mode.preset();
        self.mode = Some(mode);
        self.risk.max_position_fraction = preset.max_position_fraction;
        self.risk.max_loss_fraction_per_trade = Some(preset.max_loss_fraction_per_trade);
        self.ranking.max_active_sources = Some(preset.max_active_sources);
        self.strategies.dex_arbitrage.min_profit_fraction = preset.min_profit_fraction;
        self.strategies.liquidation.min_profit_fraction = preset.min_profit_fraction;
    }

    /// Fold the `--dry-run` flag into `engine.dry_run`.
    ///
    /// Live execution is not available, so a configuration that still asks
    /// for it after the flag is applied is refused.
    pub fn require_dry_run(&mut self, cli_flag: bool) -> Result<()> {
        self.engine.dry_run |= cli_flag;
        if !self.engine.dry_run {
            bail!("live execution is not available; run with --dry-run or set engine.dry_run = true");
        }
        Ok(())
    }

    /// Check every startup invariant.
    ///
    /// Violations are fatal and name the invariant that failed; nothing is
    /// clamped into range.
    pub fn validate(&self) -> crate::error::Result<()> {
        let engine = &self.engine;
        let risk = &self.risk;

        ensure(
            engine.total_capital > Decimal::ZERO,
            "total_capital_positive",
            || format!("total_capital is {}", engine.total_capital),
        )?;
        ensure(
            engine.cycle_deadline_ms > 0 && engine.venue_timeout_ms > 0 && engine.cycle_interval_ms > 0,
            "cycle_deadline_positive",
            || {
                format!(
                    "cycle_interval_ms={}, cycle_deadline_ms={}, venue_timeout_ms={}",
                    engine.cycle_interval_ms, engine.cycle_deadline_ms, engine.venue_timeout_ms
                )
            },
        )?;
        ensure(
            in_unit_interval(risk.max_exposure_fraction),
            "max_exposure_fraction_in_unit_interval",
            || format!("max_exposure_fraction is {}", risk.max_exposure_fraction),
        )?;
        ensure(
            in_unit_interval(risk.max_position_fraction),
            "max_position_fraction_in_unit_interval",
            || format!("max_position_fraction is {}", risk.max_position_fraction),
        )?;
        ensure(
            risk.stop_loss_fraction > Decimal::ZERO,
            "stop_loss_positive",
            || format!("stop_loss_fraction is {}", risk.stop_loss_fraction),
        )?;
        ensure(
            risk.take_profit_fraction > Decimal::ZERO,
            "take_profit_positive",
            || format!("take_profit_fraction is {}", risk.take_profit_fraction),
        )?;
        ensure(
            risk.max_concurrent_positions > 0,
            "max_concurrent_positions_positive",
            || "max_concurrent_positions is 0".to_string(),
        )?;
        if let Some(budget) = risk.max_loss_fraction_per_trade {
            ensure(
                in_unit_interval(budget),
                "max_loss_fraction_in_unit_interval",
                || format!("max_loss_fraction_per_trade is {budget}"),
            )?;
        }

        self.validate_allocation()?;

        for (name, confidence) in self.strategies.min_confidences() {
            ensure(
                confidence >= Decimal::ZERO && confidence <= Decimal::ONE,
                "confidence_in_unit_interval",
                || format!("strategies.{name}.min_confidence is {confidence}"),
            )?;
        }

        let retry = &self.retry;
        ensure(
            retry.max_retries >= 1
                && retry.base_delay_ms <= retry.max_delay_ms
                && retry.backoff_multiplier >= 1.0
                && (0.0..=1.0).contains(&retry.jitter_fraction),
            "retry_policy_sane",
            || format!("{retry:?}"),
        )?;

        Ok(())
    }

    fn validate_allocation(&self) -> crate::error::Result<()> {
        let mut sum = Decimal::ZERO;
        for (source, share) in &self.allocation.percentages {
            ensure(
                *share >= Decimal::ZERO && *share <= Decimal::ONE,
                "allocation_sum_le_one",
                || format!("allocation for '{source}' is {share}"),
            )?;
            sum += *share;
        }
        ensure(sum <= Decimal::ONE, "allocation_sum_le_one", || {
            format!("allocations sum to {sum}")
        })
    }
}

impl StrategiesConfig {
    /// Configured minimum confidence per built-in source.
    pub fn min_confidences(&self) -> [(&'static str, Decimal); 5] {
        [
            ("dex_arbitrage", self.dex_arbitrage.min_confidence),
            ("cross_chain", self.cross_chain.min_confidence),
            ("liquidation", self.liquidation.min_confidence),
            ("statistical_arbitrage", self.statistical_arbitrage.min_confidence),
            ("yield_optimizer", self.yield_optimizer.min_confidence),
        ]
    }
}

fn in_unit_interval(value: Decimal) -> bool {
    value > Decimal::ZERO && value <= Decimal::ONE
}

fn ensure(
    condition: bool,
    invariant: &'static str,
    detail: impl FnOnce() -> String,
) -> crate::error::Result<()> {
    if condition {
        Ok(())
    } else {
        Err(EngineError::invariant(invariant, detail()))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            total_capital: default_total_capital(),
            cycle_interval_ms: default_cycle_interval_ms(),
            cycle_deadline_ms: default_cycle_deadline_ms(),
            venue_timeout_ms: default_venue_timeout_ms(),
            dry_run: default_dry_run(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_fraction: default_max_position_fraction(),
            max_exposure_fraction: default_max_exposure_fraction(),
            max_concurrent_positions: default_max_concurrent_positions(),
            min_risk_reward_ratio: default_min_risk_reward_ratio(),
            stop_loss_fraction: default_stop_loss_fraction(),
            take_profit_fraction: default_take_profit_fraction(),
            max_loss_fraction_per_trade: default_max_loss_fraction_per_trade(),
            max_position_age_secs: None,
        }
    }
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            profit_weight: default_profit_weight(),
            win_rate_weight: default_win_rate_weight(),
            priority_profit_weight: default_profit_weight(),
            priority_win_rate_weight: default_win_rate_weight(),
            disable_min_trades: default_disable_min_trades(),
            disable_win_rate_floor: default_disable_win_rate_floor(),
            max_active_sources: None,
        }
    }
}

impl Default for DexArbitrageConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            initial_rank: default_initial_rank(),
            min_confidence: default_min_confidence(),
            min_profit_fraction: default_dex_min_profit(),
            min_liquidity: default_dex_min_liquidity(),
            max_gas_cost_usd: default_dex_max_gas_cost(),
            gas_units: default_dex_gas_units(),
        }
    }
}

impl Default for CrossChainConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            initial_rank: default_initial_rank(),
            min_confidence: default_min_confidence(),
            min_profit_after_fees: default_cross_chain_min_profit(),
            max_bridge_time_secs: default_max_bridge_time_secs(),
            default_bridge_fee: default_bridge_fee(),
            dex_fees: default_dex_fees(),
            supported_chains: default_supported_chains(),
        }
    }
}

impl Default for LiquidationConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            initial_rank: default_initial_rank(),
            min_confidence: default_min_confidence(),
            min_health_factor: default_min_health_factor(),
            min_profit_fraction: default_liquidation_min_profit(),
            max_gas_price_gwei: default_max_gas_price_gwei(),
            gas_units: default_liquidation_gas_units(),
            max_liquidation_fraction: default_max_liquidation_fraction(),
        }
    }
}

impl Default for StatArbConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            initial_rank: default_initial_rank(),
            min_confidence: default_stat_arb_min_confidence(),
            lookback: default_lookback(),
            z_score_threshold: default_z_score_threshold(),
            correlation_threshold: default_correlation_threshold(),
            profit_per_z: default_profit_per_z(),
            max_expected_profit: default_max_expected_profit(),
        }
    }
}

impl Default for YieldConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            initial_rank: default_initial_rank(),
            min_confidence: default_min_confidence(),
            min_apy: default_min_apy(),
            max_protocol_risk: default_max_protocol_risk(),
            holding_period_days: default_holding_period_days(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            kind: FeedKind::default(),
            url: None,
            request_timeout_ms: default_request_timeout_ms(),
            seed: default_seed(),
        }
    }
}
