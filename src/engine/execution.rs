//! Execution and valuation collaborator.
//!
//! The orchestrator opens, marks and closes positions only through
//! [`ExecutionVenue`]. [`PaperVenue`] is the dry-run implementation.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::feed::Snapshot;
use crate::risk::Position;
use crate::utils::decimal_from_json;

/// Current valuation of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionMark {
    /// Gain or loss over committed capital
    pub return_fraction: Decimal,
    /// The venue already closed it (filled, expired, liquidated)
    pub closed_externally: bool,
}

impl PositionMark {
    pub fn open(return_fraction: Decimal) -> Self {
        Self {
            return_fraction,
            closed_externally: false,
        }
    }
}

#[derive(Error, Debug)]
pub enum VenueError {
    #[error("venue rejected position {position_id}: {reason}")]
    Rejected { position_id: String, reason: String },

    #[error("venue unavailable: {0}")]
    Unavailable(String),

    #[error("venue call timed out after {0:?}")]
    Timeout(Duration),
}

/// Where positions are opened, valued and closed.
///
/// Failures are per call: the orchestrator discards a candidate whose open
/// failed and retries mark/close on the next cycle.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    async fn open(&self, position: &Position) -> Result<(), VenueError>;

    async fn mark(&self, position: &Position, snapshot: &Snapshot) -> Result<PositionMark, VenueError>;

    async fn close(&self, position: &Position, return_fraction: Decimal) -> Result<(), VenueError>;
}

struct PaperState {
    rng: StdRng,
    marks: HashMap<String, Decimal>,
}

/// Simulated fills for dry runs.
///
/// Marks come from the snapshot when it carries them:
/// - `position_marks: {position_id: return_fraction}`
/// - `closed_positions: [position_id, ..]`
///
/// Otherwise each mark takes a seeded random step drifting toward the
/// position's expected profit.
pub struct PaperVenue {
    state: Mutex<PaperState>,
    volatility: Decimal,
}

impl PaperVenue {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                rng: StdRng::seed_from_u64(seed),
                marks: HashMap::new(),
            }),
            volatility: dec!(0.01),
        }
    }

    /// Largest random move per mark.
    pub fn with_volatility(mut self, volatility: Decimal) -> Self {
        self.volatility = volatility;
        self
    }

    /// Positions currently held.
    pub async fn open_positions(&self) -> usize {
        self.state.lock().await.marks.len()
    }
}

#[async_trait]
impl ExecutionVenue for PaperVenue {
    async fn open(&self, position: &Position) -> Result<(), VenueError> {
        let mut state = self.state.lock().await;
        if state.marks.contains_key(&position.id) {
            return Err(VenueError::Rejected {
                position_id: position.id.clone(),
                reason: "already open".to_string(),
            });
        }
        state.marks.insert(position.id.clone(), Decimal::ZERO);
        debug!(position = %position.id, capital = %position.capital_committed, "Paper open");
        Ok(())
    }

    async fn mark(&self, position: &Position, snapshot: &Snapshot) -> Result<PositionMark, VenueError> {
        let mut state = self.state.lock().await;
        let last = state.marks.get(&position.id).copied().unwrap_or(Decimal::ZERO);

        let explicit = snapshot
            .object("position_marks")
            .and_then(|marks| marks.get(&position.id))
            .and_then(decimal_from_json);
        let closed_externally = snapshot
            .array("closed_positions")
            .iter()
            .any(|id| id.as_str() == Some(position.id.as_str()));

        let return_fraction = match explicit {
            Some(mark) => Position::bounded_return(mark),
            None if closed_externally => last,
            None => {
                let drift = position.expected_profit_fraction / dec!(4);
                let noise = self.volatility * Decimal::new(state.rng.gen_range(-1000..=1000), 3);
                Position::bounded_return(last + drift + noise)
            }
        };

        state.marks.insert(position.id.clone(), return_fraction);
        Ok(PositionMark {
            return_fraction,
            closed_externally,
        })
    }

    async fn close(&self, position: &Position, return_fraction: Decimal) -> Result<(), VenueError> {
        let mut state = self.state.lock().await;
        state.marks.remove(&position.id);
        info!(
            position = %position.id,
            source = %position.source_id,
            %return_fraction,
            "Paper close"
        );
        Ok(())
    }
}
