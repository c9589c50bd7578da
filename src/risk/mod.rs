//! Risk controls for opening positions.
//!
//! Provides:
//! - Position sizing from per-source capital allocations
//! - Ordered admission checks (concurrency, exposure, risk-reward, loss budget)
//! - The open-position book and its exposure

mod governor;
mod portfolio;

pub use governor::{RejectionReason, RiskDecision, RiskGovernor, RiskLimits, RiskRejection};
pub use portfolio::{CloseReason, PortfolioState, Position};
