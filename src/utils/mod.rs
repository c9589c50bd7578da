//! Shared helpers.

pub mod decimal;

pub use decimal::{clamp_unit, decimal_from_json, safe_div, to_percent};
