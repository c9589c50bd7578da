//! Decimal arithmetic utilities for capital and score calculations.

use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Clamp a value into [0, 1].
pub fn clamp_unit(value: Decimal) -> Decimal {
    value.max(Decimal::ZERO).min(Decimal::ONE)
}

/// Read a JSON number (or numeric string) as a decimal.
///
/// Returns `None` for anything that is not a finite number, so callers can
/// treat malformed snapshot fields as absent.
pub fn decimal_from_json(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .ok()
        }
        Value::String(s) => Decimal::from_str(s.trim())
            .or_else(|_| Decimal::from_scientific(s.trim()))
            .ok(),
        _ => None,
    }
}

/// Calculate percentage points (0.05 -> 5).
pub fn to_percent(fraction: Decimal) -> Decimal {
    fraction * Decimal::ONE_HUNDRED
}
