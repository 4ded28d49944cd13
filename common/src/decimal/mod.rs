//! Decimal type utilities for precise balance arithmetic

use std::str::FromStr;

use rust_decimal::Decimal;
pub use rust_decimal_macros::dec;

use crate::error::{Error, Result};

/// Monetary amount with arbitrary scale
pub type Amount = Decimal;

/// Serialize an amount for the cache representation.
///
/// The full scale is kept; fractional digits are never dropped.
pub fn encode_amount(amount: Amount) -> String {
    amount.to_string()
}

/// Parse a cached amount, rejecting anything that is not a plain decimal
pub fn decode_amount(raw: &str) -> Result<Amount> {
    Decimal::from_str(raw.trim())
        .map_err(|e| Error::Internal(format!("Invalid balance format {:?}: {}", raw, e)))
}
