//! Conversion of node-reported BTC decimals to integer satoshis.

use bitcoin::Amount;

/// Convert a BTC amount to satoshis.
///
/// Parsing goes through [`Amount::from_btc`], which reads the shortest
/// decimal form of `value`, so the satoshi count is exact and never
/// depends on float rounding. Returns `None` for negative, non-finite,
/// over-precise (finer than 1 sat) or above-supply values.
pub fn btc_to_sats(value: f64) -> Option<i64> {
    let amount = Amount::from_btc(value).ok()?;
    if amount > Amount::MAX_MONEY {
        return None;
    }
    i64::try_from(amount.to_sat()).ok()
}
