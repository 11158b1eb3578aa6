// ─────────────────────────────────────────────────────────────────────────────
// numeric.rs — parsing and formatting helpers for the exchange's string
// numerics, plus the dust epsilon shared by every position comparison.
// ─────────────────────────────────────────────────────────────────────────────
use chrono::{TimeZone, Utc};

/// Position sizes below this are treated as flat everywhere.
pub const EPS: f64 = 1e-9;

pub fn is_dust(size: f64) -> bool {
    size.abs() < EPS
}

/// Parses a JSON value that Hyperliquid may send either as a number or as a
/// decimal string ("60000.0"). Returns None for anything unparseable.
pub fn parse_f64(v: &serde_json::Value) -> Option<f64> {
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.parse::<f64>().ok()))
        .filter(|f| f.is_finite())
}

/// Like `parse_f64` but defaults to 0.0, for optional/cosmetic fields.
pub fn parse_f64_or_zero(v: &serde_json::Value) -> f64 {
    parse_f64(v).unwrap_or(0.0)
}

pub fn round_to_decimals(val: f64, decimals: u32) -> f64 {
    let factor = 10_f64.powi(decimals as i32);
    (val * factor).round() / factor
}

/// Clamps `value` into the band `[center * lo_mult, center * hi_mult]`.
/// Used to keep aggressive limit prices within a sane distance of reference.
pub fn clamp_to_band(value: f64, center: f64, lo_mult: f64, hi_mult: f64) -> f64 {
    value.max(center * lo_mult).min(center * hi_mult)
}

/// Matches the Python SDK's `float_to_wire`: round to 8 decimals, then strip
/// trailing zeros (a bare integer like "100" stays without a decimal point).
pub fn float_to_wire(x: f64) -> String {
    let rounded = format!("{:.8}", x);
    if rounded.contains('.') {
        let trimmed = rounded.trim_end_matches('0');
        let trimmed = trimmed.trim_end_matches('.');
        trimmed.to_string()
    } else {
        rounded
    }
}

/// Formats `price` to the decimal precision implied by the string form of
/// `reference` (usually the coin's mark price as received on the wire).
/// Trailing zeros are stripped; an empty result collapses to "0".
pub fn round_price(price: f64, reference: &str) -> String {
    let decimals = reference
        .split('.')
        .nth(1)
        .map(|frac| frac.len())
        .unwrap_or(0);
    let formatted = format!("{:.*}", decimals, price);
    let stripped = if formatted.contains('.') {
        formatted.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        formatted
    };
    if stripped.is_empty() {
        "0".to_string()
    } else {
        stripped
    }
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// YYYY-MM-DD (UTC) for the given epoch-ms, used for daily trade-log files.
pub fn day_stamp(ms: u64) -> String {
    match Utc.timestamp_millis_opt(ms as i64) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d").to_string(),
        _ => Utc::now().format("%Y-%m-%d").to_string(),
    }
}
