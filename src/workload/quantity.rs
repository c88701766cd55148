//! Resource quantity parsing.
//!
//! Storage capacities are compared as byte counts so that `1Gi` and
//! `1073741824` are the same request.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Byte value of a quantity string, rounded up. `None` when unparseable.
pub fn parse_bytes(value: &str) -> Option<i64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    let number: f64 = number.parse().ok()?;

    let multiplier = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        exp if exp.starts_with(['e', 'E']) => 10f64.powi(exp[1..].parse().ok()?),
        _ => return None,
    };

    let bytes = (number * multiplier).ceil();
    (bytes.is_finite() && bytes <= i64::MAX as f64).then_some(bytes as i64)
}

pub fn quantity_bytes(quantity: &Quantity) -> Option<i64> {
    parse_bytes(&quantity.0)
}
