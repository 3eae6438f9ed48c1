//! Human-readable byte quantities ("100MB", "1.5GiB", "10 g").

use once_cell::sync::Lazy;
use regex::Regex;

static SIZE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i)(\d+(?:\.\d+)?) ?([kmgtp]?)(i?)b?$").expect("Invalid size regex")
});

/// Parse a size into bytes.
///
/// Plain unit letters are decimal (`k` = 1000); an `i` selects binary
/// multiples (`Ki` = 1024). A bare number is bytes.
pub fn parse_size(input: &str) -> Result<u64, String> {
    let input = input.trim();
    let caps =
        SIZE_REGEX.captures(input).ok_or_else(|| format!("invalid size: '{}'", input))?;

    let number: f64 = caps[1].parse().map_err(|_| format!("invalid size: '{}'", input))?;
    let unit = caps[2].to_lowercase();
    let binary = !caps[3].is_empty();

    if binary && unit.is_empty() {
        return Err(format!("invalid size: '{}'", input));
    }

    let base: f64 = if binary { 1024.0 } else { 1000.0 };
    let exponent = match unit.as_str() {
        "" => 0,
        "k" => 1,
        "m" => 2,
        "g" => 3,
        "t" => 4,
        "p" => 5,
        _ => return Err(format!("invalid size unit in '{}'", input)),
    };

    let bytes = number * base.powi(exponent);
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return Err(format!("size '{}' is too large", input));
    }
    Ok(bytes as u64)
}
