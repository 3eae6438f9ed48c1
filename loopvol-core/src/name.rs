//! Volume name validation.

use crate::error::ErrorKind;
use once_cell::sync::Lazy;
use regex::Regex;

/// Allowed volume names: alphanumeric start, then word characters or hyphens.
pub const NAME_PATTERN: &str = r"^[a-zA-Z0-9][a-zA-Z0-9_\-]{1,250}$";

static NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(NAME_PATTERN).expect("Invalid volume name regex"));

/// Check `name` against [`NAME_PATTERN`].
pub fn validate_name(name: &str) -> Result<(), ErrorKind> {
    if name.is_empty() {
        return Err(ErrorKind::InvalidName {
            reason: "volume name cannot be an empty string".to_string(),
        });
    }

    if !NAME_REGEX.is_match(name) {
        return Err(ErrorKind::InvalidName {
            reason: format!("'{}' does not match allowed pattern '{}'", name, NAME_PATTERN),
        });
    }

    Ok(())
}
