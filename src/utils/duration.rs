use once_cell::sync::Lazy;
use regex::Regex;

/// Unit suffixes understood by the load balancer: seconds, minutes, hours, days,
/// weeks, months and years. A component without a suffix is seconds.
static DURATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+[smhdwMy]?( ?\d+[smhdwMy]?)*$").unwrap());

/// Error returned for a duration string the load balancer would not accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidDuration(pub String);

impl std::fmt::Display for InvalidDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid duration {:?}", self.0)
    }
}

impl std::error::Error for InvalidDuration {}

/// Parses a duration such as `30`, `1m10s` or `5m 30s`.
///
/// Only the syntax is checked; the value is handed to the load balancer as written.
pub fn parse(value: &str) -> Result<String, InvalidDuration> {
    if DURATION_RE.is_match(value) {
        Ok(value.to_string())
    } else {
        Err(InvalidDuration(value.to_string()))
    }
}

pub fn validate(value: &str) -> Result<(), InvalidDuration> {
    parse(value).map(|_| ())
}
