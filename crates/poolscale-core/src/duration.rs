//! Duration strings used throughout Autoscaler resources ("30s", "5m", "1h").

use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Parse a duration string.
///
/// Accepts `ms`, `s`, `m` and `h` suffixes; a bare integer is seconds.
pub fn parse_duration(s: &str) -> ConfigResult<Duration> {
    let trimmed = s.trim();
    let err = |reason: &str| ConfigError::Duration {
        value: s.to_string(),
        reason: reason.to_string(),
    };

    if trimmed.is_empty() {
        return Err(err("empty duration"));
    }

    let (digits, unit) = match trimmed.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => trimmed.split_at(idx),
        None => (trimmed, "s"),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| err("expected a non-negative integer followed by a unit"))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(err("unknown unit, expected one of ms, s, m, h")),
    }
}

/// Render a duration in the largest whole unit.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1000 != 0 {
        return format!("{ms}ms");
    }
    let secs = d.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Serde adapter for `Duration` fields written as duration strings.
pub mod serde_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
