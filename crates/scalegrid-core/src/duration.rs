//! Human-readable durations ("250ms", "30s", "5m").
//!
//! A bare number is read as seconds. The `humanized` module plugs the
//! same syntax into serde so config files can spell intervals as strings.

use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Parse a duration string like "5s", "500ms", "2m" or "10".
pub fn parse_duration(s: &str) -> ConfigResult<Duration> {
    let s = s.trim();
    let invalid = || ConfigError::InvalidDuration(s.to_string());

    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().map(Duration::from_millis).map_err(|_| invalid())
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().map(Duration::from_secs).map_err(|_| invalid())
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins = mins.trim().parse::<u64>().map_err(|_| invalid())?;
        mins.checked_mul(60).map(Duration::from_secs).ok_or_else(invalid)
    } else {
        s.parse::<u64>().map(Duration::from_secs).map_err(|_| invalid())
    }
}

/// Render a duration in the shortest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        format!("{millis}ms")
    } else if d.as_secs() % 60 == 0 && d.as_secs() > 0 {
        format!("{}m", d.as_secs() / 60)
    } else {
        format!("{}s", d.as_secs())
    }
}

/// Serde adapter for `Duration` fields written as duration strings.
pub mod humanized {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
