//! Utility functions for jobmaster-core

use std::time::Duration;

/// Parse duration string (e.g., "500ms", "30s", "5m", "1h")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        let unit_len = s.chars().last().map_or(0, char::len_utf8);
        s.split_at(s.len() - unit_len)
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let overflow = || crate::Error::InvalidConfig(format!("duration out of range: {}", s));
    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num.checked_mul(60).ok_or_else(overflow)?),
        "h" => Duration::from_secs(num.checked_mul(3600).ok_or_else(overflow)?),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}
