//! # Duration Parsing
//!
//! Kubernetes-style duration strings (`30s`, `5m`, `1h`, `1d`) as used by
//! `polling.interval`.

use anyhow::Result;
use std::time::Duration;

/// Parse a Kubernetes duration string into a [`Duration`]
pub fn parse_kubernetes_duration(duration_str: &str) -> Result<Duration> {
    let trimmed = duration_str.trim();
    if trimmed.is_empty() {
        return Err(anyhow::anyhow!("duration string cannot be empty"));
    }

    let lower = trimmed.to_lowercase();
    let (number_str, unit) = lower.split_at(lower.len().saturating_sub(1));
    let number: u64 = number_str.parse().map_err(|e| {
        anyhow::anyhow!(
            "invalid duration '{trimmed}': expected <number><unit> (e.g. '30s', '5m', '1h'): {e}"
        )
    })?;
    if number == 0 {
        return Err(anyhow::anyhow!(
            "duration must be greater than 0, got '{trimmed}'"
        ));
    }

    let seconds = match unit {
        "s" => number,
        "m" => number * 60,
        "h" => number * 3600,
        "d" => number * 86400,
        other => {
            return Err(anyhow::anyhow!(
                "invalid duration unit '{other}' in '{trimmed}': expected s, m, h, or d"
            ))
        }
    };
    Ok(Duration::from_secs(seconds))
}

/// Validate that a duration parses and is at least `min_seconds`
pub fn validate_duration_interval(
    duration_str: &str,
    field: &str,
    min_seconds: u64,
) -> Result<Duration> {
    let duration = parse_kubernetes_duration(duration_str)?;
    if duration.as_secs() < min_seconds {
        return Err(anyhow::anyhow!(
            "{field} '{duration_str}' is below the minimum of {min_seconds}s"
        ));
    }
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_forms() {
        assert_eq!(parse_kubernetes_duration("30s").unwrap().as_secs(), 30);
        assert_eq!(parse_kubernetes_duration("5m").unwrap().as_secs(), 300);
        assert_eq!(parse_kubernetes_duration("1h").unwrap().as_secs(), 3600);
        assert_eq!(parse_kubernetes_duration("1d").unwrap().as_secs(), 86400);
        assert_eq!(parse_kubernetes_duration(" 2M ").unwrap().as_secs(), 120);
    }

    #[test]
    fn rejects_bad_forms() {
        for input in ["", "5", "m", "0s", "-5m", "5ms", "5 m", "abc"] {
            assert!(
                parse_kubernetes_duration(input).is_err(),
                "'{input}' should be rejected"
            );
        }
    }

    #[test]
    fn enforces_minimum() {
        assert!(validate_duration_interval("30s", "interval", 60).is_err());
        assert!(validate_duration_interval("2m", "interval", 60).is_ok());
    }
}
