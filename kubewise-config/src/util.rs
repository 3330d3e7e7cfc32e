use std::time::Duration;

pub fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|part| {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

/// Trims `raw` and maps blank values to `None`.
pub fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parses a human readable duration such as `10s` or `1m 30s`.
pub fn parse_duration(raw: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(raw.trim())
}

pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_skips_blank_entries() {
        assert_eq!(parse_csv(" slack, ,log,"), vec!["slack", "log"]);
    }

    #[test]
    fn durations_accept_humantime_forms() {
        assert_eq!(parse_duration("1m 30s").expect("parse"), Duration::from_secs(90));
        assert_eq!(parse_duration("250ms").expect("parse"), Duration::from_millis(250));
        assert!(parse_duration("soon").is_err());
    }
}
