//! Flexible time-string grammar used by the schedule endpoint.
//!
//! Three forms are accepted, all resolving to UTC:
//! - `now` (any case)
//! - `in <N> minute[s]|hour[s]|day[s]` with a nonnegative integer `<N>`
//! - ISO 8601 with a `Z` suffix or a numeric offset, optional fractional
//!   seconds

use chrono::{DateTime, Duration, Utc};

use crate::error::Error;

/// Parse a time string into a UTC instant.
pub fn parse_time_string(input: &str) -> Result<DateTime<Utc>, Error> {
    let s = input.trim();

    // ISO 8601: the 'T' separator distinguishes it from the keyword forms.
    if s.contains('T') {
        return DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::TimeParse(format!("'{s}': {e}")));
    }

    let lower = s.to_ascii_lowercase();

    if lower == "now" {
        return Ok(Utc::now());
    }

    if let Some(rest) = lower.strip_prefix("in ") {
        let mut parts = rest.split_whitespace();
        if let (Some(amount), Some(unit), None) = (parts.next(), parts.next(), parts.next()) {
            let n: u32 = amount
                .parse()
                .map_err(|_| Error::TimeParse(format!("'{s}': amount must be a nonnegative integer")))?;
            let n = i64::from(n);
            let delta = match unit.trim_end_matches('s') {
                "minute" => Duration::minutes(n),
                "hour" => Duration::hours(n),
                "day" => Duration::days(n),
                other => {
                    return Err(Error::TimeParse(format!(
                        "'{s}': unknown unit '{other}' (expected minutes, hours, or days)"
                    )))
                }
            };
            return Ok(Utc::now() + delta);
        }
    }

    Err(Error::TimeParse(format!(
        "'{s}': expected 'now', 'in N minutes/hours/days', or ISO 8601"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn close_to(actual: DateTime<Utc>, expected: DateTime<Utc>) -> bool {
        (actual - expected).num_seconds().abs() <= 1
    }

    #[test]
    fn parses_now_any_case() {
        for s in ["now", "NOW", "Now", "  now  "] {
            assert!(close_to(parse_time_string(s).unwrap(), Utc::now()), "{s}");
        }
    }

    #[test]
    fn parses_relative_forms() {
        let cases = [
            ("in 30 minutes", Duration::minutes(30)),
            ("in 1 minute", Duration::minutes(1)),
            ("in 2 hours", Duration::hours(2)),
            ("IN 2 HOURS", Duration::hours(2)),
            ("in 5 days", Duration::days(5)),
            ("in 0 minutes", Duration::zero()),
        ];
        for (s, delta) in cases {
            let parsed = parse_time_string(s).unwrap();
            assert!(close_to(parsed, Utc::now() + delta), "{s}");
        }
    }

    #[test]
    fn parses_iso_with_zulu() {
        let t = parse_time_string("2026-01-20T09:00:00Z").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2026, 1, 20, 9, 0, 0).unwrap());
    }

    #[test]
    fn parses_iso_with_offset() {
        let t = parse_time_string("2026-01-20T09:00:00+02:00").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2026, 1, 20, 7, 0, 0).unwrap());
    }

    #[test]
    fn parses_iso_with_fractional_seconds() {
        let t = parse_time_string("2026-01-20T09:00:00.250Z").unwrap();
        assert_eq!(t.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn rejects_naive_iso() {
        // No offset means no defined instant.
        assert!(parse_time_string("2026-01-20T09:00:00").is_err());
    }

    #[test]
    fn rejects_garbage() {
        for s in [
            "",
            "tomorrow",
            "in five minutes",
            "in -5 minutes",
            "in 5 weeks",
            "in 5",
            "in 5 minutes extra",
            "5 minutes",
        ] {
            assert!(parse_time_string(s).is_err(), "should reject {s:?}");
        }
    }

    #[test]
    fn iso_round_trip_preserves_instant() {
        let orig = Utc.with_ymd_and_hms(2026, 6, 1, 18, 30, 15).unwrap();
        let parsed = parse_time_string(&orig.to_rfc3339()).unwrap();
        assert_eq!(parsed, orig);
    }
}
