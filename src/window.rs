//! ==============================================================================
//! window.rs - time-window filter
//! ==============================================================================
//!
//! purpose:
//!     selects the part of a sorted snapshot a request asked for. count
//!     windows keep the last N readings, relative windows keep readings
//!     within a duration of "now". the result is always a suffix of the
//!     input, so it is returned as a borrowed slice.
//!
//! ==============================================================================

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::str::FromStr;

use crate::domain::Reading;
use crate::error::WindowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSpec {
    /// the last N readings
    Last(usize),
    /// readings no older than this many seconds
    Within(i64),
    All,
}

impl WindowSpec {
    pub fn token(&self) -> String {
        match self {
            WindowSpec::Last(n) => n.to_string(),
            WindowSpec::Within(3600) => "1h".to_string(),
            WindowSpec::Within(21600) => "6h".to_string(),
            WindowSpec::Within(86400) => "24h".to_string(),
            WindowSpec::Within(secs) => format!("{}s", secs),
            WindowSpec::All => "all".to_string(),
        }
    }

    /// Select the matching suffix of `readings` (sorted ascending).
    ///
    /// When a relative window selects nothing, `policy` decides what to
    /// return instead.
    pub fn apply<'a>(
        &self,
        readings: &'a [Reading],
        now: DateTime<Utc>,
        policy: EmptyWindowPolicy,
    ) -> &'a [Reading] {
        match *self {
            WindowSpec::All => readings,
            WindowSpec::Last(n) => &readings[readings.len().saturating_sub(n)..],
            WindowSpec::Within(secs) => {
                let bound = Duration::seconds(secs);
                let start = readings.partition_point(|r| now - r.timestamp > bound);
                let selected = &readings[start..];
                if selected.is_empty() {
                    policy.fallback(readings)
                } else {
                    selected
                }
            }
        }
    }
}

impl Default for WindowSpec {
    fn default() -> Self {
        WindowSpec::All
    }
}

impl FromStr for WindowSpec {
    type Err = WindowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "10" => Ok(WindowSpec::Last(10)),
            "30" => Ok(WindowSpec::Last(30)),
            "1h" => Ok(WindowSpec::Within(3600)),
            "6h" => Ok(WindowSpec::Within(6 * 3600)),
            "24h" => Ok(WindowSpec::Within(24 * 3600)),
            "all" => Ok(WindowSpec::All),
            other => Err(WindowError::Unknown(other.to_string())),
        }
    }
}

impl fmt::Display for WindowSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

/// What a relative window returns when no reading falls inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyWindowPolicy {
    /// the single most recent reading
    MostRecent,
    /// the last N readings
    MostRecentN(usize),
    /// nothing; the caller reports "no data in window"
    Empty,
}

impl EmptyWindowPolicy {
    fn fallback<'a>(&self, readings: &'a [Reading]) -> &'a [Reading] {
        match *self {
            EmptyWindowPolicy::MostRecent => &readings[readings.len().saturating_sub(1)..],
            EmptyWindowPolicy::MostRecentN(n) => &readings[readings.len().saturating_sub(n.max(1))..],
            EmptyWindowPolicy::Empty => &readings[readings.len()..],
        }
    }
}

impl Default for EmptyWindowPolicy {
    fn default() -> Self {
        EmptyWindowPolicy::MostRecent
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Parameter;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 18, 12, 0, 0).unwrap()
    }

    /// `count` readings, one per `step_secs`, ending at `base()`
    fn series(count: usize, step_secs: i64) -> Vec<Reading> {
        (0..count)
            .map(|i| {
                let age = (count - 1 - i) as i64 * step_secs;
                Reading::new(base() - Duration::seconds(age)).with(Parameter::Co2, i as f64)
            })
            .collect()
    }

    #[test]
    fn test_parse_tokens() {
        assert_eq!("10".parse::<WindowSpec>(), Ok(WindowSpec::Last(10)));
        assert_eq!("30".parse::<WindowSpec>(), Ok(WindowSpec::Last(30)));
        assert_eq!("1h".parse::<WindowSpec>(), Ok(WindowSpec::Within(3600)));
        assert_eq!("6h".parse::<WindowSpec>(), Ok(WindowSpec::Within(21600)));
        assert_eq!("24h".parse::<WindowSpec>(), Ok(WindowSpec::Within(86400)));
        assert_eq!("all".parse::<WindowSpec>(), Ok(WindowSpec::All));
        assert_eq!(
            "2d".parse::<WindowSpec>(),
            Err(WindowError::Unknown("2d".to_string()))
        );
    }

    #[test]
    fn test_token_roundtrip() {
        for token in ["10", "30", "1h", "6h", "24h", "all"] {
            assert_eq!(token.parse::<WindowSpec>().unwrap().token(), token);
        }
    }

    #[test]
    fn test_count_window_is_suffix() {
        let readings = series(25, 30);
        let now = base();

        let last10 = WindowSpec::Last(10).apply(&readings, now, EmptyWindowPolicy::default());
        assert_eq!(last10.len(), 10);
        assert_eq!(last10, &readings[15..]);

        // fewer readings than requested
        let last30 = WindowSpec::Last(30).apply(&readings, now, EmptyWindowPolicy::default());
        assert_eq!(last30.len(), 25);
    }

    #[test]
    fn test_relative_window_bounds() {
        // one reading every 10 minutes over 10 hours
        let readings = series(61, 600);
        let now = base();

        let hour = WindowSpec::Within(3600).apply(&readings, now, EmptyWindowPolicy::default());
        assert_eq!(hour.len(), 7); // ages 0, 10, ..., 60 minutes
        assert!(hour.iter().all(|r| now - r.timestamp <= Duration::seconds(3600)));

        let six = WindowSpec::Within(21600).apply(&readings, now, EmptyWindowPolicy::default());
        assert_eq!(six.len(), 37);

        let day = WindowSpec::Within(86400).apply(&readings, now, EmptyWindowPolicy::default());
        assert_eq!(day.len(), 61);
    }

    #[test]
    fn test_empty_relative_window_falls_back_to_latest() {
        let readings = series(5, 60);
        let later = base() + Duration::days(3);

        let result = WindowSpec::Within(3600).apply(&readings, later, EmptyWindowPolicy::MostRecent);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0], readings[4]);
    }

    #[test]
    fn test_empty_window_policies() {
        let readings = series(5, 60);
        let later = base() + Duration::days(3);

        let n = WindowSpec::Within(3600).apply(&readings, later, EmptyWindowPolicy::MostRecentN(3));
        assert_eq!(n, &readings[2..]);

        let none = WindowSpec::Within(3600).apply(&readings, later, EmptyWindowPolicy::Empty);
        assert!(none.is_empty());
    }

    #[test]
    fn test_fallback_on_single_reading_is_idempotent() {
        let readings = series(1, 60);
        let later = base() + Duration::days(3);

        let once = WindowSpec::Within(86400).apply(&readings, later, EmptyWindowPolicy::MostRecent);
        let twice = WindowSpec::Within(86400).apply(once, later, EmptyWindowPolicy::MostRecent);
        assert_eq!(once, twice);
        assert_eq!(twice.len(), 1);
    }

    #[test]
    fn test_empty_input() {
        let readings: Vec<Reading> = Vec::new();
        for spec in [WindowSpec::Last(10), WindowSpec::Within(3600), WindowSpec::All] {
            assert!(spec.apply(&readings, base(), EmptyWindowPolicy::MostRecent).is_empty());
        }
    }
}
