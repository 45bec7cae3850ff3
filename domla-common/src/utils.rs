//! Id, path and timestamp helpers

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use uuid::Uuid;

use crate::types::Ticks;

/// Tick offset of 1400-01-01T00:00:00 from the 0001-01-01 epoch
const EPOCH_OFFSET_TICKS: i64 = 441_481_536_000_000_000;

/// New document id: UUID v4 in lowercase hyphenated form.
///
/// The first two characters are hex digits, which the shard routing
/// relies on.
pub fn new_id() -> String {
    Uuid::new_v4().hyphenated().to_string()
}

/// Split `path` on `delimiter`, collapsing runs and eliding empty segments
pub fn split_path(path: &str, delimiter: char) -> Vec<String> {
    path.split(delimiter)
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Convert a point in time to 100ns ticks since 0001-01-01T00:00:00Z
pub fn ticks(when: DateTime<Utc>) -> Ticks {
    let base = Utc.from_utc_datetime(
        &NaiveDate::from_ymd_opt(1400, 1, 1)
            .expect("valid base date")
            .and_hms_opt(0, 0, 0)
            .expect("valid base time"),
    );
    let micros = when
        .signed_duration_since(base)
        .num_microseconds()
        .unwrap_or(0);

    micros * 10 + EPOCH_OFFSET_TICKS
}

/// Tick timestamp of the current instant
pub fn now_ticks() -> Ticks {
    ticks(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_yields_expected_result() {
        // DateTime(2001, 2, 5, 12, 0, 0)
        let when = Utc
            .with_ymd_and_hms(2001, 2, 5, 12, 0, 0)
            .single()
            .unwrap();
        assert_eq!(ticks(when), 631_169_712_000_000_000);
    }

    #[test]
    fn ids_are_lowercase_hyphenated() {
        let id = new_id();
        assert_eq!(id.len(), 36);
        assert_eq!(id.as_bytes()[8], b'-');
        assert!(id.chars().all(|c| c == '-' || c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert!(u8::from_str_radix(&id[0..2], 16).is_ok());
    }

    #[test]
    fn split_collapses_runs_and_edges() {
        assert_eq!(split_path("/one/two", '/'), vec!["one", "two"]);
        assert_eq!(split_path("one//two/", '/'), vec!["one", "two"]);
        assert_eq!(split_path("//", '/'), Vec::<String>::new());
        assert_eq!(split_path("", '/'), Vec::<String>::new());
    }
}
