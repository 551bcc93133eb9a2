//! GPS time conversion.
//!
//! BasicStation time-sync responses carry microseconds since the GPS epoch
//! (1980-01-06T00:00:00Z). GPS time does not observe leap seconds, so the
//! conversion from UTC adds one second for every leap second inserted since
//! the epoch.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// UTC dates (midnight) at which a leap second took effect, starting after
/// the GPS epoch. Update when IERS announces a new one.
const LEAP_SECOND_DATES: &[(i32, u32, u32)] = &[
    (1981, 7, 1),
    (1982, 7, 1),
    (1983, 7, 1),
    (1985, 7, 1),
    (1988, 1, 1),
    (1990, 1, 1),
    (1991, 1, 1),
    (1992, 7, 1),
    (1993, 7, 1),
    (1994, 7, 1),
    (1996, 1, 1),
    (1997, 7, 1),
    (1999, 1, 1),
    (2006, 1, 1),
    (2009, 1, 1),
    (2012, 7, 1),
    (2015, 7, 1),
    (2017, 1, 1),
];

fn gps_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1980, 1, 6, 0, 0, 0).unwrap()
}

fn leap_seconds_at(t: DateTime<Utc>) -> i64 {
    LEAP_SECOND_DATES
        .iter()
        .filter(|(y, m, d)| Utc.with_ymd_and_hms(*y, *m, *d, 0, 0, 0).unwrap() <= t)
        .count() as i64
}

/// Duration since the GPS epoch for the given UTC instant.
///
/// Returns `Duration::ZERO` for instants before the epoch.
pub fn time_since_gps_epoch(t: DateTime<Utc>) -> Duration {
    let utc_micros = (t - gps_epoch()).num_microseconds().unwrap_or(0);
    let micros = utc_micros + leap_seconds_at(t) * 1_000_000;
    if micros <= 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(micros as u64)
}
