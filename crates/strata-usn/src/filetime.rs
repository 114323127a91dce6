//! FILETIME (100ns units since 1601-01-01 UTC) conversion.
//!
//! The broken-down conversion walks centuries, then years, then months,
//! with Gregorian leap rules, rather than going through a library type;
//! it is shared with formats that need the exact field values (USN
//! records, WIM timestamps).

use strata_core::{Error, Result};

pub const UNIX_EPOCH_FILETIME_SECONDS: i64 = 11_644_473_600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub nano_seconds: u32,
}

fn is_leap_year(year: u16) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_month(year: u16, month: u8) -> Result<u64> {
    Ok(match month {
        2 => {
            if is_leap_year(year) {
                29
            } else {
                28
            }
        }
        4 | 6 | 9 | 11 => 30,
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        other => return Err(Error::bad_fs(format!("unsupported month {other}"))),
    })
}

/// Unix seconds from a FILETIME (sub-second part truncated).
pub fn filetime_to_unix(filetime: u64) -> i64 {
    (filetime / 10_000_000) as i64 - UNIX_EPOCH_FILETIME_SECONDS
}

/// Broken-down UTC time from a FILETIME.
pub fn filetime_to_datetime(filetime: u64) -> Result<DateTime> {
    let mut stamp = filetime;

    let nano_seconds = (stamp % 10) as u32 * 100;
    stamp /= 10;
    let micro_seconds = (stamp % 1000) as u32;
    stamp /= 1000;
    let milli_seconds = (stamp % 1000) as u32;
    stamp /= 1000;
    let seconds = (stamp % 60) as u8;
    stamp /= 60;
    let minutes = (stamp % 60) as u8;
    stamp /= 60;
    let hours = (stamp % 24) as u8;
    stamp /= 24;

    // Day zero is Jan 1 1601.
    stamp += 1;

    let mut year: u16 = 1601;
    if stamp >= 36159 {
        year = 1700;
        stamp -= 36159;
    }
    while stamp > 0 {
        let days_in_century = if year % 400 == 0 { 36525 } else { 36524 };
        if stamp <= days_in_century {
            break;
        }
        stamp -= days_in_century;
        year += 100;
    }
    while stamp > 0 {
        let days_in_year = if is_leap_year(year) { 366 } else { 365 };
        if stamp <= days_in_year {
            break;
        }
        stamp -= days_in_year;
        year += 1;
    }
    if year > 9999 {
        return Err(Error::bad_fs("FILETIME year out of bounds"));
    }

    let mut month: u8 = 1;
    while stamp > 0 {
        let days = days_in_month(year, month)?;
        if stamp <= days {
            break;
        }
        stamp -= days;
        month += 1;
    }

    Ok(DateTime {
        year,
        month,
        day: stamp as u8,
        hours,
        minutes,
        seconds,
        nano_seconds: nano_seconds + micro_seconds * 1000 + milli_seconds * 1_000_000,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Utc};

    #[test]
    fn epoch_boundaries() {
        let dt = filetime_to_datetime(0).unwrap();
        assert_eq!(
            dt,
            DateTime {
                year: 1601,
                month: 1,
                day: 1,
                hours: 0,
                minutes: 0,
                seconds: 0,
                nano_seconds: 0
            }
        );
        assert_eq!(filetime_to_unix(0), -UNIX_EPOCH_FILETIME_SECONDS);

        // The unix epoch is 11644473600 seconds after the FILETIME one.
        let unix_epoch = UNIX_EPOCH_FILETIME_SECONDS as u64 * 10_000_000;
        let dt = filetime_to_datetime(unix_epoch).unwrap();
        assert_eq!((dt.year, dt.month, dt.day), (1970, 1, 1));
        assert_eq!(filetime_to_unix(unix_epoch), 0);
    }

    #[test]
    fn matches_chrono_over_a_spread_of_dates() {
        // One sample per year across leap and century boundaries.
        for year in [1601, 1700, 1900, 1999, 2000, 2001, 2024, 2100, 2400] {
            for (month, day, hms) in [(1, 1, 0u32), (2, 28, 3661), (12, 31, 86399)] {
                let when = Utc
                    .with_ymd_and_hms(year, month, day, hms / 3600, (hms / 60) % 60, hms % 60)
                    .unwrap();
                let filetime =
                    ((when.timestamp() + UNIX_EPOCH_FILETIME_SECONDS) as u64) * 10_000_000;
                let dt = filetime_to_datetime(filetime).unwrap();
                assert_eq!(dt.year as i32, when.year(), "{when}");
                assert_eq!(dt.month as u32, when.month(), "{when}");
                assert_eq!(dt.day as u32, when.day(), "{when}");
                assert_eq!(dt.hours as u32, when.hour(), "{when}");
                assert_eq!(dt.minutes as u32, when.minute(), "{when}");
                assert_eq!(dt.seconds as u32, when.second(), "{when}");
                assert_eq!(filetime_to_unix(filetime), when.timestamp());
            }
        }
    }

    #[test]
    fn sub_second_fields() {
        // 1.2345678 seconds after the epoch day.
        let dt = filetime_to_datetime(12_345_678).unwrap();
        assert_eq!(dt.seconds, 1);
        assert_eq!(dt.nano_seconds, 234_567_800);
    }
}
