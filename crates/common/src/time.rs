//! Local wall-clock alignment in a reference time zone.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Longest daylight-saving gap we step across when a local time does not exist.
const MAX_GAP_MINUTES: i64 = 180;

/// A local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOfDay {
    /// Hour, 0-23.
    pub hour: u32,
    /// Minute, 0-59.
    pub minute: u32,
}

impl TimeOfDay {
    /// Create a time of day, rejecting out-of-range components.
    #[must_use]
    pub const fn new(hour: u32, minute: u32) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self { hour, minute })
        } else {
            None
        }
    }

    fn naive(self) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0)
    }
}

/// Earliest instant `>= candidate` whose wall-clock time in `tz` is `at`.
///
/// The calendar date is taken from `tz`, not from UTC. Offsets are resolved at
/// the target date, so daylight-saving transitions between `candidate` and the
/// result are handled. A local time that falls in a spring-forward gap maps to
/// the first valid instant after the gap. A repeated local time maps to its
/// first occurrence not before `candidate`.
#[must_use]
pub fn next_time_of_day(candidate: DateTime<Utc>, at: TimeOfDay, tz: Tz) -> Option<DateTime<Utc>> {
    let local_date = candidate.with_timezone(&tz).date_naive();

    let (earliest, latest) = resolve_local(tz, local_date, at)?;
    if earliest >= candidate {
        return Some(earliest);
    }
    if latest >= candidate {
        return Some(latest);
    }

    resolve_local(tz, local_date.succ_opt()?, at).map(|(earliest, _)| earliest)
}

/// Resolve a local date and time in `tz` to its first and last UTC instant.
/// Both are the same unless the local time is repeated.
fn resolve_local(
    tz: Tz,
    date: NaiveDate,
    at: TimeOfDay,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let naive = NaiveDateTime::new(date, at.naive()?);

    (0..=MAX_GAP_MINUTES).find_map(|shift| {
        let resolved = tz.from_local_datetime(&(naive + chrono::Duration::minutes(shift)));
        let earliest = resolved.earliest()?.with_timezone(&Utc);
        let latest = resolved.latest()?.with_timezone(&Utc);
        Some((earliest, latest))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_same_day_when_not_yet_past() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        // 06:00 local (CET, UTC+1)
        let candidate = utc(2025, 1, 15, 5, 0);
        let at = TimeOfDay::new(9, 0).unwrap();
        assert_eq!(next_time_of_day(candidate, at, tz), Some(utc(2025, 1, 15, 8, 0)));
    }

    #[test]
    fn test_next_day_when_already_past() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        // 10:00 local
        let candidate = utc(2025, 1, 15, 9, 0);
        let at = TimeOfDay::new(9, 0).unwrap();
        assert_eq!(next_time_of_day(candidate, at, tz), Some(utc(2025, 1, 16, 8, 0)));
    }

    #[test]
    fn test_exact_match_is_kept() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let candidate = utc(2025, 1, 15, 8, 0);
        let at = TimeOfDay::new(9, 0).unwrap();
        assert_eq!(next_time_of_day(candidate, at, tz), Some(candidate));
    }

    #[test]
    fn test_uses_local_calendar_date() {
        let tz: Tz = "Asia/Tokyo".parse().unwrap();
        // 2025-01-01 20:00 UTC is already 2025-01-02 05:00 in Tokyo.
        let candidate = utc(2025, 1, 1, 20, 0);
        let at = TimeOfDay::new(9, 0).unwrap();
        assert_eq!(next_time_of_day(candidate, at, tz), Some(utc(2025, 1, 2, 0, 0)));
    }

    #[test]
    fn test_offset_resolved_after_spring_forward() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // Saturday 10:00 EST, the clocks move forward overnight.
        let candidate = utc(2025, 3, 8, 15, 0);
        let at = TimeOfDay::new(9, 0).unwrap();
        // Sunday 09:00 EDT (UTC-4)
        assert_eq!(next_time_of_day(candidate, at, tz), Some(utc(2025, 3, 9, 13, 0)));
    }

    #[test]
    fn test_offset_resolved_after_fall_back() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // Saturday 10:00 EDT
        let candidate = utc(2025, 11, 1, 14, 0);
        let at = TimeOfDay::new(9, 0).unwrap();
        // Sunday 09:00 EST (UTC-5)
        assert_eq!(next_time_of_day(candidate, at, tz), Some(utc(2025, 11, 2, 14, 0)));
    }

    #[test]
    fn test_gap_moves_to_first_valid_instant() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let candidate = utc(2025, 3, 9, 5, 0);
        // 02:30 does not exist on 2025-03-09; 03:00 EDT is 07:00 UTC.
        let at = TimeOfDay::new(2, 30).unwrap();
        assert_eq!(next_time_of_day(candidate, at, tz), Some(utc(2025, 3, 9, 7, 0)));
    }

    #[test]
    fn test_repeated_time_uses_earlier_occurrence() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let candidate = utc(2025, 11, 2, 4, 0);
        // 01:30 happens twice; the EDT occurrence is 05:30 UTC.
        let at = TimeOfDay::new(1, 30).unwrap();
        assert_eq!(next_time_of_day(candidate, at, tz), Some(utc(2025, 11, 2, 5, 30)));
    }

    #[test]
    fn test_repeated_time_between_occurrences_takes_later_one() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 01:45 EDT, after the first 01:30 and before the second.
        let candidate = utc(2025, 11, 2, 5, 45);
        let at = TimeOfDay::new(1, 30).unwrap();
        // 01:30 EST is 06:30 UTC.
        assert_eq!(next_time_of_day(candidate, at, tz), Some(utc(2025, 11, 2, 6, 30)));
    }

    #[test]
    fn test_time_of_day_bounds() {
        assert!(TimeOfDay::new(23, 59).is_some());
        assert!(TimeOfDay::new(24, 0).is_none());
        assert!(TimeOfDay::new(12, 60).is_none());
    }
}
