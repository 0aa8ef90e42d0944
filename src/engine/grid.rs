use chrono::{DateTime, LocalResult, NaiveDate, NaiveDateTime, Offset, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::{MINUTE_MS, WallTime, from_ms, to_ms};

/// Resolve a local wall-clock time in `tz` to an instant.
///
/// Fall-back overlap: the earlier instant. Spring-forward gap: the offset in
/// effect before the gap is applied, which moves the time forward by the gap
/// length (02:30 on a New York spring-forward day becomes 03:30 EDT).
pub fn local_to_utc(tz: Tz, local: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => t.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let offset_before = tz
                .offset_from_local_datetime(&(local - TimeDelta::days(1)))
                .earliest()
                .map(|o| o.fix().local_minus_utc())
                .unwrap_or(0);
            (local - TimeDelta::seconds(i64::from(offset_before))).and_utc()
        }
    }
}

/// Slot-start instants for one day's open interval.
///
/// `[day_start, day_end)` is interpreted on `date` in `tz`, each bound
/// resolved on its own. Slots stride by `duration_minutes` from the start and
/// a slot is emitted only if it ends by `day_end`. Empty when the interval is
/// empty or inverted or the duration is zero.
pub fn generate_slots(
    day_start: WallTime,
    day_end: WallTime,
    duration_minutes: u32,
    date: NaiveDate,
    tz: Tz,
) -> Vec<DateTime<Utc>> {
    if duration_minutes == 0 || day_start >= day_end {
        return Vec::new();
    }
    let start = to_ms(local_to_utc(tz, date.and_time(day_start.to_naive())));
    let end = to_ms(local_to_utc(tz, date.and_time(day_end.to_naive())));
    let step = i64::from(duration_minutes) * MINUTE_MS;

    let mut slots = Vec::new();
    let mut cursor = start;
    while cursor + step <= end {
        slots.push(from_ms(cursor));
        cursor += step;
    }
    slots
}
