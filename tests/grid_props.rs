//! Property-based tests for the slot grid and the conflict filter.

use chrono::{NaiveDate, TimeDelta};
use chrono_tz::Tz;
use proptest::prelude::*;
use slotd::engine::{available_slots, generate_slots, local_to_utc};
use slotd::model::{MINUTE_MS, Ms, Span, WallTime, to_ms};

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

fn arb_timezone() -> impl Strategy<Value = Tz> {
    prop_oneof![
        Just(Tz::UTC),
        Just(chrono_tz::America::New_York),
        Just(chrono_tz::America::Los_Angeles),
        Just(chrono_tz::Europe::London),
        Just(chrono_tz::Asia::Tokyo),
        Just(chrono_tz::Australia::Lord_Howe),
    ]
}

/// Any date in 2025-2027, including the DST transition days.
fn arb_date() -> impl Strategy<Value = NaiveDate> {
    (0i64..3 * 365).prop_map(|offset| {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap() + TimeDelta::days(offset)
    })
}

fn arb_wall_time() -> impl Strategy<Value = WallTime> {
    (0u32..24, 0u32..60).prop_map(|(h, m)| WallTime::new(h, m).unwrap())
}

fn arb_duration() -> impl Strategy<Value = u32> {
    15u32..=240
}

fn arb_span() -> impl Strategy<Value = Span> {
    (0i64..10_000, 1i64..500).prop_map(|(start, len)| Span::new(start, start + len))
}

fn instant(date: NaiveDate, t: WallTime, tz: Tz) -> Ms {
    to_ms(local_to_utc(tz, date.and_time(t.to_naive())))
}

// ---------------------------------------------------------------------------
// Grid properties
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn grid_stays_inside_bounds(
        start in arb_wall_time(),
        end in arb_wall_time(),
        duration in arb_duration(),
        date in arb_date(),
        tz in arb_timezone(),
    ) {
        let slots: Vec<Ms> = generate_slots(start, end, duration, date, tz)
            .into_iter()
            .map(to_ms)
            .collect();
        if start >= end {
            prop_assert!(slots.is_empty());
            return Ok(());
        }
        let lo = instant(date, start, tz);
        let hi = instant(date, end, tz);
        let step = duration as Ms * MINUTE_MS;
        if let Some(&first) = slots.first() {
            prop_assert_eq!(first, lo);
        }
        for s in &slots {
            prop_assert!(*s + step <= hi);
        }
        for w in slots.windows(2) {
            prop_assert_eq!(w[1] - w[0], step);
        }
        // The grid is maximal: one more stride would overrun the end.
        let next = slots.last().map_or(lo, |&last| last + step);
        prop_assert!(next + step > hi);
    }

    #[test]
    fn utc_grid_count_is_floor(
        start in arb_wall_time(),
        end in arb_wall_time(),
        duration in arb_duration(),
        date in arb_date(),
    ) {
        prop_assume!(start < end);
        let minutes = end.minutes_since_midnight() - start.minutes_since_midnight();
        let slots = generate_slots(start, end, duration, date, Tz::UTC);
        prop_assert_eq!(slots.len() as u32, minutes / duration);
    }

    #[test]
    fn grid_is_deterministic(
        start in arb_wall_time(),
        end in arb_wall_time(),
        duration in arb_duration(),
        date in arb_date(),
        tz in arb_timezone(),
    ) {
        prop_assert_eq!(
            generate_slots(start, end, duration, date, tz),
            generate_slots(start, end, duration, date, tz)
        );
    }

    // -----------------------------------------------------------------------
    // Conflict properties
    // -----------------------------------------------------------------------

    #[test]
    fn overlap_is_symmetric(a in arb_span(), b in arb_span()) {
        prop_assert_eq!(a.overlaps(&b), b.overlaps(&a));
        let touching = Span::new(a.end, a.end + 1);
        prop_assert!(!a.overlaps(&touching));
    }

    #[test]
    fn filter_keeps_only_free_future_slots(
        mut candidates in proptest::collection::vec(0i64..10_000, 0..50),
        busy in proptest::collection::vec(arb_span(), 0..10),
        duration in 1i64..300,
        now in -100i64..5_000,
    ) {
        candidates.sort_unstable();
        candidates.dedup();
        let kept = available_slots(&candidates, duration, &busy, now);

        prop_assert_eq!(&kept, &available_slots(&candidates, duration, &busy, now));
        for s in &kept {
            prop_assert!(*s > now);
            prop_assert!(candidates.contains(s));
            let span = Span::new(*s, *s + duration);
            prop_assert!(busy.iter().all(|b| !b.overlaps(&span)));
        }
        // Nothing free and future was dropped.
        for c in &candidates {
            let span = Span::new(*c, *c + duration);
            if *c > now && busy.iter().all(|b| !b.overlaps(&span)) {
                prop_assert!(kept.contains(c));
            }
        }
    }
}
