use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The internal instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

pub fn to_ms(t: DateTime<Utc>) -> Ms {
    t.timestamp_millis()
}

pub fn from_ms(ms: Ms) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// The one overlap predicate. Touching boundaries do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            from_ms(self.start).to_rfc3339(),
            from_ms(self.end).to_rfc3339()
        )
    }
}

// ── Wall-clock time ──────────────────────────────────────────────

/// Local wall-clock time of day, `HH:mm`, stored as minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WallTime(u16);

impl WallTime {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        (hour < 24 && minute < 60).then(|| Self((hour * 60 + minute) as u16))
    }

    pub fn hour(&self) -> u32 {
        u32::from(self.0 / 60)
    }

    pub fn minute(&self) -> u32 {
        u32::from(self.0 % 60)
    }

    pub fn minutes_since_midnight(&self) -> u32 {
        u32::from(self.0)
    }

    pub fn to_naive(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour(), self.minute(), 0).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid wall-clock time {0:?} (expected HH:mm)")]
pub struct WallTimeParseError(pub String);

impl FromStr for WallTime {
    type Err = WallTimeParseError;

    /// Accepts `H:mm` or `HH:mm`, hours 0–23, minutes 00–59.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || WallTimeParseError(s.to_string());
        let (h, m) = s.split_once(':').ok_or_else(err)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(err());
        }
        if !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let hour: u32 = h.parse().map_err(|_| err())?;
        let minute: u32 = m.parse().map_err(|_| err())?;
        Self::new(hour, minute).ok_or_else(err)
    }
}

impl fmt::Display for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

// ── Domain records ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    GoogleMeet,
    Zoom,
    Phone,
    InPerson,
    Custom,
}

impl LocationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationType::GoogleMeet => "google_meet",
            LocationType::Zoom => "zoom",
            LocationType::Phone => "phone",
            LocationType::InPerson => "in_person",
            LocationType::Custom => "custom",
        }
    }
}

impl FromStr for LocationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google_meet" => Ok(LocationType::GoogleMeet),
            "zoom" => Ok(LocationType::Zoom),
            "phone" => Ok(LocationType::Phone),
            "in_person" => Ok(LocationType::InPerson),
            "custom" => Ok(LocationType::Custom),
            other => Err(format!("unknown location type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventType {
    pub id: Ulid,
    pub host_id: Ulid,
    pub slug: String,
    pub name: String,
    pub duration_minutes: u32,
    pub is_active: bool,
    pub location_type: LocationType,
    pub location_url: Option<String>,
}

impl EventType {
    pub fn duration_ms(&self) -> Ms {
        Ms::from(self.duration_minutes) * MINUTE_MS
    }
}

/// Recurring availability for one day of the week. `day_of_week` is 0 = Sunday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyRule {
    pub id: Ulid,
    pub host_id: Ulid,
    pub day_of_week: u8,
    pub start: WallTime,
    pub end: WallTime,
    pub timezone: Tz,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateOverride {
    pub id: Ulid,
    pub host_id: Ulid,
    pub date: NaiveDate,
    pub is_available: bool,
    pub start: Option<WallTime>,
    pub end: Option<WallTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub event_type_id: Ulid,
    pub host_id: Ulid,
    pub attendee_name: String,
    pub attendee_email: String,
    pub attendee_notes: Option<String>,
    pub span: Span,
    pub status: BookingStatus,
    /// Attendee's display timezone.
    pub timezone: Tz,
    pub meeting_url: Option<String>,
    pub cancellation_reason: Option<String>,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        from_ms(self.span.start)
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        from_ms(self.span.end)
    }
}

/// Everything owned by one host. Guarded as a unit: the write lock on this
/// state is the serialization point for claims.
#[derive(Debug, Clone)]
pub struct HostState {
    pub id: Ulid,
    pub username: String,
    pub name: Option<String>,
    pub timezone: Tz,
    pub rules: Vec<WeeklyRule>,
    pub overrides: BTreeMap<NaiveDate, DateOverride>,
    /// All bookings ever made, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl HostState {
    pub fn new(id: Ulid, username: String, name: Option<String>, timezone: Tz) -> Self {
        Self {
            id,
            username,
            name,
            timezone,
            rules: Vec::new(),
            overrides: BTreeMap::new(),
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Confirmed bookings overlapping `query`.
    /// Binary search skips bookings starting at or after `query.end`.
    pub fn confirmed_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.is_confirmed() && b.span.overlaps(query))
    }

    pub fn rules_for_weekday(&self, day_of_week: u8) -> impl Iterator<Item = &WeeklyRule> {
        self.rules.iter().filter(move |r| r.day_of_week == day_of_week)
    }

    pub fn override_by_id(&self, id: &Ulid) -> Option<&DateOverride> {
        self.overrides.values().find(|o| o.id == *id)
    }
}

/// The WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    HostCreated {
        id: Ulid,
        username: String,
        name: Option<String>,
        timezone: Tz,
    },
    EventTypeCreated {
        event_type: EventType,
    },
    EventTypeDeactivated {
        id: Ulid,
    },
    RuleAdded {
        rule: WeeklyRule,
    },
    RuleRemoved {
        id: Ulid,
        host_id: Ulid,
    },
    OverrideSet {
        date_override: DateOverride,
    },
    OverrideRemoved {
        id: Ulid,
        host_id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        host_id: Ulid,
        reason: Option<String>,
    },
}

impl Event {
    /// Host the event applies to, for events applied under a host lock.
    pub fn host_id(&self) -> Option<Ulid> {
        match self {
            Event::RuleAdded { rule } => Some(rule.host_id),
            Event::OverrideSet { date_override } => Some(date_override.host_id),
            Event::BookingCreated { booking } => Some(booking.host_id),
            Event::RuleRemoved { host_id, .. }
            | Event::OverrideRemoved { host_id, .. }
            | Event::BookingCancelled { host_id, .. } => Some(*host_id),
            Event::HostCreated { .. }
            | Event::EventTypeCreated { .. }
            | Event::EventTypeDeactivated { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub id: Ulid,
    pub username: String,
    pub name: Option<String>,
    pub timezone: Tz,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ms(h: u32, m: u32) -> Ms {
        to_ms(Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap())
    }

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            event_type_id: Ulid::new(),
            host_id: Ulid::new(),
            attendee_name: "Ada".into(),
            attendee_email: "ada@example.com".into(),
            attendee_notes: None,
            span: Span::new(start, end),
            status,
            timezone: Tz::UTC,
            meeting_url: None,
            cancellation_reason: None,
        }
    }

    #[test]
    fn span_overlap_half_open() {
        let booked = Span::new(ms(10, 0), ms(10, 30));
        let after = Span::new(ms(10, 30), ms(11, 0));
        let straddle = Span::new(ms(9, 45), ms(10, 15));
        assert!(!booked.overlaps(&after));
        assert!(!after.overlaps(&booked));
        assert!(booked.overlaps(&straddle));
        assert!(straddle.overlaps(&booked));
    }

    #[test]
    fn wall_time_parse() {
        assert_eq!("09:00".parse::<WallTime>().unwrap(), WallTime::new(9, 0).unwrap());
        assert_eq!("9:05".parse::<WallTime>().unwrap(), WallTime::new(9, 5).unwrap());
        assert_eq!("23:59".parse::<WallTime>().unwrap().to_string(), "23:59");
        for bad in ["24:00", "12:60", "12:5", "", "noon", "12-30", "123:00", "+1:00"] {
            assert!(bad.parse::<WallTime>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn wall_time_ordering() {
        let a: WallTime = "09:00".parse().unwrap();
        let b: WallTime = "17:15".parse().unwrap();
        assert!(a < b);
        assert_eq!(b.minutes_since_midnight(), 17 * 60 + 15);
    }

    #[test]
    fn bookings_stay_sorted() {
        let mut hs = HostState::new(Ulid::new(), "ada".into(), None, Tz::UTC);
        hs.insert_booking(booking(ms(14, 0), ms(14, 30), BookingStatus::Confirmed));
        hs.insert_booking(booking(ms(9, 0), ms(9, 30), BookingStatus::Confirmed));
        hs.insert_booking(booking(ms(11, 0), ms(11, 30), BookingStatus::Confirmed));
        let starts: Vec<Ms> = hs.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![ms(9, 0), ms(11, 0), ms(14, 0)]);
    }

    #[test]
    fn confirmed_overlapping_skips_cancelled_and_adjacent() {
        let mut hs = HostState::new(Ulid::new(), "ada".into(), None, Tz::UTC);
        hs.insert_booking(booking(ms(9, 0), ms(10, 0), BookingStatus::Confirmed));
        hs.insert_booking(booking(ms(10, 0), ms(10, 30), BookingStatus::Cancelled));
        hs.insert_booking(booking(ms(10, 15), ms(10, 45), BookingStatus::Confirmed));
        hs.insert_booking(booking(ms(11, 0), ms(12, 0), BookingStatus::Confirmed));

        let query = Span::new(ms(10, 0), ms(11, 0));
        let hits: Vec<_> = hs.confirmed_overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(ms(10, 15), ms(10, 45)));
    }

    #[test]
    fn confirmed_overlapping_long_booking_spanning_query() {
        let mut hs = HostState::new(Ulid::new(), "ada".into(), None, Tz::UTC);
        hs.insert_booking(booking(ms(8, 0), ms(18, 0), BookingStatus::Confirmed));
        let query = Span::new(ms(12, 0), ms(12, 30));
        assert_eq!(hs.confirmed_overlapping(&query).count(), 1);
    }

    #[test]
    fn status_and_location_strings() {
        assert_eq!("cancelled".parse::<BookingStatus>().unwrap(), BookingStatus::Cancelled);
        assert!("deleted".parse::<BookingStatus>().is_err());
        for lt in ["google_meet", "zoom", "phone", "in_person", "custom"] {
            assert_eq!(lt.parse::<LocationType>().unwrap().as_str(), lt);
        }
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            booking: booking(ms(9, 0), ms(9, 30), BookingStatus::Confirmed),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn rule_event_roundtrip_keeps_timezone() {
        let event = Event::RuleAdded {
            rule: WeeklyRule {
                id: Ulid::new(),
                host_id: Ulid::new(),
                day_of_week: 1,
                start: "09:00".parse().unwrap(),
                end: "17:00".parse().unwrap(),
                timezone: chrono_tz::America::New_York,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
