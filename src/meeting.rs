//! Meeting-link generation for new bookings.
//!
//! Links are placeholders derived deterministically from the booking id, so
//! replaying the same booking always yields the same URL.

use ulid::Ulid;

use crate::model::{EventType, LocationType};

/// Meeting URL for a booking of `event_type`, if its location has one.
pub fn meeting_link(event_type: &EventType, booking_id: Ulid) -> Option<String> {
    let configured = event_type
        .location_url
        .as_deref()
        .filter(|url| !url.is_empty());
    match event_type.location_type {
        LocationType::GoogleMeet => Some(google_meet_link(booking_id)),
        LocationType::Zoom => Some(
            configured
                .map(str::to_string)
                .unwrap_or_else(|| zoom_link(booking_id)),
        ),
        LocationType::Custom => configured.map(str::to_string),
        LocationType::Phone | LocationType::InPerson => None,
    }
}

/// Human-facing label for a location type.
pub fn location_display(location_type: LocationType) -> &'static str {
    match location_type {
        LocationType::GoogleMeet => "Google Meet",
        LocationType::Zoom => "Zoom",
        LocationType::Phone => "Phone Call",
        LocationType::InPerson => "In Person",
        LocationType::Custom => "Custom Location",
    }
}

fn google_meet_link(booking_id: Ulid) -> String {
    let code = id_hash(booking_id);
    format!(
        "https://meet.google.com/{}-{}-{}",
        &code[0..3],
        &code[3..7],
        &code[7..10]
    )
}

fn zoom_link(booking_id: Ulid) -> String {
    let digits: String = id_hash(booking_id)
        .bytes()
        .take(11)
        .map(|b| {
            if b.is_ascii_digit() {
                char::from(b)
            } else {
                char::from(b'0' + b % 10)
            }
        })
        .collect();
    format!("https://zoom.us/j/{digits:0<11}")
}

/// 31-multiplier string hash over the id's text, rendered base 36 and
/// right-padded with '0' to at least 10 characters.
fn id_hash(booking_id: Ulid) -> String {
    let hash = booking_id
        .to_string()
        .bytes()
        .fold(0i32, |h, b| h.wrapping_mul(31).wrapping_add(i32::from(b)));
    let mut n = hash.unsigned_abs();
    let mut digits = Vec::new();
    loop {
        let d = (n % 36) as u8;
        digits.push(if d < 10 { b'0' + d } else { b'a' + d - 10 });
        n /= 36;
        if n == 0 {
            break;
        }
    }
    digits.reverse();
    let mut out = String::from_utf8(digits).unwrap_or_default();
    while out.len() < 10 {
        out.push('0');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_type(location_type: LocationType, url: Option<&str>) -> EventType {
        EventType {
            id: Ulid::new(),
            host_id: Ulid::new(),
            slug: "intro".into(),
            name: "Intro call".into(),
            duration_minutes: 30,
            is_active: true,
            location_type,
            location_url: url.map(str::to_string),
        }
    }

    #[test]
    fn google_meet_shape() {
        let url = meeting_link(&event_type(LocationType::GoogleMeet, None), Ulid::new()).unwrap();
        let code = url.strip_prefix("https://meet.google.com/").unwrap();
        let parts: Vec<&str> = code.split('-').collect();
        assert_eq!(parts.iter().map(|p| p.len()).collect::<Vec<_>>(), vec![3, 4, 3]);
        assert!(code.chars().all(|c| c == '-' || c.is_ascii_alphanumeric()));
    }

    #[test]
    fn links_are_deterministic_per_booking() {
        let et = event_type(LocationType::GoogleMeet, None);
        let id = Ulid::new();
        assert_eq!(meeting_link(&et, id), meeting_link(&et, id));
    }

    #[test]
    fn zoom_uses_configured_url_first() {
        let et = event_type(LocationType::Zoom, Some("https://zoom.us/j/123"));
        assert_eq!(meeting_link(&et, Ulid::new()).as_deref(), Some("https://zoom.us/j/123"));
    }

    #[test]
    fn zoom_generated_id_is_eleven_digits() {
        let url = meeting_link(&event_type(LocationType::Zoom, None), Ulid::new()).unwrap();
        let id = url.strip_prefix("https://zoom.us/j/").unwrap();
        assert_eq!(id.len(), 11);
        assert!(id.bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn custom_phone_in_person() {
        let custom = event_type(LocationType::Custom, Some("https://example.com/room"));
        assert_eq!(
            meeting_link(&custom, Ulid::new()).as_deref(),
            Some("https://example.com/room")
        );
        assert_eq!(meeting_link(&event_type(LocationType::Custom, None), Ulid::new()), None);
        assert_eq!(meeting_link(&event_type(LocationType::Phone, None), Ulid::new()), None);
        assert_eq!(meeting_link(&event_type(LocationType::InPerson, None), Ulid::new()), None);
    }

    #[test]
    fn hash_pads_short_values() {
        assert_eq!(id_hash(Ulid::nil()).len(), 10);
    }
}
