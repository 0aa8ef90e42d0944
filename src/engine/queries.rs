use chrono::{DateTime, NaiveDate, Utc};
use ulid::Ulid;

use crate::model::*;

use super::conflict::available_slots;
use super::grid::generate_slots;
use super::resolver::{Resolution, resolve};
use super::{Engine, EngineError, SharedHostState};

impl Engine {
    fn host_or_not_found(&self, host_id: &Ulid) -> Result<SharedHostState, EngineError> {
        self.get_host(host_id)
            .ok_or_else(|| EngineError::not_found("host", host_id))
    }

    pub async fn host_info(&self, host_id: Ulid) -> Result<HostInfo, EngineError> {
        let hs = self.host_or_not_found(&host_id)?;
        let guard = hs.read().await;
        Ok(HostInfo {
            id: guard.id,
            username: guard.username.clone(),
            name: guard.name.clone(),
            timezone: guard.timezone,
        })
    }

    /// Directory lookup for a public booking page. Inactive event types are
    /// not found.
    pub async fn lookup_event_type(
        &self,
        username: &str,
        slug: &str,
    ) -> Result<(HostInfo, EventType), EngineError> {
        let host_id = self
            .usernames
            .get(username)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::not_found("username", username))?;
        let event_type = self
            .slugs
            .get(&(host_id, slug.to_string()))
            .and_then(|e| self.get_event_type(e.value()))
            .filter(|et| et.is_active)
            .ok_or_else(|| EngineError::not_found("event type", format!("{username}/{slug}")))?;
        Ok((self.host_info(host_id).await?, event_type))
    }

    pub async fn resolve_availability(
        &self,
        host_id: Ulid,
        date: NaiveDate,
    ) -> Result<Resolution, EngineError> {
        let hs = self.host_or_not_found(&host_id)?;
        let guard = hs.read().await;
        Ok(resolve(&guard, date))
    }

    /// Bookable start instants of `event_type_id` on `date`, ascending.
    ///
    /// resolve → generate per open interval → dedupe → drop anything that
    /// overlaps a confirmed booking or external busy block, or that is not
    /// strictly in the future. A closed day or inactive event type is an
    /// empty list.
    pub async fn list_slots(
        &self,
        event_type_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<DateTime<Utc>>, EngineError> {
        let event_type = self
            .get_event_type(&event_type_id)
            .ok_or_else(|| EngineError::not_found("event type", event_type_id))?;
        if !event_type.is_active {
            return Ok(Vec::new());
        }
        let duration = event_type.duration_ms();
        let hs = self.host_or_not_found(&event_type.host_id)?;

        let (candidates, mut busy, window) = {
            let guard = hs.read().await;
            let Resolution::Open(intervals) = resolve(&guard, date) else {
                return Ok(Vec::new());
            };
            let mut candidates: Vec<Ms> = intervals
                .iter()
                .flat_map(|i| {
                    generate_slots(i.start, i.end, event_type.duration_minutes, date, i.timezone)
                })
                .map(to_ms)
                .collect();
            candidates.sort_unstable();
            candidates.dedup();
            let (Some(&first), Some(&last)) = (candidates.first(), candidates.last()) else {
                return Ok(Vec::new());
            };
            let window = Span::new(first, last + duration);
            let busy: Vec<Span> = guard.confirmed_overlapping(&window).map(|b| b.span).collect();
            (candidates, busy, window)
        };
        if let Some(source) = &self.busy {
            busy.extend(source.busy_intervals(event_type.host_id, window).await?);
        }

        let now = self.now_ms();
        Ok(available_slots(&candidates, duration, &busy, now)
            .into_iter()
            .map(from_ms)
            .collect())
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let host_id = self
            .get_host_for_entity(&id)
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        let hs = self.host_or_not_found(&host_id)?;
        let guard = hs.read().await;
        guard
            .booking(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("booking", id))
    }

    /// Bookings of a host in start order, optionally filtered by status.
    pub async fn list_bookings(
        &self,
        host_id: Ulid,
        status: Option<BookingStatus>,
    ) -> Result<Vec<Booking>, EngineError> {
        let hs = self.host_or_not_found(&host_id)?;
        let guard = hs.read().await;
        Ok(guard
            .bookings
            .iter()
            .filter(|b| status.is_none_or(|s| b.status == s))
            .cloned()
            .collect())
    }

    /// Weekly rules ordered by weekday, then start.
    pub async fn get_rules(&self, host_id: Ulid) -> Result<Vec<WeeklyRule>, EngineError> {
        let hs = self.host_or_not_found(&host_id)?;
        let guard = hs.read().await;
        let mut rules = guard.rules.clone();
        rules.sort_by_key(|r| (r.day_of_week, r.start, r.end));
        Ok(rules)
    }

    /// Date overrides in date order.
    pub async fn get_overrides(&self, host_id: Ulid) -> Result<Vec<DateOverride>, EngineError> {
        let hs = self.host_or_not_found(&host_id)?;
        let guard = hs.read().await;
        Ok(guard.overrides.values().cloned().collect())
    }
}
