use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::meeting::meeting_link;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, validate_span};
use super::{Engine, EngineError, WalCommand, validate};

/// A request to reserve one slot of an event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    /// Booking id to use; generated when absent.
    pub id: Option<Ulid>,
    pub event_type_id: Ulid,
    pub start: DateTime<Utc>,
    pub attendee_name: String,
    pub attendee_email: String,
    pub attendee_notes: Option<String>,
    /// Attendee's display zone.
    pub timezone: Tz,
}

fn claim_outcome(result: &Result<Booking, EngineError>) -> &'static str {
    match result {
        Ok(_) => "confirmed",
        Err(EngineError::Conflict(_)) => "conflict",
        Err(_) => "rejected",
    }
}

impl Engine {
    pub async fn create_host(
        &self,
        id: Ulid,
        username: String,
        name: Option<String>,
        timezone: Tz,
    ) -> Result<(), EngineError> {
        if self.hosts.len() >= MAX_HOSTS {
            return Err(EngineError::LimitExceeded("too many hosts"));
        }
        validate::username(&username)?;
        if let Some(ref n) = name {
            validate::check_len("host name too long", n, MAX_NAME_LEN)?;
        }
        if self.hosts.contains_key(&id) {
            return Err(EngineError::already_exists("host", id));
        }
        if self.usernames.contains_key(&username) {
            return Err(EngineError::already_exists("username", username));
        }

        let event = Event::HostCreated {
            id,
            username,
            name,
            timezone,
        };
        self.persist_registry(&event).await?;
        metrics::gauge!(observability::HOSTS_ACTIVE).set(self.hosts.len() as f64);
        info!(host_id = %id, "host created");
        Ok(())
    }

    pub async fn create_event_type(&self, event_type: EventType) -> Result<(), EngineError> {
        if self.event_types.len() >= MAX_EVENT_TYPES {
            return Err(EngineError::LimitExceeded("too many event types"));
        }
        if !self.hosts.contains_key(&event_type.host_id) {
            return Err(EngineError::not_found("host", event_type.host_id));
        }
        validate::slug(&event_type.slug)?;
        validate::check_len("event type name too long", &event_type.name, MAX_NAME_LEN)?;
        if event_type.name.trim().is_empty() {
            return Err(EngineError::validation("event name is required"));
        }
        validate::event_duration(event_type.duration_minutes)?;
        match (&event_type.location_type, &event_type.location_url) {
            (_, Some(url)) => validate::url(url)?,
            (LocationType::Custom, None) => {
                return Err(EngineError::validation("custom location requires a url"));
            }
            _ => {}
        }
        if self.event_types.contains_key(&event_type.id) {
            return Err(EngineError::already_exists("event type", event_type.id));
        }
        if self
            .slugs
            .contains_key(&(event_type.host_id, event_type.slug.clone()))
        {
            return Err(EngineError::already_exists("slug", &event_type.slug));
        }

        let event = Event::EventTypeCreated { event_type };
        self.persist_registry(&event).await
    }

    /// Soft delete: the event type stops yielding slots and accepting claims.
    /// Existing bookings are untouched.
    pub async fn deactivate_event_type(&self, id: Ulid) -> Result<(), EngineError> {
        let et = self
            .get_event_type(&id)
            .ok_or_else(|| EngineError::not_found("event type", id))?;
        if !et.is_active {
            return Ok(());
        }
        self.persist_registry(&Event::EventTypeDeactivated { id })
            .await
    }

    pub async fn add_weekly_rule(&self, rule: WeeklyRule) -> Result<(), EngineError> {
        if rule.day_of_week > 6 {
            return Err(EngineError::validation("day_of_week must be between 0 and 6"));
        }
        if rule.start >= rule.end {
            return Err(EngineError::validation("start_time must be before end_time"));
        }
        if self.entity_to_host.contains_key(&rule.id) {
            return Err(EngineError::already_exists("rule", rule.id));
        }
        let (_gate, mut guard) = self.lock_host(rule.host_id).await?;
        if guard.rules.len() >= MAX_RULES_PER_HOST {
            return Err(EngineError::LimitExceeded("too many rules on host"));
        }
        let event = Event::RuleAdded { rule };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_weekly_rule(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (_gate, mut guard) = self.resolve_entity_write("rule", &id).await?;
        if !guard.rules.iter().any(|r| r.id == id) {
            return Err(EngineError::not_found("rule", id));
        }
        let host_id = guard.id;
        let event = Event::RuleRemoved { id, host_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(host_id)
    }

    /// Upsert the override for its date. An existing override on the same
    /// date is replaced.
    pub async fn set_date_override(&self, date_override: DateOverride) -> Result<(), EngineError> {
        match (date_override.is_available, date_override.start, date_override.end) {
            (false, _, _) => {}
            (true, Some(start), Some(end)) if start < end => {}
            (true, Some(_), Some(_)) => {
                return Err(EngineError::validation("start_time must be before end_time"));
            }
            (true, _, _) => {
                return Err(EngineError::validation(
                    "an available override needs both start_time and end_time",
                ));
            }
        }
        let (_gate, mut guard) = self.lock_host(date_override.host_id).await?;
        // Only this host's override on the same date may reuse the id.
        let reusable = match guard.override_by_id(&date_override.id) {
            Some(existing) => existing.date == date_override.date,
            None => !self.entity_to_host.contains_key(&date_override.id),
        };
        if !reusable {
            return Err(EngineError::already_exists("override", date_override.id));
        }
        if !guard.overrides.contains_key(&date_override.date)
            && guard.overrides.len() >= MAX_OVERRIDES_PER_HOST
        {
            return Err(EngineError::LimitExceeded("too many overrides on host"));
        }
        let event = Event::OverrideSet { date_override };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_date_override(&self, id: Ulid) -> Result<NaiveDate, EngineError> {
        let (_gate, mut guard) = self.resolve_entity_write("override", &id).await?;
        let date = guard
            .override_by_id(&id)
            .map(|o| o.date)
            .ok_or_else(|| EngineError::not_found("override", id))?;
        let event = Event::OverrideRemoved {
            id,
            host_id: guard.id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(date)
    }

    /// Reserve `[start, start + duration)` for an attendee.
    ///
    /// The overlap check, WAL append and apply run on their own task under
    /// the host's write lock, so a caller that gives up mid-claim cannot
    /// leave the log and memory disagreeing.
    pub async fn claim(self: &Arc<Self>, req: ClaimRequest) -> Result<Booking, EngineError> {
        let result = self.claim_inner(req).await;
        metrics::counter!(observability::CLAIMS_TOTAL, "outcome" => claim_outcome(&result))
            .increment(1);
        result
    }

    async fn claim_inner(self: &Arc<Self>, req: ClaimRequest) -> Result<Booking, EngineError> {
        validate::attendee_name(&req.attendee_name)?;
        validate::email(&req.attendee_email)?;
        if let Some(ref notes) = req.attendee_notes {
            validate::check_len("attendee notes too long", notes, MAX_NOTES_LEN)?;
        }

        let event_type = self
            .get_event_type(&req.event_type_id)
            .ok_or_else(|| EngineError::not_found("event type", req.event_type_id))?;
        if !event_type.is_active {
            return Err(EngineError::validation("event type is not active"));
        }

        let start = to_ms(req.start);
        let span = Span {
            start,
            end: start + event_type.duration_ms(),
        };
        validate_span(&span)?;
        if span.start <= self.now_ms() {
            return Err(EngineError::validation("start time is in the past"));
        }

        let external = match &self.busy {
            Some(busy) => busy.busy_intervals(event_type.host_id, span).await?,
            None => Vec::new(),
        };

        let engine = Arc::clone(self);
        let task = tokio::spawn(async move {
            let (_gate, mut guard) = engine.lock_host(event_type.host_id).await?;
            if guard.bookings.len() >= MAX_BOOKINGS_PER_HOST {
                return Err(EngineError::LimitExceeded("too many bookings on host"));
            }
            if let Err(e) = check_no_conflict(&guard, &span, &external) {
                debug!(event_type_id = %event_type.id, %span, "claim conflict");
                return Err(e);
            }

            let id = req.id.unwrap_or_else(Ulid::new);
            if engine.entity_to_host.contains_key(&id) {
                return Err(EngineError::already_exists("booking", id));
            }
            let booking = Booking {
                id,
                event_type_id: event_type.id,
                host_id: event_type.host_id,
                attendee_name: req.attendee_name.trim().to_string(),
                attendee_email: req.attendee_email,
                attendee_notes: req.attendee_notes.filter(|n| !n.is_empty()),
                span,
                status: BookingStatus::Confirmed,
                timezone: req.timezone,
                meeting_url: meeting_link(&event_type, id),
                cancellation_reason: None,
            };
            let event = Event::BookingCreated {
                booking: booking.clone(),
            };
            engine.persist_and_apply(&mut guard, &event).await?;
            info!(booking_id = %id, host_id = %booking.host_id, %span, "booking confirmed");
            Ok(booking)
        });
        task.await
            .map_err(|e| EngineError::WalError(format!("claim task failed: {e}")))?
    }

    /// Move a confirmed booking to cancelled. One-way.
    pub async fn cancel_booking(
        self: &Arc<Self>,
        id: Ulid,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        if let Some(ref r) = reason {
            validate::check_len("cancellation reason too long", r, MAX_NOTES_LEN)?;
        }
        let engine = Arc::clone(self);
        let task = tokio::spawn(async move {
            let (_gate, mut guard) = engine.resolve_entity_write("booking", &id).await?;
            let booking = guard
                .booking(&id)
                .ok_or_else(|| EngineError::not_found("booking", id))?;
            if booking.status == BookingStatus::Cancelled {
                return Err(EngineError::InvalidState(format!(
                    "booking {id} is already cancelled"
                )));
            }
            let event = Event::BookingCancelled {
                id,
                host_id: guard.id,
                reason,
            };
            engine.persist_and_apply(&mut guard, &event).await?;
            info!(booking_id = %id, "booking cancelled");
            guard
                .booking(&id)
                .cloned()
                .ok_or_else(|| EngineError::not_found("booking", id))
        });
        task.await
            .map_err(|e| EngineError::WalError(format!("cancel task failed: {e}")))?
    }

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.persist_gate.write().await;

        let mut host_ids: Vec<Ulid> = self.hosts.iter().map(|e| *e.key()).collect();
        host_ids.sort();
        let mut events = Vec::new();
        for host_id in host_ids {
            let Some(hs) = self.get_host(&host_id) else {
                continue;
            };
            let guard = hs.read().await;
            events.push(Event::HostCreated {
                id: guard.id,
                username: guard.username.clone(),
                name: guard.name.clone(),
                timezone: guard.timezone,
            });
            let mut event_types: Vec<EventType> = self
                .event_types
                .iter()
                .filter(|e| e.host_id == host_id)
                .map(|e| e.value().clone())
                .collect();
            event_types.sort_by_key(|et| et.id);
            events.extend(
                event_types
                    .into_iter()
                    .map(|event_type| Event::EventTypeCreated { event_type }),
            );
            events.extend(guard.rules.iter().cloned().map(|rule| Event::RuleAdded { rule }));
            events.extend(
                guard
                    .overrides
                    .values()
                    .cloned()
                    .map(|date_override| Event::OverrideSet { date_override }),
            );
            events.extend(
                guard
                    .bookings
                    .iter()
                    .cloned()
                    .map(|booking| Event::BookingCreated { booking }),
            );
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
