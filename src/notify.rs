use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::model::Booking;

const CHANNEL_CAPACITY: usize = 1024;

/// Booking lifecycle notifications, sent after the change is durable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    BookingCreated { booking: Booking },
    BookingCancelled { booking: Booking },
}

impl Notification {
    pub fn booking(&self) -> &Booking {
        match self {
            Notification::BookingCreated { booking } | Notification::BookingCancelled { booking } => {
                booking
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Notification::BookingCreated { .. } => "booking_created",
            Notification::BookingCancelled { .. } => "booking_cancelled",
        }
    }
}

/// Fire-and-forget broadcast of booking notifications.
pub struct NotifyHub {
    sender: broadcast::Sender<Notification>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, notification: Notification) {
        let _ = self.sender.send(notification);
    }
}

/// Drain the hub and hand each notification to the outbound mail
/// collaborator. Delivery is external; here the payload is logged as JSON.
pub async fn run_dispatcher(mut rx: broadcast::Receiver<Notification>) {
    loop {
        match rx.recv().await {
            Ok(notification) => match serde_json::to_string(&notification) {
                Ok(payload) => info!(
                    kind = notification.kind(),
                    booking_id = %notification.booking().id,
                    %payload,
                    "notification dispatched"
                ),
                Err(e) => warn!("notification encode failed: {e}"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("notification dispatcher lagged, {skipped} dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookingStatus, Span};
    use chrono_tz::Tz;
    use ulid::Ulid;

    fn booking() -> Booking {
        Booking {
            id: Ulid::new(),
            event_type_id: Ulid::new(),
            host_id: Ulid::new(),
            attendee_name: "Grace".into(),
            attendee_email: "grace@example.com".into(),
            attendee_notes: None,
            span: Span::new(1_000, 2_000),
            status: BookingStatus::Confirmed,
            timezone: Tz::UTC,
            meeting_url: None,
            cancellation_reason: None,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe();
        let n = Notification::BookingCreated { booking: booking() };
        hub.send(n.clone());
        assert_eq!(rx.recv().await.unwrap(), n);
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        NotifyHub::new().send(Notification::BookingCancelled { booking: booking() });
    }

    #[test]
    fn payload_is_tagged_json() {
        let n = Notification::BookingCreated { booking: booking() };
        let json: serde_json::Value = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "booking_created");
        assert_eq!(json["booking"]["status"], "confirmed");
        assert_eq!(json["booking"]["attendee_email"], "grace@example.com");
    }
}
