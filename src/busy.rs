//! External calendar busy intervals.
//!
//! A calendar-sync collaborator pushes the host's third-party busy blocks
//! here. Both the slot listing and the claim treat them exactly like
//! confirmed bookings.

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::MAX_BUSY_INTERVALS_PER_HOST;
use crate::model::Span;

#[async_trait]
pub trait BusySource: Send + Sync {
    /// Busy intervals of `host_id` overlapping `window`.
    async fn busy_intervals(&self, host_id: Ulid, window: Span) -> Result<Vec<Span>, EngineError>;
}

#[derive(Debug, Default)]
pub struct InMemoryBusyCalendar {
    by_host: DashMap<Ulid, Vec<Span>>,
}

impl InMemoryBusyCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, host_id: Ulid, span: Span) -> Result<(), EngineError> {
        let mut entry = self.by_host.entry(host_id).or_default();
        if entry.len() >= MAX_BUSY_INTERVALS_PER_HOST {
            return Err(EngineError::LimitExceeded("too many busy intervals for host"));
        }
        let pos = entry.partition_point(|s| s.start <= span.start);
        entry.insert(pos, span);
        Ok(())
    }

    /// Drop every interval of `host_id`. Returns how many were removed.
    pub fn clear(&self, host_id: &Ulid) -> usize {
        self.by_host
            .remove(host_id)
            .map(|(_, spans)| spans.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl BusySource for InMemoryBusyCalendar {
    async fn busy_intervals(&self, host_id: Ulid, window: Span) -> Result<Vec<Span>, EngineError> {
        Ok(self
            .by_host
            .get(&host_id)
            .map(|spans| {
                spans
                    .iter()
                    .filter(|s| s.overlaps(&window))
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok, block_on};

    #[test]
    fn window_filter_is_half_open() {
        let cal = InMemoryBusyCalendar::new();
        let host = Ulid::new();
        assert_ok!(cal.push(host, Span::new(300, 400)));
        assert_ok!(cal.push(host, Span::new(100, 200)));

        let hits = assert_ok!(block_on(cal.busy_intervals(host, Span::new(200, 300))));
        assert!(hits.is_empty());
        let hits = assert_ok!(block_on(cal.busy_intervals(host, Span::new(150, 350))));
        assert_eq!(hits, vec![Span::new(100, 200), Span::new(300, 400)]);
    }

    #[test]
    fn clear_is_per_host() {
        let cal = InMemoryBusyCalendar::new();
        let (a, b) = (Ulid::new(), Ulid::new());
        assert_ok!(cal.push(a, Span::new(0, 10)));
        assert_ok!(cal.push(b, Span::new(0, 10)));
        assert_eq!(cal.clear(&a), 1);
        assert_eq!(cal.clear(&a), 0);
        assert!(assert_ok!(block_on(cal.busy_intervals(a, Span::new(0, 10)))).is_empty());
        assert_eq!(assert_ok!(block_on(cal.busy_intervals(b, Span::new(0, 10)))).len(), 1);
    }

    #[test]
    fn push_stops_at_host_limit() {
        let cal = InMemoryBusyCalendar::new();
        let host = Ulid::new();
        for i in 0..MAX_BUSY_INTERVALS_PER_HOST as i64 {
            assert_ok!(cal.push(host, Span::new(i * 10, i * 10 + 5)));
        }
        let err = assert_err!(cal.push(host, Span::new(-10, -5)));
        assert!(matches!(err, EngineError::LimitExceeded(_)));
        assert_ok!(cal.push(Ulid::new(), Span::new(0, 5)));
    }
}
