mod conflict;
mod error;
pub mod grid;
mod mutations;
mod queries;
pub mod resolver;
mod validate;

pub use conflict::{available_slots, first_conflict};
pub use error::EngineError;
pub use grid::{generate_slots, local_to_utc};
pub use mutations::ClaimRequest;
pub use resolver::{IntervalSource, OpenInterval, Resolution, resolve, weekday_index};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, RwLockReadGuard, mpsc, oneshot};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::busy::BusySource;
use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::notify::{Notification, NotifyHub};
use crate::observability;
use crate::wal::Wal;

pub type SharedHostState = Arc<RwLock<HostState>>;

/// Write access to one host: the persist gate (shared) plus the host's
/// write lock. Always taken in that order.
pub(super) type HostWrite<'a> = (RwLockReadGuard<'a, ()>, OwnedRwLockWriteGuard<HostState>);

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Each wakeup takes one append, drains whatever else is
/// already queued, and commits the lot with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-buffered bytes do not ride
    // along with the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        warn!("WAL commit of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

pub struct Engine {
    pub(super) hosts: DashMap<Ulid, SharedHostState>,
    /// username → host id
    pub(super) usernames: DashMap<String, Ulid>,
    pub(super) event_types: DashMap<Ulid, EventType>,
    /// (host id, slug) → event type id
    pub(super) slugs: DashMap<(Ulid, String), Ulid>,
    /// Reverse lookup: rule/override/booking id → host id
    pub(super) entity_to_host: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held shared by every mutation from before its WAL append until after
    /// its apply. Compaction holds it exclusively, so its snapshot and the
    /// log swap see no half-applied change.
    pub(super) persist_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) busy: Option<Arc<dyn BusySource>>,
}

/// Apply a host-scoped event. Caller holds the host's write lock.
fn apply_to_host(hs: &mut HostState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::RuleAdded { rule } => {
            entity_map.insert(rule.id, hs.id);
            hs.rules.push(rule.clone());
        }
        Event::RuleRemoved { id, .. } => {
            hs.rules.retain(|r| r.id != *id);
            entity_map.remove(id);
        }
        Event::OverrideSet { date_override } => {
            entity_map.insert(date_override.id, hs.id);
            if let Some(replaced) = hs.overrides.insert(date_override.date, date_override.clone())
                && replaced.id != date_override.id
            {
                entity_map.remove(&replaced.id);
            }
        }
        Event::OverrideRemoved { id, .. } => {
            hs.overrides.retain(|_, o| o.id != *id);
            entity_map.remove(id);
        }
        Event::BookingCreated { booking } => {
            entity_map.insert(booking.id, hs.id);
            hs.insert_booking(booking.clone());
        }
        Event::BookingCancelled { id, reason, .. } => {
            if let Some(b) = hs.booking_mut(id) {
                b.status = BookingStatus::Cancelled;
                b.cancellation_reason = reason.clone();
            }
        }
        // Registry events are applied at the DashMap level, not here
        Event::HostCreated { .. }
        | Event::EventTypeCreated { .. }
        | Event::EventTypeDeactivated { .. } => {}
    }
}

/// The notification a just-applied event produces, if any.
fn notification_for(hs: &HostState, event: &Event) -> Option<Notification> {
    match event {
        Event::BookingCreated { booking } => hs
            .booking(&booking.id)
            .map(|b| Notification::BookingCreated { booking: b.clone() }),
        Event::BookingCancelled { id, .. } => hs
            .booking(id)
            .map(|b| Notification::BookingCancelled { booking: b.clone() }),
        _ => None,
    }
}

impl Engine {
    /// Open the engine over the WAL at `wal_path`, replaying it into memory.
    /// Must be called inside a tokio runtime: the WAL writer is spawned here.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            hosts: DashMap::new(),
            usernames: DashMap::new(),
            event_types: DashMap::new(),
            slugs: DashMap::new(),
            entity_to_host: DashMap::new(),
            wal_tx,
            persist_gate: RwLock::new(()),
            notify,
            clock: Arc::new(SystemClock),
            busy: None,
        };

        // Sole owner of every lock during replay, so try_write never contends.
        for event in &events {
            match event.host_id() {
                None => engine.apply_registry(event),
                Some(host_id) => {
                    let Some(hs) = engine.get_host(&host_id) else {
                        warn!(%host_id, "replay: event for unknown host skipped");
                        continue;
                    };
                    match hs.try_write() {
                        Ok(mut guard) => apply_to_host(&mut guard, event, &engine.entity_to_host),
                        Err(_) => warn!(%host_id, "replay: host state busy, event skipped"),
                    }
                }
            }
        }
        metrics::gauge!(observability::HOSTS_ACTIVE).set(engine.hosts.len() as f64);
        debug!(events = events.len(), hosts = engine.hosts.len(), "WAL replayed");

        Ok(engine)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_busy_source(mut self, busy: Arc<dyn BusySource>) -> Self {
        self.busy = Some(busy);
        self
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Apply a registry event (hosts and event types).
    fn apply_registry(&self, event: &Event) {
        match event {
            Event::HostCreated {
                id,
                username,
                name,
                timezone,
            } => {
                let hs = HostState::new(*id, username.clone(), name.clone(), *timezone);
                self.hosts.insert(*id, Arc::new(RwLock::new(hs)));
                self.usernames.insert(username.clone(), *id);
            }
            Event::EventTypeCreated { event_type } => {
                self.slugs
                    .insert((event_type.host_id, event_type.slug.clone()), event_type.id);
                self.event_types.insert(event_type.id, event_type.clone());
            }
            Event::EventTypeDeactivated { id } => {
                if let Some(mut et) = self.event_types.get_mut(id) {
                    et.is_active = false;
                }
            }
            _ => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_host(&self, id: &Ulid) -> Option<SharedHostState> {
        self.hosts.get(id).map(|e| e.value().clone())
    }

    pub fn get_host_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_host.get(entity_id).map(|e| *e.value())
    }

    pub fn get_event_type(&self, id: &Ulid) -> Option<EventType> {
        self.event_types.get(id).map(|e| e.value().clone())
    }

    /// Persist a registry event and apply it.
    pub(super) async fn persist_registry(&self, event: &Event) -> Result<(), EngineError> {
        let _gate = self.persist_gate.read().await;
        self.wal_append(event).await?;
        self.apply_registry(event);
        Ok(())
    }

    /// WAL-append, apply, then notify. Caller holds a `HostWrite`.
    pub(super) async fn persist_and_apply(
        &self,
        hs: &mut HostState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_host(hs, event, &self.entity_to_host);
        if let Some(n) = notification_for(hs, event) {
            self.notify.send(n);
        }
        Ok(())
    }

    pub(super) async fn lock_host(&self, host_id: Ulid) -> Result<HostWrite<'_>, EngineError> {
        let gate = self.persist_gate.read().await;
        let hs = self
            .get_host(&host_id)
            .ok_or_else(|| EngineError::not_found("host", host_id))?;
        Ok((gate, hs.write_owned().await))
    }

    /// Lookup entity → host, then lock that host for writing.
    pub(super) async fn resolve_entity_write(
        &self,
        kind: &'static str,
        entity_id: &Ulid,
    ) -> Result<HostWrite<'_>, EngineError> {
        let host_id = self
            .get_host_for_entity(entity_id)
            .ok_or_else(|| EngineError::not_found(kind, entity_id))?;
        self.lock_host(host_id).await
    }
}
