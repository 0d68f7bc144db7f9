use std::io;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use super::writer::WalHandle;
use super::{Store, StoreError};

#[derive(Debug, Clone, Copy)]
struct Entry {
    busy: Busy,
    /// Set for holds only.
    expires_at: Option<Ms>,
}

impl Entry {
    fn hold(h: &Hold) -> Self {
        Self {
            busy: Busy { id: h.id, kind: OccupantKind::Hold, span: h.span },
            expires_at: Some(h.expires_at),
        }
    }

    fn booking(b: &Booking) -> Option<Self> {
        b.is_live().then(|| Self {
            busy: Busy { id: b.id, kind: OccupantKind::Booking, span: b.span },
            expires_at: None,
        })
    }

    fn session(s: &Session) -> Option<Self> {
        s.is_live().then(|| Self {
            busy: Busy { id: s.id, kind: OccupantKind::Session, span: s.span },
            expires_at: None,
        })
    }

    fn is_live(&self, now: Ms) -> bool {
        self.expires_at.is_none_or(|exp| exp > now)
    }
}

/// Occupants of one resource, sorted by `span.start`.
#[derive(Debug, Default)]
struct Calendar {
    entries: Vec<Entry>,
}

impl Calendar {
    fn insert(&mut self, entry: Entry) {
        let pos = self
            .entries
            .binary_search_by_key(&entry.busy.span.start, |e| e.busy.span.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, entry);
    }

    fn remove(&mut self, id: Ulid) -> Option<Entry> {
        let pos = self.entries.iter().position(|e| e.busy.id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Entries whose span overlaps `query`. Everything at or past the
    /// partition point starts at or after `query.end` and can't overlap.
    fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Entry> {
        let right_bound = self.entries.partition_point(|e| e.busy.span.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.busy.span.end > query.start)
    }
}

/// In-memory store, optionally made durable by a write-ahead log.
///
/// Every mutation is appended to the WAL (when present) before it is applied
/// in memory, so a failed append leaves state untouched.
pub struct MemoryStore {
    resources: DashMap<Ulid, Resource>,
    calendars: DashMap<Ulid, Calendar>,
    holds: DashMap<Ulid, Hold>,
    /// (owner, token) → hold id
    tokens: DashMap<(Ulid, String), Ulid>,
    bookings: DashMap<Ulid, Booking>,
    sessions: DashMap<Ulid, Session>,
    wal: Option<WalHandle>,
    /// Writers hold this shared across append + apply; compaction holds it
    /// exclusively across snapshot + rewrite.
    gate: RwLock<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A volatile store with no WAL.
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            calendars: DashMap::new(),
            holds: DashMap::new(),
            tokens: DashMap::new(),
            bookings: DashMap::new(),
            sessions: DashMap::new(),
            wal: None,
            gate: RwLock::new(()),
        }
    }

    /// Replay the WAL at `path` and keep appending to it. Spawns the writer
    /// task, so this must run inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let mut store = Self::new();
        let replayed = events.len();
        for event in events {
            store.apply(event);
        }
        store.wal = Some(WalHandle::spawn(wal));
        info!(path = %path.display(), replayed, "store opened");
        Ok(store)
    }

    pub fn is_durable(&self) -> bool {
        self.wal.is_some()
    }

    async fn persist(&self, event: Event) -> Result<(), StoreError> {
        let _gate = self.gate.read().await;
        if let Some(wal) = &self.wal {
            wal.append(event.clone()).await?;
        }
        self.apply(event);
        Ok(())
    }

    fn apply(&self, event: Event) {
        match event {
            Event::ResourceSaved(resource) => {
                self.calendars.entry(resource.id).or_default();
                self.resources.insert(resource.id, resource);
            }
            Event::HoldSaved(hold) => {
                self.place(hold.id, None, hold.resource_id, Some(Entry::hold(&hold)));
                self.tokens.insert((hold.owner_id, hold.token.clone()), hold.id);
                self.holds.insert(hold.id, hold);
            }
            Event::HoldDeleted { id, resource_id } => {
                if let Some(mut cal) = self.calendars.get_mut(&resource_id) {
                    cal.remove(id);
                }
                self.forget_hold(id);
            }
            Event::HoldCommitted { hold_id, booking } => {
                {
                    let mut cal = self.calendars.entry(booking.resource_id).or_default();
                    cal.remove(hold_id);
                    cal.remove(booking.id);
                    if let Some(entry) = Entry::booking(&booking) {
                        cal.insert(entry);
                    }
                }
                self.forget_hold(hold_id);
                self.bookings.insert(booking.id, booking);
            }
            Event::BookingSaved(booking) => {
                let previous = self.bookings.get(&booking.id).map(|b| b.resource_id);
                self.place(booking.id, previous, booking.resource_id, Entry::booking(&booking));
                self.bookings.insert(booking.id, booking);
            }
            Event::SessionSaved(session) => {
                let previous = self.sessions.get(&session.id).map(|s| s.resource_id);
                self.place(session.id, previous, session.resource_id, Entry::session(&session));
                self.sessions.insert(session.id, session);
            }
        }
    }

    fn forget_hold(&self, id: Ulid) {
        if let Some((_, hold)) = self.holds.remove(&id) {
            self.tokens.remove_if(&(hold.owner_id, hold.token), |_, hid| *hid == id);
        }
    }

    /// Put `id` on `resource_id`'s calendar (or take it off when `entry` is
    /// `None`), removing it from the calendar it used to be on.
    fn place(&self, id: Ulid, previous: Option<Ulid>, resource_id: Ulid, entry: Option<Entry>) {
        if let Some(prev) = previous.filter(|p| *p != resource_id)
            && let Some(mut cal) = self.calendars.get_mut(&prev)
        {
            cal.remove(id);
        }
        let mut cal = self.calendars.entry(resource_id).or_default();
        cal.remove(id);
        if let Some(entry) = entry {
            cal.insert(entry);
        }
    }

    /// Current state as the minimal record list that recreates it.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .resources
            .iter()
            .map(|r| Event::ResourceSaved(r.value().clone()))
            .collect();
        events.extend(self.holds.iter().map(|h| Event::HoldSaved(h.value().clone())));
        events.extend(self.bookings.iter().map(|b| Event::BookingSaved(b.value().clone())));
        events.extend(self.sessions.iter().map(|s| Event::SessionSaved(s.value().clone())));
        events
    }

    /// Rewrite the WAL from current state. No-op for a volatile store.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };
        let _gate = self.gate.write().await;
        let events = self.snapshot();
        let records = events.len();
        wal.compact(events).await?;
        info!(records, "WAL compacted");
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        match &self.wal {
            Some(wal) => wal.appends_since_compact().await,
            None => 0,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn resource(&self, id: Ulid) -> Result<Option<Resource>, StoreError> {
        Ok(self.resources.get(&id).map(|r| r.value().clone()))
    }

    async fn put_resource(&self, resource: Resource) -> Result<(), StoreError> {
        self.persist(Event::ResourceSaved(resource)).await
    }

    async fn busy_intervals(
        &self,
        resource_id: Ulid,
        window: Span,
        now: Ms,
    ) -> Result<Vec<Busy>, StoreError> {
        let Some(cal) = self.calendars.get(&resource_id) else {
            return Ok(Vec::new());
        };
        Ok(cal
            .overlapping(&window)
            .filter(|e| e.is_live(now))
            .map(|e| e.busy)
            .collect())
    }

    async fn hold(&self, id: Ulid) -> Result<Option<Hold>, StoreError> {
        Ok(self.holds.get(&id).map(|h| h.value().clone()))
    }

    async fn hold_by_token(&self, owner_id: Ulid, token: &str) -> Result<Option<Hold>, StoreError> {
        let Some(id) = self.tokens.get(&(owner_id, token.to_string())).map(|e| *e.value()) else {
            return Ok(None);
        };
        Ok(self.holds.get(&id).map(|h| h.value().clone()))
    }

    async fn put_hold(&self, hold: Hold) -> Result<(), StoreError> {
        self.persist(Event::HoldSaved(hold)).await
    }

    async fn delete_hold(&self, id: Ulid) -> Result<bool, StoreError> {
        let Some(resource_id) = self.holds.get(&id).map(|h| h.resource_id) else {
            return Ok(false);
        };
        self.persist(Event::HoldDeleted { id, resource_id }).await?;
        Ok(true)
    }

    async fn commit_hold(&self, hold_id: Ulid, booking: Booking) -> Result<bool, StoreError> {
        if !self.holds.contains_key(&hold_id) {
            return Ok(false);
        }
        self.persist(Event::HoldCommitted { hold_id, booking }).await?;
        Ok(true)
    }

    async fn expired_holds(&self, now: Ms) -> Result<Vec<Hold>, StoreError> {
        Ok(self
            .holds
            .iter()
            .filter(|h| !h.is_live(now))
            .map(|h| h.value().clone())
            .collect())
    }

    async fn booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        Ok(self.bookings.get(&id).map(|b| b.value().clone()))
    }

    async fn put_booking(&self, booking: Booking) -> Result<(), StoreError> {
        self.persist(Event::BookingSaved(booking)).await
    }

    async fn session(&self, id: Ulid) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.get(&id).map(|s| s.value().clone()))
    }

    async fn put_session(&self, session: Session) -> Result<(), StoreError> {
        self.persist(Event::SessionSaved(session)).await
    }
}
