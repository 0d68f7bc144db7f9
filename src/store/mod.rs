//! Persistence seam. The engine talks to storage only through [`Store`].

mod memory;
mod writer;

pub use memory::MemoryStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Transactional storage for resources, holds, bookings and sessions.
///
/// Every method is atomic on its own. Multi-step check-then-write sequences
/// are serialized per resource by the engine, not by the store.
#[async_trait]
pub trait Store: Send + Sync {
    async fn resource(&self, id: Ulid) -> Result<Option<Resource>, StoreError>;

    async fn put_resource(&self, resource: Resource) -> Result<(), StoreError>;

    /// Live occupants of `resource_id` overlapping `window`: holds with
    /// `expires_at > now`, live bookings and live sessions.
    async fn busy_intervals(
        &self,
        resource_id: Ulid,
        window: Span,
        now: Ms,
    ) -> Result<Vec<Busy>, StoreError>;

    async fn hold(&self, id: Ulid) -> Result<Option<Hold>, StoreError>;

    /// Lookup by idempotency key. Returns expired holds too.
    async fn hold_by_token(&self, owner_id: Ulid, token: &str) -> Result<Option<Hold>, StoreError>;

    async fn put_hold(&self, hold: Hold) -> Result<(), StoreError>;

    /// Returns whether a hold was removed.
    async fn delete_hold(&self, id: Ulid) -> Result<bool, StoreError>;

    /// Delete the hold and insert the booking as one write. Returns `false`
    /// (and writes nothing) if the hold is already gone.
    async fn commit_hold(&self, hold_id: Ulid, booking: Booking) -> Result<bool, StoreError>;

    async fn expired_holds(&self, now: Ms) -> Result<Vec<Hold>, StoreError>;

    async fn booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError>;

    async fn put_booking(&self, booking: Booking) -> Result<(), StoreError>;

    async fn session(&self, id: Ulid) -> Result<Option<Session>, StoreError>;

    async fn put_session(&self, session: Session) -> Result<(), StoreError>;
}
