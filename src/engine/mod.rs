mod availability;
mod bookings;
mod conflict;
mod error;
mod holds;
mod overlap;
mod reschedule;
mod sessions;

pub use availability::slots_in_window;
pub use bookings::{NewBooking, TransitionFields};
pub use conflict::now_ms;
pub use error::EngineError;
pub use holds::CommitFields;
pub use overlap::subtract;
pub use reschedule::Move;
pub use sessions::NewSession;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, NaiveDate, Offset, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notification, NotificationKind, NotificationSink};
use crate::observability::{NOTIFY_FAILURES_TOTAL, STORE_RETRIES_TOTAL};
use crate::store::Store;

use conflict::check_no_conflict;

/// Bounded retry for idempotent store calls. Attempt `n` (1-based) waits
/// `backoff * 2^(n-1)` first.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            backoff: Duration::ZERO,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The studio's wall clock. Working hours and dates are read in it.
    pub utc_offset: FixedOffset,
    pub default_hold_ttl: Duration,
    pub max_hold_ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            utc_offset: Utc.fix(),
            default_hold_ttl: Duration::from_secs(600),
            max_hold_ttl: Duration::from_secs(3600),
            retry: RetryPolicy::default(),
        }
    }
}

/// One async mutex per resource. Every check-then-write on a resource's
/// calendar runs under its lock.
#[derive(Default)]
pub(crate) struct ResourceLocks {
    locks: DashMap<Ulid, Arc<Mutex<()>>>,
}

impl ResourceLocks {
    pub(crate) async fn lock(&self, resource_id: Ulid) -> OwnedMutexGuard<()> {
        let mutex = self.locks.entry(resource_id).or_default().value().clone();
        mutex.lock_owned().await
    }

    /// Lock several resources in ascending id order so concurrent callers
    /// cannot deadlock.
    pub(crate) async fn lock_many(&self, resource_ids: &[Ulid]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids = resource_ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.lock(id).await);
        }
        guards
    }
}

pub struct Engine {
    store: Arc<dyn Store>,
    sink: Arc<dyn NotificationSink>,
    locks: ResourceLocks,
    config: EngineConfig,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, sink: Arc<dyn NotificationSink>, config: EngineConfig) -> Self {
        Self {
            store,
            sink,
            locks: ResourceLocks::default(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Today's date on the studio's clock.
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.config.utc_offset).date_naive()
    }

    /// Run `op`, retrying store failures per the retry policy. Only for
    /// operations that are safe to repeat.
    pub(super) async fn with_retry<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let policy = self.config.retry;
        let mut attempt = 0;
        loop {
            match f().await {
                Err(EngineError::Store(e)) if attempt < policy.retries => {
                    attempt += 1;
                    let delay = policy.delay(attempt);
                    warn!(op, attempt, error = %e, "store error, retrying in {delay:?}");
                    metrics::counter!(STORE_RETRIES_TOTAL, "op" => op).increment(1);
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Load a resource that accepts new occupants.
    pub(super) async fn active_resource(&self, id: Ulid) -> Result<Resource, EngineError> {
        let resource = self.store.resource(id).await?.ok_or(EngineError::NotFound(id))?;
        if !resource.active {
            return Err(EngineError::InvalidState { id, status: "inactive" });
        }
        Ok(resource)
    }

    /// Caller must hold the resource's lock.
    pub(super) async fn ensure_free(
        &self,
        resource_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
        now: Ms,
    ) -> Result<(), EngineError> {
        let busy = self.store.busy_intervals(resource_id, span, now).await?;
        check_no_conflict(&busy, &span, exclude)
    }

    /// Read a booking and lock its resource (plus `also`, if given). The
    /// returned booking is re-read under the lock.
    pub(super) async fn lock_booking(
        &self,
        id: Ulid,
        also: Option<Ulid>,
    ) -> Result<(Booking, Vec<OwnedMutexGuard<()>>), EngineError> {
        loop {
            let seen = self.store.booking(id).await?.ok_or(EngineError::NotFound(id))?;
            let mut ids = vec![seen.resource_id];
            ids.extend(also);
            let guards = self.locks.lock_many(&ids).await;
            let booking = self.store.booking(id).await?.ok_or(EngineError::NotFound(id))?;
            if booking.resource_id == seen.resource_id {
                return Ok((booking, guards));
            }
            debug!(booking_id = %id, "booking moved while locking, retrying");
        }
    }

    pub(super) async fn lock_session(
        &self,
        id: Ulid,
        also: Option<Ulid>,
    ) -> Result<(Session, Vec<OwnedMutexGuard<()>>), EngineError> {
        loop {
            let seen = self.store.session(id).await?.ok_or(EngineError::NotFound(id))?;
            let mut ids = vec![seen.resource_id];
            ids.extend(also);
            let guards = self.locks.lock_many(&ids).await;
            let session = self.store.session(id).await?.ok_or(EngineError::NotFound(id))?;
            if session.resource_id == seen.resource_id {
                return Ok((session, guards));
            }
            debug!(session_id = %id, "session moved while locking, retrying");
        }
    }

    /// Hand a decision to the notification sink. Failures are logged, never
    /// propagated.
    pub(super) fn emit(
        &self,
        kind: NotificationKind,
        booking: &Booking,
        actor: &Actor,
        fields: Map<String, Value>,
    ) {
        let notification = Notification {
            kind,
            booking_id: booking.id,
            resource_id: booking.resource_id,
            actor_id: actor.id,
            fields,
        };
        if let Err(e) = self.sink.notify(&notification) {
            warn!(booking_id = %booking.id, ?kind, error = %e, "notification failed");
            metrics::counter!(NOTIFY_FAILURES_TOTAL).increment(1);
        }
    }

    /// Delete holds that expired at or before `now`. Each hold is re-checked
    /// under its resource lock, so one renewed or committed in the meantime
    /// survives. Returns how many were deleted.
    pub async fn sweep_expired_holds(&self, now: Ms) -> Result<usize, EngineError> {
        let expired = self.store.expired_holds(now).await?;
        let mut reaped = 0;
        for hold in expired {
            let _guard = self.locks.lock(hold.resource_id).await;
            let current = match self.store.hold(hold.id).await {
                Ok(current) => current,
                Err(e) => {
                    warn!(hold_id = %hold.id, error = %e, "sweep: lookup failed");
                    continue;
                }
            };
            if !matches!(current, Some(ref h) if !h.is_live(now)) {
                continue;
            }
            match self.store.delete_hold(hold.id).await {
                Ok(true) => {
                    debug!(hold_id = %hold.id, resource_id = %hold.resource_id, "reaped expired hold");
                    reaped += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(hold_id = %hold.id, error = %e, "sweep: delete failed"),
            }
        }
        if reaped > 0 {
            metrics::counter!(crate::observability::HOLDS_REAPED_TOTAL).increment(reaped as u64);
        }
        Ok(reaped)
    }
}

pub(super) fn fields<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect()
}
