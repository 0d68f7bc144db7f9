use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::NotificationKind;
use crate::observability::{CONFLICTS_TOTAL, HOLDS_COMMITTED_TOTAL, HOLDS_CREATED_TOTAL};

use super::conflict::{duration_ms, now_ms, validate_span, validate_text};
use super::{fields, Engine, EngineError};

/// Booking attributes supplied when a hold is committed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CommitFields {
    /// `held` or `confirmed`.
    pub status: BookingStatus,
    /// Defaults to the hold's owner. Clients may only name themselves.
    pub client_id: Option<Ulid>,
    /// Staff only.
    pub price: Option<i64>,
    /// Staff only.
    pub paid_amount: i64,
    pub project_id: Option<Ulid>,
    pub label: Option<String>,
}

impl Default for CommitFields {
    fn default() -> Self {
        Self {
            status: BookingStatus::Held,
            client_id: None,
            price: None,
            paid_amount: 0,
            project_id: None,
            label: None,
        }
    }
}

impl Engine {
    fn validate_ttl(&self, ttl: Duration) -> Result<(), EngineError> {
        if ttl.is_zero() {
            return Err(EngineError::InvalidInput("ttl must be positive"));
        }
        if ttl > self.config.max_hold_ttl {
            return Err(EngineError::LimitExceeded("ttl above maximum"));
        }
        Ok(())
    }

    /// Place a short-lived claim on `span`. Repeating a request with the same
    /// `(owner_id, token)` returns the live hold it created.
    pub async fn create_hold(
        &self,
        resource_id: Ulid,
        span: Span,
        owner_id: Ulid,
        token: &str,
        ttl: Duration,
    ) -> Result<Hold, EngineError> {
        validate_span(&span)?;
        self.validate_ttl(ttl)?;
        if token.is_empty() {
            return Err(EngineError::InvalidInput("token must not be empty"));
        }
        if token.len() > MAX_TOKEN_LEN {
            return Err(EngineError::LimitExceeded("token too long"));
        }

        self.with_retry("create_hold", || {
            self.try_create_hold(resource_id, span, owner_id, token, ttl)
        })
        .await
    }

    async fn try_create_hold(
        &self,
        resource_id: Ulid,
        span: Span,
        owner_id: Ulid,
        token: &str,
        ttl: Duration,
    ) -> Result<Hold, EngineError> {
        self.active_resource(resource_id).await?;
        let _guard = self.locks.lock(resource_id).await;
        let now = now_ms();

        if let Some(existing) = self.store.hold_by_token(owner_id, token).await?
            && existing.is_live(now)
        {
            if existing.resource_id == resource_id && existing.span == span {
                debug!(hold_id = %existing.id, "hold replayed by token");
                return Ok(existing);
            }
            return Err(EngineError::InvalidInput("token already used for another hold"));
        }

        if let Err(e) = self.ensure_free(resource_id, span, None, now).await {
            if matches!(e, EngineError::Conflict(_)) {
                metrics::counter!(CONFLICTS_TOTAL, "op" => "create_hold").increment(1);
            }
            return Err(e);
        }

        let hold = Hold {
            id: Ulid::new(),
            resource_id,
            span,
            owner_id,
            token: token.to_owned(),
            created_at: now,
            expires_at: now.saturating_add(duration_ms(ttl)),
        };
        self.store.put_hold(hold.clone()).await?;
        metrics::counter!(HOLDS_CREATED_TOTAL).increment(1);
        debug!(hold_id = %hold.id, %resource_id, %span, "hold placed");
        Ok(hold)
    }

    /// Push a live hold's expiry to `now + ttl`. Never shortens it.
    pub async fn renew_hold(&self, hold_id: Ulid, ttl: Duration, actor: &Actor) -> Result<Hold, EngineError> {
        self.validate_ttl(ttl)?;
        self.with_retry("renew_hold", || self.try_renew_hold(hold_id, ttl, actor))
            .await
    }

    async fn try_renew_hold(&self, hold_id: Ulid, ttl: Duration, actor: &Actor) -> Result<Hold, EngineError> {
        let seen = self.store.hold(hold_id).await?.ok_or(EngineError::NotFound(hold_id))?;
        let _guard = self.locks.lock(seen.resource_id).await;
        let mut hold = self.store.hold(hold_id).await?.ok_or(EngineError::NotFound(hold_id))?;
        authorize_hold(actor, &hold)?;

        let now = now_ms();
        if !hold.is_live(now) {
            return Err(EngineError::Expired(hold_id));
        }
        hold.expires_at = hold.expires_at.max(now.saturating_add(duration_ms(ttl)));
        self.store.put_hold(hold.clone()).await?;
        debug!(%hold_id, expires_at = hold.expires_at, "hold renewed");
        Ok(hold)
    }

    /// Drop a hold. Releasing one that is already gone succeeds.
    pub async fn release_hold(&self, hold_id: Ulid, actor: &Actor) -> Result<(), EngineError> {
        self.with_retry("release_hold", || self.try_release_hold(hold_id, actor))
            .await
    }

    async fn try_release_hold(&self, hold_id: Ulid, actor: &Actor) -> Result<(), EngineError> {
        let Some(seen) = self.store.hold(hold_id).await? else {
            return Ok(());
        };
        authorize_hold(actor, &seen)?;
        let _guard = self.locks.lock(seen.resource_id).await;
        if self.store.delete_hold(hold_id).await? {
            debug!(%hold_id, "hold released");
        }
        Ok(())
    }

    /// Turn a live hold into a booking. The hold is deleted and the booking
    /// inserted as one store write; on any error neither happens.
    ///
    /// Not retried: a store failure is returned to the caller.
    pub async fn commit_hold(
        &self,
        hold_id: Ulid,
        commit: CommitFields,
        actor: &Actor,
    ) -> Result<Booking, EngineError> {
        if !matches!(commit.status, BookingStatus::Held | BookingStatus::Confirmed) {
            return Err(EngineError::InvalidInput("a committed hold becomes held or confirmed"));
        }
        if commit.paid_amount < 0 {
            return Err(EngineError::InvalidInput("paid amount must not be negative"));
        }
        validate_text(commit.label.as_deref(), MAX_LABEL_LEN, "label too long")?;

        let seen = self.store.hold(hold_id).await?.ok_or(EngineError::NotFound(hold_id))?;
        let _guard = self.locks.lock(seen.resource_id).await;
        let hold = self.store.hold(hold_id).await?.ok_or(EngineError::NotFound(hold_id))?;
        authorize_hold(actor, &hold)?;
        authorize_commit(actor, &hold, &commit)?;

        let now = now_ms();
        if !hold.is_live(now) {
            // Reclaim eagerly; the sweeper would get it anyway.
            if let Err(e) = self.store.delete_hold(hold_id).await {
                debug!(%hold_id, error = %e, "could not delete expired hold");
            }
            return Err(EngineError::Expired(hold_id));
        }
        if let Err(e) = self.ensure_free(hold.resource_id, hold.span, Some(hold.id), now).await {
            if matches!(e, EngineError::Conflict(_)) {
                metrics::counter!(CONFLICTS_TOTAL, "op" => "commit_hold").increment(1);
            }
            return Err(e);
        }

        let booking = Booking {
            id: Ulid::new(),
            resource_id: hold.resource_id,
            client_id: commit.client_id.unwrap_or(hold.owner_id),
            span: hold.span,
            status: commit.status,
            price: commit.price,
            paid_amount: commit.paid_amount,
            project_id: commit.project_id,
            label: commit.label,
            reschedule_count: 0,
            last_rescheduled_at: None,
            cancelled_by: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
        };
        if !self.store.commit_hold(hold.id, booking.clone()).await? {
            return Err(EngineError::NotFound(hold.id));
        }

        metrics::counter!(HOLDS_COMMITTED_TOTAL).increment(1);
        info!(booking_id = %booking.id, %hold_id, resource_id = %booking.resource_id, status = %booking.status, "hold committed");
        self.emit(
            NotificationKind::BookingCreated,
            &booking,
            actor,
            fields([
                ("status", json!(booking.status)),
                ("hold_id", json!(hold.id)),
                ("start", json!(booking.span.start)),
                ("end", json!(booking.span.end)),
            ]),
        );
        Ok(booking)
    }
}

/// Booking ownership and money fields are staff only.
fn authorize_commit(actor: &Actor, hold: &Hold, commit: &CommitFields) -> Result<(), EngineError> {
    if actor.role.is_staff() {
        return Ok(());
    }
    let foreign_client = commit.client_id.is_some_and(|id| id != hold.owner_id);
    if foreign_client || commit.price.is_some() || commit.paid_amount != 0 {
        return Err(EngineError::Forbidden(*actor));
    }
    Ok(())
}

/// Holds belong to their owner; staff may act on any of them.
fn authorize_hold(actor: &Actor, hold: &Hold) -> Result<(), EngineError> {
    if actor.role.is_staff() || actor.id == hold.owner_id {
        Ok(())
    } else {
        Err(EngineError::Forbidden(*actor))
    }
}
