use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::NotificationKind;
use crate::observability::{CONFLICTS_TOTAL, TRANSITIONS_TOTAL};

use super::conflict::{now_ms, validate_span, validate_text};
use super::{fields, Engine, EngineError};

/// Side data recorded with a status change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransitionFields {
    /// Staff only.
    pub paid_amount: Option<i64>,
    pub cancel_reason: Option<String>,
    /// Staff only; defaults to the acting user.
    pub cancelled_by: Option<Ulid>,
}

/// A booking entered directly by staff, without a client hold.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewBooking {
    pub resource_id: Ulid,
    pub client_id: Ulid,
    pub span: Span,
    #[serde(default = "draft")]
    pub status: BookingStatus,
    #[serde(default)]
    pub price: Option<i64>,
    #[serde(default)]
    pub paid_amount: i64,
    #[serde(default)]
    pub project_id: Option<Ulid>,
    #[serde(default)]
    pub label: Option<String>,
}

fn draft() -> BookingStatus {
    BookingStatus::Draft
}

/// Clients may only cancel their own bookings. Staff and admins may drive
/// any allowed transition.
fn authorize_transition(
    actor: &Actor,
    booking: &Booking,
    next: BookingStatus,
    extra: &TransitionFields,
) -> Result<(), EngineError> {
    if actor.role.is_staff() {
        return Ok(());
    }
    let own_cancel = next == BookingStatus::Cancelled && booking.client_id == actor.id;
    if !own_cancel || extra.paid_amount.is_some() || extra.cancelled_by.is_some() {
        return Err(EngineError::Forbidden(*actor));
    }
    Ok(())
}

pub(super) fn require_staff(actor: &Actor) -> Result<(), EngineError> {
    if actor.role.is_staff() {
        Ok(())
    } else {
        Err(EngineError::Forbidden(*actor))
    }
}

impl Engine {
    /// Create or replace a resource and its working hours.
    pub async fn register_resource(&self, resource: Resource, actor: &Actor) -> Result<Resource, EngineError> {
        require_staff(actor)?;
        validate_text(resource.name.as_deref(), MAX_NAME_LEN, "name too long")?;
        let hours = &resource.hours;
        if hours.open >= hours.close {
            return Err(EngineError::InvalidInput("working hours must close after they open"));
        }
        if hours.step_minutes < MIN_STEP_MINUTES || hours.step_minutes > MAX_SLOT_MINUTES {
            return Err(EngineError::InvalidInput("step out of range"));
        }

        let _guard = self.locks.lock(resource.id).await;
        self.store.put_resource(resource.clone()).await?;
        info!(resource_id = %resource.id, active = resource.active, "resource saved");
        Ok(resource)
    }

    pub async fn get_resource(&self, id: Ulid) -> Result<Resource, EngineError> {
        self.with_retry("get_resource", || async move {
            self.store.resource(id).await?.ok_or(EngineError::NotFound(id))
        })
        .await
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.with_retry("get_booking", || async move {
            self.store.booking(id).await?.ok_or(EngineError::NotFound(id))
        })
        .await
    }

    /// Staff-entered booking. Starting in a live status claims the span.
    pub async fn create_booking(&self, new: NewBooking, actor: &Actor) -> Result<Booking, EngineError> {
        require_staff(actor)?;
        validate_span(&new.span)?;
        validate_text(new.label.as_deref(), MAX_LABEL_LEN, "label too long")?;
        if !matches!(
            new.status,
            BookingStatus::Draft | BookingStatus::Held | BookingStatus::Confirmed
        ) {
            return Err(EngineError::InvalidInput("a new booking starts as draft, held or confirmed"));
        }
        if new.paid_amount < 0 {
            return Err(EngineError::InvalidInput("paid amount must not be negative"));
        }

        self.active_resource(new.resource_id).await?;
        let _guard = self.locks.lock(new.resource_id).await;
        let now = now_ms();
        if new.status.is_live()
            && let Err(e) = self.ensure_free(new.resource_id, new.span, None, now).await
        {
            if matches!(e, EngineError::Conflict(_)) {
                metrics::counter!(CONFLICTS_TOTAL, "op" => "create_booking").increment(1);
            }
            return Err(e);
        }

        let booking = Booking {
            id: Ulid::new(),
            resource_id: new.resource_id,
            client_id: new.client_id,
            span: new.span,
            status: new.status,
            price: new.price,
            paid_amount: new.paid_amount,
            project_id: new.project_id,
            label: new.label,
            reschedule_count: 0,
            last_rescheduled_at: None,
            cancelled_by: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.store.put_booking(booking.clone()).await?;
        info!(booking_id = %booking.id, resource_id = %booking.resource_id, status = %booking.status, "booking created");
        self.emit(
            NotificationKind::BookingCreated,
            &booking,
            actor,
            fields([
                ("status", json!(booking.status)),
                ("start", json!(booking.span.start)),
                ("end", json!(booking.span.end)),
            ]),
        );
        Ok(booking)
    }

    /// Move a booking to `next` along the transition table.
    ///
    /// Repeating a terminal transition is a no-op success.
    /// Leaving `draft` for a live status re-checks the span. Not retried.
    pub async fn transition(
        &self,
        booking_id: Ulid,
        next: BookingStatus,
        actor: &Actor,
        extra: TransitionFields,
    ) -> Result<Booking, EngineError> {
        validate_text(extra.cancel_reason.as_deref(), MAX_REASON_LEN, "reason too long")?;
        if extra.paid_amount.is_some_and(|p| p < 0) {
            return Err(EngineError::InvalidInput("paid amount must not be negative"));
        }

        let (mut booking, _guards) = self.lock_booking(booking_id, None).await?;
        let from = booking.status;

        // Clients only ever see their own bookings, whatever the status.
        if !actor.role.is_staff() && booking.client_id != actor.id {
            return Err(EngineError::Forbidden(*actor));
        }
        // Only a terminal status can be re-applied; other same-status pairs are not in the table.
        if from == next && from.is_terminal() {
            authorize_transition(actor, &booking, next, &extra)?;
            debug!(%booking_id, status = %from, "transition already applied");
            return Ok(booking);
        }
        if !from.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: from.as_str(),
                to: next.as_str(),
            });
        }
        authorize_transition(actor, &booking, next, &extra)?;

        let now = now_ms();
        if next.is_live() && !from.is_live() {
            if let Err(e) = self.ensure_free(booking.resource_id, booking.span, Some(booking.id), now).await {
                if matches!(e, EngineError::Conflict(_)) {
                    metrics::counter!(CONFLICTS_TOTAL, "op" => "transition").increment(1);
                }
                return Err(e);
            }
        }

        booking.status = next;
        if let Some(paid) = extra.paid_amount {
            booking.paid_amount = paid;
        }
        if next == BookingStatus::Cancelled {
            booking.cancelled_by = Some(extra.cancelled_by.unwrap_or(actor.id));
            booking.cancel_reason = extra.cancel_reason.clone();
        }
        booking.updated_at = now;
        self.store.put_booking(booking.clone()).await?;

        metrics::counter!(TRANSITIONS_TOTAL, "from" => from.as_str(), "to" => next.as_str()).increment(1);
        info!(%booking_id, %from, to = %next, actor = %actor, "booking status changed");

        let mut changed = fields([("from", json!(from)), ("to", json!(next))]);
        if let Some(reason) = extra.cancel_reason {
            changed.insert("cancel_reason".into(), json!(reason));
        }
        self.emit(NotificationKind::StatusChanged, &booking, actor, changed);
        Ok(booking)
    }
}
