use serde::Deserialize;
use serde_json::json;
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotificationKind;
use crate::observability::{CONFLICTS_TOTAL, RESCHEDULES_TOTAL};

use super::bookings::require_staff;
use super::conflict::{now_ms, validate_span};
use super::{fields, Engine, EngineError};

/// Where to move a booking or session. Omitting `resource_id` keeps the
/// current resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Move {
    #[serde(default)]
    pub resource_id: Option<Ulid>,
    pub span: Span,
}

impl Engine {
    async fn check_target(&self, current: Ulid, to: &Move) -> Result<Ulid, EngineError> {
        validate_span(&to.span)?;
        let target = to.resource_id.unwrap_or(current);
        if target != current {
            self.active_resource(target).await?;
        }
        Ok(target)
    }

    async fn ensure_free_for_move(
        &self,
        target: Ulid,
        span: Span,
        self_id: Ulid,
        now: Ms,
    ) -> Result<(), EngineError> {
        if let Err(e) = self.ensure_free(target, span, Some(self_id), now).await {
            if matches!(e, EngineError::Conflict(_)) {
                metrics::counter!(CONFLICTS_TOTAL, "op" => "reschedule").increment(1);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Move a booking to a new span, optionally on another resource. Both
    /// resources are locked for the check and the write. Not retried.
    pub async fn reschedule(&self, booking_id: Ulid, to: Move, actor: &Actor) -> Result<Booking, EngineError> {
        require_staff(actor)?;
        let seen = self.get_booking(booking_id).await?;
        let target = self.check_target(seen.resource_id, &to).await?;

        let (mut booking, _guards) = self.lock_booking(booking_id, Some(target)).await?;
        if booking.status.is_terminal() {
            return Err(EngineError::InvalidState {
                id: booking_id,
                status: booking.status.as_str(),
            });
        }

        let now = now_ms();
        self.ensure_free_for_move(target, to.span, booking.id, now).await?;

        let from_resource = booking.resource_id;
        let from_span = booking.span;
        booking.resource_id = target;
        booking.span = to.span;
        booking.reschedule_count += 1;
        booking.last_rescheduled_at = Some(now);
        booking.updated_at = now;
        self.store.put_booking(booking.clone()).await?;

        metrics::counter!(RESCHEDULES_TOTAL, "kind" => "booking").increment(1);
        info!(%booking_id, from = %from_span, to = %to.span, %from_resource, to_resource = %target, "booking rescheduled");
        self.emit(
            NotificationKind::Rescheduled,
            &booking,
            actor,
            fields([
                ("from_resource_id", json!(from_resource)),
                ("from_start", json!(from_span.start)),
                ("from_end", json!(from_span.end)),
                ("start", json!(booking.span.start)),
                ("end", json!(booking.span.end)),
                ("reschedule_count", json!(booking.reschedule_count)),
            ]),
        );
        Ok(booking)
    }

    /// Same contract as [`Engine::reschedule`], for sessions.
    pub async fn reschedule_session(
        &self,
        session_id: Ulid,
        to: Move,
        actor: &Actor,
    ) -> Result<Session, EngineError> {
        require_staff(actor)?;
        let seen = self.get_session(session_id).await?;
        let target = self.check_target(seen.resource_id, &to).await?;

        let (mut session, _guards) = self.lock_session(session_id, Some(target)).await?;
        if session.status.is_terminal() {
            return Err(EngineError::InvalidState {
                id: session_id,
                status: session.status.as_str(),
            });
        }

        let now = now_ms();
        self.ensure_free_for_move(target, to.span, session.id, now).await?;

        let from_span = session.span;
        session.resource_id = target;
        session.span = to.span;
        session.reschedule_count += 1;
        session.last_rescheduled_at = Some(now);
        session.updated_at = now;
        self.store.put_session(session.clone()).await?;

        metrics::counter!(RESCHEDULES_TOTAL, "kind" => "session").increment(1);
        info!(%session_id, from = %from_span, to = %to.span, resource_id = %target, "session rescheduled");
        Ok(session)
    }
}
