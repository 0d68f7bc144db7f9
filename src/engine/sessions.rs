use serde::Deserialize;
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::observability::CONFLICTS_TOTAL;

use super::bookings::require_staff;
use super::conflict::{now_ms, validate_span};
use super::{Engine, EngineError};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewSession {
    pub resource_id: Ulid,
    pub span: Span,
    #[serde(default)]
    pub booking_id: Option<Ulid>,
    #[serde(default)]
    pub project_id: Option<Ulid>,
}

impl Engine {
    pub async fn get_session(&self, id: Ulid) -> Result<Session, EngineError> {
        self.with_retry("get_session", || async move {
            self.store.session(id).await?.ok_or(EngineError::NotFound(id))
        })
        .await
    }

    /// Plan a working session. It occupies the resource until completed or
    /// cancelled.
    pub async fn create_session(&self, new: NewSession, actor: &Actor) -> Result<Session, EngineError> {
        require_staff(actor)?;
        validate_span(&new.span)?;
        if let Some(booking_id) = new.booking_id {
            self.get_booking(booking_id).await?;
        }
        self.active_resource(new.resource_id).await?;

        let _guard = self.locks.lock(new.resource_id).await;
        let now = now_ms();
        if let Err(e) = self.ensure_free(new.resource_id, new.span, None, now).await {
            if matches!(e, EngineError::Conflict(_)) {
                metrics::counter!(CONFLICTS_TOTAL, "op" => "create_session").increment(1);
            }
            return Err(e);
        }

        let session = Session {
            id: Ulid::new(),
            resource_id: new.resource_id,
            booking_id: new.booking_id,
            project_id: new.project_id,
            span: new.span,
            status: SessionStatus::Planned,
            reschedule_count: 0,
            last_rescheduled_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.put_session(session.clone()).await?;
        info!(session_id = %session.id, resource_id = %session.resource_id, span = %session.span, "session planned");
        Ok(session)
    }

    pub async fn set_session_status(
        &self,
        session_id: Ulid,
        next: SessionStatus,
        actor: &Actor,
    ) -> Result<Session, EngineError> {
        require_staff(actor)?;
        let (mut session, _guards) = self.lock_session(session_id, None).await?;
        let from = session.status;

        if from == next && from.is_terminal() {
            debug!(%session_id, status = %from, "session status already applied");
            return Ok(session);
        }
        if !from.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: from.as_str(),
                to: next.as_str(),
            });
        }

        session.status = next;
        session.updated_at = now_ms();
        self.store.put_session(session.clone()).await?;
        info!(%session_id, %from, to = %next, "session status changed");
        Ok(session)
    }
}
