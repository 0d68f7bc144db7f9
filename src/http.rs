//! JSON-over-HTTP surface. Handlers parse, call one engine operation, and map
//! the outcome; no scheduling logic lives here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    async_trait,
    extract::{FromRequestParts, MatchedPath, Path, Query, Request, State},
    http::{request::Parts, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::{CommitFields, Engine, EngineError, Move, NewBooking, NewSession, TransitionFields};
use crate::model::*;
use crate::observability::{HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS};

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

/// Shown for both conflicts and expired holds; callers should pick again.
const SLOT_UNAVAILABLE: &str = "slot no longer available, please pick another";

pub type AppState = Arc<Engine>;

// ── Errors ──────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Conflict(_) => Self::new(StatusCode::CONFLICT, "SLOT_UNAVAILABLE", SLOT_UNAVAILABLE),
            EngineError::Expired(_) => Self::new(StatusCode::GONE, "SLOT_UNAVAILABLE", SLOT_UNAVAILABLE),
            EngineError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", "not found"),
            EngineError::InvalidTransition { .. } | EngineError::InvalidState { .. } => Self::new(
                StatusCode::CONFLICT,
                "INVALID_STATE",
                "not allowed in the current state",
            ),
            EngineError::Forbidden(_) => Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", "not permitted"),
            EngineError::InvalidInput(m) => Self::new(StatusCode::BAD_REQUEST, "INVALID_INPUT", m),
            EngineError::LimitExceeded(m) => Self::new(StatusCode::BAD_REQUEST, "LIMIT_EXCEEDED", m),
            EngineError::Store(e) => {
                tracing::error!(error = %e, "store failure");
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "UNAVAILABLE",
                    "temporarily unavailable, please retry",
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Caller identity ─────────────────────────────────────────────

/// The caller, taken from headers set by the upstream identity provider.
#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| parts.headers.get(name).and_then(|v| v.to_str().ok());
        let unauthorized = || ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "missing or invalid caller identity");

        let id = header(ACTOR_ID_HEADER)
            .and_then(|s| Ulid::from_string(s).ok())
            .ok_or_else(unauthorized)?;
        let role = header(ACTOR_ROLE_HEADER)
            .and_then(|s| s.parse::<Role>().ok())
            .ok_or_else(unauthorized)?;
        Ok(Actor { id, role })
    }
}

// ── Request bodies ──────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SlotsQuery {
    pub date: NaiveDate,
    pub duration: u32,
    pub step: Option<u32>,
}

#[derive(Deserialize)]
pub struct DatesQuery {
    pub time: NaiveTime,
    pub duration: u32,
    #[serde(default = "default_range")]
    pub range: u32,
}

fn default_range() -> u32 {
    30
}

#[derive(Deserialize)]
pub struct ResourceBody {
    pub name: Option<String>,
    #[serde(default = "active")]
    pub active: bool,
    pub hours: WorkingHours,
}

fn active() -> bool {
    true
}

#[derive(Deserialize)]
pub struct HoldBody {
    pub resource_id: Ulid,
    pub span: Span,
    pub token: String,
    pub ttl_secs: Option<u64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct RenewBody {
    pub ttl_secs: Option<u64>,
}

#[derive(Deserialize)]
pub struct TransitionBody {
    pub status: BookingStatus,
    #[serde(flatten)]
    pub fields: TransitionFields,
}

#[derive(Deserialize)]
pub struct SessionStatusBody {
    pub status: SessionStatus,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

// ── Router ──────────────────────────────────────────────────────

pub fn router(engine: AppState) -> Router {
    Router::new()
        .route("/resources/:id", put(register_resource).get(get_resource))
        .route("/resources/:id/availability", get(free_slots))
        .route("/resources/:id/dates", get(free_dates))
        .route("/holds", post(create_hold))
        .route("/holds/:id", axum::routing::delete(release_hold))
        .route("/holds/:id/renew", post(renew_hold))
        .route("/holds/:id/commit", post(commit_hold))
        .route("/bookings", post(create_booking))
        .route("/bookings/:id", get(get_booking))
        .route("/bookings/:id/transition", post(transition))
        .route("/bookings/:id/reschedule", post(reschedule))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/status", post(session_status))
        .route("/sessions/:id/reschedule", post(reschedule_session))
        .route_layer(middleware::from_fn(track_metrics))
        .route("/health", get(health))
        .with_state(engine)
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".into());
    let started = Instant::now();
    let response = next.run(req).await;
    metrics::histogram!(HTTP_REQUEST_DURATION_SECONDS, "route" => route.clone())
        .record(started.elapsed().as_secs_f64());
    metrics::counter!(HTTP_REQUESTS_TOTAL, "route" => route, "status" => response.status().as_u16().to_string())
        .increment(1);
    response
}

async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

// ── Resources and availability ──────────────────────────────────

async fn register_resource(
    State(engine): State<AppState>,
    actor: Actor,
    Path(id): Path<Ulid>,
    Json(body): Json<ResourceBody>,
) -> ApiResult<Json<Resource>> {
    let resource = Resource {
        id,
        name: body.name,
        active: body.active,
        hours: body.hours,
    };
    Ok(Json(engine.register_resource(resource, &actor).await?))
}

async fn get_resource(
    State(engine): State<AppState>,
    _actor: Actor,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<Resource>> {
    Ok(Json(engine.get_resource(id).await?))
}

async fn free_slots(
    State(engine): State<AppState>,
    Path(id): Path<Ulid>,
    Query(q): Query<SlotsQuery>,
) -> ApiResult<Json<Vec<TimeSlot>>> {
    Ok(Json(engine.free_slots(id, q.date, q.duration, q.step).await?))
}

async fn free_dates(
    State(engine): State<AppState>,
    Path(id): Path<Ulid>,
    Query(q): Query<DatesQuery>,
) -> ApiResult<Json<Vec<DateOption>>> {
    Ok(Json(
        engine
            .free_dates_for_time(id, q.time, q.duration, q.range)
            .await?,
    ))
}

// ── Holds ───────────────────────────────────────────────────────

fn ttl_or_default(engine: &Engine, secs: Option<u64>) -> Duration {
    secs.map(Duration::from_secs)
        .unwrap_or(engine.config().default_hold_ttl)
}

async fn create_hold(
    State(engine): State<AppState>,
    actor: Actor,
    Json(body): Json<HoldBody>,
) -> ApiResult<(StatusCode, Json<Hold>)> {
    let ttl = ttl_or_default(&engine, body.ttl_secs);
    let hold = engine
        .create_hold(body.resource_id, body.span, actor.id, &body.token, ttl)
        .await?;
    Ok((StatusCode::CREATED, Json(hold)))
}

async fn renew_hold(
    State(engine): State<AppState>,
    actor: Actor,
    Path(id): Path<Ulid>,
    Json(body): Json<RenewBody>,
) -> ApiResult<Json<Hold>> {
    let ttl = ttl_or_default(&engine, body.ttl_secs);
    Ok(Json(engine.renew_hold(id, ttl, &actor).await?))
}

async fn release_hold(
    State(engine): State<AppState>,
    actor: Actor,
    Path(id): Path<Ulid>,
) -> ApiResult<StatusCode> {
    engine.release_hold(id, &actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn commit_hold(
    State(engine): State<AppState>,
    actor: Actor,
    Path(id): Path<Ulid>,
    Json(body): Json<CommitFields>,
) -> ApiResult<(StatusCode, Json<Booking>)> {
    let booking = engine.commit_hold(id, body, &actor).await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

// ── Bookings ────────────────────────────────────────────────────

async fn create_booking(
    State(engine): State<AppState>,
    actor: Actor,
    Json(body): Json<NewBooking>,
) -> ApiResult<(StatusCode, Json<Booking>)> {
    let booking = engine.create_booking(body, &actor).await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

/// Clients see only their own bookings.
async fn get_booking(
    State(engine): State<AppState>,
    actor: Actor,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<Booking>> {
    let booking = engine.get_booking(id).await?;
    if !actor.role.is_staff() && booking.client_id != actor.id {
        return Err(EngineError::NotFound(id).into());
    }
    Ok(Json(booking))
}

async fn transition(
    State(engine): State<AppState>,
    actor: Actor,
    Path(id): Path<Ulid>,
    Json(body): Json<TransitionBody>,
) -> ApiResult<Json<Booking>> {
    Ok(Json(engine.transition(id, body.status, &actor, body.fields).await?))
}

async fn reschedule(
    State(engine): State<AppState>,
    actor: Actor,
    Path(id): Path<Ulid>,
    Json(to): Json<Move>,
) -> ApiResult<Json<Booking>> {
    Ok(Json(engine.reschedule(id, to, &actor).await?))
}

// ── Sessions ────────────────────────────────────────────────────

async fn create_session(
    State(engine): State<AppState>,
    actor: Actor,
    Json(body): Json<NewSession>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let session = engine.create_session(body, &actor).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_session(
    State(engine): State<AppState>,
    actor: Actor,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<Session>> {
    if !actor.role.is_staff() {
        return Err(EngineError::Forbidden(actor).into());
    }
    Ok(Json(engine.get_session(id).await?))
}

async fn session_status(
    State(engine): State<AppState>,
    actor: Actor,
    Path(id): Path<Ulid>,
    Json(body): Json<SessionStatusBody>,
) -> ApiResult<Json<Session>> {
    Ok(Json(engine.set_session_status(id, body.status, &actor).await?))
}

async fn reschedule_session(
    State(engine): State<AppState>,
    actor: Actor,
    Path(id): Path<Ulid>,
    Json(to): Json<Move>,
) -> ApiResult<Json<Session>> {
    Ok(Json(engine.reschedule_session(id, to, &actor).await?))
}
