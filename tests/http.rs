use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::{NaiveDate, NaiveTime, Offset, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;
use ulid::Ulid;

use artslot::engine::{Engine, EngineConfig};
use artslot::http::{router, ACTOR_ID_HEADER, ACTOR_ROLE_HEADER};
use artslot::model::{local_ms, Ms};
use artslot::notify::NotifyHub;
use artslot::store::MemoryStore;

fn app() -> Router {
    let engine = Engine::new(
        Arc::new(MemoryStore::new()),
        Arc::new(NotifyHub::new()),
        EngineConfig::default(),
    );
    router(Arc::new(engine))
}

fn at(h: u32, m: u32) -> Ms {
    let date = NaiveDate::from_ymd_opt(2030, 1, 7).unwrap();
    local_ms(date, NaiveTime::from_hms_opt(h, m, 0).unwrap(), Utc.fix()).unwrap()
}

struct Caller {
    id: Ulid,
    role: &'static str,
}

impl Caller {
    fn staff() -> Self {
        Self { id: Ulid::new(), role: "staff" }
    }

    fn client() -> Self {
        Self { id: Ulid::new(), role: "client" }
    }
}

async fn send(app: &Router, method: Method, uri: &str, caller: Option<&Caller>, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(c) = caller {
        req = req
            .header(ACTOR_ID_HEADER, c.id.to_string())
            .header(ACTOR_ROLE_HEADER, c.role);
    }
    let req = match body {
        Some(b) => req
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn setup(app: &Router) -> Ulid {
    let rid = Ulid::new();
    let (status, _) = send(
        app,
        Method::PUT,
        &format!("/resources/{rid}"),
        Some(&Caller::staff()),
        Some(json!({
            "name": "Chair 1",
            "hours": { "open": "09:00:00", "close": "18:00:00", "step_minutes": 30 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    rid
}

fn hold_body(rid: Ulid, start: Ms, end: Ms, token: &str) -> Value {
    json!({
        "resource_id": rid.to_string(),
        "span": { "start": start, "end": end },
        "token": token,
    })
}

#[tokio::test]
async fn health_is_open() {
    let app = app();
    let (status, body) = send(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn caller_identity_is_required() {
    let app = app();
    let rid = setup(&app).await;
    let (status, body) = send(&app, Method::POST, "/holds", None, Some(hold_body(rid, at(10, 0), at(11, 0), "a"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn only_staff_register_resources() {
    let app = app();
    let (status, _) = send(
        &app,
        Method::PUT,
        &format!("/resources/{}", Ulid::new()),
        Some(&Caller::client()),
        Some(json!({ "hours": { "open": "09:00:00", "close": "18:00:00", "step_minutes": 30 } })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn hold_commit_flow() {
    let app = app();
    let rid = setup(&app).await;
    let client = Caller::client();

    let (status, hold) = send(&app, Method::POST, "/holds", Some(&client), Some(hold_body(rid, at(10, 0), at(11, 0), "k1"))).await;
    assert_eq!(status, StatusCode::CREATED);
    let hold_id = hold["id"].as_str().unwrap().to_owned();

    // Another client loses the race with the generic message.
    let (status, body) = send(
        &app,
        Method::POST,
        "/holds",
        Some(&Caller::client()),
        Some(hold_body(rid, at(10, 30), at(11, 30), "k2")),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["message"], "slot no longer available, please pick another");

    let (status, _) = send(&app, Method::POST, &format!("/holds/{hold_id}/renew"), Some(&client), Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);

    // Payment is recorded by staff, not declared by the client.
    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/holds/{hold_id}/commit"),
        Some(&client),
        Some(json!({ "status": "confirmed", "paid_amount": 12000 })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, booking) = send(
        &app,
        Method::POST,
        &format!("/holds/{hold_id}/commit"),
        Some(&client),
        Some(json!({ "status": "confirmed" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(booking["status"], "confirmed");
    assert_eq!(booking["client_id"], client.id.to_string());
    let booking_id = booking["id"].as_str().unwrap().to_owned();

    let (status, fetched) = send(&app, Method::GET, &format!("/bookings/{booking_id}"), Some(&client), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, booking);

    // Other clients cannot see it.
    let (status, _) = send(&app, Method::GET, &format!("/bookings/{booking_id}"), Some(&Caller::client()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn expired_hold_commit_is_gone() {
    let app = app();
    let rid = setup(&app).await;
    let client = Caller::client();
    let mut body = hold_body(rid, at(10, 0), at(11, 0), "k1");
    body["ttl_secs"] = json!(0);

    // Zero ttl is rejected up front.
    let (status, _) = send(&app, Method::POST, "/holds", Some(&client), Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, Method::POST, &format!("/holds/{}/commit", Ulid::new()), Some(&client), Some(json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn release_returns_no_content() {
    let app = app();
    let rid = setup(&app).await;
    let client = Caller::client();
    let (_, hold) = send(&app, Method::POST, "/holds", Some(&client), Some(hold_body(rid, at(10, 0), at(11, 0), "k1"))).await;
    let uri = format!("/holds/{}", hold["id"].as_str().unwrap());

    let (status, _) = send(&app, Method::DELETE, &uri, Some(&client), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, Method::DELETE, &uri, Some(&client), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn availability_reflects_holds() {
    let app = app();
    let rid = setup(&app).await;
    send(&app, Method::POST, "/holds", Some(&Caller::client()), Some(hold_body(rid, at(14, 0), at(14, 30), "k1"))).await;

    let (status, slots) = send(
        &app,
        Method::GET,
        &format!("/resources/{rid}/availability?date=2030-01-07&duration=30&step=30"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let times: Vec<&str> = slots
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["local_time"].as_str().unwrap())
        .collect();
    assert_eq!(times.len(), 17);
    assert_eq!(times[0], "09:00:00");
    assert!(!times.contains(&"14:00:00"));

    let (status, _) = send(
        &app,
        Method::GET,
        &format!("/resources/{rid}/availability?date=2030-01-07&duration=0"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn dates_for_time() {
    let app = app();
    let rid = setup(&app).await;
    let (status, dates) = send(
        &app,
        Method::GET,
        &format!("/resources/{rid}/dates?time=20:00:00&duration=60&range=5"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(dates.as_array().unwrap().is_empty());

    let (status, _) = send(&app, Method::GET, &format!("/resources/{}/dates?time=10:00:00&duration=60", Ulid::new()), None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn booking_lifecycle_over_http() {
    let app = app();
    let rid = setup(&app).await;
    let staff = Caller::staff();
    let client = Caller::client();

    let (status, booking) = send(
        &app,
        Method::POST,
        "/bookings",
        Some(&staff),
        Some(json!({
            "resource_id": rid.to_string(),
            "client_id": client.id.to_string(),
            "span": { "start": at(10, 0), "end": at(12, 0) },
            "status": "held",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = booking["id"].as_str().unwrap().to_owned();

    // Clients cannot confirm.
    let (status, _) = send(&app, Method::POST, &format!("/bookings/{id}/transition"), Some(&client), Some(json!({ "status": "confirmed" }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Skipping a step is an invalid transition.
    let (status, body) = send(&app, Method::POST, &format!("/bookings/{id}/transition"), Some(&staff), Some(json!({ "status": "completed" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_STATE");

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/bookings/{id}/transition"),
        Some(&staff),
        Some(json!({ "status": "confirmed", "paid_amount": 3000 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["paid_amount"], 3000);

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/bookings/{id}/reschedule"),
        Some(&staff),
        Some(json!({ "span": { "start": at(13, 0), "end": at(15, 0) } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reschedule_count"], 1);

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/bookings/{id}/transition"),
        Some(&client),
        Some(json!({ "status": "cancelled", "cancel_reason": "moving away" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["cancelled_by"], client.id.to_string());

    // Cancelled bookings cannot move.
    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/bookings/{id}/reschedule"),
        Some(&staff),
        Some(json!({ "span": { "start": at(16, 0), "end": at(17, 0) } })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn sessions_over_http() {
    let app = app();
    let rid = setup(&app).await;
    let staff = Caller::staff();

    let (status, session) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(&staff),
        Some(json!({
            "resource_id": rid.to_string(),
            "span": { "start": at(10, 0), "end": at(12, 0) },
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(session["status"], "planned");
    let id = session["id"].as_str().unwrap().to_owned();

    let (status, _) = send(&app, Method::GET, &format!("/sessions/{id}"), Some(&Caller::client()), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&app, Method::POST, &format!("/sessions/{id}/status"), Some(&staff), Some(json!({ "status": "ongoing" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ongoing");

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/sessions/{id}/reschedule"),
        Some(&staff),
        Some(json!({ "span": { "start": at(14, 0), "end": at(16, 0) } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["span"]["start"], at(14, 0));

    let (status, fetched) = send(&app, Method::GET, &format!("/sessions/{id}"), Some(&staff), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, body);
}
