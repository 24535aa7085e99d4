use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{MatchedPath, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::json;
use ulid::Ulid;

use crate::engine::{Actor, BookingRequest, Engine, EngineError, SlotView};
use crate::model::*;
use crate::tenant::OpeningHours;

pub type AppState = Arc<Engine>;

pub fn router(engine: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/shops", post(create_shop))
        .route("/api/shops/{id}/hours", patch(update_hours))
        .route("/api/users", post(create_user))
        .route("/api/services", post(create_service))
        .route("/api/bookings", post(create_booking))
        .route("/api/bookings/{id}", get(get_booking))
        .route("/api/bookings/{id}/approve", patch(approve_booking))
        .route("/api/bookings/{id}/cancel", post(cancel_booking))
        .route("/api/availability", get(availability))
        .route("/api/users/{id}/bookings", get(user_bookings))
        .route("/api/users/{id}/notifications", get(user_notifications))
        .layer(middleware::from_fn(track_metrics))
        .with_state(engine)
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());
    let start = Instant::now();
    let response = next.run(req).await;
    metrics::counter!(
        crate::observability::REQUESTS_TOTAL,
        "route" => route.clone(),
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    metrics::histogram!(
        crate::observability::REQUEST_DURATION_SECONDS,
        "route" => route
    )
    .record(start.elapsed().as_secs_f64());
    response
}

// ── Error envelope ───────────────────────────────────────

struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = json!({
            "error": { "kind": self.0.kind(), "message": self.0.to_string() }
        });
        (status, Json(body)).into_response()
    }
}

fn bad_request(field: &'static str, reason: &'static str) -> ApiError {
    ApiError(EngineError::Validation { field, reason })
}

fn parse_ulid(s: &str, field: &'static str) -> Result<Ulid, ApiError> {
    Ulid::from_string(s).map_err(|_| bad_request(field, "not a valid ULID"))
}

fn parse_date(s: &str, field: &'static str) -> Result<NaiveDate, ApiError> {
    s.parse().map_err(|_| bad_request(field, "expected YYYY-MM-DD"))
}

fn parse_start(s: &str) -> Result<Ms, ApiError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| bad_request("start", "expected an RFC 3339 timestamp"))
}

// ── Handlers ─────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateShopBody {
    name: String,
    #[serde(default)]
    opening_hours: OpeningHours,
}

async fn create_shop(
    State(engine): State<AppState>,
    Json(body): Json<CreateShopBody>,
) -> Result<impl IntoResponse, ApiError> {
    let shop = engine.register_shop(body.name, body.opening_hours).await?;
    Ok((StatusCode::CREATED, Json(shop)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateHoursBody {
    opening_hours: OpeningHours,
}

async fn update_hours(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateHoursBody>,
) -> Result<impl IntoResponse, ApiError> {
    let shop_id = parse_ulid(&id, "id")?;
    engine.update_shop_hours(shop_id, body.opening_hours).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateUserBody {
    shop_id: Option<String>,
    name: String,
    role: Role,
}

async fn create_user(
    State(engine): State<AppState>,
    Json(body): Json<CreateUserBody>,
) -> Result<impl IntoResponse, ApiError> {
    let shop_id = body
        .shop_id
        .as_deref()
        .map(|s| parse_ulid(s, "shopId"))
        .transpose()?;
    let user = engine.register_user(shop_id, body.name, body.role).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateServiceBody {
    shop_id: Option<String>,
    name: String,
    duration: String,
}

async fn create_service(
    State(engine): State<AppState>,
    Json(body): Json<CreateServiceBody>,
) -> Result<impl IntoResponse, ApiError> {
    let shop_id = body
        .shop_id
        .as_deref()
        .map(|s| parse_ulid(s, "shopId"))
        .transpose()?;
    let service = engine
        .register_service(shop_id, body.name, body.duration)
        .await?;
    Ok((StatusCode::CREATED, Json(service)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBookingBody {
    shop_id: Option<String>,
    customer_id: String,
    staff_id: String,
    service_id: String,
    /// RFC 3339 instant; omit to let the engine pick the first fit on `date`.
    start: Option<String>,
    date: Option<String>,
    #[serde(default)]
    notes: String,
    #[serde(default)]
    payment_status: PaymentStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BookingResponse {
    #[serde(flatten)]
    booking: Booking,
    slot: Option<Span>,
}

async fn create_booking(
    State(engine): State<AppState>,
    Json(body): Json<CreateBookingBody>,
) -> Result<impl IntoResponse, ApiError> {
    let req = BookingRequest {
        shop_id: body
            .shop_id
            .as_deref()
            .map(|s| parse_ulid(s, "shopId"))
            .transpose()?,
        customer_id: parse_ulid(&body.customer_id, "customerId")?,
        staff_id: parse_ulid(&body.staff_id, "staffId")?,
        service_id: parse_ulid(&body.service_id, "serviceId")?,
        start: body.start.as_deref().map(parse_start).transpose()?,
        date: body
            .date
            .as_deref()
            .map(|s| parse_date(s, "date"))
            .transpose()?,
        notes: body.notes,
        payment_status: body.payment_status,
    };
    let booking = engine.create_booking(req).await?;
    let slot = engine.slot_for_booking(&booking).await.map(|s| s.span);
    Ok((StatusCode::CREATED, Json(BookingResponse { booking, slot })))
}

async fn get_booking(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let booking_id = parse_ulid(&id, "id")?;
    let booking = engine.get_booking(&booking_id)?;
    let slot = engine.slot_for_booking(&booking).await.map(|s| s.span);
    Ok(Json(BookingResponse { booking, slot }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActorBody {
    actor_id: String,
}

fn resolve_actor(engine: &Engine, body: &ActorBody) -> Result<Actor, ApiError> {
    let actor_id = parse_ulid(&body.actor_id, "actorId")?;
    Ok(engine.actor(&actor_id)?)
}

async fn approve_booking(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ActorBody>,
) -> Result<impl IntoResponse, ApiError> {
    let booking_id = parse_ulid(&id, "id")?;
    let actor = resolve_actor(&engine, &body)?;
    let booking = engine.approve_booking(&actor, booking_id).await?;
    Ok(Json(booking))
}

async fn cancel_booking(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ActorBody>,
) -> Result<impl IntoResponse, ApiError> {
    let booking_id = parse_ulid(&id, "id")?;
    let actor = resolve_actor(&engine, &body)?;
    let booking = engine.cancel_booking(&actor, booking_id).await?;
    Ok(Json(booking))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AvailabilityQuery {
    staff_id: String,
    date: String,
    /// Minimum stretch length in minutes; defaults to any.
    min_duration_min: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AvailabilityResponse {
    staff_id: String,
    date: String,
    free: Vec<SlotView>,
}

async fn availability(
    State(engine): State<AppState>,
    Query(q): Query<AvailabilityQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let staff_id = parse_ulid(&q.staff_id, "staffId")?;
    let date = parse_date(&q.date, "date")?;
    let min_ms = q.min_duration_min.unwrap_or(0) as Ms * 60_000;
    let free = engine.free_slots(staff_id, date, min_ms).await?;
    Ok(Json(AvailabilityResponse {
        staff_id: q.staff_id,
        date: q.date,
        free,
    }))
}

async fn user_bookings(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = parse_ulid(&id, "id")?;
    let user = engine
        .get_user(&user_id)
        .ok_or(EngineError::NotFound(user_id))?;
    let bookings = match user.role {
        Role::Staff => engine.bookings_for_staff(&user_id),
        _ => engine.bookings_for_customer(&user_id),
    };
    Ok(Json(bookings))
}

async fn user_notifications(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = parse_ulid(&id, "id")?;
    if engine.get_user(&user_id).is_none() {
        return Err(EngineError::NotFound(user_id).into());
    }
    Ok(Json(engine.notifications_for_user(&user_id)))
}
