use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::coordinator::{BookingCoordinator, BookingError, BookingRequest};
use crate::model::{format_hhmm, Appointment, AppointmentId, GarageId, ServiceItem, Slot, SlotId, UserId};
use crate::store::{SlotStore, StoreError};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SlotStore>,
    pub coordinator: Arc<BookingCoordinator>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/v1/slots", get(list_slots))
        .route("/v1/bookings", post(create_booking))
        .route("/v1/appointments/{id}", get(get_appointment))
        .route("/v1/appointments/{id}/cancel", post(cancel_appointment))
        .with_state(state)
}

// ── Request / response bodies ────────────────────────────────────

#[derive(Deserialize)]
struct SlotsQuery {
    garage_id: GarageId,
    date: NaiveDate,
}

#[derive(Serialize)]
struct SlotView {
    slot_id: SlotId,
    start_time: String,
    end_time: String,
    capacity: u32,
    booked: u32,
}

impl From<&Slot> for SlotView {
    fn from(slot: &Slot) -> Self {
        Self {
            slot_id: slot.id,
            start_time: format_hhmm(slot.start_min),
            end_time: format_hhmm(slot.end_min),
            capacity: slot.capacity,
            booked: slot.booked,
        }
    }
}

#[derive(Serialize)]
struct SlotsResponse {
    garage_id: GarageId,
    date: NaiveDate,
    slots: Vec<SlotView>,
}

#[derive(Deserialize)]
struct CreateBookingBody {
    garage_id: GarageId,
    user_id: UserId,
    date: NaiveDate,
    start_slot_id: SlotId,
    total_duration_min: u32,
    #[serde(default)]
    items: Vec<ServiceItem>,
}

#[derive(Serialize)]
struct BookingCreated {
    appointment_id: AppointmentId,
    slot_ids: Vec<SlotId>,
    date: NaiveDate,
    start_time: String,
    end_time: String,
}

impl From<&Appointment> for BookingCreated {
    fn from(a: &Appointment) -> Self {
        Self {
            appointment_id: a.id,
            slot_ids: a.slot_ids.clone(),
            date: a.date,
            start_time: format_hhmm(a.start_min),
            end_time: format_hhmm(a.end_min),
        }
    }
}

#[derive(Serialize)]
struct AppointmentView {
    appointment_id: AppointmentId,
    garage_id: GarageId,
    user_id: UserId,
    date: NaiveDate,
    slot_ids: Vec<SlotId>,
    start_time: String,
    end_time: String,
    total_duration_min: u32,
    items: Vec<ServiceItem>,
    cancelled: bool,
}

impl From<&Appointment> for AppointmentView {
    fn from(a: &Appointment) -> Self {
        Self {
            appointment_id: a.id,
            garage_id: a.garage_id,
            user_id: a.user_id,
            date: a.date,
            slot_ids: a.slot_ids.clone(),
            start_time: format_hhmm(a.start_min),
            end_time: format_hhmm(a.end_min),
            total_duration_min: a.total_duration_min,
            items: a.items.clone(),
            cancelled: a.cancelled,
        }
    }
}

#[derive(Serialize)]
struct CancelResponse {
    released: bool,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

// ── Error mapping ────────────────────────────────────────────────

struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Invariant violations stay generic on the wire; details go to logs.
        let message = if self.status == StatusCode::INTERNAL_SERVER_ERROR {
            "internal error".to_string()
        } else {
            self.message
        };
        (
            self.status,
            Json(ErrorBody {
                error: self.code,
                message,
            }),
        )
            .into_response()
    }
}

fn booking_error(e: BookingError) -> ApiError {
    let status = match &e {
        BookingError::SlotUnavailable
        | BookingError::InsufficientConsecutiveCapacity { .. }
        | BookingError::NonContiguousSlots => StatusCode::CONFLICT,
        BookingError::UnknownStartSlot(_) => StatusCode::NOT_FOUND,
        BookingError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        BookingError::AttemptTimeout | BookingError::Arbiter(_) => StatusCode::SERVICE_UNAVAILABLE,
        BookingError::Store(se) => store_status(se),
    };
    ApiError {
        status,
        code: e.code(),
        message: e.to_string(),
    }
}

fn store_error(e: StoreError) -> ApiError {
    ApiError {
        status: store_status(&e),
        code: store_code(&e),
        message: e.to_string(),
    }
}

fn store_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::GarageNotFound(_)
        | StoreError::DayNotFound { .. }
        | StoreError::AppointmentNotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Unavailable(_) | StoreError::WalError(_) => StatusCode::SERVICE_UNAVAILABLE,
        StoreError::LimitExceeded(_) => StatusCode::BAD_REQUEST,
        StoreError::CapacityExhausted(_) | StoreError::SlotNotBookable(_) => StatusCode::CONFLICT,
        StoreError::SlotNotFound(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn store_code(e: &StoreError) -> &'static str {
    match e {
        StoreError::GarageNotFound(_) => "GarageNotFound",
        StoreError::DayNotFound { .. } => "DayNotFound",
        StoreError::AppointmentNotFound(_) => "AppointmentNotFound",
        StoreError::SlotNotFound(_) => "InternalError",
        StoreError::CapacityExhausted(_) => "SlotUnavailable",
        StoreError::SlotNotBookable(_) => "SlotUnavailable",
        StoreError::LimitExceeded(_) => "LimitExceeded",
        StoreError::Unavailable(_) => "TryAgain",
        StoreError::WalError(_) => "TryAgain",
    }
}

fn respond<T: Serialize>(
    op: &'static str,
    ok_status: StatusCode,
    result: Result<T, ApiError>,
) -> Response {
    match result {
        Ok(body) => {
            metrics::counter!(
                crate::observability::HTTP_REQUESTS_TOTAL,
                "op" => op, "status" => "ok"
            )
            .increment(1);
            (ok_status, Json(body)).into_response()
        }
        Err(e) => {
            metrics::counter!(
                crate::observability::HTTP_REQUESTS_TOTAL,
                "op" => op, "status" => e.code
            )
            .increment(1);
            e.into_response()
        }
    }
}

// ── Handlers ─────────────────────────────────────────────────────

/// Ordered slot list for a (garage, date); lazily materializes the day.
/// A past date legitimately yields an empty list.
async fn list_slots(State(state): State<AppState>, Query(q): Query<SlotsQuery>) -> Response {
    let result = state
        .store
        .get_or_create_day_slots(q.garage_id, q.date)
        .await
        .map(|slots| SlotsResponse {
            garage_id: q.garage_id,
            date: q.date,
            slots: slots.iter().map(SlotView::from).collect(),
        })
        .map_err(store_error);
    respond("slots", StatusCode::OK, result)
}

async fn create_booking(
    State(state): State<AppState>,
    Json(body): Json<CreateBookingBody>,
) -> Response {
    let result = state
        .coordinator
        .book(BookingRequest {
            garage_id: body.garage_id,
            user_id: body.user_id,
            date: body.date,
            start_slot_id: body.start_slot_id,
            total_duration_min: body.total_duration_min,
            items: body.items,
        })
        .await
        .map(|a| BookingCreated::from(&a))
        .map_err(booking_error);
    respond("booking", StatusCode::CREATED, result)
}

async fn get_appointment(
    State(state): State<AppState>,
    Path(id): Path<AppointmentId>,
) -> Response {
    let result = state
        .store
        .appointment(id)
        .map(|a| AppointmentView::from(&a))
        .ok_or_else(|| store_error(StoreError::AppointmentNotFound(id)));
    respond("appointment", StatusCode::OK, result)
}

/// Cancellation hook for the out-of-scope cancellation workflow: releases the
/// appointment's slots. Idempotent — a repeat reports `released: false`.
async fn cancel_appointment(
    State(state): State<AppState>,
    Path(id): Path<AppointmentId>,
) -> Response {
    let result = state
        .store
        .cancel_appointment(id)
        .await
        .map(|released| CancelResponse { released })
        .map_err(store_error);
    respond("cancel", StatusCode::OK, result)
}
