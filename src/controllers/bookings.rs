use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use super::{ApiResponse, ValidJson};
use crate::error::AppResult;
use crate::middleware::AuthUser;
use crate::services::booking::{CreateBooking, SeatSelection};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bookings", post(create_booking))
        .route("/bookings/confirm-payment", post(confirm_payment))
        .route("/bookings/{id}/payments", post(create_payment))
        .route("/bookings/{id}/cancel", post(cancel_booking))
}

/* ---------- BOOKINGS ---------- */

// POST /api/bookings
#[derive(Debug, Deserialize, Validate)]
pub struct CreateBookingRequest {
    pub event_id: Uuid,
    #[validate(length(min = 1, max = 20, message = "between 1 and 20 seats per booking"))]
    pub items: Vec<SeatSelection>,
}

async fn create_booking(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidJson(req): ValidJson<CreateBookingRequest>,
) -> AppResult<impl IntoResponse> {
    let created = state
        .saga
        .create_booking(CreateBooking {
            customer_id: user.user_id,
            event_id: req.event_id,
            items: req.items,
        })
        .await?;
    Ok((StatusCode::CREATED, ApiResponse::ok(created)))
}

// POST /api/bookings/confirm-payment
#[derive(Debug, Deserialize, Validate)]
pub struct ConfirmPaymentRequest {
    pub payment_id: Uuid,
    #[validate(length(min = 1, max = 255))]
    pub payment_method: String,
}

async fn confirm_payment(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidJson(req): ValidJson<ConfirmPaymentRequest>,
) -> AppResult<impl IntoResponse> {
    let confirmed = state
        .saga
        .confirm_payment(user.user_id, req.payment_id, &req.payment_method)
        .await?;
    Ok(ApiResponse::ok(confirmed))
}

// POST /api/bookings/{id}/payments
async fn create_payment(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(booking_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let session = state.saga.create_payment(user.user_id, booking_id).await?;
    Ok((StatusCode::CREATED, ApiResponse::ok(session)))
}

// POST /api/bookings/{id}/cancel
async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(booking_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let booking = state.saga.cancel_booking(user.user_id, booking_id).await?;
    Ok(ApiResponse::ok(booking))
}
