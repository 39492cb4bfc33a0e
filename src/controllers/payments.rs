use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::ApiResponse;
use crate::error::AppResult;
use crate::middleware::AuthUser;
use crate::models::{Refund, RefundStatus};
use crate::services::booking::RefundRequester;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/payments/{id}/refund", post(refund_payment))
}

#[derive(Serialize)]
struct RefundDeclined {
    success: bool,
    code: &'static str,
    message: String,
    data: Refund,
}

// POST /api/payments/{id}/refund
// Отказ шлюза в возврате не 5xx: 422 с записью Refund в статусе failed
async fn refund_payment(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(payment_id): Path<Uuid>,
) -> AppResult<Response> {
    let refund = state
        .saga
        .refund(payment_id, RefundRequester::Customer(user.user_id))
        .await?;

    if refund.status == RefundStatus::Failed {
        let body = RefundDeclined {
            success: false,
            code: "REFUND_DECLINED",
            message: "The refund was declined by the payment provider".to_string(),
            data: refund,
        };
        return Ok((StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response());
    }
    Ok(ApiResponse::ok(refund).into_response())
}
