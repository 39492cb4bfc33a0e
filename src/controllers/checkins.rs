use axum::{extract::State, response::IntoResponse, routing::post, Router};
use serde::Deserialize;
use std::sync::Arc;
use validator::Validate;

use super::{ApiResponse, ValidJson};
use crate::error::AppResult;
use crate::services::checkin::CheckinRequest;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/checkins", post(check_in))
}

// POST /api/checkins
// Сотрудник логинится в самом запросе: сканеры на входе без сессии
#[derive(Debug, Deserialize, Validate)]
pub struct CheckinBody {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
    #[validate(length(min = 1, max = 100))]
    pub device: String,
    #[validate(length(min = 1, max = 512))]
    pub token: String,
}

async fn check_in(
    State(state): State<Arc<AppState>>,
    ValidJson(body): ValidJson<CheckinBody>,
) -> AppResult<impl IntoResponse> {
    let accepted = state
        .checkins
        .check_in(CheckinRequest {
            email: body.email,
            password: body.password,
            device: body.device,
            token: body.token,
        })
        .await?;
    Ok(ApiResponse::ok(accepted))
}
