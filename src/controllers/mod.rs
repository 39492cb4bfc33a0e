pub mod bookings;
pub mod checkins;
pub mod payments;

use axum::{
    extract::{FromRequest, Json, Request},
    Router,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use validator::Validate;

use crate::error::AppError;

pub fn routes() -> Router<Arc<crate::AppState>> {
    Router::new()
        .merge(bookings::routes())
        .merge(payments::routes())
        .merge(checkins::routes())
}

/// Конверт успешного ответа.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self { success: true, data })
    }
}

/// JSON-тело с проверкой `validator`. Ошибки разбора и валидации дают 400.
pub struct ValidJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned + Validate + Send,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| AppError::InvalidInput(rejection.body_text()))?;
        value
            .validate()
            .map_err(|e| AppError::InvalidInput(e.to_string()))?;
        Ok(ValidJson(value))
    }
}
