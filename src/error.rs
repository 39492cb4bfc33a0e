use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::{
    services::payment::GatewayError,
    store::StoreError,
    tasks::QueueError,
    token::TokenError,
};

pub type AppResult<T> = Result<T, AppError>;

/// Ошибки уровня приложения. Каждый вариант однозначно отображается в HTTP-статус.
#[derive(Debug, Error)]
pub enum AppError {
    /// Некорректные или отсутствующие поля запроса. Никогда не повторяется.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0} not found")]
    NotFound(String),
    /// Место занято, платёж в неподходящем статусе и т.п.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    /// Запрос корректен, но сейчас не может быть выполнен (окно чекина, статус билета).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Шлюз обработал запрос, но списание не прошло.
    #[error("payment declined: {reason}")]
    PaymentDeclined { reason: String },
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Хранилище или платёжный шлюз недоступны (может быть временным).
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    success: bool,
    code: &'a str,
    message: String,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) | AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) | AppError::InvalidState(_) => StatusCode::CONFLICT,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::PaymentDeclined { .. } => StatusCode::PAYMENT_REQUIRED,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "INVALID_INPUT",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::Forbidden => "FORBIDDEN",
            AppError::InvalidRequest(_) => "INVALID_REQUEST",
            AppError::PaymentDeclined { .. } => "PAYMENT_DECLINED",
            AppError::InvalidState(_) => "INVALID_STATE",
            AppError::Upstream(_) => "UPSTREAM_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Детали инфраструктурных сбоев только в лог, клиенту общий текст
        let message = match &self {
            AppError::Upstream(detail) => {
                tracing::error!(error = %detail, "upstream failure");
                "A downstream service is unavailable, please retry later".to_string()
            }
            AppError::Internal(detail) => {
                tracing::error!(error = %detail, "internal failure");
                "Internal server error".to_string()
            }
            AppError::PaymentDeclined { reason } => reason.clone(),
            other => other.to_string(),
        };

        let body = ErrorBody { success: false, code: self.code(), message };
        (status, Json(body)).into_response()
    }
}

// 5xx только за недоступность хранилища. 4xx от хранилища означает, что
// неверен наш собственный запрос
impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unique { .. } => AppError::Conflict(e.to_string()),
            StoreError::Api { status: 400..=499, .. } | StoreError::Decode { .. } => AppError::Internal(e.to_string()),
            StoreError::Api { .. } | StoreError::Transport(_) => AppError::Upstream(e.to_string()),
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::AmountOutOfRange { .. } => AppError::InvalidInput(e.to_string()),
            other => AppError::Upstream(other.to_string()),
        }
    }
}

// Ошибка токена не раскрывает причину: подделка, чужой ключ и мусор неразличимы
impl From<TokenError> for AppError {
    fn from(_: TokenError) -> Self {
        AppError::Unauthorized
    }
}

impl From<QueueError> for AppError {
    fn from(e: QueueError) -> Self {
        AppError::Internal(e.to_string())
    }
}
