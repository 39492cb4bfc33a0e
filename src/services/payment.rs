//! payment.rs
//!
//! Сервисный слой для взаимодействия с внешним платёжным шлюзом (payment intents).
//!
//! Ключевые компоненты:
//! 1.  **CircuitBreaker**: паттерн "Автоматический выключатель". После серии
//!     сетевых сбоев или 5xx перестаёт пускать запросы к шлюзу на время таймаута.
//! 2.  **PaymentGateway**: контракт шлюза: create/confirm/cancel/get intent и refund.
//! 3.  **HttpPaymentGateway**: реализация поверх REST API шлюза. Тела запросов
//!     form-encoded, создание intent и возврат идут с заголовком `Idempotency-Key`,
//!     поэтому повтор с тем же ключом возвращает ранее созданный объект, а не новый.

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::{CircuitBreakerConfig, PaymentConfig};

/// Единственная причина возврата, которую принимает шлюз и которая подходит по смыслу.
pub const REFUND_REASON: &str = "requested_by_customer";

/// Состояния "Автоматического выключателя" (Circuit Breaker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// **Closed (Замкнуто)**: нормальный режим, запросы разрешены.
    Closed,
    /// **Open (Разомкнуто)**: запросы временно запрещены после серии сбоев.
    Open,
    /// **HalfOpen (Полуоткрыто)**: таймаут истёк, пропускаем один пробный запрос.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    /// Пробный запрос в HalfOpen уже выпущен и ещё не вернулся.
    trial_in_flight: bool,
}

/// Реализация паттерна "Автоматический выключатель" для контроля доступа к шлюзу.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    /// Порог сбоев, после которого выключатель переходит в состояние Open.
    failure_threshold: u32,
    /// Длительность состояния Open до перехода в HalfOpen.
    timeout_duration: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout_seconds: u64) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            failure_threshold: failure_threshold.max(1),
            timeout_duration: Duration::from_secs(timeout_seconds),
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(config.failure_threshold, config.timeout_seconds)
    }

    /// Проверяет, можно ли выполнить следующий запрос к сервису.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen if inner.trial_in_flight => false,
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                true
            }
            CircuitState::Open => {
                let expired = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.timeout_duration);
                if expired {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!("Circuit breaker transitioning to HalfOpen state");
                }
                expired
            }
        }
    }

    /// Регистрирует успешное выполнение запроса.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.state == CircuitState::HalfOpen {
            info!("Circuit breaker recovered - transitioning to Closed state");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Регистрирует неудачное выполнение запроса.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.failure_count += 1;
        inner.trial_in_flight = false;

        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                error!(
                    "Circuit breaker OPENED - {} failures reached threshold {}",
                    inner.failure_count, self.failure_threshold
                );
            }
            // Пробный запрос провалился, снова размыкаем цепь.
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!("Circuit breaker test failed - returning to Open state");
            }
            _ => {}
        }
    }

    pub fn get_state(&self) -> CircuitState {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).state
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("payment gateway temporarily unavailable (circuit open)")]
    CircuitOpen,
    #[error("payment gateway request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("payment gateway returned {status}: {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
        /// Некоторые ошибки (отказ карты) содержат актуальное состояние intent.
        intent: Option<Box<PaymentIntent>>,
    },
    #[error("amount {amount} is outside the allowed range [{min}, {max}]")]
    AmountOutOfRange { amount: i64, min: i64, max: i64 },
}

impl GatewayError {
    /// Сбои, которые говорят о недоступности шлюза и учитываются выключателем.
    pub fn is_outage(&self) -> bool {
        match self {
            GatewayError::Transport(_) => true,
            GatewayError::Api { status, .. } => *status >= 500,
            GatewayError::CircuitOpen | GatewayError::AmountOutOfRange { .. } => false,
        }
    }
}

// --- Модели данных API платёжного шлюза ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Canceled,
    Succeeded,
    #[serde(other)]
    Unknown,
}

impl IntentStatus {
    /// Статусы, из которых intent ещё можно отменить.
    pub fn is_cancelable(self) -> bool {
        matches!(
            self,
            IntentStatus::RequiresPaymentMethod
                | IntentStatus::RequiresConfirmation
                | IntentStatus::RequiresAction
                | IntentStatus::RequiresCapture
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastPaymentError {
    pub code: Option<String>,
    pub decline_code: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub status: IntentStatus,
    pub client_secret: Option<String>,
    pub last_payment_error: Option<LastPaymentError>,
}

impl PaymentIntent {
    /// Код отказа: сначала уточнённый `decline_code`, затем общий `code`.
    pub fn failure_code(&self) -> Option<&str> {
        let err = self.last_payment_error.as_ref()?;
        err.decline_code.as_deref().or(err.code.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayRefundStatus {
    Pending,
    RequiresAction,
    Succeeded,
    Failed,
    Canceled,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayRefund {
    pub id: String,
    pub amount: i64,
    pub status: GatewayRefundStatus,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: Option<String>,
    message: Option<String>,
    payment_intent: Option<PaymentIntent>,
}

/// Сопоставляет код отказа шлюза с сообщением для пользователя.
/// Сырые коды шлюза наружу не уходят.
pub fn decline_message(code: Option<&str>) -> &'static str {
    match code {
        Some("card_declined") | Some("generic_decline") => "Your card was declined.",
        Some("insufficient_funds") => "Your card has insufficient funds.",
        Some("expired_card") => "Your card has expired.",
        Some("incorrect_cvc") => "Your card's security code is incorrect.",
        Some("processing_error") => "An error occurred while processing your card. Try again later.",
        _ => "The payment could not be completed. Please use another payment method.",
    }
}

/// Проверка границ суммы для валюты. Вызывается до обращения к шлюзу.
pub fn validate_amount(amount: i64, min: i64, max: i64) -> Result<(), GatewayError> {
    if amount < min || amount > max {
        return Err(GatewayError::AmountOutOfRange { amount, min, max });
    }
    Ok(())
}

/// Контракт платёжного шлюза.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(&self, amount: i64, currency: &str, idempotency_key: &str) -> Result<PaymentIntent, GatewayError>;
    async fn confirm_intent(&self, intent_id: &str, payment_method: &str) -> Result<PaymentIntent, GatewayError>;
    async fn cancel_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError>;
    /// Повтор с тем же `idempotency_key` возвращает уже созданный возврат.
    async fn refund(
        &self,
        transaction_id: &str,
        reason: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<GatewayRefund, GatewayError>;
    async fn get_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError>;
}

/// Клиент для взаимодействия с API платёжного шлюза.
#[derive(Clone)]
pub struct HttpPaymentGateway {
    base_url: String,
    secret_key: String,
    http_client: reqwest::Client,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl HttpPaymentGateway {
    pub fn from_config(config: &PaymentConfig, breaker: &CircuitBreakerConfig) -> Result<Self, GatewayError> {
        Ok(Self {
            base_url: config.gateway_url.trim_end_matches('/').to_string(),
            secret_key: config.secret_key.clone(),
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            circuit_breaker: Arc::new(CircuitBreaker::from_config(breaker)),
        })
    }

    /// Выполняет запрос, пропуская его через Circuit Breaker.
    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, GatewayError> {
        if !self.circuit_breaker.can_execute() {
            warn!("Circuit breaker is OPEN - blocking payment gateway request");
            return Err(GatewayError::CircuitOpen);
        }

        let result = async {
            let response = request.basic_auth(&self.secret_key, Some("")).send().await?;
            read_response::<T>(response).await
        }
        .await;

        match &result {
            Err(e) if e.is_outage() => {
                error!("Payment gateway request failed: {}", e);
                self.circuit_breaker.record_failure();
            }
            _ => self.circuit_breaker.record_success(),
        }
        result
    }

    fn post_form(&self, path: &str, params: &[(&str, String)]) -> Result<RequestBuilder, GatewayError> {
        let body = serde_urlencoded::to_string(params).map_err(|e| GatewayError::Api {
            status: 0,
            code: None,
            message: format!("failed to encode request: {e}"),
            intent: None,
        })?;
        Ok(self
            .http_client
            .post(format!("{}{}", self.base_url, path))
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body))
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.get_state()
    }
}

async fn read_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    let text = response.text().await.unwrap_or_default();
    Err(match serde_json::from_str::<ErrorEnvelope>(&text) {
        Ok(envelope) => GatewayError::Api {
            status: status.as_u16(),
            code: envelope.error.code,
            message: envelope
                .error
                .message
                .unwrap_or_else(|| status.to_string()),
            intent: envelope.error.payment_intent.map(Box::new),
        },
        Err(_) => GatewayError::Api {
            status: status.as_u16(),
            code: None,
            message: status
                .canonical_reason()
                .unwrap_or("unexpected gateway response")
                .to_string(),
            intent: None,
        },
    })
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_intent(&self, amount: i64, currency: &str, idempotency_key: &str) -> Result<PaymentIntent, GatewayError> {
        info!(amount, currency, idempotency_key, "Creating payment intent");
        let request = self
            .post_form(
                "/v1/payment_intents",
                &[
                    ("amount", amount.to_string()),
                    ("currency", currency.to_string()),
                    ("payment_method_types[]", "card".to_string()),
                    ("metadata[payment_id]", idempotency_key.to_string()),
                ],
            )?
            .header("Idempotency-Key", idempotency_key);
        self.execute(request).await
    }

    async fn confirm_intent(&self, intent_id: &str, payment_method: &str) -> Result<PaymentIntent, GatewayError> {
        info!(intent_id, "Confirming payment intent");
        let request = self.post_form(
            &format!("/v1/payment_intents/{intent_id}/confirm"),
            &[("payment_method", payment_method.to_string())],
        )?;

        match self.execute::<PaymentIntent>(request).await {
            // Отказ карты приходит как 402 с вложенным intent: это не сбой
            // транспорта, а обработанный шлюзом отказ.
            Err(GatewayError::Api {
                status,
                intent: Some(intent),
                ..
            }) if status == StatusCode::PAYMENT_REQUIRED.as_u16() => Ok(*intent),
            other => other,
        }
    }

    async fn cancel_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError> {
        info!(intent_id, "Canceling payment intent");
        let request = self.post_form(
            &format!("/v1/payment_intents/{intent_id}/cancel"),
            &[("cancellation_reason", "abandoned".to_string())],
        )?;
        self.execute(request).await
    }

    async fn refund(
        &self,
        transaction_id: &str,
        reason: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<GatewayRefund, GatewayError> {
        info!(transaction_id, amount, "Refunding payment");
        let request = self
            .post_form(
                "/v1/refunds",
                &[
                    ("payment_intent", transaction_id.to_string()),
                    ("amount", amount.to_string()),
                    ("reason", reason.to_string()),
                ],
            )?
            .header("Idempotency-Key", idempotency_key);
        self.execute(request).await
    }

    async fn get_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError> {
        let request = self
            .http_client
            .get(format!("{}/v1/payment_intents/{intent_id}", self.base_url));
        self.execute(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{
        matchers::{body_string_contains, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn gateway(server: &MockServer, failure_threshold: u32) -> HttpPaymentGateway {
        HttpPaymentGateway::from_config(
            &PaymentConfig {
                gateway_url: server.uri(),
                secret_key: "sk_test_123".to_string(),
                currency: "vnd".to_string(),
                min_amount: 10_000,
                max_amount: 99_999_999,
            },
            &CircuitBreakerConfig {
                failure_threshold,
                timeout_seconds: 60,
            },
        )
        .unwrap()
    }

    fn intent_json(id: &str, status: &str) -> serde_json::Value {
        json!({
            "id": id,
            "amount": 262500,
            "currency": "vnd",
            "status": status,
            "client_secret": format!("{id}_secret_abc"),
            "last_payment_error": null
        })
    }

    #[test]
    fn breaker_opens_after_threshold_and_half_opens_after_timeout() {
        let breaker = CircuitBreaker::new(2, 0);
        assert!(breaker.can_execute());
        breaker.record_failure();
        assert_eq!(breaker.get_state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.get_state(), CircuitState::Open);

        // Нулевой таймаут: сразу пробный запрос
        assert!(breaker.can_execute());
        assert_eq!(breaker.get_state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.get_state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_admits_a_single_trial() {
        let breaker = CircuitBreaker::new(1, 0);
        breaker.record_failure();

        assert!(breaker.can_execute());
        assert!(!breaker.can_execute(), "second request while the trial is in flight");
        assert_eq!(breaker.get_state(), CircuitState::HalfOpen);

        // Проваленный пробный запрос снова размыкает цепь, после таймаута новый пробный
        breaker.record_failure();
        assert_eq!(breaker.get_state(), CircuitState::Open);
        assert!(breaker.can_execute());
        assert!(!breaker.can_execute());
        breaker.record_success();
        assert!(breaker.can_execute());
        assert!(breaker.can_execute());
    }

    #[test]
    fn open_breaker_blocks_until_timeout() {
        let breaker = CircuitBreaker::new(1, 3600);
        breaker.record_failure();
        assert!(!breaker.can_execute());
        assert_eq!(breaker.get_state(), CircuitState::Open);
    }

    #[test]
    fn amount_bounds_and_decline_messages() {
        assert!(validate_amount(262_500, 10_000, 99_999_999).is_ok());
        assert!(matches!(
            validate_amount(5_000, 10_000, 99_999_999),
            Err(GatewayError::AmountOutOfRange { amount: 5_000, .. })
        ));
        assert_eq!(decline_message(Some("insufficient_funds")), "Your card has insufficient funds.");
        assert_eq!(
            decline_message(Some("do_not_honor")),
            "The payment could not be completed. Please use another payment method."
        );
    }

    #[tokio::test]
    async fn create_intent_sends_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payment_intents"))
            .and(header("Idempotency-Key", "pay-123"))
            .and(body_string_contains("amount=262500"))
            .and(body_string_contains("currency=vnd"))
            .respond_with(ResponseTemplate::new(200).set_body_json(intent_json("pi_1", "requires_payment_method")))
            .expect(2)
            .mount(&server)
            .await;

        let gw = gateway(&server, 5);
        let first = gw.create_intent(262_500, "vnd", "pay-123").await.unwrap();
        let second = gw.create_intent(262_500, "vnd", "pay-123").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.status, IntentStatus::RequiresPaymentMethod);
    }

    #[tokio::test]
    async fn card_decline_returns_the_embedded_intent() {
        let server = MockServer::start().await;
        let mut declined = intent_json("pi_2", "requires_payment_method");
        declined["last_payment_error"] = json!({"code": "card_declined", "decline_code": "insufficient_funds", "message": "nope"});

        Mock::given(method("POST"))
            .and(path("/v1/payment_intents/pi_2/confirm"))
            .and(body_string_contains("payment_method=pm_card"))
            .respond_with(ResponseTemplate::new(402).set_body_json(json!({
                "error": {
                    "type": "card_error",
                    "code": "card_declined",
                    "message": "Your card has insufficient funds.",
                    "payment_intent": declined
                }
            })))
            .mount(&server)
            .await;

        let intent = gateway(&server, 5).confirm_intent("pi_2", "pm_card").await.unwrap();
        assert_eq!(intent.status, IntentStatus::RequiresPaymentMethod);
        assert_eq!(intent.failure_code(), Some("insufficient_funds"));
    }

    #[tokio::test]
    async fn server_errors_trip_the_breaker_but_client_errors_do_not() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/payment_intents/pi_bad"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"code": "resource_missing", "message": "No such payment_intent"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/payment_intents/pi_down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let gw = gateway(&server, 2);
        for _ in 0..3 {
            let err = gw.get_intent("pi_bad").await.unwrap_err();
            assert!(matches!(err, GatewayError::Api { status: 404, .. }));
        }
        assert_eq!(gw.circuit_state(), CircuitState::Closed);

        for _ in 0..2 {
            gw.get_intent("pi_down").await.unwrap_err();
        }
        assert_eq!(gw.circuit_state(), CircuitState::Open);
        assert!(matches!(gw.get_intent("pi_down").await, Err(GatewayError::CircuitOpen)));
    }

    #[tokio::test]
    async fn refund_reports_gateway_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/refunds"))
            .and(header("Idempotency-Key", "pay-123:refund:0"))
            .and(body_string_contains("reason=requested_by_customer"))
            .and(body_string_contains("amount=131250"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "re_1",
                "amount": 131250,
                "status": "failed",
                "failure_reason": "expired_or_canceled_card"
            })))
            .mount(&server)
            .await;

        let refund = gateway(&server, 5)
            .refund("pi_1", REFUND_REASON, 131_250, "pay-123:refund:0")
            .await
            .unwrap();
        assert_eq!(refund.status, GatewayRefundStatus::Failed);
        assert_eq!(refund.failure_reason.as_deref(), Some("expired_or_canceled_card"));
    }
}
