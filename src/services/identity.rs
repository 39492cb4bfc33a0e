//! Проверка личности: локальная валидация access-токенов (HS256) и логин
//! сотрудников через `/auth/login` хранилища.

use async_trait::async_trait;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{JwtConfig, StoreConfig};
use crate::error::{AppError, AppResult};

/// Полезная нагрузка access-токена провайдера.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub id: Uuid,
    pub role: String,
    pub exp: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: String,
}

#[derive(Clone)]
pub struct JwtVerifier {
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> AppResult<Identity> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            debug!(error = %e, "access token rejected");
            AppError::Unauthorized
        })?;
        Ok(Identity {
            user_id: data.claims.id,
            role: data.claims.role,
        })
    }
}

/// Выпуск токена тем же секретом. Используется тестовыми двойниками провайдера.
pub fn issue_token(secret: &str, user_id: Uuid, role: &str, ttl_seconds: i64) -> AppResult<String> {
    let exp = chrono::Utc::now().timestamp() + ttl_seconds;
    let claims = Claims {
        id: user_id,
        role: role.to_string(),
        exp: usize::try_from(exp).unwrap_or(0),
    };
    encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| AppError::Internal(format!("failed to sign token: {e}")))
}

/// Внешний провайдер идентификации.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Логин по паролю. Неверные учётные данные дают `Unauthorized`.
    async fn login(&self, email: &str, password: &str) -> AppResult<Identity>;
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginEnvelope {
    data: LoginData,
}

#[derive(Deserialize)]
struct LoginData {
    access_token: String,
}

pub struct HttpIdentityProvider {
    base_url: String,
    http: reqwest::Client,
    verifier: JwtVerifier,
}

impl HttpIdentityProvider {
    pub fn new(store: &StoreConfig, verifier: JwtVerifier) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(store.timeout_seconds))
            .build()
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(Self {
            base_url: store.url.trim_end_matches('/').to_string(),
            http,
            verifier,
        })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn login(&self, email: &str, password: &str) -> AppResult<Identity> {
        let response = self
            .http
            .post(format!("{}/auth/login", self.base_url))
            .json(&LoginRequest { email, password })
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("identity provider unreachable: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::BAD_REQUEST {
            warn!(email, "staff login rejected");
            return Err(AppError::Unauthorized);
        }
        if !status.is_success() {
            return Err(AppError::Upstream(format!("identity provider returned {status}")));
        }

        let envelope: LoginEnvelope = response
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("malformed login response: {e}")))?;
        self.verifier.verify(&envelope.data.access_token)
    }
}
