use serde::Deserialize;
use std::{env, str::FromStr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

// Главная структура конфигурации - контейнер для всех настроек
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub store: StoreConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub payment: PaymentConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub ticket: TicketConfig,
    pub worker: WorkerConfig,
    pub notify: NotifyConfig,
    pub pricing: PricingConfig,
}

// Настройки приложения
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub rust_log: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

// Настройки документного хранилища (headless CMS)
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub url: String,
    pub token: String,
    pub timeout_seconds: u64,
}

// Настройки Redis (очередь фоновых задач)
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

// Настройки JWT: подпись access-токенов провайдера идентификации
#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub staff_role: String,
}

// Настройки платежного шлюза
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentConfig {
    pub gateway_url: String,
    pub secret_key: String,
    pub currency: String,
    pub min_amount: i64,
    pub max_amount: i64,
}

// Настройки Circuit Breaker
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout_seconds: u64,
}

// Настройки QR-билетов
#[derive(Debug, Clone, Deserialize)]
pub struct TicketConfig {
    pub secret_key: String,
    pub checkin_base_url: String,
}

// Настройки воркеров очереди и фоновой уборки
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub max_retry: u32,
    pub poll_interval_ms: u64,
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricingConfig {
    /// Сколько денежных единиц даёт один балл лояльности.
    pub points_unit: i64,
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn optional(name: &'static str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parsed<T: FromStr>(name: &'static str, default: &str) -> Result<T, ConfigError> {
    let value = optional(name, default);
    value
        .parse()
        .map_err(|_| ConfigError::Invalid { name, value })
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Config {
            app: AppConfig {
                host: optional("HOST", "0.0.0.0"),
                port: parsed("PORT", "8000")?,
                environment: optional("ENVIRONMENT", "development"),
                rust_log: optional("RUST_LOG", "box_office=debug,tower_http=debug"),
                log_format: parsed("LOG_FORMAT", "pretty")?,
            },
            store: StoreConfig {
                url: required("STORE_URL")?,
                token: required("STORE_TOKEN")?,
                timeout_seconds: parsed("STORE_TIMEOUT_SECONDS", "10")?,
            },
            redis: RedisConfig {
                url: required("REDIS_URL")?,
            },
            jwt: JwtConfig {
                secret: required("JWT_SECRET")?,
                staff_role: required("STAFF_ROLE")?,
            },
            payment: PaymentConfig {
                gateway_url: optional("PAYMENT_GATEWAY_URL", "https://api.stripe.com"),
                secret_key: required("PAYMENT_SECRET_KEY")?,
                currency: optional("PAYMENT_CURRENCY", "vnd"),
                min_amount: parsed("PAYMENT_MIN_AMOUNT", "10000")?,
                max_amount: parsed("PAYMENT_MAX_AMOUNT", "99999999")?,
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: parsed("CIRCUIT_BREAKER_FAILURE_THRESHOLD", "5")?,
                timeout_seconds: parsed("CIRCUIT_BREAKER_TIMEOUT_SECONDS", "60")?,
            },
            ticket: TicketConfig {
                secret_key: required("TICKET_SECRET_KEY")?,
                checkin_base_url: required("CHECKIN_BASE_URL")?,
            },
            worker: WorkerConfig {
                concurrency: parsed("WORKER_CONCURRENCY", "4")?,
                max_retry: parsed("TASK_MAX_RETRY", "5")?,
                poll_interval_ms: parsed("WORKER_POLL_INTERVAL_MS", "250")?,
                sweep_interval_seconds: parsed("SWEEP_INTERVAL_SECONDS", "60")?,
            },
            notify: NotifyConfig {
                webhook_url: env::var("NOTIFY_WEBHOOK_URL").ok().filter(|v| !v.is_empty()),
            },
            pricing: PricingConfig {
                points_unit: parsed("POINTS_UNIT", "1000")?,
            },
        })
    }

    /// Конфигурация для тестов: внешние адреса фиктивные, секреты фиксированные.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn test_defaults() -> Self {
        Config {
            app: AppConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                environment: "test".to_string(),
                rust_log: "box_office=debug".to_string(),
                log_format: LogFormat::Pretty,
            },
            store: StoreConfig {
                url: "http://store.invalid".to_string(),
                token: "test-token".to_string(),
                timeout_seconds: 5,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
            },
            jwt: JwtConfig {
                secret: "test-jwt-secret".to_string(),
                staff_role: "staff".to_string(),
            },
            payment: PaymentConfig {
                gateway_url: "http://gateway.invalid".to_string(),
                secret_key: "sk_test".to_string(),
                currency: "vnd".to_string(),
                min_amount: 10_000,
                max_amount: 99_999_999,
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                timeout_seconds: 60,
            },
            ticket: TicketConfig {
                secret_key: "test-ticket-secret".to_string(),
                checkin_base_url: "https://tickets.example.com/checkin".to_string(),
            },
            worker: WorkerConfig {
                concurrency: 1,
                max_retry: 3,
                poll_interval_ms: 10,
                sweep_interval_seconds: 60,
            },
            notify: NotifyConfig { webhook_url: None },
            pricing: PricingConfig { points_unit: 1000 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("pretty".parse::<LogFormat>(), Ok(LogFormat::Pretty));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn invalid_numbers_are_reported_by_name() {
        // Имя переменной уникально для теста, чтобы не пересекаться с окружением
        env::set_var("BOX_OFFICE_TEST_PORT", "eighty");
        let err = parsed::<u16>("BOX_OFFICE_TEST_PORT", "8000").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "BOX_OFFICE_TEST_PORT", .. }));
        env::remove_var("BOX_OFFICE_TEST_PORT");
    }
}
