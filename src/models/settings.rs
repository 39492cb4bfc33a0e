use serde::{Deserialize, Serialize};

/// Внешние настройки продаж (singleton-коллекция в хранилище, только чтение).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub payment_fee_percent: i64,
    pub max_reservation_hold_minutes: i64,
    pub max_full_refund_hours: i64,
}
