use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{Collection, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

/// Попытка оплаты бронирования. `id` генерируется до записи и служит
/// ключом идемпотентности в платёжном шлюзе.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub transaction_id: String,
    pub client_secret: Option<String>,
    pub amount: i64,
    pub method: Option<String>,
    pub status: PaymentStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Record for Payment {
    const COLLECTION: Collection = Collection::Payments;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefundReason {
    UserRequested,
    AutoRefund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefundStatus {
    Pending,
    Success,
    Failed,
}

/// Возврат по платежу. Строка создаётся в `pending` до обращения к шлюзу;
/// `idempotency_key` уникален в коллекции и уходит в шлюз как есть.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refund {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub amount: i64,
    pub reason: RefundReason,
    pub status: RefundStatus,
    pub idempotency_key: String,
    #[serde(default)]
    pub gateway_refund_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Record for Refund {
    const COLLECTION: Collection = Collection::Refunds;
}
