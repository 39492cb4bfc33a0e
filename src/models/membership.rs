use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{Collection, Record};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub id: Uuid,
    pub name: String,
    pub base_point: i64,
    pub discount_percent: i64,
}

impl Record for Membership {
    const COLLECTION: Collection = Collection::Memberships;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerSource {
    Payment,
    Refund,
}

/// Запись журнала баллов: одна на платёж или возврат.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointLedgerEntry {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub delta: i64,
    pub source: LedgerSource,
    pub source_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Record for PointLedgerEntry {
    const COLLECTION: Collection = Collection::PointLedger;
}
