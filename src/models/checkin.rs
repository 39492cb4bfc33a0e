use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{Collection, Record};

/// Факт прохода по билету. В хранилище `booking_item_id` уникален.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkin {
    pub id: Uuid,
    pub booking_item_id: Uuid,
    pub staff_id: Uuid,
    pub device: String,
    pub created_at: DateTime<Utc>,
}

impl Record for Checkin {
    const COLLECTION: Collection = Collection::Checkins;
}
