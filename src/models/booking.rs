use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{Collection, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Complete,
    Canceled,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub event_id: Uuid,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Record for Booking {
    const COLLECTION: Collection = Collection::Bookings;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingItemStatus {
    Valid,
    Expired,
    Used,
}

/// Один билет внутри бронирования. `qr_token` выставляется ровно один раз,
/// после перевода бронирования в `complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingItem {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub ticket_id: Uuid,
    pub seat_id: Uuid,
    pub price: i64,
    pub qr_token: Option<String>,
    pub qr_url: Option<String>,
    pub status: BookingItemStatus,
}

impl Record for BookingItem {
    const COLLECTION: Collection = Collection::BookingItems;
}
