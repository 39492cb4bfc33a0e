use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{Collection, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeatStatus {
    Empty,
    Reserved,
    Booked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seat {
    pub id: Uuid,
    pub zone_id: Uuid,
    pub number: String,
    pub status: SeatStatus,
    pub reserved_by: Option<Uuid>,
}

impl Record for Seat {
    const COLLECTION: Collection = Collection::Seats;
}
