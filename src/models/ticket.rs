use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{Collection, Record};

/// Тип билета: цена и зона зала для конкретного события.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub event_id: Uuid,
    pub zone_id: Uuid,
    pub base_price: i64,
    pub event_schedule_id: Option<Uuid>,
}

impl Record for Ticket {
    const COLLECTION: Collection = Collection::Tickets;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSchedule {
    pub id: Uuid,
    pub event_id: Uuid,
    pub start_checkin_time: Option<DateTime<Utc>>,
    pub end_checkin_time: Option<DateTime<Utc>>,
}

impl Record for EventSchedule {
    const COLLECTION: Collection = Collection::EventSchedules;
}
