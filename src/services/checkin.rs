use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::models::{BookingItem, BookingItemStatus, Checkin, EventSchedule, Ticket};
use crate::services::identity::IdentityProvider;
use crate::store::{Store, StoreError};
use crate::token::TokenCodec;

#[derive(Debug, Clone)]
pub struct CheckinRequest {
    pub email: String,
    pub password: String,
    pub device: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckinAccepted {
    pub checkin: Checkin,
    pub booking_item_id: Uuid,
    pub seat_id: Uuid,
    pub ticket_id: Uuid,
}

/// Проверка QR на входе: сотрудник, токен, окно чекина, статус билета.
pub struct CheckinValidator {
    store: Store,
    identity: Arc<dyn IdentityProvider>,
    codec: TokenCodec,
    clock: Arc<dyn Clock>,
    staff_role: String,
}

impl CheckinValidator {
    pub fn new(
        store: Store,
        identity: Arc<dyn IdentityProvider>,
        codec: TokenCodec,
        clock: Arc<dyn Clock>,
        staff_role: impl Into<String>,
    ) -> Self {
        Self {
            store,
            identity,
            codec,
            clock,
            staff_role: staff_role.into(),
        }
    }

    pub async fn check_in(&self, req: CheckinRequest) -> AppResult<CheckinAccepted> {
        // 1–2. Сотрудник
        let staff = self.identity.login(&req.email, &req.password).await?;
        if staff.role != self.staff_role {
            warn!(user_id = %staff.user_id, role = %staff.role, "check-in attempted without staff role");
            return Err(AppError::Forbidden);
        }

        // 3. Токен. Причина отказа наружу не уходит
        let item_id = self.codec.verify(&req.token)?;

        // 4. Билет и расписание
        let item = self
            .store
            .find::<BookingItem>(item_id)
            .await?
            .ok_or_else(|| AppError::NotFound("ticket".into()))?;
        let schedule = self.schedule_for(&item).await?;
        let (Some(start), Some(end)) = (schedule.start_checkin_time, schedule.end_checkin_time) else {
            error!(schedule_id = %schedule.id, "event schedule has no check-in window");
            return Err(AppError::Internal(format!("schedule {} has no check-in window", schedule.id)));
        };

        // 5. Окно
        let now = self.clock.now();
        if now < start {
            return Err(AppError::InvalidRequest("check-in has not opened yet".into()));
        }
        if now > end {
            return Err(AppError::InvalidRequest("check-in is closed".into()));
        }

        // 6. Повторный проход по тому же QR
        match item.status {
            BookingItemStatus::Valid => {}
            BookingItemStatus::Used => return Err(AppError::InvalidRequest("ticket has already been used".into())),
            BookingItemStatus::Expired => return Err(AppError::InvalidRequest("ticket is no longer valid".into())),
        }

        // 7. Уникальность booking_item_id в хранилище решает гонку двух сканов
        let checkin = Checkin {
            id: Uuid::new_v4(),
            booking_item_id: item.id,
            staff_id: staff.user_id,
            device: req.device,
            created_at: now,
        };
        let checkin = match self.store.create(&checkin).await {
            Ok(created) => created,
            Err(StoreError::Unique { .. }) => {
                return Err(AppError::InvalidRequest("ticket has already been used".into()))
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self
            .store
            .patch::<BookingItem>(item.id, json!({"status": BookingItemStatus::Used}))
            .await
        {
            // Запись Checkin уже есть, повторный скан упрётся в уникальность
            error!(booking_item_id = %item.id, error = %e, "failed to mark ticket as used");
        }

        info!(booking_item_id = %item.id, staff_id = %staff.user_id, device = %checkin.device, "🚪 checked in");
        Ok(CheckinAccepted {
            booking_item_id: item.id,
            seat_id: item.seat_id,
            ticket_id: item.ticket_id,
            checkin,
        })
    }

    async fn schedule_for(&self, item: &BookingItem) -> AppResult<EventSchedule> {
        let ticket = self
            .store
            .find::<Ticket>(item.ticket_id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("ticket {} is missing", item.ticket_id)))?;
        let schedule_id = ticket
            .event_schedule_id
            .ok_or_else(|| AppError::Internal(format!("ticket {} has no schedule", ticket.id)))?;
        self.store
            .find::<EventSchedule>(schedule_id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("schedule {schedule_id} is missing")))
    }
}
