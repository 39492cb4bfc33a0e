//! booking.rs
//!
//! Сага "бронирование → оплата → билеты" поверх хранилища без транзакций.
//!
//! Каждый многошаговый сценарий это последовательность прямых шагов. Шаг с
//! побочным эффектом регистрирует компенсацию в `Compensations`; при первой
//! ошибке список откатывается в обратном порядке, и вызывающему возвращается
//! исходная ошибка. Всё, что не нужно для ответа (QR, баллы, уведомления,
//! повтор записей после списания), уходит в очередь задач.

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::HashMap, collections::HashSet, sync::Arc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{
    Booking, BookingItem, BookingItemStatus, BookingStatus, LedgerSource, Payment, PaymentStatus, Refund,
    RefundReason, RefundStatus, Ticket,
};
use crate::services::notify::{Notification, NotificationKind};
use crate::services::payment::{
    decline_message, validate_amount, GatewayRefundStatus, IntentStatus, PaymentGateway, REFUND_REASON,
};
use crate::services::pricing::{self, PricingEngine};
use crate::services::seats::SeatReservations;
use crate::store::{Filter, Store, StoreError};
use crate::tasks::{distribute_or_log, Task, TaskDistributor};
use crate::token::{check_in_url, TokenCodec};

/// Параметры саги, вынутые из общей конфигурации.
#[derive(Debug, Clone)]
pub struct SagaConfig {
    pub currency: String,
    pub min_amount: i64,
    pub max_amount: i64,
    pub max_retry: u32,
    pub checkin_base_url: String,
}

impl SagaConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            currency: config.payment.currency.clone(),
            min_amount: config.payment.min_amount,
            max_amount: config.payment.max_amount,
            max_retry: config.worker.max_retry,
            checkin_base_url: config.ticket.checkin_base_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatSelection {
    pub ticket_id: Uuid,
    pub seat_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct CreateBooking {
    pub customer_id: Uuid,
    pub event_id: Uuid,
    pub items: Vec<SeatSelection>,
}

/// Открытая попытка оплаты: то, что клиент передаёт в платёжную форму.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentSession {
    pub payment_id: Uuid,
    pub transaction_id: String,
    pub client_secret: Option<String>,
    pub subtotal: i64,
    pub fee_percent: i64,
    pub amount: i64,
    pub currency: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookingCreated {
    pub booking: Booking,
    pub items: Vec<BookingItem>,
    pub payment: PaymentSession,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentConfirmed {
    pub payment_id: Uuid,
    pub booking_id: Uuid,
    pub amount: i64,
    pub status: PaymentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundRequester {
    /// Возврат по просьбе клиента: проверка владельца и окна полного возврата.
    Customer(Uuid),
    /// Автовозврат (отмена события, оплата просроченной брони): всегда полный.
    System,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Итог записей после успешного списания.
#[derive(Debug, PartialEq, Eq)]
enum Finalized {
    Completed,
    /// Бронирование успело отмениться/протухнуть: деньги вернёт AutoRefund.
    Refunding,
    /// Место перезаписал конкурентный резерв: бронь отменена, деньги вернёт AutoRefund.
    SeatLost,
}

#[derive(Debug)]
enum Compensation {
    ReleaseSeat(Uuid),
    DeleteItem(Uuid),
    DeleteBooking(Uuid),
}

/// Компенсации одного вызова саги, в порядке выполнения шагов.
struct Compensations {
    customer_id: Uuid,
    steps: Vec<Compensation>,
}

impl Compensations {
    fn new(customer_id: Uuid) -> Self {
        Self { customer_id, steps: Vec::new() }
    }

    fn push(&mut self, step: Compensation) {
        self.steps.push(step);
    }

    /// Пропускает успешный результат шага дальше; на ошибке откатывает всё
    /// накопленное и возвращает исходную ошибку.
    async fn check<T>(&mut self, saga: &BookingSaga, result: AppResult<T>) -> AppResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(error = %err, steps = self.steps.len(), "saga step failed, compensating");
                self.unwind(saga).await;
                Err(err)
            }
        }
    }

    async fn unwind(&mut self, saga: &BookingSaga) {
        let mut unreleased = Vec::new();

        while let Some(step) = self.steps.pop() {
            let outcome = match &step {
                Compensation::ReleaseSeat(seat_id) => {
                    let released = saga.seats.release_held_by(*seat_id, self.customer_id).await;
                    if released.is_err() {
                        unreleased.push(*seat_id);
                    }
                    released
                }
                Compensation::DeleteItem(id) => saga.store.delete::<BookingItem>(*id).await.map_err(AppError::from),
                Compensation::DeleteBooking(id) => saga.store.delete::<Booking>(*id).await.map_err(AppError::from),
            };
            if let Err(e) = outcome {
                error!(?step, error = %e, "compensation failed");
            }
        }

        if !unreleased.is_empty() {
            saga.enqueue(Task::ReleaseSeats {
                seat_ids: unreleased,
                customer_id: self.customer_id,
            })
            .await;
        }
    }
}

/// Оркестратор бронирований и платежей.
pub struct BookingSaga {
    store: Store,
    gateway: Arc<dyn PaymentGateway>,
    seats: SeatReservations,
    pricing: PricingEngine,
    distributor: Arc<dyn TaskDistributor>,
    codec: TokenCodec,
    clock: Arc<dyn Clock>,
    config: SagaConfig,
}

impl BookingSaga {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        gateway: Arc<dyn PaymentGateway>,
        seats: SeatReservations,
        pricing: PricingEngine,
        distributor: Arc<dyn TaskDistributor>,
        codec: TokenCodec,
        clock: Arc<dyn Clock>,
        config: SagaConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            seats,
            pricing,
            distributor,
            codec,
            clock,
            config,
        }
    }

    async fn enqueue(&self, task: Task) {
        distribute_or_log(self.distributor.as_ref(), task, self.config.max_retry).await;
    }

    async fn notify(&self, customer_id: Uuid, booking_id: Uuid, kind: NotificationKind) {
        self.enqueue(Task::Notify {
            notification: Notification::new(customer_id, booking_id, kind),
        })
        .await;
    }

    async fn load_booking(&self, booking_id: Uuid) -> AppResult<Booking> {
        self.store
            .find::<Booking>(booking_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("booking {booking_id}")))
    }

    async fn load_payment(&self, payment_id: Uuid) -> AppResult<Payment> {
        self.store
            .find::<Payment>(payment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("payment {payment_id}")))
    }

    async fn booking_items(&self, booking_id: Uuid) -> AppResult<Vec<BookingItem>> {
        Ok(self
            .store
            .find_where(&Filter::new().eq("booking_id", booking_id), &["id"])
            .await?)
    }

    async fn booking_payments(&self, booking_id: Uuid) -> AppResult<Vec<Payment>> {
        Ok(self
            .store
            .find_where(&Filter::new().eq("booking_id", booking_id), &["created_at"])
            .await?)
    }

    fn owned_by(booking: &Booking, customer_id: Uuid) -> AppResult<()> {
        if booking.customer_id != customer_id {
            return Err(AppError::Forbidden);
        }
        Ok(())
    }

    // --- CreateBooking ---

    pub async fn create_booking(&self, cmd: CreateBooking) -> AppResult<BookingCreated> {
        if cmd.items.is_empty() {
            return Err(AppError::InvalidInput("at least one seat is required".into()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = cmd.items.iter().find(|i| !seen.insert(i.seat_id)) {
            return Err(AppError::InvalidInput(format!("seat {} is selected twice", dup.seat_id)));
        }

        // 1. Все билеты должны относиться к одному событию. Побочных эффектов ещё нет.
        let mut tickets: HashMap<Uuid, Ticket> = HashMap::new();
        for item in &cmd.items {
            if tickets.contains_key(&item.ticket_id) {
                continue;
            }
            let ticket = self
                .store
                .find::<Ticket>(item.ticket_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("ticket {}", item.ticket_id)))?;
            if ticket.event_id != cmd.event_id {
                return Err(AppError::InvalidInput(format!(
                    "ticket {} does not belong to event {}",
                    ticket.id, cmd.event_id
                )));
            }
            tickets.insert(ticket.id, ticket);
        }
        let settings = self.store.settings().await?;

        let mut comp = Compensations::new(cmd.customer_id);

        // 2. Резервируем места по одному
        for item in &cmd.items {
            let ticket = &tickets[&item.ticket_id];
            let reserved = self.seats.reserve_with_ticket(item.seat_id, ticket, cmd.customer_id).await;
            comp.check(self, reserved).await?;
            comp.push(Compensation::ReleaseSeat(item.seat_id));
        }

        // 3. Бронирование
        let now = self.clock.now();
        let booking = Booking {
            id: Uuid::new_v4(),
            customer_id: cmd.customer_id,
            event_id: cmd.event_id,
            status: BookingStatus::Pending,
            created_at: now,
            expires_at: now + Duration::minutes(settings.max_reservation_hold_minutes),
        };
        let created = self.store.create(&booking).await.map_err(AppError::from);
        let booking = comp.check(self, created).await?;
        comp.push(Compensation::DeleteBooking(booking.id));

        // 4. Позиции по ценам со скидкой участника
        let discount = self.pricing.membership_discount(cmd.customer_id).await;
        let discount = comp.check(self, discount).await?;

        let mut items = Vec::with_capacity(cmd.items.len());
        for selection in &cmd.items {
            let ticket = &tickets[&selection.ticket_id];
            let item = BookingItem {
                id: Uuid::new_v4(),
                booking_id: booking.id,
                ticket_id: ticket.id,
                seat_id: selection.seat_id,
                price: pricing::price(ticket.base_price, discount),
                qr_token: None,
                qr_url: None,
                status: BookingItemStatus::Valid,
            };
            let created = self.store.create(&item).await.map_err(AppError::from);
            let item = comp.check(self, created).await?;
            comp.push(Compensation::DeleteItem(item.id));
            items.push(item);
        }

        // Арбитраж гонки: резерв мог перезаписать конкурентный запрос
        for item in &items {
            let held = self.seats.verify_hold(item.seat_id, cmd.customer_id).await;
            if !comp.check(self, held).await? {
                info!(seat_id = %item.seat_id, booking_id = %booking.id, "seat hold lost to a concurrent booking");
                let lost: AppResult<()> = Err(AppError::Conflict("seat was taken by another customer".into()));
                comp.check(self, lost).await?;
            }
        }

        // 5–7. Сумма, intent, платёж
        let subtotal: i64 = items.iter().map(|i| i.price).sum();
        let opened = self.open_payment(&booking, subtotal, settings.payment_fee_percent).await;
        let payment = comp.check(self, opened).await?;

        info!(
            booking_id = %booking.id,
            customer_id = %booking.customer_id,
            seats = items.len(),
            amount = payment.amount,
            "🎫 booking created"
        );
        self.notify(booking.customer_id, booking.id, NotificationKind::BookingCreated).await;

        Ok(BookingCreated {
            booking,
            items,
            payment,
        })
    }

    /// Шаги 5–7: граница суммы, intent с ключом идемпотентности, запись Payment.
    async fn open_payment(&self, booking: &Booking, subtotal: i64, fee_percent: i64) -> AppResult<PaymentSession> {
        let amount = pricing::total_with_fee(subtotal, fee_percent);
        validate_amount(amount, self.config.min_amount, self.config.max_amount)?;

        // id платежа известен до записи и служит ключом идемпотентности
        let payment_id = Uuid::new_v4();
        let intent = self
            .gateway
            .create_intent(amount, &self.config.currency, &payment_id.to_string())
            .await?;
        debug!(%payment_id, intent_id = %intent.id, amount, "payment intent created");

        let payment = Payment {
            id: payment_id,
            booking_id: booking.id,
            transaction_id: intent.id.clone(),
            client_secret: intent.client_secret.clone(),
            amount,
            method: None,
            status: PaymentStatus::Pending,
            failure_reason: None,
            created_at: self.clock.now(),
        };

        if let Err(e) = self.store.create(&payment).await {
            // Intent уже существует. Не удаляем: сверка решит, отменить его или пометить платёж
            error!(%payment_id, intent_id = %intent.id, error = %e, "failed to persist payment");
            self.enqueue(Task::ReconcileIntent {
                payment_id,
                intent_id: intent.id,
            })
            .await;
            return Err(e.into());
        }

        Ok(PaymentSession {
            payment_id,
            transaction_id: intent.id,
            client_secret: intent.client_secret,
            subtotal,
            fee_percent,
            amount,
            currency: self.config.currency.clone(),
            expires_at: booking.expires_at,
        })
    }

    // --- CreatePayment (повтор оплаты) ---

    pub async fn create_payment(&self, customer_id: Uuid, booking_id: Uuid) -> AppResult<PaymentSession> {
        let booking = self.load_booking(booking_id).await?;
        Self::owned_by(&booking, customer_id)?;
        if booking.status != BookingStatus::Pending {
            return Err(AppError::Conflict(format!("booking is {:?}", booking.status).to_lowercase()));
        }
        if self.clock.now() >= booking.expires_at {
            return Err(AppError::Conflict("reservation hold has expired".into()));
        }

        let payments = self.booking_payments(booking_id).await?;
        if let Some(open) = payments.iter().find(|p| p.status != PaymentStatus::Failed) {
            return Err(AppError::Conflict(format!(
                "booking already has a {:?} payment",
                open.status
            ).to_lowercase()));
        }

        let items = self.booking_items(booking_id).await?;
        let subtotal: i64 = items.iter().map(|i| i.price).sum();
        let settings = self.store.settings().await?;

        let session = self.open_payment(&booking, subtotal, settings.payment_fee_percent).await?;
        info!(%booking_id, payment_id = %session.payment_id, "💳 new payment attempt opened");
        Ok(session)
    }

    // --- ConfirmPayment ---

    pub async fn confirm_payment(&self, customer_id: Uuid, payment_id: Uuid, method: &str) -> AppResult<PaymentConfirmed> {
        let payment = self.load_payment(payment_id).await?;
        let booking = self.load_booking(payment.booking_id).await?;
        Self::owned_by(&booking, customer_id)?;

        // 1. Только pending можно подтверждать
        match payment.status {
            PaymentStatus::Pending => {}
            PaymentStatus::Success => return Err(AppError::Conflict("payment is already completed".into())),
            PaymentStatus::Processing => {
                return Err(AppError::Conflict("payment confirmation is already in progress".into()))
            }
            PaymentStatus::Failed => {
                return Err(AppError::Conflict("payment has failed, create a new payment to retry".into()))
            }
        }
        if booking.status != BookingStatus::Pending {
            return Err(AppError::Conflict("booking is no longer awaiting payment".into()));
        }

        // 2. pending → processing. Второй конкурентный confirm увидит processing
        self.store
            .patch::<Payment>(payment_id, json!({"status": PaymentStatus::Processing, "method": method}))
            .await?;

        // 3. Шлюз
        let intent = match self.gateway.confirm_intent(&payment.transaction_id, method).await {
            Ok(intent) => intent,
            Err(e) => {
                error!(%payment_id, error = %e, "payment confirmation failed");
                self.revert_to_pending(payment_id, None).await;
                return Err(AppError::Upstream(e.to_string()));
            }
        };

        if intent.status != IntentStatus::Succeeded {
            let code = intent.failure_code().map(str::to_string);
            let reason = decline_message(code.as_deref());
            info!(%payment_id, status = ?intent.status, code = code.as_deref().unwrap_or("none"), "payment declined");
            self.revert_to_pending(payment_id, code).await;
            return Err(AppError::PaymentDeclined { reason: reason.to_string() });
        }

        // 4. Деньги списаны. Дальнейшие записи не атомарны, при сбое доделает задача
        info!(%payment_id, booking_id = %booking.id, amount = payment.amount, "✅ payment captured");
        match self.finalize(payment_id, Some(method)).await {
            Ok(Finalized::Completed) => self.after_payment(&booking, &payment).await,
            Ok(Finalized::Refunding) => {
                return Err(AppError::Conflict(
                    "booking expired before the payment completed, the amount will be refunded".into(),
                ))
            }
            Ok(Finalized::SeatLost) => {
                return Err(AppError::Conflict(
                    "a seat was taken by another customer, the amount will be refunded".into(),
                ))
            }
            Err(e) => {
                error!(%payment_id, error = %e, "post-payment writes failed, scheduling retry");
                self.enqueue(Task::ApplyPaymentSuccess { payment_id }).await;
            }
        }

        Ok(PaymentConfirmed {
            payment_id,
            booking_id: booking.id,
            amount: payment.amount,
            status: PaymentStatus::Success,
        })
    }

    async fn revert_to_pending(&self, payment_id: Uuid, failure_reason: Option<String>) {
        let patch = json!({"status": PaymentStatus::Pending, "failure_reason": failure_reason});
        if let Err(e) = self.store.patch::<Payment>(payment_id, patch).await {
            // Платёж останется в processing; сверка по таймауту его не тронет
            error!(%payment_id, error = %e, "failed to revert payment to pending");
        }
    }

    /// Идемпотентные записи после списания: payment → success, места → booked,
    /// booking → complete. Если бронь уже закрыта или место ушло конкуренту,
    /// свои места освобождаются и ставится автовозврат.
    async fn finalize(&self, payment_id: Uuid, method: Option<&str>) -> AppResult<Finalized> {
        let payment = self.load_payment(payment_id).await?;
        if payment.status != PaymentStatus::Success {
            let mut patch = json!({"status": PaymentStatus::Success, "failure_reason": null});
            if let Some(method) = method {
                patch["method"] = json!(method);
            }
            self.store.patch::<Payment>(payment_id, patch).await?;
        }

        let booking = self.load_booking(payment.booking_id).await?;
        if matches!(booking.status, BookingStatus::Canceled | BookingStatus::Timeout) {
            warn!(%payment_id, booking_id = %booking.id, status = ?booking.status, "payment captured for a closed booking, refunding");
            self.release_booking_seats(&booking).await?;
            self.enqueue(Task::AutoRefund { payment_id }).await;
            return Ok(Finalized::Refunding);
        }

        // Места раньше брони: complete без проданных мест не бывает
        for item in self.booking_items(booking.id).await? {
            match self.seats.mark_booked(item.seat_id, booking.customer_id).await {
                Ok(()) => {}
                Err(AppError::Conflict(reason)) => return self.seat_lost(&booking, payment_id, &reason).await,
                Err(e) => return Err(e),
            }
        }

        if booking.status == BookingStatus::Pending {
            self.store
                .patch::<Booking>(booking.id, json!({"status": BookingStatus::Complete}))
                .await?;
        }
        Ok(Finalized::Completed)
    }

    /// Проигранная гонка за место, обнаруженная только при оплате.
    async fn seat_lost(&self, booking: &Booking, payment_id: Uuid, reason: &str) -> AppResult<Finalized> {
        warn!(%payment_id, booking_id = %booking.id, reason, "seat lost to a concurrent booking after payment, refunding");
        self.store
            .patch::<Booking>(booking.id, json!({"status": BookingStatus::Canceled}))
            .await?;
        self.release_booking_seats(booking).await?;
        self.enqueue(Task::AutoRefund { payment_id }).await;
        self.notify(booking.customer_id, booking.id, NotificationKind::BookingCanceled).await;
        Ok(Finalized::SeatLost)
    }

    async fn after_payment(&self, booking: &Booking, payment: &Payment) {
        self.enqueue(Task::PublishQr { booking_id: booking.id }).await;
        self.enqueue(Task::RecordPoints {
            customer_id: booking.customer_id,
            delta: pricing::points_for_amount(payment.amount, self.pricing.points_unit()),
            source: LedgerSource::Payment,
            source_id: payment.id,
        })
        .await;
        self.notify(booking.customer_id, booking.id, NotificationKind::PaymentSucceeded).await;
    }

    /// Повтор записей после списания (фоновая задача).
    pub async fn apply_payment_success(&self, payment_id: Uuid) -> AppResult<()> {
        let payment = self.load_payment(payment_id).await?;

        if payment.status != PaymentStatus::Success {
            // Запись success могла не дойти: подтверждаем по шлюзу
            let intent = self.gateway.get_intent(&payment.transaction_id).await?;
            if intent.status != IntentStatus::Succeeded {
                return Err(AppError::InvalidState(format!(
                    "intent {} is {:?}, nothing to apply",
                    intent.id, intent.status
                )));
            }
        }

        if self.finalize(payment_id, None).await? == Finalized::Completed {
            let booking = self.load_booking(payment.booking_id).await?;
            self.after_payment(&booking, &payment).await;
        }
        Ok(())
    }

    // --- QR ---

    /// Выпускает QR для билетов без токена. Генерация параллельная; пакетная
    /// запись только если все токены получены. Возвращает число выпущенных.
    pub async fn publish_qr(&self, booking_id: Uuid) -> AppResult<usize> {
        let booking = self.load_booking(booking_id).await?;
        if booking.status != BookingStatus::Complete {
            return Err(AppError::InvalidState(format!("booking {booking_id} is not paid")));
        }

        let pending: Vec<BookingItem> = self
            .booking_items(booking_id)
            .await?
            .into_iter()
            .filter(|item| item.qr_token.is_none())
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let generated = join_all(pending.iter().map(|item| async move {
            let token = self.codec.generate(item.id)?;
            let url = check_in_url(&self.config.checkin_base_url, &token)?;
            Ok::<_, crate::token::TokenError>((item.id, token, url))
        }))
        .await;

        let (ok, failed): (Vec<_>, Vec<_>) = generated.into_iter().partition(Result::is_ok);
        if !failed.is_empty() {
            return Err(AppError::Internal(format!(
                "{} of {} QR tickets could not be generated for booking {booking_id}",
                failed.len(),
                pending.len()
            )));
        }

        let mut issued = 0;
        for (item_id, token, url) in ok.into_iter().flatten() {
            self.store
                .patch::<BookingItem>(item_id, json!({"qr_token": token, "qr_url": url}))
                .await?;
            issued += 1;
        }

        self.notify(booking.customer_id, booking_id, NotificationKind::TicketsIssued).await;
        Ok(issued)
    }

    // --- Refund ---

    /// Возврат в две фазы: строка `pending` с ключом идемпотентности, затем
    /// шлюз, затем исход в ту же строку. Повтор после любого сбоя продолжает
    /// незавершённую попытку с тем же ключом, и шлюз не вернёт деньги дважды.
    pub async fn refund(&self, payment_id: Uuid, requester: RefundRequester) -> AppResult<Refund> {
        let payment = self.load_payment(payment_id).await?;
        let booking = self.load_booking(payment.booking_id).await?;
        if let RefundRequester::Customer(customer_id) = requester {
            Self::owned_by(&booking, customer_id)?;
        }

        // 1.
        if payment.status != PaymentStatus::Success {
            return Err(AppError::InvalidState("only successful payments can be refunded".into()));
        }
        let refunds: Vec<Refund> = self
            .store
            .find_where(&Filter::new().eq("payment_id", payment_id), &["created_at"])
            .await?;
        if refunds.iter().any(|r| r.status == RefundStatus::Success) {
            return Err(AppError::Conflict("payment is already refunded".into()));
        }

        // 2. Незавершённая попытка продолжается, иначе открываем новую.
        // Номер попытки в ключе это число отказов до неё
        let failed = refunds.iter().filter(|r| r.status == RefundStatus::Failed).count();
        let attempt = match refunds.into_iter().find(|r| r.status == RefundStatus::Pending) {
            Some(pending) => {
                info!(%payment_id, refund_id = %pending.id, "resuming pending refund");
                pending
            }
            None => {
                let (amount, reason) = self.refund_amount(&payment, requester).await?;
                self.open_refund(payment_id, amount, reason, format!("{payment_id}:refund:{failed}"))
                    .await?
            }
        };

        // 3. Шлюз. Отказ шлюза это не ошибка транспорта, а refund со статусом failed
        let outcome = self
            .gateway
            .refund(&payment.transaction_id, REFUND_REASON, attempt.amount, &attempt.idempotency_key)
            .await?;
        let status = match outcome.status {
            GatewayRefundStatus::Succeeded => RefundStatus::Success,
            GatewayRefundStatus::Pending | GatewayRefundStatus::RequiresAction => RefundStatus::Pending,
            GatewayRefundStatus::Failed | GatewayRefundStatus::Canceled | GatewayRefundStatus::Unknown => {
                RefundStatus::Failed
            }
        };

        // 4. Исход. Если запись не дойдёт, повтор получит тот же ответ шлюза по ключу
        let refund: Refund = self
            .store
            .patch::<Refund>(
                attempt.id,
                json!({
                    "status": status,
                    "gateway_refund_id": outcome.id,
                    "failure_reason": outcome.failure_reason,
                }),
            )
            .await?;

        let amount = refund.amount;
        match refund.status {
            RefundStatus::Success => {
                info!(%payment_id, amount, reason = ?refund.reason, "💸 payment refunded");
                self.enqueue(Task::ExpireTickets { booking_id: booking.id }).await;
                // Баллы начислялись только за завершённое бронирование
                if booking.status == BookingStatus::Complete {
                    self.enqueue(Task::RecordPoints {
                        customer_id: booking.customer_id,
                        delta: -pricing::points_for_amount(amount, self.pricing.points_unit()),
                        source: LedgerSource::Refund,
                        source_id: refund.id,
                    })
                    .await;
                }
                self.notify(booking.customer_id, booking.id, NotificationKind::RefundSucceeded).await;
            }
            RefundStatus::Pending => info!(%payment_id, amount, "refund pending at gateway"),
            RefundStatus::Failed => {
                warn!(%payment_id, reason = refund.failure_reason.as_deref().unwrap_or("unknown"), "refund declined by gateway");
                self.notify(booking.customer_id, booking.id, NotificationKind::RefundFailed).await;
            }
        }
        Ok(refund)
    }

    async fn refund_amount(&self, payment: &Payment, requester: RefundRequester) -> AppResult<(i64, RefundReason)> {
        match requester {
            RefundRequester::Customer(_) => {
                let settings = self.store.settings().await?;
                let full_until = payment.created_at + Duration::hours(settings.max_full_refund_hours);
                let amount = if self.clock.now() > full_until {
                    payment.amount / 2
                } else {
                    payment.amount
                };
                Ok((amount, RefundReason::UserRequested))
            }
            RefundRequester::System => Ok((payment.amount, RefundReason::AutoRefund)),
        }
    }

    /// Создаёт строку `pending`. Ключ уникален: конкурентный запрос с тем же
    /// ключом получает уже открытую попытку.
    async fn open_refund(
        &self,
        payment_id: Uuid,
        amount: i64,
        reason: RefundReason,
        idempotency_key: String,
    ) -> AppResult<Refund> {
        let row = Refund {
            id: Uuid::new_v4(),
            payment_id,
            amount,
            reason,
            status: RefundStatus::Pending,
            idempotency_key,
            gateway_refund_id: None,
            failure_reason: None,
            created_at: self.clock.now(),
        };

        match self.store.create(&row).await {
            Ok(created) => Ok(created),
            Err(StoreError::Unique { .. }) => {
                debug!(%payment_id, key = %row.idempotency_key, "refund attempt already opened concurrently");
                let existing: Vec<Refund> = self
                    .store
                    .find_where(&Filter::new().eq("idempotency_key", &row.idempotency_key), &[])
                    .await?;
                existing
                    .into_iter()
                    .next()
                    .ok_or_else(|| AppError::Conflict("refund is already in progress".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Билеты возвращённого бронирования больше не проходят чекин.
    pub async fn expire_tickets(&self, booking_id: Uuid) -> AppResult<usize> {
        let mut expired = 0;
        for item in self.booking_items(booking_id).await? {
            if item.status == BookingItemStatus::Valid {
                self.store
                    .patch::<BookingItem>(item.id, json!({"status": BookingItemStatus::Expired}))
                    .await?;
                expired += 1;
            }
        }
        Ok(expired)
    }

    // --- Cancel / timeout ---

    pub async fn cancel_booking(&self, customer_id: Uuid, booking_id: Uuid) -> AppResult<Booking> {
        let booking = self.load_booking(booking_id).await?;
        Self::owned_by(&booking, customer_id)?;

        match booking.status {
            BookingStatus::Pending => {}
            BookingStatus::Complete => {
                return Err(AppError::Conflict("paid bookings cannot be canceled, request a refund".into()))
            }
            BookingStatus::Canceled | BookingStatus::Timeout => {
                return Err(AppError::Conflict("booking is already closed".into()))
            }
        }

        let payments = self.booking_payments(booking_id).await?;
        if payments.iter().any(|p| p.status == PaymentStatus::Processing) {
            return Err(AppError::Conflict("payment confirmation is in progress".into()));
        }

        let canceled = self
            .store
            .patch::<Booking>(booking_id, json!({"status": BookingStatus::Canceled}))
            .await?;
        self.close_booking(&booking, &payments).await;

        info!(%booking_id, %customer_id, "🚫 booking canceled");
        self.notify(customer_id, booking_id, NotificationKind::BookingCanceled).await;
        Ok(canceled)
    }

    /// Фоновая сверка: pending-бронирования старше окна удержания → timeout.
    pub async fn sweep_expired_bookings(&self) -> AppResult<SweepReport> {
        let settings = self.store.settings().await?;
        let cutoff = self.clock.now() - Duration::minutes(settings.max_reservation_hold_minutes);
        let stale: Vec<Booking> = self
            .store
            .find_where(
                &Filter::new()
                    .eq("status", BookingStatus::Pending)
                    .lt("created_at", cutoff),
                &["created_at"],
            )
            .await?;

        let mut report = SweepReport::default();
        for booking in stale {
            match self.expire_booking(&booking).await {
                Ok(true) => report.expired += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    error!(booking_id = %booking.id, error = %e, "failed to expire booking");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn expire_booking(&self, booking: &Booking) -> AppResult<bool> {
        let payments = self.booking_payments(booking.id).await?;
        if payments.iter().any(|p| p.status == PaymentStatus::Processing) {
            // Идёт подтверждение: решит его исход, не таймаут
            debug!(booking_id = %booking.id, "payment in progress, skipping timeout");
            return Ok(false);
        }

        self.store
            .patch::<Booking>(booking.id, json!({"status": BookingStatus::Timeout}))
            .await?;
        self.close_booking(booking, &payments).await;

        info!(booking_id = %booking.id, "⏰ booking timed out");
        self.notify(booking.customer_id, booking.id, NotificationKind::BookingTimedOut).await;
        Ok(true)
    }

    /// Общий хвост отмены и таймаута: места и незавершённые платежи.
    async fn close_booking(&self, booking: &Booking, payments: &[Payment]) {
        if let Err(e) = self.release_booking_seats(booking).await {
            error!(booking_id = %booking.id, error = %e, "failed to release booking seats");
        }

        for payment in payments.iter().filter(|p| p.status == PaymentStatus::Pending) {
            if let Err(e) = self
                .store
                .patch::<Payment>(payment.id, json!({"status": PaymentStatus::Failed, "failure_reason": "booking closed"}))
                .await
            {
                warn!(payment_id = %payment.id, error = %e, "failed to mark payment failed");
            }
            self.enqueue(Task::CancelIntent {
                intent_id: payment.transaction_id.clone(),
            })
            .await;
        }
    }

    /// Освобождает места бронирования; то, что не удалось, уходит в задачу.
    pub async fn release_booking_seats(&self, booking: &Booking) -> AppResult<()> {
        let items = self.booking_items(booking.id).await?;
        let seat_ids: Vec<Uuid> = items.iter().map(|i| i.seat_id).collect();
        if let Err(e) = self.release_seats(&seat_ids, booking.customer_id).await {
            warn!(booking_id = %booking.id, error = %e, "seat release incomplete, scheduling retry");
            self.enqueue(Task::ReleaseSeats {
                seat_ids,
                customer_id: booking.customer_id,
            })
            .await;
        }
        Ok(())
    }

    /// Пытается освободить все места; возвращает первую ошибку.
    pub async fn release_seats(&self, seat_ids: &[Uuid], customer_id: Uuid) -> AppResult<()> {
        let mut first_error = None;
        for seat_id in seat_ids {
            if let Err(e) = self.seats.release_held_by(*seat_id, customer_id).await {
                warn!(%seat_id, error = %e, "seat release failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // --- Сверка с шлюзом ---

    /// Intent создан, но судьба записи Payment неизвестна.
    pub async fn reconcile_intent(&self, payment_id: Uuid, intent_id: &str) -> AppResult<()> {
        let intent = self.gateway.get_intent(intent_id).await?;
        let payment = self.store.find::<Payment>(payment_id).await?;

        match payment {
            None => {
                if intent.status.is_cancelable() {
                    self.gateway.cancel_intent(intent_id).await?;
                    info!(%payment_id, intent_id, "orphaned intent canceled");
                }
            }
            Some(payment) if intent.status != IntentStatus::Succeeded => {
                if payment.status != PaymentStatus::Failed {
                    self.store
                        .patch::<Payment>(
                            payment_id,
                            json!({"status": PaymentStatus::Failed, "failure_reason": "reconciled"}),
                        )
                        .await?;
                }
                if intent.status.is_cancelable() {
                    self.gateway.cancel_intent(intent_id).await?;
                }
                info!(%payment_id, intent_id, "payment reconciled as failed");
            }
            Some(_) => warn!(%payment_id, intent_id, "intent succeeded during reconciliation"),
        }
        Ok(())
    }

    pub async fn cancel_intent(&self, intent_id: &str) -> AppResult<()> {
        let intent = self.gateway.get_intent(intent_id).await?;
        if intent.status.is_cancelable() {
            self.gateway.cancel_intent(intent_id).await?;
            info!(intent_id, "payment intent canceled");
        } else {
            debug!(intent_id, status = ?intent.status, "intent not cancelable, skipping");
        }
        Ok(())
    }
}
