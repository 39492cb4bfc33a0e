use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use super::Task;
use crate::error::AppError;
use crate::services::{
    booking::{BookingSaga, RefundRequester},
    notify::{NotifyError, Notifier},
    pricing::PricingEngine,
};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    App(#[from] AppError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
}

impl TaskError {
    /// Повторять имеет смысл только инфраструктурные сбои.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::App(AppError::Upstream(_) | AppError::Internal(_)) => true,
            TaskError::App(_) => false,
            TaskError::Notify(_) => true,
        }
    }
}

/// Единственный диспетчер фоновых задач.
pub struct TaskProcessor {
    saga: Arc<BookingSaga>,
    pricing: PricingEngine,
    notifier: Arc<dyn Notifier>,
}

impl TaskProcessor {
    pub fn new(saga: Arc<BookingSaga>, pricing: PricingEngine, notifier: Arc<dyn Notifier>) -> Self {
        Self { saga, pricing, notifier }
    }

    pub async fn process(&self, task: Task) -> Result<(), TaskError> {
        match task {
            Task::PublishQr { booking_id } => {
                let issued = self.saga.publish_qr(booking_id).await?;
                info!(%booking_id, issued, "QR tickets published");
            }
            Task::ApplyPaymentSuccess { payment_id } => self.saga.apply_payment_success(payment_id).await?,
            Task::ReconcileIntent { payment_id, intent_id } => {
                self.saga.reconcile_intent(payment_id, &intent_id).await?
            }
            Task::CancelIntent { intent_id } => self.saga.cancel_intent(&intent_id).await?,
            Task::ExpireTickets { booking_id } => {
                let expired = self.saga.expire_tickets(booking_id).await?;
                info!(%booking_id, expired, "tickets expired");
            }
            Task::ReleaseSeats { seat_ids, customer_id } => self.saga.release_seats(&seat_ids, customer_id).await?,
            Task::AutoRefund { payment_id } => match self.saga.refund(payment_id, RefundRequester::System).await {
                Ok(refund) => {
                    info!(%payment_id, refund_id = %refund.id, status = ?refund.status, "auto refund processed")
                }
                // Повторная доставка: возврат уже сделан
                Err(AppError::Conflict(reason)) => info!(%payment_id, %reason, "auto refund skipped"),
                Err(e) => return Err(e.into()),
            },
            Task::RecordPoints {
                customer_id,
                delta,
                source,
                source_id,
            } => self.pricing.record_points(customer_id, delta, source, source_id).await?,
            Task::Notify { notification } => self.notifier.notify(&notification).await?,
        }
        Ok(())
    }
}
