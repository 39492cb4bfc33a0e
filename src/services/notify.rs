use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::NotifyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    BookingCreated,
    PaymentSucceeded,
    TicketsIssued,
    BookingCanceled,
    BookingTimedOut,
    RefundSucceeded,
    RefundFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub customer_id: Uuid,
    pub booking_id: Uuid,
    pub kind: NotificationKind,
}

impl Notification {
    pub fn new(customer_id: Uuid, booking_id: Uuid, kind: NotificationKind) -> Self {
        Self { customer_id, booking_id, kind }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("notification endpoint rejected the message with {status}")]
    Rejected { status: u16 },
}

/// Доставка уведомлений клиенту. Каналы (почта, мессенджеры) за вебхуком.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

pub struct WebhookNotifier {
    url: String,
    http: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        Ok(Self {
            url: url.into(),
            http: reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self.http.post(&self.url).json(notification).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), kind = ?notification.kind, "notification webhook rejected message");
            return Err(NotifyError::Rejected { status: status.as_u16() });
        }
        Ok(())
    }
}

/// Заглушка, когда вебхук не настроен: уведомления только в лог.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            customer_id = %notification.customer_id,
            booking_id = %notification.booking_id,
            kind = ?notification.kind,
            "📨 notification"
        );
        Ok(())
    }
}

pub fn from_config(config: &NotifyConfig) -> Result<Arc<dyn Notifier>, NotifyError> {
    Ok(match &config.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(LogNotifier),
    })
}
