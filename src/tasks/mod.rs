//! Фоновые задачи: типизированные сообщения, очередь с приоритетами и воркеры.
//!
//! Обработчики задач должны быть идемпотентны: доставка at-least-once,
//! задача может быть выполнена повторно после сбоя воркера или ретрая.
//!
//! Жизнь задачи в Redis: очередь → `tasks:processing` (взята воркером) →
//! ack. Повтор ждёт в `tasks:delayed`, откуда его переносит любой воркер,
//! когда подойдёт срок. Процесс, упавший посреди задачи, оставляет её в
//! `tasks:processing`; при следующем старте она возвращается в очередь.

pub mod processor;
pub mod queue;
pub mod worker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

use crate::models::LedgerSource;
use crate::services::notify::Notification;

pub use processor::{TaskError, TaskProcessor};
pub use queue::RedisTaskQueue;
pub use worker::{Outcome, TaskWorker};

/// Список, куда попадают задачи, исчерпавшие попытки.
pub const DEAD_LETTER_KEY: &str = "tasks:dead";
/// Задачи, взятые воркерами и ещё не подтверждённые.
pub const PROCESSING_KEY: &str = "tasks:processing";
/// Отложенные повторы: sorted set, score это срок в мс от эпохи.
pub const DELAYED_KEY: &str = "tasks:delayed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Critical,
    Default,
    Low,
}

impl QueueName {
    /// Порядок опроса: первая непустая очередь выигрывает.
    pub const PRIORITY: [QueueName; 3] = [QueueName::Critical, QueueName::Default, QueueName::Low];

    pub const fn key(self) -> &'static str {
        match self {
            QueueName::Critical => "tasks:critical",
            QueueName::Default => "tasks:default",
            QueueName::Low => "tasks:low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOptions {
    pub queue: QueueName,
    pub max_retry: u32,
}

/// Все виды фоновой работы. Один вариант на обработчик, диспетчер в
/// `TaskProcessor::process` обязан покрыть каждый.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    /// Сгенерировать QR-токены и ссылки для всех билетов оплаченного бронирования.
    PublishQr { booking_id: Uuid },
    /// Повторить записи после успешного списания (payment/booking/seats).
    ApplyPaymentSuccess { payment_id: Uuid },
    /// Intent создан, а запись Payment не сохранилась или бронирование откатилось.
    ReconcileIntent { payment_id: Uuid, intent_id: String },
    CancelIntent { intent_id: String },
    /// Перевести билеты бронирования в `expired` после возврата.
    ExpireTickets { booking_id: Uuid },
    /// Места, которые не удалось освободить синхронно (отмена, таймаут, откат).
    ReleaseSeats { seat_ids: Vec<Uuid>, customer_id: Uuid },
    /// Деньги списаны за бронирование, которое уже отменено или просрочено.
    AutoRefund { payment_id: Uuid },
    RecordPoints {
        customer_id: Uuid,
        delta: i64,
        source: LedgerSource,
        source_id: Uuid,
    },
    Notify { notification: Notification },
}

impl Task {
    pub fn queue(&self) -> QueueName {
        match self {
            Task::ApplyPaymentSuccess { .. } | Task::AutoRefund { .. } | Task::ReleaseSeats { .. } => {
                QueueName::Critical
            }
            Task::PublishQr { .. }
            | Task::ReconcileIntent { .. }
            | Task::CancelIntent { .. }
            | Task::ExpireTickets { .. } => QueueName::Default,
            Task::RecordPoints { .. } | Task::Notify { .. } => QueueName::Low,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Task::PublishQr { .. } => "publish_qr",
            Task::ApplyPaymentSuccess { .. } => "apply_payment_success",
            Task::ReconcileIntent { .. } => "reconcile_intent",
            Task::CancelIntent { .. } => "cancel_intent",
            Task::ExpireTickets { .. } => "expire_tickets",
            Task::ReleaseSeats { .. } => "release_seats",
            Task::AutoRefund { .. } => "auto_refund",
            Task::RecordPoints { .. } => "record_points",
            Task::Notify { .. } => "notify",
        }
    }

    pub fn options(&self, max_retry: u32) -> TaskOptions {
        TaskOptions {
            queue: self.queue(),
            max_retry,
        }
    }
}

/// То, что реально лежит в Redis: задача плюс счётчик попыток.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: Uuid,
    pub task: Task,
    pub queue: QueueName,
    pub attempt: u32,
    pub max_retry: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

const BACKOFF_BASE_MS: u64 = 200;
const BACKOFF_MAX: Duration = Duration::from_secs(30);

impl TaskEnvelope {
    pub fn new(task: Task, options: TaskOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            task,
            queue: options.queue,
            attempt: 0,
            max_retry: options.max_retry,
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }

    /// Следующая попытка или `None`, если лимит исчерпан.
    pub fn retry(&self, error: &str) -> Option<Self> {
        if self.attempt >= self.max_retry {
            return None;
        }
        Some(Self {
            attempt: self.attempt + 1,
            last_error: Some(error.to_string()),
            ..self.clone()
        })
    }

    /// Экспоненциальная задержка перед попыткой `attempt`, с потолком.
    pub fn backoff(attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(16));
        Duration::from_millis(BACKOFF_BASE_MS.saturating_mul(factor)).min(BACKOFF_MAX)
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("task encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Постановка задач. Возвращается сразу, выполнение асинхронное.
#[async_trait]
pub trait TaskDistributor: Send + Sync {
    async fn distribute(&self, task: Task, options: TaskOptions) -> Result<(), QueueError>;
}

/// Задача, взятая воркером. До `ack` остаётся в списке обрабатываемых.
#[derive(Debug, Clone)]
pub struct Claimed {
    pub envelope: TaskEnvelope,
    /// То, что лежит в списке обрабатываемых; по нему задача оттуда снимается.
    pub receipt: String,
}

/// Источник задач для воркеров.
#[async_trait]
pub trait TaskQueue: TaskDistributor {
    /// Следующая задача по приоритету. Переносится в обрабатываемые, а не удаляется.
    async fn claim(&self) -> Result<Option<Claimed>, QueueError>;
    /// Снимает задачу из обрабатываемых. Вызывать после того, как записан её исход.
    async fn ack(&self, claimed: &Claimed) -> Result<(), QueueError>;
    /// Повтор через `delay`. Ожидание хранится в очереди, а не в процессе.
    async fn schedule(&self, envelope: TaskEnvelope, delay: Duration) -> Result<(), QueueError>;
    async fn dead_letter(&self, envelope: TaskEnvelope) -> Result<(), QueueError>;
    /// Переносит повторы с наступившим сроком в их очереди.
    async fn promote_due(&self) -> Result<usize, QueueError>;
    /// Возвращает в очереди задачи, брошенные предыдущим запуском.
    async fn recover(&self) -> Result<usize, QueueError>;
}

/// Ставит задачу в очередь. Сбой постановки только логируется:
/// фоновая работа не должна ронять основной запрос.
pub async fn distribute_or_log(distributor: &dyn TaskDistributor, task: Task, max_retry: u32) {
    let name = task.name();
    let options = task.options(max_retry);
    match distributor.distribute(task, options).await {
        Ok(()) => debug!(task = name, queue = options.queue.key(), "task enqueued"),
        Err(e) => error!(task = name, error = %e, "failed to enqueue task"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tasks_serialize_with_kind_tag() {
        let id = Uuid::nil();
        let value = serde_json::to_value(Task::PublishQr { booking_id: id }).unwrap();
        assert_eq!(value, json!({"kind": "publish_qr", "booking_id": id}));

        let back: Task = serde_json::from_value(json!({"kind": "cancel_intent", "intent_id": "pi_1"})).unwrap();
        assert_eq!(back, Task::CancelIntent { intent_id: "pi_1".into() });
    }

    #[test]
    fn retry_stops_at_max() {
        let env = TaskEnvelope::new(
            Task::ReleaseSeats { seat_ids: vec![Uuid::new_v4()], customer_id: Uuid::new_v4() },
            TaskOptions { queue: QueueName::Critical, max_retry: 2 },
        );
        let first = env.retry("boom").unwrap();
        let second = first.retry("boom").unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.last_error.as_deref(), Some("boom"));
        assert!(second.retry("boom").is_none());
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        assert_eq!(TaskEnvelope::backoff(0), Duration::from_millis(200));
        assert_eq!(TaskEnvelope::backoff(3), Duration::from_millis(1600));
        assert_eq!(TaskEnvelope::backoff(40), Duration::from_secs(30));
    }

    #[test]
    fn queue_keys_follow_serialized_names() {
        // Скрипт переноса отложенных задач строит ключ из поля `queue`
        for queue in QueueName::PRIORITY {
            let name = serde_json::to_value(queue).unwrap();
            assert_eq!(queue.key(), format!("tasks:{}", name.as_str().unwrap()));
        }
    }

    #[test]
    fn money_moving_tasks_go_first() {
        assert_eq!(Task::AutoRefund { payment_id: Uuid::nil() }.queue(), QueueName::Critical);
        assert_eq!(QueueName::PRIORITY[0].key(), "tasks:critical");
        assert_eq!(QueueName::PRIORITY[2].key(), "tasks:low");
    }
}
