use std::sync::Arc;
use std::time::Duration;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use super::{QueueError, TaskEnvelope, TaskError, TaskProcessor, TaskQueue};
use crate::config::WorkerConfig;

/// Что делать с задачей после обработки.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    Done,
    Retry { envelope: TaskEnvelope, delay: Duration },
    Dead(TaskEnvelope),
}

/// Решение по результату обработчика. Неретраибельные ошибки сразу в dead letter.
pub fn decide(envelope: TaskEnvelope, result: Result<(), TaskError>) -> Outcome {
    let err = match result {
        Ok(()) => return Outcome::Done,
        Err(e) => e,
    };

    if !err.is_retryable() {
        let mut dead = envelope;
        dead.last_error = Some(err.to_string());
        return Outcome::Dead(dead);
    }

    match envelope.retry(&err.to_string()) {
        Some(next) => Outcome::Retry {
            delay: TaskEnvelope::backoff(next.attempt),
            envelope: next,
        },
        None => {
            let mut dead = envelope;
            dead.last_error = Some(err.to_string());
            Outcome::Dead(dead)
        }
    }
}

/// Пул воркеров: `concurrency` задач tokio, каждая опрашивает очередь.
#[derive(Clone)]
pub struct TaskWorker {
    queue: Arc<dyn TaskQueue>,
    processor: Arc<TaskProcessor>,
    config: WorkerConfig,
}

impl TaskWorker {
    pub fn new(queue: Arc<dyn TaskQueue>, processor: Arc<TaskProcessor>, config: WorkerConfig) -> Self {
        Self { queue, processor, config }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let workers = self.config.concurrency.max(1);
        info!("👷 Starting {} task workers", workers);

        (0..workers)
            .map(|n| {
                let worker = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(n, shutdown).await })
            })
            .collect()
    }

    async fn run(self, n: usize, mut shutdown: watch::Receiver<bool>) {
        let idle = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            if *shutdown.borrow() {
                break;
            }

            let processed = match self.run_once().await {
                Ok(processed) => processed,
                Err(e) => {
                    error!(worker = n, error = %e, "task queue unavailable");
                    false
                }
            };

            if !processed {
                tokio::select! {
                    _ = tokio::time::sleep(idle) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        info!(worker = n, "task worker stopped");
    }

    /// Забирает и обрабатывает одну задачу. `Ok(false)`, если очереди пусты.
    pub async fn run_once(&self) -> Result<bool, QueueError> {
        let promoted = self.queue.promote_due().await?;
        if promoted > 0 {
            debug!(promoted, "delayed tasks are due");
        }

        let Some(claimed) = self.queue.claim().await? else {
            return Ok(false);
        };

        let task_id = claimed.envelope.id;
        let name = claimed.envelope.task.name();
        let result = self.processor.process(claimed.envelope.task.clone()).await;

        // Сначала исход, потом ack: сбой между ними даёт повтор, а не потерю
        match decide(claimed.envelope.clone(), result) {
            Outcome::Done => info!(%task_id, task = name, "task done"),
            Outcome::Retry { envelope, delay } => {
                warn!(
                    %task_id,
                    task = name,
                    attempt = envelope.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = envelope.last_error.as_deref().unwrap_or(""),
                    "task failed, scheduling retry"
                );
                self.queue.schedule(envelope, delay).await?;
            }
            Outcome::Dead(envelope) => self.queue.dead_letter(envelope).await?,
        }
        self.queue.ack(&claimed).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::tasks::{QueueName, Task, TaskOptions};
    use uuid::Uuid;

    fn envelope(max_retry: u32) -> TaskEnvelope {
        TaskEnvelope::new(
            Task::ExpireTickets { booking_id: Uuid::new_v4() },
            TaskOptions { queue: QueueName::Default, max_retry },
        )
    }

    #[test]
    fn success_is_done() {
        assert_eq!(decide(envelope(3), Ok(())), Outcome::Done);
    }

    #[test]
    fn transient_errors_are_retried_with_backoff() {
        let result = Err(TaskError::App(AppError::Upstream("store down".into())));
        match decide(envelope(3), result) {
            Outcome::Retry { envelope, delay } => {
                assert_eq!(envelope.attempt, 1);
                assert_eq!(delay, TaskEnvelope::backoff(1));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn exhausted_or_permanent_errors_are_dead() {
        let transient = Err(TaskError::App(AppError::Upstream("store down".into())));
        assert!(matches!(decide(envelope(0), transient), Outcome::Dead(_)));

        let permanent = Err(TaskError::App(AppError::NotFound("booking".into())));
        match decide(envelope(5), permanent) {
            Outcome::Dead(env) => assert_eq!(env.last_error.as_deref(), Some("booking not found")),
            other => panic!("expected dead letter, got {other:?}"),
        }
    }
}
