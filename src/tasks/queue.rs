use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::{
    Claimed, QueueError, QueueName, Task, TaskDistributor, TaskEnvelope, TaskOptions, TaskQueue, DEAD_LETTER_KEY,
    DELAYED_KEY, PROCESSING_KEY,
};
use crate::redis_client::RedisClient;

/// Сколько отложенных задач переносится за один вызов.
const PROMOTE_BATCH: usize = 100;

// KEYS[1] delayed, KEYS[2] dead letter; ARGV[1] сейчас (мс), ARGV[2] размер пачки
const PROMOTE_SCRIPT: &str = r#"
    local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
    for _, raw in ipairs(due) do
        redis.call('ZREM', KEYS[1], raw)
        local ok, envelope = pcall(cjson.decode, raw)
        if ok and type(envelope) == 'table' and type(envelope.queue) == 'string' then
            redis.call('LPUSH', 'tasks:' .. envelope.queue, raw)
        else
            redis.call('LPUSH', KEYS[2], raw)
        end
    end
    return #due
"#;

// KEYS[1] processing, KEYS[2] очередь; ARGV[1] задача.
// Возвращаем только то, что всё ещё числится в обработке
const RECOVER_SCRIPT: &str = r#"
    if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 1 then
        redis.call('RPUSH', KEYS[2], ARGV[1])
        return 1
    end
    return 0
"#;

/// Очередь задач на списках Redis: LPUSH при постановке, LMOVE в
/// `tasks:processing` при выборке (FIFO), LREM после исхода.
#[derive(Clone)]
pub struct RedisTaskQueue {
    redis: RedisClient,
    promote: redis::Script,
    recover: redis::Script,
}

impl RedisTaskQueue {
    pub fn new(redis: RedisClient) -> Self {
        Self {
            redis,
            promote: redis::Script::new(PROMOTE_SCRIPT),
            recover: redis::Script::new(RECOVER_SCRIPT),
        }
    }

    async fn push(&self, key: &str, envelope: &TaskEnvelope) -> Result<(), QueueError> {
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.redis.conn.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(key)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Длины очередей, для health-check и логов.
    pub async fn depths(&self) -> Result<Vec<(QueueName, i64)>, QueueError> {
        let mut conn = self.redis.conn.clone();
        let mut depths = Vec::with_capacity(QueueName::PRIORITY.len());
        for queue in QueueName::PRIORITY {
            let len: i64 = redis::cmd("LLEN").arg(queue.key()).query_async(&mut conn).await?;
            depths.push((queue, len));
        }
        Ok(depths)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl TaskDistributor for RedisTaskQueue {
    async fn distribute(&self, task: Task, options: TaskOptions) -> Result<(), QueueError> {
        let envelope = TaskEnvelope::new(task, options);
        self.push(options.queue.key(), &envelope).await?;
        debug!(task_id = %envelope.id, task = envelope.task.name(), queue = options.queue.key(), "task pushed");
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn claim(&self) -> Result<Option<Claimed>, QueueError> {
        let mut conn = self.redis.conn.clone();

        for queue in QueueName::PRIORITY {
            let raw: Option<String> = redis::cmd("LMOVE")
                .arg(queue.key())
                .arg(PROCESSING_KEY)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;
            let Some(raw) = raw else { continue };

            match serde_json::from_str::<TaskEnvelope>(&raw) {
                Ok(envelope) => return Ok(Some(Claimed { envelope, receipt: raw })),
                Err(e) => {
                    // Нечитаемое сообщение не ретраим, сохраняем как есть
                    error!(queue = queue.key(), error = %e, "malformed task payload, moving to dead letter");
                    let _: () = redis::pipe()
                        .atomic()
                        .cmd("LREM")
                        .arg(PROCESSING_KEY)
                        .arg(1)
                        .arg(&raw)
                        .ignore()
                        .cmd("LPUSH")
                        .arg(DEAD_LETTER_KEY)
                        .arg(&raw)
                        .ignore()
                        .query_async(&mut conn)
                        .await?;
                }
            }
        }
        Ok(None)
    }

    async fn ack(&self, claimed: &Claimed) -> Result<(), QueueError> {
        let mut conn = self.redis.conn.clone();
        let removed: i64 = redis::cmd("LREM")
            .arg(PROCESSING_KEY)
            .arg(1)
            .arg(&claimed.receipt)
            .query_async(&mut conn)
            .await?;
        if removed == 0 {
            warn!(task_id = %claimed.envelope.id, "acked task was not in flight, it may run again");
        }
        Ok(())
    }

    async fn schedule(&self, envelope: TaskEnvelope, delay: Duration) -> Result<(), QueueError> {
        let due = now_ms().saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX));
        let payload = serde_json::to_string(&envelope)?;
        let mut conn = self.redis.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(DELAYED_KEY)
            .arg(due)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, envelope: TaskEnvelope) -> Result<(), QueueError> {
        warn!(
            task_id = %envelope.id,
            task = envelope.task.name(),
            attempts = envelope.attempt,
            last_error = envelope.last_error.as_deref().unwrap_or(""),
            "task moved to dead letter"
        );
        self.push(DEAD_LETTER_KEY, &envelope).await
    }

    async fn promote_due(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.conn.clone();
        let promoted: usize = self
            .promote
            .key(DELAYED_KEY)
            .key(DEAD_LETTER_KEY)
            .arg(now_ms())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;
        Ok(promoted)
    }

    /// Вызывается при старте, до запуска воркеров. Если рядом работает другой
    /// процесс, его текущие задачи тоже вернутся в очередь и выполнятся повторно.
    async fn recover(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.conn.clone();
        let stranded: Vec<String> = redis::cmd("LRANGE")
            .arg(PROCESSING_KEY)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        let mut recovered = 0;
        for raw in stranded {
            let target = match serde_json::from_str::<TaskEnvelope>(&raw) {
                Ok(envelope) => envelope.queue.key(),
                Err(_) => DEAD_LETTER_KEY,
            };
            // RPUSH: брошенная задача встаёт в голову очереди
            let moved: i64 = self
                .recover
                .key(PROCESSING_KEY)
                .key(target)
                .arg(&raw)
                .invoke_async(&mut conn)
                .await?;
            recovered += usize::from(moved == 1);
        }
        Ok(recovered)
    }
}
