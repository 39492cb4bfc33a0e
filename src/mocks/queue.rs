use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::tasks::{
    worker::decide, Claimed, Outcome, QueueError, QueueName, Task, TaskDistributor, TaskEnvelope, TaskOptions,
    TaskProcessor, TaskQueue,
};

#[derive(Default)]
struct Inner {
    pending: VecDeque<TaskEnvelope>,
    in_flight: Vec<TaskEnvelope>,
    delayed: Vec<(Instant, TaskEnvelope)>,
    history: Vec<Task>,
    dead: Vec<TaskEnvelope>,
}

/// Очередь в памяти: запоминает всё поставленное и умеет прогнать задачи
/// через процессор синхронно, без воркеров и задержек. Как `TaskQueue`
/// ведёт себя как Redis-очередь: приоритеты, обрабатываемые, отложенные
/// повторы по часам tokio.
#[derive(Clone, Default)]
pub struct RecordingDistributor {
    inner: Arc<Mutex<Inner>>,
}

impl RecordingDistributor {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Все задачи, когда-либо поставленные в очередь.
    pub fn tasks(&self) -> Vec<Task> {
        self.state().history.clone()
    }

    pub fn pending(&self) -> usize {
        self.state().pending.len()
    }

    /// Задачи, ждущие выборки, в порядке постановки.
    pub fn pending_tasks(&self) -> Vec<Task> {
        self.state().pending.iter().map(|e| e.task.clone()).collect()
    }

    pub fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }

    pub fn delayed(&self) -> usize {
        self.state().delayed.len()
    }

    pub fn dead(&self) -> Vec<TaskEnvelope> {
        self.state().dead.clone()
    }

    /// Обрабатывает задачи, пока очередь не опустеет. Ретраи ставятся сразу,
    /// без задержки. Возвращает число выполненных обработок.
    pub async fn drain(&self, processor: &TaskProcessor) -> usize {
        let mut processed = 0;
        loop {
            let next = self.state().pending.pop_front();
            let Some(envelope) = next else { break };
            let result = processor.process(envelope.task.clone()).await;
            processed += 1;

            match decide(envelope, result) {
                Outcome::Done => {}
                Outcome::Retry { envelope, .. } => self.state().pending.push_back(envelope),
                Outcome::Dead(envelope) => self.state().dead.push(envelope),
            }
        }
        processed
    }
}

#[async_trait]
impl TaskDistributor for RecordingDistributor {
    async fn distribute(&self, task: Task, options: TaskOptions) -> Result<(), QueueError> {
        let mut state = self.state();
        state.history.push(task.clone());
        state.pending.push_back(TaskEnvelope::new(task, options));
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for RecordingDistributor {
    async fn claim(&self) -> Result<Option<Claimed>, QueueError> {
        let mut state = self.state();
        // Тот же приоритет, что у Redis-очереди
        for queue in QueueName::PRIORITY {
            let Some(pos) = state.pending.iter().position(|e| e.queue == queue) else {
                continue;
            };
            let Some(envelope) = state.pending.remove(pos) else {
                continue;
            };
            state.in_flight.push(envelope.clone());
            return Ok(Some(Claimed {
                receipt: envelope.id.to_string(),
                envelope,
            }));
        }
        Ok(None)
    }

    async fn ack(&self, claimed: &Claimed) -> Result<(), QueueError> {
        let mut state = self.state();
        if let Some(pos) = state
            .in_flight
            .iter()
            .position(|e| e.id.to_string() == claimed.receipt)
        {
            state.in_flight.remove(pos);
        }
        Ok(())
    }

    async fn schedule(&self, envelope: TaskEnvelope, delay: Duration) -> Result<(), QueueError> {
        self.state().delayed.push((Instant::now() + delay, envelope));
        Ok(())
    }

    async fn dead_letter(&self, envelope: TaskEnvelope) -> Result<(), QueueError> {
        self.state().dead.push(envelope);
        Ok(())
    }

    async fn promote_due(&self) -> Result<usize, QueueError> {
        let now = Instant::now();
        let mut state = self.state();
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delayed)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        state.delayed = waiting;
        let promoted = due.len();
        state.pending.extend(due.into_iter().map(|(_, envelope)| envelope));
        Ok(promoted)
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let mut state = self.state();
        let stranded = std::mem::take(&mut state.in_flight);
        let recovered = stranded.len();
        for envelope in stranded.into_iter().rev() {
            state.pending.push_front(envelope);
        }
        Ok(recovered)
    }
}
