use chrono::{DateTime, Utc};

/// Источник текущего времени. Передаётся в сервисы явно, чтобы окна
/// удержания, возвратов и чекина можно было проверять в тестах.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
