//! Двойники внешних систем для тестов: хранилище, шлюз, очередь,
//! провайдер идентификации, уведомления и часы.
//!
//! Не для продакшена.

mod gateway;
mod queue;
mod store;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::services::identity::{Identity, IdentityProvider};
use crate::services::notify::{Notification, Notifier, NotifyError};

pub use gateway::{ConfirmScript, MemoryGateway};
pub use queue::RecordingDistributor;
pub use store::{MemoryStore, StoreOp};

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Часы, которые идут только когда их двигают.
#[derive(Debug, Clone)]
pub struct FixedClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *guard(&self.now) = now;
    }

    pub fn advance(&self, by: Duration) {
        *guard(&self.now) += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *guard(&self.now)
    }
}

/// Провайдер идентификации со статическим списком пользователей.
#[derive(Clone, Default)]
pub struct StaticIdentity {
    users: Arc<Mutex<HashMap<String, (String, Identity)>>>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Регистрирует пользователя и возвращает его id.
    pub fn with_user(&self, email: &str, password: &str, role: &str) -> Uuid {
        let identity = Identity {
            user_id: Uuid::new_v4(),
            role: role.to_string(),
        };
        let id = identity.user_id;
        guard(&self.users).insert(email.to_string(), (password.to_string(), identity));
        id
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn login(&self, email: &str, password: &str) -> AppResult<Identity> {
        match guard(&self.users).get(email) {
            Some((expected, identity)) if expected == password => Ok(identity.clone()),
            _ => Err(AppError::Unauthorized),
        }
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        guard(&self.sent).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        guard(&self.sent).push(notification.clone());
        Ok(())
    }
}
