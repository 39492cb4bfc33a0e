//! Клиент внешнего документного хранилища.
//!
//! Хранилище отдаёт get/list/create/patch/delete по коллекциям и больше ничего:
//! нет транзакций между документами, нет compare-and-swap, нет блокировок.
//! Единственная гарантия консистентности сверх одиночной записи: ограничения
//! уникальности, настроенные в схеме удалённого сервиса (например, на
//! `checkins.booking_item_id`). Всё, что требует нескольких записей подряд,
//! оркестрируется сагой с компенсациями.

pub mod filter;
pub mod http;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::Settings;

pub use filter::Filter;
pub use http::HttpDataStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Seats,
    Tickets,
    EventSchedules,
    Bookings,
    BookingItems,
    Payments,
    Refunds,
    Checkins,
    Memberships,
    PointLedger,
    Settings,
}

impl Collection {
    pub const fn as_str(self) -> &'static str {
        match self {
            Collection::Seats => "seats",
            Collection::Tickets => "tickets",
            Collection::EventSchedules => "event_schedules",
            Collection::Bookings => "bookings",
            Collection::BookingItems => "booking_items",
            Collection::Payments => "payments",
            Collection::Refunds => "refunds",
            Collection::Checkins => "checkins",
            Collection::Memberships => "memberships",
            Collection::PointLedger => "point_ledger",
            Collection::Settings => "settings",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("data store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("data store returned {status} ({code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
    #[error("unique constraint violated in {collection}")]
    Unique { collection: &'static str },
    #[error("malformed record in {collection}: {message}")]
    Decode {
        collection: &'static str,
        message: String,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Низкоуровневый CRUD поверх HTTP. Записи передаются как JSON.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// `Ok(None)`, если записи нет. Пустой `fields` означает все поля.
    async fn get(&self, collection: Collection, id: Uuid, fields: &[&str]) -> StoreResult<Option<Value>>;
    /// `sort` в формате `field` / `-field`.
    async fn list(&self, collection: Collection, filter: &Filter, sort: &[&str]) -> StoreResult<Vec<Value>>;
    async fn singleton(&self, collection: Collection) -> StoreResult<Value>;
    async fn create(&self, collection: Collection, body: Value) -> StoreResult<Value>;
    async fn patch(&self, collection: Collection, id: Uuid, body: Value) -> StoreResult<Value>;
    async fn delete(&self, collection: Collection, id: Uuid) -> StoreResult<()>;
}

/// Документ, привязанный к своей коллекции.
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    const COLLECTION: Collection;
}

/// Типизированная обёртка над `DataStore`.
#[derive(Clone)]
pub struct Store {
    inner: Arc<dyn DataStore>,
}

impl Store {
    pub fn new(inner: Arc<dyn DataStore>) -> Self {
        Self { inner }
    }

    pub async fn find<T: Record>(&self, id: Uuid) -> StoreResult<Option<T>> {
        self.inner
            .get(T::COLLECTION, id, &[])
            .await?
            .map(decode::<T>)
            .transpose()
    }

    pub async fn find_where<T: Record>(&self, filter: &Filter, sort: &[&str]) -> StoreResult<Vec<T>> {
        self.inner
            .list(T::COLLECTION, filter, sort)
            .await?
            .into_iter()
            .map(decode::<T>)
            .collect()
    }

    pub async fn create<T: Record>(&self, record: &T) -> StoreResult<T> {
        let body = encode(record)?;
        decode(self.inner.create(T::COLLECTION, body).await?)
    }

    pub async fn patch<T: Record>(&self, id: Uuid, changes: Value) -> StoreResult<T> {
        decode(self.inner.patch(T::COLLECTION, id, changes).await?)
    }

    pub async fn delete<T: Record>(&self, id: Uuid) -> StoreResult<()> {
        self.inner.delete(T::COLLECTION, id).await
    }

    pub async fn settings(&self) -> StoreResult<Settings> {
        let value = self.inner.singleton(Collection::Settings).await?;
        serde_json::from_value(value).map_err(|e| StoreError::Decode {
            collection: Collection::Settings.as_str(),
            message: e.to_string(),
        })
    }
}

fn encode<T: Record>(record: &T) -> StoreResult<Value> {
    serde_json::to_value(record).map_err(|e| StoreError::Decode {
        collection: T::COLLECTION.as_str(),
        message: e.to_string(),
    })
}

fn decode<T: Record>(value: Value) -> StoreResult<T> {
    serde_json::from_value(value).map_err(|e| StoreError::Decode {
        collection: T::COLLECTION.as_str(),
        message: e.to_string(),
    })
}
