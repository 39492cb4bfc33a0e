use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use crate::models::Settings;
use crate::store::{filter::compare_values, Collection, DataStore, Filter, Record, StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Get,
    List,
    Create,
    Patch,
    Delete,
}

#[derive(Default)]
struct Inner {
    records: HashMap<Collection, Vec<Value>>,
    settings: Value,
    unique: Vec<(Collection, &'static str)>,
    latency: Duration,
    failures: Vec<(Collection, StoreOp)>,
    writes: usize,
}

/// Хранилище в памяти с той же семантикой, что и удалённое: без транзакций,
/// с ограничениями уникальности. Задержка применяется перед каждой операцией,
/// так что чтение и запись разнесены во времени как в сети.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let inner = Inner {
            unique: vec![
                (Collection::Checkins, "booking_item_id"),
                (Collection::Refunds, "idempotency_key"),
            ],
            settings: serde_json::to_value(Settings {
                payment_fee_percent: 5,
                max_reservation_hold_minutes: 15,
                max_full_refund_hours: 48,
            })
            .unwrap_or(Value::Null),
            ..Inner::default()
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn seed<T: Record>(&self, record: &T) {
        if let Ok(value) = serde_json::to_value(record) {
            self.state().records.entry(T::COLLECTION).or_default().push(value);
        }
    }

    pub fn get<T: Record>(&self, id: Uuid) -> Option<T> {
        let state = self.state();
        let value = find(state.records.get(&T::COLLECTION)?, id)?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn all<T: Record>(&self) -> Vec<T> {
        self.state()
            .records
            .get(&T::COLLECTION)
            .map(|rows| {
                rows.iter()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_settings(&self, settings: &Settings) {
        if let Ok(value) = serde_json::to_value(settings) {
            self.state().settings = value;
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Следующая операция `op` над `collection` завершится ошибкой 503.
    pub fn fail_next(&self, collection: Collection, op: StoreOp) {
        self.state().failures.push((collection, op));
    }

    pub fn write_count(&self) -> usize {
        self.state().writes
    }

    async fn begin(&self, collection: Collection, op: StoreOp) -> StoreResult<()> {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if let Some(pos) = state.failures.iter().position(|f| *f == (collection, op)) {
            state.failures.remove(pos);
            return Err(StoreError::Api {
                status: 503,
                code: "SERVICE_UNAVAILABLE".to_string(),
                message: format!("injected {op:?} failure on {}", collection.as_str()),
            });
        }
        Ok(())
    }
}

fn find(rows: &[Value], id: Uuid) -> Option<&Value> {
    let id = Value::String(id.to_string());
    rows.iter().find(|v| v.get("id") == Some(&id))
}

fn project(value: &Value, fields: &[&str]) -> Value {
    if fields.is_empty() {
        return value.clone();
    }
    let mut out = Map::new();
    for field in fields {
        if let Some(v) = value.get(*field) {
            out.insert((*field).to_string(), v.clone());
        }
    }
    Value::Object(out)
}

fn not_found(collection: Collection, id: Uuid) -> StoreError {
    StoreError::Api {
        status: 404,
        code: "NOT_FOUND".to_string(),
        message: format!("{} {id} not found", collection.as_str()),
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn get(&self, collection: Collection, id: Uuid, fields: &[&str]) -> StoreResult<Option<Value>> {
        self.begin(collection, StoreOp::Get).await?;
        let state = self.state();
        Ok(state
            .records
            .get(&collection)
            .and_then(|rows| find(rows, id))
            .map(|v| project(v, fields)))
    }

    async fn list(&self, collection: Collection, filter: &Filter, sort: &[&str]) -> StoreResult<Vec<Value>> {
        self.begin(collection, StoreOp::List).await?;
        let state = self.state();
        let mut rows: Vec<Value> = state
            .records
            .get(&collection)
            .map(|rows| rows.iter().filter(|v| filter.matches(v)).cloned().collect())
            .unwrap_or_default();

        rows.sort_by(|a, b| {
            for key in sort {
                let (field, desc) = match key.strip_prefix('-') {
                    Some(field) => (field, true),
                    None => (*key, false),
                };
                let ord = compare_values(
                    a.get(field).unwrap_or(&Value::Null),
                    b.get(field).unwrap_or(&Value::Null),
                )
                .unwrap_or(std::cmp::Ordering::Equal);
                let ord = if desc { ord.reverse() } else { ord };
                if ord.is_ne() {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
        Ok(rows)
    }

    async fn singleton(&self, collection: Collection) -> StoreResult<Value> {
        self.begin(collection, StoreOp::Get).await?;
        Ok(self.state().settings.clone())
    }

    async fn create(&self, collection: Collection, mut body: Value) -> StoreResult<Value> {
        self.begin(collection, StoreOp::Create).await?;
        let mut state = self.state();

        let unique: Vec<&'static str> = state
            .unique
            .iter()
            .filter(|(c, _)| *c == collection)
            .map(|(_, field)| *field)
            .collect();
        let rows = state.records.entry(collection).or_default();
        for field in unique {
            let candidate = body.get(field).cloned().unwrap_or(Value::Null);
            if !candidate.is_null() && rows.iter().any(|r| r.get(field) == Some(&candidate)) {
                return Err(StoreError::Unique {
                    collection: collection.as_str(),
                });
            }
        }

        if body.get("id").is_none_or(Value::is_null) {
            body["id"] = Value::String(Uuid::new_v4().to_string());
        }
        rows.push(body.clone());
        state.writes += 1;
        Ok(body)
    }

    async fn patch(&self, collection: Collection, id: Uuid, body: Value) -> StoreResult<Value> {
        self.begin(collection, StoreOp::Patch).await?;
        let mut state = self.state();
        let rows = state.records.entry(collection).or_default();
        let id_value = Value::String(id.to_string());
        let record = rows
            .iter_mut()
            .find(|v| v.get("id") == Some(&id_value))
            .ok_or_else(|| not_found(collection, id))?;

        if let (Value::Object(target), Value::Object(changes)) = (&mut *record, body) {
            for (k, v) in changes {
                target.insert(k, v);
            }
        }
        let updated = record.clone();
        state.writes += 1;
        Ok(updated)
    }

    async fn delete(&self, collection: Collection, id: Uuid) -> StoreResult<()> {
        self.begin(collection, StoreOp::Delete).await?;
        let mut state = self.state();
        let id_value = Value::String(id.to_string());
        if let Some(rows) = state.records.get_mut(&collection) {
            rows.retain(|v| v.get("id") != Some(&id_value));
        }
        state.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn enforces_unique_fields_and_merges_patches() {
        let store = MemoryStore::new();
        let item = Uuid::new_v4();

        store
            .create(Collection::Checkins, json!({"booking_item_id": item}))
            .await
            .unwrap();
        let err = store
            .create(Collection::Checkins, json!({"booking_item_id": item}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unique { collection: "checkins" }));

        let id = Uuid::new_v4();
        store
            .create(Collection::Seats, json!({"id": id, "status": "empty", "number": "A1"}))
            .await
            .unwrap();
        let patched = store
            .patch(Collection::Seats, id, json!({"status": "reserved"}))
            .await
            .unwrap();
        assert_eq!(patched, json!({"id": id, "status": "reserved", "number": "A1"}));
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let store = MemoryStore::new();
        store.fail_next(Collection::Bookings, StoreOp::Create);
        assert!(store.create(Collection::Bookings, json!({})).await.is_err());
        assert!(store.create(Collection::Bookings, json!({})).await.is_ok());
    }
}
