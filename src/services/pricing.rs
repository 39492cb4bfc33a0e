use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::AppResult;
use crate::models::{LedgerSource, Membership, PointLedgerEntry};
use crate::store::{Filter, Store};

/// Цена позиции со скидкой: floor(base × (100 − d) / 100), в пределах [1, base].
pub fn price(base_price: i64, discount_percent: i64) -> i64 {
    let d = discount_percent.clamp(0, 100);
    let discounted = base_price.saturating_mul(100 - d) / 100;
    discounted.clamp(1, base_price.max(1))
}

/// subtotal + floor(subtotal × fee / 100).
pub fn total_with_fee(subtotal: i64, fee_percent: i64) -> i64 {
    subtotal + subtotal.saturating_mul(fee_percent.max(0)) / 100
}

/// Уровни по возрастанию `base_point`; выигрывает последний подходящий.
pub fn discount_for_points(points: i64, tiers: &[Membership]) -> i64 {
    let mut sorted: Vec<&Membership> = tiers.iter().collect();
    sorted.sort_by_key(|t| t.base_point);
    sorted
        .into_iter()
        .filter(|t| t.base_point <= points)
        .last()
        .map_or(0, |t| t.discount_percent)
}

pub fn points_for_amount(amount: i64, unit: i64) -> i64 {
    if unit <= 0 {
        return 0;
    }
    amount / unit
}

/// Скидки по уровню лояльности и журнал баллов.
#[derive(Clone)]
pub struct PricingEngine {
    store: Store,
    points_unit: i64,
    clock: Arc<dyn Clock>,
}

impl PricingEngine {
    pub fn new(store: Store, points_unit: i64, clock: Arc<dyn Clock>) -> Self {
        Self { store, points_unit, clock }
    }

    pub fn points_unit(&self) -> i64 {
        self.points_unit
    }

    pub async fn lifetime_points(&self, customer_id: Uuid) -> AppResult<i64> {
        let entries: Vec<PointLedgerEntry> = self
            .store
            .find_where(&Filter::new().eq("customer_id", customer_id), &[])
            .await?;
        Ok(entries.iter().map(|e| e.delta).sum())
    }

    pub async fn membership_discount(&self, customer_id: Uuid) -> AppResult<i64> {
        let points = self.lifetime_points(customer_id).await?;
        let tiers: Vec<Membership> = self.store.find_where(&Filter::new(), &["base_point"]).await?;
        let discount = discount_for_points(points, &tiers);
        debug!(%customer_id, points, discount, "membership discount resolved");
        Ok(discount)
    }

    /// Одна запись на (source, source_id): повторная доставка задачи ничего не добавит.
    pub async fn record_points(&self, customer_id: Uuid, delta: i64, source: LedgerSource, source_id: Uuid) -> AppResult<()> {
        if delta == 0 {
            return Ok(());
        }

        let existing: Vec<PointLedgerEntry> = self
            .store
            .find_where(
                &Filter::new().eq("source", source).eq("source_id", source_id),
                &[],
            )
            .await?;
        if !existing.is_empty() {
            debug!(%source_id, "points already recorded");
            return Ok(());
        }

        self.store
            .create(&PointLedgerEntry {
                id: Uuid::new_v4(),
                customer_id,
                delta,
                source,
                source_id,
                created_at: self.clock.now(),
            })
            .await?;
        info!(%customer_id, delta, ?source, "⭐ points recorded");
        Ok(())
    }
}
