//! Резервирование мест через документное хранилище.
//!
//! Хранилище не умеет compare-and-swap, поэтому `reserve` это чтение, проверка
//! статуса и отдельный PATCH. Два конкурентных вызова могут оба увидеть `empty`
//! и оба записать `reserved`; последний PATCH побеждает. Окно гонки закрывает
//! сага: после создания позиций бронирования она перечитывает места
//! (`verify_hold`), и проигравший откатывается с `Conflict`. Если PATCH
//! конкурента лёг уже после проверки, последнее слово за `mark_booked` при
//! оплате: место остаётся за тем, кто его держит, а оплативший получает возврат.

use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Seat, SeatStatus, Ticket};
use crate::store::Store;

#[derive(Clone)]
pub struct SeatReservations {
    store: Store,
}

impl SeatReservations {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn reserve(&self, seat_id: Uuid, ticket_id: Uuid, customer_id: Uuid) -> AppResult<Seat> {
        let ticket = self
            .store
            .find::<Ticket>(ticket_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("ticket {ticket_id}")))?;
        self.reserve_with_ticket(seat_id, &ticket, customer_id).await
    }

    /// То же, что `reserve`, когда билет уже загружен вызывающим.
    pub async fn reserve_with_ticket(&self, seat_id: Uuid, ticket: &Ticket, customer_id: Uuid) -> AppResult<Seat> {
        let seat = self
            .store
            .find::<Seat>(seat_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("seat {seat_id}")))?;

        if seat.zone_id != ticket.zone_id {
            return Err(AppError::InvalidInput(format!(
                "seat {} does not belong to the zone of ticket {}",
                seat.number, ticket.id
            )));
        }
        if seat.status != SeatStatus::Empty {
            return Err(AppError::Conflict(format!("seat {} is not available", seat.number)));
        }

        // Окно гонки: между чтением выше и этой записью место мог занять другой запрос
        let reserved: Seat = self
            .store
            .patch::<Seat>(
                seat_id,
                json!({"status": SeatStatus::Reserved, "reserved_by": customer_id}),
            )
            .await?;
        debug!(%seat_id, %customer_id, "seat reserved");
        Ok(reserved)
    }

    /// `reserved` → `empty`. Пустое место не трогаем, проданное не освобождается.
    pub async fn release(&self, seat_id: Uuid) -> AppResult<()> {
        let Some(seat) = self.store.find::<Seat>(seat_id).await? else {
            warn!(%seat_id, "release of unknown seat ignored");
            return Ok(());
        };

        match seat.status {
            SeatStatus::Empty => Ok(()),
            SeatStatus::Booked => {
                warn!(%seat_id, "booked seat is never released");
                Ok(())
            }
            SeatStatus::Reserved => {
                self.store
                    .patch::<Seat>(seat_id, json!({"status": SeatStatus::Empty, "reserved_by": null}))
                    .await?;
                info!(%seat_id, "seat released");
                Ok(())
            }
        }
    }

    /// Освобождает место, если его держит или уже купил `customer_id`.
    /// Пустое и чужое место не трогаем, повторный вызов ничего не пишет.
    pub async fn release_held_by(&self, seat_id: Uuid, customer_id: Uuid) -> AppResult<()> {
        let Some(seat) = self.store.find::<Seat>(seat_id).await? else {
            warn!(%seat_id, "release of unknown seat ignored");
            return Ok(());
        };

        match seat.status {
            SeatStatus::Empty => Ok(()),
            _ if seat.reserved_by != Some(customer_id) => {
                debug!(%seat_id, holder = ?seat.reserved_by, "seat held by someone else, not released");
                Ok(())
            }
            SeatStatus::Reserved | SeatStatus::Booked => {
                self.store
                    .patch::<Seat>(seat_id, json!({"status": SeatStatus::Empty, "reserved_by": null}))
                    .await?;
                info!(%seat_id, was = ?seat.status, "seat released");
                Ok(())
            }
        }
    }

    /// `reserved` → `booked` после оплаты. Повторный вызов ничего не пишет.
    /// `Conflict`, если место держит или купил кто-то другой: резерв этого
    /// клиента был перезаписан конкурентным запросом.
    pub async fn mark_booked(&self, seat_id: Uuid, customer_id: Uuid) -> AppResult<()> {
        let seat = self
            .store
            .find::<Seat>(seat_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("seat {seat_id}")))?;

        if seat.reserved_by != Some(customer_id) {
            return Err(AppError::Conflict(format!(
                "seat {} is no longer held by the paying customer",
                seat.number
            )));
        }
        match seat.status {
            SeatStatus::Booked => Ok(()),
            SeatStatus::Reserved => {
                self.store
                    .patch::<Seat>(seat_id, json!({"status": SeatStatus::Booked}))
                    .await?;
                Ok(())
            }
            SeatStatus::Empty => Err(AppError::Conflict(format!("seat {} was released", seat.number))),
        }
    }

    /// Держит ли `customer_id` место прямо сейчас.
    pub async fn verify_hold(&self, seat_id: Uuid, customer_id: Uuid) -> AppResult<bool> {
        Ok(self
            .store
            .find::<Seat>(seat_id)
            .await?
            .is_some_and(|seat| seat.status == SeatStatus::Reserved && seat.reserved_by == Some(customer_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn fixture() -> (MemoryStore, SeatReservations, Ticket, Seat) {
        let mem = MemoryStore::new();
        let zone = Uuid::new_v4();
        let ticket = Ticket {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            zone_id: zone,
            base_price: 100_000,
            event_schedule_id: None,
        };
        let seat = Seat {
            id: Uuid::new_v4(),
            zone_id: zone,
            number: "A1".into(),
            status: SeatStatus::Empty,
            reserved_by: None,
        };
        mem.seed(&ticket);
        mem.seed(&seat);
        let seats = SeatReservations::new(Store::new(Arc::new(mem.clone())));
        (mem, seats, ticket, seat)
    }

    #[tokio::test]
    async fn second_sequential_reserve_conflicts() {
        let (mem, seats, ticket, seat) = fixture();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        seats.reserve(seat.id, ticket.id, alice).await.unwrap();
        let err = seats.reserve(seat.id, ticket.id, bob).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let stored: Seat = mem.get(seat.id).unwrap();
        assert_eq!(stored.reserved_by, Some(alice));
    }

    #[tokio::test]
    async fn zone_mismatch_and_missing_records() {
        let (mem, seats, ticket, _) = fixture();
        let foreign = Seat {
            id: Uuid::new_v4(),
            zone_id: Uuid::new_v4(),
            number: "Z9".into(),
            status: SeatStatus::Empty,
            reserved_by: None,
        };
        mem.seed(&foreign);

        let err = seats.reserve(foreign.id, ticket.id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
        let err = seats.reserve(Uuid::new_v4(), ticket.id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        let err = seats.reserve(foreign.id, Uuid::new_v4(), Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (mem, seats, ticket, seat) = fixture();
        let alice = Uuid::new_v4();

        seats.reserve(seat.id, ticket.id, alice).await.unwrap();
        seats.release_held_by(seat.id, alice).await.unwrap();
        let writes = mem.write_count();
        seats.release_held_by(seat.id, alice).await.unwrap();
        assert_eq!(mem.write_count(), writes, "releasing an empty seat must not write");
    }

    #[tokio::test]
    async fn plain_release_frees_holds_but_keeps_sold_seats() {
        let (mem, seats, ticket, seat) = fixture();
        let alice = Uuid::new_v4();

        seats.reserve(seat.id, ticket.id, alice).await.unwrap();
        seats.release(seat.id).await.unwrap();
        let stored: Seat = mem.get(seat.id).unwrap();
        assert_eq!(stored.status, SeatStatus::Empty);
        assert_eq!(stored.reserved_by, None);

        let writes = mem.write_count();
        seats.release(seat.id).await.unwrap();
        assert_eq!(mem.write_count(), writes);

        seats.reserve(seat.id, ticket.id, alice).await.unwrap();
        seats.mark_booked(seat.id, alice).await.unwrap();
        seats.release(seat.id).await.unwrap();
        assert_eq!(mem.get::<Seat>(seat.id).unwrap().status, SeatStatus::Booked);
    }

    #[tokio::test]
    async fn sold_seat_is_freed_only_for_its_buyer() {
        let (mem, seats, ticket, seat) = fixture();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        seats.reserve(seat.id, ticket.id, alice).await.unwrap();
        seats.mark_booked(seat.id, alice).await.unwrap();
        seats.mark_booked(seat.id, alice).await.unwrap();

        seats.release_held_by(seat.id, bob).await.unwrap();
        assert_eq!(mem.get::<Seat>(seat.id).unwrap().status, SeatStatus::Booked);
        seats.release_held_by(seat.id, alice).await.unwrap();
        assert_eq!(mem.get::<Seat>(seat.id).unwrap().status, SeatStatus::Empty);
    }

    #[tokio::test]
    async fn mark_booked_rejects_a_seat_overwritten_by_another_customer() {
        let (mem, seats, ticket, seat) = fixture();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        seats.reserve(seat.id, ticket.id, alice).await.unwrap();
        // Поздний PATCH конкурента после нашего резерва
        Store::new(Arc::new(mem))
            .patch::<Seat>(seat.id, json!({"status": "reserved", "reserved_by": bob}))
            .await
            .unwrap();

        let err = seats.mark_booked(seat.id, alice).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)), "got {err:?}");
        seats.mark_booked(seat.id, bob).await.unwrap();
        let err = seats.mark_booked(seat.id, alice).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)), "booked by bob: {err:?}");
    }

    #[tokio::test]
    async fn release_held_by_ignores_other_holders() {
        let (mem, seats, ticket, seat) = fixture();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        seats.reserve(seat.id, ticket.id, alice).await.unwrap();
        seats.release_held_by(seat.id, bob).await.unwrap();
        assert!(seats.verify_hold(seat.id, alice).await.unwrap());
        seats.release_held_by(seat.id, alice).await.unwrap();
        assert_eq!(mem.get::<Seat>(seat.id).unwrap().status, SeatStatus::Empty);
    }

    /// Неатомарность чтения и записи: при задержке хранилища оба
    /// конкурентных резерва видят `empty` и оба проходят. Держателем
    /// остаётся тот, чей PATCH был последним.
    #[tokio::test(start_paused = true)]
    async fn concurrent_reserves_race_under_latency() {
        let (mem, seats, ticket, seat) = fixture();
        mem.set_latency(Duration::from_millis(50));
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        let (a, b) = tokio::join!(
            seats.reserve(seat.id, ticket.id, alice),
            seats.reserve(seat.id, ticket.id, bob),
        );
        assert!(a.is_ok() && b.is_ok(), "both reads observed an empty seat");

        let holder = mem.get::<Seat>(seat.id).unwrap().reserved_by.unwrap();
        assert!(holder == alice || holder == bob);
        // Ровно один из двоих действительно держит место
        let held = [alice, bob]
            .iter()
            .filter(|c| mem.get::<Seat>(seat.id).unwrap().reserved_by == Some(**c))
            .count();
        assert_eq!(held, 1);
    }
}
