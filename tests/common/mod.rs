#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use box_office::{
    config::Config,
    mocks::{FixedClock, MemoryGateway, MemoryStore, RecordingDistributor, RecordingNotifier, StaticIdentity},
    models::{BookingItem, EventSchedule, Seat, SeatStatus, Ticket},
    services::booking::{BookingCreated, BookingSaga, CreateBooking, SeatSelection},
    AppState, Services,
};

pub const STAFF_EMAIL: &str = "gate@venue.test";
pub const STAFF_PASSWORD: &str = "open-sesame";

pub fn t0() -> DateTime<Utc> {
    "2026-03-01T10:00:00Z".parse().unwrap()
}

/// Всё ядро на двойниках, время стоит на `t0()`.
pub struct Harness {
    pub config: Config,
    pub state: Arc<AppState>,
    pub store: MemoryStore,
    pub gateway: MemoryGateway,
    pub queue: RecordingDistributor,
    pub identity: StaticIdentity,
    pub notifier: RecordingNotifier,
    pub clock: FixedClock,
    pub staff_id: Uuid,
}

impl Harness {
    pub fn new() -> Self {
        let config = Config::test_defaults();
        let store = MemoryStore::new();
        let gateway = MemoryGateway::new();
        let queue = RecordingDistributor::new();
        let identity = StaticIdentity::new();
        let notifier = RecordingNotifier::new();
        let clock = FixedClock::new(t0());
        let staff_id = identity.with_user(STAFF_EMAIL, STAFF_PASSWORD, &config.jwt.staff_role);

        let state = AppState::new(
            config.clone(),
            Services {
                store: Arc::new(store.clone()),
                gateway: Arc::new(gateway.clone()),
                distributor: Arc::new(queue.clone()),
                identity: Arc::new(identity.clone()),
                notifier: Arc::new(notifier.clone()),
                clock: Arc::new(clock.clone()),
            },
        );

        Self {
            config,
            state,
            store,
            gateway,
            queue,
            identity,
            notifier,
            clock,
            staff_id,
        }
    }

    pub fn saga(&self) -> &BookingSaga {
        &self.state.saga
    }

    /// Прогоняет очередь задач до конца.
    pub async fn drain(&self) -> usize {
        self.queue.drain(&self.state.processor).await
    }

    pub fn seat(&self, id: Uuid) -> Seat {
        self.store.get::<Seat>(id).unwrap()
    }

    pub fn items_of(&self, booking_id: Uuid) -> Vec<BookingItem> {
        self.store
            .all::<BookingItem>()
            .into_iter()
            .filter(|i| i.booking_id == booking_id)
            .collect()
    }

    /// Бронирование двух мест (100 000 + 150 000) на событие площадки.
    pub async fn book_pair(&self, venue: &Venue, customer_id: Uuid, seats: (usize, usize)) -> BookingCreated {
        self.saga()
            .create_booking(CreateBooking {
                customer_id,
                event_id: venue.event_id,
                items: vec![
                    SeatSelection {
                        ticket_id: venue.standard.id,
                        seat_id: venue.seats[seats.0].id,
                    },
                    SeatSelection {
                        ticket_id: venue.premium.id,
                        seat_id: venue.seats[seats.1].id,
                    },
                ],
            })
            .await
            .unwrap()
    }

    /// Бронирование, оплаченное картой, с выпущенными QR.
    pub async fn paid_booking(&self, venue: &Venue, customer_id: Uuid, seats: (usize, usize)) -> BookingCreated {
        let created = self.book_pair(venue, customer_id, seats).await;
        self.saga()
            .confirm_payment(customer_id, created.payment.payment_id, "pm_card_visa")
            .await
            .unwrap();
        self.drain().await;
        created
    }
}

pub struct Venue {
    pub event_id: Uuid,
    pub zone_id: Uuid,
    pub schedule: EventSchedule,
    pub standard: Ticket,
    pub premium: Ticket,
    pub seats: Vec<Seat>,
}

/// Событие с окном чекина [t0+2h, t0+6h], двумя типами билетов и `seats` свободными местами.
pub fn seed_venue(store: &MemoryStore, seats: usize) -> Venue {
    let event_id = Uuid::new_v4();
    let zone_id = Uuid::new_v4();
    let schedule = EventSchedule {
        id: Uuid::new_v4(),
        event_id,
        start_checkin_time: Some(t0() + Duration::hours(2)),
        end_checkin_time: Some(t0() + Duration::hours(6)),
    };
    store.seed(&schedule);

    let ticket = |base_price| Ticket {
        id: Uuid::new_v4(),
        event_id,
        zone_id,
        base_price,
        event_schedule_id: Some(schedule.id),
    };
    let standard = ticket(100_000);
    let premium = ticket(150_000);
    store.seed(&standard);
    store.seed(&premium);

    let seats: Vec<Seat> = (1..=seats)
        .map(|n| Seat {
            id: Uuid::new_v4(),
            zone_id,
            number: format!("A{n}"),
            status: SeatStatus::Empty,
            reserved_by: None,
        })
        .collect();
    for seat in &seats {
        store.seed(seat);
    }

    Venue {
        event_id,
        zone_id,
        schedule,
        standard,
        premium,
        seats,
    }
}
