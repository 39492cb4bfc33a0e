mod common;

use chrono::Duration;
use fake::{
    faker::internet::en::{Password, SafeEmail},
    Fake,
};
use uuid::Uuid;

use box_office::{
    error::AppError,
    mocks::StoreOp,
    models::{BookingItem, BookingItemStatus, Checkin},
    services::{booking::RefundRequester, checkin::CheckinRequest},
    store::Collection,
};
use common::{seed_venue, Harness, STAFF_EMAIL, STAFF_PASSWORD};

/// Оплаченное бронирование и токен первого билета.
async fn ticket(h: &Harness) -> (Uuid, Uuid, String) {
    let venue = seed_venue(&h.store, 2);
    let customer = Uuid::new_v4();
    let created = h.paid_booking(&venue, customer, (0, 1)).await;
    let item = h.items_of(created.booking.id).remove(0);
    (created.payment.payment_id, item.id, item.qr_token.unwrap())
}

fn scan(token: &str) -> CheckinRequest {
    CheckinRequest {
        email: STAFF_EMAIL.to_string(),
        password: STAFF_PASSWORD.to_string(),
        device: "gate-1".to_string(),
        token: token.to_string(),
    }
}

#[tokio::test]
async fn valid_ticket_is_admitted_once() {
    let h = Harness::new();
    let (_, item_id, token) = ticket(&h).await;
    h.clock.advance(Duration::hours(3));

    let accepted = h.state.checkins.check_in(scan(&token)).await.unwrap();
    assert_eq!(accepted.booking_item_id, item_id);
    assert_eq!(accepted.checkin.staff_id, h.staff_id);
    assert_eq!(accepted.checkin.device, "gate-1");
    assert_eq!(item_status(&h, item_id), BookingItemStatus::Used);

    let err = h.state.checkins.check_in(scan(&token)).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)), "got {err:?}");
    assert_eq!(h.store.all::<Checkin>().len(), 1);
}

#[tokio::test]
async fn unique_checkin_wins_even_if_ticket_status_was_not_updated() {
    let h = Harness::new();
    let (_, _, token) = ticket(&h).await;
    h.clock.advance(Duration::hours(3));
    h.store.fail_next(Collection::BookingItems, StoreOp::Patch);

    // Отметка used не записалась, но запись чекина уже есть
    h.state.checkins.check_in(scan(&token)).await.unwrap();
    let err = h.state.checkins.check_in(scan(&token)).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)), "got {err:?}");
    assert_eq!(h.store.all::<Checkin>().len(), 1);
}

#[tokio::test]
async fn scans_outside_the_checkin_window_are_rejected() {
    let h = Harness::new();
    let (_, _, token) = ticket(&h).await;

    // Окно [t0+2h, t0+6h]
    h.clock.advance(Duration::hours(2) - Duration::seconds(1));
    let early = h.state.checkins.check_in(scan(&token)).await.unwrap_err();
    assert!(matches!(early, AppError::InvalidRequest(_)), "got {early:?}");

    h.clock.set(common::t0() + Duration::hours(6) + Duration::seconds(1));
    let late = h.state.checkins.check_in(scan(&token)).await.unwrap_err();
    assert!(matches!(late, AppError::InvalidRequest(_)), "got {late:?}");

    assert!(h.store.all::<Checkin>().is_empty());
}

#[tokio::test]
async fn only_staff_can_check_in() {
    let h = Harness::new();
    let (_, _, token) = ticket(&h).await;
    h.clock.advance(Duration::hours(3));
    let email: String = SafeEmail().fake();
    let password: String = Password(10..20).fake();
    h.identity.with_user(&email, &password, "customer");

    let mut request = scan(&token);
    request.email = email;
    request.password = password;
    let err = h.state.checkins.check_in(request).await.unwrap_err();
    assert!(matches!(err, AppError::Forbidden), "got {err:?}");

    let mut request = scan(&token);
    request.password = "wrong".into();
    let err = h.state.checkins.check_in(request).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized), "got {err:?}");
}

#[tokio::test]
async fn tampered_token_is_rejected_without_details() {
    let h = Harness::new();
    let (_, _, token) = ticket(&h).await;
    h.clock.advance(Duration::hours(3));

    let mut bytes = token.into_bytes();
    let mid = bytes.len() / 2;
    bytes[mid] = if bytes[mid] == b'x' { b'y' } else { b'x' };
    let tampered = String::from_utf8(bytes).unwrap();

    let err = h.state.checkins.check_in(scan(&tampered)).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized), "got {err:?}");

    let err = h.state.checkins.check_in(scan("not-a-token")).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized), "got {err:?}");
}

#[tokio::test]
async fn refunded_ticket_no_longer_admits() {
    let h = Harness::new();
    let (payment_id, _, token) = ticket(&h).await;
    h.clock.advance(Duration::hours(3));

    h.state
        .saga
        .refund(payment_id, RefundRequester::System)
        .await
        .unwrap();
    h.drain().await;

    let err = h.state.checkins.check_in(scan(&token)).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)), "got {err:?}");
}

fn item_status(h: &Harness, item_id: Uuid) -> BookingItemStatus {
    h.store.get::<BookingItem>(item_id).unwrap().status
}
