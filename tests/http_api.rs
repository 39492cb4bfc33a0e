mod common;

use chrono::Duration;
use reqwest::StatusCode;
use serde_json::{json, Value};
use uuid::Uuid;

use box_office::{router, services::identity::issue_token};
use common::{seed_venue, Harness, Venue, STAFF_EMAIL, STAFF_PASSWORD};

/// Поднимает роутер на случайном порту, возвращает базовый адрес API.
async fn serve(h: &Harness) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(h.state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn bearer(h: &Harness, user_id: Uuid) -> String {
    let token = issue_token(&h.config.jwt.secret, user_id, "customer", 3600).unwrap();
    format!("Bearer {token}")
}

fn booking_body(venue: &Venue) -> Value {
    json!({
        "event_id": venue.event_id,
        "items": [
            {"ticket_id": venue.standard.id, "seat_id": venue.seats[0].id},
            {"ticket_id": venue.premium.id, "seat_id": venue.seats[1].id},
        ]
    })
}

#[tokio::test]
async fn health_check_answers() {
    let h = Harness::new();
    let base = serve(&h).await;

    let res = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn bookings_require_a_valid_bearer_token() {
    let h = Harness::new();
    let venue = seed_venue(&h.store, 2);
    let base = serve(&h).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{base}/api/bookings"))
        .json(&booking_body(&venue))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let forged = issue_token("another-secret", Uuid::new_v4(), "customer", 3600).unwrap();
    let res = client
        .post(format!("{base}/api/bookings"))
        .header("Authorization", format!("Bearer {forged}"))
        .json(&booking_body(&venue))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn booking_and_payment_over_http() {
    let h = Harness::new();
    let venue = seed_venue(&h.store, 2);
    let base = serve(&h).await;
    let client = reqwest::Client::new();
    let auth = bearer(&h, Uuid::new_v4());

    let res = client
        .post(format!("{base}/api/bookings"))
        .header("Authorization", &auth)
        .json(&booking_body(&venue))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["payment"]["amount"], 262_500);
    assert_eq!(body["data"]["booking"]["status"], "pending");
    let payment_id = body["data"]["payment"]["payment_id"].as_str().unwrap().to_string();

    let res = client
        .post(format!("{base}/api/bookings/confirm-payment"))
        .header("Authorization", &auth)
        .json(&json!({"payment_id": payment_id, "payment_method": "pm_card_visa"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["data"]["status"], "success");
}

#[tokio::test]
async fn invalid_bodies_are_bad_requests() {
    let h = Harness::new();
    let venue = seed_venue(&h.store, 2);
    let base = serve(&h).await;
    let client = reqwest::Client::new();
    let auth = bearer(&h, Uuid::new_v4());

    let res = client
        .post(format!("{base}/api/bookings"))
        .header("Authorization", &auth)
        .json(&json!({"event_id": venue.event_id, "items": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["code"], "INVALID_INPUT");

    let res = client
        .post(format!("{base}/api/bookings"))
        .header("Authorization", &auth)
        .json(&json!({"event_id": "not-a-uuid"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn someone_elses_booking_is_forbidden() {
    let h = Harness::new();
    let venue = seed_venue(&h.store, 2);
    let created = h.book_pair(&venue, Uuid::new_v4(), (0, 1)).await;
    let base = serve(&h).await;

    let res = reqwest::Client::new()
        .post(format!("{base}/api/bookings/{}/cancel", created.booking.id))
        .header("Authorization", bearer(&h, Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn declined_refund_is_unprocessable() {
    let h = Harness::new();
    let venue = seed_venue(&h.store, 2);
    let customer = Uuid::new_v4();
    let created = h.paid_booking(&venue, customer, (0, 1)).await;
    h.gateway.fail_refunds_with("charge_disputed");
    let base = serve(&h).await;

    let res = reqwest::Client::new()
        .post(format!("{base}/api/payments/{}/refund", created.payment.payment_id))
        .header("Authorization", bearer(&h, customer))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "REFUND_DECLINED");
    assert_eq!(body["data"]["status"], "failed");
}

#[tokio::test]
async fn staff_checks_in_a_ticket_over_http() {
    let h = Harness::new();
    let venue = seed_venue(&h.store, 2);
    let created = h.paid_booking(&venue, Uuid::new_v4(), (0, 1)).await;
    let token = h.items_of(created.booking.id)[0].qr_token.clone().unwrap();
    h.clock.advance(Duration::hours(3));
    let base = serve(&h).await;
    let client = reqwest::Client::new();
    let body = json!({
        "email": STAFF_EMAIL,
        "password": STAFF_PASSWORD,
        "device": "gate-2",
        "token": token,
    });

    let res = client.post(format!("{base}/api/checkins")).json(&body).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let accepted: Value = res.json().await.unwrap();
    assert_eq!(accepted["data"]["checkin"]["device"], "gate-2");

    let res = client.post(format!("{base}/api/checkins")).json(&body).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let rejected: Value = res.json().await.unwrap();
    assert_eq!(rejected["code"], "INVALID_REQUEST");
}
