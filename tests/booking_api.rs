use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::net::TcpListener;
use ulid::Ulid;

use trimslot::engine::Engine;
use trimslot::http;
use trimslot::lock::TtlLockMap;
use trimslot::notify::PushHub;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (String, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("trimslot_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::new(
            dir.join("bookings.wal"),
            Arc::new(TtlLockMap::default()),
            Arc::new(PushHub::new()),
        )
        .unwrap(),
    );

    let app = http::router(engine.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), engine)
}

async fn post(client: &reqwest::Client, url: String, body: Value) -> (u16, Value) {
    let resp = client.post(url).json(&body).send().await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap_or(Value::Null))
}

async fn patch(client: &reqwest::Client, url: String, body: Value) -> (u16, Value) {
    let resp = client.patch(url).json(&body).send().await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap_or(Value::Null))
}

/// Registers a shop open Mondays 09:00–17:00, one staff member, one
/// customer, and a 30-minute haircut. Returns their ids.
async fn seed(client: &reqwest::Client, base: &str) -> (String, String, String, String) {
    let (status, shop) = post(
        client,
        format!("{base}/api/shops"),
        json!({
            "name": "Fade Factory",
            "openingHours": { "monday": { "open": "09:00", "close": "17:00" } }
        }),
    )
    .await;
    assert_eq!(status, 201);
    let shop_id = shop["id"].as_str().unwrap().to_owned();

    let (status, staff) = post(
        client,
        format!("{base}/api/users"),
        json!({ "shopId": shop_id, "name": "Dana", "role": "staff" }),
    )
    .await;
    assert_eq!(status, 201);

    let (status, customer) = post(
        client,
        format!("{base}/api/users"),
        json!({ "shopId": shop_id, "name": "Riley", "role": "customer" }),
    )
    .await;
    assert_eq!(status, 201);

    let (status, service) = post(
        client,
        format!("{base}/api/services"),
        json!({ "shopId": shop_id, "name": "Haircut", "duration": "30 min" }),
    )
    .await;
    assert_eq!(status, 201);

    (
        shop_id,
        staff["id"].as_str().unwrap().to_owned(),
        customer["id"].as_str().unwrap().to_owned(),
        service["id"].as_str().unwrap().to_owned(),
    )
}

fn booking_body(customer: &str, staff: &str, service: &str, start: &str) -> Value {
    json!({
        "customerId": customer,
        "staffId": staff,
        "serviceId": service,
        "start": start,
    })
}

// 2030-01-07 is a Monday.
const MONDAY_10AM: &str = "2030-01-07T10:00:00Z";

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_lifecycle_over_http() {
    let (base, _engine) = start_test_server().await;
    let client = reqwest::Client::new();
    let (_, staff, customer, service) = seed(&client, &base).await;

    let (status, created) = post(
        &client,
        format!("{base}/api/bookings"),
        booking_body(&customer, &staff, &service, MONDAY_10AM),
    )
    .await;
    assert_eq!(status, 201);
    assert_eq!(created["status"], "confirmed");
    assert_eq!(created["payment_status"], "cash-pending");
    let booking_id = created["id"].as_str().unwrap().to_owned();
    let slot = &created["slot"];
    assert_eq!(
        slot["end"].as_i64().unwrap() - slot["start"].as_i64().unwrap(),
        30 * 60_000
    );

    // The booked half hour is carved out of availability
    let resp = client
        .get(format!(
            "{base}/api/availability?staffId={staff}&date=2030-01-07"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let availability: Value = resp.json().await.unwrap();
    let free = availability["free"].as_array().unwrap();
    assert_eq!(free.len(), 2);
    assert_eq!(free[0]["end"], slot["start"]);
    assert_eq!(free[1]["start"], slot["end"]);

    let (status, fetched) = {
        let resp = client
            .get(format!("{base}/api/bookings/{booking_id}"))
            .send()
            .await
            .unwrap();
        (resp.status().as_u16(), resp.json::<Value>().await.unwrap())
    };
    assert_eq!(status, 200);
    assert_eq!(fetched["id"], created["id"]);

    let (status, approved) = patch(
        &client,
        format!("{base}/api/bookings/{booking_id}/approve"),
        json!({ "actorId": staff }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(approved["status"], "approved");

    let (status, cancelled) = post(
        &client,
        format!("{base}/api/bookings/{booking_id}/cancel"),
        json!({ "actorId": customer }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(cancelled["status"], "cancelled");

    // Cancelling again hits the terminal-state guard
    let (status, body) = post(
        &client,
        format!("{base}/api/bookings/{booking_id}/cancel"),
        json!({ "actorId": customer }),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["kind"], "already_cancelled");
}

#[tokio::test]
async fn rejections_map_to_status_codes() {
    let (base, _engine) = start_test_server().await;
    let client = reqwest::Client::new();
    let (shop, staff, customer, service) = seed(&client, &base).await;

    // Outside opening hours
    let (status, body) = post(
        &client,
        format!("{base}/api/bookings"),
        booking_body(&customer, &staff, &service, "2030-01-07T08:30:00Z"),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["kind"], "out_of_hours");

    // Book, then try to take the same half hour as someone else
    let (status, _) = post(
        &client,
        format!("{base}/api/bookings"),
        booking_body(&customer, &staff, &service, MONDAY_10AM),
    )
    .await;
    assert_eq!(status, 201);

    let (_, other) = post(
        &client,
        format!("{base}/api/users"),
        json!({ "shopId": shop, "name": "Sam", "role": "customer" }),
    )
    .await;
    let other_id = other["id"].as_str().unwrap();
    let (status, body) = post(
        &client,
        format!("{base}/api/bookings"),
        booking_body(other_id, &staff, &service, MONDAY_10AM),
    )
    .await;
    assert_eq!(status, 410);
    assert_eq!(body["error"]["kind"], "slot_gone");

    // Identical re-submit from the same customer is a conflict
    let (status, body) = post(
        &client,
        format!("{base}/api/bookings"),
        booking_body(&customer, &staff, &service, MONDAY_10AM),
    )
    .await;
    assert_eq!(status, 409);
    assert_eq!(body["error"]["kind"], "duplicate_booking");

    // Malformed ids and missing rows
    let resp = client
        .get(format!("{base}/api/bookings/not-a-ulid"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let resp = client
        .get(format!("{base}/api/bookings/{}", Ulid::new()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}

#[tokio::test]
async fn concurrent_identical_posts_single_winner() {
    let (base, _engine) = start_test_server().await;
    let client = reqwest::Client::new();
    let (shop, staff, _, service) = seed(&client, &base).await;

    let mut customers = Vec::new();
    for i in 0..8 {
        let (status, user) = post(
            &client,
            format!("{base}/api/users"),
            json!({ "shopId": shop, "name": format!("c{i}"), "role": "customer" }),
        )
        .await;
        assert_eq!(status, 201);
        customers.push(user["id"].as_str().unwrap().to_owned());
    }

    let mut tasks = Vec::new();
    for customer in customers {
        let client = client.clone();
        let url = format!("{base}/api/bookings");
        let body = booking_body(&customer, &staff, &service, MONDAY_10AM);
        tasks.push(tokio::spawn(async move {
            client
                .post(url)
                .json(&body)
                .send()
                .await
                .unwrap()
                .status()
                .as_u16()
        }));
    }

    let mut created = 0;
    for task in tasks {
        let status = task.await.unwrap();
        match status {
            201 => created += 1,
            409 | 410 => {}
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(created, 1);
}

#[tokio::test]
async fn notification_feed_endpoint() {
    let (base, _engine) = start_test_server().await;
    let client = reqwest::Client::new();
    let (_, staff, customer, service) = seed(&client, &base).await;

    let (status, _) = post(
        &client,
        format!("{base}/api/bookings"),
        booking_body(&customer, &staff, &service, MONDAY_10AM),
    )
    .await;
    assert_eq!(status, 201);

    let resp = client
        .get(format!("{base}/api/users/{customer}/notifications"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let feed: Value = resp.json().await.unwrap();
    assert_eq!(feed.as_array().unwrap().len(), 1);

    // Bookings listing for the customer
    let resp = client
        .get(format!("{base}/api/users/{customer}/bookings"))
        .send()
        .await
        .unwrap();
    let bookings: Value = resp.json().await.unwrap();
    assert_eq!(bookings.as_array().unwrap().len(), 1);
}
