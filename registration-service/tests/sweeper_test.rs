//! Sweeper passes: registration expiry, attempt TTL, gateway polling and re-initiation.

mod common;

use chrono::Utc;
use common::{dec, request, EventSeed, TestApp, OFFLINE_CASH, ONLINE_PIX};
use registration_service::error::RegistrationError;
use registration_service::models::{
    NewPayment, PaymentChannel, PaymentMethod, PaymentMode, PaymentStatus, RegistrationStatus,
};
use registration_service::services::gateway::GatewayError;

#[tokio::test]
async fn unpaid_registration_past_deadline_is_expired_and_released() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let event_id = app.seed_event(EventSeed::default()).await;
    let batch_id = app.seed_batch(event_id, "60.00", Some(2)).await;

    let created = app
        .state
        .registrations
        .create(event_id, request(batch_id, 2, None, OFFLINE_CASH))
        .await
        .expect("registration is created");
    assert_eq!(app.batch_quantity(batch_id).await, 2);
    app.expire_deadline(created.registration.registration_id).await;

    let report = app.sweeper.run_once().await.expect("sweep runs");
    assert!(!report.skipped);
    assert_eq!(report.expired_registrations, 1);

    let details = app
        .state
        .registrations
        .get(&created.registration.order_code)
        .await
        .expect("lookup");
    assert_eq!(details.registration.payment_status, RegistrationStatus::Expired);
    assert!(details.registration.released_utc.is_some());
    assert_eq!(details.payments[0].status, PaymentStatus::Expired);
    assert_eq!(app.batch_quantity(batch_id).await, 0);

    // Seats are sellable again.
    app.state
        .registrations
        .create(event_id, request(batch_id, 2, None, OFFLINE_CASH))
        .await
        .expect("released seats can be sold");

    app.cleanup().await;
}

#[tokio::test]
async fn paid_registration_keeps_its_seats_after_deadline() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let event_id = app.seed_event(EventSeed::default()).await;
    let batch_id = app.seed_batch(event_id, "60.00", Some(2)).await;

    let created = app
        .state
        .registrations
        .create(event_id, request(batch_id, 1, None, OFFLINE_CASH))
        .await
        .expect("registration is created");
    app.state
        .payments
        .confirm_offline(created.payments[0].payment_id)
        .await
        .expect("offline confirm succeeds");
    app.expire_deadline(created.registration.registration_id).await;

    let report = app.sweeper.run_once().await.expect("sweep runs");
    assert_eq!(report.expired_registrations, 0);
    assert!(!app
        .sweeper
        .expire_one(created.registration.registration_id, Utc::now())
        .await
        .expect("expire_one runs"));
    assert_eq!(app.batch_quantity(batch_id).await, 1);

    app.cleanup().await;
}

#[tokio::test]
async fn concurrent_sweeps_release_inventory_once() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let event_id = app.seed_event(EventSeed::default()).await;
    let batch_id = app.seed_batch(event_id, "60.00", Some(5)).await;

    let created = app
        .state
        .registrations
        .create(event_id, request(batch_id, 3, None, OFFLINE_CASH))
        .await
        .expect("registration is created");
    app.expire_deadline(created.registration.registration_id).await;

    let first = app.sweeper.clone();
    let second = app.sweeper.clone();
    let (a, b) = tokio::join!(first.run_once(), second.run_once());
    let (a, b) = (a.expect("first sweep"), b.expect("second sweep"));

    assert_eq!(a.expired_registrations + b.expired_registrations, 1);
    assert_eq!(app.batch_quantity(batch_id).await, 0);

    app.cleanup().await;
}

#[tokio::test]
async fn stale_attempt_expires_without_a_replacement_payment() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let event_id = app.seed_event(EventSeed::default()).await;
    let batch_id = app.seed_batch(event_id, "60.00", Some(5)).await;

    let created = app
        .state
        .registrations
        .create(event_id, request(batch_id, 1, None, OFFLINE_CASH))
        .await
        .expect("registration is created");
    let payment_id = created.payments[0].payment_id;

    sqlx::query(
        "UPDATE registration_payments SET created_utc = NOW() - INTERVAL '2 days' WHERE payment_id = $1",
    )
    .bind(payment_id)
    .execute(app.db.pool())
    .await
    .expect("Failed to age attempt");

    let report = app.sweeper.run_once().await.expect("sweep runs");
    assert_eq!(report.expired_attempts, 1);
    assert_eq!(report.expired_registrations, 0);
    assert_eq!(app.transaction_count(payment_id, "expiration").await, 1);

    let details = app
        .state
        .registrations
        .get(&created.registration.order_code)
        .await
        .expect("lookup");
    assert_eq!(details.registration.payment_status, RegistrationStatus::Expired);
    // Deadline not reached: seats stay held.
    assert_eq!(app.batch_quantity(batch_id).await, 1);

    // Single mode keeps its one attempt; no replacement row.
    let retry = app
        .state
        .payments
        .add_payment(
            &created.registration.order_code,
            NewPayment {
                channel: PaymentChannel::Offline,
                method: PaymentMethod::Cash,
                amount: dec("60.00"),
            },
        )
        .await;
    assert!(matches!(retry, Err(RegistrationError::Conflict(_))));

    // The deadline sweep still releases the seats.
    app.expire_deadline(created.registration.registration_id).await;
    let report = app.sweeper.run_once().await.expect("sweep runs");
    assert_eq!(report.expired_registrations, 1);
    assert_eq!(app.batch_quantity(batch_id).await, 0);

    app.cleanup().await;
}

#[tokio::test]
async fn partial_balance_due_registration_expires_at_deadline() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let event_id = app
        .seed_event(EventSeed {
            payment_mode: PaymentMode::BalanceDue,
            ..EventSeed::default()
        })
        .await;
    let batch_id = app.seed_batch(event_id, "200.00", Some(5)).await;

    let created = app
        .state
        .registrations
        .create(event_id, request(batch_id, 1, None, None))
        .await
        .expect("registration is created");
    let order_code = created.registration.order_code.clone();

    let deposit = app
        .state
        .payments
        .add_payment(
            &order_code,
            NewPayment {
                channel: PaymentChannel::Offline,
                method: PaymentMethod::Cash,
                amount: dec("80.00"),
            },
        )
        .await
        .expect("deposit recorded");
    app.state
        .payments
        .confirm_offline(deposit.payment_id)
        .await
        .expect("deposit confirmed");
    let open = app
        .state
        .payments
        .add_payment(
            &order_code,
            NewPayment {
                channel: PaymentChannel::Offline,
                method: PaymentMethod::Cash,
                amount: dec("50.00"),
            },
        )
        .await
        .expect("second attempt recorded");

    app.expire_deadline(created.registration.registration_id).await;
    let report = app.sweeper.run_once().await.expect("sweep runs");
    assert_eq!(report.expired_registrations, 1);

    let details = app.state.registrations.get(&order_code).await.expect("lookup");
    assert_eq!(details.registration.payment_status, RegistrationStatus::Expired);
    assert!(details.registration.released_utc.is_some());
    assert_eq!(app.batch_quantity(batch_id).await, 0);

    let statuses: Vec<(uuid::Uuid, PaymentStatus)> =
        details.payments.iter().map(|p| (p.payment_id, p.status)).collect();
    assert!(statuses.contains(&(deposit.payment_id, PaymentStatus::Confirmed)));
    assert!(statuses.contains(&(open.payment_id, PaymentStatus::Expired)));

    app.cleanup().await;
}

#[tokio::test]
async fn poller_applies_gateway_status() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let event_id = app.seed_event(EventSeed::default()).await;
    let batch_id = app.seed_batch(event_id, "60.00", Some(5)).await;

    let created = app
        .state
        .registrations
        .create(event_id, request(batch_id, 1, None, ONLINE_PIX))
        .await
        .expect("registration is created");
    let payment_id = created.payments[0].payment_id;
    app.age_payment(payment_id).await;

    app.gateway.set_query(Ok(PaymentStatus::Confirmed));
    let report = app.sweeper.run_once().await.expect("sweep runs");

    assert_eq!(report.polled, 1);
    assert!(app.gateway.query_count() >= 1);
    assert_eq!(app.transaction_count(payment_id, "gateway_query").await, 1);
    let details = app
        .state
        .registrations
        .get(&created.registration.order_code)
        .await
        .expect("lookup");
    assert_eq!(details.registration.payment_status, RegistrationStatus::Confirmed);

    app.cleanup().await;
}

#[tokio::test]
async fn stalled_online_attempt_is_reinitiated() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let event_id = app.seed_event(EventSeed::default()).await;
    let batch_id = app.seed_batch(event_id, "60.00", Some(5)).await;

    app.gateway
        .set_initiate(Err(GatewayError::Timeout("slow".to_string())));
    let created = app
        .state
        .registrations
        .create(event_id, request(batch_id, 1, None, ONLINE_PIX))
        .await
        .expect("registration is created");
    assert!(created.payments[0].provider_payment_id.is_none());
    app.age_payment(created.payments[0].payment_id).await;

    app.gateway.set_initiate(Ok(PaymentStatus::Pending));
    let report = app.sweeper.run_once().await.expect("sweep runs");
    assert_eq!(report.reinitiated, 1);

    let payment = app
        .state
        .payments
        .get(created.payments[0].payment_id)
        .await
        .expect("payment");
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert!(payment.provider_payment_id.is_some());
    assert_eq!(app.gateway.initiate_count(), 2);

    app.cleanup().await;
}
