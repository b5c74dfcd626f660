//! Payment attempts: deposits, ceilings, offline settlement and gateway initiation.

mod common;

use common::{dec, request, EventSeed, TestApp, OFFLINE_CASH, ONLINE_PIX};
use registration_service::error::RegistrationError;
use registration_service::models::{
    NewPayment, PaymentChannel, PaymentMethod, PaymentMode, PaymentStatus, RegistrationStatus,
};
use registration_service::services::gateway::MockGateway;
use serde_json::json;

fn offline(amount: &str) -> NewPayment {
    NewPayment {
        channel: PaymentChannel::Offline,
        method: PaymentMethod::BankTransfer,
        amount: dec(amount),
    }
}

fn balance_due() -> EventSeed {
    EventSeed {
        payment_mode: PaymentMode::BalanceDue,
        min_deposit_amount: Some(dec("50.00")),
        ..EventSeed::default()
    }
}

#[tokio::test]
async fn deposits_move_registration_from_partial_to_confirmed() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let event_id = app.seed_event(balance_due()).await;
    let batch_id = app.seed_batch(event_id, "200.00", None).await;

    let created = app
        .state
        .registrations
        .create(event_id, request(batch_id, 1, None, None))
        .await
        .expect("registration is created");
    assert_eq!(created.registration.payment_status, RegistrationStatus::Pending);
    assert!(created.payments.is_empty());
    let order_code = created.registration.order_code.clone();

    let deposit = app
        .state
        .payments
        .add_payment(&order_code, offline("60.00"))
        .await
        .expect("deposit recorded");
    assert_eq!(deposit.status, PaymentStatus::Pending);

    app.state
        .payments
        .confirm_offline(deposit.payment_id)
        .await
        .expect("deposit confirmed");
    let details = app.state.registrations.get(&order_code).await.expect("lookup");
    assert_eq!(details.registration.payment_status, RegistrationStatus::Partial);

    let balance = app
        .state
        .payments
        .add_payment(&order_code, offline("140.00"))
        .await
        .expect("balance recorded");
    app.state
        .payments
        .confirm_offline(balance.payment_id)
        .await
        .expect("balance confirmed");

    let details = app.state.registrations.get(&order_code).await.expect("lookup");
    assert_eq!(details.registration.payment_status, RegistrationStatus::Confirmed);
    assert_eq!(details.payments.len(), 2);

    // Status changes reach the notifier in the background.
    let mut seen = Vec::new();
    for _ in 0..40 {
        seen = app
            .notifier
            .sent()
            .into_iter()
            .filter(|c| c.order_code == order_code)
            .map(|c| c.status)
            .collect::<Vec<_>>();
        if seen.contains(&RegistrationStatus::Confirmed) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(seen.contains(&RegistrationStatus::Partial));
    assert!(seen.contains(&RegistrationStatus::Confirmed));
    assert!(app.notifier.send_count() >= 2);

    // Nothing left to pay.
    let extra = app
        .state
        .payments
        .add_payment(&order_code, offline("1.00"))
        .await;
    assert!(matches!(extra, Err(RegistrationError::Conflict(_))));

    app.cleanup().await;
}

#[tokio::test]
async fn open_attempts_count_against_the_ceiling() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let event_id = app.seed_event(balance_due()).await;
    let batch_id = app.seed_batch(event_id, "200.00", None).await;
    let created = app
        .state
        .registrations
        .create(event_id, request(batch_id, 1, None, None))
        .await
        .expect("registration is created");
    let order_code = created.registration.order_code;

    let below_deposit = app
        .state
        .payments
        .add_payment(&order_code, offline("30.00"))
        .await;
    assert!(matches!(below_deposit, Err(RegistrationError::Validation(_))));

    app.state
        .payments
        .add_payment(&order_code, offline("150.00"))
        .await
        .expect("first attempt recorded");

    let over = app
        .state
        .payments
        .add_payment(&order_code, offline("60.00"))
        .await;
    assert!(matches!(over, Err(RegistrationError::Validation(_))));

    app.state
        .payments
        .add_payment(&order_code, offline("50.00"))
        .await
        .expect("exact remainder accepted");

    app.cleanup().await;
}

#[tokio::test]
async fn amounts_must_be_positive_cents() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let event_id = app.seed_event(balance_due()).await;
    let batch_id = app.seed_batch(event_id, "200.00", None).await;
    let created = app
        .state
        .registrations
        .create(event_id, request(batch_id, 1, None, None))
        .await
        .expect("registration is created");
    let order_code = created.registration.order_code;

    for amount in ["0", "-10.00", "60.001"] {
        let result = app.state.payments.add_payment(&order_code, offline(amount)).await;
        assert!(
            matches!(result, Err(RegistrationError::Validation(_))),
            "amount {} should be rejected",
            amount
        );
    }

    let cash_online = app
        .state
        .payments
        .add_payment(
            &order_code,
            NewPayment {
                channel: PaymentChannel::Online,
                method: PaymentMethod::Cash,
                amount: dec("60.00"),
            },
        )
        .await;
    assert!(matches!(cash_online, Err(RegistrationError::Validation(_))));

    app.cleanup().await;
}

#[tokio::test]
async fn online_first_payment_is_initiated_at_the_gateway() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let event_id = app.seed_event(EventSeed::default()).await;
    let batch_id = app.seed_batch(event_id, "90.00", Some(5)).await;

    let created = app
        .state
        .registrations
        .create(event_id, request(batch_id, 1, None, ONLINE_PIX))
        .await
        .expect("registration is created");

    assert_eq!(app.gateway.initiate_count(), 1);
    let payment = &created.payments[0];
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.amount, dec("90.00"));
    assert_eq!(
        payment.provider_payment_id.as_deref(),
        Some(MockGateway::provider_id_for(payment.payment_id).as_str())
    );
    assert_eq!(app.transaction_count(payment.payment_id, "gateway_request").await, 1);

    // Offline settlement is not available for gateway payments.
    let manual = app.state.payments.confirm_offline(payment.payment_id).await;
    assert!(matches!(manual, Err(RegistrationError::Conflict(_))));

    app.cleanup().await;
}

#[tokio::test]
async fn denied_single_payment_is_not_replaced() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let event_id = app.seed_event(EventSeed::default()).await;
    let batch_id = app.seed_batch(event_id, "90.00", Some(5)).await;

    app.gateway.set_initiate(Ok(PaymentStatus::Denied));
    let created = app
        .state
        .registrations
        .create(event_id, request(batch_id, 1, None, ONLINE_PIX))
        .await
        .expect("registration is created");
    assert_eq!(created.payments[0].status, PaymentStatus::Denied);
    assert_eq!(created.registration.payment_status, RegistrationStatus::Denied);
    // Inventory stays held until the deadline.
    assert_eq!(app.batch_quantity(batch_id).await, 1);

    app.gateway.set_initiate(Ok(PaymentStatus::Pending));
    let retry = app
        .state
        .payments
        .add_payment(
            &created.registration.order_code,
            NewPayment {
                channel: PaymentChannel::Online,
                method: PaymentMethod::Card,
                amount: dec("90.00"),
            },
        )
        .await;
    assert!(matches!(retry, Err(RegistrationError::Conflict(_))));

    let details = app
        .state
        .registrations
        .get(&created.registration.order_code)
        .await
        .expect("lookup");
    assert_eq!(details.payments.len(), 1);

    app.cleanup().await;
}

#[tokio::test]
async fn single_mode_rejects_a_second_payment_after_offline_denial() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let event_id = app.seed_event(EventSeed::default()).await;
    let batch_id = app.seed_batch(event_id, "100.00", None).await;
    let created = app
        .state
        .registrations
        .create(event_id, request(batch_id, 1, None, OFFLINE_CASH))
        .await
        .expect("registration is created");
    let order_code = created.registration.order_code.clone();

    app.state
        .payments
        .deny_offline(created.payments[0].payment_id)
        .await
        .expect("denied");

    let second = app
        .state
        .payments
        .add_payment(&order_code, offline("100.00"))
        .await;
    assert!(matches!(second, Err(RegistrationError::Conflict(_))));

    let details = app.state.registrations.get(&order_code).await.expect("lookup");
    assert_eq!(details.payments.len(), 1);
    assert_eq!(details.registration.payment_status, RegistrationStatus::Denied);

    app.cleanup().await;
}

#[tokio::test]
async fn payment_count_cap_includes_denied_attempts() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let event_id = app
        .seed_event(EventSeed {
            max_payment_count: Some(1),
            ..balance_due()
        })
        .await;
    let batch_id = app.seed_batch(event_id, "200.00", None).await;
    let created = app
        .state
        .registrations
        .create(event_id, request(batch_id, 1, None, None))
        .await
        .expect("registration is created");
    let order_code = created.registration.order_code.clone();

    let first = app
        .state
        .payments
        .add_payment(&order_code, offline("60.00"))
        .await
        .expect("first attempt recorded");
    app.state
        .payments
        .deny_offline(first.payment_id)
        .await
        .expect("denied");

    let second = app
        .state
        .payments
        .add_payment(&order_code, offline("60.00"))
        .await;
    assert!(matches!(second, Err(RegistrationError::Conflict(_))));

    let details = app.state.registrations.get(&order_code).await.expect("lookup");
    assert_eq!(details.payments.len(), 1);

    app.cleanup().await;
}

#[tokio::test]
async fn offline_payment_over_http() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let event_id = app.seed_event(balance_due()).await;
    let batch_id = app.seed_batch(event_id, "100.00", None).await;
    let created = app
        .state
        .registrations
        .create(event_id, request(batch_id, 1, None, None))
        .await
        .expect("registration is created");
    let client = reqwest::Client::new();

    let response = client
        .post(format!(
            "{}/registrations/{}/payments",
            app.http_address, created.registration.order_code
        ))
        .json(&json!({ "channel": "offline", "method": "cash", "amount": "100.00" }))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 201);
    let payment: serde_json::Value = response.json().await.expect("Failed to parse response");
    let payment_id = payment["payment_id"].as_str().expect("payment id").to_string();

    let response = client
        .post(format!("{}/payments/{}/confirm", app.http_address, payment_id))
        .send()
        .await
        .expect("Failed to execute request");
    assert!(response.status().is_success());
    let confirmed: serde_json::Value = response.json().await.expect("Failed to parse response");
    assert_eq!(confirmed["status"], "confirmed");

    // Confirmed attempts cannot be denied afterwards.
    let response = client
        .post(format!("{}/payments/{}/deny", app.http_address, payment_id))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 409);

    app.cleanup().await;
}
