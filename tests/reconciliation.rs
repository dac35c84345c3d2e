mod common;

use common::{Harness, PASSWORD, money};
use futures::future::join_all;
use settlement_engine::domain::{EntryKind, Error, GatewayStatus};
use settlement_engine::gateway::sandbox::notification_body;
use settlement_engine::reconciliation::Outcome;
use settlement_engine::webhook;

const USER: u64 = 5;
const PHONE: &str = "+7 999 123-45-67";

#[tokio::test]
async fn replayed_confirmation_credits_once() {
    let h = Harness::new();
    let payment = h
        .engine
        .withdrawals()
        .initiate_deposit(USER, money("1000"))
        .await
        .unwrap();
    assert_eq!(payment.status, GatewayStatus::New);

    let body = h.gateway.notification(
        &payment.payment_id,
        "CONFIRMED",
        true,
        payment.amount,
        Some(&payment.order_id),
    );
    let mut outcomes = Vec::new();
    for _ in 0..5 {
        outcomes.push(h.engine.webhook().handle(&body).await.unwrap());
    }

    assert!(matches!(outcomes[0], Outcome::Credited(_)));
    assert!(outcomes[1..].iter().all(|o| *o == Outcome::Replayed));
    assert_eq!(h.account(USER).await.balance, money("1000"));
    assert_eq!(h.entries(USER, EntryKind::Deposit).await.len(), 1);
}

#[tokio::test]
async fn concurrent_deliveries_credit_once() {
    let h = Harness::new();
    let payment = h
        .engine
        .withdrawals()
        .initiate_deposit(USER, money("250.50"))
        .await
        .unwrap();
    let body = h.gateway.notification(
        &payment.payment_id,
        "CONFIRMED",
        true,
        payment.amount,
        None,
    );

    let webhook = h.engine.webhook();
    let outcomes = join_all((0..8).map(|_| webhook.handle(&body))).await;
    let credited = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(Outcome::Credited(_))))
        .count();
    assert_eq!(credited, 1);
    assert_eq!(h.account(USER).await.balance, money("250.50"));
}

#[tokio::test]
async fn lookup_falls_back_to_order_id() {
    let h = Harness::new();
    let payment = h
        .engine
        .withdrawals()
        .initiate_deposit(USER, money("100"))
        .await
        .unwrap();
    let body = h.gateway.notification(
        "provider-renumbered",
        "CONFIRMED",
        true,
        payment.amount,
        Some(&payment.order_id),
    );

    let outcome = h.engine.webhook().handle(&body).await.unwrap();
    assert!(matches!(outcome, Outcome::Credited(_)));
    assert_eq!(h.account(USER).await.balance, money("100"));
}

#[tokio::test]
async fn failed_payment_is_recorded_without_credit() {
    let h = Harness::new();
    let payment = h
        .engine
        .withdrawals()
        .initiate_deposit(USER, money("100"))
        .await
        .unwrap();
    let body = h.gateway.notification(
        &payment.payment_id,
        "REJECTED",
        false,
        payment.amount,
        None,
    );

    assert_eq!(
        h.engine.webhook().handle(&body).await.unwrap(),
        Outcome::StatusRecorded
    );
    assert_eq!(h.account(USER).await.balance, money("0"));
    let status = h
        .engine
        .store()
        .read(|t| t.payments.payment(&payment.payment_id).map(|p| p.status.clone()))
        .await;
    assert_eq!(status, Some(GatewayStatus::Rejected));
}

#[tokio::test]
async fn unmatched_and_forged_notifications_change_nothing() {
    let h = Harness::new();
    let unknown = h
        .gateway
        .notification("pay-unknown", "CONFIRMED", true, money("100"), None);
    assert_eq!(
        h.engine.webhook().handle(&unknown).await.unwrap(),
        Outcome::Unmatched
    );

    let payment = h
        .engine
        .withdrawals()
        .initiate_deposit(USER, money("100"))
        .await
        .unwrap();
    let forged = notification_body(
        "not-the-secret",
        &payment.payment_id,
        "CONFIRMED",
        true,
        payment.amount,
        None,
    );
    assert!(matches!(
        h.engine.webhook().handle(&forged).await,
        Err(Error::SignatureVerificationFailed)
    ));
    assert_eq!(
        h.engine.webhook().handle("{not json").await.unwrap(),
        Outcome::Ignored
    );
    assert_eq!(h.account(USER).await.balance, money("0"));
    assert!(h.engine.store().read(|t| t.ledger.entries().is_empty()).await);
}

#[tokio::test]
async fn rejected_payout_unwinds_the_reservation() {
    let h = Harness::new();
    h.fund(USER, "5000").await;

    let payout = h
        .engine
        .withdrawals()
        .initiate_withdrawal(USER, money("1000"), PHONE)
        .await
        .unwrap();
    let held = h.account(USER).await;
    assert_eq!(held.balance, money("5000"));
    assert_eq!(held.frozen, money("1000"));

    let body = h.gateway.notification(
        &payout.payment_id,
        "REJECTED",
        false,
        payout.amount,
        Some(&payout.order_id),
    );
    let outcome = h.engine.webhook().handle(&body).await.unwrap();
    assert!(matches!(outcome, Outcome::PayoutReleased(_)));
    assert_eq!(
        h.engine.webhook().handle(&body).await.unwrap(),
        Outcome::Replayed
    );

    let after = h.account(USER).await;
    assert_eq!(after.balance, money("5000"));
    assert_eq!(after.frozen, money("0"));
    assert_eq!(h.entries(USER, EntryKind::Unfreeze).await.len(), 1);

    // a late success for a payout already rejected is ignored
    let late = h.gateway.notification(
        &payout.payment_id,
        "COMPLETED",
        true,
        payout.amount,
        None,
    );
    assert_eq!(
        h.engine.webhook().handle(&late).await.unwrap(),
        Outcome::Ignored
    );
    assert_eq!(h.account(USER).await.balance, money("5000"));
}

#[tokio::test]
async fn completed_payouts_consume_the_reservation_and_close_the_deal() {
    let h = Harness::new();
    h.fund(USER, "5000").await;
    let withdrawals = h.engine.withdrawals();

    let partial = withdrawals
        .initiate_withdrawal(USER, money("1000"), PHONE)
        .await
        .unwrap();
    assert!(!partial.is_final);
    let body = h.gateway.notification(
        &partial.payment_id,
        "COMPLETED",
        true,
        partial.amount,
        None,
    );
    assert!(matches!(
        h.engine.webhook().handle(&body).await.unwrap(),
        Outcome::PayoutSettled(_)
    ));
    let account = h.account(USER).await;
    assert_eq!(account.balance, money("4000"));
    assert_eq!(account.frozen, money("0"));
    assert!(h.gateway.closed_deals().is_empty());

    let last = withdrawals
        .initiate_withdrawal(USER, money("4000"), PHONE)
        .await
        .unwrap();
    assert!(last.is_final);
    assert_eq!(last.deal_id, partial.deal_id);
    let body = h.gateway.notification(
        &last.payment_id,
        "COMPLETED",
        true,
        last.amount,
        None,
    );
    h.engine.webhook().handle(&body).await.unwrap();

    assert_eq!(h.account(USER).await.balance, money("0"));
    assert_eq!(h.gateway.closed_deals(), vec![last.deal_id.clone()]);
    let open = h
        .engine
        .store()
        .read(|t| t.payments.open_deal(USER).is_some())
        .await;
    assert!(!open);
    h.finish().await;
}

#[tokio::test]
async fn webhook_route_always_answers_ok() {
    let h = Harness::new();
    let payment = h
        .engine
        .withdrawals()
        .initiate_deposit(USER, money("700"))
        .await
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = webhook::router(h.engine.webhook());
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    let url = format!("http://{}{}", addr, webhook::WEBHOOK_PATH);
    let client = reqwest::Client::new();
    let forged = notification_body("wrong", &payment.payment_id, "CONFIRMED", true, payment.amount, None);
    let genuine = notification_body(PASSWORD, &payment.payment_id, "CONFIRMED", true, payment.amount, None);

    for body in ["garbage".to_string(), forged, genuine.clone(), genuine] {
        let response = client.post(&url).body(body).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "OK");
    }

    assert_eq!(h.account(USER).await.balance, money("700"));
    server.abort();
}

#[tokio::test]
async fn webhook_route_acknowledges_undecodable_and_oversized_bodies() {
    let h = Harness::new();
    let payment = h
        .engine
        .withdrawals()
        .initiate_deposit(USER, money("300"))
        .await
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = webhook::router(h.engine.webhook());
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    let url = format!("http://{}{}", addr, webhook::WEBHOOK_PATH);
    let client = reqwest::Client::new();
    let genuine = notification_body(PASSWORD, &payment.payment_id, "CONFIRMED", true, payment.amount, None);
    let mut padded = genuine.clone().into_bytes();
    padded.resize(3 * 1024 * 1024, b' ');

    let bodies = [vec![b'{', 0xff, 0xfe, b'}'], padded, genuine.into_bytes()];
    for body in bodies {
        let response = client.post(&url).body(body).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "OK");
    }

    // only the last, well-formed delivery is applied
    assert_eq!(h.account(USER).await.balance, money("300"));
    assert_eq!(h.entries(USER, EntryKind::Deposit).await.len(), 1);
    server.abort();
}

#[tokio::test]
async fn stale_payouts_are_settled_from_provider_state() {
    let h = Harness::new();
    h.fund(USER, "5000").await;
    let withdrawals = h.engine.withdrawals();
    let rejected = withdrawals
        .initiate_withdrawal(USER, money("1000"), PHONE)
        .await
        .unwrap();
    let pending = withdrawals
        .initiate_withdrawal(USER, money("1500"), PHONE)
        .await
        .unwrap();
    let polled = |h: &Harness| {
        h.gateway
            .calls()
            .iter()
            .filter(|c| c.starts_with("payout_state"))
            .count()
    };

    // nothing is old enough yet
    let wait = std::time::Duration::from_secs(3600);
    assert_eq!(h.engine.reconciliation().poll_stale_payouts(wait).await, 0);
    assert_eq!(polled(&h), 0);

    h.gateway
        .set_payout_state(&rejected.payment_id, GatewayStatus::Rejected);
    let now = std::time::Duration::ZERO;
    assert_eq!(h.engine.reconciliation().poll_stale_payouts(now).await, 1);
    assert_eq!(polled(&h), 2);

    let account = h.account(USER).await;
    assert_eq!(account.balance, money("5000"));
    assert_eq!(account.frozen, pending.amount);
    assert_eq!(h.entries(USER, EntryKind::Unfreeze).await.len(), 1);

    // the rejected payout is final and no longer polled
    assert_eq!(h.engine.reconciliation().poll_stale_payouts(now).await, 0);
    assert_eq!(polled(&h), 3);

    // a late webhook for the same status is a replay
    let body = h.gateway.notification(
        &rejected.payment_id,
        "REJECTED",
        false,
        rejected.amount,
        None,
    );
    assert_eq!(
        h.engine.webhook().handle(&body).await.unwrap(),
        Outcome::Replayed
    );
    h.finish().await;
}
