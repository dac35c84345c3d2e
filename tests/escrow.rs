mod common;

use common::{Harness, PLATFORM, money};
use settlement_engine::commission::CommissionPolicy;
use settlement_engine::config::EngineConfig;
use settlement_engine::domain::{
    Assignee, EntryKind, Error, Profile, Task, TaskStatus, UserEvent,
};

const CUSTOMER: u64 = 1;
const EXECUTOR: u64 = 2;

#[tokio::test]
async fn assign_then_complete_moves_money_once() {
    let h = Harness::new();
    h.fund(CUSTOMER, "1000").await;
    h.task_with_offer(10, CUSTOMER, EXECUTOR, "600").await;

    let assignment = h
        .engine
        .escrow()
        .assign(10, Assignee::Executor(EXECUTOR), CUSTOMER)
        .await
        .unwrap();
    assert_eq!(assignment.task.status, TaskStatus::InProgress);
    assert_eq!(assignment.freeze.amount, money("600"));

    let customer = h.account(CUSTOMER).await;
    assert_eq!(customer.balance, money("1000"));
    assert_eq!(customer.frozen, money("600"));
    assert_eq!(customer.available(), money("400"));

    let settlement = h.engine.escrow().complete(10, CUSTOMER).await.unwrap();
    assert_eq!(settlement.split.commission, money("120"));
    assert_eq!(settlement.split.payout, money("480"));
    assert_eq!(settlement.task.status, TaskStatus::Completed);
    assert_eq!(settlement.task.price, Some(money("600")));
    assert_eq!(settlement.task.escrow_amount, money("0"));

    let customer = h.account(CUSTOMER).await;
    assert_eq!(customer.balance, money("400"));
    assert_eq!(customer.frozen, money("0"));
    assert_eq!(h.account(EXECUTOR).await.balance, money("480"));
    assert_eq!(h.account(PLATFORM).await.balance, money("120"));

    assert_eq!(h.entries(CUSTOMER, EntryKind::Payment).await.len(), 1);
    assert_eq!(h.entries(EXECUTOR, EntryKind::Earn).await.len(), 1);
    assert_eq!(h.entries(PLATFORM, EntryKind::Commission).await.len(), 1);

    h.finish().await;
    assert_eq!(*h.recorder.xp.lock().unwrap(), vec![(EXECUTOR, 50)]);
    let events = h.recorder.events.lock().unwrap().clone();
    assert!(events.contains(&(EXECUTOR, UserEvent::TaskAssigned { task_id: 10 })));
    assert!(events.contains(&(
        EXECUTOR,
        UserEvent::TaskCompleted {
            task_id: 10,
            amount: money("480")
        }
    )));
    let checks = h.recorder.achievement_checks.lock().unwrap().clone();
    assert!(checks.contains(&EXECUTOR) && checks.contains(&CUSTOMER));
}

#[tokio::test]
async fn insufficient_funds_leave_no_trace() {
    let h = Harness::new();
    h.fund(CUSTOMER, "300").await;
    h.task_with_offer(11, CUSTOMER, EXECUTOR, "500").await;

    let err = h
        .engine
        .escrow()
        .assign(11, Assignee::Executor(EXECUTOR), CUSTOMER)
        .await
        .unwrap_err();
    match err {
        Error::InsufficientFunds {
            required,
            available,
        } => {
            assert_eq!(required, money("500"));
            assert_eq!(available, money("300"));
        }
        other => panic!("unexpected error {:?}", other),
    }

    let task = h.task(11).await;
    assert_eq!(task.status, TaskStatus::Open);
    assert_eq!(task.executor_id, None);
    assert_eq!(h.account(CUSTOMER).await.frozen, money("0"));
    assert!(h.entries(CUSTOMER, EntryKind::Freeze).await.is_empty());
}

#[tokio::test]
async fn concurrent_assigns_freeze_exactly_once() {
    let h = Harness::new();
    h.fund(CUSTOMER, "2000").await;
    h.task_with_offer(12, CUSTOMER, EXECUTOR, "600").await;

    let escrow = h.engine.escrow();
    let (first, second) = tokio::join!(
        escrow.assign(12, Assignee::Executor(EXECUTOR), CUSTOMER),
        escrow.assign(12, Assignee::Executor(EXECUTOR), CUSTOMER),
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(Error::AlreadyAssigned(12))))
            .count(),
        1
    );
    assert_eq!(h.account(CUSTOMER).await.frozen, money("600"));
    assert_eq!(h.entries(CUSTOMER, EntryKind::Freeze).await.len(), 1);
}

#[tokio::test]
async fn assignment_requires_an_accepted_price() {
    let h = Harness::new();
    h.fund(CUSTOMER, "1000").await;
    h.engine.create_task(Task::new(13, CUSTOMER)).await.unwrap();
    h.engine
        .respond(13, EXECUTOR, None, money("300"))
        .await
        .unwrap();

    let err = h
        .engine
        .escrow()
        .assign(13, Assignee::Executor(EXECUTOR), CUSTOMER)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::NoPriceCommitted {
            task_id: 13,
            assignee: EXECUTOR
        }
    ));
}

#[tokio::test]
async fn only_the_customer_may_complete() {
    let h = Harness::new();
    h.fund(CUSTOMER, "1000").await;
    h.task_with_offer(14, CUSTOMER, EXECUTOR, "600").await;
    h.engine
        .escrow()
        .assign(14, Assignee::Executor(EXECUTOR), CUSTOMER)
        .await
        .unwrap();

    let err = h.engine.escrow().complete(14, EXECUTOR).await.unwrap_err();
    assert!(matches!(err, Error::Forbidden(_)));
    assert_eq!(h.task(14).await.status, TaskStatus::InProgress);

    h.engine.escrow().complete(14, CUSTOMER).await.unwrap();
    let again = h.engine.escrow().complete(14, CUSTOMER).await.unwrap_err();
    assert!(matches!(again, Error::InvalidStateTransition { .. }));
    assert_eq!(h.account(EXECUTOR).await.balance, money("480"));
}

#[tokio::test]
async fn executor_level_lowers_the_commission() {
    let h = Harness::new();
    h.engine
        .upsert_profile(Profile::new(EXECUTOR, 7))
        .await
        .unwrap();
    h.fund(CUSTOMER, "1000").await;
    h.task_with_offer(15, CUSTOMER, EXECUTOR, "600").await;
    h.engine
        .escrow()
        .assign(15, Assignee::Executor(EXECUTOR), CUSTOMER)
        .await
        .unwrap();

    let settlement = h.engine.escrow().complete(15, CUSTOMER).await.unwrap();
    assert_eq!(settlement.split.commission, money("60"));
    assert_eq!(h.account(EXECUTOR).await.balance, money("540"));
}

#[tokio::test]
async fn rate_snapshot_at_assignment_survives_level_change() {
    let config = EngineConfig {
        commission_policy: CommissionPolicy::AtAssignment,
        ..EngineConfig::default()
    };
    let h = Harness::with_config(config);
    h.fund(CUSTOMER, "1000").await;
    h.task_with_offer(16, CUSTOMER, EXECUTOR, "600").await;
    h.engine
        .escrow()
        .assign(16, Assignee::Executor(EXECUTOR), CUSTOMER)
        .await
        .unwrap();

    h.engine
        .upsert_profile(Profile::new(EXECUTOR, 7))
        .await
        .unwrap();
    let settlement = h.engine.escrow().complete(16, CUSTOMER).await.unwrap();
    assert_eq!(settlement.split.commission, money("120"));
}

#[tokio::test]
async fn failed_capture_settles_and_is_swept_later() {
    let h = Harness::new();
    h.fund(CUSTOMER, "1000").await;
    h.engine
        .create_task(Task::new(17, CUSTOMER).with_authorization("auth-17"))
        .await
        .unwrap();
    h.engine
        .respond(17, EXECUTOR, None, money("600"))
        .await
        .unwrap();
    h.engine.accept_response(17, EXECUTOR, CUSTOMER).await.unwrap();
    h.engine
        .escrow()
        .assign(17, Assignee::Executor(EXECUTOR), CUSTOMER)
        .await
        .unwrap();

    h.gateway.fail_confirmations("TIMEOUT", "provider did not answer");
    let settlement = h.engine.escrow().complete(17, CUSTOMER).await.unwrap();
    assert_eq!(settlement.task.status, TaskStatus::Completed);
    assert_eq!(settlement.task.capture_confirmed, Some(false));
    assert_eq!(h.account(EXECUTOR).await.balance, money("480"));

    assert_eq!(h.engine.escrow().sweep_unconfirmed_captures().await, 0);
    h.gateway.heal();
    assert_eq!(h.engine.escrow().sweep_unconfirmed_captures().await, 1);
    assert_eq!(h.task(17).await.capture_confirmed, Some(true));
    assert_eq!(h.engine.escrow().sweep_unconfirmed_captures().await, 0);
}

#[tokio::test]
async fn dispute_refund_returns_the_escrow() {
    let h = Harness::new();
    h.fund(CUSTOMER, "1000").await;
    h.task_with_offer(18, CUSTOMER, EXECUTOR, "600").await;
    h.engine
        .escrow()
        .assign(18, Assignee::Executor(EXECUTOR), CUSTOMER)
        .await
        .unwrap();

    let outsider = h.engine.escrow().open_dispute(18, 77).await.unwrap_err();
    assert!(matches!(outsider, Error::Forbidden(_)));

    let disputed = h.engine.escrow().open_dispute(18, EXECUTOR).await.unwrap();
    assert_eq!(disputed.status, TaskStatus::Disputed);
    assert!(matches!(
        h.engine.escrow().complete(18, CUSTOMER).await,
        Err(Error::InvalidStateTransition { .. })
    ));

    let refund = h.engine.escrow().resolve_refund(18).await.unwrap();
    assert_eq!(refund.task.status, TaskStatus::Cancelled);
    assert_eq!(refund.entry.kind, EntryKind::Refund);

    let customer = h.account(CUSTOMER).await;
    assert_eq!(customer.balance, money("1000"));
    assert_eq!(customer.frozen, money("0"));
    assert_eq!(h.account(EXECUTOR).await.balance, money("0"));
}

#[tokio::test]
async fn dispute_payout_settles_like_completion() {
    let h = Harness::new();
    h.fund(CUSTOMER, "1000").await;
    h.task_with_offer(19, CUSTOMER, EXECUTOR, "600").await;
    h.engine
        .escrow()
        .assign(19, Assignee::Executor(EXECUTOR), CUSTOMER)
        .await
        .unwrap();
    h.engine.escrow().open_dispute(19, CUSTOMER).await.unwrap();

    let settlement = h.engine.escrow().resolve_payout(19).await.unwrap();
    assert_eq!(settlement.task.status, TaskStatus::Completed);
    assert_eq!(h.account(CUSTOMER).await.balance, money("400"));
    assert_eq!(h.account(EXECUTOR).await.balance, money("480"));
    assert_eq!(h.account(PLATFORM).await.balance, money("120"));
}

#[tokio::test]
async fn open_task_cancels_without_moving_money() {
    let h = Harness::new();
    h.fund(CUSTOMER, "1000").await;
    h.task_with_offer(20, CUSTOMER, EXECUTOR, "600").await;

    let cancelled = h.engine.escrow().cancel(20, CUSTOMER).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(matches!(
        h.engine
            .escrow()
            .assign(20, Assignee::Executor(EXECUTOR), CUSTOMER)
            .await,
        Err(Error::InvalidStateTransition { .. })
    ));
    assert_eq!(h.account(CUSTOMER).await.available(), money("1000"));
}
