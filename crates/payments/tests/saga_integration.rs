//! End-to-end tests of the payment sagas against the in-memory collaborators.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use payments::{
    CALLBACK_SAGA_TYPE, COMPENSATION_ERROR_MSG, CallbackData, CallbackSagaService,
    InMemoryChannelClient, InMemoryMessageBus, InMemoryOrderClient, InMemoryPaymentRepository,
    OrderStatus, PAYMENT_EVENTS_TOPIC, PAYMENT_SAGA_TYPE, Payment, PaymentError,
    PaymentRepository, PaymentSagaService, PaymentStatus, REFUND_SAGA_TYPE, Refund,
    RefundSagaService, RefundStatus,
};
use saga::{
    CompensationRegistry, InMemoryReviewSink, RecoveryWorker, ReviewQueue, ReviewReason,
    SagaError, SagaOrchestrator, SagaStatus, StepStatus,
};
use saga_journal::InMemorySagaJournal;
use uuid::Uuid;

struct TestHarness {
    orchestrator: SagaOrchestrator,
    review: InMemoryReviewSink,
    repo: InMemoryPaymentRepository,
    orders: InMemoryOrderClient,
    channel: InMemoryChannelClient,
    bus: InMemoryMessageBus,
}

impl TestHarness {
    fn new() -> Self {
        let review = InMemoryReviewSink::new();
        let (queue, _worker) = ReviewQueue::spawn(Arc::new(review.clone()), 16);
        let orchestrator = SagaOrchestrator::new(Arc::new(InMemorySagaJournal::new()))
            .with_review_queue(queue);

        Self {
            orchestrator,
            review,
            repo: InMemoryPaymentRepository::new(),
            orders: InMemoryOrderClient::new(),
            channel: InMemoryChannelClient::new(),
            bus: InMemoryMessageBus::new(),
        }
    }

    fn payments(&self) -> PaymentSagaService {
        PaymentSagaService::new(
            self.orchestrator.clone(),
            Arc::new(self.repo.clone()),
            Arc::new(self.orders.clone()),
            Arc::new(self.channel.clone()),
        )
    }

    fn refunds(&self) -> RefundSagaService {
        RefundSagaService::new(
            self.orchestrator.clone(),
            Arc::new(self.repo.clone()),
            Arc::new(self.channel.clone()),
        )
    }

    fn callbacks(&self) -> CallbackSagaService {
        CallbackSagaService::new(
            self.orchestrator.clone(),
            Arc::new(self.repo.clone()),
            Arc::new(self.orders.clone()),
            Arc::new(self.bus.clone()),
        )
    }

    async fn stored_payment(&self, status: PaymentStatus) -> Payment {
        let mut payment = Payment::new("PAY-1", "ORD-1", Uuid::new_v4(), 10_000, "USD", "stripe");
        payment.status = status;
        self.repo.save_payment(&payment).await.unwrap();
        payment
    }

    async fn stored_refund(&self, amount: i64) -> Refund {
        let refund = Refund::new("RFD-1", "PAY-1", amount).with_reason("customer request");
        self.repo.save_refund(&refund).await.unwrap();
        refund
    }

    async fn payment(&self) -> Payment {
        self.repo.get_payment("PAY-1").await.unwrap().unwrap()
    }

    async fn refund(&self) -> Refund {
        self.repo.get_refund("RFD-1").await.unwrap().unwrap()
    }
}

#[tokio::test]
async fn test_payment_saga_creates_order_and_charge() {
    let h = TestHarness::new();
    let payment = h.stored_payment(PaymentStatus::Pending).await;

    let saga = h.payments().execute_payment_saga(&payment).await.unwrap();

    assert_eq!(saga.status(), SagaStatus::Completed);
    assert_eq!(saga.saga_type(), PAYMENT_SAGA_TYPE);
    assert_eq!(saga.metadata()["order_no"], "ORD-1");

    let order = h.orders.order("ORD-1").await.unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.payment_no, "PAY-1");

    let stored = h.payment().await;
    assert_eq!(stored.status, PaymentStatus::Processing);
    let channel_order_no = stored.channel_order_no.clone().unwrap();
    assert!(h.channel.charge(&channel_order_no).await.is_some());
    assert_eq!(
        stored.payment_url(),
        Some("https://checkout.example/PAY-1")
    );
}

#[tokio::test]
async fn test_payment_channel_outage_cancels_order() {
    let h = TestHarness::new();
    let payment = h.stored_payment(PaymentStatus::Pending).await;
    h.channel.fail_always("create_payment").await;

    let err = h.payments().execute_payment_saga(&payment).await.unwrap_err();

    match err {
        PaymentError::Saga(SagaError::StepFailed { step, attempts, .. }) => {
            assert_eq!(step, "CallPaymentChannel");
            assert_eq!(attempts, 4);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.channel.call_count("create_payment").await, 4);
    assert_eq!(h.channel.call_count("cancel_payment").await, 0);
    assert_eq!(
        h.orders.cancellations().await,
        vec![(
            "ORD-1".to_string(),
            "payment flow failed, auto cancel".to_string()
        )]
    );

    let stored = h.payment().await;
    assert_eq!(stored.status, PaymentStatus::Failed);
    assert!(stored.error_msg.unwrap().contains("injected failure"));

    let saga = h.orchestrator.get_saga_by_business_id("PAY-1").await.unwrap();
    assert_eq!(saga.status(), SagaStatus::Compensated);
    assert_eq!(saga.failed_step(), Some("CallPaymentChannel"));
}

#[tokio::test]
async fn test_payment_saga_is_idempotent_per_payment() {
    let h = TestHarness::new();
    let payment = h.stored_payment(PaymentStatus::Pending).await;
    let service = h.payments();

    let first = service.execute_payment_saga(&payment).await.unwrap();
    let second = service.execute_payment_saga(&payment).await.unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(h.orders.call_count("create_order").await, 1);
    assert_eq!(h.channel.call_count("create_payment").await, 1);
}

#[tokio::test]
async fn test_failed_payment_saga_is_not_rerun() {
    let h = TestHarness::new();
    let payment = h.stored_payment(PaymentStatus::Pending).await;
    h.orders.reject("create_order").await;
    let service = h.payments();

    service.execute_payment_saga(&payment).await.unwrap_err();
    let err = service.execute_payment_saga(&payment).await.unwrap_err();

    assert!(matches!(
        err,
        PaymentError::SagaAlreadyFailed {
            status: SagaStatus::Compensated,
            ..
        }
    ));
    assert_eq!(h.orders.call_count("create_order").await, 1);
}

#[tokio::test]
async fn test_unknown_payment_is_rejected() {
    let h = TestHarness::new();
    let payment = Payment::new("PAY-404", "ORD-404", Uuid::new_v4(), 100, "USD", "stripe");

    let err = h.payments().execute_payment_saga(&payment).await.unwrap_err();

    assert!(matches!(err, PaymentError::PaymentNotFound(no) if no == "PAY-404"));
    assert!(h.orchestrator.find_saga("PAY-404", PAYMENT_SAGA_TYPE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_uncancellable_charge_raises_review_ticket() {
    let h = TestHarness::new();
    let payment = h.stored_payment(PaymentStatus::Pending).await;
    let service = h.payments();
    service.execute_payment_saga(&payment).await.unwrap();
    h.channel.set_cancel_supported(false).await;

    let status = service.compensate_payment("PAY-1").await.unwrap();

    assert_eq!(status, SagaStatus::Compensated);
    let tickets = h.review.wait_for(1).await;
    assert_eq!(tickets[0].reason, ReviewReason::IrreversibleSideEffect);
    assert_eq!(tickets[0].step.as_deref(), Some("CallPaymentChannel"));

    let stored = h.payment().await;
    assert_eq!(stored.status, PaymentStatus::Failed);
    assert_eq!(stored.error_msg.as_deref(), Some(COMPENSATION_ERROR_MSG));
    assert_eq!(h.orders.order("ORD-1").await.unwrap().status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn test_refund_happy_path() {
    let h = TestHarness::new();
    h.stored_payment(PaymentStatus::Success).await;
    let refund = h.stored_refund(2_500).await;

    let saga = h.refunds().execute_refund_saga(&refund).await.unwrap();

    assert_eq!(saga.status(), SagaStatus::Completed);
    assert_eq!(saga.saga_type(), REFUND_SAGA_TYPE);
    assert_eq!(saga.business_id(), "RFD-1");
    assert_eq!(
        saga.step_names(),
        vec!["CallChannelRefund", "UpdatePaymentStatus", "UpdateRefundStatus"]
    );

    let sent = h.channel.refunds().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].amount, 2_500);

    assert_eq!(h.payment().await.status, PaymentStatus::Refunded);
    let stored = h.refund().await;
    assert_eq!(stored.status, RefundStatus::Success);
    assert!(stored.channel_refund_no.is_some());
    assert!(stored.refunded_at.is_some());
}

#[tokio::test]
async fn test_refund_status_outage_restores_payment() {
    let h = TestHarness::new();
    h.stored_payment(PaymentStatus::Success).await;
    let refund = h.stored_refund(2_500).await;
    // The channel step's own update goes through; UpdateRefundStatus never does.
    h.repo.fail_after("update_refund", 1, 4).await;

    let err = h.refunds().execute_refund_saga(&refund).await.unwrap_err();

    match err {
        PaymentError::Saga(SagaError::StepFailed { step, attempts, .. }) => {
            assert_eq!(step, "UpdateRefundStatus");
            assert_eq!(attempts, 4);
        }
        other => panic!("unexpected error: {other}"),
    }

    let saga = h.orchestrator.get_saga_by_business_id("RFD-1").await.unwrap();
    assert_eq!(saga.status(), SagaStatus::Compensated);
    assert_eq!(
        saga.step("UpdatePaymentStatus").unwrap().status,
        StepStatus::Compensated
    );
    assert_eq!(h.payment().await.status, PaymentStatus::Success);
    assert_eq!(h.refund().await.status, RefundStatus::Failed);

    let tickets = h.review.wait_for(1).await;
    assert_eq!(tickets[0].reason, ReviewReason::IrreversibleSideEffect);
    assert_eq!(tickets[0].step.as_deref(), Some("CallChannelRefund"));
    assert_eq!(h.channel.refunds().await.len(), 1);
}

#[tokio::test]
async fn test_refund_validation() {
    let h = TestHarness::new();
    h.stored_payment(PaymentStatus::Processing).await;
    let refund = h.stored_refund(2_500).await;

    let err = h.refunds().execute_refund_saga(&refund).await.unwrap_err();
    assert!(matches!(err, PaymentError::InvalidRefund(_)));

    let mut payment = h.payment().await;
    payment.status = PaymentStatus::Success;
    h.repo.update_payment(&payment).await.unwrap();
    let mut too_much = h.refund().await;
    too_much.amount = 20_000;
    h.repo.update_refund(&too_much).await.unwrap();

    let err = h.refunds().execute_refund_saga(&too_much).await.unwrap_err();
    assert!(matches!(err, PaymentError::InvalidRefund(_)));

    assert_eq!(h.channel.call_count("create_refund").await, 0);
    assert!(h.orchestrator.find_saga("RFD-1", REFUND_SAGA_TYPE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_success_callback_settles_payment_and_order() {
    let h = TestHarness::new();
    let payment = h.stored_payment(PaymentStatus::Pending).await;
    h.payments().execute_payment_saga(&payment).await.unwrap();
    let paid_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

    let callback = CallbackData::parse("PAY-1", "success", r#"{"status":"success"}"#)
        .unwrap()
        .with_channel_order_no("CH-EXT-9")
        .with_paid_at(paid_at);
    let saga = h.callbacks().execute_callback_saga(callback).await.unwrap();

    assert_eq!(saga.status(), SagaStatus::Completed);
    assert_eq!(saga.saga_type(), CALLBACK_SAGA_TYPE);
    assert_eq!(saga.metadata()["status"], "success");

    let stored = h.payment().await;
    assert_eq!(stored.status, PaymentStatus::Success);
    assert_eq!(stored.paid_at, Some(paid_at));
    assert_eq!(stored.channel_order_no.as_deref(), Some("CH-EXT-9"));

    assert_eq!(h.orders.order("ORD-1").await.unwrap().status, OrderStatus::Paid);
    let updates = h.orders.status_updates().await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].1.status, OrderStatus::Paid);
    assert_eq!(updates[0].1.paid_at, Some(paid_at));

    let audits = h.repo.callbacks_for_payment("PAY-1").await.unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].event, "payment.success");
    assert!(!audits[0].compensated);

    let published = h.bus.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, PAYMENT_EVENTS_TOPIC);
    assert_eq!(published[0].1["event_type"], "payment.callback");
    assert_eq!(published[0].1["status"], "success");
    assert_eq!(published[0].1["payment_no"], "PAY-1");
}

#[tokio::test]
async fn test_failed_callback_records_reason() {
    let h = TestHarness::new();
    let payment = h.stored_payment(PaymentStatus::Pending).await;
    h.payments().execute_payment_saga(&payment).await.unwrap();

    let callback = CallbackData::parse("PAY-1", "failed", "{}")
        .unwrap()
        .with_failure_reason("card declined");
    h.callbacks().execute_callback_saga(callback).await.unwrap();

    let stored = h.payment().await;
    assert_eq!(stored.status, PaymentStatus::Failed);
    assert_eq!(stored.error_msg.as_deref(), Some("card declined"));
    assert_eq!(
        h.orders.order("ORD-1").await.unwrap().status,
        OrderStatus::PaymentFailed
    );
}

#[tokio::test]
async fn test_publish_failure_does_not_fail_callback() {
    let h = TestHarness::new();
    h.stored_payment(PaymentStatus::Processing).await;
    h.bus.fail_always("publish").await;

    let callback = CallbackData::parse("PAY-1", "success", "{}").unwrap();
    let saga = h.callbacks().execute_callback_saga(callback).await.unwrap();

    assert_eq!(saga.status(), SagaStatus::Completed);
    assert_eq!(h.bus.call_count("publish").await, 1);
    assert!(h.bus.published().await.is_empty());
    let result = saga.step("PublishEvent").unwrap().result.clone().unwrap();
    assert_eq!(result.as_value()["event_published"], false);
    assert_eq!(h.payment().await.status, PaymentStatus::Success);
}

#[tokio::test]
async fn test_order_outage_unwinds_callback() {
    let h = TestHarness::new();
    let payment = h.stored_payment(PaymentStatus::Pending).await;
    h.payments().execute_payment_saga(&payment).await.unwrap();
    h.orders.fail_always("update_order_status").await;

    let callback = CallbackData::parse("PAY-1", "success", "{}").unwrap();
    let err = h.callbacks().execute_callback_saga(callback).await.unwrap_err();

    match err {
        PaymentError::Saga(SagaError::StepFailed { step, .. }) => {
            assert_eq!(step, "UpdateOrderStatus")
        }
        other => panic!("unexpected error: {other}"),
    }

    let stored = h.payment().await;
    assert_eq!(stored.status, PaymentStatus::Pending);
    assert!(stored.paid_at.is_none());

    let audits = h.repo.callbacks_for_payment("PAY-1").await.unwrap();
    assert!(audits[0].compensated);
    assert!(audits[0].compensated_at.is_some());
    assert!(h.bus.published().await.is_empty());

    let saga = h
        .orchestrator
        .find_saga("PAY-1", CALLBACK_SAGA_TYPE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saga.status(), SagaStatus::Compensated);
}

#[tokio::test]
async fn test_callback_redelivered_after_order_outage_settles_payment() {
    let h = TestHarness::new();
    h.stored_payment(PaymentStatus::Processing).await;
    h.orders.fail("update_order_status", 4).await;
    let service = h.callbacks();

    let first = service
        .execute_callback_saga(CallbackData::parse("PAY-1", "success", "{}").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(
        first,
        PaymentError::Saga(SagaError::StepFailed { ref step, .. }) if step == "UpdateOrderStatus"
    ));
    let rolled_back = h
        .orchestrator
        .find_saga("PAY-1", CALLBACK_SAGA_TYPE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rolled_back.status(), SagaStatus::Compensated);
    assert_eq!(h.payment().await.status, PaymentStatus::Pending);

    let saga = service
        .execute_callback_saga(CallbackData::parse("PAY-1", "success", "{}").unwrap())
        .await
        .unwrap();

    assert_eq!(saga.status(), SagaStatus::Completed);
    assert_ne!(saga.id(), rolled_back.id());
    assert_eq!(h.payment().await.status, PaymentStatus::Success);
    let updates = h.orders.status_updates().await;
    assert_eq!(updates.last().unwrap().1.status, OrderStatus::Paid);

    // One audit row per delivery; the first stays marked compensated.
    let audits = h.repo.callbacks_for_payment("PAY-1").await.unwrap();
    assert_eq!(audits.len(), 2);
    assert_eq!(audits.iter().filter(|a| a.compensated).count(), 1);

    // A third delivery returns the completed saga.
    let again = service
        .execute_callback_saga(CallbackData::parse("PAY-1", "success", "{}").unwrap())
        .await
        .unwrap();
    assert_eq!(again.id(), saga.id());
    assert_eq!(h.repo.callbacks_for_payment("PAY-1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_manual_callback_compensation_publishes_notice() {
    let h = TestHarness::new();
    h.stored_payment(PaymentStatus::Processing).await;
    let service = h.callbacks();
    service
        .execute_callback_saga(CallbackData::parse("PAY-1", "success", "{}").unwrap())
        .await
        .unwrap();

    let status = service.compensate_callback("PAY-1").await.unwrap();

    assert_eq!(status, SagaStatus::Compensated);
    assert_eq!(h.payment().await.status, PaymentStatus::Pending);
    let updates = h.orders.status_updates().await;
    assert_eq!(updates.last().unwrap().1.status, OrderStatus::Pending);

    let events: Vec<_> = h
        .bus
        .published()
        .await
        .into_iter()
        .map(|(_, event)| event["event_type"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(
        events,
        vec!["payment.callback", "payment.callback.compensated"]
    );
}

#[tokio::test]
async fn test_unknown_callback_status_is_rejected_before_saga() {
    let h = TestHarness::new();
    h.stored_payment(PaymentStatus::Processing).await;

    let err = CallbackData::parse("PAY-1", "refunded", "{}").unwrap_err();

    assert!(matches!(err, PaymentError::UnknownCallbackStatus(s) if s == "refunded"));
    assert!(h.orchestrator.find_saga("PAY-1", CALLBACK_SAGA_TYPE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_recovery_worker_retries_failed_callback_compensation() {
    let h = TestHarness::new();
    h.stored_payment(PaymentStatus::Processing).await;
    h.orders.fail_always("update_order_status").await;
    h.repo.fail("mark_callback_compensated", 1).await;

    let callbacks = Arc::new(h.callbacks());
    callbacks
        .execute_callback_saga(CallbackData::parse("PAY-1", "success", "{}").unwrap())
        .await
        .unwrap_err();

    let saga = h
        .orchestrator
        .find_saga("PAY-1", CALLBACK_SAGA_TYPE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saga.status(), SagaStatus::CompensationFailed);
    let tickets = h.review.wait_for(1).await;
    assert_eq!(tickets[0].reason, ReviewReason::CompensationFailed);

    // A half-unwound callback stays with the recovery worker.
    let err = callbacks
        .execute_callback_saga(CallbackData::parse("PAY-1", "success", "{}").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::SagaAlreadyFailed { .. }));

    let registry = CompensationRegistry::new()
        .with(Arc::new(h.payments()))
        .with(Arc::new(h.refunds()))
        .with(callbacks);
    let worker = RecoveryWorker::new(h.orchestrator.clone(), Arc::new(registry));

    let report = worker.run_once().await.unwrap();

    assert_eq!(report.scanned, 1);
    assert_eq!(report.recovered, 1);
    let saga = h
        .orchestrator
        .find_saga("PAY-1", CALLBACK_SAGA_TYPE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saga.status(), SagaStatus::Compensated);
    let audits = h.repo.callbacks_for_payment("PAY-1").await.unwrap();
    assert!(audits[0].compensated);
    // Reset ran once, on the first pass.
    assert_eq!(h.payment().await.status, PaymentStatus::Pending);
}
