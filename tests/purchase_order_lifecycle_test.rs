mod common;

use assert_matches::assert_matches;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, QueryFilter};
use stateset_procurement::{
    audit::AuditAggregate,
    events::Event,
    models::{required_product_line, PurchaseOrderStatus, RequisitionStatus},
    services::purchase_orders::{EditLinesRequest, LineEdit, TransitionRequest},
    ServiceError,
};
use uuid::Uuid;

use common::TestProcurement;

/// Requires 100 of one product and awards `awarded` from a single supplier.
async fn awarded_order(env: &TestProcurement, awarded: i32) -> (Uuid, Uuid, Uuid) {
    let setup = env
        .quoted_requisition(100, &[(100, dec!(10), Some(TestProcurement::in_days(5)))])
        .await;
    let result = env
        .award(
            setup.requisition_id,
            vec![setup.quotations[0].accept(setup.product_id, awarded)],
        )
        .await;
    (
        setup.requisition_id,
        setup.product_id,
        result.created_purchase_orders[0],
    )
}

#[tokio::test]
async fn confirmation_moves_promise_into_fulfillment() {
    let env = TestProcurement::new().await;
    let (requisition_id, product_id, po_id) = awarded_order(&env, 60).await;

    env.transition(po_id, PurchaseOrderStatus::SentToSupplier).await;
    let outcome = env
        .services
        .purchase_orders
        .transition(
            &env.buyer,
            TransitionRequest::new(po_id, PurchaseOrderStatus::ConfirmedBySupplier),
        )
        .await
        .unwrap();

    assert!(outcome.changed);
    assert_eq!(outcome.old_status, PurchaseOrderStatus::SentToSupplier);
    assert!(outcome.purchase_order.confirmed_at.is_some());
    let ledger = outcome.ledger.expect("confirmation reconciles counters");
    assert!(ledger.applied);
    assert_eq!(ledger.status_after, RequisitionStatus::POInProgress);
    assert_eq!(env.counters(requisition_id, product_id).await, (0, 0));
}

#[tokio::test]
async fn canceling_before_confirmation_releases_the_promise() {
    let env = TestProcurement::new().await;
    let (requisition_id, product_id, po_id) = awarded_order(&env, 60).await;
    assert_eq!(env.counters(requisition_id, product_id).await, (0, 60));

    let order = env.transition(po_id, PurchaseOrderStatus::Canceled).await;

    assert_eq!(order.status, PurchaseOrderStatus::Canceled);
    assert_eq!(env.counters(requisition_id, product_id).await, (0, 0));
    let requisition = env
        .services
        .requisitions
        .get_requisition(requisition_id)
        .await
        .unwrap();
    assert_eq!(requisition.requisition.status, RequisitionStatus::Quoted);
}

#[tokio::test]
async fn supplier_rejection_releases_the_promise() {
    let env = TestProcurement::new().await;
    let (requisition_id, product_id, po_id) = awarded_order(&env, 25).await;

    env.transition(po_id, PurchaseOrderStatus::SentToSupplier).await;
    env.transition(po_id, PurchaseOrderStatus::RejectedBySupplier)
        .await;

    assert_eq!(env.counters(requisition_id, product_id).await, (0, 0));
}

#[tokio::test]
async fn repeating_a_cancel_does_not_release_twice() {
    let env = TestProcurement::new().await;
    let (requisition_id, product_id, po_id) = awarded_order(&env, 30).await;
    env.transition(po_id, PurchaseOrderStatus::Canceled).await;

    let replay = env
        .services
        .purchase_orders
        .transition(
            &env.buyer,
            TransitionRequest::new(po_id, PurchaseOrderStatus::Canceled),
        )
        .await
        .unwrap();

    assert!(!replay.changed);
    assert!(!replay.ledger.expect("reversal replayed").applied);
    assert_eq!(env.counters(requisition_id, product_id).await, (0, 0));
}

#[tokio::test]
async fn over_ordering_requires_acknowledgment() {
    let mut env = TestProcurement::new().await;
    let setup = env
        .quoted_requisition(100, &[(80, dec!(10), None), (80, dec!(11), None)])
        .await;
    let result = env
        .award(
            setup.requisition_id,
            vec![
                setup.quotations[0].accept(setup.product_id, 80),
                setup.quotations[1].accept(setup.product_id, 80),
            ],
        )
        .await;
    assert_eq!(result.created_purchase_orders.len(), 2);
    let po_id = result.created_purchase_orders[0];
    env.transition(po_id, PurchaseOrderStatus::SentToSupplier).await;

    let err = env
        .services
        .purchase_orders
        .transition(
            &env.buyer,
            TransitionRequest::new(po_id, PurchaseOrderStatus::ConfirmedBySupplier),
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(msg) if msg.contains("over-order"));

    env.drain_events();
    let outcome = env
        .services
        .purchase_orders
        .transition(
            &env.buyer,
            TransitionRequest::new(po_id, PurchaseOrderStatus::ConfirmedBySupplier)
                .acknowledging_over_order(),
        )
        .await
        .unwrap();

    assert!(outcome.purchase_order.over_order_acknowledged);
    assert_eq!(outcome.over_ordered_products, vec![setup.product_id]);
    assert_eq!(env.counters(setup.requisition_id, setup.product_id).await, (0, 80));
    assert!(env.drain_events().iter().any(|e| matches!(
        e,
        Event::OverOrderAcknowledged { purchase_order_id, .. } if *purchase_order_id == po_id
    )));
    let audited = env.audit.records_for(po_id).await;
    assert!(audited
        .iter()
        .any(|r| r.field == "over_order_acknowledged"));
}

#[tokio::test]
async fn illegal_and_derived_targets_are_refused() {
    let env = TestProcurement::new().await;
    let (_, _, po_id) = awarded_order(&env, 10).await;

    let skip_ahead = env
        .services
        .purchase_orders
        .transition(
            &env.buyer,
            TransitionRequest::new(po_id, PurchaseOrderStatus::ConfirmedBySupplier),
        )
        .await
        .unwrap_err();
    assert_matches!(skip_ahead, ServiceError::ValidationError(_));

    for derived in [
        PurchaseOrderStatus::PartiallyDelivered,
        PurchaseOrderStatus::FullyReceived,
        PurchaseOrderStatus::Completed,
    ] {
        let err = env
            .services
            .purchase_orders
            .transition(&env.buyer, TransitionRequest::new(po_id, derived))
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::ValidationError(_));
    }

    let order = env
        .services
        .purchase_orders
        .get_purchase_order(po_id)
        .await
        .unwrap()
        .order;
    assert_eq!(order.status, PurchaseOrderStatus::Pending);
    assert_eq!(order.version, 1);
}

#[tokio::test]
async fn editing_a_sent_order_snapshots_once_and_adjusts_the_promise() {
    let env = TestProcurement::new().await;
    let (requisition_id, product_id, po_id) = awarded_order(&env, 60).await;
    env.transition(po_id, PurchaseOrderStatus::SentToSupplier).await;
    let line_id = env
        .services
        .purchase_orders
        .get_purchase_order(po_id)
        .await
        .unwrap()
        .lines[0]
        .id;

    let first = env
        .services
        .purchase_orders
        .edit_lines(
            &env.buyer,
            EditLinesRequest {
                purchase_order_id: po_id,
                lines: vec![LineEdit {
                    line_id: Some(line_id),
                    product_id,
                    ordered_quantity: 70,
                    unit_price: dec!(9.50),
                }],
                additional_costs: Some(dec!(40)),
            },
        )
        .await
        .unwrap();
    assert!(first.snapshot_taken);
    assert_eq!(env.counters(requisition_id, product_id).await, (0, 70));

    let second = env
        .services
        .purchase_orders
        .edit_lines(
            &env.buyer,
            EditLinesRequest {
                purchase_order_id: po_id,
                lines: vec![LineEdit {
                    line_id: Some(line_id),
                    product_id,
                    ordered_quantity: 65,
                    unit_price: dec!(9.50),
                }],
                additional_costs: None,
            },
        )
        .await
        .unwrap();
    assert!(!second.snapshot_taken);
    assert_eq!(env.counters(requisition_id, product_id).await, (0, 65));

    let diff = env
        .services
        .purchase_orders
        .edit_diff(po_id)
        .await
        .unwrap()
        .expect("snapshot exists");
    assert_eq!(diff.additional_costs_before, dec!(25.00));
    assert_eq!(diff.additional_costs_after, dec!(40));
    assert_eq!(diff.lines.len(), 1);
    assert_eq!(diff.lines[0].before.as_ref().unwrap().ordered_quantity, 60);
    assert_eq!(diff.lines[0].after.as_ref().unwrap().ordered_quantity, 65);

    let line_audit = env.audit.records_for(line_id).await;
    assert_eq!(
        line_audit
            .iter()
            .filter(|r| r.aggregate == AuditAggregate::PurchaseOrderLine && r.field == "ordered_quantity")
            .count(),
        2
    );
}

#[tokio::test]
async fn failed_counter_adjustment_rolls_back_the_edit() {
    let env = TestProcurement::new().await;
    let (requisition_id, product_id, po_id) = awarded_order(&env, 60).await;
    env.transition(po_id, PurchaseOrderStatus::SentToSupplier).await;
    let before = env
        .services
        .purchase_orders
        .get_purchase_order(po_id)
        .await
        .unwrap();
    let edit = EditLinesRequest {
        purchase_order_id: po_id,
        lines: vec![LineEdit {
            line_id: Some(before.lines[0].id),
            product_id,
            ordered_quantity: 80,
            unit_price: dec!(10),
        }],
        additional_costs: None,
    };

    // Without the requisition line the pending adjustment cannot be applied.
    let required_line = required_product_line::Entity::find()
        .filter(required_product_line::Column::RequisitionId.eq(requisition_id))
        .filter(required_product_line::Column::ProductId.eq(product_id))
        .one(env.db.as_ref())
        .await
        .unwrap()
        .expect("requisition line");
    required_product_line::Entity::delete_by_id(required_line.id)
        .exec(env.db.as_ref())
        .await
        .unwrap();

    let err = env
        .services
        .purchase_orders
        .edit_lines(&env.buyer, edit.clone())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let untouched = env
        .services
        .purchase_orders
        .get_purchase_order(po_id)
        .await
        .unwrap();
    assert_eq!(untouched, before);
    assert!(env
        .services
        .purchase_orders
        .edit_diff(po_id)
        .await
        .unwrap()
        .is_none());

    required_line
        .into_active_model()
        .reset_all()
        .insert(env.db.as_ref())
        .await
        .unwrap();
    let retried = env
        .services
        .purchase_orders
        .edit_lines(&env.buyer, edit)
        .await
        .unwrap();

    assert!(retried.snapshot_taken);
    assert!(retried.ledger.expect("pending adjusted").applied);
    assert_eq!(env.counters(requisition_id, product_id).await, (0, 80));
}

#[tokio::test]
async fn pending_orders_edit_without_snapshot() {
    let env = TestProcurement::new().await;
    let (_, product_id, po_id) = awarded_order(&env, 20).await;
    let line_id = env
        .services
        .purchase_orders
        .get_purchase_order(po_id)
        .await
        .unwrap()
        .lines[0]
        .id;

    let outcome = env
        .services
        .purchase_orders
        .edit_lines(
            &env.buyer,
            EditLinesRequest {
                purchase_order_id: po_id,
                lines: vec![LineEdit {
                    line_id: Some(line_id),
                    product_id,
                    ordered_quantity: 25,
                    unit_price: dec!(10),
                }],
                additional_costs: None,
            },
        )
        .await
        .unwrap();

    assert!(!outcome.snapshot_taken);
    assert!(env
        .services
        .purchase_orders
        .edit_diff(po_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn confirmed_orders_refuse_edits() {
    let env = TestProcurement::new().await;
    let (_, product_id, po_id) = awarded_order(&env, 20).await;
    env.confirm(po_id).await;

    let err = env
        .services
        .purchase_orders
        .edit_lines(
            &env.buyer,
            EditLinesRequest {
                purchase_order_id: po_id,
                lines: vec![LineEdit {
                    line_id: None,
                    product_id,
                    ordered_quantity: 5,
                    unit_price: dec!(1),
                }],
                additional_costs: None,
            },
        )
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::InvalidStatus(_));
}

#[tokio::test]
async fn requisition_with_open_promises_cannot_be_canceled() {
    let env = TestProcurement::new().await;
    let (requisition_id, _, po_id) = awarded_order(&env, 20).await;

    let err = env
        .services
        .requisitions
        .cancel_requisition(&env.buyer, requisition_id, None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidStatus(_));

    env.transition(po_id, PurchaseOrderStatus::Canceled).await;
    let canceled = env
        .services
        .requisitions
        .cancel_requisition(&env.buyer, requisition_id, Some("no longer needed".into()))
        .await
        .unwrap();
    assert_eq!(canceled.status, RequisitionStatus::Canceled);
}
