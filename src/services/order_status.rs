use crate::{
    entities::{
        order::{self, OrderStatus, PaymentStatus},
        order_status_history::{self, StatusKind},
        Order, OrderModel,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set, TransactionTrait};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Legal order-status transitions. Anything not listed here is illegal:
/// the machine fails closed.
pub fn allowed_order_transitions(from: OrderStatus) -> &'static [OrderStatus] {
    use OrderStatus::*;
    match from {
        Pending => &[Processing, Paid, Cancelled, Failed],
        Processing => &[Paid, Cancelled, Failed],
        Paid => &[Completed, Refunded, Cancelled],
        Completed => &[Refunded],
        Failed => &[Processing, Cancelled],
        Cancelled => &[],
        Refunded => &[],
    }
}

/// Legal payment-status transitions. A failed payment may be retried to
/// paid; a refund requires the payment to have been paid first.
pub fn allowed_payment_transitions(from: PaymentStatus) -> &'static [PaymentStatus] {
    use PaymentStatus::*;
    match from {
        Pending => &[Paid, Failed],
        Paid => &[Refunded],
        Failed => &[Paid],
        Refunded => &[],
    }
}

pub fn order_transition_allowed(from: OrderStatus, to: OrderStatus) -> bool {
    allowed_order_transitions(from).contains(&to)
}

pub fn payment_transition_allowed(from: PaymentStatus, to: PaymentStatus) -> bool {
    allowed_payment_transitions(from).contains(&to)
}

/// Result of a status update attempt that did not error.
#[derive(Debug)]
pub struct StatusUpdate {
    pub order: OrderModel,
    /// False when the order was already in the target status and the call
    /// was a no-op (idempotent re-delivery); no history row was written.
    pub applied: bool,
}

/// Governs order and payment status transitions.
///
/// Both update paths validate against the transition tables, write the order
/// row and the audit history entry in one transaction, and treat a
/// same-status update as a no-op rather than an error so that racing writers
/// (client confirmation vs. webhook) converge instead of failing.
#[derive(Clone)]
pub struct OrderStatusService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl OrderStatusService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Updates the fulfillment status of an order.
    #[instrument(skip(self), fields(order_id = %order_id, new_status = %new_status))]
    pub async fn update_order_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        notes: Option<String>,
    ) -> Result<StatusUpdate, ServiceError> {
        let txn = self.db.begin().await?;

        let order = Order::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let old_status = order.status;

        if old_status == new_status {
            info!(order_id = %order_id, status = %new_status, "Order already in target status; no-op");
            return Ok(StatusUpdate {
                order,
                applied: false,
            });
        }

        if !order_transition_allowed(old_status, new_status) {
            return Err(ServiceError::InvalidTransition {
                from: old_status.to_string(),
                to: new_status.to_string(),
                allowed: allowed_order_transitions(old_status)
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            });
        }

        let mut active: order::ActiveModel = order.into();
        active.status = Set(new_status);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await?;

        append_history(&txn, order_id, StatusKind::Order, new_status.to_string(), notes).await?;

        txn.commit().await?;

        info!(
            order_id = %order_id,
            old_status = %old_status,
            new_status = %new_status,
            "Order status updated"
        );

        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: old_status.to_string(),
                new_status: new_status.to_string(),
            })
            .await;

        Ok(StatusUpdate {
            order: updated,
            applied: true,
        })
    }

    /// Updates the payment status of an order.
    #[instrument(skip(self), fields(order_id = %order_id, new_status = %new_status))]
    pub async fn update_payment_status(
        &self,
        order_id: Uuid,
        new_status: PaymentStatus,
        notes: Option<String>,
    ) -> Result<StatusUpdate, ServiceError> {
        let txn = self.db.begin().await?;

        let order = Order::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let old_status = order.payment_status;

        if old_status == new_status {
            info!(order_id = %order_id, status = %new_status, "Payment already in target status; no-op");
            return Ok(StatusUpdate {
                order,
                applied: false,
            });
        }

        if !payment_transition_allowed(old_status, new_status) {
            return Err(ServiceError::InvalidTransition {
                from: old_status.to_string(),
                to: new_status.to_string(),
                allowed: allowed_payment_transitions(old_status)
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            });
        }

        let mut active: order::ActiveModel = order.into();
        active.payment_status = Set(new_status);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await?;

        append_history(
            &txn,
            order_id,
            StatusKind::Payment,
            new_status.to_string(),
            notes,
        )
        .await?;

        txn.commit().await?;

        info!(
            order_id = %order_id,
            old_status = %old_status,
            new_status = %new_status,
            "Payment status updated"
        );

        self.event_sender
            .send_or_log(Event::PaymentStatusChanged {
                order_id,
                old_status: old_status.to_string(),
                new_status: new_status.to_string(),
            })
            .await;

        Ok(StatusUpdate {
            order: updated,
            applied: true,
        })
    }
}

/// Appends one audit row. Runs on the caller's connection so it joins the
/// surrounding transaction.
pub async fn append_history(
    conn: &impl sea_orm::ConnectionTrait,
    order_id: Uuid,
    kind: StatusKind,
    status: String,
    notes: Option<String>,
) -> Result<(), ServiceError> {
    let entry = order_status_history::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        kind: Set(kind),
        status: Set(status),
        notes: Set(notes),
        created_at: Set(Utc::now()),
    };
    entry.insert(conn).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Order transition table ====================

    #[test]
    fn happy_path_transitions_are_legal() {
        use OrderStatus::*;
        assert!(order_transition_allowed(Pending, Processing));
        assert!(order_transition_allowed(Processing, Paid));
        assert!(order_transition_allowed(Paid, Completed));
    }

    #[test]
    fn refund_requires_paid_or_completed() {
        use OrderStatus::*;
        assert!(!order_transition_allowed(Pending, Refunded));
        assert!(!order_transition_allowed(Processing, Refunded));
        assert!(order_transition_allowed(Paid, Refunded));
        assert!(order_transition_allowed(Completed, Refunded));
    }

    #[test]
    fn terminal_statuses_admit_no_transitions() {
        use OrderStatus::*;
        for to in [Pending, Processing, Paid, Completed, Failed] {
            assert!(!order_transition_allowed(Cancelled, to));
            assert!(!order_transition_allowed(Refunded, to));
        }
    }

    #[test]
    fn cancellation_is_reachable_before_completion() {
        use OrderStatus::*;
        assert!(order_transition_allowed(Pending, Cancelled));
        assert!(order_transition_allowed(Processing, Cancelled));
        assert!(order_transition_allowed(Paid, Cancelled));
        assert!(!order_transition_allowed(Completed, Cancelled));
    }

    #[test]
    fn failed_orders_can_be_retried() {
        use OrderStatus::*;
        assert!(order_transition_allowed(Failed, Processing));
        assert!(!order_transition_allowed(Failed, Paid));
    }

    // ==================== Payment transition table ====================

    #[test]
    fn payment_refund_requires_paid() {
        use PaymentStatus::*;
        assert!(!payment_transition_allowed(Pending, Refunded));
        assert!(payment_transition_allowed(Paid, Refunded));
        assert!(!payment_transition_allowed(Failed, Refunded));
    }

    #[test]
    fn failed_payment_can_be_retried_to_paid() {
        use PaymentStatus::*;
        assert!(payment_transition_allowed(Failed, Paid));
        assert!(!payment_transition_allowed(Refunded, Paid));
    }

    #[test]
    fn allowed_sets_match_predicate() {
        use OrderStatus::*;
        for from in [Pending, Processing, Paid, Completed, Cancelled, Refunded, Failed] {
            for to in [Pending, Processing, Paid, Completed, Cancelled, Refunded, Failed] {
                assert_eq!(
                    allowed_order_transitions(from).contains(&to),
                    order_transition_allowed(from, to)
                );
            }
        }
    }
}
