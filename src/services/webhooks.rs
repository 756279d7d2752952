use crate::{
    cache::TtlCache,
    entities::order::{OrderStatus, PaymentStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        order_status::{order_transition_allowed, OrderStatusService},
        orders::OrderService,
        payments::{
            stripe::{from_minor_units, order_reference_from_metadata},
            OrderReference, PaymentOutcome, PaymentResult, RefundDetails,
        },
    },
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;

/// Webhook event ids are remembered for a day; providers redeliver well
/// within that window.
const EVENT_DEDUP_TTL: Duration = Duration::from_secs(24 * 3600);

/// How a webhook delivery was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WebhookDisposition {
    /// Normalized and applied (or logged when no order reference exists).
    Processed,
    /// Same event id seen before; skipped.
    Duplicate,
    /// Event type this workflow does not handle; acknowledged as a no-op.
    Ignored,
}

/// Parses a provider webhook event into a normalized [`PaymentResult`].
///
/// Returns `None` for event types this workflow does not handle — that is a
/// neutral outcome, not an error. A missing order reference in metadata is
/// likewise valid: the event simply is not tied to an order.
pub fn parse_event(event: &Value) -> Option<PaymentResult> {
    let event_type = event.get("type").and_then(Value::as_str)?;
    let object = event.pointer("/data/object")?;

    let (payment_id, payment_intent_id) = extract_ids(object);
    let payment_method_id = object
        .get("payment_method")
        .and_then(Value::as_str)
        .map(String::from);
    let order_reference = order_reference_from_metadata(object.get("metadata"));

    let result = match event_type {
        "payment_intent.succeeded" | "charge.succeeded" | "payment.succeeded" => PaymentResult {
            success: true,
            payment_id,
            payment_intent_id,
            payment_method_id,
            status: PaymentOutcome::Completed,
            error: None,
            raw: Some(object.clone()),
            refund: None,
            order_reference,
        },
        "payment_intent.payment_failed" | "charge.failed" | "payment.failed" => PaymentResult {
            success: false,
            payment_id,
            payment_intent_id,
            payment_method_id,
            status: PaymentOutcome::Failed,
            error: object
                .pointer("/last_payment_error/message")
                .or_else(|| object.pointer("/failure_message"))
                .and_then(Value::as_str)
                .map(String::from),
            raw: Some(object.clone()),
            refund: None,
            order_reference,
        },
        "payment_intent.canceled" | "payment.canceled" => PaymentResult {
            success: false,
            payment_id,
            payment_intent_id,
            payment_method_id,
            status: PaymentOutcome::Canceled,
            error: object
                .get("cancellation_reason")
                .and_then(Value::as_str)
                .map(String::from),
            raw: Some(object.clone()),
            refund: None,
            order_reference,
        },
        "charge.refunded" => PaymentResult {
            success: true,
            payment_id,
            payment_intent_id,
            payment_method_id,
            status: PaymentOutcome::Refunded,
            error: None,
            raw: Some(object.clone()),
            refund: Some(refund_details(object)),
            order_reference,
        },
        _ => return None,
    };

    Some(result)
}

/// Charge events carry the charge id in `id` and the intent in
/// `payment_intent`; intent events carry the intent in `id` and the charge
/// in `latest_charge`.
fn extract_ids(object: &Value) -> (Option<String>, Option<String>) {
    let id = object.get("id").and_then(Value::as_str).map(String::from);
    let object_kind = object.get("object").and_then(Value::as_str).unwrap_or("");

    if object_kind == "charge" {
        let intent = object
            .get("payment_intent")
            .and_then(Value::as_str)
            .map(String::from);
        (id, intent)
    } else {
        let charge = object
            .get("latest_charge")
            .and_then(Value::as_str)
            .map(String::from);
        (charge, id)
    }
}

/// Refund amounts arrive in minor units; `amount_refunded` against `amount`
/// decides whether the charge is fully refunded.
fn refund_details(object: &Value) -> RefundDetails {
    let amount = object.get("amount").and_then(Value::as_i64).unwrap_or(0);
    let amount_refunded = object
        .get("amount_refunded")
        .and_then(Value::as_i64)
        .unwrap_or(0);

    let first_refund = object.pointer("/refunds/data/0");
    let reason = first_refund
        .and_then(|r| r.get("reason"))
        .and_then(Value::as_str)
        .map(String::from);
    let refunded_at: Option<DateTime<Utc>> = first_refund
        .and_then(|r| r.get("created"))
        .and_then(Value::as_i64)
        .and_then(|ts| DateTime::from_timestamp(ts, 0));

    RefundDetails {
        amount: from_minor_units(amount_refunded),
        fully_refunded: amount_refunded >= amount && amount > 0,
        reason,
        refunded_at,
    }
}

/// Reconciles asynchronous provider webhook events against orders.
///
/// Deliveries are deduplicated by provider event id; beyond that, the status
/// machine's same-status no-op makes reapplying a transition harmless, so a
/// redelivered event can never corrupt an order.
pub struct WebhookReconciler {
    order_service: Arc<OrderService>,
    status_service: Arc<OrderStatusService>,
    event_sender: Arc<EventSender>,
    seen_events: TtlCache<()>,
}

impl WebhookReconciler {
    pub fn new(
        order_service: Arc<OrderService>,
        status_service: Arc<OrderStatusService>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            order_service,
            status_service,
            event_sender,
            seen_events: TtlCache::new(EVENT_DEDUP_TTL),
        }
    }

    /// Processes one webhook delivery end to end.
    #[instrument(skip(self, event))]
    pub async fn process(&self, event: &Value) -> Result<WebhookDisposition, ServiceError> {
        if let Some(event_id) = event.get("id").and_then(Value::as_str) {
            if !self
                .seen_events
                .insert_if_absent(event_id, (), EVENT_DEDUP_TTL)
            {
                info!(event_id = %event_id, "Webhook event already processed; skipping");
                return Ok(WebhookDisposition::Duplicate);
            }
        }

        let Some(result) = parse_event(event) else {
            let event_type = event
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("<missing>");
            info!(event_type = %event_type, "Unhandled payment webhook type");
            return Ok(WebhookDisposition::Ignored);
        };

        self.apply(result).await?;
        Ok(WebhookDisposition::Processed)
    }

    /// Applies a normalized payment result to its order, when one is
    /// referenced. Results without a reference are observability-only.
    pub async fn apply(&self, result: PaymentResult) -> Result<(), ServiceError> {
        self.emit(&result).await;

        let Some(reference) = result.order_reference.clone() else {
            info!(
                status = %result.status,
                payment_intent_id = ?result.payment_intent_id,
                "Payment webhook carried no order reference; logged only"
            );
            return Ok(());
        };

        let Some(order) = self.order_service.find_by_reference(&reference).await? else {
            warn!(
                reference = ?reference,
                status = %result.status,
                "Payment webhook referenced an unknown order"
            );
            return Ok(());
        };

        let note = webhook_note(&result);
        match result.status {
            PaymentOutcome::Completed => {
                self.update_payment(order.id, PaymentStatus::Paid, note).await?;
                self.update_order_if_legal(order.id, order.status, OrderStatus::Paid)
                    .await?;
            }
            PaymentOutcome::Failed => {
                self.update_payment(order.id, PaymentStatus::Failed, note).await?;
                self.update_order_if_legal(order.id, order.status, OrderStatus::Failed)
                    .await?;
            }
            PaymentOutcome::Canceled => {
                self.update_payment(order.id, PaymentStatus::Failed, note).await?;
                self.update_order_if_legal(order.id, order.status, OrderStatus::Cancelled)
                    .await?;
            }
            PaymentOutcome::Refunded => {
                self.update_payment(order.id, PaymentStatus::Refunded, note).await?;
                self.update_order_if_legal(order.id, order.status, OrderStatus::Refunded)
                    .await?;
            }
        }

        Ok(())
    }

    /// Payment-status update that tolerates an illegal transition: the event
    /// is logged with full context instead of failing the receiver, since a
    /// provider will retry a failed delivery forever.
    async fn update_payment(
        &self,
        order_id: uuid::Uuid,
        target: PaymentStatus,
        note: Option<String>,
    ) -> Result<(), ServiceError> {
        match self
            .status_service
            .update_payment_status(order_id, target, note)
            .await
        {
            Ok(_) => Ok(()),
            Err(ServiceError::InvalidTransition { from, to, allowed }) => {
                warn!(
                    order_id = %order_id,
                    from = %from,
                    to = %to,
                    allowed = ?allowed,
                    "Webhook payment-status transition rejected"
                );
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    /// Mirrors a payment outcome onto the fulfillment status when the
    /// transition table allows it; skips quietly otherwise (e.g. the order
    /// was already cancelled by an admin).
    async fn update_order_if_legal(
        &self,
        order_id: uuid::Uuid,
        current: OrderStatus,
        target: OrderStatus,
    ) -> Result<(), ServiceError> {
        if current == target || !order_transition_allowed(current, target) {
            return Ok(());
        }
        match self
            .status_service
            .update_order_status(order_id, target, Some("Applied from payment webhook".into()))
            .await
        {
            Ok(_) => Ok(()),
            Err(ServiceError::InvalidTransition { from, to, .. }) => {
                // Raced another writer between the check and the update.
                warn!(order_id = %order_id, from = %from, to = %to, "Order-status mirror rejected");
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    async fn emit(&self, result: &PaymentResult) {
        let order_id = match &result.order_reference {
            Some(OrderReference::Id(id)) => Some(*id),
            _ => None,
        };
        let event = match result.status {
            PaymentOutcome::Completed => Event::PaymentSucceeded {
                order_id,
                payment_id: result.payment_id.clone(),
            },
            PaymentOutcome::Failed | PaymentOutcome::Canceled => Event::PaymentFailed {
                order_id,
                reason: result.error.clone(),
            },
            PaymentOutcome::Refunded => Event::PaymentRefunded {
                order_id,
                amount: result.refund.as_ref().map(|r| r.amount),
            },
        };
        self.event_sender.send_or_log(event).await;
    }
}

fn webhook_note(result: &PaymentResult) -> Option<String> {
    match result.status {
        PaymentOutcome::Completed => Some("Payment confirmed via webhook".to_string()),
        PaymentOutcome::Failed => Some(format!(
            "Payment failed via webhook: {}",
            result.error.as_deref().unwrap_or("no reason given")
        )),
        PaymentOutcome::Canceled => Some("Payment canceled via webhook".to_string()),
        PaymentOutcome::Refunded => result.refund.as_ref().map(|refund| {
            format!(
                "Refunded {}{} via webhook",
                refund.amount,
                if refund.fully_refunded { " (full)" } else { " (partial)" }
            )
        }),
    }
}
