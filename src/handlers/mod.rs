pub mod carts;
pub mod checkout;
pub mod common;
pub mod health;
pub mod orders;
pub mod payment_webhooks;
pub mod payments;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    services::{
        carts::CartService,
        checkout::CheckoutService,
        order_status::OrderStatusService,
        orders::OrderService,
        payments::{PaymentOrchestrator, StripeProvider},
        webhooks::WebhookReconciler,
    },
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Aggregated services shared by the HTTP handlers.
#[derive(Clone)]
pub struct AppServices {
    pub carts: Arc<CartService>,
    pub checkout: Arc<CheckoutService>,
    pub orders: Arc<OrderService>,
    pub order_status: Arc<OrderStatusService>,
    pub payments: Arc<PaymentOrchestrator>,
    pub webhooks: Arc<WebhookReconciler>,
}

impl AppServices {
    /// Wires up the full service graph. Payment providers register here;
    /// the configured default is applied when it is actually registered.
    pub fn new(db: Arc<DbPool>, event_sender: Arc<EventSender>, config: Arc<AppConfig>) -> Self {
        let carts = Arc::new(CartService::new(
            db.clone(),
            event_sender.clone(),
            config.clone(),
        ));
        let checkout = Arc::new(CheckoutService::new(
            db.clone(),
            event_sender.clone(),
            config.clone(),
        ));
        let orders = Arc::new(OrderService::new(
            db.clone(),
            event_sender.clone(),
            carts.clone(),
            checkout.clone(),
        ));
        let order_status = Arc::new(OrderStatusService::new(db.clone(), event_sender.clone()));

        let payments = Arc::new(PaymentOrchestrator::new(Duration::from_secs(
            config.provider_timeout_secs,
        )));
        if let Some(stripe) = StripeProvider::from_config(&config) {
            payments.register(Arc::new(stripe));
        } else {
            info!("Stripe secret key not configured; stripe provider not registered");
        }
        if payments
            .set_default_provider(&config.default_payment_provider)
            .is_err()
        {
            info!(
                provider = %config.default_payment_provider,
                "Configured default payment provider is not registered"
            );
        }

        let webhooks = Arc::new(WebhookReconciler::new(
            orders.clone(),
            order_status.clone(),
            event_sender.clone(),
        ));

        Self {
            carts,
            checkout,
            orders,
            order_status,
            payments,
            webhooks,
        }
    }
}
