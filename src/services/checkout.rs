use crate::{
    cache::TtlCache,
    config::AppConfig,
    entities::{
        cart,
        checkout_session::{self, CheckoutStep},
        Cart, CartItem, CheckoutSession, CheckoutSessionModel,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::carts::{consolidate_items, subtotal},
};
use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    ActiveModelTrait, DatabaseConnection, EntityTrait, ModelTrait, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

const SHIPPING_OPTIONS_CACHE_KEY: &str = "shipping_options";

/// Rounds to 2 decimal places, half-up. Applied to every intermediate money
/// value so cent-level drift never reaches the customer.
pub fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Postal address captured at checkout.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct Address {
    #[validate(length(min = 1))]
    pub first_name: String,
    #[validate(length(min = 1))]
    pub last_name: String,
    #[validate(length(min = 1))]
    pub line1: String,
    pub line2: Option<String>,
    #[validate(length(min = 1))]
    pub city: String,
    #[validate(length(min = 1))]
    pub state: String,
    #[validate(length(min = 1))]
    pub postal_code: String,
    #[validate(length(equal = 2))]
    pub country: String,
    pub phone: Option<String>,
}

/// A shipping option offered at checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ShippingOption {
    pub id: String,
    pub name: String,
    pub price: Decimal,
    pub estimated_days: u32,
}

/// Result of one pricing recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pricing {
    pub shipping_cost: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

/// Computes shipping cost, tax, and total from a subtotal and the chosen
/// shipping option price. Tax is rounded before entering the total.
pub fn compute_pricing(subtotal: Decimal, shipping_price: Decimal, tax_rate: Decimal) -> Pricing {
    let shipping_cost = round2(shipping_price);
    let tax = round2(tax_rate * (subtotal + shipping_cost));
    let total = subtotal + shipping_cost + tax;
    Pricing {
        shipping_cost,
        tax,
        total,
    }
}

/// Checkout session service.
///
/// Walks a cart through information → shipping → payment → review →
/// confirmation. Pricing previews and step commits are deliberately separate
/// operations: the two near-identical code paths in earlier storefronts kept
/// drifting apart, so the "does this advance the step?" question is answered
/// by which method exists, not by a flag.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
    shipping_options_cache: Arc<TtlCache<Vec<ShippingOption>>>,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        let ttl = Duration::from_secs(config.lookup_cache_ttl_secs);
        Self {
            db,
            event_sender,
            config,
            shipping_options_cache: Arc::new(TtlCache::new(ttl)),
        }
    }

    fn tax_rate(&self) -> Decimal {
        Decimal::from_f64_retain(self.config.default_tax_rate).unwrap_or(Decimal::ZERO)
    }

    /// Begins checkout for a cart, persisting a session at the
    /// `information` step with the consolidated subtotal.
    #[instrument(skip(self))]
    pub async fn begin_checkout(
        &self,
        cart_id: Uuid,
    ) -> Result<CheckoutSessionModel, ServiceError> {
        let cart = Cart::find_by_id(cart_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        if cart.status != cart::CartStatus::Active {
            return Err(ServiceError::InvalidOperation(
                "Cart is not active".to_string(),
            ));
        }

        let items = cart.find_related(CartItem).all(&*self.db).await?;
        if items.is_empty() {
            return Err(ServiceError::InvalidOperation("Cart is empty".to_string()));
        }

        let line_items = consolidate_items(&items);
        let cart_subtotal = subtotal(&line_items);
        let pricing = compute_pricing(cart_subtotal, Decimal::ZERO, self.tax_rate());

        let session_id = Uuid::new_v4();
        let session = checkout_session::ActiveModel {
            id: Set(session_id),
            cart_id: Set(cart_id),
            current_step: Set(CheckoutStep::Information),
            email: Set(None),
            shipping_address: Set(None),
            billing_address: Set(None),
            shipping_option: Set(None),
            subtotal: Set(cart_subtotal),
            shipping_cost: Set(pricing.shipping_cost),
            tax: Set(pricing.tax),
            total: Set(pricing.total),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        };

        let session = session.insert(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::CheckoutStarted {
                cart_id,
                session_id,
            })
            .await;

        info!(session_id = %session_id, cart_id = %cart_id, "Checkout started");
        Ok(session)
    }

    pub async fn get_session(
        &self,
        session_id: Uuid,
    ) -> Result<CheckoutSessionModel, ServiceError> {
        CheckoutSession::find_by_id(session_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Checkout session {} not found", session_id))
            })
    }

    /// Stores contact and address info; commits `information -> shipping`.
    /// Billing address defaults to the shipping address when omitted.
    #[instrument(skip(self, input))]
    pub async fn submit_information(
        &self,
        session_id: Uuid,
        input: InformationInput,
    ) -> Result<CheckoutSessionModel, ServiceError> {
        input.validate()?;

        let session = self.get_session(session_id).await?;
        self.reject_inert(&session)?;

        let billing = input
            .billing_address
            .clone()
            .unwrap_or_else(|| input.shipping_address.clone());

        let advance = session.current_step == CheckoutStep::Information;
        let mut active: checkout_session::ActiveModel = session.into();
        active.email = Set(Some(input.email));
        active.shipping_address = Set(Some(
            serde_json::to_value(&input.shipping_address)
                .map_err(|e| ServiceError::InternalError(e.to_string()))?,
        ));
        active.billing_address = Set(Some(
            serde_json::to_value(&billing)
                .map_err(|e| ServiceError::InternalError(e.to_string()))?,
        ));
        if advance {
            active.current_step = Set(CheckoutStep::Shipping);
        }
        active.updated_at = Set(Utc::now());
        let session = active.update(&*self.db).await?;

        if advance {
            self.event_sender
                .send_or_log(Event::CheckoutStepAdvanced {
                    session_id,
                    step: session.current_step.to_string(),
                })
                .await;
        }

        Ok(session)
    }

    /// Recomputes and persists pricing for a shipping option WITHOUT
    /// advancing the step. This is the preview path the storefront calls
    /// while the customer is still comparing options.
    #[instrument(skip(self))]
    pub async fn preview_shipping_price(
        &self,
        session_id: Uuid,
        option_id: &str,
    ) -> Result<CheckoutSessionModel, ServiceError> {
        let session = self.get_session(session_id).await?;
        self.reject_inert(&session)?;
        let option = self.find_shipping_option(option_id)?;

        self.apply_shipping_option(session, option, false).await
    }

    /// Commits the shipping method: identical pricing computation, and
    /// advances `shipping -> payment`.
    #[instrument(skip(self))]
    pub async fn commit_shipping_method(
        &self,
        session_id: Uuid,
        option_id: &str,
    ) -> Result<CheckoutSessionModel, ServiceError> {
        let session = self.get_session(session_id).await?;
        self.reject_inert(&session)?;

        if session.shipping_address.is_none() {
            return Err(ServiceError::ValidationError(
                "shipping_address must be set before committing a shipping method".to_string(),
            ));
        }

        let option = self.find_shipping_option(option_id)?;
        self.apply_shipping_option(session, option, true).await
    }

    /// Commits `payment -> review` once a payment intent exists.
    #[instrument(skip(self))]
    pub async fn advance_to_review(
        &self,
        session_id: Uuid,
    ) -> Result<CheckoutSessionModel, ServiceError> {
        let session = self.get_session(session_id).await?;
        self.reject_inert(&session)?;

        if session.current_step != CheckoutStep::Payment {
            return Err(ServiceError::InvalidOperation(format!(
                "cannot advance to review from step '{}'",
                session.current_step
            )));
        }

        let mut active: checkout_session::ActiveModel = session.into();
        active.current_step = Set(CheckoutStep::Review);
        active.updated_at = Set(Utc::now());
        let session = active.update(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::CheckoutStepAdvanced {
                session_id,
                step: session.current_step.to_string(),
            })
            .await;

        Ok(session)
    }

    /// Marks the session confirmed. Runs on the caller's connection so order
    /// creation can include it in its transaction; the session is inert
    /// afterwards.
    pub async fn mark_confirmed(
        &self,
        conn: &impl sea_orm::ConnectionTrait,
        session_id: Uuid,
    ) -> Result<(), ServiceError> {
        let session = CheckoutSession::find_by_id(session_id)
            .one(conn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Checkout session {} not found", session_id))
            })?;

        let mut active: checkout_session::ActiveModel = session.into();
        active.current_step = Set(CheckoutStep::Confirmation);
        active.updated_at = Set(Utc::now());
        active.update(conn).await?;
        Ok(())
    }

    /// The configured shipping options, via the lookup cache. `refresh`
    /// bypasses the cached value and repopulates it.
    pub fn shipping_options(&self, refresh: bool) -> Vec<ShippingOption> {
        if refresh {
            self.shipping_options_cache.invalidate(SHIPPING_OPTIONS_CACHE_KEY);
        }
        if let Some(options) = self.shipping_options_cache.get(SHIPPING_OPTIONS_CACHE_KEY) {
            return options;
        }

        let options: Vec<ShippingOption> = self
            .config
            .shipping_options
            .iter()
            .map(|o| ShippingOption {
                id: o.id.clone(),
                name: o.name.clone(),
                price: round2(Decimal::from_f64_retain(o.price).unwrap_or(Decimal::ZERO)),
                estimated_days: o.estimated_days,
            })
            .collect();

        self.shipping_options_cache
            .insert(SHIPPING_OPTIONS_CACHE_KEY, options.clone());
        options
    }

    fn find_shipping_option(&self, option_id: &str) -> Result<ShippingOption, ServiceError> {
        self.shipping_options(false)
            .into_iter()
            .find(|o| o.id == option_id)
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Shipping option '{}' not found", option_id))
            })
    }

    /// Confirmed sessions are inert; every mutation funnels through here.
    fn reject_inert(&self, session: &CheckoutSessionModel) -> Result<(), ServiceError> {
        if session.current_step == CheckoutStep::Confirmation {
            return Err(ServiceError::InvalidOperation(
                "Checkout session is already confirmed".to_string(),
            ));
        }
        Ok(())
    }

    /// Shared pricing routine for preview and commit. The ONLY difference
    /// between the two callers is `advance_step`.
    async fn apply_shipping_option(
        &self,
        session: CheckoutSessionModel,
        option: ShippingOption,
        advance_step: bool,
    ) -> Result<CheckoutSessionModel, ServiceError> {
        let session_id = session.id;
        let pricing = compute_pricing(session.subtotal, option.price, self.tax_rate());

        let current_step = session.current_step;
        let mut active: checkout_session::ActiveModel = session.into();
        active.shipping_option = Set(Some(
            serde_json::to_value(&option)
                .map_err(|e| ServiceError::InternalError(e.to_string()))?,
        ));
        active.shipping_cost = Set(pricing.shipping_cost);
        active.tax = Set(pricing.tax);
        active.total = Set(pricing.total);
        if advance_step && current_step == CheckoutStep::Shipping {
            active.current_step = Set(CheckoutStep::Payment);
        }
        active.updated_at = Set(Utc::now());

        let session = active.update(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::CheckoutPriced {
                session_id,
                total: session.total,
            })
            .await;

        if advance_step {
            self.event_sender
                .send_or_log(Event::CheckoutStepAdvanced {
                    session_id,
                    step: session.current_step.to_string(),
                })
                .await;
        }

        info!(
            session_id = %session_id,
            shipping = %pricing.shipping_cost,
            tax = %pricing.tax,
            total = %pricing.total,
            advanced = advance_step,
            "Applied shipping option"
        );
        Ok(session)
    }
}

/// Contact + address input for the information step.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct InformationInput {
    #[validate(email)]
    pub email: String,
    #[validate]
    pub shipping_address: Address,
    #[validate]
    pub billing_address: Option<Address>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    // ==================== Rounding ====================

    #[test]
    fn round2_is_half_up() {
        assert_eq!(round2(dec!(9.595)), dec!(9.60));
        assert_eq!(round2(dec!(9.594)), dec!(9.59));
        assert_eq!(round2(dec!(9.605)), dec!(9.61));
    }

    // ==================== Pricing ====================

    #[test]
    fn pricing_matches_storefront_example() {
        // subtotal 99.98, shipping 19.99, 8% tax
        let pricing = compute_pricing(dec!(99.98), dec!(19.99), dec!(0.08));

        assert_eq!(pricing.shipping_cost, dec!(19.99));
        // 0.08 * 119.97 = 9.5976 -> 9.60
        assert_eq!(pricing.tax, dec!(9.60));
        assert_eq!(pricing.total, dec!(129.57));
    }

    #[test]
    fn total_invariant_holds_after_recomputation() {
        let cases = [
            (dec!(0.01), dec!(9.99)),
            (dec!(75.00), dec!(0.00)),
            (dec!(123.45), dec!(29.99)),
            (dec!(9999.99), dec!(19.99)),
        ];

        for (subtotal, shipping) in cases {
            let pricing = compute_pricing(subtotal, shipping, dec!(0.08));
            assert_eq!(
                pricing.total,
                subtotal + pricing.shipping_cost + pricing.tax,
                "invariant failed for subtotal {} shipping {}",
                subtotal,
                shipping
            );
            // tax was rounded before entering the total, so the total is
            // exactly representable at 2dp
            assert_eq!(pricing.total, round2(pricing.total));
        }
    }

    #[test]
    fn zero_tax_rate_means_total_is_subtotal_plus_shipping() {
        let pricing = compute_pricing(dec!(50.00), dec!(10.00), Decimal::ZERO);
        assert_eq!(pricing.tax, Decimal::ZERO);
        assert_eq!(pricing.total, dec!(60.00));
    }

    #[test]
    fn tax_applies_to_shipping_as_well() {
        let with_shipping = compute_pricing(dec!(100.00), dec!(10.00), dec!(0.08));
        let without_shipping = compute_pricing(dec!(100.00), Decimal::ZERO, dec!(0.08));
        assert_eq!(with_shipping.tax, dec!(8.80));
        assert_eq!(without_shipping.tax, dec!(8.00));
    }

    // ==================== Step progression ====================

    #[test]
    fn checkout_steps_advance_in_order() {
        assert_eq!(CheckoutStep::Information.next(), Some(CheckoutStep::Shipping));
        assert_eq!(CheckoutStep::Shipping.next(), Some(CheckoutStep::Payment));
        assert_eq!(CheckoutStep::Payment.next(), Some(CheckoutStep::Review));
        assert_eq!(CheckoutStep::Review.next(), Some(CheckoutStep::Confirmation));
        assert_eq!(CheckoutStep::Confirmation.next(), None);
    }

    // ==================== Input validation ====================

    fn valid_address() -> Address {
        Address {
            first_name: "Astrid".into(),
            last_name: "Berg".into(),
            line1: "12 Fjord Lane".into(),
            line2: None,
            city: "Portland".into(),
            state: "OR".into(),
            postal_code: "97201".into(),
            country: "US".into(),
            phone: None,
        }
    }

    #[test]
    fn information_input_requires_valid_email() {
        let input = InformationInput {
            email: "not-an-email".into(),
            shipping_address: valid_address(),
            billing_address: None,
        };
        assert!(input.validate().is_err());
    }

    #[test]
    fn information_input_validates_nested_address() {
        let mut address = valid_address();
        address.country = "USA".into(); // must be 2 chars
        let input = InformationInput {
            email: "astrid@example.com".into(),
            shipping_address: address,
            billing_address: None,
        };
        assert!(input.validate().is_err());
    }
}
