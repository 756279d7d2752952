use crate::{
    entities::{
        checkout_session,
        order::{self, OrderStatus, PaymentStatus},
        order_item, order_status_history, Cart, CartItem, CheckoutSession, Order, OrderItem,
        OrderModel, OrderStatusHistory,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        carts::{consolidate_items, CartService},
        checkout::CheckoutService,
        order_status::append_history,
        payments::OrderReference,
    },
};
use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

const ORDER_NUMBER_PREFIX: &str = "NO";
const ORDER_NUMBER_MAX_ATTEMPTS: usize = 5;

/// Who is asking for an order. Guest orders (no user id) are retrievable by
/// anyone presenting the right order number or email; owned orders only by
/// their owner or an admin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requester {
    Anonymous,
    User(Uuid),
    Admin,
}

/// Access rule shared by every order lookup path.
pub fn can_view(order_user_id: Option<Uuid>, requester: Requester) -> bool {
    match (order_user_id, requester) {
        (_, Requester::Admin) => true,
        (None, _) => true,
        (Some(owner), Requester::User(user)) => owner == user,
        (Some(_), Requester::Anonymous) => false,
    }
}

/// Input for submitting an order from a checkout session.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateOrderInput {
    pub session_id: Uuid,
    #[validate(length(min = 1))]
    pub payment_intent_id: String,
    #[validate(length(min = 1))]
    pub payment_method_id: String,
    #[validate(length(min = 1))]
    pub provider: String,
}

/// An order with its line items and audit history.
#[derive(Debug)]
pub struct OrderDetails {
    pub order: OrderModel,
    pub items: Vec<order_item::Model>,
    pub history: Vec<order_status_history::Model>,
}

/// Order creation and lookup.
///
/// Creation converts a checkout session plus payment references into an
/// order, its item snapshots, and the initial history entry as one
/// transaction; nothing is left behind if any part fails.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    cart_service: Arc<CartService>,
    checkout_service: Arc<CheckoutService>,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        cart_service: Arc<CartService>,
        checkout_service: Arc<CheckoutService>,
    ) -> Self {
        Self {
            db,
            event_sender,
            cart_service,
            checkout_service,
        }
    }

    /// Creates an order from a checkout session.
    ///
    /// Validation happens before any write: the session must exist, must not
    /// already be confirmed, and must carry an email and shipping address;
    /// the cart must still have items. The order row, item snapshots,
    /// initial history entry, cart completion, and session confirmation all
    /// commit atomically.
    #[instrument(skip(self, input), fields(session_id = %input.session_id))]
    pub async fn create_from_session(
        &self,
        input: CreateOrderInput,
    ) -> Result<OrderDetails, ServiceError> {
        input.validate()?;

        let session = CheckoutSession::find_by_id(input.session_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Checkout session {} not found", input.session_id))
            })?;

        if session.current_step == checkout_session::CheckoutStep::Confirmation {
            return Err(ServiceError::InvalidOperation(
                "An order was already created from this checkout session".to_string(),
            ));
        }

        let shipping_address = session.shipping_address.clone().ok_or_else(|| {
            ServiceError::ValidationError(
                "shipping_address is required before an order can be created".to_string(),
            )
        })?;

        let email = session.email.clone().ok_or_else(|| {
            ServiceError::ValidationError(
                "email is required before an order can be created".to_string(),
            )
        })?;

        let cart = Cart::find_by_id(session.cart_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Cart {} not found", session.cart_id))
            })?;

        let raw_items = cart.find_related(CartItem).all(&*self.db).await?;
        let line_items = consolidate_items(&raw_items);
        if line_items.is_empty() {
            return Err(ServiceError::InvalidOperation(
                "Cannot create an order from an empty cart".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        let order_id = Uuid::new_v4();
        let order_number = self.generate_unique_order_number(&txn).await?;
        let now = Utc::now();

        let order_model = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number.clone()),
            user_id: Set(cart.user_id),
            email: Set(email),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PaymentStatus::Pending),
            payment_provider: Set(Some(input.provider.clone())),
            payment_intent_id: Set(Some(input.payment_intent_id.clone())),
            payment_method_id: Set(Some(input.payment_method_id.clone())),
            shipping_address: Set(shipping_address),
            billing_address: Set(session.billing_address.clone()),
            currency: Set(cart.currency.clone()),
            subtotal: Set(session.subtotal),
            shipping_cost: Set(session.shipping_cost),
            tax: Set(session.tax),
            total: Set(session.total),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let order_row = order_model.insert(&txn).await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Order creation failed while inserting the order row");
            ServiceError::DatabaseError(e)
        })?;

        let mut items = Vec::with_capacity(line_items.len());
        for line in &line_items {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.product_id),
                variant_id: Set(line.variant_id),
                sku: Set(line.sku.clone()),
                name: Set(line.name.clone()),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_price),
                total_price: Set(line.line_total()),
                created_at: Set(now),
            };
            let inserted = item.insert(&txn).await.map_err(|e| {
                error!(error = %e, order_id = %order_id, sku = %line.sku, "Order creation failed while snapshotting items");
                ServiceError::DatabaseError(e)
            })?;
            items.push(inserted);
        }

        append_history(
            &txn,
            order_id,
            order_status_history::StatusKind::Order,
            OrderStatus::Pending.to_string(),
            Some("Order created".to_string()),
        )
        .await
        .map_err(|e| {
            error!(order_id = %order_id, "Order creation failed while writing the initial history entry");
            e
        })?;

        self.cart_service
            .mark_completed(&txn, cart.id)
            .await
            .map_err(|e| {
                error!(order_id = %order_id, cart_id = %cart.id, "Order creation failed while completing the cart");
                e
            })?;

        self.checkout_service
            .mark_confirmed(&txn, session.id)
            .await
            .map_err(|e| {
                error!(order_id = %order_id, session_id = %session.id, "Order creation failed while confirming the session");
                e
            })?;

        txn.commit().await?;

        info!(
            order_id = %order_id,
            order_number = %order_number,
            cart_id = %cart.id,
            "Order created"
        );

        self.event_sender.send_or_log(Event::OrderCreated(order_id)).await;
        self.event_sender.send_or_log(Event::CartCompleted(cart.id)).await;

        self.get_order_details(order_row.id).await
    }

    /// Retrieves an order by id, without access checks (internal/admin use).
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderModel, ServiceError> {
        Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    /// Retrieves an order with items and history, without access checks.
    pub async fn get_order_details(&self, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let order = self.get_order(order_id).await?;

        let items = order.find_related(OrderItem).all(&*self.db).await?;
        let history = order
            .find_related(OrderStatusHistory)
            .order_by_asc(order_status_history::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        Ok(OrderDetails {
            order,
            items,
            history,
        })
    }

    /// Looks up an order by its human-readable order number, enforcing the
    /// ownership rule. Lookups of someone else's order return Forbidden; a
    /// missing number returns a plain NotFound so number validity is not
    /// leaked.
    #[instrument(skip(self))]
    pub async fn find_by_order_number(
        &self,
        order_number: &str,
        requester: Requester,
    ) -> Result<OrderDetails, ServiceError> {
        let order = Order::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order {} not found", order_number))
            })?;

        if !can_view(order.user_id, requester) {
            warn!(order_number = %order_number, "Rejected order lookup by non-owner");
            return Err(ServiceError::Forbidden(
                "You do not have access to this order".to_string(),
            ));
        }

        self.get_order_details(order.id).await
    }

    /// Guest order tracking by email. Returns guest orders matching the
    /// email plus, for an authenticated requester, their own orders.
    #[instrument(skip(self))]
    pub async fn find_by_email(
        &self,
        email: &str,
        requester: Requester,
    ) -> Result<Vec<OrderModel>, ServiceError> {
        let orders = Order::find()
            .filter(order::Column::Email.eq(email))
            .order_by_desc(order::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        Ok(orders
            .into_iter()
            .filter(|order| can_view(order.user_id, requester))
            .collect())
    }

    /// Resolves a webhook order reference to an order, when it matches.
    pub async fn find_by_reference(
        &self,
        reference: &OrderReference,
    ) -> Result<Option<OrderModel>, ServiceError> {
        let order = match reference {
            OrderReference::Id(id) => Order::find_by_id(*id).one(&*self.db).await?,
            OrderReference::Number(number) => {
                Order::find()
                    .filter(order::Column::OrderNumber.eq(number.clone()))
                    .one(&*self.db)
                    .await?
            }
        };
        Ok(order)
    }

    /// Lists orders, newest first (admin).
    pub async fn list_orders(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<OrderModel>, u64), ServiceError> {
        let paginator = Order::find()
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page);

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok((orders, total))
    }

    /// Generates a `NO-YYYYMMDD-XXXX` order number, retrying on the
    /// (unlikely) suffix collision. The unique constraint on
    /// `orders.order_number` backstops the check.
    async fn generate_unique_order_number(
        &self,
        conn: &impl sea_orm::ConnectionTrait,
    ) -> Result<String, ServiceError> {
        for _ in 0..ORDER_NUMBER_MAX_ATTEMPTS {
            let candidate = generate_order_number();
            let taken = Order::find()
                .filter(order::Column::OrderNumber.eq(candidate.clone()))
                .one(conn)
                .await?
                .is_some();
            if !taken {
                return Ok(candidate);
            }
            warn!(order_number = %candidate, "Order number collision; regenerating");
        }
        Err(ServiceError::InternalError(
            "could not generate a unique order number".to_string(),
        ))
    }
}

/// One `NO-YYYYMMDD-XXXX` candidate: date-based prefix plus a random
/// uppercase alphanumeric suffix.
pub fn generate_order_number() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        .take(4)
        .collect();

    format!(
        "{}-{}-{}",
        ORDER_NUMBER_PREFIX,
        Utc::now().format("%Y%m%d"),
        suffix
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Order number ====================

    #[test]
    fn order_number_has_expected_shape() {
        let number = generate_order_number();
        let parts: Vec<&str> = number.split('-').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "NO");
        assert_eq!(parts[1].len(), 8);
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2].len(), 4);
        assert!(parts[2]
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn order_numbers_vary() {
        let numbers: std::collections::HashSet<String> =
            (0..32).map(|_| generate_order_number()).collect();
        // 36^4 suffixes; 32 draws colliding entirely would mean a broken RNG
        assert!(numbers.len() > 1);
    }

    // ==================== Access rule ====================

    #[test]
    fn guest_orders_are_visible_to_anyone() {
        assert!(can_view(None, Requester::Anonymous));
        assert!(can_view(None, Requester::User(Uuid::new_v4())));
        assert!(can_view(None, Requester::Admin));
    }

    #[test]
    fn owned_orders_are_visible_only_to_owner_and_admin() {
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();

        assert!(can_view(Some(owner), Requester::User(owner)));
        assert!(can_view(Some(owner), Requester::Admin));
        assert!(!can_view(Some(owner), Requester::User(stranger)));
        assert!(!can_view(Some(owner), Requester::Anonymous));
    }

    // ==================== Input validation ====================

    #[test]
    fn create_order_input_requires_payment_references() {
        let input = CreateOrderInput {
            session_id: Uuid::new_v4(),
            payment_intent_id: "".into(),
            payment_method_id: "pm_1".into(),
            provider: "stripe".into(),
        };
        assert!(input.validate().is_err());
    }
}
