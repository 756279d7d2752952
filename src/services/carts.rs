use crate::{
    auth::CartIdentity,
    config::AppConfig,
    entities::{cart, cart_item, Cart, CartItem, CartModel},
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

fn validate_positive_decimal(value: &Decimal) -> Result<(), ValidationError> {
    if *value > Decimal::ZERO {
        Ok(())
    } else {
        let mut err = ValidationError::new("range");
        err.message = Some("Amount must be greater than 0".into());
        Err(err)
    }
}

/// Shopping cart service.
///
/// Owns cart lifecycle (one active cart per resolved identity), line-item
/// mutation, duplicate consolidation, and the anonymous-to-user merge
/// performed at login.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

impl CartService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            event_sender,
            config,
        }
    }

    /// Returns the identity's active cart, creating one on first touch.
    #[instrument(skip(self))]
    pub async fn get_or_create_cart(
        &self,
        identity: &CartIdentity,
    ) -> Result<CartModel, ServiceError> {
        if let Some(existing) = self.find_active_cart(identity).await? {
            return Ok(existing);
        }

        let cart_id = Uuid::new_v4();
        let (user_id, anonymous_id) = match identity {
            CartIdentity::User(id) => (Some(*id), None),
            CartIdentity::Anonymous { id, .. } => (None, Some(id.clone())),
        };

        let cart = cart::ActiveModel {
            id: Set(cart_id),
            user_id: Set(user_id),
            anonymous_id: Set(anonymous_id),
            currency: Set(self.config.currency.clone()),
            status: Set(cart::CartStatus::Active),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        };

        let cart = cart.insert(&*self.db).await?;
        self.event_sender.send_or_log(Event::CartCreated(cart_id)).await;

        info!(cart_id = %cart_id, "Created cart");
        Ok(cart)
    }

    /// Finds the active cart for an identity without creating one.
    pub async fn find_active_cart(
        &self,
        identity: &CartIdentity,
    ) -> Result<Option<CartModel>, ServiceError> {
        let query = Cart::find().filter(cart::Column::Status.eq(cart::CartStatus::Active));
        let query = match identity {
            CartIdentity::User(id) => query.filter(cart::Column::UserId.eq(Some(*id))),
            CartIdentity::Anonymous { id, .. } => query
                .filter(cart::Column::UserId.is_null())
                .filter(cart::Column::AnonymousId.eq(Some(id.clone()))),
        };
        Ok(query.one(&*self.db).await?)
    }

    /// Adds an item to the cart, merging into an existing line when the same
    /// (product, variant) pair is already present.
    #[instrument(skip(self, input), fields(cart_id = %cart_id, product_id = %input.product_id))]
    pub async fn add_item(
        &self,
        cart_id: Uuid,
        input: AddItemInput,
    ) -> Result<CartWithItems, ServiceError> {
        input.validate()?;

        let txn = self.db.begin().await?;

        let cart = Cart::find_by_id(cart_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        if cart.status != cart::CartStatus::Active {
            return Err(ServiceError::InvalidOperation(
                "Cart is not active".to_string(),
            ));
        }

        let existing_item = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .filter(cart_item::Column::ProductId.eq(input.product_id))
            .filter(match input.variant_id {
                Some(variant_id) => cart_item::Column::VariantId.eq(Some(variant_id)),
                None => cart_item::Column::VariantId.is_null(),
            })
            .one(&txn)
            .await?;

        if let Some(item) = existing_item {
            // Merge: sum quantities, keep the first-seen price snapshot.
            let merged_quantity = item.quantity + input.quantity;
            let mut item: cart_item::ActiveModel = item.into();
            item.quantity = Set(merged_quantity);
            item.updated_at = Set(Utc::now());
            item.update(&txn).await?;
        } else {
            let item = cart_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart_id),
                product_id: Set(input.product_id),
                variant_id: Set(input.variant_id),
                name: Set(input.name.clone()),
                sku: Set(input.sku.clone()),
                quantity: Set(input.quantity),
                unit_price: Set(input.unit_price),
                created_at: Set(Utc::now()),
                updated_at: Set(Utc::now()),
            };
            item.insert(&txn).await?;
        }

        let mut cart_update: cart::ActiveModel = cart.into();
        cart_update.updated_at = Set(Utc::now());
        let cart = cart_update.update(&txn).await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemAdded {
                cart_id,
                product_id: input.product_id,
            })
            .await;

        self.get_cart(cart.id).await
    }

    /// Updates a line's quantity; zero or negative removes the line.
    #[instrument(skip(self))]
    pub async fn update_item_quantity(
        &self,
        cart_id: Uuid,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<CartWithItems, ServiceError> {
        let txn = self.db.begin().await?;

        let item = CartItem::find_by_id(item_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart item {} not found", item_id)))?;

        if item.cart_id != cart_id {
            return Err(ServiceError::InvalidOperation(
                "Item does not belong to this cart".to_string(),
            ));
        }

        if quantity <= 0 {
            item.delete(&txn).await?;
        } else {
            let mut item: cart_item::ActiveModel = item.into();
            item.quantity = Set(quantity);
            item.updated_at = Set(Utc::now());
            item.update(&txn).await?;
        }

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemUpdated { cart_id, item_id })
            .await;

        self.get_cart(cart_id).await
    }

    /// Removes a line from the cart.
    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        cart_id: Uuid,
        item_id: Uuid,
    ) -> Result<CartWithItems, ServiceError> {
        let item = CartItem::find_by_id(item_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart item {} not found", item_id)))?;

        if item.cart_id != cart_id {
            return Err(ServiceError::InvalidOperation(
                "Item does not belong to this cart".to_string(),
            ));
        }

        item.delete(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::CartItemRemoved { cart_id, item_id })
            .await;

        self.get_cart(cart_id).await
    }

    /// Retrieves a cart with all its raw line items.
    pub async fn get_cart(&self, cart_id: Uuid) -> Result<CartWithItems, ServiceError> {
        let cart = Cart::find_by_id(cart_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        let items = cart.find_related(CartItem).all(&*self.db).await?;

        Ok(CartWithItems { cart, items })
    }

    /// Merges an anonymous cart into the user's active cart at login.
    ///
    /// Merge policy: quantities are summed on (product, variant) conflicts
    /// and the user cart's price snapshot wins; the anonymous cart is then
    /// abandoned. Returns the user's cart, or the untouched user cart when
    /// there is nothing to merge.
    #[instrument(skip(self))]
    pub async fn merge_anonymous_cart(
        &self,
        user_id: Uuid,
        anonymous_id: &str,
    ) -> Result<CartWithItems, ServiceError> {
        let user_identity = CartIdentity::User(user_id);
        let user_cart = self.get_or_create_cart(&user_identity).await?;

        let anonymous_cart = Cart::find()
            .filter(cart::Column::Status.eq(cart::CartStatus::Active))
            .filter(cart::Column::UserId.is_null())
            .filter(cart::Column::AnonymousId.eq(Some(anonymous_id.to_string())))
            .one(&*self.db)
            .await?;

        let Some(anonymous_cart) = anonymous_cart else {
            return self.get_cart(user_cart.id).await;
        };

        let txn = self.db.begin().await?;

        let anon_items = anonymous_cart.find_related(CartItem).all(&txn).await?;
        let user_items = Cart::find_by_id(user_cart.id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", user_cart.id)))?
            .find_related(CartItem)
            .all(&txn)
            .await?;

        for anon_item in anon_items {
            let existing = user_items.iter().find(|item| {
                item.product_id == anon_item.product_id && item.variant_id == anon_item.variant_id
            });

            if let Some(existing) = existing {
                let merged_quantity = existing.quantity + anon_item.quantity;
                let mut update: cart_item::ActiveModel = existing.clone().into();
                update.quantity = Set(merged_quantity);
                update.updated_at = Set(Utc::now());
                update.update(&txn).await?;
                anon_item.delete(&txn).await?;
            } else {
                let mut moved: cart_item::ActiveModel = anon_item.into();
                moved.cart_id = Set(user_cart.id);
                moved.updated_at = Set(Utc::now());
                moved.update(&txn).await?;
            }
        }

        let mut abandoned: cart::ActiveModel = anonymous_cart.clone().into();
        abandoned.status = Set(cart::CartStatus::Abandoned);
        abandoned.updated_at = Set(Utc::now());
        abandoned.update(&txn).await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartsMerged {
                user_cart_id: user_cart.id,
                anonymous_cart_id: anonymous_cart.id,
            })
            .await;

        info!(
            user_cart_id = %user_cart.id,
            anonymous_cart_id = %anonymous_cart.id,
            "Merged anonymous cart into user cart"
        );
        self.get_cart(user_cart.id).await
    }

    /// Marks a cart completed. Runs on the caller's connection so order
    /// creation can include it in its transaction.
    pub async fn mark_completed(
        &self,
        conn: &impl sea_orm::ConnectionTrait,
        cart_id: Uuid,
    ) -> Result<(), ServiceError> {
        let cart = Cart::find_by_id(cart_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        let mut active: cart::ActiveModel = cart.into();
        active.status = Set(cart::CartStatus::Completed);
        active.updated_at = Set(Utc::now());
        active.update(conn).await?;
        Ok(())
    }
}

/// Input for adding an item to a cart. The catalog lives outside this
/// service, so the storefront passes the product snapshot along.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct AddItemInput {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(length(min = 1))]
    pub sku: String,
    #[validate(range(min = 1))]
    pub quantity: i32,
    #[validate(custom = "validate_positive_decimal")]
    pub unit_price: Decimal,
}

/// Cart with its raw (unconsolidated) line items.
#[derive(Debug, Serialize)]
pub struct CartWithItems {
    pub cart: CartModel,
    pub items: Vec<cart_item::Model>,
}

impl CartWithItems {
    /// Consolidated view used by both display and pricing.
    pub fn summary(&self) -> CartSummary {
        let line_items = consolidate_items(&self.items);
        let subtotal = subtotal(&line_items);
        CartSummary {
            cart_id: self.cart.id,
            line_items,
            subtotal,
        }
    }
}

/// A consolidated cart line: one row per (product, variant).
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LineItem {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub name: String,
    pub sku: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

impl LineItem {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// Consolidated cart summary.
#[derive(Debug, Serialize, ToSchema)]
pub struct CartSummary {
    pub cart_id: Uuid,
    pub line_items: Vec<LineItem>,
    pub subtotal: Decimal,
}

/// Merges line items sharing (product_id, variant_id) by summing quantities,
/// keeping the first-seen row's other fields. Duplicate rows are a
/// consistency bug to normalize, not a valid steady state; every display and
/// pricing path must go through this one function.
pub fn consolidate_items(items: &[cart_item::Model]) -> Vec<LineItem> {
    let mut consolidated: Vec<LineItem> = Vec::with_capacity(items.len());

    for item in items {
        if let Some(existing) = consolidated
            .iter_mut()
            .find(|line| line.product_id == item.product_id && line.variant_id == item.variant_id)
        {
            existing.quantity += item.quantity;
        } else {
            consolidated.push(LineItem {
                product_id: item.product_id,
                variant_id: item.variant_id,
                name: item.name.clone(),
                sku: item.sku.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
            });
        }
    }

    consolidated
}

/// Subtotal over consolidated line items.
pub fn subtotal(items: &[LineItem]) -> Decimal {
    items.iter().map(LineItem::line_total).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn item(
        product: Uuid,
        variant: Option<Uuid>,
        quantity: i32,
        unit_price: Decimal,
    ) -> cart_item::Model {
        cart_item::Model {
            id: Uuid::new_v4(),
            cart_id: Uuid::new_v4(),
            product_id: product,
            variant_id: variant,
            name: "Solid Brass Lever Handle".to_string(),
            sku: "SBL-100".to_string(),
            quantity,
            unit_price,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    // ==================== Consolidation ====================

    #[test]
    fn duplicate_rows_merge_into_one_line() {
        let product = Uuid::new_v4();
        let items = vec![
            item(product, None, 1, dec!(25.00)),
            item(product, None, 2, dec!(25.00)),
        ];

        let consolidated = consolidate_items(&items);
        assert_eq!(consolidated.len(), 1);
        assert_eq!(consolidated[0].quantity, 3);
        assert_eq!(subtotal(&consolidated), dec!(75.00));
    }

    #[test]
    fn first_seen_price_wins_on_merge() {
        let product = Uuid::new_v4();
        let items = vec![
            item(product, None, 1, dec!(25.00)),
            item(product, None, 1, dec!(30.00)),
        ];

        let consolidated = consolidate_items(&items);
        assert_eq!(consolidated.len(), 1);
        assert_eq!(consolidated[0].unit_price, dec!(25.00));
    }

    #[test]
    fn different_variants_stay_separate() {
        let product = Uuid::new_v4();
        let variant = Uuid::new_v4();
        let items = vec![
            item(product, None, 1, dec!(25.00)),
            item(product, Some(variant), 1, dec!(25.00)),
        ];

        assert_eq!(consolidate_items(&items).len(), 2);
    }

    #[test]
    fn consolidation_preserves_first_seen_order() {
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let items = vec![
            item(first, None, 1, dec!(10.00)),
            item(second, None, 1, dec!(20.00)),
            item(first, None, 4, dec!(10.00)),
        ];

        let consolidated = consolidate_items(&items);
        assert_eq!(consolidated.len(), 2);
        assert_eq!(consolidated[0].product_id, first);
        assert_eq!(consolidated[0].quantity, 5);
        assert_eq!(consolidated[1].product_id, second);
    }

    #[test]
    fn empty_cart_consolidates_to_empty() {
        let consolidated = consolidate_items(&[]);
        assert!(consolidated.is_empty());
        assert_eq!(subtotal(&consolidated), Decimal::ZERO);
    }

    // ==================== Display/pricing agreement ====================

    #[test]
    fn summed_line_totals_equal_subtotal_even_with_duplicates() {
        let product_a = Uuid::new_v4();
        let product_b = Uuid::new_v4();
        let items = vec![
            item(product_a, None, 2, dec!(19.99)),
            item(product_b, None, 1, dec!(45.50)),
            item(product_a, None, 3, dec!(19.99)),
        ];

        let consolidated = consolidate_items(&items);
        let display_total: Decimal = consolidated.iter().map(LineItem::line_total).sum();
        assert_eq!(display_total, subtotal(&consolidated));
        assert_eq!(display_total, dec!(145.45));
    }

    // ==================== Input validation ====================

    #[test]
    fn add_item_input_rejects_zero_quantity() {
        let input = AddItemInput {
            product_id: Uuid::new_v4(),
            variant_id: None,
            name: "Hinge".into(),
            sku: "HNG-1".into(),
            quantity: 0,
            unit_price: dec!(4.99),
        };
        assert!(input.validate().is_err());
    }

    #[test]
    fn add_item_input_rejects_non_positive_price() {
        let input = AddItemInput {
            product_id: Uuid::new_v4(),
            variant_id: None,
            name: "Hinge".into(),
            sku: "HNG-1".into(),
            quantity: 1,
            unit_price: Decimal::ZERO,
        };
        assert!(input.validate().is_err());
    }
}
