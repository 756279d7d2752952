use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Northdoor Checkout API",
        version = "0.1.0",
        description = r#"
Checkout, order, and payment reconciliation service for the Northdoor
door-hardware storefront.

Covers cart management with anonymous cookie identity, multi-step checkout
sessions, payment-provider orchestration, order creation, status machines
for order and payment state, and webhook reconciliation.

## Authentication

Customer endpoints work anonymously (cookie-based cart identity) or with a
storefront JWT in the Authorization header. Admin endpoints require a token
carrying the `admin` role:

```
Authorization: Bearer <jwt>
```
        "#,
        contact(
            name = "Northdoor Engineering",
            email = "eng@northdoor.example"
        ),
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    paths(
        crate::handlers::checkout::begin_checkout,
        crate::handlers::checkout::shipping_options,
        crate::handlers::checkout::get_session,
        crate::handlers::checkout::submit_information,
        crate::handlers::checkout::preview_shipping_price,
        crate::handlers::checkout::commit_shipping_method,
        crate::handlers::checkout::advance_to_review,
        crate::handlers::payments::client_config,
        crate::handlers::payments::create_intent,
        crate::handlers::payments::confirm_payment,
        crate::handlers::payments::verify_payment,
        crate::handlers::payments::cancel_payment,
        crate::handlers::payments::refund_payment,
        crate::handlers::payment_webhooks::payment_webhook,
        crate::handlers::orders::submit_order,
        crate::handlers::orders::list_orders,
        crate::handlers::orders::lookup_by_email,
        crate::handlers::orders::get_by_order_number,
        crate::handlers::orders::get_order,
        crate::handlers::orders::update_order_status,
        crate::handlers::orders::update_payment_status,
        crate::handlers::carts::create_cart,
        crate::handlers::carts::get_current_cart,
        crate::handlers::carts::add_item,
        crate::handlers::carts::update_item,
        crate::handlers::carts::remove_item,
        crate::handlers::carts::merge_carts,
        crate::handlers::health::health,
    ),
    tags(
        (name = "Carts", description = "Cart management"),
        (name = "Checkout", description = "Multi-step checkout sessions"),
        (name = "Payments", description = "Payment orchestration and webhooks"),
        (name = "Orders", description = "Order creation, lookup, and status"),
        (name = "Health", description = "Service health")
    )
)]
pub struct ApiDoc;

/// Swagger UI router serving the generated document.
pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi())
}
