use crate::{
    auth::{AdminUser, MaybeUser},
    entities::{
        order::{OrderStatus, PaymentStatus},
        order_item, order_status_history, OrderModel,
    },
    errors::ApiError,
    handlers::common::{
        created_response, map_service_error, success_response, validate_input, PaginationParams,
    },
    services::orders::{CreateOrderInput, OrderDetails, Requester},
    AppState,
};
use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Creates the router for order endpoints
pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(submit_order))
        .route("/", get(list_orders))
        .route("/lookup", get(lookup_by_email))
        .route("/number/:order_number", get(get_by_order_number))
        .route("/:order_id", get(get_order))
        .route("/:order_id/status", put(update_order_status))
        .route("/:order_id/payment-status", put(update_payment_status))
}

fn requester_from(user: &MaybeUser) -> Requester {
    match &user.0 {
        Some(user) if user.is_admin() => Requester::Admin,
        Some(user) => Requester::User(user.id),
        None => Requester::Anonymous,
    }
}

/// Submit an order from a checkout session
#[utoipa::path(
    post,
    path = "/api/v1/orders",
    request_body = CreateOrderInput,
    responses(
        (status = 201, description = "Order created", body = OrderDetailsResponse),
        (status = 400, description = "Session not ready", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown session", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn submit_order(
    State(state): State<AppState>,
    Json(payload): Json<CreateOrderInput>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let details = state
        .services
        .orders
        .create_from_session(payload)
        .await
        .map_err(map_service_error)?;

    Ok(created_response(OrderDetailsResponse::from(details)))
}

/// List orders, newest first (admin)
#[utoipa::path(
    get,
    path = "/api/v1/orders",
    params(PaginationParams),
    responses((status = 200, description = "Orders page", body = OrderListResponse)),
    tag = "Orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(pagination): Query<PaginationParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (orders, total) = state
        .services
        .orders
        .list_orders(pagination.page, pagination.per_page)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(OrderListResponse {
        orders: orders.into_iter().map(OrderResponse::from).collect(),
        total,
        page: pagination.page,
        per_page: pagination.per_page,
    }))
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct EmailLookupQuery {
    pub email: String,
}

/// Guest order tracking by email
#[utoipa::path(
    get,
    path = "/api/v1/orders/lookup",
    params(EmailLookupQuery),
    responses((status = 200, description = "Matching orders", body = [OrderResponse])),
    tag = "Orders"
)]
pub async fn lookup_by_email(
    State(state): State<AppState>,
    user: MaybeUser,
    Query(query): Query<EmailLookupQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let orders = state
        .services
        .orders
        .find_by_email(&query.email, requester_from(&user))
        .await
        .map_err(map_service_error)?;

    Ok(success_response(
        orders
            .into_iter()
            .map(OrderResponse::from)
            .collect::<Vec<_>>(),
    ))
}

/// Look up an order by its order number
#[utoipa::path(
    get,
    path = "/api/v1/orders/number/{order_number}",
    responses(
        (status = 200, description = "Order", body = OrderDetailsResponse),
        (status = 403, description = "Order belongs to another user", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown order number", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn get_by_order_number(
    State(state): State<AppState>,
    user: MaybeUser,
    Path(order_number): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let details = state
        .services
        .orders
        .find_by_order_number(&order_number, requester_from(&user))
        .await
        .map_err(map_service_error)?;

    Ok(success_response(OrderDetailsResponse::from(details)))
}

/// Get an order by id (admin)
#[utoipa::path(
    get,
    path = "/api/v1/orders/{order_id}",
    responses((status = 200, description = "Order", body = OrderDetailsResponse)),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let details = state
        .services
        .orders
        .get_order_details(order_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(OrderDetailsResponse::from(details)))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateOrderStatusRequest {
    pub status: OrderStatus,
    pub notes: Option<String>,
}

/// Update an order's fulfillment status (admin)
#[utoipa::path(
    put,
    path = "/api/v1/orders/{order_id}/status",
    request_body = UpdateOrderStatusRequest,
    responses(
        (status = 200, description = "Updated order", body = OrderResponse),
        (status = 409, description = "Illegal transition", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<UpdateOrderStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let update = state
        .services
        .order_status
        .update_order_status(order_id, payload.status, payload.notes)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(OrderResponse::from(update.order)))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdatePaymentStatusRequest {
    pub status: PaymentStatus,
    pub notes: Option<String>,
}

/// Update an order's payment status (admin)
#[utoipa::path(
    put,
    path = "/api/v1/orders/{order_id}/payment-status",
    request_body = UpdatePaymentStatusRequest,
    responses(
        (status = 200, description = "Updated order", body = OrderResponse),
        (status = 409, description = "Illegal transition", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn update_payment_status(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<UpdatePaymentStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let update = state
        .services
        .order_status
        .update_payment_status(order_id, payload.status, payload.notes)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(OrderResponse::from(update.order)))
}

// Response DTOs

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_number: String,
    pub email: String,
    pub status: String,
    pub payment_status: String,
    pub currency: String,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub created_at: DateTime<Utc>,
}

impl From<OrderModel> for OrderResponse {
    fn from(order: OrderModel) -> Self {
        Self {
            id: order.id,
            order_number: order.order_number,
            email: order.email,
            status: order.status.to_string(),
            payment_status: order.payment_status.to_string(),
            currency: order.currency,
            subtotal: order.subtotal,
            shipping_cost: order.shipping_cost,
            tax: order.tax,
            total: order.total,
            created_at: order.created_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderItemResponse {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub sku: String,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_price: Decimal,
}

impl From<order_item::Model> for OrderItemResponse {
    fn from(item: order_item::Model) -> Self {
        Self {
            product_id: item.product_id,
            variant_id: item.variant_id,
            sku: item.sku,
            name: item.name,
            quantity: item.quantity,
            unit_price: item.unit_price,
            total_price: item.total_price,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StatusHistoryResponse {
    pub kind: String,
    pub status: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<order_status_history::Model> for StatusHistoryResponse {
    fn from(entry: order_status_history::Model) -> Self {
        Self {
            kind: format!("{:?}", entry.kind).to_lowercase(),
            status: entry.status,
            notes: entry.notes,
            created_at: entry.created_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderDetailsResponse {
    #[serde(flatten)]
    pub order: OrderResponse,
    pub shipping_address: serde_json::Value,
    pub billing_address: Option<serde_json::Value>,
    pub items: Vec<OrderItemResponse>,
    pub history: Vec<StatusHistoryResponse>,
}

impl From<OrderDetails> for OrderDetailsResponse {
    fn from(details: OrderDetails) -> Self {
        let shipping_address = details.order.shipping_address.clone();
        let billing_address = details.order.billing_address.clone();
        Self {
            order: OrderResponse::from(details.order),
            shipping_address,
            billing_address,
            items: details.items.into_iter().map(OrderItemResponse::from).collect(),
            history: details
                .history
                .into_iter()
                .map(StatusHistoryResponse::from)
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderListResponse {
    pub orders: Vec<OrderResponse>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}
