use crate::{
    auth::CartIdentity,
    entities::CheckoutSessionModel,
    errors::ApiError,
    handlers::common::{created_response, map_service_error, success_response, validate_input},
    services::checkout::{InformationInput, ShippingOption},
    AppState,
};
use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Creates the router for checkout endpoints
pub fn checkout_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(begin_checkout))
        .route("/shipping-options", get(shipping_options))
        .route("/:session_id", get(get_session))
        .route("/:session_id/information", put(submit_information))
        .route("/:session_id/shipping-price", post(preview_shipping_price))
        .route("/:session_id/shipping-method", put(commit_shipping_method))
        .route("/:session_id/review", post(advance_to_review))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BeginCheckoutRequest {
    /// Explicit cart id; defaults to the identity's active cart.
    pub cart_id: Option<Uuid>,
}

/// Begin checkout from a cart
#[utoipa::path(
    post,
    path = "/api/v1/checkout",
    request_body = BeginCheckoutRequest,
    responses(
        (status = 201, description = "Checkout session created", body = CheckoutSessionResponse),
        (status = 400, description = "Cart empty or inactive", body = crate::errors::ErrorResponse)
    ),
    tag = "Checkout"
)]
pub async fn begin_checkout(
    State(state): State<AppState>,
    identity: CartIdentity,
    Json(payload): Json<BeginCheckoutRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let cart_id = match payload.cart_id {
        Some(cart_id) => cart_id,
        None => state
            .services
            .carts
            .find_active_cart(&identity)
            .await
            .map_err(map_service_error)?
            .ok_or_else(|| ApiError::NotFound("No active cart for this session".to_string()))?
            .id,
    };

    let session = state
        .services
        .checkout
        .begin_checkout(cart_id)
        .await
        .map_err(map_service_error)?;

    Ok(created_response(CheckoutSessionResponse::from(session)))
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ShippingOptionsQuery {
    /// Bypass the lookup cache and reload from configuration.
    #[serde(default)]
    pub refresh: bool,
}

/// List shipping options (cached lookup)
#[utoipa::path(
    get,
    path = "/api/v1/checkout/shipping-options",
    params(ShippingOptionsQuery),
    responses((status = 200, description = "Available options", body = [ShippingOption])),
    tag = "Checkout"
)]
pub async fn shipping_options(
    State(state): State<AppState>,
    Query(query): Query<ShippingOptionsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(success_response(
        state.services.checkout.shipping_options(query.refresh),
    ))
}

/// Get a checkout session
#[utoipa::path(
    get,
    path = "/api/v1/checkout/{session_id}",
    responses(
        (status = 200, description = "Checkout session", body = CheckoutSessionResponse),
        (status = 404, description = "Unknown session", body = crate::errors::ErrorResponse)
    ),
    tag = "Checkout"
)]
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .services
        .checkout
        .get_session(session_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(CheckoutSessionResponse::from(session)))
}

/// Submit contact info and addresses; advances information -> shipping
#[utoipa::path(
    put,
    path = "/api/v1/checkout/{session_id}/information",
    request_body = InformationInput,
    responses((status = 200, description = "Updated session", body = CheckoutSessionResponse)),
    tag = "Checkout"
)]
pub async fn submit_information(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<InformationInput>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let session = state
        .services
        .checkout
        .submit_information(session_id, payload)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(CheckoutSessionResponse::from(session)))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ShippingSelectionRequest {
    pub option_id: String,
}

/// Preview pricing for a shipping option; never advances the step
#[utoipa::path(
    post,
    path = "/api/v1/checkout/{session_id}/shipping-price",
    request_body = ShippingSelectionRequest,
    responses((status = 200, description = "Repriced session", body = CheckoutSessionResponse)),
    tag = "Checkout"
)]
pub async fn preview_shipping_price(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<ShippingSelectionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .services
        .checkout
        .preview_shipping_price(session_id, &payload.option_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(CheckoutSessionResponse::from(session)))
}

/// Commit the shipping method; advances shipping -> payment
#[utoipa::path(
    put,
    path = "/api/v1/checkout/{session_id}/shipping-method",
    request_body = ShippingSelectionRequest,
    responses((status = 200, description = "Committed session", body = CheckoutSessionResponse)),
    tag = "Checkout"
)]
pub async fn commit_shipping_method(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<ShippingSelectionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .services
        .checkout
        .commit_shipping_method(session_id, &payload.option_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(CheckoutSessionResponse::from(session)))
}

/// Advance payment -> review once a payment intent exists
#[utoipa::path(
    post,
    path = "/api/v1/checkout/{session_id}/review",
    responses((status = 200, description = "Session at review", body = CheckoutSessionResponse)),
    tag = "Checkout"
)]
pub async fn advance_to_review(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .services
        .checkout
        .advance_to_review(session_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(CheckoutSessionResponse::from(session)))
}

// Response DTOs

#[derive(Debug, Serialize, ToSchema)]
pub struct CheckoutSessionResponse {
    pub id: Uuid,
    pub cart_id: Uuid,
    pub current_step: String,
    pub email: Option<String>,
    pub shipping_address: Option<serde_json::Value>,
    pub billing_address: Option<serde_json::Value>,
    pub shipping_option: Option<serde_json::Value>,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

impl From<CheckoutSessionModel> for CheckoutSessionResponse {
    fn from(session: CheckoutSessionModel) -> Self {
        Self {
            id: session.id,
            cart_id: session.cart_id,
            current_step: session.current_step.to_string(),
            email: session.email,
            shipping_address: session.shipping_address,
            billing_address: session.billing_address,
            shipping_option: session.shipping_option,
            subtotal: session.subtotal,
            shipping_cost: session.shipping_cost,
            tax: session.tax,
            total: session.total,
        }
    }
}
