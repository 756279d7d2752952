use crate::{
    auth::AdminUser,
    errors::ApiError,
    handlers::common::{created_response, map_service_error, success_response, validate_input},
    services::payments::{
        CreatePaymentRequest, OrderReference, PaymentIntent, PaymentResult, RefundDetails,
    },
    AppState,
};
use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Creates the router for payment endpoints
pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/config", get(client_config))
        .route("/intent", post(create_intent))
        .route("/confirm", post(confirm_payment))
        .route("/:payment_id", get(verify_payment))
        .route("/:payment_id/cancel", post(cancel_payment))
        .route("/:payment_id/refund", post(refund_payment))
        .route("/webhook", post(super::payment_webhooks::payment_webhook))
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ProviderQuery {
    pub provider: Option<String>,
}

/// Publishable provider configuration for client SDK initialization
#[utoipa::path(
    get,
    path = "/api/v1/payments/config",
    params(ProviderQuery),
    responses((status = 200, description = "Client config")),
    tag = "Payments"
)]
pub async fn client_config(
    State(state): State<AppState>,
    Query(query): Query<ProviderQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let config = state
        .services
        .payments
        .client_config(query.provider.as_deref())
        .map_err(map_service_error)?;
    Ok(success_response(config))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateIntentRequest {
    /// Price the intent from this checkout session's current total.
    pub session_id: Option<Uuid>,
    /// Explicit amount, for flows without a session (admin re-charges).
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub provider: Option<String>,
    pub order_id: Option<Uuid>,
    pub order_number: Option<String>,
}

/// Create a payment intent
#[utoipa::path(
    post,
    path = "/api/v1/payments/intent",
    request_body = CreateIntentRequest,
    responses(
        (status = 201, description = "Intent created", body = PaymentIntent),
        (status = 400, description = "Invalid amount or currency", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn create_intent(
    State(state): State<AppState>,
    Json(payload): Json<CreateIntentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (amount, currency) = match payload.session_id {
        Some(session_id) => {
            let session = state
                .services
                .checkout
                .get_session(session_id)
                .await
                .map_err(map_service_error)?;
            (session.total, state.config.currency.clone())
        }
        None => {
            let amount = payload.amount.ok_or_else(|| {
                ApiError::ValidationError(
                    "either session_id or amount is required".to_string(),
                )
            })?;
            (
                amount,
                payload.currency.unwrap_or_else(|| state.config.currency.clone()),
            )
        }
    };

    let request = CreatePaymentRequest {
        amount,
        currency,
        order_id: payload.order_id,
        order_number: payload.order_number,
    };
    validate_input(&request)?;

    let intent = state
        .services
        .payments
        .create_payment(payload.provider.as_deref(), &request)
        .await
        .map_err(map_service_error)?;

    state
        .event_sender
        .send_or_log(crate::events::Event::PaymentIntentCreated {
            provider: payload
                .provider
                .unwrap_or_else(|| state.config.default_payment_provider.clone()),
            payment_intent_id: intent.payment_intent_id.clone(),
        })
        .await;

    Ok(created_response(intent))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConfirmPaymentRequest {
    pub provider: Option<String>,
    pub payment_intent_id: String,
    pub payment_method_id: String,
}

/// Confirm a payment. The normalized result also drives the order status
/// machine when the provider echoes an order reference, so a client-driven
/// confirmation and a later webhook converge on the same state.
#[utoipa::path(
    post,
    path = "/api/v1/payments/confirm",
    request_body = ConfirmPaymentRequest,
    responses(
        (status = 200, description = "Payment result", body = PaymentResultResponse),
        (status = 402, description = "Payment declined", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn confirm_payment(
    State(state): State<AppState>,
    Json(payload): Json<ConfirmPaymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .services
        .payments
        .process_payment(
            payload.provider.as_deref(),
            &payload.payment_intent_id,
            &payload.payment_method_id,
        )
        .await
        .map_err(map_service_error)?;

    state
        .services
        .webhooks
        .apply(result.clone())
        .await
        .map_err(map_service_error)?;

    Ok(success_response(PaymentResultResponse::from(result)))
}

/// Verify a payment's status with the provider
#[utoipa::path(
    get,
    path = "/api/v1/payments/{payment_id}",
    params(ProviderQuery),
    responses((status = 200, description = "Payment result", body = PaymentResultResponse)),
    tag = "Payments"
)]
pub async fn verify_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<String>,
    Query(query): Query<ProviderQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .services
        .payments
        .verify_payment(query.provider.as_deref(), &payment_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(PaymentResultResponse::from(result)))
}

/// Cancel an in-flight payment intent
#[utoipa::path(
    post,
    path = "/api/v1/payments/{payment_id}/cancel",
    params(ProviderQuery),
    responses((status = 200, description = "Canceled")),
    tag = "Payments"
)]
pub async fn cancel_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<String>,
    Query(query): Query<ProviderQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .services
        .payments
        .cancel_payment(query.provider.as_deref(), &payment_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(serde_json::json!({ "success": true })))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RefundRequest {
    pub provider: Option<String>,
    /// Partial refund amount in major units; omit for a full refund.
    pub amount: Option<Decimal>,
}

/// Issue a refund (admin). The order's payment status flips to refunded
/// through the provider's charge.refunded webhook, not here.
#[utoipa::path(
    post,
    path = "/api/v1/payments/{payment_id}/refund",
    request_body = RefundRequest,
    responses(
        (status = 200, description = "Refund issued"),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn refund_payment(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(payment_id): Path<String>,
    Json(payload): Json<RefundRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let refund = state
        .services
        .payments
        .refund_payment(payload.provider.as_deref(), &payment_id, payload.amount)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(refund))
}

// Response DTOs

/// Payment result with the raw provider payload stripped.
#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentResultResponse {
    pub success: bool,
    pub status: String,
    pub payment_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub payment_method_id: Option<String>,
    pub error: Option<String>,
    #[schema(value_type = Object)]
    pub refund: Option<RefundDetails>,
    pub order_id: Option<Uuid>,
    pub order_number: Option<String>,
}

impl From<PaymentResult> for PaymentResultResponse {
    fn from(result: PaymentResult) -> Self {
        let (order_id, order_number) = match result.order_reference {
            Some(OrderReference::Id(id)) => (Some(id), None),
            Some(OrderReference::Number(number)) => (None, Some(number)),
            None => (None, None),
        };
        Self {
            success: result.success,
            status: result.status.to_string(),
            payment_id: result.payment_id,
            payment_intent_id: result.payment_intent_id,
            payment_method_id: result.payment_method_id,
            error: result.error,
            refund: result.refund,
            order_id,
            order_number,
        }
    }
}
