use crate::{
    auth::{AuthenticatedUser, CartIdentity},
    errors::ApiError,
    handlers::common::{map_service_error, validate_input},
    services::carts::{AddItemInput, CartSummary, CartWithItems},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Creates the router for cart endpoints
pub fn cart_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_cart))
        .route("/current", get(get_current_cart))
        .route("/current/items", post(add_item))
        .route("/current/items/:item_id", put(update_item))
        .route("/current/items/:item_id", delete(remove_item))
        .route("/merge", post(merge_carts))
}

/// Attaches the anonymous-cart cookie when the identity requires it.
fn with_identity_cookie(
    mut response: Response,
    identity: &CartIdentity,
    state: &AppState,
) -> Response {
    if let Some(cookie) = identity.set_cookie_header(&state.config) {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

/// Ensure the identity's active cart exists
#[utoipa::path(
    post,
    path = "/api/v1/carts",
    responses((status = 201, description = "Active cart", body = CartResponse)),
    tag = "Carts"
)]
pub async fn create_cart(
    State(state): State<AppState>,
    identity: CartIdentity,
) -> Result<Response, ApiError> {
    let cart = state
        .services
        .carts
        .get_or_create_cart(&identity)
        .await
        .map_err(map_service_error)?;
    let cart = state
        .services
        .carts
        .get_cart(cart.id)
        .await
        .map_err(map_service_error)?;

    let response =
        (StatusCode::CREATED, Json(CartResponse::from(cart))).into_response();
    Ok(with_identity_cookie(response, &identity, &state))
}

/// Current cart with consolidated line items
#[utoipa::path(
    get,
    path = "/api/v1/carts/current",
    responses((status = 200, description = "Cart summary", body = CartResponse)),
    tag = "Carts"
)]
pub async fn get_current_cart(
    State(state): State<AppState>,
    identity: CartIdentity,
) -> Result<Response, ApiError> {
    let cart = state
        .services
        .carts
        .get_or_create_cart(&identity)
        .await
        .map_err(map_service_error)?;
    let cart = state
        .services
        .carts
        .get_cart(cart.id)
        .await
        .map_err(map_service_error)?;

    let response = (StatusCode::OK, Json(CartResponse::from(cart))).into_response();
    Ok(with_identity_cookie(response, &identity, &state))
}

/// Add an item to the current cart
#[utoipa::path(
    post,
    path = "/api/v1/carts/current/items",
    request_body = AddItemInput,
    responses(
        (status = 200, description = "Updated cart", body = CartResponse),
        (status = 400, description = "Invalid quantity or price", body = crate::errors::ErrorResponse)
    ),
    tag = "Carts"
)]
pub async fn add_item(
    State(state): State<AppState>,
    identity: CartIdentity,
    Json(payload): Json<AddItemInput>,
) -> Result<Response, ApiError> {
    validate_input(&payload)?;

    let cart = state
        .services
        .carts
        .get_or_create_cart(&identity)
        .await
        .map_err(map_service_error)?;
    let cart = state
        .services
        .carts
        .add_item(cart.id, payload)
        .await
        .map_err(map_service_error)?;

    let response = (StatusCode::OK, Json(CartResponse::from(cart))).into_response();
    Ok(with_identity_cookie(response, &identity, &state))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateQuantityRequest {
    pub quantity: i32,
}

/// Update a line's quantity (zero removes it)
#[utoipa::path(
    put,
    path = "/api/v1/carts/current/items/{item_id}",
    request_body = UpdateQuantityRequest,
    responses((status = 200, description = "Updated cart", body = CartResponse)),
    tag = "Carts"
)]
pub async fn update_item(
    State(state): State<AppState>,
    identity: CartIdentity,
    Path(item_id): Path<Uuid>,
    Json(payload): Json<UpdateQuantityRequest>,
) -> Result<Response, ApiError> {
    let cart = state
        .services
        .carts
        .get_or_create_cart(&identity)
        .await
        .map_err(map_service_error)?;
    let cart = state
        .services
        .carts
        .update_item_quantity(cart.id, item_id, payload.quantity)
        .await
        .map_err(map_service_error)?;

    let response = (StatusCode::OK, Json(CartResponse::from(cart))).into_response();
    Ok(with_identity_cookie(response, &identity, &state))
}

/// Remove a line from the current cart
#[utoipa::path(
    delete,
    path = "/api/v1/carts/current/items/{item_id}",
    responses((status = 200, description = "Updated cart", body = CartResponse)),
    tag = "Carts"
)]
pub async fn remove_item(
    State(state): State<AppState>,
    identity: CartIdentity,
    Path(item_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let cart = state
        .services
        .carts
        .get_or_create_cart(&identity)
        .await
        .map_err(map_service_error)?;
    let cart = state
        .services
        .carts
        .remove_item(cart.id, item_id)
        .await
        .map_err(map_service_error)?;

    let response = (StatusCode::OK, Json(CartResponse::from(cart))).into_response();
    Ok(with_identity_cookie(response, &identity, &state))
}

/// Merge the anonymous cookie cart into the authenticated user's cart.
/// Called by the storefront right after login.
#[utoipa::path(
    post,
    path = "/api/v1/carts/merge",
    responses(
        (status = 200, description = "Merged cart", body = CartResponse),
        (status = 401, description = "Login required", body = crate::errors::ErrorResponse)
    ),
    tag = "Carts"
)]
pub async fn merge_carts(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    headers: axum::http::HeaderMap,
) -> Result<Response, ApiError> {
    // The bearer token outranks the cookie in identity resolution, so the
    // anonymous id is read straight from the cookies here.
    let anonymous_id = crate::auth::anonymous_cookie_id(&headers, &state.config);

    let cart = match anonymous_id {
        Some(anonymous_id) => state
            .services
            .carts
            .merge_anonymous_cart(user.id, &anonymous_id)
            .await
            .map_err(map_service_error)?,
        None => {
            let cart = state
                .services
                .carts
                .get_or_create_cart(&CartIdentity::User(user.id))
                .await
                .map_err(map_service_error)?;
            state
                .services
                .carts
                .get_cart(cart.id)
                .await
                .map_err(map_service_error)?
        }
    };

    Ok((StatusCode::OK, Json(CartResponse::from(cart))).into_response())
}

// Response DTOs

#[derive(Debug, Serialize, ToSchema)]
pub struct CartResponse {
    pub id: Uuid,
    pub status: String,
    pub currency: String,
    pub summary: CartSummary,
}

impl From<CartWithItems> for CartResponse {
    fn from(cart: CartWithItems) -> Self {
        let summary = cart.summary();
        Self {
            id: cart.cart.id,
            status: format!("{:?}", cart.cart.status).to_lowercase(),
            currency: cart.cart.currency.clone(),
            summary,
        }
    }
}
