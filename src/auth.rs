use crate::{config::AppConfig, errors::ServiceError, AppState};
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use uuid::Uuid;

/// Bearer-token claims issued by the storefront's auth layer.
/// Token issuance is external; this service only verifies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub role: Option<String>,
    pub exp: usize,
}

/// An authenticated storefront user.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: Uuid,
    pub role: Option<String>,
}

impl AuthenticatedUser {
    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some("admin")
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Decodes and validates a bearer token against the configured secret.
pub fn authenticate(headers: &HeaderMap, config: &AppConfig) -> Option<AuthenticatedUser> {
    let token = bearer_token(headers)?;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .ok()?;
    let id = Uuid::parse_str(&data.claims.sub).ok()?;
    Some(AuthenticatedUser {
        id,
        role: data.claims.role,
    })
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        authenticate(&parts.headers, &state.config)
            .ok_or_else(|| ServiceError::Unauthorized("missing or invalid bearer token".into()))
    }
}

/// Optional authentication: `None` for anonymous requests, never rejects.
#[derive(Debug, Clone)]
pub struct MaybeUser(pub Option<AuthenticatedUser>);

#[async_trait]
impl FromRequestParts<AppState> for MaybeUser {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(MaybeUser(authenticate(&parts.headers, &state.config)))
    }
}

/// Admin-only guard for back-office endpoints.
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthenticatedUser);

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user = AuthenticatedUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(ServiceError::Forbidden("admin role required".into()));
        }
        Ok(AdminUser(user))
    }
}

/// The identity a cart belongs to: an authenticated user, or an anonymous
/// visitor tracked through the cart cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CartIdentity {
    User(Uuid),
    Anonymous {
        id: String,
        /// True when the canonical cookie must be (re)written: the id is
        /// freshly generated, or was read from the legacy cookie name.
        set_cookie: bool,
    },
}

impl CartIdentity {
    /// Resolves the cart identity for a request.
    ///
    /// Precedence: valid bearer token, canonical cookie, legacy cookie,
    /// freshly generated anonymous id. Cookie parse failures fall through to
    /// a fresh id; this never fails the request.
    pub fn resolve(headers: &HeaderMap, config: &AppConfig) -> Self {
        if let Some(user) = authenticate(headers, config) {
            return CartIdentity::User(user.id);
        }

        if let Some(id) = valid_anonymous_id(headers, &config.cart_cookie_name) {
            return CartIdentity::Anonymous {
                id,
                set_cookie: false,
            };
        }

        if let Some(id) = valid_anonymous_id(headers, &config.cart_cookie_legacy_name) {
            return CartIdentity::Anonymous {
                id,
                set_cookie: true,
            };
        }

        CartIdentity::Anonymous {
            id: Uuid::new_v4().to_string(),
            set_cookie: true,
        }
    }

    /// The `Set-Cookie` header value to attach to the response, when the
    /// canonical cookie needs writing.
    pub fn set_cookie_header(&self, config: &AppConfig) -> Option<String> {
        match self {
            CartIdentity::Anonymous {
                id,
                set_cookie: true,
            } => Some(format!(
                "{}={}; Max-Age={}; Path=/; SameSite=Lax; HttpOnly",
                config.cart_cookie_name,
                id,
                config.cart_cookie_max_age_days * 24 * 60 * 60,
            )),
            _ => None,
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for CartIdentity {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(CartIdentity::resolve(&parts.headers, &state.config))
    }
}

/// The anonymous cart id carried by the request cookies, canonical name
/// first, regardless of authentication state. Used by the post-login cart
/// merge, where the bearer token outranks the cookie in `resolve`.
pub fn anonymous_cookie_id(headers: &HeaderMap, config: &AppConfig) -> Option<String> {
    valid_anonymous_id(headers, &config.cart_cookie_name)
        .or_else(|| valid_anonymous_id(headers, &config.cart_cookie_legacy_name))
}

/// Reads a cookie value from the `Cookie` header(s). Malformed pairs are
/// skipped rather than treated as errors.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header_value in headers.get_all(header::COOKIE) {
        let Ok(raw) = header_value.to_str() else {
            continue;
        };
        for pair in raw.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=') {
                if key.trim() == name {
                    return Some(value.trim().to_string());
                }
            }
        }
    }
    None
}

/// An anonymous id is only trusted if it parses as a UUID; anything else is
/// treated as a parse failure and regenerated.
fn valid_anonymous_id(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let value = cookie_value(headers, cookie_name)?;
    Uuid::parse_str(&value).ok().map(|id| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn test_config() -> AppConfig {
        AppConfig::default()
    }

    fn headers_with_cookie(raw: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(raw).unwrap());
        headers
    }

    fn token_for(sub: &str, role: Option<&str>, config: &AppConfig) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            role: role.map(String::from),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
        )
        .unwrap()
    }

    // ==================== CartIdentity resolution ====================

    #[test]
    fn authenticated_user_wins_over_cookie() {
        let config = test_config();
        let user_id = Uuid::new_v4();
        let mut headers = headers_with_cookie(&format!("nd_cart_id={}", Uuid::new_v4()));
        let token = token_for(&user_id.to_string(), None, &config);
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );

        assert_eq!(
            CartIdentity::resolve(&headers, &config),
            CartIdentity::User(user_id)
        );
    }

    #[test]
    fn canonical_cookie_is_reused_without_rewrite() {
        let config = test_config();
        let anon = Uuid::new_v4().to_string();
        let headers = headers_with_cookie(&format!("nd_cart_id={}", anon));

        let identity = CartIdentity::resolve(&headers, &config);
        assert_eq!(
            identity,
            CartIdentity::Anonymous {
                id: anon,
                set_cookie: false
            }
        );
        assert!(identity.set_cookie_header(&config).is_none());
    }

    #[test]
    fn legacy_cookie_is_honored_and_canonical_rewritten() {
        let config = test_config();
        let anon = Uuid::new_v4().to_string();
        let headers = headers_with_cookie(&format!("doorstore_cart={}", anon));

        let identity = CartIdentity::resolve(&headers, &config);
        assert_eq!(
            identity,
            CartIdentity::Anonymous {
                id: anon.clone(),
                set_cookie: true
            }
        );

        let cookie = identity.set_cookie_header(&config).unwrap();
        assert!(cookie.starts_with(&format!("nd_cart_id={}", anon)));
        assert!(cookie.contains("Max-Age=2592000"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Path=/"));
    }

    #[test]
    fn garbage_cookie_falls_back_to_fresh_id() {
        let config = test_config();
        let headers = headers_with_cookie("nd_cart_id=not-a-uuid; doorstore_cart=also-bad");

        match CartIdentity::resolve(&headers, &config) {
            CartIdentity::Anonymous { id, set_cookie } => {
                assert!(Uuid::parse_str(&id).is_ok());
                assert!(set_cookie);
            }
            other => panic!("expected anonymous identity, got {:?}", other),
        }
    }

    #[test]
    fn missing_headers_generate_fresh_id() {
        let config = test_config();
        let headers = HeaderMap::new();

        match CartIdentity::resolve(&headers, &config) {
            CartIdentity::Anonymous { set_cookie, .. } => assert!(set_cookie),
            other => panic!("expected anonymous identity, got {:?}", other),
        }
    }

    // ==================== Token validation ====================

    #[test]
    fn expired_token_is_ignored() {
        let config = test_config();
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            role: None,
            exp: (chrono::Utc::now().timestamp() - 3600) as usize,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
        )
        .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );

        assert!(authenticate(&headers, &config).is_none());
        assert!(matches!(
            CartIdentity::resolve(&headers, &config),
            CartIdentity::Anonymous { .. }
        ));
    }

    #[test]
    fn admin_role_is_detected() {
        let config = test_config();
        let mut headers = HeaderMap::new();
        let token = token_for(&Uuid::new_v4().to_string(), Some("admin"), &config);
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );

        let user = authenticate(&headers, &config).unwrap();
        assert!(user.is_admin());
    }

    #[test]
    fn cookie_parsing_handles_multiple_pairs() {
        let anon = Uuid::new_v4().to_string();
        let headers =
            headers_with_cookie(&format!("theme=dark; nd_cart_id={} ; session=xyz", anon));
        assert_eq!(cookie_value(&headers, "nd_cart_id").unwrap(), anon);
    }
}
