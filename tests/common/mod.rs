//! Shared harness for integration tests: an in-memory SQLite database with
//! migrations applied, the full service graph, and HTTP helpers driving the
//! real router.

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request},
    response::Response,
    Router,
};
use jsonwebtoken::{encode, EncodingKey, Header};
use northdoor_api::{self as api, auth::Claims, config::AppConfig, AppState};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub config: Arc<AppConfig>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(AppConfig::default()).await
    }

    pub async fn with_config(config: AppConfig) -> Self {
        // A single connection keeps every query on the same in-memory
        // SQLite database.
        let db_config = api::db::DbConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        };
        let db = api::db::establish_connection_with_config(&db_config)
            .await
            .expect("sqlite connection");
        api::db::run_migrations(&db).await.expect("migrations");

        let (event_sender, event_rx) = api::events::channel(256);
        tokio::spawn(api::events::process_events(event_rx));

        let config = Arc::new(config);
        let state = AppState::new(Arc::new(db), config.clone(), event_sender);
        let router = api::build_router(state.clone());

        Self {
            state,
            router,
            config,
        }
    }

    /// Sends a request through the real router.
    pub async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Response {
        self.request_with_headers(method, path, body, &[]).await
    }

    /// Sends a request with extra headers (cookies, bearer tokens).
    pub async fn request_with_headers(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(path);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&json).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router response")
    }

    /// Mints a bearer token for a user id, optionally with a role.
    pub fn token_for(&self, user_id: Uuid, role: Option<&str>) -> String {
        let claims = Claims {
            sub: user_id.to_string(),
            role: role.map(String::from),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )
        .expect("token encoding")
    }

    pub fn bearer(&self, user_id: Uuid, role: Option<&str>) -> String {
        format!("Bearer {}", self.token_for(user_id, role))
    }
}

/// Reads a response body as JSON.
pub async fn response_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

/// Cookie header value for a known anonymous cart id.
pub fn cart_cookie(anonymous_id: &str) -> String {
    format!("nd_cart_id={}", anonymous_id)
}
