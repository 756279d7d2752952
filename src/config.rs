use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_TAX_RATE: f64 = 0.08;
const DEFAULT_CURRENCY: &str = "USD";
const DEFAULT_CART_COOKIE: &str = "nd_cart_id";
const DEFAULT_CART_COOKIE_LEGACY: &str = "doorstore_cart";
const DEFAULT_CART_COOKIE_MAX_AGE_DAYS: i64 = 30;
const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;
const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 10;
const DEFAULT_LOOKUP_CACHE_TTL_SECS: u64 = 600;
const DEFAULT_PAYMENT_PROVIDER: &str = "stripe";
const DEV_DEFAULT_JWT_SECRET: &str =
    "this_is_a_development_secret_key_that_is_at_least_64_characters_long_for_testing";

/// A configured shipping option offered at checkout.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ShippingOptionConfig {
    pub id: String,
    pub name: String,
    pub price: f64,
    pub estimated_days: u32,
}

fn default_shipping_options() -> Vec<ShippingOptionConfig> {
    vec![
        ShippingOptionConfig {
            id: "standard".into(),
            name: "Standard Ground".into(),
            price: 9.99,
            estimated_days: 5,
        },
        ShippingOptionConfig {
            id: "express".into(),
            name: "Express".into(),
            price: 19.99,
            estimated_days: 2,
        },
        ShippingOptionConfig {
            id: "overnight".into(),
            name: "Overnight".into(),
            price: 29.99,
            estimated_days: 1,
        },
    ]
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// JWT secret key used to verify storefront bearer tokens
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Flat tax rate applied to subtotal + shipping
    #[serde(default = "default_tax_rate")]
    pub default_tax_rate: f64,

    /// Currency carts and orders are denominated in
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Canonical anonymous-cart cookie name (always written)
    #[serde(default = "default_cart_cookie")]
    pub cart_cookie_name: String,

    /// Legacy cookie name, still honored on read for migrated browsers
    #[serde(default = "default_cart_cookie_legacy")]
    pub cart_cookie_legacy_name: String,

    /// Anonymous-cart cookie lifetime in days
    #[serde(default = "default_cart_cookie_max_age_days")]
    pub cart_cookie_max_age_days: i64,

    /// Shared secret used to verify inbound payment webhooks
    #[serde(default)]
    pub payment_webhook_secret: Option<String>,

    /// Maximum allowed webhook timestamp skew in seconds
    #[serde(default = "default_webhook_tolerance_secs")]
    pub payment_webhook_tolerance_secs: u64,

    /// Stripe secret API key; the stripe provider registers only when set
    #[serde(default)]
    pub stripe_secret_key: Option<String>,

    /// Stripe publishable key, exposed through the client config endpoint
    #[serde(default)]
    pub stripe_publishable_key: Option<String>,

    /// Stripe API base URL (overridable for test doubles)
    #[serde(default = "default_stripe_api_base")]
    pub stripe_api_base: String,

    /// Provider used when a request does not name one
    #[serde(default = "default_payment_provider")]
    pub default_payment_provider: String,

    /// Bounded timeout for payment-provider calls, in seconds
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    /// TTL for cached lookups (shipping options), in seconds
    #[serde(default = "default_lookup_cache_ttl_secs")]
    pub lookup_cache_ttl_secs: u64,

    /// Shipping options offered at checkout
    #[serde(default = "default_shipping_options")]
    pub shipping_options: Vec<ShippingOptionConfig>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_tax_rate() -> f64 {
    DEFAULT_TAX_RATE
}
fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}
fn default_cart_cookie() -> String {
    DEFAULT_CART_COOKIE.to_string()
}
fn default_cart_cookie_legacy() -> String {
    DEFAULT_CART_COOKIE_LEGACY.to_string()
}
fn default_cart_cookie_max_age_days() -> i64 {
    DEFAULT_CART_COOKIE_MAX_AGE_DAYS
}
fn default_webhook_tolerance_secs() -> u64 {
    DEFAULT_WEBHOOK_TOLERANCE_SECS
}
fn default_stripe_api_base() -> String {
    "https://api.stripe.com".to_string()
}
fn default_payment_provider() -> String {
    DEFAULT_PAYMENT_PROVIDER.to_string()
}
fn default_provider_timeout_secs() -> u64 {
    DEFAULT_PROVIDER_TIMEOUT_SECS
}
fn default_lookup_cache_ttl_secs() -> u64 {
    DEFAULT_LOOKUP_CACHE_TTL_SECS
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => {
            let mut err = ValidationError::new("log_level");
            err.message = Some("log_level must be one of trace, debug, info, warn, error".into());
            Err(err)
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            jwt_secret: DEV_DEFAULT_JWT_SECRET.to_string(),
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            environment: DEFAULT_ENV.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_json: false,
            auto_migrate: true,
            cors_allowed_origins: None,
            default_tax_rate: DEFAULT_TAX_RATE,
            currency: DEFAULT_CURRENCY.to_string(),
            cart_cookie_name: DEFAULT_CART_COOKIE.to_string(),
            cart_cookie_legacy_name: DEFAULT_CART_COOKIE_LEGACY.to_string(),
            cart_cookie_max_age_days: DEFAULT_CART_COOKIE_MAX_AGE_DAYS,
            payment_webhook_secret: None,
            payment_webhook_tolerance_secs: DEFAULT_WEBHOOK_TOLERANCE_SECS,
            stripe_secret_key: None,
            stripe_publishable_key: None,
            stripe_api_base: default_stripe_api_base(),
            default_payment_provider: DEFAULT_PAYMENT_PROVIDER.to_string(),
            provider_timeout_secs: DEFAULT_PROVIDER_TIMEOUT_SECS,
            lookup_cache_ttl_secs: DEFAULT_LOOKUP_CACHE_TTL_SECS,
            shipping_options: default_shipping_options(),
        }
    }
}

impl AppConfig {
    pub fn is_development(&self) -> bool {
        self.environment == "development" || self.environment == "dev"
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),
    #[error("configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Loads application configuration.
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. `config/default.toml`
/// 3. `config/{env}.toml` (selected by RUN_ENV or APP_ENV)
/// 4. Environment variables (`APP__*`)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let mut builder = Config::builder()
        .set_default("database_url", "sqlite://northdoor.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?;

    // jwt_secret only has a built-in default outside production-like
    // environments; elsewhere it MUST come from config or APP__JWT_SECRET.
    if matches!(run_env.as_str(), "development" | "dev" | "test") {
        builder = builder.set_default("jwt_secret", DEV_DEFAULT_JWT_SECRET)?;
    }

    let config = builder
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET with a secure random string.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured. Set APP__JWT_SECRET.".into(),
        )));
    }

    finalize(config)
}

fn finalize(config: Config) -> Result<AppConfig, AppConfigError> {
    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

/// Initializes the global tracing subscriber.
pub fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("northdoor_api={level},tower_http=info")));

    if json {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}
