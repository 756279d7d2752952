pub mod stripe;

use crate::errors::ServiceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

pub use stripe::StripeProvider;

pub fn validate_positive_decimal(value: &Decimal) -> Result<(), ValidationError> {
    if *value > Decimal::ZERO {
        Ok(())
    } else {
        let mut err = ValidationError::new("range");
        err.message = Some("Amount must be greater than 0".into());
        Err(err)
    }
}

pub fn validate_currency(currency: &str) -> Result<(), ValidationError> {
    if currency.len() == 3 && currency.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("currency");
        err.message = Some("Currency must be a 3-letter ISO code".into());
        Err(err)
    }
}

/// Request to create a payment intent.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreatePaymentRequest {
    #[validate(custom = "validate_positive_decimal")]
    pub amount: Decimal,
    #[validate(custom = "validate_currency")]
    pub currency: String,
    /// Order linkage carried through provider metadata, when known.
    pub order_id: Option<Uuid>,
    pub order_number: Option<String>,
}

/// A provider-side payment intent, returned to the client for confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentIntent {
    pub payment_intent_id: String,
    pub client_secret: Option<String>,
}

/// Outcome of a refund call.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Refund {
    pub refund_id: String,
    pub amount: Option<Decimal>,
}

/// Normalized terminal payment state, provider-independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, ToSchema)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentOutcome {
    Completed,
    Failed,
    Canceled,
    Refunded,
}

/// Refund details attached to a refunded payment result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundDetails {
    /// Refunded amount in major currency units.
    pub amount: Decimal,
    pub fully_refunded: bool,
    pub reason: Option<String>,
    pub refunded_at: Option<DateTime<Utc>>,
}

/// How a payment event refers back to an order, when it does at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderReference {
    Id(Uuid),
    Number(String),
}

/// Normalized result of a payment operation or webhook event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentResult {
    pub success: bool,
    pub payment_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub payment_method_id: Option<String>,
    pub status: PaymentOutcome,
    pub error: Option<String>,
    /// Raw provider payload, kept for support triage.
    pub raw: Option<serde_json::Value>,
    pub refund: Option<RefundDetails>,
    pub order_reference: Option<OrderReference>,
}

/// A payment provider capability surface. Each concrete provider adapts one
/// processor's API onto these operations; selection goes through the
/// registry, never through ad hoc property checks.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Publishable configuration for client SDK initialization. Must never
    /// include secrets.
    fn client_config(&self) -> serde_json::Value;

    async fn create_payment(
        &self,
        request: &CreatePaymentRequest,
        idempotency_key: &str,
    ) -> Result<PaymentIntent, ServiceError>;

    async fn process_payment(
        &self,
        payment_intent_id: &str,
        payment_method_id: &str,
    ) -> Result<PaymentResult, ServiceError>;

    async fn verify_payment(&self, payment_id: &str) -> Result<PaymentResult, ServiceError>;

    async fn cancel_payment(&self, payment_id: &str) -> Result<(), ServiceError>;

    async fn refund_payment(
        &self,
        payment_id: &str,
        amount: Option<Decimal>,
    ) -> Result<Refund, ServiceError>;
}

/// Provider-agnostic facade over the registered payment providers.
///
/// Every provider call runs under a bounded timeout; a timeout surfaces as
/// `ProviderTimeout` so callers can decide whether an idempotent retry is
/// safe. Unknown provider ids are a configuration error, not a transient
/// failure.
pub struct PaymentOrchestrator {
    providers: DashMap<String, Arc<dyn PaymentProvider>>,
    default_provider: RwLock<Option<String>>,
    call_timeout: Duration,
}

impl PaymentOrchestrator {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            providers: DashMap::new(),
            default_provider: RwLock::new(None),
            call_timeout,
        }
    }

    /// Registers a provider. The first registration becomes the default.
    pub fn register(&self, provider: Arc<dyn PaymentProvider>) {
        let name = provider.name().to_string();
        info!(provider = %name, "Registered payment provider");
        self.providers.insert(name.clone(), provider);

        let mut default = self.default_provider.write().expect("lock poisoned");
        if default.is_none() {
            *default = Some(name);
        }
    }

    /// Sets the default provider; fails for unregistered ids.
    pub fn set_default_provider(&self, provider_id: &str) -> Result<(), ServiceError> {
        if !self.providers.contains_key(provider_id) {
            return Err(ServiceError::ProviderNotFound(provider_id.to_string()));
        }
        *self.default_provider.write().expect("lock poisoned") = Some(provider_id.to_string());
        Ok(())
    }

    /// Resolves a provider by id, or the default when no id is given.
    pub fn get_provider(
        &self,
        provider_id: Option<&str>,
    ) -> Result<Arc<dyn PaymentProvider>, ServiceError> {
        let id = match provider_id {
            Some(id) => id.to_string(),
            None => self
                .default_provider
                .read()
                .expect("lock poisoned")
                .clone()
                .ok_or_else(|| ServiceError::ProviderNotFound("<default>".to_string()))?,
        };

        self.providers
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(ServiceError::ProviderNotFound(id))
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.iter().map(|e| e.key().clone()).collect()
    }

    /// Creates a payment intent. Amount and currency are validated before
    /// any provider is reached; the idempotency key is client-generated so a
    /// timed-out create can be retried without double-charging.
    #[instrument(skip(self, request), fields(amount = %request.amount, currency = %request.currency))]
    pub async fn create_payment(
        &self,
        provider_id: Option<&str>,
        request: &CreatePaymentRequest,
    ) -> Result<PaymentIntent, ServiceError> {
        request.validate()?;

        let provider = self.get_provider(provider_id)?;
        let idempotency_key = Uuid::new_v4().to_string();
        self.bounded(provider.name(), provider.create_payment(request, &idempotency_key))
            .await
    }

    #[instrument(skip(self))]
    pub async fn process_payment(
        &self,
        provider_id: Option<&str>,
        payment_intent_id: &str,
        payment_method_id: &str,
    ) -> Result<PaymentResult, ServiceError> {
        let provider = self.get_provider(provider_id)?;
        self.bounded(
            provider.name(),
            provider.process_payment(payment_intent_id, payment_method_id),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn verify_payment(
        &self,
        provider_id: Option<&str>,
        payment_id: &str,
    ) -> Result<PaymentResult, ServiceError> {
        let provider = self.get_provider(provider_id)?;
        self.bounded(provider.name(), provider.verify_payment(payment_id))
            .await
    }

    #[instrument(skip(self))]
    pub async fn cancel_payment(
        &self,
        provider_id: Option<&str>,
        payment_id: &str,
    ) -> Result<(), ServiceError> {
        let provider = self.get_provider(provider_id)?;
        self.bounded(provider.name(), provider.cancel_payment(payment_id))
            .await
    }

    #[instrument(skip(self))]
    pub async fn refund_payment(
        &self,
        provider_id: Option<&str>,
        payment_id: &str,
        amount: Option<Decimal>,
    ) -> Result<Refund, ServiceError> {
        if let Some(amount) = amount {
            if amount <= Decimal::ZERO {
                return Err(ServiceError::ValidationError(
                    "Refund amount must be greater than 0".to_string(),
                ));
            }
        }
        let provider = self.get_provider(provider_id)?;
        self.bounded(provider.name(), provider.refund_payment(payment_id, amount))
            .await
    }

    /// Publishable client configuration for the resolved provider.
    pub fn client_config(
        &self,
        provider_id: Option<&str>,
    ) -> Result<serde_json::Value, ServiceError> {
        let provider = self.get_provider(provider_id)?;
        Ok(provider.client_config())
    }

    async fn bounded<T>(
        &self,
        provider_name: &str,
        fut: impl std::future::Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, ServiceError> {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| ServiceError::ProviderTimeout(provider_name.to_string()))?
    }
}
