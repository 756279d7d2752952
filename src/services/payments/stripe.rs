use super::{
    CreatePaymentRequest, OrderReference, PaymentIntent, PaymentOutcome, PaymentProvider,
    PaymentResult, Refund,
};
use crate::{config::AppConfig, errors::ServiceError};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

pub const PROVIDER_NAME: &str = "stripe";

/// Stripe card processor adapter.
///
/// Talks to the Stripe REST API (form-encoded, minor-unit amounts) and
/// normalizes intent/charge payloads into [`PaymentResult`]. Registered only
/// when a secret key is configured.
pub struct StripeProvider {
    http: reqwest::Client,
    api_base: String,
    secret_key: String,
    publishable_key: Option<String>,
}

impl StripeProvider {
    /// Builds the provider from configuration; `None` when no secret key is
    /// configured.
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let secret_key = config.stripe_secret_key.clone()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.provider_timeout_secs))
            .build()
            .ok()?;

        Some(Self {
            http,
            api_base: config.stripe_api_base.trim_end_matches('/').to_string(),
            secret_key,
            publishable_key: config.stripe_publishable_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn map_transport_error(&self, err: reqwest::Error) -> ServiceError {
        if err.is_timeout() {
            ServiceError::ProviderTimeout(PROVIDER_NAME.to_string())
        } else {
            ServiceError::ExternalServiceError(format!("stripe request failed: {}", err))
        }
    }

    async fn parse_response(&self, response: reqwest::Response) -> Result<Value, ServiceError> {
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if status.is_success() {
            return Ok(body);
        }

        let message = body
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("unknown provider error")
            .to_string();

        if status.is_client_error() {
            Err(ServiceError::PaymentFailed(message))
        } else {
            Err(ServiceError::ExternalServiceError(format!(
                "stripe returned {}: {}",
                status, message
            )))
        }
    }
}

/// Converts a major-unit decimal amount into minor units (cents).
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    (amount * Decimal::from(100))
        .round()
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError("amount out of range".to_string()))
}

/// Converts a minor-unit integer value into major units.
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::from(minor) / Decimal::from(100)
}

/// Normalizes a Stripe payment-intent payload.
pub fn result_from_intent(intent: &Value) -> PaymentResult {
    let status = intent.get("status").and_then(Value::as_str).unwrap_or("");
    let error_message = intent
        .pointer("/last_payment_error/message")
        .and_then(Value::as_str)
        .map(String::from);

    let (outcome, success, error) = match status {
        "succeeded" => (PaymentOutcome::Completed, true, None),
        "canceled" => (PaymentOutcome::Canceled, false, error_message),
        _ => (
            PaymentOutcome::Failed,
            false,
            error_message.or_else(|| Some(format!("payment not completed (status: {})", status))),
        ),
    };

    PaymentResult {
        success,
        payment_id: intent
            .get("latest_charge")
            .and_then(Value::as_str)
            .map(String::from),
        payment_intent_id: intent.get("id").and_then(Value::as_str).map(String::from),
        payment_method_id: intent
            .get("payment_method")
            .and_then(Value::as_str)
            .map(String::from),
        status: outcome,
        error,
        raw: Some(intent.clone()),
        refund: None,
        order_reference: order_reference_from_metadata(intent.get("metadata")),
    }
}

/// Pulls an order reference out of provider metadata, if one was attached.
/// Absence is valid: the event just is not tied to an order.
pub fn order_reference_from_metadata(metadata: Option<&Value>) -> Option<OrderReference> {
    let metadata = metadata?;

    if let Some(id) = metadata.get("order_id").and_then(Value::as_str) {
        if let Ok(uuid) = Uuid::parse_str(id) {
            return Some(OrderReference::Id(uuid));
        }
        warn!(order_id = %id, "Ignoring unparseable order_id in payment metadata");
    }

    metadata
        .get("order_number")
        .and_then(Value::as_str)
        .map(|number| OrderReference::Number(number.to_string()))
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn client_config(&self) -> Value {
        serde_json::json!({
            "provider": PROVIDER_NAME,
            "publishable_key": self.publishable_key,
        })
    }

    async fn create_payment(
        &self,
        request: &CreatePaymentRequest,
        idempotency_key: &str,
    ) -> Result<PaymentIntent, ServiceError> {
        let minor = to_minor_units(request.amount)?;
        let mut form: Vec<(String, String)> = vec![
            ("amount".into(), minor.to_string()),
            ("currency".into(), request.currency.to_lowercase()),
            ("automatic_payment_methods[enabled]".into(), "true".into()),
        ];
        if let Some(order_id) = request.order_id {
            form.push(("metadata[order_id]".into(), order_id.to_string()));
        }
        if let Some(order_number) = &request.order_number {
            form.push(("metadata[order_number]".into(), order_number.clone()));
        }

        let response = self
            .http
            .post(self.url("/v1/payment_intents"))
            .basic_auth(&self.secret_key, None::<&str>)
            .header("Idempotency-Key", idempotency_key)
            .form(&form)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let body = self.parse_response(response).await?;

        let payment_intent_id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ServiceError::ExternalServiceError("stripe intent missing id".to_string())
            })?
            .to_string();

        Ok(PaymentIntent {
            payment_intent_id,
            client_secret: body
                .get("client_secret")
                .and_then(Value::as_str)
                .map(String::from),
        })
    }

    async fn process_payment(
        &self,
        payment_intent_id: &str,
        payment_method_id: &str,
    ) -> Result<PaymentResult, ServiceError> {
        let response = self
            .http
            .post(self.url(&format!(
                "/v1/payment_intents/{}/confirm",
                payment_intent_id
            )))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(&[("payment_method", payment_method_id)])
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let body = self.parse_response(response).await?;
        Ok(result_from_intent(&body))
    }

    async fn verify_payment(&self, payment_id: &str) -> Result<PaymentResult, ServiceError> {
        let response = self
            .http
            .get(self.url(&format!("/v1/payment_intents/{}", payment_id)))
            .basic_auth(&self.secret_key, None::<&str>)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let body = self.parse_response(response).await?;
        Ok(result_from_intent(&body))
    }

    async fn cancel_payment(&self, payment_id: &str) -> Result<(), ServiceError> {
        let response = self
            .http
            .post(self.url(&format!("/v1/payment_intents/{}/cancel", payment_id)))
            .basic_auth(&self.secret_key, None::<&str>)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        self.parse_response(response).await?;
        Ok(())
    }

    async fn refund_payment(
        &self,
        payment_id: &str,
        amount: Option<Decimal>,
    ) -> Result<Refund, ServiceError> {
        let mut form: Vec<(String, String)> =
            vec![("payment_intent".into(), payment_id.to_string())];
        if let Some(amount) = amount {
            form.push(("amount".into(), to_minor_units(amount)?.to_string()));
        }

        let response = self
            .http
            .post(self.url("/v1/refunds"))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(&form)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let body = self.parse_response(response).await?;

        Ok(Refund {
            refund_id: body
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            amount: body.get("amount").and_then(Value::as_i64).map(from_minor_units),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    // ==================== Unit conversion ====================

    #[test]
    fn minor_unit_conversion_round_trips() {
        assert_eq!(to_minor_units(dec!(129.57)).unwrap(), 12957);
        assert_eq!(to_minor_units(dec!(0.01)).unwrap(), 1);
        assert_eq!(from_minor_units(11850), dec!(118.50));
        assert_eq!(from_minor_units(to_minor_units(dec!(45.00)).unwrap()), dec!(45.00));
    }

    // ==================== Intent normalization ====================

    #[test]
    fn succeeded_intent_normalizes_to_completed() {
        let intent = json!({
            "id": "pi_123",
            "status": "succeeded",
            "latest_charge": "ch_456",
            "payment_method": "pm_789",
            "metadata": { "order_id": Uuid::nil().to_string() }
        });

        let result = result_from_intent(&intent);
        assert!(result.success);
        assert_eq!(result.status, PaymentOutcome::Completed);
        assert_eq!(result.payment_id.as_deref(), Some("ch_456"));
        assert_eq!(result.payment_intent_id.as_deref(), Some("pi_123"));
        assert_eq!(result.payment_method_id.as_deref(), Some("pm_789"));
        assert_eq!(
            result.order_reference,
            Some(OrderReference::Id(Uuid::nil()))
        );
    }

    #[test]
    fn canceled_intent_normalizes_to_canceled() {
        let intent = json!({ "id": "pi_1", "status": "canceled" });
        let result = result_from_intent(&intent);
        assert!(!result.success);
        assert_eq!(result.status, PaymentOutcome::Canceled);
    }

    #[test]
    fn failed_intent_carries_decline_reason() {
        let intent = json!({
            "id": "pi_1",
            "status": "requires_payment_method",
            "last_payment_error": { "message": "Your card was declined." }
        });

        let result = result_from_intent(&intent);
        assert!(!result.success);
        assert_eq!(result.status, PaymentOutcome::Failed);
        assert_eq!(result.error.as_deref(), Some("Your card was declined."));
    }

    // ==================== Metadata extraction ====================

    #[test]
    fn missing_metadata_is_not_an_error() {
        let intent = json!({ "id": "pi_1", "status": "succeeded" });
        let result = result_from_intent(&intent);
        assert!(result.order_reference.is_none());
    }

    #[test]
    fn order_number_is_used_when_id_is_absent() {
        let reference = order_reference_from_metadata(Some(&json!({
            "order_number": "NO-20250315-ABCD"
        })));
        assert_eq!(
            reference,
            Some(OrderReference::Number("NO-20250315-ABCD".to_string()))
        );
    }

    #[test]
    fn garbage_order_id_falls_back_to_order_number() {
        let reference = order_reference_from_metadata(Some(&json!({
            "order_id": "not-a-uuid",
            "order_number": "NO-20250315-ABCD"
        })));
        assert_eq!(
            reference,
            Some(OrderReference::Number("NO-20250315-ABCD".to_string()))
        );
    }

    // ==================== Provider construction ====================

    #[test]
    fn provider_requires_secret_key() {
        let config = AppConfig::default();
        assert!(StripeProvider::from_config(&config).is_none());

        let mut config = AppConfig::default();
        config.stripe_secret_key = Some("sk_test_123".into());
        config.stripe_publishable_key = Some("pk_test_123".into());
        let provider = StripeProvider::from_config(&config).unwrap();
        assert_eq!(provider.name(), "stripe");

        let client_config = provider.client_config();
        assert_eq!(client_config["publishable_key"], "pk_test_123");
        assert!(client_config.get("secret_key").is_none());
    }
}
