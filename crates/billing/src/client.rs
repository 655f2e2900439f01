//! Stripe API client
//!
//! Wraps `async-stripe` for the three calls the hosted deployment needs:
//! creating a customer, opening a subscription checkout session and
//! retrieving a subscription.

use std::collections::HashMap;

use serde::Serialize;
use stripe::{
    CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems, CreateCustomer,
    Customer, CustomerId, Expandable, Subscription, SubscriptionId,
};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::webhooks::SubscriptionObject;

pub const DEFAULT_STRIPE_API_URL: &str = "https://api.stripe.com";

#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_id: String,
    pub api_url: String,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("price_id", &self.price_id)
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}

/// Checkout session handed back to the browser
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutSession {
    pub session_id: String,
    pub url: String,
}

#[derive(Clone)]
pub struct StripeClient {
    config: StripeConfig,
    client: stripe::Client,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> BillingResult<Self> {
        // async-stripe panics on an unparseable base URL
        reqwest::Url::parse(&config.api_url).map_err(|e| {
            BillingError::StripeApi(format!("invalid Stripe API URL: {}", e))
        })?;
        let client = stripe::Client::from_url(config.api_url.as_str(), config.secret_key.clone());
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    pub async fn create_customer(&self, name: &str, family_id: Uuid) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("family_id".to_string(), family_id.to_string());

        let params = CreateCustomer {
            name: Some(name),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(self.inner(), params).await?;
        tracing::info!(family_id = %family_id, customer_id = %customer.id, "Created Stripe customer");
        Ok(customer.id.to_string())
    }

    pub async fn create_checkout_session(
        &self,
        customer_id: &str,
        family_id: Uuid,
        success_url: &str,
        cancel_url: &str,
    ) -> BillingResult<CheckoutSession> {
        let customer = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("invalid customer id: {}", e)))?;
        let family = family_id.to_string();

        let mut metadata = HashMap::new();
        metadata.insert("family_id".to_string(), family.clone());

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.customer = Some(customer);
        params.client_reference_id = Some(&family);
        params.success_url = Some(success_url);
        params.cancel_url = Some(cancel_url);
        params.metadata = Some(metadata);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(self.config.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);

        let session = stripe::CheckoutSession::create(self.inner(), params).await?;
        let url = session
            .url
            .ok_or_else(|| BillingError::StripeApi("checkout session has no URL".to_string()))?;

        Ok(CheckoutSession {
            session_id: session.id.to_string(),
            url,
        })
    }

    pub async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionObject> {
        let id = subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("invalid subscription id: {}", e)))?;

        let subscription = Subscription::retrieve(self.inner(), &id, &[]).await?;

        let customer = match &subscription.customer {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(customer) => customer.id.to_string(),
        };

        Ok(SubscriptionObject {
            id: subscription.id.to_string(),
            customer,
            status: subscription.status.as_str().to_string(),
            current_period_end: Some(subscription.current_period_end),
            items: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client_for(server: &mockito::ServerGuard) -> StripeClient {
        StripeClient::new(StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: "whsec_123".to_string(),
            price_id: "price_family".to_string(),
            api_url: server.url(),
        })
        .unwrap()
    }

    #[test]
    fn test_unparseable_api_url_rejected() {
        let result = StripeClient::new(StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: "whsec_123".to_string(),
            price_id: "price_family".to_string(),
            api_url: "not a url".to_string(),
        });
        assert!(matches!(result, Err(BillingError::StripeApi(_))));
    }

    #[tokio::test]
    async fn test_checkout_request_carries_price_and_family() {
        let mut server = mockito::Server::new_async().await;
        let family_id = Uuid::new_v4();

        let mock = server
            .mock("POST", "/v1/checkout/sessions")
            .match_header("authorization", "Bearer sk_test_123")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("mode".into(), "subscription".into()),
                Matcher::UrlEncoded("customer".into(), "cus_1".into()),
                Matcher::UrlEncoded("line_items[0][price]".into(), "price_family".into()),
                Matcher::UrlEncoded("metadata[family_id]".into(), family_id.to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"cs_test_1","object":"checkout.session","url":"https://checkout.stripe.com/c/cs_test_1"}"#)
            .create_async()
            .await;

        // Only the outgoing request is checked; the stub body is not a full session object
        let _ = client_for(&server)
            .create_checkout_session("cus_1", family_id, "https://app/ok", "https://app/cancel")
            .await;

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_invalid_customer_id_rejected_before_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/checkout/sessions")
            .expect(0)
            .create_async()
            .await;

        let err = client_for(&server)
            .create_checkout_session("sub_wrong_prefix", Uuid::new_v4(), "https://a", "https://b")
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::StripeApi(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_stripe_error_message_surfaces() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/subscriptions/sub_missing")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":{"type":"invalid_request_error","message":"No such subscription"}}"#)
            .create_async()
            .await;

        let err = client_for(&server)
            .retrieve_subscription("sub_missing")
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::StripeApi(msg) if msg == "No such subscription"));
    }
}
