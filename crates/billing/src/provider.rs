//! Billing providers
//!
//! The self-hosted deployment uses [`NoopBillingProvider`], which treats every
//! family as subscribed. The hosted deployment uses [`StripeBillingProvider`],
//! which persists Stripe's view of each subscription on the family row so
//! entitlement checks never call Stripe on the request path.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{CheckoutSession, StripeClient};
use crate::entitlement::{FamilyBilling, SubscriptionStatus};
use crate::error::{BillingError, BillingResult};
use crate::subscriptions::SubscriptionService;
use crate::webhooks::{self, StripeEvent};

#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Open a payment session for the family
    async fn create_checkout_session(
        &self,
        family_id: Uuid,
        success_url: &str,
        cancel_url: &str,
    ) -> BillingResult<CheckoutSession>;

    /// Status to report for a family
    fn subscription_status(&self, family: &FamilyBilling) -> SubscriptionStatus;

    /// Verify and apply an incoming provider webhook
    async fn handle_webhook(&self, payload: &str, signature: &str) -> BillingResult<()>;
}

/// Provider for the self-hosted deployment
#[derive(Debug, Clone, Default)]
pub struct NoopBillingProvider;

#[async_trait]
impl BillingProvider for NoopBillingProvider {
    async fn create_checkout_session(
        &self,
        _family_id: Uuid,
        _success_url: &str,
        _cancel_url: &str,
    ) -> BillingResult<CheckoutSession> {
        Err(BillingError::NotAvailable)
    }

    fn subscription_status(&self, _family: &FamilyBilling) -> SubscriptionStatus {
        SubscriptionStatus::Active
    }

    async fn handle_webhook(&self, _payload: &str, _signature: &str) -> BillingResult<()> {
        Err(BillingError::NotAvailable)
    }
}

pub struct StripeBillingProvider {
    stripe: StripeClient,
    subscriptions: SubscriptionService,
}

impl StripeBillingProvider {
    pub fn new(stripe: StripeClient, subscriptions: SubscriptionService) -> Self {
        Self {
            stripe,
            subscriptions,
        }
    }

    async fn ensure_customer(&self, family_id: Uuid) -> BillingResult<String> {
        let family = self
            .subscriptions
            .customer(family_id)
            .await?
            .ok_or(BillingError::FamilyNotFound(family_id))?;

        if let Some(customer_id) = family.stripe_customer_id {
            return Ok(customer_id);
        }

        let customer_id = self.stripe.create_customer(&family.name, family.id).await?;
        self.subscriptions
            .set_customer_id(family.id, &customer_id)
            .await?;
        Ok(customer_id)
    }

    async fn apply_event(&self, event: StripeEvent) -> BillingResult<()> {
        match event {
            StripeEvent::CheckoutCompleted(session) => {
                let Some(subscription_id) = session.subscription else {
                    return Ok(());
                };
                let family_id = session
                    .metadata
                    .get("family_id")
                    .and_then(|id| Uuid::parse_str(id).ok())
                    .ok_or_else(|| {
                        BillingError::InvalidPayload("checkout session without family_id".into())
                    })?;

                let subscription = self.stripe.retrieve_subscription(&subscription_id).await?;
                self.subscriptions
                    .apply_subscription(
                        family_id,
                        &subscription.id,
                        SubscriptionStatus::from_provider(&subscription.status),
                        period_end(subscription.period_end()),
                    )
                    .await?;
                tracing::info!(family_id = %family_id, "Checkout completed");
            }
            StripeEvent::SubscriptionUpdated(subscription) => {
                let Some(family_id) = self
                    .subscriptions
                    .family_by_customer(&subscription.customer)
                    .await?
                else {
                    tracing::warn!("Subscription updated for unknown customer");
                    return Ok(());
                };

                self.subscriptions
                    .apply_subscription(
                        family_id,
                        &subscription.id,
                        SubscriptionStatus::from_provider(&subscription.status),
                        period_end(subscription.period_end()),
                    )
                    .await?;
            }
            StripeEvent::SubscriptionDeleted(subscription) => {
                if let Some(family_id) = self
                    .subscriptions
                    .family_by_customer(&subscription.customer)
                    .await?
                {
                    self.subscriptions.mark_canceled(family_id).await?;
                }
            }
            StripeEvent::InvoicePaymentFailed(invoice) => {
                let Some(customer_id) = invoice.customer else {
                    return Ok(());
                };
                if let Some(family_id) = self.subscriptions.family_by_customer(&customer_id).await?
                {
                    self.subscriptions.mark_past_due(family_id).await?;
                }
            }
            StripeEvent::Ignored(kind) => {
                tracing::debug!(event_type = %kind, "Unhandled Stripe event type");
            }
        }

        Ok(())
    }
}

fn period_end(unix: Option<i64>) -> Option<OffsetDateTime> {
    unix.and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
}

#[async_trait]
impl BillingProvider for StripeBillingProvider {
    async fn create_checkout_session(
        &self,
        family_id: Uuid,
        success_url: &str,
        cancel_url: &str,
    ) -> BillingResult<CheckoutSession> {
        let customer_id = self.ensure_customer(family_id).await?;
        self.stripe
            .create_checkout_session(&customer_id, family_id, success_url, cancel_url)
            .await
    }

    fn subscription_status(&self, family: &FamilyBilling) -> SubscriptionStatus {
        family.status
    }

    async fn handle_webhook(&self, payload: &str, signature: &str) -> BillingResult<()> {
        webhooks::verify_signature(
            payload,
            signature,
            &self.stripe.config().webhook_secret,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        let record = webhooks::parse_event(payload)?;
        tracing::info!(event_id = %record.id, "Processing Stripe webhook event");
        self.apply_event(record.event).await
    }
}
