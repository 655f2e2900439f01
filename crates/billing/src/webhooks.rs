//! Stripe webhook verification and event decoding
//!
//! Only the events that move a family's subscription status are decoded.
//! Everything else is acknowledged and ignored.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted age of a signed webhook, in seconds
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verify a `Stripe-Signature` header (`t=<ts>,v1=<hex>[,v1=<hex>...]`).
///
/// The signed payload is `"{t}.{body}"` keyed with the full endpoint secret.
pub fn verify_signature(
    payload: &str,
    signature_header: &str,
    webhook_secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in webhook signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if candidates.is_empty() {
        tracing::warn!("Missing v1 signature in webhook signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if now_unix.abs_diff(timestamp) > SIGNATURE_TOLERANCE_SECS.unsigned_abs() {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let expected = sign_payload(payload, timestamp, webhook_secret)?;
    let matched = candidates
        .iter()
        .any(|candidate| bool::from(candidate.as_bytes().ct_eq(expected.as_bytes())));

    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Hex HMAC-SHA256 of `"{timestamp}.{payload}"`
pub fn sign_payload(payload: &str, timestamp: i64, webhook_secret: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(webhook_secret.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub customer: Option<String>,
    pub subscription: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: String,
    pub status: String,
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub items: Option<SubscriptionItems>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    pub current_period_end: Option<i64>,
}

impl SubscriptionObject {
    /// Newer API versions report the period end per item only
    pub fn period_end(&self) -> Option<i64> {
        self.current_period_end.or_else(|| {
            self.items
                .as_ref()
                .and_then(|items| items.data.iter().find_map(|item| item.current_period_end))
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub customer: Option<String>,
}

/// Webhook events that affect subscription state
#[derive(Debug, Clone)]
pub enum StripeEvent {
    CheckoutCompleted(CheckoutSessionObject),
    SubscriptionUpdated(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    InvoicePaymentFailed(InvoiceObject),
    Ignored(String),
}

#[derive(Debug, Clone)]
pub struct WebhookEventRecord {
    pub id: String,
    pub event: StripeEvent,
}

fn object<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> BillingResult<T> {
    serde_json::from_value(value).map_err(|e| BillingError::InvalidPayload(e.to_string()))
}

/// Decode a verified webhook body
pub fn parse_event(payload: &str) -> BillingResult<WebhookEventRecord> {
    let raw: RawEvent =
        serde_json::from_str(payload).map_err(|e| BillingError::InvalidPayload(e.to_string()))?;

    let event = match raw.event_type.as_str() {
        "checkout.session.completed" => StripeEvent::CheckoutCompleted(object(raw.data.object)?),
        "customer.subscription.updated" => {
            StripeEvent::SubscriptionUpdated(object(raw.data.object)?)
        }
        "customer.subscription.deleted" => {
            StripeEvent::SubscriptionDeleted(object(raw.data.object)?)
        }
        "invoice.payment_failed" => StripeEvent::InvoicePaymentFailed(object(raw.data.object)?),
        _ => StripeEvent::Ignored(raw.event_type),
    };

    Ok(WebhookEventRecord { id: raw.id, event })
}
