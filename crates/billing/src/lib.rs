// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ChoreQuest Billing Module
//!
//! Family subscriptions for the hosted deployment.
//!
//! ## Features
//!
//! - **Subscription Gate**: Decide whether a family may use child accounts
//!   beyond the free allowance
//! - **Checkout**: Open Stripe checkout sessions for a family
//! - **Webhooks**: Verify and apply Stripe subscription events
//! - **No-op Provider**: Self-hosted deployments are always entitled

pub mod client;
pub mod entitlement;
pub mod error;
pub mod provider;
pub mod subscriptions;
pub mod webhooks;


// Client
pub use client::{CheckoutSession, StripeClient, StripeConfig, DEFAULT_STRIPE_API_URL};

// Entitlement
pub use entitlement::{FamilyBilling, SubscriptionGate, SubscriptionRequired, SubscriptionStatus};

// Errors
pub use error::{BillingError, BillingResult};

// Providers
pub use provider::{BillingProvider, NoopBillingProvider, StripeBillingProvider};

// Persistence
pub use subscriptions::{FamilyCustomer, FamilyDirectory, SubscriptionService};

// Webhooks
pub use webhooks::{parse_event, verify_signature, StripeEvent, WebhookEventRecord};
