//! Family entitlement and the subscription gate
//!
//! Entitlement is a pure function of the persisted family billing state. It
//! never calls the billing provider and must be recomputed on every request,
//! since webhooks can change the state between two requests.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Subscription status as persisted on the family row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    None,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::None => "none",
        }
    }

    /// Statuses that grant entitlement on their own
    pub fn grants_access(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }

    /// Collapse a Stripe subscription status onto the five persisted values.
    pub fn from_provider(status: &str) -> Self {
        match status {
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" | "unpaid" => SubscriptionStatus::PastDue,
            "canceled" | "incomplete_expired" | "paused" => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::None,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown subscription status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for SubscriptionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "none" => Ok(SubscriptionStatus::None),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Billing-relevant state of a family (tenant)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyBilling {
    pub id: Uuid,
    pub status: SubscriptionStatus,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
}

impl FamilyBilling {
    /// True when the family has an active or trialing subscription, or is
    /// still inside its trial window.
    pub fn is_entitled(&self, now: OffsetDateTime) -> bool {
        if self.status.grants_access() {
            return true;
        }
        matches!(self.trial_ends_at, Some(ends) if ends > now)
    }
}

/// Raised when a family is over the free allowance without entitlement
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct SubscriptionRequired {
    pub message: String,
    pub child_count: i64,
    pub free_limit: i64,
}

/// Gate applied before family-scoped work in the hosted deployment.
///
/// When `enforced` is false (self-hosted deployment) every check passes.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionGate {
    enforced: bool,
    free_child_limit: i64,
}

impl SubscriptionGate {
    pub fn new(enforced: bool, free_child_limit: i64) -> Self {
        Self {
            enforced,
            free_child_limit,
        }
    }

    /// Gate that never blocks
    pub fn disabled() -> Self {
        Self::new(false, 0)
    }

    pub fn is_enforced(&self) -> bool {
        self.enforced
    }

    pub fn free_child_limit(&self) -> i64 {
        self.free_child_limit
    }

    pub fn check(
        &self,
        family: &FamilyBilling,
        child_count: i64,
        now: OffsetDateTime,
    ) -> Result<(), SubscriptionRequired> {
        if !self.enforced {
            return Ok(());
        }

        if child_count > self.free_child_limit && !family.is_entitled(now) {
            let message = if self.free_child_limit == 0 {
                "A subscription is required to add child accounts.".to_string()
            } else {
                format!(
                    "A subscription is required for more than {} child account(s).",
                    self.free_child_limit
                )
            };
            return Err(SubscriptionRequired {
                message,
                child_count,
                free_limit: self.free_child_limit,
            });
        }

        Ok(())
    }
}
