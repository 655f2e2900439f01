//! Family subscription state persistence
//!
//! Request-path code only reads through this service. The write methods are
//! called from webhook processing, which is the only place subscription
//! status is allowed to change.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entitlement::{FamilyBilling, SubscriptionStatus};
use crate::error::BillingResult;

/// Family lookups needed on the request path.
///
/// The API server only sees this trait, so the gate and the family routes
/// can run against an in-memory directory in tests.
#[async_trait]
pub trait FamilyDirectory: Send + Sync {
    /// Billing state of the first family the user belongs to
    async fn family_for_user(&self, user_id: Uuid) -> BillingResult<Option<FamilyBilling>>;

    /// Number of child members in the family
    async fn child_count(&self, family_id: Uuid) -> BillingResult<i64>;

    /// Create a family owned by `owner_id`, who joins it as a parent.
    async fn create_family(
        &self,
        name: &str,
        owner_id: Uuid,
        trial_ends_at: OffsetDateTime,
    ) -> BillingResult<FamilyBilling>;
}

/// Database row for the billing columns of `families`
#[derive(Debug, sqlx::FromRow)]
struct FamilyBillingRow {
    id: Uuid,
    subscription_status: String,
    trial_ends_at: Option<OffsetDateTime>,
    subscription_current_period_end: Option<OffsetDateTime>,
}

impl From<FamilyBillingRow> for FamilyBilling {
    fn from(row: FamilyBillingRow) -> Self {
        let status = row
            .subscription_status
            .parse()
            .unwrap_or_else(|err| {
                tracing::warn!(family_id = %row.id, error = %err, "Treating unknown subscription status as none");
                SubscriptionStatus::None
            });

        FamilyBilling {
            id: row.id,
            status,
            trial_ends_at: row.trial_ends_at,
            current_period_end: row.subscription_current_period_end,
        }
    }
}

/// Customer-facing identifiers needed to start a checkout
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FamilyCustomer {
    pub id: Uuid,
    pub name: String,
    pub stripe_customer_id: Option<String>,
}

#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn family_for_user(&self, user_id: Uuid) -> BillingResult<Option<FamilyBilling>> {
        let row: Option<FamilyBillingRow> = sqlx::query_as(
            r#"
            SELECT f.id, f.subscription_status, f.trial_ends_at, f.subscription_current_period_end
            FROM families f
            JOIN family_members fm ON fm.family_id = f.id
            WHERE fm.user_id = $1
            ORDER BY fm.created_at ASC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(FamilyBilling::from))
    }

    pub async fn load(&self, family_id: Uuid) -> BillingResult<Option<FamilyBilling>> {
        let row: Option<FamilyBillingRow> = sqlx::query_as(
            r#"
            SELECT id, subscription_status, trial_ends_at, subscription_current_period_end
            FROM families
            WHERE id = $1
            "#,
        )
        .bind(family_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(FamilyBilling::from))
    }

    pub async fn child_count(&self, family_id: Uuid) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM family_members WHERE family_id = $1 AND role = 'child'",
        )
        .bind(family_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    pub async fn create_family(
        &self,
        name: &str,
        owner_id: Uuid,
        trial_ends_at: OffsetDateTime,
    ) -> BillingResult<FamilyBilling> {
        let family_id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO families (id, name, owner_user_id, subscription_status, trial_ends_at)
            VALUES ($1, $2, $3, 'none', $4)
            "#,
        )
        .bind(family_id)
        .bind(name)
        .bind(owner_id)
        .bind(trial_ends_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO family_members (family_id, user_id, role) VALUES ($1, $2, 'parent')",
        )
        .bind(family_id)
        .bind(owner_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(family_id = %family_id, owner_id = %owner_id, "Family created");
        Ok(FamilyBilling {
            id: family_id,
            status: SubscriptionStatus::None,
            trial_ends_at: Some(trial_ends_at),
            current_period_end: None,
        })
    }

    pub async fn customer(&self, family_id: Uuid) -> BillingResult<Option<FamilyCustomer>> {
        let row: Option<FamilyCustomer> =
            sqlx::query_as("SELECT id, name, stripe_customer_id FROM families WHERE id = $1")
                .bind(family_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row)
    }

    pub async fn set_customer_id(&self, family_id: Uuid, customer_id: &str) -> BillingResult<()> {
        sqlx::query("UPDATE families SET stripe_customer_id = $2 WHERE id = $1")
            .bind(family_id)
            .bind(customer_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn family_by_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        let id: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM families WHERE stripe_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(id)
    }

    /// Record the provider's view of a subscription
    pub async fn apply_subscription(
        &self,
        family_id: Uuid,
        subscription_id: &str,
        status: SubscriptionStatus,
        current_period_end: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE families
            SET stripe_subscription_id = $2,
                subscription_status = $3,
                subscription_current_period_end = $4
            WHERE id = $1
            "#,
        )
        .bind(family_id)
        .bind(subscription_id)
        .bind(status.as_str())
        .bind(current_period_end)
        .execute(&self.pool)
        .await?;

        tracing::info!(family_id = %family_id, status = %status, "Subscription state updated");
        Ok(())
    }

    pub async fn mark_canceled(&self, family_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE families
            SET subscription_status = 'canceled',
                stripe_subscription_id = NULL,
                subscription_current_period_end = NULL
            WHERE id = $1
            "#,
        )
        .bind(family_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(family_id = %family_id, "Subscription canceled");
        Ok(())
    }

    pub async fn mark_past_due(&self, family_id: Uuid) -> BillingResult<()> {
        sqlx::query("UPDATE families SET subscription_status = 'past_due' WHERE id = $1")
            .bind(family_id)
            .execute(&self.pool)
            .await?;

        tracing::info!(family_id = %family_id, "Subscription marked past due");
        Ok(())
    }
}

#[async_trait]
impl FamilyDirectory for SubscriptionService {
    async fn family_for_user(&self, user_id: Uuid) -> BillingResult<Option<FamilyBilling>> {
        SubscriptionService::family_for_user(self, user_id).await
    }

    async fn child_count(&self, family_id: Uuid) -> BillingResult<i64> {
        SubscriptionService::child_count(self, family_id).await
    }

    async fn create_family(
        &self,
        name: &str,
        owner_id: Uuid,
        trial_ends_at: OffsetDateTime,
    ) -> BillingResult<FamilyBilling> {
        SubscriptionService::create_family(self, name, owner_id, trial_ends_at).await
    }
}
