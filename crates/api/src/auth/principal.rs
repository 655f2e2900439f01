//! Principals (users) and their persistence

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Parent,
    Kid,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Parent => "parent",
            Role::Kid => "kid",
        }
    }

    /// Parents and admins manage the family
    pub fn is_guardian(&self) -> bool {
        matches!(self, Role::Admin | Role::Parent)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "parent" => Ok(Role::Parent),
            "kid" => Ok(Role::Kid),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// An authenticated actor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub role: Role,
    pub is_active: bool,
    /// Identity-provider subject this principal is linked to
    #[serde(skip_serializing)]
    pub external_id: Option<String>,
}

/// Stored credential hashes. Never serialized.
#[derive(Debug, Clone)]
pub struct StoredCredentials {
    pub password_hash: String,
    pub pin_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewPrincipal {
    pub username: String,
    pub display_name: String,
    pub password_hash: String,
    pub role: Role,
    pub external_id: Option<String>,
}

/// Principal persistence used by the auth providers and routes
#[async_trait]
pub trait PrincipalStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Principal>, sqlx::Error>;

    async fn find_by_username(&self, username: &str) -> Result<Option<Principal>, sqlx::Error>;

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Principal>, sqlx::Error>;

    async fn credentials(&self, id: Uuid) -> Result<Option<StoredCredentials>, sqlx::Error>;

    /// Insert a principal. Returns `None` when the username or external id is
    /// already taken, so concurrent provisioning can fall back to a lookup.
    async fn create(&self, new: NewPrincipal) -> Result<Option<Principal>, sqlx::Error>;

    /// Point an unlinked principal at an external identity. Returns `None`
    /// when the principal is missing or already linked to an identity.
    async fn link_external(
        &self,
        id: Uuid,
        external_id: &str,
        display_name: &str,
    ) -> Result<Option<Principal>, sqlx::Error>;
}

#[derive(Debug, FromRow)]
struct PrincipalRow {
    id: Uuid,
    username: String,
    display_name: String,
    role: String,
    is_active: bool,
    external_id: Option<String>,
}

impl PrincipalRow {
    fn into_principal(self) -> Result<Principal, sqlx::Error> {
        let role = self
            .role
            .parse()
            .map_err(|e: String| sqlx::Error::Decode(e.into()))?;
        Ok(Principal {
            id: self.id,
            username: self.username,
            display_name: self.display_name,
            role,
            is_active: self.is_active,
            external_id: self.external_id,
        })
    }
}

const PRINCIPAL_COLUMNS: &str = "id, username, display_name, role, is_active, external_id";

#[derive(Clone)]
pub struct PgPrincipalStore {
    pool: PgPool,
}

impl PgPrincipalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn select_where(column: &str) -> String {
        format!("SELECT {} FROM users WHERE {} = $1", PRINCIPAL_COLUMNS, column)
    }
}

#[async_trait]
impl PrincipalStore for PgPrincipalStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Principal>, sqlx::Error> {
        let sql = Self::select_where("id");
        let row: Option<PrincipalRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(PrincipalRow::into_principal).transpose()
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Principal>, sqlx::Error> {
        let sql = Self::select_where("username");
        let row: Option<PrincipalRow> = sqlx::query_as(&sql)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        row.map(PrincipalRow::into_principal).transpose()
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Principal>, sqlx::Error> {
        let sql = Self::select_where("external_id");
        let row: Option<PrincipalRow> = sqlx::query_as(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(PrincipalRow::into_principal).transpose()
    }

    async fn credentials(&self, id: Uuid) -> Result<Option<StoredCredentials>, sqlx::Error> {
        let row: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT password_hash, pin_hash FROM users WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(password_hash, pin_hash)| StoredCredentials {
            password_hash,
            pin_hash,
        }))
    }

    async fn create(&self, new: NewPrincipal) -> Result<Option<Principal>, sqlx::Error> {
        let sql = format!(
            r#"
            INSERT INTO users (id, username, display_name, password_hash, role, is_active, external_id)
            VALUES ($1, $2, $3, $4, $5, TRUE, $6)
            ON CONFLICT DO NOTHING
            RETURNING {}
            "#,
            PRINCIPAL_COLUMNS
        );
        let row: Option<PrincipalRow> = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(&new.username)
            .bind(&new.display_name)
            .bind(&new.password_hash)
            .bind(new.role.as_str())
            .bind(&new.external_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(PrincipalRow::into_principal).transpose()
    }

    async fn link_external(
        &self,
        id: Uuid,
        external_id: &str,
        display_name: &str,
    ) -> Result<Option<Principal>, sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE users
            SET external_id = $2, display_name = $3, updated_at = NOW()
            WHERE id = $1 AND external_id IS NULL
            RETURNING {}
            "#,
            PRINCIPAL_COLUMNS
        );
        let row: Option<PrincipalRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(external_id)
            .bind(display_name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(PrincipalRow::into_principal).transpose()
    }
}
