//! Data Access Layer
//!
//! PostgreSQL-backed session storage. It uses `sqlx` connection pooling and
//! embedded migrations. Each call is one row in `call_sessions`, and a write
//! replaces the row's whole conversation in a single upsert.

use anyhow::Result;
use async_trait::async_trait;
use callrelay_core::transcript::Turn;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::store::{SessionStore, StoreError};

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Creates a new `Db` instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Deletes rows whose expiry has passed. Reads already ignore them; this
    /// only reclaims space.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM call_sessions WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SessionStore for Db {
    async fn load(&self, call_id: &str) -> Result<Option<Vec<Turn>>, StoreError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            "SELECT conversation FROM call_sessions WHERE call_sid = $1 AND expires_at > now()",
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((conversation,)) => Ok(Some(serde_json::from_value(conversation)?)),
            None => Ok(None),
        }
    }

    async fn save(
        &self,
        call_id: &str,
        turns: &[Turn],
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conversation = serde_json::to_value(turns)?;
        sqlx::query(
            r#"
            INSERT INTO call_sessions (call_sid, conversation, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (call_sid) DO UPDATE
            SET conversation = EXCLUDED.conversation,
                expires_at = EXCLUDED.expires_at,
                updated_at = now()
            "#,
        )
        .bind(call_id)
        .bind(conversation)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
