//! Single-use email verification tokens.
//!
//! The raw token only travels in the outbound mail; stores keep its SHA-256.

use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::debug;

pub fn generate_token() -> anyhow::Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate verification token")?;
    Ok(hex::encode(bytes))
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.trim().as_bytes()))
}

#[async_trait]
pub trait VerificationStore: Send + Sync {
    async fn put(&self, token_hash: &str, user_id: i64, expires_at: OffsetDateTime)
        -> anyhow::Result<()>;
    /// Removes the token and returns its user if it was still live.
    async fn take(&self, token_hash: &str) -> anyhow::Result<Option<i64>>;
}

#[derive(Default)]
pub struct MemoryVerificationStore {
    entries: RwLock<HashMap<String, (i64, OffsetDateTime)>>,
}

impl MemoryVerificationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VerificationStore for MemoryVerificationStore {
    async fn put(
        &self,
        token_hash: &str,
        user_id: i64,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()> {
        let now = OffsetDateTime::now_utc();
        let mut entries = self.entries.write().await;
        entries.retain(|_, (_, exp)| *exp > now);
        entries.insert(token_hash.to_string(), (user_id, expires_at));
        Ok(())
    }

    async fn take(&self, token_hash: &str) -> anyhow::Result<Option<i64>> {
        let now = OffsetDateTime::now_utc();
        let entry = self.entries.write().await.remove(token_hash);
        Ok(entry.and_then(|(user_id, exp)| (exp > now).then_some(user_id)))
    }
}

pub struct PgVerificationStore {
    db: PgPool,
}

impl PgVerificationStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl VerificationStore for PgVerificationStore {
    async fn put(
        &self,
        token_hash: &str,
        user_id: i64,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM email_verifications WHERE expires_at <= now()")
            .execute(&self.db)
            .await
            .context("sweep verification tokens")?;
        sqlx::query(
            r#"
            INSERT INTO email_verifications (token_hash, user_id, expires_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(token_hash)
        .bind(user_id)
        .bind(expires_at)
        .execute(&self.db)
        .await
        .context("store verification token")?;
        Ok(())
    }

    async fn take(&self, token_hash: &str) -> anyhow::Result<Option<i64>> {
        let row = sqlx::query_as::<_, (i64,)>(
            r#"
            DELETE FROM email_verifications
            WHERE token_hash = $1 AND expires_at > now()
            RETURNING user_id
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.db)
        .await
        .context("consume verification token")?;
        Ok(row.map(|(user_id,)| user_id))
    }
}

/// Issues and redeems verification tokens.
#[derive(Clone)]
pub struct VerificationTokens {
    store: Arc<dyn VerificationStore>,
    ttl: Duration,
}

impl VerificationTokens {
    pub fn new(store: Arc<dyn VerificationStore>, ttl_minutes: i64) -> Self {
        Self {
            store,
            ttl: Duration::minutes(ttl_minutes),
        }
    }

    pub async fn issue(&self, user_id: i64) -> anyhow::Result<String> {
        let token = generate_token()?;
        let expires_at = OffsetDateTime::now_utc() + self.ttl;
        self.store.put(&hash_token(&token), user_id, expires_at).await?;
        debug!(user_id, %expires_at, "verification token issued");
        Ok(token)
    }

    pub async fn redeem(&self, token: &str) -> anyhow::Result<Option<i64>> {
        self.store.take(&hash_token(token)).await
    }
}
