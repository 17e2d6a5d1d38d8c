use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, PgPool};
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::repo_types::{Authority, User};

/// Identity snapshot taken at login and attached to the client's session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub authority: Authority,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Ambient request metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl Session {
    pub fn snapshot(user: &User, client: &ClientMeta) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            authority: user.authority.clone(),
            client_ip: client.ip.clone(),
            user_agent: client.user_agent.clone(),
        }
    }
}

/// Opaque client-side key into the session store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(Uuid);

impl SessionHandle {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl FromStr for SessionHandle {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Live session under `handle`; expired entries read as absent.
    async fn get(&self, handle: &SessionHandle) -> anyhow::Result<Option<Session>>;
    async fn set(
        &self,
        handle: &SessionHandle,
        session: &Session,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()>;
    async fn remove(&self, handle: &SessionHandle) -> anyhow::Result<()>;
}

/// Process-local session map. Every write sweeps expired entries.
#[derive(Default)]
pub struct MemorySessionStore {
    entries: RwLock<HashMap<SessionHandle, (Session, OffsetDateTime)>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, handle: &SessionHandle) -> anyhow::Result<Option<Session>> {
        let now = OffsetDateTime::now_utc();
        {
            let entries = self.entries.read().await;
            match entries.get(handle) {
                None => return Ok(None),
                Some((session, expires_at)) if *expires_at > now => {
                    return Ok(Some(session.clone()))
                }
                Some(_) => {}
            }
        }
        self.entries.write().await.remove(handle);
        Ok(None)
    }

    async fn set(
        &self,
        handle: &SessionHandle,
        session: &Session,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()> {
        let now = OffsetDateTime::now_utc();
        let mut entries = self.entries.write().await;
        entries.retain(|_, (_, exp)| *exp > now);
        entries.insert(*handle, (session.clone(), expires_at));
        Ok(())
    }

    async fn remove(&self, handle: &SessionHandle) -> anyhow::Result<()> {
        self.entries.write().await.remove(handle);
        Ok(())
    }
}

pub struct PgSessionStore {
    db: PgPool,
}

impl PgSessionStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn get(&self, handle: &SessionHandle) -> anyhow::Result<Option<Session>> {
        let row = sqlx::query_as::<_, (Json<Session>,)>(
            r#"
            SELECT data
            FROM sessions
            WHERE handle = $1 AND expires_at > now()
            "#,
        )
        .bind(handle.as_uuid())
        .fetch_optional(&self.db)
        .await
        .context("load session")?;
        Ok(row.map(|(Json(session),)| session))
    }

    async fn set(
        &self,
        handle: &SessionHandle,
        session: &Session,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (handle, data, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (handle) DO UPDATE SET data = EXCLUDED.data, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(handle.as_uuid())
        .bind(Json(session))
        .bind(expires_at)
        .execute(&self.db)
        .await
        .context("store session")?;
        Ok(())
    }

    async fn remove(&self, handle: &SessionHandle) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM sessions WHERE handle = $1 OR expires_at <= now()")
            .bind(handle.as_uuid())
            .execute(&self.db)
            .await
            .context("delete session")?;
        Ok(())
    }
}

/// Writes login sessions into the transport store.
#[derive(Clone)]
pub struct SessionIssuer {
    store: Arc<dyn SessionStore>,
    ttl: Duration,
}

impl SessionIssuer {
    pub fn new(store: Arc<dyn SessionStore>, ttl_minutes: i64) -> Self {
        Self {
            store,
            ttl: Duration::minutes(ttl_minutes),
        }
    }

    /// Attaches `session` under a fresh handle. Any previous handle for this
    /// client is revoked so a pre-login handle never becomes authenticated.
    #[instrument(skip_all, fields(user_id = session.id))]
    pub async fn issue(
        &self,
        previous: Option<SessionHandle>,
        session: Session,
    ) -> anyhow::Result<SessionHandle> {
        if let Some(old) = previous {
            self.store.remove(&old).await?;
        }
        let handle = SessionHandle::generate();
        let expires_at = OffsetDateTime::now_utc() + self.ttl;
        self.store.set(&handle, &session, expires_at).await?;
        debug!(%expires_at, "session issued");
        Ok(handle)
    }

    pub async fn load(&self, handle: &SessionHandle) -> anyhow::Result<Option<Session>> {
        self.store.get(handle).await
    }

    pub async fn revoke(&self, handle: &SessionHandle) -> anyhow::Result<()> {
        self.store.remove(handle).await
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
