use std::{collections::HashMap, fmt, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use super::password::PasswordHasher;
use super::repo_types::{PasswordField, PendingUser, User, UserRecord, UserRow};
use crate::ids::IdGenerator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UniqueField {
    Id,
    Username,
    Email,
}

impl UniqueField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Username => "username",
            Self::Email => "email",
        }
    }

    fn from_constraint(name: &str) -> Option<Self> {
        match name {
            "users_pkey" => Some(Self::Id),
            "users_username_key" => Some(Self::Username),
            "users_email_key" => Some(Self::Email),
            _ => None,
        }
    }
}

impl fmt::Display for UniqueField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key on `{0}`")]
    DuplicateKey(UniqueField),
    #[error("user not found")]
    Missing,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Raw persistence of fully prepared user rows. Implementations enforce
/// uniqueness of id, username and email atomically.
#[async_trait]
pub trait UserBackend: Send + Sync {
    async fn insert(&self, record: UserRecord) -> Result<UserRecord, StoreError>;
    async fn update(&self, record: UserRecord) -> Result<UserRecord, StoreError>;
    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError>;
    async fn find_by_id(&self, id: i64) -> Result<Option<UserRecord>, StoreError>;
}

/// Turns a pending user into a row ready to write.
///
/// The password is hashed only when it carries [`PasswordField::Changed`];
/// `updated_at` is refreshed on every call.
pub async fn prepare_for_persist(
    hasher: &PasswordHasher,
    id: i64,
    pending: PendingUser,
) -> anyhow::Result<UserRecord> {
    let now = OffsetDateTime::now_utc();
    let password_hash = match pending.password {
        PasswordField::Stored(hash) => hash,
        PasswordField::Changed(plain) => {
            debug!(user_id = id, "hashing new password");
            hasher.hash_blocking(plain).await?
        }
    };

    Ok(UserRecord {
        user: User {
            id,
            username: pending.username,
            email: pending.email.trim().to_lowercase(),
            profile: pending.profile,
            authority: pending.authority,
            created_at: pending.created_at.unwrap_or(now),
            updated_at: now,
            is_email_verified: pending.is_email_verified,
        },
        password_hash,
    })
}

#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn UserBackend>,
    hasher: PasswordHasher,
    ids: Arc<dyn IdGenerator>,
}

impl CredentialStore {
    pub fn new(
        backend: Arc<dyn UserBackend>,
        hasher: PasswordHasher,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            backend,
            hasher,
            ids,
        }
    }

    /// Persist a new account; the id comes from the id generator.
    #[instrument(skip_all, fields(username = %pending.username))]
    pub async fn insert(&self, pending: PendingUser) -> Result<UserRecord, StoreError> {
        let id = self.ids.next_id().context("generate user id")?;
        let record = prepare_for_persist(&self.hasher, id, pending).await?;
        self.backend.insert(record).await
    }

    /// Persist changes to an existing account.
    #[instrument(skip_all, fields(user_id = ?pending.id, password_changed = pending.password_changed()))]
    pub async fn update(&self, pending: PendingUser) -> Result<UserRecord, StoreError> {
        let id = pending.id.ok_or(StoreError::Missing)?;
        let record = prepare_for_persist(&self.hasher, id, pending).await?;
        self.backend.update(record).await
    }

    pub async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        self.backend.find_by_username(username).await
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<UserRecord>, StoreError> {
        self.backend.find_by_id(id).await
    }
}

// ---- Postgres ----

const USER_COLUMNS: &str = "id, username, email, password_hash, avatar, birthday, bio, \
     authority_level, admin_token, is_email_verified, created_at, updated_at";

fn map_db_error(err: sqlx::Error, what: &'static str) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().is_some_and(|code| code.as_ref() == "23505") {
            if let Some(field) = db_err.constraint().and_then(UniqueField::from_constraint) {
                return StoreError::DuplicateKey(field);
            }
        }
    }
    StoreError::Other(anyhow::Error::new(err).context(what))
}

pub struct PgUserBackend {
    db: PgPool,
}

impl PgUserBackend {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserBackend for PgUserBackend {
    async fn insert(&self, record: UserRecord) -> Result<UserRecord, StoreError> {
        let u = &record.user;
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            INSERT INTO users (id, username, email, password_hash, avatar, birthday, bio,
                               authority_level, admin_token, is_email_verified, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(u.id)
        .bind(&u.username)
        .bind(&u.email)
        .bind(&record.password_hash)
        .bind(&u.profile.avatar)
        .bind(u.profile.birthday)
        .bind(&u.profile.bio)
        .bind(u.authority.level)
        .bind(&u.authority.admin_token)
        .bind(u.is_email_verified)
        .bind(u.created_at)
        .bind(u.updated_at)
        .fetch_one(&self.db)
        .await
        .map_err(|e| map_db_error(e, "insert user"))?;
        Ok(row.into())
    }

    async fn update(&self, record: UserRecord) -> Result<UserRecord, StoreError> {
        let u = &record.user;
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            UPDATE users
               SET username = $2, email = $3, password_hash = $4, avatar = $5, birthday = $6,
                   bio = $7, authority_level = $8, admin_token = $9, is_email_verified = $10,
                   updated_at = $11
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(u.id)
        .bind(&u.username)
        .bind(&u.email)
        .bind(&record.password_hash)
        .bind(&u.profile.avatar)
        .bind(u.profile.birthday)
        .bind(&u.profile.bio)
        .bind(u.authority.level)
        .bind(&u.authority.admin_token)
        .bind(u.is_email_verified)
        .bind(u.updated_at)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| map_db_error(e, "update user"))?;
        row.map(Into::into).ok_or(StoreError::Missing)
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
        ))
        .bind(username)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| map_db_error(e, "find user by username"))?;
        Ok(row.map(Into::into))
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<UserRecord>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| map_db_error(e, "find user by id"))?;
        Ok(row.map(Into::into))
    }
}

// ---- in-memory ----

/// Process-local backend. Uniqueness is checked and the row written under a
/// single write lock.
#[derive(Default)]
pub struct MemoryUserBackend {
    rows: RwLock<HashMap<i64, UserRecord>>,
}

impl MemoryUserBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn conflict(
        rows: &HashMap<i64, UserRecord>,
        record: &UserRecord,
        skip_id: Option<i64>,
    ) -> Option<UniqueField> {
        let others: Vec<&UserRecord> = rows
            .values()
            .filter(|r| Some(r.user.id) != skip_id)
            .collect();
        if others.iter().any(|r| r.user.username == record.user.username) {
            return Some(UniqueField::Username);
        }
        if others.iter().any(|r| r.user.email == record.user.email) {
            return Some(UniqueField::Email);
        }
        None
    }
}

#[async_trait]
impl UserBackend for MemoryUserBackend {
    async fn insert(&self, record: UserRecord) -> Result<UserRecord, StoreError> {
        let mut rows = self.rows.write().await;
        if let Some(field) = Self::conflict(&rows, &record, None) {
            return Err(StoreError::DuplicateKey(field));
        }
        if rows.contains_key(&record.user.id) {
            return Err(StoreError::DuplicateKey(UniqueField::Id));
        }
        rows.insert(record.user.id, record.clone());
        Ok(record)
    }

    async fn update(&self, record: UserRecord) -> Result<UserRecord, StoreError> {
        let mut rows = self.rows.write().await;
        if !rows.contains_key(&record.user.id) {
            return Err(StoreError::Missing);
        }
        if let Some(field) = Self::conflict(&rows, &record, Some(record.user.id)) {
            return Err(StoreError::DuplicateKey(field));
        }
        let mut record = record;
        if let Some(existing) = rows.get(&record.user.id) {
            record.user.created_at = existing.user.created_at;
        }
        rows.insert(record.user.id, record.clone());
        Ok(record)
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows.values().find(|r| r.user.username == username).cloned())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.rows.read().await.get(&id).cloned())
    }
}

#[cfg(test)]
impl MemoryUserBackend {
    /// Removes a row out-of-band, as an administrator would.
    pub(crate) async fn delete(&self, id: i64) {
        self.rows.write().await.remove(&id);
    }
}
