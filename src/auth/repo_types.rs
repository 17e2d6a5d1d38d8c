use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use time::{Date, OffsetDateTime};

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

/// Deterministic robohash avatar for a username.
pub fn default_avatar(username: &str) -> String {
    let digest = Sha256::digest(username.as_bytes());
    format!("https://robohash.org/{}?set=set4", hex::encode(digest))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub avatar: String,
    #[serde(with = "iso_date")]
    pub birthday: Date,
    pub bio: String,
}

/// Coarse privilege marker. The admin token never leaves the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authority {
    pub level: i32,
    #[serde(skip_serializing, default)]
    pub admin_token: Option<String>,
}

/// Public view of an account. Carries no credential material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub profile: Profile,
    pub authority: Authority,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub is_email_verified: bool,
}

/// Stored account, including the Argon2 hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user: User,
    pub password_hash: String,
}

impl UserRecord {
    pub fn into_public(self) -> User {
        self.user
    }
}

/// Whether a pending write carries a new plaintext password.
#[derive(Clone)]
pub enum PasswordField {
    /// Existing hash, persisted as-is.
    Stored(String),
    /// New plaintext; hashed once by `prepare_for_persist`.
    Changed(String),
}

impl std::fmt::Debug for PasswordField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stored(_) => f.write_str("Stored(..)"),
            Self::Changed(_) => f.write_str("Changed(<redacted>)"),
        }
    }
}

/// User fields about to be written, before hashing and timestamps.
#[derive(Debug, Clone)]
pub struct PendingUser {
    /// `None` until the store assigns one on insert.
    pub id: Option<i64>,
    pub username: String,
    pub email: String,
    pub password: PasswordField,
    pub profile: Profile,
    pub authority: Authority,
    pub is_email_verified: bool,
    pub created_at: Option<OffsetDateTime>,
}

impl PendingUser {
    pub fn new(
        username: String,
        email: &str,
        password: String,
        birthday: Date,
        bio: Option<String>,
    ) -> Self {
        let avatar = default_avatar(&username);
        Self {
            id: None,
            username,
            email: email.trim().to_lowercase(),
            password: PasswordField::Changed(password),
            profile: Profile {
                avatar,
                birthday,
                bio: bio.unwrap_or_default(),
            },
            authority: Authority::default(),
            is_email_verified: false,
            created_at: None,
        }
    }

    pub fn with_password(mut self, plain: String) -> Self {
        self.password = PasswordField::Changed(plain);
        self
    }

    pub fn password_changed(&self) -> bool {
        matches!(self.password, PasswordField::Changed(_))
    }
}

impl From<UserRecord> for PendingUser {
    fn from(r: UserRecord) -> Self {
        let UserRecord {
            user,
            password_hash,
        } = r;
        Self {
            id: Some(user.id),
            username: user.username,
            email: user.email,
            password: PasswordField::Stored(password_hash),
            profile: user.profile,
            authority: user.authority,
            is_email_verified: user.is_email_verified,
            created_at: Some(user.created_at),
        }
    }
}

/// Flat `users` row.
#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub avatar: String,
    pub birthday: Date,
    pub bio: String,
    pub authority_level: i32,
    pub admin_token: Option<String>,
    pub is_email_verified: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl From<UserRow> for UserRecord {
    fn from(r: UserRow) -> Self {
        Self {
            user: User {
                id: r.id,
                username: r.username,
                email: r.email,
                profile: Profile {
                    avatar: r.avatar,
                    birthday: r.birthday,
                    bio: r.bio,
                },
                authority: Authority {
                    level: r.authority_level,
                    admin_token: r.admin_token,
                },
                created_at: r.created_at,
                updated_at: r.updated_at,
                is_email_verified: r.is_email_verified,
            },
            password_hash: r.password_hash,
        }
    }
}
