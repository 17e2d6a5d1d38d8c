use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "pg" => Ok(Self::Postgres),
            "memory" | "mem" => Ok(Self::Memory),
            other => anyhow::bail!("unknown STORE_BACKEND `{other}`"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub cookie_name: String,
    pub ttl_minutes: i64,
    pub secure_cookie: bool,
}

/// Argon2 cost parameters; `None` keeps the argon2 crate default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HashingConfig {
    pub memory_kib: Option<u32>,
    pub iterations: Option<u32>,
    pub parallelism: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub store: StoreBackend,
    pub database_url: Option<String>,
    pub session: SessionConfig,
    pub hashing: HashingConfig,
    pub verify_token_ttl_minutes: i64,
    pub flake_worker_id: Option<u16>,
}

fn parse_var<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {name}: {e}")),
        _ => Ok(None),
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let store = parse_var::<StoreBackend>("STORE_BACKEND")?.unwrap_or(StoreBackend::Postgres);
        let database_url = std::env::var("DATABASE_URL").ok();
        if store == StoreBackend::Postgres && database_url.is_none() {
            anyhow::bail!("DATABASE_URL is required when STORE_BACKEND=postgres");
        }

        let session = SessionConfig {
            cookie_name: std::env::var("SESSION_COOKIE_NAME").unwrap_or_else(|_| "sid".into()),
            ttl_minutes: parse_var::<i64>("SESSION_TTL_MINUTES")?.unwrap_or(60 * 24 * 7),
            secure_cookie: parse_var::<bool>("SESSION_COOKIE_SECURE")?.unwrap_or(false),
        };
        if session.ttl_minutes <= 0 {
            anyhow::bail!("SESSION_TTL_MINUTES must be positive");
        }

        let verify_token_ttl_minutes =
            parse_var::<i64>("VERIFY_TOKEN_TTL_MINUTES")?.unwrap_or(60 * 24);
        if verify_token_ttl_minutes <= 0 {
            anyhow::bail!("VERIFY_TOKEN_TTL_MINUTES must be positive");
        }

        let hashing = HashingConfig {
            memory_kib: parse_var("ARGON2_MEMORY_KIB")?,
            iterations: parse_var("ARGON2_ITERATIONS")?,
            parallelism: parse_var("ARGON2_PARALLELISM")?,
        };

        let flake_worker_id = parse_var::<u16>("FLAKE_WORKER_ID")?;
        if let Some(worker) = flake_worker_id {
            if u64::from(worker) > crate::ids::WORKER_MASK {
                anyhow::bail!("FLAKE_WORKER_ID must be in 0..=4095");
            }
        }

        Ok(Self {
            store,
            database_url,
            session,
            hashing,
            verify_token_ttl_minutes,
            flake_worker_id,
        })
    }

    pub fn database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL is not configured")
    }
}
