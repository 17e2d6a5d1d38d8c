use crate::auth::{
    mailer::{EmailDispatcher, LogDispatcher},
    password::PasswordHasher,
    repo::{CredentialStore, MemoryUserBackend, PgUserBackend, UserBackend},
    services::AuthService,
    session::{MemorySessionStore, PgSessionStore, SessionIssuer, SessionStore},
    verification::{
        MemoryVerificationStore, PgVerificationStore, VerificationStore, VerificationTokens,
    },
};
use crate::config::{AppConfig, StoreBackend};
use crate::ids::Snowflake;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub auth: AuthService,
}

/// Persistence seams shared by the auth service.
struct Backends {
    users: Arc<dyn UserBackend>,
    sessions: Arc<dyn SessionStore>,
    tokens: Arc<dyn VerificationStore>,
}

impl Backends {
    fn memory() -> Self {
        Self {
            users: Arc::new(MemoryUserBackend::new()),
            sessions: Arc::new(MemorySessionStore::new()),
            tokens: Arc::new(MemoryVerificationStore::new()),
        }
    }
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let backends = match config.store {
            StoreBackend::Postgres => {
                let db = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(10)
                    .connect(config.database_url()?)
                    .await?;
                sqlx::migrate!("./migrations").run(&db).await?;
                Backends {
                    users: Arc::new(PgUserBackend::new(db.clone())),
                    sessions: Arc::new(PgSessionStore::new(db.clone())),
                    tokens: Arc::new(PgVerificationStore::new(db)),
                }
            }
            StoreBackend::Memory => {
                tracing::warn!("STORE_BACKEND=memory; accounts and sessions are lost on restart");
                Backends::memory()
            }
        };

        let ids = match config.flake_worker_id {
            Some(worker) => Snowflake::new(worker),
            None => Snowflake::from_entropy(),
        };
        info!(store = ?config.store, worker = ids.worker(), "state initialised");

        let auth = Self::build_auth(&config, backends, ids, Arc::new(LogDispatcher))?;
        Ok(Self { config, auth })
    }

    fn build_auth(
        config: &AppConfig,
        backends: Backends,
        ids: Snowflake,
        mailer: Arc<dyn EmailDispatcher>,
    ) -> anyhow::Result<AuthService> {
        let hasher = PasswordHasher::new(&config.hashing)?;
        let store = CredentialStore::new(backends.users, hasher.clone(), Arc::new(ids));
        let issuer = SessionIssuer::new(backends.sessions, config.session.ttl_minutes);
        let tokens = VerificationTokens::new(backends.tokens, config.verify_token_ttl_minutes);
        Ok(AuthService::new(store, hasher, issuer, tokens, mailer))
    }

    /// In-memory state with cheap hashing, for router tests.
    #[cfg(test)]
    pub fn fake() -> Self {
        Self::fake_with_mailer(Arc::new(LogDispatcher))
    }

    #[cfg(test)]
    pub fn fake_with_mailer(mailer: Arc<dyn EmailDispatcher>) -> Self {
        use crate::config::{HashingConfig, SessionConfig};

        let config = Arc::new(AppConfig {
            store: StoreBackend::Memory,
            database_url: None,
            session: SessionConfig {
                cookie_name: "sid".into(),
                ttl_minutes: 5,
                secure_cookie: false,
            },
            hashing: HashingConfig {
                memory_kib: Some(256),
                iterations: Some(1),
                parallelism: Some(1),
            },
            verify_token_ttl_minutes: 5,
            flake_worker_id: Some(1),
        });

        let auth = Self::build_auth(&config, Backends::memory(), Snowflake::new(1), mailer)
            .expect("fake auth service");
        Self { config, auth }
    }
}
