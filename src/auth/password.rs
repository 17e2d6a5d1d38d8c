use anyhow::Context;
use argon2::{
    password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::rngs::OsRng;
use tracing::error;

use crate::config::HashingConfig;

/// Argon2id hashing with a per-call random salt embedded in the PHC output.
#[derive(Clone)]
pub struct PasswordHasher {
    argon2: Argon2<'static>,
    // Hash of a throwaway secret; unknown usernames are verified against it
    // so lookups cost the same whether or not the account exists.
    dummy_hash: String,
}

impl PasswordHasher {
    pub fn new(cfg: &HashingConfig) -> anyhow::Result<Self> {
        let defaults = Params::default();
        let params = Params::new(
            cfg.memory_kib.unwrap_or(defaults.m_cost()),
            cfg.iterations.unwrap_or(defaults.t_cost()),
            cfg.parallelism.unwrap_or(defaults.p_cost()),
            None,
        )
        .map_err(|e| anyhow::anyhow!("invalid argon2 params: {e}"))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut hasher = Self {
            argon2,
            dummy_hash: String::new(),
        };
        hasher.dummy_hash = hasher.hash("mediacatalog-timing-equalizer")?;
        Ok(hasher)
    }

    pub fn hash(&self, plain: &str) -> anyhow::Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(plain.as_bytes(), &salt)
            .map_err(|e| {
                error!(error = %e, "argon2 hash_password error");
                anyhow::anyhow!(e.to_string())
            })?
            .to_string();
        Ok(hash)
    }

    pub fn verify(&self, hash: &str, plain: &str) -> anyhow::Result<bool> {
        let parsed = PasswordHash::new(hash).map_err(|e| {
            error!(error = %e, "argon2 parse hash error");
            anyhow::anyhow!(e.to_string())
        })?;
        Ok(self
            .argon2
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok())
    }

    /// Runs [`hash`](Self::hash) on the blocking pool.
    pub async fn hash_blocking(&self, plain: String) -> anyhow::Result<String> {
        let hasher = self.clone();
        tokio::task::spawn_blocking(move || hasher.hash(&plain))
            .await
            .context("password hashing task failed")?
    }

    /// Runs [`verify`](Self::verify) on the blocking pool.
    pub async fn verify_blocking(&self, hash: String, plain: String) -> anyhow::Result<bool> {
        let hasher = self.clone();
        tokio::task::spawn_blocking(move || hasher.verify(&hash, &plain))
            .await
            .context("password verification task failed")?
    }

    /// Burns one verification worth of work. Always returns `false`.
    pub async fn verify_dummy(&self, plain: String) -> anyhow::Result<bool> {
        self.verify_blocking(self.dummy_hash.clone(), plain).await?;
        Ok(false)
    }
}

#[cfg(test)]
pub(crate) fn test_hasher() -> PasswordHasher {
    // Minimal cost keeps the suite fast; production uses the configured params.
    PasswordHasher::new(&HashingConfig {
        memory_kib: Some(256),
        iterations: Some(1),
        parallelism: Some(1),
    })
    .expect("test hasher")
}
