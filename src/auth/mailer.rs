use async_trait::async_trait;
use tracing::{debug, info};

use super::repo_types::User;

/// Hands a freshly registered account and its raw verification token to the
/// mail pipeline.
#[async_trait]
pub trait EmailDispatcher: Send + Sync {
    async fn send(&self, user: &User, token: &str) -> anyhow::Result<()>;
}

/// Logs the dispatch. Stands in until an outbound mail transport is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDispatcher;

#[async_trait]
impl EmailDispatcher for LogDispatcher {
    async fn send(&self, user: &User, token: &str) -> anyhow::Result<()> {
        info!(user_id = user.id, email = %user.email, "verification email queued");
        debug!(user_id = user.id, token, "verification token for POST /auth/verify-email");
        Ok(())
    }
}
