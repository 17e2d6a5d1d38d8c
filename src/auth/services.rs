use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use super::{
    dto::{ChangePasswordRequest, LoginRequest, RegisterRequest, VerifyEmailRequest},
    errors::{AuthError, UserIdentity},
    mailer::EmailDispatcher,
    password::PasswordHasher,
    repo::{CredentialStore, StoreError},
    repo_types::{PendingUser, User},
    schema::{validate, NEW_PASSWORD_RULE, VERIFY_TOKEN_RULE},
    session::{ClientMeta, Session, SessionHandle, SessionIssuer},
    verification::VerificationTokens,
};

/// Everything an operation may know about the calling client. Built once per
/// request and never mutated.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub client: ClientMeta,
    pub handle: Option<SessionHandle>,
    pub session: Option<Session>,
}

impl RequestContext {
    fn require_session(&self) -> Result<&Session, AuthError> {
        self.session.as_ref().ok_or(AuthError::InvalidSession)
    }
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub user: User,
    pub handle: SessionHandle,
}

#[derive(Clone)]
pub struct AuthService {
    store: CredentialStore,
    hasher: PasswordHasher,
    sessions: SessionIssuer,
    tokens: VerificationTokens,
    mailer: Arc<dyn EmailDispatcher>,
}

impl AuthService {
    pub fn new(
        store: CredentialStore,
        hasher: PasswordHasher,
        sessions: SessionIssuer,
        tokens: VerificationTokens,
        mailer: Arc<dyn EmailDispatcher>,
    ) -> Self {
        Self {
            store,
            hasher,
            sessions,
            tokens,
            mailer,
        }
    }

    pub fn sessions(&self) -> &SessionIssuer {
        &self.sessions
    }

    #[instrument(skip_all)]
    pub async fn register(&self, req: RegisterRequest) -> Result<User, AuthError> {
        let input = req.into_input().map_err(|errors| {
            warn!(count = errors.len(), "registration rejected by validation");
            AuthError::ValidationFailed(errors)
        })?;

        let pending = PendingUser::new(
            input.username,
            &input.email,
            input.password,
            input.birthday,
            input.bio,
        );

        // Any insert failure ends here; verification mail only goes out for
        // rows that were written.
        let user = match self.store.insert(pending).await {
            Ok(record) => record.into_public(),
            Err(StoreError::DuplicateKey(field)) => {
                warn!(%field, "account already exists");
                return Err(AuthError::from(StoreError::DuplicateKey(field)));
            }
            Err(e) => {
                error!(error = %e, "create user failed");
                return Err(e.into());
            }
        };

        info!(user_id = user.id, username = %user.username, "user registered");
        self.dispatch_verification(user.clone());
        Ok(user)
    }

    fn dispatch_verification(&self, user: User) {
        let tokens = self.tokens.clone();
        let mailer = Arc::clone(&self.mailer);
        tokio::spawn(async move {
            let sent = match tokens.issue(user.id).await {
                Ok(token) => mailer.send(&user, &token).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!(error = %e, user_id = user.id, "verification email dispatch failed");
            }
        });
    }

    #[instrument(skip_all, fields(username = %req.username))]
    pub async fn login(
        &self,
        ctx: &RequestContext,
        req: LoginRequest,
    ) -> Result<LoginOutcome, AuthError> {
        let Some(record) = self.store.find_by_username(&req.username).await? else {
            self.hasher.verify_dummy(req.password).await?;
            warn!("login unknown username");
            return Err(AuthError::LoginFailed);
        };

        let ok = self
            .hasher
            .verify_blocking(record.password_hash.clone(), req.password)
            .await?;
        if !ok {
            warn!(user_id = record.user.id, "login invalid password");
            return Err(AuthError::LoginFailed);
        }

        let user = record.into_public();
        if !user.is_email_verified {
            info!(user_id = user.id, "login blocked: email not verified");
            return Err(AuthError::EmailNotVerified(UserIdentity {
                id: user.id,
                username: user.username,
                email: user.email,
            }));
        }

        let session = Session::snapshot(&user, &ctx.client);
        let handle = self.sessions.issue(ctx.handle, session).await?;

        info!(user_id = user.id, "user logged in");
        Ok(LoginOutcome { user, handle })
    }

    #[instrument(skip_all)]
    pub async fn me(&self, ctx: &RequestContext) -> Result<User, AuthError> {
        let session = ctx.require_session()?;
        match self.store.find_by_id(session.id).await? {
            Some(record) => Ok(record.into_public()),
            None => {
                warn!(user_id = session.id, "session refers to a missing user");
                Err(AuthError::UserDoesNotExist)
            }
        }
    }

    #[instrument(skip_all)]
    pub async fn logout(&self, ctx: &RequestContext) -> Result<(), AuthError> {
        let session = ctx.require_session()?;
        let handle = ctx.handle.ok_or(AuthError::InvalidSession)?;
        self.sessions.revoke(&handle).await?;
        info!(user_id = session.id, "user logged out");
        Ok(())
    }

    #[instrument(skip_all)]
    pub async fn change_password(
        &self,
        ctx: &RequestContext,
        req: ChangePasswordRequest,
    ) -> Result<(), AuthError> {
        let session = ctx.require_session()?;
        let record = self
            .store
            .find_by_id(session.id)
            .await?
            .ok_or(AuthError::UserDoesNotExist)?;

        let errors = validate(&[NEW_PASSWORD_RULE], &req);
        if !errors.is_empty() {
            return Err(AuthError::ValidationFailed(errors));
        }

        let ok = self
            .hasher
            .verify_blocking(record.password_hash.clone(), req.current_password)
            .await?;
        if !ok {
            warn!(user_id = record.user.id, "password change with wrong current password");
            return Err(AuthError::LoginFailed);
        }

        let user_id = record.user.id;
        self.store
            .update(PendingUser::from(record).with_password(req.new_password))
            .await?;
        info!(user_id, "password changed");
        Ok(())
    }

    /// Redeems a token from a verification mail and marks its account verified.
    #[instrument(skip_all)]
    pub async fn verify_email(&self, req: VerifyEmailRequest) -> Result<User, AuthError> {
        let errors = validate(&[VERIFY_TOKEN_RULE], &req);
        if !errors.is_empty() {
            return Err(AuthError::ValidationFailed(errors));
        }

        let Some(user_id) = self.tokens.redeem(&req.token).await? else {
            warn!("unknown or expired verification token");
            return Err(AuthError::InvalidVerificationToken);
        };
        self.confirm_email_verified(user_id).await
    }

    /// Applies the email-verification event for `user_id`. Idempotent.
    #[instrument(skip(self))]
    pub async fn confirm_email_verified(&self, user_id: i64) -> Result<User, AuthError> {
        let record = self
            .store
            .find_by_id(user_id)
            .await?
            .ok_or(AuthError::UserDoesNotExist)?;
        if record.user.is_email_verified {
            return Ok(record.into_public());
        }

        let mut pending = PendingUser::from(record);
        pending.is_email_verified = true;
        let record = self.store.update(pending).await?;
        info!(user_id, "email verified");
        Ok(record.into_public())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::mailer::testing::{ChannelDispatcher, FailingDispatcher};
    use crate::auth::password::test_hasher;
    use crate::auth::repo::{MemoryUserBackend, UniqueField, UserBackend};
    use crate::auth::session::MemorySessionStore;
    use crate::auth::verification::MemoryVerificationStore;
    use crate::ids::Snowflake;
    use async_trait::async_trait;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        service: AuthService,
        backend: Arc<MemoryUserBackend>,
        mail: UnboundedReceiver<(User, String)>,
    }

    fn harness() -> Harness {
        let backend = Arc::new(MemoryUserBackend::new());
        let (mailer, mail) = ChannelDispatcher::new();
        let service = service_with(backend.clone(), Arc::new(mailer));
        Harness {
            service,
            backend,
            mail,
        }
    }

    fn service_with(backend: Arc<dyn UserBackend>, mailer: Arc<dyn EmailDispatcher>) -> AuthService {
        let hasher = test_hasher();
        let store = CredentialStore::new(backend, hasher.clone(), Arc::new(Snowflake::new(3)));
        let sessions = SessionIssuer::new(Arc::new(MemorySessionStore::new()), 60);
        let tokens = VerificationTokens::new(Arc::new(MemoryVerificationStore::new()), 60);
        AuthService::new(store, hasher, sessions, tokens, mailer)
    }

    fn register_req(username: &str, email: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            username: username.into(),
            email: email.into(),
            password: password.into(),
            birthday: "2000-01-01".into(),
            bio: None,
        }
    }

    fn login_req(username: &str, password: &str) -> LoginRequest {
        LoginRequest {
            username: username.into(),
            password: password.into(),
        }
    }

    fn client() -> RequestContext {
        RequestContext {
            client: ClientMeta {
                ip: Some("203.0.113.9".into()),
                user_agent: Some("test-agent/1.0".into()),
            },
            handle: None,
            session: None,
        }
    }

    async fn signed_in(service: &AuthService, outcome: &LoginOutcome) -> RequestContext {
        let session = service
            .sessions()
            .load(&outcome.handle)
            .await
            .expect("load")
            .expect("session present");
        RequestContext {
            handle: Some(outcome.handle),
            session: Some(session),
            ..client()
        }
    }

    #[tokio::test]
    async fn register_creates_unverified_user_and_dispatches_mail() {
        let mut h = harness();
        let user = h
            .service
            .register(register_req("alice", "Alice@Example.com", "Secret123"))
            .await
            .expect("register");

        assert_eq!(user.username, "alice");
        assert_eq!(user.email, "alice@example.com");
        assert!(!user.is_email_verified);
        assert_eq!(user.authority.level, 0);
        let json = serde_json::to_string(&user).expect("json");
        assert!(!json.to_lowercase().contains("password"));

        let record = h.backend.find_by_id(user.id).await.expect("find").expect("row");
        assert_ne!(record.password_hash, "Secret123");
        assert!(test_hasher()
            .verify(&record.password_hash, "Secret123")
            .expect("verify"));

        let (mailed, token) = h.mail.recv().await.expect("verification dispatched");
        assert_eq!(mailed.id, user.id);
        assert!(!token.is_empty());
    }

    #[tokio::test]
    async fn register_reports_every_invalid_field() {
        let h = harness();
        let mut req = register_req("", "nope", "");
        req.birthday = String::new();
        match h.service.register(req).await {
            Err(AuthError::ValidationFailed(errors)) => {
                let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
                assert_eq!(fields, vec!["username", "email", "password", "birthday"]);
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_username_and_email_are_attributed() {
        let mut h = harness();
        h.service
            .register(register_req("alice", "alice@example.com", "Secret123"))
            .await
            .expect("register");
        h.mail.recv().await.expect("first mail");

        let err = h
            .service
            .register(register_req("alice", "bob@example.com", "X"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AccountAlreadyExists(UniqueField::Username)));

        let err = h
            .service
            .register(register_req("bob", "alice@example.com", "X"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AccountAlreadyExists(UniqueField::Email)));

        assert!(h.mail.try_recv().is_err(), "no mail for rejected accounts");
    }

    struct BrokenBackend;

    #[async_trait]
    impl UserBackend for BrokenBackend {
        async fn insert(
            &self,
            _record: crate::auth::repo_types::UserRecord,
        ) -> Result<crate::auth::repo_types::UserRecord, StoreError> {
            Err(StoreError::Other(anyhow::anyhow!("connection reset")))
        }
        async fn update(
            &self,
            _record: crate::auth::repo_types::UserRecord,
        ) -> Result<crate::auth::repo_types::UserRecord, StoreError> {
            Err(StoreError::Other(anyhow::anyhow!("connection reset")))
        }
        async fn find_by_username(
            &self,
            _username: &str,
        ) -> Result<Option<crate::auth::repo_types::UserRecord>, StoreError> {
            Err(StoreError::Other(anyhow::anyhow!("connection reset")))
        }
        async fn find_by_id(
            &self,
            _id: i64,
        ) -> Result<Option<crate::auth::repo_types::UserRecord>, StoreError> {
            Err(StoreError::Other(anyhow::anyhow!("connection reset")))
        }
    }

    #[tokio::test]
    async fn register_fails_closed_on_store_failure() {
        let (mailer, mut mail) = ChannelDispatcher::new();
        let service = service_with(Arc::new(BrokenBackend), Arc::new(mailer));
        let err = service
            .register(register_req("alice", "alice@example.com", "Secret123"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Internal(_)));
        assert!(mail.try_recv().is_err());
    }

    #[tokio::test]
    async fn store_failures_during_login_are_internal() {
        let service = service_with(Arc::new(BrokenBackend), Arc::new(FailingDispatcher));
        let err = service
            .login(&client(), login_req("alice", "Secret123"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Internal(_)));
    }

    #[tokio::test]
    async fn dispatch_failure_does_not_fail_registration() {
        let service = service_with(Arc::new(MemoryUserBackend::new()), Arc::new(FailingDispatcher));
        service
            .register(register_req("alice", "alice@example.com", "Secret123"))
            .await
            .expect("registration succeeds even if mail fails");
    }

    #[tokio::test]
    async fn login_failures_are_undifferentiated() {
        let h = harness();
        h.service
            .register(register_req("alice", "alice@example.com", "Secret123"))
            .await
            .expect("register");

        for (username, password) in [("alice", "wrong"), ("nobody", "Secret123"), ("", "")] {
            let err = h
                .service
                .login(&client(), login_req(username, password))
                .await
                .unwrap_err();
            assert!(matches!(err, AuthError::LoginFailed), "{username}: {err:?}");
        }
    }

    #[tokio::test]
    async fn unverified_account_is_gated_after_correct_credentials() {
        let h = harness();
        let user = h
            .service
            .register(register_req("alice", "alice@example.com", "Secret123"))
            .await
            .expect("register");

        match h.service.login(&client(), login_req("alice", "Secret123")).await {
            Err(AuthError::EmailNotVerified(identity)) => {
                assert_eq!(
                    identity,
                    UserIdentity {
                        id: user.id,
                        username: "alice".into(),
                        email: "alice@example.com".into(),
                    }
                );
            }
            other => panic!("expected EmailNotVerified, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn verified_login_attaches_session_snapshot() {
        let h = harness();
        let user = h
            .service
            .register(register_req("alice", "alice@example.com", "Secret123"))
            .await
            .expect("register");
        let record_before = h.backend.find_by_id(user.id).await.expect("find").expect("row");

        let verified = h.service.confirm_email_verified(user.id).await.expect("verify");
        assert!(verified.is_email_verified);
        let record_after = h.backend.find_by_id(user.id).await.expect("find").expect("row");
        assert_eq!(record_after.password_hash, record_before.password_hash);

        let outcome = h
            .service
            .login(&client(), login_req("alice", "Secret123"))
            .await
            .expect("login");
        assert_eq!(outcome.user.id, user.id);

        let session = h
            .service
            .sessions()
            .load(&outcome.handle)
            .await
            .expect("load")
            .expect("session");
        assert_eq!(session.id, user.id);
        assert_eq!(session.username, "alice");
        assert_eq!(session.email, "alice@example.com");
        assert_eq!(session.authority.level, 0);
        assert_eq!(session.client_ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(session.user_agent.as_deref(), Some("test-agent/1.0"));
    }

    #[tokio::test]
    async fn login_rotates_existing_handle() {
        let h = harness();
        let user = h
            .service
            .register(register_req("alice", "alice@example.com", "Secret123"))
            .await
            .expect("register");
        h.service.confirm_email_verified(user.id).await.expect("verify");

        let first = h
            .service
            .login(&client(), login_req("alice", "Secret123"))
            .await
            .expect("login");
        let ctx = signed_in(&h.service, &first).await;
        let second = h
            .service
            .login(&ctx, login_req("alice", "Secret123"))
            .await
            .expect("login");
        assert_ne!(first.handle, second.handle);
        assert!(h.service.sessions().load(&first.handle).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn me_requires_session_and_returns_fresh_record() {
        let h = harness();
        let err = h.service.me(&client()).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidSession));

        let user = h
            .service
            .register(register_req("alice", "alice@example.com", "Secret123"))
            .await
            .expect("register");
        h.service.confirm_email_verified(user.id).await.expect("verify");
        let outcome = h
            .service
            .login(&client(), login_req("alice", "Secret123"))
            .await
            .expect("login");
        let ctx = signed_in(&h.service, &outcome).await;

        // Authority changes after login show up in `me`, not in the snapshot.
        let mut record = h.backend.find_by_id(user.id).await.expect("find").expect("row");
        record.user.authority.level = 5;
        h.backend.update(record).await.expect("update");

        let me = h.service.me(&ctx).await.expect("me");
        assert_eq!(me.id, ctx.session.as_ref().map(|s| s.id).unwrap_or_default());
        assert_eq!(me.username, "alice");
        assert_eq!(me.email, "alice@example.com");
        assert_eq!(me.authority.level, 5);
        assert_eq!(ctx.session.as_ref().map(|s| s.authority.level), Some(0));
    }

    #[tokio::test]
    async fn me_for_deleted_user_fails() {
        let h = harness();
        let user = h
            .service
            .register(register_req("alice", "alice@example.com", "Secret123"))
            .await
            .expect("register");
        h.service.confirm_email_verified(user.id).await.expect("verify");
        let outcome = h
            .service
            .login(&client(), login_req("alice", "Secret123"))
            .await
            .expect("login");
        let ctx = signed_in(&h.service, &outcome).await;

        h.backend.delete(user.id).await;
        let err = h.service.me(&ctx).await.unwrap_err();
        assert!(matches!(err, AuthError::UserDoesNotExist));
    }

    #[tokio::test]
    async fn logout_revokes_session() {
        let h = harness();
        assert!(matches!(
            h.service.logout(&client()).await.unwrap_err(),
            AuthError::InvalidSession
        ));

        let user = h
            .service
            .register(register_req("alice", "alice@example.com", "Secret123"))
            .await
            .expect("register");
        h.service.confirm_email_verified(user.id).await.expect("verify");
        let outcome = h
            .service
            .login(&client(), login_req("alice", "Secret123"))
            .await
            .expect("login");
        let ctx = signed_in(&h.service, &outcome).await;

        h.service.logout(&ctx).await.expect("logout");
        assert!(h.service.sessions().load(&outcome.handle).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn change_password_rehashes_and_checks_current() {
        let h = harness();
        let user = h
            .service
            .register(register_req("alice", "alice@example.com", "Secret123"))
            .await
            .expect("register");
        h.service.confirm_email_verified(user.id).await.expect("verify");
        let outcome = h
            .service
            .login(&client(), login_req("alice", "Secret123"))
            .await
            .expect("login");
        let ctx = signed_in(&h.service, &outcome).await;

        let err = h
            .service
            .change_password(
                &ctx,
                ChangePasswordRequest {
                    current_password: "wrong".into(),
                    new_password: "Another1".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::LoginFailed));

        let err = h
            .service
            .change_password(
                &ctx,
                ChangePasswordRequest {
                    current_password: "Secret123".into(),
                    new_password: String::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ValidationFailed(ref e) if e[0].field == "newPassword"));

        h.service
            .change_password(
                &ctx,
                ChangePasswordRequest {
                    current_password: "Secret123".into(),
                    new_password: "Another1".into(),
                },
            )
            .await
            .expect("change password");

        assert!(matches!(
            h.service.login(&client(), login_req("alice", "Secret123")).await,
            Err(AuthError::LoginFailed)
        ));
        h.service
            .login(&client(), login_req("alice", "Another1"))
            .await
            .expect("login with new password");
    }

    #[tokio::test]
    async fn verification_token_unlocks_login_once() {
        let mut h = harness();
        let user = h
            .service
            .register(register_req("alice", "alice@example.com", "Secret123"))
            .await
            .expect("register");
        let (_, token) = h.mail.recv().await.expect("verification dispatched");

        let verified = h
            .service
            .verify_email(VerifyEmailRequest { token: token.clone() })
            .await
            .expect("verify");
        assert_eq!(verified.id, user.id);
        assert!(verified.is_email_verified);

        h.service
            .login(&client(), login_req("alice", "Secret123"))
            .await
            .expect("login after verification");

        let err = h
            .service
            .verify_email(VerifyEmailRequest { token })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidVerificationToken));
    }

    #[tokio::test]
    async fn verify_email_rejects_blank_and_unknown_tokens() {
        let h = harness();
        let err = h
            .service
            .verify_email(VerifyEmailRequest { token: String::new() })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ValidationFailed(ref e) if e[0].field == "token"));

        let err = h
            .service
            .verify_email(VerifyEmailRequest { token: "deadbeef".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidVerificationToken));
    }

    #[tokio::test]
    async fn confirm_email_for_unknown_user_fails() {
        let h = harness();
        assert!(matches!(
            h.service.confirm_email_verified(12345).await.unwrap_err(),
            AuthError::UserDoesNotExist
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registrations_admit_one_account() {
        let h = harness();
        let tasks: Vec<_> = (0..6)
            .map(|i| {
                let service = h.service.clone();
                tokio::spawn(async move {
                    service
                        .register(register_req("alice", &format!("a{i}@example.com"), "Secret123"))
                        .await
                })
            })
            .collect();

        let mut created = 0;
        for t in tasks {
            match t.await.expect("join") {
                Ok(_) => created += 1,
                Err(AuthError::AccountAlreadyExists(UniqueField::Username)) => {}
                Err(e) => panic!("unexpected {e:?}"),
            }
        }
        assert_eq!(created, 1);
    }
}
