use axum::{
    extract::State,
    http::{
        header::{InvalidHeaderValue, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::{error, instrument};

use crate::{
    auth::{
        dto::{ChangePasswordRequest, LoginRequest, RegisterRequest, VerifyEmailRequest},
        errors::AuthError,
        extractors::ApiJson,
        repo_types::User,
        services::RequestContext,
    },
    config::SessionConfig,
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/verify-email", post(verify_email))
}

pub fn me_routes() -> Router<AppState> {
    Router::new()
        .route("/me", get(get_me))
        .route("/me/password", post(change_password))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<RegisterRequest>,
) -> Result<(StatusCode, Json<User>), AuthError> {
    let user = state.auth.register(payload).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[instrument(skip(state, payload))]
pub async fn verify_email(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<VerifyEmailRequest>,
) -> Result<Json<User>, AuthError> {
    Ok(Json(state.auth.verify_email(payload).await?))
}

#[instrument(skip(state, ctx, payload))]
pub async fn login(
    State(state): State<AppState>,
    ctx: RequestContext,
    ApiJson(payload): ApiJson<LoginRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let outcome = state.auth.login(&ctx, payload).await?;

    let ttl_seconds = state.auth.sessions().ttl().whole_seconds();
    let cookie = session_cookie(&state.config.session, &outcome.handle.to_string(), ttl_seconds)
        .map_err(|e| {
            error!(error = %e, "session cookie rejected");
            AuthError::Internal(e.into())
        })?;

    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, cookie);
    Ok((headers, Json(outcome.user)))
}

#[instrument(skip(state, ctx))]
pub async fn logout(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, AuthError> {
    state.auth.logout(&ctx).await?;

    // Clear the cookie even if building it somehow fails; the session is gone.
    let mut headers = HeaderMap::new();
    if let Ok(cookie) = session_cookie(&state.config.session, "", 0) {
        headers.insert(SET_COOKIE, cookie);
    }
    Ok((StatusCode::NO_CONTENT, headers))
}

#[instrument(skip(state, ctx))]
pub async fn get_me(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Json<User>, AuthError> {
    Ok(Json(state.auth.me(&ctx).await?))
}

#[instrument(skip(state, ctx, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    ctx: RequestContext,
    ApiJson(payload): ApiJson<ChangePasswordRequest>,
) -> Result<StatusCode, AuthError> {
    state.auth.change_password(&ctx, payload).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `HttpOnly` session cookie. A `max_age` of zero clears it.
fn session_cookie(
    cfg: &SessionConfig,
    value: &str,
    max_age: i64,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}",
        cfg.cookie_name
    );
    if cfg.secure_cookie {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}
