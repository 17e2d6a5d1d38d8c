use std::net::SocketAddr;

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequest, FromRequestParts, Request},
    http::{header, request::Parts, HeaderMap},
    Json,
};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::errors::AuthError;
use super::schema::FieldError;
use super::services::RequestContext;
use super::session::{ClientMeta, SessionHandle};
use crate::state::AppState;

/// Builds the per-request context: client metadata plus the session bound to
/// the session cookie, if any. A missing or unknown cookie is not an error
/// here; operations that need a session reject on their own.
#[async_trait]
impl FromRequestParts<AppState> for RequestContext {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        let client = ClientMeta {
            ip: extract_client_ip(&parts.headers).or(peer),
            user_agent: parts
                .headers
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        };

        let handle = extract_session_handle(&parts.headers, &state.config.session.cookie_name);
        let session = match &handle {
            Some(handle) => state.auth.sessions().load(handle).await?,
            None => None,
        };
        if handle.is_some() && session.is_none() {
            debug!("session cookie present but no live session");
        }

        Ok(RequestContext {
            client,
            handle,
            session,
        })
    }
}

/// JSON body whose rejections surface as `ValidationFailed` on `body`.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => {
                let message = rejection.body_text();
                debug!(error = %message, "request body rejected");
                Err(AuthError::ValidationFailed(vec![FieldError::new("body", message)]))
            }
        }
    }
}

pub(crate) fn extract_session_handle(headers: &HeaderMap, cookie_name: &str) -> Option<SessionHandle> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == cookie_name)
        .and_then(|(_, value)| value.trim().parse().ok())
}

/// First hop of `x-forwarded-for`, then `x-real-ip`.
pub(crate) fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
