use std::{net::SocketAddr, time::Duration};

use axum::{
    http::{Method, Request, Response, StatusCode, Uri},
    routing::get,
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::Span;

use crate::auth;
use crate::state::AppState;

fn api_routes() -> Router<AppState> {
    Router::new()
        .merge(auth::router())
        .route("/health", get(|| async { "ok" }))
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_routes())
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request<_>| request_span(req.method(), req.uri()))
                .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                    record_response(res.status(), latency, span)
                }),
        )
}

fn request_span(method: &Method, uri: &Uri) -> Span {
    tracing::info_span!(
        "http_request",
        %method,
        path = %uri.path(),
        status = tracing::field::Empty,
    )
}

fn record_response(status: StatusCode, latency: Duration, span: &Span) {
    span.record("status", tracing::field::display(status));
    let latency_ms = latency.as_millis() as u64;
    if status.is_server_error() {
        tracing::error!(%status, latency_ms, "response");
    } else if status.is_client_error() {
        tracing::warn!(%status, latency_ms, "response");
    } else {
        tracing::info!(%status, latency_ms, "response");
    }
}

pub async fn serve(app: Router) -> anyhow::Result<()> {
    let host = std::env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port = std::env::var("APP_PORT").unwrap_or_else(|_| "8080".into());
    let addr: SocketAddr = format!("{host}:{port}").parse()?;

    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
