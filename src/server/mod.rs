//! HTTP surface: route assembly and the shared request context.

pub mod admin;
pub mod auth_routes;
pub mod checkout;
pub mod error;
pub mod extract;
pub mod merchants;
pub mod orders;
pub mod transactions;

use std::sync::Arc;

use axum::extract::State;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use http::HeaderValue;
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::gateway::Gateway;

pub type App = Arc<Gateway>;

pub fn router(gw: App) -> Router {
    let mut origins: Vec<HeaderValue> = [
        "http://localhost:5173",
        "http://127.0.0.1:5173",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();
    if let Ok(origin) = gw.settings.frontend_url.parse() {
        origins.push(origin);
    }
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any);

    let trace = TraceLayer::new_for_http().make_span_with(
        |request: &http::Request<axum::body::Body>| {
            // Correlation id attached to every log line of the request.
            let request_id = {
                use rand::RngCore;
                let mut bytes = [0u8; 6];
                rand::thread_rng().fill_bytes(&mut bytes);
                hex::encode(bytes)
            };
            tracing::info_span!(
                "request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id,
            )
        },
    );

    Router::new()
        .route("/", get(home))
        .route("/health", get(health))
        .merge(auth_routes::routes())
        .merge(merchants::routes())
        .merge(orders::routes())
        .merge(checkout::routes())
        .merge(admin::routes())
        .merge(transactions::routes())
        .layer(trace)
        .layer(TimeoutLayer::new(gw.settings.request_timeout))
        .layer(cors)
        .with_state(gw)
}

async fn home() -> Html<&'static str> {
    Html(
        "<html><head><title>PayFlow</title></head>\
         <body style=\"font-family:sans-serif;padding:40px\">\
         <h1>PayFlow Gateway</h1>\
         <p>The backend is running.</p>\
         </body></html>",
    )
}

async fn health(State(gw): State<App>) -> impl IntoResponse {
    let store_ok = gw.store.begin_read().is_ok();
    Json(json!({
        "status": if store_ok { "ok" } else { "degraded" },
        "service": "payflow-gateway",
        "store": if store_ok { "ok" } else { "error" },
    }))
}
