pub mod auth;
pub mod error;
mod handlers;
mod ws;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::relay::Relay;

use handlers::*;
use ws::{parameter_listen, parameter_trigger};

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
}

pub fn router(state: AppState) -> Router {
    let cors_origins = state.relay.config().cors_origins.clone();

    let router = Router::new()
        .route("/health", get(health))
        .route("/trigger-connect", post(trigger_connect))
        .route("/client/emergency-unlock", post(emergency_unlock))
        .route("/parameter-listen", get(parameter_listen))
        .route("/parameter-trigger", get(parameter_trigger))
        .with_state(state)
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(TraceLayer::new_for_http());

    // Conditionally apply CORS if origins are configured.
    if cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        )
    }
}
