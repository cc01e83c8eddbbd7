//! HTTP/WebSocket server lifecycle.

use std::future::Future;

use tokio::net::TcpListener;

use crate::api::{self, AppState};
use crate::relay::Relay;

/// Serve the relay on `listener` until `shutdown` resolves, then stop
/// expiration timers, close listeners, and remove every trigger session.
pub async fn run<F>(listener: TcpListener, relay: Relay, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = api::router(AppState {
        relay: relay.clone(),
    });
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "HTTP/WS server listening");
    }
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    relay.shutdown();
    tracing::info!("relay stopped");
    result
}
