use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::model::TargetUser;
use crate::protocol::{parse_listener_updates, parse_trigger_batch};
use crate::relay::listener::ListenerConnection;
use crate::relay::socket::{run_writer, SocketHandle};
use crate::relay::{
    Relay, MALFORMED_MESSAGE, PROTOCOL_OUT_OF_DATE, UNEXPECTED_ERROR,
};

use super::auth;
use super::error::ApiError;
use super::AppState;

const CLIENT_DISCONNECTED: &str = "Client disconnected";

/// First frame a trigger receives after the upgrade.
const TRIGGER_GREETING: &str = "\"Connected\"";

pub(super) async fn parameter_listen(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (user_id, user) = auth::authenticate_listener(&state.relay, &headers)?;
    Ok(ws.on_upgrade(move |socket| run_listener(socket, state.relay, user, user_id)))
}

pub(super) async fn parameter_trigger(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_trigger(socket, state.relay))
}

/// Next text frame from the client. `None` once the client goes away or the
/// socket is closed from our side.
async fn next_text<S>(stream: &mut S, closed: &CancellationToken) -> Option<String>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        tokio::select! {
            _ = closed.cancelled() => return None,
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => return Some(text.to_string()),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            },
        }
    }
}

/// Close from our side and wait for the writer to flush the close frame.
async fn shut(socket: &SocketHandle, writer: JoinHandle<()>, reason: &str) {
    socket.close(reason);
    let _ = writer.await;
}

async fn run_listener(socket: WebSocket, relay: Relay, user: TargetUser, user_id: i64) {
    let (sink, mut stream) = socket.split();
    let (handle, rx) = SocketHandle::new();
    let writer = tokio::spawn(run_writer(rx, sink));
    let closed = handle.closed_token();
    let expected = relay.config().protocol_version.clone();

    handle.send_text(expected.clone());
    match next_text(&mut stream, &closed).await {
        Some(version) if version.trim() == expected => {}
        Some(version) => {
            tracing::warn!(target_user = %user, version = %version.trim(), "listener protocol out of date");
            return shut(&handle, writer, PROTOCOL_OUT_OF_DATE).await;
        }
        None => return shut(&handle, writer, CLIENT_DISCONNECTED).await,
    }
    let Some(selection) = next_text(&mut stream, &closed).await else {
        return shut(&handle, writer, CLIENT_DISCONNECTED).await;
    };

    let conn = ListenerConnection::new(handle, user, user_id);
    if let Err(e) = relay.connect_listener(&conn, selection.trim()) {
        tracing::error!(error = %e, target_user = %conn.target_user(), "listener setup failed");
        conn.close(&relay, UNEXPECTED_ERROR);
        let _ = writer.await;
        return;
    }

    while let Some(text) = next_text(&mut stream, &closed).await {
        let updates = match parse_listener_updates(&text) {
            Ok(updates) => updates,
            Err(e) => {
                tracing::warn!(error = %e, target_user = %conn.target_user(), "malformed listener frame");
                conn.close(&relay, MALFORMED_MESSAGE);
                break;
            }
        };
        if let Err(e) = conn.handle_updates(&relay, &updates) {
            tracing::error!(error = %e, target_user = %conn.target_user(), "failed to apply listener updates");
            conn.close(&relay, UNEXPECTED_ERROR);
            break;
        }
    }
    conn.close(&relay, CLIENT_DISCONNECTED);
    let _ = writer.await;
}

async fn run_trigger(socket: WebSocket, relay: Relay) {
    let (sink, mut stream) = socket.split();
    let (handle, rx) = SocketHandle::new();
    let writer = tokio::spawn(run_writer(rx, sink));
    let closed = handle.closed_token();

    handle.send_text(TRIGGER_GREETING);
    let Some(token) = next_text(&mut stream, &closed).await else {
        return shut(&handle, writer, CLIENT_DISCONNECTED).await;
    };
    let conn = match relay.connect_trigger(handle.clone(), &token) {
        Ok(Some(conn)) => conn,
        Ok(None) => {
            let _ = writer.await;
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "trigger setup failed");
            return shut(&handle, writer, UNEXPECTED_ERROR).await;
        }
    };

    let spam_interval = relay.config().spam_interval();
    while let Some(text) = next_text(&mut stream, &closed).await {
        if !conn.accept_frame(spam_interval) {
            tracing::debug!(client_id = conn.client_id(), "dropping frame inside spam interval");
            continue;
        }
        let batch = match parse_trigger_batch(&text) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(error = %e, client_id = conn.client_id(), "malformed trigger frame");
                conn.close(&relay, MALFORMED_MESSAGE);
                break;
            }
        };
        if let Err(e) = conn.handle_batch(&relay, batch) {
            tracing::error!(
                error = %e,
                target_user = %conn.target_user(),
                client_id = conn.client_id(),
                "failed to handle trigger batch"
            );
            conn.close(&relay, UNEXPECTED_ERROR);
            break;
        }
    }
    conn.close(&relay, CLIENT_DISCONNECTED);
    let _ = writer.await;
}
