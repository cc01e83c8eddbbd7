use axum::extract::ws::{close_code, CloseFrame, Message};
use futures::{Sink, SinkExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A frame queued for a socket's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close(String),
}

/// Sending half of one websocket connection.
///
/// Sends never block and never fail loudly: they queue onto an unbounded
/// channel drained by [`run_writer`]. Once [`close`](Self::close) has been
/// called every further send is dropped, so a connection can be closed from
/// any task (eviction, timers, HTTP handlers) without coordinating with the
/// reader loop.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    tx: mpsc::UnboundedSender<Outbound>,
    closed: CancellationToken,
}

impl SocketHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                closed: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Queue a raw text frame. Returns `false` if the socket is closed.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.tx.send(Outbound::Text(text.into())).is_ok()
    }

    /// Serialize `msg` as JSON and queue it.
    pub fn send_json<T: Serialize>(&self, msg: &T) -> bool {
        match serde_json::to_string(msg) {
            Ok(json) => self.send_text(json),
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize outbound message");
                false
            }
        }
    }

    /// Queue a close frame with `reason` and refuse further sends. Only the
    /// first call has any effect.
    pub fn close(&self, reason: &str) {
        if self.closed.is_cancelled() {
            return;
        }
        let _ = self.tx.send(Outbound::Close(reason.to_string()));
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when this socket is closed from our side.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Drain queued frames into the websocket sink until a close frame is
/// written, the sink fails, or every [`SocketHandle`] is dropped.
pub async fn run_writer<S>(mut rx: mpsc::UnboundedReceiver<Outbound>, mut sink: S)
where
    S: Sink<Message> + Unpin,
{
    while let Some(frame) = rx.recv().await {
        match frame {
            Outbound::Text(text) => {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Outbound::Close(reason) => {
                let close_frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(close_frame))).await;
                let _ = sink.flush().await;
                break;
            }
        }
    }
}
