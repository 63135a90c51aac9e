//! Actor-per-connection: one task owns the socket's read half, a writer
//! task owns the sink, and a bounded mpsc channel joins them. Cloning the
//! sender is how the topic directory and the REST layer push frames to this
//! client; the registry holds a cancellation handle instead, so evicting a
//! session always runs this actor's own teardown.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, timeout};

use crate::auth::UserIdentity;
use crate::state::AppState;
use crate::topics::next_session_id;
use crate::ws::frames::ServerFrame;
use crate::ws::protocol::{self, Dispatch, SessionCtx};

/// Server sends a WebSocket ping every 30 seconds to detect abrupt
/// disconnects that never deliver a Close frame.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// If the pong does not arrive within 10 seconds, the connection is dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Close code sent to a session displaced by a newer connection.
const CLOSE_EVICTED: u16 = 1000;

/// Run an authenticated connection to completion.
pub async fn run_connection(
    socket: WebSocket,
    state: AppState,
    user: UserIdentity,
    connection_id: String,
    is_keepalive: bool,
) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Message>(state.outbound_queue_size);

    // Eviction signal. The registry fires it if a newer connection for this
    // user displaces us; the reader loop then closes and tears down without
    // waiting for the client to cooperate.
    let cancel = Arc::new(Notify::new());

    let decision = state
        .registry
        .admit(&user.user_id, &connection_id, is_keepalive, cancel.clone());
    if !decision.evicted.is_empty() {
        tracing::info!(
            user_id = %user.user_id,
            displaced = ?decision.evicted,
            "Displaced older connections"
        );
    }

    let session_id = next_session_id();
    let mut session = SessionCtx {
        session_id,
        user: user.clone(),
        connection_id: connection_id.clone(),
        is_keepalive,
        tx: tx.clone(),
        subscribed: HashSet::new(),
    };

    protocol::send_frame(
        &tx,
        &ServerFrame::ConnectionEstablished {
            connection_id: connection_id.clone(),
            is_keepalive,
            server_time: ServerFrame::now_millis(),
            message: "Successfully connected. Use subscribe/unsubscribe messages to join channels"
                .into(),
        },
    );

    tracing::info!(
        user_id = %user.user_id,
        connection_id = %connection_id,
        is_keepalive = is_keepalive,
        "WebSocket actor started"
    );

    // Writer task: forwards queued messages to the WebSocket sink.
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Ping watchdog: periodic transport pings, close on missed pong.
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();
    let ping_tx = tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        // Skip the immediate first tick.
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx
                .try_send(Message::Ping(vec![1, 2, 3, 4].into()))
                .is_err()
            {
                // Writer is gone or the queue is jammed; either way stop.
                break;
            }

            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {}
                _ => {
                    tracing::warn!("Pong timeout, closing connection");
                    let _ = ping_tx.try_send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    // Reader loop: frames from one session are handled strictly in receipt
    // order; no frame for this session is processed concurrently with another.
    loop {
        let incoming = tokio::select! {
            _ = cancel.notified() => {
                tracing::info!(
                    user_id = %user.user_id,
                    connection_id = %connection_id,
                    "Session displaced by a newer connection"
                );
                let _ = tx
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_EVICTED,
                        reason: "Replaced by new connection".into(),
                    })))
                    .await;
                break;
            }
            incoming = ws_receiver.next() => incoming,
        };

        match incoming {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    match protocol::handle_text_frame(text.as_str(), &mut session, &state).await {
                        Dispatch::Continue => {}
                        Dispatch::Fatal { code, reason } => {
                            let _ = tx
                                .send(Message::Close(Some(CloseFrame {
                                    code,
                                    reason: reason.into(),
                                })))
                                .await;
                            break;
                        }
                    }
                }
                Message::Binary(_) => {
                    tracing::debug!(
                        user_id = %user.user_id,
                        "Received binary message (expected JSON text)"
                    );
                }
                Message::Pong(_) => {
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    let _ = tx.try_send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(
                        user_id = %user.user_id,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(user_id = %user.user_id, error = %e, "WebSocket receive error");
                break;
            }
            None => {
                tracing::info!(user_id = %user.user_id, "WebSocket stream ended");
                break;
            }
        }
    }

    ping_handle.abort();

    // Deterministic teardown. Both steps are idempotent, so racing against
    // an eviction that already dropped the registry entry is harmless.
    state
        .topics
        .unsubscribe_all(session.session_id, session.subscribed.iter());
    state.registry.remove(&user.user_id, &connection_id, &cancel);

    // Let the writer flush what is already queued (a close frame may still
    // be in flight). It exits once every sender clone is gone.
    drop(session);
    drop(tx);
    let _ = timeout(Duration::from_secs(5), writer_handle).await;

    tracing::info!(
        user_id = %user.user_id,
        connection_id = %connection_id,
        "WebSocket actor stopped"
    );
}

/// Writer task: drains the session queue into the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            // Socket is broken; the reader loop will observe it too.
            break;
        }
    }
}
