//! The realtime WebSocket endpoint.
//!
//! Connection lifecycle: authenticate (headers supplied by the upstream
//! auth layer) → register with the fan-out registry → `welcome` → serve
//! subscribe/unsubscribe/refresh/ping requests until the transport closes
//! → unregister. Outbound events flow through the registry's channel so a
//! connection's own replies interleave in order with broadcasts.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tracing::debug;
use uuid::Uuid;

use arbor_shared::protocol::{ClientRequest, ServerEvent};
use arbor_shared::{PrivateKey, ThreadId, UserId};

use crate::api::{require_auth, AppState};
use crate::chat::ChatService;
use crate::error::ServerError;
use crate::registry::ConnectionId;

pub async fn chat_ws(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Response, ServerError> {
    let (user, session) = require_auth(&headers)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user, session)))
}

async fn handle_socket(socket: WebSocket, state: AppState, user: UserId, session: Uuid) {
    let chat = state.chat.clone();
    let registry = chat.registry().clone();

    let mut private_key = chat.session_key(user, session).await.unwrap_or(None);

    let conn = registry.register(user, private_key.clone()).await;
    let conn_id = conn.id;
    let sender = conn.sender;
    let mut events = conn.events;

    let _ = sender.send(ServerEvent::Welcome {
        locked: private_key.is_none(),
    });

    let (mut sink, mut stream) = socket.split();

    // Forward registry events to the transport until either side closes.
    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let json = match event.to_json() {
                Ok(json) => json,
                Err(_) => continue,
            };
            if sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = stream.next().await {
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let request = match ClientRequest::from_json(&text) {
            Ok(request) => request,
            Err(_) => {
                let _ = sender.send(ServerEvent::Error {
                    message: "invalid payload".into(),
                });
                continue;
            }
        };

        match request {
            ClientRequest::Subscribe { thread_id } => {
                handle_subscribe(
                    &chat,
                    conn_id,
                    user,
                    thread_id,
                    private_key.as_ref(),
                    &sender,
                )
                .await;
            }
            ClientRequest::Unsubscribe { thread_id } => {
                registry.unsubscribe(conn_id, thread_id).await;
                let _ = sender.send(ServerEvent::Unsubscribed { thread_id });
            }
            ClientRequest::Refresh => {
                private_key = chat.session_key(user, session).await.unwrap_or(None);
                registry
                    .update_private_key(conn_id, private_key.clone())
                    .await;
                let _ = sender.send(ServerEvent::Refreshed {
                    locked: private_key.is_none(),
                });
            }
            ClientRequest::Ping => {
                let _ = sender.send(ServerEvent::Pong);
            }
        }
    }

    debug!(connection = conn_id, user = %user, "socket closed");
    registry.unregister(conn_id).await;
    writer.abort();
}

async fn handle_subscribe(
    chat: &ChatService,
    conn_id: ConnectionId,
    user: UserId,
    thread_id: ThreadId,
    private_key: Option<&PrivateKey>,
    sender: &tokio::sync::mpsc::UnboundedSender<ServerEvent>,
) {
    // Authorization first: a connection never enters the subscriber set of
    // a thread its user does not belong to.
    match chat.is_member(user, thread_id).await {
        Ok(true) => {}
        _ => {
            let _ = sender.send(ServerEvent::Error {
                message: format!("thread {thread_id} unavailable"),
            });
            return;
        }
    }

    let newly = chat.registry().subscribe(conn_id, thread_id).await;

    // Re-subscribing is a no-op that returns an empty history delta, so a
    // client cannot trigger duplicate full-history pushes.
    let view = if newly {
        chat.thread_view(user, thread_id, private_key).await
    } else {
        chat.thread_info(user, thread_id).await
    };

    match view {
        Ok(view) => {
            let _ = sender.send(ServerEvent::Subscribed {
                thread_id,
                messages: view.messages,
                locked: private_key.is_none(),
                display_name: view.display_name,
                is_group: view.is_group,
                owner_id: view.owner_id,
            });
        }
        Err(_) => {
            let _ = sender.send(ServerEvent::Error {
                message: format!("thread {thread_id} unavailable"),
            });
        }
    }
}
