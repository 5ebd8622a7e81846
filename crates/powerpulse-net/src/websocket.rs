//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tracing::{debug, info};

use crate::registry::SubscriberRegistry;
use crate::server::AppState;

pub(crate) async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| client_loop(socket, registry))
}

async fn client_loop(mut socket: WebSocket, registry: SubscriberRegistry) {
    let mut subscription = registry.register();
    subscription.mark_open();
    let id = subscription.id();
    info!(subscriber = %id, subscribers = registry.len(), "subscriber connected");

    loop {
        tokio::select! {
            queued = subscription.recv() => {
                let Some(text) = queued else {
                    break;
                };
                if socket.send(Message::Text(text.to_string())).await.is_err() {
                    break;
                }
            }
            message = socket.recv() => {
                let Some(Ok(message)) = message else {
                    break;
                };

                match message {
                    Message::Text(_) | Message::Binary(_) => {
                        debug!(subscriber = %id, "ignoring inbound websocket frame");
                    }
                    Message::Ping(payload) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => break,
                }
            }
        }
    }

    subscription.mark_closing();
    registry.unregister(id);
    info!(subscriber = %id, subscribers = registry.len(), "subscriber disconnected");
}
