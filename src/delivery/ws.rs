//! WebSocket endpoint for out-of-band delivery.

use std::collections::HashSet;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use uuid::Uuid;

use crate::intake::{AppState, AuthContext};

/// `GET /v1/events/ws` — upgrade and stream terminal envelopes.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    auth: AuthContext,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| client_loop(socket, state, auth))
}

async fn client_loop(socket: WebSocket, state: AppState, auth: AuthContext) {
    let hub = state.delivery.clone();
    let (client_id, mut envelopes) = hub.register(&auth.tenant_id, &auth.user_id).await;

    let (mut sink, mut stream) = socket.split();
    // Per-connection de-dup set: bus delivery is at-least-once, clients must
    // see each job's terminal event once.
    let mut seen: HashSet<Uuid> = HashSet::new();

    loop {
        tokio::select! {
            envelope = envelopes.recv() => {
                let Some(envelope) = envelope else { break };
                if !seen.insert(envelope.job_id()) {
                    continue;
                }
                let Ok(text) = serde_json::to_string(&envelope) else {
                    continue;
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Clients only listen; anything else is ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    hub.deregister(client_id).await;
}
