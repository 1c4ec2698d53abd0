//! Push channel pump
//!
//! Each upgraded socket registers with the [`BroadcastHub`](crate::sync::BroadcastHub)
//! and forwards every event as a JSON text frame. The channel is
//! server → client; inbound `ping` / `request_sync` frames are honoured but
//! anything else from the client is ignored. When the hub drops the
//! subscriber (shutdown, or it fell too far behind) the socket is closed so the
//! client reconnects and refetches.

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use tracing::{debug, info, warn};

use super::api::AppState;
use crate::sync::{ClientMessage, PushEvent};

pub(crate) async fn handle_ws(state: AppState, mut socket: WebSocket) {
    let mut subscription = state.hub.subscribe();
    let id = subscription.id();
    info!(subscriber = id, clients = state.hub.len(), "Push client connected");

    if send_event(&mut socket, &PushEvent::connection_established())
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            event = subscription.recv() => {
                match event {
                    Some(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            debug!(subscriber = id, "Send failed, closing push channel");
                            break;
                        }
                    }
                    None => {
                        debug!(subscriber = id, "Dropped by hub, closing push channel");
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if handle_client_text(&state, &mut socket, text.as_str()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(subscriber = id, "WebSocket error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    drop(subscription);
    info!(subscriber = id, clients = state.hub.len(), "Push client disconnected");
}

async fn handle_client_text(
    state: &AppState,
    socket: &mut WebSocket,
    text: &str,
) -> Result<(), axum::Error> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Ignoring unrecognised client message: {e}");
            return Ok(());
        }
    };

    match message {
        ClientMessage::Ping => {
            send_event(socket, &PushEvent::Pong { timestamp: Utc::now() }).await
        }
        ClientMessage::RequestSync => full_sync(state, socket).await,
    }
}

/// Send one `state_update` for every domain with a committed record
async fn full_sync(state: &AppState, socket: &mut WebSocket) -> Result<(), axum::Error> {
    let domains = match state.store.domains().await {
        Ok(domains) => domains,
        Err(e) => {
            warn!("Full sync failed to list domains: {e}");
            return Ok(());
        }
    };

    for domain in &domains {
        match state.store.read(domain).await {
            Ok(Some(record)) => {
                let event = PushEvent::StateUpdate {
                    domain: record.domain.clone(),
                    data: record.payload.clone(),
                    timestamp: Some(record.updated_at),
                };
                send_event(socket, &event).await?;
            }
            Ok(None) => {}
            Err(e) => warn!(domain = %domain, "Full sync skipped domain: {e}"),
        }
    }

    debug!(domains = domains.len(), "Full sync sent");
    Ok(())
}

async fn send_event(socket: &mut WebSocket, event: &PushEvent) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to serialize push event: {e}");
            return Ok(());
        }
    };
    socket.send(Message::Text(text.into())).await
}
