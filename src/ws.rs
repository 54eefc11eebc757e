//! Live moderation feed for administrator dashboards

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use crate::auth::Admin;
use crate::geo::GeolocationWatcher;
use crate::protocol::{ServerMessage, WsQuery};
use crate::state::AppState;

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Admin(admin): Admin,
    Query(params): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    tracing::info!(
        "Dashboard connection from admin {}, following {:?}",
        admin.user_id(),
        params.follow
    );

    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

async fn send(sender: &mut futures::stream::SplitSink<WebSocket, Message>, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to serialize {:?}: {}", msg, e);
            true
        }
    }
}

async fn handle_socket(socket: WebSocket, params: WsQuery, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let welcome = ServerMessage::Welcome {
        following: params.follow.clone(),
    };
    if !send(&mut sender, &welcome).await {
        tracing::error!("Failed to send welcome message");
        return;
    }

    let mut status_rx = state.subscribe_status_changes();
    let mut watcher: Option<GeolocationWatcher> =
        params.follow.as_deref().map(|user| state.watch_player(user));

    if let (Some(user), Some(w)) = (params.follow.as_deref(), &watcher) {
        if !send(&mut sender, &ServerMessage::position(user, w.current())).await {
            return;
        }
    }

    loop {
        tokio::select! {
            event = status_rx.recv() => {
                match event {
                    Ok(change) => {
                        if !send(&mut sender, &ServerMessage::SubmissionStatus { change }).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Dashboard lagged by {} status events", skipped);
                        let msg = ServerMessage::Error {
                            code: "LAGGED".to_string(),
                            msg: format!("{} status events dropped, reload the queue", skipped),
                        };
                        if !send(&mut sender, &msg).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            update = async {
                match watcher.as_mut() {
                    Some(w) => w.changed().await,
                    None => std::future::pending().await,
                }
            } => {
                match (update, params.follow.as_deref()) {
                    (Some(geo), Some(user)) => {
                        if !send(&mut sender, &ServerMessage::position(user, geo)).await {
                            break;
                        }
                    }
                    // Source ended; stop following
                    _ => watcher = None,
                }
            }

            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!("Dashboard socket error: {}", e);
                        break;
                    }
                    // Dashboards only listen
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    if let Some(w) = watcher {
        w.stop();
    }
    tracing::info!("Dashboard disconnected");
}
