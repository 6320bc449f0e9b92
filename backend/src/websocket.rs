use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::AppError;
use crate::AppState;

/// Per-connection outbound buffer; a client that falls this far behind
/// loses messages rather than stalling producers.
const CONNECTION_BUFFER: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl WsMessage {
    pub fn new(event_type: &str, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            payload,
            timestamp: chrono::Utc::now(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    open: bool,
    users: HashMap<Uuid, HashMap<Uuid, mpsc::Sender<WsMessage>>>,
}

/// Live push connections keyed by user.
///
/// The lock only covers map updates and sender lookup; socket writes happen
/// on each connection's own task.
#[derive(Default)]
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts accepting registrations.
    pub fn open(&self) {
        self.lock().open = true;
        tracing::info!("Push connection registry opened");
    }

    /// Stops accepting registrations and drops every sender, which ends
    /// all connection tasks.
    pub fn close(&self) {
        let mut state = self.lock();
        state.open = false;
        let dropped: usize = state.users.values().map(HashMap::len).sum();
        state.users.clear();
        tracing::info!(connections = dropped, "Push connection registry closed");
    }

    /// Registers a connection for `user_id`; `None` once the registry is closed.
    pub fn register(&self, user_id: Uuid) -> Option<(Uuid, mpsc::Receiver<WsMessage>)> {
        let mut state = self.lock();
        if !state.open {
            return None;
        }
        let connection_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER);
        state.users.entry(user_id).or_default().insert(connection_id, tx);
        Some((connection_id, rx))
    }

    pub fn deregister(&self, user_id: Uuid, connection_id: Uuid) {
        let mut state = self.lock();
        if let Some(connections) = state.users.get_mut(&user_id) {
            connections.remove(&connection_id);
            if connections.is_empty() {
                state.users.remove(&user_id);
            }
        }
    }

    /// Delivers `message` to every live connection of each user. Returns the
    /// number of connections that accepted it.
    pub fn send_to_users(&self, user_ids: &[Uuid], message: &WsMessage) -> usize {
        let targets: Vec<(Uuid, Uuid, mpsc::Sender<WsMessage>)> = {
            let state = self.lock();
            user_ids
                .iter()
                .filter_map(|user_id| state.users.get(user_id).map(|c| (*user_id, c)))
                .flat_map(|(user_id, connections)| {
                    connections
                        .iter()
                        .map(move |(conn_id, tx)| (user_id, *conn_id, tx.clone()))
                })
                .collect()
        };

        let mut delivered = 0;
        for (user_id, connection_id, tx) in targets {
            match tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(%user_id, %connection_id, "Push buffer full, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.deregister(user_id, connection_id);
                }
            }
        }
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.lock().users.values().map(HashMap::len).sum()
    }

    pub fn is_connected(&self, user_id: Uuid) -> bool {
        self.lock().users.contains_key(&user_id)
    }
}

#[derive(Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// `GET /workflow/alerts/ws?token=...`
pub async fn websocket_handler(
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = query.token else {
        return AppError::Unauthenticated("No authentication token provided".to_string()).into_response();
    };
    let claims = match state.jwt.verify(&token) {
        Ok(data) => data.claims,
        Err(e) => return AppError::from(e).into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, claims.sub))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();

    let Some((connection_id, mut rx)) = state.connections.register(user_id) else {
        let _ = sender.send(Message::Close(None)).await;
        return;
    };

    let connected = WsMessage::new(
        "connected",
        serde_json::json!({ "connection_id": connection_id, "user_id": user_id }),
    );
    if let Ok(text) = serde_json::to_string(&connected) {
        let _ = sender.send(Message::Text(text)).await;
    }
    tracing::debug!(%user_id, %connection_id, "Push connection opened");

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&msg) else {
                continue;
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let registry = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if let Ok(client_msg) = serde_json::from_str::<WsMessage>(&text) {
                        handle_client_message(&registry, user_id, client_msg);
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };

    state.connections.deregister(user_id, connection_id);
    tracing::debug!(%user_id, %connection_id, "Push connection closed");
}

fn handle_client_message(state: &AppState, user_id: Uuid, message: WsMessage) {
    match message.event_type.as_str() {
        "ping" => {
            state
                .connections
                .send_to_users(&[user_id], &WsMessage::new("pong", serde_json::json!({})));
        }
        other => {
            tracing::debug!("Ignoring client message type: {}", other);
        }
    }
}
