use axum::extract::ws::{CloseFrame, Message};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

/// Outbound half of one live connection. Messages go through the per-socket
/// writer task, never directly to the transport.
pub struct ClientHandle {
    pub conn_id: String,
    pub client_id: String,
    sender: mpsc::Sender<Message>,
}

impl ClientHandle {
    pub fn new(conn_id: String, client_id: String, sender: mpsc::Sender<Message>) -> Self {
        Self {
            conn_id,
            client_id,
            sender,
        }
    }

    pub async fn send_text(&self, text: &str) -> bool {
        self.sender
            .send(Message::Text(text.to_string()))
            .await
            .is_ok()
    }

    pub async fn close(&self, reason: &str) {
        let _ = self
            .sender
            .send(Message::Close(Some(CloseFrame {
                code: 1008,
                reason: reason.to_string().into(),
            })))
            .await;
    }
}

/// Set of live connections. Broadcast iterates over a snapshot, so a
/// connection deregistering mid-publish never invalidates the walk.
#[derive(Default)]
pub struct ConnectionRegistry {
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<String, Arc<ClientHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub async fn register(&self, client: Arc<ClientHandle>) {
        self.clients
            .write()
            .await
            .insert(client.conn_id.clone(), client.clone());
        info!(
            event = "client_connected",
            conn_id = %client.conn_id,
            client_id = %client.client_id
        );
    }

    pub async fn deregister(&self, client: &ClientHandle, reason: &str) {
        client.close(reason).await;
        self.clients.write().await.remove(&client.conn_id);
        info!(
            event = "client_disconnected",
            conn_id = %client.conn_id,
            client_id = %client.client_id,
            reason = reason
        );
    }

    pub async fn snapshot(&self) -> Vec<Arc<ClientHandle>> {
        self.clients.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Best-effort fan-out: a connection that cannot accept the message is
    /// deregistered and simply misses events until it resynchronizes.
    pub async fn broadcast(&self, raw: &str) {
        let clients = self.snapshot().await;
        for client in clients {
            if !client.send_text(raw).await {
                warn!(event = "send_error", conn_id = %client.conn_id);
                self.deregister(&client, "send_error").await;
            }
        }
    }
}
