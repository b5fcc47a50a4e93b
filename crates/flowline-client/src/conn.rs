use crate::supervisor::ReconnectSupervisor;
use crate::sync::SyncAgent;
use chrono::NaiveDateTime;
use flowline_core::wire::{
    validate_envelope, CreateTaskPayload, ErrorKind, ErrorPayload, HelloPayload,
    ListTasksPayload, SyncRequestPayload, TaskIdPayload, UpdateTaskPayload, WireEnvelope,
    WireMsg, MAX_ENVELOPE_BYTES,
};
use flowline_core::{Task, TaskDraft, TaskFilter, TaskPatch};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

pub const DEFAULT_HUB_URL: &str = "ws://127.0.0.1:4770/ws";

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type Reply = oneshot::Sender<Result<WireMsg, SyncError>>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub hub_url: Url,
    pub client_id: String,
}

impl ClientConfig {
    /// Flag value wins, then `FLOWLINE_HUB_URL`, then the local default.
    /// A blank client id gets a generated one.
    pub fn resolve(url_flag: &str, id_flag: &str) -> Result<Self, url::ParseError> {
        let raw = if !url_flag.trim().is_empty() {
            url_flag.to_string()
        } else {
            std::env::var("FLOWLINE_HUB_URL")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_HUB_URL.to_string())
        };
        let hub_url = Url::parse(&raw)?;
        let client_id = if id_flag.trim().is_empty() {
            format!("client-{}", Uuid::new_v4())
        } else {
            id_flag.to_string()
        };
        Ok(Self { hub_url, client_id })
    }
}

#[derive(Debug)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    Broadcast(WireMsg),
    Tick(NaiveDateTime),
    SyncAck(NaiveDateTime),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("hub rejected request: {0}")]
    Remote(ErrorPayload),
    #[error("unexpected reply: {0}")]
    Unexpected(String),
    #[error("connection closed")]
    Closed,
}

/// A request waiting for its hub reply, matched back by `request_id`.
pub struct PendingRequest {
    msg: WireMsg,
    reply: Reply,
}

#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl HubHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PendingRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn request(&self, msg: WireMsg) -> Result<WireMsg, SyncError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest { msg, reply })
            .await
            .map_err(|_| SyncError::Closed)?;
        reply_rx.await.map_err(|_| SyncError::Closed)?
    }
}

fn reply_to_result(msg: WireMsg) -> Result<WireMsg, SyncError> {
    match msg {
        WireMsg::Error(payload) => Err(SyncError::Remote(payload)),
        other => Ok(other),
    }
}

fn unexpected_reply(msg: &WireMsg) -> SyncError {
    SyncError::Unexpected(format!("{msg:?}"))
}

enum SessionEnd {
    Disconnected,
    HandlesClosed,
}

/// Drive the hub link until every `HubHandle` is dropped or the reconnect
/// schedule is spent. Each successful handshake resets the schedule and
/// triggers a full resync, which repairs any events missed while offline.
pub async fn run(
    config: ClientConfig,
    agent: Arc<Mutex<SyncAgent>>,
    mut requests: mpsc::Receiver<PendingRequest>,
    events: mpsc::Sender<ClientEvent>,
) -> Result<(), SyncError> {
    let mut supervisor = ReconnectSupervisor::new();
    loop {
        match session(&config, &agent, &mut requests, &events, &mut supervisor).await {
            Ok(SessionEnd::HandlesClosed) => return Ok(()),
            Ok(SessionEnd::Disconnected) => {}
            Err(err) => warn!(event = "session_error", error = %err),
        }
        let _ = events.send(ClientEvent::Disconnected).await;
        match supervisor.next_delay() {
            Some(delay) => {
                info!(event = "reconnect_wait", delay_ms = delay.as_millis() as u64);
                tokio::time::sleep(delay).await;
            }
            None => {
                warn!(event = "reconnect_exhausted", hub_url = %config.hub_url);
                return Err(SyncError::Transport(
                    "reconnect attempts exhausted".to_string(),
                ));
            }
        }
    }
}

async fn session(
    config: &ClientConfig,
    agent: &Arc<Mutex<SyncAgent>>,
    requests: &mut mpsc::Receiver<PendingRequest>,
    events: &mpsc::Sender<ClientEvent>,
    supervisor: &mut ReconnectSupervisor,
) -> Result<SessionEnd, SyncError> {
    let (ws, _) = connect_async(config.hub_url.as_str())
        .await
        .map_err(|err| SyncError::Transport(err.to_string()))?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let hello_id = Uuid::new_v4().to_string();
    send_envelope(
        &mut ws_tx,
        &config.client_id,
        Some(hello_id.clone()),
        WireMsg::Hello(HelloPayload {
            client_id: config.client_id.clone(),
        }),
    )
    .await?;

    let mut pending: HashMap<String, Reply> = HashMap::new();
    let mut resync_id: Option<String> = None;
    let mut handshake_done = false;
    let mut end = SessionEnd::Disconnected;

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                let frame = match incoming {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => {
                        warn!(event = "read_error", error = %err);
                        break;
                    }
                    None => break,
                };
                let text = match frame {
                    WsMessage::Text(text) => text,
                    WsMessage::Binary(bytes) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    WsMessage::Close(_) => break,
                    _ => continue,
                };
                if text.len() > MAX_ENVELOPE_BYTES {
                    warn!(event = "message_too_large", size = text.len());
                    continue;
                }
                let envelope: WireEnvelope = match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(event = "message_invalid", error = %err);
                        continue;
                    }
                };
                if let Err(err) = validate_envelope(&envelope) {
                    warn!(event = "message_invalid", error = err);
                    continue;
                }

                if let Some(request_id) = envelope.request_id.clone() {
                    if !handshake_done && request_id == hello_id {
                        handshake_done = true;
                        supervisor.on_connected();
                        info!(event = "hub_connected", client_id = %config.client_id);
                        if let WireMsg::SyncAck(ack) = &envelope.msg {
                            let _ = events.send(ClientEvent::SyncAck(ack.server_instant)).await;
                        }
                        let _ = events.send(ClientEvent::Connected).await;

                        let id = Uuid::new_v4().to_string();
                        send_envelope(
                            &mut ws_tx,
                            &config.client_id,
                            Some(id.clone()),
                            WireMsg::ListTasks(ListTasksPayload::default()),
                        )
                        .await?;
                        resync_id = Some(id);
                        continue;
                    }
                    if resync_id.as_deref() == Some(request_id.as_str()) {
                        resync_id = None;
                        match envelope.msg {
                            WireMsg::TaskListOk(listing) => {
                                let count = listing.tasks.len();
                                agent.lock().await.replace_all(listing.tasks);
                                info!(event = "resync_complete", tasks = count);
                            }
                            other => warn!(event = "resync_failed", msg = ?other),
                        }
                        continue;
                    }
                    if let Some(reply) = pending.remove(&request_id) {
                        let _ = reply.send(reply_to_result(envelope.msg));
                        continue;
                    }
                }

                match &envelope.msg {
                    WireMsg::TimeUpdate(tick) => {
                        let _ = events.send(ClientEvent::Tick(tick.instant)).await;
                    }
                    WireMsg::SyncAck(ack) => {
                        let _ = events.send(ClientEvent::SyncAck(ack.server_instant)).await;
                    }
                    WireMsg::Created(_) | WireMsg::Updated(_) | WireMsg::Deleted(_) => {
                        agent.lock().await.apply_event(&envelope.msg);
                        let _ = events.send(ClientEvent::Broadcast(envelope.msg)).await;
                    }
                    other => debug!(event = "unhandled_push", msg = ?other),
                }
            }
            queued = requests.recv() => {
                let Some(request) = queued else {
                    end = SessionEnd::HandlesClosed;
                    break;
                };
                let request_id = Uuid::new_v4().to_string();
                match send_envelope(&mut ws_tx, &config.client_id, Some(request_id.clone()), request.msg).await {
                    Ok(()) => {
                        pending.insert(request_id, request.reply);
                    }
                    Err(err) => {
                        let _ = request.reply.send(Err(err));
                        break;
                    }
                }
            }
        }
    }

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(SyncError::Transport("connection lost".to_string())));
    }
    Ok(end)
}

async fn send_envelope(
    ws_tx: &mut WsSink,
    sender_id: &str,
    request_id: Option<String>,
    msg: WireMsg,
) -> Result<(), SyncError> {
    let envelope = WireEnvelope::new(sender_id, request_id, msg);
    let text =
        serde_json::to_string(&envelope).map_err(|err| SyncError::Unexpected(err.to_string()))?;
    ws_tx
        .send(WsMessage::Text(text))
        .await
        .map_err(|err| SyncError::Transport(err.to_string()))
}

/// Task-level operations over the hub link, keeping the local replica in
/// step with each confirmed mutation.
pub struct SyncHandle {
    agent: Arc<Mutex<SyncAgent>>,
    hub: HubHandle,
}

impl SyncHandle {
    pub fn new(agent: Arc<Mutex<SyncAgent>>, hub: HubHandle) -> Self {
        Self { agent, hub }
    }

    pub fn agent(&self) -> &Arc<Mutex<SyncAgent>> {
        &self.agent
    }

    pub async fn submit_create(&self, draft: TaskDraft) -> Result<Task, SyncError> {
        let token = self.agent.lock().await.begin_create();
        let reply = self
            .hub
            .request(WireMsg::CreateTask(CreateTaskPayload {
                draft,
                correlation_token: Some(token.clone()),
            }))
            .await;
        match reply {
            Ok(WireMsg::TaskOk(payload)) => {
                self.agent.lock().await.complete_create(payload.task.clone());
                Ok(payload.task)
            }
            Ok(other) => {
                self.agent.lock().await.fail_create(&token);
                Err(unexpected_reply(&other))
            }
            Err(err) => {
                self.agent.lock().await.fail_create(&token);
                Err(err)
            }
        }
    }

    pub async fn submit_update(&self, id: &str, patch: TaskPatch) -> Result<Task, SyncError> {
        let reply = self
            .hub
            .request(WireMsg::UpdateTask(UpdateTaskPayload {
                id: id.to_string(),
                patch,
            }))
            .await;
        match reply {
            Ok(WireMsg::TaskOk(payload)) => {
                self.agent.lock().await.apply_update(payload.task.clone());
                Ok(payload.task)
            }
            Ok(other) => Err(unexpected_reply(&other)),
            Err(err) => {
                self.drop_if_not_found(id, &err).await;
                Err(err)
            }
        }
    }

    pub async fn submit_delete(&self, id: &str) -> Result<(), SyncError> {
        let reply = self
            .hub
            .request(WireMsg::DeleteTask(TaskIdPayload { id: id.to_string() }))
            .await;
        match reply {
            Ok(WireMsg::DeleteOk(_)) => {
                self.agent.lock().await.apply_delete(id);
                Ok(())
            }
            Ok(other) => Err(unexpected_reply(&other)),
            Err(err) => {
                self.drop_if_not_found(id, &err).await;
                Err(err)
            }
        }
    }

    /// A `not_found` rejection means the replica holds a task the store no
    /// longer has; drop the stale entry while surfacing the error.
    async fn drop_if_not_found(&self, id: &str, err: &SyncError) {
        if let SyncError::Remote(payload) = err {
            if payload.kind == ErrorKind::NotFound {
                self.agent.lock().await.apply_delete(id);
            }
        }
    }

    pub async fn load_all(&self, filter: TaskFilter) -> Result<Vec<Task>, SyncError> {
        let reply = self
            .hub
            .request(WireMsg::ListTasks(ListTasksPayload { filter }))
            .await?;
        match reply {
            WireMsg::TaskListOk(listing) => {
                self.agent.lock().await.replace_all(listing.tasks.clone());
                Ok(listing.tasks)
            }
            other => Err(unexpected_reply(&other)),
        }
    }

    pub async fn probe_clock(&self) -> Result<NaiveDateTime, SyncError> {
        let reply = self
            .hub
            .request(WireMsg::SyncRequest(SyncRequestPayload {}))
            .await?;
        match reply {
            WireMsg::SyncAck(ack) => Ok(ack.server_instant),
            other => Err(unexpected_reply(&other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use flowline_core::wire::TaskListPayload;
    use flowline_core::TaskStatus;

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            title: format!("task {id}"),
            start_time: NaiveDate::from_ymd_opt(2025, 1, 1)
                .expect("valid date")
                .and_hms_opt(9, 0, 0)
                .expect("valid time"),
            duration_minutes: 30,
            color: "#4f8fea".to_string(),
            status: TaskStatus::Pending,
            owner_tag: String::new(),
        }
    }

    fn not_found(id: &str) -> SyncError {
        SyncError::Remote(ErrorPayload {
            kind: ErrorKind::NotFound,
            field: None,
            id: Some(id.to_string()),
            message: format!("task not found: {id}"),
        })
    }

    /// Answers every request with the given error, like a hub whose store
    /// no longer holds the task.
    fn rejecting_handle(err_for: &'static str) -> HubHandle {
        let (hub, mut rx) = HubHandle::channel(4);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let _ = request.reply.send(Err(not_found(err_for)));
            }
        });
        hub
    }

    #[tokio::test]
    async fn not_found_update_drops_the_stale_cache_entry() {
        let agent = Arc::new(Mutex::new(SyncAgent::new()));
        agent.lock().await.replace_all(vec![task("t-1")]);
        let handle = SyncHandle::new(agent.clone(), rejecting_handle("t-1"));

        let err = handle
            .submit_update("t-1", TaskPatch::default())
            .await
            .expect_err("store no longer has it");
        assert!(matches!(err, SyncError::Remote(_)));
        assert!(agent.lock().await.get("t-1").is_none());
    }

    #[tokio::test]
    async fn not_found_delete_drops_the_stale_cache_entry() {
        let agent = Arc::new(Mutex::new(SyncAgent::new()));
        agent.lock().await.replace_all(vec![task("t-2")]);
        let handle = SyncHandle::new(agent.clone(), rejecting_handle("t-2"));

        let err = handle
            .submit_delete("t-2")
            .await
            .expect_err("store no longer has it");
        assert!(matches!(err, SyncError::Remote(_)));
        assert!(agent.lock().await.get("t-2").is_none());
    }

    #[test]
    fn error_replies_become_remote_errors() {
        let result = reply_to_result(WireMsg::Error(ErrorPayload {
            kind: ErrorKind::NotFound,
            field: None,
            id: Some("42".to_string()),
            message: "task not found: 42".to_string(),
        }));
        match result {
            Err(SyncError::Remote(payload)) => {
                assert_eq!(payload.kind, ErrorKind::NotFound);
                assert_eq!(payload.id.as_deref(), Some("42"));
            }
            other => panic!("unexpected mapping: {other:?}"),
        }
    }

    #[test]
    fn non_error_replies_pass_through() {
        let reply = reply_to_result(WireMsg::TaskListOk(TaskListPayload { tasks: Vec::new() }));
        assert!(matches!(reply, Ok(WireMsg::TaskListOk(_))));
    }

    #[test]
    fn default_hub_url_parses() {
        let url = Url::parse(DEFAULT_HUB_URL).expect("valid url");
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/ws");
    }

    #[test]
    fn explicit_flags_win_over_defaults() {
        let config = ClientConfig::resolve("ws://hub.example:9000/ws", "watch-1").expect("valid");
        assert_eq!(config.hub_url.as_str(), "ws://hub.example:9000/ws");
        assert_eq!(config.client_id, "watch-1");
    }

    #[test]
    fn blank_client_id_gets_generated() {
        let config = ClientConfig::resolve("ws://hub.example:9000/ws", "  ").expect("valid");
        assert!(config.client_id.starts_with("client-"));
    }
}
