use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use clap::Parser;
use flowline_core::wire::{
    validate_envelope, CreateTaskPayload, CreatedPayload, ErrorKind, ErrorPayload,
    ListTasksPayload, SyncAckPayload, TaskIdPayload, TaskListPayload, TaskPayload,
    TimeUpdatePayload, UpdateTaskPayload, WireEnvelope, WireMsg, MAX_ENVELOPE_BYTES,
};
use flowline_storage::{StorageError, TaskStore};
use futures_util::{SinkExt, StreamExt};
use registry::{ClientHandle, ConnectionRegistry};
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod registry;

const HUB_SENDER_ID: &str = "flowline-hub";
const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    storage_uri: String,
    cors_origin: String,
    write_timeout: Duration,
}

#[derive(Parser, Debug)]
#[command(name = "flowline-hub")]
struct Args {
    /// Full listen address; overrides --port when set.
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    port: String,
    #[arg(long, default_value = "")]
    storage: String,
    #[arg(long, default_value = "")]
    cors_origin: String,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
}

struct HubState {
    config: Config,
    // One async mutex serializes store commits AND the publish that follows,
    // so per-connection delivery order always matches commit order.
    store: Mutex<TaskStore>,
    registry: ConnectionRegistry,
}

impl HubState {
    fn new(config: Config, store: TaskStore) -> Self {
        Self {
            config,
            store: Mutex::new(store),
            registry: ConnectionRegistry::new(),
        }
    }

    fn origin_allowed(&self, origin: Option<&header::HeaderValue>) -> bool {
        if self.config.cors_origin.is_empty() {
            return true;
        }
        match origin.and_then(|value| value.to_str().ok()) {
            Some(value) => value == self.config.cors_origin,
            None => false,
        }
    }

    async fn respond(&self, client: &ClientHandle, request_id: Option<String>, msg: WireMsg) {
        let envelope = WireEnvelope::new(HUB_SENDER_ID, request_id, msg);
        match serde_json::to_string(&envelope) {
            Ok(text) => {
                if !client.send_text(&text).await {
                    warn!(event = "respond_error", conn_id = %client.conn_id);
                }
            }
            Err(err) => error!(event = "encode_error", error = %err),
        }
    }

    async fn publish(&self, msg: WireMsg) {
        let envelope = WireEnvelope::new(HUB_SENDER_ID, None, msg);
        match serde_json::to_string(&envelope) {
            Ok(text) => self.registry.broadcast(&text).await,
            Err(err) => error!(event = "encode_error", error = %err),
        }
    }

    async fn handle_request(&self, client: &ClientHandle, envelope: WireEnvelope) {
        let request_id = envelope.request_id.clone();
        match envelope.msg {
            WireMsg::CreateTask(payload) => self.handle_create(client, request_id, payload).await,
            WireMsg::ReadTask(payload) => self.handle_read(client, request_id, payload).await,
            WireMsg::UpdateTask(payload) => self.handle_update(client, request_id, payload).await,
            WireMsg::DeleteTask(payload) => self.handle_delete(client, request_id, payload).await,
            WireMsg::ListTasks(payload) => self.handle_list(client, request_id, payload).await,
            WireMsg::SyncRequest(_) => {
                self.respond(
                    client,
                    request_id,
                    WireMsg::SyncAck(SyncAckPayload {
                        server_instant: Utc::now().naive_utc(),
                    }),
                )
                .await;
            }
            WireMsg::Hello(_) => {
                warn!(event = "unexpected_hello", conn_id = %client.conn_id);
                self.respond(
                    client,
                    request_id,
                    WireMsg::Error(ErrorPayload {
                        kind: ErrorKind::Internal,
                        field: None,
                        id: None,
                        message: "unexpected hello".to_string(),
                    }),
                )
                .await;
            }
            other => {
                warn!(event = "unexpected_message", conn_id = %client.conn_id, msg = ?other);
                self.respond(
                    client,
                    request_id,
                    WireMsg::Error(ErrorPayload {
                        kind: ErrorKind::Internal,
                        field: None,
                        id: None,
                        message: "not a request".to_string(),
                    }),
                )
                .await;
            }
        }
    }

    async fn handle_create(
        &self,
        client: &ClientHandle,
        request_id: Option<String>,
        payload: CreateTaskPayload,
    ) {
        let store = self.store.lock().await;
        match store.create(&payload.draft) {
            Ok(task) => {
                info!(event = "task_created", id = %task.id, conn_id = %client.conn_id);
                self.respond(
                    client,
                    request_id,
                    WireMsg::TaskOk(TaskPayload { task: task.clone() }),
                )
                .await;
                self.publish(WireMsg::Created(CreatedPayload {
                    task,
                    correlation_token: payload.correlation_token,
                }))
                .await;
            }
            Err(err) => self.respond_storage_error(client, request_id, &err).await,
        }
    }

    async fn handle_read(
        &self,
        client: &ClientHandle,
        request_id: Option<String>,
        payload: TaskIdPayload,
    ) {
        let store = self.store.lock().await;
        match store.get(&payload.id) {
            Ok(task) => {
                self.respond(client, request_id, WireMsg::TaskOk(TaskPayload { task }))
                    .await;
            }
            Err(err) => self.respond_storage_error(client, request_id, &err).await,
        }
    }

    async fn handle_update(
        &self,
        client: &ClientHandle,
        request_id: Option<String>,
        payload: UpdateTaskPayload,
    ) {
        let store = self.store.lock().await;
        match store.update(&payload.id, &payload.patch) {
            Ok(task) => {
                info!(event = "task_updated", id = %task.id, conn_id = %client.conn_id);
                self.respond(
                    client,
                    request_id,
                    WireMsg::TaskOk(TaskPayload { task: task.clone() }),
                )
                .await;
                self.publish(WireMsg::Updated(TaskPayload { task })).await;
            }
            Err(err) => self.respond_storage_error(client, request_id, &err).await,
        }
    }

    async fn handle_delete(
        &self,
        client: &ClientHandle,
        request_id: Option<String>,
        payload: TaskIdPayload,
    ) {
        let store = self.store.lock().await;
        match store.delete(&payload.id) {
            Ok(()) => {
                info!(event = "task_deleted", id = %payload.id, conn_id = %client.conn_id);
                self.respond(
                    client,
                    request_id,
                    WireMsg::DeleteOk(TaskIdPayload {
                        id: payload.id.clone(),
                    }),
                )
                .await;
                self.publish(WireMsg::Deleted(TaskIdPayload { id: payload.id }))
                    .await;
            }
            Err(err) => self.respond_storage_error(client, request_id, &err).await,
        }
    }

    async fn handle_list(
        &self,
        client: &ClientHandle,
        request_id: Option<String>,
        payload: ListTasksPayload,
    ) {
        let store = self.store.lock().await;
        match store.list(&payload.filter) {
            Ok(tasks) => {
                self.respond(
                    client,
                    request_id,
                    WireMsg::TaskListOk(TaskListPayload { tasks }),
                )
                .await;
            }
            Err(err) => self.respond_storage_error(client, request_id, &err).await,
        }
    }

    async fn respond_storage_error(
        &self,
        client: &ClientHandle,
        request_id: Option<String>,
        err: &StorageError,
    ) {
        warn!(event = "request_failed", conn_id = %client.conn_id, error = %err);
        self.respond(client, request_id, WireMsg::Error(storage_error_payload(err)))
            .await;
    }

    fn start_tick(self: Arc<Self>, client: Arc<ClientHandle>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            loop {
                ticker.tick().await;
                let envelope = WireEnvelope::new(
                    HUB_SENDER_ID,
                    None,
                    WireMsg::TimeUpdate(TimeUpdatePayload {
                        instant: Utc::now().naive_utc(),
                    }),
                );
                let Ok(text) = serde_json::to_string(&envelope) else {
                    return;
                };
                if !client.send_text(&text).await {
                    self.registry.deregister(&client, "tick_failed").await;
                    return;
                }
            }
        });
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (ws_sender, mut ws_receiver) = socket.split();
        let (tx, rx) = mpsc::channel::<Message>(256);
        let write_task = tokio::spawn(write_loop(rx, ws_sender, self.config.write_timeout));

        let first = match ws_receiver.next().await {
            Some(Ok(msg)) => msg,
            _ => return,
        };
        let data = match message_text(first) {
            Some(text) => text,
            None => return,
        };
        if data.len() > MAX_ENVELOPE_BYTES {
            warn!(event = "hello_too_large", size = data.len());
            return;
        }
        let envelope: WireEnvelope = match serde_json::from_str(&data) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "hello_parse", error = %err);
                return;
            }
        };
        if let Err(err) = validate_envelope(&envelope) {
            warn!(event = "hello_envelope", error = err);
            return;
        }
        let WireMsg::Hello(hello) = &envelope.msg else {
            warn!(event = "expected_hello");
            return;
        };
        if hello.client_id.is_empty() {
            warn!(event = "missing_client_id");
            return;
        }

        let conn_id = self.registry.next_conn_id();
        let client = Arc::new(ClientHandle::new(
            conn_id,
            hello.client_id.clone(),
            tx.clone(),
        ));
        info!(event = "handshake_ok", conn_id = %client.conn_id, client_id = %client.client_id);

        self.registry.register(client.clone()).await;
        self.respond(
            &client,
            envelope.request_id.clone(),
            WireMsg::SyncAck(SyncAckPayload {
                server_instant: Utc::now().naive_utc(),
            }),
        )
        .await;
        self.clone().start_tick(client.clone());

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %client.conn_id, error = %err);
                    break;
                }
            };
            let data = match msg {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %client.conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if data.len() > MAX_ENVELOPE_BYTES {
                warn!(event = "message_too_large", conn_id = %client.conn_id, size = data.len());
                continue;
            }
            let envelope: WireEnvelope = match serde_json::from_str(&data) {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "message_invalid", conn_id = %client.conn_id, error = %err);
                    continue;
                }
            };
            if let Err(err) = validate_envelope(&envelope) {
                warn!(event = "message_invalid", conn_id = %client.conn_id, error = err);
                continue;
            }
            self.handle_request(&client, envelope).await;
        }

        self.registry.deregister(&client, "disconnect").await;
        drop(tx);
        let _ = write_task.await;
    }
}

/// Drains the per-connection outbox onto the socket. Exits on a slow write
/// or a failed one; dropping the receiver is what lets the tick task and
/// `handle_socket` observe the dead connection and finish.
async fn write_loop<S>(mut rx: mpsc::Receiver<Message>, mut sink: S, write_timeout: Duration)
where
    S: futures_util::Sink<Message> + Unpin,
{
    while let Some(msg) = rx.recv().await {
        match tokio::time::timeout(write_timeout, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => return,
        }
    }
}

fn storage_error_payload(err: &StorageError) -> ErrorPayload {
    match err {
        StorageError::Validation(inner) => ErrorPayload {
            kind: ErrorKind::Validation,
            field: Some(inner.field.to_string()),
            id: None,
            message: inner.to_string(),
        },
        StorageError::NotFound { id } => ErrorPayload {
            kind: ErrorKind::NotFound,
            field: None,
            id: Some(id.clone()),
            message: err.to_string(),
        },
        other => ErrorPayload {
            kind: ErrorKind::Internal,
            field: None,
            id: None,
            message: other.to_string(),
        },
    }
}

fn message_text(msg: Message) -> Option<String> {
    match msg {
        Message::Text(text) => Some(text),
        Message::Binary(bytes) => String::from_utf8(bytes).ok(),
        Message::Close(_) | Message::Ping(_) | Message::Pong(_) => None,
    }
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_logging();

    let addr: std::net::SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let store = match open_store(&config.storage_uri) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "storage_error", error = %err, storage = %config.storage_uri);
            return;
        }
    };

    let hub = Arc::new(HubState::new(config.clone(), store));

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(hub.clone());

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "bind_error", error = %err, addr = %config.addr);
            return;
        }
    };

    info!(event = "hub_start", addr = %config.addr, storage = %config.storage_uri);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!(event = "hub_error", error = %err);
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(hub): State<Arc<HubState>>,
) -> impl IntoResponse {
    if !hub.origin_allowed(headers.get(header::ORIGIN)) {
        warn!(event = "origin_rejected");
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket).await;
    })
    .into_response()
}

async fn health_handler(State(hub): State<Arc<HubState>>) -> impl IntoResponse {
    let store = hub.store.lock().await;
    match store.count() {
        Ok(count) => (StatusCode::OK, format!("ok tasks={count}")),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn open_store(uri: &str) -> Result<TaskStore, StorageError> {
    if uri == ":memory:" {
        TaskStore::open_in_memory()
    } else {
        TaskStore::open(uri)
    }
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_addr(&args.addr, &args.port),
        storage_uri: resolve_storage_uri(&args.storage),
        cors_origin: resolve_cors_origin(&args.cors_origin),
        write_timeout: Duration::from_secs(args.write_timeout),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn resolve_port(port_flag: &str) -> String {
    if !port_flag.trim().is_empty() {
        return port_flag.to_string();
    }
    if let Ok(value) = std::env::var("PORT") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    "4770".to_string()
}

fn resolve_addr(addr_flag: &str, port_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    format!("0.0.0.0:{}", resolve_port(port_flag))
}

fn resolve_storage_uri(storage_flag: &str) -> String {
    if !storage_flag.trim().is_empty() {
        return storage_flag.to_string();
    }
    if let Ok(value) = std::env::var("STORAGE_URI") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    "flowline.db".to_string()
}

fn resolve_cors_origin(cors_flag: &str) -> String {
    if !cors_flag.trim().is_empty() {
        return cors_flag.to_string();
    }
    std::env::var("CORS_ORIGIN").unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use flowline_core::{TaskDraft, TaskStatus};
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Stands in for a socket whose peer is gone: every write fails fast.
    struct ClosedSink;

    impl futures_util::Sink<Message> for ClosedSink {
        type Error = std::io::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, _: Message) -> Result<(), Self::Error> {
            Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection closed",
            ))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, 1)
            .expect("valid date")
            .and_hms_opt(9, 0, 0)
            .expect("valid time")
    }

    fn draft(title: &str, duration: i64) -> TaskDraft {
        TaskDraft {
            title: title.to_string(),
            start_time: start(),
            duration_minutes: duration,
            color: String::new(),
            status: TaskStatus::Pending,
            owner_tag: String::new(),
        }
    }

    fn test_state() -> Arc<HubState> {
        let config = Config {
            addr: "127.0.0.1:0".to_string(),
            storage_uri: ":memory:".to_string(),
            cors_origin: String::new(),
            write_timeout: Duration::from_secs(2),
        };
        let store = TaskStore::open_in_memory().expect("open store");
        Arc::new(HubState::new(config, store))
    }

    async fn connect(hub: &HubState, client_id: &str) -> (Arc<ClientHandle>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        let client = Arc::new(ClientHandle::new(
            hub.registry.next_conn_id(),
            client_id.to_string(),
            tx,
        ));
        hub.registry.register(client.clone()).await;
        (client, rx)
    }

    fn decode(msg: Message) -> WireEnvelope {
        match msg {
            Message::Text(text) => serde_json::from_str(&text).expect("decode envelope"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn writer_exits_when_the_socket_send_fails() {
        let (tx, rx) = mpsc::channel(8);
        let client = ClientHandle::new("conn-1".to_string(), "client-a".to_string(), tx);
        let writer = tokio::spawn(write_loop(rx, ClosedSink, Duration::from_secs(2)));

        assert!(client.send_text("tick").await);
        writer.await.expect("writer completes");
        // Receiver is gone, so the tick path sees the dead connection.
        assert!(!client.send_text("tick").await);
    }

    #[tokio::test]
    async fn create_answers_the_originator_then_broadcasts_exactly_once() {
        let hub = test_state();
        let (a, mut rx_a) = connect(&hub, "client-a").await;
        let (_b, mut rx_b) = connect(&hub, "client-b").await;

        let envelope = WireEnvelope::new(
            "client-a",
            Some("req-1".to_string()),
            WireMsg::CreateTask(CreateTaskPayload {
                draft: draft("Standup", 15),
                correlation_token: Some("tok-1".to_string()),
            }),
        );
        hub.handle_request(&a, envelope).await;

        let response = decode(rx_a.recv().await.expect("response"));
        assert_eq!(response.request_id.as_deref(), Some("req-1"));
        let WireMsg::TaskOk(ok) = response.msg else {
            panic!("unexpected response: {:?}", response.msg);
        };

        let push = decode(rx_a.recv().await.expect("broadcast"));
        match push.msg {
            WireMsg::Created(payload) => {
                assert_eq!(payload.task.id, ok.task.id);
                assert_eq!(payload.correlation_token.as_deref(), Some("tok-1"));
            }
            other => panic!("unexpected broadcast: {other:?}"),
        }
        assert!(rx_a.try_recv().is_err());

        let push = decode(rx_b.recv().await.expect("broadcast"));
        assert!(matches!(push.msg, WireMsg::Created(_)));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn validation_failure_answers_with_the_failing_field_and_no_broadcast() {
        let hub = test_state();
        let (a, mut rx_a) = connect(&hub, "client-a").await;
        let (_b, mut rx_b) = connect(&hub, "client-b").await;

        let envelope = WireEnvelope::new(
            "client-a",
            Some("req-2".to_string()),
            WireMsg::CreateTask(CreateTaskPayload {
                draft: draft("", 60),
                correlation_token: None,
            }),
        );
        hub.handle_request(&a, envelope).await;

        let response = decode(rx_a.recv().await.expect("response"));
        assert_eq!(response.request_id.as_deref(), Some("req-2"));
        match response.msg {
            WireMsg::Error(payload) => {
                assert_eq!(payload.kind, ErrorKind::Validation);
                assert_eq!(payload.field.as_deref(), Some("title"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn deleting_a_missing_task_maps_to_not_found_with_the_id() {
        let hub = test_state();
        let (a, mut rx_a) = connect(&hub, "client-a").await;

        let envelope = WireEnvelope::new(
            "client-a",
            Some("req-3".to_string()),
            WireMsg::DeleteTask(TaskIdPayload {
                id: "missing".to_string(),
            }),
        );
        hub.handle_request(&a, envelope).await;

        let response = decode(rx_a.recv().await.expect("response"));
        match response.msg {
            WireMsg::Error(payload) => {
                assert_eq!(payload.kind, ErrorKind::NotFound);
                assert_eq!(payload.id.as_deref(), Some("missing"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
        assert!(rx_a.try_recv().is_err());
    }
}
