use chrono::Utc;
use clap::Parser;
use flowline_client::{run, ClientConfig, ClientEvent, HubHandle, SyncAgent, SyncHandle};
use flowline_core::timeline::Viewport;
use flowline_core::wire::WireMsg;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Follow a hub and log the timeline as it evolves.
#[derive(Parser, Debug)]
#[command(name = "flowline-watch")]
struct Args {
    /// Hub WebSocket URL; falls back to FLOWLINE_HUB_URL.
    #[arg(long, default_value = "")]
    hub_url: String,
    #[arg(long, default_value = "")]
    client_id: String,
    /// Viewport width in pixels used for the visible-range log.
    #[arg(long, default_value_t = 1280.0)]
    width: f64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match ClientConfig::resolve(&args.hub_url, &args.client_id) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_hub_url", error = %err);
            return;
        }
    };
    info!(event = "watch_start", hub_url = %config.hub_url, client_id = %config.client_id);

    let agent = Arc::new(Mutex::new(SyncAgent::new()));
    let (hub, request_rx) = HubHandle::channel(32);
    let (event_tx, mut event_rx) = mpsc::channel::<ClientEvent>(64);
    let handle = SyncHandle::new(agent.clone(), hub);

    let link = tokio::spawn(run(config, agent.clone(), request_rx, event_tx));

    let mut viewport = Viewport::new(Utc::now().naive_utc(), args.width);
    let mut ticks: u64 = 0;

    while let Some(event) = event_rx.recv().await {
        match event {
            ClientEvent::Connected => {
                match handle.probe_clock().await {
                    Ok(instant) => viewport.jump_to_now(instant),
                    Err(err) => error!(event = "clock_probe_failed", error = %err),
                }
            }
            ClientEvent::Disconnected => {
                info!(event = "hub_disconnected");
            }
            ClientEvent::SyncAck(instant) => {
                viewport.advance_to(instant);
            }
            ClientEvent::Tick(instant) => {
                viewport.advance_to(instant);
                ticks += 1;
                if ticks % 10 == 0 {
                    let (earliest, latest) = viewport.visible_range();
                    let count = agent.lock().await.len();
                    info!(
                        event = "timeline",
                        tasks = count,
                        visible_from = %earliest,
                        visible_to = %latest
                    );
                }
            }
            ClientEvent::Broadcast(msg) => match msg {
                WireMsg::Created(payload) => {
                    info!(event = "task_created", id = %payload.task.id, title = %payload.task.title);
                }
                WireMsg::Updated(payload) => {
                    info!(event = "task_updated", id = %payload.task.id);
                }
                WireMsg::Deleted(payload) => {
                    info!(event = "task_deleted", id = %payload.id);
                }
                _ => {}
            },
        }
    }

    match link.await {
        Ok(Ok(())) => info!(event = "watch_stop"),
        Ok(Err(err)) => error!(event = "link_failed", error = %err),
        Err(err) => error!(event = "link_panicked", error = %err),
    }
}
