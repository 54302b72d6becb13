//! # hub
//!
//! The single network endpoint: one TCP port serving six WebSocket paths
//! plus `GET /status`. Publish endpoints (`/arduino`, `/imu`, `/camera`,
//! `/flir`, `/firmware`) hold per-endpoint client sets and fan broadcasts
//! out through per-client writer queues; `/control` and `/firmware` also
//! read, routing JSON intents to the supervisor and hex blobs to the
//! firmware programmer. A failing or gone client is dropped from its set
//! and never takes the broadcast down with it; no client handle is shared
//! across endpoints.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::supervisor::Supervisor;

/// Per-client outbound queue depth; a client that cannot drain this is
/// dropped rather than allowed to stall the robot.
const CLIENT_QUEUE_CAP: usize = 32;

/// Motor commands are chatty; log the first and then every Nth.
const MOTOR_LOG_EVERY: u64 = 20;

pub const ENDPOINTS: [&str; 6] = ["arduino", "imu", "camera", "flir", "control", "firmware"];

// ── State ─────────────────────────────────────────────────────────────────────

type ClientId = u64;
type ClientSets = HashMap<&'static str, HashMap<ClientId, mpsc::Sender<Message>>>;

pub struct Hub {
    supervisor: Arc<Supervisor>,
    clients: Mutex<ClientSets>,
    next_client: AtomicU64,
    motor_commands_seen: AtomicU64,
}

pub type SharedHub = Arc<Hub>;

impl Hub {
    pub fn new(supervisor: Arc<Supervisor>) -> SharedHub {
        let mut clients = ClientSets::new();
        for name in ENDPOINTS {
            clients.insert(name, HashMap::new());
        }
        Arc::new(Self {
            supervisor,
            clients: Mutex::new(clients),
            next_client: AtomicU64::new(1),
            motor_commands_seen: AtomicU64::new(0),
        })
    }

    fn add_client(&self, endpoint: &'static str) -> (ClientId, mpsc::Receiver<Message>) {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAP);
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(endpoint)
            .expect("known endpoint")
            .insert(id, tx);
        info!("hub: client {id} joined /{endpoint}");
        (id, rx)
    }

    fn remove_client(&self, endpoint: &'static str, id: ClientId) {
        let removed = self
            .clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(endpoint)
            .and_then(|set| set.remove(&id))
            .is_some();
        if removed {
            info!("hub: client {id} left /{endpoint}");
        }
    }

    pub fn client_count(&self, endpoint: &str) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(endpoint)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    /// Fan a message out to every member of one endpoint; members whose
    /// queue is gone or jammed are dropped on the spot.
    fn broadcast(&self, endpoint: &str, msg: Message) {
        let mut dead = Vec::new();
        {
            let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            let Some(set) = clients.get(endpoint) else { return };
            for (&id, tx) in set {
                if tx.try_send(msg.clone()).is_err() {
                    dead.push(id);
                }
            }
        }
        if !dead.is_empty() {
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(set) = clients.get_mut(endpoint) {
                for id in dead {
                    set.remove(&id);
                    debug!("hub: dropped unresponsive client {id} from /{endpoint}");
                }
            }
        }
    }

    pub fn broadcast_text(&self, endpoint: &str, text: String) {
        self.broadcast(endpoint, Message::Text(text));
    }

    pub fn broadcast_binary(&self, endpoint: &str, bytes: Vec<u8>) {
        self.broadcast(endpoint, Message::Binary(bytes));
    }

    /// First motor command and every 20th thereafter make the log.
    fn motor_command_loggable(&self) -> bool {
        let n = self.motor_commands_seen.fetch_add(1, Ordering::Relaxed);
        n % MOTOR_LOG_EVERY == 0
    }

    /// Direct reply to one client, bypassing the broadcast path.
    fn send_to(&self, endpoint: &str, id: ClientId, msg: Message) {
        let tx = {
            let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            clients.get(endpoint).and_then(|set| set.get(&id).cloned())
        };
        if let Some(tx) = tx {
            if tx.try_send(msg).is_err() {
                let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(set) = clients.get_mut(endpoint) {
                    set.remove(&id);
                }
            }
        }
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

/// Bind the hub and serve until the process ends.
pub async fn serve(hub: SharedHub, port: u16) -> anyhow::Result<()> {
    spawn_pumps(hub.clone());

    let app = Router::new()
        .route("/status", get(status_handler))
        .route("/arduino", get(|ws: WebSocketUpgrade, s: State<SharedHub>| upgrade(ws, s, "arduino")))
        .route("/imu", get(|ws: WebSocketUpgrade, s: State<SharedHub>| upgrade(ws, s, "imu")))
        .route("/camera", get(|ws: WebSocketUpgrade, s: State<SharedHub>| upgrade(ws, s, "camera")))
        .route("/flir", get(|ws: WebSocketUpgrade, s: State<SharedHub>| upgrade(ws, s, "flir")))
        .route("/control", get(|ws: WebSocketUpgrade, s: State<SharedHub>| upgrade(ws, s, "control")))
        .route("/firmware", get(|ws: WebSocketUpgrade, s: State<SharedHub>| upgrade(ws, s, "firmware")))
        .fallback(|| async { StatusCode::NOT_FOUND })
        // Browser dashboards poll /status from arbitrary origins
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(hub);

    let addr = format!("0.0.0.0:{port}");
    info!("🛰  wire hub listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Bridge the supervisor's broadcast channels onto the endpoint sets.
fn spawn_pumps(hub: SharedHub) {
    let sup = hub.supervisor.clone();

    {
        let hub = hub.clone();
        let mut rx = sup.bridge.subscribe_remapped();
        tokio::spawn(async move {
            while let Some(line) = next_broadcast(&mut rx).await {
                hub.broadcast_text("arduino", line);
            }
        });
    }
    {
        let hub = hub.clone();
        let mut rx = sup.subscribe_imu();
        tokio::spawn(async move {
            while let Some(line) = next_broadcast(&mut rx).await {
                hub.broadcast_text("imu", line);
            }
        });
    }
    {
        let hub = hub.clone();
        let mut rx = sup.subscribe_camera();
        tokio::spawn(async move {
            while let Some(jpeg) = next_broadcast(&mut rx).await {
                hub.broadcast_binary("camera", jpeg.to_vec());
            }
        });
    }
    {
        let hub = hub.clone();
        let mut rx = sup.subscribe_flir();
        tokio::spawn(async move {
            while let Some(frame) = next_broadcast(&mut rx).await {
                hub.broadcast_binary("flir", frame.to_vec());
            }
        });
    }
    {
        let hub = hub.clone();
        let mut rx = sup.subscribe_firmware_events();
        tokio::spawn(async move {
            while let Some(event) = next_broadcast(&mut rx).await {
                hub.broadcast_text("firmware", event);
            }
        });
    }
}

/// Next value from a broadcast receiver, riding out lag.
async fn next_broadcast<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Option<T> {
    loop {
        match rx.recv().await {
            Ok(v) => return Some(v),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("hub pump lagged {n} messages");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn status_handler(State(hub): State<SharedHub>) -> axum::Json<Value> {
    let endpoints: serde_json::Map<String, Value> = ENDPOINTS
        .iter()
        .map(|&name| (name.to_string(), json!({ "clients": hub.client_count(name) })))
        .collect();
    axum::Json(json!({
        "server": "roverd",
        "app_version": env!("CARGO_PKG_VERSION"),
        "endpoints": endpoints,
    }))
}

async fn upgrade(ws: WebSocketUpgrade, State(hub): State<SharedHub>, endpoint: &'static str) -> Response {
    ws.on_upgrade(move |socket| handle_client(socket, hub, endpoint))
}

async fn handle_client(mut socket: WebSocket, hub: SharedHub, endpoint: &'static str) {
    let (id, mut outbound) = hub.add_client(endpoint);

    loop {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(msg) => {
                    if socket.send(msg).await.is_err() {
                        break;
                    }
                }
                None => break, // dropped from the set by a failed broadcast
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_incoming_text(&hub, endpoint, id, text).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    debug!("hub: ignoring binary from client {id} on /{endpoint}");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            },
        }
    }

    hub.remove_client(endpoint, id);
}

async fn handle_incoming_text(hub: &SharedHub, endpoint: &'static str, id: ClientId, text: String) {
    match endpoint {
        "control" => {
            let msg: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    warn!("hub: malformed control message from {id}: {e}");
                    return;
                }
            };
            if is_motor_command(&msg) {
                if hub.motor_command_loggable() {
                    info!("control: motor command {msg}");
                }
            } else {
                info!("control: {msg}");
            }
            if let Some(reply) = hub.supervisor.handle_control_message(&msg).await {
                hub.send_to(endpoint, id, Message::Text(reply.to_string()));
            }
        }
        "firmware" => {
            info!("hub: firmware blob received from {id} ({} bytes)", text.len());
            hub.supervisor.start_firmware_upload(text).await;
        }
        _ => debug!("hub: ignoring text from client {id} on /{endpoint}"),
    }
}

/// `{target:"arduino", N:7, …}`: a tank-drive command.
fn is_motor_command(msg: &Value) -> bool {
    msg.get("target").and_then(Value::as_str) == Some("arduino")
        && msg.get("N").and_then(Value::as_u64) == Some(7)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::status::{new_shared_status, EventLog};

    fn test_hub() -> SharedHub {
        let mut config = RuntimeConfig::default();
        config.serial.port = "/dev/nonexistent-roverd-test".into();
        config.flir.enabled = false;
        let sup = Supervisor::start(config, new_shared_status(), EventLog::new());
        Hub::new(sup)
    }

    #[tokio::test]
    async fn clients_join_and_leave_their_endpoint() {
        let hub = test_hub();
        let (id, _rx) = hub.add_client("arduino");
        assert_eq!(hub.client_count("arduino"), 1);
        assert_eq!(hub.client_count("imu"), 0);
        hub.remove_client("arduino", id);
        assert_eq!(hub.client_count("arduino"), 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_members_and_drops_the_dead() {
        let hub = test_hub();
        let (_alive_id, mut alive_rx) = hub.add_client("arduino");
        let (dead_id, dead_rx) = hub.add_client("arduino");
        drop(dead_rx);

        hub.broadcast_text("arduino", "{\"ts\":1}".into());
        match alive_rx.try_recv() {
            Ok(Message::Text(t)) => assert_eq!(t, "{\"ts\":1}"),
            other => panic!("expected text, got {other:?}"),
        }
        // The dead client was removed by the failed send
        assert_eq!(hub.client_count("arduino"), 1);
        let _ = dead_id;
    }

    #[tokio::test]
    async fn broadcasts_do_not_cross_endpoints() {
        let hub = test_hub();
        let (_id, mut imu_rx) = hub.add_client("imu");
        hub.broadcast_text("arduino", "x".into());
        assert!(imu_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn motor_commands_rate_log() {
        let hub = test_hub();
        // First command logs, then every 20th
        let pattern: Vec<bool> = (0..41).map(|_| hub.motor_command_loggable()).collect();
        assert!(pattern[0]);
        assert!(!pattern[1]);
        assert!(pattern[20]);
        assert!(pattern[40]);
        assert_eq!(pattern.iter().filter(|&&b| b).count(), 3);
    }

    #[test]
    fn motor_command_detection() {
        assert!(is_motor_command(&json!({"target":"arduino","N":7,"D1":10,"D2":10})));
        assert!(!is_motor_command(&json!({"target":"arduino","N":6})));
        assert!(!is_motor_command(&json!({"target":"map","cmd":"stop"})));
    }
}
