#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};

/// Commands a test pushes at the currently connected client.
enum ServerCommand {
    Frame(String),
    Close,
}

/// A scripted REST response: status plus rate-limit headers.
#[derive(Clone)]
pub struct ScriptedResponse {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: Value,
}

impl ScriptedResponse {
    pub fn ok() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: json!({ "data": {} }),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

#[derive(Clone)]
struct MockState {
    heartbeat_interval_ms: u64,
    /// Sender for the most recent gateway connection.
    conn: Arc<Mutex<Option<mpsc::UnboundedSender<ServerCommand>>>>,
    identifies: Arc<Mutex<Vec<Value>>>,
    resumes: Arc<Mutex<Vec<Value>>>,
    heartbeats: Arc<Mutex<Vec<Value>>>,
    connections: Arc<AtomicUsize>,
    ack_heartbeats: Arc<AtomicBool>,
    rest_script: Arc<Mutex<VecDeque<ScriptedResponse>>>,
    rest_hits: Arc<AtomicUsize>,
}

/// An in-process accord server fake: a ws endpoint speaking the gateway
/// handshake plus the REST routes the client calls, scripted by tests.
pub struct MockServer {
    pub http_url: String,
    pub ws_url: String,
    state: MockState,
}

/// Once-per-process tracing setup so `RUST_LOG` works in test runs.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "accordclient=debug".into()),
        )
        .try_init();
}

impl MockServer {
    pub async fn spawn() -> Self {
        Self::spawn_with_interval(45_000).await
    }

    pub async fn spawn_with_interval(heartbeat_interval_ms: u64) -> Self {
        init_tracing();
        let state = MockState {
            heartbeat_interval_ms,
            conn: Arc::new(Mutex::new(None)),
            identifies: Arc::new(Mutex::new(Vec::new())),
            resumes: Arc::new(Mutex::new(Vec::new())),
            heartbeats: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(AtomicUsize::new(0)),
            ack_heartbeats: Arc::new(AtomicBool::new(true)),
            rest_script: Arc::new(Mutex::new(VecDeque::new())),
            rest_hits: Arc::new(AtomicUsize::new(0)),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ws_url = format!("ws://127.0.0.1:{}/ws", addr.port());

        let app = Router::new()
            .route("/ws", get(ws_upgrade))
            .route("/api/v1/gateway", get(get_gateway))
            .route("/api/v1/channels/{channel_id}", get(scripted_route))
            .with_state(MockStateWithUrl {
                state: state.clone(),
                ws_url: ws_url.clone(),
            });

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            http_url: format!("http://127.0.0.1:{}", addr.port()),
            ws_url,
            state,
        }
    }

    /// Push a frame at the connected client.
    pub async fn send_frame(&self, frame: Value) {
        let conn = self.state.conn.lock().await;
        let tx = conn.as_ref().expect("no gateway connection");
        tx.send(ServerCommand::Frame(frame.to_string())).unwrap();
    }

    pub async fn dispatch(&self, seq: u64, event_type: &str, data: Value) {
        self.send_frame(json!({
            "op": 0,
            "seq": seq,
            "type": event_type,
            "data": data
        }))
        .await;
    }

    /// Drop the current connection from the server side.
    pub async fn kill_connection(&self) {
        let conn = self.state.conn.lock().await;
        if let Some(tx) = conn.as_ref() {
            let _ = tx.send(ServerCommand::Close);
        }
    }

    pub async fn identifies(&self) -> Vec<Value> {
        self.state.identifies.lock().await.clone()
    }

    pub async fn resumes(&self) -> Vec<Value> {
        self.state.resumes.lock().await.clone()
    }

    pub async fn heartbeats(&self) -> Vec<Value> {
        self.state.heartbeats.lock().await.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn suppress_heartbeat_acks(&self) {
        self.state.ack_heartbeats.store(false, Ordering::SeqCst);
    }

    /// Queue REST responses for `/api/v1/channels/{id}`; once the script
    /// runs dry the route answers plain 200s.
    pub async fn script_rest(&self, responses: Vec<ScriptedResponse>) {
        self.state.rest_script.lock().await.extend(responses);
    }

    pub fn rest_hits(&self) -> usize {
        self.state.rest_hits.load(Ordering::SeqCst)
    }

    /// Wait until a gateway connection is up (HELLO sent).
    pub async fn wait_for_connection(&self) {
        for _ in 0..200 {
            if self.state.conn.lock().await.is_some() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        panic!("no gateway connection within 5s");
    }
}

#[derive(Clone)]
struct MockStateWithUrl {
    state: MockState,
    ws_url: String,
}

async fn get_gateway(State(state): State<MockStateWithUrl>) -> axum::Json<Value> {
    axum::Json(json!({ "data": { "url": state.ws_url } }))
}

async fn scripted_route(State(state): State<MockStateWithUrl>) -> Response {
    state.state.rest_hits.fetch_add(1, Ordering::SeqCst);
    let scripted = state
        .state
        .rest_script
        .lock()
        .await
        .pop_front()
        .unwrap_or_else(ScriptedResponse::ok);

    let mut response = axum::http::Response::builder().status(scripted.status);
    for (name, value) in &scripted.headers {
        response = response.header(*name, value);
    }
    response
        .header("Content-Type", "application/json")
        .body(axum::body::Body::from(scripted.body.to_string()))
        .unwrap()
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<MockStateWithUrl>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.state))
}

async fn handle_socket(socket: WebSocket, state: MockState) {
    let (mut sink, mut stream) = socket.split();

    let hello = json!({
        "op": 5,
        "data": { "heartbeat_interval": state.heartbeat_interval_ms }
    });
    if sink
        .send(Message::Text(hello.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerCommand>();
    let my_tx = tx.clone();
    *state.conn.lock().await = Some(tx);
    state.connections.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(ServerCommand::Frame(frame)) => {
                    if sink.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Some(ServerCommand::Close) | None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let frame: Value = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(_) => continue,
                    };
                    match frame["op"].as_u64() {
                        // IDENTIFY -> READY with a fresh session id
                        Some(2) => {
                            state.identifies.lock().await.push(frame.clone());
                            let n = state.identifies.lock().await.len();
                            let ready = json!({
                                "op": 0,
                                "seq": 1,
                                "type": "ready",
                                "data": { "session_id": format!("sess-{n}") }
                            });
                            if sink.send(Message::Text(ready.to_string().into())).await.is_err() {
                                break;
                            }
                        }
                        // RESUME -> RESUMED at the next sequence
                        Some(3) => {
                            state.resumes.lock().await.push(frame.clone());
                            let seq = frame["data"]["seq"].as_u64().unwrap_or(0) + 1;
                            let resumed = json!({
                                "op": 0,
                                "seq": seq,
                                "type": "resumed",
                                "data": {}
                            });
                            if sink.send(Message::Text(resumed.to_string().into())).await.is_err() {
                                break;
                            }
                        }
                        // HEARTBEAT -> HEARTBEAT_ACK
                        Some(1) => {
                            state.heartbeats.lock().await.push(frame["data"].clone());
                            if state.ack_heartbeats.load(Ordering::SeqCst) {
                                let ack = json!({ "op": 4 });
                                if sink.send(Message::Text(ack.to_string().into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                        _ => {}
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                _ => {}
            },
        }
    }

    // a reconnect may already have installed its own sender
    let mut conn = state.conn.lock().await;
    if conn.as_ref().is_some_and(|t| t.same_channel(&my_tx)) {
        *conn = None;
    }
}
