//! In-process mock ComfyUI engine for end-to-end coordinator tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use atelier_core::workflow::WorkflowGraph;
use atelier_pipeline::config::EngineConfig;
use atelier_pipeline::fallback::{DiskScanner, OutputScanner};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

pub const JOB_ID: &str = "J1";

/// What the push channel does on one connection.
#[derive(Clone)]
pub enum WsSession {
    /// Send the frames, then close the connection.
    SendThenClose(Vec<String>),
    /// Send the frames, then stay open until the client leaves.
    SendThenHold(Vec<String>),
}

/// Behaviour of the mock engine.
#[derive(Clone, Default)]
pub struct EngineScript {
    /// Per-connection behaviour; connections past the end stay open and silent.
    pub sessions: Vec<WsSession>,
    /// History lookups that return nothing before outputs appear; `None`
    /// means never.
    pub history_ready_after: Option<usize>,
    /// Files listed in history and served by `/view`.
    pub outputs: Vec<String>,
    /// Files served by `/view` but not listed in history.
    pub extra_views: Vec<String>,
    /// Reject submissions with this status and body.
    pub reject: Option<(u16, String)>,
    /// Write a PNG here on the first queue poll (simulates the engine
    /// saving a file the client never hears about).
    pub write_on_queue_poll: Option<PathBuf>,
}

#[derive(Default)]
pub struct Recorded {
    pub submitted: Mutex<Option<Value>>,
    pub ws_client_ids: Mutex<Vec<String>>,
    pub views: Mutex<Vec<String>>,
    pub history_calls: AtomicUsize,
    pub queue_calls: AtomicUsize,
}

#[derive(Clone)]
struct MockState {
    script: Arc<EngineScript>,
    recorded: Arc<Recorded>,
}

pub struct MockEngine {
    pub addr: String,
    pub recorded: Arc<Recorded>,
}

impl MockEngine {
    pub async fn start(script: EngineScript) -> Self {
        let recorded = Arc::new(Recorded::default());
        let state = MockState {
            script: Arc::new(script),
            recorded: Arc::clone(&recorded),
        };

        let app = Router::new()
            .route("/api/prompt", post(submit))
            .route("/api/queue", get(queue))
            .route("/api/history", get(history))
            .route("/view", get(view))
            .route("/ws", get(ws_handler))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, recorded }
    }

    pub fn submitted(&self) -> Value {
        self.recorded
            .submitted
            .lock()
            .unwrap()
            .clone()
            .expect("nothing was submitted")
    }
}

/// Disk scanner that counts how often it is consulted.
#[derive(Default)]
pub struct CountingScanner {
    pub scans: AtomicUsize,
}

impl CountingScanner {
    pub fn count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

impl OutputScanner for CountingScanner {
    fn latest_image(&self, dirs: &[PathBuf], since: SystemTime) -> Option<PathBuf> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        DiskScanner.latest_image(dirs, since)
    }
}

/// Fast timings suitable for tests.
pub fn test_config(server: &str, output_dir: &Path) -> EngineConfig {
    EngineConfig {
        server: server.to_string(),
        request_timeout: Duration::from_secs(5),
        liveness_threshold: Duration::from_secs(2),
        poll_interval: Duration::from_millis(100),
        job_timeout: Some(Duration::from_secs(10)),
        progress_interval: Duration::ZERO,
        reconnect_attempts: 3,
        output_dir: output_dir.to_path_buf(),
        fallback_dirs: Vec::new(),
    }
}

/// Minimal text-to-image template.
pub fn template() -> WorkflowGraph {
    WorkflowGraph::from_value(json!({
        "1": {"class_type": "EmptySD3LatentImage", "inputs": {"width": 512, "height": 512, "batch_size": 1}},
        "3": {"class_type": "SaveImage", "inputs": {"filename_prefix": "renders/portrait"}},
        "9": {"class_type": "BasicScheduler", "inputs": {"scheduler": "simple", "steps": 20, "denoise": 1}},
        "11": {"class_type": "RandomNoise", "inputs": {"noise_seed": 7}}
    }))
    .unwrap()
}

pub fn png_bytes() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(4, 4, image::Rgb([10, 120, 200]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

// ---- frame builders ----

pub fn frame(kind: &str, data: Value) -> String {
    json!({"type": kind, "data": data}).to_string()
}

pub fn executed(job_id: &str, node: &str, filename: &str) -> String {
    frame(
        "executed",
        json!({
            "node": node,
            "prompt_id": job_id,
            "output": {"images": [{"filename": filename, "subfolder": "", "type": "output"}]}
        }),
    )
}

// ---- handlers ----

async fn submit(State(state): State<MockState>, Json(body): Json<Value>) -> Response {
    *state.recorded.submitted.lock().unwrap() = Some(body);
    if let Some((status, body)) = &state.script.reject {
        let status = StatusCode::from_u16(*status).unwrap();
        return (status, body.clone()).into_response();
    }
    Json(json!({"prompt_id": JOB_ID, "number": 1, "node_errors": {}})).into_response()
}

async fn queue(State(state): State<MockState>) -> Json<Value> {
    let call = state.recorded.queue_calls.fetch_add(1, Ordering::SeqCst);
    if call == 0 {
        if let Some(dir) = &state.script.write_on_queue_poll {
            std::fs::create_dir_all(dir).unwrap();
            std::fs::write(dir.join("ComfyUI_00001_.png"), png_bytes()).unwrap();
        }
    }
    Json(json!({"queue_running": [], "queue_pending": []}))
}

async fn history(State(state): State<MockState>) -> Json<Value> {
    let call = state.recorded.history_calls.fetch_add(1, Ordering::SeqCst);
    let ready = state.script.history_ready_after.is_some_and(|after| call >= after);
    if !ready {
        return Json(json!({}));
    }
    let images: Vec<Value> = state
        .script
        .outputs
        .iter()
        .map(|f| json!({"filename": f, "subfolder": "", "type": "output"}))
        .collect();
    Json(json!({ (JOB_ID): {"outputs": {"9": {"images": images}}, "status": {"completed": true}} }))
}

async fn view(State(state): State<MockState>, Query(q): Query<HashMap<String, String>>) -> Response {
    let filename = q.get("filename").cloned().unwrap_or_default();
    state.recorded.views.lock().unwrap().push(filename.clone());
    let known = state.script.outputs.contains(&filename) || state.script.extra_views.contains(&filename);
    if known {
        png_bytes().into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<MockState>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    let client_id = q.get("clientId").cloned().unwrap_or_default();
    let index = {
        let mut ids = state.recorded.ws_client_ids.lock().unwrap();
        ids.push(client_id);
        ids.len() - 1
    };
    let session = state.script.sessions.get(index).cloned();
    ws.on_upgrade(move |socket| play(socket, session))
}

async fn play(mut socket: WebSocket, session: Option<WsSession>) {
    let (frames, hold) = match session {
        Some(WsSession::SendThenClose(frames)) => (frames, false),
        Some(WsSession::SendThenHold(frames)) => (frames, true),
        None => (Vec::new(), true),
    };
    for text in frames {
        if socket.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }
    if hold {
        while let Some(Ok(msg)) = socket.recv().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    } else {
        let _ = socket.send(Message::Close(None)).await;
    }
}
