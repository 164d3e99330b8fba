//! ComfyUI executor against an in-process mock ComfyUI server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use miktos_comfyui::backoff::BackoffConfig;
use miktos_core::task::{FailureKind, ProgressEvent, TaskState};
use miktos_core::workflow::WorkflowRegistry;
use miktos_pipeline::executor::{
    ComfyUIExecutor, ComfyUIExecutorConfig, ExecutionError, ExecutionJob, Executor, ProgressSink,
};
use miktos_pipeline::orchestrator::BridgeOrchestrator;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Mock server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    /// Stream progress and outputs, then finish.
    Happy,
    /// Record history, then close the socket before any message.
    DropSocket,
    /// Report an execution error.
    Fail,
    /// Start and report a little progress, then never finish.
    Hang,
    /// Answer `/prompt` only after several seconds.
    SlowSubmit,
}

#[derive(Default)]
struct Recorded {
    prompts: Vec<Value>,
    deleted: Vec<String>,
    interrupts: usize,
}

struct MockState {
    mode: Mode,
    sockets: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    history: Mutex<HashMap<String, Value>>,
    recorded: Mutex<Recorded>,
    counter: AtomicUsize,
}

#[derive(Deserialize)]
struct WsQuery {
    #[serde(rename = "clientId")]
    client_id: String,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<MockState>>,
) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, query.client_id, state))
}

async fn serve_socket(mut socket: WebSocket, client_id: String, state: Arc<MockState>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.sockets.lock().insert(client_id, tx);
    while let Some(text) = rx.recv().await {
        if socket.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn wait_for_socket(state: &MockState, client_id: &str) -> Option<mpsc::UnboundedSender<String>> {
    for _ in 0..100 {
        if let Some(tx) = state.sockets.lock().get(client_id).cloned() {
            return Some(tx);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

fn msg(kind: &str, data: Value) -> String {
    json!({"type": kind, "data": data}).to_string()
}

async fn prompt_handler(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Json<Value> {
    if state.mode == Mode::SlowSubmit {
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    let n = state.counter.fetch_add(1, Ordering::SeqCst) + 1;
    let prompt_id = format!("prompt-{n}");
    let client_id = body["client_id"].as_str().unwrap_or_default().to_string();
    let prefix = body["prompt"]["7"]["inputs"]["filename_prefix"]
        .as_str()
        .unwrap_or("texture")
        .to_string();
    state.recorded.lock().prompts.push(body["prompt"].clone());

    let images = json!([{"filename": format!("{prefix}_{n:05}_.png"), "subfolder": "", "type": "output"}]);
    let tx = wait_for_socket(&state, &client_id).await.expect("client socket registered");
    let pid = prompt_id.as_str();

    match state.mode {
        Mode::Happy => {
            state.history.lock().insert(
                prompt_id.clone(),
                json!({"outputs": {"7": {"images": images.clone()}}, "status": {"status_str": "success", "completed": true}}),
            );
            for frame in [
                msg("status", json!({"status": {"exec_info": {"queue_remaining": 1}}})),
                msg("execution_start", json!({"prompt_id": pid})),
                msg("executing", json!({"node": "3", "prompt_id": pid})),
                msg("progress", json!({"value": 1, "max": 2, "prompt_id": pid, "node": "3"})),
                msg("progress", json!({"value": 2, "max": 2, "prompt_id": pid, "node": "3"})),
                msg("executed", json!({"node": "7", "output": {"images": images}, "prompt_id": pid})),
                msg("executing", json!({"node": null, "prompt_id": pid})),
            ] {
                let _ = tx.send(frame);
            }
        }
        Mode::DropSocket => {
            state.history.lock().insert(
                prompt_id.clone(),
                json!({"outputs": {"7": {"images": images}}, "status": {"status_str": "success", "completed": true}}),
            );
            state.sockets.lock().remove(&client_id);
        }
        Mode::Fail => {
            let _ = tx.send(msg("execution_start", json!({"prompt_id": pid})));
            let _ = tx.send(msg(
                "execution_error",
                json!({
                    "prompt_id": pid,
                    "node_id": "4",
                    "exception_message": "checkpoint not found",
                    "exception_type": "FileNotFoundError"
                }),
            ));
        }
        Mode::Hang => {
            let _ = tx.send(msg("execution_start", json!({"prompt_id": pid})));
            let _ = tx.send(msg("progress", json!({"value": 1, "max": 10, "prompt_id": pid})));
        }
        Mode::SlowSubmit => {}
    }

    Json(json!({"prompt_id": prompt_id, "number": n, "node_errors": {}}))
}

async fn history_handler(Path(prompt_id): Path<String>, State(state): State<Arc<MockState>>) -> Json<Value> {
    let mut body = serde_json::Map::new();
    if let Some(entry) = state.history.lock().get(&prompt_id).cloned() {
        body.insert(prompt_id, entry);
    }
    Json(Value::Object(body))
}

async fn queue_handler(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Json<Value> {
    let ids = body["delete"].as_array().cloned().unwrap_or_default();
    state
        .recorded
        .lock()
        .deleted
        .extend(ids.iter().filter_map(Value::as_str).map(str::to_string));
    Json(json!({}))
}

async fn interrupt_handler(State(state): State<Arc<MockState>>) -> Json<Value> {
    state.recorded.lock().interrupts += 1;
    Json(json!({}))
}

async fn start_mock(mode: Mode) -> (String, Arc<MockState>) {
    let state = Arc::new(MockState {
        mode,
        sockets: Mutex::new(HashMap::new()),
        history: Mutex::new(HashMap::new()),
        recorded: Mutex::new(Recorded::default()),
        counter: AtomicUsize::new(0),
    });

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/prompt", post(prompt_handler))
        .route("/history/{prompt_id}", get(history_handler))
        .route("/queue", post(queue_handler))
        .route("/interrupt", post(interrupt_handler))
        .route("/system_stats", get(|| async { Json(json!({"system": {"os": "mock"}})) }))
        .route(
            "/object_info/CheckpointLoaderSimple",
            get(|| async {
                Json(json!({"CheckpointLoaderSimple": {"input": {"required": {
                    "ckpt_name": [["stable-diffusion-xl.safetensors", "v1-5-pruned.ckpt"]]
                }}}}))
            }),
        )
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), state)
}

fn config(base_url: String) -> ComfyUIExecutorConfig {
    ComfyUIExecutorConfig {
        base_url,
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        execution_timeout: Duration::from_secs(10),
        poll_backoff: BackoffConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
        },
    }
}

fn bridge(config: ComfyUIExecutorConfig) -> BridgeOrchestrator {
    BridgeOrchestrator::new(
        Arc::new(WorkflowRegistry::with_builtins()),
        Arc::new(ComfyUIExecutor::new(config).unwrap()),
    )
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<f64>>);

impl ProgressSink for RecordingSink {
    fn report(&self, fraction: f64, _stage: Option<&str>) {
        self.0.lock().push(fraction);
    }
}

fn job(params: Value) -> ExecutionJob {
    ExecutionJob {
        task_id: miktos_core::types::new_task_id(),
        workflow: "basic_texture".to_string(),
        parameters: params.as_object().cloned().unwrap(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pbr_material_renders_each_map_through_comfyui() {
    let (url, state) = start_mock(Mode::Happy).await;
    let bridge = bridge(config(url));

    let (task, subscription) = bridge
        .submit_and_subscribe(
            "pbr_material",
            &json!({"prompt": "rusty metal", "maps": ["diffuse", "normal"], "seed": 99}),
        )
        .unwrap();
    let events: Vec<ProgressEvent> = subscription.into_stream().collect().await;

    let running: Vec<f64> = events.iter().filter(|e| !e.is_terminal()).map(|e| e.progress).collect();
    assert!(running.windows(2).all(|w| w[0] < w[1]), "not strictly increasing: {running:?}");
    assert_eq!(running.last().copied(), Some(1.0));
    assert_eq!(events.last().unwrap().state, TaskState::Succeeded);

    let result = bridge.status(task.id).unwrap().result.unwrap();
    let maps: Vec<_> = result.outputs.iter().filter_map(|o| o.map_type.as_deref()).collect();
    assert_eq!(maps, vec!["diffuse", "normal"]);
    assert_eq!(result.outputs[0].location, "texture_diffuse_00001_.png");
    assert_eq!(result.outputs[0].node_id.as_deref(), Some("7"));
    assert_eq!(result.backend_refs, vec!["prompt-1", "prompt-2"]);
    assert_eq!(result.metadata["executor"], "comfyui");

    let recorded = state.recorded.lock();
    assert_eq!(recorded.prompts.len(), 2);
    assert_eq!(recorded.prompts[0]["3"]["inputs"]["seed"], 99);
    assert_eq!(
        recorded.prompts[1]["1"]["inputs"]["text"],
        "rusty metal, normal map, surface details, purple and blue tones"
    );
}

#[tokio::test]
async fn dropped_socket_falls_back_to_history() {
    let (url, _state) = start_mock(Mode::DropSocket).await;
    let executor = ComfyUIExecutor::new(config(url)).unwrap();
    let sink = RecordingSink::default();

    let result = executor
        .execute(job(json!({"prompt": "moss"})), &sink, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.outputs.len(), 1);
    assert_eq!(result.outputs[0].location, "texture_diffuse_00001_.png");
    assert_eq!(sink.0.lock().last().copied(), Some(1.0));
}

#[tokio::test]
async fn remote_error_is_execution_failed() {
    let (url, _state) = start_mock(Mode::Fail).await;
    let bridge = bridge(config(url));

    let (task, subscription) = bridge
        .submit_and_subscribe("basic_texture", &json!({"prompt": "moss"}))
        .unwrap();
    let last = subscription.into_stream().collect::<Vec<_>>().await.pop().unwrap();
    assert_eq!(last.state, TaskState::Failed);

    let error = bridge.status(task.id).unwrap().error.unwrap();
    assert_eq!(error.kind, FailureKind::ExecutionFailed);
    assert!(error.message.contains("checkpoint not found"));
}

#[tokio::test]
async fn unreachable_server_is_service_unavailable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let bridge = bridge(config(format!("http://127.0.0.1:{port}")));
    let (task, subscription) = bridge
        .submit_and_subscribe("basic_texture", &json!({"prompt": "moss"}))
        .unwrap();

    let events = tokio::time::timeout(Duration::from_secs(5), subscription.into_stream().collect::<Vec<_>>())
        .await
        .expect("unreachable backend must not hang");
    assert_eq!(events.last().unwrap().state, TaskState::Failed);

    let error = bridge.status(task.id).unwrap().error.unwrap();
    assert_eq!(error.kind, FailureKind::ServiceUnavailable);
    assert!(error.kind.is_retryable());

    let health = bridge.health().await;
    assert!(!health.executor_connected);
}

#[tokio::test]
async fn slow_submission_times_out() {
    let (url, _state) = start_mock(Mode::SlowSubmit).await;
    let mut config = config(url);
    config.request_timeout = Duration::from_millis(200);
    let executor = ComfyUIExecutor::new(config).unwrap();

    let err = executor
        .execute(job(json!({"prompt": "moss"})), &RecordingSink::default(), CancellationToken::new())
        .await
        .unwrap_err();
    assert_matches!(err, ExecutionError::Timeout(_));
}

#[tokio::test]
async fn execution_deadline_times_out_and_aborts_prompt() {
    let (url, state) = start_mock(Mode::Hang).await;
    let mut config = config(url);
    config.execution_timeout = Duration::from_millis(300);
    let executor = ComfyUIExecutor::new(config).unwrap();

    let err = executor
        .execute(job(json!({"prompt": "moss"})), &RecordingSink::default(), CancellationToken::new())
        .await
        .unwrap_err();
    assert_matches!(err, ExecutionError::Timeout(_));

    let recorded = state.recorded.lock();
    assert_eq!(recorded.deleted, vec!["prompt-1"]);
    assert_eq!(recorded.interrupts, 1);
}

#[tokio::test]
async fn cancellation_stops_execution_and_aborts_prompt() {
    let (url, state) = start_mock(Mode::Hang).await;
    let executor = ComfyUIExecutor::new(config(url)).unwrap();
    let sink = RecordingSink::default();
    let cancel = CancellationToken::new();

    let run = executor.execute(job(json!({"prompt": "moss"})), &sink, cancel.clone());
    let canceller = async {
        // Cancel once the prompt is visibly running.
        while sink.0.lock().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(run, canceller);

    assert_matches!(result, Err(ExecutionError::Cancelled));
    let reports = sink.0.lock().len();
    assert_eq!(reports, 2);

    let recorded = state.recorded.lock();
    assert_eq!(recorded.deleted, vec!["prompt-1"]);
    assert_eq!(recorded.interrupts, 1);
}

#[tokio::test]
async fn health_and_models_come_from_the_server() {
    let (url, _state) = start_mock(Mode::Happy).await;
    let executor = ComfyUIExecutor::new(config(url)).unwrap();

    assert!(executor.check_connection().await);
    assert_eq!(
        executor.available_models().await.unwrap(),
        vec!["stable-diffusion-xl", "v1-5-pruned"]
    );
}
