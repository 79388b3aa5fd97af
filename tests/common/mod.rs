//! In-process ComfyUI stand-in: canned HTTP responses plus a scripted
//! event stream, served from one listener like the real server.

#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use comfyui_client::{ClientConfig, ComfyClient};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// One request as the server saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    /// Path without the query string.
    pub path: String,
    /// Full request target including the query string.
    pub target: String,
    pub body: Vec<u8>,
}

impl Recorded {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Default)]
struct Script {
    frames: Vec<String>,
    /// Frames go out once a request whose `"METHOD /path"` starts with this
    /// prefix arrives. `None` sends them as soon as the socket opens.
    trigger: Option<String>,
    close_after: bool,
}

struct MockState {
    routes: Mutex<HashMap<String, VecDeque<(u16, String)>>>,
    requests: Mutex<Vec<Recorded>>,
    script: Mutex<Script>,
    prompt_id: Mutex<String>,
    released: watch::Sender<bool>,
}

pub struct MockComfy {
    pub endpoint: String,
    state: Arc<MockState>,
}

impl MockComfy {
    pub async fn start() -> Self {
        let (released, _) = watch::channel(false);
        let state = Arc::new(MockState {
            routes: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            script: Mutex::new(Script::default()),
            prompt_id: Mutex::new(String::new()),
            released,
        });

        // REST and the event socket share one port, like the real server.
        let app = Router::new()
            .route("/ws", get(events))
            .fallback(canned)
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            endpoint: format!("http://{}", addr),
            state,
        }
    }

    /// Queue a response for `"METHOD /path"`. A key ending in `*` matches by
    /// prefix. The last queued response repeats once the others are used.
    pub fn route(&self, key: &str, status: u16, body: impl Into<String>) {
        self.state
            .routes
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back((status, body.into()));
    }

    /// Event frames to push over the socket. `{prompt_id}` is replaced with
    /// the id from the latest `/prompt` response.
    pub fn script_events(&self, frames: &[&str], trigger: Option<&str>, close_after: bool) {
        *self.state.script.lock().unwrap() = Script {
            frames: frames.iter().map(|f| f.to_string()).collect(),
            trigger: trigger.map(String::from),
            close_after,
        };
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, method: &str, path: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.path == path)
            .collect()
    }

    pub fn client(&self) -> ComfyClient {
        let config = ClientConfig::builder()
            .with_client_id("test-client")
            .with_request_timeout(Duration::from_secs(5))
            .with_connect_timeout(Duration::from_secs(5))
            .build();
        ComfyClient::with_config(&self.endpoint, config)
    }
}

/// Every REST call lands here and is answered from the canned routes.
async fn canned(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let request = Recorded {
        method: method.to_string(),
        path: uri.path().to_string(),
        target: uri
            .path_and_query()
            .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string()),
        body: body.to_vec(),
    };
    let key = format!("{} {}", request.method, request.path);
    state.requests.lock().unwrap().push(request.clone());

    let (status, body) = respond(&state, &key, &request);
    if key == "POST /prompt" {
        if let Some(id) = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("prompt_id").and_then(Value::as_str).map(String::from))
        {
            *state.prompt_id.lock().unwrap() = id;
        }
    }

    let trigger = state.script.lock().unwrap().trigger.clone();
    if trigger.is_some_and(|t| key.starts_with(&t)) {
        state.released.send_replace(true);
    }

    let status = StatusCode::from_u16(status).unwrap();
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

fn respond(state: &MockState, key: &str, request: &Recorded) -> (u16, String) {
    let mut routes = state.routes.lock().unwrap();
    let matched = if routes.contains_key(key) {
        Some(key.to_string())
    } else {
        routes
            .keys()
            .find(|k| k.strip_suffix('*').is_some_and(|prefix| key.starts_with(prefix)))
            .cloned()
    };

    let canned = matched.and_then(|k| {
        let queue = routes.get_mut(&k)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    });

    match canned {
        Some((status, body)) => {
            let id = state.prompt_id.lock().unwrap().clone();
            (status, body.replace("{prompt_id}", &id))
        }
        // Echo a client-chosen id, as the real server does.
        None if key == "POST /prompt" => {
            let id = serde_json::from_slice::<Value>(&request.body)
                .ok()
                .and_then(|v| v.get("prompt_id").and_then(Value::as_str).map(String::from))
                .unwrap_or_else(|| "generated-id".to_string());
            (
                200,
                serde_json::json!({"prompt_id": id, "number": 1, "node_errors": {}}).to_string(),
            )
        }
        None => (404, "{}".to_string()),
    }
}

async fn events(ws: WebSocketUpgrade, State(state): State<Arc<MockState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_events(socket, state))
}

async fn serve_events(socket: WebSocket, state: Arc<MockState>) {
    let (mut sink, mut source) = socket.split();

    let (frames, has_trigger, close_after) = {
        let script = state.script.lock().unwrap();
        (script.frames.clone(), script.trigger.is_some(), script.close_after)
    };
    if has_trigger {
        let mut released = state.released.subscribe();
        let ready = released.wait_for(|r| *r).await.is_ok();
        if !ready {
            return;
        }
    }

    let id = state.prompt_id.lock().unwrap().clone();
    for frame in frames {
        let frame = frame.replace("{prompt_id}", &id);
        if sink.send(Message::Text(frame.into())).await.is_err() {
            return;
        }
    }

    if close_after {
        let _ = sink.send(Message::Close(None)).await;
        return;
    }
    // Hold the connection open until the client goes away.
    while let Some(Ok(_)) = source.next().await {}
}

/// A `/history/{id}` body for a finished prompt with one saved image.
pub fn history_success(prompt_id: &str) -> String {
    serde_json::json!({
        prompt_id: {
            "prompt": [3, prompt_id, {
                "9": {"class_type": "SaveImage", "inputs": {"images": ["8", 0], "filename_prefix": "ComfyUI"}}
            }, {"client_id": "test-client"}, ["9"]],
            "outputs": {
                "9": {"images": [{"filename": "ComfyUI_00001_.png", "subfolder": "", "type": "output"}]}
            },
            "status": {"status_str": "success", "completed": true, "messages": []}
        }
    })
    .to_string()
}

pub fn executing(prompt_id: &str, node: Option<&str>) -> String {
    let node = node.map_or(Value::Null, |n| Value::String(n.to_string()));
    serde_json::json!({"type": "executing", "data": {"prompt_id": prompt_id, "node": node}})
        .to_string()
}

pub fn progress(value: u64, max: u64) -> String {
    serde_json::json!({"type": "progress", "data": {"value": value, "max": max}}).to_string()
}
