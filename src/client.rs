use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::config::ClientConfig;
use crate::error::{ComfyError, Result};
use crate::records::{decode_history, decode_queue};
use crate::stream::{EventStream, Subscription, WaitOptions};
use crate::tracker::{ProgressState, ProgressTracker};
use crate::types::*;
use crate::workflow::Workflow;

fn normalize(endpoint: String) -> String {
    endpoint.trim_end_matches('/').to_string()
}

/// Event-stream URL for an HTTP endpoint.
fn ws_url(endpoint: &str, client_id: &str) -> String {
    format!(
        "{}/ws?clientId={}",
        endpoint
            .replacen("http://", "ws://", 1)
            .replacen("https://", "wss://", 1),
        client_id
    )
}

/// Turn a `/prompt` response body into a [`SubmitResponse`], rejecting it if
/// the server reported any node errors.
fn check_submit_response(body: Value) -> Result<SubmitResponse> {
    if let Some(rejection) = node_errors(&body) {
        return Err(rejection);
    }
    let resp: SubmitResponse = serde_json::from_value(body)
        .map_err(|e| ComfyError::InvalidResponse(format!("Bad /prompt response: {}", e)))?;
    if resp.prompt_id.is_empty() {
        return Err(ComfyError::InvalidResponse("Response missing prompt_id".into()));
    }
    Ok(resp)
}

fn node_errors(body: &Value) -> Option<ComfyError> {
    let errors = body.get("node_errors")?.as_object()?;
    if errors.is_empty() {
        return None;
    }
    Some(ComfyError::RemoteRejection {
        node_errors: Value::Object(errors.clone()),
    })
}

/// The choice list of a combo input, e.g. `KSampler.sampler_name`.
fn choice_list(info: &ObjectInfo, class: &str, input: &str) -> Vec<String> {
    info.get(class)
        .and_then(|c| c.input.required.get(input))
        .and_then(|spec| spec.get(0))
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

/// Async client for a ComfyUI server instance.
///
/// Provides REST methods for prompt submission, queue and history
/// management, uploads, image download and model discovery, plus
/// event-stream based waiting through [`EventStream`].
///
/// # Example
/// ```no_run
/// use comfyui_client::ComfyClient;
///
/// # async fn example() -> comfyui_client::Result<()> {
/// let client = ComfyClient::new("http://127.0.0.1:8188");
/// let healthy = client.health().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ComfyClient {
    http: Client,
    endpoint: String,
    config: ClientConfig,
}

impl ComfyClient {
    /// Create a new client pointing at the given ComfyUI endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_config(endpoint, ClientConfig::default())
    }

    pub fn with_config(endpoint: impl Into<String>, config: ClientConfig) -> Self {
        Self {
            http: Client::new(),
            endpoint: normalize(endpoint.into()),
            config,
        }
    }

    /// Use a custom `reqwest::Client` (for connection pooling, proxies, TLS).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// Set the client ID used for event-stream addressing.
    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.config.client_id = id.into();
        self
    }

    /// Returns the configured endpoint URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns the configured client ID.
    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // ── Request plumbing ────────────────────────────────────────────

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn send(&self, req: RequestBuilder, what: &str) -> Result<Response> {
        req.send().await.map_err(|e| ComfyError::Network {
            context: format!(
                "{} failed: cannot connect to ComfyUI at {}, is the service running?",
                what, self.endpoint
            ),
            source: e,
        })
    }

    async fn ensure_success(resp: Response) -> Result<Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    async fn read_json<T: DeserializeOwned>(resp: Response, what: &str) -> Result<T> {
        let bytes = resp.bytes().await.map_err(|e| ComfyError::Network {
            context: format!("Failed to read ComfyUI {} response", what),
            source: e,
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let req = self
            .http
            .get(self.url(path))
            .timeout(self.config.request_timeout);
        let resp = Self::ensure_success(self.send(req, path).await?).await?;
        Self::read_json(resp, path).await
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let req = self
            .http
            .post(self.url(path))
            .timeout(self.config.request_timeout)
            .json(body);
        Self::ensure_success(self.send(req, path).await?).await?;
        Ok(())
    }

    // ── Health ──────────────────────────────────────────────────────

    /// Check whether ComfyUI is reachable via `/system_stats`.
    pub async fn health(&self) -> Result<bool> {
        let req = self
            .http
            .get(self.url("/system_stats"))
            .timeout(self.config.health_timeout);
        let resp = self.send(req, "Health check").await?;
        Ok(resp.status().is_success())
    }

    pub async fn system_stats(&self) -> Result<SystemStats> {
        self.get_json("/system_stats").await
    }

    /// Server feature flags as reported by `/features`.
    pub async fn features(&self) -> Result<Map<String, Value>> {
        self.get_json("/features").await
    }

    // ── Prompt ──────────────────────────────────────────────────────

    /// Queue a workflow for execution.
    ///
    /// The workflow is validated locally first. A response with non-empty
    /// `node_errors` is returned as [`ComfyError::RemoteRejection`].
    pub async fn submit(
        &self,
        workflow: &Workflow,
        extra_data: Option<Map<String, Value>>,
    ) -> Result<SubmitResponse> {
        self.submit_inner(workflow, extra_data, None).await
    }

    /// Load a workflow from a JSON file and submit it.
    pub async fn submit_from_file(
        &self,
        path: impl AsRef<Path>,
        extra_data: Option<Map<String, Value>>,
    ) -> Result<SubmitResponse> {
        let workflow = Workflow::from_file(path)?;
        self.submit(&workflow, extra_data).await
    }

    async fn submit_inner(
        &self,
        workflow: &Workflow,
        extra_data: Option<Map<String, Value>>,
        prompt_id: Option<&str>,
    ) -> Result<SubmitResponse> {
        workflow.validate()?;

        let mut body = json!({
            "prompt": workflow,
            "client_id": self.config.client_id,
        });
        if let Some(extra) = extra_data {
            body["extra_data"] = Value::Object(extra);
        }
        if let Some(id) = prompt_id {
            body["prompt_id"] = Value::String(id.to_string());
        }

        let req = self
            .http
            .post(self.url("/prompt"))
            .timeout(self.config.request_timeout)
            .json(&body);
        let resp = self.send(req, "Prompt submission").await?;

        // Validation failures come back as 400 with a `node_errors` body.
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            if let Some(rejection) = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|body| node_errors(&body))
            {
                return Err(rejection);
            }
            return Err(ComfyError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        let submitted = check_submit_response(Self::read_json(resp, "/prompt").await?)?;
        tracing::info!(
            prompt_id = %submitted.prompt_id,
            number = submitted.number,
            nodes = workflow.len(),
            "Submitted prompt to ComfyUI",
        );
        Ok(submitted)
    }

    // ── Queue ───────────────────────────────────────────────────────

    /// Current running and pending prompts.
    pub async fn queue(&self) -> Result<QueueSnapshot> {
        let value: Value = self.get_json("/queue").await?;
        decode_queue(&value)
    }

    /// Remove every pending prompt.
    pub async fn clear_queue(&self) -> Result<()> {
        self.post("/queue", &json!({"clear": true})).await
    }

    /// Remove specific pending prompts.
    pub async fn delete_from_queue(&self, prompt_ids: &[&str]) -> Result<()> {
        self.post("/queue", &json!({"delete": prompt_ids})).await
    }

    /// Interrupt execution. With `Some(id)` the server only interrupts if
    /// that prompt is the one running.
    pub async fn interrupt(&self, prompt_id: Option<&str>) -> Result<()> {
        let body = match prompt_id {
            Some(id) => json!({"prompt_id": id}),
            None => json!({}),
        };
        self.post("/interrupt", &body).await
    }

    // ── History ─────────────────────────────────────────────────────

    /// Fetch all history, or the entry for one prompt.
    pub async fn history(&self, prompt_id: Option<&str>) -> Result<History> {
        let path = match prompt_id {
            Some(id) => format!("/history/{}", id),
            None => "/history".to_string(),
        };
        let value: Value = self.get_json(&path).await?;
        decode_history(&value)
    }

    /// Fetch the history entry for a prompt. Returns `None` if not yet available.
    pub async fn history_entry(&self, prompt_id: &str) -> Result<Option<HistoryEntry>> {
        Ok(self.history(Some(prompt_id)).await?.remove(prompt_id))
    }

    pub async fn clear_history(&self) -> Result<()> {
        self.post("/history", &json!({"clear": true})).await
    }

    pub async fn delete_history(&self, prompt_ids: &[&str]) -> Result<()> {
        self.post("/history", &json!({"delete": prompt_ids})).await
    }

    // ── Control ─────────────────────────────────────────────────────

    /// Ask the server to unload models and/or free cached memory.
    pub async fn free_memory(&self, unload_models: bool, free_memory: bool) -> Result<()> {
        self.post(
            "/free",
            &json!({"unload_models": unload_models, "free_memory": free_memory}),
        )
        .await
    }

    // ── Model discovery ─────────────────────────────────────────────

    /// Node class descriptions, for every class or a single one.
    pub async fn object_info(&self, class: Option<&str>) -> Result<ObjectInfo> {
        let path = match class {
            Some(c) => format!("/object_info/{}", c),
            None => "/object_info".to_string(),
        };
        self.get_json(&path).await
    }

    pub async fn embeddings(&self) -> Result<Vec<String>> {
        self.get_json("/embeddings").await
    }

    /// Model folder names, or the files in one folder (e.g. `"loras"`).
    pub async fn models(&self, folder: Option<&str>) -> Result<Vec<String>> {
        let path = match folder {
            Some(f) => format!("/models/{}", f),
            None => "/models".to_string(),
        };
        self.get_json(&path).await
    }

    /// List available checkpoint models from ComfyUI.
    pub async fn checkpoints(&self) -> Result<Vec<String>> {
        self.combo_choices("CheckpointLoaderSimple", "ckpt_name").await
    }

    /// List available sampler algorithms from ComfyUI.
    pub async fn samplers(&self) -> Result<Vec<String>> {
        self.combo_choices("KSampler", "sampler_name").await
    }

    /// List available scheduler algorithms from ComfyUI.
    pub async fn schedulers(&self) -> Result<Vec<String>> {
        self.combo_choices("KSampler", "scheduler").await
    }

    async fn combo_choices(&self, class: &str, input: &str) -> Result<Vec<String>> {
        match self.object_info(Some(class)).await {
            Ok(info) => Ok(choice_list(&info, class, input)),
            // Node class not installed on this server.
            Err(ComfyError::Http { status: 404, .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    // ── Files ───────────────────────────────────────────────────────

    /// Upload image bytes to the server's input folder (or the folder in `opts`).
    pub async fn upload_image_bytes(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        opts: &UploadOptions,
    ) -> Result<UploadResponse> {
        let folder = opts.folder_type.unwrap_or(FolderType::Input);
        let mut form = Form::new()
            .part("image", Part::bytes(bytes).file_name(filename.to_string()))
            .text("type", folder.as_str());
        if let Some(subfolder) = &opts.subfolder {
            form = form.text("subfolder", subfolder.clone());
        }
        if opts.overwrite {
            form = form.text("overwrite", "true");
        }

        let req = self
            .http
            .post(self.url("/upload/image"))
            .timeout(self.config.download_timeout)
            .multipart(form);
        let resp = Self::ensure_success(self.send(req, "Image upload").await?).await?;
        let uploaded: UploadResponse = Self::read_json(resp, "/upload/image").await?;
        tracing::debug!(name = %uploaded.name, "Uploaded image");
        Ok(uploaded)
    }

    /// Upload an image file, keeping its file name.
    pub async fn upload_image(
        &self,
        path: impl AsRef<Path>,
        opts: &UploadOptions,
    ) -> Result<UploadResponse> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ComfyError::Io {
                context: format!("No file name in {}", path.display()),
                source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
            })?;
        let bytes = tokio::fs::read(path).await.map_err(|e| ComfyError::Io {
            context: format!("Failed to read {}", path.display()),
            source: e,
        })?;
        self.upload_image_bytes(bytes, &filename, opts).await
    }

    /// Download an output image by its reference. Returns raw bytes.
    pub async fn image(&self, img: &ImageRef) -> Result<Vec<u8>> {
        let url = reqwest::Url::parse_with_params(
            &self.url("/view"),
            &[
                ("filename", img.filename.as_str()),
                ("subfolder", img.subfolder.as_str()),
                ("type", img.folder_type.as_str()),
            ],
        )
        .map_err(|e| ComfyError::InvalidResponse(format!("Bad image URL: {}", e)))?;

        let req = self.http.get(url).timeout(self.config.download_timeout);
        let resp = self
            .send(req, &format!("Fetching image {}", img.filename))
            .await?;
        let resp = Self::ensure_success(resp).await?;

        let bytes = resp.bytes().await.map_err(|e| ComfyError::Network {
            context: "Failed to read image bytes".into(),
            source: e,
        })?;
        Ok(bytes.to_vec())
    }

    /// Download an image and write it to `path`, creating parent directories.
    pub async fn save_image(&self, img: &ImageRef, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.image(img).await?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await.map_err(|e| ComfyError::Io {
                context: format!("Failed to create {}", dir.display()),
                source: e,
            })?;
        }
        tokio::fs::write(path, &bytes).await.map_err(|e| ComfyError::Io {
            context: format!("Failed to write {}", path.display()),
            source: e,
        })
    }

    // ── Completion waiting ──────────────────────────────────────────

    /// Open an event stream addressed to this client's `client_id`.
    pub async fn connect_events(&self) -> Result<EventStream> {
        EventStream::connect(
            &ws_url(&self.endpoint, &self.config.client_id),
            self.config.event_buffer,
            self.config.connect_timeout,
        )
        .await
    }

    /// Wait on `events` until `prompt_id` completes, then collect its outputs
    /// from `/history`.
    ///
    /// `on_progress` is called after every tracked state change. A prompt
    /// that already finished before this call is answered from history.
    /// Timeout and cancellation end the wait without closing `events`.
    pub async fn wait_for_completion<F>(
        &self,
        events: &EventStream,
        prompt_id: &str,
        opts: WaitOptions,
        on_progress: F,
    ) -> Result<ExecutionResult>
    where
        F: FnMut(&ProgressState),
    {
        let started_at = SystemTime::now();
        let sub = events.subscribe(prompt_id)?;

        if let Some(entry) = self.history_entry(prompt_id).await? {
            if entry.status.is_finished() {
                tracing::debug!(prompt_id, "Prompt already finished, using history");
                return finished_result(prompt_id, entry, started_at);
            }
        }
        self.wait_subscribed(sub, prompt_id, &opts, on_progress, started_at)
            .await
    }

    /// Connect, submit and wait in one call.
    pub async fn execute<F>(
        &self,
        workflow: &Workflow,
        opts: WaitOptions,
        on_progress: F,
    ) -> Result<ExecutionResult>
    where
        F: FnMut(&ProgressState),
    {
        let events = self.connect_events().await?;
        let started_at = SystemTime::now();

        // Register before submitting so no early event is missed.
        let prompt_id = uuid::Uuid::new_v4().to_string();
        let sub = events.subscribe(&prompt_id)?;
        let submitted = self.submit_inner(workflow, None, Some(&prompt_id)).await?;

        if submitted.prompt_id != prompt_id {
            drop(sub);
            return self
                .wait_for_completion(&events, &submitted.prompt_id, opts, on_progress)
                .await;
        }
        self.wait_subscribed(sub, &prompt_id, &opts, on_progress, started_at)
            .await
    }

    async fn wait_subscribed<F>(
        &self,
        mut sub: Subscription,
        prompt_id: &str,
        opts: &WaitOptions,
        on_progress: F,
        started_at: SystemTime,
    ) -> Result<ExecutionResult>
    where
        F: FnMut(&ProgressState),
    {
        let mut tracker = ProgressTracker::new(prompt_id);
        sub.track(&mut tracker, opts, on_progress).await?;
        drop(sub);

        let entry = self.history_entry(prompt_id).await?.ok_or_else(|| {
            ComfyError::InvalidResponse(format!(
                "No history found for prompt {} after completion",
                prompt_id
            ))
        })?;
        finished_result(prompt_id, entry, started_at)
    }
}

fn finished_result(
    prompt_id: &str,
    entry: HistoryEntry,
    started_at: SystemTime,
) -> Result<ExecutionResult> {
    if entry.status.is_error() {
        let data = entry.status.execution_error().unwrap_or_else(|| {
            crate::messages::ExecutionErrorData {
                prompt_id: prompt_id.to_string(),
                exception_message: "Prompt failed without a recorded error".into(),
                ..Default::default()
            }
        });
        return Err(ComfyError::Execution(Box::new(data)));
    }

    let finished_at = SystemTime::now();
    Ok(ExecutionResult {
        prompt_id: prompt_id.to_string(),
        images: entry.images(),
        outputs: entry.outputs,
        status: entry.status,
        started_at,
        finished_at,
        duration: finished_at
            .duration_since(started_at)
            .unwrap_or(Duration::ZERO),
    })
}
