mod common;

use assert_matches::assert_matches;
use comfyui_client::{
    ComfyClient, ComfyError, FolderType, ImageRef, InputValue, UploadOptions, Workflow,
    WorkflowBuilder,
};
use common::{history_success, MockComfy};
use serde_json::json;

fn sample_workflow() -> Workflow {
    let mut b = WorkflowBuilder::new();
    let ckpt = b.add_node(
        "CheckpointLoaderSimple",
        [("ckpt_name", InputValue::from("v1-5-pruned.safetensors"))],
    );
    let save = b.add_node("SaveImage", [("filename_prefix", InputValue::from("test"))]);
    b.connect(&ckpt, 2, &save, "images").unwrap();
    b.build()
}

#[tokio::test]
async fn submit_sends_graph_and_client_id() {
    let mock = MockComfy::start().await;
    mock.route(
        "POST /prompt",
        200,
        r#"{"prompt_id": "abc", "number": 7, "node_errors": {}}"#,
    );

    let resp = mock
        .client()
        .submit(&sample_workflow(), Some(json!({"extra_pnginfo": {"k": 1}}).as_object().unwrap().clone()))
        .await
        .unwrap();
    assert_eq!(resp.prompt_id, "abc");
    assert_eq!(resp.number, 7);

    let sent = mock.requests_to("POST", "/prompt");
    assert_eq!(sent.len(), 1);
    let body = sent[0].json();
    assert_eq!(body["client_id"], "test-client");
    assert_eq!(body["prompt"]["2"]["class_type"], "SaveImage");
    assert_eq!(body["prompt"]["2"]["inputs"]["images"], json!(["1", 2]));
    assert_eq!(body["extra_data"]["extra_pnginfo"]["k"], 1);
}

#[tokio::test]
async fn submit_with_node_errors_is_rejected() {
    let mock = MockComfy::start().await;
    mock.route(
        "POST /prompt",
        200,
        r#"{"prompt_id": "abc", "number": 1, "node_errors": {"1": {"errors": [], "class_type": "CheckpointLoaderSimple"}}}"#,
    );

    let err = mock.client().submit(&sample_workflow(), None).await.unwrap_err();
    assert_matches!(err, ComfyError::RemoteRejection { node_errors } if node_errors.get("1").is_some());
}

#[tokio::test]
async fn validation_failure_status_carries_node_errors() {
    let mock = MockComfy::start().await;
    mock.route(
        "POST /prompt",
        400,
        r#"{"error": {"type": "prompt_outputs_failed_validation"}, "node_errors": {"1": {"errors": [{"type": "value_not_in_list"}]}}}"#,
    );

    let err = mock.client().submit(&sample_workflow(), None).await.unwrap_err();
    assert_matches!(err, ComfyError::RemoteRejection { .. });
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn empty_workflow_is_not_sent() {
    let mock = MockComfy::start().await;
    let err = mock.client().submit(&Workflow::new(), None).await.unwrap_err();
    assert_matches!(err, ComfyError::EmptyGraph);
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn submit_from_file_loads_json() {
    let mock = MockComfy::start().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graph.json");
    sample_workflow().to_file(&path).unwrap();

    let resp = mock.client().submit_from_file(&path, None).await.unwrap();
    assert_eq!(resp.prompt_id, "generated-id");
    assert_eq!(mock.requests_to("POST", "/prompt")[0].json()["prompt"]["1"]["inputs"]["ckpt_name"], "v1-5-pruned.safetensors");
}

#[tokio::test]
async fn queue_decodes_tuple_records() {
    let mock = MockComfy::start().await;
    mock.route(
        "GET /queue",
        200,
        json!({
            "queue_running": [[5, "run-1", {"3": {"class_type": "KSampler", "inputs": {"seed": 1}}}, {}, ["9"]]],
            "queue_pending": [
                [7, "pend-2", {}, {"client_id": "x"}, []],
                [6, "pend-1", {}]
            ]
        })
        .to_string(),
    );

    let queue = mock.client().queue().await.unwrap();
    assert_eq!(queue.running_count(), 1);
    assert_eq!(queue.running[0].prompt_id, "run-1");
    assert_eq!(queue.running[0].workflow.node("3").unwrap().class_type, "KSampler");
    assert_eq!(queue.pending[1].extra_data, None);
    assert_eq!(queue.pending_position("pend-1"), Some(0));
}

#[tokio::test]
async fn malformed_queue_slot_names_its_location() {
    let mock = MockComfy::start().await;
    mock.route(
        "GET /queue",
        200,
        r#"{"queue_running": [], "queue_pending": [[1, "ok", {}], [2, "short"]]}"#,
    );

    let err = mock.client().queue().await.unwrap_err();
    assert_matches!(err, ComfyError::MalformedRecord { location, .. } if location == "queue_pending[1]");
}

#[tokio::test]
async fn history_entry_and_missing_entry() {
    let mock = MockComfy::start().await;
    mock.route("GET /history/abc", 200, history_success("abc"));
    mock.route("GET /history/nope", 200, "{}");
    let client = mock.client();

    let entry = client.history_entry("abc").await.unwrap().unwrap();
    assert_eq!(entry.prompt.number, 3);
    assert_eq!(entry.prompt.outputs_to_execute.as_deref(), Some(&["9".to_string()][..]));
    assert_eq!(entry.images()[0].filename, "ComfyUI_00001_.png");
    assert!(entry.status.completed);

    assert!(client.history_entry("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn server_errors_surface_status_and_body() {
    let mock = MockComfy::start().await;
    mock.route("GET /system_stats", 500, "boom");

    let err = mock.client().system_stats().await.unwrap_err();
    assert!(err.is_retryable());
    assert_matches!(err, ComfyError::Http { status: 500, body } if body == "boom");
}

#[tokio::test]
async fn unreachable_server_is_network_error() {
    // Bind and drop to get a port nothing listens on.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let client = ComfyClient::new(format!("http://127.0.0.1:{}", port));

    let err = client.health().await.unwrap_err();
    assert_matches!(err, ComfyError::Network { .. });
    assert!(err.is_retryable());
}

#[tokio::test]
async fn queue_and_history_management_bodies() {
    let mock = MockComfy::start().await;
    for key in ["POST /queue", "POST /history", "POST /interrupt", "POST /free"] {
        mock.route(key, 200, "{}");
    }
    let client = mock.client();

    client.delete_from_queue(&["a", "b"]).await.unwrap();
    client.clear_queue().await.unwrap();
    client.delete_history(&["c"]).await.unwrap();
    client.clear_history().await.unwrap();
    client.interrupt(Some("a")).await.unwrap();
    client.free_memory(true, false).await.unwrap();

    let queue = mock.requests_to("POST", "/queue");
    assert_eq!(queue[0].json(), json!({"delete": ["a", "b"]}));
    assert_eq!(queue[1].json(), json!({"clear": true}));
    let history = mock.requests_to("POST", "/history");
    assert_eq!(history[0].json(), json!({"delete": ["c"]}));
    assert_eq!(history[1].json(), json!({"clear": true}));
    assert_eq!(mock.requests_to("POST", "/interrupt")[0].json(), json!({"prompt_id": "a"}));
    assert_eq!(
        mock.requests_to("POST", "/free")[0].json(),
        json!({"unload_models": true, "free_memory": false})
    );
}

#[tokio::test]
async fn model_discovery() {
    let mock = MockComfy::start().await;
    mock.route(
        "GET /object_info/KSampler",
        200,
        r#"{"KSampler": {"input": {"required": {"sampler_name": [["euler", "dpmpp_2m"]], "scheduler": [["karras"]]}}}}"#,
    );
    mock.route("GET /models/loras", 200, r#"["detail.safetensors"]"#);
    mock.route("GET /embeddings", 200, r#"["easynegative"]"#);
    let client = mock.client();

    assert_eq!(client.samplers().await.unwrap(), vec!["euler", "dpmpp_2m"]);
    assert_eq!(client.schedulers().await.unwrap(), vec!["karras"]);
    // No route for the checkpoint loader: the mock answers 404.
    assert!(client.checkpoints().await.unwrap().is_empty());
    assert_eq!(client.models(Some("loras")).await.unwrap(), vec!["detail.safetensors"]);
    assert_eq!(client.embeddings().await.unwrap(), vec!["easynegative"]);
}

#[tokio::test]
async fn upload_sends_multipart_fields() {
    let mock = MockComfy::start().await;
    mock.route(
        "POST /upload/image",
        200,
        r#"{"name": "mask.png", "subfolder": "masks", "type": "input"}"#,
    );

    let opts = UploadOptions {
        subfolder: Some("masks".into()),
        overwrite: true,
        ..Default::default()
    };
    let uploaded = mock
        .client()
        .upload_image_bytes(b"\x89PNG fake".to_vec(), "mask.png", &opts)
        .await
        .unwrap();
    assert_eq!(uploaded.image_ref().subfolder, "masks");
    assert_eq!(uploaded.folder_type, FolderType::Input);

    let body = mock.requests_to("POST", "/upload/image")[0].body_text();
    assert!(body.contains("name=\"image\"; filename=\"mask.png\""));
    assert!(body.contains("name=\"type\"\r\n\r\ninput"));
    assert!(body.contains("name=\"subfolder\"\r\n\r\nmasks"));
    assert!(body.contains("name=\"overwrite\"\r\n\r\ntrue"));
}

#[tokio::test]
async fn save_image_creates_parent_directories() {
    let mock = MockComfy::start().await;
    mock.route("GET /view", 200, "not really a png");
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("nested/deeper/out.png");

    let img = ImageRef {
        filename: "ComfyUI_00001_.png".into(),
        subfolder: "batch".into(),
        folder_type: FolderType::Temp,
    };
    mock.client().save_image(&img, &target).await.unwrap();

    assert_eq!(std::fs::read_to_string(&target).unwrap(), "not really a png");
    let view = &mock.requests_to("GET", "/view")[0];
    assert!(view.target.contains("filename=ComfyUI_00001_.png"));
    assert!(view.target.contains("subfolder=batch"));
    assert!(view.target.contains("type=temp"));
}
