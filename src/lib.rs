//! # comfyui-client
//!
//! Async Rust client for [ComfyUI](https://github.com/comfyanonymous/ComfyUI),
//! the node-based Stable Diffusion backend.
//!
//! Provides a typed workflow graph and builder, a REST client for prompt
//! submission, queue/history management and model discovery, and a shared
//! event-stream connection that tracks many prompts at once.
//!
//! ## Quick Start
//!
//! ```no_run
//! use comfyui_client::{ComfyClient, Txt2ImgRequest, WaitOptions};
//! use std::time::Duration;
//!
//! # async fn example() -> comfyui_client::Result<()> {
//! let client = ComfyClient::new("http://127.0.0.1:8188");
//!
//! // Discover models
//! let checkpoints = client.checkpoints().await?;
//! let checkpoint = &checkpoints[0];
//!
//! // Build a workflow
//! let (workflow, seed) = Txt2ImgRequest::new("a sunset over mountains", checkpoint)
//!     .negative("lowres, blurry")
//!     .steps(25)
//!     .build()?;
//!
//! // Submit and wait with real-time progress
//! let opts = WaitOptions::new().with_timeout(Duration::from_secs(120));
//! let result = client
//!     .execute(&workflow, opts, |p| {
//!         println!("Step {}/{} ({:.0}%)", p.current_step, p.total_steps, p.percentage())
//!     })
//!     .await?;
//!
//! for img in &result.images {
//!     client.save_image(img, format!("out/{}", img.filename)).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Tracking several prompts
//!
//! One [`EventStream`] serves any number of concurrent waits; events are
//! routed to each waiter by `prompt_id`.
//!
//! ```no_run
//! # use comfyui_client::{ComfyClient, Workflow, WaitOptions};
//! # async fn example(client: ComfyClient, a: Workflow, b: Workflow) -> comfyui_client::Result<()> {
//! let events = client.connect_events().await?;
//! let first = client.submit(&a, None).await?;
//! let second = client.submit(&b, None).await?;
//!
//! let (ra, rb) = tokio::join!(
//!     client.wait_for_completion(&events, &first.prompt_id, WaitOptions::new(), |_| {}),
//!     client.wait_for_completion(&events, &second.prompt_id, WaitOptions::new(), |_| {}),
//! );
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod messages;
pub mod records;
pub mod stream;
pub mod template;
pub mod tracker;
pub mod types;
pub mod workflow;

pub use client::ComfyClient;
pub use config::{ClientConfig, ClientConfigBuilder};
pub use error::{ComfyError, Result};
pub use messages::{decode_event, EventMessage, ExecutionErrorData, ServerEvent};
pub use stream::{EventStream, StreamItem, Subscription, WaitOptions};
pub use template::Txt2ImgRequest;
pub use tracker::{JobState, ProgressState, ProgressTracker};
pub use types::{
    ExecutionResult, FolderType, History, HistoryEntry, HistoryStatus, ImageRef, NodeOutput,
    PromptRecord, QueueSnapshot, SubmitResponse, UploadOptions, UploadResponse,
};
pub use workflow::{InputValue, Node, NodeLink, Workflow, WorkflowBuilder};
