use std::time::{Duration, Instant};

use crate::messages::{percentage, ExecutionErrorData, ServerEvent};

/// Lifecycle of one tracked prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Created, no node has started yet.
    Idle,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Client-side view of one prompt's execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressState {
    pub prompt_id: String,
    pub state: JobState,
    pub current_node: Option<String>,
    /// Nodes that finished or were served from cache.
    pub completed_nodes: u32,
    pub current_step: u64,
    pub total_steps: u64,
    pub started_at: Instant,
    pub finished_at: Option<Instant>,
    pub error: Option<ExecutionErrorData>,
}

impl ProgressState {
    fn new(prompt_id: String) -> Self {
        Self {
            prompt_id,
            state: JobState::Idle,
            current_node: None,
            completed_nodes: 0,
            current_step: 0,
            total_steps: 0,
            started_at: Instant::now(),
            finished_at: None,
            error: None,
        }
    }

    /// Step progress of the current node, `0..=100`.
    pub fn percentage(&self) -> f64 {
        percentage(self.current_step, self.total_steps)
    }

    /// Time since tracking began, frozen once a terminal state is reached.
    pub fn elapsed(&self) -> Duration {
        match self.finished_at {
            Some(end) => end.duration_since(self.started_at),
            None => self.started_at.elapsed(),
        }
    }

    /// Remaining time extrapolated from step progress. `None` until the
    /// first step has been reported.
    pub fn eta(&self) -> Option<Duration> {
        let pct = self.percentage();
        if pct <= 0.0 {
            return None;
        }
        let elapsed = self.elapsed().as_secs_f64();
        let remaining = elapsed / (pct / 100.0) - elapsed;
        Some(Duration::from_secs_f64(remaining.max(0.0)))
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// State machine folding event-stream messages into a [`ProgressState`]
/// for a single prompt.
///
/// Events carrying a different `prompt_id` are ignored. Events without one
/// (bare `progress` frames) are assumed to belong to the tracked prompt;
/// routing such frames to the right tracker is the caller's job.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    state: ProgressState,
}

impl ProgressTracker {
    pub fn new(prompt_id: impl Into<String>) -> Self {
        Self {
            state: ProgressState::new(prompt_id.into()),
        }
    }

    pub fn prompt_id(&self) -> &str {
        &self.state.prompt_id
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    pub fn into_state(self) -> ProgressState {
        self.state
    }

    /// Apply one event. Returns `true` when the state changed.
    pub fn apply(&mut self, event: &ServerEvent) -> bool {
        if let Some(id) = event.prompt_id() {
            if id != self.state.prompt_id {
                return false;
            }
        }
        if self.state.is_terminal() {
            if matches!(event, ServerEvent::Executing(_) | ServerEvent::ExecutionError(_)) {
                tracing::debug!(
                    prompt_id = %self.state.prompt_id,
                    kind = event.kind(),
                    "Ignoring event for finished prompt",
                );
            }
            return false;
        }

        match event {
            ServerEvent::Executing(data) if data.is_finished() => {
                self.finish(JobState::Completed);
                true
            }
            ServerEvent::Executing(data) => {
                self.state.current_node = data.node.clone();
                if self.state.state == JobState::Idle {
                    self.state.state = JobState::Running;
                    tracing::debug!(prompt_id = %self.state.prompt_id, "Prompt started");
                }
                true
            }
            ServerEvent::Progress(data) => {
                self.state.current_step = data.value;
                self.state.total_steps = data.max;
                true
            }
            ServerEvent::Executed(_) => {
                self.state.completed_nodes += 1;
                true
            }
            ServerEvent::ExecutionCached(data) if !data.nodes.is_empty() => {
                self.state.completed_nodes += data.nodes.len() as u32;
                true
            }
            ServerEvent::ExecutionError(data) => {
                self.state.error = Some(data.clone());
                self.finish(JobState::Failed);
                true
            }
            _ => false,
        }
    }

    fn finish(&mut self, state: JobState) {
        self.state.state = state;
        self.state.finished_at = Some(Instant::now());
        tracing::debug!(
            prompt_id = %self.state.prompt_id,
            state = ?state,
            elapsed_ms = self.state.elapsed().as_millis() as u64,
            "Prompt finished",
        );
    }
}
