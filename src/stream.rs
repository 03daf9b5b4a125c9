use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::backend::Backend;
use crate::events::{
    COMMAND_DONE, COMMAND_LINE, EventBus, LOG_DONE, LOG_ERROR, LOG_LINE, SubscriptionSet,
};
use crate::model::{AnnotatedLine, LineSeverity, StreamPhase, Target};

const ERROR_PATTERNS: [&str; 4] = ["error", "fatal", "oomkill", "crashloop"];
const WARNING_PATTERNS: [&str; 2] = ["warning", "backoff"];

// Error patterns are checked first, so a line matching both families ends up
// annotated as an error.
pub fn classify_line(text: &str) -> LineSeverity {
    let lowered = text.to_ascii_lowercase();
    if ERROR_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
    {
        return LineSeverity::Error;
    }
    if WARNING_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
    {
        return LineSeverity::Warning;
    }
    LineSeverity::Normal
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StreamKind {
    Describe,
    Logs {
        tail_lines: Option<u32>,
        follow: bool,
    },
    Command {
        command: String,
    },
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StreamRequest {
    pub target: Target,
    pub kind: StreamKind,
}

struct StreamState {
    generation: u64,
    request: Option<StreamRequest>,
    lines: Vec<AnnotatedLine>,
    accumulated: String,
    phase: StreamPhase,
}

impl StreamState {
    fn append(&mut self, text: &str) {
        self.lines.push(AnnotatedLine {
            text: text.to_string(),
            severity: classify_line(text),
        });
        if !self.accumulated.is_empty() {
            self.accumulated.push('\n');
        }
        self.accumulated.push_str(text);
    }
}

/// Fetches (describe) or streams (logs, raw command) pod output into an
/// annotated line list. One run live at a time; superseding a run tears the
/// previous generation's listeners down before the next trigger.
pub struct StreamedOutputController<B: Backend> {
    backend: Arc<B>,
    bus: Arc<EventBus>,
    state: Arc<Mutex<StreamState>>,
    subs: SubscriptionSet,
}

impl<B: Backend> StreamedOutputController<B> {
    pub fn new(bus: Arc<EventBus>, backend: Arc<B>) -> Self {
        Self {
            backend,
            bus,
            state: Arc::new(Mutex::new(StreamState {
                generation: 0,
                request: None,
                lines: Vec::new(),
                accumulated: String::new(),
                phase: StreamPhase::Idle,
            })),
            subs: SubscriptionSet::default(),
        }
    }

    pub async fn run(&mut self, request: StreamRequest) -> anyhow::Result<()> {
        self.cancel();
        let generation = {
            let mut st = self.state.lock();
            st.generation += 1;
            st.request = Some(request.clone());
            st.lines.clear();
            st.accumulated.clear();
            st.phase = StreamPhase::Loading;
            st.generation
        };

        match request.kind {
            StreamKind::Describe => {
                let outcome = self.backend.describe(&request.target).await;
                let mut st = self.state.lock();
                if st.generation != generation {
                    return Ok(());
                }
                match outcome {
                    Ok(text) => {
                        for line in text.lines() {
                            st.append(line);
                        }
                        st.phase = StreamPhase::Complete;
                    }
                    Err(error) => {
                        st.append(&format!("describe failed: {error:#}"));
                        st.phase = StreamPhase::Failed(format!("{error:#}"));
                    }
                }
            }
            StreamKind::Logs { tail_lines, follow } => {
                self.subscribe_line_events(generation, LOG_LINE, Some(LOG_ERROR), LOG_DONE);
                let outcome = self
                    .backend
                    .stream_logs(&request.target, tail_lines, follow)
                    .await;
                self.finish_trigger(generation, outcome, "log stream failed");
            }
            StreamKind::Command { ref command } => {
                self.subscribe_line_events(generation, COMMAND_LINE, None, COMMAND_DONE);
                let outcome = self.backend.run_command(&request.target, command).await;
                self.finish_trigger(generation, outcome, "command failed");
            }
        }
        Ok(())
    }

    fn subscribe_line_events(
        &mut self,
        generation: u64,
        line_event: &str,
        error_event: Option<&str>,
        done_event: &str,
    ) {
        let state = self.state.clone();
        self.subs.push(self.bus.subscribe(line_event, move |payload| {
            on_line(&state, generation, payload);
        }));
        if let Some(error_event) = error_event {
            let state = self.state.clone();
            self.subs.push(self.bus.subscribe(error_event, move |payload| {
                on_stream_error(&state, generation, payload);
            }));
        }
        let state = self.state.clone();
        self.subs.push(self.bus.subscribe(done_event, move |payload| {
            on_done(&state, generation, payload);
        }));
    }

    fn finish_trigger(
        &mut self,
        generation: u64,
        outcome: anyhow::Result<()>,
        label: &str,
    ) {
        if let Err(error) = outcome {
            self.subs.clear();
            let mut st = self.state.lock();
            if st.generation == generation {
                st.append(&format!("{label}: {error:#}"));
                st.phase = StreamPhase::Failed(format!("{error:#}"));
            }
        }
    }

    pub fn cancel(&mut self) {
        self.subs.clear();
    }

    pub fn phase(&self) -> StreamPhase {
        self.state.lock().phase.clone()
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn lines(&self) -> Vec<AnnotatedLine> {
        self.state.lock().lines.clone()
    }

    pub fn line_count(&self) -> usize {
        self.state.lock().lines.len()
    }

    pub fn accumulated_text(&self) -> String {
        self.state.lock().accumulated.clone()
    }

    pub fn request(&self) -> Option<StreamRequest> {
        self.state.lock().request.clone()
    }
}

fn on_line(state: &Mutex<StreamState>, generation: u64, payload: &Value) {
    let mut st = state.lock();
    if st.generation != generation {
        debug!(generation, current = st.generation, "dropping stale output line");
        return;
    }
    let Some(text) = payload.as_str() else {
        return;
    };
    st.append(text);
    if st.phase == StreamPhase::Loading {
        st.phase = StreamPhase::Streaming;
    }
}

// A mid-stream fault is rendered inline; the backend may keep producing, so
// the phase is left alone.
fn on_stream_error(state: &Mutex<StreamState>, generation: u64, payload: &Value) {
    let mut st = state.lock();
    if st.generation != generation {
        debug!(generation, current = st.generation, "dropping stale stream error");
        return;
    }
    let text = payload.as_str().unwrap_or("stream error");
    st.lines.push(AnnotatedLine {
        text: text.to_string(),
        severity: LineSeverity::Error,
    });
}

fn on_done(state: &Mutex<StreamState>, generation: u64, _payload: &Value) {
    let mut st = state.lock();
    if st.generation != generation {
        debug!(generation, current = st.generation, "dropping stale stream done");
        return;
    }
    st.phase = StreamPhase::Complete;
}
