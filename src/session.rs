use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::events::{EventBus, SESSION_DONE, SESSION_OUTPUT, SubscriptionSet};
use crate::model::{SessionPhase, Target};

const SCROLLBACK_LINES: usize = 2_000;

/// vt100-backed screen the session renders into. Kept separate from the
/// controller so tests can assert on terminal contents without a real PTY.
pub struct TermSurface {
    parser: vt100::Parser,
}

impl TermSurface {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            parser: vt100::Parser::new(rows, cols, SCROLLBACK_LINES),
        }
    }

    pub fn process(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
    }

    pub fn write_notice(&mut self, text: &str) {
        self.parser.process(format!("\r\n{text}\r\n").as_bytes());
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.parser.screen_mut().set_size(rows, cols);
    }

    pub fn reset(&mut self, cols: u16, rows: u16) {
        self.parser = vt100::Parser::new(rows, cols, SCROLLBACK_LINES);
    }

    pub fn contents(&self) -> String {
        self.parser.screen().contents()
    }
}

struct SessionState {
    generation: u64,
    target: Option<Target>,
    dimensions: (u16, u16),
    phase: SessionPhase,
    surface: TermSurface,
}

/// Mediates one interactive shell session against a selected pod. Output and
/// termination arrive as bus events; listeners are registered before the
/// backend is asked to start so no early bytes are lost, and each listener
/// carries the generation it was subscribed under so firings that outlive
/// their session are dropped.
pub struct SessionController<B: Backend> {
    backend: Arc<B>,
    bus: Arc<EventBus>,
    state: Arc<Mutex<SessionState>>,
    subs: SubscriptionSet,
}

impl<B: Backend> SessionController<B> {
    pub fn new(bus: Arc<EventBus>, backend: Arc<B>, cols: u16, rows: u16) -> Self {
        Self {
            backend,
            bus,
            state: Arc::new(Mutex::new(SessionState {
                generation: 0,
                target: None,
                dimensions: (cols, rows),
                phase: SessionPhase::Idle,
                surface: TermSurface::new(cols, rows),
            })),
            subs: SubscriptionSet::default(),
        }
    }

    pub async fn open(&mut self, target: Target) -> anyhow::Result<()> {
        if !target.is_complete() {
            anyhow::bail!("refusing to open session: target {target} is incomplete");
        }

        self.subs.clear();
        let (generation, cols, rows) = {
            let mut st = self.state.lock();
            st.generation += 1;
            st.phase = SessionPhase::Connecting;
            st.target = Some(target.clone());
            let (cols, rows) = st.dimensions;
            st.surface.reset(cols, rows);
            (st.generation, cols, rows)
        };

        let state = self.state.clone();
        self.subs.push(self.bus.subscribe(SESSION_OUTPUT, move |payload| {
            on_output(&state, generation, payload);
        }));
        let state = self.state.clone();
        self.subs.push(self.bus.subscribe(SESSION_DONE, move |payload| {
            on_done(&state, generation, payload);
        }));

        if let Err(error) = self.backend.start_session(&target, cols, rows).await {
            self.subs.clear();
            let mut st = self.state.lock();
            if st.generation == generation {
                st.surface
                    .write_notice(&format!("failed to start session: {error:#}"));
                st.phase = SessionPhase::Failed(format!("{error:#}"));
            }
        }
        Ok(())
    }

    pub async fn send_keystroke(&self, bytes: &[u8]) -> anyhow::Result<()> {
        if self.state.lock().phase != SessionPhase::Active {
            return Ok(());
        }
        self.backend.write_session(bytes).await
    }

    pub async fn resize(&mut self, cols: u16, rows: u16) -> anyhow::Result<()> {
        let forward = {
            let mut st = self.state.lock();
            if st.dimensions == (cols, rows) {
                return Ok(());
            }
            st.dimensions = (cols, rows);
            st.surface.resize(cols, rows);
            matches!(st.phase, SessionPhase::Connecting | SessionPhase::Active)
        };
        if forward {
            self.backend.resize_session(cols, rows).await?;
        }
        Ok(())
    }

    pub async fn close(&mut self) -> anyhow::Result<()> {
        self.subs.clear();
        {
            let mut st = self.state.lock();
            if matches!(st.phase, SessionPhase::Connecting | SessionPhase::Active) {
                st.phase = SessionPhase::Ended;
            }
        }
        // Best-effort: the remote side may already be gone.
        if let Err(error) = self.backend.stop_session().await {
            warn!("stop_session failed: {error:#}");
        }
        Ok(())
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase.clone()
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn dimensions(&self) -> (u16, u16) {
        self.state.lock().dimensions
    }

    pub fn screen_contents(&self) -> String {
        self.state.lock().surface.contents()
    }

    pub fn target(&self) -> Option<Target> {
        self.state.lock().target.clone()
    }
}

fn on_output(state: &Mutex<SessionState>, generation: u64, payload: &Value) {
    let mut st = state.lock();
    if st.generation != generation {
        debug!(generation, current = st.generation, "dropping stale session output");
        return;
    }
    let Some(text) = payload.as_str() else {
        return;
    };
    st.surface.process(text.as_bytes());
    if st.phase == SessionPhase::Connecting {
        st.phase = SessionPhase::Active;
    }
}

fn on_done(state: &Mutex<SessionState>, generation: u64, _payload: &Value) {
    let mut st = state.lock();
    if st.generation != generation {
        debug!(generation, current = st.generation, "dropping stale session-done");
        return;
    }
    st.phase = SessionPhase::Ended;
    st.surface.write_notice("session ended");
}
