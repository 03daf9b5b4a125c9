use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::backend::Backend;
use crate::events::{ANALYSIS_DONE, ANALYSIS_TOKEN, EventBus, SubscriptionSet};
use crate::model::{AnalysisMode, AnalysisPhase, Insight};

const PARSE_FAILURE_MESSAGE: &str = "failed to parse analysis response";

#[derive(Debug, Deserialize)]
struct AnalysisReply {
    #[serde(default)]
    insights: Vec<Insight>,
}

/// Model output is not guaranteed well-formed JSON. Extraction order: fenced
/// code block, first balanced `{...}` span, raw payload.
fn extract_structured_payload(raw: &str) -> &str {
    if let Some(inner) = extract_fenced_block(raw) {
        return inner;
    }
    if let Some(inner) = extract_balanced_object(raw) {
        return inner;
    }
    raw
}

fn extract_fenced_block(raw: &str) -> Option<&str> {
    let start = raw.find("```")?;
    let rest = &raw[start + 3..];
    // Skip a language tag such as "json" on the fence line, if present.
    let body_start = match rest.find('\n') {
        Some(newline)
            if rest[..newline]
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c.is_ascii_whitespace()) =>
        {
            newline + 1
        }
        _ => 0,
    };
    let body = &rest[body_start..];
    let end = body.find("```").unwrap_or(body.len());
    let inner = body[..end].trim();
    (!inner.is_empty()).then_some(inner)
}

fn extract_balanced_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, byte) in raw.as_bytes()[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_insights(raw: &str) -> Result<Vec<Insight>> {
    let extracted = extract_structured_payload(raw);
    let reply: AnalysisReply =
        serde_json::from_str(extracted).context("analysis payload is not valid JSON")?;
    Ok(reply.insights)
}

struct AnalysisState {
    generation: u64,
    phase: AnalysisPhase,
    mode: Option<AnalysisMode>,
    source_text: String,
    token_count: u64,
    insights: Vec<Insight>,
}

/// Submits accumulated output to the analysis service and holds the parsed
/// insights. Tokens stream in only to drive a working indicator; the terminal
/// done event carries the full payload. At most one run is subscribed at a
/// time; a new run tears the previous one down before registering listeners.
pub struct AnalysisController<B: Backend> {
    backend: Arc<B>,
    bus: Arc<EventBus>,
    state: Arc<Mutex<AnalysisState>>,
    subs: SubscriptionSet,
}

impl<B: Backend> AnalysisController<B> {
    pub fn new(bus: Arc<EventBus>, backend: Arc<B>) -> Self {
        Self {
            backend,
            bus,
            state: Arc::new(Mutex::new(AnalysisState {
                generation: 0,
                phase: AnalysisPhase::Idle,
                mode: None,
                source_text: String::new(),
                token_count: 0,
                insights: Vec::new(),
            })),
            subs: SubscriptionSet::default(),
        }
    }

    pub async fn analyze(&mut self, text: &str, mode: AnalysisMode) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }

        self.subs.clear();
        let generation = {
            let mut st = self.state.lock();
            st.generation += 1;
            st.phase = AnalysisPhase::Streaming;
            st.mode = Some(mode);
            st.source_text = text.to_string();
            st.token_count = 0;
            st.insights.clear();
            st.generation
        };

        let state = self.state.clone();
        self.subs.push(self.bus.subscribe(ANALYSIS_TOKEN, move |payload| {
            on_token(&state, generation, payload);
        }));
        let state = self.state.clone();
        self.subs.push(self.bus.subscribe(ANALYSIS_DONE, move |payload| {
            on_done(&state, generation, payload);
        }));

        if let Err(error) = self.backend.submit_analysis(text, mode).await {
            self.subs.clear();
            let mut st = self.state.lock();
            if st.generation == generation {
                st.phase = AnalysisPhase::Failed(format!("{error:#}"));
            }
        }
        Ok(())
    }

    /// User-initiated override of the only-analyze-on-new-text default: same
    /// text, same mode, forced new generation.
    pub async fn reanalyze(&mut self) -> Result<()> {
        let (text, mode) = {
            let st = self.state.lock();
            (st.source_text.clone(), st.mode)
        };
        let Some(mode) = mode else {
            return Ok(());
        };
        self.analyze(&text, mode).await
    }

    pub fn reset(&mut self) {
        self.subs.clear();
        let mut st = self.state.lock();
        st.phase = AnalysisPhase::Idle;
        st.mode = None;
        st.source_text.clear();
        st.token_count = 0;
        st.insights.clear();
    }

    pub fn phase(&self) -> AnalysisPhase {
        self.state.lock().phase.clone()
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn token_count(&self) -> u64 {
        self.state.lock().token_count
    }

    pub fn insights(&self) -> Vec<Insight> {
        self.state.lock().insights.clone()
    }

    pub fn source_text(&self) -> String {
        self.state.lock().source_text.clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.len()
    }
}

fn on_token(state: &Mutex<AnalysisState>, generation: u64, _payload: &Value) {
    let mut st = state.lock();
    if st.generation != generation {
        debug!(generation, current = st.generation, "dropping stale analysis token");
        return;
    }
    st.token_count += 1;
}

fn on_done(state: &Mutex<AnalysisState>, generation: u64, payload: &Value) {
    let raw = match payload.as_str() {
        Some(text) => text.to_string(),
        None => payload.to_string(),
    };

    let mut st = state.lock();
    if st.generation != generation {
        debug!(generation, current = st.generation, "dropping stale analysis payload");
        return;
    }
    match parse_insights(&raw) {
        Ok(insights) => {
            st.insights = insights;
            st.phase = AnalysisPhase::Done;
        }
        Err(error) => {
            // The raw payload stays out of the UI; it is only retained here,
            // on the debug channel, for diagnosis.
            debug!(%error, %raw, "analysis payload rejected");
            st.phase = AnalysisPhase::Failed(PARSE_FAILURE_MESSAGE.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AnalysisController, extract_balanced_object, extract_structured_payload, parse_insights,
    };
    use crate::backend::mock::{MockBackend, MockCall};
    use crate::events::{ANALYSIS_DONE, ANALYSIS_TOKEN, EventBus};
    use crate::model::{AnalysisMode, AnalysisPhase, InsightKind};
    use serde_json::json;

    #[test]
    fn extraction_prefers_fenced_block() {
        let raw = "```json\n{\"insights\":[]}\n```";
        assert_eq!(extract_structured_payload(raw), "{\"insights\":[]}");
        assert_eq!(parse_insights(raw).unwrap(), vec![]);
    }

    #[test]
    fn extraction_finds_balanced_object_amid_prose() {
        let raw = "some preamble {\"insights\":[{\"type\":\"warning\",\"title\":\"t\",\"body\":\"b\"}]} trailing";
        let insights = parse_insights(raw).unwrap();
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].kind, InsightKind::Warning);
        assert_eq!(insights[0].title, "t");
    }

    #[test]
    fn extraction_handles_braces_inside_strings() {
        let raw = r#"note {"insights":[{"type":"warning","title":"{odd}","body":"}"}]} end"#;
        let span = extract_balanced_object(raw).unwrap();
        assert!(span.starts_with("{\"insights\""));
        let insights = parse_insights(raw).unwrap();
        assert_eq!(insights[0].title, "{odd}");
    }

    #[test]
    fn missing_insights_field_defaults_to_empty() {
        assert_eq!(parse_insights(r#"{"verdict":"fine"}"#).unwrap(), vec![]);
    }

    #[test]
    fn garbage_payload_is_a_parse_error() {
        assert!(parse_insights("not json at all").is_err());
    }

    #[tokio::test]
    async fn listeners_registered_before_submit() {
        let bus = EventBus::new();
        let backend = MockBackend::new(bus.clone());
        let mut analysis = AnalysisController::new(bus.clone(), backend.clone());

        analysis
            .analyze("ERROR: oom", AnalysisMode::Logs)
            .await
            .unwrap();

        match &backend.calls()[..] {
            [MockCall::SubmitAnalysis { listeners, mode, output }] => {
                assert_eq!(*listeners, 2, "token + done listeners must exist before submit");
                assert_eq!(*mode, AnalysisMode::Logs);
                assert_eq!(output, "ERROR: oom");
            }
            calls => panic!("unexpected calls: {calls:?}"),
        }
        assert_eq!(analysis.phase(), AnalysisPhase::Streaming);
    }

    #[tokio::test]
    async fn empty_text_is_a_no_op() {
        let bus = EventBus::new();
        let backend = MockBackend::new(bus.clone());
        let mut analysis = AnalysisController::new(bus.clone(), backend.clone());

        analysis.analyze("", AnalysisMode::Logs).await.unwrap();

        assert!(backend.calls().is_empty());
        assert_eq!(analysis.generation(), 0);
        assert_eq!(analysis.phase(), AnalysisPhase::Idle);
    }

    #[tokio::test]
    async fn tokens_drive_the_working_indicator_only() {
        let bus = EventBus::new();
        let backend = MockBackend::new(bus.clone());
        let mut analysis = AnalysisController::new(bus.clone(), backend.clone());

        analysis.analyze("output", AnalysisMode::Logs).await.unwrap();
        bus.emit(ANALYSIS_TOKEN, json!("The"));
        bus.emit(ANALYSIS_TOKEN, json!(" pod"));
        bus.emit(ANALYSIS_TOKEN, json!(" is"));

        assert_eq!(analysis.token_count(), 3);
        assert_eq!(analysis.phase(), AnalysisPhase::Streaming);
        assert!(analysis.insights().is_empty());
    }

    #[tokio::test]
    async fn done_payload_parses_into_insights() {
        let bus = EventBus::new();
        let backend = MockBackend::new(bus.clone());
        let mut analysis = AnalysisController::new(bus.clone(), backend.clone());

        analysis.analyze("output", AnalysisMode::Describe).await.unwrap();
        bus.emit(
            ANALYSIS_DONE,
            json!("```json\n{\"insights\":[{\"type\":\"critical\",\"title\":\"OOM\",\"body\":\"raise limits\",\"command\":\"kubectl top pod\"}]}\n```"),
        );

        assert_eq!(analysis.phase(), AnalysisPhase::Done);
        let insights = analysis.insights();
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].kind, InsightKind::Critical);
        assert_eq!(insights[0].command.as_deref(), Some("kubectl top pod"));
    }

    #[tokio::test]
    async fn unparseable_done_payload_reaches_failed_not_a_crash() {
        let bus = EventBus::new();
        let backend = MockBackend::new(bus.clone());
        let mut analysis = AnalysisController::new(bus.clone(), backend.clone());

        analysis.analyze("output", AnalysisMode::Logs).await.unwrap();
        bus.emit(ANALYSIS_DONE, json!("not json at all"));

        match analysis.phase() {
            AnalysisPhase::Failed(reason) => {
                assert_eq!(reason, "failed to parse analysis response");
                // The raw payload never leaks into the user-visible reason.
                assert!(!reason.contains("not json"));
            }
            phase => panic!("unexpected phase: {phase:?}"),
        }
    }

    #[tokio::test]
    async fn reanalyze_forces_a_new_generation_with_identical_text() {
        let bus = EventBus::new();
        let backend = MockBackend::new(bus.clone());
        let mut analysis = AnalysisController::new(bus.clone(), backend.clone());

        analysis.analyze("same text", AnalysisMode::Logs).await.unwrap();
        let first_generation = analysis.generation();
        bus.emit(ANALYSIS_DONE, json!("{\"insights\":[]}"));
        assert_eq!(analysis.phase(), AnalysisPhase::Done);

        analysis.reanalyze().await.unwrap();

        assert_eq!(analysis.generation(), first_generation + 1);
        assert_eq!(analysis.phase(), AnalysisPhase::Streaming);
        assert_eq!(analysis.subscription_count(), 2, "listeners re-registered");
        assert_eq!(analysis.source_text(), "same text");
        assert_eq!(backend.calls().len(), 2);
    }

    #[tokio::test]
    async fn stale_done_payload_is_dropped() {
        let bus = EventBus::new();
        let backend = MockBackend::new(bus.clone());
        let mut analysis = AnalysisController::new(bus.clone(), backend.clone());

        analysis.analyze("first", AnalysisMode::Logs).await.unwrap();
        let stale_generation = analysis.generation();
        analysis.analyze("second", AnalysisMode::Logs).await.unwrap();

        super::on_done(
            &analysis.state,
            stale_generation,
            &json!("{\"insights\":[{\"type\":\"critical\",\"title\":\"stale\",\"body\":\"\"}]}"),
        );
        assert_eq!(analysis.phase(), AnalysisPhase::Streaming);
        assert!(analysis.insights().is_empty());

        bus.emit(ANALYSIS_DONE, json!("{\"insights\":[]}"));
        assert_eq!(analysis.phase(), AnalysisPhase::Done);
    }

    #[tokio::test]
    async fn submit_failure_marks_failed_and_tears_down() {
        let bus = EventBus::new();
        let backend = MockBackend::new(bus.clone());
        let mut analysis = AnalysisController::new(bus.clone(), backend.clone());
        backend.fail_next_with("ANTHROPIC_API_KEY not set");

        analysis.analyze("output", AnalysisMode::Logs).await.unwrap();

        assert!(matches!(analysis.phase(), AnalysisPhase::Failed(reason) if reason.contains("API_KEY")));
        assert_eq!(bus.listener_count(ANALYSIS_TOKEN), 0);
        assert_eq!(bus.listener_count(ANALYSIS_DONE), 0);
    }
}
