use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::AnalysisConfig;
use crate::events::{ANALYSIS_DONE, ANALYSIS_TOKEN, EventBus};
use crate::model::AnalysisMode;

/// Analysis collaborator: posts collected output to an Anthropic-style
/// messages endpoint and relays the SSE token stream onto the bus, finishing
/// with the accumulated text as the terminal payload.
pub struct InsightService {
    bus: Arc<EventBus>,
    http: reqwest::Client,
    config: AnalysisConfig,
}

impl InsightService {
    pub fn new(bus: Arc<EventBus>, config: AnalysisConfig) -> Self {
        Self {
            bus,
            http: reqwest::Client::new(),
            config,
        }
    }

    pub async fn submit(&self, output: &str, mode: AnalysisMode) -> Result<()> {
        let api_key = std::env::var(&self.config.api_key_env)
            .with_context(|| format!("{} not set", self.config.api_key_env))?;
        debug!(
            mode = mode.as_str(),
            bytes = output.len(),
            model = %self.config.model,
            "submitting analysis"
        );

        let body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "stream": true,
            "messages": [
                {"role": "user", "content": build_prompt(mode, output)}
            ]
        });

        let response = self
            .http
            .post(format!("{}/v1/messages", self.config.api_base))
            .header("x-api-key", &api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .context("analysis request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("analysis API returned {}", response.status());
        }

        let bus = self.bus.clone();
        tokio::spawn(consume_stream(response, bus));
        Ok(())
    }
}

async fn consume_stream(mut response: reqwest::Response, bus: Arc<EventBus>) {
    let mut buffer = String::new();
    // SSE lines can straddle chunk boundaries; only complete lines are parsed.
    let mut pending = String::new();

    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                pending.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = pending.find('\n') {
                    let line = pending[..newline].trim_end_matches('\r').to_string();
                    pending.drain(..=newline);
                    if let Some(delta) = sse_text_delta(&line) {
                        buffer.push_str(&delta);
                        bus.emit(ANALYSIS_TOKEN, Value::String(delta));
                    }
                }
            }
            Ok(None) => break,
            Err(error) => {
                // Whatever arrived so far still goes out as the terminal
                // payload; the parser downstream decides whether it's usable.
                warn!("analysis stream interrupted: {error}");
                break;
            }
        }
    }

    bus.emit(ANALYSIS_DONE, Value::String(buffer));
}

fn sse_text_delta(line: &str) -> Option<String> {
    let data = line.strip_prefix("data: ")?;
    if data.trim() == "[DONE]" {
        return None;
    }
    let event: Value = serde_json::from_str(data).ok()?;
    event["delta"]["text"].as_str().map(str::to_string)
}

fn build_prompt(mode: AnalysisMode, output: &str) -> String {
    let (subject, focus) = match mode {
        AnalysisMode::Logs => (
            "these pod logs",
            "1. Any errors, crashes, panics, or fatal issues\n\
             2. Warnings or concerning patterns\n\
             3. Root cause analysis if possible\n\
             4. Specific actionable kubectl commands to fix issues",
        ),
        AnalysisMode::Describe => (
            "this kubectl describe output",
            "1. Any errors, crashes, or critical issues\n\
             2. Warnings or concerning patterns\n\
             3. Specific actionable kubectl commands to fix issues",
        ),
    };

    format!(
        "You are a Kubernetes operations expert. Analyze {subject} and identify:\n\
         {focus}\n\n\
         Respond ONLY with a JSON object:\n\
         {{\n\
           \"insights\": [\n\
             {{\n\
               \"type\": \"critical\" | \"warning\" | \"suggestion\",\n\
               \"title\": \"Short title\",\n\
               \"body\": \"Explanation\",\n\
               \"command\": \"kubectl command if applicable (optional)\"\n\
             }}\n\
           ]\n\
         }}\n\n\
         Output to analyze:\n{output}"
    )
}
