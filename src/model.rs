use serde::{Deserialize, Deserializer};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Target {
    pub pod_name: String,
    pub namespace: String,
    pub source_file: String,
    pub context_name: String,
}

impl Target {
    pub fn is_complete(&self) -> bool {
        !self.pod_name.trim().is_empty()
            && !self.namespace.trim().is_empty()
            && !self.context_name.trim().is_empty()
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod_name)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PaneMode {
    Exec,
    Logs,
    Describe,
    Command(String),
}

impl PaneMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Exec => "exec",
            Self::Logs => "logs",
            Self::Describe => "describe",
            Self::Command(_) => "command",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum AnalysisMode {
    Describe,
    Logs,
}

impl AnalysisMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Describe => "describe",
            Self::Logs => "logs",
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Connecting,
    Active,
    Ended,
    Failed(String),
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub enum StreamPhase {
    #[default]
    Idle,
    Loading,
    Streaming,
    Complete,
    Failed(String),
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub enum AnalysisPhase {
    #[default]
    Idle,
    Streaming,
    Done,
    Failed(String),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LineSeverity {
    Error,
    Warning,
    Normal,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AnnotatedLine {
    pub text: String,
    pub severity: LineSeverity,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum InsightKind {
    Critical,
    Warning,
    #[default]
    Suggestion,
}

// Unknown kinds degrade to Suggestion instead of failing the whole payload.
impl<'de> Deserialize<'de> for InsightKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.to_ascii_lowercase().as_str() {
            "critical" => Self::Critical,
            "warning" => Self::Warning,
            _ => Self::Suggestion,
        })
    }
}

impl InsightKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Warning => "warning",
            Self::Suggestion => "suggestion",
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct Insight {
    #[serde(rename = "type", default)]
    pub kind: InsightKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub command: Option<String>,
}
