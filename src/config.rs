use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BelugaConfig {
    pub analysis: AnalysisConfig,
    pub defaults: SessionDefaults,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub api_base: String,
    pub model: String,
    pub max_tokens: u32,
    pub api_key_env: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.anthropic.com".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 1024,
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionDefaults {
    pub shell: String,
    pub tail_lines: u32,
    pub follow: bool,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            tail_lines: 200,
            follow: true,
        }
    }
}

pub fn load() -> Result<BelugaConfig> {
    let Some(path) = discover_config_path() else {
        return Ok(BelugaConfig::default());
    };

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
}

fn discover_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("BELUGA_CONFIG")
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }

    let cwd_candidates = [
        PathBuf::from("beluga.yaml"),
        PathBuf::from("beluga.yml"),
        PathBuf::from(".beluga.yaml"),
    ];
    for candidate in cwd_candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let user_candidates = [
            PathBuf::from(&home).join(".config/beluga/config.yaml"),
            PathBuf::from(&home).join(".config/beluga/config.yml"),
        ];
        for candidate in user_candidates {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}
