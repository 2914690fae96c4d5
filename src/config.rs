use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{error::EvalError, tools::ToolCatalog};

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_concurrency() -> usize {
    4
}

fn default_markers() -> Vec<String> {
    vec![
        ".opencode/context/".to_string(),
        ".context/".to_string(),
        "AGENTS.md".to_string(),
    ]
}

/// Keyword-to-context-file mapping used when a test case names no expected
/// context files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRule {
    pub keywords: Vec<String>,
    pub expect: String,
}

impl ContextRule {
    fn new(keywords: &[&str], expect: &str) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            expect: expect.to_string(),
        }
    }
}

fn default_rules() -> Vec<ContextRule> {
    vec![
        ContextRule::new(&["test", "tests", "testing", "coverage"], "standards/tests"),
        ContextRule::new(
            &["implement", "function", "refactor", "code", "fix", "bug", "feature", "class", "module"],
            "standards/code",
        ),
        ContextRule::new(&["document", "documentation", "docs", "readme"], "standards/docs"),
        ContextRule::new(&["review", "audit"], "workflows/review"),
        ContextRule::new(&["delegate", "subagent"], "workflows/delegation"),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Read paths matching one of these count as context loads.
    #[serde(default = "default_markers")]
    pub markers: Vec<String>,
    #[serde(default = "default_rules")]
    pub rules: Vec<ContextRule>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            markers: default_markers(),
            rules: default_rules(),
        }
    }
}

fn default_min_ratio() -> f64 {
    0.5
}

fn default_max_ratio() -> f64 {
    10.0
}

/// Acceptable range for reads per write/execute call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalanceBand {
    #[serde(default = "default_min_ratio")]
    pub min_ratio: f64,
    #[serde(default = "default_max_ratio")]
    pub max_ratio: f64,
}

impl Default for BalanceBand {
    fn default() -> Self {
        Self {
            min_ratio: default_min_ratio(),
            max_ratio: default_max_ratio(),
        }
    }
}

impl BalanceBand {
    pub fn contains(&self, ratio: f64) -> bool {
        ratio >= self.min_ratio && ratio <= self.max_ratio
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Model override passed to every session unless the case sets its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub tools: ToolCatalog,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub balance: BalanceBand,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            model: None,
            concurrency: default_concurrency(),
            tools: ToolCatalog::default(),
            context: ContextConfig::default(),
            balance: BalanceBand::default(),
        }
    }
}

impl HarnessConfig {
    pub fn from_yaml_str(input: &str) -> Result<Self, EvalError> {
        Ok(serde_yaml::from_str(input)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EvalError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}
