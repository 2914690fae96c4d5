use std::{collections::VecDeque, time::Duration};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    #[serde(alias = "approve", alias = "allow")]
    Grant,
    #[serde(alias = "reject")]
    Deny,
}

impl ApprovalDecision {
    pub fn is_grant(self) -> bool {
        matches!(self, ApprovalDecision::Grant)
    }
}

impl std::fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalDecision::Grant => write!(f, "grant"),
            ApprovalDecision::Deny => write!(f, "deny"),
        }
    }
}

/// A pending approval as seen by the harness.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub tool: String,
    pub arguments: Value,
    pub risk: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApprovalError {
    #[error("ExhaustedApprovalScript: request `{request_id}` arrived after all {consumed} scripted decision(s) were used")]
    ExhaustedApprovalScript { request_id: String, consumed: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum ApprovalMode {
    AutoApprove,
    AutoDeny,
    Scripted { decisions: Vec<ApprovalDecision> },
}

/// How pending approval requests of a test are answered.
///
/// The strategy itself is immutable configuration; every run gets its own
/// [`ApprovalResolver`] so scripted sequences restart from the top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalStrategy {
    #[serde(flatten)]
    pub mode: ApprovalMode,
    /// Wait this long before answering each request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

impl Default for ApprovalStrategy {
    fn default() -> Self {
        Self::auto_approve()
    }
}

impl ApprovalStrategy {
    pub fn auto_approve() -> Self {
        Self {
            mode: ApprovalMode::AutoApprove,
            delay_ms: None,
        }
    }

    pub fn auto_deny() -> Self {
        Self {
            mode: ApprovalMode::AutoDeny,
            delay_ms: None,
        }
    }

    pub fn scripted(decisions: impl IntoIterator<Item = ApprovalDecision>) -> Self {
        Self {
            mode: ApprovalMode::Scripted {
                decisions: decisions.into_iter().collect(),
            },
            delay_ms: None,
        }
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }

    pub fn resolver(&self) -> ApprovalResolver {
        let script = match &self.mode {
            ApprovalMode::Scripted { decisions } => Some(decisions.iter().copied().collect()),
            _ => None,
        };
        ApprovalResolver {
            mode: self.mode.clone(),
            script,
            consumed: 0,
        }
    }
}

/// Per-run approval state.
#[derive(Debug)]
pub struct ApprovalResolver {
    mode: ApprovalMode,
    script: Option<VecDeque<ApprovalDecision>>,
    consumed: usize,
}

impl ApprovalResolver {
    pub fn resolve(&mut self, request: &ApprovalRequest) -> Result<ApprovalDecision, ApprovalError> {
        let decision = match &self.mode {
            ApprovalMode::AutoApprove => ApprovalDecision::Grant,
            ApprovalMode::AutoDeny => ApprovalDecision::Deny,
            ApprovalMode::Scripted { .. } => {
                let next = self.script.as_mut().and_then(VecDeque::pop_front);
                match next {
                    Some(decision) => decision,
                    None => {
                        return Err(ApprovalError::ExhaustedApprovalScript {
                            request_id: request.request_id.clone(),
                            consumed: self.consumed,
                        })
                    }
                }
            }
        };
        self.consumed += 1;
        Ok(decision)
    }

    /// Number of requests answered so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn request(id: &str) -> ApprovalRequest {
        ApprovalRequest {
            request_id: id.to_string(),
            tool: "bash".to_string(),
            arguments: json!({ "command": "rm -rf build" }),
            risk: Some("high".to_string()),
        }
    }

    #[test]
    fn scripted_sequence_is_consumed_in_order() {
        let strategy = ApprovalStrategy::scripted([ApprovalDecision::Grant, ApprovalDecision::Deny]);
        let mut resolver = strategy.resolver();

        assert_eq!(resolver.resolve(&request("r1")), Ok(ApprovalDecision::Grant));
        assert_eq!(resolver.resolve(&request("r2")), Ok(ApprovalDecision::Deny));
        let err = resolver.resolve(&request("r3")).unwrap_err();
        assert_eq!(
            err,
            ApprovalError::ExhaustedApprovalScript {
                request_id: "r3".to_string(),
                consumed: 2,
            }
        );
    }

    #[test]
    fn every_run_starts_from_a_fresh_script() {
        let strategy = ApprovalStrategy::scripted([ApprovalDecision::Deny]);
        let mut first = strategy.resolver();
        assert_eq!(first.resolve(&request("a")), Ok(ApprovalDecision::Deny));
        assert!(first.resolve(&request("b")).is_err());

        let mut second = strategy.resolver();
        assert_eq!(second.resolve(&request("a")), Ok(ApprovalDecision::Deny));
    }

    #[test]
    fn auto_modes_never_exhaust() {
        let mut approve = ApprovalStrategy::auto_approve().resolver();
        let mut deny = ApprovalStrategy::auto_deny().resolver();
        for i in 0..10 {
            let req = request(&format!("r{i}"));
            assert_eq!(approve.resolve(&req), Ok(ApprovalDecision::Grant));
            assert_eq!(deny.resolve(&req), Ok(ApprovalDecision::Deny));
        }
        assert_eq!(approve.consumed(), 10);
    }

    #[test]
    fn parses_flattened_mode_from_yaml() {
        let yaml = "mode: scripted\ndecisions: [grant, reject]\ndelay_ms: 25\n";
        let strategy: ApprovalStrategy = serde_yaml::from_str(yaml).expect("strategy");
        assert_eq!(
            strategy.mode,
            ApprovalMode::Scripted {
                decisions: vec![ApprovalDecision::Grant, ApprovalDecision::Deny],
            }
        );
        assert_eq!(strategy.delay(), Some(Duration::from_millis(25)));
    }
}
