use serde::{Deserialize, Serialize};

use crate::timeline::Timeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// No code-producing or tool activity to judge.
    Conversational,
    NotConfigured,
    NoActivity,
    Timeout,
    RuntimeError,
    NotSelected,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SkipReason::Conversational => "conversational",
            SkipReason::NotConfigured => "not-configured",
            SkipReason::NoActivity => "no-activity",
            SkipReason::Timeout => "timeout",
            SkipReason::RuntimeError => "runtime-error",
            SkipReason::NotSelected => "not-selected",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Applicability {
    Applicable,
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationKind {
    MissingContextLoad,
    ContextUndetermined,
    BashAntipattern,
    MissingApprovalRequest,
    MultipleApprovalRequests,
    ExecutedBeforeApproval,
    ExecutedAfterDenial,
    ForbiddenToolUsed,
    ToolNotAllowed,
    ToolSetNotSatisfied,
    ApprovalNotRequested,
    ContextNotLoaded,
    ExecutionBeforeRead,
    ImbalancedToolRatio,
    ResponseMissingText,
    ResponseForbiddenText,
    ResponseSchemaMismatch,
    ToolCallCount,
    EvaluatorError,
}

/// What a violation points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Evidence {
    /// Index into [`Timeline::entries`].
    Entry { index: usize },
    /// A guess derived from prompt wording, not from the timeline.
    Heuristic { keyword: String, fragment: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<Evidence>,
}

impl Violation {
    pub fn new(kind: ViolationKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            evidence: Vec::new(),
        }
    }

    pub fn error(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self::new(kind, Severity::Error, message)
    }

    pub fn warning(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self::new(kind, Severity::Warning, message)
    }

    pub fn info(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self::new(kind, Severity::Info, message)
    }

    pub fn with_entry(mut self, index: usize) -> Self {
        self.evidence.push(Evidence::Entry { index });
        self
    }

    pub fn with_entries(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.evidence
            .extend(indices.into_iter().map(|index| Evidence::Entry { index }));
        self
    }

    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence.push(evidence);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    pub fn entry_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.evidence.iter().filter_map(|evidence| match evidence {
            Evidence::Entry { index } => Some(*index),
            Evidence::Heuristic { .. } => None,
        })
    }
}

/// Outcome of one evaluator for one run.
///
/// A skipped verdict made no assertion; it reports `passed` and never fails
/// the run on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub evaluator: String,
    pub status: Applicability,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
    pub passed: bool,
}

impl Verdict {
    /// An applicable verdict. Fails when any violation has error severity.
    pub fn from_violations(evaluator: impl Into<String>, violations: Vec<Violation>) -> Self {
        let passed = !violations.iter().any(Violation::is_error);
        Self {
            evaluator: evaluator.into(),
            status: Applicability::Applicable,
            violations,
            passed,
        }
    }

    pub fn skipped(evaluator: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            evaluator: evaluator.into(),
            status: Applicability::Skipped { reason },
            violations: Vec::new(),
            passed: true,
        }
    }

    pub fn is_applicable(&self) -> bool {
        self.status == Applicability::Applicable
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self.status {
            Applicability::Applicable => None,
            Applicability::Skipped { reason } => Some(reason),
        }
    }

    /// Turns the verdict into `skipped(reason)` while keeping whatever it
    /// found as info-level evidence. `not-selected` verdicts stay untouched.
    pub fn demote(mut self, reason: SkipReason) -> Self {
        if self.skip_reason() == Some(SkipReason::NotSelected) {
            return self;
        }
        for violation in &mut self.violations {
            violation.severity = Severity::Info;
        }
        self.status = Applicability::Skipped { reason };
        self.passed = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Completed,
    TimedOut,
    RuntimeError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub test_case_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: RunStatus,
    pub verdicts: Vec<Verdict>,
    pub passed: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub timeline: Timeline,
}

impl EvaluationResult {
    /// A run passes only when it completed cleanly and every applicable
    /// verdict passed.
    pub fn compute_passed(status: RunStatus, verdicts: &[Verdict], errors: &[String]) -> bool {
        status == RunStatus::Completed
            && errors.is_empty()
            && verdicts
                .iter()
                .filter(|verdict| verdict.is_applicable())
                .all(|verdict| verdict.passed)
    }

    pub fn verdict(&self, evaluator: &str) -> Option<&Verdict> {
        self.verdicts.iter().find(|verdict| verdict.evaluator == evaluator)
    }

    pub fn violations(&self) -> impl Iterator<Item = &Violation> {
        self.verdicts.iter().flat_map(|verdict| verdict.violations.iter())
    }

    /// Error-severity violations as `evaluator: message` lines.
    pub fn failures(&self) -> Vec<String> {
        self.verdicts
            .iter()
            .flat_map(|verdict| {
                verdict
                    .violations
                    .iter()
                    .filter(|violation| violation.is_error())
                    .map(move |violation| format!("{}: {}", verdict.evaluator, violation.message))
            })
            .chain(self.errors.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub total: usize,
    pub passed: usize,
    pub results: Vec<EvaluationResult>,
}

impl EvalReport {
    pub fn from_results(results: Vec<EvaluationResult>) -> Self {
        Self {
            total: results.len(),
            passed: results.iter().filter(|result| result.passed).count(),
            results,
        }
    }

    pub fn failed(&self) -> usize {
        self.total - self.passed
    }

    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_do_not_fail_a_verdict() {
        let verdict = Verdict::from_violations(
            "tool-usage",
            vec![Violation::info(ViolationKind::BashAntipattern, "cat used").with_entry(2)],
        );
        assert!(verdict.passed);

        let verdict = Verdict::from_violations(
            "behavior",
            vec![Violation::error(ViolationKind::ForbiddenToolUsed, "bash used")],
        );
        assert!(!verdict.passed);
    }

    #[test]
    fn demoting_keeps_findings_as_info() {
        let verdict = Verdict::from_violations(
            "approval-gate",
            vec![Violation::error(ViolationKind::MissingApprovalRequest, "no request").with_entry(0)],
        )
        .demote(SkipReason::Timeout);
        assert_eq!(verdict.skip_reason(), Some(SkipReason::Timeout));
        assert_eq!(verdict.violations[0].severity, Severity::Info);
        assert_eq!(verdict.violations[0].entry_indices().collect::<Vec<_>>(), vec![0]);

        let untouched = Verdict::skipped("response", SkipReason::NotSelected).demote(SkipReason::Timeout);
        assert_eq!(untouched.skip_reason(), Some(SkipReason::NotSelected));
    }

    #[test]
    fn skipped_verdicts_do_not_decide_the_run() {
        let verdicts = vec![
            Verdict::skipped("context-loading", SkipReason::Conversational),
            Verdict::from_violations("behavior", Vec::new()),
        ];
        assert!(EvaluationResult::compute_passed(RunStatus::Completed, &verdicts, &[]));
        assert!(!EvaluationResult::compute_passed(RunStatus::TimedOut, &verdicts, &[]));
        assert!(!EvaluationResult::compute_passed(
            RunStatus::Completed,
            &verdicts,
            &["boom".to_string()]
        ));
    }

    #[test]
    fn verdict_status_serializes_as_tagged_object() {
        let json = serde_json::to_value(Verdict::skipped("behavior", SkipReason::NotConfigured)).unwrap();
        assert_eq!(json["status"]["kind"], "skipped");
        assert_eq!(json["status"]["reason"], "not-configured");
    }
}
