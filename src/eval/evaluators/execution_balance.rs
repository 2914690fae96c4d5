use std::collections::HashSet;

use crate::{
    config::BalanceBand,
    error::EvaluatorError,
    eval::{
        evaluators::{Evaluator, EvaluatorKind},
        report::{SkipReason, Verdict, Violation, ViolationKind},
        scenario::TestCase,
    },
    timeline::Timeline,
    tools::{normalize_path, ToolClass},
};

/// Reads must come before the writes and commands that depend on them.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionBalanceEvaluator {
    band: BalanceBand,
}

impl Default for ExecutionBalanceEvaluator {
    fn default() -> Self {
        Self::new(BalanceBand::default())
    }
}

fn path_key(path: &str) -> String {
    normalize_path(path).to_lowercase()
}

/// Same file, allowing one side to be absolute and the other relative.
fn same_file(read: &str, written: &str) -> bool {
    read == written
        || read.ends_with(&format!("/{written}"))
        || written.ends_with(&format!("/{read}"))
}

impl ExecutionBalanceEvaluator {
    pub fn new(band: BalanceBand) -> Self {
        Self { band }
    }
}

impl Evaluator for ExecutionBalanceEvaluator {
    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::ExecutionBalance
    }

    fn evaluate(&self, timeline: &Timeline, _case: &TestCase) -> Result<Verdict, EvaluatorError> {
        let acting = timeline
            .tool_calls()
            .filter(|(_, call)| call.class.is_write_or_execute())
            .count();
        if acting == 0 {
            return Ok(Verdict::skipped(self.name(), SkipReason::NoActivity));
        }

        let mut violations = Vec::new();
        let mut reads = 0usize;
        let mut read_paths: HashSet<String> = HashSet::new();

        for (index, call) in timeline.tool_calls() {
            match call.class {
                class if class.is_read() => {
                    reads += 1;
                    if let Some(path) = call.path() {
                        read_paths.insert(path_key(path));
                    }
                }
                ToolClass::Modify => {
                    let Some(path) = call.path() else { continue };
                    let key = path_key(path);
                    if !read_paths.iter().any(|read| same_file(read, &key)) {
                        violations.push(
                            Violation::error(
                                ViolationKind::ExecutionBeforeRead,
                                format!("`{}` modified `{path}` without reading it first", call.name),
                            )
                            .with_entry(index),
                        );
                    }
                }
                ToolClass::Execute if reads == 0 => {
                    violations.push(
                        Violation::error(
                            ViolationKind::ExecutionBeforeRead,
                            format!("`{}` ran before anything was read", call.name),
                        )
                        .with_entry(index),
                    );
                }
                _ => {}
            }
        }

        let ratio = reads as f64 / acting as f64;
        if !self.band.contains(ratio) {
            violations.push(Violation::info(
                ViolationKind::ImbalancedToolRatio,
                format!(
                    "read/act ratio {ratio:.2} ({reads} reads, {acting} writes or commands) is outside {:.2}..={:.2}",
                    self.band.min_ratio, self.band.max_ratio
                ),
            ));
        }

        Ok(Verdict::from_violations(self.name(), violations))
    }
}
