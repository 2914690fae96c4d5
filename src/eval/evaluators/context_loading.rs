use crate::{
    config::{ContextRule, HarnessConfig},
    error::EvaluatorError,
    eval::{
        evaluators::{Evaluator, EvaluatorKind},
        report::{Evidence, SkipReason, Verdict, Violation, ViolationKind},
        scenario::{Prompt, TestCase},
    },
    timeline::{ContextLoad, Timeline},
    tools::path_matches,
};

/// Checks the fragments a test case names explicitly.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExplicitContextStrategy;

impl ExplicitContextStrategy {
    /// Fragments that no load in `loads` matches.
    pub fn missing<'a>(&self, fragments: &'a [String], loads: &[&ContextLoad]) -> Vec<&'a str> {
        fragments
            .iter()
            .map(String::as_str)
            .filter(|fragment| !loads.iter().any(|load| path_matches(&load.path, fragment)))
            .collect()
    }
}

/// A context file guessed from prompt wording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferredContext {
    pub keyword: String,
    pub fragment: String,
}

/// Guesses which context files a prompt calls for from its keywords.
#[derive(Debug, Clone)]
pub struct HeuristicContextStrategy {
    rules: Vec<ContextRule>,
}

impl HeuristicContextStrategy {
    pub fn new(rules: Vec<ContextRule>) -> Self {
        Self { rules }
    }

    /// One guess per fragment, keyed by the first keyword that triggered it.
    pub fn infer(&self, prompts: &[Prompt]) -> Vec<InferredContext> {
        let words: Vec<String> = prompts
            .iter()
            .flat_map(|prompt| {
                prompt
                    .text
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|word| !word.is_empty())
                    .map(str::to_lowercase)
            })
            .collect();

        let mut inferred: Vec<InferredContext> = Vec::new();
        for rule in &self.rules {
            if inferred.iter().any(|guess| guess.fragment == rule.expect) {
                continue;
            }
            let hit = rule
                .keywords
                .iter()
                .find(|keyword| words.iter().any(|word| word.eq_ignore_ascii_case(keyword)));
            if let Some(keyword) = hit {
                inferred.push(InferredContext {
                    keyword: keyword.clone(),
                    fragment: rule.expect.clone(),
                });
            }
        }
        inferred
    }
}

/// Requires context to be loaded before the agent first writes code.
#[derive(Debug, Clone)]
pub struct ContextLoadingEvaluator {
    explicit: ExplicitContextStrategy,
    heuristic: HeuristicContextStrategy,
}

impl ContextLoadingEvaluator {
    pub fn new(rules: Vec<ContextRule>) -> Self {
        Self {
            explicit: ExplicitContextStrategy,
            heuristic: HeuristicContextStrategy::new(rules),
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(config.context.rules.clone())
    }
}

impl Evaluator for ContextLoadingEvaluator {
    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::ContextLoading
    }

    fn evaluate(&self, timeline: &Timeline, case: &TestCase) -> Result<Verdict, EvaluatorError> {
        let Some((cutoff, first_write)) = timeline.first_code_producing_call() else {
            return Ok(Verdict::skipped(self.name(), SkipReason::Conversational));
        };

        let loads: Vec<&ContextLoad> = timeline
            .context_loads()
            .take_while(|(index, _)| *index < cutoff)
            .map(|(_, load)| load)
            .collect();

        if loads.is_empty() {
            let violation = Violation::error(
                ViolationKind::MissingContextLoad,
                format!(
                    "no context file was loaded before the first code-producing call `{}`",
                    first_write.name
                ),
            )
            .with_entry(cutoff);
            return Ok(Verdict::from_violations(self.name(), vec![violation]));
        }

        let expected = &case.behavior.expected_context_files;
        let mut violations = Vec::new();
        if !expected.is_empty() {
            for fragment in self.explicit.missing(expected, &loads) {
                violations.push(
                    Violation::error(
                        ViolationKind::MissingContextLoad,
                        format!("expected context `{fragment}` was not loaded before `{}`", first_write.name),
                    )
                    .with_entry(cutoff),
                );
            }
            return Ok(Verdict::from_violations(self.name(), violations));
        }

        let inferred = self.heuristic.infer(&case.prompts);
        if inferred.is_empty() {
            violations.push(Violation::info(
                ViolationKind::ContextUndetermined,
                "no expected context could be inferred from the prompts",
            ));
        }
        for guess in inferred {
            let loaded = loads.iter().any(|load| path_matches(&load.path, &guess.fragment));
            if !loaded {
                violations.push(
                    Violation::warning(
                        ViolationKind::MissingContextLoad,
                        format!(
                            "prompt mentions `{}`, but no `{}` context was loaded",
                            guess.keyword, guess.fragment
                        ),
                    )
                    .with_evidence(Evidence::Heuristic {
                        keyword: guess.keyword,
                        fragment: guess.fragment,
                    })
                    .with_entry(cutoff),
                );
            }
        }
        Ok(Verdict::from_violations(self.name(), violations))
    }
}
