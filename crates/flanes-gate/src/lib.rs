//! Evaluation gate: the pipeline every proposed transition runs through
//! before acceptance.
//!
//! Evaluation itself is external; the core sees evaluators as a small
//! run-and-report capability ([`Evaluator`]) returning `{name, passed,
//! required}` outcomes. The [`EvaluationPipeline`] runs every registered
//! evaluator (no fail-fast: the full outcome list is stored with the
//! transition) and the report's verdict is mechanical: any required failure
//! rejects.
//!
//! Shell-command runners, their process management, and their timeouts live
//! outside the core; [`EvaluatorSpec`] is the configuration contract they
//! are built from.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Errors from running the evaluation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// An evaluator failed to run at all (as opposed to running and
    /// reporting failure).
    #[error("evaluator {name:?} could not run: {message}")]
    EvaluatorFailed { name: String, message: String },
}

/// Result alias for gate operations.
pub type GateResult<T> = Result<T, GateError>;

/// Configuration for one external evaluator, as it appears in the
/// repository configuration document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorSpec {
    /// Evaluator name, unique within the configuration.
    pub name: String,
    /// Command to execute.
    pub command: String,
    /// Arguments passed to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; defaults to the workspace under evaluation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    /// Whether a failure from this evaluator blocks acceptance.
    #[serde(default)]
    pub required: bool,
    /// Kill the evaluator after this many seconds.
    #[serde(default = "EvaluatorSpec::default_timeout")]
    pub timeout_seconds: u64,
}

impl EvaluatorSpec {
    fn default_timeout() -> u64 {
        300
    }
}

/// What an evaluator sees: the workspace under evaluation and the proposal
/// being judged.
#[derive(Clone, Debug)]
pub struct EvalContext<'a> {
    /// Directory holding the proposed world state.
    pub workspace_dir: &'a Path,
    /// Lane the proposal targets.
    pub lane: &'a str,
    /// The transition under evaluation.
    pub transition_id: Uuid,
    /// The intent prompt, for evaluators that judge intent/result fit.
    pub prompt: &'a str,
}

/// One evaluator's judgement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalOutcome {
    /// Evaluator name.
    pub name: String,
    /// Whether the evaluator passed.
    pub passed: bool,
    /// Whether a failure from this evaluator blocks acceptance.
    pub required: bool,
    /// Free-form detail (test output tail, lint counts, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Run-and-report capability implemented by evaluator adapters.
pub trait Evaluator: Send + Sync {
    /// The evaluator's name as it will appear in outcomes.
    fn name(&self) -> &str;

    /// Whether a failure from this evaluator blocks acceptance.
    fn required(&self) -> bool;

    /// Run the evaluation and report the outcome.
    ///
    /// Returning `Err` means the evaluator could not run; the pipeline
    /// converts that into a failed outcome so a broken required evaluator
    /// can never wave a change through.
    fn evaluate(&self, ctx: &EvalContext<'_>) -> GateResult<EvalOutcome>;
}

/// The verdict derived from a full set of outcomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// No required evaluator failed.
    Accept,
    /// At least one required evaluator failed.
    Reject,
}

/// The outcome of running a proposal through the full pipeline.
#[derive(Clone, Debug)]
pub struct EvaluationReport {
    /// Per-evaluator outcomes, in registration order.
    pub outcomes: Vec<EvalOutcome>,
    /// Total wall-clock time for the pipeline.
    pub elapsed: Duration,
}

impl EvaluationReport {
    /// The mechanical verdict: reject iff a required evaluator failed.
    pub fn verdict(&self) -> Verdict {
        if self.outcomes.iter().any(|o| o.required && !o.passed) {
            Verdict::Reject
        } else {
            Verdict::Accept
        }
    }

    /// Outcomes of required evaluators that failed.
    pub fn required_failures(&self) -> Vec<&EvalOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.required && !o.passed)
            .collect()
    }

    /// One-line summary stored on the transition.
    pub fn summary(&self) -> String {
        let passed = self.outcomes.iter().filter(|o| o.passed).count();
        let failed: Vec<&str> = self
            .outcomes
            .iter()
            .filter(|o| !o.passed)
            .map(|o| o.name.as_str())
            .collect();
        if failed.is_empty() {
            format!("{passed}/{} evaluators passed", self.outcomes.len())
        } else {
            format!(
                "{passed}/{} evaluators passed; failed: {}",
                self.outcomes.len(),
                failed.join(", ")
            )
        }
    }
}

/// An ordered set of evaluators run against every proposal.
#[derive(Default)]
pub struct EvaluationPipeline {
    evaluators: Vec<Box<dyn Evaluator>>,
}

impl EvaluationPipeline {
    /// An empty pipeline. Proposals evaluated by it are trivially accepted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an evaluator.
    pub fn add(&mut self, evaluator: Box<dyn Evaluator>) {
        self.evaluators.push(evaluator);
    }

    /// Number of registered evaluators.
    pub fn len(&self) -> usize {
        self.evaluators.len()
    }

    /// Returns `true` if no evaluators are registered.
    pub fn is_empty(&self) -> bool {
        self.evaluators.is_empty()
    }

    /// Run every evaluator and collect the full outcome list.
    ///
    /// An evaluator that cannot run is recorded as failed with its error as
    /// detail, keeping its `required` flag, so infrastructure breakage in a
    /// required check rejects instead of accepting blind.
    pub fn run(&self, ctx: &EvalContext<'_>) -> EvaluationReport {
        let start = Instant::now();
        let mut outcomes = Vec::with_capacity(self.evaluators.len());

        for evaluator in &self.evaluators {
            let outcome = match evaluator.evaluate(ctx) {
                Ok(outcome) => outcome,
                Err(e) => EvalOutcome {
                    name: evaluator.name().to_string(),
                    passed: false,
                    required: evaluator.required(),
                    detail: Some(e.to_string()),
                },
            };
            debug!(
                evaluator = %outcome.name,
                passed = outcome.passed,
                required = outcome.required,
                "evaluator finished"
            );
            outcomes.push(outcome);
        }

        EvaluationReport {
            outcomes,
            elapsed: start.elapsed(),
        }
    }
}

impl std::fmt::Debug for EvaluationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationPipeline")
            .field("evaluators", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticEval {
        name: &'static str,
        required: bool,
        passes: bool,
        breaks: bool,
    }

    impl Evaluator for StaticEval {
        fn name(&self) -> &str {
            self.name
        }

        fn required(&self) -> bool {
            self.required
        }

        fn evaluate(&self, _ctx: &EvalContext<'_>) -> GateResult<EvalOutcome> {
            if self.breaks {
                return Err(GateError::EvaluatorFailed {
                    name: self.name.to_string(),
                    message: "command not found".into(),
                });
            }
            Ok(EvalOutcome {
                name: self.name.to_string(),
                passed: self.passes,
                required: self.required,
                detail: None,
            })
        }
    }

    fn ctx() -> EvalContext<'static> {
        EvalContext {
            workspace_dir: Path::new("/tmp/ws"),
            lane: "main",
            transition_id: Uuid::nil(),
            prompt: "test prompt",
        }
    }

    fn eval(name: &'static str, required: bool, passes: bool) -> Box<dyn Evaluator> {
        Box::new(StaticEval {
            name,
            required,
            passes,
            breaks: false,
        })
    }

    #[test]
    fn empty_pipeline_accepts() {
        let pipeline = EvaluationPipeline::new();
        let report = pipeline.run(&ctx());
        assert!(report.outcomes.is_empty());
        assert_eq!(report.verdict(), Verdict::Accept);
    }

    #[test]
    fn all_passing_accepts() {
        let mut pipeline = EvaluationPipeline::new();
        pipeline.add(eval("tests", true, true));
        pipeline.add(eval("lint", false, true));
        let report = pipeline.run(&ctx());
        assert_eq!(report.verdict(), Verdict::Accept);
        assert_eq!(report.summary(), "2/2 evaluators passed");
    }

    #[test]
    fn required_failure_rejects() {
        let mut pipeline = EvaluationPipeline::new();
        pipeline.add(eval("tests", true, false));
        pipeline.add(eval("lint", false, true));
        let report = pipeline.run(&ctx());
        assert_eq!(report.verdict(), Verdict::Reject);
        assert_eq!(report.required_failures().len(), 1);
        assert!(report.summary().contains("failed: tests"));
    }

    #[test]
    fn optional_failure_does_not_block() {
        let mut pipeline = EvaluationPipeline::new();
        pipeline.add(eval("tests", true, true));
        pipeline.add(eval("style", false, false));
        let report = pipeline.run(&ctx());
        assert_eq!(report.verdict(), Verdict::Accept);
        assert!(report.required_failures().is_empty());
        // The failure is still recorded.
        assert!(report.outcomes.iter().any(|o| !o.passed));
    }

    #[test]
    fn pipeline_runs_all_evaluators_despite_failures() {
        let mut pipeline = EvaluationPipeline::new();
        pipeline.add(eval("first", true, false));
        pipeline.add(eval("second", false, true));
        pipeline.add(eval("third", true, true));
        let report = pipeline.run(&ctx());
        // No fail-fast: every outcome is present.
        assert_eq!(report.outcomes.len(), 3);
    }

    #[test]
    fn broken_required_evaluator_rejects() {
        let mut pipeline = EvaluationPipeline::new();
        pipeline.add(Box::new(StaticEval {
            name: "tests",
            required: true,
            passes: true,
            breaks: true,
        }));
        let report = pipeline.run(&ctx());
        assert_eq!(report.verdict(), Verdict::Reject);
        assert!(report.outcomes[0]
            .detail
            .as_deref()
            .unwrap()
            .contains("command not found"));
    }

    #[test]
    fn evaluator_spec_deserializes_with_defaults() {
        let spec: EvaluatorSpec = serde_json::from_str(
            r#"{"name": "tests", "command": "cargo", "args": ["test"]}"#,
        )
        .unwrap();
        assert_eq!(spec.name, "tests");
        assert!(!spec.required);
        assert_eq!(spec.timeout_seconds, 300);
        assert!(spec.working_directory.is_none());
    }
}
