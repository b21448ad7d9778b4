//! Output analyzer: classify agent state from captured session output.
//!
//! The analyzer is a pure function of its inputs — captured output,
//! exit code, and task context — so results are cacheable by
//! `(session, output hash, task id)`. Decision rules run in a fixed
//! order and the first match wins; signature sets are
//! project-configurable with defaults that cover the common assistant
//! and test-runner dialects.

use crate::models::{
    AgentStateAnalysis, AnalysisConclusion, Recommendation, SessionRef, Task, TaskStatus,
};
use crate::{CrewlyError, Result};
use regex::Regex;
use tracing::debug;

/// Signature patterns (regex) for each classification bucket.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Stack traces, compiler errors, failing test summaries.
    pub error_signatures: Vec<String>,
    /// Output that means the current task finished cleanly.
    pub complete_signatures: Vec<String>,
    /// The assistant is waiting on a human answer.
    pub waiting_signatures: Vec<String>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            error_signatures: vec![
                r"(?i)\berror:".to_string(),
                r"error\[E\d+\]".to_string(),
                r"panicked at".to_string(),
                r"Traceback \(most recent call last\)".to_string(),
                r"[1-9]\d* failed".to_string(),
                r"\bFAILED\b".to_string(),
                r"(?i)fatal:".to_string(),
            ],
            complete_signatures: vec![
                r"(?i)all tests passed".to_string(),
                r"(?i)all quality gates passed".to_string(),
                r"(?i)task complete[d]?\b".to_string(),
            ],
            waiting_signatures: vec![
                r"\?\s*$".to_string(),
                r"(?i)\bchoose\b".to_string(),
                r"(?i)confirm \(y/n\)".to_string(),
                r"\(y/n\)\s*$".to_string(),
                r"\[y/N\]\s*$".to_string(),
            ],
        }
    }
}

/// Inputs for one analysis pass. The caller supplies the length of the
/// output it analyzed last time so rule 5 can detect growth without
/// the analyzer keeping state.
#[derive(Debug, Clone)]
pub struct AnalysisInput<'a> {
    pub session: &'a SessionRef,
    pub output: &'a str,
    pub current_task: Option<&'a Task>,
    pub exit_code: Option<i32>,
    pub previous_output_len: usize,
}

/// Stateless classifier built from an [`AnalyzerConfig`].
pub struct OutputAnalyzer {
    error_signatures: Vec<Regex>,
    complete_signatures: Vec<Regex>,
    waiting_signatures: Vec<Regex>,
}

impl OutputAnalyzer {
    pub fn new(config: &AnalyzerConfig) -> Result<Self> {
        Ok(Self {
            error_signatures: compile(&config.error_signatures)?,
            complete_signatures: compile(&config.complete_signatures)?,
            waiting_signatures: compile(&config.waiting_signatures)?,
        })
    }

    pub fn with_defaults() -> Self {
        // Default patterns are static and known-good
        Self::new(&AnalyzerConfig::default()).expect("default signatures compile")
    }

    /// Classify the agent's state. Rules are evaluated in order; the
    /// first matching rule decides conclusion and recommendation.
    pub fn analyze(&self, input: &AnalysisInput<'_>) -> AgentStateAnalysis {
        let (iterations, max_iterations) = match input.current_task {
            Some(task) => (task.iterations, task.max_iterations),
            None => (0, crate::constants::DEFAULT_MAX_ITERATIONS),
        };

        // Rule 1: non-zero exit or error signature
        let error_matches = matched_patterns(&self.error_signatures, input.output);
        let nonzero_exit = input.exit_code.is_some_and(|c| c != 0);
        if nonzero_exit || !error_matches.is_empty() {
            let mut evidence = Vec::new();
            if let Some(code) = input.exit_code.filter(|c| *c != 0) {
                evidence.push(format!("process exited with code {code}"));
            }
            evidence.extend(
                error_matches
                    .iter()
                    .map(|p| format!("error signature matched: {p}")),
            );
            return self.build(
                input,
                AnalysisConclusion::StuckOrError,
                Recommendation::RetryWithHints,
                error_matches.len() + usize::from(nonzero_exit),
                evidence,
                iterations,
                max_iterations,
            );
        }

        // Rule 2: completion signature while the task is in progress
        let complete_matches = matched_patterns(&self.complete_signatures, input.output);
        let task_in_progress = input
            .current_task
            .is_some_and(|t| t.status == TaskStatus::InProgress);
        if !complete_matches.is_empty() && task_in_progress {
            let evidence = complete_matches
                .iter()
                .map(|p| format!("completion signature matched: {p}"))
                .collect();
            return self.build(
                input,
                AnalysisConclusion::TaskComplete,
                Recommendation::AssignNextTask,
                complete_matches.len(),
                evidence,
                iterations,
                max_iterations,
            );
        }

        // Rule 3: the assistant is asking a question
        let waiting_matches = matched_patterns(&self.waiting_signatures, input.output.trim_end());
        if !waiting_matches.is_empty() {
            let evidence = waiting_matches
                .iter()
                .map(|p| format!("waiting-for-input signature matched: {p}"))
                .collect();
            return self.build(
                input,
                AnalysisConclusion::WaitingForInput,
                Recommendation::NotifyOwner,
                waiting_matches.len(),
                evidence,
                iterations,
                max_iterations,
            );
        }

        // Rule 4: iteration budget spent
        if input.current_task.is_some() && iterations >= max_iterations {
            return self.build(
                input,
                AnalysisConclusion::Unknown,
                Recommendation::PauseAgent,
                1,
                vec![format!(
                    "iteration limit reached ({iterations}/{max_iterations})"
                )],
                iterations,
                max_iterations,
            );
        }

        // Rule 5: output still growing means the agent is mid-flight
        if input.output.len() > input.previous_output_len {
            return self.build(
                input,
                AnalysisConclusion::Incomplete,
                Recommendation::InjectPrompt,
                1,
                vec!["output has grown since last analysis".to_string()],
                iterations,
                max_iterations,
            );
        }

        // Rule 6: nothing to go on
        self.build(
            input,
            AnalysisConclusion::Unknown,
            Recommendation::NoAction,
            0,
            vec!["no signatures matched and no new output".to_string()],
            iterations,
            max_iterations,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        &self,
        input: &AnalysisInput<'_>,
        conclusion: AnalysisConclusion,
        recommendation: Recommendation,
        matched: usize,
        evidence: Vec<String>,
        iterations: u32,
        max_iterations: u32,
    ) -> AgentStateAnalysis {
        let confidence = confidence_for(matched);
        debug!(
            "[Analyzer] {} -> {:?} ({:?}, confidence {:.2})",
            input.session, conclusion, recommendation, confidence
        );
        AgentStateAnalysis {
            conclusion,
            confidence,
            evidence,
            recommendation,
            iterations,
            max_iterations,
        }
    }
}

/// Confidence as a heuristic over matched-signature count: one match
/// is moderately convincing, each additional match adds a little,
/// capped below certainty.
fn confidence_for(matched: usize) -> f64 {
    match matched {
        0 => 0.3,
        n => (0.6 + 0.1 * (n as f64 - 1.0)).min(0.95),
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| CrewlyError::Configuration(format!(
                "invalid analyzer signature '{p}': {e}"
            )))
        })
        .collect()
}

fn matched_patterns(signatures: &[Regex], output: &str) -> Vec<String> {
    signatures
        .iter()
        .filter(|re| re.is_match(output))
        .map(|re| re.as_str().to_string())
        .collect()
}
