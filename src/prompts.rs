//! Built-in prompt templates for agent-facing messages.
//!
//! Rendered with the crate's own [`crate::template`] renderer. Hint
//! text is keyed on the analyzer's conclusion so a stuck agent gets
//! targeted guidance rather than a generic nudge.

use crate::models::{AgentStateAnalysis, AnalysisConclusion, Task};
use crate::template::{render, TemplateContext};
use crate::Result;

/// Sent when a task is assigned to an idle agent.
pub const ASSIGNMENT_TEMPLATE: &str = "\
You have been assigned a new task.

Task: {{TASK_TITLE}} (id {{TASK_ID}}, priority {{PRIORITY}})

{{TASK_DESCRIPTION}}
{{#if LEARNINGS}}
Notes from earlier work on this project:
{{#each LEARNINGS}}- {{this}}
{{/each}}{{/if}}
When every required quality gate passes, report completion.";

/// Sent to re-engage an agent that stalled mid-task.
pub const CONTINUATION_TEMPLATE: &str = "\
Please continue working on the current task.

Task: {{TASK_TITLE}} (iteration {{ITERATION}} of {{MAX_ITERATIONS}})
{{#if CHECKPOINT}}
Last checkpoint: {{CHECKPOINT}}
{{/if}}{{#if GATES_SUMMARY}}
Quality gate status: {{GATES_SUMMARY}}
{{/if}}{{#if HINTS}}
Guidance: {{HINTS}}
{{/if}}{{#if LEARNINGS}}
Remember:
{{#each LEARNINGS}}- {{this}}
{{/each}}{{/if}}";

/// Sent after an error signature or failed gates.
pub const RETRY_TEMPLATE: &str = "\
The last run hit a problem. Please fix it and retry.

Task: {{TASK_TITLE}} (iteration {{ITERATION}} of {{MAX_ITERATIONS}})
Problem: {{ERROR_HINT}}
{{#if FAILED_GATES}}
Failing gates:
{{#each FAILED_GATES}}- {{this}}
{{/each}}{{/if}}
Address the problem before moving on to anything else.";

/// Hint text per analyzer conclusion.
pub fn hint_for(conclusion: AnalysisConclusion) -> &'static str {
    match conclusion {
        AnalysisConclusion::StuckOrError => {
            "Inspect the most recent error output, fix the root cause, and rerun the failing step."
        }
        AnalysisConclusion::WaitingForInput => {
            "Make a reasonable decision yourself and note the assumption; the owner has been notified."
        }
        AnalysisConclusion::Incomplete => {
            "Pick up exactly where the output stops; do not restart completed steps."
        }
        AnalysisConclusion::TaskComplete | AnalysisConclusion::Unknown => {
            "Summarize current progress, then continue with the next concrete step."
        }
    }
}

fn base_context(task: &Task) -> TemplateContext {
    let mut ctx = TemplateContext::new();
    ctx.set("TASK_ID", task.id.clone())
        .set("TASK_TITLE", task.title.clone())
        .set("TASK_DESCRIPTION", task.description.clone())
        .set("PRIORITY", format!("{:?}", task.priority).to_lowercase())
        .set("ITERATION", task.iterations.to_string())
        .set("MAX_ITERATIONS", task.max_iterations.to_string())
        .set("CHECKPOINT", task.checkpoint.clone().unwrap_or_default())
        .set("LEARNINGS", task.learnings.clone());
    ctx
}

pub fn render_assignment(task: &Task) -> Result<String> {
    render(ASSIGNMENT_TEMPLATE, &base_context(task))
}

pub fn render_continuation(task: &Task, analysis: &AgentStateAnalysis) -> Result<String> {
    let mut ctx = base_context(task);
    ctx.set("HINTS", hint_for(analysis.conclusion));
    let gates_summary = gates_summary(task);
    ctx.set("GATES_SUMMARY", gates_summary);
    render(CONTINUATION_TEMPLATE, &ctx)
}

pub fn render_retry(task: &Task, error_hint: &str) -> Result<String> {
    let mut ctx = base_context(task);
    ctx.set("ERROR_HINT", error_hint.to_string());
    let failed: Vec<String> = task
        .quality_gate_results
        .iter()
        .filter(|g| !g.passed)
        .map(|g| match &g.error {
            Some(err) => format!("{} ({err})", g.name),
            None => format!("{} (exit {})", g.name, g.exit_code.unwrap_or(-1)),
        })
        .collect();
    ctx.set("FAILED_GATES", failed);
    render(RETRY_TEMPLATE, &ctx)
}

fn gates_summary(task: &Task) -> String {
    if task.quality_gate_results.is_empty() {
        return String::new();
    }
    let passed = task.quality_gate_results.iter().filter(|g| g.passed).count();
    format!("{passed}/{} gates passing", task.quality_gate_results.len())
}
