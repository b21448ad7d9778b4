//! Quality gate executor.
//!
//! Runs the composed gate list for a project as subprocesses with
//! per-gate timeouts, captured and truncated output, and an aggregate
//! deadline. Individual gate failures never error the run — they
//! become `GateResult { passed: false }`; only configuration problems
//! propagate as errors.

use super::config::{GateConfig, QualityGate};
use crate::constants::{GATE_OUTPUT_MAX_BYTES, GATE_WORKER_POOL_SIZE};
use crate::models::GateResult;
use crate::Result;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Options for one `run_all` pass.
#[derive(Debug, Clone, Default)]
pub struct GateRunOptions {
    /// Leave optional gates out of the run.
    pub skip_optional: bool,
    /// Restrict the run to these gate names.
    pub gate_names: Option<Vec<String>>,
    /// Current git branch, supplied by the external git adapter; used
    /// to filter gates with `runOn` globs. `None` disables filtering.
    pub current_branch: Option<String>,
}

/// Aggregated outcome of a gate run.
#[derive(Debug, Clone)]
pub struct GateRunResults {
    pub results: Vec<GateResult>,
    pub all_required_passed: bool,
    pub duration_ms: u64,
}

impl GateRunResults {
    pub fn failed_gates(&self) -> Vec<&GateResult> {
        self.results.iter().filter(|r| !r.passed).collect()
    }
}

/// Executes declarative verification pipelines.
#[derive(Clone)]
pub struct QualityGateRunner {
    /// Bounds concurrent subprocesses in parallel mode.
    pool: Arc<Semaphore>,
}

impl Default for QualityGateRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl QualityGateRunner {
    pub fn new() -> Self {
        Self {
            pool: Arc::new(Semaphore::new(GATE_WORKER_POOL_SIZE)),
        }
    }

    /// Load the project's config and run the composed gate list.
    pub async fn run_all(
        &self,
        project_path: &Path,
        options: &GateRunOptions,
    ) -> Result<GateRunResults> {
        let config = GateConfig::load(project_path)?;
        self.run_with_config(project_path, &config, options).await
    }

    /// Run against an already-loaded config.
    pub async fn run_with_config(
        &self,
        project_path: &Path,
        config: &GateConfig,
        options: &GateRunOptions,
    ) -> Result<GateRunResults> {
        let gates = compose_gate_list(config, options);
        info!(
            "[GateRunner] Running {} gates for {} ({} mode)",
            gates.len(),
            project_path.display(),
            if config.settings.parallel {
                "parallel"
            } else {
                "sequential"
            }
        );

        let started = Instant::now();
        let deadline = started + Duration::from_millis(config.settings.total_timeout_ms);

        let results = if config.settings.parallel {
            self.run_parallel(project_path, &gates, deadline).await
        } else {
            self.run_sequential(project_path, &gates, deadline, config.settings.stop_on_first_failure)
                .await
        };

        let all_required_passed = results.iter().all(|r| !r.required || r.passed);
        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "[GateRunner] Finished in {}ms, all required passed: {}",
            duration_ms, all_required_passed
        );

        Ok(GateRunResults {
            results,
            all_required_passed,
            duration_ms,
        })
    }

    async fn run_sequential(
        &self,
        project_path: &Path,
        gates: &[QualityGate],
        deadline: Instant,
        stop_on_first_failure: bool,
    ) -> Vec<GateResult> {
        let mut results = Vec::with_capacity(gates.len());
        for gate in gates {
            let result = run_gate(project_path.to_path_buf(), gate.clone(), deadline).await;
            let stop = stop_on_first_failure && gate.required && !result.passed;
            results.push(result);
            if stop {
                warn!(
                    "[GateRunner] Required gate '{}' failed, stopping run",
                    gate.name
                );
                break;
            }
        }
        results
    }

    async fn run_parallel(
        &self,
        project_path: &Path,
        gates: &[QualityGate],
        deadline: Instant,
    ) -> Vec<GateResult> {
        let mut handles = Vec::with_capacity(gates.len());
        for (index, gate) in gates.iter().enumerate() {
            let pool = self.pool.clone();
            let gate = gate.clone();
            let path = project_path.to_path_buf();
            handles.push(tokio::spawn(async move {
                // Semaphore is never closed while the runner lives
                let _permit = pool.acquire_owned().await.expect("gate pool closed");
                (index, run_gate(path, gate, deadline).await)
            }));
        }

        let mut indexed = Vec::with_capacity(handles.len());
        for joined in join_all(handles).await {
            match joined {
                Ok(pair) => indexed.push(pair),
                Err(e) => warn!("[GateRunner] Gate task panicked: {}", e),
            }
        }
        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, result)| result).collect()
    }
}

/// Compose required ∪ optional ∪ custom, then apply the name and
/// branch filters.
fn compose_gate_list(config: &GateConfig, options: &GateRunOptions) -> Vec<QualityGate> {
    let mut gates: Vec<QualityGate> = config.required.clone();
    if !options.skip_optional {
        gates.extend(config.optional.clone());
    }
    gates.extend(config.custom.clone());

    if let Some(names) = &options.gate_names {
        gates.retain(|g| names.iter().any(|n| n == &g.name));
    }

    if let Some(branch) = &options.current_branch {
        gates.retain(|g| {
            if g.run_on_branches.is_empty() {
                return true;
            }
            let keep = g.run_on_branches.iter().any(|pattern| {
                glob::Pattern::new(pattern)
                    .map(|p| p.matches(branch))
                    .unwrap_or(false)
            });
            if !keep {
                debug!(
                    "[GateRunner] Skipping gate '{}' (branch '{}' not in runOn)",
                    g.name, branch
                );
            }
            keep
        });
    }

    gates
}

/// Execute one gate. Never errors; every failure mode becomes a
/// `GateResult` with `passed: false`.
async fn run_gate(project_path: PathBuf, gate: QualityGate, deadline: Instant) -> GateResult {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return GateResult {
            name: gate.name,
            passed: false,
            required: gate.required,
            duration_ms: 0,
            output: String::new(),
            exit_code: None,
            error: Some("total timeout".to_string()),
        };
    }
    let timeout = Duration::from_millis(gate.timeout_ms).min(remaining);

    debug!("[GateRunner] Running gate '{}': {}", gate.name, gate.command);
    let started = Instant::now();

    let mut command = tokio::process::Command::new("sh");
    command
        .arg("-c")
        .arg(&gate.command)
        .current_dir(&project_path)
        .envs(&gate.env)
        .env("CI", "true")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return GateResult {
                name: gate.name,
                passed: false,
                required: gate.required,
                duration_ms: started.elapsed().as_millis() as u64,
                output: String::new(),
                exit_code: None,
                error: Some(format!("spawn failed: {e}")),
            }
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            let exit_code = output.status.code();
            let passed = output.status.success() || gate.allow_failure;
            GateResult {
                name: gate.name,
                passed,
                required: gate.required,
                duration_ms: started.elapsed().as_millis() as u64,
                output: truncate_output(&combined, GATE_OUTPUT_MAX_BYTES),
                exit_code,
                error: None,
            }
        }
        Ok(Err(e)) => GateResult {
            name: gate.name,
            passed: false,
            required: gate.required,
            duration_ms: started.elapsed().as_millis() as u64,
            output: String::new(),
            exit_code: None,
            error: Some(format!("wait failed: {e}")),
        },
        Err(_) => {
            // Dropping the future killed the child (kill_on_drop)
            warn!(
                "[GateRunner] Gate '{}' timed out after {}ms",
                gate.name,
                timeout.as_millis()
            );
            GateResult {
                name: gate.name,
                passed: false,
                required: gate.required,
                duration_ms: started.elapsed().as_millis() as u64,
                output: String::new(),
                exit_code: None,
                error: Some("timeout".to_string()),
            }
        }
    }
}

/// Truncate to `max_bytes`, preserving head and tail around an elision
/// marker. Splits on char boundaries.
fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    const MARKER: &str = "\n... [output truncated] ...\n";
    let keep = max_bytes.saturating_sub(MARKER.len());
    let head_len = keep / 2;
    let tail_len = keep - head_len;

    let head_end = floor_char_boundary(output, head_len);
    let tail_start = ceil_char_boundary(output, output.len() - tail_len);

    format!("{}{}{}", &output[..head_end], MARKER, &output[tail_start..])
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    index = index.min(s.len());
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(s: &str, mut index: usize) -> usize {
    index = index.min(s.len());
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index
}
