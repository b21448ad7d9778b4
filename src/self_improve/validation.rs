//! Post-change validation for self-improvement runs.
//!
//! Executes the configured check commands sequentially through the
//! quality gate executor, appending a result to the marker (and
//! flushing it) after every check so an interrupted run resumes
//! exactly where it stopped. The first required failure stops the run.

use super::marker_store::MarkerStore;
use super::types::{ImprovementMarker, ValidationCheck, ValidationResult};
use crate::constants::VALIDATION_CHECK_TIMEOUT_SECS;
use crate::gates::{GateConfig, GateRunOptions, GateSettings, QualityGate, QualityGateRunner};
use crate::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

/// Which checks run, and where.
#[derive(Debug, Clone)]
pub struct ValidationSettings {
    pub checks: Vec<ValidationCheck>,
    /// Repository root the checks run in.
    pub working_dir: PathBuf,
}

impl ValidationSettings {
    pub fn with_default_checks(working_dir: PathBuf) -> Self {
        Self {
            checks: default_checks(),
            working_dir,
        }
    }
}

/// The default pipeline for the orchestrator's own repository (a Rust
/// crate — unlike quality gates, which run against whatever project
/// the agents work on): build and tests must pass, clippy is advisory.
pub fn default_checks() -> Vec<ValidationCheck> {
    vec![
        ValidationCheck {
            name: "build".to_string(),
            command: "cargo build".to_string(),
            timeout_secs: VALIDATION_CHECK_TIMEOUT_SECS,
            required: true,
        },
        ValidationCheck {
            name: "lint".to_string(),
            command: "cargo clippy -- -D warnings".to_string(),
            timeout_secs: VALIDATION_CHECK_TIMEOUT_SECS,
            required: false,
        },
        ValidationCheck {
            name: "test".to_string(),
            command: "cargo test".to_string(),
            timeout_secs: VALIDATION_CHECK_TIMEOUT_SECS,
            required: true,
        },
    ]
}

pub struct ValidationRunner {
    settings: ValidationSettings,
    gates: QualityGateRunner,
}

impl ValidationRunner {
    pub fn new(settings: ValidationSettings) -> Self {
        Self {
            settings,
            gates: QualityGateRunner::new(),
        }
    }

    /// Run (or resume) validation for `marker`. Returns whether every
    /// required check passed. Checks already recorded as passed are
    /// skipped.
    pub async fn run(&self, marker: &mut ImprovementMarker, store: &MarkerStore) -> Result<bool> {
        if marker.validation.required.is_empty() {
            marker.validation.required = self
                .settings
                .checks
                .iter()
                .filter(|c| c.required)
                .map(|c| c.name.clone())
                .collect();
        }
        if marker.validation.started_at.is_none() {
            marker.validation.started_at = Some(chrono::Utc::now());
        }
        store.save(marker).await?;

        for check in &self.settings.checks {
            let already_passed = marker
                .validation
                .results
                .iter()
                .any(|r| r.check == check.name && r.passed);
            if already_passed {
                info!("[Validation] Skipping '{}' (already passed)", check.name);
                continue;
            }
            // A recorded failure for this check means the prior run
            // already decided; re-run it fresh
            marker.validation.results.retain(|r| r.check != check.name);

            let result = self.run_check(check).await?;
            let passed = result.passed;
            info!(
                "[Validation] Check '{}' {} in {}ms",
                check.name,
                if passed { "passed" } else { "failed" },
                result.duration_ms
            );
            marker.validation.results.push(result);
            store.save(marker).await?;

            if !passed && check.required {
                warn!(
                    "[Validation] Required check '{}' failed, stopping validation",
                    check.name
                );
                return Ok(false);
            }
        }

        marker.validation.completed_at = Some(chrono::Utc::now());
        store.save(marker).await?;

        let all_required_passed = marker.validation.required.iter().all(|name| {
            marker
                .validation
                .results
                .iter()
                .any(|r| &r.check == name && r.passed)
        });
        Ok(all_required_passed)
    }

    /// Run one check as a single-gate pipeline through the gate
    /// executor, then fold its result into the marker's shape.
    async fn run_check(&self, check: &ValidationCheck) -> Result<ValidationResult> {
        let gate = QualityGate {
            name: check.name.clone(),
            command: check.command.clone(),
            timeout_ms: check.timeout_secs * 1000,
            required: check.required,
            allow_failure: false,
            env: HashMap::new(),
            run_on_branches: Vec::new(),
            description: None,
        };
        let config = GateConfig {
            settings: GateSettings {
                parallel: false,
                stop_on_first_failure: true,
                // Leave headroom so the per-check timeout is the one
                // that fires
                total_timeout_ms: check.timeout_secs * 1000 + 1000,
            },
            required: Vec::new(),
            optional: Vec::new(),
            custom: vec![gate],
        };

        let run = self
            .gates
            .run_with_config(&self.settings.working_dir, &config, &GateRunOptions::default())
            .await?;
        let result = run
            .results
            .into_iter()
            .next()
            .expect("single-gate run returns one result");

        let tail: String = result
            .output
            .lines()
            .rev()
            .take(40)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        let output = match result.error {
            Some(error) => Some(error),
            None if tail.is_empty() => None,
            None => Some(tail),
        };
        Ok(ValidationResult {
            check: check.name.clone(),
            passed: result.passed,
            output,
            duration_ms: result.duration_ms,
        })
    }
}
