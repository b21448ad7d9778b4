//! Quality gate configuration.
//!
//! Loaded per project from `.crewly/config/quality-gates.yaml`; when
//! the file is absent the built-in defaults apply (`typecheck`,
//! `tests`, `build` required, `lint` optional). Parse failures are
//! hard errors — a half-read gate file must not silently weaken the
//! completion contract.

use crate::constants::{
    BUILD_GATE_TIMEOUT_MS, DEFAULT_GATE_TIMEOUT_MS, GATES_CONFIG_RELPATH, TESTS_GATE_TIMEOUT_MS,
    TOTAL_GATE_TIMEOUT_MS,
};
use crate::{CrewlyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// One declarative verification command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGate {
    pub name: String,
    pub command: String,
    pub timeout_ms: u64,
    pub required: bool,
    /// A non-zero exit still counts as passed (advisory gates).
    pub allow_failure: bool,
    pub env: HashMap<String, String>,
    /// Branch globs this gate runs on; empty means every branch.
    pub run_on_branches: Vec<String>,
    pub description: Option<String>,
}

/// Runner-level settings.
#[derive(Debug, Clone)]
pub struct GateSettings {
    pub parallel: bool,
    pub stop_on_first_failure: bool,
    pub total_timeout_ms: u64,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            parallel: false,
            stop_on_first_failure: true,
            total_timeout_ms: TOTAL_GATE_TIMEOUT_MS,
        }
    }
}

/// Full per-project gate configuration.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub settings: GateSettings,
    pub required: Vec<QualityGate>,
    pub optional: Vec<QualityGate>,
    pub custom: Vec<QualityGate>,
}

impl GateConfig {
    /// Built-in defaults used when a project has no gate file.
    pub fn defaults() -> Self {
        Self {
            settings: GateSettings::default(),
            required: vec![
                default_gate("typecheck", "npm run typecheck", DEFAULT_GATE_TIMEOUT_MS, true),
                default_gate("tests", "npm test", TESTS_GATE_TIMEOUT_MS, true),
                default_gate("build", "npm run build", BUILD_GATE_TIMEOUT_MS, true),
            ],
            optional: vec![default_gate(
                "lint",
                "npm run lint",
                DEFAULT_GATE_TIMEOUT_MS,
                false,
            )],
            custom: Vec::new(),
        }
    }

    /// Load the project's gate file, falling back to defaults when the
    /// file does not exist.
    pub fn load(project_path: &Path) -> Result<Self> {
        let path = project_path.join(GATES_CONFIG_RELPATH);
        if !path.exists() {
            debug!(
                "[GateConfig] No gate file at {}, using defaults",
                path.display()
            );
            return Ok(Self::defaults());
        }

        let raw = std::fs::read_to_string(&path)?;
        let file: GateConfigFile =
            serde_yaml::from_str(&raw).map_err(|e| CrewlyError::ConfigParse {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        info!("[GateConfig] Loaded gate file {}", path.display());
        Ok(file.into_config())
    }
}

fn default_gate(name: &str, command: &str, timeout_ms: u64, required: bool) -> QualityGate {
    QualityGate {
        name: name.to_string(),
        command: command.to_string(),
        timeout_ms,
        required,
        allow_failure: false,
        env: HashMap::new(),
        run_on_branches: Vec::new(),
        description: None,
    }
}

// Wire shape of the YAML file (camelCase keys per the external format).

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct GateConfigFile {
    #[serde(default)]
    settings: SettingsFile,
    #[serde(default)]
    required: Vec<GateFile>,
    #[serde(default)]
    optional: Vec<GateFile>,
    #[serde(default)]
    custom: Vec<GateFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SettingsFile {
    run_in_parallel: Option<bool>,
    stop_on_first_failure: Option<bool>,
    /// Aggregate timeout in milliseconds.
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct GateFile {
    name: String,
    command: String,
    /// Per-gate timeout in milliseconds.
    timeout: Option<u64>,
    description: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    allow_failure: Option<bool>,
    #[serde(default)]
    run_on: Vec<String>,
}

impl GateConfigFile {
    fn into_config(self) -> GateConfig {
        let defaults = GateSettings::default();
        let settings = GateSettings {
            parallel: self.settings.run_in_parallel.unwrap_or(defaults.parallel),
            stop_on_first_failure: self
                .settings
                .stop_on_first_failure
                .unwrap_or(defaults.stop_on_first_failure),
            total_timeout_ms: self.settings.timeout.unwrap_or(defaults.total_timeout_ms),
        };
        GateConfig {
            settings,
            required: self.required.into_iter().map(|g| g.into_gate(true)).collect(),
            optional: self.optional.into_iter().map(|g| g.into_gate(false)).collect(),
            custom: self.custom.into_iter().map(|g| g.into_gate(false)).collect(),
        }
    }
}

impl GateFile {
    fn into_gate(self, required: bool) -> QualityGate {
        QualityGate {
            name: self.name,
            command: self.command,
            timeout_ms: self.timeout.unwrap_or(DEFAULT_GATE_TIMEOUT_MS),
            required,
            allow_failure: self.allow_failure.unwrap_or(false),
            env: self.env,
            run_on_branches: self.run_on,
            description: self.description,
        }
    }
}
