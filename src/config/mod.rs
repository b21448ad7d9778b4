use crate::{CrewlyError, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Top-level runtime configuration, loaded once at startup from the
/// environment (with `.env` support).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub home: HomeConfig,
    pub continuation: ContinuationSettings,
    pub api: ApiConfig,
    pub notify: NotifyConfig,
}

/// Where the orchestrator keeps its on-disk state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeConfig {
    /// Base directory, default `~/.crewly`.
    pub base_dir: PathBuf,
    /// Default project worked by agents without an explicit path.
    pub project_path: PathBuf,
    /// The orchestrator's own repository root (self-improvement
    /// target).
    pub repo_root: PathBuf,
}

impl HomeConfig {
    pub fn usage_dir(&self) -> PathBuf {
        self.base_dir.join(crate::constants::USAGE_DIR)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.base_dir.join(crate::constants::STATE_DIR)
    }

    pub fn self_improvement_dir(&self) -> PathBuf {
        self.base_dir.join(crate::constants::SELF_IMPROVEMENT_DIR)
    }

    pub fn budgets_file(&self) -> PathBuf {
        self.base_dir.join(crate::constants::BUDGETS_FILE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationSettings {
    pub enabled: bool,
    pub auto_assign_next: bool,
    pub notify_on_max: bool,
    pub notify_on_error: bool,
    pub max_iterations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Optional JSON webhook receiving every notification record.
    pub webhook_url: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenv() {
            Ok(path) => tracing::info!("Loaded .env file from: {:?}", path),
            Err(_) => tracing::debug!("No .env file found"),
        }

        let base_dir = match env::var("CREWLY_HOME") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => {
                let home = env::var("HOME").map_err(|_| {
                    CrewlyError::Configuration(
                        "HOME is not set and CREWLY_HOME was not provided".to_string(),
                    )
                })?;
                PathBuf::from(home).join(crate::constants::CREWLY_DIR)
            }
        };

        let cwd = env::current_dir()?;
        let project_path = env::var("CREWLY_PROJECT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| cwd.clone());
        let repo_root = env::var("CREWLY_REPO_ROOT")
            .map(PathBuf::from)
            .unwrap_or(cwd);

        let continuation = ContinuationSettings {
            enabled: env_bool("CREWLY_CONTINUATION_ENABLED", true),
            auto_assign_next: env_bool("CREWLY_AUTO_ASSIGN_NEXT", true),
            notify_on_max: env_bool("CREWLY_NOTIFY_ON_MAX", true),
            notify_on_error: env_bool("CREWLY_NOTIFY_ON_ERROR", true),
            max_iterations: env::var("CREWLY_MAX_ITERATIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(crate::constants::DEFAULT_MAX_ITERATIONS),
        };

        // The RPC surface refuses to start without a real key; a blank
        // or short key is worse than none because it looks configured
        let api_key = env::var("CREWLY_API_KEY").ok();
        if let Some(key) = &api_key {
            if key.trim().is_empty() {
                return Err(CrewlyError::Configuration(
                    "CREWLY_API_KEY is set but blank; generate one with: openssl rand -hex 32"
                        .to_string(),
                ));
            }
            if key.len() < 32 {
                return Err(CrewlyError::Configuration(
                    "CREWLY_API_KEY must be at least 32 characters".to_string(),
                ));
            }
        }

        let allowed_origins = env::var("CREWLY_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let api = ApiConfig {
            host: env::var("CREWLY_API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("CREWLY_API_PORT")
                .unwrap_or_else(|_| "7700".to_string())
                .parse()
                .unwrap_or(7700),
            api_key,
            allowed_origins,
        };

        let notify = NotifyConfig {
            webhook_url: env::var("CREWLY_WEBHOOK_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        };

        Ok(Config {
            home: HomeConfig {
                base_dir,
                project_path,
                repo_root,
            },
            continuation,
            api,
            notify,
        })
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
