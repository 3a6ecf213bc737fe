use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::orchestration::registry::{RegistryConfig, DEFAULT_MAX_CONCURRENT_PER_WORKER};
use crate::resilience::circuit::{DEFAULT_FAILURE_THRESHOLD, DEFAULT_OPEN_TIMEOUT_SECS};
use crate::resilience::executor::{
    DEFAULT_ATTEMPT_TIMEOUT_SECS, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_INITIAL_BACKOFF_MS,
    DEFAULT_MAX_BACKOFF_MS, DEFAULT_MAX_RETRIES,
};
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};
use crate::session::DEFAULT_PROGRESS_REPLAY;
use crate::worker::{CommandWorkerConfig, WorkerId};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Worker used when a subtask names an unknown worker, and for simple goals.
    pub default_worker: Option<String>,
    /// Progress entries replayed to a reconnecting client.
    #[serde(default = "default_progress_replay")]
    pub progress_replay: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_per_worker: usize,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub workers: Vec<CommandWorkerConfig>,
    #[serde(default)]
    pub plan: PlanConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_worker: None,
            progress_replay: DEFAULT_PROGRESS_REPLAY,
            max_concurrent_per_worker: DEFAULT_MAX_CONCURRENT_PER_WORKER,
            resilience: ResilienceConfig::default(),
            workers: Vec::new(),
            plan: PlanConfig::default(),
        }
    }
}

fn default_progress_replay() -> usize {
    DEFAULT_PROGRESS_REPLAY
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT_PER_WORKER
}

/// `[resilience]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    pub attempt_timeout_secs: u64,
    pub failure_threshold: u32,
    pub open_timeout_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            attempt_timeout_secs: DEFAULT_ATTEMPT_TIMEOUT_SECS,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            open_timeout_secs: DEFAULT_OPEN_TIMEOUT_SECS,
        }
    }
}

impl ResilienceConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            backoff_multiplier: self.backoff_multiplier,
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs),
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            threshold: self.failure_threshold,
            open_timeout: Duration::from_secs(self.open_timeout_secs),
        }
    }
}

/// One stage of a decomposition template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTemplate {
    /// Becomes the subtask id.
    pub name: String,
    /// Capability tag used to pick the worker.
    pub capability: String,
    /// Instruction text; `{goal}` is replaced with the goal.
    pub instruction: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub estimated_secs: u64,
}

impl StageTemplate {
    fn new(name: &str, capability: &str, instruction: &str, depends_on: &[&str], estimated_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            capability: capability.to_string(),
            instruction: instruction.to_string(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            priority: 0,
            estimated_secs,
        }
    }
}

/// `[plan]` section: stage templates per complexity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    pub medium: Vec<StageTemplate>,
    pub complex: Vec<StageTemplate>,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            medium: vec![
                StageTemplate::new("analysis", "analysis", "Analyze what is needed to: {goal}", &[], 30),
                StageTemplate::new("implementation", "code", "Carry out: {goal}", &["analysis"], 120),
                StageTemplate::new("review", "review", "Review the result of: {goal}", &["implementation"], 30),
            ],
            complex: vec![
                StageTemplate::new("analysis", "analysis", "Analyze the requirements of: {goal}", &[], 60),
                StageTemplate::new("design", "design", "Design an approach for: {goal}", &["analysis"], 60),
                StageTemplate::new("implementation", "code", "Implement the design for: {goal}", &["design"], 300),
                StageTemplate::new("tests", "testing", "Write tests covering: {goal}", &["design"], 120),
                StageTemplate::new(
                    "review",
                    "review",
                    "Review the implementation and tests for: {goal}",
                    &["implementation", "tests"],
                    60,
                ),
            ],
        }
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    /// Load from the default location. A missing file yields defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!("Config::load path={}", path.display());
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            "Config loaded: workers={}, default_worker={:?}, max_retries={}",
            config.workers.len(),
            config.default_worker,
            config.resilience.max_retries
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                debug!("Creating config directory: {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for worker in &self.workers {
            if worker.id.trim().is_empty() {
                return Err(Error::Validation("worker id must not be empty".to_string()));
            }
            if !ids.insert(worker.id.as_str()) {
                return Err(Error::Validation(format!("duplicate worker id: {}", worker.id)));
            }
        }
        if self.resilience.backoff_multiplier < 1.0 || !self.resilience.backoff_multiplier.is_finite() {
            return Err(Error::Validation(format!(
                "backoff_multiplier must be at least 1.0, got {}",
                self.resilience.backoff_multiplier
            )));
        }
        if self.max_concurrent_per_worker == 0 {
            return Err(Error::Validation(
                "max_concurrent_per_worker must be at least 1".to_string(),
            ));
        }
        for (label, stages) in [("medium", &self.plan.medium), ("complex", &self.plan.complex)] {
            let names: HashSet<&str> = stages.iter().map(|s| s.name.as_str()).collect();
            if let Some(stage) = stages
                .iter()
                .find(|s| s.depends_on.iter().any(|d| !names.contains(d.as_str())))
            {
                return Err(Error::Validation(format!(
                    "plan.{} stage {} depends on an unknown stage",
                    label, stage.name
                )));
            }
        }
        Ok(())
    }

    pub fn default_worker_id(&self) -> Option<WorkerId> {
        self.default_worker.as_deref().map(WorkerId::from)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            default_worker: self.default_worker_id(),
            retry: self.resilience.retry_policy(),
            breaker: self.resilience.breaker_config(),
            max_concurrent_per_worker: self.max_concurrent_per_worker,
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
