//! External command worker.
//!
//! `CommandWorker` runs a configured program non-interactively. The
//! instruction is appended as the last argument and the request context is
//! passed as JSON in [`CONTEXT_ENV_VAR`]. Stdout becomes the response
//! content; a non-zero exit is reported as an opaque error carrying stderr,
//! and a missing binary as a classified `not_found`.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;

use super::{CapabilityShape, Worker, WorkerError, WorkerId, WorkerRequest, WorkerResponse};
use crate::resilience::ErrorType;
use crate::util::truncate;

/// Environment variable carrying the request context as JSON.
pub const CONTEXT_ENV_VAR: &str = "CONDUCTOR_CONTEXT";

/// Longest stderr excerpt kept in an error message.
const MAX_STDERR_CHARS: usize = 2_000;

/// Worker definition as it appears in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandWorkerConfig {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub capabilities: CapabilityShape,
    pub working_dir: Option<String>,
}

/// Worker backed by an external program.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    id: WorkerId,
    program: String,
    args: Vec<String>,
    capabilities: CapabilityShape,
    working_dir: Option<PathBuf>,
}

impl CommandWorker {
    pub fn new(id: impl Into<WorkerId>, program: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            program: program.into(),
            args: Vec::new(),
            capabilities: CapabilityShape::default(),
            working_dir: None,
        }
    }

    pub fn from_config(config: &CommandWorkerConfig) -> Self {
        Self {
            id: WorkerId::new(config.id.clone()),
            program: config.command.clone(),
            args: config.args.clone(),
            capabilities: config.capabilities.clone(),
            working_dir: config.working_dir.as_deref().map(crate::config::expand_tilde),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityShape) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Whether the program can be found on PATH (or at its absolute path).
    pub fn is_available(&self) -> bool {
        which::which(&self.program).is_ok()
    }

    fn build_command(&self, request: &WorkerRequest) -> std::result::Result<Command, WorkerError> {
        let context = serde_json::to_string(&request.context)
            .map_err(|e| WorkerError::classified(ErrorType::InvalidRequest, e.to_string()))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&request.instruction)
            .env(CONTEXT_ENV_VAR, context)
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }
}

#[async_trait]
impl Worker for CommandWorker {
    fn id(&self) -> WorkerId {
        self.id.clone()
    }

    fn capabilities(&self) -> CapabilityShape {
        self.capabilities.clone()
    }

    async fn execute(
        &self,
        request: WorkerRequest,
    ) -> std::result::Result<WorkerResponse, WorkerError> {
        let output = self
            .build_command(&request)?
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => WorkerError::classified(
                    ErrorType::NotFound,
                    format!("{}: command not found", self.program),
                ),
                std::io::ErrorKind::PermissionDenied => {
                    WorkerError::classified(ErrorType::AuthError, e.to_string())
                }
                _ => WorkerError::opaque(e.to_string()),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(WorkerError::opaque(format!(
                "{} exited with {}: {}",
                self.program,
                code,
                truncate(stderr.trim(), MAX_STDERR_CHARS)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(WorkerResponse::success(stdout)
            .with_metadata("program", Value::from(self.program.clone())))
    }
}
