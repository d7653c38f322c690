use crate::sandbox::{ProcessFailure, ProcessOutput, ProcessSandbox, SandboxRequest};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tiergate_policy::{AccessError, AccessValidator};
use tokio::time::Duration;
use tracing::{info, warn};

/// One command invocation before path validation.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub argv: Vec<String>,
    pub cwd: Option<String>,
    pub timeout: Duration,
    pub allow_network: bool,
    pub read_paths: Vec<String>,
    pub write_paths: Vec<String>,
    pub max_output_bytes: usize,
    pub env: BTreeMap<String, String>,
}

impl InvokeRequest {
    pub fn new(argv: Vec<String>, timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            argv,
            cwd: None,
            timeout,
            allow_network: false,
            read_paths: Vec::new(),
            write_paths: Vec::new(),
            max_output_bytes,
            env: BTreeMap::new(),
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_read_paths(mut self, paths: Vec<String>) -> Self {
        self.read_paths = paths;
        self
    }

    pub fn with_write_paths(mut self, paths: Vec<String>) -> Self {
        self.write_paths = paths;
        self
    }

    pub fn with_network(mut self, allow: bool) -> Self {
        self.allow_network = allow;
        self
    }
}

/// Validates every path an invocation touches, then hands it to the
/// configured sandbox. Nothing is spawned if any check fails.
pub struct CommandInvoker {
    access: Arc<AccessValidator>,
    sandbox: Arc<dyn ProcessSandbox>,
    network_allowed: bool,
}

impl CommandInvoker {
    pub fn new(access: Arc<AccessValidator>, sandbox: Arc<dyn ProcessSandbox>) -> Self {
        Self {
            access,
            sandbox,
            network_allowed: false,
        }
    }

    /// Global network switch; a request only gets network when both this and
    /// its own flag are set.
    pub fn with_network(mut self, allowed: bool) -> Self {
        self.network_allowed = allowed;
        self
    }

    pub fn access(&self) -> &Arc<AccessValidator> {
        &self.access
    }

    /// Runs every path check `invoke` would run, without spawning.
    pub fn check_access(&self, request: &InvokeRequest) -> Result<(), ProcessOutput> {
        self.resolve_paths(request).map(|_| ())
    }

    fn resolve_paths(&self, request: &InvokeRequest) -> Result<ResolvedPaths, ProcessOutput> {
        let cwd = match &request.cwd {
            Some(dir) => Some(self.access.validate_read(dir).map_err(|e| denied_output(&e))?),
            None => None,
        };

        let read = request
            .read_paths
            .iter()
            .map(|p| self.access.validate_read(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| denied_output(&e))?;

        let write = request
            .write_paths
            .iter()
            .map(|p| self.access.validate_write(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| denied_output(&e))?;

        Ok(ResolvedPaths { cwd, read, write })
    }

    pub async fn invoke(&self, request: InvokeRequest) -> ProcessOutput {
        let paths = match self.resolve_paths(&request) {
            Ok(paths) => paths,
            Err(denied) => return denied,
        };

        info!(
            backend = %self.sandbox.backend(),
            "Invoking: {}",
            request.argv.join(" ")
        );

        let sandbox_request = SandboxRequest {
            argv: request.argv,
            cwd: paths.cwd,
            timeout: request.timeout,
            env: request.env,
            allow_network: request.allow_network && self.network_allowed,
            read_paths: paths.read,
            write_paths: paths.write,
            max_output_bytes: request.max_output_bytes,
        };

        self.sandbox.run(&sandbox_request).await
    }
}

struct ResolvedPaths {
    cwd: Option<PathBuf>,
    read: Vec<PathBuf>,
    write: Vec<PathBuf>,
}

fn denied_output(error: &AccessError) -> ProcessOutput {
    warn!("Invocation refused: {}", error);
    match error {
        AccessError::Denied { .. } => ProcessOutput::access_denied(error.to_string()),
        AccessError::InvalidPath { .. } => {
            ProcessOutput::failed(ProcessFailure::InvalidPath, error.to_string())
        }
    }
}
