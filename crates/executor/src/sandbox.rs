//! Process execution strategies.
//!
//! All backends share one spawn path ([`run_process`]): a fresh session, a
//! scrubbed environment, stdin closed, stdout/stderr read incrementally and
//! capped, and the whole process group killed when the timeout fires. The
//! backends differ only in how they wrap the caller's argv.

use crate::limits::ResourceLimits;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

const SAFE_PATH: &str = "/usr/bin:/bin";
const DEFAULT_MAX_OUTPUT_BYTES: usize = 10_000;
const READ_CHUNK: usize = 8192;
/// How long to wait for the output pipes to close once the process exited.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Read-only system directories bound into the container backend.
const CONTAINER_SYSTEM_BINDS: &[&str] = &["/usr", "/lib", "/lib64", "/bin", "/sbin"];

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxBackend {
    #[default]
    Direct,
    ScopedService,
    Container,
}

impl fmt::Display for SandboxBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SandboxBackend::Direct => "direct",
            SandboxBackend::ScopedService => "scoped_service",
            SandboxBackend::Container => "container",
        };
        f.write_str(name)
    }
}

/// Everything a backend needs to run one command. Paths are expected to be
/// validated already; the sandbox does not consult the access policy.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
    pub env: BTreeMap<String, String>,
    pub allow_network: bool,
    pub read_paths: Vec<PathBuf>,
    pub write_paths: Vec<PathBuf>,
    pub max_output_bytes: usize,
}

impl SandboxRequest {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self {
            argv,
            cwd: None,
            timeout,
            env: BTreeMap::new(),
            allow_network: false,
            read_paths: Vec::new(),
            write_paths: Vec::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessFailure {
    NonZeroExit,
    Timeout,
    SpawnFailed,
    AccessDenied,
    InvalidPath,
}

/// Outcome of a sandboxed run. Failures are values, never errors: a missing
/// binary, a timeout and a denied path all come back with `ok == false`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessOutput {
    pub ok: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub failure: Option<ProcessFailure>,
}

impl ProcessOutput {
    pub fn failed(failure: ProcessFailure, stderr: impl Into<String>) -> Self {
        Self {
            ok: false,
            exit_code: -1,
            stdout: String::new(),
            stderr: stderr.into(),
            stdout_truncated: false,
            stderr_truncated: false,
            failure: Some(failure),
        }
    }

    pub fn access_denied(stderr: impl Into<String>) -> Self {
        Self::failed(ProcessFailure::AccessDenied, stderr)
    }

    pub fn timed_out(after: Duration) -> Self {
        Self::failed(
            ProcessFailure::Timeout,
            format!("Command timed out after {}s", after.as_secs_f64()),
        )
    }

    pub fn is_timeout(&self) -> bool {
        self.failure == Some(ProcessFailure::Timeout)
    }

    pub fn is_access_denied(&self) -> bool {
        self.failure == Some(ProcessFailure::AccessDenied)
    }

    pub fn truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }
}

#[async_trait]
pub trait ProcessSandbox: Send + Sync {
    fn backend(&self) -> SandboxBackend;

    /// The argv actually spawned for `request`.
    fn command_line(&self, request: &SandboxRequest) -> Vec<String>;

    /// Working directory for the spawned wrapper process.
    fn spawn_cwd<'a>(&self, request: &'a SandboxRequest) -> Option<&'a Path> {
        request.cwd.as_deref()
    }

    async fn run(&self, request: &SandboxRequest) -> ProcessOutput {
        let argv = self.command_line(request);
        debug!(backend = %self.backend(), "Spawning: {}", argv.join(" "));
        run_process(&argv, self.spawn_cwd(request), request).await
    }
}

/// Runs the argv as-is. Timeout and output caps still apply.
#[derive(Debug, Default)]
pub struct DirectSandbox;

impl ProcessSandbox for DirectSandbox {
    fn backend(&self) -> SandboxBackend {
        SandboxBackend::Direct
    }

    fn command_line(&self, request: &SandboxRequest) -> Vec<String> {
        request.argv.clone()
    }
}

/// Wraps the argv in a transient user service with resource limits and
/// filesystem protection.
#[derive(Debug, Default)]
pub struct ScopedServiceSandbox {
    limits: ResourceLimits,
}

impl ScopedServiceSandbox {
    pub fn new(limits: ResourceLimits) -> Self {
        Self { limits }
    }
}

impl ProcessSandbox for ScopedServiceSandbox {
    fn backend(&self) -> SandboxBackend {
        SandboxBackend::ScopedService
    }

    fn command_line(&self, request: &SandboxRequest) -> Vec<String> {
        let mut argv: Vec<String> = [
            "systemd-run",
            "--user",
            "--pipe",
            "--wait",
            "--quiet",
            "--collect",
            "--same-dir",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        argv.push(format!("--property=MemoryMax={}", self.limits.memory_max));
        argv.push(format!("--property=CPUQuota={}", self.limits.cpu_quota));
        argv.push(format!(
            "--property=RuntimeMaxSec={}",
            request.timeout.as_secs().max(1)
        ));
        argv.push("--property=ProtectSystem=strict".to_string());
        argv.push("--property=ProtectHome=read-only".to_string());
        argv.push("--property=PrivateTmp=yes".to_string());
        argv.push("--property=NoNewPrivileges=yes".to_string());

        if !request.allow_network {
            argv.push("--property=RestrictAddressFamilies=AF_UNIX".to_string());
            argv.push("--property=IPAddressDeny=any".to_string());
        }

        for path in &request.write_paths {
            argv.push(format!("--property=ReadWritePaths={}", path.display()));
        }

        for (key, value) in base_env(request) {
            argv.push(format!("--setenv={key}={value}"));
        }

        argv.extend(request.argv.iter().cloned());
        argv
    }
}

/// Wraps the argv in a user-namespace container that only sees read-only
/// system directories plus the explicitly passed paths.
#[derive(Debug, Default)]
pub struct ContainerSandbox;

impl ProcessSandbox for ContainerSandbox {
    fn backend(&self) -> SandboxBackend {
        SandboxBackend::Container
    }

    fn command_line(&self, request: &SandboxRequest) -> Vec<String> {
        let mut argv = vec!["bwrap".to_string()];

        for dir in CONTAINER_SYSTEM_BINDS {
            push_all(&mut argv, &["--ro-bind-try", dir, dir]);
        }
        push_all(
            &mut argv,
            &[
                "--tmpfs",
                "/tmp",
                "--proc",
                "/proc",
                "--dev",
                "/dev",
                "--unshare-all",
                "--die-with-parent",
                "--new-session",
            ],
        );

        if request.allow_network {
            argv.push("--share-net".to_string());
            push_all(
                &mut argv,
                &["--ro-bind-try", "/etc/resolv.conf", "/etc/resolv.conf"],
            );
        }

        for path in &request.read_paths {
            let path = path.display().to_string();
            push_all(&mut argv, &["--ro-bind", &path, &path]);
        }
        for path in &request.write_paths {
            let path = path.display().to_string();
            push_all(&mut argv, &["--bind", &path, &path]);
        }

        if let Some(cwd) = &request.cwd {
            let bound = request
                .read_paths
                .iter()
                .chain(request.write_paths.iter())
                .any(|p| cwd.starts_with(p));
            let cwd = cwd.display().to_string();
            if !bound {
                push_all(&mut argv, &["--ro-bind", &cwd, &cwd]);
            }
            push_all(&mut argv, &["--chdir", &cwd]);
        }

        argv.push("--".to_string());
        argv.extend(request.argv.iter().cloned());
        argv
    }

    fn spawn_cwd<'a>(&self, _request: &'a SandboxRequest) -> Option<&'a Path> {
        None
    }
}

fn push_all(argv: &mut Vec<String>, items: &[&str]) {
    argv.extend(items.iter().map(|s| s.to_string()));
}

/// Builds the sandbox selected by configuration.
pub fn sandbox_for(backend: SandboxBackend, limits: ResourceLimits) -> Arc<dyn ProcessSandbox> {
    match backend {
        SandboxBackend::Direct => Arc::new(DirectSandbox),
        SandboxBackend::ScopedService => Arc::new(ScopedServiceSandbox::new(limits)),
        SandboxBackend::Container => Arc::new(ContainerSandbox),
    }
}

fn base_env(request: &SandboxRequest) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("PATH".to_string(), SAFE_PATH.to_string());
    env.insert("LANG".to_string(), "C.UTF-8".to_string());
    env.extend(request.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

#[derive(Debug, Default)]
struct CapturedOutput {
    bytes: Vec<u8>,
    truncated: bool,
}

impl CapturedOutput {
    fn into_text(self) -> (String, bool) {
        (String::from_utf8_lossy(&self.bytes).into_owned(), self.truncated)
    }
}

/// Reads until EOF, keeping at most `cap` bytes and discarding the rest so
/// the child never blocks on a full pipe.
async fn read_capped<R>(reader: Option<R>, cap: usize) -> CapturedOutput
where
    R: AsyncRead + Unpin,
{
    let mut captured = CapturedOutput::default();
    let Some(mut reader) = reader else {
        return captured;
    };

    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(captured.bytes.len());
                if n > room {
                    captured.truncated = true;
                }
                captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }

    captured
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // The child called setsid(), so its pid is also its process group id.
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// Waits briefly for both readers; a descendant still holding a pipe open
/// forfeits that stream.
async fn collect_output(
    mut stdout: JoinHandle<CapturedOutput>,
    mut stderr: JoinHandle<CapturedOutput>,
    program: &str,
) -> (CapturedOutput, CapturedOutput) {
    let drained = timeout(OUTPUT_DRAIN_GRACE, async {
        ((&mut stdout).await, (&mut stderr).await)
    })
    .await;

    match drained {
        Ok((out, err)) => (out.unwrap_or_default(), err.unwrap_or_default()),
        Err(_) => {
            warn!("Output of {} still open after exit, discarding", program);
            stdout.abort();
            stderr.abort();
            (CapturedOutput::default(), CapturedOutput::default())
        }
    }
}

/// Spawns `argv` and waits for it under the request's timeout and caps.
pub async fn run_process(
    argv: &[String],
    cwd: Option<&Path>,
    request: &SandboxRequest,
) -> ProcessOutput {
    let Some((program, args)) = argv.split_first() else {
        return ProcessOutput::failed(ProcessFailure::SpawnFailed, "Empty command");
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .envs(base_env(request))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                // New session so a timeout can kill every descendant at once.
                libc::setsid();
                Ok(())
            });
        }
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!("Failed to start {}: {}", program, e);
            return ProcessOutput::failed(
                ProcessFailure::SpawnFailed,
                format!("Failed to start {program}: {e}"),
            );
        }
    };

    let pid = child.id();
    let cap = request.max_output_bytes;
    let stdout_task = tokio::spawn(read_capped(child.stdout.take(), cap));
    let stderr_task = tokio::spawn(read_capped(child.stderr.take(), cap));

    let status = match timeout(request.timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            stdout_task.abort();
            stderr_task.abort();
            return ProcessOutput::failed(
                ProcessFailure::SpawnFailed,
                format!("Failed to wait for {program}: {e}"),
            );
        }
        Err(_) => {
            warn!(
                "Command timed out after {:?}: {}",
                request.timeout,
                argv.join(" ")
            );
            kill_process_group(pid);
            let _ = child.start_kill();
            let _ = child.wait().await;

            let (stdout, stderr) = collect_output(stdout_task, stderr_task, program).await;
            let (stdout, stdout_truncated) = stdout.into_text();
            let (partial_stderr, stderr_truncated) = stderr.into_text();
            let mut output = ProcessOutput::timed_out(request.timeout);
            if !partial_stderr.is_empty() {
                output.stderr = format!("{}\n{}", output.stderr, partial_stderr);
            }
            output.stdout = stdout;
            output.stdout_truncated = stdout_truncated;
            output.stderr_truncated = stderr_truncated;
            return output;
        }
    };

    let (stdout, stderr) = collect_output(stdout_task, stderr_task, program).await;
    let (stdout, stdout_truncated) = stdout.into_text();
    let (stderr, stderr_truncated) = stderr.into_text();
    let ok = status.success();

    ProcessOutput {
        ok,
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        failure: if ok {
            None
        } else {
            Some(ProcessFailure::NonZeroExit)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(argv: &[&str]) -> SandboxRequest {
        SandboxRequest::new(
            argv.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_direct_keeps_argv() {
        let req = request(&["df", "-h"]);
        assert_eq!(DirectSandbox.command_line(&req), vec!["df", "-h"]);
    }

    #[test]
    fn test_scoped_service_restricts_network_by_default() {
        let req = request(&["ps", "aux"]);
        let argv = ScopedServiceSandbox::default().command_line(&req);
        assert_eq!(argv[0], "systemd-run");
        assert!(argv.contains(&"--property=MemoryMax=512M".to_string()));
        assert!(argv.contains(&"--property=CPUQuota=50%".to_string()));
        assert!(argv.contains(&"--property=ProtectSystem=strict".to_string()));
        assert!(argv.contains(&"--property=PrivateTmp=yes".to_string()));
        assert!(argv.contains(&"--property=RestrictAddressFamilies=AF_UNIX".to_string()));
        assert_eq!(&argv[argv.len() - 2..], &["ps", "aux"]);
    }

    #[test]
    fn test_scoped_service_network_and_write_paths() {
        let mut req = request(&["apt-get", "update"]);
        req.allow_network = true;
        req.write_paths = vec![PathBuf::from("/srv/cache")];
        let argv = ScopedServiceSandbox::new(ResourceLimits::new("1G", "100%")).command_line(&req);
        assert!(!argv.iter().any(|a| a.starts_with("--property=RestrictAddressFamilies")));
        assert!(argv.contains(&"--property=ReadWritePaths=/srv/cache".to_string()));
        assert!(argv.contains(&"--property=MemoryMax=1G".to_string()));
        assert!(argv.contains(&"--setenv=PATH=/usr/bin:/bin".to_string()));
    }

    #[test]
    fn test_container_unshares_and_binds() {
        let mut req = request(&["du", "-sh", "/data/photos"]);
        req.read_paths = vec![PathBuf::from("/data/photos")];
        req.write_paths = vec![PathBuf::from("/data/out")];
        req.cwd = Some(PathBuf::from("/data/photos"));
        let argv = ContainerSandbox.command_line(&req);

        assert_eq!(argv[0], "bwrap");
        assert!(argv.contains(&"--unshare-all".to_string()));
        assert!(!argv.contains(&"--share-net".to_string()));
        let joined = argv.join(" ");
        assert!(joined.contains("--ro-bind /data/photos /data/photos"));
        assert!(joined.contains("--bind /data/out /data/out"));
        assert!(joined.contains("--chdir /data/photos"));
        assert!(joined.ends_with("-- du -sh /data/photos"));
        assert!(ContainerSandbox.spawn_cwd(&req).is_none());
    }

    #[test]
    fn test_container_network_opt_in() {
        let mut req = request(&["ping", "-c", "1", "example.com"]);
        req.allow_network = true;
        let argv = ContainerSandbox.command_line(&req);
        assert!(argv.contains(&"--share-net".to_string()));
    }

    #[test]
    fn test_sandbox_for_selects_backend() {
        let limits = ResourceLimits::default();
        assert_eq!(
            sandbox_for(SandboxBackend::Direct, limits.clone()).backend(),
            SandboxBackend::Direct
        );
        assert_eq!(
            sandbox_for(SandboxBackend::ScopedService, limits.clone()).backend(),
            SandboxBackend::ScopedService
        );
        assert_eq!(
            sandbox_for(SandboxBackend::Container, limits).backend(),
            SandboxBackend::Container
        );
    }

    #[test]
    fn test_backend_serde_names() {
        let backend: SandboxBackend = serde_json::from_str("\"scoped_service\"").unwrap();
        assert_eq!(backend, SandboxBackend::ScopedService);
    }
}
