use crate::traits::{access_failure, preflight, ArgsValidator, ErrorCode, SpecError, Tool, ToolResult, ToolSpec};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use sysinfo::{Disks, System};
use tiergate_policy::AccessValidator;
use tracing::{error, info};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const DEFAULT_TOP_PROCESSES: usize = 5;

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Free space of the filesystem holding a path.
pub struct DiskFreeTool {
    spec: ToolSpec,
    validator: ArgsValidator,
    access: Arc<AccessValidator>,
}

impl DiskFreeTool {
    pub fn new(access: Arc<AccessValidator>) -> Result<Self, SpecError> {
        let spec = ToolSpec::new(
            "disk_free",
            "Check free disk space for a given path. Use '/home' for home directory or '/mnt/local' for mounted storage.",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path to check disk space"
                    }
                },
                "required": ["path"]
            }),
        )
        .with_timeout_secs(10);
        let validator = ArgsValidator::compile(&spec)?;
        Ok(Self {
            spec,
            validator,
            access,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct DiskUsage {
    path: String,
    mount_point: Option<String>,
    total_gb: f64,
    used_gb: f64,
    free_gb: f64,
    percent_used: f64,
}

impl DiskUsage {
    fn new(path: &Path, mount_point: Option<&Path>, total: u64, available: u64) -> Self {
        let used = total.saturating_sub(available);
        let percent_used = if total > 0 {
            used as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Self {
            path: path.display().to_string(),
            mount_point: mount_point.map(|m| m.display().to_string()),
            total_gb: round_to(total as f64 / GIB, 2),
            used_gb: round_to(used as f64 / GIB, 2),
            free_gb: round_to(available as f64 / GIB, 2),
            percent_used: round_to(percent_used, 1),
        }
    }
}

fn disk_usage(path: &Path) -> Option<DiskUsage> {
    let disks = Disks::new_with_refreshed_list();
    let best = disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().components().count());

    if let Some(disk) = best {
        return Some(DiskUsage::new(
            path,
            Some(disk.mount_point()),
            disk.total_space(),
            disk.available_space(),
        ));
    }

    // Overlay and other virtual roots are not listed as disks.
    statvfs_usage(path).map(|(total, available)| DiskUsage::new(path, None, total, available))
}

#[cfg(unix)]
fn statvfs_usage(path: &Path) -> Option<(u64, u64)> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
        return None;
    }
    let block = stat.f_frsize as u64;
    Some((stat.f_blocks as u64 * block, stat.f_bavail as u64 * block))
}

#[cfg(not(unix))]
fn statvfs_usage(_path: &Path) -> Option<(u64, u64)> {
    None
}

#[async_trait]
impl Tool for DiskFreeTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn validate_args(&self, args: &Value) -> Result<(), String> {
        self.validator.validate(args)
    }

    async fn execute(&self, args: &Value, dry_run: bool) -> ToolResult {
        if let Some(rejected) = preflight(self, args, dry_run) {
            return rejected;
        }

        let requested = args["path"].as_str().unwrap_or("/home");
        let path = match self.access.validate_read(requested) {
            Ok(path) => path,
            Err(e) => return access_failure(&e),
        };
        if !path.exists() {
            return ToolResult::failure(
                ErrorCode::InvalidArguments,
                format!("Path does not exist: {}", path.display()),
            );
        }

        let lookup = path.clone();
        match tokio::task::spawn_blocking(move || disk_usage(&lookup)).await {
            Ok(Some(usage)) => {
                info!(tool = "disk_free", "Checked {}", usage.path);
                ToolResult::success(json!(usage))
            }
            Ok(None) => ToolResult::failure(
                ErrorCode::NativeToolError,
                format!("Failed to check disk space for {}", path.display()),
            ),
            Err(e) => {
                error!("disk_free failed for {}: {}", path.display(), e);
                ToolResult::failure(
                    ErrorCode::NativeToolError,
                    format!("Failed to check disk space: {e}"),
                )
            }
        }
    }
}

/// Memory, uptime and the heaviest processes.
pub struct SystemSnapshotTool {
    spec: ToolSpec,
    validator: ArgsValidator,
}

impl SystemSnapshotTool {
    pub fn new() -> Result<Self, SpecError> {
        let spec = ToolSpec::new(
            "system_snapshot",
            "Summarize memory usage, uptime and the top processes by memory",
            json!({
                "type": "object",
                "properties": {
                    "top": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": 50,
                        "description": "Number of processes to list (default: 5)"
                    }
                }
            }),
        )
        .with_timeout_secs(10);
        let validator = ArgsValidator::compile(&spec)?;
        Ok(Self { spec, validator })
    }
}

#[derive(Debug, Clone, Serialize)]
struct ProcessInfo {
    pid: u32,
    name: String,
    memory_mb: u64,
}

#[derive(Debug, Clone, Serialize)]
struct SystemSnapshot {
    host_name: Option<String>,
    kernel_version: Option<String>,
    memory_total_mb: u64,
    memory_used_mb: u64,
    uptime_seconds: u64,
    process_count: usize,
    top_processes: Vec<ProcessInfo>,
}

impl SystemSnapshot {
    fn capture(top: usize) -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let mut processes: Vec<ProcessInfo> = sys
            .processes()
            .iter()
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                name: process.name().to_string(),
                memory_mb: process.memory() / 1024 / 1024,
            })
            .collect();
        let process_count = processes.len();
        processes.sort_by(|a, b| b.memory_mb.cmp(&a.memory_mb).then(a.pid.cmp(&b.pid)));
        processes.truncate(top);

        Self {
            host_name: System::host_name(),
            kernel_version: System::kernel_version(),
            memory_total_mb: sys.total_memory() / 1024 / 1024,
            memory_used_mb: sys.used_memory() / 1024 / 1024,
            uptime_seconds: System::uptime(),
            process_count,
            top_processes: processes,
        }
    }
}

#[async_trait]
impl Tool for SystemSnapshotTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn validate_args(&self, args: &Value) -> Result<(), String> {
        self.validator.validate(args)
    }

    async fn execute(&self, args: &Value, dry_run: bool) -> ToolResult {
        if let Some(rejected) = preflight(self, args, dry_run) {
            return rejected;
        }

        let top = args["top"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_TOP_PROCESSES);

        match tokio::task::spawn_blocking(move || SystemSnapshot::capture(top)).await {
            Ok(snapshot) => ToolResult::success(json!(snapshot)),
            Err(e) => {
                error!("system_snapshot failed: {}", e);
                ToolResult::failure(ErrorCode::NativeToolError, format!("Failed to capture system state: {e}"))
            }
        }
    }
}
