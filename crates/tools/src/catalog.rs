//! Built-in command tools.

use crate::command_tool::{CommandTool, CommandToolSpec, PathAccess};
use crate::photos::OrganizePhotosTool;
use crate::registry::{RegistryError, ToolRegistry};
use crate::system_tools::{DiskFreeTool, SystemSnapshotTool};
use crate::traits::ToolSpec;
use serde_json::json;
use std::sync::Arc;
use tiergate_executor::CommandInvoker;
use tiergate_policy::Tier;

/// Package operations download and unpack; they get a longer budget.
const PACKAGE_TIMEOUT_SECS: u64 = 300;

/// Timeout and output cap applied to catalog entries without their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolDefaults {
    pub timeout_secs: u64,
    pub max_output_bytes: usize,
}

impl Default for ToolDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_output_bytes: 10_000,
        }
    }
}

impl ToolDefaults {
    fn spec(&self, name: &str, description: &str, schema: serde_json::Value) -> ToolSpec {
        ToolSpec::new(name, description, schema)
            .with_timeout_secs(self.timeout_secs)
            .with_max_output_bytes(self.max_output_bytes)
    }
}

fn no_args() -> serde_json::Value {
    json!({ "type": "object", "properties": {} })
}

pub fn command_specs(defaults: ToolDefaults) -> Vec<CommandToolSpec> {
    let service_schema = json!({
        "type": "object",
        "properties": {
            "service": {
                "type": "string",
                "pattern": "^[A-Za-z0-9@._:-]+$",
                "description": "Unit name, e.g. 'nginx' or 'ssh.service'"
            }
        },
        "required": ["service"]
    });

    vec![
        CommandToolSpec::new(
            defaults.spec(
                "df_command",
                "Show disk filesystem usage with human-readable sizes",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "Path to check (optional, defaults to all filesystems)"
                        }
                    }
                }),
            ),
            "/usr/bin/df",
            &["-h", "{path}"],
        )
        .with_path_arg("path", PathAccess::Read),
        CommandToolSpec::new(
            defaults.spec(
                "du_command",
                "Estimate disk usage of a directory",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "Directory path to analyze"
                        },
                        "max_depth": {
                            "type": "integer",
                            "minimum": 0,
                            "maximum": 10,
                            "description": "Maximum depth to display (default: 1)"
                        }
                    },
                    "required": ["path"]
                }),
            ),
            "/usr/bin/du",
            &["-h", "--max-depth={max_depth}", "{path}"],
        )
        .with_default("max_depth", json!(1))
        .with_path_arg("path", PathAccess::Read),
        CommandToolSpec::new(
            defaults.spec(
                "ps_command",
                "Display information about running processes (shows all users)",
                no_args(),
            ),
            "/usr/bin/ps",
            &["aux"],
        ),
        CommandToolSpec::new(
            defaults.spec("free_command", "Display amount of free and used memory", no_args()),
            "/usr/bin/free",
            &["-h"],
        ),
        CommandToolSpec::new(
            defaults.spec(
                "uname_command",
                "Show system information (kernel, architecture, OS)",
                no_args(),
            ),
            "/usr/bin/uname",
            &["-a"],
        ),
        CommandToolSpec::new(
            defaults.spec(
                "journalctl_command",
                "Query the systemd journal for recent system logs",
                json!({
                    "type": "object",
                    "properties": {
                        "lines": {
                            "type": "integer",
                            "minimum": 1,
                            "maximum": 1000,
                            "description": "Number of recent log lines to show (default: 50)"
                        },
                        "priority": {
                            "type": "string",
                            "enum": ["emerg", "alert", "crit", "err", "warning", "notice", "info", "debug"],
                            "description": "Only show entries at this priority or higher"
                        }
                    }
                }),
            ),
            "/usr/bin/journalctl",
            &["-n", "{lines}", "--no-pager", "--priority={priority}"],
        )
        .with_default("lines", json!(50))
        .with_default("priority", json!("debug")),
        CommandToolSpec::new(
            defaults.spec(
                "systemctl_status",
                "Show the status of a systemd service",
                service_schema.clone(),
            ),
            "/usr/bin/systemctl",
            &["status", "--no-pager", "{service}"],
        ),
        CommandToolSpec::new(
            defaults
                .spec(
                    "systemctl_restart",
                    "Restart a systemd service (requires sudo and confirmation)",
                    service_schema,
                )
                .with_tier(Tier::SystemChange)
                .with_confirmation(),
            "/usr/bin/sudo",
            &["-n", "systemctl", "restart", "{service}"],
        ),
        CommandToolSpec::new(
            defaults
                .spec(
                    "apt_install",
                    "Install a package using apt (requires sudo and confirmation)",
                    json!({
                        "type": "object",
                        "properties": {
                            "package": {
                                "type": "string",
                                "pattern": "^[A-Za-z0-9.+:~_/-]+$",
                                "description": "Package name, or a local .deb path inside the write roots (relative paths resolve against work_dir)"
                            },
                            "work_dir": {
                                "type": "string",
                                "description": "Directory holding local packages; must be writable"
                            }
                        },
                        "required": ["package"]
                    }),
                )
                .with_tier(Tier::SystemChange)
                .with_confirmation()
                .with_network()
                .with_timeout_secs(PACKAGE_TIMEOUT_SECS),
            "/usr/bin/sudo",
            &["-n", "apt-get", "install", "-y", "{package}"],
        )
        .with_path_like_arg("package", PathAccess::Write)
        .with_path_arg("work_dir", PathAccess::Write)
        .with_cwd_arg("work_dir"),
        CommandToolSpec::new(
            defaults
                .spec(
                    "apt_download",
                    "Download a package archive into a directory without installing it",
                    json!({
                        "type": "object",
                        "properties": {
                            "package": {
                                "type": "string",
                                "pattern": "^[A-Za-z0-9.+:~_-]+$",
                                "description": "Package name"
                            },
                            "dest_dir": {
                                "type": "string",
                                "description": "Directory to download into"
                            }
                        },
                        "required": ["package", "dest_dir"]
                    }),
                )
                .with_tier(Tier::WriteSafe)
                .with_dry_run()
                .with_network()
                .with_timeout_secs(PACKAGE_TIMEOUT_SECS),
            "/usr/bin/apt-get",
            &["download", "{package}"],
        )
        .with_path_arg("dest_dir", PathAccess::Write)
        .with_cwd_arg("dest_dir"),
    ]
}

/// Registers the native tools and the command catalog.
pub fn register_builtin_tools(
    registry: &mut ToolRegistry,
    invoker: Arc<CommandInvoker>,
    defaults: ToolDefaults,
) -> Result<(), RegistryError> {
    let access = invoker.access().clone();

    registry.register(Arc::new(DiskFreeTool::new(access.clone())?))?;
    registry.register(Arc::new(SystemSnapshotTool::new()?))?;
    registry.register(Arc::new(OrganizePhotosTool::new(access)?))?;

    for command in command_specs(defaults) {
        registry.register(Arc::new(CommandTool::new(command, invoker.clone())?))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ErrorCode, Tool};
    use tiergate_executor::DirectSandbox;
    use tiergate_policy::{AccessRoots, AccessValidator};

    fn registry() -> ToolRegistry {
        let invoker = Arc::new(CommandInvoker::new(
            Arc::new(AccessValidator::new(AccessRoots::new(["/tmp"], ["/tmp"]))),
            Arc::new(DirectSandbox),
        ));
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry, invoker, ToolDefaults::default()).unwrap();
        registry
    }

    #[test]
    fn test_catalog_registers_everything() {
        let registry = registry();
        for name in [
            "disk_free",
            "system_snapshot",
            "organize_photos",
            "df_command",
            "du_command",
            "ps_command",
            "free_command",
            "uname_command",
            "journalctl_command",
            "systemctl_status",
            "systemctl_restart",
            "apt_install",
            "apt_download",
        ] {
            assert!(registry.lookup(name).is_some(), "missing {name}");
        }
    }

    #[test]
    fn test_privileged_tools_need_confirmation() {
        let registry = registry();
        for name in ["systemctl_restart", "apt_install", "organize_photos"] {
            let tool = registry.lookup(name).unwrap();
            assert!(tool.spec().requires_confirmation, "{name}");
            assert!(tool.spec().supports_dry_run, "{name}");
        }
        assert_eq!(registry.lookup("apt_install").unwrap().spec().tier, Tier::SystemChange);
    }

    #[test]
    fn test_every_alias_resolves() {
        let registry = registry();
        for alias in ["df", "du", "ps", "free", "uname", "journalctl", "systemctl", "photos"] {
            assert!(registry.lookup(alias).is_some(), "alias {alias}");
        }
    }

    #[tokio::test]
    async fn test_local_package_outside_write_roots_denied() {
        let registry = registry();
        let apt = registry.lookup("apt_install").unwrap();

        let result = apt.execute(&json!({"package": "/var/tmp/x.deb"}), true).await;
        assert!(result.is_error(ErrorCode::AccessDenied), "{:?}", result);

        let result = apt
            .execute(&json!({"package": "../var/tmp/x.deb", "work_dir": "/tmp"}), true)
            .await;
        assert!(result.is_error(ErrorCode::AccessDenied), "{:?}", result);
    }

    #[tokio::test]
    async fn test_local_package_resolves_against_work_dir() {
        let temp = tempfile::TempDir::new_in("/tmp").unwrap();
        let work_dir = temp.path().canonicalize().unwrap();
        let registry = registry();
        let apt = registry.lookup("apt_install").unwrap();

        let result = apt
            .execute(
                &json!({"package": "./tool.deb", "work_dir": work_dir.to_str().unwrap()}),
                true,
            )
            .await;
        assert!(result.ok, "{:?}", result);
        let argv = result.data.unwrap()["argv"].clone();
        assert_eq!(argv[5], json!(work_dir.join("tool.deb").to_str().unwrap()));

        let by_name = apt.execute(&json!({"package": "htop"}), true).await;
        assert_eq!(by_name.data.unwrap()["argv"][5], "htop");
    }

    #[test]
    fn test_defaults_apply() {
        let invoker = Arc::new(CommandInvoker::new(
            Arc::new(AccessValidator::new(AccessRoots::new(["/tmp"], ["/tmp"]))),
            Arc::new(DirectSandbox),
        ));
        let mut registry = ToolRegistry::new();
        let defaults = ToolDefaults {
            timeout_secs: 7,
            max_output_bytes: 123,
        };
        register_builtin_tools(&mut registry, invoker, defaults).unwrap();

        let ps = registry.lookup("ps_command").unwrap();
        assert_eq!(ps.spec().timeout_secs, 7);
        assert_eq!(ps.spec().max_output_bytes, 123);
        assert_eq!(
            registry.lookup("apt_install").unwrap().spec().timeout_secs,
            PACKAGE_TIMEOUT_SECS
        );
    }
}
