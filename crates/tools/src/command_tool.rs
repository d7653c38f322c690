//! Declarative tools that run one binary with a templated argv.
//!
//! Substitution works on argv tokens, never on a shell line:
//! - a token that is exactly `{name}` becomes the value (arrays expand into
//!   one token per element, missing/null/empty values drop the token);
//! - a placeholder embedded in a literal (`--max-depth={max_depth}`) is
//!   replaced in place and must have a value;
//! - a whole-token value that starts with `-` is refused so callers cannot
//!   smuggle options into positional slots.
//!
//! Path arguments and the working directory are resolved through the access
//! validator before substitution, so the binary receives exactly the path
//! that was checked. Relative paths resolve against the working directory
//! argument when one is set.

use crate::traits::{access_failure, preflight, ArgsValidator, ErrorCode, SpecError, Tool, ToolKind, ToolResult, ToolSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tiergate_executor::{CommandInvoker, InvokeRequest, ProcessFailure, ProcessOutput};
use tiergate_policy::{AccessError, AccessValidator};
use tracing::{info, warn};

const TRUNCATION_MARKER: &str = "\n... [output truncated]";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("missing value for '{0}'")]
    MissingValue(String),
    #[error("value of '{name}' looks like an option: {value}")]
    OptionInjection { name: String, value: String },
    #[error("value of '{0}' cannot be used as a command argument")]
    UnsupportedValue(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathAccess {
    Read,
    Write,
}

/// An argument whose value is a filesystem path the command will touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathArg {
    pub name: String,
    pub access: PathAccess,
    /// Only values containing a `/` are paths; bare values pass through.
    #[serde(default)]
    pub only_if_path: bool,
}

#[derive(Debug, Clone)]
pub struct CommandToolSpec {
    pub spec: ToolSpec,
    pub binary: String,
    pub argv_template: Vec<String>,
    pub default_args: Map<String, Value>,
    pub path_args: Vec<PathArg>,
    pub cwd_arg: Option<String>,
}

impl CommandToolSpec {
    pub fn new(spec: ToolSpec, binary: impl Into<String>, argv_template: &[&str]) -> Self {
        Self {
            spec,
            binary: binary.into(),
            argv_template: argv_template.iter().map(|s| s.to_string()).collect(),
            default_args: Map::new(),
            path_args: Vec::new(),
            cwd_arg: None,
        }
    }

    pub fn with_default(mut self, name: &str, value: Value) -> Self {
        self.default_args.insert(name.to_string(), value);
        self
    }

    pub fn with_path_arg(mut self, name: &str, access: PathAccess) -> Self {
        self.path_args.push(PathArg {
            name: name.to_string(),
            access,
            only_if_path: false,
        });
        self
    }

    /// An argument that is either a plain name or a path, such as a package
    /// name or a local archive.
    pub fn with_path_like_arg(mut self, name: &str, access: PathAccess) -> Self {
        self.path_args.push(PathArg {
            name: name.to_string(),
            access,
            only_if_path: true,
        });
        self
    }

    pub fn with_cwd_arg(mut self, name: &str) -> Self {
        self.cwd_arg = Some(name.to_string());
        self
    }
}

pub struct CommandTool {
    command: CommandToolSpec,
    validator: ArgsValidator,
    invoker: Arc<CommandInvoker>,
}

impl CommandTool {
    pub fn new(command: CommandToolSpec, invoker: Arc<CommandInvoker>) -> Result<Self, SpecError> {
        if command.binary.trim().is_empty() {
            return Err(SpecError::MissingBinary(command.spec.name.clone()));
        }
        let validator = ArgsValidator::compile(&command.spec)?;
        Ok(Self {
            command,
            validator,
            invoker,
        })
    }

    pub fn command_spec(&self) -> &CommandToolSpec {
        &self.command
    }

    /// Declared defaults overlaid with the caller's arguments.
    fn merge_args(&self, args: &Value) -> Map<String, Value> {
        let mut merged = self.command.default_args.clone();
        if let Some(supplied) = args.as_object() {
            for (key, value) in supplied {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Full argv, binary first.
    pub fn build_argv(&self, args: &Map<String, Value>) -> Result<Vec<String>, TemplateError> {
        let mut argv = vec![self.command.binary.clone()];
        for token in &self.command.argv_template {
            match whole_placeholder(token) {
                Some(name) => push_whole(&mut argv, name, args.get(name))?,
                None => argv.push(substitute_embedded(token, args)?),
            }
        }
        Ok(argv)
    }

    /// Validates the working directory and every path argument, rewriting
    /// their values in `args` to the resolved paths.
    fn resolve_paths(&self, args: &mut Map<String, Value>) -> Result<ResolvedPaths, AccessError> {
        let access = self.invoker.access();
        let mut resolved = ResolvedPaths::default();

        let cwd_value = self
            .command
            .cwd_arg
            .as_ref()
            .and_then(|name| args.get(name).and_then(Value::as_str).map(|dir| (name, dir)))
            .filter(|(_, dir)| !dir.is_empty())
            .map(|(name, dir)| (name.clone(), dir.to_string()));
        let cwd = match cwd_value {
            Some((name, dir)) => {
                let dir = access.validate_read(&dir)?;
                let text = path_text(&dir)?;
                args.insert(name, Value::String(text.clone()));
                resolved.cwd = Some(text);
                Some(dir)
            }
            None => None,
        };

        for arg in &self.command.path_args {
            let Some(value) = args.get_mut(&arg.name) else {
                continue;
            };
            let slots: Vec<&mut String> = match value {
                Value::String(s) => vec![s],
                Value::Array(items) => items
                    .iter_mut()
                    .filter_map(|item| match item {
                        Value::String(s) => Some(s),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            };
            for slot in slots {
                if let Some(path) = resolve_value(access, arg, cwd.as_deref(), slot)? {
                    match arg.access {
                        PathAccess::Read => resolved.read.push(path.clone()),
                        PathAccess::Write => resolved.write.push(path.clone()),
                    }
                    *slot = path;
                }
            }
        }

        Ok(resolved)
    }

    fn map_output(&self, output: ProcessOutput) -> ToolResult {
        if output.ok {
            let mut stdout = output.stdout;
            let truncated = output.stdout_truncated;
            if truncated {
                stdout.push_str(TRUNCATION_MARKER);
            }
            return ToolResult::success(json!({
                "stdout": stdout,
                "exit_code": output.exit_code,
                "truncated": truncated,
            }));
        }

        let (code, message) = match output.failure {
            Some(ProcessFailure::AccessDenied) => (ErrorCode::AccessDenied, output.stderr.clone()),
            Some(ProcessFailure::InvalidPath) => {
                (ErrorCode::InvalidArguments, output.stderr.clone())
            }
            Some(ProcessFailure::Timeout) => (ErrorCode::Timeout, output.stderr.clone()),
            _ => (
                ErrorCode::CommandFailed,
                format!("Command failed: {}", output.stderr.trim()),
            ),
        };

        let details = serde_json::to_value(&output).unwrap_or(Value::Null);
        ToolResult::failure(code, message).with_details(details)
    }
}

#[async_trait]
impl Tool for CommandTool {
    fn spec(&self) -> &ToolSpec {
        &self.command.spec
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Command
    }

    fn validate_args(&self, args: &Value) -> Result<(), String> {
        self.validator.validate(args)
    }

    async fn execute(&self, args: &Value, dry_run: bool) -> ToolResult {
        if let Some(rejected) = preflight(self, args, dry_run) {
            return rejected;
        }

        let spec = &self.command.spec;
        let mut merged = self.merge_args(args);
        // A preview that could never run must not become a plan.
        let paths = match self.resolve_paths(&mut merged) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(tool = %spec.name, "Path check failed: {}", e);
                return access_failure(&e);
            }
        };
        let argv = match self.build_argv(&merged) {
            Ok(argv) => argv,
            Err(e) => {
                return ToolResult::failure(
                    ErrorCode::InvalidArguments,
                    format!("Invalid arguments for tool '{}': {}", spec.name, e),
                )
            }
        };
        let command_line = argv.join(" ");

        let mut request = InvokeRequest::new(argv.clone(), spec.timeout(), spec.max_output_bytes)
            .with_network(spec.allows_network)
            .with_read_paths(paths.read)
            .with_write_paths(paths.write);
        if let Some(cwd) = paths.cwd {
            request = request.with_cwd(cwd);
        }

        if dry_run {
            if let Err(denied) = self.invoker.check_access(&request) {
                return self.map_output(denied);
            }
            return ToolResult::success(json!({
                "command": command_line,
                "argv": argv,
                "message": format!("Would execute: {command_line}"),
            }));
        }

        info!(tool = %spec.name, "Executing command tool: {}", command_line);

        let output = self.invoker.invoke(request).await;
        self.map_output(output)
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn whole_placeholder(token: &str) -> Option<&str> {
    token
        .strip_prefix('{')
        .and_then(|t| t.strip_suffix('}'))
        .filter(|name| is_identifier(name))
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn push_whole(argv: &mut Vec<String>, name: &str, value: Option<&Value>) -> Result<(), TemplateError> {
    let values: Vec<&Value> = match value {
        None | Some(Value::Null) => return Ok(()),
        Some(Value::Array(items)) => items.iter().collect(),
        Some(other) => vec![other],
    };

    for item in values {
        let text = scalar_text(item).ok_or_else(|| TemplateError::UnsupportedValue(name.to_string()))?;
        if text.is_empty() {
            continue;
        }
        if text.starts_with('-') {
            return Err(TemplateError::OptionInjection {
                name: name.to_string(),
                value: text,
            });
        }
        argv.push(text);
    }
    Ok(())
}

fn substitute_embedded(token: &str, args: &Map<String, Value>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(token.len());
    let mut rest = token;

    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            break;
        };
        let name = &after[..close];
        if !is_identifier(name) {
            out.push_str(&rest[..=open]);
            rest = after;
            continue;
        }

        let value = match args.get(name) {
            None | Some(Value::Null) => return Err(TemplateError::MissingValue(name.to_string())),
            Some(value) => {
                scalar_text(value).ok_or_else(|| TemplateError::UnsupportedValue(name.to_string()))?
            }
        };
        out.push_str(&rest[..open]);
        out.push_str(&value);
        rest = &after[close + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

#[derive(Debug, Default)]
struct ResolvedPaths {
    cwd: Option<String>,
    read: Vec<String>,
    write: Vec<String>,
}

fn resolve_value(
    access: &AccessValidator,
    arg: &PathArg,
    cwd: Option<&Path>,
    raw: &str,
) -> Result<Option<String>, AccessError> {
    if raw.is_empty() || (arg.only_if_path && !raw.contains('/')) {
        return Ok(None);
    }

    let anchored = match cwd {
        Some(dir) if !raw.starts_with('~') && Path::new(raw).is_relative() => {
            path_text(&dir.join(raw))?
        }
        _ => raw.to_string(),
    };
    let checked: PathBuf = match arg.access {
        PathAccess::Read => access.validate_read(&anchored)?,
        PathAccess::Write => access.validate_write(&anchored)?,
    };
    path_text(&checked).map(Some)
}

fn path_text(path: &Path) -> Result<String, AccessError> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| AccessError::InvalidPath {
            path: path.display().to_string(),
            reason: "path is not valid UTF-8".to_string(),
        })
}
