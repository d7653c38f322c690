use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tiergate_policy::{AccessError, Tier};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_OUTPUT_BYTES: usize = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("Tool name must not be empty")]
    EmptyName,
    #[error("Tool '{0}' requires confirmation but does not support dry run")]
    ConfirmationWithoutDryRun(String),
    #[error("Argument schema of tool '{0}' must be a JSON object")]
    SchemaNotObject(String),
    #[error("Argument schema of tool '{name}' does not compile: {message}")]
    InvalidSchema { name: String, message: String },
    #[error("Command tool '{0}' has no binary")]
    MissingBinary(String),
}

/// Machine-readable failure kinds carried by [`ToolResult::error_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArguments,
    AccessDenied,
    DryRunNotSupported,
    ToolNotFound,
    TierNotPermitted,
    PlanNotFound,
    PlanAlreadyExecuted,
    CommandFailed,
    Timeout,
    CommandToolError,
    NativeToolError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArguments => "invalid_arguments",
            ErrorCode::AccessDenied => "access_denied",
            ErrorCode::DryRunNotSupported => "dry_run_not_supported",
            ErrorCode::ToolNotFound => "tool_not_found",
            ErrorCode::TierNotPermitted => "tier_not_permitted",
            ErrorCode::PlanNotFound => "plan_not_found",
            ErrorCode::PlanAlreadyExecuted => "plan_already_executed",
            ErrorCode::CommandFailed => "command_failed",
            ErrorCode::Timeout => "timeout",
            ErrorCode::CommandToolError => "command_tool_error",
            ErrorCode::NativeToolError => "native_tool_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable descriptor of a tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub args_schema: Value,
    pub tier: Tier,
    pub requires_confirmation: bool,
    pub supports_dry_run: bool,
    pub allows_network: bool,
    pub timeout_secs: u64,
    pub max_output_bytes: usize,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, args_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            args_schema,
            tier: Tier::ReadOnly,
            requires_confirmation: false,
            supports_dry_run: false,
            allows_network: false,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    /// Confirmation previews run the tool in dry-run mode, so this also
    /// turns dry-run support on.
    pub fn with_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self.supports_dry_run = true;
        self
    }

    pub fn with_dry_run(mut self) -> Self {
        self.supports_dry_run = true;
        self
    }

    pub fn with_network(mut self) -> Self {
        self.allows_network = true;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        if self.name.trim().is_empty() {
            return Err(SpecError::EmptyName);
        }
        if self.requires_confirmation && !self.supports_dry_run {
            return Err(SpecError::ConfirmationWithoutDryRun(self.name.clone()));
        }
        if !self.args_schema.is_object() {
            return Err(SpecError::SchemaNotObject(self.name.clone()));
        }
        Ok(())
    }
}

/// Outcome of one execution. Either `data` or `error_code` is set, never
/// both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ToolResult {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error_code: None,
            message: None,
            details: None,
        }
    }

    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error_code: Some(code),
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_error(&self, code: ErrorCode) -> bool {
        self.error_code == Some(code)
    }
}

/// Compiled argument schema.
pub struct ArgsValidator {
    validator: jsonschema::Validator,
}

impl ArgsValidator {
    pub fn compile(spec: &ToolSpec) -> Result<Self, SpecError> {
        spec.validate()?;
        let validator =
            jsonschema::validator_for(&spec.args_schema).map_err(|e| SpecError::InvalidSchema {
                name: spec.name.clone(),
                message: e.to_string(),
            })?;
        Ok(Self { validator })
    }

    pub fn validate(&self, args: &Value) -> Result<(), String> {
        if !args.is_object() {
            return Err("arguments must be a JSON object".to_string());
        }
        self.validator.validate(args).map_err(|e| e.to_string())
    }
}

impl fmt::Debug for ArgsValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgsValidator").finish_non_exhaustive()
    }
}

/// Which error code a fault inside the tool's own logic maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Native,
    Command,
}

impl ToolKind {
    pub fn fault_code(&self) -> ErrorCode {
        match self {
            ToolKind::Native => ErrorCode::NativeToolError,
            ToolKind::Command => ErrorCode::CommandToolError,
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> &ToolSpec;

    fn kind(&self) -> ToolKind {
        ToolKind::Native
    }

    fn validate_args(&self, args: &Value) -> Result<(), String>;

    /// Never fails: every problem is reported through the result.
    async fn execute(&self, args: &Value, dry_run: bool) -> ToolResult;
}

/// Shared argument and dry-run checks run at the top of every `execute`.
pub fn preflight(tool: &dyn Tool, args: &Value, dry_run: bool) -> Option<ToolResult> {
    let spec = tool.spec();
    if let Err(message) = tool.validate_args(args) {
        return Some(
            ToolResult::failure(
                ErrorCode::InvalidArguments,
                format!("Invalid arguments for tool '{}': {}", spec.name, message),
            )
            .with_details(serde_json::json!({ "schema": spec.args_schema })),
        );
    }
    if dry_run && !spec.supports_dry_run {
        return Some(ToolResult::failure(
            ErrorCode::DryRunNotSupported,
            format!("Tool '{}' does not support dry-run", spec.name),
        ));
    }
    None
}

/// Converts a path rejection into the matching result.
pub fn access_failure(error: &AccessError) -> ToolResult {
    let code = if error.is_denied() {
        ErrorCode::AccessDenied
    } else {
        ErrorCode::InvalidArguments
    };
    ToolResult::failure(code, error.to_string())
}
