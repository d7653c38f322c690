pub mod catalog;
pub mod command_tool;
pub mod photos;
pub mod registry;
pub mod system_tools;
pub mod traits;

pub use catalog::{command_specs, register_builtin_tools, ToolDefaults};
pub use command_tool::{CommandTool, CommandToolSpec, PathAccess, PathArg, TemplateError};
pub use photos::OrganizePhotosTool;
pub use registry::{resolve_alias, RegistryError, ToolRegistry};
pub use system_tools::{DiskFreeTool, SystemSnapshotTool};
pub use traits::{
    access_failure, preflight, ArgsValidator, ErrorCode, SpecError, Tool, ToolKind, ToolResult,
    ToolSpec,
};
