pub mod command_invoker;
pub mod limits;
pub mod sandbox;

pub use command_invoker::{CommandInvoker, InvokeRequest};
pub use limits::ResourceLimits;
pub use sandbox::{
    run_process, sandbox_for, ContainerSandbox, DirectSandbox, ProcessFailure, ProcessOutput,
    ProcessSandbox, SandboxBackend, SandboxRequest, ScopedServiceSandbox,
};
