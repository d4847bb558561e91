//! User-defined tools and the sandbox that runs them

mod definition;
pub mod executor;
mod host;
mod loop_guard;
mod policy;
mod schema;
pub mod script;

pub use definition::ToolDefinition;
pub use executor::{
    ExecutionResult, SANDBOX_SUBCOMMAND, SandboxRequest, SecureExecutor, ToolError, ToolErrorKind,
    ToolReply, run_request,
};
pub use host::{DesktopHost, Host, MAX_OUTPUT_BYTES, MAX_PROCESS_TIME};
pub use loop_guard::{LoopGuard, LoopVerdict, StopReason};
pub use policy::{Capability, CapabilitySet, SandboxTier};
pub use schema::validate as validate_arguments;
pub use script::Program;
