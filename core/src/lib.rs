//! Root of the `pi-bash-core` library.
//!
//! A shell-session execution service consumed in-process by an agent
//! runtime. The `bash` tool launches a command, streams its output, and
//! either returns the outcome within a yield window or backgrounds the run;
//! the `process` tool drives backgrounded sessions by id (list, poll, log,
//! write, kill, clear, remove). Nothing persists across restarts.

// Library code never writes to stdout/stderr directly; diagnostics go
// through tracing.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod config;
mod controller;
pub mod error;
mod executor;
pub mod kill;
mod registry;
mod sanitize;
mod session;
pub mod shell;
mod tools;
mod truncate;

pub use config::SessionConfig;
pub use error::SessionError;
pub use kill::kill_process_tree;
pub use registry::SessionRegistry;
pub use session::ExitRecord;
pub use session::OutputSnapshot;
pub use session::OutputStream;
pub use session::Session;
pub use session::SessionStatus;
pub use session::StdinMode;
pub use shell::ShellInvocation;
pub use shell::resolve_shell;
pub use tools::BashToolParams;
pub use tools::ContentBlock;
pub use tools::ProcessAction;
pub use tools::ProcessToolParams;
pub use tools::SessionOverview;
pub use tools::SessionTools;
pub use tools::SessionUpdate;
pub use tools::ToolDetails;
pub use tools::ToolResult;
