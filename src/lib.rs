pub mod cli;
pub mod compilation;
pub mod compiler;
pub mod config;
pub mod execution;
pub mod machine;
pub mod program;
pub mod session;
pub mod types;

#[cfg(test)]
mod test_helpers;

// Re-export main types
pub use types::*;

// Re-export the coordinators for convenience
pub use compilation::{CompilationCoordinator, CompilationEvent, CompileDispatch};
pub use config::{SessionConfig, Settings};
pub use execution::{BreakpointSet, ExecutionCoordinator, ExecutionError, ExecutionEvent};
pub use session::{Notification, NotificationSink, RunError, Session, SessionEvent};
