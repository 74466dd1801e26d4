//! Virtual machine boundary
//!
//! The execution coordinator drives any [`Machine`] one step at a time and
//! never looks inside it. Instances are created through a [`MachineFactory`]
//! handed to the coordinator at construction.
//!
//! [`ScriptMachine`] executes programs produced by
//! [`ScriptCompiler`](crate::compiler::ScriptCompiler).

mod eval;
pub mod vm;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use thiserror::Error;

use crate::program::Program;
use crate::types::{SourceLocation, VariableSnapshot};

pub use vm::ScriptMachine;

/// Failures raised by the stepping primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MachineFault {
    #[error("division by zero at {0}")]
    DivisionByZero(SourceLocation),

    #[error("integer overflow at {0}")]
    Overflow(SourceLocation),

    #[error("variable '{name}' is not defined at {location}")]
    UndefinedVariable { name: String, location: SourceLocation },

    #[error("script '{0}' is not part of the program")]
    UnknownUnit(String),

    #[error("call depth exceeded {limit} at {location}")]
    CallDepthExceeded { limit: usize, location: SourceLocation },
}

/// A resumable, single-stepping virtual machine.
pub trait Machine: Send {
    /// Advance one step. Returns `true` when the machine must suspend:
    /// a breakpoint or stepping boundary was reached, or the program ended.
    fn step_once(&mut self) -> Result<bool, MachineFault>;

    fn is_program_end_reached(&self) -> bool;

    /// Variables of the top activation frame, `None` when there are no frames.
    fn top_frame_variables(&self) -> Option<VariableSnapshot>;

    /// Where the next step will execute, if anywhere.
    fn current_location(&self) -> Option<SourceLocation>;

    fn set_breakpoint(&mut self, file: &str, line: u32, enabled: bool);

    /// Rewind to the start of the program. Breakpoints are kept.
    fn reset(&mut self);

    fn set_stepping_mode(&mut self, enabled: bool);

    fn is_stepping_mode_enabled(&self) -> bool;

    /// Output produced since the last call.
    fn drain_output(&mut self) -> Vec<String> {
        Vec::new()
    }
}

pub trait MachineFactory: Send + Sync + 'static {
    fn create(&self, program: Arc<Program>) -> Box<dyn Machine>;
}

/// Creates [`ScriptMachine`]s with a fixed call depth limit.
#[derive(Debug, Clone)]
pub struct ScriptMachineFactory {
    max_call_depth: usize,
}

impl ScriptMachineFactory {
    pub fn new(max_call_depth: usize) -> Self {
        Self { max_call_depth }
    }
}

impl Default for ScriptMachineFactory {
    fn default() -> Self {
        Self::new(vm::DEFAULT_MAX_CALL_DEPTH)
    }
}

impl MachineFactory for ScriptMachineFactory {
    fn create(&self, program: Arc<Program>) -> Box<dyn Machine> {
        Box::new(ScriptMachine::new(program, self.max_call_depth))
    }
}
