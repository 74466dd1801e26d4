//! Stepping loop
//!
//! [`drive`] runs on a blocking worker thread. It advances the machine one
//! step at a time until the machine asks to suspend or the run is cancelled.
//! The machine lock is taken per step, so breakpoint changes from the
//! coordinator land between two steps.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use super::ExecutionError;
use crate::machine::Machine;
use crate::types::{SourceLocation, VariableSnapshot};

pub type SharedMachine = Arc<Mutex<Box<dyn Machine>>>;

/// Steps between two flushes of buffered program output.
const OUTPUT_FLUSH_INTERVAL: u64 = 1024;

/// State captured when the machine suspended on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct Suspension {
    pub variables: VariableSnapshot,
    pub program_end: bool,
    pub location: Option<SourceLocation>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutcome {
    Suspended(Suspension),
    Cancelled,
}

pub(crate) fn lock_machine(machine: &SharedMachine) -> MutexGuard<'_, Box<dyn Machine>> {
    machine.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run `machine` until it suspends or `token` is cancelled.
///
/// Program output is handed to `emit` periodically and once more on
/// suspension. Nothing is emitted after cancellation is observed.
pub fn drive(
    machine: Option<&SharedMachine>,
    token: &CancellationToken,
    mut emit: impl FnMut(Vec<String>),
) -> Result<LoopOutcome, ExecutionError> {
    let machine = machine.ok_or(ExecutionError::VirtualMachineIsNull)?;
    let mut steps: u64 = 0;

    loop {
        let mut guard = lock_machine(machine);
        // Checked under the lock so a restart that cancels and then rewinds
        // the machine can never be followed by a stale step.
        if token.is_cancelled() {
            return Ok(LoopOutcome::Cancelled);
        }

        if guard.step_once()? {
            let output = guard.drain_output();
            if !output.is_empty() {
                emit(output);
            }
            let variables = guard
                .top_frame_variables()
                .ok_or(ExecutionError::ActivationsAreEmpty)?;
            return Ok(LoopOutcome::Suspended(Suspension {
                variables,
                program_end: guard.is_program_end_reached(),
                location: guard.current_location(),
            }));
        }

        steps += 1;
        if steps % OUTPUT_FLUSH_INTERVAL == 0 {
            let output = guard.drain_output();
            if !output.is_empty() {
                emit(output);
            }
        }
    }
}
