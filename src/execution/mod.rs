//! Execution coordinator
//!
//! Owns the single virtual machine of a session and the background loop that
//! steps it. Everything that touches the machine (breakpoints, step commands,
//! stop) goes through [`ExecutionCoordinator`].
//!
//! ## Lifecycle
//!
//! ```text
//! execute/debug ──► running ──► suspended (debug only) ──► step ──► running
//!                      │                 │
//!                      └──── program end, stop, failure ──► torn down
//! ```
//!
//! Each started loop gets its own run id and cancellation token. A loop that
//! finishes after it was superseded is ignored, and a loop that observed its
//! token never produces a snapshot or a completion.

mod breakpoints;
pub mod exec_loop;


use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::machine::{MachineFactory, MachineFault};
use crate::program::Program;
use crate::types::{RunMode, SourceLocation, VariableSnapshot};

pub use breakpoints::BreakpointSet;
use exec_loop::{drive, lock_machine, LoopOutcome, SharedMachine};

/* ===================== Errors ===================== */

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("virtual machine is null")]
    VirtualMachineIsNull,

    #[error("activations are empty")]
    ActivationsAreEmpty,

    #[error(transparent)]
    Machine(#[from] MachineFault),

    #[error("execution loop panicked: {0}")]
    Panicked(String),

    #[error("execution timed out after {0:?}")]
    TimedOut(Duration),
}

impl ExecutionError {
    /// Errors that point at a bug in the orchestration or the machine
    /// rather than in the script being run.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            ExecutionError::VirtualMachineIsNull
                | ExecutionError::ActivationsAreEmpty
                | ExecutionError::Panicked(_)
        )
    }
}

/* ===================== Events ===================== */

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    Started(RunMode),
    RunningChanged(bool),
    DebuggingChanged(bool),
    /// The top-frame snapshot was replaced with a different one.
    VariablesChanged(VariableSnapshot),
    Output(Vec<String>),
    /// A debug run suspended before the given statement.
    Paused(Option<SourceLocation>),
    Completed,
    Stopped,
    Failed(ExecutionError),
}

/* ===================== Coordinator ===================== */

struct ActiveRun {
    id: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct ExecState {
    machine: Option<SharedMachine>,
    debugging: bool,
    breakpoints: BreakpointSet,
    variables: VariableSnapshot,
    run: Option<ActiveRun>,
    next_run_id: u64,
}

struct Inner {
    factory: Arc<dyn MachineFactory>,
    timeout: Option<Duration>,
    events: mpsc::UnboundedSender<ExecutionEvent>,
    state: Mutex<ExecState>,
}

/// Cheap to clone; all clones drive the same machine.
///
/// Methods that start a loop spawn onto the current tokio runtime and must be
/// called from within one.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    inner: Arc<Inner>,
}

impl ExecutionCoordinator {
    /// `timeout` bounds every uninterrupted stretch of execution.
    pub fn new(
        factory: Arc<dyn MachineFactory>,
        timeout: Option<Duration>,
    ) -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            factory,
            timeout,
            events,
            state: Mutex::new(ExecState::default()),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Run `program` to completion, ignoring breakpoints.
    pub fn execute(&self, program: Arc<Program>) {
        self.start(program, RunMode::Default);
    }

    /// Run `program` with the current breakpoints applied.
    pub fn debug(&self, program: Arc<Program>) {
        self.start(program, RunMode::Debug);
    }

    /// Rewind the live machine and run it again without breakpoints.
    pub fn restart(&self) -> bool {
        self.rerun(RunMode::Default)
    }

    /// Rewind the live machine and run it again in debug mode.
    pub fn restart_debug(&self) -> bool {
        self.rerun(RunMode::Debug)
    }

    /// Stop the current run. Returns `false` when nothing was running.
    ///
    /// An in-flight loop is cancelled and torn down once it notices; a
    /// suspended machine is torn down immediately.
    pub fn stop_execution(&self) -> bool {
        let mut state = self.lock();

        if let Some(run) = &state.run {
            debug!(run = run.id, "Cancelling execution loop");
            run.token.cancel();
            return true;
        }

        if self.teardown(&mut state) {
            info!("Suspended execution stopped");
            self.emit(ExecutionEvent::Stopped);
            return true;
        }

        false
    }

    /// Continue a suspended machine until the next breakpoint or program end.
    pub fn step_next_breakpoint(&self) -> bool {
        self.resume(false)
    }

    /// Continue a suspended machine by exactly one statement.
    pub fn step_next_possible_breakpoint(&self) -> bool {
        self.resume(true)
    }

    /// Returns `false` when the breakpoint was already set.
    pub fn set_break_point_at(&self, file: &str, line: u32) -> bool {
        let mut state = self.lock();
        let inserted = state.breakpoints.insert(file, line);

        if state.debugging {
            if let Some(machine) = &state.machine {
                lock_machine(machine).set_breakpoint(file, line, true);
            }
        }

        debug!(file, line, inserted, "Breakpoint set");
        inserted
    }

    /// Returns `false` when there was no such breakpoint.
    pub fn delete_break_point_at(&self, file: &str, line: u32) -> bool {
        let mut state = self.lock();
        let removed = state.breakpoints.remove(file, line);

        if removed && state.debugging {
            if let Some(machine) = &state.machine {
                lock_machine(machine).set_breakpoint(file, line, false);
            }
        }

        debug!(file, line, removed, "Breakpoint deleted");
        removed
    }

    pub fn breakpoints(&self) -> BreakpointSet {
        self.lock().breakpoints.clone()
    }

    pub fn breakpoints_of(&self, file: &str) -> Vec<u32> {
        self.lock().breakpoints.lines_of(file)
    }

    pub fn variables_state(&self) -> VariableSnapshot {
        self.lock().variables.clone()
    }

    /// True from start until teardown, including while suspended.
    pub fn is_running(&self) -> bool {
        self.lock().machine.is_some()
    }

    pub fn is_debugging(&self) -> bool {
        self.lock().debugging
    }

    /// True when a live machine is waiting for a step command.
    pub fn is_suspended(&self) -> bool {
        let state = self.lock();
        state.machine.is_some() && state.run.is_none()
    }

    /* ===================== Internals ===================== */

    fn lock(&self) -> MutexGuard<'_, ExecState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ExecutionEvent) {
        if self.inner.events.send(event).is_err() {
            debug!("Execution event dropped, receiver closed");
        }
    }

    fn start(&self, program: Arc<Program>, mode: RunMode) {
        let mut state = self.lock();

        if self.teardown(&mut state) {
            warn!("Replacing a running machine");
            self.emit(ExecutionEvent::Stopped);
        }

        let mut machine = self.inner.factory.create(program);
        let debugging = mode == RunMode::Debug;
        if debugging {
            state.breakpoints.apply_to(machine.as_mut(), true);
        }
        state.machine = Some(Arc::new(Mutex::new(machine)));

        info!(?mode, breakpoints = state.breakpoints.len(), "Execution started");
        self.replace_variables(&mut state, VariableSnapshot::new());
        self.set_debugging(&mut state, debugging);
        self.emit(ExecutionEvent::Started(mode));
        self.emit(ExecutionEvent::RunningChanged(true));
        self.spawn_loop(&mut state);
    }

    fn rerun(&self, mode: RunMode) -> bool {
        let mut state = self.lock();
        let Some(machine) = state.machine.clone() else {
            return false;
        };

        if let Some(run) = state.run.take() {
            run.token.cancel();
        }

        let debugging = mode == RunMode::Debug;
        {
            let mut guard = lock_machine(&machine);
            guard.reset();
            // A machine restarted out of debug mode still carries the set.
            state.breakpoints.apply_to(guard.as_mut(), debugging);
        }

        info!(?mode, "Execution restarted");
        self.replace_variables(&mut state, VariableSnapshot::new());
        self.set_debugging(&mut state, debugging);
        self.emit(ExecutionEvent::Started(mode));
        self.spawn_loop(&mut state);
        true
    }

    fn resume(&self, single_step: bool) -> bool {
        let mut state = self.lock();
        if state.run.is_some() {
            debug!("Step ignored, machine is running");
            return false;
        }
        let Some(machine) = &state.machine else {
            debug!("Step ignored, no machine");
            return false;
        };

        lock_machine(machine).set_stepping_mode(single_step);
        debug!(single_step, "Resuming execution");
        self.spawn_loop(&mut state);
        true
    }

    fn spawn_loop(&self, state: &mut ExecState) {
        state.next_run_id += 1;
        let id = state.next_run_id;
        let token = CancellationToken::new();
        state.run = Some(ActiveRun {
            id,
            token: token.clone(),
        });

        let machine = state.machine.clone();
        let this = self.clone();
        tokio::spawn(async move { this.supervise(id, machine, token).await });
    }

    async fn supervise(&self, id: u64, machine: Option<SharedMachine>, token: CancellationToken) {
        let events = self.inner.events.clone();
        let loop_token = token.clone();
        let mut handle = tokio::task::spawn_blocking(move || {
            drive(machine.as_ref(), &loop_token, |lines| {
                let _ = events.send(ExecutionEvent::Output(lines));
            })
        });

        let result = match self.inner.timeout {
            None => flatten(handle.await),
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => flatten(joined),
                Err(_) => {
                    warn!(run = id, ?limit, "Execution timed out");
                    token.cancel();
                    let _ = handle.await;
                    Err(ExecutionError::TimedOut(limit))
                }
            },
        };

        self.finish_run(id, &token, result);
    }

    fn finish_run(&self, id: u64, token: &CancellationToken, result: Result<LoopOutcome, ExecutionError>) {
        let mut state = self.lock();
        if state.run.as_ref().map(|run| run.id) != Some(id) {
            debug!(run = id, "Superseded execution loop finished");
            return;
        }
        state.run = None;

        match result {
            Err(err @ ExecutionError::TimedOut(_)) => {
                self.teardown(&mut state);
                self.emit(ExecutionEvent::Failed(err));
            }

            _ if token.is_cancelled() => {
                info!(run = id, "Execution stopped");
                self.teardown(&mut state);
                self.emit(ExecutionEvent::Stopped);
            }

            Ok(LoopOutcome::Cancelled) => {
                self.teardown(&mut state);
                self.emit(ExecutionEvent::Stopped);
            }

            Err(err) => {
                if err.is_invariant_violation() {
                    error!(run = id, error = %err, "Execution failed for an internal reason");
                } else {
                    info!(run = id, error = %err, "Execution failed");
                }
                self.teardown(&mut state);
                self.emit(ExecutionEvent::Failed(err));
            }

            Ok(LoopOutcome::Suspended(suspension)) => {
                self.replace_variables(&mut state, suspension.variables);
                if let Some(machine) = &state.machine {
                    lock_machine(machine).set_stepping_mode(false);
                }

                if suspension.program_end {
                    info!(run = id, "Execution completed");
                    self.teardown(&mut state);
                    self.emit(ExecutionEvent::Completed);
                } else {
                    debug!(run = id, location = ?suspension.location, "Execution suspended");
                    self.emit(ExecutionEvent::Paused(suspension.location));
                }
            }
        }
    }

    /// Drop the machine. Returns `false` when there was none.
    fn teardown(&self, state: &mut ExecState) -> bool {
        if let Some(run) = state.run.take() {
            run.token.cancel();
        }
        if state.machine.take().is_none() {
            return false;
        }
        self.emit(ExecutionEvent::RunningChanged(false));
        self.set_debugging(state, false);
        true
    }

    fn replace_variables(&self, state: &mut ExecState, variables: VariableSnapshot) {
        if state.variables != variables {
            state.variables = variables.clone();
            self.emit(ExecutionEvent::VariablesChanged(variables));
        }
    }

    fn set_debugging(&self, state: &mut ExecState, debugging: bool) {
        if state.debugging != debugging {
            state.debugging = debugging;
            self.emit(ExecutionEvent::DebuggingChanged(debugging));
        }
    }
}

fn flatten(
    joined: Result<Result<LoopOutcome, ExecutionError>, JoinError>,
) -> Result<LoopOutcome, ExecutionError> {
    match joined {
        Ok(result) => result,
        Err(err) if err.is_panic() => {
            let payload = err.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ExecutionError::Panicked(message))
        }
        Err(err) => Err(ExecutionError::Panicked(err.to_string())),
    }
}
