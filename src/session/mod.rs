//! Session orchestration
//!
//! A [`Session`] owns the open buffers, both coordinators and the run state.
//! It turns "run" and "debug" requests into compilation tasks, starts the
//! machine once the matching compile result is published, and tracks the run
//! until the machine is torn down.
//!
//! ```text
//! Idle ──run──► Compiling ──result──► Executing ─────────────────► Idle
//!                   │                 Debugging ◄──step── Halt
//!                   │                     └──────pause─────►┘
//!                   └──failure / stop / buffers changed──► Idle
//! ```
//!
//! Coordinator notifications are delivered through channels and applied one
//! at a time by [`Session::pump`], so all state changes happen on the caller's
//! task.

pub mod notify;
pub mod workspace;


use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::compilation::{CompilationCoordinator, CompilationEvent};
use crate::compiler::{Compiler, ScriptCompiler};
use crate::config::SessionConfig;
use crate::execution::{ExecutionCoordinator, ExecutionError, ExecutionEvent};
use crate::machine::{MachineFactory, ScriptMachineFactory};
use crate::types::{CompilationTask, CompileOutcome, ExecutionState, RunMode, SourceLocation, VariableSnapshot};

pub use notify::{Notification, NotificationSink, TracingSink, UnsavedChangesChoice};
pub use workspace::{Buffer, CloseOutcome, Document, Workspace, WorkspaceError};

/* ===================== Errors ===================== */

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("a run is already in progress ({0})")]
    AlreadyRunning(ExecutionState),

    #[error("nothing to compile")]
    NothingToCompile,

    #[error("no main script selected")]
    NoMainScriptSelected,

    #[error("main script is empty")]
    MainScriptIsEmpty,

    #[error("main script '{0}' has no readable document")]
    MainScriptInvalidState(String),
}

impl RunError {
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, RunError::MainScriptInvalidState(_))
    }
}

/* ===================== Events ===================== */

/// What observers of a session see.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ExecutionState),
    Output(Vec<String>),
    VariablesChanged(VariableSnapshot),
    Paused(Option<SourceLocation>),
    Notified(Notification),
}

enum Incoming {
    Compilation(CompilationEvent),
    Execution(ExecutionEvent),
}

#[derive(Debug, Clone, Copy)]
struct PendingRun {
    revision: u64,
    mode: RunMode,
}

/* ===================== Session ===================== */

pub struct Session {
    id: Uuid,
    workspace: Workspace,
    compilation: CompilationCoordinator,
    execution: ExecutionCoordinator,
    compile_events: mpsc::UnboundedReceiver<CompilationEvent>,
    exec_events: mpsc::UnboundedReceiver<ExecutionEvent>,
    notifications: Arc<dyn NotificationSink>,
    state: ExecutionState,
    pending: Option<PendingRun>,
    observers: Vec<mpsc::UnboundedSender<SessionEvent>>,
}

impl Session {
    pub fn new(
        config: &SessionConfig,
        compiler: Arc<dyn Compiler>,
        machines: Arc<dyn MachineFactory>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        let (compilation, compile_events) = CompilationCoordinator::new(compiler, config.compile_timeout);
        let (execution, exec_events) = ExecutionCoordinator::new(machines, config.execution_timeout);
        let id = Uuid::new_v4();
        debug!(session = %id, ?config, "Session created");

        Self {
            id,
            workspace: Workspace::new(),
            compilation,
            execution,
            compile_events,
            exec_events,
            notifications,
            state: ExecutionState::Idle,
            pending: None,
            observers: Vec::new(),
        }
    }

    /// Script compiler, script machine, notifications to the log.
    pub fn with_defaults(config: &SessionConfig) -> Self {
        Self::new(
            config,
            Arc::new(ScriptCompiler::new()),
            Arc::new(ScriptMachineFactory::new(config.max_call_depth)),
            Arc::new(TracingSink),
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn compilation(&self) -> &CompilationCoordinator {
        &self.compilation
    }

    pub fn execution(&self) -> &ExecutionCoordinator {
        &self.execution
    }

    pub fn variables(&self) -> VariableSnapshot {
        self.execution.variables_state()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(tx);
        rx
    }

    /* ===================== Runs ===================== */

    /// Compile all buffers and run the main script. Returns the task revision.
    pub fn run_script(&mut self) -> Result<u64, RunError> {
        self.start_run(RunMode::Default)
    }

    /// Compile all buffers and debug the main script. Returns the task revision.
    pub fn run_script_in_debug_mode(&mut self) -> Result<u64, RunError> {
        self.start_run(RunMode::Debug)
    }

    /// Stop whatever is in progress.
    ///
    /// A compile is cancelled on the spot. A running or halted machine is
    /// stopped and the session reaches `Idle` once the stop is pumped.
    pub fn stop(&mut self) -> bool {
        match self.state {
            ExecutionState::Idle => false,
            ExecutionState::Compiling => {
                self.compilation.cancel();
                self.pending = None;
                info!(session = %self.id, "Run cancelled while compiling");
                self.set_state(ExecutionState::Idle);
                true
            }
            ExecutionState::Executing | ExecutionState::Debugging | ExecutionState::Halt => {
                self.execution.stop_execution()
            }
        }
    }

    pub fn step_next_breakpoint(&mut self) -> bool {
        self.step(false)
    }

    pub fn step_next_possible_breakpoint(&mut self) -> bool {
        self.step(true)
    }

    pub fn set_break_point_at(&self, file: &str, line: u32) -> bool {
        self.execution.set_break_point_at(file, line)
    }

    pub fn delete_break_point_at(&self, file: &str, line: u32) -> bool {
        self.execution.delete_break_point_at(file, line)
    }

    pub fn breakpoints_of(&self, file: &str) -> Vec<u32> {
        self.execution.breakpoints_of(file)
    }

    /* ===================== Buffers ===================== */

    pub fn open_buffer(&mut self, name: &str, text: impl Into<String>) -> Result<(), WorkspaceError> {
        self.workspace.open(name, text)?;
        self.buffers_changed();
        Ok(())
    }

    pub fn open_pending_buffer(&mut self, name: &str) -> Result<(), WorkspaceError> {
        self.workspace.open_pending(name)?;
        self.buffers_changed();
        Ok(())
    }

    /// Load or reload a buffer's text. New text raises the aggregate revision.
    pub fn attach_buffer(&mut self, name: &str, text: impl Into<String>) -> Result<u64, WorkspaceError> {
        self.workspace.attach(name, text)
    }

    /// Edits raise the aggregate revision and leave the compile cache alone.
    pub fn edit_buffer(&mut self, name: &str, text: impl Into<String>) -> Result<u64, WorkspaceError> {
        self.workspace.edit(name, text)
    }

    pub fn save_buffer(&mut self, name: &str) -> Result<(), WorkspaceError> {
        self.workspace.save(name)
    }

    pub fn set_main(&mut self, name: &str) -> Result<(), WorkspaceError> {
        self.workspace.set_main(name)?;
        self.buffers_changed();
        Ok(())
    }

    /// Close a buffer. A modified buffer asks for a decision first.
    pub fn close_buffer(&mut self, name: &str) -> Result<CloseOutcome, WorkspaceError> {
        let outcome = self.workspace.close(name)?;
        match outcome {
            CloseOutcome::Closed => self.buffers_changed(),
            CloseOutcome::NeedsDecision => self.notify(Notification::UnsavedChanges {
                buffer: name.to_string(),
            }),
            CloseOutcome::Kept => {}
        }
        Ok(outcome)
    }

    pub fn resolve_close(
        &mut self,
        name: &str,
        choice: UnsavedChangesChoice,
    ) -> Result<CloseOutcome, WorkspaceError> {
        let outcome = self.workspace.resolve_close(name, choice)?;
        if outcome == CloseOutcome::Closed {
            self.buffers_changed();
        }
        Ok(outcome)
    }

    /* ===================== Event pump ===================== */

    /// Wait for one coordinator notification and apply it.
    ///
    /// Returns `false` once both coordinators are gone.
    pub async fn pump(&mut self) -> bool {
        let incoming = tokio::select! {
            Some(event) = self.compile_events.recv() => Incoming::Compilation(event),
            Some(event) = self.exec_events.recv() => Incoming::Execution(event),
            else => return false,
        };

        match incoming {
            Incoming::Compilation(event) => self.on_compilation_event(event),
            Incoming::Execution(event) => self.on_execution_event(event),
        }
        true
    }

    /// Pump until the session is idle or halted at a breakpoint.
    pub async fn settle(&mut self) -> ExecutionState {
        loop {
            match self.state {
                ExecutionState::Idle => break,
                // A halted machine that was just stopped still owes its teardown event.
                ExecutionState::Halt if self.execution.is_suspended() => break,
                _ => {}
            }
            if !self.pump().await {
                break;
            }
        }
        self.state
    }

    /* ===================== Internals ===================== */

    fn start_run(&mut self, mode: RunMode) -> Result<u64, RunError> {
        if !self.state.is_idle() {
            debug!(session = %self.id, state = %self.state, "Run rejected");
            return Err(RunError::AlreadyRunning(self.state));
        }

        let task = match self.build_task() {
            Ok(task) => task,
            Err(err) => {
                self.report_run_error(&err);
                return Err(err);
            }
        };

        let revision = task.revision();
        info!(session = %self.id, revision, ?mode, main = task.main_name(), "Run started");
        self.pending = Some(PendingRun { revision, mode });
        self.set_state(ExecutionState::Compiling);
        self.compilation.compile(task);
        Ok(revision)
    }

    fn build_task(&self) -> Result<CompilationTask, RunError> {
        if self.workspace.is_empty() {
            return Err(RunError::NothingToCompile);
        }
        let main = self.workspace.main().ok_or(RunError::NoMainScriptSelected)?;
        let text = self
            .workspace
            .main_buffer()
            .and_then(Buffer::text)
            .ok_or_else(|| RunError::MainScriptInvalidState(main.to_string()))?;
        if text.is_empty() {
            return Err(RunError::MainScriptIsEmpty);
        }

        Ok(CompilationTask::new(
            self.workspace.revision(),
            self.workspace.sources(),
            main,
        ))
    }

    fn report_run_error(&mut self, err: &RunError) {
        let notification = match err {
            RunError::AlreadyRunning(_) => return,
            RunError::NothingToCompile => Notification::NothingToCompile,
            RunError::NoMainScriptSelected => Notification::NoMainScriptSelected,
            RunError::MainScriptIsEmpty => Notification::MainScriptIsEmpty,
            RunError::MainScriptInvalidState(_) => Notification::InternalError,
        };
        if err.is_invariant_violation() {
            error!(session = %self.id, error = %err, "Run aborted, session invariant violated");
        } else {
            info!(session = %self.id, error = %err, "Run aborted");
        }
        self.notify(notification);
    }

    fn step(&mut self, single_step: bool) -> bool {
        if self.state != ExecutionState::Halt {
            debug!(session = %self.id, state = %self.state, "Step ignored");
            return false;
        }
        let resumed = if single_step {
            self.execution.step_next_possible_breakpoint()
        } else {
            self.execution.step_next_breakpoint()
        };
        if resumed {
            self.set_state(ExecutionState::Debugging);
        }
        resumed
    }

    fn buffers_changed(&mut self) {
        self.compilation.reset();
        if self.state == ExecutionState::Compiling {
            info!(session = %self.id, "Run aborted, buffers changed while compiling");
            self.pending = None;
            self.set_state(ExecutionState::Idle);
        }
    }

    fn on_compilation_event(&mut self, event: CompilationEvent) {
        match event {
            CompilationEvent::RevisionAvailable(revision) => self.on_revision_available(revision),

            CompilationEvent::TimedOut { revision, after } => {
                let current = self
                    .pending
                    .filter(|p| p.revision == revision && self.state == ExecutionState::Compiling);
                if current.is_none() {
                    debug!(session = %self.id, revision, "Timeout of a superseded compile ignored");
                    return;
                }
                self.pending = None;
                self.notify(Notification::CompilationTimedOut(after));
                self.set_state(ExecutionState::Idle);
            }

            CompilationEvent::Reset => debug!(session = %self.id, "Compile cache reset"),
        }
    }

    fn on_revision_available(&mut self, revision: u64) {
        let Some(pending) = self.pending.filter(|_| self.state == ExecutionState::Compiling) else {
            debug!(session = %self.id, revision, "Revision available outside of a run");
            return;
        };
        if revision < pending.revision {
            debug!(session = %self.id, revision, wanted = pending.revision, "Stale revision ignored");
            return;
        }

        // An announcement queued before a cache reset can outrun the compile it
        // was superseded by. The real announcement is still on its way.
        let Some(result) = self.compilation.result().filter(|r| r.revision() >= pending.revision) else {
            debug!(session = %self.id, revision, wanted = pending.revision, "Announced revision no longer cached");
            return;
        };
        self.pending = None;

        match result.outcome() {
            CompileOutcome::Failed(diagnostics) => {
                info!(session = %self.id, revision, diagnostics = diagnostics.len(), "Compilation failed");
                self.notify(Notification::CompilationFailed(diagnostics.clone()));
                self.set_state(ExecutionState::Idle);
            }
            CompileOutcome::Succeeded(program) => match pending.mode {
                RunMode::Default => {
                    self.execution.execute(Arc::clone(program));
                    self.set_state(ExecutionState::Executing);
                }
                RunMode::Debug => {
                    self.execution.debug(Arc::clone(program));
                    self.set_state(ExecutionState::Debugging);
                }
            },
        }
    }

    fn on_execution_event(&mut self, event: ExecutionEvent) {
        match event {
            ExecutionEvent::Started(mode) => debug!(session = %self.id, ?mode, "Machine started"),
            ExecutionEvent::RunningChanged(running) => debug!(session = %self.id, running, "Running changed"),
            ExecutionEvent::DebuggingChanged(debugging) => {
                debug!(session = %self.id, debugging, "Debugging changed")
            }

            ExecutionEvent::VariablesChanged(variables) => {
                self.broadcast(SessionEvent::VariablesChanged(variables))
            }
            ExecutionEvent::Output(lines) => self.broadcast(SessionEvent::Output(lines)),

            ExecutionEvent::Paused(location) => {
                if self.state == ExecutionState::Debugging {
                    self.set_state(ExecutionState::Halt);
                }
                self.broadcast(SessionEvent::Paused(location));
            }

            ExecutionEvent::Completed | ExecutionEvent::Stopped => {
                self.set_state(ExecutionState::Idle);
            }

            ExecutionEvent::Failed(err) => {
                let notification = match &err {
                    ExecutionError::TimedOut(after) => Notification::ExecutionTimedOut(*after),
                    err if err.is_invariant_violation() => Notification::InternalError,
                    err => Notification::ExecutionFailed(err.to_string()),
                };
                warn!(session = %self.id, error = %err, "Run ended with an error");
                self.notify(notification);
                self.set_state(ExecutionState::Idle);
            }
        }
    }

    fn set_state(&mut self, state: ExecutionState) {
        if self.state != state {
            debug!(session = %self.id, from = %self.state, to = %state, "State changed");
            self.state = state;
            self.broadcast(SessionEvent::StateChanged(state));
        }
    }

    fn notify(&mut self, notification: Notification) {
        self.notifications.notify(notification.clone());
        self.broadcast(SessionEvent::Notified(notification));
    }

    fn broadcast(&mut self, event: SessionEvent) {
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
