//! Compilation coordinator
//!
//! Runs the compiler off the calling thread and caches the newest result.
//!
//! Revisions only move forward: a request at or below the cached revision is
//! answered from the cache, a new request cancels the one in flight, and a
//! finished compile is dropped if anything at or above its revision was
//! published meanwhile.


use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::compiler::{CompileOutput, Compiler};
use crate::types::{CompilationResult, CompilationTask, CompileOutcome, Diagnostic, DiagnosticKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompilationEvent {
    /// A result with at least this revision can be read from the cache.
    RevisionAvailable(u64),
    /// The compile of `revision` was abandoned after `after`.
    TimedOut { revision: u64, after: Duration },
    /// The cache was cleared.
    Reset,
}

/// How a compile request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileDispatch {
    Scheduled,
    CacheHit,
}

struct InFlight {
    revision: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct CacheState {
    result: Option<Arc<CompilationResult>>,
    last_successful: Option<Arc<CompilationResult>>,
    in_flight: Option<InFlight>,
}

struct Inner {
    compiler: Arc<dyn Compiler>,
    timeout: Option<Duration>,
    events: mpsc::UnboundedSender<CompilationEvent>,
    state: Mutex<CacheState>,
}

#[derive(Clone)]
pub struct CompilationCoordinator {
    inner: Arc<Inner>,
}

impl CompilationCoordinator {
    pub fn new(
        compiler: Arc<dyn Compiler>,
        timeout: Option<Duration>,
    ) -> (Self, mpsc::UnboundedReceiver<CompilationEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            compiler,
            timeout,
            events,
            state: Mutex::new(CacheState::default()),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Request a result for `task`.
    ///
    /// Must be called from within a tokio runtime when the request is not a
    /// cache hit.
    pub fn compile(&self, task: CompilationTask) -> CompileDispatch {
        let revision = task.revision();
        let mut state = self.lock();

        if let Some(cached) = &state.result {
            if cached.revision() >= revision {
                debug!(revision, cached = cached.revision(), "Compile cache hit");
                self.emit(CompilationEvent::RevisionAvailable(revision));
                return CompileDispatch::CacheHit;
            }
        }

        if let Some(previous) = state.in_flight.take() {
            debug!(revision = previous.revision, "Cancelling superseded compile");
            previous.token.cancel();
        }

        let token = CancellationToken::new();
        state.in_flight = Some(InFlight {
            revision,
            token: token.clone(),
        });
        drop(state);

        info!(revision, main = task.main_name(), buffers = task.content().len(), "Compile scheduled");
        let this = self.clone();
        tokio::spawn(async move { this.run(task, token).await });
        CompileDispatch::Scheduled
    }

    /// Cancel the in-flight compile and clear every cached result.
    pub fn reset(&self) {
        let mut state = self.lock();
        if let Some(in_flight) = state.in_flight.take() {
            in_flight.token.cancel();
        }
        state.result = None;
        state.last_successful = None;
        drop(state);

        debug!("Compile cache reset");
        self.emit(CompilationEvent::Reset);
    }

    /// Cancel the in-flight compile, keeping the cache.
    pub fn cancel(&self) -> bool {
        match self.lock().in_flight.take() {
            Some(in_flight) => {
                debug!(revision = in_flight.revision, "Compile cancelled");
                in_flight.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn result(&self) -> Option<Arc<CompilationResult>> {
        self.lock().result.clone()
    }

    pub fn last_successful_result(&self) -> Option<Arc<CompilationResult>> {
        self.lock().last_successful.clone()
    }

    pub fn is_compiling(&self) -> bool {
        self.lock().in_flight.is_some()
    }

    /* ===================== Internals ===================== */

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: CompilationEvent) {
        if self.inner.events.send(event).is_err() {
            debug!("Compilation event dropped, receiver closed");
        }
    }

    async fn run(&self, task: CompilationTask, token: CancellationToken) {
        let revision = task.revision();
        let compiler = Arc::clone(&self.inner.compiler);
        let main_name = task.main_name().to_string();
        let content: BTreeMap<String, String> = task.content().clone();
        let cancel = token.clone();
        let worker =
            tokio::task::spawn_blocking(move || compiler.compile(&content, &main_name, &cancel));

        let compiled = async {
            match self.inner.timeout {
                None => Ok(worker.await),
                Some(limit) => tokio::time::timeout(limit, worker).await.map_err(|_| limit),
            }
        };

        let joined = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(revision, "Compile abandoned after cancellation");
                return;
            }
            joined = compiled => joined,
        };

        let output = match joined {
            Ok(Ok(output)) => output,
            Ok(Err(join_err)) => {
                error!(revision, error = %join_err, "Compiler task failed");
                Err(vec![Diagnostic::new(
                    DiagnosticKind::Internal,
                    task.main_name(),
                    0,
                    format!("compiler crashed: {}", join_err),
                )])
            }
            Err(limit) => {
                self.time_out(revision, &token, limit);
                return;
            }
        };

        self.publish(revision, &token, output);
    }

    fn time_out(&self, revision: u64, token: &CancellationToken, after: Duration) {
        let mut state = self.lock();
        if token.is_cancelled() {
            return;
        }
        token.cancel();
        if state.in_flight.as_ref().is_some_and(|f| f.revision == revision) {
            state.in_flight = None;
        }
        drop(state);

        warn!(revision, ?after, "Compile timed out");
        self.emit(CompilationEvent::TimedOut { revision, after });
    }

    /// Store a finished compile unless it was cancelled or superseded.
    fn publish(&self, revision: u64, token: &CancellationToken, output: CompileOutput) -> bool {
        let mut state = self.lock();

        if token.is_cancelled() {
            debug!(revision, "Compile finished after cancellation, dropped");
            return false;
        }
        if state.in_flight.as_ref().is_some_and(|f| f.revision == revision) {
            state.in_flight = None;
        }
        if let Some(current) = &state.result {
            if current.revision() >= revision {
                debug!(revision, current = current.revision(), "Stale compile result dropped");
                return false;
            }
        }

        let outcome = match output {
            Ok(program) => CompileOutcome::Succeeded(Arc::new(program)),
            Err(diagnostics) => CompileOutcome::Failed(diagnostics),
        };
        let result = Arc::new(CompilationResult::new(revision, outcome));
        if result.succeeded() {
            state.last_successful = Some(Arc::clone(&result));
        }
        info!(
            revision,
            succeeded = result.succeeded(),
            diagnostics = result.diagnostics().len(),
            "Compile result published"
        );
        state.result = Some(result);
        drop(state);

        self.emit(CompilationEvent::RevisionAvailable(revision));
        true
    }
}
