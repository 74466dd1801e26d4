//! Shared fixtures for the coordinator tests.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::compiler::{CompileOutput, Compiler, ScriptCompiler};
use crate::machine::{Machine, MachineFactory, MachineFault};
use crate::program::Program;
use crate::session::{Notification, NotificationSink};
use crate::types::{Diagnostic, DiagnosticKind, SourceLocation, VariableSnapshot};

pub(crate) const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/* ===================== Programs ===================== */

pub(crate) fn compile_program(entries: &[(&str, &str)], main: &str) -> Arc<Program> {
    let sources: BTreeMap<String, String> = entries
        .iter()
        .map(|(name, text)| (name.to_string(), text.to_string()))
        .collect();
    Arc::new(
        ScriptCompiler::new()
            .compile(&sources, main, &CancellationToken::new())
            .expect("fixture program should compile"),
    )
}

/* ===================== Compilers ===================== */

/// A compiler driven by its input instead of by real parsing.
///
/// A buffer named `delay` holds a sleep in milliseconds, cut short when the
/// compile is cancelled. A buffer named `fail` makes the compile fail with
/// one diagnostic. A buffer named `panic` makes it panic. Calls and
/// abandoned sleeps are counted.
#[derive(Default)]
pub(crate) struct ScriptedCompiler {
    calls: AtomicUsize,
    abandoned: AtomicUsize,
}

impl ScriptedCompiler {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }
}

impl Compiler for ScriptedCompiler {
    fn compile(
        &self,
        sources: &BTreeMap<String, String>,
        main_name: &str,
        cancel: &CancellationToken,
    ) -> CompileOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(ms) = sources.get("delay").and_then(|text| text.trim().parse::<u64>().ok()) {
            let deadline = std::time::Instant::now() + Duration::from_millis(ms);
            while std::time::Instant::now() < deadline {
                if cancel.is_cancelled() {
                    self.abandoned.fetch_add(1, Ordering::SeqCst);
                    return Err(Vec::new());
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        }
        if sources.contains_key("panic") {
            panic!("scripted compiler panic");
        }
        if sources.contains_key("fail") {
            return Err(vec![Diagnostic::new(
                DiagnosticKind::Syntax,
                "fail",
                1,
                "scripted failure",
            )]);
        }
        Ok(Program::new(BTreeMap::new(), main_name))
    }
}

/// Wraps the script compiler and sleeps before every compile, ignoring
/// cancellation while asleep.
pub(crate) struct SlowCompiler {
    pub(crate) delay: Duration,
}

impl Compiler for SlowCompiler {
    fn compile(
        &self,
        sources: &BTreeMap<String, String>,
        main_name: &str,
        cancel: &CancellationToken,
    ) -> CompileOutput {
        std::thread::sleep(self.delay);
        ScriptCompiler::new().compile(sources, main_name, cancel)
    }
}

/* ===================== Machines ===================== */

/// Suspends on the first step but has no activation frames.
pub(crate) struct FramelessMachine;

impl Machine for FramelessMachine {
    fn step_once(&mut self) -> Result<bool, MachineFault> {
        Ok(true)
    }

    fn is_program_end_reached(&self) -> bool {
        false
    }

    fn top_frame_variables(&self) -> Option<VariableSnapshot> {
        None
    }

    fn current_location(&self) -> Option<SourceLocation> {
        None
    }

    fn set_breakpoint(&mut self, _file: &str, _line: u32, _enabled: bool) {}

    fn reset(&mut self) {}

    fn set_stepping_mode(&mut self, _enabled: bool) {}

    fn is_stepping_mode_enabled(&self) -> bool {
        false
    }
}

pub(crate) struct FramelessFactory;

impl MachineFactory for FramelessFactory {
    fn create(&self, _program: Arc<Program>) -> Box<dyn Machine> {
        Box::new(FramelessMachine)
    }
}

/// Panics on the first step.
pub(crate) struct PanickingFactory;

struct PanickingMachine;

impl Machine for PanickingMachine {
    fn step_once(&mut self) -> Result<bool, MachineFault> {
        panic!("machine exploded");
    }

    fn is_program_end_reached(&self) -> bool {
        false
    }

    fn top_frame_variables(&self) -> Option<VariableSnapshot> {
        None
    }

    fn current_location(&self) -> Option<SourceLocation> {
        None
    }

    fn set_breakpoint(&mut self, _file: &str, _line: u32, _enabled: bool) {}

    fn reset(&mut self) {}

    fn set_stepping_mode(&mut self, _enabled: bool) {}

    fn is_stepping_mode_enabled(&self) -> bool {
        false
    }
}

impl MachineFactory for PanickingFactory {
    fn create(&self, _program: Arc<Program>) -> Box<dyn Machine> {
        Box::new(PanickingMachine)
    }
}

/* ===================== Notifications ===================== */

#[derive(Default)]
pub(crate) struct RecordingSink {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub(crate) fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: Notification) {
        self.seen.lock().unwrap().push(notification);
    }
}

/* ===================== Channels ===================== */

/// Await `future`, failing the test if it takes longer than [`EVENT_TIMEOUT`].
pub(crate) async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(EVENT_TIMEOUT, future)
        .await
        .expect("timed out waiting")
}

/// Poll `done` until it holds, failing the test after [`EVENT_TIMEOUT`].
pub(crate) async fn eventually(mut done: impl FnMut() -> bool) {
    within(async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

pub(crate) async fn next_event<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    within(rx.recv()).await.expect("event channel closed")
}

/// Collect events up to and including the first one matching `last`.
pub(crate) async fn events_until<T>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    last: impl Fn(&T) -> bool,
) -> Vec<T> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = last(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Assert that nothing arrives within `window`.
pub(crate) async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>, window: Duration) {
    if let Ok(Some(event)) = tokio::time::timeout(window, rx.recv()).await {
        panic!("unexpected event: {:?}", event);
    }
}
