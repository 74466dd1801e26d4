//! User-facing notifications
//!
//! The session reports problems through a [`NotificationSink`]; how they are
//! shown is up to the sink.

use std::fmt;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::types::Diagnostic;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    NothingToCompile,
    NoMainScriptSelected,
    MainScriptIsEmpty,
    CompilationFailed(Vec<Diagnostic>),
    CompilationTimedOut(Duration),
    /// The script faulted while running.
    ExecutionFailed(String),
    ExecutionTimedOut(Duration),
    /// Something that should be impossible happened.
    InternalError,
    UnsavedChanges { buffer: String },
}

impl Notification {
    pub fn title(&self) -> &'static str {
        match self {
            Notification::NothingToCompile
            | Notification::NoMainScriptSelected
            | Notification::MainScriptIsEmpty => "Nothing to compile",
            Notification::CompilationFailed(_) | Notification::CompilationTimedOut(_) => {
                "Compilation failed"
            }
            Notification::ExecutionFailed(_) | Notification::ExecutionTimedOut(_) => "Execution failed",
            Notification::InternalError => "Internal error",
            Notification::UnsavedChanges { .. } => "Unsaved changes",
        }
    }

    pub fn text(&self) -> String {
        match self {
            Notification::NothingToCompile => {
                "The compilation process was triggered, but there are no open tabs.".to_string()
            }
            Notification::NoMainScriptSelected => {
                "The compilation process was triggered, but no main script was selected".to_string()
            }
            Notification::MainScriptIsEmpty => {
                "The compilation process was triggered, but the main script is empty.".to_string()
            }
            Notification::CompilationFailed(_) => {
                "The compilation process failed because of errors in the source.".to_string()
            }
            Notification::CompilationTimedOut(after) => {
                format!("The compilation process did not finish within {:?}.", after)
            }
            Notification::ExecutionFailed(reason) => format!("The execution failed: {}", reason),
            Notification::ExecutionTimedOut(after) => {
                format!("The execution did not finish within {:?} and was stopped.", after)
            }
            Notification::InternalError => "internal error, please restart".to_string(),
            Notification::UnsavedChanges { buffer } => {
                format!("The document {} has been modified", buffer)
            }
        }
    }

    pub fn informative_text(&self) -> &'static str {
        match self {
            Notification::NothingToCompile => "Please open a temporary tab or read in a source file.",
            Notification::NoMainScriptSelected => "Please select a main script",
            Notification::MainScriptIsEmpty => "Please input some code.",
            Notification::CompilationFailed(_) => "Please check your input carefully.",
            Notification::CompilationTimedOut(_) | Notification::ExecutionTimedOut(_) => {
                "Raise the configured timeout if this is expected."
            }
            Notification::ExecutionFailed(_) => "Please check your input carefully.",
            Notification::InternalError => {
                "Try to restart the IDE. If the issue persists, please inform the developers."
            }
            Notification::UnsavedChanges { .. } => "Do you want to save your changes?",
        }
    }

    /// One `[kind] in 'file', line N 'message'` line per diagnostic.
    pub fn detailed_text(&self) -> Option<String> {
        match self {
            Notification::CompilationFailed(diagnostics) => Some(
                diagnostics
                    .iter()
                    .map(|d| format!("{}\n", d))
                    .collect(),
            ),
            _ => None,
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.title(), self.text())?;
        if let Some(detail) = self.detailed_text() {
            write!(f, "\n{}", detail.trim_end())?;
        }
        Ok(())
    }
}

/// Answers to an [`Notification::UnsavedChanges`] prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsavedChangesChoice {
    Save,
    Discard,
    Cancel,
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notification: Notification) {
        match &notification {
            Notification::InternalError => error!(title = notification.title(), "{}", notification),
            Notification::UnsavedChanges { .. } => info!(title = notification.title(), "{}", notification),
            _ => warn!(title = notification.title(), "{}", notification),
        }
    }
}
