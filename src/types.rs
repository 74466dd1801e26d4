use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::program::Program;

/* ===================== Compilation ===================== */

/// A compile request: every attached buffer keyed by name plus the entry buffer.
///
/// The revision is assigned by the caller and must not decrease between requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationTask {
    revision: u64,
    content: BTreeMap<String, String>,
    main_name: String,
}

impl CompilationTask {
    pub fn new(revision: u64, content: BTreeMap<String, String>, main_name: impl Into<String>) -> Self {
        Self {
            revision,
            content,
            main_name: main_name.into(),
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn content(&self) -> &BTreeMap<String, String> {
        &self.content
    }

    pub fn main_name(&self) -> &str {
        &self.main_name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticKind {
    Syntax,
    Semantic,
    Link,
    Internal,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiagnosticKind::Syntax => "syntax",
            DiagnosticKind::Semantic => "semantic",
            DiagnosticKind::Link => "link",
            DiagnosticKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// One compiler complaint. Lines are 1-based; 0 means "whole file".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub file: String,
    pub line: u32,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, file: impl Into<String>, line: u32, message: impl Into<String>) -> Self {
        Self {
            kind,
            file: file.into(),
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] in '{}', line {} '{}'",
            self.kind, self.file, self.line, self.message
        )
    }
}

/// What a compile produced. The program exists only on success and the
/// diagnostics only on failure.
#[derive(Debug, Clone)]
pub enum CompileOutcome {
    Succeeded(Arc<Program>),
    Failed(Vec<Diagnostic>),
}

/// The published outcome of one compile, tagged with the revision it was built from.
#[derive(Debug, Clone)]
pub struct CompilationResult {
    revision: u64,
    outcome: CompileOutcome,
}

impl CompilationResult {
    pub fn new(revision: u64, outcome: CompileOutcome) -> Self {
        Self { revision, outcome }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, CompileOutcome::Succeeded(_))
    }

    pub fn program(&self) -> Option<&Arc<Program>> {
        match &self.outcome {
            CompileOutcome::Succeeded(program) => Some(program),
            CompileOutcome::Failed(_) => None,
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        match &self.outcome {
            CompileOutcome::Succeeded(_) => &[],
            CompileOutcome::Failed(diagnostics) => diagnostics,
        }
    }

    pub fn outcome(&self) -> &CompileOutcome {
        &self.outcome
    }
}

/* ===================== Execution ===================== */

/// Variables of the top activation frame, name to value.
pub type VariableSnapshot = BTreeMap<String, i64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Default,
    Debug,
}

/// Session run state. `Halt` means a debug run is suspended and waiting for a step command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    #[default]
    Idle,
    Compiling,
    Executing,
    Debugging,
    Halt,
}

impl ExecutionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, ExecutionState::Idle)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionState::Idle => "idle",
            ExecutionState::Compiling => "compiling",
            ExecutionState::Executing => "executing",
            ExecutionState::Debugging => "debugging",
            ExecutionState::Halt => "halt",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}
