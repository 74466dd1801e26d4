//! Compiler boundary
//!
//! The orchestration layer only knows the [`Compiler`] trait: a pure function
//! from named sources plus an entry name to either a program or diagnostics.
//! [`ScriptCompiler`] is the implementation shipped with the crate.

mod builder;
pub mod validate;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashSet};

use tokio_util::sync::CancellationToken;

use crate::program::{Op, Program};
use crate::types::{Diagnostic, DiagnosticKind};

pub use builder::{build_unit, MAX_EXPR_DEPTH};
pub use validate::{UnitRule, Validator};

pub type CompileOutput = Result<Program, Vec<Diagnostic>>;

/// Turns a set of named sources into a program.
///
/// Implementations are called from a blocking worker thread and must not
/// depend on any caller state. `cancel` fires when the result is no longer
/// wanted; long compiles should poll it and return early. Whatever they
/// return after that is discarded.
pub trait Compiler: Send + Sync + 'static {
    fn compile(
        &self,
        sources: &BTreeMap<String, String>,
        main_name: &str,
        cancel: &CancellationToken,
    ) -> CompileOutput;
}

/// Compiler for the line-oriented script language.
#[derive(Default)]
pub struct ScriptCompiler {
    validator: Validator,
}

impl ScriptCompiler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Compiler for ScriptCompiler {
    fn compile(
        &self,
        sources: &BTreeMap<String, String>,
        main_name: &str,
        cancel: &CancellationToken,
    ) -> CompileOutput {
        let mut diagnostics = Vec::new();
        let mut units = BTreeMap::new();

        if !sources.contains_key(main_name) {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::Link,
                main_name,
                0,
                "main script is not part of the compilation",
            ));
        }

        for (name, source) in sources {
            if cancel.is_cancelled() {
                return Err(vec![cancelled(main_name)]);
            }
            match build_unit(name, source) {
                Ok(unit) => {
                    diagnostics.extend(self.validator.validate(&unit));
                    units.insert(name.clone(), unit);
                }
                Err(diagnostic) => diagnostics.push(diagnostic),
            }
        }

        let known: HashSet<&str> = sources.keys().map(String::as_str).collect();
        for unit in units.values() {
            for instr in &unit.code {
                if let Op::Call { unit: target } = &instr.op {
                    if !known.contains(target.as_str()) {
                        diagnostics.push(Diagnostic::new(
                            DiagnosticKind::Link,
                            &unit.name,
                            instr.line,
                            format!("called script '{}' is not open", target),
                        ));
                    }
                }
            }
        }

        if diagnostics.is_empty() {
            Ok(Program::new(units, main_name))
        } else {
            Err(diagnostics)
        }
    }
}

fn cancelled(main_name: &str) -> Diagnostic {
    Diagnostic::new(DiagnosticKind::Internal, main_name, 0, "compilation cancelled")
}
